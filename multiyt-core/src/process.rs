use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;

use crate::error::ProcessError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Command that never pops a console window on Windows. Used for probes and
/// version checks where group semantics are not needed.
pub fn quiet_command(program: &Path) -> Command {
    #[allow(unused_mut)]
    let mut command = Command::new(program);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);
    command
}

/// Command whose child leads its own process group, so interrupts and kills
/// reach every descendant of the tool. Omitting the group attribute leaves
/// zombie children behind after cancellation.
pub fn group_command(program: &Path) -> Command {
    #[cfg(unix)]
    {
        let mut command = Command::new(program);
        // SAFETY: setsid is async-signal-safe and runs between fork and exec.
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        command
    }
    #[cfg(windows)]
    {
        let mut command = Command::new(program);
        command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        command
    }
}

#[derive(Debug)]
pub struct RunOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a command to completion, capturing both streams with UTF-8
/// replacement. The child is killed if the timeout elapses.
pub async fn run_with_timeout(
    mut command: Command,
    limit: Duration,
) -> Result<RunOutput, ProcessError> {
    let program = program_name(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match timeout(limit, command.output()).await {
        Err(_) => Err(ProcessError::Timeout(limit)),
        Ok(Err(source)) => Err(ProcessError::Spawn { program, source }),
        Ok(Ok(output)) => Ok(RunOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
    }
}

/// Line reader that substitutes U+FFFD for invalid UTF-8 instead of erroring;
/// the acquisition tool occasionally prints raw filesystem bytes.
pub struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        let mut line = String::from_utf8_lossy(&self.buf).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// A spawned group-leading child with line-oriented access to both streams.
pub struct StreamingChild {
    child: Child,
    pub pid: u32,
    stdout: Option<LossyLines<ChildStdout>>,
    stderr: Option<LossyLines<ChildStderr>>,
}

impl StreamingChild {
    pub fn spawn(mut command: Command) -> Result<StreamingChild, ProcessError> {
        let program = program_name(&command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn { program, source })?;
        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take().map(LossyLines::new);
        let stderr = child.stderr.take().map(LossyLines::new);
        Ok(StreamingChild {
            child,
            pid,
            stdout,
            stderr,
        })
    }

    pub fn take_stdout(&mut self) -> Option<LossyLines<ChildStdout>> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<LossyLines<ChildStderr>> {
        self.stderr.take()
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, ProcessError> {
        self.child
            .wait()
            .await
            .map_err(|source| ProcessError::Io { source })
    }
}

/// Group-level interrupt: SIGINT to the POSIX process group, CTRL_BREAK to
/// the Windows group. Valid because children are spawned via
/// [`group_command`].
pub fn interrupt_group(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGINT) };
        if result == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(windows)]
    {
        use windows::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
        unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) }
            .map_err(|error| std::io::Error::other(error.to_string()))
    }
}

/// Forced group termination: SIGTERM to the POSIX group, `taskkill /F /T` on
/// Windows.
pub async fn kill_group(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
        if result == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(windows)]
    {
        let mut command = quiet_command(Path::new("taskkill"));
        command
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = command
            .status()
            .await
            .map_err(|error| std::io::Error::other(error.to_string()))?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "taskkill exited with {status}"
            )));
        }
        Ok(())
    }
}

fn program_name(command: &Command) -> String {
    command.as_std().get_program().to_string_lossy().into_owned()
}
