use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{InstallError, ProcessError};
use crate::fetch::{FetchPhase, FetchProgress, HttpFetcher, ProgressSink};
use crate::process::{self, quiet_command};

const VERSION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    YtDlp,
    Ffmpeg,
}

impl DependencyKind {
    pub fn name(&self) -> &'static str {
        match self {
            DependencyKind::YtDlp => "yt-dlp",
            DependencyKind::Ffmpeg => "ffmpeg",
        }
    }

    fn version_flag(&self) -> &'static str {
        match self {
            DependencyKind::YtDlp => "--version",
            DependencyKind::Ffmpeg => "-version",
        }
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn yt_dlp_download_url() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe"
    }
    #[cfg(target_os = "macos")]
    {
        // release asset has a platform suffix; installed under the canonical name
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp"
    }
}

fn ffmpeg_download_url() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-win64-gpl.zip"
    }
    #[cfg(target_os = "macos")]
    {
        "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-macos64-gpl.zip"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-linux64-gpl.tar.xz"
    }
}

fn executable_file_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

/// Locates an executable, preferring a managed copy next to the application
/// binary over anything on PATH, so a user update is never shadowed by an
/// older system install.
pub fn find_executable(app_dir: &Path, name: &str) -> Option<PathBuf> {
    let local = app_dir.join(executable_file_name(name));
    if local.exists() {
        return Some(local);
    }
    which::which(name).ok()
}

/// Downloads, verifies and atomically installs the two external tools.
pub struct DependencyInstaller {
    fetcher: HttpFetcher,
    app_dir: PathBuf,
    cancel: Mutex<CancellationToken>,
}

impl DependencyInstaller {
    pub fn new(app_dir: PathBuf) -> Result<Self, InstallError> {
        Ok(Self {
            fetcher: HttpFetcher::new()?,
            app_dir,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn find(&self, kind: DependencyKind) -> Option<PathBuf> {
        find_executable(&self.app_dir, kind.name())
    }

    /// Cancels the install currently in flight, if any.
    pub fn cancel(&self) {
        info!("cancellation signal sent to dependency installer");
        self.cancel.lock().cancel();
    }

    fn begin(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.cancel.lock() = fresh.clone();
        fresh
    }

    /// Downloads the OS-specific yt-dlp build to a staging file and renames
    /// it over the live path. The canonical location is untouched on every
    /// failure path.
    pub async fn install_yt_dlp(&self, sink: &ProgressSink) -> Result<PathBuf, InstallError> {
        let cancel = self.begin();
        let url = yt_dlp_download_url();
        let live = self.app_dir.join(executable_file_name(DependencyKind::YtDlp.name()));
        let staging = staging_path(&live);

        info!("downloading yt-dlp from {url}");
        self.fetcher.fetch(url, &staging, sink, &cancel).await?;

        if cancel.is_cancelled() {
            let _ = std::fs::remove_file(&staging);
            return Err(InstallError::Cancelled);
        }
        if let Err(error) = set_executable(&staging) {
            let _ = std::fs::remove_file(&staging);
            return Err(error);
        }
        atomic_replace(&staging, &live)?;
        info!("yt-dlp installed to {:?}", live);
        Ok(live)
    }

    /// Downloads the OS-specific ffmpeg archive into a temp directory,
    /// extracts it, locates the executable and moves it next to the
    /// application binary. The temp directory is destroyed on all exit paths.
    pub async fn install_ffmpeg(&self, sink: &ProgressSink) -> Result<PathBuf, InstallError> {
        let cancel = self.begin();
        let url = ffmpeg_download_url();
        let exe_name = executable_file_name(DependencyKind::Ffmpeg.name());
        let live = self.app_dir.join(&exe_name);

        let temp = tempfile::tempdir().map_err(|source| InstallError::File {
            reason: format!("could not create temp directory: {source}"),
        })?;
        let archive = temp.path().join(archive_file_name(url));

        info!("downloading ffmpeg from {url}");
        self.fetcher.fetch(url, &archive, sink, &cancel).await?;

        sink(FetchProgress::indeterminate(
            FetchPhase::Extract,
            "Extracting FFmpeg...",
        ));
        let extract_dir = temp.path().join("ffmpeg_extracted");
        extract_archive(&archive, &extract_dir, &cancel).await?;

        sink(FetchProgress::indeterminate(
            FetchPhase::Locate,
            "Locating executable...",
        ));
        let located = {
            let extract_dir = extract_dir.clone();
            let exe_name = exe_name.clone();
            tokio::task::spawn_blocking(move || find_file_recursive(&extract_dir, &exe_name))
                .await
                .map_err(|source| InstallError::Unexpected {
                    reason: source.to_string(),
                })?
        };
        let located = located.ok_or_else(|| InstallError::Archive {
            reason: format!("could not find '{exe_name}' in archive"),
        })?;

        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        move_file(&located, &live).await?;
        set_executable(&live)?;
        info!("ffmpeg installed to {:?}", live);
        Ok(live)
    }
}

/// Runs the tool with its version flag and condenses every outcome into a
/// displayable line.
pub async fn probe_version(kind: DependencyKind, path: Option<&Path>) -> String {
    let Some(path) = path else {
        return "Not found".to_string();
    };
    if !path.exists() {
        return "Not found".to_string();
    }

    let mut command = quiet_command(path);
    command.arg(kind.version_flag());
    match process::run_with_timeout(command, VERSION_TIMEOUT).await {
        Ok(output) if output.success() => {
            let text = if output.stdout.trim().is_empty() {
                output.stderr
            } else {
                output.stdout
            };
            text.lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| "Error checking version".to_string())
        }
        Ok(_) => "Cannot execute".to_string(),
        Err(ProcessError::Timeout(_)) => "Version check timed out".to_string(),
        Err(ProcessError::Spawn { source, .. }) => match source.kind() {
            std::io::ErrorKind::NotFound => "Not found".to_string(),
            std::io::ErrorKind::PermissionDenied => "Not found or no permission".to_string(),
            _ => "Cannot execute".to_string(),
        },
        Err(_) => "Error checking version".to_string(),
    }
}

fn staging_path(live: &Path) -> PathBuf {
    let mut name = live
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".download");
    live.with_file_name(name)
}

fn archive_file_name(url: &str) -> String {
    url.rsplit('/').next().unwrap_or("archive").to_string()
}

fn set_executable(path: &Path) -> Result<(), InstallError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)
            .map_err(|source| InstallError::file(path, source))?
            .permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)
            .map_err(|source| InstallError::file(path, source))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Staged file becomes the live one in a single rename. On Windows the live
/// file can be held open by another instance; that surfaces as a clear
/// file-level failure instead of a corrupted install.
fn atomic_replace(staging: &Path, live: &Path) -> Result<(), InstallError> {
    match std::fs::rename(staging, live) {
        Ok(()) => Ok(()),
        Err(source) => {
            let _ = std::fs::remove_file(staging);
            if cfg!(windows) {
                Err(InstallError::File {
                    reason: format!(
                        "could not replace {}; another copy of the application may be running ({source})",
                        live.display()
                    ),
                })
            } else {
                Err(InstallError::file(live, source))
            }
        }
    }
}

/// Rename with copy fallback; temp dirs often sit on a different filesystem
/// than the application directory.
async fn move_file(from: &Path, to: &Path) -> Result<(), InstallError> {
    let from = from.to_path_buf();
    let to = to.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if to.exists() {
            std::fs::remove_file(&to).map_err(|source| {
                if cfg!(windows) {
                    InstallError::File {
                        reason: format!(
                            "could not replace {}; another copy of the application may be running ({source})",
                            to.display()
                        ),
                    }
                } else {
                    InstallError::file(&to, source)
                }
            })?;
        }
        if std::fs::rename(&from, &to).is_err() {
            std::fs::copy(&from, &to).map_err(|source| InstallError::file(&to, source))?;
            let _ = std::fs::remove_file(&from);
        }
        Ok(())
    })
    .await
    .map_err(|source| InstallError::Unexpected {
        reason: source.to_string(),
    })?
}

async fn extract_archive(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dest).map_err(|source| InstallError::file(&dest, source))?;
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            extract_zip(&archive, &dest, &cancel)
        } else if name.ends_with(".tar.xz") {
            extract_tar_xz(&archive, &dest, &cancel)
        } else {
            Err(InstallError::Archive {
                reason: format!("unsupported archive format: {name}"),
            })
        }
    })
    .await
    .map_err(|source| InstallError::Unexpected {
        reason: source.to_string(),
    })?
}

fn extract_zip(archive: &Path, dest: &Path, cancel: &CancellationToken) -> Result<(), InstallError> {
    let file = std::fs::File::open(archive).map_err(|source| InstallError::file(archive, source))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|source| InstallError::archive(source))?;
    for index in 0..zip.len() {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let mut entry = zip
            .by_index(index)
            .map_err(|source| InstallError::archive(source))?;
        // entries with unsafe paths are skipped rather than extracted
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|source| InstallError::file(&out_path, source))?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| InstallError::file(parent, source))?;
            }
            let mut out = std::fs::File::create(&out_path)
                .map_err(|source| InstallError::file(&out_path, source))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|source| InstallError::file(&out_path, source))?;
        }
    }
    Ok(())
}

fn extract_tar_xz(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    let file = std::fs::File::open(archive).map_err(|source| InstallError::file(archive, source))?;
    let decoder = xz2::read::XzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    std::fs::create_dir_all(dest).map_err(|source| InstallError::file(dest, source))?;
    let entries = tar
        .entries()
        .map_err(|source| InstallError::archive(source))?;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let mut entry = entry.map_err(|source| InstallError::archive(source))?;
        entry
            .unpack_in(dest)
            .map_err(|source| InstallError::archive(source))?;
    }
    Ok(())
}

fn find_file_recursive(root: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file_recursive(&path, name) {
                return Some(found);
            }
        } else if path
            .file_name()
            .map(|file| file.to_string_lossy().eq_ignore_ascii_case(name))
            .unwrap_or(false)
        {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn local_copy_beats_path_lookup() {
        let dir = tempdir().unwrap();
        let name = "some-managed-tool";
        assert!(find_executable(dir.path(), name).is_none());

        let local = dir.path().join(executable_file_name(name));
        std::fs::write(&local, "stub").unwrap();
        assert_eq!(find_executable(dir.path(), name), Some(local));
    }

    #[test]
    fn staging_sits_next_to_the_live_file() {
        let staged = staging_path(Path::new("/opt/app/yt-dlp"));
        assert_eq!(staged, Path::new("/opt/app/yt-dlp.download"));
    }

    #[test]
    fn zip_archives_are_extracted_and_searched() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("pkg/doc/readme.txt", options).unwrap();
            std::io::Write::write_all(&mut writer, b"docs").unwrap();
            writer.start_file("pkg/bin/ffmpeg", options).unwrap();
            std::io::Write::write_all(&mut writer, b"binary-bytes").unwrap();
            writer.finish().unwrap();
        }

        let dest = dir.path().join("out");
        let cancel = CancellationToken::new();
        extract_zip(&archive, &dest, &cancel).unwrap();

        let located = find_file_recursive(&dest, "ffmpeg").expect("binary present");
        assert_eq!(std::fs::read(&located).unwrap(), b"binary-bytes");
        assert!(find_file_recursive(&dest, "ffprobe").is_none());
    }

    #[test]
    fn tar_xz_archives_are_extracted() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bundle.tar.xz");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let encoder = xz2::write::XzEncoder::new(file, 6);
            let mut builder = tar::Builder::new(encoder);
            let data = b"binary-bytes";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "pkg/bin/ffmpeg", data.as_slice())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = dir.path().join("out");
        let cancel = CancellationToken::new();
        extract_tar_xz(&archive, &dest, &cancel).unwrap();
        let located = find_file_recursive(&dest, "ffmpeg").expect("binary present");
        assert_eq!(std::fs::read(&located).unwrap(), b"binary-bytes");
    }

    #[test]
    fn cancelled_extraction_stops_early() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("a.txt", options).unwrap();
            std::io::Write::write_all(&mut writer, b"a").unwrap();
            writer.finish().unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = extract_zip(&archive, &dir.path().join("out"), &cancel);
        assert!(matches!(result, Err(InstallError::Cancelled)));
    }

    #[tokio::test]
    async fn move_file_replaces_an_existing_target() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("fresh");
        let to = dir.path().join("live");
        std::fs::write(&from, "new").unwrap();
        std::fs::write(&to, "old").unwrap();

        move_file(&from, &to).await.unwrap();
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "new");
        assert!(!from.exists());
    }

    #[tokio::test]
    async fn version_probe_without_a_path_reports_not_found() {
        assert_eq!(probe_version(DependencyKind::Ffmpeg, None).await, "Not found");
        assert_eq!(
            probe_version(DependencyKind::YtDlp, Some(Path::new("/no/such/tool"))).await,
            "Not found"
        );
    }

    #[cfg(unix)]
    mod version_probe_unix {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::tempdir;

        fn script(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(mode);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn first_output_line_is_the_version() {
            let dir = tempdir().unwrap();
            let tool = script(
                dir.path(),
                "fake-ffmpeg",
                "echo 'ffmpeg version N-113007-g8d24a28d06'\necho 'built with gcc'",
                0o755,
            );
            assert_eq!(
                probe_version(DependencyKind::Ffmpeg, Some(&tool)).await,
                "ffmpeg version N-113007-g8d24a28d06"
            );
        }

        #[tokio::test]
        async fn failing_tool_cannot_execute() {
            let dir = tempdir().unwrap();
            let tool = script(dir.path(), "broken", "exit 2", 0o755);
            assert_eq!(
                probe_version(DependencyKind::YtDlp, Some(&tool)).await,
                "Cannot execute"
            );
        }

        #[tokio::test]
        async fn unreadable_tool_reports_permissions() {
            let dir = tempdir().unwrap();
            let tool = script(dir.path(), "locked", "echo 1.0", 0o644);
            assert_eq!(
                probe_version(DependencyKind::YtDlp, Some(&tool)).await,
                "Not found or no permission"
            );
        }
    }
}
