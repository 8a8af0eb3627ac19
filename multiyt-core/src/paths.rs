use std::io;
use std::path::PathBuf;

const USER_DATA_DIR_NAME: &str = ".multiyt-dlp";

/// Directory holding the application binary. Managed copies of yt-dlp and
/// ffmpeg live here so a user-installed update is never shadowed by an older
/// system copy.
pub fn app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn user_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(USER_DATA_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    user_data_dir().join("config.json")
}

pub fn log_dir() -> PathBuf {
    user_data_dir().join("logs")
}

/// Scratch space handed to the acquisition tool for its partial files. Owned
/// by the core so the stop protocol can clean it deterministically.
pub fn temp_download_dir() -> PathBuf {
    user_data_dir().join("temp_downloads")
}

pub fn ensure_layout() -> io::Result<()> {
    std::fs::create_dir_all(user_data_dir())?;
    std::fs::create_dir_all(log_dir())?;
    std::fs::create_dir_all(temp_download_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_user_data_dir() {
        let root = user_data_dir();
        assert!(config_path().starts_with(&root));
        assert!(log_dir().starts_with(&root));
        assert!(temp_download_dir().starts_with(&root));
        assert_eq!(config_path().file_name().unwrap(), "config.json");
    }
}
