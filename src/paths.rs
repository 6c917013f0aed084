use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "procrastination-watcher";

pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => {
            let home = PathBuf::from(home);
            let path = if cfg!(target_os = "macos") {
                home.join("Library")
                    .join("Application Support")
                    .join(APP_DIR_NAME)
            } else {
                std::env::var_os("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| home.join(".local").join("share"))
                    .join(APP_DIR_NAME)
            };
            let _ = std::fs::create_dir_all(&path);
            path
        }
        None => PathBuf::from("."),
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

pub fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
}

pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("watcher.sock")
}

pub fn capture_path(data_dir: &Path) -> PathBuf {
    data_dir.join("captures").join("latest.png")
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}
