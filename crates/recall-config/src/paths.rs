use std::path::PathBuf;

/// XDG app name used for config and state directories.
pub const APP_NAME: &str = "recall";

const CONFIG_FILE_NAME: &str = "config.toml";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// State directory; platforms without a state dir fall back to local data.
pub fn state_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| {
        dirs.state_dir()
            .unwrap_or_else(|| dirs.data_local_dir())
            .to_path_buf()
    })
}

pub fn state_dir_fallback() -> PathBuf {
    std::env::temp_dir().join(format!("{APP_NAME}-state"))
}

pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Directory holding `{project}_memory.json` files when `memory.dir` is unset.
pub fn default_memory_dir() -> PathBuf {
    state_dir()
        .unwrap_or_else(state_dir_fallback)
        .join("memory")
}
