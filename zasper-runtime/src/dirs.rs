//! Directory resolution for kernel specs and runtime connection files.
//!
//! Mirrors the precedence `zasper_py`'s `core/paths.py` establishes: an
//! explicit environment variable wins outright, then a user-level directory,
//! then system-level directories, with `ZASPER_PREFER_ENV_PATH` able to swap
//! the middle two and `ZASPER_PLATFORM_DIRS` switching the user-level
//! directory computation to the platform-native convention instead of the
//! classic `~/.zasper` / `~/.local/share/zasper` layout.

use std::env;
use std::path::PathBuf;

use crate::{Result, RuntimeError};

fn envset(name: &str, default: bool) -> bool {
    match env::var(name) {
        Err(_) => default,
        Ok(v) => !matches!(
            v.to_lowercase().as_str(),
            "no" | "n" | "false" | "off" | "0" | "0.0"
        ),
    }
}

fn use_platform_dirs() -> bool {
    envset("ZASPER_PLATFORM_DIRS", false)
}

fn prefer_env_over_user() -> bool {
    envset("ZASPER_PREFER_ENV_PATH", false)
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(RuntimeError::DirNotFound("home"))
}

/// The single user config directory: `ZASPER_CONFIG_DIR` if set, else
/// `~/.zasper` (or the platform config dir when `ZASPER_PLATFORM_DIRS` is
/// set). `ZASPER_NO_CONFIG` forces an empty, writable scratch directory so
/// tests never read or write a developer's real config.
pub fn config_dir() -> Result<PathBuf> {
    if envset("ZASPER_NO_CONFIG", false) {
        return Ok(env::temp_dir().join("zasper-no-config"));
    }
    if let Ok(dir) = env::var("ZASPER_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if use_platform_dirs() {
        if let Some(proj) = directories_config_dir() {
            return Ok(proj);
        }
    }
    Ok(home_dir()?.join(".zasper"))
}

fn directories_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("zasper"))
}

fn system_config_dirs() -> Vec<PathBuf> {
    if cfg!(windows) {
        env::var("PROGRAMDATA")
            .map(|p| vec![PathBuf::from(p).join("zasper")])
            .unwrap_or_default()
    } else {
        vec![
            PathBuf::from("/usr/local/etc/zasper"),
            PathBuf::from("/etc/zasper"),
        ]
    }
}

/// The full config search path (§6): `ZASPER_CONFIG_DIR`-or-default first or
/// last depending on `ZASPER_PREFER_ENV_PATH`, then the system directories.
pub fn config_path() -> Result<Vec<PathBuf>> {
    if envset("ZASPER_NO_CONFIG", false) {
        return Ok(vec![config_dir()?]);
    }
    let user = config_dir()?;
    let mut paths = Vec::new();
    if prefer_env_over_user() {
        paths.extend(system_config_dirs());
        paths.push(user);
    } else {
        paths.push(user);
        paths.extend(system_config_dirs());
    }
    Ok(paths)
}

fn system_data_dirs() -> Vec<PathBuf> {
    if cfg!(windows) {
        env::var("PROGRAMDATA")
            .map(|p| vec![PathBuf::from(p).join("zasper")])
            .unwrap_or_default()
    } else {
        vec![
            PathBuf::from("/usr/local/share/zasper"),
            PathBuf::from("/usr/share/zasper"),
        ]
    }
}

/// The single user data directory: `ZASPER_DATA_DIR` if set, else the
/// platform convention (`~/Library/Zasper` on macOS, `%APPDATA%\zasper` on
/// Windows, `$XDG_DATA_HOME/zasper` or `~/.local/share/zasper` elsewhere).
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var("ZASPER_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if use_platform_dirs() {
        if let Some(dir) = dirs::data_dir() {
            return Ok(dir.join("zasper"));
        }
    }
    if cfg!(target_os = "macos") {
        return Ok(home_dir()?.join("Library/Zasper"));
    }
    if cfg!(windows) {
        return Ok(PathBuf::from(
            env::var("APPDATA").map_err(|_| RuntimeError::DirNotFound("APPDATA"))?,
        )
        .join("zasper"));
    }
    match dirs::data_dir() {
        Some(dir) => Ok(dir.join("zasper")),
        None => Ok(home_dir()?.join(".local/share/zasper")),
    }
}

/// The data-file search path (§3 Kernel Spec, §6): the user data directory
/// relative to `ZASPER_PREFER_ENV_PATH`'s ordering, then the system data
/// directories. Kernel spec discovery walks every entry's `kernels/`
/// subdirectory, first-found-wins on a case-insensitive kernel name.
pub fn data_path() -> Result<Vec<PathBuf>> {
    let user = data_dir()?;
    let mut paths = Vec::new();
    if prefer_env_over_user() {
        paths.extend(system_data_dirs());
        paths.push(user);
    } else {
        paths.push(user);
        paths.extend(system_data_dirs());
    }
    Ok(paths)
}

/// The runtime directory where connection files live: `ZASPER_RUNTIME_DIR`
/// if set, else `<data_dir>/runtime`.
pub fn runtime_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var("ZASPER_RUNTIME_DIR") {
        return Ok(PathBuf::from(dir));
    }
    Ok(data_dir()?.join("runtime"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn config_dir_honors_explicit_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("ZASPER_CONFIG_DIR", "/tmp/zasper-config-test");
        let dir = config_dir().unwrap();
        env::remove_var("ZASPER_CONFIG_DIR");
        assert_eq!(dir, PathBuf::from("/tmp/zasper-config-test"));
    }

    #[test]
    fn no_config_forces_scratch_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("ZASPER_NO_CONFIG", "1");
        let dir = config_dir().unwrap();
        env::remove_var("ZASPER_NO_CONFIG");
        assert_eq!(dir, env::temp_dir().join("zasper-no-config"));
    }

    #[test]
    fn prefer_env_path_reorders_data_path() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("ZASPER_DATA_DIR", "/tmp/zasper-data-test");
        env::set_var("ZASPER_PREFER_ENV_PATH", "1");
        let path = data_path().unwrap();
        let user_index = path
            .iter()
            .position(|p| p == &PathBuf::from("/tmp/zasper-data-test"))
            .unwrap();
        env::remove_var("ZASPER_DATA_DIR");
        env::remove_var("ZASPER_PREFER_ENV_PATH");
        assert_eq!(user_index, path.len() - 1);
    }

    #[test]
    fn runtime_dir_defaults_under_data_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("ZASPER_DATA_DIR", "/tmp/zasper-data-test2");
        let runtime = runtime_dir().unwrap();
        env::remove_var("ZASPER_DATA_DIR");
        assert_eq!(runtime, PathBuf::from("/tmp/zasper-data-test2/runtime"));
    }
}
