//! Filesystem layout for classpulse.
//!
//! Single place that decides where the daemon keeps its database, the
//! fallback event log, configuration and Unix sockets.
//!
//! | Platform | Data Directory | Socket Directory |
//! |----------|----------------|------------------|
//! | Linux    | `~/.local/share/classpulse` | `$XDG_RUNTIME_DIR` or data dir |
//! | macOS    | `~/Library/Application Support/classpulse` | Same as data dir |

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

/// Errors specific to path resolution.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not determine data directory")]
    NoDataDirectory,

    #[error("Could not determine config directory")]
    NoConfigDirectory,
}

const APP_NAME: &str = "classpulse";

/// Control socket (start/stop/status commands).
const CONTROL_SOCKET_NAME: &str = "classpulse.sock";

/// Live socket (dashboard subscribers).
const LIVE_SOCKET_NAME: &str = "classpulse_live.sock";

const DATABASE_NAME: &str = "events.db";

/// Append-only JSONL file used when the database rejects an event.
const FALLBACK_LOG_NAME: &str = "session_data.jsonl";

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
        }
    }
    Ok(())
}

/// Get the application data directory, creating it (0700) if needed.
pub fn get_data_dir() -> Result<PathBuf> {
    let base_dir = dirs::data_dir().ok_or(PathError::NoDataDirectory)?;
    let data_dir = base_dir.join(APP_NAME);
    ensure_private_dir(&data_dir)?;
    Ok(data_dir)
}

/// Get the configuration directory.
///
/// Linux uses `~/.config/classpulse`; other platforms keep config with data.
pub fn get_config_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let config_base = dirs::config_dir().ok_or(PathError::NoConfigDirectory)?;
        let config_dir = config_base.join(APP_NAME);
        ensure_private_dir(&config_dir)?;
        Ok(config_dir)
    }

    #[cfg(not(target_os = "linux"))]
    {
        get_data_dir()
    }
}

/// Get the directory that holds the Unix sockets.
pub fn get_socket_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Some(runtime_dir) = dirs::runtime_dir() {
            if runtime_dir.exists() {
                return Ok(runtime_dir);
            }
        }
    }

    get_data_dir()
}

pub fn get_control_socket_path() -> Result<PathBuf> {
    Ok(get_socket_dir()?.join(CONTROL_SOCKET_NAME))
}

pub fn get_live_socket_path() -> Result<PathBuf> {
    Ok(get_socket_dir()?.join(LIVE_SOCKET_NAME))
}

pub fn get_database_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(DATABASE_NAME))
}

pub fn get_fallback_log_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(FALLBACK_LOG_NAME))
}

/// Restrict a socket file to its owner (0600).
#[cfg(unix)]
pub fn secure_socket_permissions(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if socket_path.exists() {
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600)).with_context(|| {
            format!(
                "Failed to set socket permissions: {}",
                socket_path.display()
            )
        })?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn secure_socket_permissions(_socket_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_creation() {
        let dir = get_data_dir().expect("Should get data directory");
        assert!(dir.exists(), "Data directory should exist");
        assert!(dir.ends_with("classpulse"), "Should end with app name");
    }

    #[test]
    fn test_socket_paths() {
        let control = get_control_socket_path().unwrap();
        let live = get_live_socket_path().unwrap();
        assert!(control.ends_with("classpulse.sock"));
        assert!(live.ends_with("classpulse_live.sock"));
        assert_eq!(control.parent(), live.parent());
    }

    #[test]
    fn test_storage_paths_live_in_data_dir() {
        let data = get_data_dir().unwrap();
        assert_eq!(get_database_path().unwrap(), data.join("events.db"));
        assert_eq!(
            get_fallback_log_path().unwrap(),
            data.join("session_data.jsonl")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_secure_socket_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let file = tempfile_path();
        std::fs::write(&file, b"").unwrap();
        secure_socket_permissions(&file).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        std::fs::remove_file(&file).ok();
    }

    #[cfg(unix)]
    fn tempfile_path() -> PathBuf {
        std::env::temp_dir().join(format!("classpulse-perm-{}", std::process::id()))
    }
}
