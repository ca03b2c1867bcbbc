/// Configuration for the single-instance guard.
///
/// A `GuardConfig` names the three things every launch of an application must
/// agree on:
/// - the instance lock (a named mutex on Windows, a lock file on Unix)
/// - the activation endpoint (a named pipe on Windows, a Unix domain socket)
/// - where Unix endpoints live on disk (the runtime directory)
///
/// Defaults are derived from the application id. They can be overridden by an
/// optional `instance.json` stored in the platform-specific data directory
/// (%APPDATA%/<app_id>/ on Windows).
///
/// # Example
///
/// ```rust,no_run
/// use instance_guard_core::config::{load_config, GuardConfig};
///
/// let config = load_config("MyApp");
/// assert_eq!(config.endpoint_name(), "SingleInstancePipe.MyApp");
///
/// let scratch = GuardConfig::for_app("MyApp").with_runtime_dir("/tmp/myapp-test");
/// assert!(scratch.validate().is_ok());
/// ```
use crate::error::{InstanceError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix shared by every activation endpoint
pub const DEFAULT_PIPE_PREFIX: &str = "SingleInstancePipe.";

const CONFIG_FILE: &str = "instance.json";

/// Names and locations shared by the primary and its secondaries
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GuardConfig {
    /// Application identity, appended to the pipe prefix
    pub app_id: String,
    /// Name of the process-wide instance lock
    pub mutex_name: String,
    /// Prefix of the activation endpoint name
    pub pipe_prefix: String,
    /// Directory holding the lock file and socket (ignored on Windows)
    pub runtime_dir: PathBuf,
}

impl GuardConfig {
    /// Default configuration for an application id
    pub fn for_app(app_id: impl Into<String>) -> Self {
        let app_id = app_id.into();
        let runtime_dir = default_runtime_dir(&app_id);

        GuardConfig {
            mutex_name: format!("{app_id}.SingleInstance"),
            pipe_prefix: DEFAULT_PIPE_PREFIX.to_string(),
            runtime_dir,
            app_id,
        }
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Deterministic endpoint name: prefix + application identity
    pub fn endpoint_name(&self) -> String {
        format!("{}{}", self.pipe_prefix, self.app_id)
    }

    /// OS-visible location of the activation endpoint
    #[cfg(windows)]
    pub fn endpoint_path(&self) -> PathBuf {
        PathBuf::from(format!(r"\\.\pipe\{}", self.endpoint_name()))
    }

    /// OS-visible location of the activation endpoint
    #[cfg(not(windows))]
    pub fn endpoint_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.sock", self.endpoint_name()))
    }

    /// Lock file backing the instance lock on Unix
    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.lock", self.mutex_name))
    }

    /// Reject names that cannot be used verbatim as OS object names
    pub fn validate(&self) -> Result<()> {
        // The prefix may be empty; the joined endpoint name may not.
        for name in [&self.app_id, &self.mutex_name] {
            check_name(name)?;
        }
        if !self.pipe_prefix.is_empty() {
            check_name(&self.pipe_prefix)?;
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(InstanceError::InvalidName(name.to_string()))
    }
}

/// Per-user runtime directory, falling back to the temp dir where the
/// platform has none (macOS, Windows, Linux without XDG_RUNTIME_DIR)
fn default_runtime_dir(app_id: &str) -> PathBuf {
    ProjectDirs::from("", "", app_id)
        .and_then(|dirs| dirs.runtime_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| fallback_runtime_dir(app_id))
}

/// The Unix temp dir is shared between users, so the fallback is keyed by uid
#[cfg(unix)]
fn fallback_runtime_dir(app_id: &str) -> PathBuf {
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("{app_id}-{uid}"))
}

/// %TEMP% is already per user
#[cfg(not(unix))]
fn fallback_runtime_dir(_app_id: &str) -> PathBuf {
    std::env::temp_dir()
}

fn data_directory(app_id: &str) -> Option<PathBuf> {
    ProjectDirs::from("", "", app_id).map(|dirs| dirs.data_dir().to_path_buf())
}

/// Load configuration for `app_id` from instance.json
/// Returns defaults if the file doesn't exist or on error
pub fn load_config(app_id: &str) -> GuardConfig {
    let Some(data_dir) = data_directory(app_id) else {
        return GuardConfig::for_app(app_id);
    };

    load_config_from(&data_dir.join(CONFIG_FILE)).unwrap_or_else(|| GuardConfig::for_app(app_id))
}

fn load_config_from(path: &Path) -> Option<GuardConfig> {
    let contents = fs::read_to_string(path).ok()?;

    match serde_json::from_str(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}

/// Save configuration to instance.json in the application's data directory
pub fn save_config(config: &GuardConfig) -> Result<()> {
    let data_dir = data_directory(&config.app_id).ok_or_else(|| {
        InstanceError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "failed to determine user data directory",
        ))
    })?;

    save_config_to(config, &data_dir.join(CONFIG_FILE))
}

fn save_config_to(config: &GuardConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| InstanceError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = GuardConfig::for_app("ExampleApp");
        assert_eq!(config.app_id, "ExampleApp");
        assert_eq!(config.mutex_name, "ExampleApp.SingleInstance");
        assert_eq!(config.pipe_prefix, DEFAULT_PIPE_PREFIX);
        assert_eq!(config.endpoint_name(), "SingleInstancePipe.ExampleApp");
    }

    #[test]
    fn test_endpoint_is_deterministic() {
        let a = GuardConfig::for_app("ExampleApp");
        let b = GuardConfig::for_app("ExampleApp");
        assert_eq!(a.endpoint_path(), b.endpoint_path());
        assert_eq!(a.lock_path(), b.lock_path());
    }

    #[cfg(unix)]
    #[test]
    fn test_paths_follow_runtime_dir() {
        let config = GuardConfig::for_app("ExampleApp").with_runtime_dir("/run/test");
        assert_eq!(
            config.endpoint_path(),
            PathBuf::from("/run/test/SingleInstancePipe.ExampleApp.sock")
        );
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/run/test/ExampleApp.SingleInstance.lock")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_fallback_runtime_dir_is_per_user() {
        let uid = unsafe { libc::getuid() };
        let dir = fallback_runtime_dir("ExampleApp");

        assert_ne!(dir, std::env::temp_dir());
        assert_eq!(dir.parent(), Some(std::env::temp_dir().as_path()));
        assert_eq!(
            dir.file_name().unwrap().to_string_lossy(),
            format!("ExampleApp-{uid}")
        );
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(GuardConfig::for_app("Good-App_1.0").validate().is_ok());

        let err = GuardConfig::for_app("bad/app").validate().unwrap_err();
        assert!(matches!(err, InstanceError::InvalidName(name) if name == "bad/app"));

        let mut config = GuardConfig::for_app("App");
        config.mutex_name = String::new();
        assert!(config.validate().is_err());

        config = GuardConfig::for_app("App");
        config.pipe_prefix = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = GuardConfig::for_app("ExampleApp").with_runtime_dir(dir.path());
        config.pipe_prefix = "Custom.".to_string();
        save_config_to(&config, &path).unwrap();

        assert_eq!(load_config_from(&path), Some(config));
    }

    #[test]
    fn test_malformed_config_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_config_from(&path), None);
        assert_eq!(load_config_from(&dir.path().join("missing.json")), None);
    }
}
