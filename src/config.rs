use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, StoreError};

const DEFAULT_COOKIE_FILE: &str = "cookies.json";
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Configuration for a [`FileCookieStore`](crate::store::FileCookieStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// JSON file that holds the persisted index
    pub path: PathBuf,
    /// Quiet period after the last mutation before the file is rewritten
    pub debounce: Duration,
    /// Run the engine on a dedicated worker thread and talk to it via messages
    pub use_worker: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_COOKIE_FILE),
            debounce: DEFAULT_DEBOUNCE,
            use_worker: false,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Checks the configuration without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        validate_path(&self.path)
    }

    /// Copy of this config used for the engine living inside a worker. Worker mode is always
    /// off there, so the remote engine never offloads again.
    pub(crate) fn for_remote(&self) -> Self {
        Self {
            use_worker: false,
            ..self.clone()
        }
    }
}

fn validate_path(path: &Path) -> Result<()> {
    let raw = path.as_os_str();
    if raw.is_empty() {
        return Err(StoreError::InvalidConfig("cookie file path is empty".into()));
    }

    let lossy = raw.to_string_lossy();
    if lossy.trim().is_empty() {
        return Err(StoreError::InvalidConfig("cookie file path is blank".into()));
    }
    if lossy.ends_with('/') || lossy.ends_with(std::path::MAIN_SEPARATOR) {
        return Err(StoreError::InvalidConfig(format!(
            "cookie file path '{}' names a directory",
            lossy
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.path, PathBuf::from("cookies.json"));
        assert_eq!(cfg.debounce, Duration::from_millis(250));
        assert!(!cfg.use_worker);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_and_blank_paths_are_rejected() {
        assert!(matches!(
            StoreConfig::new("").validate(),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(matches!(
            StoreConfig::new("   ").validate(),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(matches!(
            StoreConfig::new("/tmp/cookies/").validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn remote_config_never_uses_worker() {
        let cfg = StoreConfig {
            use_worker: true,
            ..StoreConfig::new("jar.json")
        };
        let remote = cfg.for_remote();
        assert!(!remote.use_worker);
        assert_eq!(remote.path, cfg.path);
        assert_eq!(remote.debounce, cfg.debounce);
    }
}
