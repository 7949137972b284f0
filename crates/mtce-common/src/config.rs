//! Shared config loading and directory-watch scaffolding (see spec §4.9).
//!
//! TOML parsing follows the same `tokio::fs::read_to_string` +
//! `toml::from_str` pair `midi-host/src/main.rs` and `midi-client/src/main.rs`
//! use inline; lifted here so both daemons (and their PMON process-directory
//! reload) share one loader instead of duplicating it per binary.
//!
//! The directory watcher wraps the `notify` crate (pinned at the version the
//! teacher's workspace already carries) behind a `tokio::sync::mpsc`
//! channel, since `notify`'s callback runs on its own background thread and
//! the async daemons need events on their own event loop.

use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Read and parse a TOML config file into `T`.
pub async fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to start directory watcher: {0}")]
    Notify(#[from] notify::Error),
}

/// Watches a directory (non-recursively, e.g. `/etc/pmon.d`) and forwards
/// raw filesystem events to an async receiver. The caller is responsible
/// for debouncing/coalescing into its own "deferred reload, applied at next
/// audit tick" flag, matching the `role_tx`/`watch::Receiver`
/// change-detection idiom in `midi-host/src/discovery.rs`.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    pub events: mpsc::Receiver<Event>,
}

impl DirWatcher {
    pub fn start(dir: &Path) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::channel(64);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn load_toml_parses_valid_file() {
        let dir = tempdir();
        let path = dir.join("sample.toml");
        tokio::fs::write(&path, "name = \"x\"\ncount = 3\n").await.unwrap();
        let parsed: Sample = load_toml(&path).await.unwrap();
        assert_eq!(parsed, Sample { name: "x".into(), count: 3 });
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn load_toml_reports_missing_file() {
        let err = load_toml::<Sample>(Path::new("/nonexistent/path/sample.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn load_toml_reports_parse_error() {
        let dir = tempdir();
        let path = dir.join("bad.toml");
        tokio::fs::write(&path, "not valid toml = = =").await.unwrap();
        let err = load_toml::<Sample>(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("mtce-common-test-{}-{}", std::process::id(), n));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
