//! Subscription list and config download
//!
//! The list lives in `subscriptions.json` next to the other application
//! data. Each subscription is a URL serving a complete sing-box JSON config;
//! the selected one is what gets written to the core's config path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// User agent sent when downloading configs
const USER_AGENT: &str = concat!("singbox-ui/", env!("CARGO_PKG_VERSION"));

/// Errors from the subscription store and downloads
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid subscription file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no subscription at index {0}")]
    NoSuchIndex(usize),

    #[error("download failed: {0}")]
    Http(#[from] ureq::Error),

    #[error("downloaded config is not valid JSON: {0}")]
    InvalidConfig(serde_json::Error),
}

/// One stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub url: String,
    pub added_at: DateTime<Utc>,
}

/// Result of [`SubscriptionStore::import`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportResult {
    /// New entry at this index
    Added(usize),
    /// URL was already stored at this index
    Existing(usize),
}

impl ImportResult {
    pub fn index(&self) -> usize {
        match self {
            ImportResult::Added(i) | ImportResult::Existing(i) => *i,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    subscriptions: Vec<Subscription>,
    #[serde(default)]
    current: Option<usize>,
}

/// Persistent subscription list with the currently selected entry
#[derive(Debug)]
pub struct SubscriptionStore {
    path: PathBuf,
    data: StoreFile,
}

impl SubscriptionStore {
    /// Load the store at `path`; a missing file is an empty store
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SubscriptionError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<StoreFile>(&raw).map_err(|source| {
                SubscriptionError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreFile::default(),
            Err(source) => return Err(SubscriptionError::Io { path, source }),
        };

        let mut store = Self { path, data };
        // A hand-edited file may point past the end
        if store.data.current.is_some_and(|i| i >= store.data.subscriptions.len()) {
            store.data.current = None;
        }
        Ok(store)
    }

    /// Write the store atomically (temp file + rename)
    pub fn save(&self) -> Result<(), SubscriptionError> {
        let io_err = |source| SubscriptionError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(io_err)?;
            }
        }

        let json = serde_json::to_string_pretty(&self.data)
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.data.subscriptions
    }

    pub fn len(&self) -> usize {
        self.data.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.subscriptions.is_empty()
    }

    /// Index and entry of the selected subscription
    pub fn current(&self) -> Option<(usize, &Subscription)> {
        let index = self.data.current?;
        self.data.subscriptions.get(index).map(|s| (index, s))
    }

    /// Add `url` unless it is already stored. The first subscription
    /// becomes the current one.
    pub fn import(&mut self, url: &str, name: Option<&str>) -> ImportResult {
        if let Some(index) = self.data.subscriptions.iter().position(|s| s.url == url) {
            return ImportResult::Existing(index);
        }

        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_name(url));
        self.data.subscriptions.push(Subscription {
            name,
            url: url.to_string(),
            added_at: Utc::now(),
        });

        let index = self.data.subscriptions.len() - 1;
        if self.data.current.is_none() {
            self.data.current = Some(index);
        }
        ImportResult::Added(index)
    }

    /// Make `index` the current subscription
    pub fn select(&mut self, index: usize) -> Result<&Subscription, SubscriptionError> {
        let sub = self
            .data
            .subscriptions
            .get(index)
            .ok_or(SubscriptionError::NoSuchIndex(index))?;
        self.data.current = Some(index);
        Ok(sub)
    }

    /// Remove the subscription at `index`, keeping the selection on the
    /// same entry where possible
    pub fn remove(&mut self, index: usize) -> Result<Subscription, SubscriptionError> {
        if index >= self.data.subscriptions.len() {
            return Err(SubscriptionError::NoSuchIndex(index));
        }
        let removed = self.data.subscriptions.remove(index);

        self.data.current = match self.data.current {
            Some(current) if current == index => {
                if self.data.subscriptions.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            Some(current) if current > index => Some(current - 1),
            other => other,
        };
        Ok(removed)
    }
}

/// Name derived from the URL host, or the URL itself
fn default_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Download the config behind `url` and check that it is JSON.
///
/// Blocking; run it off the async runtime.
pub fn fetch_config(url: &str, timeout: Duration) -> Result<String, SubscriptionError> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into();

    tracing::debug!("Fetching subscription {}", url);
    let mut response = agent.get(url).header("User-Agent", USER_AGENT).call()?;
    let body = response.body_mut().read_to_string()?;

    serde_json::from_str::<serde_json::Value>(&body).map_err(SubscriptionError::InvalidConfig)?;
    Ok(body)
}

/// Write a downloaded config to the core's config path (temp file + rename)
pub fn write_config(path: &Path, config: &str) -> Result<(), SubscriptionError> {
    let io_err = |source| SubscriptionError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, config).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn store_in(dir: &tempfile::TempDir) -> SubscriptionStore {
        SubscriptionStore::load(dir.path().join("subscriptions.json")).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.is_empty());
        assert!(store.current().is_none());
    }

    #[test]
    fn test_import_dedupes_by_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        assert_eq!(
            store.import("https://example.com/sub#tag_name", Some("tag_name")),
            ImportResult::Added(0)
        );
        assert_eq!(store.import("https://other.example/s", None), ImportResult::Added(1));
        assert_eq!(
            store.import("https://example.com/sub#tag_name", Some("renamed")),
            ImportResult::Existing(0)
        );

        assert_eq!(store.len(), 2);
        assert_eq!(store.subscriptions()[0].name, "tag_name");
        assert_eq!(store.subscriptions()[1].name, "other.example");
        // First import became current
        assert_eq!(store.current().map(|(i, _)| i), Some(0));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.import("https://a.example/1", Some("A"));
        store.import("https://b.example/2", Some("B"));
        store.select(1).unwrap();
        store.save().unwrap();

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.subscriptions(), store.subscriptions());
        assert_eq!(reloaded.current().map(|(i, s)| (i, s.name.clone())), Some((1, "B".to_string())));
        assert!(!dir.path().join("subscriptions.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("subscriptions.json"), "{ not json").unwrap();
        let result = SubscriptionStore::load(dir.path().join("subscriptions.json"));
        assert!(matches!(result, Err(SubscriptionError::Corrupt { .. })));
    }

    #[test]
    fn test_out_of_range_current_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("subscriptions.json"),
            r#"{"subscriptions": [], "current": 4}"#,
        )
        .unwrap();
        assert!(store_in(&dir).current().is_none());
    }

    #[test]
    fn test_select_and_remove_keep_selection_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.import("https://a.example", Some("A"));
        store.import("https://b.example", Some("B"));
        store.import("https://c.example", Some("C"));

        assert!(matches!(store.select(7), Err(SubscriptionError::NoSuchIndex(7))));
        store.select(2).unwrap();

        store.remove(0).unwrap();
        assert_eq!(store.current().map(|(_, s)| s.name.as_str()), Some("C"));

        store.remove(1).unwrap();
        assert_eq!(store.current().map(|(_, s)| s.name.as_str()), Some("B"));

        store.remove(0).unwrap();
        assert!(store.current().is_none());
        assert!(matches!(store.remove(0), Err(SubscriptionError::NoSuchIndex(0))));
    }

    /// One-shot HTTP server answering with `body`
    fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{}/sub", addr)
    }

    #[test]
    fn test_fetch_config_accepts_json() {
        let url = serve_once("200 OK", r#"{"outbounds": []}"#);
        let body = fetch_config(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(body, r#"{"outbounds": []}"#);
    }

    #[test]
    fn test_fetch_config_rejects_non_json() {
        let url = serve_once("200 OK", "<html>login</html>");
        let result = fetch_config(&url, Duration::from_secs(5));
        assert!(matches!(result, Err(SubscriptionError::InvalidConfig(_))));
    }

    #[test]
    fn test_fetch_config_http_error() {
        let url = serve_once("404 Not Found", "{}");
        let result = fetch_config(&url, Duration::from_secs(5));
        assert!(matches!(result, Err(SubscriptionError::Http(_))));
    }

    #[test]
    fn test_write_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core").join("config.json");
        write_config(&path, "{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }
}
