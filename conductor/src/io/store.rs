//! Crash-safe key/value persistence under `.conductor/state/`.
//!
//! Every durable byte the core writes goes through [`StateStore`]. Values are
//! JSON documents at `<root>/<key>.json`; keys are `/`-separated segments.
//! Writes go to a unique temp file in the target directory, are fsynced, and
//! then renamed over the target, so readers only ever see a complete value
//! and a crash before the rename leaves the previous value in place.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, trace};

use crate::error::StoreError;

const VALUE_EXT: &str = "json";
const JOURNAL_EXT: &str = "jsonl";
const TMP_SUFFIX: &str = ".tmp";

/// Handle to a state directory. Cheap to clone; safe to share across lanes.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Atomically replace the value stored at `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub fn persist<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let path = self.value_path(key)?;
        let mut buf = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        buf.push(b'\n');
        write_atomic(key, &path, &buf)?;
        debug!(key, bytes = buf.len(), "persisted state");
        Ok(())
    }

    /// Load the last committed value at `key`; `Ok(None)` if never written.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.value_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                trace!(key, "state key not found");
                return Ok(None);
            }
            Err(source) => {
                return Err(StoreError::Read {
                    key: key.to_string(),
                    path,
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            })
    }

    /// Committed keys directly under `namespace`, sorted. Temp files are skipped.
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        validate_key(namespace)?;
        let dir = self.root.join(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    key: namespace.to_string(),
                    path: dir,
                    source,
                });
            }
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                key: namespace.to_string(),
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".json")
                && validate_segment(stem)
            {
                keys.push(format!("{namespace}/{stem}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Load every committed value under `namespace`, in key order.
    pub fn load_all<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>, StoreError> {
        let mut values = Vec::new();
        for key in self.keys(namespace)? {
            if let Some(value) = self.load(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Append one JSON line to the journal at `key` (`<key>.jsonl`).
    pub fn append<T: Serialize>(&self, key: &str, record: &T) -> Result<(), StoreError> {
        let path = self.path_with_ext(key, JOURNAL_EXT)?;
        let mut line = serde_json::to_vec(record).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        line.push(b'\n');
        let write_err = |source: std::io::Error| StoreError::Write {
            key: key.to_string(),
            path: path.clone(),
            source,
        };
        ensure_parent(&path).map_err(write_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(write_err)?;
        // One write call per record keeps O_APPEND lines whole.
        file.write_all(&line).map_err(write_err)?;
        file.sync_data().map_err(write_err)?;
        Ok(())
    }

    /// Read every record in the journal at `key`.
    pub fn read_journal<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StoreError> {
        let path = self.path_with_ext(key, JOURNAL_EXT)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    key: key.to_string(),
                    path,
                    source,
                });
            }
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                })
            })
            .collect()
    }

    fn value_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        self.path_with_ext(key, VALUE_EXT)
    }

    fn path_with_ext(&self, key: &str, ext: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.{ext}")))
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.split('/').all(validate_segment) {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn validate_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.ends_with(TMP_SUFFIX)
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

fn write_atomic(key: &str, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Write {
            key: key.to_string(),
            path,
            source,
        }
    };
    ensure_parent(path).map_err(write_err(path))?;

    // Unique per writer so concurrent persists of one key never share a temp file.
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("value");
    let tmp_path = path.with_file_name(format!(
        ".{file_name}.{}{TMP_SUFFIX}",
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        sync_dir(path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.map_err(write_err(path))
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => File::open(parent)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
