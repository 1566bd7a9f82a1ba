//! File storage — one JSON record per session under a directory.
//!
//! Storage location: `~/.cortex/sessions/<session>.json`
//!
//! Writes go to a temporary file in the same directory which is synced and
//! then renamed over the record, so a crash leaves either the old record or
//! the new one. Session ids are percent-encoded into file names.

use async_trait::async_trait;
use cortex_core::SessionStorage;
use cortex_core::error::MemoryError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const EXTENSION: &str = "json";

pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "File session storage");
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{EXTENSION}", encode_file_name(session_id)))
    }
}

fn storage_err(action: &str, path: &Path, e: std::io::Error) -> MemoryError {
    MemoryError::Storage(format!("Failed to {action} {}: {e}", path.display()))
}

#[async_trait]
impl SessionStorage for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    async fn read(&self, session_id: &str) -> Result<Option<String>, MemoryError> {
        let path = self.record_path(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("read", &path, e)),
        }
    }

    async fn write(&self, session_id: &str, record: &str) -> Result<(), MemoryError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_err("create", &self.dir, e))?;

        let path = self.record_path(session_id);
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| storage_err("create", &tmp, e))?;
        file.write_all(record.as_bytes())
            .await
            .map_err(|e| storage_err("write", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_err("sync", &tmp, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(storage_err("replace", &path, e));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, MemoryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(storage_err("list", &self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("list", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match decode_file_name(stem) {
                Some(id) => ids.push(id),
                None => warn!(file = %path.display(), "Skipping unrecognized session file"),
            }
        }
        Ok(ids)
    }
}

/// Keep `[A-Za-z0-9_-]`, percent-encode every other byte.
fn encode_file_name(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
