//! Session lifecycle (C3): directory layout, format auto-detect, and the
//! single-writer-per-session rule. Grounded on `config.rs`'s path-resolution
//! style, generalized from `incidents.rs`'s SQLite-backed persistence to the
//! plain-directory layout the store contract requires.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{framed, textual, SessionMetadata, SessionStore};
use crate::error::ManagerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderKind {
    Framed,
    Textual,
}

fn resolve_format(name: &str) -> Result<EncoderKind, ManagerError> {
    match name {
        "binary" | "framed" | "protobuf" | "pb" | "proto" => Ok(EncoderKind::Framed),
        "jsonl" | "json" | "lines" => Ok(EncoderKind::Textual),
        other => Err(ManagerError::InvalidFormat(other.to_string())),
    }
}

/// RAII handle: dropping it releases the session's write lock so a
/// subsequent `delete` can proceed.
pub struct WriterGuard {
    id: String,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let id = self.id.clone();
        let locks = self.locks.clone();
        tokio::spawn(async move {
            locks.lock().await.remove(&id);
        });
    }
}

pub struct SessionManager {
    base_dir: PathBuf,
    open_writers: Arc<Mutex<HashSet<String>>>,
}

impl SessionManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            open_writers: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    /// Enumerates immediate subdirectories, skipping any whose metadata
    /// fails to load (possibly stale).
    pub async fn list(&self) -> Vec<SessionMetadata> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(_) => return out,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let metadata_path = entry.path().join("metadata.json");
            if let Ok(contents) = tokio::fs::read_to_string(&metadata_path).await {
                if let Ok(metadata) = serde_json::from_str::<SessionMetadata>(&contents) {
                    out.push(metadata);
                }
            }
        }
        out
    }

    pub async fn create(
        &self,
        id: &str,
        format: &str,
        origin: String,
        start_time: u64,
    ) -> Result<(Box<dyn SessionStore>, WriterGuard), ManagerError> {
        let encoder = resolve_format(format)?;
        let dir = self.session_dir(id);
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => ManagerError::AlreadyExists,
                _ => ManagerError::Io(e),
            })?;

        let metadata = SessionMetadata {
            id: id.to_string(),
            start_time,
            end_time: None,
            origin,
            event_count: 0,
        };
        let metadata_json = serde_json::to_string_pretty(&metadata)
            .expect("SessionMetadata always serializes");
        tokio::fs::write(dir.join("metadata.json"), metadata_json).await?;

        let store: Box<dyn SessionStore> = match encoder {
            EncoderKind::Framed => Box::new(
                framed::FramedStore::create(dir.join(format!("events.{}", framed::EXTENSION)))
                    .await
                    .map_err(|_| ManagerError::InvalidFormat(format.to_string()))?,
            ),
            EncoderKind::Textual => Box::new(
                textual::TextualStore::create(dir.join(format!("events.{}", textual::EXTENSION)))
                    .await
                    .map_err(|_| ManagerError::InvalidFormat(format.to_string()))?,
            ),
        };

        self.open_writers.lock().await.insert(id.to_string());
        let guard = WriterGuard {
            id: id.to_string(),
            locks: self.open_writers.clone(),
        };
        Ok((store, guard))
    }

    pub async fn open(&self, id: &str) -> Result<Box<dyn SessionStore>, ManagerError> {
        let dir = self.session_dir(id);
        let framed_path = dir.join(format!("events.{}", framed::EXTENSION));
        let textual_path = dir.join(format!("events.{}", textual::EXTENSION));

        if tokio::fs::metadata(&framed_path).await.is_ok() {
            return Ok(Box::new(
                framed::FramedStore::open(framed_path)
                    .await
                    .map_err(|e| ManagerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
            ));
        }
        if tokio::fs::metadata(&textual_path).await.is_ok() {
            return Ok(Box::new(
                textual::TextualStore::open(textual_path)
                    .await
                    .map_err(|e| ManagerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
            ));
        }
        Err(ManagerError::NotFound)
    }

    /// Loads a single session's metadata without touching its event data.
    pub async fn metadata(&self, id: &str) -> Result<SessionMetadata, ManagerError> {
        let metadata_path = self.session_dir(id).join("metadata.json");
        let contents = tokio::fs::read_to_string(&metadata_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ManagerError::NotFound,
                _ => ManagerError::Io(e),
            })?;
        serde_json::from_str(&contents)
            .map_err(|e| ManagerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    /// Rewrites `metadata.json` with a closing end-time and event count, as
    /// the orchestrator does on the Draining -> Stopped transition. Not part
    /// of the `SessionStore` contract: metadata is the manager's concern,
    /// not the encoder's.
    pub async fn finalize(
        &self,
        id: &str,
        end_time: u64,
        event_count: u64,
    ) -> Result<(), ManagerError> {
        let metadata_path = self.session_dir(id).join("metadata.json");
        let contents = tokio::fs::read_to_string(&metadata_path).await?;
        let mut metadata: SessionMetadata = serde_json::from_str(&contents)
            .map_err(|e| ManagerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        metadata.end_time = Some(end_time);
        metadata.event_count = event_count;
        let json = serde_json::to_string_pretty(&metadata)
            .expect("SessionMetadata always serializes");
        tokio::fs::write(&metadata_path, json).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), ManagerError> {
        if self.open_writers.lock().await.contains(id) {
            return Err(ManagerError::InUse);
        }
        let dir = self.session_dir(id);
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }
}
