//! Newline-delimited textual encoder, grounded on `cognitod`'s
//! `JsonlHandler` (append-only `tokio::fs::File`, one JSON object per line).
//! Favored over the framed encoder for diagnosability; every line is
//! independently human-readable.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::{ScanFilter, ScanOutcome, SessionStore};
use crate::error::CoreError;
use taskscope_wire::Event;

pub const EXTENSION: &str = "jsonl";

/// Named fields on the wire. Unknown fields are ignored on read by virtue of
/// serde's default behavior (no `deny_unknown_fields`).
#[derive(Debug, Serialize, Deserialize)]
struct TextualRecord {
    timestamp: u64,
    event_type: u32,
    goroutine: u32,
    parent_goroutine: u32,
    attributes: [u64; 5],
    #[serde(default)]
    probe_duration_ns: u32,
}

impl From<&Event> for TextualRecord {
    fn from(event: &Event) -> Self {
        TextualRecord {
            timestamp: event.timestamp,
            event_type: event.kind,
            goroutine: event.task_id,
            parent_goroutine: event.parent_task_id,
            attributes: event.attributes,
            probe_duration_ns: event.probe_duration_ns,
        }
    }
}

impl From<TextualRecord> for Event {
    fn from(record: TextualRecord) -> Self {
        Event {
            timestamp: record.timestamp,
            kind: record.event_type,
            probe_duration_ns: record.probe_duration_ns,
            task_id: record.goroutine,
            parent_task_id: record.parent_goroutine,
            attributes: record.attributes,
        }
    }
}

pub struct TextualStore {
    path: PathBuf,
    file: Mutex<File>,
    count: AtomicU64,
}

impl TextualStore {
    pub async fn create(path: PathBuf) -> Result<Self, CoreError> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            count: AtomicU64::new(0),
        })
    }

    pub async fn open(path: PathBuf) -> Result<Self, CoreError> {
        let outcome = Self::scan_file(&path, &ScanFilter::default()).await?;
        let file = OpenOptions::new().append(true).open(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            count: AtomicU64::new(outcome.events.len() as u64),
        })
    }

    async fn scan_file(path: &PathBuf, filter: &ScanFilter) -> Result<ScanOutcome, CoreError> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        let mut byte_offset: u64 = 0;
        let mut truncation = None;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    truncation = Some(CoreError::parse(
                        byte_offset,
                        format!("line read failure: {e}"),
                    ));
                    break;
                }
            };
            if line.trim().is_empty() {
                byte_offset += line.len() as u64 + 1;
                continue;
            }
            match serde_json::from_str::<TextualRecord>(&line) {
                Ok(record) => {
                    let event: Event = record.into();
                    if filter.matches(&event) {
                        events.push(event);
                    }
                }
                Err(e) => {
                    truncation = Some(CoreError::parse(
                        byte_offset,
                        format!("malformed textual line: {e}"),
                    ));
                    break;
                }
            }
            byte_offset += line.len() as u64 + 1;
        }
        Ok(ScanOutcome { events, truncation })
    }
}

#[async_trait]
impl SessionStore for TextualStore {
    async fn append_one(&self, event: &Event) -> Result<(), CoreError> {
        let line = serde_json::to_string(&TextualRecord::from(event))
            .map_err(|e| CoreError::protocol(format!("encode failure: {e}")))?;
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_batch(&self, events: &[Event]) -> Result<(), CoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for event in events {
            let line = serde_json::to_string(&TextualRecord::from(event))
                .map_err(|e| CoreError::protocol(format!("encode failure: {e}")))?;
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        self.count.fetch_add(events.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<ScanOutcome, CoreError> {
        let outcome = Self::scan_file(&self.path, filter).await?;
        let events = filter.paginate(outcome.events);
        Ok(ScanOutcome {
            events,
            truncation: outcome.truncation,
        })
    }

    async fn unique_task_ids(&self) -> Result<HashSet<u32>, CoreError> {
        let outcome = Self::scan_file(&self.path, &ScanFilter::default()).await?;
        Ok(outcome.events.iter().map(|e| e.task_id).collect())
    }

    fn event_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), CoreError> {
        let file = self.file.lock().await;
        file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskscope_wire::Kind;

    fn sample(task_id: u32, timestamp: u64) -> Event {
        Event {
            timestamp,
            kind: Kind::NewTask as u32,
            probe_duration_ns: 7,
            task_id,
            parent_task_id: 0,
            attributes: [1, 2, 0, 0, 0],
        }
    }

    #[tokio::test]
    async fn round_trips_and_ignores_unknown_fields() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).unwrap();
        let store = TextualStore::create(file.path().to_path_buf()).await.unwrap();
        store.append_one(&sample(5, 100)).await.unwrap();
        store.close().await.unwrap();

        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new()
                .append(true)
                .open(file.path())
                .unwrap();
            writeln!(
                raw,
                r#"{{"timestamp":200,"event_type":4,"goroutine":6,"parent_goroutine":5,"attributes":[0,0,0,0,0],"future_field":"ignored"}}"#
            )
            .unwrap();
        }

        let reopened = TextualStore::open(file.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.event_count(), 2);
        let outcome = reopened.scan(&ScanFilter::default()).await.unwrap();
        assert!(outcome.truncation.is_none());
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[1].task_id, 6);
    }

    #[tokio::test]
    async fn malformed_line_reports_truncation_but_keeps_earlier_events() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).unwrap();
        let store = TextualStore::create(file.path().to_path_buf()).await.unwrap();
        store.append_one(&sample(1, 1)).await.unwrap();
        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new()
                .append(true)
                .open(file.path())
                .unwrap();
            writeln!(raw, "{{not json").unwrap();
        }
        let outcome = store.scan(&ScanFilter::default()).await.unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.truncation.is_some());
    }
}
