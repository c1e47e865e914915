//! Length-prefixed binary encoder (the "framed" format). Primary encoder:
//! lower per-event overhead and cheap batch writes.
//!
//! Wire shape, little-endian throughout:
//!   single event:  [u32 length][length bytes of a JSON-encoded `Event`]
//!   batch:         [u32 0xFFFFFFFF][u32 length][length bytes of a JSON array]
//!
//! A reader dispatches purely on the leading u32; a writer MAY always emit
//! single-event frames.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{ScanFilter, ScanOutcome, SessionStore};
use crate::error::CoreError;
use std::collections::HashSet;
use taskscope_wire::Event;

const BATCH_SENTINEL: u32 = 0xFFFF_FFFF;
pub const EXTENSION: &str = "bin";

pub struct FramedStore {
    path: PathBuf,
    file: Mutex<File>,
    count: AtomicU64,
}

impl FramedStore {
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

    /// Open an existing store, recovering `event_count` by a header-less
    /// scan that descends into batch frames and counts inner entries.
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
        let mut reader = File::open(path).await?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        Ok(decode_stream(&bytes, filter))
    }
}

fn decode_stream(bytes: &[u8], filter: &ScanFilter) -> ScanOutcome {
    let mut events = Vec::new();
    let mut offset = 0usize;
    let len = bytes.len();
    let truncation = loop {
        if offset == len {
            break None;
        }
        if offset + 4 > len {
            break Some(CoreError::parse(offset as u64, "truncated length prefix"));
        }
        let leading = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        if leading == BATCH_SENTINEL {
            if offset + 8 > len {
                break Some(CoreError::parse(offset as u64, "truncated batch header"));
            }
            let batch_len =
                u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let start = offset + 8;
            if start + batch_len > len {
                break Some(CoreError::parse(offset as u64, "truncated batch body"));
            }
            match serde_json::from_slice::<Vec<Event>>(&bytes[start..start + batch_len]) {
                Ok(batch) => events.extend(batch.into_iter().filter(|e| filter.matches(e))),
                Err(_) => {
                    break Some(CoreError::parse(offset as u64, "malformed batch record"))
                }
            }
            offset = start + batch_len;
        } else {
            let record_len = leading as usize;
            let start = offset + 4;
            if start + record_len > len {
                break Some(CoreError::parse(offset as u64, "truncated single record"));
            }
            match serde_json::from_slice::<Event>(&bytes[start..start + record_len]) {
                Ok(event) => {
                    if filter.matches(&event) {
                        events.push(event);
                    }
                }
                Err(_) => {
                    break Some(CoreError::parse(offset as u64, "malformed single record"))
                }
            }
            offset = start + record_len;
        }
    };
    ScanOutcome { events, truncation }
}

#[async_trait]
impl SessionStore for FramedStore {
    async fn append_one(&self, event: &Event) -> Result<(), CoreError> {
        let body = serde_json::to_vec(event)
            .map_err(|e| CoreError::protocol(format!("encode failure: {e}")))?;
        let mut file = self.file.lock().await;
        file.write_all(&(body.len() as u32).to_le_bytes()).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_batch(&self, events: &[Event]) -> Result<(), CoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(events)
            .map_err(|e| CoreError::protocol(format!("encode failure: {e}")))?;
        let mut file = self.file.lock().await;
        file.write_all(&BATCH_SENTINEL.to_le_bytes()).await?;
        file.write_all(&(body.len() as u32).to_le_bytes()).await?;
        file.write_all(&body).await?;
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

    fn sample(task_id: u32, kind: Kind, timestamp: u64) -> Event {
        Event {
            timestamp,
            kind: kind as u32,
            probe_duration_ns: 1,
            task_id,
            parent_task_id: 0,
            attributes: [0; 5],
        }
    }

    #[tokio::test]
    async fn round_trips_single_events() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).unwrap();
        let store = FramedStore::create(file.path().to_path_buf()).await.unwrap();
        store
            .append_one(&sample(1, Kind::NewTask, 10))
            .await
            .unwrap();
        store
            .append_one(&sample(1, Kind::TaskExit, 20))
            .await
            .unwrap();
        store.close().await.unwrap();

        let reopened = FramedStore::open(file.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.event_count(), 2);
        let outcome = reopened.scan(&ScanFilter::default()).await.unwrap();
        assert!(outcome.truncation.is_none());
        assert_eq!(outcome.events.len(), 2);
    }

    #[tokio::test]
    async fn batch_append_is_counted_as_one_flush() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).unwrap();
        let store = FramedStore::create(file.path().to_path_buf()).await.unwrap();
        let batch = vec![
            sample(2, Kind::NewHeapObject, 1),
            sample(2, Kind::NewHeapObject, 2),
            sample(3, Kind::NewHeapObject, 3),
        ];
        store.append_batch(&batch).await.unwrap();
        assert_eq!(store.event_count(), 3);

        let ids = store.unique_task_ids().await.unwrap();
        assert_eq!(ids, [2, 3].into_iter().collect());
    }

    #[tokio::test]
    async fn truncated_tail_is_reported_without_losing_earlier_records() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).unwrap();
        {
            let store = FramedStore::create(file.path().to_path_buf()).await.unwrap();
            store
                .append_one(&sample(1, Kind::NewTask, 10))
                .await
                .unwrap();
            store.close().await.unwrap();
        }
        // Append a truncated trailing length prefix directly.
        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new()
                .append(true)
                .open(file.path())
                .unwrap();
            raw.write_all(&[0xAAu8, 0x00, 0x00]).unwrap();
        }
        let store = FramedStore::open(file.path().to_path_buf()).await.unwrap();
        let outcome = store.scan(&ScanFilter::default()).await.unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.truncation.is_some());
    }

    #[tokio::test]
    async fn filter_by_task_id_and_kind() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).unwrap();
        let store = FramedStore::create(file.path().to_path_buf()).await.unwrap();
        store
            .append_batch(&[
                sample(1, Kind::NewTask, 1),
                sample(2, Kind::NewTask, 2),
                sample(1, Kind::TaskExit, 3),
            ])
            .await
            .unwrap();
        let filter = ScanFilter {
            task_id: Some(1),
            kind: Some(Kind::NewTask),
            ..Default::default()
        };
        let outcome = store.scan(&filter).await.unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].timestamp, 1);
    }
}
