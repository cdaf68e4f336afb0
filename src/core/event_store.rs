//! Append-only event store over the storage layer.
//!
//! Events for a run live in the workspace's `events` table under the key
//! `run:<run_id>`, one sub-key per sequence number (zero-padded so
//! lexicographic order is sequence order). A per-run counter key makes
//! sequence assignment explicit; event row and counter are committed in one
//! storage transaction, so either both land or neither does.
//!
//! Appends to the same run are serialized by a per-run async lock; appends
//! to different runs proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Event, EventType};
use crate::storage::{codec, StorageError, StorageManager};

const TABLE: &str = "events";

fn run_key(run_id: Uuid) -> String {
    format!("run:{}", run_id)
}

fn counter_key(run_id: Uuid) -> String {
    format!("run:{}:seq", run_id)
}

fn sequence_sub_key(sequence: u64) -> String {
    format!("{:010}", sequence)
}

/// Append-only, per-run event log.
pub struct EventStore {
    storage: Arc<StorageManager>,
    run_locks: StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl EventStore {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            storage,
            run_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn run_lock(&self, run_id: Uuid) -> Result<Arc<AsyncMutex<()>>, StorageError> {
        let mut locks = self
            .run_locks
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(Arc::clone(
            locks.entry(run_id).or_insert_with(Default::default),
        ))
    }

    /// Append an event, assigning the next sequence number for the run.
    ///
    /// Sequence numbers start at 1 and are gap-free per run. The event and
    /// the run's counter commit together.
    pub async fn append(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Event, StorageError> {
        let lock = self.run_lock(run_id)?;
        let _guard = lock.lock().await;

        let sequence = self.last_sequence(run_id)? + 1;
        let event = Event {
            run_id,
            sequence,
            event_type,
            payload,
            timestamp: Utc::now(),
        };

        self.storage.put_many(
            TABLE,
            &[
                (
                    run_key(run_id),
                    sequence_sub_key(sequence),
                    codec::encode_json(&event)?,
                ),
                (
                    counter_key(run_id),
                    String::new(),
                    codec::encode_json(&sequence)?,
                ),
            ],
        )?;

        // A terminal event ends the run's sequence; drop the lock entry so
        // a long-lived process does not hold one mutex per finished run.
        if event_type.is_terminal() {
            self.run_locks
                .lock()
                .map_err(|_| StorageError::LockPoisoned)?
                .remove(&run_id);
        }

        Ok(event)
    }

    /// The highest sequence number appended for a run (0 when none).
    pub fn last_sequence(&self, run_id: Uuid) -> Result<u64, StorageError> {
        let counter: Option<u64> = self.storage.get_json(TABLE, &counter_key(run_id))?;
        Ok(counter.unwrap_or(0))
    }

    /// All events for a run, in sequence order.
    ///
    /// An undecodable event is logged as a data-integrity warning and
    /// skipped rather than aborting the read.
    pub fn get_events(&self, run_id: Uuid) -> Result<Vec<Event>, StorageError> {
        let entries = self.storage.list_sub(TABLE, &run_key(run_id))?;

        let mut events = Vec::with_capacity(entries.len());
        for (sub_key, bytes) in entries {
            match codec::decode_json::<Event>(&sub_key, &bytes) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(%run_id, sub_key, error = %e, "skipping undecodable event");
                }
            }
        }
        Ok(events)
    }

    /// Run IDs that have at least one event.
    pub fn list_run_ids(&self) -> Result<Vec<Uuid>, StorageError> {
        let mut ids = Vec::new();
        for k in self.storage.list_keys(TABLE, "run:")? {
            if let Some(id) = k
                .strip_prefix("run:")
                .filter(|rest| !rest.contains(':'))
                .and_then(|rest| Uuid::parse_str(rest).ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> EventStore {
        let storage = Arc::new(StorageManager::open_at(&dir.path().join("ws"), "ws").unwrap());
        EventStore::new(storage)
    }

    #[tokio::test]
    async fn test_sequences_start_at_one_and_increase() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let run_id = Uuid::new_v4();

        for expected in 1..=5u64 {
            let event = store
                .append(run_id, EventType::StepStarted, json!({"step_key": "s"}))
                .await
                .unwrap();
            assert_eq!(event.sequence, expected);
        }

        let events = store.get_events(run_id).unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_runs_do_not_share_sequences() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        store
            .append(run_a, EventType::RunCreated, json!({}))
            .await
            .unwrap();
        store
            .append(run_a, EventType::RunCompleted, json!({}))
            .await
            .unwrap();
        let b = store
            .append(run_b, EventType::RunCreated, json!({}))
            .await
            .unwrap();

        assert_eq!(b.sequence, 1);
        assert_eq!(store.last_sequence(run_a).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_gap_free() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(test_store(&dir));
        let runs: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        let mut handles = Vec::new();
        for &run_id in &runs {
            for _ in 0..10 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    store
                        .append(run_id, EventType::StepStarted, json!({}))
                        .await
                        .unwrap();
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for &run_id in &runs {
            let sequences: Vec<u64> = store
                .get_events(run_id)
                .unwrap()
                .iter()
                .map(|e| e.sequence)
                .collect();
            assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());
        }
    }

    #[tokio::test]
    async fn test_terminal_event_releases_run_lock() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let run_id = Uuid::new_v4();

        store.append(run_id, EventType::RunCreated, json!({})).await.unwrap();
        assert!(store.run_locks.lock().unwrap().contains_key(&run_id));

        store.append(run_id, EventType::RunCompleted, json!({})).await.unwrap();
        assert!(!store.run_locks.lock().unwrap().contains_key(&run_id));

        // The persisted counter survives the pruned lock entry.
        let event = store
            .append(run_id, EventType::RunCreated, json!({}))
            .await
            .unwrap();
        assert_eq!(event.sequence, 3);
    }

    #[tokio::test]
    async fn test_list_run_ids() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        store.append(run_a, EventType::RunCreated, json!({})).await.unwrap();
        store.append(run_b, EventType::RunCreated, json!({})).await.unwrap();

        let mut ids = store.list_run_ids().unwrap();
        ids.sort();
        let mut expected = vec![run_a, run_b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
