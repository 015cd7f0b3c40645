//! In-process sink with the same key semantics as the database table.
//!
//! Used for `--dry-run` and by the test suite. Failures can be scripted
//! with [`MemorySink::fail_next`] and writes can be slowed down with
//! [`MemorySink::with_latency`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{PersistError, PersistenceSink};
use crate::types::NewsEvent;

#[derive(Default)]
pub struct MemorySink {
    rows: DashMap<i64, NewsEvent>,
    /// ids in commit order
    order: Mutex<Vec<i64>>,
    scripted_failures: Mutex<VecDeque<PersistError>>,
    latency: Option<Duration>,
    attempts: AtomicUsize,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every insert sleeps for `latency` before committing.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Pre-populate a row, e.g. to provoke a duplicate key.
    pub fn seed(&self, event: NewsEvent) {
        self.order.lock().push(event.id);
        self.rows.insert(event.id, event);
    }

    /// The next insert attempt fails with `error` (queued in call order).
    pub fn fail_next(&self, error: PersistError) {
        self.scripted_failures.lock().push_back(error);
    }

    pub fn fetch(&self, id: i64) -> Option<NewsEvent> {
        self.rows.get(&id).map(|row| row.value().clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stored ids in the order they were committed
    pub fn ids(&self) -> Vec<i64> {
        self.order.lock().clone()
    }

    /// Number of `persist` calls, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn persist(&self, event: &NewsEvent) -> Result<(), PersistError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if self.is_closed() {
            return Err(PersistError::Unavailable("sink closed".into()));
        }
        let scripted = self.scripted_failures.lock().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.rows.entry(event.id) {
            Entry::Occupied(_) => Err(PersistError::DuplicateKey(format!(
                "id {} already stored",
                event.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                self.order.lock().push(event.id);
                Ok(())
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
