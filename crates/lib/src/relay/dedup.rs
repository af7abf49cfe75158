//! Recently processed message ids, to absorb webhook redelivery.
//!
//! Check-and-mark is atomic per id under one lock: the first caller for an id gets `true`
//! and the record turns `Pending`; everyone else gets `false` until an outcome is recorded.
//! `Failed` ids may be processed again, `Delivered` ids may not. Settled records older than
//! the retention window are forgotten; pending ones are kept until their outcome is recorded.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Processing state of one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Delivered,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Delivered => "delivered",
            Outcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRecord {
    pub message_id: String,
    pub outcome: Outcome,
    pub last_attempt_at: Instant,
}

/// Shared record map with time- and count-based eviction.
pub struct Deduplicator {
    retention: Duration,
    max_entries: usize,
    records: Mutex<HashMap<String, ProcessingRecord>>,
}

impl Deduplicator {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            retention,
            max_entries: max_entries.max(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ProcessingRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True when the caller should process `message_id` (and it is now marked `Pending`).
    pub fn should_process(&self, message_id: &str) -> bool {
        self.should_process_at(message_id, Instant::now())
    }

    pub(crate) fn should_process_at(&self, message_id: &str, now: Instant) -> bool {
        let mut records = self.records();
        let retention = self.retention;
        // A pending id is still owned by its processing unit, however long that takes.
        records.retain(|_, r| {
            r.outcome == Outcome::Pending
                || now.saturating_duration_since(r.last_attempt_at) < retention
        });
        match records.get(message_id).map(|r| r.outcome) {
            Some(Outcome::Delivered) | Some(Outcome::Pending) => false,
            Some(Outcome::Failed) | None => {
                records.insert(
                    message_id.to_string(),
                    ProcessingRecord {
                        message_id: message_id.to_string(),
                        outcome: Outcome::Pending,
                        last_attempt_at: now,
                    },
                );
                self.evict_overflow(&mut records);
                true
            }
        }
    }

    /// Record the terminal outcome of a processing attempt.
    pub fn record_outcome(&self, message_id: &str, outcome: Outcome) {
        self.record_outcome_at(message_id, outcome, Instant::now());
    }

    pub(crate) fn record_outcome_at(&self, message_id: &str, outcome: Outcome, now: Instant) {
        let mut records = self.records();
        records.insert(
            message_id.to_string(),
            ProcessingRecord {
                message_id: message_id.to_string(),
                outcome,
                last_attempt_at: now,
            },
        );
        self.evict_overflow(&mut records);
    }

    /// Drop oldest settled records beyond `max_entries`; pending ones are never evicted.
    fn evict_overflow(&self, records: &mut HashMap<String, ProcessingRecord>) {
        while records.len() > self.max_entries {
            let oldest = records
                .values()
                .filter(|r| r.outcome != Outcome::Pending)
                .min_by_key(|r| r.last_attempt_at)
                .map(|r| r.message_id.clone());
            match oldest {
                Some(id) => {
                    records.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn get(&self, message_id: &str) -> Option<ProcessingRecord> {
        self.records().get(message_id).cloned()
    }

    /// Number of tracked ids (pending and settled).
    pub(crate) fn len(&self) -> usize {
        self.records().len()
    }
}
