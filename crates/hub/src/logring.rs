// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fixed-capacity in-memory ring of executor lifecycle events.
//!
//! Timestamps are wall-clock microseconds forced strictly increasing, so
//! `logs_since` gives a stable cursor even when several events land within
//! the same microsecond.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One entry in the executor log ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic microsecond timestamp; unique within this ring.
    pub ts: u64,
    pub executor_id: String,
    /// `connected`, `disconnected`, `upgrading`, `rpc_error`, or `log`.
    pub kind: String,
    pub message: String,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    last_ts: u64,
}

/// Ring of recent executor events served by `/api/executors/logs`.
pub struct LogRing {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: VecDeque::with_capacity(capacity), last_ts: 0 }),
            capacity,
        }
    }

    /// Append an event, evicting the oldest entry when full.
    pub fn push(&self, executor_id: &str, kind: &str, message: impl Into<String>) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        let mut inner = self.inner.lock();
        let ts = now.max(inner.last_ts + 1);
        inner.last_ts = ts;
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            ts,
            executor_id: executor_id.to_owned(),
            kind: kind.to_owned(),
            message: message.into(),
        });
    }

    /// Entries with timestamp strictly greater than `since` (0 for all).
    pub fn logs_since(&self, since: u64) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        inner.entries.iter().filter(|e| e.ts > since).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "logring_tests.rs"]
mod tests;
