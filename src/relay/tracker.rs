//! In-flight relay tracking
//!
//! Keeps the set of requests currently being relayed and the outcome
//! counters reported at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::types::{CorrelationId, WorkRequest};

/// A request whose outbound call has not settled yet
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Correlation token
    pub id: CorrelationId,

    /// When the dispatch started
    pub started_at: Instant,
}

/// Tracks in-flight relays and outcome counts.
///
/// Entries are keyed by a local sequence number since the coordinator may
/// reuse correlation tokens.
#[derive(Debug, Default)]
pub struct RelayTracker {
    in_flight: RwLock<HashMap<u64, InFlight>>,
    next_seq: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl RelayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a dispatch; returns its sequence number
    pub fn begin(&self, request: &WorkRequest) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.in_flight.write().insert(
            seq,
            InFlight {
                id: request.id.clone(),
                started_at: Instant::now(),
            },
        );
        seq
    }

    /// Record the outcome of a dispatch; returns how long it ran
    pub fn finish(&self, seq: u64, success: bool) -> Option<Duration> {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.in_flight
            .write()
            .remove(&seq)
            .map(|entry| entry.started_at.elapsed())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.read().len()
    }

    /// Correlation tokens of unsettled requests, oldest first
    pub fn in_flight_ids(&self) -> Vec<CorrelationId> {
        let guard = self.in_flight.read();
        let mut entries: Vec<(&u64, &InFlight)> = guard.iter().collect();
        entries.sort_by_key(|(seq, _)| **seq);
        entries.into_iter().map(|(_, entry)| entry.id.clone()).collect()
    }

    pub fn dispatched_count(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    pub fn succeeded_count(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
