//! Process-wide counters
//!
//! The only global state besides the logger: a registry of atomic
//! counters bumped on the hot paths and exposed as a snapshot on the
//! debug endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug)]
pub struct Counters {
    /// SMTP + POP3 connections accepted.
    pub connections_opened: AtomicU64,
    /// Connections refused at the session cap.
    pub connections_rejected: AtomicU64,
    /// Messages stored via the delivery path.
    pub messages_received: AtomicU64,
    /// Messages removed (explicit delete, cap trim, purge, sweep).
    pub messages_removed: AtomicU64,
    /// Hub events lost to the slow-subscriber policy.
    pub hub_dropped: AtomicU64,
}

static COUNTERS: Counters = Counters {
    connections_opened: AtomicU64::new(0),
    connections_rejected: AtomicU64::new(0),
    messages_received: AtomicU64::new(0),
    messages_removed: AtomicU64::new(0),
    hub_dropped: AtomicU64::new(0),
};

/// The process-wide counter registry.
#[must_use]
pub fn counters() -> &'static Counters {
    &COUNTERS
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub connections_opened: u64,
    pub connections_rejected: u64,
    pub messages_received: u64,
    pub messages_removed: u64,
    pub hub_dropped: u64,
}

#[must_use]
pub fn snapshot() -> Snapshot {
    Snapshot {
        connections_opened: COUNTERS.connections_opened.load(Ordering::Relaxed),
        connections_rejected: COUNTERS.connections_rejected.load(Ordering::Relaxed),
        messages_received: COUNTERS.messages_received.load(Ordering::Relaxed),
        messages_removed: COUNTERS.messages_removed.load(Ordering::Relaxed),
        hub_dropped: COUNTERS.hub_dropped.load(Ordering::Relaxed),
    }
}
