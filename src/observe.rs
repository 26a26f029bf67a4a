//! Observability events. Every failure class is logged and counted here.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, error, warn};

/// Which polling lane an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    PendingIntake,
    Inbox,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingIntake => write!(f, "pending-intake"),
            Self::Inbox => write!(f, "inbox"),
        }
    }
}

/// A notable pipeline/lane occurrence.
#[derive(Debug)]
pub enum Event<'a> {
    /// MessageSource call failed or timed out.
    TransientSource { lane: Lane, error: &'a str },
    /// CompletionService failed; no draft this cycle.
    Completion { thread_id: &'a str, error: &'a str },
    /// Operational store write failed; message not sent.
    StoreWrite { message_id: &'a str, error: &'a str },
    /// Dashboard mirror failed while the operational write succeeded.
    DegradedWrite { message_id: &'a str, error: &'a str },
    /// A thread pipeline failed for any other reason.
    ThreadFailed { thread_id: &'a str, error: &'a str },
    /// A draft-time conflict (operator race).
    Conflict { thread_id: &'a str },
}

/// Snapshot of the counters, served on the admin health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub transient_source_errors: u64,
    pub completion_errors: u64,
    pub store_write_errors: u64,
    pub degraded_writes: u64,
    pub thread_failures: u64,
    pub conflicts: u64,
    pub replies_sent: u64,
}

/// Logs events with structured fields and keeps running totals.
#[derive(Debug, Default)]
pub struct Observer {
    transient_source_errors: AtomicU64,
    completion_errors: AtomicU64,
    store_write_errors: AtomicU64,
    degraded_writes: AtomicU64,
    thread_failures: AtomicU64,
    conflicts: AtomicU64,
    replies_sent: AtomicU64,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: Event<'_>) {
        match event {
            Event::TransientSource { lane, error } => {
                self.transient_source_errors.fetch_add(1, Ordering::Relaxed);
                warn!(lane = %lane, error, "Transient source error, backing off");
            }
            Event::Completion { thread_id, error } => {
                self.completion_errors.fetch_add(1, Ordering::Relaxed);
                warn!(thread_id, error, "Completion failed, thread retried next cycle");
            }
            Event::StoreWrite { message_id, error } => {
                self.store_write_errors.fetch_add(1, Ordering::Relaxed);
                error!(message_id, error, "Operational store write failed, message not sent");
            }
            Event::DegradedWrite { message_id, error } => {
                self.degraded_writes.fetch_add(1, Ordering::Relaxed);
                warn!(message_id, error, "Dashboard write failed (degraded)");
            }
            Event::ThreadFailed { thread_id, error } => {
                self.thread_failures.fetch_add(1, Ordering::Relaxed);
                error!(thread_id, error, "Thread pipeline failed");
            }
            Event::Conflict { thread_id } => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(thread_id, "Draft already outstanding");
            }
        }
    }

    pub fn reply_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Counters {
        Counters {
            transient_source_errors: self.transient_source_errors.load(Ordering::Relaxed),
            completion_errors: self.completion_errors.load(Ordering::Relaxed),
            store_write_errors: self.store_write_errors.load(Ordering::Relaxed),
            degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
            thread_failures: self.thread_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_counted() {
        let obs = Observer::new();
        obs.emit(Event::TransientSource {
            lane: Lane::Inbox,
            error: "timeout",
        });
        obs.emit(Event::DegradedWrite {
            message_id: "m1",
            error: "dashboard down",
        });
        obs.emit(Event::DegradedWrite {
            message_id: "m2",
            error: "dashboard down",
        });
        obs.reply_sent();

        let c = obs.snapshot();
        assert_eq!(c.transient_source_errors, 1);
        assert_eq!(c.degraded_writes, 2);
        assert_eq!(c.replies_sent, 1);
        assert_eq!(c.store_write_errors, 0);
    }

    #[test]
    fn lane_display() {
        assert_eq!(Lane::PendingIntake.to_string(), "pending-intake");
        assert_eq!(Lane::Inbox.to_string(), "inbox");
    }
}
