//! Operational record and dashboard mirror traits.
//!
//! The operational store is the source of truth the pipeline reads back
//! (context, pending replies, sent flags). The dashboard store is a
//! best-effort mirror used for stats and history; losing a write there
//! never blocks a reply.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{Author, Message, PendingReply, ReplyState, Thread, ThreadStatus};

/// Operational persistence: threads, messages and pending replies.
#[async_trait]
pub trait OperationalStore: Send + Sync {
    // ── Threads ─────────────────────────────────────────────────────

    /// Insert or refresh a thread. Username is only overwritten when the
    /// incoming value is present; status is left alone for known threads.
    async fn upsert_thread(&self, thread: &Thread) -> Result<(), DatabaseError>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, DatabaseError>;

    async fn set_thread_status(
        &self,
        thread_id: &str,
        status: ThreadStatus,
    ) -> Result<(), DatabaseError>;

    async fn touch_thread(&self, thread_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message if its id is new. Returns `true` when a row was
    /// created; an existing record is never modified.
    async fn upsert_message(&self, message: &Message) -> Result<bool, DatabaseError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, DatabaseError>;

    /// Set `sent` on the given messages.
    async fn mark_sent(&self, message_ids: &[String]) -> Result<(), DatabaseError>;

    /// The newest `limit` context-eligible messages of a thread, oldest
    /// first. Overridden bot messages that were never sent are skipped.
    async fn recent_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Bot messages committed but not yet delivered.
    async fn unsent_bot_messages(&self, thread_id: &str) -> Result<Vec<Message>, DatabaseError>;

    /// Customer messages no delivered reply has answered yet, oldest first.
    async fn unanswered_messages(&self, thread_id: &str) -> Result<Vec<Message>, DatabaseError>;

    /// Whether the bot has ever replied in this thread.
    async fn has_bot_message(&self, thread_id: &str) -> Result<bool, DatabaseError>;

    // ── Pending replies ─────────────────────────────────────────────

    /// Insert a new pending reply. A second drafted/overridden reply for
    /// the same thread fails with `DatabaseError::Constraint`.
    async fn insert_pending_reply(&self, reply: &PendingReply) -> Result<(), DatabaseError>;

    async fn get_pending_reply(&self, id: Uuid) -> Result<Option<PendingReply>, DatabaseError>;

    /// Write body/state/updated_at only if the stored state still equals
    /// `expected`. Returns `false` when another writer got there first.
    async fn update_pending_reply(
        &self,
        reply: &PendingReply,
        expected: ReplyState,
    ) -> Result<bool, DatabaseError>;

    /// Non-released replies of a thread, oldest first.
    async fn outstanding_replies(&self, thread_id: &str)
    -> Result<Vec<PendingReply>, DatabaseError>;

    /// Released replies whose bot message was never committed.
    async fn orphaned_releases(&self, thread_id: &str) -> Result<Vec<PendingReply>, DatabaseError>;
}

/// Aggregate message counts for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total_messages: i64,
    pub bot_messages: i64,
    pub customer_messages: i64,
    pub threads: i64,
}

/// Per-day message counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub bot_messages: i64,
    pub customer_messages: i64,
}

/// Per-day outbound API call counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiCallCount {
    pub date: NaiveDate,
    pub api: String,
    pub succeeded: i64,
    pub failed: i64,
}

/// A message row as the dashboard shows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardMessage {
    pub id: String,
    pub thread_id: String,
    pub username: String,
    pub author: Author,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub overridden: bool,
    pub sent: bool,
}

/// Dashboard mirror with stats.
#[async_trait]
pub trait DashboardStore: Send + Sync {
    /// Mirror a message. Stats are bumped only when the id is new.
    async fn record_message(&self, message: &Message, thread: &Thread)
    -> Result<bool, DatabaseError>;

    async fn mark_sent(&self, message_ids: &[String]) -> Result<(), DatabaseError>;

    /// Mirror thread metadata (username, status).
    async fn record_thread(&self, thread: &Thread) -> Result<(), DatabaseError>;

    async fn record_api_call(&self, api: &str, success: bool) -> Result<(), DatabaseError>;

    async fn totals(&self) -> Result<Totals, DatabaseError>;

    /// Daily counts for the last `days` days (today included), oldest first.
    async fn daily_counts(&self, days: u32) -> Result<Vec<DailyCount>, DatabaseError>;

    async fn api_calls(&self, days: u32) -> Result<Vec<ApiCallCount>, DatabaseError>;

    async fn thread_history(&self, thread_id: &str)
    -> Result<Vec<DashboardMessage>, DatabaseError>;
}
