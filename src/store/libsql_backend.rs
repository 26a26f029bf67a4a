//! Async `OperationalStore` on libSQL.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text so lexical order matches time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{Message, PendingReply, ReplyState, Thread, ThreadStatus};
use crate::store::migrations::{self, Migration};
use crate::store::traits::OperationalStore;

/// Open (or create) a local database file, run `set`, and connect.
pub(crate) async fn open_local(
    path: &Path,
    set: &[Migration],
) -> Result<(LibSqlDatabase, Connection), DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DatabaseError::Pool(format!("Failed to create database directory: {e}"))
        })?;
    }

    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
    let conn = db
        .connect()
        .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
    migrations::run_migrations(&conn, set).await?;
    info!(path = %path.display(), "Database opened");
    Ok((db, conn))
}

/// Create an in-memory database (for tests).
pub(crate) async fn open_memory(
    set: &[Migration],
) -> Result<(LibSqlDatabase, Connection), DatabaseError> {
    let db = libsql::Builder::new_local(":memory:")
        .build()
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;
    let conn = db
        .connect()
        .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
    migrations::run_migrations(&conn, set).await?;
    Ok((db, conn))
}

/// libSQL operational store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        let (db, conn) = open_local(path, migrations::OPERATIONAL).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let (db, conn) = open_memory(migrations::OPERATIONAL).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::from_libsql(op, e))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(m) => messages.push(m),
                Err(e) => warn!("{op}: skipping bad message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn query_replies(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<PendingReply>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::from_libsql(op, e))?;

        let mut replies = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_reply(&row) {
                Ok(r) => replies.push(r),
                Err(e) => warn!("{op}: skipping bad pending reply row: {e}"),
            }
        }
        Ok(replies)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, with or without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const MESSAGE_COLUMNS: &str = "id, thread_id, author, body, created_at, overridden, sent";

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let author: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let created: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(Message {
        id: row
            .get(0)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        thread_id: row
            .get(1)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        author: author.parse().map_err(DatabaseError::Serialization)?,
        body: row
            .get(3)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        created_at: parse_datetime(&created),
        overridden: row.get::<i64>(5).unwrap_or(0) != 0,
        sent: row.get::<i64>(6).unwrap_or(0) != 0,
    })
}

const REPLY_COLUMNS: &str =
    "id, thread_id, body, state, source_message_ids, overridden, created_at, updated_at";

fn row_to_reply(row: &libsql::Row) -> Result<PendingReply, DatabaseError> {
    let ser = |e: libsql::Error| DatabaseError::Serialization(e.to_string());
    let id: String = row.get(0).map_err(ser)?;
    let state: String = row.get(3).map_err(ser)?;
    let sources: String = row.get::<String>(4).unwrap_or_else(|_| "[]".into());
    let created: String = row.get(6).map_err(ser)?;
    let updated: String = row.get(7).map_err(ser)?;
    Ok(PendingReply {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        thread_id: row.get(1).map_err(ser)?,
        body: row.get(2).map_err(ser)?,
        state: state.parse().map_err(DatabaseError::Serialization)?,
        source_message_ids: serde_json::from_str(&sources).unwrap_or_default(),
        overridden: row.get::<i64>(5).unwrap_or(0) != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl OperationalStore for LibSqlBackend {
    async fn upsert_thread(&self, thread: &Thread) -> Result<(), DatabaseError> {
        // A thread that was waiting for approval becomes whatever the
        // source now reports; any other stored status wins.
        self.conn()
            .execute(
                "INSERT INTO threads (id, username, status, last_synced_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    username = COALESCE(excluded.username, threads.username),
                    status = CASE WHEN threads.status = 'pending-approval'
                                  THEN excluded.status ELSE threads.status END",
                params![
                    thread.id.as_str(),
                    opt_text(thread.username.as_deref()),
                    thread.status.to_string(),
                    opt_text(thread.last_synced_at.map(|t| fmt_ts(&t)).as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_thread", e))?;
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, username, status, last_synced_at FROM threads WHERE id = ?1",
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_thread", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row.get::<String>(2).unwrap_or_else(|_| "active".into());
                let synced: Option<String> = row.get(3).ok();
                Ok(Some(Thread {
                    id: row
                        .get(0)
                        .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                    username: row.get(1).ok(),
                    last_synced_at: synced.as_deref().map(parse_datetime),
                    status: status.parse().unwrap_or_default(),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_thread", e)),
        }
    }

    async fn set_thread_status(
        &self,
        thread_id: &str,
        status: ThreadStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO threads (id, status) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status",
                params![thread_id, status.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("set_thread_status", e))?;
        debug!(thread_id, status = %status, "Thread status updated");
        Ok(())
    }

    async fn touch_thread(&self, thread_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE threads SET last_synced_at = ?1 WHERE id = ?2",
                params![fmt_ts(&at), thread_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("touch_thread", e))?;
        Ok(())
    }

    async fn upsert_message(&self, message: &Message) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO messages (id, thread_id, author, body, created_at, overridden, sent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    message.id.as_str(),
                    message.thread_id.as_str(),
                    message.author.to_string(),
                    message.body.as_str(),
                    fmt_ts(&message.created_at),
                    message.overridden as i64,
                    message.sent as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_message", e))?;
        Ok(changed > 0)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, DatabaseError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        Ok(self
            .query_messages("get_message", &sql, params![message_id])
            .await?
            .into_iter()
            .next())
    }

    async fn mark_sent(&self, message_ids: &[String]) -> Result<(), DatabaseError> {
        for id in message_ids {
            self.conn()
                .execute("UPDATE messages SET sent = 1 WHERE id = ?1", params![id.as_str()])
                .await
                .map_err(|e| DatabaseError::from_libsql("mark_sent", e))?;
        }
        Ok(())
    }

    async fn recent_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ?1 AND NOT (overridden = 1 AND sent = 0)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        );
        let mut messages = self
            .query_messages("recent_messages", &sql, params![thread_id, limit as i64])
            .await?;
        messages.reverse();
        Ok(messages)
    }

    async fn unsent_bot_messages(&self, thread_id: &str) -> Result<Vec<Message>, DatabaseError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ?1 AND author = 'bot' AND sent = 0
             ORDER BY created_at ASC"
        );
        self.query_messages("unsent_bot_messages", &sql, params![thread_id])
            .await
    }

    async fn unanswered_messages(&self, thread_id: &str) -> Result<Vec<Message>, DatabaseError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ?1 AND author = 'customer' AND sent = 0
             ORDER BY created_at ASC, rowid ASC"
        );
        self.query_messages("unanswered_messages", &sql, params![thread_id])
            .await
    }

    async fn has_bot_message(&self, thread_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE thread_id = ?1 AND author = 'bot'",
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("has_bot_message", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::from_libsql("has_bot_message", e)),
        }
    }

    async fn insert_pending_reply(&self, reply: &PendingReply) -> Result<(), DatabaseError> {
        let sources = serde_json::to_string(&reply.source_message_ids)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO pending_replies (id, thread_id, body, state, source_message_ids, overridden, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    reply.id.to_string(),
                    reply.thread_id.as_str(),
                    reply.body.as_str(),
                    reply.state.as_str(),
                    sources,
                    reply.overridden as i64,
                    fmt_ts(&reply.created_at),
                    fmt_ts(&reply.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_pending_reply", e))?;
        debug!(reply_id = %reply.id, thread_id = %reply.thread_id, "Pending reply stored");
        Ok(())
    }

    async fn get_pending_reply(&self, id: Uuid) -> Result<Option<PendingReply>, DatabaseError> {
        let sql = format!("SELECT {REPLY_COLUMNS} FROM pending_replies WHERE id = ?1");
        Ok(self
            .query_replies("get_pending_reply", &sql, params![id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn update_pending_reply(
        &self,
        reply: &PendingReply,
        expected: ReplyState,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE pending_replies SET body = ?1, state = ?2, overridden = ?3, updated_at = ?4
                 WHERE id = ?5 AND state = ?6",
                params![
                    reply.body.as_str(),
                    reply.state.as_str(),
                    reply.overridden as i64,
                    fmt_ts(&reply.updated_at),
                    reply.id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("update_pending_reply", e))?;
        Ok(changed > 0)
    }

    async fn outstanding_replies(
        &self,
        thread_id: &str,
    ) -> Result<Vec<PendingReply>, DatabaseError> {
        let sql = format!(
            "SELECT {REPLY_COLUMNS} FROM pending_replies
             WHERE thread_id = ?1 AND state != 'released'
             ORDER BY created_at ASC"
        );
        self.query_replies("outstanding_replies", &sql, params![thread_id])
            .await
    }

    async fn orphaned_releases(&self, thread_id: &str) -> Result<Vec<PendingReply>, DatabaseError> {
        let sql = format!(
            "SELECT {REPLY_COLUMNS} FROM pending_replies p
             WHERE p.thread_id = ?1 AND p.state = 'released'
               AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.id = 'bot_' || p.id)
             ORDER BY p.created_at ASC"
        );
        self.query_replies("orphaned_releases", &sql, params![thread_id])
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::Author;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(secs)
    }

    #[tokio::test]
    async fn message_upsert_is_idempotent() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let msg = Message::customer("m1", "t1", "hello", at(0));
        assert!(db.upsert_message(&msg).await.unwrap());
        assert!(!db.upsert_message(&msg).await.unwrap());

        db.mark_sent(&["m1".to_string()]).await.unwrap();
        // Re-fetching the unsent copy must not clear the flag.
        assert!(!db.upsert_message(&msg).await.unwrap());
        let stored = db.get_message("m1").await.unwrap().unwrap();
        assert!(stored.sent);
        assert_eq!(stored.created_at, at(0));
    }

    #[tokio::test]
    async fn recent_messages_are_bounded_and_oldest_first() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        for i in 0..5 {
            db.upsert_message(&Message::customer(format!("m{i}"), "t1", format!("msg {i}"), at(i)))
                .await
                .unwrap();
        }
        let recent = db.recent_messages("t1", 3).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn unsent_overridden_messages_are_not_context() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.upsert_message(&Message::customer("m1", "t1", "hi", at(0)))
            .await
            .unwrap();
        let mut bot = Message::customer("bot_x", "t1", "replaced", at(1));
        bot.author = Author::Bot;
        bot.overridden = true;
        db.upsert_message(&bot).await.unwrap();

        assert_eq!(db.recent_messages("t1", 10).await.unwrap().len(), 1);

        db.mark_sent(&["bot_x".to_string()]).await.unwrap();
        assert_eq!(db.recent_messages("t1", 10).await.unwrap().len(), 2);
        assert!(db.has_bot_message("t1").await.unwrap());
    }

    #[tokio::test]
    async fn unanswered_messages_exclude_answered_and_bot() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        for i in 0..3 {
            db.upsert_message(&Message::customer(format!("m{i}"), "t1", "q", at(i)))
                .await
                .unwrap();
        }
        db.upsert_message(&Message::customer("x1", "t2", "other", at(0)))
            .await
            .unwrap();
        let mut bot = Message::customer("bot_y", "t1", "a", at(5));
        bot.author = Author::Bot;
        db.upsert_message(&bot).await.unwrap();
        db.mark_sent(&["m0".to_string()]).await.unwrap();

        let ids: Vec<_> = db
            .unanswered_messages("t1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn second_open_reply_is_a_constraint_error() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_pending_reply(&PendingReply::drafted("t1", "a", vec![]))
            .await
            .unwrap();
        let err = db
            .insert_pending_reply(&PendingReply::drafted("t1", "b", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        // Other threads are independent.
        db.insert_pending_reply(&PendingReply::drafted("t2", "c", vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_checks_expected_state() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut reply = PendingReply::drafted("t1", "draft", vec!["m1".into()]);
        db.insert_pending_reply(&reply).await.unwrap();

        reply.state = ReplyState::Overridden;
        reply.overridden = true;
        reply.body = "better".into();
        assert!(db.update_pending_reply(&reply, ReplyState::Drafted).await.unwrap());
        // Stale expectation loses.
        assert!(!db.update_pending_reply(&reply, ReplyState::Drafted).await.unwrap());

        let stored = db.get_pending_reply(reply.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ReplyState::Overridden);
        assert_eq!(stored.body, "better");
        assert!(stored.overridden);
        assert_eq!(stored.source_message_ids, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn orphaned_releases_disappear_once_committed() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut reply = PendingReply::drafted("t1", "hello", vec![]);
        db.insert_pending_reply(&reply).await.unwrap();
        reply.state = ReplyState::Released;
        db.update_pending_reply(&reply, ReplyState::Drafted)
            .await
            .unwrap();

        assert_eq!(db.orphaned_releases("t1").await.unwrap().len(), 1);
        assert!(db.outstanding_replies("t1").await.unwrap().is_empty());

        db.upsert_message(&reply.to_message()).await.unwrap();
        assert!(db.orphaned_releases("t1").await.unwrap().is_empty());
        assert_eq!(db.unsent_bot_messages("t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn thread_upsert_keeps_operator_status() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.upsert_thread(&Thread::new("t1").with_username("dana"))
            .await
            .unwrap();
        db.set_thread_status("t1", ThreadStatus::WaitingForHuman)
            .await
            .unwrap();
        db.upsert_thread(&Thread::new("t1")).await.unwrap();

        let t = db.get_thread("t1").await.unwrap().unwrap();
        assert_eq!(t.status, ThreadStatus::WaitingForHuman);
        assert_eq!(t.username.as_deref(), Some("dana"));
    }

    #[tokio::test]
    async fn approved_thread_takes_source_status() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.upsert_thread(&Thread::new("t1").with_status(ThreadStatus::PendingApproval))
            .await
            .unwrap();
        db.upsert_thread(&Thread::new("t1")).await.unwrap();
        let t = db.get_thread("t1").await.unwrap().unwrap();
        assert_eq!(t.status, ThreadStatus::Active);
    }
}
