//! libSQL dashboard store — message mirror, thread metadata and stats.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::model::{Author, Message, Thread};
use crate::store::libsql_backend::{fmt_ts, open_local, open_memory, opt_text, parse_datetime};
use crate::store::migrations;
use crate::store::traits::{ApiCallCount, DailyCount, DashboardMessage, DashboardStore, Totals};

/// Characters of the latest message kept as the thread preview.
const PREVIEW_CHARS: usize = 100;

pub struct LibSqlDashboard {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes writers on the shared connection so a message insert and
    /// its stats stay in one transaction.
    writes: Mutex<()>,
}

impl LibSqlDashboard {
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        let (db, conn) = open_local(path, migrations::DASHBOARD).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            writes: Mutex::new(()),
        })
    }

    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let (db, conn) = open_memory(migrations::DASHBOARD).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            writes: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn bump_stats(conn: &Connection, message: &Message) -> Result<(), DatabaseError> {
        let (bot, customer): (i64, i64) = match message.author {
            Author::Bot => (1, 0),
            Author::Customer => (0, 1),
        };
        let date = message.created_at.date_naive().to_string();

        conn.execute(
            "INSERT INTO daily_stats (date, bot_messages, customer_messages) VALUES (?1, ?2, ?3)
             ON CONFLICT(date) DO UPDATE SET
                bot_messages = bot_messages + excluded.bot_messages,
                customer_messages = customer_messages + excluded.customer_messages",
            params![date, bot, customer],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("daily_stats", e))?;

        conn.execute(
            "UPDATE lifetime_stats SET
                total_messages = total_messages + 1,
                bot_messages = bot_messages + ?1,
                customer_messages = customer_messages + ?2
             WHERE id = 1",
            params![bot, customer],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("lifetime_stats", e))?;
        Ok(())
    }

    async fn count(&self, op: &str, sql: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::from_libsql(op, e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::from_libsql(op, e)),
        }
    }
}

/// First day of a window of `days` days ending today.
fn window_start(days: u32) -> NaiveDate {
    let today = Utc::now().date_naive();
    today
        .checked_sub_days(Days::new(u64::from(days.saturating_sub(1))))
        .unwrap_or(today)
}

fn preview(body: &str) -> String {
    body.chars().take(PREVIEW_CHARS).collect()
}

#[async_trait]
impl DashboardStore for LibSqlDashboard {
    async fn record_message(
        &self,
        message: &Message,
        thread: &Thread,
    ) -> Result<bool, DatabaseError> {
        let metadata = serde_json::json!({
            "thread_status": thread.status,
            "author": message.author,
        });
        let _writes = self.writes.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::from_libsql("record_message begin", e))?;
        let changed = tx
            .execute(
                "INSERT INTO messages (id, thread_id, username, author, body, created_at, overridden, sent, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    message.id.as_str(),
                    message.thread_id.as_str(),
                    thread.display_name(),
                    message.author.to_string(),
                    message.body.as_str(),
                    fmt_ts(&message.created_at),
                    message.overridden as i64,
                    message.sent as i64,
                    metadata.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("record_message", e))?;

        if changed == 0 {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::from_libsql("record_message commit", e))?;
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO threads (id, username, status, last_message_preview, last_message_at, message_count)
             VALUES (?1, COALESCE(?2, 'unknown_user'), ?3, ?4, ?5, 1)
             ON CONFLICT(id) DO UPDATE SET
                username = COALESCE(?2, threads.username),
                status = excluded.status,
                last_message_preview = excluded.last_message_preview,
                last_message_at = excluded.last_message_at,
                message_count = threads.message_count + 1",
            params![
                thread.id.as_str(),
                opt_text(thread.username.as_deref()),
                thread.status.to_string(),
                preview(&message.body),
                fmt_ts(&message.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("record_message thread", e))?;

        Self::bump_stats(&tx, message).await?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::from_libsql("record_message commit", e))?;
        debug!(message_id = %message.id, "Dashboard message recorded");
        Ok(true)
    }

    async fn mark_sent(&self, message_ids: &[String]) -> Result<(), DatabaseError> {
        let _writes = self.writes.lock().await;
        for id in message_ids {
            self.conn()
                .execute("UPDATE messages SET sent = 1 WHERE id = ?1", params![id.as_str()])
                .await
                .map_err(|e| DatabaseError::from_libsql("dashboard mark_sent", e))?;
        }
        Ok(())
    }

    async fn record_thread(&self, thread: &Thread) -> Result<(), DatabaseError> {
        let _writes = self.writes.lock().await;
        self.conn()
            .execute(
                "INSERT INTO threads (id, username, status) VALUES (?1, COALESCE(?2, 'unknown_user'), ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    username = COALESCE(?2, threads.username),
                    status = excluded.status",
                params![
                    thread.id.as_str(),
                    opt_text(thread.username.as_deref()),
                    thread.status.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("record_thread", e))?;
        Ok(())
    }

    async fn record_api_call(&self, api: &str, success: bool) -> Result<(), DatabaseError> {
        let (ok, failed): (i64, i64) = if success { (1, 0) } else { (0, 1) };
        let _writes = self.writes.lock().await;
        self.conn()
            .execute(
                "INSERT INTO api_calls (date, api, succeeded, failed) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(date, api) DO UPDATE SET
                    succeeded = succeeded + excluded.succeeded,
                    failed = failed + excluded.failed",
                params![Utc::now().date_naive().to_string(), api, ok, failed],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("record_api_call", e))?;
        Ok(())
    }

    async fn totals(&self) -> Result<Totals, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT total_messages, bot_messages, customer_messages FROM lifetime_stats WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("totals", e))?;

        let mut totals = Totals::default();
        if let Ok(Some(row)) = rows.next().await {
            totals.total_messages = row.get(0).unwrap_or(0);
            totals.bot_messages = row.get(1).unwrap_or(0);
            totals.customer_messages = row.get(2).unwrap_or(0);
        }
        totals.threads = self.count("totals threads", "SELECT COUNT(*) FROM threads").await?;
        Ok(totals)
    }

    async fn daily_counts(&self, days: u32) -> Result<Vec<DailyCount>, DatabaseError> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let start = window_start(days);
        let mut rows = self
            .conn()
            .query(
                "SELECT date, bot_messages, customer_messages FROM daily_stats
                 WHERE date >= ?1 ORDER BY date ASC",
                params![start.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("daily_counts", e))?;

        let mut stored: std::collections::HashMap<NaiveDate, (i64, i64)> =
            std::collections::HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let date: String = row.get(0).unwrap_or_default();
            match date.parse::<NaiveDate>() {
                Ok(d) => {
                    stored.insert(d, (row.get(1).unwrap_or(0), row.get(2).unwrap_or(0)));
                }
                Err(e) => warn!(date, "Skipping bad daily_stats row: {e}"),
            }
        }

        // One entry per day, zero-filled.
        Ok(start
            .iter_days()
            .take(days as usize)
            .map(|date| {
                let (bot, customer) = stored.get(&date).copied().unwrap_or((0, 0));
                DailyCount {
                    date,
                    bot_messages: bot,
                    customer_messages: customer,
                }
            })
            .collect())
    }

    async fn api_calls(&self, days: u32) -> Result<Vec<ApiCallCount>, DatabaseError> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let mut rows = self
            .conn()
            .query(
                "SELECT date, api, succeeded, failed FROM api_calls
                 WHERE date >= ?1 ORDER BY date ASC, api ASC",
                params![window_start(days).to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("api_calls", e))?;

        let mut calls = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let date: String = row.get(0).unwrap_or_default();
            let Ok(date) = date.parse::<NaiveDate>() else {
                continue;
            };
            calls.push(ApiCallCount {
                date,
                api: row.get(1).unwrap_or_default(),
                succeeded: row.get(2).unwrap_or(0),
                failed: row.get(3).unwrap_or(0),
            });
        }
        Ok(calls)
    }

    async fn thread_history(
        &self,
        thread_id: &str,
    ) -> Result<Vec<DashboardMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, thread_id, username, author, body, created_at, overridden, sent
                 FROM messages WHERE thread_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("thread_history", e))?;

        let mut history = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let author: String = row.get(3).unwrap_or_default();
            let Ok(author) = author.parse::<Author>() else {
                warn!(thread_id, "Skipping dashboard row with unknown author");
                continue;
            };
            let created: String = row.get(5).unwrap_or_default();
            history.push(DashboardMessage {
                id: row.get(0).unwrap_or_default(),
                thread_id: row.get(1).unwrap_or_default(),
                username: row.get(2).unwrap_or_default(),
                author,
                body: row.get(4).unwrap_or_default(),
                created_at: parse_datetime(&created),
                overridden: row.get::<i64>(6).unwrap_or(0) != 0,
                sent: row.get::<i64>(7).unwrap_or(0) != 0,
            });
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::model::ThreadStatus;

    fn now_msg(id: &str, author: Author, body: &str) -> Message {
        let mut m = Message::customer(id, "t1", body, Utc::now());
        m.author = author;
        m
    }

    #[tokio::test]
    async fn stats_count_each_message_once() {
        let dash = LibSqlDashboard::new_memory().await.unwrap();
        let thread = Thread::new("t1").with_username("dana");

        assert!(dash
            .record_message(&now_msg("m1", Author::Customer, "hi"), &thread)
            .await
            .unwrap());
        assert!(!dash
            .record_message(&now_msg("m1", Author::Customer, "hi"), &thread)
            .await
            .unwrap());
        dash.record_message(&now_msg("b1", Author::Bot, "hello"), &thread)
            .await
            .unwrap();

        let totals = dash.totals().await.unwrap();
        assert_eq!(totals.total_messages, 2);
        assert_eq!(totals.bot_messages, 1);
        assert_eq!(totals.customer_messages, 1);
        assert_eq!(totals.threads, 1);

        let daily = dash.daily_counts(1).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].bot_messages, 1);
        assert_eq!(daily[0].customer_messages, 1);
    }

    #[tokio::test]
    async fn concurrent_recorders_each_count_once() {
        let dash = LibSqlDashboard::new_memory().await.unwrap();
        let thread = Thread::new("t1");
        let messages: Vec<_> = (0..20)
            .map(|i| now_msg(&format!("m{i}"), Author::Customer, "hi"))
            .collect();

        let (dash_ref, thread_ref) = (&dash, &thread);
        let results = futures::future::join_all(messages.iter().map(|m| async move {
            let recorded = dash_ref.record_message(m, thread_ref).await;
            dash_ref.record_api_call("completion", true).await.unwrap();
            recorded
        }))
        .await;
        assert!(results.into_iter().all(|r| r.unwrap()));

        let totals = dash.totals().await.unwrap();
        assert_eq!(totals.total_messages, 20);
        assert_eq!(totals.customer_messages, 20);
        assert_eq!(dash.daily_counts(1).await.unwrap()[0].customer_messages, 20);
        assert_eq!(dash.api_calls(1).await.unwrap()[0].succeeded, 20);
    }

    #[tokio::test]
    async fn daily_window_is_zero_filled() {
        let dash = LibSqlDashboard::new_memory().await.unwrap();
        let daily = dash.daily_counts(7).await.unwrap();
        assert_eq!(daily.len(), 7);
        assert!(daily.iter().all(|d| d.bot_messages == 0));
        assert_eq!(daily[6].date, Utc::now().date_naive());
        assert!(dash.daily_counts(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_carries_username_and_flags() {
        let dash = LibSqlDashboard::new_memory().await.unwrap();
        let thread = Thread::new("t1");
        let created: DateTime<Utc> = Utc::now();
        let mut bot = Message::customer("b1", "t1", "reply", created);
        bot.author = Author::Bot;
        bot.overridden = true;
        dash.record_message(&bot, &thread).await.unwrap();
        dash.mark_sent(&["b1".to_string()]).await.unwrap();

        let history = dash.thread_history("t1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].username, "unknown_user");
        assert!(history[0].overridden);
        assert!(history[0].sent);
    }

    #[tokio::test]
    async fn api_calls_accumulate_per_day() {
        let dash = LibSqlDashboard::new_memory().await.unwrap();
        dash.record_api_call("openai", true).await.unwrap();
        dash.record_api_call("openai", true).await.unwrap();
        dash.record_api_call("openai", false).await.unwrap();
        dash.record_api_call("source", true).await.unwrap();

        let calls = dash.api_calls(1).await.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].api, "openai");
        assert_eq!(calls[0].succeeded, 2);
        assert_eq!(calls[0].failed, 1);
    }

    #[tokio::test]
    async fn thread_metadata_upserts_in_place() {
        let dash = LibSqlDashboard::new_memory().await.unwrap();
        dash.record_thread(&Thread::new("t1").with_username("dana"))
            .await
            .unwrap();
        dash.record_thread(&Thread::new("t1").with_status(ThreadStatus::WaitingForHuman))
            .await
            .unwrap();
        let totals = dash.totals().await.unwrap();
        assert_eq!(totals.threads, 1);
    }

    #[test]
    fn preview_is_char_bounded() {
        let long = "é".repeat(150);
        assert_eq!(preview(&long).chars().count(), 100);
    }
}
