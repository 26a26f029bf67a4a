//! Dual writer — operational store first, dashboard mirror second.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::{CommitError, DatabaseError};
use crate::model::{Message, Thread};
use crate::observe::{Event, Observer};
use crate::store::{DashboardStore, OperationalStore};

/// Whether a commit also reached the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Complete,
    /// Operational write succeeded, dashboard write did not.
    Degraded,
}

pub struct DualWriter {
    operational: Arc<dyn OperationalStore>,
    dashboard: Option<Arc<dyn DashboardStore>>,
    observer: Arc<Observer>,
}

impl DualWriter {
    pub fn new(
        operational: Arc<dyn OperationalStore>,
        dashboard: Option<Arc<dyn DashboardStore>>,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            operational,
            dashboard,
            observer,
        }
    }

    /// Persist a message and the thread's metadata in both stores.
    ///
    /// Keyed by message id, so a retried commit changes nothing. Only an
    /// operational failure is an error; the caller must not send then.
    pub async fn commit(
        &self,
        message: &Message,
        thread: &Thread,
    ) -> Result<CommitOutcome, CommitError> {
        let store_write = |source: DatabaseError| {
            self.observer.emit(Event::StoreWrite {
                message_id: &message.id,
                error: &format!("{source}"),
            });
            CommitError::StoreWrite {
                message_id: message.id.clone(),
                source,
            }
        };

        self.operational
            .upsert_thread(thread)
            .await
            .map_err(store_write)?;
        let inserted = self
            .operational
            .upsert_message(message)
            .await
            .map_err(store_write)?;
        self.operational
            .touch_thread(&thread.id, Utc::now())
            .await
            .map_err(store_write)?;

        let Some(dashboard) = &self.dashboard else {
            return Ok(CommitOutcome::Complete);
        };
        let mirrored = async {
            dashboard.record_thread(thread).await?;
            dashboard.record_message(message, thread).await
        }
        .await;

        match mirrored {
            Ok(_) => {
                debug!(message_id = %message.id, inserted, "Message committed");
                Ok(CommitOutcome::Complete)
            }
            Err(e) => {
                self.observer.emit(Event::DegradedWrite {
                    message_id: &message.id,
                    error: &e.to_string(),
                });
                Ok(CommitOutcome::Degraded)
            }
        }
    }

    /// Flag messages as delivered in both stores. Dashboard failures are
    /// degraded writes.
    pub async fn mark_sent(&self, message_ids: &[String]) -> Result<(), CommitError> {
        if let Err(source) = self.operational.mark_sent(message_ids).await {
            let message_id = message_ids.join(",");
            self.observer.emit(Event::StoreWrite {
                message_id: &message_id,
                error: &source.to_string(),
            });
            return Err(CommitError::StoreWrite { message_id, source });
        }
        if let Some(dashboard) = &self.dashboard
            && let Err(e) = dashboard.mark_sent(message_ids).await
        {
            self.observer.emit(Event::DegradedWrite {
                message_id: &message_ids.join(","),
                error: &e.to_string(),
            });
        }
        Ok(())
    }

    /// Mirror thread metadata only (status changes outside a commit).
    pub async fn record_thread(&self, thread: &Thread) {
        if let Some(dashboard) = &self.dashboard
            && let Err(e) = dashboard.record_thread(thread).await
        {
            self.observer.emit(Event::DegradedWrite {
                message_id: &thread.id,
                error: &e.to_string(),
            });
        }
    }

    /// Best-effort outbound call counter.
    pub async fn record_api_call(&self, api: &str, success: bool) {
        if let Some(dashboard) = &self.dashboard
            && let Err(e) = dashboard.record_api_call(api, success).await
        {
            debug!(api, "Failed to record API call: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;
    use crate::store::{
        ApiCallCount, DailyCount, DashboardMessage, LibSqlBackend, LibSqlDashboard, Totals,
    };

    /// Dashboard that is always down.
    struct DownDashboard;

    #[async_trait]
    impl DashboardStore for DownDashboard {
        async fn record_message(&self, _: &Message, _: &Thread) -> Result<bool, DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
        async fn mark_sent(&self, _: &[String]) -> Result<(), DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
        async fn record_thread(&self, _: &Thread) -> Result<(), DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
        async fn record_api_call(&self, _: &str, _: bool) -> Result<(), DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
        async fn totals(&self) -> Result<Totals, DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
        async fn daily_counts(&self, _: u32) -> Result<Vec<DailyCount>, DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
        async fn api_calls(&self, _: u32) -> Result<Vec<ApiCallCount>, DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
        async fn thread_history(&self, _: &str) -> Result<Vec<DashboardMessage>, DatabaseError> {
            Err(DatabaseError::Pool("dashboard down".into()))
        }
    }

    fn message() -> Message {
        Message::customer(
            "m1",
            "t1",
            "hi",
            DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    #[tokio::test]
    async fn commit_twice_stores_once() {
        let op = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dash = Arc::new(LibSqlDashboard::new_memory().await.unwrap());
        let writer = DualWriter::new(
            op.clone(),
            Some(dash.clone() as Arc<dyn DashboardStore>),
            Arc::new(Observer::new()),
        );
        let thread = Thread::new("t1").with_username("dana");

        assert_eq!(
            writer.commit(&message(), &thread).await.unwrap(),
            CommitOutcome::Complete
        );
        assert_eq!(
            writer.commit(&message(), &thread).await.unwrap(),
            CommitOutcome::Complete
        );

        assert_eq!(op.recent_messages("t1", 10).await.unwrap().len(), 1);
        assert_eq!(dash.thread_history("t1").await.unwrap().len(), 1);
        assert_eq!(dash.totals().await.unwrap().total_messages, 1);
    }

    #[tokio::test]
    async fn dashboard_failure_is_degraded_not_fatal() {
        let op = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let observer = Arc::new(Observer::new());
        let writer = DualWriter::new(
            op.clone(),
            Some(Arc::new(DownDashboard) as Arc<dyn DashboardStore>),
            observer.clone(),
        );

        let outcome = writer.commit(&message(), &Thread::new("t1")).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Degraded);
        assert!(op.get_message("m1").await.unwrap().is_some());
        assert_eq!(observer.snapshot().degraded_writes, 1);

        writer.mark_sent(&["m1".to_string()]).await.unwrap();
        assert!(op.get_message("m1").await.unwrap().unwrap().sent);
        assert_eq!(observer.snapshot().degraded_writes, 2);
    }

    #[tokio::test]
    async fn works_without_dashboard() {
        let op = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let writer = DualWriter::new(op.clone(), None, Arc::new(Observer::new()));
        let outcome = writer.commit(&message(), &Thread::new("t1")).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Complete);
        let thread = op.get_thread("t1").await.unwrap().unwrap();
        assert!(thread.last_synced_at.is_some());
    }
}
