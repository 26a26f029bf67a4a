//! Prior thread history for a completion request.

use std::sync::Arc;

use crate::completion::ChatTurn;
use crate::error::DatabaseError;
use crate::model::{Author, Message};
use crate::store::OperationalStore;

/// Builds the history handed to the completion service. Read-only.
pub struct ContextAssembler {
    store: Arc<dyn OperationalStore>,
    enabled: bool,
    limit: usize,
    response_prefix: String,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn OperationalStore>,
        enabled: bool,
        limit: usize,
        response_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            enabled,
            limit,
            response_prefix: response_prefix.into(),
        }
    }

    /// Up to `limit` prior messages of the thread, oldest first, leaving out
    /// `exclude` (the batch being answered). Empty when disabled.
    pub async fn prior_messages(
        &self,
        thread_id: &str,
        exclude: &[String],
    ) -> Result<Vec<Message>, DatabaseError> {
        if !self.enabled || self.limit == 0 {
            return Ok(Vec::new());
        }
        let fetched = self
            .store
            .recent_messages(thread_id, self.limit + exclude.len())
            .await?;
        let mut kept: Vec<Message> = fetched
            .into_iter()
            .filter(|m| !exclude.contains(&m.id))
            .collect();
        if kept.len() > self.limit {
            kept.drain(..kept.len() - self.limit);
        }
        Ok(kept)
    }

    /// `prior_messages` as chat turns. Bot bodies lose the response prefix
    /// so the model doesn't learn to repeat it.
    pub async fn assemble(
        &self,
        thread_id: &str,
        exclude: &[String],
    ) -> Result<Vec<ChatTurn>, DatabaseError> {
        Ok(self
            .prior_messages(thread_id, exclude)
            .await?
            .into_iter()
            .map(|m| match m.author {
                Author::Customer => ChatTurn::user(m.body),
                Author::Bot => ChatTurn::assistant(self.strip_prefix(&m.body)),
            })
            .collect())
    }

    fn strip_prefix(&self, body: &str) -> String {
        if self.response_prefix.is_empty() {
            return body.to_string();
        }
        body.strip_prefix(self.response_prefix.as_str())
            .unwrap_or(body)
            .trim_start()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::completion::Role;
    use crate::store::LibSqlBackend;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(secs)
    }

    async fn seeded() -> Arc<LibSqlBackend> {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut history = vec![
            Message::customer("c1", "t1", "hi", at(0)),
            Message::customer("b1", "t1", "[bot] hello!", at(1)),
            Message::customer("c2", "t1", "price?", at(2)),
            Message::customer("c3", "t1", "and shipping?", at(3)),
        ];
        history[1].author = Author::Bot;
        history[1].sent = true;
        for m in &history {
            store.upsert_message(m).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn excludes_batch_and_keeps_limit() {
        let store = seeded().await;
        let ctx = ContextAssembler::new(store, true, 2, "");
        let prior = ctx.prior_messages("t1", &["c3".to_string()]).await.unwrap();
        let ids: Vec<_> = prior.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "c2"]);
    }

    #[tokio::test]
    async fn bot_turns_are_assistant_without_prefix() {
        let store = seeded().await;
        let ctx = ContextAssembler::new(store, true, 10, "[bot]");
        let turns = ctx.assemble("t1", &[]).await.unwrap();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "hello!");
    }

    #[tokio::test]
    async fn disabled_returns_empty() {
        let store = seeded().await;
        let ctx = ContextAssembler::new(store, false, 10, "");
        assert!(ctx.assemble("t1", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_calls_are_stable() {
        let store = seeded().await;
        let ctx = ContextAssembler::new(store, true, 3, "");
        let first = ctx.prior_messages("t1", &[]).await.unwrap();
        let second = ctx.prior_messages("t1", &[]).await.unwrap();
        assert_eq!(first, second);
    }
}
