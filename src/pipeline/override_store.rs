//! Override store — drafted bot replies that an operator may replace or
//! suspend before they go out.
//!
//! State machine:
//!
//! ```text
//! drafted ──apply(text)──▶ overridden ──release──▶ released
//!    │                        ▲   │
//!    ├──apply(WAIT)──▶ suspended  └──apply(WAIT)──▶ suspended
//!    │                    │
//!    └──release──▶ released   apply(text) ──▶ overridden
//! ```
//!
//! Only one drafted/overridden reply may exist per thread. A suspended
//! reply parks the thread (`waiting-for-human`) until an operator gives it
//! real text.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::completion::{self, ChatTurn, CompletionService};
use crate::error::{DatabaseError, OverrideError};
use crate::model::{Message, OverrideAction, PendingReply, ReplyState, ThreadStatus};
use crate::store::OperationalStore;

/// Everything `draft` needs for one batch.
#[derive(Debug, Clone)]
pub struct DraftRequest<'a> {
    pub thread_id: &'a str,
    pub system_prompt: &'a str,
    pub context: &'a [ChatTurn],
    pub input: &'a str,
    pub source_message_ids: Vec<String>,
}

pub struct OverrideStore {
    store: Arc<dyn OperationalStore>,
    completion: Arc<dyn CompletionService>,
    call_timeout: Duration,
    response_prefix: String,
}

impl OverrideStore {
    pub fn new(
        store: Arc<dyn OperationalStore>,
        completion: Arc<dyn CompletionService>,
        call_timeout: Duration,
        response_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            completion,
            call_timeout,
            response_prefix: response_prefix.into(),
        }
    }

    /// Generate a reply for a batch and store it as `drafted`.
    ///
    /// Fails with `Conflict` if the thread already has a drafted or
    /// overridden reply; the completion service is not called in that case.
    pub async fn draft(
        &self,
        request: DraftRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<PendingReply, OverrideError> {
        if let Some(existing) = self.open_reply(request.thread_id).await? {
            return Err(OverrideError::Conflict {
                thread_id: request.thread_id.to_string(),
                existing: existing.id.to_string(),
            });
        }

        let text = completion::bounded(
            self.call_timeout,
            cancel,
            self.completion
                .generate(request.system_prompt, request.context, request.input),
        )
        .await?;

        let body = format!("{}{}", self.response_prefix, text);
        let reply = PendingReply::drafted(request.thread_id, body, request.source_message_ids);

        match self.store.insert_pending_reply(&reply).await {
            Ok(()) => {}
            // Lost a race with another drafter.
            Err(DatabaseError::Constraint(_)) => {
                let existing = self
                    .open_reply(request.thread_id)
                    .await?
                    .map(|r| r.id.to_string())
                    .unwrap_or_default();
                return Err(OverrideError::Conflict {
                    thread_id: request.thread_id.to_string(),
                    existing,
                });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(
            reply_id = %reply.id,
            thread_id = request.thread_id,
            sources = reply.source_message_ids.len(),
            "Reply drafted"
        );
        Ok(reply)
    }

    /// Operator override: replace the body, or suspend with `WAIT`.
    pub async fn apply(
        &self,
        id: Uuid,
        action: OverrideAction,
    ) -> Result<PendingReply, OverrideError> {
        let current = self.get(id).await?;
        if current.state == ReplyState::Released {
            return Err(invalid(&current, "apply"));
        }

        let mut updated = current.clone();
        updated.updated_at = Utc::now();
        let thread_status = match action {
            OverrideAction::Replace(text) => {
                if text.trim().is_empty() {
                    return Err(invalid(&current, "apply empty text"));
                }
                updated.body = text;
                updated.state = ReplyState::Overridden;
                updated.overridden = true;
                (current.state == ReplyState::Suspended).then_some(ThreadStatus::Active)
            }
            OverrideAction::Wait => {
                updated.state = ReplyState::Suspended;
                Some(ThreadStatus::WaitingForHuman)
            }
        };

        self.transition(&current, &updated, "apply").await?;
        if let Some(status) = thread_status {
            self.store
                .set_thread_status(&updated.thread_id, status)
                .await?;
        }

        info!(
            reply_id = %id,
            thread_id = %updated.thread_id,
            from = %current.state,
            to = %updated.state,
            "Override applied"
        );
        Ok(updated)
    }

    /// Mark a drafted/overridden reply released and return the bot message
    /// it becomes. Suspended replies need new text first.
    pub async fn release(&self, id: Uuid) -> Result<Message, OverrideError> {
        let current = self.get(id).await?;
        if !current.state.blocks_new_draft() {
            return Err(invalid(&current, "release"));
        }

        let mut released = current.clone();
        released.updated_at = Utc::now();
        released.state = ReplyState::Released;
        self.transition(&current, &released, "release").await?;

        debug!(reply_id = %id, thread_id = %released.thread_id, "Reply released");
        Ok(released.to_message())
    }

    /// Non-released replies of a thread, oldest first.
    pub async fn pending_for_thread(
        &self,
        thread_id: &str,
    ) -> Result<Vec<PendingReply>, OverrideError> {
        Ok(self.store.outstanding_replies(thread_id).await?)
    }

    async fn get(&self, id: Uuid) -> Result<PendingReply, OverrideError> {
        self.store
            .get_pending_reply(id)
            .await?
            .ok_or_else(|| OverrideError::NotFound(id.to_string()))
    }

    async fn open_reply(&self, thread_id: &str) -> Result<Option<PendingReply>, OverrideError> {
        Ok(self
            .store
            .outstanding_replies(thread_id)
            .await?
            .into_iter()
            .find(|r| r.state.blocks_new_draft()))
    }

    /// Compare-and-set on the stored state.
    async fn transition(
        &self,
        current: &PendingReply,
        next: &PendingReply,
        action: &str,
    ) -> Result<(), OverrideError> {
        match self.store.update_pending_reply(next, current.state).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                // Someone else moved it; report what it is now.
                let now = self.get(current.id).await?;
                Err(invalid(&now, action))
            }
            Err(DatabaseError::Constraint(_)) => Err(OverrideError::Conflict {
                thread_id: current.thread_id.clone(),
                existing: self
                    .open_reply(&current.thread_id)
                    .await?
                    .map(|r| r.id.to_string())
                    .unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn invalid(reply: &PendingReply, action: &str) -> OverrideError {
    OverrideError::InvalidState {
        id: reply.id.to_string(),
        state: reply.state.to_string(),
        action: action.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::CompletionError;
    use crate::store::LibSqlBackend;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionService for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            _system_prompt: &str,
            _context: &[ChatTurn],
            new_input: &str,
        ) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("re: {new_input}"))
        }
    }

    async fn setup(prefix: &str) -> (OverrideStore, Arc<LibSqlBackend>, Arc<Echo>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let overrides = OverrideStore::new(
            store.clone(),
            echo.clone(),
            Duration::from_secs(5),
            prefix,
        );
        (overrides, store, echo)
    }

    fn request(thread_id: &str) -> DraftRequest<'_> {
        DraftRequest {
            thread_id,
            system_prompt: "be nice",
            context: &[],
            input: "hello",
            source_message_ids: vec!["m1".into()],
        }
    }

    #[tokio::test]
    async fn draft_stores_generated_body() {
        let (overrides, _, _) = setup("[bot] ").await;
        let cancel = CancellationToken::new();
        let reply = overrides.draft(request("t1"), &cancel).await.unwrap();
        assert_eq!(reply.state, ReplyState::Drafted);
        assert_eq!(reply.body, "[bot] re: hello");
        assert_eq!(overrides.pending_for_thread("t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prefix_is_prepended_verbatim() {
        let (overrides, _, _) = setup("🤖").await;
        let reply = overrides
            .draft(request("t1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.body, "🤖re: hello");
    }

    #[tokio::test]
    async fn second_draft_conflicts_without_calling_completion() {
        let (overrides, _, echo) = setup("").await;
        let cancel = CancellationToken::new();
        overrides.draft(request("t1"), &cancel).await.unwrap();

        let err = overrides.draft(request("t1"), &cancel).await.unwrap_err();
        assert!(matches!(err, OverrideError::Conflict { .. }));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn draft_succeeds_after_release_or_wait() {
        let (overrides, _, _) = setup("").await;
        let cancel = CancellationToken::new();

        let first = overrides.draft(request("t1"), &cancel).await.unwrap();
        overrides.release(first.id).await.unwrap();
        let second = overrides.draft(request("t1"), &cancel).await.unwrap();
        overrides.apply(second.id, OverrideAction::Wait).await.unwrap();
        assert!(overrides.draft(request("t1"), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn override_then_release_marks_message() {
        let (overrides, _, _) = setup("").await;
        let cancel = CancellationToken::new();
        let reply = overrides.draft(request("t1"), &cancel).await.unwrap();

        overrides
            .apply(reply.id, OverrideAction::from_text("Hello"))
            .await
            .unwrap();
        let msg = overrides.release(reply.id).await.unwrap();
        assert!(msg.overridden);
        assert!(msg.is_from_bot());
        assert_eq!(msg.body, "Hello");
        assert_eq!(msg.id, Message::bot_id_for(reply.id));
    }

    #[tokio::test]
    async fn suspended_reply_needs_new_text() {
        let (overrides, store, _) = setup("").await;
        let cancel = CancellationToken::new();
        let reply = overrides.draft(request("t1"), &cancel).await.unwrap();

        overrides
            .apply(reply.id, OverrideAction::from_text("WAIT"))
            .await
            .unwrap();
        let thread = store.get_thread("t1").await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::WaitingForHuman);

        let err = overrides.release(reply.id).await.unwrap_err();
        assert!(matches!(err, OverrideError::InvalidState { .. }));

        overrides
            .apply(reply.id, OverrideAction::from_text("Hi"))
            .await
            .unwrap();
        let msg = overrides.release(reply.id).await.unwrap();
        assert_eq!(msg.body, "Hi");
        let thread = store.get_thread("t1").await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Active);
    }

    #[tokio::test]
    async fn released_reply_rejects_apply_and_release() {
        let (overrides, _, _) = setup("").await;
        let cancel = CancellationToken::new();
        let reply = overrides.draft(request("t1"), &cancel).await.unwrap();
        overrides.release(reply.id).await.unwrap();

        assert!(matches!(
            overrides.apply(reply.id, OverrideAction::from_text("late")).await,
            Err(OverrideError::InvalidState { .. })
        ));
        assert!(matches!(
            overrides.release(reply.id).await,
            Err(OverrideError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_reply_is_not_found() {
        let (overrides, _, _) = setup("").await;
        let err = overrides.release(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OverrideError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_override_text_is_rejected() {
        let (overrides, _, _) = setup("").await;
        let cancel = CancellationToken::new();
        let reply = overrides.draft(request("t1"), &cancel).await.unwrap();
        let err = overrides
            .apply(reply.id, OverrideAction::Replace("  ".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, OverrideError::InvalidState { .. }));
    }
}
