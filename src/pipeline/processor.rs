//! Thread pipeline — one thread, one cycle.
//!
//! Flow:
//! 1. Fetch the thread's messages from the source
//! 2. Reconcile bot replies that were committed but maybe not delivered
//! 3. Deliver or hold outstanding pending replies
//! 4. Ingest new customer messages, combine into batches
//! 5. Per batch: context → draft → (auto-)release → commit → send
//!
//! Stages run strictly in sequence. Every error stays inside this thread's
//! run; the next poll is the retry.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FIRST_INTERACTION_NOTE, PipelineConfig};
use crate::error::{OverrideError, PipelineError};
use crate::model::{Message, PendingReply, ReplyState, Thread, ThreadStatus};
use crate::observe::Observer;
use crate::pipeline::combiner::{batch_text, combine};
use crate::pipeline::context::ContextAssembler;
use crate::pipeline::dual_writer::DualWriter;
use crate::pipeline::override_store::{DraftRequest, OverrideStore};
use crate::source::{self, MessageSource};
use crate::store::OperationalStore;

/// API names used for outbound call stats.
const COMPLETION_API: &str = "completion";
const SEND_API: &str = "send_message";
const SEEN_API: &str = "mark_thread_seen";

/// Clock slack when matching a committed reply against source messages.
const DELIVERY_SKEW_MINUTES: i64 = 5;

/// What one pipeline run did for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadOutcome {
    /// Parked for a human; nothing fetched.
    Skipped,
    /// Another lane is already running this thread.
    InFlight,
    /// Nothing new.
    Idle,
    /// A draft is waiting for operator review.
    AwaitingReview { new_messages: usize },
    Replied { new_messages: usize, sent: usize },
}

impl ThreadOutcome {
    /// Whether the run saw new customer activity or delivered anything.
    pub fn had_activity(&self) -> bool {
        match self {
            Self::Skipped | Self::InFlight | Self::Idle => false,
            Self::AwaitingReview { new_messages } => *new_messages > 0,
            Self::Replied { new_messages, sent } => *new_messages > 0 || *sent > 0,
        }
    }
}

/// Runs the per-thread pipeline. Shared by both lanes.
pub struct ThreadPipeline {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn OperationalStore>,
    context: ContextAssembler,
    overrides: Arc<OverrideStore>,
    writer: DualWriter,
    observer: Arc<Observer>,
    config: PipelineConfig,
    in_flight: DashSet<String>,
}

/// Holds a thread id in the in-flight set until dropped.
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    thread_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.thread_id);
    }
}

impl ThreadPipeline {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn OperationalStore>,
        overrides: Arc<OverrideStore>,
        writer: DualWriter,
        observer: Arc<Observer>,
        config: PipelineConfig,
    ) -> Self {
        let context = ContextAssembler::new(
            store.clone(),
            config.preserve_context,
            config.context_limit,
            config.response_prefix.clone(),
        );
        Self {
            source,
            store,
            context,
            overrides,
            writer,
            observer,
            config,
            in_flight: DashSet::new(),
        }
    }

    pub fn source(&self) -> &Arc<dyn MessageSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn OperationalStore> {
        &self.store
    }

    pub fn writer(&self) -> &DualWriter {
        &self.writer
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        self.config.call_timeout
    }

    /// Run one cycle for `thread`.
    pub async fn run(
        &self,
        thread: &Thread,
        cancel: &CancellationToken,
    ) -> Result<ThreadOutcome, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !self.in_flight.insert(thread.id.clone()) {
            debug!(thread_id = %thread.id, "Thread already in flight, skipping");
            return Ok(ThreadOutcome::InFlight);
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            thread_id: thread.id.clone(),
        };

        let mut thread = thread.clone();
        if let Some(stored) = self.store.get_thread(&thread.id).await? {
            if stored.status == ThreadStatus::WaitingForHuman {
                debug!(thread_id = %thread.id, "Thread waiting for human, skipping");
                return Ok(ThreadOutcome::Skipped);
            }
            if thread.username.is_none() {
                thread.username = stored.username;
            }
        }
        self.store.upsert_thread(&thread).await?;
        self.writer.record_thread(&thread).await;

        let mut remote = source::bounded(
            "fetch_messages",
            self.config.call_timeout,
            cancel,
            self.source.fetch_messages(&thread.id),
        )
        .await?;
        remote.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut sent = self.reconcile(&thread, &remote, cancel).await?;

        for reply in self.overrides.pending_for_thread(&thread.id).await? {
            match reply.state {
                ReplyState::Suspended => {
                    self.store
                        .set_thread_status(&thread.id, ThreadStatus::WaitingForHuman)
                        .await?;
                    self.writer
                        .record_thread(&thread.clone().with_status(ThreadStatus::WaitingForHuman))
                        .await;
                    return Ok(ThreadOutcome::Skipped);
                }
                ReplyState::Drafted if !self.review_window_elapsed(&reply) => {
                    debug!(thread_id = %thread.id, reply_id = %reply.id, "Draft awaiting review");
                    return Ok(ThreadOutcome::AwaitingReview { new_messages: 0 });
                }
                ReplyState::Drafted | ReplyState::Overridden => {
                    self.deliver(&reply, &thread, cancel).await?;
                    sent += 1;
                }
                ReplyState::Released => {}
            }
        }

        let new_messages = self.ingest(&thread, &remote).await?;
        if new_messages.is_empty() {
            self.store.touch_thread(&thread.id, Utc::now()).await?;
            return Ok(if sent > 0 {
                ThreadOutcome::Replied {
                    new_messages: 0,
                    sent,
                }
            } else {
                ThreadOutcome::Idle
            });
        }

        let first_interaction = !self.store.has_bot_message(&thread.id).await?;
        let system_prompt = if first_interaction {
            format!("{}\n\n{}", self.config.system_prompt, FIRST_INTERACTION_NOTE)
        } else {
            self.config.system_prompt.clone()
        };

        let batches = combine(
            &new_messages,
            self.config.combine_messages,
            self.config.combine_limit,
        );
        info!(
            thread_id = %thread.id,
            new_messages = new_messages.len(),
            batches = batches.len(),
            "Processing new messages"
        );

        for batch in batches {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
            let context = self.context.assemble(&thread.id, &ids).await?;
            let input = batch_text(&batch);

            let drafted = self
                .overrides
                .draft(
                    DraftRequest {
                        thread_id: &thread.id,
                        system_prompt: &system_prompt,
                        context: &context,
                        input: &input,
                        source_message_ids: ids,
                    },
                    cancel,
                )
                .await;
            match &drafted {
                Ok(_) => self.writer.record_api_call(COMPLETION_API, true).await,
                Err(OverrideError::Completion(_)) => {
                    self.writer.record_api_call(COMPLETION_API, false).await
                }
                Err(_) => {}
            }
            let reply = drafted?;

            if !self.review_window_elapsed(&reply) {
                return Ok(ThreadOutcome::AwaitingReview {
                    new_messages: new_messages.len(),
                });
            }
            self.deliver(&reply, &thread, cancel).await?;
            sent += 1;
        }

        Ok(ThreadOutcome::Replied {
            new_messages: new_messages.len(),
            sent,
        })
    }

    fn review_window_elapsed(&self, reply: &PendingReply) -> bool {
        if self.config.auto_release_after.is_zero() {
            return true;
        }
        let age = Utc::now().signed_duration_since(reply.updated_at);
        age.to_std()
            .is_ok_and(|age| age >= self.config.auto_release_after)
    }

    /// Release → commit → send → mark sent.
    async fn deliver(
        &self,
        reply: &PendingReply,
        thread: &Thread,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let message = self.overrides.release(reply.id).await?;
        self.writer.commit(&message, thread).await?;
        self.send(&message, &reply.source_message_ids, cancel).await
    }

    async fn send(
        &self,
        message: &Message,
        answered: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let result = source::bounded(
            "send_message",
            self.config.call_timeout,
            cancel,
            self.source.send_message(&message.thread_id, &message.body),
        )
        .await;
        self.writer.record_api_call(SEND_API, result.is_ok()).await;
        result?;

        let mut ids = Vec::with_capacity(answered.len() + 1);
        ids.push(message.id.clone());
        ids.extend(answered.iter().cloned());
        self.writer.mark_sent(&ids).await?;
        self.observer.reply_sent();
        info!(
            thread_id = %message.thread_id,
            message_id = %message.id,
            overridden = message.overridden,
            "Reply sent"
        );

        // Best effort: the reply is already out.
        let seen = source::bounded(
            "mark_thread_seen",
            self.config.call_timeout,
            cancel,
            self.source.mark_thread_seen(&message.thread_id),
        )
        .await;
        self.writer.record_api_call(SEEN_API, seen.is_ok()).await;
        if let Err(e) = seen {
            warn!(thread_id = %message.thread_id, "Could not mark thread seen: {e}");
        }
        Ok(())
    }

    /// Finish bot replies an earlier cycle committed but did not confirm.
    ///
    /// A reply already visible on the source is only marked sent; anything
    /// else is sent again. Released replies that never got their message
    /// committed are materialized first.
    async fn reconcile(
        &self,
        thread: &Thread,
        remote: &[Message],
        cancel: &CancellationToken,
    ) -> Result<usize, PipelineError> {
        for reply in self.store.orphaned_releases(&thread.id).await? {
            warn!(reply_id = %reply.id, "Committing released reply without a message");
            self.writer.commit(&reply.to_message(), thread).await?;
        }

        let mut sent = 0;
        for message in self.store.unsent_bot_messages(&thread.id).await? {
            let answered = match message.reply_id() {
                Some(id) => self
                    .store
                    .get_pending_reply(id)
                    .await?
                    .map(|r| r.source_message_ids)
                    .unwrap_or_default(),
                None => Vec::new(),
            };

            let not_before = message.created_at - chrono::Duration::minutes(DELIVERY_SKEW_MINUTES);
            let delivered = remote.iter().any(|m| {
                m.is_from_bot()
                    && m.created_at >= not_before
                    && m.body.trim() == message.body.trim()
            });
            if delivered {
                let mut ids = answered;
                ids.push(message.id.clone());
                self.writer.mark_sent(&ids).await?;
                debug!(message_id = %message.id, "Reply already delivered");
            } else {
                self.send(&message, &answered, cancel).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Store customer messages newer than the last bot message, then
    /// return every stored customer message no delivered reply has
    /// answered yet, in arrival order.
    ///
    /// Earlier-cycle messages whose batch failed sit behind our own reply
    /// on the source, so the store is what keeps them in play.
    async fn ingest(
        &self,
        thread: &Thread,
        remote: &[Message],
    ) -> Result<Vec<Message>, PipelineError> {
        let after_last_bot = remote
            .iter()
            .rposition(Message::is_from_bot)
            .map_or(0, |i| i + 1);

        for message in &remote[after_last_bot..] {
            if let Some(stored) = self.store.get_message(&message.id).await?
                && stored.sent
            {
                continue;
            }
            self.writer.commit(message, thread).await?;
        }

        let pending = self.store.unanswered_messages(&thread.id).await?;
        let carried = pending
            .iter()
            .filter(|m| !remote[after_last_bot..].iter().any(|r| r.id == m.id))
            .count();
        if carried > 0 {
            debug!(thread_id = %thread.id, carried, "Retrying unanswered messages");
        }
        Ok(pending)
    }
}
