//! Polling scheduler — two independent lanes feeding the thread pipeline.
//!
//! - **pending-intake**: accepts message requests, then runs the pipeline
//!   on each of them
//! - **inbox**: runs the pipeline on inbox threads with activity
//!
//! Each lane task owns its `BackoffState`. Threads within a cycle run
//! concurrently; a thread's own stages run in order. Nothing a single
//! thread does can stop its lane; only the cancellation token can.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackoffConfig;
use crate::error::{CompletionError, OverrideError, PipelineError, SourceError};
use crate::model::{Thread, ThreadStatus};
use crate::observe::{Event, Lane, Observer};
use crate::pipeline::{BackoffState, ThreadPipeline};
use crate::source;

/// API name used for approval call stats.
const APPROVE_API: &str = "approve_thread_request";

/// Result of one lane cycle, as far as backoff is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Activity,
    Empty,
    /// Listing failed; counts as empty.
    Failed,
}

pub struct Scheduler {
    pipeline: Arc<ThreadPipeline>,
    observer: Arc<Observer>,
    pending_lane: BackoffConfig,
    inbox_lane: BackoffConfig,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<ThreadPipeline>,
        observer: Arc<Observer>,
        pending_lane: BackoffConfig,
        inbox_lane: BackoffConfig,
    ) -> Self {
        Self {
            pipeline,
            observer,
            pending_lane,
            inbox_lane,
        }
    }

    /// Spawn both lanes. They run until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        [Lane::PendingIntake, Lane::Inbox]
            .into_iter()
            .map(|lane| {
                let scheduler = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { scheduler.run_lane(lane, cancel).await })
            })
            .collect()
    }

    fn backoff_config(&self, lane: Lane) -> &BackoffConfig {
        match lane {
            Lane::PendingIntake => &self.pending_lane,
            Lane::Inbox => &self.inbox_lane,
        }
    }

    /// Sleep, poll, adjust backoff; repeat until cancelled.
    pub async fn run_lane(&self, lane: Lane, cancel: CancellationToken) {
        let mut backoff = BackoffState::new(self.backoff_config(lane));
        info!(
            lane = %lane,
            min_secs = backoff.minimum().as_secs(),
            max_secs = backoff.maximum().as_secs(),
            "Lane started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff.current()) => {}
            }
            self.cycle(lane, &mut backoff, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }
        }
        info!(lane = %lane, "Lane stopped");
    }

    /// One poll plus the backoff update.
    pub async fn cycle(
        &self,
        lane: Lane,
        backoff: &mut BackoffState,
        cancel: &CancellationToken,
    ) -> PollResult {
        let result = self.poll_once(lane, cancel).await;
        match result {
            PollResult::Activity => backoff.record_activity(),
            PollResult::Empty | PollResult::Failed => backoff.record_empty(),
        }
        debug!(
            lane = %lane,
            result = ?result,
            next_secs = backoff.current().as_secs_f64(),
            "Lane cycle complete"
        );
        result
    }

    pub async fn poll_once(&self, lane: Lane, cancel: &CancellationToken) -> PollResult {
        match lane {
            Lane::PendingIntake => self.poll_pending_intake(cancel).await,
            Lane::Inbox => self.poll_inbox(cancel).await,
        }
    }

    async fn poll_pending_intake(&self, cancel: &CancellationToken) -> PollResult {
        let remote = self.pipeline.source();
        let listed = source::bounded(
            "list_pending_threads",
            self.pipeline.call_timeout(),
            cancel,
            remote.list_pending_threads(),
        )
        .await;
        let threads = match listed {
            Ok(threads) => threads,
            Err(e) => return self.listing_failed(Lane::PendingIntake, e),
        };
        if threads.is_empty() {
            return PollResult::Empty;
        }

        info!(count = threads.len(), "Pending message requests found");
        join_all(threads.iter().map(|t| self.intake_thread(t, cancel))).await;
        PollResult::Activity
    }

    async fn intake_thread(&self, thread: &Thread, cancel: &CancellationToken) {
        let store = self.pipeline.store();
        let pending = thread.clone().with_status(ThreadStatus::PendingApproval);
        if let Err(e) = store.upsert_thread(&pending).await {
            self.contain(Lane::PendingIntake, &thread.id, e.into());
            return;
        }

        let approved = source::bounded(
            "approve_thread_request",
            self.pipeline.call_timeout(),
            cancel,
            self.pipeline.source().approve_thread_request(&thread.id),
        )
        .await;
        self.pipeline
            .writer()
            .record_api_call(APPROVE_API, approved.is_ok())
            .await;

        let current = match approved {
            Ok(()) => {
                if let Err(e) = store.set_thread_status(&thread.id, ThreadStatus::Active).await {
                    self.contain(Lane::PendingIntake, &thread.id, e.into());
                    return;
                }
                let active = thread.clone().with_status(ThreadStatus::Active);
                info!(thread_id = %thread.id, user = active.display_name(), "Message request accepted");
                active
            }
            Err(SourceError::Cancelled { .. }) => return,
            Err(e) => {
                // Stays pending-approval so the next cycle approves again;
                // the messages are still answered now.
                self.contain(Lane::PendingIntake, &thread.id, e.into());
                warn!(thread_id = %thread.id, "Could not approve request, processing anyway");
                pending
            }
        };
        self.pipeline.writer().record_thread(&current).await;

        if let Err(e) = self.pipeline.run(&current, cancel).await {
            self.contain(Lane::PendingIntake, &thread.id, e);
        }
    }

    async fn poll_inbox(&self, cancel: &CancellationToken) -> PollResult {
        let remote = self.pipeline.source();
        let listed = source::bounded(
            "list_inbox_threads",
            self.pipeline.call_timeout(),
            cancel,
            remote.list_inbox_threads(),
        )
        .await;
        let threads = match listed {
            Ok(threads) => threads,
            Err(e) => return self.listing_failed(Lane::Inbox, e),
        };
        if threads.is_empty() {
            return PollResult::Empty;
        }

        let outcomes = join_all(threads.iter().map(|t| async move {
            match self.pipeline.run(t, cancel).await {
                Ok(outcome) => outcome.had_activity(),
                Err(e) => {
                    self.contain(Lane::Inbox, &t.id, e);
                    false
                }
            }
        }))
        .await;

        if outcomes.into_iter().any(|active| active) {
            PollResult::Activity
        } else {
            PollResult::Empty
        }
    }

    fn listing_failed(&self, lane: Lane, error: SourceError) -> PollResult {
        if !matches!(error, SourceError::Cancelled { .. }) {
            self.observer.emit(Event::TransientSource {
                lane,
                error: &error.to_string(),
            });
        }
        PollResult::Failed
    }

    /// Turn a thread's pipeline error into an observability event.
    fn contain(&self, lane: Lane, thread_id: &str, error: PipelineError) {
        let message = error.to_string();
        match &error {
            PipelineError::Cancelled
            | PipelineError::Source(SourceError::Cancelled { .. })
            | PipelineError::Draft(OverrideError::Completion(CompletionError::Cancelled)) => {
                debug!(thread_id, "Thread pipeline cancelled");
            }
            PipelineError::Source(_) => self.observer.emit(Event::TransientSource {
                lane,
                error: &message,
            }),
            PipelineError::Draft(OverrideError::Completion(_)) => {
                self.observer.emit(Event::Completion {
                    thread_id,
                    error: &message,
                })
            }
            PipelineError::Draft(OverrideError::Conflict { .. }) => {
                self.observer.emit(Event::Conflict { thread_id })
            }
            // Already reported by the dual writer.
            PipelineError::Commit(_) => debug!(thread_id, error = %message, "Commit failed"),
            _ => self.observer.emit(Event::ThreadFailed {
                thread_id,
                error: &message,
            }),
        }
    }
}
