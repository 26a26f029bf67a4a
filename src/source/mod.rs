//! Message source capability — where threads and customer messages come from.

pub mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::model::{Message, Thread};

pub use http::HttpSource;

/// Remote messaging surface. Implementations own their session/credentials;
/// they are acquired once at startup and dropped on shutdown.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Threads waiting as message requests.
    async fn list_pending_threads(&self) -> Result<Vec<Thread>, SourceError>;

    /// Inbox threads with unread activity.
    async fn list_inbox_threads(&self) -> Result<Vec<Thread>, SourceError>;

    /// Recent text messages of a thread, in any order.
    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>, SourceError>;

    /// Accept a pending message request.
    async fn approve_thread_request(&self, thread_id: &str) -> Result<(), SourceError>;

    /// Deliver a reply.
    async fn send_message(&self, thread_id: &str, body: &str) -> Result<(), SourceError>;

    /// Clear the thread's unread marker so the inbox listing drops it.
    async fn mark_thread_seen(&self, thread_id: &str) -> Result<(), SourceError>;
}

/// Run a source call under the per-call timeout and the stop signal.
pub async fn bounded<T>(
    operation: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, SourceError>>,
) -> Result<T, SourceError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SourceError::Cancelled { operation: operation.to_string() }),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(inner) => inner,
            Err(_) => Err(SourceError::Timeout { operation: operation.to_string(), timeout }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = bounded("slow", Duration::from_millis(10), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SourceError::Timeout { .. })));
    }

    #[tokio::test]
    async fn bounded_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = bounded("any", Duration::from_secs(5), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SourceError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn bounded_passes_through() {
        let cancel = CancellationToken::new();
        let result = bounded("fast", Duration::from_secs(1), &cancel, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
