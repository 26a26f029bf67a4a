//! Message combiner — groups a thread's unanswered customer messages into
//! batches that each get a single reply.
//!
//! Combination is cycle-bounded: whatever arrived by the time of the fetch
//! is grouped now, with no debounce timer.

use tracing::debug;

use crate::model::{Author, Message};

/// Split `messages` (one thread, arrival order) into batches.
///
/// Each batch is non-empty, holds at most `limit` messages, and contains
/// only contiguous customer messages from a single thread. A bot message
/// closes the current batch and is never part of one. With `enabled`
/// false, every customer message is its own batch.
pub fn combine(messages: &[Message], enabled: bool, limit: usize) -> Vec<Vec<Message>> {
    let limit = if enabled { limit.max(1) } else { 1 };
    let mut batches: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();

    for message in messages {
        let breaks_run = message.author != Author::Customer
            || current
                .first()
                .is_some_and(|first| first.thread_id != message.thread_id);
        if breaks_run && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
        }
        if message.author != Author::Customer {
            continue;
        }

        current.push(message.clone());
        if current.len() >= limit {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    debug!(
        messages = messages.len(),
        batches = batches.len(),
        "Combined messages"
    );
    batches
}

/// Text handed to the completion service for a batch.
pub fn batch_text(batch: &[Message]) -> String {
    batch
        .iter()
        .map(|m| m.body.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn customer(id: &str, thread: &str) -> Message {
        Message::customer(id, thread, format!("body {id}"), Utc::now())
    }

    fn bot(id: &str, thread: &str) -> Message {
        let mut m = customer(id, thread);
        m.author = Author::Bot;
        m
    }

    fn ids(batches: &[Vec<Message>]) -> Vec<Vec<&str>> {
        batches
            .iter()
            .map(|b| b.iter().map(|m| m.id.as_str()).collect())
            .collect()
    }

    #[test]
    fn three_messages_under_limit_make_one_batch() {
        let msgs = vec![customer("a", "t"), customer("b", "t"), customer("c", "t")];
        let batches = combine(&msgs, true, 5);
        assert_eq!(ids(&batches), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn batches_respect_limit() {
        let msgs: Vec<_> = (0..7).map(|i| customer(&format!("m{i}"), "t")).collect();
        let batches = combine(&msgs, true, 3);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn disabled_yields_singletons() {
        let msgs = vec![customer("a", "t"), customer("b", "t")];
        let batches = combine(&msgs, false, 5);
        assert_eq!(ids(&batches), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn bot_message_breaks_contiguity() {
        let msgs = vec![customer("a", "t"), bot("x", "t"), customer("b", "t")];
        let batches = combine(&msgs, true, 5);
        assert_eq!(ids(&batches), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn threads_never_mix() {
        let msgs = vec![customer("a", "t1"), customer("b", "t2")];
        let batches = combine(&msgs, true, 5);
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert!(batch.iter().all(|m| m.thread_id == batch[0].thread_id));
        }
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(combine(&[], true, 5).is_empty());
    }

    #[test]
    fn batch_text_joins_in_order() {
        let mut a = customer("a", "t");
        a.body = "hi".into();
        let mut b = customer("b", "t");
        b.body = "are you there?".into();
        b.created_at = a.created_at + Duration::seconds(1);
        assert_eq!(batch_text(&[a, b]), "hi\nare you there?");
    }
}
