//! Threads, messages and pending replies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator text that suspends a pending reply instead of replacing it.
pub const WAIT_SENTINEL: &str = "WAIT";

/// Lifecycle status of a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadStatus {
    /// Normal processing.
    Active,
    /// Message request not yet accepted on the source.
    PendingApproval,
    /// An operator suspended the reply; the pipeline leaves the thread alone.
    WaitingForHuman,
}

impl Default for ThreadStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::PendingApproval => write!(f, "pending-approval"),
            Self::WaitingForHuman => write!(f, "waiting-for-human"),
        }
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "pending-approval" => Ok(Self::PendingApproval),
            "waiting-for-human" => Ok(Self::WaitingForHuman),
            _ => Err(format!("Unknown thread status: {}", s)),
        }
    }
}

/// A conversation thread on the message source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    /// Display name of the customer, when the source provides one.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: ThreadStatus,
}

impl Thread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            last_synced_at: None,
            status: ThreadStatus::Active,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_status(mut self, status: ThreadStatus) -> Self {
        self.status = status;
        self
    }

    /// Username for dashboard display.
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("unknown_user")
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    Bot,
    Customer,
}

impl std::fmt::Display for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bot => write!(f, "bot"),
            Self::Customer => write!(f, "customer"),
        }
    }
}

impl std::str::FromStr for Author {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bot" => Ok(Self::Bot),
            "customer" => Ok(Self::Customer),
            _ => Err(format!("Unknown author: {}", s)),
        }
    }
}

/// A single message in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per source.
    pub id: String,
    pub thread_id: String,
    pub author: Author,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Body was replaced by an operator before sending.
    #[serde(default)]
    pub overridden: bool,
    /// For bot messages: delivered to the source. For customer messages:
    /// answered by a delivered bot message.
    #[serde(default)]
    pub sent: bool,
}

impl Message {
    /// A customer message as fetched from the source.
    pub fn customer(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            author: Author::Customer,
            body: body.into(),
            created_at,
            overridden: false,
            sent: false,
        }
    }

    /// Bot message id derived from the pending reply it was released from,
    /// so re-materializing the same reply never yields a second record.
    pub fn bot_id_for(reply_id: Uuid) -> String {
        format!("bot_{reply_id}")
    }

    /// Pending reply a bot message was released from, if any.
    pub fn reply_id(&self) -> Option<Uuid> {
        self.id
            .strip_prefix("bot_")
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    pub fn is_from_bot(&self) -> bool {
        self.author == Author::Bot
    }
}

/// State of a drafted bot reply awaiting release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyState {
    /// Generated, not yet acted on.
    Drafted,
    /// Operator supplied replacement text.
    Overridden,
    /// Operator asked to hold; needs new text before it can be released.
    Suspended,
    /// Consumed; materialized into a bot message.
    Released,
}

impl ReplyState {
    /// States that count toward the one-outstanding-draft rule.
    pub fn blocks_new_draft(self) -> bool {
        matches!(self, Self::Drafted | Self::Overridden)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drafted => "drafted",
            Self::Overridden => "overridden",
            Self::Suspended => "suspended",
            Self::Released => "released",
        }
    }
}

impl std::fmt::Display for ReplyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReplyState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafted" => Ok(Self::Drafted),
            "overridden" => Ok(Self::Overridden),
            "suspended" => Ok(Self::Suspended),
            "released" => Ok(Self::Released),
            _ => Err(format!("Unknown reply state: {}", s)),
        }
    }
}

/// A drafted bot reply held for possible operator override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReply {
    pub id: Uuid,
    pub thread_id: String,
    pub body: String,
    pub state: ReplyState,
    /// Customer messages this reply answers.
    #[serde(default)]
    pub source_message_ids: Vec<String>,
    /// Operator text replaced the generated body at some point.
    #[serde(default)]
    pub overridden: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingReply {
    /// Create a new reply in `drafted` state.
    pub fn drafted(
        thread_id: impl Into<String>,
        body: impl Into<String>,
        source_message_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            body: body.into(),
            state: ReplyState::Drafted,
            source_message_ids,
            overridden: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Materialize the bot message this reply turns into when released.
    pub fn to_message(&self) -> Message {
        Message {
            id: Message::bot_id_for(self.id),
            thread_id: self.thread_id.clone(),
            author: Author::Bot,
            body: self.body.clone(),
            created_at: self.updated_at,
            overridden: self.overridden,
            sent: false,
        }
    }
}

/// What an operator asked for on a pending reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideAction {
    /// Replace the draft body.
    Replace(String),
    /// Suspend the reply and hand the thread to a human.
    Wait,
}

impl OverrideAction {
    /// Interpret operator text; the bare sentinel `WAIT` suspends.
    pub fn from_text(text: &str) -> Self {
        if text.trim() == WAIT_SENTINEL {
            Self::Wait
        } else {
            Self::Replace(text.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_status_roundtrip() {
        for status in [
            ThreadStatus::Active,
            ThreadStatus::PendingApproval,
            ThreadStatus::WaitingForHuman,
        ] {
            let parsed: ThreadStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("closed".parse::<ThreadStatus>().is_err());
    }

    #[test]
    fn only_drafted_and_overridden_block_new_drafts() {
        assert!(ReplyState::Drafted.blocks_new_draft());
        assert!(ReplyState::Overridden.blocks_new_draft());
        assert!(!ReplyState::Suspended.blocks_new_draft());
        assert!(!ReplyState::Released.blocks_new_draft());
    }

    #[test]
    fn released_message_carries_override_flag() {
        let mut reply = PendingReply::drafted("t1", "hi", vec!["m1".into()]);
        assert!(!reply.to_message().overridden);

        reply.state = ReplyState::Overridden;
        reply.overridden = true;
        let msg = reply.to_message();
        assert!(msg.overridden);
        assert_eq!(msg.author, Author::Bot);
        assert_eq!(msg.id, format!("bot_{}", reply.id));
        assert_eq!(msg.reply_id(), Some(reply.id));
    }

    #[test]
    fn wait_sentinel_parsing() {
        assert_eq!(OverrideAction::from_text("WAIT"), OverrideAction::Wait);
        assert_eq!(OverrideAction::from_text(" WAIT\n"), OverrideAction::Wait);
        assert_eq!(
            OverrideAction::from_text("wait a sec"),
            OverrideAction::Replace("wait a sec".into())
        );
    }

    #[test]
    fn thread_serializes_kebab_status() {
        let t = Thread::new("t1").with_status(ThreadStatus::WaitingForHuman);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["status"], "waiting-for-human");
        assert_eq!(t.display_name(), "unknown_user");
    }
}
