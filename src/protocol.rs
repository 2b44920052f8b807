use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Short identifier used to tag one Session's log lines.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string()[..8].to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Next process-local event id. Shared by every event kind that carries one.
pub fn next_event_id() -> u64 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

// ── Decoded room events ──

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ChatMessage {
        id: u64,
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
        text: String,
        timestamp: DateTime<Utc>,
    },
    EnterNotice {
        id: u64,
        username: String,
        timestamp: DateTime<Utc>,
    },
    GiftNotice {
        id: u64,
        username: String,
        gift_name: String,
        gift_count: u64,
        timestamp: DateTime<Utc>,
    },
    SuperChatMessage {
        id: u64,
        username: String,
        avatar: String,
        text: String,
        amount: u64,
        timestamp: DateTime<Utc>,
    },
    WatchedCountUpdate {
        count: u64,
    },
    OnlineRankCountUpdate {
        count: u64,
    },
    /// Room popularity carried by heartbeat replies.
    PopularityUpdate {
        count: u32,
    },
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatMessage { username, text, .. } => write!(f, "{username}: {text}"),
            Self::EnterNotice { username, .. } => write!(f, "{username} entered the room"),
            Self::GiftNotice {
                username,
                gift_name,
                gift_count,
                ..
            } => write!(f, "{username} sent {gift_name} x{gift_count}"),
            Self::SuperChatMessage {
                username,
                text,
                amount,
                ..
            } => write!(f, "[SC ¥{amount}] {username}: {text}"),
            Self::WatchedCountUpdate { count } => write!(f, "watched: {count}"),
            Self::OnlineRankCountUpdate { count } => write!(f, "online rank: {count}"),
            Self::PopularityUpdate { count } => write!(f, "popularity: {count}"),
        }
    }
}

// ── Session notifications (Session → subscribers) ──

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    Connected,
    Disconnected(CloseReason),
    Event(DomainEvent),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `disconnect()` was called locally.
    Requested,
    /// The server closed the socket or the stream ended.
    ServerClosed,
    /// The socket failed while reading or writing.
    TransportError(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "closed by client"),
            Self::ServerClosed => write!(f, "closed by server"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_increase() {
        let a = next_event_id();
        let b = next_event_id();
        assert!(b > a);
    }

    #[test]
    fn notification_serializes_with_type_tag() {
        let n = Notification::Event(DomainEvent::WatchedCountUpdate { count: 7 });
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["payload"]["type"], "watched_count_update");
        assert_eq!(json["payload"]["count"], 7);
    }

    #[test]
    fn session_id_is_short() {
        assert_eq!(SessionId::new().0.len(), 8);
    }
}
