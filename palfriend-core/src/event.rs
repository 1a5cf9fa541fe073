//! Typed live events as delivered by the broadcast platform client.
//!
//! The wire shape is one JSON object per event:
//!
//! ```json
//! { "type": "gift", "actor": { "id": "u1", "nickname": "Ann" }, "giftName": "Rose", "repeatCount": 3 }
//! ```

use serde::{Deserialize, Serialize};

/// The seven event kinds the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Comment,
    Gift,
    Like,
    Join,
    Follow,
    Share,
    Subscribe,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Comment => "comment",
            EventKind::Gift => "gift",
            EventKind::Like => "like",
            EventKind::Join => "join",
            EventKind::Follow => "follow",
            EventKind::Share => "share",
            EventKind::Subscribe => "subscribe",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The viewer who caused an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Actor {
    /// Stable unique id. Events with an empty id are dropped at intake.
    pub id: String,
    pub nickname: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nickname: nickname.into(),
        }
    }

    /// Nickname, falling back to the id when the platform sent none.
    pub fn display_name(&self) -> &str {
        let nick = self.nickname.trim();
        if nick.is_empty() {
            &self.id
        } else {
            nick
        }
    }
}

/// Event-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum EventPayload {
    Comment {
        text: String,
    },
    Gift {
        #[serde(default = "default_gift_name")]
        gift_name: String,
        #[serde(default = "one")]
        repeat_count: u32,
    },
    Like {
        #[serde(default = "one")]
        count: u32,
    },
    Join,
    Follow,
    Share,
    Subscribe,
}

fn default_gift_name() -> String {
    "Gift".into()
}

fn one() -> u32 {
    1
}

/// A single live event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    #[serde(default)]
    pub actor: Actor,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl LiveEvent {
    pub fn new(actor: Actor, payload: EventPayload) -> Self {
        Self { actor, payload }
    }

    pub fn comment(actor: Actor, text: impl Into<String>) -> Self {
        Self::new(actor, EventPayload::Comment { text: text.into() })
    }

    pub fn join(actor: Actor) -> Self {
        Self::new(actor, EventPayload::Join)
    }

    pub fn gift(actor: Actor, gift_name: impl Into<String>, repeat_count: u32) -> Self {
        Self::new(
            actor,
            EventPayload::Gift {
                gift_name: gift_name.into(),
                repeat_count,
            },
        )
    }

    pub fn like(actor: Actor, count: u32) -> Self {
        Self::new(actor, EventPayload::Like { count })
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Comment { .. } => EventKind::Comment,
            EventPayload::Gift { .. } => EventKind::Gift,
            EventPayload::Like { .. } => EventKind::Like,
            EventPayload::Join => EventKind::Join,
            EventPayload::Follow => EventKind::Follow,
            EventPayload::Share => EventKind::Share,
            EventPayload::Subscribe => EventKind::Subscribe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gift_event_parses_from_camel_case_json() {
        let raw = r#"{"type":"gift","actor":{"id":"u1","nickname":"Ann"},"giftName":"Rose","repeatCount":3}"#;
        let evt: LiveEvent = serde_json::from_str(raw).expect("parse gift");
        assert_eq!(evt.kind(), EventKind::Gift);
        assert_eq!(evt.actor.display_name(), "Ann");
        assert_eq!(
            evt.payload,
            EventPayload::Gift {
                gift_name: "Rose".into(),
                repeat_count: 3
            }
        );
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let raw = r#"{"type":"gift","actor":{"id":"u2"}}"#;
        let evt: LiveEvent = serde_json::from_str(raw).expect("parse gift");
        assert_eq!(evt.actor.display_name(), "u2");
        assert_eq!(
            evt.payload,
            EventPayload::Gift {
                gift_name: "Gift".into(),
                repeat_count: 1
            }
        );

        let raw = r#"{"type":"join"}"#;
        let evt: LiveEvent = serde_json::from_str(raw).expect("parse join");
        assert!(evt.actor.id.is_empty());
        assert_eq!(evt.kind(), EventKind::Join);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"poll","actor":{"id":"u1"}}"#;
        assert!(serde_json::from_str::<LiveEvent>(raw).is_err());
    }
}
