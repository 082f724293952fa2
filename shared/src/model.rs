use serde::{Deserialize, Serialize};
use std::fmt;

use crate::UnixTimeMs;

/// Session-monotonic message identifier. Also the primary key in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    You,
    Other,
}

impl MessageSource {
    /// Compact flag used by the persisted record.
    #[must_use]
    pub const fn to_flag(self) -> u8 {
        match self {
            MessageSource::You => 0,
            MessageSource::Other => 1,
        }
    }

    #[must_use]
    pub const fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(MessageSource::You),
            1 => Some(MessageSource::Other),
            _ => None,
        }
    }
}

/// A single chat message. Never mutated after construction; the log only
/// grows or is replaced wholesale on reload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    id: MessageId,
    text: String,
    source: MessageSource,
    #[serde(with = "millis_string")]
    time_stamp: UnixTimeMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_inappropriate: Option<bool>,
}

impl ChatMessage {
    pub fn new(
        id: MessageId,
        text: impl Into<String>,
        source: MessageSource,
        time_stamp: UnixTimeMs,
        is_inappropriate: Option<bool>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            source,
            time_stamp,
            is_inappropriate,
        }
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn source(&self) -> MessageSource {
        self.source
    }

    #[must_use]
    pub fn time_stamp(&self) -> UnixTimeMs {
        self.time_stamp
    }

    /// `None` when the message was sent with filtering disabled.
    #[must_use]
    pub fn is_inappropriate(&self) -> Option<bool> {
        self.is_inappropriate
    }
}

// Redact debug output because the text is user-provided content.
impl fmt::Debug for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatMessage")
            .field("id", &self.id)
            .field("text_len", &self.text.chars().count())
            .field("source", &self.source)
            .field("time_stamp", &self.time_stamp)
            .field("is_inappropriate", &self.is_inappropriate)
            .finish()
    }
}

/// Formatted separator shown above a group of messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampMarker {
    pub value: String,
    /// The message this marker sits above.
    pub anchor: MessageId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupedItem {
    Timestamp(TimestampMarker),
    Message(ChatMessage),
}

/// Stable identity of a display item across regroupings, used to keep size
/// measurements attached to the right row when the list grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Marker(MessageId),
    Message(MessageId),
}

impl GroupedItem {
    #[must_use]
    pub fn key(&self) -> ItemKey {
        match self {
            GroupedItem::Timestamp(marker) => ItemKey::Marker(marker.anchor),
            GroupedItem::Message(message) => ItemKey::Message(message.id()),
        }
    }

    #[must_use]
    pub fn as_message(&self) -> Option<&ChatMessage> {
        match self {
            GroupedItem::Message(message) => Some(message),
            GroupedItem::Timestamp(_) => None,
        }
    }
}

/// `timeStamp` travels as a decimal string; numbers are accepted on input.
mod millis_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::UnixTimeMs;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &UnixTimeMs, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.0.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UnixTimeMs, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text
                .trim()
                .parse::<u64>()
                .map(UnixTimeMs)
                .map_err(|e| de::Error::custom(format!("invalid timeStamp {text:?}: {e}"))),
            Raw::Number(ms) => Ok(UnixTimeMs(ms)),
        }
    }
}
