//! Event model shared by publishers and subscribers.
//!
//! Every event travels in a [`BaseEvent`] envelope extended with domain
//! fields for one of three categories (chat, stream, user). The category
//! decides the broker stream, the subject namespace and the durable consumer;
//! the event type decides the final subject token.
//!
//! `timestamp` and `source` belong to the bus: they are overwritten at publish
//! time, so values set by producers never reach subscribers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// Categories
// ============================================================================

/// Event category. Each category maps to one broker stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Chat,
    Stream,
    User,
}

impl EventCategory {
    /// All categories, in provisioning order.
    pub const ALL: [EventCategory; 3] = [
        EventCategory::Chat,
        EventCategory::Stream,
        EventCategory::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Chat => "chat",
            EventCategory::Stream => "stream",
            EventCategory::User => "user",
        }
    }

    /// Broker-side stream name, e.g. `CHAT_EVENTS`.
    pub fn stream_name(&self) -> &'static str {
        match self {
            EventCategory::Chat => "CHAT_EVENTS",
            EventCategory::Stream => "STREAM_EVENTS",
            EventCategory::User => "USER_EVENTS",
        }
    }

    /// Wildcard capturing every subject of the category, e.g. `chat.events.>`.
    pub fn subject_wildcard(&self) -> String {
        format!("{}.events.>", self.as_str())
    }

    /// Subject for one event type: `<category>.events.<type>`.
    pub fn subject_for(&self, event_type: &str) -> String {
        format!("{}.events.{}", self.as_str(), event_type)
    }

    /// Durable consumer name, e.g. `chat-events-consumer`.
    pub fn consumer_name(&self) -> String {
        format!("{}-events-consumer", self.as_str())
    }

    /// Default retention. User events are kept a week for audit.
    pub fn default_max_age(&self) -> Duration {
        match self {
            EventCategory::Chat | EventCategory::Stream => Duration::from_secs(24 * 60 * 60),
            EventCategory::User => Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event types
// ============================================================================

/// Chat event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatEventType {
    #[serde(rename = "chat.message")]
    Message,
    #[serde(rename = "chat.room.created")]
    RoomCreated,
    #[serde(rename = "chat.room.joined")]
    RoomJoined,
    #[serde(rename = "chat.user.muted")]
    UserMuted,
}

impl ChatEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatEventType::Message => "chat.message",
            ChatEventType::RoomCreated => "chat.room.created",
            ChatEventType::RoomJoined => "chat.room.joined",
            ChatEventType::UserMuted => "chat.user.muted",
        }
    }
}

/// Stream event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamEventType {
    #[serde(rename = "stream.started")]
    Started,
    #[serde(rename = "stream.stopped")]
    Stopped,
    #[serde(rename = "stream.joined")]
    Joined,
    #[serde(rename = "stream.left")]
    Left,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventType::Started => "stream.started",
            StreamEventType::Stopped => "stream.stopped",
            StreamEventType::Joined => "stream.joined",
            StreamEventType::Left => "stream.left",
        }
    }
}

/// User event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserEventType {
    #[serde(rename = "user.registered")]
    Registered,
    #[serde(rename = "user.logged_in")]
    LoggedIn,
    #[serde(rename = "user.logged_out")]
    LoggedOut,
    #[serde(rename = "user.updated")]
    Updated,
}

impl UserEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserEventType::Registered => "user.registered",
            UserEventType::LoggedIn => "user.logged_in",
            UserEventType::LoggedOut => "user.logged_out",
            UserEventType::Updated => "user.updated",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

display_as_str!(ChatEventType, StreamEventType, UserEventType);

// ============================================================================
// Envelope
// ============================================================================

/// Common envelope carried by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEvent<T> {
    #[serde(rename = "type")]
    pub event_type: T,
    /// Set by the bus at publish time.
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_id: i64,
    /// Arbitrary payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Identifier of the publishing process. Set by the bus.
    #[serde(default)]
    pub source: String,
    /// Caller-supplied correlation id; empty is allowed.
    #[serde(default)]
    pub trace_id: String,
}

impl<T> BaseEvent<T> {
    pub fn new(event_type: T, user_id: i64) -> Self {
        Self {
            event_type,
            timestamp: DateTime::<Utc>::default(),
            user_id,
            data: serde_json::Value::Null,
            source: String::new(),
            trace_id: String::new(),
        }
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Chat event: envelope plus room/message identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(flatten)]
    pub base: BaseEvent<ChatEventType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
}

impl ChatEvent {
    pub fn new(event_type: ChatEventType, user_id: i64) -> Self {
        Self {
            base: BaseEvent::new(event_type, user_id),
            room_id: String::new(),
            message_id: String::new(),
        }
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self
    }

    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

/// Stream event: envelope plus stream/listener details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub base: BaseEvent<StreamEventType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quality: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub listener_id: i64,
}

impl StreamEvent {
    pub fn new(event_type: StreamEventType, user_id: i64) -> Self {
        Self {
            base: BaseEvent::new(event_type, user_id),
            stream_id: String::new(),
            quality: String::new(),
            listener_id: 0,
        }
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn with_listener(mut self, listener_id: i64) -> Self {
        self.listener_id = listener_id;
        self
    }
}

/// User event: envelope plus account details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(flatten)]
    pub base: BaseEvent<UserEventType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl UserEvent {
    pub fn new(event_type: UserEventType, user_id: i64) -> Self {
        Self {
            base: BaseEvent::new(event_type, user_id),
            email: String::new(),
            role: String::new(),
            status: String::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

// ============================================================================
// DomainEvent
// ============================================================================

/// An event the bus knows how to route.
///
/// Routing is derived from the category and the event type, both fixed at
/// compile time, so adding an event type is a checked change to one enum.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Category this event belongs to.
    const CATEGORY: EventCategory;

    /// Wire name of the event type, e.g. `chat.message`.
    fn event_type(&self) -> &'static str;

    /// Overwrite the bus-owned fields.
    fn stamp(&mut self, timestamp: DateTime<Utc>, source: &str);

    /// Broker subject for this event.
    fn subject(&self) -> String {
        Self::CATEGORY.subject_for(self.event_type())
    }
}

macro_rules! domain_event {
    ($event:ty, $category:expr) => {
        impl DomainEvent for $event {
            const CATEGORY: EventCategory = $category;

            fn event_type(&self) -> &'static str {
                self.base.event_type.as_str()
            }

            fn stamp(&mut self, timestamp: DateTime<Utc>, source: &str) {
                self.base.timestamp = timestamp;
                self.base.source = source.to_string();
            }
        }
    };
}

domain_event!(ChatEvent, EventCategory::Chat);
domain_event!(StreamEvent, EventCategory::Stream);
domain_event!(UserEvent, EventCategory::User);

/// Add-on builders shared by all envelopes.
pub trait EventEnvelope {
    fn with_data(self, data: serde_json::Value) -> Self;
    fn with_trace_id(self, trace_id: impl Into<String>) -> Self;
}

macro_rules! event_envelope {
    ($($event:ty),*) => {
        $(
            impl EventEnvelope for $event {
                fn with_data(mut self, data: serde_json::Value) -> Self {
                    self.base.data = data;
                    self
                }

                fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
                    self.base.trace_id = trace_id.into();
                    self
                }
            }
        )*
    };
}

event_envelope!(ChatEvent, StreamEvent, UserEvent);
