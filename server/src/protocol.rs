//! Notification wire protocol for Eventcast clients.
//!
//! Every notification pushed to a connected client is a single JSON text frame
//! with exactly two fields:
//!
//! ```json
//! { "type": "joined_event", "data": { "id": 7, "participant": { "id": 3, "name": "Ann" } } }
//! ```
//!
//! The set of kinds is closed. Payload shapes of existing kinds are part of the
//! client compatibility contract; new kinds may be added, existing shapes may
//! not change.
//!
//! Clients may additionally send the plain-text liveness probe
//! [`PING`] and receive [`PONG`] in reply.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Inbound plain-text liveness probe.
pub const PING: &str = "ping";

/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Format used for event date-times on the wire and when creating events.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The kind of a notification, as carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    EventCreated,
    EventCanceled,
    JoinedEvent,
    LeftEvent,
}

impl NotificationKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventCreated => "event_created",
            Self::EventCanceled => "event_canceled",
            Self::JoinedEvent => "joined_event",
            Self::LeftEvent => "left_event",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user as seen by other clients: identity and display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub name: String,
}

impl Participant {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Full public projection of an event, sent with `event_created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventProjection {
    pub id: i64,
    pub title: String,
    #[serde(with = "date_time_format")]
    pub date_time: NaiveDateTime,
    /// Duration in whole minutes; rendered as a human-readable string.
    #[serde(with = "duration_format")]
    pub duration: i64,
    pub address: Option<String>,
    pub is_cancelled: bool,
}

/// Payload of `event_canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub id: i64,
}

/// Payload of `joined_event` and `left_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantChange {
    pub id: i64,
    pub participant: Participant,
}

/// A change notification broadcast to every connected client.
///
/// Serializes adjacently tagged, producing the `{"type": ..., "data": ...}`
/// frame shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    EventCreated(EventProjection),
    EventCanceled(EventRef),
    JoinedEvent(ParticipantChange),
    LeftEvent(ParticipantChange),
}

impl Notification {
    pub fn event_created(event: EventProjection) -> Self {
        Self::EventCreated(event)
    }

    pub fn event_canceled(event_id: i64) -> Self {
        Self::EventCanceled(EventRef { id: event_id })
    }

    pub fn joined_event(event_id: i64, participant: Participant) -> Self {
        Self::JoinedEvent(ParticipantChange {
            id: event_id,
            participant,
        })
    }

    pub fn left_event(event_id: i64, participant: Participant) -> Self {
        Self::LeftEvent(ParticipantChange {
            id: event_id,
            participant,
        })
    }

    /// Returns the kind of this notification.
    #[must_use]
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::EventCreated(_) => NotificationKind::EventCreated,
            Self::EventCanceled(_) => NotificationKind::EventCanceled,
            Self::JoinedEvent(_) => NotificationKind::JoinedEvent,
            Self::LeftEvent(_) => NotificationKind::LeftEvent,
        }
    }

    /// Returns the id of the event this notification is about.
    #[must_use]
    pub fn event_id(&self) -> i64 {
        match self {
            Self::EventCreated(event) => event.id,
            Self::EventCanceled(event) => event.id,
            Self::JoinedEvent(change) | Self::LeftEvent(change) => change.id,
        }
    }

    /// Serializes this notification into a single wire frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Renders a duration in minutes the way clients display it.
///
/// - `"2 hours"` when there are no leftover minutes
/// - `"45 minutes"` when shorter than an hour
/// - `"1:05 hours"` otherwise
#[must_use]
pub fn format_duration(total_minutes: i64) -> String {
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if minutes == 0 {
        format!("{hours} hours")
    } else if hours == 0 {
        format!("{minutes} minutes")
    } else {
        format!("{hours}:{minutes:02} hours")
    }
}

/// Parses a string produced by [`format_duration`] back into minutes.
///
/// Negative and overflowing values are rejected.
fn parse_duration(value: &str) -> Option<i64> {
    let total = if let Some(minutes) = value.strip_suffix(" minutes") {
        minutes.parse::<i64>().ok()?
    } else {
        let hours = value.strip_suffix(" hours")?;
        match hours.split_once(':') {
            Some((h, m)) => {
                let h: i64 = h.parse().ok()?;
                let m: i64 = m.parse().ok()?;
                if !(0..60).contains(&m) {
                    return None;
                }
                h.checked_mul(60)?.checked_add(m)?
            }
            None => hours.parse::<i64>().ok()?.checked_mul(60)?,
        }
    };

    (total >= 0).then_some(total)
}

mod date_time_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::DATE_TIME_FORMAT;

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&value.format(DATE_TIME_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, DATE_TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(minutes: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*minutes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {raw}")))
    }
}
