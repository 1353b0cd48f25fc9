//! In-memory event catalog.
//!
//! The catalog owns events and their participants and publishes a
//! notification after every committed change. Callers supply an already
//! authenticated [`Participant`] as the acting user.
//!
//! Cancelled events stay readable through [`EventCatalog::get_event`] and
//! [`EventCatalog::list_events`], but every mutating operation treats them as
//! missing.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::dispatch::BroadcastDispatcher;
use crate::protocol::{EventProjection, Notification, Participant, DATE_TIME_FORMAT};

/// Business rule violations reported by the catalog.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("event {0} not found")]
    EventNotFound(i64),

    #[error("user {user_id} is not the organizer of event {event_id}")]
    NotOrganizer { event_id: i64, user_id: i64 },

    #[error("user {user_id} has already joined event {event_id}")]
    AlreadyJoined { event_id: i64, user_id: i64 },

    #[error("user {user_id} has not joined event {event_id}")]
    NotJoined { event_id: i64, user_id: i64 },

    #[error("invalid date time format: '{0}'")]
    InvalidDateTime(String),

    #[error("duration must not be negative, got {0} minutes")]
    InvalidDuration(i64),
}

/// Request to create an event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewEvent {
    pub title: String,

    /// Start time formatted as `YYYY-MM-DD HH:MM:SS`.
    pub date_time: String,

    #[serde(rename = "duration")]
    pub duration_minutes: i64,

    pub address: Option<String>,
}

/// An event with its organizer and participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDetail {
    #[serde(flatten)]
    pub event: EventProjection,
    pub organizer: Participant,
    pub participants: Vec<Participant>,
}

#[derive(Debug)]
struct StoredEvent {
    id: i64,
    title: String,
    organizer: Participant,
    date_time: NaiveDateTime,
    duration_minutes: i64,
    address: Option<String>,
    is_cancelled: bool,
    participants: Vec<Participant>,
}

impl StoredEvent {
    fn projection(&self) -> EventProjection {
        EventProjection {
            id: self.id,
            title: self.title.clone(),
            date_time: self.date_time,
            duration: self.duration_minutes,
            address: self.address.clone(),
            is_cancelled: self.is_cancelled,
        }
    }

    fn has_participant(&self, user_id: i64) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    last_id: i64,
    events: BTreeMap<i64, StoredEvent>,
}

impl CatalogState {
    /// Looks up an event that may still be changed.
    fn active_mut(&mut self, event_id: i64) -> Result<&mut StoredEvent, CatalogError> {
        self.events
            .get_mut(&event_id)
            .filter(|event| !event.is_cancelled)
            .ok_or(CatalogError::EventNotFound(event_id))
    }
}

/// Event store that publishes every committed change.
///
/// Cloning is cheap; clones share the same events.
#[derive(Debug, Clone)]
pub struct EventCatalog {
    state: Arc<RwLock<CatalogState>>,
    dispatcher: BroadcastDispatcher,
}

impl EventCatalog {
    #[must_use]
    pub fn new(dispatcher: BroadcastDispatcher) -> Self {
        Self {
            state: Arc::new(RwLock::new(CatalogState::default())),
            dispatcher,
        }
    }

    /// Creates an event organized by `organizer` and publishes `event_created`.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::InvalidDateTime`] if `date_time` is not `YYYY-MM-DD HH:MM:SS`
    /// - [`CatalogError::InvalidDuration`] if the duration is negative
    pub async fn create_event(
        &self,
        organizer: Participant,
        request: NewEvent,
    ) -> Result<EventProjection, CatalogError> {
        let date_time = NaiveDateTime::parse_from_str(&request.date_time, DATE_TIME_FORMAT)
            .map_err(|_| CatalogError::InvalidDateTime(request.date_time.clone()))?;
        if request.duration_minutes < 0 {
            return Err(CatalogError::InvalidDuration(request.duration_minutes));
        }

        let projection = {
            let mut state = self.state.write().await;
            state.last_id += 1;
            let event = StoredEvent {
                id: state.last_id,
                title: request.title,
                organizer,
                date_time,
                duration_minutes: request.duration_minutes,
                address: request.address,
                is_cancelled: false,
                participants: Vec::new(),
            };
            let projection = event.projection();
            state.events.insert(event.id, event);
            projection
        };

        info!(event_id = projection.id, title = %projection.title, "Event created");
        self.dispatcher
            .publish(Notification::event_created(projection.clone()))
            .await;
        Ok(projection)
    }

    /// Cancels an event and publishes `event_canceled`.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::EventNotFound`] if the event is missing or already cancelled
    /// - [`CatalogError::NotOrganizer`] if `requester` did not organize it
    pub async fn cancel_event(&self, event_id: i64, requester: &Participant) -> Result<(), CatalogError> {
        {
            let mut state = self.state.write().await;
            let event = state.active_mut(event_id)?;
            if event.organizer.id != requester.id {
                return Err(CatalogError::NotOrganizer {
                    event_id,
                    user_id: requester.id,
                });
            }
            event.is_cancelled = true;
        }

        info!(event_id, "Event cancelled");
        self.dispatcher
            .publish(Notification::event_canceled(event_id))
            .await;
        Ok(())
    }

    /// Adds `participant` to an event and publishes `joined_event`.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::EventNotFound`] if the event is missing or cancelled
    /// - [`CatalogError::AlreadyJoined`] if the participant already joined
    pub async fn join_event(&self, event_id: i64, participant: Participant) -> Result<(), CatalogError> {
        {
            let mut state = self.state.write().await;
            let event = state.active_mut(event_id)?;
            if event.has_participant(participant.id) {
                return Err(CatalogError::AlreadyJoined {
                    event_id,
                    user_id: participant.id,
                });
            }
            event.participants.push(participant.clone());
        }

        debug!(event_id, user_id = participant.id, "Participant joined");
        self.dispatcher
            .publish(Notification::joined_event(event_id, participant))
            .await;
        Ok(())
    }

    /// Removes `participant` from an event and publishes `left_event`.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::EventNotFound`] if the event is missing or cancelled
    /// - [`CatalogError::NotJoined`] if the participant had not joined
    pub async fn leave_event(&self, event_id: i64, participant: Participant) -> Result<(), CatalogError> {
        {
            let mut state = self.state.write().await;
            let event = state.active_mut(event_id)?;
            let before = event.participants.len();
            event.participants.retain(|p| p.id != participant.id);
            if event.participants.len() == before {
                return Err(CatalogError::NotJoined {
                    event_id,
                    user_id: participant.id,
                });
            }
        }

        debug!(event_id, user_id = participant.id, "Participant left");
        self.dispatcher
            .publish(Notification::left_event(event_id, participant))
            .await;
        Ok(())
    }

    /// Returns every event, cancelled ones included, ordered by id.
    pub async fn list_events(&self) -> Vec<EventProjection> {
        self.state
            .read()
            .await
            .events
            .values()
            .map(StoredEvent::projection)
            .collect()
    }

    /// Returns an event with its organizer and participants.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::EventNotFound`] if no event has this id.
    pub async fn get_event(&self, event_id: i64) -> Result<EventDetail, CatalogError> {
        let state = self.state.read().await;
        let event = state
            .events
            .get(&event_id)
            .ok_or(CatalogError::EventNotFound(event_id))?;

        Ok(EventDetail {
            event: event.projection(),
            organizer: event.organizer.clone(),
            participants: event.participants.clone(),
        })
    }
}
