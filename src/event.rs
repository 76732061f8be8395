//! Core event types
//!
//! An [`Event`] is the payload envelope moved across the bus: an opaque
//! byte payload under a [`Scope`], identified by an [`EventId`] assigned
//! on first send, with timestamp metadata and a causal vector linking it
//! to the events it logically depends on.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scope::Scope;

/// Identifier of an event-producing participant (128-bit, random)
pub type ParticipantId = Uuid;

/// Current time in microseconds since the Unix epoch
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Identity of one event: origin participant plus its position in the
/// origin's stream
///
/// Sequence numbers are unsigned 32-bit and wrap around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventId {
    /// Id of the participant that sent the event
    pub participant_id: ParticipantId,

    /// Position in the participant's event stream
    pub sequence_number: u32,
}

impl EventId {
    /// Create an event id
    pub fn new(participant_id: ParticipantId, sequence_number: u32) -> Self {
        Self {
            participant_id,
            sequence_number,
        }
    }

    /// Deterministic display UUID, derived by name-based (v5) hashing of
    /// the participant id and the zero-padded hexadecimal sequence number
    ///
    /// For display and tracing only — equality of event ids is defined
    /// over the two fields, never over this derived value.
    pub fn as_uuid(&self) -> Uuid {
        Uuid::new_v5(
            &self.participant_id,
            format!("{:08x}", self.sequence_number).as_bytes(),
        )
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.participant_id, self.sequence_number)
    }
}

/// Event metadata: timestamps plus free-form user data
///
/// All timestamps are microseconds since the Unix epoch. `create_time`
/// is stamped at construction; the remaining three are written by the
/// sending and receiving pipelines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaData {
    /// When the event was created by its producer
    pub create_time: i64,

    /// When the event was handed to a transport
    pub send_time: Option<i64>,

    /// When the transport received the event
    pub receive_time: Option<i64>,

    /// When the event was handed to a user handler
    pub deliver_time: Option<i64>,

    /// Free-form string annotations
    pub user_infos: HashMap<String, String>,

    /// Free-form integer annotations (e.g. extra timestamps)
    pub user_times: HashMap<String, i64>,
}

/// The event envelope
///
/// Mutable while being assembled by a producer; once handed to an
/// out-connector it is logically immutable apart from the receive and
/// deliver timestamps written by the receiving pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: Option<EventId>,

    /// Scope the event is published under
    pub scope: Scope,

    /// Type tag of the (opaque) payload
    pub type_tag: String,

    /// Wire schema the payload bytes were encoded with
    pub wire_schema: String,

    /// Opaque payload bytes
    pub payload: Bytes,

    /// Timestamps and user annotations
    pub metadata: MetaData,

    /// Method tag, used by the RPC layer
    pub method: Option<String>,

    causes: Vec<EventId>,
}

impl Event {
    /// Create a new event, stamping its creation time
    pub fn new(
        scope: Scope,
        type_tag: impl Into<String>,
        wire_schema: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: None,
            scope,
            type_tag: type_tag.into(),
            wire_schema: wire_schema.into(),
            payload: payload.into(),
            metadata: MetaData {
                create_time: now_micros(),
                ..MetaData::default()
            },
            method: None,
            causes: Vec::new(),
        }
    }

    /// The event id, if already assigned by a send
    pub fn id(&self) -> Option<EventId> {
        self.id
    }

    /// Assign the event id
    ///
    /// Normally done by the sending informer; an informer respects a
    /// pre-assigned id instead of allocating one.
    pub fn set_id(&mut self, id: EventId) {
        self.id = Some(id);
    }

    /// The causal vector: ids of events this event logically depends on
    pub fn causes(&self) -> &[EventId] {
        &self.causes
    }

    /// Add a causal link; returns false if it was already present
    ///
    /// The causal vector is an ordered, duplicate-free list and never
    /// contains the event's own id.
    pub fn add_cause(&mut self, cause: EventId) -> bool {
        if self.causes.contains(&cause) {
            return false;
        }
        self.causes.push(cause);
        true
    }

    /// Remove a causal link; returns false if it was not present
    pub fn remove_cause(&mut self, cause: &EventId) -> bool {
        let before = self.causes.len();
        self.causes.retain(|c| c != cause);
        self.causes.len() != before
    }

    /// True iff `cause` is in this event's causal vector
    pub fn is_cause(&self, cause: &EventId) -> bool {
        self.causes.contains(cause)
    }

    /// Add a user-info annotation (builder style)
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.user_infos.insert(key.into(), value.into());
        self
    }

    /// Set the RPC method tag (builder style)
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(s: &str) -> Scope {
        Scope::parse(s).unwrap()
    }

    #[test]
    fn test_event_id_equality_is_field_wise() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        assert_eq!(EventId::new(p1, 7), EventId::new(p1, 7));
        assert_ne!(EventId::new(p1, 7), EventId::new(p1, 8));
        assert_ne!(EventId::new(p1, 7), EventId::new(p2, 7));
    }

    #[test]
    fn test_derived_uuid_is_deterministic() {
        let p = Uuid::new_v4();
        let id = EventId::new(p, 42);
        assert_eq!(id.as_uuid(), id.as_uuid());
        assert_eq!(id.as_uuid(), EventId::new(p, 42).as_uuid());
        assert_ne!(id.as_uuid(), EventId::new(p, 43).as_uuid());
        // Derived id never participates in equality
        assert_eq!(id, EventId::new(p, 42));
    }

    #[test]
    fn test_new_event_stamps_create_time_only() {
        let event = Event::new(scope("/a/"), "string", "utf-8-string", "hi");
        assert!(event.metadata.create_time > 0);
        assert!(event.metadata.send_time.is_none());
        assert!(event.metadata.receive_time.is_none());
        assert!(event.metadata.deliver_time.is_none());
        assert!(event.id().is_none());
    }

    #[test]
    fn test_causes_are_ordered_and_duplicate_free() {
        let mut event = Event::new(scope("/a/"), "string", "utf-8-string", "hi");
        let c1 = EventId::new(Uuid::new_v4(), 1);
        let c2 = EventId::new(Uuid::new_v4(), 2);

        assert!(event.add_cause(c1));
        assert!(event.add_cause(c2));
        assert!(!event.add_cause(c1));
        assert_eq!(event.causes(), &[c1, c2]);

        assert!(event.is_cause(&c1));
        assert!(event.remove_cause(&c1));
        assert!(!event.remove_cause(&c1));
        assert_eq!(event.causes(), &[c2]);
    }

    #[test]
    fn test_event_id_wire_serialization() {
        let id = EventId::new(Uuid::new_v4(), 99);
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains("participantId"));
        assert!(json.contains("sequenceNumber"));
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_sequence_number_wraps() {
        let p = Uuid::new_v4();
        let id = EventId::new(p, u32::MAX);
        assert_eq!(id.sequence_number.wrapping_add(1), 0);
    }
}
