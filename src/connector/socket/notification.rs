//! Wire projection of events
//!
//! A [`Notification`] is what actually travels over a socket: the
//! event's identity, scope, payload bytes and metadata, JSON-serialized
//! behind the length-prefixed frame. Payloads larger than the
//! fragmentation threshold are split into multiple notifications that
//! share the originating event's id and carry a fragment index/count.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::event::{Event, EventId};
use crate::scope::Scope;

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Wire metadata block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMeta {
    /// Creation time, microseconds since epoch
    pub create_time: i64,

    /// Send time, microseconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_time: Option<i64>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_infos: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_times: HashMap<String, i64>,
}

/// One wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Id of the sending participant
    pub sender_id: Uuid,

    /// Sequence number within the sender's stream
    pub sequence_number: u32,

    /// Rendered scope string
    pub scope: String,

    /// Wire schema the payload was encoded with
    pub wire_schema: String,

    /// Method tag for RPC traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Payload bytes (this fragment's slice when fragmented)
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,

    pub meta: NotificationMeta,

    /// Causal vector of the event
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<EventId>,

    /// Index of this fragment within the logical message
    pub fragment_index: u32,

    /// Total number of fragments in the logical message
    pub fragment_count: u32,
}

impl Notification {
    /// Identity of the logical message this notification belongs to
    pub fn event_id(&self) -> EventId {
        EventId::new(self.sender_id, self.sequence_number)
    }

    /// Rebuild an event from a complete (unfragmented or reassembled)
    /// notification
    ///
    /// The receiving pipeline treats the wire schema as the type tag of
    /// the opaque payload.
    pub fn into_event(self) -> Result<Event> {
        let scope = Scope::parse(&self.scope)?;
        let mut event = Event::new(
            scope,
            self.wire_schema.clone(),
            self.wire_schema,
            Bytes::from(self.payload),
        );
        event.set_id(EventId::new(self.sender_id, self.sequence_number));
        event.method = self.method;
        event.metadata.create_time = self.meta.create_time;
        event.metadata.send_time = self.meta.send_time;
        event.metadata.user_infos = self.meta.user_infos;
        event.metadata.user_times = self.meta.user_times;
        for cause in self.causes {
            event.add_cause(cause);
        }
        Ok(event)
    }
}

/// Project an event into one or more wire notifications
///
/// Payloads at most `threshold` bytes long yield a single notification;
/// larger ones are split into `ceil(len / threshold)` fragments sharing
/// the event id. The event must already carry an id.
pub fn notifications_for(event: &Event, threshold: usize) -> Result<Vec<Notification>> {
    let id = event.id().ok_or_else(|| BusError::Publish {
        scope: event.scope.to_string(),
        reason: "event has no id; only sent events can be projected".to_string(),
    })?;

    let meta = NotificationMeta {
        create_time: event.metadata.create_time,
        send_time: event.metadata.send_time,
        user_infos: event.metadata.user_infos.clone(),
        user_times: event.metadata.user_times.clone(),
    };

    let payload = event.payload.as_ref();
    let chunks: Vec<&[u8]> = if payload.len() <= threshold {
        vec![payload]
    } else {
        payload.chunks(threshold).collect()
    };
    let fragment_count = chunks.len() as u32;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Notification {
            sender_id: id.participant_id,
            sequence_number: id.sequence_number,
            scope: event.scope.to_string(),
            wire_schema: event.wire_schema.clone(),
            method: event.method.clone(),
            payload: chunk.to_vec(),
            meta: meta.clone(),
            causes: event.causes().to_vec(),
            fragment_index: index as u32,
            fragment_count,
        })
        .collect())
}
