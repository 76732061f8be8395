//! Publishing participant
//!
//! An [`Informer`] publishes events under its scope through every
//! configured out-connector. It owns the participant id and the
//! wrapping sequence counter that together form each event's
//! [`EventId`](crate::EventId).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connector::OutConnector;
use crate::error::{BusError, Result};
use crate::event::{now_micros, Event, EventId, ParticipantId};
use crate::participant::{Participant, ParticipantState};
use crate::scope::Scope;

pub struct Informer {
    id: ParticipantId,
    scope: Scope,
    state: ParticipantState,
    sequence: AtomicU32,
    connectors: Vec<Arc<dyn OutConnector>>,
}

impl Informer {
    pub(crate) fn new(scope: Scope, connectors: Vec<Arc<dyn OutConnector>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            state: ParticipantState::new(),
            sequence: AtomicU32::new(0),
            connectors,
        }
    }

    /// Reserve the id the next sent event will carry
    ///
    /// Lets a caller know an event's identity before publishing it,
    /// which the RPC layer needs to install its reply listener ahead of
    /// the request.
    pub fn allocate_event_id(&self) -> EventId {
        EventId::new(self.id, self.sequence.fetch_add(1, Ordering::Relaxed))
    }

    /// Build and publish an event carrying `payload` under this
    /// informer's scope
    ///
    /// The wire schema defaults to the type tag; payload codecs are
    /// external, the bus moves opaque bytes.
    pub async fn publish(
        &self,
        type_tag: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Event> {
        let type_tag = type_tag.into();
        let event = Event::new(self.scope.clone(), type_tag.clone(), type_tag, payload);
        self.send(event).await
    }

    /// Publish a pre-built event
    ///
    /// The event's scope must equal or be a sub-scope of the informer
    /// scope. Assigns the event id (unless pre-allocated) and stamps
    /// the send time, then pushes through every connector.
    pub async fn send(&self, mut event: Event) -> Result<Event> {
        if !self.is_active() {
            return Err(BusError::Inactive);
        }
        if event.scope != self.scope && !self.scope.is_super_scope_of(&event.scope) {
            return Err(BusError::Publish {
                scope: event.scope.to_string(),
                reason: format!("outside informer scope {}", self.scope),
            });
        }

        if event.id().is_none() {
            event.set_id(self.allocate_event_id());
        }
        event.metadata.send_time = Some(now_micros());

        for connector in &self.connectors {
            connector.push(&event).await?;
        }

        debug!(
            scope = %event.scope,
            id = %event.id().map(|i| i.to_string()).unwrap_or_default(),
            "Event published"
        );
        Ok(event)
    }
}

#[async_trait]
impl Participant for Informer {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn activate(&self) -> Result<()> {
        self.state.activate().await?;
        for connector in &self.connectors {
            connector.activate().await?;
        }
        info!(scope = %self.scope, "Informer activated");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.state.deactivate().await?;
        for connector in &self.connectors {
            connector.deactivate().await?;
        }
        info!(scope = %self.scope, "Informer deactivated");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
