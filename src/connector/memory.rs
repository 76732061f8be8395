//! In-process transport
//!
//! A [`MemoryBus`] is the rendezvous point for connectors inside one
//! process: out-connectors push into it, in-connectors register a
//! scope-matched delivery port. All participants created from one
//! context share one bus instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{
    Connector, ConnectorBase, EventSink, HandlerId, InPushConnector, OutConnector, PortTable,
};
use crate::config::QualityOfServiceSpec;
use crate::error::{BusError, Result};
use crate::event::Event;
use crate::scope::Scope;

/// Shared in-process medium
pub struct MemoryBus {
    ports: PortTable,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            ports: PortTable::new(),
        }
    }

    /// Fan an event out to every registered matching port
    pub(crate) async fn push(&self, event: &Event) {
        self.ports.dispatch(event).await;
    }
}

/// Out-connector for the in-process transport
pub struct MemoryOutConnector {
    base: ConnectorBase,
    bus: Arc<MemoryBus>,
}

impl MemoryOutConnector {
    pub fn new(bus: Arc<MemoryBus>, scope: Scope) -> Self {
        Self {
            base: ConnectorBase::new(scope),
            bus,
        }
    }
}

#[async_trait]
impl Connector for MemoryOutConnector {
    fn scope(&self) -> Scope {
        self.base.scope()
    }

    fn set_scope(&self, scope: Scope) -> Result<()> {
        self.base.set_scope(scope)
    }

    fn set_quality_of_service(&self, spec: QualityOfServiceSpec) -> Result<()> {
        // The in-process bus is ordered and reliable, so any requested
        // spec can be honored.
        self.base.set_quality_of_service(spec)
    }

    async fn activate(&self) -> Result<()> {
        self.base.state.activate()
    }

    async fn deactivate(&self) -> Result<()> {
        self.base.state.deactivate()
    }

    fn is_active(&self) -> bool {
        self.base.state.is_active()
    }
}

#[async_trait]
impl OutConnector for MemoryOutConnector {
    async fn push(&self, event: &Event) -> Result<()> {
        if !self.is_active() {
            return Err(BusError::Inactive);
        }
        self.bus.push(event).await;
        Ok(())
    }
}

/// In-connector for the in-process transport
///
/// Handlers registered while inactive are buffered and flushed into the
/// bus's port table on activation.
pub struct MemoryInConnector {
    base: ConnectorBase,
    bus: Arc<MemoryBus>,
    port: tokio::sync::Mutex<Option<u64>>,
    pending: tokio::sync::Mutex<Vec<(HandlerId, Arc<dyn EventSink>)>>,
    next_handler: AtomicU64,
}

impl MemoryInConnector {
    pub fn new(bus: Arc<MemoryBus>, scope: Scope) -> Self {
        Self {
            base: ConnectorBase::new(scope),
            bus,
            port: tokio::sync::Mutex::new(None),
            pending: tokio::sync::Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Connector for MemoryInConnector {
    fn scope(&self) -> Scope {
        self.base.scope()
    }

    fn set_scope(&self, scope: Scope) -> Result<()> {
        self.base.set_scope(scope)
    }

    fn set_quality_of_service(&self, spec: QualityOfServiceSpec) -> Result<()> {
        self.base.set_quality_of_service(spec)
    }

    async fn activate(&self) -> Result<()> {
        self.base.state.activate()?;
        let id = self.bus.ports.register(self.base.scope()).await;
        *self.port.lock().await = Some(id);

        let buffered: Vec<_> = self.pending.lock().await.drain(..).collect();
        for (handler_id, sink) in buffered {
            self.bus.ports.add_handler(id, handler_id, sink).await?;
        }
        debug!(scope = %self.base.scope(), "Memory in-connector activated");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.base.state.deactivate()?;
        if let Some(id) = self.port.lock().await.take() {
            self.bus.ports.unregister(id).await;
        }
        debug!(scope = %self.base.scope(), "Memory in-connector deactivated");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.base.state.is_active()
    }
}

#[async_trait]
impl InPushConnector for MemoryInConnector {
    async fn add_handler(&self, sink: Arc<dyn EventSink>) -> Result<HandlerId> {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        match *self.port.lock().await {
            Some(port) => self.bus.ports.add_handler(port, id, sink).await?,
            None => self.pending.lock().await.push((id, sink)),
        }
        Ok(id)
    }

    async fn remove_handler(&self, id: HandlerId) -> Result<()> {
        match *self.port.lock().await {
            Some(port) => self.bus.ports.remove_handler(port, id).await,
            None => {
                let mut pending = self.pending.lock().await;
                let before = pending.len();
                pending.retain(|(handler_id, _)| *handler_id != id);
                if pending.len() == before {
                    return Err(BusError::UnknownHandler(id));
                }
                Ok(())
            }
        }
    }
}
