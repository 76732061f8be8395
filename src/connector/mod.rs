//! Transport-facing connector abstraction
//!
//! A [`Connector`] is one endpoint of a transport with an
//! activate/deactivate lifecycle. [`OutConnector`]s push events onto the
//! shared medium; [`InPushConnector`]s deliver scope-matched events to
//! registered raw sinks. Concrete transports live in submodules:
//! [`memory`] for in-process rendezvous, [`socket`] for TCP.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::config::QualityOfServiceSpec;
use crate::error::{BusError, Result};
use crate::event::{now_micros, Event};
use crate::scope::Scope;

pub mod memory;
pub mod socket;

/// Registration id of a raw event sink
pub type HandlerId = u64;

/// Raw event sink fed by an in-connector
///
/// This is the transport-side delivery interface; user-level handlers
/// sit behind a receiving strategy instead.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>>;
}

/// Two-state connector lifecycle: Inactive ⇄ Active
///
/// Unlike participants, connectors may be reactivated. Each connector
/// instance guards its own flag; the flag is never shared.
#[derive(Debug, Default)]
pub struct ConnectorState {
    active: std::sync::Mutex<bool>,
}

impl ConnectorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self) -> Result<()> {
        let mut active = self.lock();
        if *active {
            return Err(BusError::Lifecycle("connector already active".to_string()));
        }
        *active = true;
        Ok(())
    }

    pub fn deactivate(&self) -> Result<()> {
        let mut active = self.lock();
        if !*active {
            return Err(BusError::Lifecycle("connector not active".to_string()));
        }
        *active = false;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        // Held only for flag reads/writes, so poisoning cannot leave
        // inconsistent state behind.
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Scope, QoS and lifecycle shared by all connector implementations
///
/// `set_scope` and `set_quality_of_service` are only legal while the
/// connector is inactive.
#[derive(Debug)]
pub struct ConnectorBase {
    scope: std::sync::Mutex<Scope>,
    qos: std::sync::Mutex<QualityOfServiceSpec>,
    pub(crate) state: ConnectorState,
}

impl ConnectorBase {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope: std::sync::Mutex::new(scope),
            qos: std::sync::Mutex::new(QualityOfServiceSpec::default()),
            state: ConnectorState::new(),
        }
    }

    pub fn scope(&self) -> Scope {
        match self.scope.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_scope(&self, scope: Scope) -> Result<()> {
        if self.state.is_active() {
            return Err(BusError::Lifecycle(
                "scope can only be set while inactive".to_string(),
            ));
        }
        match self.scope.lock() {
            Ok(mut guard) => *guard = scope,
            Err(poisoned) => *poisoned.into_inner() = scope,
        }
        Ok(())
    }

    pub fn quality_of_service(&self) -> QualityOfServiceSpec {
        match self.qos.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_quality_of_service(&self, spec: QualityOfServiceSpec) -> Result<()> {
        if self.state.is_active() {
            return Err(BusError::Lifecycle(
                "quality of service can only be set while inactive".to_string(),
            ));
        }
        match self.qos.lock() {
            Ok(mut guard) => *guard = spec,
            Err(poisoned) => *poisoned.into_inner() = spec,
        }
        Ok(())
    }
}

/// Transport endpoint with an activate/deactivate lifecycle
#[async_trait]
pub trait Connector: Send + Sync {
    /// Scope this connector is attached to
    fn scope(&self) -> Scope;

    /// Reconfigure the scope; only legal while inactive
    fn set_scope(&self, scope: Scope) -> Result<()>;

    /// Reconfigure the quality of service; only legal while inactive.
    /// Fails if the transport cannot honor the requested spec.
    fn set_quality_of_service(&self, spec: QualityOfServiceSpec) -> Result<()>;

    /// Transition Inactive → Active; fails if already active
    async fn activate(&self) -> Result<()>;

    /// Transition Active → Inactive; fails if already inactive
    async fn deactivate(&self) -> Result<()>;

    fn is_active(&self) -> bool;
}

/// Sending endpoint
#[async_trait]
pub trait OutConnector: Connector {
    /// Push an event onto the shared medium; fails while inactive
    async fn push(&self, event: &Event) -> Result<()>;
}

/// Receiving endpoint delivering events to registered raw sinks
///
/// Delivered events are those whose scope equals or is a sub-scope of
/// the connector scope.
#[async_trait]
pub trait InPushConnector: Connector {
    /// Register a raw sink, returning its registration id
    async fn add_handler(&self, sink: Arc<dyn EventSink>) -> Result<HandlerId>;

    /// Remove a previously registered sink
    async fn remove_handler(&self, id: HandlerId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Port table: the shared fan-out core of both bus implementations
// ---------------------------------------------------------------------------

struct Port {
    id: u64,
    scope: Scope,
    handlers: Vec<(HandlerId, Arc<dyn EventSink>)>,
}

#[derive(Default)]
struct PortTableInner {
    ports: Vec<Port>,
}

/// Scope-matched delivery table
///
/// One mutual-exclusion domain guards fan-out and handler-set mutation,
/// so a concurrent `dispatch` and `add_handler`/`remove_handler` never
/// race.
pub(crate) struct PortTable {
    inner: tokio::sync::Mutex<PortTableInner>,
    next_port: AtomicU64,
}

impl PortTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(PortTableInner::default()),
            next_port: AtomicU64::new(1),
        }
    }

    /// Register a delivery port for a scope
    pub(crate) async fn register(&self, scope: Scope) -> u64 {
        let id = self.next_port.fetch_add(1, AtomicOrdering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner.ports.push(Port {
            id,
            scope,
            handlers: Vec::new(),
        });
        id
    }

    /// Drop a port and all its handlers
    pub(crate) async fn unregister(&self, port: u64) {
        let mut inner = self.inner.lock().await;
        inner.ports.retain(|p| p.id != port);
    }

    pub(crate) async fn add_handler(
        &self,
        port: u64,
        id: HandlerId,
        sink: Arc<dyn EventSink>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let port = inner
            .ports
            .iter_mut()
            .find(|p| p.id == port)
            .ok_or_else(|| BusError::Config(format!("no such port {}", port)))?;
        port.handlers.push((id, sink));
        Ok(())
    }

    pub(crate) async fn remove_handler(&self, port: u64, id: HandlerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let port = inner
            .ports
            .iter_mut()
            .find(|p| p.id == port)
            .ok_or_else(|| BusError::Config(format!("no such port {}", port)))?;
        let before = port.handlers.len();
        port.handlers.retain(|(handler_id, _)| *handler_id != id);
        if port.handlers.len() == before {
            return Err(BusError::UnknownHandler(id));
        }
        Ok(())
    }

    /// Fan an event out to every port whose scope equals or is a
    /// super-scope of the event's scope, stamping the receive time
    ///
    /// Sink failures are logged and isolated; delivery continues.
    pub(crate) async fn dispatch(&self, event: &Event) {
        let mut stamped = event.clone();
        stamped.metadata.receive_time = Some(now_micros());

        let inner = self.inner.lock().await;
        for port in &inner.ports {
            if port.scope != stamped.scope && !port.scope.is_super_scope_of(&stamped.scope) {
                continue;
            }
            for (handler_id, sink) in &port.handlers {
                if let Err(e) = sink.handle(stamped.clone()).await {
                    warn!(handler = handler_id, error = %e, "Raw event sink failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        count: Arc<AtomicUsize>,
    }

    impl EventSink for Counting {
        fn handle(&self, _event: Event) -> BoxFuture<'static, Result<()>> {
            let count = self.count.clone();
            Box::pin(async move {
                count.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })
        }
    }

    fn scope(s: &str) -> Scope {
        Scope::parse(s).unwrap()
    }

    #[test]
    fn test_connector_state_transitions() {
        let state = ConnectorState::new();
        assert!(!state.is_active());
        state.activate().unwrap();
        assert!(state.is_active());
        assert!(state.activate().is_err());
        state.deactivate().unwrap();
        assert!(!state.is_active());
        assert!(state.deactivate().is_err());
        // Connectors, unlike participants, may be reactivated
        state.activate().unwrap();
        assert!(state.is_active());
    }

    #[test]
    fn test_scope_and_qos_only_settable_while_inactive() {
        let base = ConnectorBase::new(scope("/a/"));
        base.set_scope(scope("/b/")).unwrap();
        base.set_quality_of_service(QualityOfServiceSpec::default())
            .unwrap();

        base.state.activate().unwrap();
        assert!(base.set_scope(scope("/c/")).is_err());
        assert!(base
            .set_quality_of_service(QualityOfServiceSpec::default())
            .is_err());
        assert_eq!(base.scope(), scope("/b/"));
    }

    #[tokio::test]
    async fn test_port_table_scope_matched_dispatch() {
        let table = PortTable::new();
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_x = Arc::new(AtomicUsize::new(0));

        let port_a = table.register(scope("/a/")).await;
        table
            .add_handler(port_a, 1, Arc::new(Counting { count: hits_a.clone() }))
            .await
            .unwrap();
        let port_x = table.register(scope("/x/")).await;
        table
            .add_handler(port_x, 1, Arc::new(Counting { count: hits_x.clone() }))
            .await
            .unwrap();

        let event = Event::new(scope("/a/b/"), "string", "utf-8-string", "hi");
        table.dispatch(&event).await;

        assert_eq!(hits_a.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(hits_x.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_port_table_stamps_receive_time() {
        struct Check;
        impl EventSink for Check {
            fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>> {
                Box::pin(async move {
                    assert!(event.metadata.receive_time.is_some());
                    Ok(())
                })
            }
        }

        let table = PortTable::new();
        let port = table.register(scope("/a/")).await;
        table.add_handler(port, 1, Arc::new(Check)).await.unwrap();
        let event = Event::new(scope("/a/"), "string", "utf-8-string", "hi");
        table.dispatch(&event).await;
    }

    #[tokio::test]
    async fn test_port_table_remove_handler() {
        let table = PortTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let port = table.register(scope("/a/")).await;
        table
            .add_handler(port, 7, Arc::new(Counting { count: hits.clone() }))
            .await
            .unwrap();
        table.remove_handler(port, 7).await.unwrap();
        assert!(matches!(
            table.remove_handler(port, 7).await,
            Err(BusError::UnknownHandler(7))
        ));

        let event = Event::new(scope("/a/"), "string", "utf-8-string", "hi");
        table.dispatch(&event).await;
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);
    }
}
