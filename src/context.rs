//! Explicit participant factory
//!
//! A [`BusContext`] replaces process-wide singleton state: it owns the
//! resolved configuration, the in-process bus, the socket bus cache and
//! the transport registry, and every participant is created through it.
//! Tests build an isolated context each instead of mutating shared
//! global state.
//!
//! Transports are looked up by name in a [`TransportRegistry`] — an
//! explicit map from string keys to connector factory functions,
//! populated at startup with the built-in `memory` and `socket`
//! transports and open for registration of further ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{ParticipantConfig, TransportOptions};
use crate::connector::memory::{MemoryBus, MemoryInConnector, MemoryOutConnector};
use crate::connector::socket::{SocketBus, SocketConfig, SocketInConnector, SocketOutConnector};
use crate::connector::{InPushConnector, OutConnector};
use crate::dispatch::create_strategy;
use crate::error::{BusError, Result};
use crate::informer::Informer;
use crate::listener::Listener;
use crate::rpc::{LocalServer, RemoteServer};
use crate::scope::Scope;

type OutFactory =
    Box<dyn Fn(&BusContext, &TransportOptions, Scope) -> Result<Arc<dyn OutConnector>> + Send + Sync>;
type InFactory = Box<
    dyn Fn(&BusContext, &TransportOptions, Scope) -> Result<Arc<dyn InPushConnector>> + Send + Sync,
>;

/// Constructor pair for one transport
pub struct TransportFactory {
    pub out: OutFactory,
    pub in_push: InFactory,
}

/// Name → connector constructors
#[derive(Default)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// A registry with no transports
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry carrying the built-in `memory` and `socket` transports
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "memory",
            TransportFactory {
                out: Box::new(|context, _options, scope| {
                    Ok(Arc::new(MemoryOutConnector::new(context.memory_bus(), scope)))
                }),
                in_push: Box::new(|context, _options, scope| {
                    Ok(Arc::new(MemoryInConnector::new(context.memory_bus(), scope)))
                }),
            },
        );
        registry.register(
            "socket",
            TransportFactory {
                out: Box::new(|context, options, scope| {
                    Ok(Arc::new(SocketOutConnector::new(
                        context.socket_bus(options)?,
                        scope,
                    )))
                }),
                in_push: Box::new(|context, options, scope| {
                    Ok(Arc::new(SocketInConnector::new(
                        context.socket_bus(options)?,
                        scope,
                    )))
                }),
            },
        );
        registry
    }

    /// Register (or replace) a transport under a name
    pub fn register(&mut self, name: impl Into<String>, factory: TransportFactory) {
        self.factories.insert(name.into(), factory);
    }

    fn get(&self, name: &str) -> Option<&TransportFactory> {
        self.factories.get(name)
    }
}

struct ContextInner {
    config: ParticipantConfig,
    registry: TransportRegistry,
    memory_bus: Arc<MemoryBus>,
    socket_buses: std::sync::Mutex<HashMap<String, Arc<SocketBus>>>,
}

/// Factory for all participants of one bus configuration
///
/// Cheap to clone; clones share the in-process bus and the socket bus
/// cache.
#[derive(Clone)]
pub struct BusContext {
    inner: Arc<ContextInner>,
}

impl Default for BusContext {
    fn default() -> Self {
        Self::new(ParticipantConfig::default())
    }
}

impl BusContext {
    /// Context with the built-in transports
    pub fn new(config: ParticipantConfig) -> Self {
        Self::with_registry(config, TransportRegistry::with_builtins())
    }

    /// Context with a custom transport registry
    pub fn with_registry(config: ParticipantConfig, registry: TransportRegistry) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                registry,
                memory_bus: Arc::new(MemoryBus::new()),
                socket_buses: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ParticipantConfig {
        &self.inner.config
    }

    pub(crate) fn memory_bus(&self) -> Arc<MemoryBus> {
        self.inner.memory_bus.clone()
    }

    /// One shared socket bus per (host, port, role)
    pub(crate) fn socket_bus(&self, options: &TransportOptions) -> Result<Arc<SocketBus>> {
        let config = SocketConfig::from_options(options, &self.inner.config)?;
        let key = config.bus_key();
        let mut buses = match self.inner.socket_buses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bus) = buses.get(&key) {
            return Ok(bus.clone());
        }
        debug!(key = %key, "Creating socket bus");
        let bus = Arc::new(SocketBus::new(config));
        buses.insert(key, bus.clone());
        Ok(bus)
    }

    fn out_connectors(&self, scope: &Scope) -> Result<Vec<Arc<dyn OutConnector>>> {
        let mut connectors = Vec::new();
        for (name, options) in self.inner.config.enabled_transports() {
            let factory = self
                .inner
                .registry
                .get(name)
                .ok_or_else(|| BusError::Config(format!("unknown transport '{}'", name)))?;
            connectors.push((factory.out)(self, options, scope.clone())?);
        }
        if connectors.is_empty() {
            return Err(BusError::Config("no transport enabled".to_string()));
        }
        Ok(connectors)
    }

    fn in_connectors(&self, scope: &Scope) -> Result<Vec<Arc<dyn InPushConnector>>> {
        let mut connectors = Vec::new();
        for (name, options) in self.inner.config.enabled_transports() {
            let factory = self
                .inner
                .registry
                .get(name)
                .ok_or_else(|| BusError::Config(format!("unknown transport '{}'", name)))?;
            connectors.push((factory.in_push)(self, options, scope.clone())?);
        }
        if connectors.is_empty() {
            return Err(BusError::Config("no transport enabled".to_string()));
        }
        Ok(connectors)
    }

    /// Create a publisher on a scope
    pub fn create_informer(&self, scope: Scope) -> Result<Informer> {
        let connectors = self.out_connectors(&scope)?;
        Ok(Informer::new(scope, connectors))
    }

    /// Create a subscriber on a scope with the configured strategy
    pub fn create_listener(&self, scope: Scope) -> Result<Listener> {
        let connectors = self.in_connectors(&scope)?;
        let strategy = create_strategy(self.inner.config.strategy, &self.inner.config);
        Ok(Listener::new(scope, strategy, connectors))
    }

    /// Create an RPC server on a base scope
    pub fn create_local_server(&self, scope: Scope) -> Result<LocalServer> {
        Ok(LocalServer::new(self.clone(), scope))
    }

    /// Create an RPC client for a server base scope, using the
    /// configured call timeout
    pub fn create_remote_server(&self, scope: Scope) -> Result<RemoteServer> {
        let timeout = self.inner.config.rpc_timeout;
        self.create_remote_server_with_timeout(scope, timeout)
    }

    /// Create an RPC client with an explicit call timeout
    pub fn create_remote_server_with_timeout(
        &self,
        scope: Scope,
        timeout: Duration,
    ) -> Result<RemoteServer> {
        Ok(RemoteServer::new(self.clone(), scope, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler_fn;
    use crate::participant::Participant;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scope(s: &str) -> Scope {
        Scope::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_default_context_roundtrip() {
        let context = BusContext::default();
        let listener = context.create_listener(scope("/demo/")).unwrap();
        let informer = context.create_informer(scope("/demo/")).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = hits.clone();
        listener
            .add_handler(
                handler_fn(move |_event| {
                    let hits = hits_in_handler.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await.unwrap();
        informer.activate().await.unwrap();

        informer.publish("string", "hello").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_contexts_are_isolated() {
        let context_a = BusContext::default();
        let context_b = BusContext::default();
        let listener = context_a.create_listener(scope("/demo/")).unwrap();
        let informer = context_b.create_informer(scope("/demo/")).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = hits.clone();
        listener
            .add_handler(
                handler_fn(move |_event| {
                    let hits = hits_in_handler.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await.unwrap();
        informer.activate().await.unwrap();

        informer.publish("string", "hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_transport_is_a_config_error() {
        let mut config = ParticipantConfig::default();
        config
            .transports
            .insert("carrier-pigeon".to_string(), TransportOptions::enabled());
        let context = BusContext::new(config);
        assert!(matches!(
            context.create_informer(scope("/demo/")),
            Err(BusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_no_enabled_transport_is_a_config_error() {
        let mut config = ParticipantConfig::default();
        config.transports.clear();
        let context = BusContext::new(config);
        assert!(matches!(
            context.create_listener(scope("/demo/")),
            Err(BusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_transport_registration() {
        let mut registry = TransportRegistry::with_builtins();
        // Re-route a custom name onto the in-process bus
        registry.register(
            "loopback",
            TransportFactory {
                out: Box::new(|context, _options, scope| {
                    Ok(Arc::new(crate::connector::memory::MemoryOutConnector::new(
                        context.memory_bus(),
                        scope,
                    )))
                }),
                in_push: Box::new(|context, _options, scope| {
                    Ok(Arc::new(crate::connector::memory::MemoryInConnector::new(
                        context.memory_bus(),
                        scope,
                    )))
                }),
            },
        );

        let mut config = ParticipantConfig::default();
        config.transports.clear();
        config
            .transports
            .insert("loopback".to_string(), TransportOptions::enabled());
        let context = BusContext::with_registry(config, registry);
        assert!(context.create_informer(scope("/demo/")).is_ok());
    }

    #[tokio::test]
    async fn test_socket_buses_are_shared_per_address() {
        let context = BusContext::default();
        let options = TransportOptions::enabled()
            .with_option("port", "59999")
            .with_option("server", "true");
        let first = context.socket_bus(&options).unwrap();
        let second = context.socket_bus(&options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let client_options = TransportOptions::enabled().with_option("port", "59999");
        let third = context.socket_bus(&client_options).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
