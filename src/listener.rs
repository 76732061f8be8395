//! Subscribing participant
//!
//! A [`Listener`] receives events for its scope and the scopes below
//! it. Incoming events pass the listener's [`Subscription`] filter
//! chain, then flow into the configured receiving strategy which
//! invokes the registered handlers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;
use uuid::Uuid;

use crate::connector::{EventSink, HandlerId, InPushConnector};
use crate::dispatch::{EventHandler, EventReceivingStrategy};
use crate::error::Result;
use crate::event::{Event, ParticipantId};
use crate::filter::{Filter, FilterObserver, Subscription};
use crate::participant::{Participant, ParticipantState};
use crate::scope::Scope;

/// Bridge registered with in-connectors: filter, then dispatch
struct ListenerSink {
    subscription: Arc<tokio::sync::RwLock<Subscription>>,
    strategy: Arc<dyn EventReceivingStrategy>,
}

impl EventSink for ListenerSink {
    fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>> {
        let subscription = self.subscription.clone();
        let strategy = self.strategy.clone();
        Box::pin(async move {
            if subscription.read().await.matches(&event) {
                strategy.handle(event).await
            } else {
                Ok(())
            }
        })
    }
}

pub struct Listener {
    id: ParticipantId,
    scope: Scope,
    state: ParticipantState,
    subscription: Arc<tokio::sync::RwLock<Subscription>>,
    strategy: Arc<dyn EventReceivingStrategy>,
    connectors: Vec<Arc<dyn InPushConnector>>,
    sinks: tokio::sync::Mutex<Vec<(usize, HandlerId)>>,
}

impl Listener {
    pub(crate) fn new(
        scope: Scope,
        strategy: Arc<dyn EventReceivingStrategy>,
        connectors: Vec<Arc<dyn InPushConnector>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            state: ParticipantState::new(),
            subscription: Arc::new(tokio::sync::RwLock::new(Subscription::new())),
            strategy,
            connectors,
            sinks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register a handler with the receiving strategy
    ///
    /// With `wait` the handler is guaranteed to observe events dispatched
    /// after this call returns.
    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>, wait: bool) -> HandlerId {
        self.strategy.add_handler(handler, wait).await
    }

    /// Remove a previously registered handler
    pub async fn remove_handler(&self, id: HandlerId, wait: bool) -> Result<()> {
        self.strategy.remove_handler(id, wait).await
    }

    /// Append a filter to the subscription, notifying observers
    pub async fn add_filter(&self, filter: Filter) {
        self.subscription.write().await.add_filter(filter);
    }

    /// Remove a filter from the subscription; false if absent
    pub async fn remove_filter(&self, filter: &Filter) -> bool {
        self.subscription.write().await.remove_filter(filter)
    }

    /// Current filter chain
    pub async fn filters(&self) -> Vec<Filter> {
        self.subscription.read().await.filters().to_vec()
    }

    /// Register an observer of subscription changes
    pub async fn add_filter_observer(&self, observer: Arc<dyn FilterObserver>) {
        self.subscription.write().await.add_observer(observer);
    }
}

#[async_trait]
impl Participant for Listener {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn activate(&self) -> Result<()> {
        self.state.activate().await?;
        let mut sinks = self.sinks.lock().await;
        for (index, connector) in self.connectors.iter().enumerate() {
            connector.activate().await?;
            let sink = Arc::new(ListenerSink {
                subscription: self.subscription.clone(),
                strategy: self.strategy.clone(),
            });
            let id = connector.add_handler(sink).await?;
            sinks.push((index, id));
        }
        info!(scope = %self.scope, "Listener activated");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.state.deactivate().await?;
        let mut sinks = self.sinks.lock().await;
        for (index, id) in sinks.drain(..) {
            let _ = self.connectors[index].remove_handler(id).await;
            self.connectors[index].deactivate().await?;
        }
        self.strategy.deactivate().await?;
        info!(scope = %self.scope, "Listener deactivated");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpressurePolicy, ParticipantConfig};
    use crate::connector::memory::{MemoryBus, MemoryInConnector, MemoryOutConnector};
    use crate::connector::OutConnector;
    use crate::dispatch::{create_strategy, handler_fn, ReceivingStrategyKind};
    use crate::event::EventId;
    use std::time::Duration;

    fn scope(s: &str) -> Scope {
        Scope::parse(s).unwrap()
    }

    fn listener_on(bus: &Arc<MemoryBus>, s: &str) -> Listener {
        let strategy = create_strategy(
            ReceivingStrategyKind::SingleThreaded,
            &ParticipantConfig::default(),
        );
        let input = Arc::new(MemoryInConnector::new(bus.clone(), scope(s)));
        Listener::new(scope(s), strategy, vec![input])
    }

    async fn push(bus: &Arc<MemoryBus>, s: &str, payload: &str) {
        let out = MemoryOutConnector::new(bus.clone(), scope("/"));
        crate::connector::Connector::activate(&out).await.unwrap();
        let mut event = Event::new(scope(s), "string", "utf-8-string", payload.to_string());
        event.set_id(EventId::new(Uuid::new_v4(), 0));
        event.metadata.send_time = Some(1);
        out.push(&event).await.unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition timed out");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_listener_receives_scope_and_descendants() {
        let bus = Arc::new(MemoryBus::new());
        let listener = listener_on(&bus, "/a/");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        listener
            .add_handler(
                handler_fn(move |event| {
                    let seen = seen_in_handler.clone();
                    async move {
                        seen.lock().unwrap().push(event.scope.to_string());
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await.unwrap();

        push(&bus, "/a/", "on scope").await;
        push(&bus, "/a/b/", "below scope").await;
        push(&bus, "/x/", "elsewhere").await;

        wait_until(|| seen.lock().unwrap().len() == 2).await;
        assert_eq!(*seen.lock().unwrap(), vec!["/a/", "/a/b/"]);
    }

    #[tokio::test]
    async fn test_subscription_filters_narrow_delivery() {
        let bus = Arc::new(MemoryBus::new());
        let listener = listener_on(&bus, "/a/");
        listener.add_filter(Filter::payload_type("wanted")).await;

        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let seen_in_handler = seen.clone();
        listener
            .add_handler(
                handler_fn(move |_event| {
                    let seen = seen_in_handler.clone();
                    async move {
                        *seen.lock().unwrap() += 1;
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await.unwrap();

        let out = MemoryOutConnector::new(bus.clone(), scope("/a/"));
        crate::connector::Connector::activate(&out).await.unwrap();
        let mut wanted = Event::new(scope("/a/"), "wanted", "utf-8-string", "1");
        wanted.set_id(EventId::new(Uuid::new_v4(), 0));
        let mut unwanted = Event::new(scope("/a/"), "unwanted", "utf-8-string", "2");
        unwanted.set_id(EventId::new(Uuid::new_v4(), 1));
        out.push(&wanted).await.unwrap();
        out.push(&unwanted).await.unwrap();
        out.push(&wanted).await.unwrap();

        wait_until(|| *seen.lock().unwrap() == 2).await;
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_listener_lifecycle_is_single_use() {
        let bus = Arc::new(MemoryBus::new());
        let listener = listener_on(&bus, "/a/");
        assert!(!listener.is_active());
        listener.activate().await.unwrap();
        assert!(listener.activate().await.is_err());
        listener.deactivate().await.unwrap();
        assert!(!listener.is_active());
        assert!(listener.activate().await.is_err());
        assert!(listener.deactivate().await.is_err());
    }

    #[tokio::test]
    async fn test_deactivated_listener_stops_receiving() {
        let bus = Arc::new(MemoryBus::new());
        let listener = listener_on(&bus, "/a/");
        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let seen_in_handler = seen.clone();
        listener
            .add_handler(
                handler_fn(move |_event| {
                    let seen = seen_in_handler.clone();
                    async move {
                        *seen.lock().unwrap() += 1;
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await.unwrap();

        push(&bus, "/a/", "first").await;
        wait_until(|| *seen.lock().unwrap() == 1).await;

        listener.deactivate().await.unwrap();
        push(&bus, "/a/", "second").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_parallel_strategy_listener() {
        let config = ParticipantConfig {
            backpressure: BackpressurePolicy::Block,
            ..ParticipantConfig::default()
        };
        let strategy = create_strategy(ReceivingStrategyKind::UnorderedParallel, &config);
        let bus = Arc::new(MemoryBus::new());
        let input = Arc::new(MemoryInConnector::new(bus.clone(), scope("/a/")));
        let listener = Listener::new(scope("/a/"), strategy, vec![input]);

        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let seen_in_handler = seen.clone();
        listener
            .add_handler(
                handler_fn(move |_event| {
                    let seen = seen_in_handler.clone();
                    async move {
                        *seen.lock().unwrap() += 1;
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await.unwrap();

        for i in 0..5 {
            push(&bus, "/a/", &format!("{}", i)).await;
        }
        wait_until(|| *seen.lock().unwrap() == 5).await;
    }
}
