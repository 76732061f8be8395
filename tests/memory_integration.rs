//! In-process transport integration tests
//!
//! End-to-end tests exercising participants over the memory transport:
//! publish/subscribe roundtrips, scope containment, filter chains,
//! dispatch strategies, and the shared lifecycle contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scopebus::{
    handler_fn, BusContext, BusError, Event, Filter, Participant, ParticipantConfig,
    ReceivingStrategyKind, Scope, TransportOptions,
};

fn scope(s: &str) -> Scope {
    Scope::parse(s).unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition timed out"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn collecting_handler(
    into: Arc<Mutex<Vec<Event>>>,
) -> Arc<dyn scopebus::EventHandler> {
    handler_fn(move |event| {
        let into = into.clone();
        async move {
            into.lock().unwrap().push(event);
            Ok(())
        }
    })
}

// ─── Publish / Subscribe Roundtrip ───────────────────────────────

#[tokio::test]
async fn test_roundtrip_preserves_event_identity() {
    let context = BusContext::default();
    let listener = context.create_listener(scope("/robot/laser/")).unwrap();
    let informer = context.create_informer(scope("/robot/laser/")).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    listener
        .add_handler(collecting_handler(received.clone()), true)
        .await;
    listener.activate().await.unwrap();
    informer.activate().await.unwrap();

    let mut event = Event::new(
        scope("/robot/laser/"),
        "scan",
        "scan",
        vec![0u8, 1, 2, 254, 255],
    );
    let cause = scopebus::EventId::new(uuid::Uuid::new_v4(), 11);
    event.add_cause(cause);
    let sent = informer.send(event).await.unwrap();

    wait_until(|| received.lock().unwrap().len() == 1).await;
    let got = received.lock().unwrap().remove(0);
    assert_eq!(got.id(), sent.id());
    assert_eq!(got.scope, sent.scope);
    assert_eq!(got.type_tag, sent.type_tag);
    assert_eq!(got.payload, sent.payload);
    assert_eq!(got.causes(), sent.causes());
    // The receiving pipeline stamps the remaining timestamps
    assert!(got.metadata.receive_time.is_some());
    assert!(got.metadata.deliver_time.is_some());
}

#[tokio::test]
async fn test_sub_scope_events_reach_super_scope_listener() {
    let context = BusContext::default();
    let listener = context.create_listener(scope("/robot/")).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    listener
        .add_handler(collecting_handler(received.clone()), true)
        .await;
    listener.activate().await.unwrap();

    for s in ["/robot/", "/robot/arm/", "/robot/arm/joint1/", "/other/"] {
        let informer = context.create_informer(scope(s)).unwrap();
        informer.activate().await.unwrap();
        informer.publish("string", s.as_bytes().to_vec()).await.unwrap();
    }

    wait_until(|| received.lock().unwrap().len() == 3).await;
    let scopes: Vec<String> = received
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.scope.to_string())
        .collect();
    assert_eq!(scopes, ["/robot/", "/robot/arm/", "/robot/arm/joint1/"]);
}

#[tokio::test]
async fn test_sibling_listener_receives_nothing() {
    let context = BusContext::default();
    let listener = context.create_listener(scope("/a/b/")).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count_in_handler = count.clone();
    listener
        .add_handler(
            handler_fn(move |_event| {
                let count = count_in_handler.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            true,
        )
        .await;
    listener.activate().await.unwrap();

    let informer = context.create_informer(scope("/a/c/")).unwrap();
    informer.activate().await.unwrap();
    informer.publish("string", "nope").await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_multiple_listeners_all_receive() {
    let context = BusContext::default();
    let counts: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let mut listeners = Vec::new();
    for count in &counts {
        let listener = context.create_listener(scope("/fan/")).unwrap();
        let count = count.clone();
        listener
            .add_handler(
                handler_fn(move |_event| {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await.unwrap();
        listeners.push(listener);
    }

    let informer = context.create_informer(scope("/fan/out/")).unwrap();
    informer.activate().await.unwrap();
    informer.publish("string", "x").await.unwrap();

    wait_until(|| counts.iter().all(|c| c.load(Ordering::SeqCst) == 1)).await;
}

// ─── Filters ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_origin_filter_narrows_to_one_informer() {
    let context = BusContext::default();
    let listener = context.create_listener(scope("/mixed/")).unwrap();

    let wanted = context.create_informer(scope("/mixed/")).unwrap();
    let unwanted = context.create_informer(scope("/mixed/")).unwrap();
    wanted.activate().await.unwrap();
    unwanted.activate().await.unwrap();

    listener.add_filter(Filter::origin(wanted.id())).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    listener
        .add_handler(collecting_handler(received.clone()), true)
        .await;
    listener.activate().await.unwrap();

    unwanted.publish("string", "skip me").await.unwrap();
    wanted.publish("string", "keep me").await.unwrap();
    unwanted.publish("string", "skip me too").await.unwrap();

    wait_until(|| received.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload.as_ref(), b"keep me");
}

#[tokio::test]
async fn test_cause_filter_selects_correlated_event() {
    let context = BusContext::default();
    let listener = context.create_listener(scope("/corr/")).unwrap();
    let informer = context.create_informer(scope("/corr/")).unwrap();
    informer.activate().await.unwrap();

    let cause = scopebus::EventId::new(uuid::Uuid::new_v4(), 42);
    listener.add_filter(Filter::cause(cause)).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    listener
        .add_handler(collecting_handler(received.clone()), true)
        .await;
    listener.activate().await.unwrap();

    informer.publish("string", "uncorrelated").await.unwrap();
    let mut correlated = Event::new(scope("/corr/"), "string", "utf-8-string", "correlated");
    correlated.add_cause(cause);
    informer.send(correlated).await.unwrap();

    wait_until(|| received.lock().unwrap().len() == 1).await;
    assert_eq!(received.lock().unwrap()[0].payload.as_ref(), b"correlated");
}

// ─── Dispatch Strategies ─────────────────────────────────────────

#[tokio::test]
async fn test_parallel_strategy_end_to_end() {
    let config = ParticipantConfig {
        strategy: ReceivingStrategyKind::UnorderedParallel,
        ..ParticipantConfig::default()
    };
    let context = BusContext::new(config);
    let listener = context.create_listener(scope("/par/")).unwrap();
    let informer = context.create_informer(scope("/par/")).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let count_in_handler = count.clone();
    listener
        .add_handler(
            handler_fn(move |_event| {
                let count = count_in_handler.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            true,
        )
        .await;
    listener.activate().await.unwrap();
    informer.activate().await.unwrap();

    for i in 0..10 {
        informer.publish("string", format!("{}", i)).await.unwrap();
    }
    wait_until(|| count.load(Ordering::SeqCst) == 10).await;
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_participant_lifecycle_contract() {
    let context = BusContext::default();
    let informer = context.create_informer(scope("/life/")).unwrap();

    assert!(!informer.is_active());
    informer.activate().await.unwrap();
    assert!(informer.is_active());
    assert!(matches!(
        informer.activate().await,
        Err(BusError::Lifecycle(_))
    ));
    informer.deactivate().await.unwrap();
    assert!(!informer.is_active());
    assert!(matches!(
        informer.activate().await,
        Err(BusError::Lifecycle(_))
    ));
    assert!(matches!(
        informer.deactivate().await,
        Err(BusError::Lifecycle(_))
    ));
}

#[tokio::test]
async fn test_publish_on_inactive_informer_fails() {
    let context = BusContext::default();
    let informer = context.create_informer(scope("/life/")).unwrap();
    assert!(matches!(
        informer.publish("string", "x").await,
        Err(BusError::Inactive)
    ));
}

// ─── Configuration ───────────────────────────────────────────────

#[tokio::test]
async fn test_disabled_memory_transport_fails_creation() {
    let mut config = ParticipantConfig::default();
    config.transports.insert(
        "memory".to_string(),
        TransportOptions {
            enabled: false,
            options: Default::default(),
        },
    );
    let context = BusContext::new(config);
    assert!(matches!(
        context.create_informer(scope("/x/")),
        Err(BusError::Config(_))
    ));
}
