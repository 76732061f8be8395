//! Event receiving strategies
//!
//! A strategy turns the raw incoming event stream of a listener into
//! handler callbacks under a chosen concurrency model:
//!
//! - [`SingleThreadedStrategy`] — one dispatch task draining a bounded
//!   queue; total delivery order across all events and handlers;
//!   backpressure on the producer when the queue is full.
//! - [`UnorderedParallelStrategy`] — a bounded worker pool with one
//!   task per handler per event; no ordering guarantees; failures are
//!   isolated per invocation.
//!
//! Both stamp the deliver time immediately before invoking a handler,
//! and both catch handler failures and panics at the dispatch boundary
//! so one handler can never affect another.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::config::{BackpressurePolicy, ParticipantConfig};
use crate::connector::HandlerId;
use crate::error::{BusError, Result};
use crate::event::{now_micros, Event};

/// User-level event handler
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>>;
}

struct FnHandler(Box<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>);

impl EventHandler for FnHandler {
    fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>> {
        (self.0)(event)
    }
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(Box::new(move |event| Box::pin(f(event)))))
}

/// Discriminator for the closed set of strategy variants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceivingStrategyKind {
    #[default]
    SingleThreaded,
    UnorderedParallel,
}

/// Dispatch policy between a connector's raw stream and user handlers
#[async_trait]
pub trait EventReceivingStrategy: Send + Sync {
    fn kind(&self) -> ReceivingStrategyKind;

    /// Register a handler. With `wait` the call returns only once the
    /// registration is visible to dispatch; without it the registration
    /// may be deferred.
    async fn add_handler(&self, handler: Arc<dyn EventHandler>, wait: bool) -> HandlerId;

    /// Remove a handler; `wait` as for [`add_handler`](Self::add_handler)
    async fn remove_handler(&self, id: HandlerId, wait: bool) -> Result<()>;

    /// Feed one event into the strategy
    async fn handle(&self, event: Event) -> Result<()>;

    /// Stop accepting work and deterministically finish in-flight
    /// dispatch. Calling this twice is a usage error.
    async fn deactivate(&self) -> Result<()>;
}

/// Build the configured strategy variant
pub fn create_strategy(
    kind: ReceivingStrategyKind,
    config: &ParticipantConfig,
) -> Arc<dyn EventReceivingStrategy> {
    match kind {
        ReceivingStrategyKind::SingleThreaded => Arc::new(SingleThreadedStrategy::new(
            config.queue_capacity,
            config.backpressure,
        )),
        ReceivingStrategyKind::UnorderedParallel => {
            Arc::new(UnorderedParallelStrategy::new(config.pool_size))
        }
    }
}

async fn invoke(id: HandlerId, handler: &dyn EventHandler, mut event: Event) {
    event.metadata.deliver_time = Some(now_micros());
    match std::panic::AssertUnwindSafe(handler.handle(event))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(handler = id, error = %e, "Handler failed"),
        Err(_) => error!(handler = id, "Handler panicked"),
    }
}

// ---------------------------------------------------------------------------
// Single-threaded strategy
// ---------------------------------------------------------------------------

type HandlerList = Arc<RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>>;

struct WorkerState {
    handle: Option<JoinHandle<()>>,
    deactivated: bool,
}

/// Totally ordered dispatch through one task and a bounded queue
///
/// Handlers for one event run in registration order, strictly before
/// the next queued event. `handle` exerts backpressure according to the
/// configured [`BackpressurePolicy`] when the queue is full.
pub struct SingleThreadedStrategy {
    tx: std::sync::Mutex<Option<mpsc::Sender<Event>>>,
    handlers: HandlerList,
    next_id: AtomicU64,
    policy: BackpressurePolicy,
    worker: tokio::sync::Mutex<WorkerState>,
}

impl SingleThreadedStrategy {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        let handlers: HandlerList = Arc::new(RwLock::new(Vec::new()));

        let dispatch_handlers = handlers.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Holding the read lock for the whole round makes a
                // waiting add/remove observe round boundaries.
                let current = dispatch_handlers.read().await;
                for (id, handler) in current.iter() {
                    invoke(*id, handler.as_ref(), event.clone()).await;
                }
            }
        });

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            handlers,
            next_id: AtomicU64::new(1),
            policy,
            worker: tokio::sync::Mutex::new(WorkerState {
                handle: Some(handle),
                deactivated: false,
            }),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Event>> {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| BusError::Lifecycle("strategy deactivated".to_string()))
    }
}

#[async_trait]
impl EventReceivingStrategy for SingleThreadedStrategy {
    fn kind(&self) -> ReceivingStrategyKind {
        ReceivingStrategyKind::SingleThreaded
    }

    async fn add_handler(&self, handler: Arc<dyn EventHandler>, wait: bool) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if wait {
            self.handlers.write().await.push((id, handler));
        } else {
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                handlers.write().await.push((id, handler));
            });
        }
        id
    }

    async fn remove_handler(&self, id: HandlerId, wait: bool) -> Result<()> {
        if wait {
            let mut handlers = self.handlers.write().await;
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.len() == before {
                return Err(BusError::UnknownHandler(id));
            }
            Ok(())
        } else {
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                handlers.write().await.retain(|(handler_id, _)| *handler_id != id);
            });
            Ok(())
        }
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let tx = self.sender()?;
        match self.policy {
            BackpressurePolicy::Block => tx
                .send(event)
                .await
                .map_err(|_| BusError::Lifecycle("dispatch task stopped".to_string())),
            BackpressurePolicy::Deadline(deadline) => {
                match tokio::time::timeout(deadline, tx.send(event)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(BusError::Lifecycle("dispatch task stopped".to_string())),
                    Err(_) => Err(BusError::Backpressure(format!(
                        "dispatch queue full after {:?}",
                        deadline
                    ))),
                }
            }
        }
    }

    async fn deactivate(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.deactivated {
            return Err(BusError::Lifecycle(
                "strategy already deactivated".to_string(),
            ));
        }
        worker.deactivated = true;

        // Stop accepting new work; the dispatch task drains what is
        // already queued and then exits.
        match self.tx.lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        if let Some(handle) = worker.handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unordered parallel strategy
// ---------------------------------------------------------------------------

/// Unordered dispatch over a bounded worker pool
///
/// One task per registered handler per event, capped by a semaphore of
/// pool size. No ordering guarantee between invocations; a failing or
/// panicking handler affects neither other handlers nor the pool.
pub struct UnorderedParallelStrategy {
    handlers: HandlerList,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    next_id: AtomicU64,
    closed: AtomicBool,
    deactivated: tokio::sync::Mutex<bool>,
}

impl UnorderedParallelStrategy {
    pub fn new(pool_size: usize) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            deactivated: tokio::sync::Mutex::new(false),
        }
    }
}

#[async_trait]
impl EventReceivingStrategy for UnorderedParallelStrategy {
    fn kind(&self) -> ReceivingStrategyKind {
        ReceivingStrategyKind::UnorderedParallel
    }

    async fn add_handler(&self, handler: Arc<dyn EventHandler>, wait: bool) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if wait {
            self.handlers.write().await.push((id, handler));
        } else {
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                handlers.write().await.push((id, handler));
            });
        }
        id
    }

    async fn remove_handler(&self, id: HandlerId, wait: bool) -> Result<()> {
        if wait {
            let mut handlers = self.handlers.write().await;
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.len() == before {
                return Err(BusError::UnknownHandler(id));
            }
            Ok(())
        } else {
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                handlers.write().await.retain(|(handler_id, _)| *handler_id != id);
            });
            Ok(())
        }
    }

    async fn handle(&self, event: Event) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Lifecycle("strategy deactivated".to_string()));
        }

        let snapshot: Vec<_> = self.handlers.read().await.clone();
        for (id, handler) in snapshot {
            let semaphore = self.semaphore.clone();
            let event = event.clone();
            self.tracker.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                invoke(id, handler.as_ref(), event).await;
            });
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        let mut deactivated = self.deactivated.lock().await;
        if *deactivated {
            return Err(BusError::Lifecycle(
                "strategy already deactivated".to_string(),
            ));
        }
        *deactivated = true;
        self.closed.store(true, Ordering::SeqCst);
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}
