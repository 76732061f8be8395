//! RPC client participant
//!
//! A [`RemoteServer`] calls methods on a remote [`LocalServer`]
//! (`crate::rpc::LocalServer`). Each call publishes a request event and
//! installs a transient listener, filtered on the request's id through
//! a cause filter, before the request goes out — so the matching reply
//! is never missed. [`RemoteCall`] resolves to the reply event and
//! supports cooperative cancellation; the transient listener is
//! released on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{method_scope, ERROR_INFO_KEY, METHOD_REPLY, METHOD_REQUEST};
use crate::context::BusContext;
use crate::dispatch::handler_fn;
use crate::error::{BusError, Result};
use crate::event::{Event, ParticipantId};
use crate::filter::Filter;
use crate::informer::Informer;
use crate::listener::Listener;
use crate::participant::{Participant, ParticipantState};
use crate::scope::Scope;

pub struct RemoteServer {
    id: ParticipantId,
    scope: Scope,
    state: ParticipantState,
    context: BusContext,
    timeout: Duration,
    informers: tokio::sync::Mutex<HashMap<String, Arc<Informer>>>,
}

impl RemoteServer {
    pub(crate) fn new(context: BusContext, scope: Scope, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            state: ParticipantState::new(),
            context,
            timeout,
            informers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Reply deadline applied by [`call`](Self::call) and
    /// [`RemoteCall::wait`]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One request informer per method, created on first use
    async fn informer_for(&self, method: &str, scope: &Scope) -> Result<Arc<Informer>> {
        let mut informers = self.informers.lock().await;
        if let Some(informer) = informers.get(method) {
            return Ok(informer.clone());
        }
        let informer = Arc::new(self.context.create_informer(scope.clone())?);
        informer.activate().await?;
        informers.insert(method.to_string(), informer.clone());
        Ok(informer)
    }

    /// Call a method synchronously, waiting for the reply payload
    pub async fn call(&self, method: &str, payload: impl Into<Bytes>) -> Result<Event> {
        self.call_async(method, payload).await?.wait().await
    }

    /// Start an asynchronous call, returning a [`RemoteCall`] handle
    pub async fn call_async(&self, method: &str, payload: impl Into<Bytes>) -> Result<RemoteCall> {
        if !self.is_active() {
            return Err(BusError::Inactive);
        }
        let scope = method_scope(&self.scope, method)?;
        let informer = self.informer_for(method, &scope).await?;

        // The request id must exist before the reply listener can
        // filter on it
        let request_id = informer.allocate_event_id();

        let listener = Arc::new(self.context.create_listener(scope.clone())?);
        listener.add_filter(Filter::cause(request_id)).await;

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(std::sync::Mutex::new(Some(tx)));
        listener
            .add_handler(
                handler_fn(move |event: Event| {
                    let slot = slot.clone();
                    async move {
                        if event.method.as_deref() != Some(METHOD_REPLY) {
                            return Ok(());
                        }
                        if let Some(tx) = slot.lock().ok().and_then(|mut guard| guard.take()) {
                            let _ = tx.send(event);
                        }
                        Ok(())
                    }
                }),
                true,
            )
            .await;
        listener.activate().await?;

        let mut request = Event::new(scope, "bytes", "bytes", payload);
        request.method = Some(METHOD_REQUEST.to_string());
        request.set_id(request_id);
        if let Err(e) = informer.send(request).await {
            let _ = listener.deactivate().await;
            return Err(e);
        }
        debug!(method, request = %request_id, "Request published");

        Ok(RemoteCall {
            rx,
            cancel: CancellationToken::new(),
            timeout: self.timeout,
            cleanup: Some(CallCleanup { listener }),
        })
    }
}

#[async_trait]
impl Participant for RemoteServer {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn activate(&self) -> Result<()> {
        self.state.activate().await?;
        info!(scope = %self.scope, "Remote server handle activated");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.state.deactivate().await?;
        let mut informers = self.informers.lock().await;
        for (_, informer) in informers.drain() {
            informer.deactivate().await?;
        }
        info!(scope = %self.scope, "Remote server handle deactivated");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

struct CallCleanup {
    listener: Arc<Listener>,
}

impl CallCleanup {
    async fn run(self) {
        if let Err(e) = self.listener.deactivate().await {
            debug!(error = %e, "Reply listener teardown failed");
        }
    }
}

/// Handle of one in-flight call
///
/// Resolves through [`wait`](Self::wait) to the reply event or an
/// error. Cancellation via [`cancel`](Self::cancel) (or any clone of
/// the [`cancellation_token`](Self::cancellation_token)) interrupts the
/// wait. The transient per-call reply listener is released on every
/// exit path — reply, timeout, cancellation, or drop.
pub struct RemoteCall {
    rx: oneshot::Receiver<Event>,
    cancel: CancellationToken,
    timeout: Duration,
    cleanup: Option<CallCleanup>,
}

impl RemoteCall {
    /// Token that cancels this call when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the call
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the reply
    ///
    /// Fails with [`BusError::Timeout`] past the configured deadline,
    /// [`BusError::Canceled`] if cancelled, or
    /// [`BusError::RemoteCall`] if the server reported an error.
    pub async fn wait(mut self) -> Result<Event> {
        let cleanup = self.cleanup.take();
        let result = tokio::select! {
            // Cancellation wins over a simultaneously ready reply
            biased;
            _ = self.cancel.cancelled() => Err(BusError::Canceled),
            reply = tokio::time::timeout(self.timeout, &mut self.rx) => match reply {
                Err(_) => Err(BusError::Timeout(format!(
                    "no reply within {:?}",
                    self.timeout
                ))),
                Ok(Err(_)) => Err(BusError::Connection("reply channel closed".to_string())),
                Ok(Ok(event)) => match event.metadata.user_infos.get(ERROR_INFO_KEY) {
                    Some(message) => Err(BusError::RemoteCall(message.clone())),
                    None => Ok(event),
                },
            },
        };
        if let Some(cleanup) = cleanup {
            cleanup.run().await;
        }
        result
    }
}

impl Drop for RemoteCall {
    fn drop(&mut self) {
        // Dropping an unawaited call still releases its listener,
        // best-effort, on the current runtime
        if let Some(cleanup) = self.cleanup.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(cleanup.run());
            }
        }
    }
}
