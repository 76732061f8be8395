//! RPC server participant
//!
//! A [`LocalServer`] exposes named methods under its base scope. Each
//! registered method gets a listener on the method scope; the callback
//! result is wrapped in a reply event whose causal vector carries the
//! request's id. A failing (or panicking) callback becomes an error
//! reply, so callers fail deterministically instead of timing out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{method_scope, ERROR_INFO_KEY, METHOD_REPLY, METHOD_REQUEST};
use crate::context::BusContext;
use crate::dispatch::handler_fn;
use crate::error::{BusError, Result};
use crate::event::{Event, ParticipantId};
use crate::informer::Informer;
use crate::listener::Listener;
use crate::participant::{Participant, ParticipantState};
use crate::scope::Scope;

/// Server-side method implementation
///
/// Receives the full request event (payload, metadata, causes) and
/// returns the reply payload bytes.
pub type MethodCallback = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// Wrap an async closure as a [`MethodCallback`]
pub fn method_fn<F, Fut>(f: F) -> MethodCallback
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

struct MethodEntry {
    listener: Arc<Listener>,
    informer: Arc<Informer>,
}

impl MethodEntry {
    async fn activate(&self) -> Result<()> {
        self.listener.activate().await?;
        self.informer.activate().await
    }

    async fn deactivate(&self) -> Result<()> {
        self.listener.deactivate().await?;
        self.informer.deactivate().await
    }
}

pub struct LocalServer {
    id: ParticipantId,
    scope: Scope,
    state: ParticipantState,
    context: BusContext,
    methods: tokio::sync::Mutex<HashMap<String, MethodEntry>>,
}

impl LocalServer {
    pub(crate) fn new(context: BusContext, scope: Scope) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            state: ParticipantState::new(),
            context,
            methods: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a callback under a method name
    ///
    /// May be called before or after activation; methods registered on
    /// an active server start serving immediately.
    pub async fn register_method(&self, name: &str, callback: MethodCallback) -> Result<()> {
        let mut methods = self.methods.lock().await;
        if methods.contains_key(name) {
            return Err(BusError::Config(format!(
                "method '{}' already registered",
                name
            )));
        }

        let scope = method_scope(&self.scope, name)?;
        let informer = Arc::new(self.context.create_informer(scope.clone())?);
        let listener = Arc::new(self.context.create_listener(scope.clone())?);

        let reply_informer = informer.clone();
        let reply_scope = scope.clone();
        listener
            .add_handler(
                handler_fn(move |event| {
                    serve_request(
                        reply_informer.clone(),
                        callback.clone(),
                        reply_scope.clone(),
                        event,
                    )
                }),
                true,
            )
            .await;

        let entry = MethodEntry { listener, informer };
        if self.is_active() {
            entry.activate().await?;
        }
        debug!(method = name, scope = %scope, "Method registered");
        methods.insert(name.to_string(), entry);
        Ok(())
    }
}

/// Handle one incoming event on a method scope
async fn serve_request(
    informer: Arc<Informer>,
    callback: MethodCallback,
    scope: Scope,
    event: Event,
) -> Result<()> {
    // Replies travel on the same scope; only serve requests
    if event.method.as_deref() != Some(METHOD_REQUEST) {
        return Ok(());
    }
    let Some(request_id) = event.id() else {
        warn!(scope = %scope, "Ignoring request without an id");
        return Ok(());
    };

    let outcome = std::panic::AssertUnwindSafe(callback(event))
        .catch_unwind()
        .await;
    let mut reply = match outcome {
        Ok(Ok(payload)) => Event::new(scope, "bytes", "bytes", payload),
        Ok(Err(e)) => {
            warn!(error = %e, "Method callback failed; sending error reply");
            error_reply(scope, e.to_string())
        }
        Err(_) => {
            warn!("Method callback panicked; sending error reply");
            error_reply(scope, "method callback panicked".to_string())
        }
    };
    reply.method = Some(METHOD_REPLY.to_string());
    reply.add_cause(request_id);
    informer.send(reply).await.map(|_| ())
}

fn error_reply(scope: Scope, message: String) -> Event {
    Event::new(scope, "error", "utf-8-string", message.clone().into_bytes())
        .with_user_info(ERROR_INFO_KEY, message)
}

#[async_trait]
impl Participant for LocalServer {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn activate(&self) -> Result<()> {
        self.state.activate().await?;
        let methods = self.methods.lock().await;
        for entry in methods.values() {
            entry.activate().await?;
        }
        info!(scope = %self.scope, methods = methods.len(), "Server activated");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.state.deactivate().await?;
        let methods = self.methods.lock().await;
        for entry in methods.values() {
            entry.deactivate().await?;
        }
        info!(scope = %self.scope, "Server deactivated");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
