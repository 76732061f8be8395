//! # scopebus
//!
//! Scope-addressed publish/subscribe event bus with pluggable
//! transports and a request/reply RPC layer on top.
//!
//! ## Overview
//!
//! Producers publish typed events under hierarchical names (scopes);
//! consumers subscribe to a scope — and implicitly its descendants —
//! and receive matching events through a configurable dispatch
//! strategy. The RPC layer reuses the same event plane for method
//! call/reply semantics with synchronous and asynchronous call styles
//! and cancellation.
//!
//! ## Quick Start
//!
//! ```rust
//! use scopebus::{BusContext, Participant, Scope, handler_fn};
//!
//! # async fn example() -> scopebus::Result<()> {
//! let context = BusContext::default();
//!
//! let listener = context.create_listener(Scope::parse("/sensors/")?)?;
//! listener
//!     .add_handler(
//!         handler_fn(|event| async move {
//!             println!("{}: {} bytes", event.scope, event.payload.len());
//!             Ok(())
//!         }),
//!         true,
//!     )
//!     .await;
//! listener.activate().await?;
//!
//! let informer = context.create_informer(Scope::parse("/sensors/lidar/")?)?;
//! informer.activate().await?;
//! informer.publish("scan", vec![1u8, 2, 3]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[`Scope`]** — hierarchical names with strict-prefix containment
//! - **[`Event`]** — payload envelope with causal identifiers and
//!   timestamp metadata
//! - **[`Filter`]/[`Subscription`]** — composable predicates narrowing
//!   delivery
//! - **Connectors** — transport-neutral in/out ports; in-process
//!   [`connector::memory`] and TCP [`connector::socket`] transports
//! - **[`EventReceivingStrategy`]** — single-threaded (totally
//!   ordered, backpressured) or unordered-parallel dispatch
//! - **[`Informer`]/[`Listener`]** — publishing and subscribing
//!   participants sharing one lifecycle contract
//! - **[`rpc`]** — request/reply with causal correlation and
//!   cancellation
//! - **[`BusContext`]** — explicit factory and transport registry,
//!   no process-wide singletons

pub mod config;
pub mod connector;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod informer;
pub mod listener;
pub mod participant;
pub mod rpc;
pub mod scope;

// Re-export core types
pub use config::{
    BackpressurePolicy, Ordering, ParticipantConfig, QualityOfServiceSpec, Reliability,
    TransportOptions,
};
pub use connector::{Connector, EventSink, HandlerId, InPushConnector, OutConnector};
pub use context::{BusContext, TransportFactory, TransportRegistry};
pub use dispatch::{
    handler_fn, EventHandler, EventReceivingStrategy, ReceivingStrategyKind,
    SingleThreadedStrategy, UnorderedParallelStrategy,
};
pub use error::{BusError, Result};
pub use event::{Event, EventId, MetaData, ParticipantId};
pub use filter::{Filter, FilterAction, FilterObserver, Subscription};
pub use informer::Informer;
pub use listener::Listener;
pub use participant::Participant;
pub use rpc::{method_fn, LocalServer, MethodCallback, RemoteCall, RemoteServer};
pub use scope::Scope;
