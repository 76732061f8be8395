//! Request/reply RPC on top of the event plane
//!
//! A method lives on a scope derived from the server's base scope
//! (`base/method_name`). Requests and replies travel on that same
//! scope, distinguished by the event method tag; a reply correlates to
//! its request through the causal link — the reply's causes contain the
//! request's event id. There is no separate reply scope.

use crate::error::Result;
use crate::scope::Scope;

pub mod client;
pub mod server;

pub use client::{RemoteCall, RemoteServer};
pub use server::{method_fn, LocalServer, MethodCallback};

/// Method tag of request events
pub const METHOD_REQUEST: &str = "REQUEST";

/// Method tag of reply events
pub const METHOD_REPLY: &str = "REPLY";

/// User-info key flagging an error reply; the value carries the message
pub(crate) const ERROR_INFO_KEY: &str = "rpc.error";

/// Scope a method's traffic travels on
pub(crate) fn method_scope(base: &Scope, method: &str) -> Result<Scope> {
    base.push(method)
}
