//! Typed message dispatch.
//!
//! This module contains:
//! - binding resolution: declared method bindings become an immutable
//!   dispatch table before any traffic flows
//! - `DispatchClient`: outbound notify/call against resolved bindings
//! - `DispatchListener`: inbound subscriptions feeding typed handlers
//!
//! Dispatch failures are contained per message: a payload that fails to
//! decode or a handler that errors never tears down its subscription.

pub mod binding;
pub mod client;
pub mod listener;

use thiserror::Error;

pub use binding::{
    resolve_bindings, BindingDescriptor, BindingState, ClientSpec, ResolvedBinding,
};
pub use client::{CallOptions, DispatchClient};
pub use listener::{DispatchListener, RequestHandler};

/// Errors from dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A binding could not be resolved at registration time. Fatal: the
    /// dispatch table is built before traffic flows.
    #[error("binding for method '{method}' is invalid: {detail}")]
    Binding {
        /// Method name.
        method: String,
        /// What is missing or wrong.
        detail: String,
    },

    /// The binding's connection is not present in the registry.
    #[error("connection '{connection}' is not available")]
    Unavailable {
        /// Connection name.
        connection: String,
    },

    /// Payload encoding or decoding failed for one message.
    #[error("serialization failed on '{subject}': {detail}")]
    Serialization {
        /// Subject involved.
        subject: String,
        /// Underlying failure.
        detail: String,
    },

    /// The transport operation itself failed.
    #[error("invocation of '{method}' failed: {detail}")]
    Invocation {
        /// Method name.
        method: String,
        /// Underlying failure.
        detail: String,
    },

    /// No reply arrived within the resolved response window.
    #[error("request to '{subject}' timed out after {elapsed:?}")]
    Timeout {
        /// Subject requested.
        subject: String,
        /// Window that elapsed.
        elapsed: std::time::Duration,
    },
}
