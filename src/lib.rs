//! Jetbind - declarative NATS messaging bindings
//!
//! A runtime for wiring applications to one or more NATS servers from
//! configuration: connection bootstrap, JetStream stream and consumer
//! reconciliation, and typed publish/request/subscribe dispatch over
//! resolved method bindings.

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod reconcile;
pub mod telemetry;
pub mod transport;
