// src/events/mod.rs
//! Run events: durable log plus live fan-out
//!
//! Two sinks with independent failure modes:
//!
//! - **EventLog**: appends to the event repository (gap-free `seq` per run),
//!   retrying transient storage errors with bounded backoff
//! - **Broadcaster**: best-effort delivery to live subscribers with bounded
//!   queues; a full queue disconnects the subscriber instead of blocking
//!
//! The log publishes each committed event through the [`Publisher`] seam, so
//! the broadcaster never sees an event the store does not have.

pub mod broadcaster;
pub mod log;

pub use broadcaster::{
    Broadcast, Broadcaster, BroadcasterStats, Publisher, ReconcileAction, ReconcileNotice,
    Subscription,
};
pub use log::EventLog;
