//! Asynchronous, restart-resilient client SDK for a vehicle signal data
//! broker.
//!
//! # Purpose
//! Applications read, actuate and subscribe to named vehicle signals
//! through [`DataBrokerClient`]. The SDK resolves signal paths to the
//! broker's session-scoped numeric ids, coalesces and caches those
//! lookups, and keeps subscriptions alive across broker restarts with
//! capped exponential backoff.
//!
//! # Design notes
//! Everything asynchronous funnels through one [`WorkerPool`] of due-time
//! ordered jobs per [`SdkContext`]; there is no process-wide state. Results
//! and subscriptions are consumable either by awaiting or through
//! callbacks, never both on the same object.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod metadata;
pub mod pool;
pub mod result;
pub mod subscription;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use client::DataBrokerClient;
pub use config::SdkConfig;
pub use context::SdkContext;
pub use error::SdkError;
pub use facade::BrokerFacade;
pub use metadata::{Metadata, MetadataAgent};
pub use pool::{Job, WorkerPool};
pub use result::{AsyncResult, AsyncSubscription};
pub use subscription::{SignalEntry, Snapshot, SubscriptionSupervisor};
