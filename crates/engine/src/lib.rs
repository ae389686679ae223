//! Transfer orchestration engine.
//!
//! Routes transfer requests to protocol-capable clients and governs how
//! many run at once, how bandwidth and connection slots are divided among
//! them, and how each lifecycle is tracked and recovered:
//!
//! - [`TransferClient`] / [`TransferClientFactory`] — the contract protocol
//!   transports implement, driven by a shared state machine
//! - [`HttpDownloadClient`] — the reference protocol implementation
//! - [`LocalAgent`] — per-transport pool with admission control and
//!   equal-split bandwidth fairness
//! - [`TransferManager`] — top-level router and status aggregator
//!
//! The engine is a library with no UI or persistence of its own; the
//! application provides the storage, settings, alerting, and event-bus
//! collaborators through [`AppContext`].

mod agent;
mod client;
mod error;
mod http;
mod manager;

use std::sync::Arc;

use sluice_core::{AlertSink, EventBus, Settings, TransferStore};

pub use agent::{LocalAgent, TransferAgent};
pub use client::{
    BoxFuture, ClientCore, RateSampler, SharedTransfer, TransferClient, TransferClientFactory,
    download_rules, peer_rules,
};
pub use error::EngineError;
pub use http::{HttpClientFactory, HttpDownloadClient};
pub use manager::TransferManager;

/// Shared handles to the external collaborators.
///
/// Cheap to clone; every component gets its own copy at construction.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn TransferStore>,
    pub events: Arc<EventBus>,
    pub alerts: Arc<dyn AlertSink>,
    pub settings: Arc<dyn Settings>,
}
