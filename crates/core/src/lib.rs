//! Collaborator contracts the orchestration engine depends on, plus
//! in-memory default implementations.
//!
//! The engine never talks to a concrete database, settings file, or
//! notification pipeline; it goes through the traits defined here. The
//! in-memory implementations back tests and small single-process
//! deployments.

mod alerts;
mod events;
mod settings;
mod store;

pub use alerts::{AlertSink, MemoryAlerts};
pub use events::{EventBus, ListenerError};
pub use settings::{MemorySettings, Settings};
pub use store::{Criteria, MemoryStore, StoreError, TransferStore};
