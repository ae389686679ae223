//! Domain data model shared by every sluice crate.
//!
//! Holds the persistent [`Transfer`] record, its lifecycle [`TransferState`]
//! and [`TransferEvent`] vocabulary, and the ephemeral status snapshots
//! exposed to monitoring surfaces.

mod alert;
mod event;
mod state;
mod status;
mod transfer;

pub use alert::{Alert, AlertLevel};
pub use event::{TransferEvent, bus};
pub use state::{StateInfo, TransferState};
pub use status::{AgentStatus, FileInfo};
pub use transfer::{Health, Transfer};

/// Version reported in agent status snapshots.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
