use serde::{Deserialize, Serialize};

/// Events accepted by a transfer's state machine.
///
/// Every lifecycle change goes through one of these; protocol layers
/// convert their callbacks into events rather than mutating state directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferEvent {
    /// Requeue a stopped transfer.
    Enqueue,
    Start,
    Initialized,
    Started,
    /// Progress tick while transferring.
    Updated,
    /// Payload fully received; begin materializing to the destination.
    Complete,
    Stop,
    Stopped,
    Failed,
    Remove,
    /// Destination materialization finished.
    Fetched,
    /// Destination materialization failed (retryable).
    FetchFailed,
}

impl TransferEvent {
    /// Name under which this event is published on the event bus.
    pub fn bus_name(self) -> &'static str {
        use TransferEvent::*;
        match self {
            Enqueue => "transfer_enqueue",
            Start => "transfer_start",
            Initialized => "transfer_initialized",
            Started => "transfer_started",
            Updated => "transfer_updated",
            Complete => "transfer_complete",
            Stop => "transfer_stop",
            Stopped => "transfer_stopped",
            Failed => "transfer_failed",
            Remove => "transfer_remove",
            Fetched => "transfer_fetched",
            FetchFailed => "transfer_fetch_failed",
        }
    }
}

/// Bus-only event names that do not correspond to a state machine event.
pub mod bus {
    /// A new transfer was persisted and is about to be provisioned.
    pub const ADDED: &str = "transfer_added";
    /// A transfer reached its final REMOVED state.
    pub const REMOVED: &str = "transfer_removed";
    /// All agents were asked to pause.
    pub const PAUSED: &str = "sluice_paused";
    /// All agents were asked to resume.
    pub const RESUMED: &str = "sluice_resumed";
}
