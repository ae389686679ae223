use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer.
///
/// The serialized names are the persisted representation, so renaming a
/// variant here is a storage format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "initializing")]
    Initializing,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "copying")]
    Copying,
    #[serde(rename = "pendingcopy")]
    PendingCopy,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "seeding")]
    Seeding,
    #[serde(rename = "stopping")]
    Stopping,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "removing")]
    Removing,
    #[serde(rename = "removed")]
    Removed,
}

/// Display metadata for a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    /// Human-readable label.
    pub name: &'static str,
    /// Whether a progress bar makes sense while in this state.
    pub progress: bool,
    /// Whether the transfer is actively moving bytes in this state.
    pub transferring: bool,
}

impl TransferState {
    /// Returns the display descriptor for this state.
    pub fn describe(self) -> StateInfo {
        use TransferState::*;
        match self {
            Queued => StateInfo { name: "Queued", progress: false, transferring: false },
            Initializing => StateInfo { name: "Initializing", progress: false, transferring: true },
            Starting => StateInfo { name: "Starting", progress: true, transferring: true },
            Downloading => StateInfo { name: "Downloading", progress: true, transferring: true },
            Copying => StateInfo { name: "Copying", progress: false, transferring: false },
            PendingCopy => StateInfo { name: "Copy Failed", progress: false, transferring: false },
            Completed => StateInfo { name: "Completed", progress: false, transferring: false },
            Seeding => StateInfo { name: "Seeding", progress: true, transferring: true },
            Stopping => StateInfo { name: "Stopping", progress: false, transferring: false },
            Stopped => StateInfo { name: "Stopped", progress: false, transferring: false },
            Failed => StateInfo { name: "Failed", progress: false, transferring: false },
            Removing => StateInfo { name: "Removing", progress: false, transferring: false },
            Removed => StateInfo { name: "Removed", progress: false, transferring: false },
        }
    }

    /// True while the transfer is actively moving bytes.
    pub fn is_transferring(self) -> bool {
        self.describe().transferring
    }

    /// True once the transfer can no longer make forward progress on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Removed
        )
    }
}
