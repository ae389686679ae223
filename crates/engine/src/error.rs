use sluice_core::StoreError;
use sluice_flow::FlowError;
use sluice_model::{TransferEvent, TransferState};
use uuid::Uuid;

/// Errors produced by the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Flow(#[from] FlowError<TransferState, TransferEvent>),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// No registered agent accepts the transfer; surfaced to the user as a
    /// persisted alert, not as a failure of the add operation.
    #[error("no agent available for transfer {0}")]
    NoAgent(Uuid),

    /// The owning agent has no transport for the transfer.
    #[error("no transport accepts transfer {0}")]
    NoTransport(Uuid),

    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True when a fired event was vetoed by a before-event hook, which is
    /// the expected outcome of a mid-flight re-provision.
    pub fn is_veto(&self) -> bool {
        matches!(self, EngineError::Flow(FlowError::Vetoed { .. }))
    }
}
