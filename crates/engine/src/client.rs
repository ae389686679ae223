//! Transfer client contract and the shared state-machine plumbing every
//! protocol implementation composes with.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::json;
use sluice_flow::{Flow, FlowBuilder, FlowError, HookStage, Transition};
use sluice_model::{FileInfo, Transfer, TransferEvent, TransferState};
use uuid::Uuid;

use crate::{AppContext, EngineError};

/// Boxed future used by the dyn-safe traits below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Shared, interior-mutable handle to one [`Transfer`] record.
///
/// Exactly one client owns the transfer while it is non-terminal, but the
/// owning agent and the protocol I/O task both read and update fields
/// through this handle.
#[derive(Clone)]
pub struct SharedTransfer {
    inner: Arc<RwLock<Transfer>>,
}

impl SharedTransfer {
    pub fn new(transfer: Transfer) -> Self {
        Self {
            inner: Arc::new(RwLock::new(transfer)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.read().unwrap().id
    }

    pub fn state(&self) -> TransferState {
        self.inner.read().unwrap().state
    }

    /// Clones the current record.
    pub fn snapshot(&self) -> Transfer {
        self.inner.read().unwrap().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Transfer) -> R) -> R {
        f(&self.inner.read().unwrap())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut Transfer) -> R) -> R {
        f(&mut self.inner.write().unwrap())
    }
}

/// Runtime driver of one transfer: a state machine plus protocol I/O.
///
/// Lifecycle methods are state machine events; implementations respond to
/// them in their [`sluice_flow::FlowHooks`] handlers rather than
/// overriding these methods.
pub trait TransferClient: Send + Sync {
    /// Handle to the transfer this client drives.
    fn transfer(&self) -> SharedTransfer;

    fn state(&self) -> TransferState;

    /// Fires a lifecycle event through the client's state machine. Events
    /// for one client are strictly ordered; concurrent callers queue.
    fn fire(&self, event: TransferEvent) -> BoxFuture<'_, Result<(), EngineError>>;

    /// The settings on the underlying transfer changed (bandwidth cap,
    /// connection limit); push them into the protocol layer.
    fn update(&self);

    /// Tears down the transfer process. The client is dead afterwards and
    /// a new one must be provisioned to continue.
    fn shutdown(&self) -> BoxFuture<'_, ()>;

    /// Local directory where this transfer's files live.
    fn directory(&self) -> PathBuf;

    /// Files that are part of this transfer, relative to `directory()`.
    fn files(&self) -> Vec<FileInfo>;
}

/// Factory contract a protocol transport registers with an agent.
pub trait TransferClientFactory: Send + Sync {
    /// Decides from the URL scheme / declared mime type whether this
    /// transport can handle the transfer.
    fn accepts(&self, transfer: &Transfer) -> bool;

    fn client(&self, transfer: SharedTransfer) -> Result<Arc<dyn TransferClient>, EngineError>;
}

/// Transition table for plain download transports.
///
/// Normal flow: QUEUED --start--> STARTING --started--> DOWNLOADING
/// --complete--> COPYING --fetched--> COMPLETED. `failed` is valid from
/// anywhere; `remove` goes through REMOVING when the transfer is busy and
/// straight to REMOVED from settled states.
pub fn download_rules(initial: TransferState) -> Flow<TransferState, TransferEvent> {
    use TransferEvent as E;
    use TransferState as S;

    FlowBuilder::new(initial)
        .on(E::Start, &[S::Queued, S::Stopped, S::Failed], S::Starting)
        .on(E::Started, &[S::Starting], S::Downloading)
        .on(E::Updated, &[S::Downloading], S::Downloading)
        .on(E::Stop, &[S::Starting, S::Downloading], S::Stopping)
        .on(E::Stopped, &[S::Stopping], S::Stopped)
        .on(E::Enqueue, &[S::Stopped], S::Queued)
        .on_any(E::Failed, S::Failed)
        .on(E::Complete, &[S::Downloading], S::Copying)
        .on(E::FetchFailed, &[S::Copying], S::PendingCopy)
        .on(E::Stop, &[S::Copying], S::PendingCopy)
        .on(E::Start, &[S::PendingCopy], S::Copying)
        .on(E::Fetched, &[S::Copying], S::Completed)
        .on(
            E::Remove,
            &[S::Starting, S::Downloading, S::Copying],
            S::Removing,
        )
        .on(E::Stopped, &[S::Removing], S::Removed)
        .on(
            E::Remove,
            &[S::Queued, S::Stopped, S::Failed, S::Completed, S::PendingCopy],
            S::Removed,
        )
        .build()
}

/// Transition table for peer-to-peer download transports, which seed after
/// the payload has been materialized. The seeding completion predicate is
/// the transport's business; the table only fixes the states around it.
pub fn peer_rules(initial: TransferState) -> Flow<TransferState, TransferEvent> {
    use TransferEvent as E;
    use TransferState as S;

    FlowBuilder::new(initial)
        .on(E::Start, &[S::Queued, S::Stopped, S::Failed], S::Initializing)
        .on(E::Initialized, &[S::Initializing], S::Starting)
        .on(E::Started, &[S::Starting], S::Downloading)
        .on(E::Updated, &[S::Downloading], S::Downloading)
        .on(
            E::Stop,
            &[S::Initializing, S::Starting, S::Downloading],
            S::Stopping,
        )
        .on(E::Stopped, &[S::Stopping], S::Stopped)
        .on(E::Enqueue, &[S::Stopped], S::Queued)
        .on_any(E::Failed, S::Failed)
        .on(E::Complete, &[S::Downloading], S::Copying)
        .on(E::FetchFailed, &[S::Copying], S::PendingCopy)
        .on(E::Stop, &[S::Copying], S::PendingCopy)
        .on(E::Start, &[S::PendingCopy], S::Copying)
        .on(E::Fetched, &[S::Copying], S::Seeding)
        .on(E::Complete, &[S::Seeding], S::Completed)
        .on(E::Stop, &[S::Seeding], S::Completed)
        .on(E::Remove, &[S::Downloading, S::Seeding], S::Removing)
        .on(E::Stopped, &[S::Removing], S::Removed)
        .on(
            E::Remove,
            &[S::Queued, S::Stopped, S::Failed, S::Completed, S::PendingCopy],
            S::Removed,
        )
        .build()
}

/// State machine plus collaborator plumbing shared by every client
/// implementation; protocol clients hold one and delegate to it.
pub struct ClientCore {
    transfer: SharedTransfer,
    flow: Flow<TransferState, TransferEvent>,
    ctx: AppContext,
    /// Serializes event firing per client so cross-task event injection
    /// waits instead of tripping the machine's in-flight guard.
    fire_lock: tokio::sync::Mutex<()>,
}

impl ClientCore {
    pub fn new(
        transfer: SharedTransfer,
        ctx: AppContext,
        flow: Flow<TransferState, TransferEvent>,
    ) -> Self {
        Self {
            transfer,
            flow,
            ctx,
            fire_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn transfer(&self) -> &SharedTransfer {
        &self.transfer
    }

    pub fn ctx(&self) -> &AppContext {
        &self.ctx
    }

    pub fn state(&self) -> TransferState {
        self.flow.current()
    }

    pub fn can(&self, event: TransferEvent) -> bool {
        self.flow.can(event)
    }

    /// Fires `event` with the given hooks, serialized against other fires
    /// on this client.
    pub async fn fire(
        &self,
        event: TransferEvent,
        hooks: &dyn sluice_flow::FlowHooks<TransferState, TransferEvent>,
    ) -> Result<(), EngineError> {
        let _serialized = self.fire_lock.lock().await;
        self.flow.fire(event, hooks).await?;
        Ok(())
    }

    /// Canonical change-state handler: records the new state on the
    /// transfer, persists it, and publishes the lifecycle event.
    pub fn apply_change(
        &self,
        t: Transition<TransferState, TransferEvent>,
    ) -> Result<(), FlowError<TransferState, TransferEvent>> {
        self.transfer.write(|tr| tr.state = t.to);
        self.persist()
            .map_err(|e| FlowError::hook(HookStage::ChangeState, t.event, e))?;
        self.ctx.events.fire(
            t.event.bus_name(),
            &json!({
                "transferId": self.transfer.id(),
                "event": t.event,
                "from": t.from,
                "to": t.to,
            }),
        );
        Ok(())
    }

    /// Writes the current transfer record through the storage collaborator.
    pub fn persist(&self) -> Result<(), EngineError> {
        let snapshot = self.transfer.snapshot();
        self.ctx.store.update(&snapshot)?;
        self.ctx.store.commit()?;
        Ok(())
    }
}

/// Instantaneous rate estimation over a ten-second sliding window of
/// cumulative byte counts, sampled once per second.
pub struct RateSampler {
    samples: VecDeque<u64>,
    last_sample: Option<u64>,
    rate: u64,
}

const SAMPLE_WINDOW: usize = 10;

impl Default for RateSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RateSampler {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW + 1),
            last_sample: None,
            rate: 0,
        }
    }

    /// Records the cumulative byte count observed at `now` (whole seconds,
    /// any monotonic origin) and returns the current rate in bytes/sec.
    pub fn record(&mut self, total_bytes: u64, now: u64) -> u64 {
        match self.last_sample {
            None => {
                self.samples.push_front(total_bytes);
                self.last_sample = Some(now);
            }
            Some(last) if now > last => {
                // One slot per elapsed second, so stalls drag the average
                // down instead of freezing it.
                for _ in last..now {
                    self.samples.push_front(total_bytes);
                }
                self.samples.truncate(SAMPLE_WINDOW);
                if self.samples.len() > 1 {
                    let diffs: u64 = self.samples.front().unwrap() - self.samples.back().unwrap();
                    self.rate = diffs / (self.samples.len() as u64 - 1);
                }
                self.last_sample = Some(now);
            }
            _ => {}
        }
        self.rate
    }
}
