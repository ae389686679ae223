//! Transfer agents: the layer that owns running clients.
//!
//! [`LocalAgent`] keeps a pool of provisioned clients, admits queued
//! transfers up to a configured ceiling, splits the agent-wide bandwidth and
//! connection budgets equally across whatever is active, and re-provisions a
//! transfer onto a different transport when a download turns out to belong
//! to one. Scheduling re-runs on a periodic tick and on lifecycle events,
//! so settings changes take effect without restarts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use sluice_core::Criteria;
use sluice_model::{AgentStatus, Transfer, TransferEvent, TransferState, VERSION, bus};
use sluice_throttle::RateLimiter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{BoxFuture, SharedTransfer, TransferClient, TransferClientFactory};
use crate::{AppContext, EngineError};

/// Scheduling pass interval when no lifecycle events arrive.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Host identity and disk facts refresh on this interval.
const STATUS_TTL_HOST: Duration = Duration::from_secs(10);
/// Transfer counters refresh on this interval.
const STATUS_TTL_COUNTERS: Duration = Duration::from_secs(1);

/// An agent hosts transfers it accepts and answers for their lifecycle.
///
/// The engine ships [`LocalAgent`]; remote agents proxying another host
/// implement the same contract.
pub trait TransferAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Whether any of this agent's transports can carry the transfer.
    fn accepts(&self, transfer: &Transfer) -> bool;

    /// Takes ownership of a transfer: creates a client for it and folds it
    /// into scheduling.
    fn provision(&self, transfer: SharedTransfer) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Snapshots of every non-removed transfer in the pool.
    fn transfers(&self) -> Vec<Transfer>;

    fn client_for(&self, id: Uuid) -> Option<Arc<dyn TransferClient>>;

    fn status(&self) -> BoxFuture<'_, AgentStatus>;

    fn pause(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    fn resume(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    fn remove(&self, id: Uuid) -> BoxFuture<'_, Result<(), EngineError>>;
}

/// Host/disk facts are slow to gather and change slowly; transfer
/// counters are cheap and change constantly. They age separately.
#[derive(Default)]
struct StatusCache {
    host_disk: Option<(Instant, String, u64, f64)>,
    snapshot: Option<(Instant, AgentStatus)>,
}

#[derive(Clone)]
struct PoolEntry {
    transfer: SharedTransfer,
    client: Arc<dyn TransferClient>,
    factory: Arc<dyn TransferClientFactory>,
}

pub struct LocalAgent {
    ctx: AppContext,
    name: String,
    working_directory: PathBuf,
    transports: RwLock<Vec<Arc<dyn TransferClientFactory>>>,
    pool: RwLock<Vec<PoolEntry>>,
    download_filter: RateLimiter,
    upload_filter: RateLimiter,
    status_cache: Mutex<StatusCache>,
    paused: AtomicBool,
    cancel: CancellationToken,
}

impl LocalAgent {
    /// Creates an agent reading its settings under `agent.<name>.*`.
    pub fn new(ctx: AppContext, name: impl Into<String>, working_directory: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            name: name.into(),
            working_directory,
            transports: RwLock::new(Vec::new()),
            pool: RwLock::new(Vec::new()),
            download_filter: RateLimiter::new(0),
            upload_filter: RateLimiter::new(0),
            status_cache: Mutex::new(StatusCache::default()),
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    fn setting_key(&self, name: &str) -> String {
        format!("agent.{}.{}", self.name, name)
    }

    /// Configured rate in bytes/sec for `key` (settings are in KiB/sec).
    fn configured_rate(&self, key: &str) -> u64 {
        self.ctx.settings.u64_value(&self.setting_key(key), 0) * 1024
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Agent-wide download limiter, refreshed from settings. Transports
    /// parent their per-transfer limiters on this.
    pub fn download_filter(&self) -> RateLimiter {
        self.download_filter.set_rate(self.configured_rate("download_rate"));
        self.download_filter.clone()
    }

    /// Agent-wide upload limiter, refreshed from settings.
    pub fn upload_filter(&self) -> RateLimiter {
        self.upload_filter.set_rate(self.configured_rate("upload_rate"));
        self.upload_filter.clone()
    }

    pub fn register_transport(&self, factory: Arc<dyn TransferClientFactory>) {
        self.transports.write().unwrap().push(factory);
    }

    fn transport_for(&self, transfer: &Transfer) -> Option<Arc<dyn TransferClientFactory>> {
        self.transports
            .read()
            .unwrap()
            .iter()
            .find(|f| f.accepts(transfer))
            .cloned()
    }

    fn pool_snapshot(&self) -> Vec<PoolEntry> {
        self.pool.read().unwrap().clone()
    }

    /// True when the transfer's current description (usually its mime type,
    /// learned mid-download) makes a different transport the right owner.
    pub fn would_switch(&self, transfer: &Transfer) -> bool {
        let current = self
            .pool
            .read()
            .unwrap()
            .iter()
            .find(|e| e.transfer.id() == transfer.id)
            .map(|e| e.factory.clone());
        let Some(current) = current else {
            return false;
        };
        match self.transport_for(transfer) {
            Some(next) => !Arc::ptr_eq(&next, &current),
            None => false,
        }
    }

    /// Swaps a pooled transfer onto the transport that now accepts it and
    /// restarts it from scratch. The payload the old transport produced is
    /// expected to already be in the transfer's metadata.
    pub async fn reprovision(&self, id: Uuid) -> Result<(), EngineError> {
        let entry = self
            .pool
            .read()
            .unwrap()
            .iter()
            .find(|e| e.transfer.id() == id)
            .cloned()
            .ok_or(EngineError::UnknownTransfer(id))?;

        entry.transfer.write(|t| {
            t.state = TransferState::Queued;
            t.progress = 0.0;
            t.size = 0;
            t.downloaded = 0;
            t.download_rate = 0;
            t.connections = 0;
            t.status.clear();
        });
        entry.client.shutdown().await;

        let snapshot = entry.transfer.snapshot();
        let factory = self
            .transport_for(&snapshot)
            .ok_or(EngineError::NoTransport(id))?;
        let client = factory.client(entry.transfer.clone())?;
        {
            let mut pool = self.pool.write().unwrap();
            if let Some(slot) = pool.iter_mut().find(|e| e.transfer.id() == id) {
                slot.client = client.clone();
                slot.factory = factory;
            }
        }
        self.ctx.store.update(&snapshot)?;
        self.ctx.store.commit()?;
        info!(transfer = %id, agent = %self.name, "transfer re-provisioned");

        // The old transfer held an active slot, so its replacement starts
        // immediately rather than waiting for the next pass.
        client.fire(TransferEvent::Start).await?;
        Ok(())
    }

    /// One scheduling pass: admit queued transfers up to the ceiling,
    /// evict past it, then divide the download budget equally across
    /// downloading transfers, the upload budget across seeding ones, and
    /// the connection budget across everything active.
    pub async fn auto_queue(&self) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }

        let mut entries: Vec<PoolEntry> = self
            .pool_snapshot()
            .into_iter()
            .filter(|e| e.transfer.state() != TransferState::Removed)
            .collect();
        // Stable: equal priorities keep their arrival order.
        entries.sort_by_key(|e| std::cmp::Reverse(e.transfer.read(|t| t.priority)));

        let max_active = self
            .ctx
            .settings
            .u64_value(&self.setting_key("max_active"), 0);

        let mut active: Vec<PoolEntry> = entries
            .iter()
            .filter(|e| e.transfer.state().is_transferring())
            .cloned()
            .collect();

        for entry in &entries {
            if entry.transfer.state() != TransferState::Queued {
                continue;
            }
            if max_active > 0 && active.len() as u64 >= max_active {
                break;
            }
            match entry.client.fire(TransferEvent::Start).await {
                Ok(()) => active.push(entry.clone()),
                Err(err) => {
                    warn!(transfer = %entry.transfer.id(), %err, "start rejected")
                }
            }
        }

        // The ceiling may have been lowered since these were admitted;
        // evict from the bottom of the priority order.
        while max_active > 0 && active.len() as u64 > max_active {
            let entry = active.pop().unwrap();
            debug!(transfer = %entry.transfer.id(), "over active ceiling, requeueing");
            if let Err(err) = entry.client.fire(TransferEvent::Stop).await {
                warn!(transfer = %entry.transfer.id(), %err, "stop rejected");
                continue;
            }
            if let Err(err) = entry.client.fire(TransferEvent::Enqueue).await {
                warn!(transfer = %entry.transfer.id(), %err, "requeue rejected");
            }
        }

        let download_total = self.configured_rate("download_rate");
        let upload_total = self.configured_rate("upload_rate");
        let connection_total = self
            .ctx
            .settings
            .u64_value(&self.setting_key("connection_limit"), 0);
        self.download_filter.set_rate(download_total);
        self.upload_filter.set_rate(upload_total);

        if active.is_empty() {
            return;
        }
        // The download budget splits across downloading transfers and the
        // upload budget across seeding ones; transfers in neither state
        // keep whatever cap they have. States are read once so concurrent
        // transitions cannot skew the divisors mid-pass.
        let states: Vec<TransferState> = active.iter().map(|e| e.transfer.state()).collect();
        let downloading = states
            .iter()
            .filter(|s| **s == TransferState::Downloading)
            .count() as u64;
        let seeding = states
            .iter()
            .filter(|s| **s == TransferState::Seeding)
            .count() as u64;
        let connection_cap = (connection_total / active.len() as u64) as u32;
        for (entry, state) in active.iter().zip(&states) {
            let bandwidth_cap = match *state {
                TransferState::Downloading if download_total > 0 => {
                    Some(download_total / downloading)
                }
                TransferState::Seeding if upload_total > 0 => Some(upload_total / seeding),
                _ => None,
            };
            let changed = entry.transfer.write(|t| {
                let mut changed = t.connection_limit != connection_cap;
                t.connection_limit = connection_cap;
                if let Some(cap) = bandwidth_cap {
                    changed |= t.bandwidth != cap;
                    t.bandwidth = cap;
                }
                changed
            });
            if changed {
                entry.client.update();
            }
        }
    }

    /// Drops pool entries that reached their final state.
    pub fn prune(&self) {
        self.pool
            .write()
            .unwrap()
            .retain(|e| e.transfer.state() != TransferState::Removed);
    }

    /// Reloads persisted transfers after a restart. Anything that was
    /// mid-flight when the process died goes back to the queue; an
    /// interrupted copy becomes retryable instead of restarting the
    /// download.
    pub async fn restore(&self) -> Result<(), EngineError> {
        let records = self.ctx.store.find(&Criteria {
            removed: Some(false),
            ..Default::default()
        })?;

        let mut dirty = false;
        for mut record in records {
            if self.transport_for(&record).is_none() {
                continue;
            }
            let normalized = match record.state {
                s if s.is_transferring() => Some(TransferState::Queued),
                TransferState::Stopping | TransferState::Removing => Some(TransferState::Queued),
                TransferState::Copying => Some(TransferState::PendingCopy),
                _ => None,
            };
            if let Some(state) = normalized {
                record.state = state;
                record.download_rate = 0;
                record.upload_rate = 0;
                record.connections = 0;
                self.ctx.store.update(&record)?;
                dirty = true;
            }
            self.provision_entry(SharedTransfer::new(record))?;
        }
        if dirty {
            self.ctx.store.commit()?;
        }
        self.auto_queue().await;
        Ok(())
    }

    fn provision_entry(&self, transfer: SharedTransfer) -> Result<(), EngineError> {
        let snapshot = transfer.snapshot();
        let factory = self
            .transport_for(&snapshot)
            .ok_or(EngineError::NoTransport(snapshot.id))?;
        let client = factory.client(transfer.clone())?;
        self.pool.write().unwrap().push(PoolEntry {
            transfer,
            client,
            factory,
        });
        Ok(())
    }

    /// Spawns the scheduler task: a slow periodic pass plus an immediate
    /// pass whenever a lifecycle event frees or fills a slot.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        for event in [
            TransferEvent::Started.bus_name(),
            TransferEvent::Stopped.bus_name(),
            TransferEvent::Failed.bus_name(),
            TransferEvent::Fetched.bus_name(),
            bus::REMOVED,
        ] {
            let tx = tx.clone();
            self.ctx.events.subscribe(event, move |_| {
                let _ = tx.send(());
                Ok(())
            });
        }

        let agent = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                    _ = rx.recv() => {}
                }
                let Some(agent) = agent.upgrade() else { break };
                agent.prune();
                agent.auto_queue().await;
            }
        });
    }

    /// Stops scheduling and tears down every client. Transfers keep their
    /// persisted state for the next restore.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for entry in self.pool_snapshot() {
            entry.client.shutdown().await;
        }
    }

    async fn pause_inner(&self) -> Result<(), EngineError> {
        self.paused.store(true, Ordering::Release);
        for entry in self.pool_snapshot() {
            if !entry.transfer.state().is_transferring() {
                continue;
            }
            if let Err(err) = entry.client.fire(TransferEvent::Stop).await {
                warn!(transfer = %entry.transfer.id(), %err, "stop rejected");
                continue;
            }
            // Back to the queue so resume picks it up again. Stopping a
            // seeding or copying transfer lands elsewhere; leave those be.
            if entry.transfer.state() == TransferState::Stopped {
                entry.client.fire(TransferEvent::Enqueue).await?;
            }
        }
        Ok(())
    }

    async fn resume_inner(&self) -> Result<(), EngineError> {
        self.paused.store(false, Ordering::Release);
        self.auto_queue().await;
        Ok(())
    }

    async fn remove_inner(&self, id: Uuid) -> Result<(), EngineError> {
        let client = self
            .client_for(id)
            .ok_or(EngineError::UnknownTransfer(id))?;
        client.fire(TransferEvent::Remove).await?;
        self.prune();
        self.auto_queue().await;
        Ok(())
    }

    fn compute_status(&self, host: String, disk_free: u64, disk_free_pct: f64) -> AgentStatus {
        let transfers = self.transfers();
        let active: Vec<&Transfer> = transfers
            .iter()
            .filter(|t| t.state.is_transferring())
            .collect();
        let downloads = active
            .iter()
            .filter(|t| t.state != TransferState::Seeding)
            .count() as u32;
        let uploads = active.len() as u32 - downloads;
        let queued = transfers
            .iter()
            .filter(|t| t.state == TransferState::Queued)
            .count() as u32;
        let progress = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|t| t.progress).sum::<f64>() / active.len() as f64
        };
        AgentStatus {
            host,
            version: VERSION.to_string(),
            active_downloads: downloads,
            queued_downloads: queued,
            active_uploads: uploads,
            progress,
            download_rate: active.iter().map(|t| t.download_rate).sum(),
            upload_rate: active.iter().map(|t| t.upload_rate).sum(),
            disk_free,
            disk_free_pct,
            connections: active.iter().map(|t| t.connections).sum(),
            paused: self.paused.load(Ordering::Acquire),
        }
    }

    fn cached_status(&self) -> AgentStatus {
        let mut cache = self.status_cache.lock().unwrap();
        if let Some((at, status)) = &cache.snapshot {
            if at.elapsed() < STATUS_TTL_COUNTERS {
                return status.clone();
            }
        }
        let (host, free, pct) = match &cache.host_disk {
            Some((at, host, free, pct)) if at.elapsed() < STATUS_TTL_HOST => {
                (host.clone(), *free, *pct)
            }
            _ => {
                let host = hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "unknown".to_string());
                let (free, pct) = disk_free(&self.working_directory);
                cache.host_disk = Some((Instant::now(), host.clone(), free, pct));
                (host, free, pct)
            }
        };
        let status = self.compute_status(host, free, pct);
        cache.snapshot = Some((Instant::now(), status.clone()));
        status
    }
}

impl TransferAgent for LocalAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, transfer: &Transfer) -> bool {
        self.transport_for(transfer).is_some()
    }

    fn provision(&self, transfer: SharedTransfer) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.provision_entry(transfer)?;
            self.auto_queue().await;
            Ok(())
        })
    }

    fn transfers(&self) -> Vec<Transfer> {
        self.pool
            .read()
            .unwrap()
            .iter()
            .map(|e| e.transfer.snapshot())
            .filter(|t| t.state != TransferState::Removed)
            .collect()
    }

    fn client_for(&self, id: Uuid) -> Option<Arc<dyn TransferClient>> {
        self.pool
            .read()
            .unwrap()
            .iter()
            .find(|e| e.transfer.id() == id)
            .map(|e| e.client.clone())
    }

    fn status(&self) -> BoxFuture<'_, AgentStatus> {
        Box::pin(async move { self.cached_status() })
    }

    fn pause(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.pause_inner())
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.resume_inner())
    }

    fn remove(&self, id: Uuid) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(self.remove_inner(id))
    }
}

/// Free space on the filesystem holding `path`, as (bytes, percent).
fn disk_free(path: &Path) -> (u64, f64) {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut best: Option<&sysinfo::Disk> = None;
    for disk in disks.list() {
        if path.starts_with(disk.mount_point()) {
            let deeper = best.is_none_or(|b| {
                disk.mount_point().components().count() > b.mount_point().components().count()
            });
            if deeper {
                best = Some(disk);
            }
        }
    }
    match best {
        Some(d) if d.total_space() > 0 => (
            d.available_space(),
            d.available_space() as f64 / d.total_space() as f64 * 100.0,
        ),
        _ => (0, 0.0),
    }
}
