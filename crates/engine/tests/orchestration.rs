//! End-to-end orchestration tests over a simulated transport.
//!
//! The sim client drives the real state machine and persistence paths but
//! completes transitions instantly, so admission control, fairness, and
//! routing can be asserted without network I/O.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sluice_core::{AlertSink, EventBus, MemoryAlerts, MemorySettings, MemoryStore, TransferStore};
use sluice_engine::{
    AppContext, BoxFuture, ClientCore, EngineError, LocalAgent, SharedTransfer, TransferAgent,
    TransferClient, TransferClientFactory, TransferManager, download_rules, peer_rules,
};
use sluice_flow::{Flow, FlowError, FlowHooks, HookFuture, HookStage, Transition};
use sluice_model::{AgentStatus, FileInfo, Transfer, TransferEvent, TransferState};
use uuid::Uuid;

struct Harness {
    ctx: AppContext,
    store: Arc<MemoryStore>,
    settings: Arc<MemorySettings>,
    alerts: Arc<MemoryAlerts>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let settings = Arc::new(MemorySettings::new());
    let alerts = Arc::new(MemoryAlerts::new());
    let ctx = AppContext {
        store: store.clone(),
        events: Arc::new(EventBus::new()),
        alerts: alerts.clone(),
        settings: settings.clone(),
    };
    Harness {
        ctx,
        store,
        settings,
        alerts,
    }
}

type AcceptFn = Box<dyn Fn(&Transfer) -> bool + Send + Sync>;

/// Transport whose clients complete every transition instantly.
struct SimFactory {
    ctx: AppContext,
    accept: AcceptFn,
    rules: fn(TransferState) -> Flow<TransferState, TransferEvent>,
    created: AtomicUsize,
    updates: Arc<AtomicUsize>,
}

impl SimFactory {
    fn new(ctx: &AppContext, accept: AcceptFn) -> Arc<Self> {
        Arc::new(Self {
            ctx: ctx.clone(),
            accept,
            rules: download_rules,
            created: AtomicUsize::new(0),
            updates: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn accept_all(ctx: &AppContext) -> Arc<Self> {
        Self::new(ctx, Box::new(|_| true))
    }

    /// Peer-style variant: seeds after the payload is materialized.
    fn peer(ctx: &AppContext, accept: AcceptFn) -> Arc<Self> {
        Arc::new(Self {
            ctx: ctx.clone(),
            accept,
            rules: peer_rules,
            created: AtomicUsize::new(0),
            updates: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl TransferClientFactory for SimFactory {
    fn accepts(&self, transfer: &Transfer) -> bool {
        (self.accept)(transfer)
    }

    fn client(&self, transfer: SharedTransfer) -> Result<Arc<dyn TransferClient>, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let initial = transfer.state();
        Ok(Arc::new(SimClient {
            core: ClientCore::new(transfer, self.ctx.clone(), (self.rules)(initial)),
            updates: self.updates.clone(),
        }))
    }
}

struct SimClient {
    core: ClientCore,
    updates: Arc<AtomicUsize>,
}

impl FlowHooks<TransferState, TransferEvent> for SimClient {
    fn change_state(
        &self,
        t: Transition<TransferState, TransferEvent>,
    ) -> HookFuture<'_, Result<(), FlowError<TransferState, TransferEvent>>> {
        Box::pin(async move { self.core.apply_change(t) })
    }

    fn enter_state(
        &self,
        t: Transition<TransferState, TransferEvent>,
    ) -> HookFuture<'_, Result<Option<TransferEvent>, FlowError<TransferState, TransferEvent>>>
    {
        Box::pin(async move {
            match t.to {
                TransferState::Initializing => Ok(Some(TransferEvent::Initialized)),
                TransferState::Starting => Ok(Some(TransferEvent::Started)),
                TransferState::Copying => Ok(Some(TransferEvent::Fetched)),
                TransferState::Stopping | TransferState::Removing => {
                    Ok(Some(TransferEvent::Stopped))
                }
                TransferState::Completed => {
                    self.core.transfer().write(|tr| tr.progress = 100.0);
                    self.core
                        .persist()
                        .map_err(|e| FlowError::hook(HookStage::EnterState, t.event, e))?;
                    Ok(None)
                }
                TransferState::Removed => {
                    self.core.transfer().write(|tr| tr.removed = true);
                    self.core
                        .persist()
                        .map_err(|e| FlowError::hook(HookStage::EnterState, t.event, e))?;
                    Ok(None)
                }
                _ => Ok(None),
            }
        })
    }
}

impl TransferClient for SimClient {
    fn transfer(&self) -> SharedTransfer {
        self.core.transfer().clone()
    }

    fn state(&self) -> TransferState {
        self.core.state()
    }

    fn fire(&self, event: TransferEvent) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move { self.core.fire(event, self).await })
    }

    fn update(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn directory(&self) -> PathBuf {
        PathBuf::new()
    }

    fn files(&self) -> Vec<FileInfo> {
        Vec::new()
    }
}

fn local_agent(h: &Harness) -> Arc<LocalAgent> {
    LocalAgent::new(h.ctx.clone(), "local", std::env::temp_dir().join("sluice-tests"))
}

async fn add(manager: &TransferManager, user: u64, url: &str, priority: i32) -> Uuid {
    let mut t = Transfer::new(user, url);
    t.priority = priority;
    manager.add(t).await.unwrap()
}

fn state_of(agent: &LocalAgent, id: Uuid) -> TransferState {
    agent.client_for(id).unwrap().state()
}

#[tokio::test]
async fn added_transfer_is_routed_and_started() {
    let h = harness();
    let started = Arc::new(AtomicUsize::new(0));
    let started2 = started.clone();
    h.ctx.events.subscribe("transfer_started", move |_| {
        started2.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let id = add(&manager, 1, "http://example.com/a.bin", 0).await;

    assert_eq!(state_of(&agent, id), TransferState::Downloading);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    // Persisted state follows the machine.
    let record = h.store.get(id).unwrap().unwrap();
    assert_eq!(record.state, TransferState::Downloading);
    assert_eq!(record.filename, "a.bin");
}

#[tokio::test]
async fn rejected_transfer_is_kept_and_alerted() {
    let h = harness();
    let manager = TransferManager::new(h.ctx.clone());

    let id = add(&manager, 7, "magnet:?xt=whatever", 0).await;

    // The record is durable and still queued even though no agent took it.
    let record = h.store.get(id).unwrap().unwrap();
    assert_eq!(record.state, TransferState::Queued);
    let alerts = h.alerts.unviewed(7);
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].description.contains("no agent"));
}

#[tokio::test]
async fn admission_stops_at_the_ceiling() {
    let h = harness();
    h.settings.set("agent.local.max_active", 2);
    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let a = add(&manager, 1, "http://example.com/a", 0).await;
    let b = add(&manager, 1, "http://example.com/b", 0).await;
    let c = add(&manager, 1, "http://example.com/c", 0).await;

    assert_eq!(state_of(&agent, a), TransferState::Downloading);
    assert_eq!(state_of(&agent, b), TransferState::Downloading);
    assert_eq!(state_of(&agent, c), TransferState::Queued);

    // A finished download frees a slot for the queued transfer.
    let client = agent.client_for(a).unwrap();
    client.fire(TransferEvent::Complete).await.unwrap();
    assert_eq!(state_of(&agent, a), TransferState::Completed);
    agent.auto_queue().await;
    assert_eq!(state_of(&agent, c), TransferState::Downloading);
}

#[tokio::test]
async fn lowered_ceiling_evicts_lowest_priority_first() {
    let h = harness();
    h.settings.set("agent.local.max_active", 2);
    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let important = add(&manager, 1, "http://example.com/a", 5).await;
    let casual = add(&manager, 1, "http://example.com/b", 1).await;
    assert_eq!(state_of(&agent, important), TransferState::Downloading);
    assert_eq!(state_of(&agent, casual), TransferState::Downloading);

    h.settings.set("agent.local.max_active", 1);
    agent.auto_queue().await;

    assert_eq!(state_of(&agent, important), TransferState::Downloading);
    assert_eq!(state_of(&agent, casual), TransferState::Queued);
}

#[tokio::test]
async fn bandwidth_splits_equally_across_active_transfers() {
    let h = harness();
    // Rates are configured in KiB/sec.
    h.settings.set("agent.local.download_rate", 300);
    h.settings.set("agent.local.connection_limit", 30);
    let agent = local_agent(&h);
    let factory = SimFactory::accept_all(&h.ctx);
    agent.register_transport(factory.clone());
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let ids = [
        add(&manager, 1, "http://example.com/a", 0).await,
        add(&manager, 1, "http://example.com/b", 0).await,
        add(&manager, 1, "http://example.com/c", 0).await,
    ];

    for id in ids {
        let transfer = agent.client_for(id).unwrap().transfer();
        assert_eq!(transfer.read(|t| t.bandwidth), 100 * 1024);
        assert_eq!(transfer.read(|t| t.connection_limit), 10);
    }

    // A pass with nothing changed pushes no client updates.
    let before = factory.updates.load(Ordering::SeqCst);
    agent.auto_queue().await;
    assert_eq!(factory.updates.load(Ordering::SeqCst), before);

    // One transfer finishing widens everyone else's share.
    let client = agent.client_for(ids[0]).unwrap();
    client.fire(TransferEvent::Complete).await.unwrap();
    agent.auto_queue().await;
    let transfer = agent.client_for(ids[1]).unwrap().transfer();
    assert_eq!(transfer.read(|t| t.bandwidth), 150 * 1024);
    assert_eq!(transfer.read(|t| t.connection_limit), 15);
    assert!(factory.updates.load(Ordering::SeqCst) > before);
}

#[tokio::test]
async fn seeding_transfers_take_the_upload_split() {
    let h = harness();
    h.settings.set("agent.local.download_rate", 300);
    h.settings.set("agent.local.upload_rate", 90);
    let agent = local_agent(&h);
    let web = SimFactory::new(&h.ctx, Box::new(|t: &Transfer| t.url.starts_with("http")));
    let swarm = SimFactory::peer(&h.ctx, Box::new(|t: &Transfer| t.url.starts_with("peer:")));
    agent.register_transport(web);
    agent.register_transport(swarm);
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let plain = add(&manager, 1, "http://example.com/a", 0).await;
    let seeded = add(&manager, 1, "peer:thing", 0).await;
    assert_eq!(state_of(&agent, seeded), TransferState::Downloading);

    // The peer transfer finishes its payload and starts seeding.
    let client = agent.client_for(seeded).unwrap();
    client.fire(TransferEvent::Complete).await.unwrap();
    assert_eq!(state_of(&agent, seeded), TransferState::Seeding);
    agent.auto_queue().await;

    // The sole downloading transfer gets the whole download budget; the
    // seeder is capped by the upload budget instead.
    let downloading = agent.client_for(plain).unwrap().transfer();
    assert_eq!(downloading.read(|t| t.bandwidth), 300 * 1024);
    let seeding = agent.client_for(seeded).unwrap().transfer();
    assert_eq!(seeding.read(|t| t.bandwidth), 90 * 1024);
}

#[tokio::test]
async fn pause_requeues_and_resume_restarts() {
    let h = harness();
    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let id = add(&manager, 1, "http://example.com/a", 0).await;
    assert_eq!(state_of(&agent, id), TransferState::Downloading);

    manager.pause().await.unwrap();
    assert_eq!(state_of(&agent, id), TransferState::Queued);

    // Scheduling is inert while paused.
    agent.auto_queue().await;
    assert_eq!(state_of(&agent, id), TransferState::Queued);

    manager.resume().await.unwrap();
    assert_eq!(state_of(&agent, id), TransferState::Downloading);
}

#[tokio::test]
async fn restore_requeues_interrupted_transfers() {
    let h = harness();

    let mut interrupted = Transfer::new(1, "http://example.com/a");
    interrupted.state = TransferState::Downloading;
    let mut finished = Transfer::new(1, "http://example.com/b");
    finished.state = TransferState::Completed;
    let mut stopped = Transfer::new(1, "http://example.com/c");
    stopped.state = TransferState::Stopped;
    let (ia, ib, ic) = (interrupted.id, finished.id, stopped.id);
    h.store.add(interrupted).unwrap();
    h.store.add(finished).unwrap();
    h.store.add(stopped).unwrap();

    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    agent.restore().await.unwrap();

    // The interrupted download went back through the queue and restarted.
    assert_eq!(state_of(&agent, ia), TransferState::Downloading);
    assert_eq!(state_of(&agent, ib), TransferState::Completed);
    assert_eq!(state_of(&agent, ic), TransferState::Stopped);
}

#[tokio::test]
async fn reprovision_moves_transfer_to_matching_transport() {
    let h = harness();
    let agent = local_agent(&h);
    let plain = SimFactory::new(
        &h.ctx,
        Box::new(|t: &Transfer| t.mime_type != "application/x-sim"),
    );
    let special = SimFactory::new(
        &h.ctx,
        Box::new(|t: &Transfer| t.mime_type == "application/x-sim"),
    );
    agent.register_transport(plain.clone());
    agent.register_transport(special.clone());
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let id = add(&manager, 1, "http://example.com/thing", 0).await;
    assert_eq!(plain.created.load(Ordering::SeqCst), 1);
    assert_eq!(special.created.load(Ordering::SeqCst), 0);

    // Mid-download the payload identifies itself as the special type.
    let transfer = agent.client_for(id).unwrap().transfer();
    transfer.write(|t| t.mime_type = "application/x-sim".to_string());
    assert!(agent.would_switch(&transfer.snapshot()));

    agent.reprovision(id).await.unwrap();
    assert_eq!(special.created.load(Ordering::SeqCst), 1);
    // The replacement took over the freed slot immediately.
    assert_eq!(state_of(&agent, id), TransferState::Downloading);
    assert!(!agent.would_switch(&transfer.snapshot()));
}

#[tokio::test]
async fn remove_tombstones_and_prunes() {
    let h = harness();
    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let id = add(&manager, 1, "http://example.com/a", 0).await;
    manager.remove(id).await.unwrap();

    assert!(agent.client_for(id).is_none());
    assert!(manager.transfers().is_empty());
    // History survives through the store.
    let record = manager.transfer(id).unwrap().unwrap();
    assert!(record.removed);
    assert_eq!(record.state, TransferState::Removed);
}

#[tokio::test]
async fn agent_status_is_cached() {
    let h = harness();
    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    let idle = agent.status().await;
    assert_eq!(idle.active_downloads, 0);

    // Within the counter TTL the snapshot does not see the new transfer.
    add(&manager, 1, "http://example.com/a", 0).await;
    let cached = agent.status().await;
    assert_eq!(cached.active_downloads, 0);
}

struct StubAgent {
    status: AgentStatus,
}

impl TransferAgent for StubAgent {
    fn name(&self) -> &str {
        "stub"
    }

    fn accepts(&self, _transfer: &Transfer) -> bool {
        false
    }

    fn provision(&self, _transfer: SharedTransfer) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }

    fn transfers(&self) -> Vec<Transfer> {
        Vec::new()
    }

    fn client_for(&self, _id: Uuid) -> Option<Arc<dyn TransferClient>> {
        None
    }

    fn status(&self) -> BoxFuture<'_, AgentStatus> {
        let status = self.status.clone();
        Box::pin(async move { status })
    }

    fn pause(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }

    fn remove(&self, id: Uuid) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move { Err(EngineError::UnknownTransfer(id)) })
    }
}

#[tokio::test]
async fn manager_status_aggregates_across_agents() {
    let h = harness();
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(Arc::new(StubAgent {
        status: AgentStatus {
            active_downloads: 1,
            queued_downloads: 2,
            download_rate: 100,
            progress: 40.0,
            disk_free: 500,
            disk_free_pct: 50.0,
            connections: 3,
            ..Default::default()
        },
    }));
    manager.register_agent(Arc::new(StubAgent {
        status: AgentStatus {
            active_downloads: 2,
            download_rate: 200,
            progress: 80.0,
            disk_free: 200,
            disk_free_pct: 10.0,
            connections: 5,
            ..Default::default()
        },
    }));

    let combined = manager.status().await;
    assert_eq!(combined.active_downloads, 3);
    assert_eq!(combined.queued_downloads, 2);
    assert_eq!(combined.download_rate, 300);
    assert_eq!(combined.connections, 8);
    assert_eq!(combined.progress, 60.0);
    // The tightest disk constraint wins.
    assert_eq!(combined.disk_free, 200);
    assert_eq!(combined.disk_free_pct, 10.0);
}

#[tokio::test]
async fn user_status_only_counts_own_transfers() {
    let h = harness();
    let agent = local_agent(&h);
    agent.register_transport(SimFactory::accept_all(&h.ctx));
    let manager = TransferManager::new(h.ctx.clone());
    manager.register_agent(agent.clone());

    add(&manager, 1, "http://example.com/a", 0).await;
    add(&manager, 2, "http://example.com/b", 0).await;

    let mine = manager.user_status(1);
    assert_eq!(mine.active_downloads, 1);
    assert_eq!(manager.user_transfers(1).len(), 1);
    assert_eq!(manager.user_transfers(3).len(), 0);
}
