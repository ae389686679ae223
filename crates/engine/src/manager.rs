//! Top-level transfer routing and aggregation.
//!
//! The manager is the public entry point: it persists new transfers, hands
//! them to the first agent that accepts them, and answers queue and status
//! questions across every registered agent. Rejection by all agents is not
//! an error of the add operation; the transfer stays queued and the user
//! gets an alert.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::json;
use sluice_model::{AgentStatus, Alert, Transfer, TransferState, VERSION, bus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::TransferAgent;
use crate::client::{SharedTransfer, TransferClient};
use crate::{AppContext, EngineError};

pub struct TransferManager {
    ctx: AppContext,
    agents: RwLock<Vec<Arc<dyn TransferAgent>>>,
    paused: AtomicBool,
}

impl TransferManager {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            agents: RwLock::new(Vec::new()),
            paused: AtomicBool::new(false),
        }
    }

    /// Registration order is routing order: the first accepting agent wins.
    pub fn register_agent(&self, agent: Arc<dyn TransferAgent>) {
        self.agents.write().unwrap().push(agent);
    }

    fn agents_snapshot(&self) -> Vec<Arc<dyn TransferAgent>> {
        self.agents.read().unwrap().clone()
    }

    pub fn accepts(&self, transfer: &Transfer) -> bool {
        self.agents_snapshot().iter().any(|a| a.accepts(transfer))
    }

    /// Persists a new transfer and routes it to an agent.
    ///
    /// The transfer is durably queued before any agent sees it, so a
    /// routing failure never loses the request: the id is returned either
    /// way and the owner gets a warning alert.
    pub async fn add(&self, mut transfer: Transfer) -> Result<Uuid, EngineError> {
        if transfer.added.is_none() {
            transfer.added = Some(Utc::now());
        }
        if transfer.filename.is_empty() {
            if let Some(name) = url_filename(&transfer.url) {
                transfer.filename = name;
            }
        }
        if transfer.description.is_empty() {
            transfer.description = transfer.filename.clone();
        }
        let id = transfer.id;
        self.ctx.store.add(transfer.clone())?;
        self.ctx.store.commit()?;
        self.ctx.events.fire(
            bus::ADDED,
            &json!({ "transferId": id, "userId": transfer.user_id, "url": transfer.url }),
        );
        info!(transfer = %id, url = %transfer.url, "transfer added");

        let user_id = transfer.user_id;
        if let Err(err) = self.provision(SharedTransfer::new(transfer)).await {
            warn!(transfer = %id, %err, "transfer not provisioned");
            self.ctx.alerts.add(Alert::warn(
                user_id,
                "Download failed to start",
                err.to_string(),
            ));
        }
        Ok(id)
    }

    /// Hands the transfer to the first agent that accepts it.
    pub async fn provision(&self, transfer: SharedTransfer) -> Result<(), EngineError> {
        let snapshot = transfer.snapshot();
        for agent in self.agents_snapshot() {
            if agent.accepts(&snapshot) {
                return agent.provision(transfer).await;
            }
        }
        Err(EngineError::NoAgent(snapshot.id))
    }

    /// Live transfers across every agent, in each agent's queue order.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.agents_snapshot()
            .iter()
            .flat_map(|a| a.transfers())
            .collect()
    }

    pub fn user_transfers(&self, user_id: u64) -> Vec<Transfer> {
        self.transfers()
            .into_iter()
            .filter(|t| t.user_id == user_id)
            .collect()
    }

    /// Looks up one transfer, falling back to the store for records no
    /// agent holds anymore (completed or removed history).
    pub fn transfer(&self, id: Uuid) -> Result<Option<Transfer>, EngineError> {
        if let Some(t) = self.transfers().into_iter().find(|t| t.id == id) {
            return Ok(Some(t));
        }
        Ok(self.ctx.store.get(id)?)
    }

    pub fn client_for(&self, id: Uuid) -> Option<Arc<dyn TransferClient>> {
        self.agents_snapshot().iter().find_map(|a| a.client_for(id))
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), EngineError> {
        for agent in self.agents_snapshot() {
            if agent.client_for(id).is_some() {
                return agent.remove(id).await;
            }
        }
        Err(EngineError::UnknownTransfer(id))
    }

    /// Aggregate status. A single agent's status passes through untouched;
    /// with several, counts and rates sum, progress averages, and the
    /// tightest disk constraint wins.
    pub async fn status(&self) -> AgentStatus {
        let agents = self.agents_snapshot();
        let paused = self.paused.load(Ordering::Acquire);
        match agents.len() {
            0 => AgentStatus {
                version: VERSION.to_string(),
                paused,
                ..Default::default()
            },
            1 => {
                let mut status = agents[0].status().await;
                status.paused = status.paused || paused;
                status
            }
            _ => {
                let mut combined = AgentStatus {
                    version: VERSION.to_string(),
                    paused,
                    disk_free: u64::MAX,
                    disk_free_pct: 100.0,
                    ..Default::default()
                };
                let mut busy_agents = 0u32;
                for agent in &agents {
                    let s = agent.status().await;
                    combined.active_downloads += s.active_downloads;
                    combined.queued_downloads += s.queued_downloads;
                    combined.active_uploads += s.active_uploads;
                    combined.download_rate += s.download_rate;
                    combined.upload_rate += s.upload_rate;
                    combined.connections += s.connections;
                    if s.active_downloads + s.active_uploads > 0 {
                        combined.progress += s.progress;
                        busy_agents += 1;
                    }
                    combined.disk_free = combined.disk_free.min(s.disk_free);
                    combined.disk_free_pct = combined.disk_free_pct.min(s.disk_free_pct);
                }
                if busy_agents > 0 {
                    combined.progress /= busy_agents as f64;
                }
                if combined.disk_free == u64::MAX {
                    combined.disk_free = 0;
                    combined.disk_free_pct = 0.0;
                }
                combined
            }
        }
    }

    /// Status restricted to one user's transfers, computed from the queue
    /// rather than the agents' cached aggregates.
    pub fn user_status(&self, user_id: u64) -> AgentStatus {
        let transfers = self.user_transfers(user_id);
        let active: Vec<&Transfer> = transfers
            .iter()
            .filter(|t| t.state.is_transferring())
            .collect();
        let downloads = active
            .iter()
            .filter(|t| t.state != TransferState::Seeding)
            .count() as u32;
        AgentStatus {
            version: VERSION.to_string(),
            active_downloads: downloads,
            queued_downloads: transfers
                .iter()
                .filter(|t| t.state == TransferState::Queued)
                .count() as u32,
            active_uploads: active.len() as u32 - downloads,
            progress: if active.is_empty() {
                0.0
            } else {
                active.iter().map(|t| t.progress).sum::<f64>() / active.len() as f64
            },
            download_rate: active.iter().map(|t| t.download_rate).sum(),
            upload_rate: active.iter().map(|t| t.upload_rate).sum(),
            connections: active.iter().map(|t| t.connections).sum(),
            paused: self.paused.load(Ordering::Acquire),
            ..Default::default()
        }
    }

    /// Pauses every agent; active transfers stop and requeue.
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.paused.store(true, Ordering::Release);
        for agent in self.agents_snapshot() {
            agent.pause().await?;
        }
        self.ctx.events.fire(bus::PAUSED, &json!({}));
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.paused.store(false, Ordering::Release);
        for agent in self.agents_snapshot() {
            agent.resume().await?;
        }
        self.ctx.events.fire(bus::RESUMED, &json!({}));
        Ok(())
    }
}

/// Derives a filename from the last path segment of a URL. Query strings
/// and fragments are ignored; percent escapes are decoded.
fn url_filename(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let name = percent_decode(segment);
    let name = name.rsplit(['/', '\\']).next().unwrap_or("").trim().to_string();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}

fn percent_decode(s: &str) -> String {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_plain_url() {
        assert_eq!(
            url_filename("http://example.com/files/ubuntu.iso").as_deref(),
            Some("ubuntu.iso")
        );
    }

    #[test]
    fn filename_ignores_query_and_decodes_escapes() {
        assert_eq!(
            url_filename("https://example.com/a%20file.zip?token=abc#frag").as_deref(),
            Some("a file.zip")
        );
    }

    #[test]
    fn filename_absent_for_bare_host() {
        assert_eq!(url_filename("http://example.com/"), None);
        assert_eq!(url_filename("not a url"), None);
    }

    #[test]
    fn decoded_escapes_cannot_smuggle_separators() {
        // %2F decodes to a slash; only the basename survives.
        assert_eq!(
            url_filename("http://example.com/a%2Fb%2Fc.bin").as_deref(),
            Some("c.bin")
        );
        assert_eq!(url_filename("http://example.com/%2E%2E"), None);
    }
}
