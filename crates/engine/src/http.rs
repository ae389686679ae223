//! Reference protocol transport: plain HTTP(S) downloads over reqwest.
//!
//! One client drives one download task. The task streams the response body
//! through the transfer's rate limiter into a per-transfer working
//! directory, resuming with a Range request when a partial file is already
//! on disk. Lifecycle changes travel through the shared state machine; the
//! task converts I/O outcomes into events and never touches state directly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use sluice_flow::{FlowError, FlowHooks, HookFuture, HookStage, Transition};
use sluice_model::{FileInfo, Health, Transfer, TransferEvent, TransferState, bus};
use sluice_throttle::RateLimiter;
use tokio::io::AsyncWriteExt;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::LocalAgent;
use crate::client::{
    BoxFuture, ClientCore, RateSampler, SharedTransfer, TransferClient, TransferClientFactory,
    download_rules,
};
use crate::{AppContext, EngineError};

/// Backoff while the rate limiter refuses bytes.
const THROTTLE_BACKOFF: Duration = Duration::from_millis(100);

/// Creates [`HttpDownloadClient`]s for http/https URLs.
pub struct HttpClientFactory {
    ctx: AppContext,
    agent: Weak<LocalAgent>,
    http: reqwest::Client,
    working_directory: PathBuf,
}

impl HttpClientFactory {
    pub fn new(ctx: AppContext, agent: &Arc<LocalAgent>, working_directory: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            agent: Arc::downgrade(agent),
            http: reqwest::Client::new(),
            working_directory,
        })
    }
}

impl TransferClientFactory for HttpClientFactory {
    fn accepts(&self, transfer: &Transfer) -> bool {
        transfer.url.starts_with("http://") || transfer.url.starts_with("https://")
    }

    fn client(&self, transfer: SharedTransfer) -> Result<Arc<dyn TransferClient>, EngineError> {
        let agent = self.agent.upgrade().ok_or(EngineError::NoTransport(transfer.id()))?;
        Ok(HttpDownloadClient::new(
            transfer,
            self.ctx.clone(),
            &agent,
            self.http.clone(),
            &self.working_directory,
        ))
    }
}

pub struct HttpDownloadClient {
    core: ClientCore,
    agent: Weak<LocalAgent>,
    http: reqwest::Client,
    directory: PathBuf,
    limiter: RateLimiter,
    cancel: Mutex<CancellationToken>,
    self_ref: Weak<HttpDownloadClient>,
}

impl HttpDownloadClient {
    fn new(
        transfer: SharedTransfer,
        ctx: AppContext,
        agent: &Arc<LocalAgent>,
        http: reqwest::Client,
        root: &Path,
    ) -> Arc<Self> {
        let directory = root.join(transfer.id().to_string());
        let bandwidth = transfer.read(|t| t.bandwidth);
        let limiter = RateLimiter::with_parent(bandwidth, agent.download_filter());
        let initial = transfer.state();

        Arc::new_cyclic(|weak| Self {
            core: ClientCore::new(transfer, ctx, download_rules(initial)),
            agent: Arc::downgrade(agent),
            http,
            directory,
            limiter,
            cancel: Mutex::new(CancellationToken::new()),
            self_ref: weak.clone(),
        })
    }

    fn target_path(&self) -> PathBuf {
        let filename = self.core.transfer().read(|t| {
            if t.filename.is_empty() {
                "download".to_string()
            } else {
                t.filename.clone()
            }
        });
        self.directory.join(filename)
    }

    /// Streams the response body to disk, firing lifecycle events as it
    /// goes. Runs on its own task; the client's Stopping hook cancels it.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(err) = self.clone().run_download(&cancel).await {
            if cancel.is_cancelled() {
                return;
            }
            warn!(transfer = %self.core.transfer().id(), %err, "download failed");
            self.core.transfer().write(|t| t.record_failure(err.to_string()));
            if let Err(fire_err) = self.core.fire(TransferEvent::Failed, &*self).await {
                debug!(%fire_err, "failure event not applied");
            }
        }
    }

    async fn run_download(self: Arc<Self>, cancel: &CancellationToken) -> Result<(), EngineError> {
        let transfer = self.core.transfer().clone();
        let url = transfer.read(|t| t.url.clone());

        tokio::fs::create_dir_all(&self.directory).await?;
        let mut target = self.target_path();
        let resume_from = resume_offset(&target).await;

        let mut request = self.http.get(&url);
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
        }
        let response = request.send().await?.error_for_status()?;

        // Servers that ignore the Range request restart from zero.
        let resuming =
            resume_from > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let offset = if resuming { resume_from } else { 0 };

        let length = response.content_length().unwrap_or(0);
        let mime = header_str(&response, reqwest::header::CONTENT_TYPE)
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string());
        let disposition = header_str(&response, reqwest::header::CONTENT_DISPOSITION)
            .and_then(filename_from_disposition);

        transfer.write(|t| {
            if length > 0 {
                t.size = offset + length;
            }
            if let Some(mime) = &mime {
                t.mime_type = mime.clone();
            }
            if let Some(name) = disposition {
                if t.filename.is_empty() || t.filename == "download" {
                    t.filename = name;
                }
            }
            if t.started.is_none() {
                t.started = Some(Utc::now());
            }
        });
        target = self.target_path();

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(resuming)
            .truncate(!resuming)
            .write(true)
            .open(&target)
            .await?;

        self.core.fire(TransferEvent::Started, &*self).await?;
        info!(transfer = %transfer.id(), %url, resume = offset, "download started");

        let session_start = Instant::now();
        let base_elapsed = transfer.read(|t| t.elapsed);
        let mut sampler = RateSampler::new();
        let mut downloaded = offset;
        let mut last_update = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => match chunk {
                    Some(chunk) => chunk?,
                    None => break,
                },
            };

            let mut written = 0usize;
            while written < chunk.len() {
                let granted = self.limiter.add((chunk.len() - written) as u64) as usize;
                if granted == 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(THROTTLE_BACKOFF) => {}
                    }
                    continue;
                }
                file.write_all(&chunk[written..written + granted]).await?;
                written += granted;
            }
            downloaded += chunk.len() as u64;

            let now = session_start.elapsed().as_secs();
            let rate = sampler.record(downloaded - offset, now);
            transfer.write(|t| {
                t.record_progress(downloaded);
                t.download_rate = rate;
                t.connections = 1;
                t.health = Health::Excellent;
                t.elapsed = base_elapsed + now;
                t.timeleft = if rate > 0 && t.size > downloaded {
                    (t.size - downloaded) / rate
                } else {
                    0
                };
            });

            if now > last_update {
                last_update = now;
                if let Err(err) = self.core.fire(TransferEvent::Updated, &*self).await {
                    debug!(%err, "progress event not applied");
                }
            }
        }

        file.flush().await?;
        drop(file);

        if cancel.is_cancelled() {
            return Ok(());
        }
        transfer.write(|t| {
            t.record_progress(downloaded);
            t.download_rate = 0;
            t.connections = 0;
        });
        match self.core.fire(TransferEvent::Complete, &*self).await {
            // A veto means the payload turned out to belong to another
            // transport and the agent re-provisioned the transfer.
            Err(err) if err.is_veto() => Ok(()),
            other => other,
        }
    }

    /// Mid-flight transport switch: the payload's actual mime type makes a
    /// different registered transport the better owner (the classic case is
    /// an http URL that served a peer-protocol descriptor file).
    async fn reprovision_check(&self) -> Result<bool, EngineError> {
        let Some(agent) = self.agent.upgrade() else {
            return Ok(false);
        };
        let transfer = self.core.transfer();
        if !agent.would_switch(&transfer.snapshot()) {
            return Ok(false);
        }

        let payload = tokio::fs::read(self.target_path()).await?;
        transfer.write(|t| t.metadata = Some(payload));
        info!(transfer = %transfer.id(), mime = %transfer.read(|t| t.mime_type.clone()),
            "switching transports after download");
        agent.reprovision(transfer.id()).await?;
        Ok(true)
    }
}

impl FlowHooks<TransferState, TransferEvent> for HttpDownloadClient {
    fn before_event(
        &self,
        t: Transition<TransferState, TransferEvent>,
    ) -> HookFuture<'_, Result<bool, FlowError<TransferState, TransferEvent>>> {
        Box::pin(async move {
            if t.event == TransferEvent::Complete && t.from == TransferState::Downloading {
                let switched = self
                    .reprovision_check()
                    .await
                    .map_err(|e| FlowError::hook(HookStage::BeforeEvent, t.event, e))?;
                return Ok(!switched);
            }
            Ok(true)
        })
    }

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
                TransferState::Starting => {
                    let token = CancellationToken::new();
                    *self.cancel.lock().unwrap() = token.clone();
                    if let Some(this) = self.self_ref.upgrade() {
                        tokio::spawn(this.run(token));
                    }
                    Ok(None)
                }
                // HTTP payloads land directly in the working directory, so
                // materialization is already done when the body completes.
                TransferState::Copying => Ok(Some(TransferEvent::Fetched)),
                TransferState::Completed => {
                    self.core.transfer().write(|tr| {
                        tr.completed = Some(Utc::now());
                        tr.progress = 100.0;
                        tr.health = Health::Unknown;
                    });
                    self.core
                        .persist()
                        .map_err(|e| FlowError::hook(HookStage::EnterState, t.event, e))?;
                    Ok(None)
                }
                TransferState::Stopping | TransferState::Removing => {
                    self.cancel.lock().unwrap().cancel();
                    Ok(Some(TransferEvent::Stopped))
                }
                TransferState::Stopped | TransferState::Queued => {
                    self.core.transfer().write(|tr| {
                        tr.download_rate = 0;
                        tr.connections = 0;
                        tr.health = Health::Unknown;
                    });
                    Ok(None)
                }
                TransferState::Removed => {
                    let transfer = self.core.transfer();
                    transfer.write(|tr| tr.removed = true);
                    self.core
                        .persist()
                        .map_err(|e| FlowError::hook(HookStage::EnterState, t.event, e))?;
                    if let Err(err) = std::fs::remove_dir_all(&self.directory) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!(transfer = %transfer.id(), %err, "working directory not removed");
                        }
                    }
                    self.core.ctx().events.fire(
                        bus::REMOVED,
                        &serde_json::json!({ "transferId": transfer.id() }),
                    );
                    Ok(None)
                }
                _ => Ok(None),
            }
        })
    }
}

impl TransferClient for HttpDownloadClient {
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
        let bandwidth = self.core.transfer().read(|t| t.bandwidth);
        self.limiter.set_rate(bandwidth);
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        self.cancel.lock().unwrap().cancel();
        Box::pin(async {})
    }

    fn directory(&self) -> PathBuf {
        self.directory.clone()
    }

    fn files(&self) -> Vec<FileInfo> {
        self.core.transfer().read(|t| {
            if t.filename.is_empty() {
                Vec::new()
            } else {
                vec![FileInfo {
                    path: t.filename.clone(),
                    size: t.size,
                    progress: t.progress,
                }]
            }
        })
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name)?.to_str().ok()
}

/// Extracts the filename parameter from a Content-Disposition header,
/// tolerating both quoted and bare forms. Path separators are stripped so a
/// hostile header cannot escape the working directory.
fn filename_from_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(raw) = part.strip_prefix("filename=") {
            let name = raw.trim_matches('"').trim();
            let name = name.rsplit(['/', '\\']).next().unwrap_or("");
            if !name.is_empty() && name != "." && name != ".." {
                return Some(name.to_string());
            }
        }
    }
    None
}

async fn resume_offset(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}
