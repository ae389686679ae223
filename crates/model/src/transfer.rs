use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::TransferState;

/// Protocol-reported health of an active transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Unknown,
    Excellent,
    Degraded,
    Dead,
}

/// The persistent unit of work: one requested download or upload.
///
/// Persisted fields survive restarts; the rate/connection fields at the
/// bottom are recomputed at runtime by the owning client and are only
/// serialized so status snapshots stay a flat structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Uuid,
    pub user_id: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Opaque protocol metadata (e.g. a serialized torrent descriptor).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<u8>>,
    /// Opaque resume blob owned by the protocol engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_data: Option<Vec<u8>>,
    /// Higher priority is scheduled first.
    pub priority: i32,
    /// Requested bandwidth cap in bytes/sec (0 = unlimited).
    pub bandwidth: u64,
    pub state: TransferState,
    /// Human-readable status message, overwritten on every failure.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Percentage in [0, 100], non-decreasing while active.
    pub progress: f64,
    /// Declared size in bytes (0 = unknown).
    pub size: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub added: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    /// Soft-delete tombstone; terminal and irreversible.
    pub removed: bool,

    // Derived at runtime by the owning client.
    #[serde(default)]
    pub download_rate: u64,
    #[serde(default)]
    pub upload_rate: u64,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub connection_limit: u32,
    /// Cumulative active seconds across starts and stops.
    #[serde(default)]
    pub elapsed: u64,
    /// Estimated seconds remaining (0 = unknown).
    #[serde(default)]
    pub timeleft: u64,
    #[serde(default)]
    pub health: Health,
}

impl Transfer {
    /// Creates a queued transfer for `url` owned by `user_id`.
    pub fn new(user_id: u64, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            url: url.into(),
            filename: String::new(),
            media_type: String::new(),
            mime_type: String::new(),
            description: String::new(),
            metadata: None,
            resume_data: None,
            priority: 0,
            bandwidth: 0,
            state: TransferState::Queued,
            status: String::new(),
            progress: 0.0,
            size: 0,
            downloaded: 0,
            uploaded: 0,
            added: None,
            started: None,
            completed: None,
            removed: false,
            download_rate: 0,
            upload_rate: 0,
            connections: 0,
            connection_limit: 0,
            elapsed: 0,
            timeleft: 0,
            health: Health::Unknown,
        }
    }

    /// Records a progress observation. The byte count never exceeds the
    /// declared size once one is known, and the percentage is monotonic.
    pub fn record_progress(&mut self, downloaded: u64) {
        self.downloaded = if self.size > 0 {
            downloaded.min(self.size)
        } else {
            downloaded
        };
        if self.size > 0 {
            let pct = (downloaded as f64 / self.size as f64) * 100.0;
            if pct > self.progress {
                self.progress = pct.min(100.0);
            }
        }
    }

    /// Overwrites the status message from a failure.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.status = message.into();
        self.connections = 0;
        self.download_rate = 0;
        self.health = Health::Dead;
    }
}
