use serde::{Deserialize, Serialize};

/// One file inside a transfer, as reported by the protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Path relative to the transfer's destination directory.
    pub path: String,
    pub size: u64,
    pub progress: f64,
}

/// Ephemeral aggregate snapshot of one agent (or of the whole manager).
///
/// Recomputed on a time-boxed cache rather than on every poll; see
/// `LocalAgent::status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub host: String,
    pub version: String,
    pub active_downloads: u32,
    pub queued_downloads: u32,
    pub active_uploads: u32,
    /// Overall completion of everything in the queue, 0-100.
    pub progress: f64,
    /// Aggregate download rate in bytes/sec.
    pub download_rate: u64,
    /// Aggregate upload rate in bytes/sec.
    pub upload_rate: u64,
    pub disk_free: u64,
    pub disk_free_pct: f64,
    pub connections: u32,
    pub paused: bool,
}
