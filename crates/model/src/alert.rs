use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

/// User-visible warning recorded when an operation degrades instead of
/// failing the caller (e.g. no agent could handle a transfer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub user_id: u64,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub level: AlertLevel,
    pub viewed: bool,
}

impl Alert {
    /// Creates an unviewed warning alert for `user_id`.
    pub fn warn(user_id: u64, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            timestamp: Utc::now(),
            title: title.into(),
            description: description.into(),
            level: AlertLevel::Warn,
            viewed: false,
        }
    }
}
