use std::sync::RwLock;

use sluice_model::Alert;

/// Collaborator that records user-visible warnings.
pub trait AlertSink: Send + Sync {
    fn add(&self, alert: Alert);
    /// Unviewed alerts for one user, oldest first.
    fn unviewed(&self, user_id: u64) -> Vec<Alert>;
}

#[derive(Default)]
pub struct MemoryAlerts {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlerts {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlertSink for MemoryAlerts {
    fn add(&self, alert: Alert) {
        self.alerts.write().unwrap().push(alert);
    }

    fn unviewed(&self, user_id: u64) -> Vec<Alert> {
        self.alerts
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.user_id == user_id && !a.viewed)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unviewed_filters_by_user() {
        let sink = MemoryAlerts::new();
        sink.add(Alert::warn(1, "no agent", "rejected by all agents"));
        sink.add(Alert::warn(2, "no agent", "rejected by all agents"));

        let mine = sink.unviewed(1);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].user_id, 1);
    }
}
