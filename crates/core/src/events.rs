use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, warn};

/// Error a listener may report; dispatch logs it and moves on.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Listener = Box<dyn Fn(&Value) -> Result<(), ListenerError> + Send + Sync>;

/// Synchronous best-effort event bus.
///
/// `fire` delivers the payload to every listener subscribed to the event
/// name; a failing listener is logged and skipped so it can never abort
/// delivery to the others.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&Value) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap()
            .entry(event.into())
            .or_default()
            .push(Box::new(listener));
    }

    pub fn fire(&self, event: &str, payload: &Value) {
        debug!(event, "event");
        let listeners = self.listeners.read().unwrap();
        let Some(subs) = listeners.get(event) else {
            return;
        };
        for listener in subs {
            if let Err(err) = listener(payload) {
                warn!(event, %err, "event listener failed");
            }
        }
    }
}
