use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::listener::ConfigChangeListener;

/// In-process configuration source.
///
/// `publish` hands each registered listener the payload on the listener's own
/// worker pool and returns without waiting, so a slow listener never stalls
/// delivery to the others or the publisher itself.
#[derive(Default)]
pub struct ConfigNotifier {
    listeners: RwLock<Vec<Arc<dyn ConfigChangeListener>>>,
}

impl ConfigNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ConfigChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Dispatch a payload; returns how many listeners accepted it
    pub fn publish(&self, config_info: &str) -> usize {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut dispatched = 0;
        for listener in &listeners {
            let target = Arc::clone(listener);
            let payload = config_info.to_string();
            match listener
                .executor()
                .execute(move || target.receive_config_info(&payload))
            {
                Ok(()) => dispatched += 1,
                Err(e) => warn!(error = %e, "Config listener unavailable, payload dropped"),
            }
        }
        debug!(listeners = listeners.len(), dispatched = dispatched, "Published configuration payload");
        dispatched
    }
}
