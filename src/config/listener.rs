use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::worker::{WorkerPool, WorkerPoolError};
use super::{ConfigHandle, EngineConfig, ListenerConfig};

/// Receives raw configuration text from a config source.
///
/// The source must invoke `receive_config_info` on the pool returned by
/// `executor`, never on its own delivery thread, so a listener is free to
/// block while re-parsing.
pub trait ConfigChangeListener: Send + Sync {
    fn executor(&self) -> &WorkerPool;

    fn receive_config_info(&self, config_info: &str);
}

/// Hot-updates the engine's tunables from TOML payloads.
///
/// Delivery is at-least-once, so a payload identical to the last applied one
/// is ignored. Parsing and swapping happen under one lock; concurrent
/// traversals only ever observe a fully parsed config through the handle.
pub struct EngineConfigListener {
    handle: ConfigHandle,
    pool: WorkerPool,
    last_payload: Mutex<Option<String>>,
    swaps: AtomicU64,
}

impl EngineConfigListener {
    pub fn new(handle: ConfigHandle, settings: &ListenerConfig) -> Result<Self, WorkerPoolError> {
        let pool = WorkerPool::new(&settings.thread_name, settings.worker_threads)?;
        Ok(Self::with_pool(handle, pool))
    }

    /// Use a caller-provided pool
    pub fn with_pool(handle: ConfigHandle, pool: WorkerPool) -> Self {
        Self {
            handle,
            pool,
            last_payload: Mutex::new(None),
            swaps: AtomicU64::new(0),
        }
    }

    /// Number of configuration swaps actually applied
    pub fn applied_swaps(&self) -> u64 {
        self.swaps.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> &ConfigHandle {
        &self.handle
    }

    pub fn stop(&self) {
        self.pool.shutdown();
    }
}

impl ConfigChangeListener for EngineConfigListener {
    fn executor(&self) -> &WorkerPool {
        &self.pool
    }

    fn receive_config_info(&self, config_info: &str) {
        let mut last = match self.last_payload.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if last.as_deref() == Some(config_info) {
            debug!("Ignoring repeated configuration payload");
            return;
        }

        match EngineConfig::from_toml_str(config_info) {
            Ok(parsed) => {
                self.handle.store(parsed);
                *last = Some(config_info.to_string());
                let swaps = self.swaps.fetch_add(1, Ordering::SeqCst) + 1;
                info!(swaps = swaps, bytes = config_info.len(), "Applied engine configuration update");
            }
            Err(e) => {
                warn!(error = %e, "Rejected configuration update, keeping current configuration");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> EngineConfigListener {
        let pool = WorkerPool::new("listener-test", 1).unwrap();
        EngineConfigListener::with_pool(ConfigHandle::default(), pool)
    }

    #[test]
    fn test_identical_payloads_swap_once() {
        let listener = listener();
        let payload = "[retry]\ndefault_max_attempts = 5\n";

        listener.receive_config_info(payload);
        listener.receive_config_info(payload);

        assert_eq!(listener.applied_swaps(), 1);
        assert_eq!(listener.handle().get().retry.default_max_attempts, 5);
    }

    #[test]
    fn test_changed_payload_swaps_again() {
        let listener = listener();
        listener.receive_config_info("[retry]\ndefault_max_attempts = 5\n");
        listener.receive_config_info("[retry]\ndefault_max_attempts = 6\n");

        assert_eq!(listener.applied_swaps(), 2);
        assert_eq!(listener.handle().get().retry.default_max_attempts, 6);
    }

    #[test]
    fn test_invalid_payload_keeps_previous_config() {
        let listener = listener();
        listener.receive_config_info("[policy]\nforce_compensation = true\n");
        listener.receive_config_info("[policy\nforce_compensation = ");

        assert_eq!(listener.applied_swaps(), 1);
        assert!(listener.handle().get().policy.force_compensation);
    }
}
