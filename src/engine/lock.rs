use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// In-process execution leases: at most one traversal per instance id
#[derive(Debug, Clone, Default)]
pub struct InstanceLockRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Held for the duration of a traversal; released on drop
#[derive(Debug)]
pub struct InstanceLease {
    held: Arc<Mutex<HashSet<String>>>,
    instance_id: String,
}

impl InstanceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, instance_id: &str) -> EngineResult<InstanceLease> {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(instance_id.to_string()) {
            return Err(EngineError::InstanceLocked(instance_id.to_string()));
        }
        debug!(instance_id = %instance_id, "Acquired instance lease");
        Ok(InstanceLease {
            held: Arc::clone(&self.held),
            instance_id: instance_id.to_string(),
        })
    }

    pub fn is_held(&self, instance_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(instance_id)
    }
}

impl InstanceLease {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.instance_id);
        debug!(instance_id = %self.instance_id, "Released instance lease");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lease_rejected_until_release() {
        let registry = InstanceLockRegistry::new();
        let lease = registry.try_acquire("i-1").unwrap();

        assert!(registry.is_held("i-1"));
        assert!(matches!(
            registry.try_acquire("i-1"),
            Err(EngineError::InstanceLocked(id)) if id == "i-1"
        ));
        assert!(registry.try_acquire("i-2").is_ok());

        drop(lease);
        assert!(!registry.is_held("i-1"));
        assert!(registry.try_acquire("i-1").is_ok());
    }

    #[test]
    fn test_poisoned_registry_still_reports_leases() {
        let registry = InstanceLockRegistry::new();
        let _lease = registry.try_acquire("i-1").unwrap();

        let held = Arc::clone(&registry.held);
        let _ = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("poison the registry");
        })
        .join();

        assert!(registry.held.is_poisoned());
        assert!(registry.is_held("i-1"));
    }
}
