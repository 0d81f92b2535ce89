//! Swap Locks
//!
//! One mutex per instance guards token swaps so a stop-loss liquidation and a
//! recreation swap for the same instance never run together. Acquisition fails
//! fast instead of queueing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use super::error::EngineError;

/// Held for the duration of a swap; released on drop
pub type SwapGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct SwapLockRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SwapLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, instance_id: &str) -> Result<SwapGuard, EngineError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned()
            .map_err(|_| EngineError::SwapLockBusy(instance_id.to_string()))
    }

    pub fn is_locked(&self, instance_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(instance_id)
            .map(|l| l.try_lock().is_err())
            .unwrap_or(false)
    }

    pub fn remove(&self, instance_id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_fast() {
        let registry = SwapLockRegistry::new();
        let guard = registry.try_acquire("a").unwrap();
        assert!(registry.is_locked("a"));
        assert!(matches!(
            registry.try_acquire("a"),
            Err(EngineError::SwapLockBusy(_))
        ));
        drop(guard);
        assert!(registry.try_acquire("a").is_ok());
    }

    #[test]
    fn test_instances_are_independent() {
        let registry = SwapLockRegistry::new();
        let _a = registry.try_acquire("a").unwrap();
        assert!(registry.try_acquire("b").is_ok());
    }
}
