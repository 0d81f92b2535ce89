//! Instance Registry
//!
//! Single owner of every `InstanceState`, keyed by instance id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::domain::InstanceState;

pub type SharedState = Arc<Mutex<InstanceState>>;

#[derive(Default)]
pub struct InstanceRegistry {
    states: RwLock<HashMap<String, SharedState>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a state unless one already exists. Returns the registered entry.
    pub fn insert_if_absent(&self, state: InstanceState) -> SharedState {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states
            .entry(state.instance_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone()
    }

    pub fn get(&self, instance_id: &str) -> Option<SharedState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned()
    }

    pub fn remove(&self, instance_id: &str) -> Option<SharedState> {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(instance_id)
    }

    /// Run `f` with the state locked. The guard never crosses an await.
    pub fn with<R>(&self, instance_id: &str, f: impl FnOnce(&mut InstanceState) -> R) -> Option<R> {
        let shared = self.get(instance_id)?;
        let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut state))
    }

    /// Copy of the current state
    pub fn snapshot(&self, instance_id: &str) -> Option<InstanceState> {
        self.with(instance_id, |s| s.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
