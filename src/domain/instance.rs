//! Strategy Instance
//!
//! The persisted record of a strategy instance. Owned by the `StrategyManager`
//! and only mutated through its lifecycle operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::state::{InstanceState, PositionRange};
use crate::strategy::InstanceConfig;

/// Strategy implementations the engine can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    ChainPosition,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyType::ChainPosition => write!(f, "chain_position"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
}

/// Chain position an instance owns, saved so a restart re-adopts it instead of
/// opening a second one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub addresses: Vec<String>,
    pub range: PositionRange,
}

impl PositionRecord {
    /// The live chain position in `state`, if it holds one
    pub fn from_state(state: &InstanceState) -> Option<Self> {
        if !state.has_been_created || state.position_addresses.is_empty() {
            return None;
        }
        Some(Self {
            addresses: state.position_addresses.clone(),
            range: state.position_range?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInstance {
    pub id: String,
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    pub name: String,
    pub config: InstanceConfig,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub position: Option<PositionRecord>,
}

impl StrategyInstance {
    pub fn new(name: &str, config: InstanceConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy_type: config.strategy_type(),
            name: name.to_string(),
            config,
            status: InstanceStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            position: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = InstanceStatus::Running;
        self.started_at = Some(Utc::now());
        self.stopped_at = None;
        self.error = None;
    }

    pub fn mark_paused(&mut self) {
        self.status = InstanceStatus::Paused;
    }

    pub fn mark_stopped(&mut self) {
        self.status = InstanceStatus::Stopped;
        self.stopped_at = Some(Utc::now());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = InstanceStatus::Error;
        self.error = Some(message.into());
        self.stopped_at = Some(Utc::now());
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}
