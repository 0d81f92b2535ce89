//! Event Bus Port
//!
//! Fire-and-forget, at-most-once notifications for UI and telemetry. The engine
//! never waits on delivery.

pub mod topics {
    pub const INSTANCE_CREATED: &str = "instance.created";
    pub const INSTANCE_STARTED: &str = "instance.started";
    pub const INSTANCE_PAUSED: &str = "instance.paused";
    pub const INSTANCE_STOPPED: &str = "instance.stopped";
    pub const INSTANCE_ERROR: &str = "instance.error";
    pub const INSTANCE_DELETED: &str = "instance.deleted";
    pub const INSTANCE_TICK: &str = "instance.tick";
    pub const POSITION_CREATED: &str = "position.created";
    pub const POSITION_RECREATED: &str = "position.recreated";
    pub const RISK_ALERT: &str = "risk.alert";
    pub const YIELD_EXTRACTED: &str = "yield.extracted";
    pub const YIELD_EXTRACTION_FAILED: &str = "yield.extraction_failed";
}

#[cfg_attr(test, mockall::automock)]
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn publish(&self, _topic: &str, _payload: serde_json::Value) {}
}
