//! Instance Service Factory
//!
//! Builds one isolated service graph per instance (cache, analyzer, yield
//! workflow, ledger, analytics) and evicts graphs that sit idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::market_cache::{MarketDataAnalyzer, MarketSnapshotCache};
use crate::application::yield_extraction::{WorkflowPorts, YieldExtractionWorkflow};
use crate::domain::AccumulatedYieldManager;

/// Per-instance counters
#[derive(Debug)]
pub struct InstanceAnalytics {
    instance_id: String,
    ticks: AtomicU64,
    errors: AtomicU64,
    recreations: AtomicU64,
    extractions: AtomicU64,
    stop_loss_exits: AtomicU64,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSummary {
    pub instance_id: String,
    pub ticks: u64,
    pub errors: u64,
    pub recreations: u64,
    pub extractions: u64,
    pub stop_loss_exits: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

impl InstanceAnalytics {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ticks: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            recreations: AtomicU64::new(0),
            extractions: AtomicU64::new(0),
            stop_loss_exits: AtomicU64::new(0),
            last_tick: Mutex::new(None),
        }
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recreation(&self) {
        self.recreations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_extraction(&self) {
        self.extractions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stop_loss(&self) {
        self.stop_loss_exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> AnalyticsSummary {
        AnalyticsSummary {
            instance_id: self.instance_id.clone(),
            ticks: self.ticks.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            recreations: self.recreations.load(Ordering::Relaxed),
            extractions: self.extractions.load(Ordering::Relaxed),
            stop_loss_exits: self.stop_loss_exits.load(Ordering::Relaxed),
            last_tick: *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    pub async fn shutdown(&self) {
        let s = self.summary();
        info!(
            instance_id = %s.instance_id,
            ticks = s.ticks,
            errors = s.errors,
            recreations = s.recreations,
            extractions = s.extractions,
            stop_loss_exits = s.stop_loss_exits,
            "Instance analytics closed"
        );
    }
}

/// The service graph owned by one instance
pub struct ServiceContainer {
    pub instance_id: String,
    pub cache: Arc<MarketSnapshotCache>,
    pub yield_analyzer: Arc<MarketDataAnalyzer>,
    pub yield_operator: Arc<YieldExtractionWorkflow>,
    pub accumulated_yield_manager: Arc<AccumulatedYieldManager>,
    pub analytics_service: Arc<InstanceAnalytics>,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
}

impl ServiceContainer {
    fn build(instance_id: &str, ports: &WorkflowPorts) -> Self {
        let ledger = Arc::new(AccumulatedYieldManager::new());
        let analyzer = Arc::new(MarketDataAnalyzer::new(
            ports.chain.clone(),
            ports.retry.clone(),
            ledger.clone(),
        ));
        let cache = Arc::new(MarketSnapshotCache::new(analyzer.clone()));
        let workflow = Arc::new(YieldExtractionWorkflow::new(
            ports.clone(),
            ledger.clone(),
            cache.clone(),
        ));
        let now = Instant::now();
        Self {
            instance_id: instance_id.to_string(),
            cache,
            yield_analyzer: analyzer,
            yield_operator: workflow,
            accumulated_yield_manager: ledger,
            analytics_service: Arc::new(InstanceAnalytics::new(instance_id)),
            created_at: now,
            last_accessed: Mutex::new(now),
        }
    }

    pub fn touch(&self) {
        *self.last_accessed.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_accessed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Release every owned service
    pub async fn shutdown(&self) {
        self.yield_operator.shutdown().await;
        self.cache.shutdown().await;
        self.yield_analyzer.shutdown().await;
        self.accumulated_yield_manager.shutdown().await;
        self.analytics_service.shutdown().await;
    }
}

#[derive(Debug, Clone)]
pub struct FactorySettings {
    /// Instance count above which health reports a warning
    pub max_instances_warning: usize,
    /// Idle time after which a container counts as stale
    pub stale_after: Duration,
    /// Fraction of stale containers that triggers a warning
    pub stale_ratio_warning: f64,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            max_instances_warning: 50,
            stale_after: Duration::from_secs(30 * 60),
            stale_ratio_warning: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactoryHealth {
    pub instance_count: usize,
    pub stale_count: usize,
    pub healthy: bool,
    pub warnings: Vec<String>,
}

pub struct InstanceServiceFactory {
    ports: WorkflowPorts,
    settings: FactorySettings,
    containers: RwLock<HashMap<String, Arc<ServiceContainer>>>,
}

impl InstanceServiceFactory {
    pub fn new(ports: WorkflowPorts) -> Self {
        Self::with_settings(ports, FactorySettings::default())
    }

    pub fn with_settings(ports: WorkflowPorts, settings: FactorySettings) -> Self {
        Self {
            ports,
            settings,
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub fn ports(&self) -> &WorkflowPorts {
        &self.ports
    }

    /// The instance's container, built on first access
    pub fn get_or_create(&self, instance_id: &str) -> Arc<ServiceContainer> {
        if let Some(existing) = self
            .containers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
        {
            existing.touch();
            return existing.clone();
        }

        let mut containers = self.containers.write().unwrap_or_else(|e| e.into_inner());
        let container = containers
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                debug!(instance_id, "Building service container");
                Arc::new(ServiceContainer::build(instance_id, &self.ports))
            })
            .clone();
        container.touch();
        container
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<ServiceContainer>> {
        let container = self
            .containers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned();
        if let Some(c) = &container {
            c.touch();
        }
        container
    }

    pub fn instance_count(&self) -> usize {
        self.containers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop and shut down one container.
    pub async fn remove(&self, instance_id: &str) -> bool {
        let removed = self
            .containers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
        match removed {
            Some(container) => {
                container.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Evict containers idle for at least `threshold`. Ids for which
    /// `retain` holds are never evicted, however idle.
    pub async fn sweep_idle(&self, threshold: Duration, retain: &(dyn Fn(&str) -> bool + Sync)) -> Vec<String> {
        let evicted: Vec<Arc<ServiceContainer>> = {
            let mut containers = self.containers.write().unwrap_or_else(|e| e.into_inner());
            let idle: Vec<String> = containers
                .iter()
                .filter(|(id, c)| c.idle_for() >= threshold && !retain(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect();
            idle.iter().filter_map(|id| containers.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for container in evicted {
            info!(
                instance_id = %container.instance_id,
                idle_secs = container.idle_for().as_secs(),
                "Evicting idle service container"
            );
            container.shutdown().await;
            ids.push(container.instance_id.clone());
        }
        ids
    }

    /// Run `sweep_idle` every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        threshold: Duration,
        retain: Arc<dyn Fn(&str) -> bool + Send + Sync>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let evicted = self.sweep_idle(threshold, retain.as_ref()).await;
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "Idle sweep complete");
                }
            }
            debug!("Service sweeper stopped");
        })
    }

    pub fn health_check(&self) -> FactoryHealth {
        let containers = self.containers.read().unwrap_or_else(|e| e.into_inner());
        let instance_count = containers.len();
        let stale_count = containers
            .values()
            .filter(|c| c.idle_for() >= self.settings.stale_after)
            .count();
        drop(containers);

        let mut warnings = Vec::new();
        if instance_count > self.settings.max_instances_warning {
            warnings.push(format!(
                "{} instances exceed recommended maximum of {}",
                instance_count, self.settings.max_instances_warning
            ));
        }
        if instance_count > 0
            && stale_count as f64 / instance_count as f64 > self.settings.stale_ratio_warning
        {
            warnings.push(format!(
                "{} of {} service containers are stale",
                stale_count, instance_count
            ));
        }
        for w in &warnings {
            warn!(warning = %w, "Service factory health");
        }

        FactoryHealth {
            instance_count,
            stale_count,
            healthy: warnings.is_empty(),
            warnings,
        }
    }

    pub async fn shutdown(&self) {
        let all: Vec<Arc<ServiceContainer>> = self
            .containers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for container in all {
            container.shutdown().await;
        }
    }
}
