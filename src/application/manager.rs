//! Strategy Manager
//!
//! Owns the persisted `StrategyInstance` records and routes lifecycle calls to
//! the executor for each strategy type. Every status change is saved before the
//! call returns. Notices from executors (stop-loss exits, terminal errors) are
//! applied by a background task. Records carry the addresses of open chain
//! positions so a restarted process takes them over instead of opening new ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::executor::{ChainPositionExecutor, LifecycleNotice, StrategyExecutor};
use crate::application::scheduler::TickScheduler;
use crate::application::services::{FactoryHealth, FactorySettings, InstanceServiceFactory};
use crate::application::yield_extraction::WorkflowPorts;
use crate::domain::{
    EngineError, InstanceState, InstanceStatus, PositionRecord, StoppingReason, StrategyInstance,
    StrategyType,
};
use crate::ports::{topics, EventBus, StrategyStorage};
use crate::strategy::InstanceConfig;

pub struct StrategyManager {
    storage: Arc<dyn StrategyStorage>,
    events: Arc<dyn EventBus>,
    executors: Vec<Arc<dyn StrategyExecutor>>,
    scheduler: Arc<TickScheduler>,
    factory: Arc<InstanceServiceFactory>,
    instances: RwLock<HashMap<String, StrategyInstance>>,
    notice_task: Mutex<Option<JoinHandle<()>>>,
}

impl StrategyManager {
    /// Wire the chain-position executor over `ports` and start the notice listener.
    pub fn new(ports: WorkflowPorts, storage: Arc<dyn StrategyStorage>) -> Arc<Self> {
        Self::with_settings(ports, storage, FactorySettings::default())
    }

    pub fn with_settings(
        ports: WorkflowPorts,
        storage: Arc<dyn StrategyStorage>,
        settings: FactorySettings,
    ) -> Arc<Self> {
        let events = ports.events.clone();
        let factory = Arc::new(InstanceServiceFactory::with_settings(ports, settings));
        let scheduler = Arc::new(TickScheduler::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = ChainPositionExecutor::new(factory.clone(), scheduler.clone(), tx);

        let manager = Arc::new(Self {
            storage,
            events,
            executors: vec![executor as Arc<dyn StrategyExecutor>],
            scheduler,
            factory,
            instances: RwLock::new(HashMap::new()),
            notice_task: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::listen(Arc::downgrade(&manager), rx));
        *manager.notice_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        manager
    }

    async fn listen(manager: Weak<Self>, mut rx: mpsc::UnboundedReceiver<LifecycleNotice>) {
        while let Some(notice) = rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if let Err(e) = manager.handle_notice(notice).await {
                warn!(error = %e, "Failed to apply lifecycle notice");
            }
        }
        debug!("Lifecycle listener stopped");
    }

    pub async fn handle_notice(&self, notice: LifecycleNotice) -> Result<(), EngineError> {
        match notice {
            LifecycleNotice::Stopped { instance_id, reason } => {
                info!(instance_id = %instance_id, reason = ?reason, "Executor stopped instance");
                let instance = self.update(&instance_id, |i| i.mark_stopped()).await?;
                self.persist(&instance).await
            }
            LifecycleNotice::Errored { instance_id, message } => {
                let instance = self.update(&instance_id, |i| i.mark_error(message)).await?;
                self.persist(&instance).await
            }
            LifecycleNotice::Recreated { instance_id, recreation_type } => {
                info!(instance_id = %instance_id, recreation_type = ?recreation_type, "Position recreated");
                let instance = self.update(&instance_id, |_| {}).await?;
                self.persist(&instance).await
            }
        }
    }

    fn executor_for(&self, strategy_type: StrategyType) -> Result<&Arc<dyn StrategyExecutor>, EngineError> {
        self.executors
            .iter()
            .find(|e| e.strategy_type() == strategy_type)
            .ok_or_else(|| EngineError::UnsupportedStrategy(strategy_type.to_string()))
    }

    async fn get_record(&self, id: &str) -> Result<StrategyInstance, EngineError> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))
    }

    async fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut StrategyInstance),
    ) -> Result<StrategyInstance, EngineError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        f(instance);
        // No executor state means nothing is known yet; keep the stored record
        if let Some(state) = self.instance_state(id) {
            instance.position = PositionRecord::from_state(&state);
        }
        Ok(instance.clone())
    }

    async fn persist(&self, instance: &StrategyInstance) -> Result<(), EngineError> {
        self.storage.save_instance(instance).await?;
        Ok(())
    }

    pub async fn create_instance(
        &self,
        name: &str,
        config: InstanceConfig,
    ) -> Result<StrategyInstance, EngineError> {
        config.validate().map_err(|e| EngineError::Config(e.to_string()))?;
        self.executor_for(config.strategy_type())?;

        let instance = StrategyInstance::new(name, config);
        self.persist(&instance).await?;
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());

        info!(instance_id = %instance.id, name, strategy = %instance.strategy_type, "Instance created");
        self.events.publish(
            topics::INSTANCE_CREATED,
            json!({ "instance_id": instance.id, "name": instance.name, "type": instance.strategy_type }),
        );
        Ok(instance)
    }

    pub async fn start_instance(&self, id: &str) -> Result<StrategyInstance, EngineError> {
        let instance = self.get_record(id).await?;
        let executor = self.executor_for(instance.strategy_type)?.clone();

        let result = async {
            executor.initialize(id, &instance.config).await?;
            if let Some(record) = &instance.position {
                executor.adopt_positions(id, record).await?;
            }
            executor.execute(id).await
        }
        .await;

        match result {
            Ok(()) => {
                let instance = self.update(id, |i| i.mark_running()).await?;
                self.persist(&instance).await?;
                info!(instance_id = id, "Instance running");
                self.events
                    .publish(topics::INSTANCE_STARTED, json!({ "instance_id": id }));
                Ok(instance)
            }
            Err(e) => {
                let message = e.to_string();
                let instance = self.update(id, |i| i.mark_error(message)).await?;
                self.persist(&instance).await?;
                Err(e)
            }
        }
    }

    pub async fn pause_instance(&self, id: &str) -> Result<StrategyInstance, EngineError> {
        let instance = self.get_record(id).await?;
        if instance.status != InstanceStatus::Running {
            return Err(EngineError::InvalidStatus {
                instance_id: id.to_string(),
                status: instance.status,
                action: "pause",
            });
        }
        self.executor_for(instance.strategy_type)?.pause(id).await?;

        let instance = self.update(id, |i| i.mark_paused()).await?;
        self.persist(&instance).await?;
        self.events
            .publish(topics::INSTANCE_PAUSED, json!({ "instance_id": id }));
        Ok(instance)
    }

    pub async fn resume_instance(&self, id: &str) -> Result<StrategyInstance, EngineError> {
        let instance = self.get_record(id).await?;
        if instance.status != InstanceStatus::Paused {
            return Err(EngineError::InvalidStatus {
                instance_id: id.to_string(),
                status: instance.status,
                action: "resume",
            });
        }
        self.start_instance(id).await
    }

    /// Close positions, drop executor state, and mark STOPPED.
    pub async fn stop_instance(&self, id: &str) -> Result<StrategyInstance, EngineError> {
        let instance = self.get_record(id).await?;
        let executor = self.executor_for(instance.strategy_type)?;
        executor.stop(id, StoppingReason::UserStop).await?;
        executor.remove(id).await?;

        let instance = self
            .update(id, |i| {
                i.mark_stopped();
                i.position = None;
            })
            .await?;
        self.persist(&instance).await?;
        self.events.publish(
            topics::INSTANCE_STOPPED,
            json!({ "instance_id": id, "reason": StoppingReason::UserStop }),
        );
        Ok(instance)
    }

    pub async fn delete_instance(&self, id: &str) -> Result<(), EngineError> {
        let instance = self.get_record(id).await?;
        if matches!(instance.status, InstanceStatus::Running | InstanceStatus::Paused) {
            self.stop_instance(id).await?;
        } else {
            self.executor_for(instance.strategy_type)?.remove(id).await?;
        }

        self.storage.delete_instance(id).await?;
        self.instances.write().await.remove(id);
        info!(instance_id = id, "Instance deleted");
        self.events
            .publish(topics::INSTANCE_DELETED, json!({ "instance_id": id }));
        Ok(())
    }

    pub async fn get_instance(&self, id: &str) -> Option<StrategyInstance> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn list_instances(&self) -> Vec<StrategyInstance> {
        let mut all: Vec<StrategyInstance> = self.instances.read().await.values().cloned().collect();
        all.sort_by_key(|i| i.created_at);
        all
    }

    /// Executor-side state, when the instance has any
    pub fn instance_state(&self, id: &str) -> Option<InstanceState> {
        self.executors.iter().find_map(|e| e.state_snapshot(id))
    }

    pub async fn load_from_storage(&self) -> Result<usize, EngineError> {
        let stored = self.storage.load_instances().await?;
        let mut instances = self.instances.write().await;
        let mut loaded = 0;
        for instance in stored {
            if let Err(e) = instance.config.validate() {
                warn!(instance_id = %instance.id, error = %e, "Skipping stored instance with invalid config");
                continue;
            }
            instances.insert(instance.id.clone(), instance);
            loaded += 1;
        }
        info!(count = loaded, "Loaded instances from storage");
        Ok(loaded)
    }

    /// Restart every instance persisted as RUNNING. Returns the ids that started.
    pub async fn restore_running(&self) -> Vec<String> {
        let ids: Vec<String> = self
            .list_instances()
            .await
            .into_iter()
            .filter(|i| i.is_running())
            .map(|i| i.id)
            .collect();

        let mut restored = Vec::new();
        for id in ids {
            match self.start_instance(&id).await {
                Ok(_) => restored.push(id),
                Err(e) => warn!(instance_id = %id, error = %e, "Failed to restore instance"),
            }
        }
        restored
    }

    pub fn factory(&self) -> &Arc<InstanceServiceFactory> {
        &self.factory
    }

    /// Sweep idle service containers every `interval`, sparing instances
    /// that still hold chain positions.
    pub fn spawn_sweeper(&self, interval: Duration, threshold: Duration, token: CancellationToken) -> JoinHandle<()> {
        let executors = self.executors.clone();
        self.factory.clone().spawn_sweeper(
            interval,
            threshold,
            Arc::new(move |id: &str| executors.iter().any(|e| e.holds_positions(id))),
            token,
        )
    }

    pub fn health_check(&self) -> FactoryHealth {
        self.factory.health_check()
    }

    pub fn active_tickers(&self) -> usize {
        self.scheduler.active_count()
    }

    /// Stop all tickers and release services. Records keep their status, so
    /// RUNNING instances restart on the next `restore_running`.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.factory.shutdown().await;
        if let Some(handle) = self
            .notice_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        info!("Strategy manager shut down");
    }
}
