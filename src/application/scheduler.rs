//! Tick Scheduler
//!
//! Owns one cancellable ticker per instance. A ticker sleeps for its interval,
//! then awaits the handler, so ticks of one instance never overlap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self, instance_id: &str);
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TickScheduler {
    tickers: Mutex<HashMap<String, Ticker>>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking `instance_id`, replacing any existing ticker.
    pub fn start(&self, instance_id: &str, interval: Duration, handler: Arc<dyn TickHandler>) {
        let token = CancellationToken::new();
        let child = token.clone();
        let id = instance_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if child.is_cancelled() {
                    break;
                }
                handler.on_tick(&id).await;
            }
            debug!(instance_id = %id, "Ticker stopped");
        });

        let previous = self
            .tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id.to_string(), Ticker { token, handle });
        if let Some(old) = previous {
            old.token.cancel();
            debug!(instance_id, "Replaced existing ticker");
        }
        info!(instance_id, interval_secs = interval.as_secs(), "Monitoring started");
    }

    /// Cancel a ticker without waiting for an in-flight tick.
    pub fn cancel(&self, instance_id: &str) -> bool {
        match self
            .tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id)
        {
            Some(ticker) => {
                ticker.token.cancel();
                info!(instance_id, "Monitoring stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, instance_id: &str) -> bool {
        self.tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .is_some_and(|t| !t.token.is_cancelled() && !t.handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| !t.token.is_cancelled())
            .count()
    }

    /// Cancel every ticker and wait for the tasks to finish.
    pub async fn shutdown(&self) {
        let tickers: Vec<(String, Ticker)> = self
            .tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, ticker) in &tickers {
            ticker.token.cancel();
        }
        for (id, ticker) in tickers {
            if let Err(e) = ticker.handle.await {
                debug!(instance_id = %id, error = %e, "Ticker task ended abnormally");
            }
        }
    }
}
