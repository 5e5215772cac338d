//! Scheduler module for running the alert evaluator, rollups and retention.

mod retention;
mod rollup;
mod task;

pub use retention::*;
pub use rollup::*;
pub use task::*;

use crate::alert::{ActionDispatcher, ActionRegistry, AlertEvaluator};
use crate::config::ServerConfig;
use crate::db::{Resolution, Store};

use chrono::Duration as ChronoDuration;
use std::sync::Arc;

/// Owns the background services and starts or stops them together.
pub struct Scheduler {
    evaluator: Arc<AlertEvaluator>,
    rollup_manager: Arc<RollupManager>,
    retention_manager: Arc<RetentionManager>,
}

impl Scheduler {
    /// Create the background services from configuration.
    pub fn new(
        store: Arc<Store>,
        cfg: &ServerConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let policies = vec![
            RetentionPolicy { resolution: Resolution::Hour, retention: cfg.hour_retention_secs },
            RetentionPolicy { resolution: Resolution::Day, retention: cfg.day_retention_secs },
        ];
        validate_retention_policies(&policies)?;

        let client = reqwest::Client::builder()
            .timeout(cfg.action_timeout())
            .build()?;
        let dispatcher = ActionDispatcher::new(
            Arc::new(ActionRegistry::with_builtins(client)),
            cfg.action_timeout(),
        );

        Ok(Self {
            evaluator: Arc::new(AlertEvaluator::new(store.clone(), dispatcher, cfg.alert_interval())),
            rollup_manager: Arc::new(RollupManager::new(
                store.clone(),
                ChronoDuration::seconds(cfg.hour_retention_secs),
                cfg.rollup_interval(),
            )),
            retention_manager: Arc::new(RetentionManager::new(store, policies, cfg.retention_interval())),
        })
    }

    /// Start all background tasks.
    pub fn start(&self) {
        tracing::info!("Starting scheduler");
        self.evaluator.start();
        self.rollup_manager.start();
        self.retention_manager.start();
    }

    /// Stop all background tasks, waiting for in-flight runs.
    pub async fn stop(&self) {
        tokio::join!(
            self.evaluator.stop(),
            self.rollup_manager.stop(),
            self.retention_manager.stop(),
        );
        tracing::info!("Scheduler stopped");
    }

    pub fn evaluator(&self) -> &Arc<AlertEvaluator> {
        &self.evaluator
    }

    pub fn rollup_manager(&self) -> &Arc<RollupManager> {
        &self.rollup_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;

    #[tokio::test]
    async fn test_scheduler_rejects_inverted_retention() {
        let (_tmp, store) = temp_store();
        let cfg = ServerConfig {
            hour_retention_secs: 86_400 * 30,
            day_retention_secs: 86_400,
            ..Default::default()
        };
        assert!(Scheduler::new(Arc::new(store), &cfg).is_err());
    }

    #[tokio::test]
    async fn test_scheduler_start_stop() {
        let (_tmp, store) = temp_store();
        let scheduler = Scheduler::new(Arc::new(store), &ServerConfig::default()).unwrap();

        scheduler.start();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scheduler.stop().await;
    }
}
