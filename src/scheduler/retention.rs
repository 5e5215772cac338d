//! Retention manager for cleaning up old rollup buckets.

use super::task::{PeriodicTask, RunFlag};
use crate::db::{Resolution, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How long buckets of one resolution are kept, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub resolution: Resolution,
    pub retention: i64,
}

/// Default bucket retention policies.
pub fn default_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy { resolution: Resolution::Hour, retention: 7_776_000 }, // 90 days
        RetentionPolicy { resolution: Resolution::Day, retention: 315_360_000 }, // 10 years
    ]
}

/// Validate retention policies.
///
/// Each resolution may appear once, and a coarser resolution must be kept
/// at least as long as a finer one, since it is rebuilt from it.
pub fn validate_retention_policies(policies: &[RetentionPolicy]) -> Result<(), String> {
    let mut sorted = policies.to_vec();
    sorted.sort_by_key(|p| p.resolution);

    for (i, p) in sorted.iter().enumerate() {
        if p.retention <= 0 {
            return Err(format!("{} retention must be positive", p.resolution));
        }

        if i > 0 {
            let prev = sorted[i - 1];
            if prev.resolution == p.resolution {
                return Err(format!("duplicate retention policy for {}", p.resolution));
            }
            if p.retention < prev.retention {
                return Err(format!(
                    "{} retention {}s is shorter than {} retention {}s",
                    p.resolution, p.retention, prev.resolution, prev.retention
                ));
            }
        }
    }

    Ok(())
}

/// Manager for deleting buckets past their retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    policies: Vec<RetentionPolicy>,
    busy: RunFlag,
    task: PeriodicTask,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, policies: Vec<RetentionPolicy>, period: Duration) -> Self {
        Self {
            store,
            policies,
            busy: RunFlag::default(),
            task: PeriodicTask::new("RetentionManager", period),
        }
    }

    /// Start the retention manager background task.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        self.task.start(move || {
            let manager = manager.clone();
            async move {
                manager.run(Utc::now());
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Delete expired buckets. Returns the number of rows removed.
    pub fn run(&self, now: DateTime<Utc>) -> usize {
        let Some(_guard) = self.busy.try_begin() else {
            return 0;
        };

        let mut removed = 0;
        for policy in &self.policies {
            let cutoff = now - ChronoDuration::seconds(policy.retention);

            match self.store.delete_buckets_before(policy.resolution, cutoff) {
                Ok(n) => removed += n,
                Err(e) => {
                    tracing::error!(
                        "RetentionManager: Failed to delete {} buckets: {}",
                        policy.resolution,
                        e
                    );
                }
            }
        }

        if removed > 0 {
            tracing::info!("RetentionManager: Removed {} expired buckets", removed);
        }

        removed
    }
}
