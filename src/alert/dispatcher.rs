//! Runs a triggered rule's actions.

use super::actions::{parse_action_specs, ActionError, ActionRegistry};
use crate::db::{AlertEvent, AlertRule};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Outcome counts for one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Unknown action types and entries with invalid parameters.
    pub skipped: usize,
}

/// Executes the actions listed on a rule, each in its own task.
///
/// Action failures are logged and counted, never returned: by the time
/// actions run the trigger and its event are already stored.
#[derive(Clone)]
pub struct ActionDispatcher {
    registry: Arc<ActionRegistry>,
    timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<ActionRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub async fn dispatch(&self, rule: &AlertRule, event: &AlertEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        let specs = match parse_action_specs(&rule.actions) {
            Ok(specs) => specs,
            Err(e) => {
                tracing::warn!(rule_id = rule.id, "Rule {} has unreadable actions: {}", rule.name, e);
                report.skipped += 1;
                return report;
            }
        };

        let event = Arc::new(event.clone());
        let mut set = JoinSet::new();

        for spec in specs {
            let action = match self.registry.build(&spec) {
                Some(Ok(action)) => action,
                Some(Err(e)) => {
                    tracing::warn!(rule_id = rule.id, action = %spec.kind, "Skipping action: {}", e);
                    report.skipped += 1;
                    continue;
                }
                None => {
                    tracing::warn!(rule_id = rule.id, action = %spec.kind, "Skipping unknown action type");
                    report.skipped += 1;
                    continue;
                }
            };

            let event = event.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let result = match tokio::time::timeout(timeout, action.execute(&event)).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Timeout(timeout)),
                };
                (spec.kind, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.succeeded += 1,
                Ok((kind, Err(e))) => {
                    tracing::warn!(rule_id = rule.id, action = %kind, "Action failed: {}", e);
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!(rule_id = rule.id, "Action task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            rule_id = rule.id,
            "Dispatched actions: {} ok, {} failed, {} skipped",
            report.succeeded,
            report.failed,
            report.skipped
        );

        report
    }
}
