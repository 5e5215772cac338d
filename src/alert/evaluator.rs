//! Periodic evaluation of alert rules against the latest sample.

use super::dispatcher::ActionDispatcher;
use super::{AlertError, Condition, Metric};
use crate::db::{AlertEvent, AlertRule, Sample, Store};
use crate::scheduler::{PeriodicTask, RunFlag};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Result of checking one rule against a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    CoolingDown,
    /// The sample has no usable value for the rule's metric.
    NoValue,
    NotMatched,
    Matched(f64),
}

/// What one evaluator tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub evaluated: usize,
    pub triggered: Vec<AlertEvent>,
    pub failed: usize,
}

/// Check a rule against a sample without touching any state.
pub fn check_rule(rule: &AlertRule, sample: &Sample, now: DateTime<Utc>) -> Result<Outcome, AlertError> {
    if let Some(last) = rule.last_triggered_at {
        if now - last < ChronoDuration::seconds(rule.cooldown_seconds) {
            return Ok(Outcome::CoolingDown);
        }
    }

    let metric: Metric = rule.metric.parse()?;
    let Some(value) = metric.value_of(sample) else {
        return Ok(Outcome::NoValue);
    };

    if !rule.threshold.is_finite() {
        return Err(AlertError::InvalidThreshold(rule.threshold));
    }

    let condition: Condition = rule.condition.parse()?;
    if condition.matches(value, rule.threshold) {
        Ok(Outcome::Matched(value))
    } else {
        Ok(Outcome::NotMatched)
    }
}

/// Evaluates active rules on a fixed period.
pub struct AlertEvaluator {
    store: Arc<Store>,
    dispatcher: ActionDispatcher,
    busy: RunFlag,
    task: PeriodicTask,
}

impl AlertEvaluator {
    pub fn new(store: Arc<Store>, dispatcher: ActionDispatcher, period: Duration) -> Self {
        Self {
            store,
            dispatcher,
            busy: RunFlag::default(),
            task: PeriodicTask::new("AlertEvaluator", period),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let evaluator = self.clone();
        self.task.start(move || {
            let evaluator = evaluator.clone();
            async move {
                evaluator.tick(Utc::now()).await;
            }
        });
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Evaluate every active rule once.
    ///
    /// Returns `None` if a previous tick is still running.
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<TickSummary> {
        let Some(_guard) = self.busy.try_begin() else {
            tracing::debug!("AlertEvaluator: previous tick still in progress, skipping");
            return None;
        };

        let mut summary = TickSummary::default();

        let sample = match self.store.latest_sample() {
            Ok(Some(sample)) => sample,
            Ok(None) => return Some(summary),
            Err(e) => {
                tracing::error!("AlertEvaluator: Failed to read latest sample: {}", e);
                return Some(summary);
            }
        };

        let rules = match self.store.get_active_rules() {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("AlertEvaluator: Failed to load rules: {}", e);
                return Some(summary);
            }
        };

        for rule in rules {
            summary.evaluated += 1;
            let rule = match rule {
                Ok(rule) => rule,
                Err(e) => {
                    tracing::error!(rule_id = e.id, "AlertEvaluator: Skipping rule: {}", e);
                    summary.failed += 1;
                    continue;
                }
            };
            match self.evaluate_rule(&rule, &sample, now).await {
                Ok(Some(event)) => summary.triggered.push(event),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(rule_id = rule.id, "AlertEvaluator: Rule {} failed: {}", rule.name, e);
                    summary.failed += 1;
                }
            }
        }

        Some(summary)
    }

    async fn evaluate_rule(
        &self,
        rule: &AlertRule,
        sample: &Sample,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, AlertError> {
        let Outcome::Matched(value) = check_rule(rule, sample, now)? else {
            return Ok(None);
        };

        let Some(event) = self.store.record_trigger(rule, value, sample, now)? else {
            tracing::debug!(rule_id = rule.id, "Trigger already recorded elsewhere, skipping");
            return Ok(None);
        };

        tracing::info!(
            rule_id = rule.id,
            event_id = event.id,
            "Alert {} triggered: {} {} {} (value {})",
            rule.name,
            rule.metric,
            rule.condition,
            rule.threshold,
            value
        );

        self.dispatcher.dispatch(rule, &event).await;

        Ok(Some(event))
    }
}
