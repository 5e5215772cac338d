//! Alert rule state and trigger history.

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, OptionalExtension, Result as SqlResult, Row, TransactionBehavior,
};
use thiserror::Error;

use super::models::*;
use super::store::{format_db_time, parse_db_time, time_column, DbError, Store};

const RULE_COLUMNS: &str = "id, name, metric, condition, threshold, cooldown_seconds, active, message, actions, triggered, last_triggered_at, trigger_count";
const EVENT_COLUMNS: &str = "id, alert_id, alert_name, metric, condition, threshold, actual_value, triggered_at, message, sample_snapshot";
const MAX_HISTORY_PAGE: i64 = 1000;

/// An active rule row that could not be decoded.
#[derive(Error, Debug)]
#[error("rule {id} is malformed: {source}")]
pub struct MalformedRule {
    pub id: i64,
    #[source]
    pub source: rusqlite::Error,
}

impl Store {
    // --- Alert Rules ---

    /// Insert a rule document and return its ID.
    pub fn insert_rule(&self, rule: &mut AlertRule) -> Result<i64, DbError> {
        if rule.cooldown_seconds < 0 {
            rule.cooldown_seconds = 0;
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alert_rules (name, metric, condition, threshold, cooldown_seconds, active, message, actions, triggered, last_triggered_at, trigger_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                rule.name,
                rule.metric,
                rule.condition,
                rule.threshold,
                rule.cooldown_seconds,
                rule.active,
                rule.message,
                rule.actions,
                rule.triggered,
                rule.last_triggered_at.map(format_db_time),
                rule.trigger_count,
            ],
        )?;
        let id = conn.last_insert_rowid();
        rule.id = id;
        Ok(id)
    }

    /// Get a rule by ID.
    pub fn get_rule(&self, id: i64) -> Result<AlertRule, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RULE_COLUMNS} FROM alert_rules WHERE id = ?1"),
            params![id],
            rule_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get all active rules in ID order.
    ///
    /// Rows are decoded one by one; a row that does not decode is returned
    /// as a [`MalformedRule`] in its place so the others stay usable.
    pub fn get_active_rules(&self) -> Result<Vec<Result<AlertRule, MalformedRule>>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM alert_rules WHERE active = 1 ORDER BY id ASC"
        ))?;

        let rules = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                Ok(rule_from_row(row).map_err(|source| MalformedRule { id, source }))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rules)
    }

    /// Enable or disable a rule.
    pub fn set_rule_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE alert_rules SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Clear the triggered flag. Cooldown bookkeeping is left untouched.
    pub fn acknowledge_rule(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE alert_rules SET triggered = 0 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Mark a rule triggered and append its event, as one transaction.
    ///
    /// The update only applies if the rule is still active and its stored
    /// `last_triggered_at` still denotes the instant the caller observed,
    /// whatever text form it was written in. Returns `None` when another
    /// writer got there first.
    pub fn record_trigger(
        &self,
        rule: &AlertRule,
        actual_value: f64,
        sample: &Sample,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, DbError> {
        let snapshot = serde_json::to_string(sample)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(bool, Option<String>)> = tx
            .query_row(
                "SELECT active, last_triggered_at FROM alert_rules WHERE id = ?1",
                params![rule.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((true, stored_raw)) = current else {
            return Ok(None);
        };
        if stored_raw.as_deref().map(parse_db_time) != rule.last_triggered_at.map(Some) {
            return Ok(None);
        }

        let updated = tx.execute(
            "UPDATE alert_rules
             SET triggered = 1, last_triggered_at = ?1, trigger_count = trigger_count + 1
             WHERE id = ?2 AND active = 1 AND last_triggered_at IS ?3",
            params![format_db_time(now), rule.id, stored_raw],
        )?;

        if updated == 0 {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO alert_events (alert_id, alert_name, metric, condition, threshold, actual_value, triggered_at, message, sample_snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rule.id,
                rule.name,
                rule.metric,
                rule.condition,
                rule.threshold,
                actual_value,
                format_db_time(now),
                rule.message,
                snapshot,
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.commit()?;

        Ok(Some(AlertEvent {
            id,
            alert_id: rule.id,
            alert_name: rule.name.clone(),
            metric: rule.metric.clone(),
            condition: rule.condition.clone(),
            threshold: rule.threshold,
            actual_value,
            triggered_at: now,
            message: rule.message.clone(),
            sample_snapshot: sample.clone(),
        }))
    }

    // --- Alert History ---

    /// Query trigger history, newest first, with totals and per-rule stats.
    pub fn query_alert_history(&self, filter: &HistoryFilter) -> Result<HistoryPage, DbError> {
        let limit = if filter.limit <= 0 {
            HistoryFilter::default().limit
        } else {
            filter.limit.min(MAX_HISTORY_PAGE)
        };
        let skip = filter.skip.max(0);

        let (where_clause, args) = history_where(filter);
        let conn = self.conn()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM alert_events {where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut page_args = args.clone();
        page_args.push(Value::Integer(limit));
        page_args.push(Value::Integer(skip));
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM alert_events {where_clause}
             ORDER BY triggered_at DESC, id DESC LIMIT ? OFFSET ?"
        ))?;
        let history = stmt
            .query_map(params_from_iter(page_args.iter()), event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT alert_name, COUNT(*), MAX(triggered_at) FROM alert_events {where_clause}
             GROUP BY alert_name ORDER BY COUNT(*) DESC, alert_name ASC"
        ))?;
        let stats = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(AlertStat {
                    alert_name: row.get(0)?,
                    count: row.get(1)?,
                    last_triggered: time_column(row, 2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(HistoryPage {
            history,
            pagination: Pagination {
                total,
                limit,
                skip,
                has_more: total > skip + limit,
            },
            stats,
        })
    }

    /// Delete history entries older than a date and/or belonging to one rule.
    ///
    /// At least one criterion is required so the whole log cannot be wiped
    /// by accident.
    pub fn delete_alert_history(
        &self,
        older_than: Option<DateTime<Utc>>,
        alert_id: Option<i64>,
    ) -> Result<usize, DbError> {
        let mut clauses = Vec::new();
        let mut args = Vec::new();

        if let Some(cutoff) = older_than {
            clauses.push("triggered_at < ?");
            args.push(Value::Text(format_db_time(cutoff)));
        }
        if let Some(id) = alert_id {
            clauses.push("alert_id = ?");
            args.push(Value::Integer(id));
        }

        if clauses.is_empty() {
            return Err(DbError::InvalidArgument(
                "must specify older_than or alert_id".to_string(),
            ));
        }

        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!("DELETE FROM alert_events WHERE {}", clauses.join(" AND ")),
            params_from_iter(args.iter()),
        )?;
        Ok(deleted)
    }
}

fn history_where(filter: &HistoryFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(id) = filter.alert_id {
        clauses.push("alert_id = ?");
        args.push(Value::Integer(id));
    }
    if let Some(metric) = &filter.metric {
        clauses.push("metric = ?");
        args.push(Value::Text(metric.clone()));
    }
    if let Some(start) = filter.start {
        clauses.push("triggered_at >= ?");
        args.push(Value::Text(format_db_time(start)));
    }
    if let Some(end) = filter.end {
        clauses.push("triggered_at <= ?");
        args.push(Value::Text(format_db_time(end)));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

fn rule_from_row(row: &Row<'_>) -> SqlResult<AlertRule> {
    let last_triggered_at = match row.get::<_, Option<String>>(10)? {
        Some(_) => Some(time_column(row, 10)?),
        None => None,
    };

    Ok(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        metric: row.get(2)?,
        condition: row.get(3)?,
        threshold: row.get(4)?,
        cooldown_seconds: row.get(5)?,
        active: row.get(6)?,
        message: row.get(7)?,
        actions: row.get(8)?,
        triggered: row.get(9)?,
        last_triggered_at,
        trigger_count: row.get(11)?,
    })
}

fn event_from_row(row: &Row<'_>) -> SqlResult<AlertEvent> {
    let snapshot: String = row.get(9)?;
    let sample_snapshot = serde_json::from_str(&snapshot)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    Ok(AlertEvent {
        id: row.get(0)?,
        alert_id: row.get(1)?,
        alert_name: row.get(2)?,
        metric: row.get(3)?,
        condition: row.get(4)?,
        threshold: row.get(5)?,
        actual_value: row.get(6)?,
        triggered_at: time_column(row, 7)?,
        message: row.get(8)?,
        sample_snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::temp_store;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn sample(power: f64) -> Sample {
        Sample {
            id: 1,
            time: t0(),
            power,
            voltage: 230.0,
            current: power / 230.0,
        }
    }

    fn rule(name: &str) -> AlertRule {
        AlertRule {
            name: name.to_string(),
            threshold: 1000.0,
            message: format!("{name} fired"),
            ..Default::default()
        }
    }

    #[test]
    fn test_rule_roundtrip_and_active_filter() {
        let (_tmp, store) = temp_store();

        let mut a = rule("a");
        let mut b = rule("b");
        b.active = false;
        store.insert_rule(&mut a).unwrap();
        store.insert_rule(&mut b).unwrap();

        let fetched = store.get_rule(a.id).unwrap();
        assert_eq!(fetched.name, "a");
        assert_eq!(fetched.last_triggered_at, None);

        let active = store.get_active_rules().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].as_ref().unwrap().id, a.id);

        store.set_rule_active(b.id, true).unwrap();
        let ids: Vec<i64> = store
            .get_active_rules()
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);

        assert!(matches!(store.get_rule(9999), Err(DbError::NotFound)));
        assert!(matches!(store.acknowledge_rule(9999), Err(DbError::NotFound)));
    }

    #[test]
    fn test_record_trigger_is_compare_and_set() {
        let (_tmp, store) = temp_store();
        let mut r = rule("overload");
        store.insert_rule(&mut r).unwrap();

        let first = store.record_trigger(&r, 1200.0, &sample(1200.0), t0()).unwrap();
        assert!(first.is_some());

        // A concurrent tick holding the same stale view loses the race.
        let second = store
            .record_trigger(&r, 1200.0, &sample(1200.0), t0() + ChronoDuration::seconds(1))
            .unwrap();
        assert!(second.is_none());

        let stored = store.get_rule(r.id).unwrap();
        assert!(stored.triggered);
        assert_eq!(stored.trigger_count, 1);
        assert_eq!(stored.last_triggered_at, Some(t0()));

        let page = store.query_alert_history(&HistoryFilter::default()).unwrap();
        assert_eq!(page.pagination.total, 1);
        assert_eq!(page.history[0].sample_snapshot, sample(1200.0));
    }

    #[test]
    fn test_malformed_rule_row_is_isolated() {
        let (_tmp, store) = temp_store();
        let mut good = rule("good");
        store.insert_rule(&mut good).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO alert_rules (name, metric, condition, threshold) VALUES ('bad', 'power', 'gt', 'abc')",
                [],
            )
            .unwrap();

        let rules = store.get_active_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].as_ref().unwrap().id, good.id);
        let bad = rules[1].as_ref().unwrap_err();
        assert_eq!(bad.id, good.id + 1);
    }

    #[test]
    fn test_record_trigger_matches_other_timestamp_spellings() {
        let (_tmp, store) = temp_store();
        let mut r = rule("overload");
        store.insert_rule(&mut r).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE alert_rules SET last_triggered_at = '2024-03-01 10:00:00' WHERE id = ?1",
                params![r.id],
            )
            .unwrap();

        let loaded = store.get_rule(r.id).unwrap();
        assert_eq!(loaded.last_triggered_at, Some(t0() - ChronoDuration::hours(2)));

        let event = store.record_trigger(&loaded, 1200.0, &sample(1200.0), t0()).unwrap();
        assert!(event.is_some());

        let stored = store.get_rule(r.id).unwrap();
        assert_eq!(stored.trigger_count, 1);
        assert_eq!(stored.last_triggered_at, Some(t0()));

        // The view from before the trigger is now stale.
        let stale = store
            .record_trigger(&loaded, 1200.0, &sample(1200.0), t0() + ChronoDuration::seconds(1))
            .unwrap();
        assert!(stale.is_none());
    }

    #[test]
    fn test_record_trigger_skips_inactive_rule() {
        let (_tmp, store) = temp_store();
        let mut r = rule("overload");
        store.insert_rule(&mut r).unwrap();
        store.set_rule_active(r.id, false).unwrap();

        let event = store.record_trigger(&r, 1200.0, &sample(1200.0), t0()).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_acknowledge_only_clears_flag() {
        let (_tmp, store) = temp_store();
        let mut r = rule("overload");
        store.insert_rule(&mut r).unwrap();
        store.record_trigger(&r, 1200.0, &sample(1200.0), t0()).unwrap();

        store.acknowledge_rule(r.id).unwrap();

        let stored = store.get_rule(r.id).unwrap();
        assert!(!stored.triggered);
        assert_eq!(stored.trigger_count, 1);
        assert_eq!(stored.last_triggered_at, Some(t0()));
    }

    #[test]
    fn test_history_filters_pagination_and_stats() {
        let (_tmp, store) = temp_store();
        let mut power = rule("power high");
        let mut volts = AlertRule {
            metric: "voltage".to_string(),
            cooldown_seconds: 0,
            ..rule("voltage high")
        };
        power.cooldown_seconds = 0;
        store.insert_rule(&mut power).unwrap();
        store.insert_rule(&mut volts).unwrap();

        for i in 0..3 {
            let now = t0() + ChronoDuration::minutes(i);
            let current = store.get_rule(power.id).unwrap();
            store.record_trigger(&current, 1100.0, &sample(1100.0), now).unwrap();
        }
        store
            .record_trigger(&volts, 260.0, &sample(500.0), t0() + ChronoDuration::minutes(10))
            .unwrap();

        let all = store.query_alert_history(&HistoryFilter::default()).unwrap();
        assert_eq!(all.pagination.total, 4);
        assert_eq!(all.history[0].alert_name, "voltage high");
        assert_eq!(all.stats.len(), 2);
        assert_eq!(all.stats[0].alert_name, "power high");
        assert_eq!(all.stats[0].count, 3);
        assert_eq!(all.stats[0].last_triggered, t0() + ChronoDuration::minutes(2));

        let page = store
            .query_alert_history(&HistoryFilter {
                alert_id: Some(power.id),
                limit: 2,
                skip: 0,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.history.len(), 2);
        assert_eq!(page.pagination.total, 3);
        assert!(page.pagination.has_more);

        let last = store
            .query_alert_history(&HistoryFilter {
                alert_id: Some(power.id),
                limit: 2,
                skip: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(last.history.len(), 1);
        assert!(!last.pagination.has_more);

        let by_metric = store
            .query_alert_history(&HistoryFilter {
                metric: Some("voltage".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_metric.pagination.total, 1);

        let ranged = store
            .query_alert_history(&HistoryFilter {
                start: Some(t0() + ChronoDuration::minutes(1)),
                end: Some(t0() + ChronoDuration::minutes(2)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(ranged.pagination.total, 2);
    }

    #[test]
    fn test_delete_history_requires_criterion() {
        let (_tmp, store) = temp_store();
        let mut r = rule("overload");
        store.insert_rule(&mut r).unwrap();
        store.record_trigger(&r, 1200.0, &sample(1200.0), t0()).unwrap();

        assert!(matches!(
            store.delete_alert_history(None, None),
            Err(DbError::InvalidArgument(_))
        ));

        let kept = store
            .delete_alert_history(Some(t0() - ChronoDuration::hours(1)), None)
            .unwrap();
        assert_eq!(kept, 0);

        let deleted = store.delete_alert_history(None, Some(r.id)).unwrap();
        assert_eq!(deleted, 1);
    }
}
