use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::anonymizer::DataAnonymizer;
use crate::audit::{AuditEventBuilder, AuditEventType, AuditSink};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::{
    from_row, tables, to_row, Filter, Order, Query, Row, Statement, Store,
};
use serde_json::Value;

/// Data categories retention rules apply to. One active rule per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Profile,
    Activity,
    Communication,
    Transactions,
    Analytics,
    Logs,
    Sessions,
    Devices,
    Cookies,
    Consents,
    Backups,
}

impl DataCategory {
    pub const ALL: [DataCategory; 11] = [
        Self::Profile,
        Self::Activity,
        Self::Communication,
        Self::Transactions,
        Self::Analytics,
        Self::Logs,
        Self::Sessions,
        Self::Devices,
        Self::Cookies,
        Self::Consents,
        Self::Backups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Activity => "activity",
            Self::Communication => "communication",
            Self::Transactions => "transactions",
            Self::Analytics => "analytics",
            Self::Logs => "logs",
            Self::Sessions => "sessions",
            Self::Devices => "devices",
            Self::Cookies => "cookies",
            Self::Consents => "consents",
            Self::Backups => "backups",
        }
    }
}

impl std::fmt::Display for DataCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How long a category's data lives. `Indefinite` and `LegalHold` never
/// select anything during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    #[serde(rename = "immediate")]
    Immediate,
    #[serde(rename = "days_30")]
    Days30,
    #[serde(rename = "days_90")]
    Days90,
    #[serde(rename = "days_180")]
    Days180,
    #[serde(rename = "days_365")]
    Days365,
    #[serde(rename = "years_2")]
    Years2,
    #[serde(rename = "years_7")]
    Years7,
    #[serde(rename = "indefinite")]
    Indefinite,
    #[serde(rename = "legal_hold")]
    LegalHold,
}

impl RetentionPolicy {
    /// Fixed day-count table; `None` means an infinite cutoff.
    pub fn duration_days(&self) -> Option<i64> {
        match self {
            Self::Immediate => Some(0),
            Self::Days30 => Some(30),
            Self::Days90 => Some(90),
            Self::Days180 => Some(180),
            Self::Days365 => Some(365),
            Self::Years2 => Some(730),
            Self::Years7 => Some(2555),
            Self::Indefinite | Self::LegalHold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionActionKind {
    Delete,
    Anonymize,
    Archive,
}

impl RetentionActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Anonymize => "anonymize",
            Self::Archive => "archive",
        }
    }
}

/// The active rule for one category. Upserted by category, never appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRule {
    pub id: Uuid,
    pub category: DataCategory,
    pub policy: RetentionPolicy,
    pub action: RetentionActionKind,
    pub conditions: Option<HashMap<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Suspends retention and erasure for (subject, data_type) until released.
/// `hold_until = None` never expires; a past `hold_until` makes the hold
/// inert without deleting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalHold {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub data_type: String,
    pub reason: String,
    pub hold_until: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LegalHold {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.hold_until.map(|until| until > now).unwrap_or(true)
    }
}

/// Record of one executed (non-dry-run) sweep action; feeds the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionActionRecord {
    pub id: Uuid,
    pub category: DataCategory,
    pub action: RetentionActionKind,
    pub affected: u64,
    pub executed_at: DateTime<Utc>,
}

/// Outcome of one sweep pass. A category that failed appears in `failures`
/// and not in `counts`; the rest of the pass still ran.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub dry_run: bool,
    pub counts: HashMap<DataCategory, u64>,
    pub failures: HashMap<DataCategory, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub policies: Vec<RetentionRule>,
    pub active_legal_holds: u64,
    pub recent_actions: Vec<RetentionActionRecord>,
}

/// Where each category's rows live and how the sweep selects them.
struct CategoryTarget {
    table: &'static str,
    timestamp_column: &'static str,
    /// Column holding the row's subject id, when the table is subject-scoped.
    /// Sweeps skip rows whose subject has an active legal hold.
    subject_column: Option<&'static str>,
    /// Extra fixed conditions on top of the cutoff.
    refine: fn(Filter) -> Filter,
}

fn target_for(category: DataCategory) -> CategoryTarget {
    fn plain(filter: Filter) -> Filter {
        filter
    }
    fn anonymous_only(filter: Filter) -> Filter {
        filter.is_null("subject_id")
    }
    fn settled_consents(filter: Filter) -> Filter {
        filter.is_in(
            "status",
            vec!["withdrawn".into(), "expired".into(), "denied".into()],
        )
    }
    fn deactivated_users(filter: Filter) -> Filter {
        filter.is_not_null("deactivated_at")
    }

    match category {
        DataCategory::Profile => CategoryTarget {
            table: tables::USERS,
            timestamp_column: "deactivated_at",
            subject_column: Some("id"),
            refine: deactivated_users,
        },
        DataCategory::Activity => CategoryTarget {
            table: tables::ACTIVITY_LOG,
            timestamp_column: "created_at",
            subject_column: Some("subject_id"),
            refine: plain,
        },
        DataCategory::Communication => CategoryTarget {
            table: tables::MESSAGES,
            timestamp_column: "created_at",
            subject_column: Some("subject_id"),
            refine: plain,
        },
        DataCategory::Transactions => CategoryTarget {
            table: tables::TRANSACTIONS,
            timestamp_column: "created_at",
            subject_column: Some("subject_id"),
            refine: plain,
        },
        DataCategory::Analytics => CategoryTarget {
            table: tables::ANALYTICS_EVENTS,
            timestamp_column: "created_at",
            subject_column: Some("subject_id"),
            refine: plain,
        },
        DataCategory::Logs => CategoryTarget {
            table: tables::SYSTEM_LOGS,
            timestamp_column: "created_at",
            subject_column: None,
            refine: plain,
        },
        DataCategory::Sessions => CategoryTarget {
            table: tables::SESSIONS,
            timestamp_column: "created_at",
            subject_column: Some("subject_id"),
            refine: plain,
        },
        DataCategory::Devices => CategoryTarget {
            table: tables::DEVICES,
            timestamp_column: "last_active_at",
            subject_column: Some("subject_id"),
            refine: plain,
        },
        DataCategory::Cookies => CategoryTarget {
            table: tables::COOKIE_CONSENTS,
            timestamp_column: "granted_at",
            subject_column: None,
            refine: anonymous_only,
        },
        DataCategory::Consents => CategoryTarget {
            table: tables::CONSENT_RECORDS,
            timestamp_column: "updated_at",
            subject_column: Some("subject_id"),
            refine: settled_consents,
        },
        DataCategory::Backups => CategoryTarget {
            table: tables::BACKUPS,
            timestamp_column: "created_at",
            subject_column: None,
            refine: plain,
        },
    }
}

/// Evaluates per-category retention policy and legal holds, and performs the
/// scheduled delete/anonymize/archive sweeps. Owns `retention_rules` and
/// `legal_holds`; everything else only reads hold state through
/// [`RetentionManager::check_legal_hold`].
pub struct RetentionManager {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    anonymizer: Arc<DataAnonymizer>,
    rules: Arc<RwLock<HashMap<DataCategory, RetentionRule>>>,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        anonymizer: Arc<DataAnonymizer>,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            anonymizer,
            rules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Populate the in-memory rule cache from the store. Call once at
    /// startup; `add_retention_rule` keeps it current afterwards.
    pub async fn load_rules(&self) -> Result<usize> {
        let rows = self
            .store
            .fetch_all(Query::new(tables::RETENTION_RULES, Filter::all()))
            .await?;

        let mut loaded = HashMap::new();
        for row in rows {
            let rule: RetentionRule = from_row(tables::RETENTION_RULES, row)?;
            loaded.insert(rule.category, rule);
        }
        let count = loaded.len();
        *self.rules.write().await = loaded;
        Ok(count)
    }

    /// Upsert the rule for a category. The persisted row and the cache entry
    /// are replaced together under the cache write lock.
    pub async fn add_retention_rule(
        &self,
        category: DataCategory,
        policy: RetentionPolicy,
        action: RetentionActionKind,
        conditions: Option<HashMap<String, Value>>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut rules = self.rules.write().await;

        let rule = RetentionRule {
            id: rules
                .get(&category)
                .map(|existing| existing.id)
                .unwrap_or_else(Uuid::new_v4),
            category,
            policy,
            action,
            conditions,
            created_at: rules
                .get(&category)
                .map(|existing| existing.created_at)
                .unwrap_or(now),
            updated_at: now,
        };

        let updated = self
            .store
            .execute(Statement::update(
                tables::RETENTION_RULES,
                Filter::new().eq("category", category.as_str()),
                to_row(&rule)?,
            ))
            .await?;
        if updated == 0 {
            self.store
                .execute(Statement::insert(tables::RETENTION_RULES, to_row(&rule)?))
                .await?;
        }
        rules.insert(category, rule);
        drop(rules);

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::RetentionRuleChanged, "retention_rule", now)
                    .resource_id(category.as_str())
                    .detail("policy", format!("{policy:?}"))
                    .detail("action", action.as_str())
                    .build(),
            )
            .await;

        Ok(true)
    }

    pub async fn get_rules(&self) -> Vec<RetentionRule> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Run every configured category's sweep. A failure in one category is
    /// recorded and does not abort the others. Dry-run evaluates the exact
    /// selection the mutating path would use and only skips the writes, so
    /// its counts are a reliable preview.
    pub async fn apply_retention_policies(&self, dry_run: bool) -> Result<SweepReport> {
        let rules: Vec<RetentionRule> = {
            let cache = self.rules.read().await;
            let mut rules: Vec<RetentionRule> = cache.values().cloned().collect();
            rules.sort_by_key(|rule| rule.category.as_str());
            rules
        };

        let mut report = SweepReport {
            dry_run,
            ..Default::default()
        };

        for rule in rules {
            match self.sweep_category(&rule, dry_run).await {
                Ok(affected) => {
                    report.counts.insert(rule.category, affected);
                    if !dry_run && affected > 0 {
                        self.record_action(&rule, affected).await;
                    }
                }
                Err(e) => {
                    log::warn!("retention sweep failed for {}: {e}", rule.category);
                    report.failures.insert(rule.category, e.to_string());
                }
            }
        }

        Ok(report)
    }

    /// Insert a hold. Multiple holds per (subject, data_type) are allowed and
    /// are released independently.
    pub async fn place_legal_hold(
        &self,
        subject_id: Uuid,
        data_type: &str,
        reason: &str,
        hold_until: Option<DateTime<Utc>>,
        created_by: Option<Uuid>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let hold = LegalHold {
            id: Uuid::new_v4(),
            subject_id,
            data_type: data_type.to_string(),
            reason: reason.to_string(),
            hold_until,
            created_by,
            created_at: now,
        };
        self.store
            .execute(Statement::insert(tables::LEGAL_HOLDS, to_row(&hold)?))
            .await?;

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::LegalHoldPlaced, "legal_hold", now)
                    .subject(subject_id)
                    .actor(created_by)
                    .resource_id(hold.id.to_string())
                    .detail("data_type", data_type)
                    .detail("reason", reason)
                    .build(),
            )
            .await;
        Ok(true)
    }

    /// True when at least one matching hold is active: `hold_until` unset or
    /// in the future. Callers check and then act; a hold placed between the
    /// two is caught by periodic audit, not locking.
    pub async fn check_legal_hold(&self, subject_id: Uuid, data_type: Option<&str>) -> Result<bool> {
        let now = self.clock.now();
        let mut filter = Filter::new().eq_uuid("subject_id", subject_id);
        if let Some(data_type) = data_type {
            filter = filter.eq("data_type", data_type);
        }

        let rows = self
            .store
            .fetch_all(Query::new(tables::LEGAL_HOLDS, filter))
            .await?;
        for row in rows {
            let hold: LegalHold = from_row(tables::LEGAL_HOLDS, row)?;
            if hold.is_active(now) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete matching holds; omitting `data_type` releases every hold for
    /// the subject. Returns false when nothing matched.
    pub async fn release_legal_hold(
        &self,
        subject_id: Uuid,
        data_type: Option<&str>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut filter = Filter::new().eq_uuid("subject_id", subject_id);
        if let Some(data_type) = data_type {
            filter = filter.eq("data_type", data_type);
        }

        let released = self
            .store
            .execute(Statement::delete(tables::LEGAL_HOLDS, filter))
            .await?;
        if released == 0 {
            return Ok(false);
        }

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::LegalHoldReleased, "legal_hold", now)
                    .subject(subject_id)
                    .detail("data_type", data_type.unwrap_or("*"))
                    .detail("released", released.to_string())
                    .build(),
            )
            .await;
        Ok(true)
    }

    /// Operational summary: configured policies, active hold count, and the
    /// most recent executed sweep actions.
    pub async fn get_retention_report(&self) -> Result<RetentionReport> {
        let now = self.clock.now();
        let policies = {
            let mut policies: Vec<RetentionRule> = self.rules.read().await.values().cloned().collect();
            policies.sort_by_key(|rule| rule.category.as_str());
            policies
        };

        let hold_rows = self
            .store
            .fetch_all(Query::new(tables::LEGAL_HOLDS, Filter::all()))
            .await?;
        let mut active_legal_holds = 0u64;
        for row in hold_rows {
            let hold: LegalHold = from_row(tables::LEGAL_HOLDS, row)?;
            if hold.is_active(now) {
                active_legal_holds += 1;
            }
        }

        let action_rows = self
            .store
            .fetch_all(
                Query::new(tables::RETENTION_ACTIONS, Filter::all())
                    .order_by("executed_at", Order::Desc)
                    .limit(20),
            )
            .await?;
        let recent_actions = action_rows
            .into_iter()
            .map(|row| Ok(from_row(tables::RETENTION_ACTIONS, row)?))
            .collect::<Result<Vec<_>>>()?;

        Ok(RetentionReport {
            policies,
            active_legal_holds,
            recent_actions,
        })
    }

    /// Subjects with an active hold for this category; sweeps skip their rows.
    async fn held_subjects(&self, category: DataCategory) -> Result<HashSet<String>> {
        let now = self.clock.now();
        let rows = self
            .store
            .fetch_all(Query::new(
                tables::LEGAL_HOLDS,
                Filter::new().eq("data_type", category.as_str()),
            ))
            .await?;

        let mut held = HashSet::new();
        for row in rows {
            let hold: LegalHold = from_row(tables::LEGAL_HOLDS, row)?;
            if hold.is_active(now) {
                held.insert(hold.subject_id.to_string());
            }
        }
        Ok(held)
    }

    async fn sweep_category(&self, rule: &RetentionRule, dry_run: bool) -> Result<u64> {
        let days = match rule.policy.duration_days() {
            Some(days) => days,
            // Indefinite and legal-hold policies never select anything.
            None => return Ok(0),
        };
        let cutoff = self.clock.now() - Duration::days(days);
        let target = target_for(rule.category);

        let mut filter = (target.refine)(
            Filter::new().before(target.timestamp_column, cutoff),
        );
        // Already-tokenized rows stay out of the candidate set, so dry-run,
        // counts and the mutation all share one re-entrant predicate.
        if rule.action == RetentionActionKind::Anonymize {
            filter = filter.ne("anonymized", true);
        }
        if let Some(conditions) = &rule.conditions {
            for (column, value) in conditions {
                filter = filter.eq(column, value.clone());
            }
        }

        let candidates = self
            .store
            .fetch_all(Query::new(target.table, filter))
            .await?;

        // Drop rows whose subject is under an active hold for this category.
        let eligible: Vec<Row> = if let Some(subject_column) = target.subject_column {
            let held = self.held_subjects(rule.category).await?;
            candidates
                .into_iter()
                .filter(|row| {
                    row.get(subject_column)
                        .and_then(Value::as_str)
                        .map(|subject| !held.contains(subject))
                        .unwrap_or(true)
                })
                .collect()
        } else {
            candidates
        };

        let affected = eligible.len() as u64;
        if dry_run || affected == 0 {
            return Ok(affected);
        }

        match rule.action {
            RetentionActionKind::Delete => {
                let ids = row_ids(&eligible);
                self.store
                    .execute(Statement::delete(target.table, Filter::new().is_in("id", ids)))
                    .await?;
            }
            RetentionActionKind::Archive => {
                // Copy first, delete after: a crash in between leaves a
                // duplicate in the archive, never a lost row.
                let archive_table = archive_table_for(target.table);
                for row in &eligible {
                    self.store
                        .execute(Statement::insert(&archive_table, row.clone()))
                        .await?;
                }
                let ids = row_ids(&eligible);
                self.store
                    .execute(Statement::delete(target.table, Filter::new().is_in("id", ids)))
                    .await?;
            }
            RetentionActionKind::Anonymize => {
                let subject_column = target.subject_column.unwrap_or("subject_id");
                for row in &eligible {
                    let Some(id) = row.get("id").cloned() else { continue };
                    let token = row
                        .get(subject_column)
                        .and_then(Value::as_str)
                        .map(|subject| self.anonymizer.pseudonymize(subject, rule.category.as_str()))
                        .unwrap_or_default();

                    let mut changes = Row::new();
                    changes.insert(subject_column.to_string(), Value::String(token));
                    changes.insert("anonymized".to_string(), Value::Bool(true));
                    self.store
                        .execute(Statement::update(
                            target.table,
                            Filter::new().eq("id", id),
                            changes,
                        ))
                        .await?;
                }
            }
        }

        Ok(affected)
    }

    async fn record_action(&self, rule: &RetentionRule, affected: u64) {
        let now = self.clock.now();
        let record = RetentionActionRecord {
            id: Uuid::new_v4(),
            category: rule.category,
            action: rule.action,
            affected,
            executed_at: now,
        };
        if let Ok(row) = to_row(&record) {
            if let Err(e) = self
                .store
                .execute(Statement::insert(tables::RETENTION_ACTIONS, row))
                .await
            {
                log::warn!("failed to record retention action: {e}");
            }
        }

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::RetentionSweep, "retention", now)
                    .resource_id(rule.category.as_str())
                    .detail("action", rule.action.as_str())
                    .detail("affected", affected.to_string())
                    .build(),
            )
            .await;
    }
}

fn row_ids(rows: &[Row]) -> Vec<Value> {
    rows.iter().filter_map(|row| row.get("id").cloned()).collect()
}

fn archive_table_for(table: &str) -> String {
    match table {
        tables::CONSENT_RECORDS => tables::CONSENTS_ARCHIVE.to_string(),
        other => format!("{other}_archive"),
    }
}
