use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::ConsentMetadata;
use crate::audit::{AuditEventBuilder, AuditEventType, AuditSink};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::{from_row, tables, to_row, Filter, Query, Statement, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieCategory {
    Necessary,
    Functional,
    Analytics,
    Marketing,
    SocialMedia,
}

impl CookieCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Necessary => "necessary",
            Self::Functional => "functional",
            Self::Analytics => "analytics",
            Self::Marketing => "marketing",
            Self::SocialMedia => "social_media",
        }
    }
}

impl std::fmt::Display for CookieCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalog entry describing one cookie category. Configuration data, seeded
/// at construction, never user data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieCategoryInfo {
    pub category: CookieCategory,
    pub name: String,
    pub description: String,
    pub is_required: bool,
    pub cookies: Vec<CookieInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieInfo {
    pub name: String,
    pub purpose: String,
}

/// One banner interaction's current state, keyed by an opaque consent id.
/// May be bound to a subject, a session, a fingerprint, or none of the three.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConsentRecord {
    pub id: Uuid,
    pub subject_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub fingerprint: Option<String>,
    pub preferences: HashMap<CookieCategory, bool>,
    pub granted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
    #[serde(default)]
    pub metadata: ConsentMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieLogAction {
    Granted,
    Denied,
    Withdrawn,
}

impl CookieLogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Withdrawn => "withdrawn",
        }
    }
}

/// One per-category change, appended on every create/update/withdraw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConsentLogEntry {
    pub id: Uuid,
    pub consent_id: Uuid,
    pub category: CookieCategory,
    pub action: CookieLogAction,
    pub old_value: Option<bool>,
    pub new_value: bool,
    pub created_at: DateTime<Utc>,
}

/// Aggregate over the trailing window. Categories come from the catalog, not
/// from stored preference keys, so the grouping is bounded and stable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CookieConsentStatistics {
    pub window_days: i64,
    pub total_consents: u64,
    pub granted_by_category: HashMap<CookieCategory, u64>,
    pub denied_by_category: HashMap<CookieCategory, u64>,
    pub log_actions: HashMap<CookieCategory, HashMap<CookieLogAction, u64>>,
}

/// Cookie-category consent bound to a browser session or user. Structurally
/// similar to [`super::ConsentManager`] but keyed by opaque consent id and
/// carrying a per-category preference map.
pub struct CookieConsentManager {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    catalog: Vec<CookieCategoryInfo>,
}

impl CookieConsentManager {
    pub fn new(store: Arc<dyn Store>, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            audit,
            clock,
            catalog: default_categories(),
        }
    }

    /// Create a record for a first banner interaction. The `necessary`
    /// category is forced on regardless of the submitted preferences; one log
    /// row is written per category.
    pub async fn record_consent(
        &self,
        mut preferences: HashMap<CookieCategory, bool>,
        subject_id: Option<Uuid>,
        session_id: Option<String>,
        fingerprint: Option<String>,
        metadata: ConsentMetadata,
    ) -> Result<Uuid> {
        let now = self.clock.now();
        preferences.insert(CookieCategory::Necessary, true);

        let record = CookieConsentRecord {
            id: Uuid::new_v4(),
            subject_id,
            session_id,
            fingerprint,
            preferences: preferences.clone(),
            granted_at: now,
            updated_at: now,
            version: 1,
            metadata,
        };

        for (category, granted) in &preferences {
            self.append_log(record.id, *category, None, *granted, now)
                .await?;
        }
        self.store
            .execute(Statement::insert(tables::COOKIE_CONSENTS, to_row(&record)?))
            .await?;

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::CookieConsentRecorded, "cookie_consent", now)
                    .actor(subject_id)
                    .resource_id(record.id.to_string())
                    .detail("categories", preferences.len().to_string())
                    .build(),
            )
            .await;

        Ok(record.id)
    }

    /// Merge new preferences into an existing record. Only categories whose
    /// value actually changed get a log row; the version counter bumps once
    /// per call that changed anything. Attempts to revoke `necessary` are
    /// ignored.
    pub async fn update_consent(
        &self,
        consent_id: Uuid,
        preferences: HashMap<CookieCategory, bool>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut record = match self.get_record(consent_id).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        let mut changed = Vec::new();
        for (category, granted) in preferences {
            if category == CookieCategory::Necessary {
                continue;
            }
            let old = record.preferences.get(&category).copied();
            if old != Some(granted) {
                record.preferences.insert(category, granted);
                changed.push((category, old, granted));
            }
        }

        if changed.is_empty() {
            return Ok(true);
        }

        for (category, old, new) in &changed {
            self.append_log(consent_id, *category, *old, *new, now).await?;
        }

        record.version += 1;
        record.updated_at = now;
        self.store
            .execute(Statement::update(
                tables::COOKIE_CONSENTS,
                Filter::new().eq_uuid("id", consent_id),
                to_row(&record)?,
            ))
            .await?;

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::CookieConsentUpdated, "cookie_consent", now)
                    .resource_id(consent_id.to_string())
                    .detail("changed", changed.len().to_string())
                    .detail("version", record.version.to_string())
                    .build(),
            )
            .await;

        Ok(true)
    }

    /// Default-deny: unknown id or unset category both read as false.
    pub async fn check_category_consent(
        &self,
        consent_id: Uuid,
        category: CookieCategory,
    ) -> Result<bool> {
        Ok(self
            .get_record(consent_id)
            .await?
            .and_then(|record| record.preferences.get(&category).copied())
            .unwrap_or(false))
    }

    /// Revoke the given categories, or every non-required catalog category
    /// when none are given. Required categories are always skipped.
    pub async fn withdraw_consent(
        &self,
        consent_id: Uuid,
        categories: Option<Vec<CookieCategory>>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut record = match self.get_record(consent_id).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        let targets: Vec<CookieCategory> = match categories {
            Some(categories) => categories,
            None => self
                .catalog
                .iter()
                .filter(|info| !info.is_required)
                .map(|info| info.category)
                .collect(),
        };

        let required: Vec<CookieCategory> = self
            .catalog
            .iter()
            .filter(|info| info.is_required)
            .map(|info| info.category)
            .collect();

        let mut changed = 0usize;
        for category in targets {
            if required.contains(&category) {
                continue;
            }
            let old = record.preferences.get(&category).copied();
            if old == Some(true) {
                record.preferences.insert(category, false);
                let entry = CookieConsentLogEntry {
                    id: Uuid::new_v4(),
                    consent_id,
                    category,
                    action: CookieLogAction::Withdrawn,
                    old_value: old,
                    new_value: false,
                    created_at: now,
                };
                self.store
                    .execute(Statement::insert(tables::COOKIE_CONSENT_LOG, to_row(&entry)?))
                    .await?;
                changed += 1;
            }
        }

        if changed > 0 {
            record.version += 1;
            record.updated_at = now;
            self.store
                .execute(Statement::update(
                    tables::COOKIE_CONSENTS,
                    Filter::new().eq_uuid("id", consent_id),
                    to_row(&record)?,
                ))
                .await?;
        }

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::CookieConsentWithdrawn, "cookie_consent", now)
                    .resource_id(consent_id.to_string())
                    .detail("withdrawn", changed.to_string())
                    .build(),
            )
            .await;

        Ok(true)
    }

    pub fn get_cookie_categories(&self) -> &[CookieCategoryInfo] {
        &self.catalog
    }

    /// Approximate aggregate over the trailing window; no snapshot guarantee.
    pub async fn get_consent_statistics(&self, days: i64) -> Result<CookieConsentStatistics> {
        let cutoff = self.clock.now() - chrono::Duration::days(days);

        let records = self
            .store
            .fetch_all(Query::new(
                tables::COOKIE_CONSENTS,
                Filter::new().ge("granted_at", crate::store::datetime_value(cutoff)),
            ))
            .await?;

        let mut stats = CookieConsentStatistics {
            window_days: days,
            total_consents: records.len() as u64,
            ..Default::default()
        };

        for row in records {
            let record: CookieConsentRecord = from_row(tables::COOKIE_CONSENTS, row)?;
            for info in &self.catalog {
                match record.preferences.get(&info.category) {
                    Some(true) => *stats.granted_by_category.entry(info.category).or_insert(0) += 1,
                    Some(false) => *stats.denied_by_category.entry(info.category).or_insert(0) += 1,
                    None => {}
                }
            }
        }

        let log_rows = self
            .store
            .fetch_all(Query::new(
                tables::COOKIE_CONSENT_LOG,
                Filter::new().ge("created_at", crate::store::datetime_value(cutoff)),
            ))
            .await?;
        for row in log_rows {
            let entry: CookieConsentLogEntry = from_row(tables::COOKIE_CONSENT_LOG, row)?;
            // Grouping is fixed to the catalog set; stray categories from
            // older schema versions are not counted.
            if self.catalog.iter().any(|info| info.category == entry.category) {
                *stats
                    .log_actions
                    .entry(entry.category)
                    .or_default()
                    .entry(entry.action)
                    .or_insert(0) += 1;
            }
        }

        Ok(stats)
    }

    /// Delete anonymous records older than the window. Subject-bound records
    /// are never touched here; those go through DSAR erasure or the
    /// "consents" retention rule.
    pub async fn cleanup_old_consents(&self, days: i64) -> Result<u64> {
        let cutoff = self.clock.now() - chrono::Duration::days(days);
        let deleted = self
            .store
            .execute(Statement::delete(
                tables::COOKIE_CONSENTS,
                Filter::new()
                    .is_null("subject_id")
                    .before("granted_at", cutoff),
            ))
            .await?;

        if deleted > 0 {
            log::info!("removed {deleted} anonymous cookie consents older than {days} days");
        }
        Ok(deleted)
    }

    pub async fn get_record(&self, consent_id: Uuid) -> Result<Option<CookieConsentRecord>> {
        let row = self
            .store
            .fetch_one(Query::new(
                tables::COOKIE_CONSENTS,
                Filter::new().eq_uuid("id", consent_id),
            ))
            .await?;
        row.map(|row| Ok(from_row(tables::COOKIE_CONSENTS, row)?))
            .transpose()
    }

    async fn append_log(
        &self,
        consent_id: Uuid,
        category: CookieCategory,
        old_value: Option<bool>,
        new_value: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = CookieConsentLogEntry {
            id: Uuid::new_v4(),
            consent_id,
            category,
            action: if new_value {
                CookieLogAction::Granted
            } else {
                CookieLogAction::Denied
            },
            old_value,
            new_value,
            created_at: now,
        };
        self.store
            .execute(Statement::insert(tables::COOKIE_CONSENT_LOG, to_row(&entry)?))
            .await?;
        Ok(())
    }
}

fn default_categories() -> Vec<CookieCategoryInfo> {
    vec![
        CookieCategoryInfo {
            category: CookieCategory::Necessary,
            name: "Necessary".to_string(),
            description: "Essential cookies required for the site to function.".to_string(),
            is_required: true,
            cookies: vec![
                CookieInfo {
                    name: "session_id".to_string(),
                    purpose: "Session management".to_string(),
                },
                CookieInfo {
                    name: "csrf_token".to_string(),
                    purpose: "Request forgery protection".to_string(),
                },
            ],
        },
        CookieCategoryInfo {
            category: CookieCategory::Functional,
            name: "Functional".to_string(),
            description: "Cookies that remember preferences and settings.".to_string(),
            is_required: false,
            cookies: vec![CookieInfo {
                name: "locale".to_string(),
                purpose: "Language preference".to_string(),
            }],
        },
        CookieCategoryInfo {
            category: CookieCategory::Analytics,
            name: "Analytics".to_string(),
            description: "Cookies that help us understand how the site is used.".to_string(),
            is_required: false,
            cookies: vec![CookieInfo {
                name: "_visit".to_string(),
                purpose: "Usage measurement".to_string(),
            }],
        },
        CookieCategoryInfo {
            category: CookieCategory::Marketing,
            name: "Marketing".to_string(),
            description: "Cookies used to deliver relevant advertisements.".to_string(),
            is_required: false,
            cookies: vec![],
        },
        CookieCategoryInfo {
            category: CookieCategory::SocialMedia,
            name: "Social media".to_string(),
            description: "Cookies set by embedded social-media content.".to_string(),
            is_required: false,
            cookies: vec![],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn setup() -> (CookieConsentManager, Arc<MemoryStore>, Arc<FixedClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let manager = CookieConsentManager::new(
            store.clone(),
            Arc::new(MemoryAuditSink::default()),
            clock.clone(),
        );
        (manager, store, clock)
    }

    fn prefs(pairs: &[(CookieCategory, bool)]) -> HashMap<CookieCategory, bool> {
        pairs.iter().copied().collect()
    }

    #[tokio::test]
    async fn update_diffs_and_bumps_version_once() {
        let (manager, store, _clock) = setup();

        let id = manager
            .record_consent(
                prefs(&[(CookieCategory::Analytics, true), (CookieCategory::Marketing, false)]),
                None,
                Some("sess-1".into()),
                None,
                ConsentMetadata::default(),
            )
            .await
            .unwrap();
        let created_logs = store.table_len(tables::COOKIE_CONSENT_LOG).await;

        assert!(manager
            .update_consent(id, prefs(&[(CookieCategory::Marketing, true)]))
            .await
            .unwrap());

        let record = manager.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert!(manager
            .check_category_consent(id, CookieCategory::Analytics)
            .await
            .unwrap());
        assert!(manager
            .check_category_consent(id, CookieCategory::Marketing)
            .await
            .unwrap());

        // Exactly one log row for the one changed category.
        assert_eq!(store.table_len(tables::COOKIE_CONSENT_LOG).await, created_logs + 1);
    }

    #[tokio::test]
    async fn necessary_category_cannot_be_revoked() {
        let (manager, _store, _clock) = setup();

        let id = manager
            .record_consent(
                prefs(&[(CookieCategory::Necessary, false)]),
                None,
                None,
                None,
                ConsentMetadata::default(),
            )
            .await
            .unwrap();
        assert!(manager
            .check_category_consent(id, CookieCategory::Necessary)
            .await
            .unwrap());

        manager
            .update_consent(id, prefs(&[(CookieCategory::Necessary, false)]))
            .await
            .unwrap();
        assert!(manager
            .check_category_consent(id, CookieCategory::Necessary)
            .await
            .unwrap());

        manager.withdraw_consent(id, None).await.unwrap();
        assert!(manager
            .check_category_consent(id, CookieCategory::Necessary)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unknown_id_is_default_deny() {
        let (manager, _store, _clock) = setup();
        assert!(!manager
            .check_category_consent(Uuid::new_v4(), CookieCategory::Analytics)
            .await
            .unwrap());
        assert!(!manager
            .update_consent(Uuid::new_v4(), prefs(&[(CookieCategory::Analytics, true)]))
            .await
            .unwrap());
        assert!(!manager.withdraw_consent(Uuid::new_v4(), None).await.unwrap());
    }

    #[tokio::test]
    async fn withdraw_revokes_every_optional_category() {
        let (manager, _store, _clock) = setup();

        let id = manager
            .record_consent(
                prefs(&[
                    (CookieCategory::Analytics, true),
                    (CookieCategory::Marketing, true),
                    (CookieCategory::Functional, true),
                ]),
                Some(Uuid::new_v4()),
                None,
                None,
                ConsentMetadata::default(),
            )
            .await
            .unwrap();

        assert!(manager.withdraw_consent(id, None).await.unwrap());

        for category in [
            CookieCategory::Analytics,
            CookieCategory::Marketing,
            CookieCategory::Functional,
        ] {
            assert!(!manager.check_category_consent(id, category).await.unwrap());
        }
        assert!(manager
            .check_category_consent(id, CookieCategory::Necessary)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cleanup_spares_subject_bound_records() {
        let (manager, store, clock) = setup();

        manager
            .record_consent(prefs(&[]), None, Some("old-anon".into()), None, ConsentMetadata::default())
            .await
            .unwrap();
        manager
            .record_consent(prefs(&[]), Some(Uuid::new_v4()), None, None, ConsentMetadata::default())
            .await
            .unwrap();

        clock.advance(Duration::days(400));
        manager
            .record_consent(prefs(&[]), None, Some("new-anon".into()), None, ConsentMetadata::default())
            .await
            .unwrap();

        let deleted = manager.cleanup_old_consents(365).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.table_len(tables::COOKIE_CONSENTS).await, 2);
    }

    #[tokio::test]
    async fn statistics_group_by_catalog_categories() {
        let (manager, _store, _clock) = setup();

        manager
            .record_consent(
                prefs(&[(CookieCategory::Analytics, true), (CookieCategory::Marketing, false)]),
                None,
                None,
                None,
                ConsentMetadata::default(),
            )
            .await
            .unwrap();
        let second = manager
            .record_consent(
                prefs(&[(CookieCategory::Analytics, true)]),
                None,
                None,
                None,
                ConsentMetadata::default(),
            )
            .await
            .unwrap();
        manager
            .withdraw_consent(second, Some(vec![CookieCategory::Analytics]))
            .await
            .unwrap();

        let stats = manager.get_consent_statistics(30).await.unwrap();
        assert_eq!(stats.total_consents, 2);
        assert_eq!(stats.granted_by_category[&CookieCategory::Analytics], 1);
        assert_eq!(stats.denied_by_category[&CookieCategory::Marketing], 1);
        assert_eq!(stats.granted_by_category[&CookieCategory::Necessary], 2);

        // Log actions keep both dimensions: category and action.
        let analytics = &stats.log_actions[&CookieCategory::Analytics];
        assert_eq!(analytics[&CookieLogAction::Granted], 2);
        assert_eq!(analytics[&CookieLogAction::Withdrawn], 1);
        assert_eq!(
            stats.log_actions[&CookieCategory::Marketing][&CookieLogAction::Denied],
            1
        );
    }

    #[tokio::test]
    async fn catalog_is_seeded_with_required_flag() {
        let (manager, _store, _clock) = setup();
        let catalog = manager.get_cookie_categories();
        assert_eq!(catalog.len(), 5);

        let necessary = catalog
            .iter()
            .find(|info| info.category == CookieCategory::Necessary)
            .unwrap();
        assert!(necessary.is_required);
        assert!(!necessary.cookies.is_empty());
        assert!(catalog
            .iter()
            .filter(|info| info.category != CookieCategory::Necessary)
            .all(|info| !info.is_required));
    }
}
