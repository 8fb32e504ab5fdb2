pub mod cookie;

pub use cookie::{
    CookieCategory, CookieCategoryInfo, CookieConsentManager, CookieConsentRecord,
    CookieConsentStatistics,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEventBuilder, AuditEventType, AuditSink};
use crate::cache::ConsentCache;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::{from_row, tables, to_row, Filter, Order, Query, Statement, Store};

/// Purposes a subject can grant or deny independently. Serialized names are
/// part of the storage contract: adding a purpose is additive, renaming one
/// is a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentPurpose {
    Marketing,
    Analytics,
    Personalization,
    ThirdParty,
    Cookies,
    Email,
    Sms,
    DataProcessing,
}

impl ConsentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Marketing => "marketing",
            Self::Analytics => "analytics",
            Self::Personalization => "personalization",
            Self::ThirdParty => "third_party",
            Self::Cookies => "cookies",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::DataProcessing => "data_processing",
        }
    }
}

impl std::fmt::Display for ConsentPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Granted,
    Denied,
    Withdrawn,
    Expired,
    Pending,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Withdrawn => "withdrawn",
            Self::Expired => "expired",
            Self::Pending => "pending",
        }
    }
}

impl std::fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where and how the consent was captured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub consent_document_id: Option<String>,
}

/// Current consent state for one (subject, purpose). At most one of these
/// exists per pair; superseded states live in `consent_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub purpose: ConsentPurpose,
    pub status: ConsentStatus,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: ConsentMetadata,
}

/// One status transition. Written before the record itself so a partial
/// failure can leave an extra history row but never an unaudited transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentHistoryEntry {
    pub id: Uuid,
    pub consent_id: Uuid,
    pub subject_id: Uuid,
    pub purpose: ConsentPurpose,
    pub old_status: Option<ConsentStatus>,
    pub new_status: ConsentStatus,
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: ConsentMetadata,
    pub created_at: DateTime<Utc>,
}

/// Tracks per-subject, per-purpose consent and its full history. The only
/// writer of `consent_records` and `consent_history`.
pub struct ConsentManager {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    cache: Option<Arc<dyn ConsentCache>>,
}

impl ConsentManager {
    pub fn new(store: Arc<dyn Store>, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            audit,
            clock,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ConsentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Upsert the current record for (subject, purpose). A history row is
    /// appended only when the status actually changes, so history row count
    /// equals the number of status-changing calls.
    pub async fn record_consent(
        &self,
        subject_id: Uuid,
        purpose: ConsentPurpose,
        status: ConsentStatus,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<ConsentMetadata>,
    ) -> Result<ConsentRecord> {
        let now = self.clock.now();
        let metadata = metadata.unwrap_or_default();
        let existing = self.current_record(subject_id, purpose).await?;

        let record = match existing {
            None => {
                let record = ConsentRecord {
                    id: Uuid::new_v4(),
                    subject_id,
                    purpose,
                    status,
                    granted_at: now,
                    expires_at,
                    updated_at: now,
                    withdrawn_at: None,
                    metadata: metadata.clone(),
                };
                self.append_history(&record, None, status, None, metadata.clone(), now)
                    .await?;
                self.store
                    .execute(Statement::insert(tables::CONSENT_RECORDS, to_row(&record)?))
                    .await?;
                record
            }
            Some(mut record) => {
                let old_status = record.status;
                record.status = status;
                record.expires_at = expires_at;
                record.updated_at = now;
                if status == ConsentStatus::Granted {
                    record.granted_at = now;
                    record.withdrawn_at = None;
                }
                if status == ConsentStatus::Withdrawn {
                    record.withdrawn_at = Some(now);
                }
                record.metadata = metadata.clone();

                if old_status != status {
                    self.append_history(&record, Some(old_status), status, None, metadata, now)
                        .await?;
                }
                self.store
                    .execute(Statement::update(
                        tables::CONSENT_RECORDS,
                        Filter::new().eq_uuid("id", record.id),
                        to_row(&record)?,
                    ))
                    .await?;
                record
            }
        };

        self.invalidate_cache(subject_id).await;
        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::ConsentRecorded, "consent", now)
                    .subject(subject_id)
                    .resource_id(record.id.to_string())
                    .detail("purpose", purpose.as_str())
                    .detail("status", status.as_str())
                    .build(),
            )
            .await;

        Ok(record)
    }

    /// Returns the record only while it is `granted` and unexpired. A granted
    /// record whose expiry has passed transitions to `expired` here, on read;
    /// expiry is lazy by policy and the retention sweep does not scan for it.
    pub async fn check_consent(
        &self,
        subject_id: Uuid,
        purpose: ConsentPurpose,
    ) -> Result<Option<ConsentRecord>> {
        if let Some(cache) = &self.cache {
            if let Some(row) = cache.get(subject_id, purpose.as_str()).await {
                let record: ConsentRecord = from_row(tables::CONSENT_RECORDS, row)?;
                if record.status == ConsentStatus::Granted && !self.is_expired(&record) {
                    return Ok(Some(record));
                }
                // Stale entry; fall through to the store.
                cache.invalidate(subject_id).await;
            }
        }

        let record = match self.current_record(subject_id, purpose).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        if record.status != ConsentStatus::Granted {
            return Ok(None);
        }

        if self.is_expired(&record) {
            self.expire_record(&record).await?;
            return Ok(None);
        }

        if let Some(cache) = &self.cache {
            cache
                .put(subject_id, purpose.as_str(), to_row(&record)?)
                .await;
        }
        Ok(Some(record))
    }

    /// Transition a granted consent to withdrawn. Returns false without
    /// mutating anything when there is no granted record to withdraw.
    pub async fn withdraw_consent(
        &self,
        subject_id: Uuid,
        purpose: ConsentPurpose,
        reason: Option<String>,
        metadata: Option<ConsentMetadata>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let record = self.current_record(subject_id, purpose).await?;

        let mut record = match record {
            Some(record) if record.status == ConsentStatus::Granted => record,
            Some(record) => {
                self.audit
                    .log(
                        AuditEventBuilder::new(AuditEventType::ActionRefused, "consent", now)
                            .subject(subject_id)
                            .resource_id(record.id.to_string())
                            .detail("action", "withdraw_consent")
                            .detail("reason", format!("status is {}", record.status))
                            .build(),
                    )
                    .await;
                return Ok(false);
            }
            None => return Ok(false),
        };

        let metadata = metadata.unwrap_or_default();
        let old_status = record.status;
        record.status = ConsentStatus::Withdrawn;
        record.withdrawn_at = Some(now);
        record.updated_at = now;

        self.append_history(
            &record,
            Some(old_status),
            ConsentStatus::Withdrawn,
            reason.clone(),
            metadata,
            now,
        )
        .await?;
        self.store
            .execute(Statement::update(
                tables::CONSENT_RECORDS,
                Filter::new().eq_uuid("id", record.id),
                to_row(&record)?,
            ))
            .await?;

        self.invalidate_cache(subject_id).await;
        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::ConsentWithdrawn, "consent", now)
                    .subject(subject_id)
                    .resource_id(record.id.to_string())
                    .detail("purpose", purpose.as_str())
                    .detail("reason", reason.unwrap_or_default())
                    .build(),
            )
            .await;

        Ok(true)
    }

    pub async fn get_user_consents(&self, subject_id: Uuid) -> Result<Vec<ConsentRecord>> {
        let rows = self
            .store
            .fetch_all(Query::new(
                tables::CONSENT_RECORDS,
                Filter::new().eq_uuid("subject_id", subject_id),
            ))
            .await?;
        rows.into_iter()
            .map(|row| Ok(from_row(tables::CONSENT_RECORDS, row)?))
            .collect()
    }

    pub async fn get_consent_history(
        &self,
        subject_id: Uuid,
        purpose: Option<ConsentPurpose>,
    ) -> Result<Vec<ConsentHistoryEntry>> {
        let mut filter = Filter::new().eq_uuid("subject_id", subject_id);
        if let Some(purpose) = purpose {
            filter = filter.eq("purpose", purpose.as_str());
        }
        let rows = self
            .store
            .fetch_all(
                Query::new(tables::CONSENT_HISTORY, filter).order_by("created_at", Order::Asc),
            )
            .await?;
        rows.into_iter()
            .map(|row| Ok(from_row(tables::CONSENT_HISTORY, row)?))
            .collect()
    }

    pub async fn get_consents_by_type(
        &self,
        purpose: ConsentPurpose,
        status: Option<ConsentStatus>,
    ) -> Result<Vec<ConsentRecord>> {
        let mut filter = Filter::new().eq("purpose", purpose.as_str());
        if let Some(status) = status {
            filter = filter.eq("status", status.as_str());
        }
        let rows = self
            .store
            .fetch_all(Query::new(tables::CONSENT_RECORDS, filter))
            .await?;
        rows.into_iter()
            .map(|row| Ok(from_row(tables::CONSENT_RECORDS, row)?))
            .collect()
    }

    /// Batch-expire every granted record whose expiry has passed. Returns the
    /// number transitioned; safe to run repeatedly.
    pub async fn cleanup_expired_consents(&self) -> Result<u64> {
        let now = self.clock.now();
        let rows = self
            .store
            .fetch_all(Query::new(
                tables::CONSENT_RECORDS,
                Filter::new()
                    .eq("status", ConsentStatus::Granted.as_str())
                    .is_not_null("expires_at")
                    .before("expires_at", now),
            ))
            .await?;

        let mut expired = 0u64;
        for row in rows {
            let record: ConsentRecord = from_row(tables::CONSENT_RECORDS, row)?;
            self.expire_record(&record).await?;
            expired += 1;
        }

        if expired > 0 {
            log::info!("expired {expired} consent records past their expiry");
        }
        Ok(expired)
    }

    async fn current_record(
        &self,
        subject_id: Uuid,
        purpose: ConsentPurpose,
    ) -> Result<Option<ConsentRecord>> {
        let row = self
            .store
            .fetch_one(Query::new(
                tables::CONSENT_RECORDS,
                Filter::new()
                    .eq_uuid("subject_id", subject_id)
                    .eq("purpose", purpose.as_str()),
            ))
            .await?;
        row.map(|row| Ok(from_row(tables::CONSENT_RECORDS, row)?))
            .transpose()
    }

    fn is_expired(&self, record: &ConsentRecord) -> bool {
        record
            .expires_at
            .map(|expiry| expiry <= self.clock.now())
            .unwrap_or(false)
    }

    async fn expire_record(&self, record: &ConsentRecord) -> Result<()> {
        let now = self.clock.now();
        let mut expired = record.clone();
        expired.status = ConsentStatus::Expired;
        expired.updated_at = now;

        self.append_history(
            &expired,
            Some(record.status),
            ConsentStatus::Expired,
            None,
            expired.metadata.clone(),
            now,
        )
        .await?;
        self.store
            .execute(Statement::update(
                tables::CONSENT_RECORDS,
                Filter::new().eq_uuid("id", record.id),
                to_row(&expired)?,
            ))
            .await?;

        self.invalidate_cache(record.subject_id).await;
        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::ConsentExpired, "consent", now)
                    .subject(record.subject_id)
                    .resource_id(record.id.to_string())
                    .detail("purpose", record.purpose.as_str())
                    .build(),
            )
            .await;
        Ok(())
    }

    async fn append_history(
        &self,
        record: &ConsentRecord,
        old_status: Option<ConsentStatus>,
        new_status: ConsentStatus,
        reason: Option<String>,
        metadata: ConsentMetadata,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = ConsentHistoryEntry {
            id: Uuid::new_v4(),
            consent_id: record.id,
            subject_id: record.subject_id,
            purpose: record.purpose,
            old_status,
            new_status,
            reason,
            metadata,
            created_at: now,
        };
        self.store
            .execute(Statement::insert(tables::CONSENT_HISTORY, to_row(&entry)?))
            .await?;
        Ok(())
    }

    async fn invalidate_cache(&self, subject_id: Uuid) {
        if let Some(cache) = &self.cache {
            cache.invalidate(subject_id).await;
        }
    }
}
