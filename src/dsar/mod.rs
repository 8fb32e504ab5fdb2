use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::anonymizer::DataAnonymizer;
use crate::audit::{AuditEventBuilder, AuditEventType, AuditSink};
use crate::clock::Clock;
use crate::consent::{ConsentManager, ConsentRecord};
use crate::error::Result;
use crate::retention::RetentionManager;
use crate::store::{
    datetime_value, from_row, tables, to_row, Filter, Query, Row, Statement, Store,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DsarRequestType {
    Access,
    Rectification,
    Erasure,
    Portability,
    Restriction,
    Object,
}

impl DsarRequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Rectification => "rectification",
            Self::Erasure => "erasure",
            Self::Portability => "portability",
            Self::Restriction => "restriction",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DsarStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
    Partial,
}

impl DsarStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Partial => "partial",
        }
    }

    /// Completed, rejected and partial are final; nothing transitions out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Partial)
    }

    fn can_transition_to(&self, next: DsarStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Rejected),
            Self::Processing => matches!(next, Self::Completed | Self::Rejected | Self::Partial),
            _ => false,
        }
    }
}

impl std::fmt::Display for DsarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only annotation on a request; every status transition adds one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsarNote {
    pub text: String,
    pub author: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsarRequest {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub request_type: DsarRequestType,
    pub status: DsarStatus,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub details: Option<String>,
    #[serde(default)]
    pub notes: Vec<DsarNote>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

/// Bookkeeping row for a produced export artifact; the artifact becomes
/// eligible for cleanup once `expires_at` passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataExportRecord {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub format: ExportFormat,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Declarative processing-restriction flag. Recording it does not block any
/// engine operation; callers outside the engine are expected to consult it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRestriction {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub restriction_type: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The canonical right-to-access payload: everything the engine can assemble
/// about a subject, secrets stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDataBundle {
    pub subject_id: Uuid,
    pub assembled_at: DateTime<Utc>,
    pub profile: Option<Value>,
    pub consents: Vec<ConsentRecord>,
    pub devices: Vec<Value>,
    pub sessions: Vec<Value>,
    pub files: Vec<Value>,
}

/// Profile columns that never leave through access/export payloads.
const SECRET_PROFILE_FIELDS: &[&str] = &[
    "password",
    "password_hash",
    "mfa_secret",
    "totp_secret",
    "api_key",
    "recovery_codes",
    "session_token",
];

/// The only profile columns rectification may touch. Identifiers, timestamps
/// and security fields stay out by construction.
const RECTIFIABLE_FIELDS: &[&str] = &[
    "display_name",
    "first_name",
    "last_name",
    "email",
    "phone",
    "address",
    "locale",
    "timezone",
];

/// Subject-owned tables hard-deleted by erasure, dependent rows first; the
/// profile row goes last.
const ERASURE_ORDER: &[&str] = &[
    tables::SESSIONS,
    tables::DEVICES,
    tables::USER_FILES,
    tables::ACTIVITY_LOG,
    tables::COOKIE_CONSENTS,
    tables::CONSENT_HISTORY,
    tables::CONSENT_RECORDS,
    tables::PROCESSING_RESTRICTIONS,
];

/// Orchestrates subject-initiated rights requests end to end: access,
/// rectification, erasure, portability, restriction.
pub struct DataSubjectRights {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    consent: Arc<ConsentManager>,
    anonymizer: Arc<DataAnonymizer>,
    retention: Arc<RetentionManager>,
    export_dir: PathBuf,
    export_expiry_days: i64,
}

impl DataSubjectRights {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        consent: Arc<ConsentManager>,
        anonymizer: Arc<DataAnonymizer>,
        retention: Arc<RetentionManager>,
        export_dir: impl Into<PathBuf>,
        export_expiry_days: i64,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            consent,
            anonymizer,
            retention,
            export_dir: export_dir.into(),
            export_expiry_days,
        }
    }

    pub async fn create_request(
        &self,
        subject_id: Uuid,
        request_type: DsarRequestType,
        details: Option<String>,
    ) -> Result<DsarRequest> {
        let now = self.clock.now();
        let request = DsarRequest {
            id: Uuid::new_v4(),
            subject_id,
            request_type,
            status: DsarStatus::Pending,
            requested_at: now,
            processed_at: None,
            completed_at: None,
            details,
            notes: Vec::new(),
            attachments: Vec::new(),
        };
        self.store
            .execute(Statement::insert(tables::DSAR_REQUESTS, to_row(&request)?))
            .await?;

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::DsarCreated, "dsar_request", now)
                    .subject(subject_id)
                    .resource_id(request.id.to_string())
                    .detail("request_type", request_type.as_str())
                    .build(),
            )
            .await;

        Ok(request)
    }

    pub async fn get_dsar_request(&self, request_id: Uuid) -> Result<Option<DsarRequest>> {
        let row = self
            .store
            .fetch_one(Query::new(
                tables::DSAR_REQUESTS,
                Filter::new().eq_uuid("id", request_id),
            ))
            .await?;
        row.map(|row| Ok(from_row(tables::DSAR_REQUESTS, row)?))
            .transpose()
    }

    /// Transition a request. Terminal states are final: any transition out of
    /// completed/rejected/partial is refused and audited. Every accepted
    /// transition appends a note and stamps `processed_at` (and
    /// `completed_at` when completing).
    pub async fn update_dsar_status(
        &self,
        request_id: Uuid,
        status: DsarStatus,
        note: Option<String>,
        processed_by: Option<Uuid>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut request = match self.get_dsar_request(request_id).await? {
            Some(request) => request,
            None => return Ok(false),
        };

        if !request.status.can_transition_to(status) {
            self.audit
                .log(
                    AuditEventBuilder::new(AuditEventType::ActionRefused, "dsar_request", now)
                        .subject(request.subject_id)
                        .actor(processed_by)
                        .resource_id(request_id.to_string())
                        .detail("action", "update_dsar_status")
                        .detail(
                            "reason",
                            format!("illegal transition {} -> {}", request.status, status),
                        )
                        .build(),
                )
                .await;
            return Ok(false);
        }

        let old_status = request.status;
        request.status = status;
        request.processed_at = Some(now);
        if status == DsarStatus::Completed {
            request.completed_at = Some(now);
        }
        request.notes.push(DsarNote {
            text: note.unwrap_or_else(|| format!("status changed from {old_status} to {status}")),
            author: processed_by,
            created_at: now,
        });

        self.store
            .execute(Statement::update(
                tables::DSAR_REQUESTS,
                Filter::new().eq_uuid("id", request_id),
                to_row(&request)?,
            ))
            .await?;

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::DsarStatusChanged, "dsar_request", now)
                    .subject(request.subject_id)
                    .actor(processed_by)
                    .resource_id(request_id.to_string())
                    .detail("from", old_status.as_str())
                    .detail("to", status.as_str())
                    .build(),
            )
            .await;

        Ok(true)
    }

    /// Assemble the right-to-access payload: profile minus secrets, consent
    /// records, device and session metadata, owned files. Also the body of
    /// every export.
    pub async fn get_user_data(&self, subject_id: Uuid) -> Result<UserDataBundle> {
        let now = self.clock.now();

        let profile = self
            .store
            .fetch_one(Query::new(
                tables::USERS,
                Filter::new().eq_uuid("id", subject_id),
            ))
            .await?
            .map(|mut row| {
                for field in SECRET_PROFILE_FIELDS {
                    row.remove(*field);
                }
                Value::Object(row)
            });

        let consents = self.consent.get_user_consents(subject_id).await?;
        let devices = self.owned_rows(tables::DEVICES, subject_id).await?;
        let sessions = self.owned_rows(tables::SESSIONS, subject_id).await?;
        let files = self.owned_rows(tables::USER_FILES, subject_id).await?;

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::DataAccessed, "user", now)
                    .subject(subject_id)
                    .resource_id(subject_id.to_string())
                    .build(),
            )
            .await;

        Ok(UserDataBundle {
            subject_id,
            assembled_at: now,
            profile,
            consents,
            devices,
            sessions,
            files,
        })
    }

    /// Apply allow-listed profile corrections. Returns false when the subject
    /// is unknown or none of the submitted fields is correctable.
    pub async fn rectify_data(
        &self,
        subject_id: Uuid,
        corrections: HashMap<String, Value>,
        reason: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();

        let allowed: Row = corrections
            .into_iter()
            .filter(|(field, _)| RECTIFIABLE_FIELDS.contains(&field.as_str()))
            .collect();
        if allowed.is_empty() {
            self.audit
                .log(
                    AuditEventBuilder::new(AuditEventType::ActionRefused, "user", now)
                        .subject(subject_id)
                        .detail("action", "rectify_data")
                        .detail("reason", "no correctable fields in request")
                        .build(),
                )
                .await;
            return Ok(false);
        }

        let changed_fields: Vec<String> = allowed.keys().cloned().collect();
        let updated = self
            .store
            .execute(Statement::update(
                tables::USERS,
                Filter::new().eq_uuid("id", subject_id),
                allowed,
            ))
            .await?;
        if updated == 0 {
            return Ok(false);
        }

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::DataRectified, "user", now)
                    .subject(subject_id)
                    .detail("fields", changed_fields.join(","))
                    .detail("reason", reason.unwrap_or_default())
                    .build(),
            )
            .await;
        Ok(true)
    }

    /// Erase a subject's data. `keep_essential` anonymizes personal fields in
    /// place and leaves referential rows intact; otherwise dependent rows are
    /// hard-deleted in order and the profile row last. Both modes also purge
    /// the subject's export rows and artifacts. Refused outright, with an
    /// audit entry and zero mutations, while any active legal hold exists for
    /// the subject.
    pub async fn erase_user_data(
        &self,
        subject_id: Uuid,
        keep_essential: bool,
        reason: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();

        if self.retention.check_legal_hold(subject_id, None).await? {
            self.audit
                .log(
                    AuditEventBuilder::new(AuditEventType::ActionRefused, "user", now)
                        .subject(subject_id)
                        .detail("action", "erase_user_data")
                        .detail("reason", "active legal hold")
                        .build(),
                )
                .await;
            return Ok(false);
        }

        let profile = self
            .store
            .fetch_one(Query::new(
                tables::USERS,
                Filter::new().eq_uuid("id", subject_id),
            ))
            .await?;
        if profile.is_none() {
            return Ok(false);
        }

        // Export artifacts hold the subject's full bundle; they go first in
        // either mode.
        self.purge_exports(Filter::new().eq_uuid("subject_id", subject_id))
            .await?;

        if keep_essential {
            self.anonymize_subject(subject_id, profile.unwrap_or_default())
                .await?;
        } else {
            for table in ERASURE_ORDER {
                self.store
                    .execute(Statement::delete(
                        table,
                        Filter::new().eq_uuid("subject_id", subject_id),
                    ))
                    .await?;
            }
            self.store
                .execute(Statement::delete(
                    tables::USERS,
                    Filter::new().eq_uuid("id", subject_id),
                ))
                .await?;
        }

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::DataErased, "user", now)
                    .subject(subject_id)
                    .detail(
                        "mode",
                        if keep_essential { "anonymize" } else { "delete" },
                    )
                    .detail("reason", reason.unwrap_or_default())
                    .build(),
            )
            .await;
        Ok(true)
    }

    /// Serialize the subject's bundle to disk and record the artifact with a
    /// fixed expiry. Returns the written path.
    pub async fn export_user_data(
        &self,
        subject_id: Uuid,
        format: ExportFormat,
    ) -> Result<PathBuf> {
        let now = self.clock.now();
        let bundle = self.get_user_data(subject_id).await?;

        std::fs::create_dir_all(&self.export_dir)?;
        let file_name = format!(
            "dsar_export_{}_{}.{}",
            subject_id,
            now.timestamp(),
            format.extension()
        );
        let path = self.export_dir.join(file_name);

        match format {
            ExportFormat::Json => {
                let body = serde_json::to_string_pretty(&bundle)?;
                std::fs::write(&path, body)?;
            }
            ExportFormat::Csv => write_csv_export(&path, &bundle)?,
        }

        let record = DataExportRecord {
            id: Uuid::new_v4(),
            subject_id,
            format,
            file_path: path.to_string_lossy().into_owned(),
            created_at: now,
            expires_at: now + chrono::Duration::days(self.export_expiry_days),
        };
        self.store
            .execute(Statement::insert(tables::DATA_EXPORTS, to_row(&record)?))
            .await?;

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::DataExported, "user", now)
                    .subject(subject_id)
                    .resource_id(record.id.to_string())
                    .detail("format", format.extension())
                    .build(),
            )
            .await;

        Ok(path)
    }

    /// Remove export rows past their expiry along with their artifacts.
    pub async fn cleanup_expired_exports(&self) -> Result<u64> {
        let now = self.clock.now();
        self.purge_exports(Filter::new().before("expires_at", now))
            .await
    }

    /// Delete matching export rows and their on-disk artifacts. Missing
    /// files are fine; the row alone is enough to clean up.
    async fn purge_exports(&self, filter: Filter) -> Result<u64> {
        let rows = self
            .store
            .fetch_all(Query::new(tables::DATA_EXPORTS, filter.clone()))
            .await?;
        for row in &rows {
            if let Some(path) = row.get("file_path").and_then(Value::as_str) {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("could not remove export artifact {path}: {e}");
                    }
                }
            }
        }

        let deleted = self
            .store
            .execute(Statement::delete(tables::DATA_EXPORTS, filter))
            .await?;
        Ok(deleted)
    }

    /// Idempotently record a processing-restriction flag for the subject.
    pub async fn restrict_processing(
        &self,
        subject_id: Uuid,
        restriction_type: &str,
        reason: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let filter = Filter::new()
            .eq_uuid("subject_id", subject_id)
            .eq("restriction_type", restriction_type);

        let existing = self
            .store
            .fetch_one(Query::new(tables::PROCESSING_RESTRICTIONS, filter.clone()))
            .await?;
        match existing {
            Some(row) => {
                let mut restriction: ProcessingRestriction =
                    from_row(tables::PROCESSING_RESTRICTIONS, row)?;
                restriction.reason = reason.clone();
                restriction.updated_at = now;
                self.store
                    .execute(Statement::update(
                        tables::PROCESSING_RESTRICTIONS,
                        filter,
                        to_row(&restriction)?,
                    ))
                    .await?;
            }
            None => {
                let restriction = ProcessingRestriction {
                    id: Uuid::new_v4(),
                    subject_id,
                    restriction_type: restriction_type.to_string(),
                    reason: reason.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.store
                    .execute(Statement::insert(
                        tables::PROCESSING_RESTRICTIONS,
                        to_row(&restriction)?,
                    ))
                    .await?;
            }
        }

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::ProcessingRestricted, "user", now)
                    .subject(subject_id)
                    .detail("restriction_type", restriction_type)
                    .detail("reason", reason.unwrap_or_default())
                    .build(),
            )
            .await;
        Ok(true)
    }

    async fn owned_rows(&self, table: &str, subject_id: Uuid) -> Result<Vec<Value>> {
        let rows = self
            .store
            .fetch_all(Query::new(
                table,
                Filter::new().eq_uuid("subject_id", subject_id),
            ))
            .await?;
        Ok(rows.into_iter().map(Value::Object).collect())
    }

    /// keep_essential erasure: scrub personal fields in the profile and in
    /// related device/session rows, leaving ids and references in place.
    async fn anonymize_subject(&self, subject_id: Uuid, profile: Row) -> Result<()> {
        let now = self.clock.now();

        let mut scrubbed = match self
            .anonymizer
            .anonymize_structured(&Value::Object(profile), &[])
        {
            Value::Object(map) => map,
            _ => Row::new(),
        };
        // Identity and bookkeeping survive anonymization.
        scrubbed.insert("id".to_string(), Value::String(subject_id.to_string()));
        scrubbed.insert("anonymized".to_string(), Value::Bool(true));
        scrubbed.insert("anonymized_at".to_string(), datetime_value(now));
        self.store
            .execute(Statement::update(
                tables::USERS,
                Filter::new().eq_uuid("id", subject_id),
                scrubbed,
            ))
            .await?;

        for table in [tables::DEVICES, tables::SESSIONS] {
            let rows = self
                .store
                .fetch_all(Query::new(
                    table,
                    Filter::new().eq_uuid("subject_id", subject_id),
                ))
                .await?;
            for row in rows {
                let Some(id) = row.get("id").cloned() else { continue };
                let scrubbed = match self
                    .anonymizer
                    .anonymize_structured(&Value::Object(row), &[])
                {
                    Value::Object(mut map) => {
                        map.insert("id".to_string(), id.clone());
                        map.insert(
                            "subject_id".to_string(),
                            Value::String(subject_id.to_string()),
                        );
                        map
                    }
                    _ => continue,
                };
                self.store
                    .execute(Statement::update(
                        table,
                        Filter::new().eq("id", id),
                        scrubbed,
                    ))
                    .await?;
            }
        }

        self.audit
            .log(
                AuditEventBuilder::new(AuditEventType::DataAnonymized, "user", now)
                    .subject(subject_id)
                    .build(),
            )
            .await;
        Ok(())
    }
}

/// Flattened tabular export: one `field,value` row per leaf, nested keys
/// joined with dots, array elements indexed.
fn write_csv_export(path: &Path, bundle: &UserDataBundle) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    writer
        .write_record(["field", "value"])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let tree = serde_json::to_value(bundle)?;
    let mut leaves = Vec::new();
    flatten_value("", &tree, &mut leaves);
    for (field, value) in leaves {
        writer
            .write_record([field, value])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    writer
        .flush()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(())
}

fn flatten_value(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_value(&path, child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_value(&format!("{prefix}[{index}]"), child, out);
            }
        }
        Value::Null => out.push((prefix.to_string(), String::new())),
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::FixedClock;
    use crate::consent::{ConsentPurpose, ConsentStatus};
    use crate::store::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    struct Fixture {
        rights: DataSubjectRights,
        consent: Arc<ConsentManager>,
        retention: Arc<RetentionManager>,
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
        clock: Arc<FixedClock>,
        _export_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::default());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let anonymizer = Arc::new(DataAnonymizer::new("dsar-salt"));
        let consent = Arc::new(ConsentManager::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            anonymizer.clone(),
        ));
        let export_dir = tempfile::tempdir().expect("tempdir");
        let rights = DataSubjectRights::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            consent.clone(),
            anonymizer,
            retention.clone(),
            export_dir.path(),
            30,
        );
        Fixture {
            rights,
            consent,
            retention,
            store,
            audit,
            clock,
            _export_dir: export_dir,
        }
    }

    async fn seed_user(store: &MemoryStore, subject: Uuid) {
        let mut profile = Row::new();
        profile.insert("id".into(), json!(subject.to_string()));
        profile.insert("email".into(), json!("dana@example.com"));
        profile.insert("display_name".into(), json!("Dana Vrabie"));
        profile.insert("plan".into(), json!("starter"));
        profile.insert("password_hash".into(), json!("$argon2$..."));
        store.seed(tables::USERS, vec![profile]).await;

        let mut device = Row::new();
        device.insert("id".into(), json!("dev-1"));
        device.insert("subject_id".into(), json!(subject.to_string()));
        device.insert("device_name".into(), json!("Dana's phone"));
        store.seed(tables::DEVICES, vec![device]).await;

        let mut session = Row::new();
        session.insert("id".into(), json!("sess-1"));
        session.insert("subject_id".into(), json!(subject.to_string()));
        session.insert("ip_address".into(), json!("203.0.113.9"));
        store.seed(tables::SESSIONS, vec![session]).await;
    }

    #[tokio::test]
    async fn request_lifecycle_appends_one_note_per_transition() {
        let f = fixture();
        let subject = Uuid::new_v4();

        let request = f
            .rights
            .create_request(subject, DsarRequestType::Access, Some("full copy".into()))
            .await
            .unwrap();
        assert_eq!(request.status, DsarStatus::Pending);

        assert!(f
            .rights
            .update_dsar_status(request.id, DsarStatus::Processing, None, None)
            .await
            .unwrap());
        assert!(f
            .rights
            .update_dsar_status(request.id, DsarStatus::Completed, Some("export sent".into()), None)
            .await
            .unwrap());

        let done = f.rights.get_dsar_request(request.id).await.unwrap().unwrap();
        assert_eq!(done.status, DsarStatus::Completed);
        assert_eq!(done.notes.len(), 2);
        assert!(done.processed_at.is_some());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let f = fixture();
        let request = f
            .rights
            .create_request(Uuid::new_v4(), DsarRequestType::Erasure, None)
            .await
            .unwrap();

        f.rights
            .update_dsar_status(request.id, DsarStatus::Rejected, Some("hold".into()), None)
            .await
            .unwrap();

        for next in [DsarStatus::Processing, DsarStatus::Completed, DsarStatus::Pending] {
            assert!(!f
                .rights
                .update_dsar_status(request.id, next, None, None)
                .await
                .unwrap());
        }

        let stored = f.rights.get_dsar_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DsarStatus::Rejected);
        assert_eq!(stored.notes.len(), 1);
        assert_eq!(
            f.audit.events_of_type(AuditEventType::ActionRefused).await.len(),
            3
        );
    }

    #[tokio::test]
    async fn unknown_request_returns_false() {
        let f = fixture();
        assert!(!f
            .rights
            .update_dsar_status(Uuid::new_v4(), DsarStatus::Processing, None, None)
            .await
            .unwrap());
        assert!(f.rights.get_dsar_request(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn access_bundle_strips_secrets_and_gathers_consents() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;
        f.consent
            .record_consent(subject, ConsentPurpose::Marketing, ConsentStatus::Granted, None, None)
            .await
            .unwrap();

        let bundle = f.rights.get_user_data(subject).await.unwrap();
        let profile = bundle.profile.expect("profile present");
        assert_eq!(profile["email"], "dana@example.com");
        assert!(profile.get("password_hash").is_none());
        assert_eq!(bundle.consents.len(), 1);
        assert_eq!(bundle.devices.len(), 1);
        assert_eq!(bundle.sessions.len(), 1);
    }

    #[tokio::test]
    async fn rectify_honors_allow_list() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;

        let ok = f
            .rights
            .rectify_data(
                subject,
                [("email".to_string(), json!("new@example.com"))].into(),
                Some("typo".into()),
            )
            .await
            .unwrap();
        assert!(ok);

        let refused = f
            .rights
            .rectify_data(
                subject,
                [("password_hash".to_string(), json!("hacked"))].into(),
                None,
            )
            .await
            .unwrap();
        assert!(!refused);

        let bundle = f.rights.get_user_data(subject).await.unwrap();
        assert_eq!(bundle.profile.unwrap()["email"], "new@example.com");
    }

    #[tokio::test]
    async fn erase_refuses_under_legal_hold() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;
        f.retention
            .place_legal_hold(subject, "profile", "litigation", None, None)
            .await
            .unwrap();
        f.audit.clear().await;

        let erased = f.rights.erase_user_data(subject, false, None).await.unwrap();
        assert!(!erased);
        assert_eq!(f.store.table_len(tables::USERS).await, 1);
        assert_eq!(f.store.table_len(tables::SESSIONS).await, 1);
        assert_eq!(
            f.audit.events_of_type(AuditEventType::ActionRefused).await.len(),
            1
        );

        // Released hold unblocks the same call.
        f.retention.release_legal_hold(subject, None).await.unwrap();
        assert!(f.rights.erase_user_data(subject, false, None).await.unwrap());
        assert_eq!(f.store.table_len(tables::USERS).await, 0);
    }

    #[tokio::test]
    async fn hard_erase_removes_dependents_and_profile() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;
        f.consent
            .record_consent(subject, ConsentPurpose::Email, ConsentStatus::Granted, None, None)
            .await
            .unwrap();

        assert!(f.rights.erase_user_data(subject, false, Some("user request".into())).await.unwrap());

        assert_eq!(f.store.table_len(tables::USERS).await, 0);
        assert_eq!(f.store.table_len(tables::DEVICES).await, 0);
        assert_eq!(f.store.table_len(tables::SESSIONS).await, 0);
        assert_eq!(f.store.table_len(tables::CONSENT_RECORDS).await, 0);
        assert_eq!(f.store.table_len(tables::CONSENT_HISTORY).await, 0);
    }

    #[tokio::test]
    async fn erase_purges_export_artifacts() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;

        let path = f
            .rights
            .export_user_data(subject, ExportFormat::Json)
            .await
            .unwrap();
        assert!(path.exists());

        // The export is nowhere near expiry, but erasure must not leave the
        // subject's bundle on disk.
        assert!(f.rights.erase_user_data(subject, false, None).await.unwrap());
        assert!(!path.exists());
        assert_eq!(f.store.table_len(tables::DATA_EXPORTS).await, 0);
    }

    #[tokio::test]
    async fn soft_erase_anonymizes_in_place() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;

        assert!(f.rights.erase_user_data(subject, true, None).await.unwrap());

        // Rows survive, personal fields do not.
        assert_eq!(f.store.table_len(tables::USERS).await, 1);
        assert_eq!(f.store.table_len(tables::DEVICES).await, 1);

        let bundle = f.rights.get_user_data(subject).await.unwrap();
        let profile = bundle.profile.unwrap();
        assert_ne!(profile["email"], "dana@example.com");
        assert_ne!(profile["display_name"], "Dana Vrabie");
        assert_eq!(profile["plan"], "starter");
        assert_eq!(profile["anonymized"], json!(true));
        assert_ne!(bundle.devices[0]["device_name"], "Dana's phone");
    }

    #[tokio::test]
    async fn export_roundtrips_the_access_bundle() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;
        f.consent
            .record_consent(subject, ConsentPurpose::Analytics, ConsentStatus::Granted, None, None)
            .await
            .unwrap();

        let path = f
            .rights
            .export_user_data(subject, ExportFormat::Json)
            .await
            .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        let exported: UserDataBundle = serde_json::from_str(&body).unwrap();

        let live = f.rights.get_user_data(subject).await.unwrap();
        assert_eq!(exported.subject_id, live.subject_id);
        assert_eq!(exported.profile, live.profile);
        assert_eq!(exported.consents.len(), live.consents.len());
        assert_eq!(exported.consents[0].id, live.consents[0].id);
        assert_eq!(exported.devices, live.devices);

        assert_eq!(f.store.table_len(tables::DATA_EXPORTS).await, 1);
    }

    #[tokio::test]
    async fn csv_export_writes_flattened_rows() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;

        let path = f
            .rights
            .export_user_data(subject, ExportFormat::Csv)
            .await
            .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("field,value"));
        assert!(body.contains("profile.email"));
        assert!(body.contains("devices[0].id"));
    }

    #[tokio::test]
    async fn expired_exports_are_cleaned_up() {
        let f = fixture();
        let subject = Uuid::new_v4();
        seed_user(&f.store, subject).await;

        let path = f
            .rights
            .export_user_data(subject, ExportFormat::Json)
            .await
            .unwrap();
        assert!(path.exists());

        assert_eq!(f.rights.cleanup_expired_exports().await.unwrap(), 0);

        f.clock.advance(Duration::days(31));
        assert_eq!(f.rights.cleanup_expired_exports().await.unwrap(), 1);
        assert!(!path.exists());
        assert_eq!(f.store.table_len(tables::DATA_EXPORTS).await, 0);
    }

    #[tokio::test]
    async fn restrict_processing_is_idempotent() {
        let f = fixture();
        let subject = Uuid::new_v4();

        assert!(f
            .rights
            .restrict_processing(subject, "marketing", Some("objection".into()))
            .await
            .unwrap());
        assert!(f
            .rights
            .restrict_processing(subject, "marketing", Some("still objecting".into()))
            .await
            .unwrap());

        assert_eq!(f.store.table_len(tables::PROCESSING_RESTRICTIONS).await, 1);
    }
}
