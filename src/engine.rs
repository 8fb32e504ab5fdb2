use std::path::PathBuf;
use std::sync::Arc;

use crate::anonymizer::DataAnonymizer;
use crate::audit::{AuditSink, LogAuditSink};
use crate::cache::MemoryConsentCache;
use crate::clock::{Clock, SystemClock};
use crate::consent::{ConsentManager, CookieConsentManager};
use crate::dsar::DataSubjectRights;
use crate::error::Result;
use crate::retention::RetentionManager;
use crate::store::Store;

/// Engine-wide settings. The salt keys every pseudonymization token; changing
/// it severs the link between old and new tokens.
#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    pub anonymizer_salt: String,
    pub export_dir: PathBuf,
    pub export_expiry_days: i64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            anonymizer_salt: "change-me".to_string(),
            export_dir: PathBuf::from("./exports"),
            export_expiry_days: 30,
        }
    }
}

/// Top-level facade wiring the five governance components over one store,
/// one audit sink and one clock. Construct once at startup and share.
pub struct GovernanceEngine {
    pub consent: Arc<ConsentManager>,
    pub cookies: Arc<CookieConsentManager>,
    pub anonymizer: Arc<DataAnonymizer>,
    pub retention: Arc<RetentionManager>,
    pub rights: Arc<DataSubjectRights>,
}

impl GovernanceEngine {
    /// Build with the production defaults: log-backed audit, system clock,
    /// in-memory consent cache.
    pub fn new(store: Arc<dyn Store>, config: GovernanceConfig) -> Self {
        Self::with_parts(
            store,
            config,
            Arc::new(LogAuditSink),
            Arc::new(SystemClock),
        )
    }

    /// Build with injected audit sink and clock. Tests use this to capture
    /// audit events and drive time.
    pub fn with_parts(
        store: Arc<dyn Store>,
        config: GovernanceConfig,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let anonymizer = Arc::new(DataAnonymizer::new(config.anonymizer_salt));
        let consent = Arc::new(
            ConsentManager::new(store.clone(), audit.clone(), clock.clone())
                .with_cache(Arc::new(MemoryConsentCache::new())),
        );
        let cookies = Arc::new(CookieConsentManager::new(
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
        let rights = Arc::new(DataSubjectRights::new(
            store,
            audit,
            clock,
            consent.clone(),
            anonymizer.clone(),
            retention.clone(),
            config.export_dir,
            config.export_expiry_days,
        ));

        Self {
            consent,
            cookies,
            anonymizer,
            retention,
            rights,
        }
    }

    /// Load persisted retention rules into the in-memory cache. Call once
    /// after construction, before the first sweep. Returns the number of
    /// rules loaded.
    pub async fn init(&self) -> Result<usize> {
        self.retention.load_rules().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::FixedClock;
    use crate::consent::{ConsentPurpose, ConsentStatus};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn engine() -> (GovernanceEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = GovernanceConfig {
            anonymizer_salt: "engine-test".into(),
            export_dir: dir.path().to_path_buf(),
            export_expiry_days: 30,
        };
        let engine = GovernanceEngine::with_parts(
            Arc::new(MemoryStore::new()),
            config,
            Arc::new(MemoryAuditSink::default()),
            Arc::new(FixedClock::new(Utc::now())),
        );
        (engine, dir)
    }

    #[tokio::test]
    async fn init_reports_loaded_rule_count() {
        let (engine, _dir) = engine();
        assert_eq!(engine.init().await.unwrap(), 0);

        engine
            .retention
            .add_retention_rule(
                crate::retention::DataCategory::Logs,
                crate::retention::RetentionPolicy::Days90,
                crate::retention::RetentionActionKind::Delete,
                None,
            )
            .await
            .unwrap();

        // A fresh init sees the persisted rule.
        assert_eq!(engine.init().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn components_share_one_store() {
        let (engine, _dir) = engine();
        engine.init().await.unwrap();
        let subject = Uuid::new_v4();

        engine
            .consent
            .record_consent(subject, ConsentPurpose::Marketing, ConsentStatus::Granted, None, None)
            .await
            .unwrap();

        // The rights component sees the consent written through the consent
        // component.
        let bundle = engine.rights.get_user_data(subject).await.unwrap();
        assert_eq!(bundle.consents.len(), 1);
        assert_eq!(bundle.consents[0].purpose, ConsentPurpose::Marketing);
    }

    #[tokio::test]
    async fn hold_placed_through_retention_blocks_rights_erasure() {
        let (engine, _dir) = engine();
        let subject = Uuid::new_v4();

        engine
            .retention
            .place_legal_hold(subject, "all", "audit", None, None)
            .await
            .unwrap();

        assert!(!engine.rights.erase_user_data(subject, false, None).await.unwrap());
    }
}
