//! Data-governance engine: consent management, cookie-category consent,
//! anonymization and pseudonymization, data-subject rights requests, and
//! retention enforcement with legal holds — all over one pluggable store
//! and one audit trail.

pub mod anonymizer;
pub mod audit;
pub mod cache;
pub mod clock;
pub mod consent;
pub mod dsar;
pub mod engine;
pub mod error;
pub mod retention;
pub mod store;

pub use anonymizer::DataAnonymizer;
pub use audit::{AuditEvent, AuditEventType, AuditSink};
pub use clock::{Clock, SystemClock};
pub use consent::{ConsentManager, ConsentPurpose, ConsentStatus, CookieConsentManager};
pub use dsar::{DataSubjectRights, DsarRequestType, DsarStatus, ExportFormat};
pub use engine::{GovernanceConfig, GovernanceEngine};
pub use error::{GovernanceError, Result};
pub use retention::{DataCategory, RetentionManager, RetentionPolicy};
pub use store::{MemoryStore, Store};
