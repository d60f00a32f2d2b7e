//! Security classification and access control engine for archival
//! records.
//!
//! `cordon-core` assigns hierarchical security clearances to users,
//! classifies records arranged in a containment tree, enforces the
//! escalation constraint (a child record never classified below its
//! parent), gates access behind clearance rank, compartment membership,
//! and step-up authentication, and produces a tamper-evident audit trail
//! including traceable watermarking of exported content.
//!
//! # Architecture
//!
//! The engine is a library boundary, not a network service. Each concern
//! is a stateless service struct over an explicit [`store::SecurityStore`]
//! handle and an injected [`clock::Clock`]:
//!
//! - [`catalog::ClassificationCatalog`] — the ordered level registry.
//! - [`clearance::ClearanceLedger`] — grants, history, renewal, expiry.
//! - [`compartment::CompartmentRegistry`] — orthogonal access partitions.
//! - [`object::ObjectClassifier`] — classification over the record tree,
//!   escalation enforcement, declassification scheduling.
//! - [`stepup::StepUpSessions`] — short-lived second-factor proof.
//! - [`decision::AccessDecisionEngine`] — the pure allow/deny decision.
//! - [`request::AccessRequestWorkflow`] — time-bounded exception grants.
//! - [`audit::AuditLog`] — the append-only trail.
//! - [`watermark::WatermarkTracer`] — per-export trace codes.
//! - [`stats::SecurityStats`] — operational counters.
//!
//! # Fail-closed posture
//!
//! Denial is a value ([`decision::Decision`]), never an error. Errors
//! ([`error::EngineError`]) are rule violations on mutations or storage
//! failure; call sites treat a failed read as a deny. Mutations run in
//! transactions and leave no partial state.
//!
//! # Example
//!
//! ```rust
//! use cordon_core::catalog::{ClassificationCatalog, NewLevel};
//! use cordon_core::clearance::{ClearanceLedger, GrantFields};
//! use cordon_core::clock::SystemClock;
//! use cordon_core::decision::{AccessAction, AccessDecisionEngine};
//! use cordon_core::object::{ClassifyFields, ObjectClassifier};
//! use cordon_core::store::SecurityStore;
//!
//! # fn main() -> Result<(), cordon_core::error::EngineError> {
//! let store = SecurityStore::in_memory()?;
//! let clock = SystemClock;
//! let now = chrono::Utc::now();
//!
//! let catalog = ClassificationCatalog::new(&store);
//! let secret = catalog.seed_level(&NewLevel::controlled("SECRET", "Secret", 2))?;
//!
//! let admin = store.register_principal("admin", None, now)?;
//! let analyst = store.register_principal("analyst", None, now)?;
//! let fonds = store.register_object(None, "F1", "Fonds", now)?;
//!
//! ObjectClassifier::new(&store, &clock)
//!     .classify(fonds, secret, &ClassifyFields::default(), admin)?;
//! ClearanceLedger::new(&store, &clock)
//!     .grant(analyst, secret, &GrantFields::default(), admin)?;
//!
//! let decision = AccessDecisionEngine::new(&store, &clock)
//!     .can_access(analyst, fonds, AccessAction::View, None)?;
//! assert!(!decision.allowed); // SECRET requires a step-up session.
//! assert!(decision.requires_2fa);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod catalog;
pub mod clearance;
pub mod clock;
pub mod compartment;
pub mod decision;
pub mod error;
pub mod object;
pub mod request;
pub mod stats;
pub mod stepup;
pub mod store;
pub mod watermark;

pub use audit::{AuditAction, AuditEntry, AuditEvent, AuditLog, AuditReportFilter};
pub use catalog::{ClassificationCatalog, ClassificationLevel, NewLevel};
pub use clearance::{ActiveClearance, ClearanceLedger, GrantFields, RenewalStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compartment::{Compartment, CompartmentGrantFields, CompartmentRegistry};
pub use decision::{AccessAction, AccessDecisionEngine, Decision};
pub use error::EngineError;
pub use object::{ClassifyFields, ObjectClassification, ObjectClassifier};
pub use request::{
    AccessRequest, AccessRequestWorkflow, RequestKind, RequestPriority, RequestStatus,
    SubmitRequest,
};
pub use stats::{SecurityStatistics, SecurityStats};
pub use stepup::StepUpSessions;
pub use store::SecurityStore;
pub use watermark::{EmbedStrategy, Watermark, WatermarkTracer};
