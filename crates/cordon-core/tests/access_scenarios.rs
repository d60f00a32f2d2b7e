//! End-to-end access control scenarios on an in-memory store.
//!
//! Each scenario drives the public service API the way the excluded
//! controller layer would: seed the catalog, build a record tree, grant
//! clearances and compartments, then check decisions and the audit trail.

use chrono::{Duration, TimeZone, Utc};
use cordon_core::audit::{AuditEvent, AuditLog, AuditReportFilter};
use cordon_core::catalog::{ClassificationCatalog, NewLevel};
use cordon_core::clearance::{ClearanceLedger, GrantFields};
use cordon_core::clock::{Clock, ManualClock};
use cordon_core::compartment::{CompartmentGrantFields, CompartmentRegistry};
use cordon_core::decision::{AccessAction, AccessDecisionEngine};
use cordon_core::error::EngineError;
use cordon_core::object::{ClassifyFields, ObjectClassifier};
use cordon_core::request::{AccessRequestWorkflow, RequestKind, SubmitRequest};
use cordon_core::stepup::StepUpSessions;
use cordon_core::store::SecurityStore;
use cordon_core::watermark::WatermarkTracer;

struct Harness {
    store: SecurityStore,
    clock: ManualClock,
    public_id: i64,
    secret_id: i64,
    admin: i64,
    analyst: i64,
}

fn harness() -> Harness {
    let store = SecurityStore::in_memory().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap());

    let catalog = ClassificationCatalog::new(&store);
    let public_id = catalog
        .seed_level(&NewLevel::open("PUBLIC", "Public", 0))
        .unwrap();
    let secret_id = catalog
        .seed_level(&NewLevel::controlled("SECRET", "Secret", 2))
        .unwrap();

    let admin = store.register_principal("admin", None, clock.now()).unwrap();
    let analyst = store
        .register_principal("analyst", Some("analyst@example.org"), clock.now())
        .unwrap();

    Harness {
        store,
        clock,
        public_id,
        secret_id,
        admin,
        analyst,
    }
}

#[test]
fn child_records_can_only_escalate() {
    let h = harness();
    let classifier = ObjectClassifier::new(&h.store, &h.clock);

    let root = h
        .store
        .register_object(None, "F1", "Root folder", h.clock.now())
        .unwrap();
    let child = h
        .store
        .register_object(Some(root), "F1-S1", "Child folder", h.clock.now())
        .unwrap();

    classifier
        .classify(root, h.secret_id, &ClassifyFields::default(), h.admin)
        .unwrap();

    // Classifying the child below the parent's effective level is
    // rejected with both level names, not clamped.
    let err = classifier
        .classify(child, h.public_id, &ClassifyFields::default(), h.admin)
        .unwrap_err();
    match &err {
        EngineError::EscalationViolation {
            child_level,
            parent_level,
            ..
        } => {
            assert_eq!(child_level, "Public");
            assert_eq!(parent_level, "Secret");
        }
        other => panic!("expected EscalationViolation, got {other:?}"),
    }
    assert!(classifier.classification(child).unwrap().is_none());

    // Classifying the child at the same level succeeds.
    classifier
        .classify(child, h.secret_id, &ClassifyFields::default(), h.admin)
        .unwrap();
}

#[test]
fn user_without_clearance_is_pointed_at_the_request_path() {
    let h = harness();
    let classifier = ObjectClassifier::new(&h.store, &h.clock);
    let engine = AccessDecisionEngine::new(&h.store, &h.clock);

    let object = h
        .store
        .register_object(None, "F1", "Dossier", h.clock.now())
        .unwrap();
    classifier
        .classify(object, h.secret_id, &ClassifyFields::default(), h.admin)
        .unwrap();

    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, None)
        .unwrap();
    assert!(!decision.allowed);
    assert!(decision.requires_request);
    assert!(!decision.requires_2fa);
    assert_eq!(decision.reason.as_deref(), Some("No security clearance"));
}

#[test]
fn step_up_session_unlocks_two_factor_levels() {
    let h = harness();
    let classifier = ObjectClassifier::new(&h.store, &h.clock);
    let engine = AccessDecisionEngine::new(&h.store, &h.clock);

    let object = h
        .store
        .register_object(None, "F1", "Dossier", h.clock.now())
        .unwrap();
    classifier
        .classify(object, h.secret_id, &ClassifyFields::default(), h.admin)
        .unwrap();
    ClearanceLedger::new(&h.store, &h.clock)
        .grant(h.analyst, h.secret_id, &GrantFields::default(), h.admin)
        .unwrap();

    // Cleared, but no verified second factor yet.
    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, Some("sess-9"))
        .unwrap();
    assert!(!decision.allowed);
    assert!(decision.requires_2fa);
    assert!(!decision.requires_request);

    // After verification on the same ambient session, access opens and
    // the controlled level demands a watermark on export.
    StepUpSessions::new(&h.store, &h.clock)
        .create(h.analyst, "sess-9", None, None)
        .unwrap();
    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, Some("sess-9"))
        .unwrap();
    assert!(decision.allowed);
    assert!(decision.watermark_required);

    // A different ambient session is not verified.
    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, Some("sess-10"))
        .unwrap();
    assert!(decision.requires_2fa);
}

#[test]
fn compartments_require_explicit_membership() {
    let h = harness();
    let classifier = ObjectClassifier::new(&h.store, &h.clock);
    let registry = CompartmentRegistry::new(&h.store, &h.clock);
    let engine = AccessDecisionEngine::new(&h.store, &h.clock);

    let object = h
        .store
        .register_object(None, "F1", "Programme files", h.clock.now())
        .unwrap();
    classifier
        .classify(object, h.public_id, &ClassifyFields::default(), h.admin)
        .unwrap();

    let natsec = registry
        .create("NATSEC", "NATSEC", Some(h.secret_id), true)
        .unwrap();
    registry.assign_object(object, natsec, h.admin, None).unwrap();

    ClearanceLedger::new(&h.store, &h.clock)
        .grant(h.analyst, h.secret_id, &GrantFields::default(), h.admin)
        .unwrap();

    // Clearance alone is not enough; the denial names the compartment.
    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, None)
        .unwrap();
    assert!(!decision.allowed);
    assert!(decision.requires_request);
    assert_eq!(
        decision.reason.as_deref(),
        Some("Compartment access required: NATSEC")
    );

    registry
        .grant(
            h.analyst,
            natsec,
            &CompartmentGrantFields {
                briefing_date: Some(h.clock.now()),
                ..CompartmentGrantFields::default()
            },
            h.admin,
        )
        .unwrap();
    assert!(engine
        .can_access(h.analyst, object, AccessAction::View, None)
        .unwrap()
        .allowed);
}

#[test]
fn approved_request_grants_a_window_that_expires() {
    let h = harness();
    let classifier = ObjectClassifier::new(&h.store, &h.clock);
    let workflow = AccessRequestWorkflow::new(&h.store, &h.clock);
    let engine = AccessDecisionEngine::new(&h.store, &h.clock);

    let object = h
        .store
        .register_object(None, "F1", "Dossier", h.clock.now())
        .unwrap();
    classifier
        .classify(object, h.secret_id, &ClassifyFields::default(), h.admin)
        .unwrap();

    // Base clearance is insufficient: the analyst holds nothing.
    assert!(!engine
        .can_access(h.analyst, object, AccessAction::View, None)
        .unwrap()
        .allowed);

    let request_id = workflow
        .submit(
            h.analyst,
            &SubmitRequest::new(RequestKind::ObjectAccess, "urgent retrieval")
                .with_object(object)
                .with_duration_hours(4),
        )
        .unwrap();
    workflow.approve(request_id, h.admin, None, None).unwrap();

    // Inside the window the exception overrides the clearance checks.
    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, None)
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("Temporary access granted"));
    // Policy denials still apply inside the window.
    assert!(!engine
        .can_access(h.analyst, object, AccessAction::Download, None)
        .unwrap()
        .allowed);

    // After the four hours the deny returns.
    h.clock.advance(Duration::hours(4) + Duration::seconds(1));
    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, None)
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("No security clearance"));
}

#[test]
fn denied_attempts_land_in_the_audit_trail() {
    let h = harness();
    let classifier = ObjectClassifier::new(&h.store, &h.clock);
    let engine = AccessDecisionEngine::new(&h.store, &h.clock);
    let log = AuditLog::new(&h.store, &h.clock);

    let object = h
        .store
        .register_object(None, "F1", "Dossier", h.clock.now())
        .unwrap();
    classifier
        .classify(object, h.secret_id, &ClassifyFields::default(), h.admin)
        .unwrap();

    // The caller records the decision outcome, as the controller layer
    // does around every view.
    let decision = engine
        .can_access(h.analyst, object, AccessAction::View, None)
        .unwrap();
    log.record(
        &AuditEvent::denied(
            h.analyst,
            AccessAction::View.audit_action(),
            decision.reason.clone().unwrap(),
        )
        .with_object(object),
    )
    .unwrap();

    let denials = log
        .report(&AuditReportFilter {
            user_id: Some(h.analyst),
            access_granted: Some(false),
            ..AuditReportFilter::default()
        })
        .unwrap();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].entry.action, "view");
    assert_eq!(
        denials[0].entry.denial_reason.as_deref(),
        Some("No security clearance")
    );
    assert_eq!(denials[0].username.as_deref(), Some("analyst"));
    assert_eq!(denials[0].object_title.as_deref(), Some("Dossier"));

    // The classify operation audited itself.
    let for_object = log.for_object(object, 10).unwrap();
    assert!(for_object.iter().any(|e| e.action == "classify"));
}

#[test]
fn export_watermark_traces_back_to_the_exporter() {
    let h = harness();
    let tracer = WatermarkTracer::new(&h.store, &h.clock);

    let object = h
        .store
        .register_object(None, "F1", "Dossier", h.clock.now())
        .unwrap();

    let watermark = tracer
        .generate(h.analyst, object, None, Some("203.0.113.9"))
        .unwrap();
    let traced = tracer.trace(&watermark.code).unwrap().unwrap();

    assert_eq!(traced.record.user_id, h.analyst);
    assert_eq!(traced.record.object_id, object);
    assert_eq!(traced.username, "analyst");
    assert_eq!(traced.object_title, "Dossier");
    assert!(traced.record.text.contains(&watermark.code));
}
