//! Access request workflow.
//!
//! Users denied by the decision engine can request a time-bounded
//! exception. A request is `pending` until a reviewer approves or denies
//! it; resolved requests are terminal. Approval sets
//! `access_granted_until`, which the decision engine consults as a second
//! allow path.
//!
//! The pending queue ordering (priority descending, oldest first within a
//! priority) is a contract: it determines reviewer triage order.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEvent, insert_event};
use crate::clock::{Clock, fmt_ts, parse_ts};
use crate::error::EngineError;
use crate::store::SecurityStore;

/// What kind of exception is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Access to a specific record.
    ObjectAccess,
    /// Access at a classification level.
    ClearanceUpgrade,
    /// Membership in a compartment.
    CompartmentAccess,
}

impl RequestKind {
    /// The stable string form persisted in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ObjectAccess => "object_access",
            Self::ClearanceUpgrade => "clearance_upgrade",
            Self::CompartmentAccess => "compartment_access",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "clearance_upgrade" => Self::ClearanceUpgrade,
            "compartment_access" => Self::CompartmentAccess,
            _ => Self::ObjectAccess,
        }
    }
}

/// Reviewer triage priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    /// Can wait.
    Low,
    /// Default.
    Normal,
    /// Time-sensitive.
    High,
    /// Operationally blocking.
    Urgent,
}

impl RequestPriority {
    /// The stable string form persisted in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting review.
    Pending,
    /// Approved with a time-bounded grant.
    Approved,
    /// Denied.
    Denied,
}

impl RequestStatus {
    /// The stable string form persisted in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "approved" => Self::Approved,
            "denied" => Self::Denied,
            _ => Self::Pending,
        }
    }
}

/// An access request row.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRequest {
    /// Row id.
    pub id: i64,
    /// The requesting user.
    pub user_id: i64,
    /// Target record, for object-scoped requests.
    pub object_id: Option<i64>,
    /// Target level, for level-scoped requests.
    pub classification_id: Option<i64>,
    /// Target compartment, for compartment-scoped requests.
    pub compartment_id: Option<i64>,
    /// What kind of exception is requested.
    pub kind: RequestKind,
    /// Why access is needed.
    pub justification: String,
    /// Requested grant duration in hours.
    pub duration_hours: i64,
    /// Reviewer triage priority.
    pub priority: RequestPriority,
    /// Lifecycle state.
    pub status: RequestStatus,
    /// Who resolved the request.
    pub reviewed_by: Option<i64>,
    /// When it was resolved.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Reviewer notes.
    pub review_notes: Option<String>,
    /// End of the granted window, for approved requests.
    pub access_granted_until: Option<DateTime<Utc>>,
    /// When the request was submitted.
    pub created_at: DateTime<Utc>,
}

/// A new request being submitted.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// What kind of exception is requested.
    pub kind: RequestKind,
    /// Why access is needed.
    pub justification: String,
    /// Target record.
    pub object_id: Option<i64>,
    /// Target level.
    pub classification_id: Option<i64>,
    /// Target compartment.
    pub compartment_id: Option<i64>,
    /// Requested grant duration in hours; defaults to 24.
    pub duration_hours: Option<i64>,
    /// Triage priority; defaults to normal.
    pub priority: RequestPriority,
}

impl SubmitRequest {
    /// A request of `kind` with the mandatory justification.
    #[must_use]
    pub fn new(kind: RequestKind, justification: impl Into<String>) -> Self {
        Self {
            kind,
            justification: justification.into(),
            object_id: None,
            classification_id: None,
            compartment_id: None,
            duration_hours: None,
            priority: RequestPriority::Normal,
        }
    }

    /// Targets a record.
    #[must_use]
    pub const fn with_object(mut self, object_id: i64) -> Self {
        self.object_id = Some(object_id);
        self
    }

    /// Targets a classification level.
    #[must_use]
    pub const fn with_classification(mut self, classification_id: i64) -> Self {
        self.classification_id = Some(classification_id);
        self
    }

    /// Targets a compartment.
    #[must_use]
    pub const fn with_compartment(mut self, compartment_id: i64) -> Self {
        self.compartment_id = Some(compartment_id);
        self
    }

    /// Requests a specific grant duration.
    #[must_use]
    pub const fn with_duration_hours(mut self, hours: i64) -> Self {
        self.duration_hours = Some(hours);
        self
    }

    /// Sets the triage priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A pending request with triage display context.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    /// The request.
    #[serde(flatten)]
    pub request: AccessRequest,
    /// The requester's username.
    pub username: String,
    /// The requester's contact address.
    pub email: Option<String>,
    /// Title of the target record.
    pub object_title: Option<String>,
    /// Name of the target level.
    pub classification_name: Option<String>,
    /// Name of the target compartment.
    pub compartment_name: Option<String>,
}

/// One of the user's own requests, with reviewer attribution.
#[derive(Debug, Clone, Serialize)]
pub struct UserRequest {
    /// The request.
    #[serde(flatten)]
    pub request: AccessRequest,
    /// Title of the target record.
    pub object_title: Option<String>,
    /// Name of the target level.
    pub classification_name: Option<String>,
    /// Username of the reviewer, for resolved requests.
    pub reviewed_by_name: Option<String>,
}

/// Default grant duration when neither the request nor the reviewer sets
/// one.
const DEFAULT_DURATION_HOURS: i64 = 24;

/// Service over the request workflow.
pub struct AccessRequestWorkflow<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> AccessRequestWorkflow<'a> {
    /// Creates the workflow over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Submits a request; always created `pending`. Returns the request
    /// id.
    pub fn submit(&self, user_id: i64, request: &SubmitRequest) -> Result<i64, EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);
        let duration = request.duration_hours.unwrap_or(DEFAULT_DURATION_HOURS);

        let id = self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO access_request
                     (user_id, object_id, classification_id, compartment_id,
                      request_type, justification, duration_hours, priority,
                      status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)",
                params![
                    user_id,
                    request.object_id,
                    request.classification_id,
                    request.compartment_id,
                    request.kind.as_str(),
                    request.justification,
                    duration,
                    request.priority.as_str(),
                    now_str,
                ],
            )?;
            let id = tx.last_insert_rowid();

            let mut event = AuditEvent::granted(user_id, AuditAction::AccessRequest)
                .with_justification(request.justification.clone());
            if let Some(object_id) = request.object_id {
                event = event.with_object(object_id);
            }
            if let Some(classification_id) = request.classification_id {
                event = event.with_classification(classification_id);
            }
            if let Some(compartment_id) = request.compartment_id {
                event = event.with_compartment(compartment_id);
            }
            insert_event(tx, &event, now)?;
            Ok(id)
        })?;

        tracing::info!(
            request_id = id,
            user_id,
            kind = request.kind.as_str(),
            priority = request.priority.as_str(),
            "access request submitted"
        );
        Ok(id)
    }

    /// Approves a pending request, granting access until `now +
    /// duration` where the duration is the reviewer override, else the
    /// requested hours, else 24.
    ///
    /// Returns the end of the granted window.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] when the request is
    /// not pending, or [`EngineError::NotFound`] for an unknown id.
    pub fn approve(
        &self,
        request_id: i64,
        reviewer_id: i64,
        notes: Option<&str>,
        duration_hours: Option<i64>,
    ) -> Result<DateTime<Utc>, EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        let granted_until = self.store.with_tx(|tx| {
            let request = load_for_review(tx, request_id)?;
            let duration = duration_hours.unwrap_or(request.duration_hours);
            let granted_until = now + Duration::hours(duration);

            tx.execute(
                "UPDATE access_request
                 SET status = 'approved', reviewed_by = ?2, reviewed_at = ?3,
                     review_notes = ?4, access_granted_until = ?5, updated_at = ?3
                 WHERE id = ?1",
                params![request_id, reviewer_id, now_str, notes, fmt_ts(granted_until)],
            )?;

            let mut event = AuditEvent::granted(request.user_id, AuditAction::AccessGranted);
            if let Some(object_id) = request.object_id {
                event = event.with_object(object_id);
            }
            if let Some(classification_id) = request.classification_id {
                event = event.with_classification(classification_id);
            }
            if let Some(compartment_id) = request.compartment_id {
                event = event.with_compartment(compartment_id);
            }
            if let Some(notes) = notes {
                event = event.with_justification(notes);
            }
            insert_event(tx, &event, now)?;
            Ok(granted_until)
        })?;

        tracing::info!(
            request_id,
            reviewer_id,
            granted_until = %fmt_ts(granted_until),
            "access request approved"
        );
        Ok(granted_until)
    }

    /// Denies a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] when the request is
    /// not pending, or [`EngineError::NotFound`] for an unknown id.
    pub fn deny(
        &self,
        request_id: i64,
        reviewer_id: i64,
        notes: Option<&str>,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        self.store.with_tx(|tx| {
            let request = load_for_review(tx, request_id)?;

            tx.execute(
                "UPDATE access_request
                 SET status = 'denied', reviewed_by = ?2, reviewed_at = ?3,
                     review_notes = ?4, updated_at = ?3
                 WHERE id = ?1",
                params![request_id, reviewer_id, now_str, notes],
            )?;

            let mut event = AuditEvent::denied(
                request.user_id,
                AuditAction::AccessDenied,
                notes.unwrap_or("Access request denied"),
            );
            if let Some(object_id) = request.object_id {
                event = event.with_object(object_id);
            }
            if let Some(classification_id) = request.classification_id {
                event = event.with_classification(classification_id);
            }
            if let Some(compartment_id) = request.compartment_id {
                event = event.with_compartment(compartment_id);
            }
            insert_event(tx, &event, now)?;
            Ok(())
        })?;

        tracing::info!(request_id, reviewer_id, "access request denied");
        Ok(())
    }

    /// The pending queue in triage order: priority descending, then
    /// oldest first within the same priority.
    pub fn pending(&self) -> Result<Vec<PendingRequest>, EngineError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS}, p.username, p.email, ao.title, cl.name, c.name
                 FROM access_request ar
                 JOIN principal p ON p.id = ar.user_id
                 LEFT JOIN archive_object ao ON ao.id = ar.object_id
                 LEFT JOIN classification_level cl ON cl.id = ar.classification_id
                 LEFT JOIN compartment c ON c.id = ar.compartment_id
                 WHERE ar.status = 'pending'
                 ORDER BY CASE ar.priority
                              WHEN 'urgent' THEN 3
                              WHEN 'high' THEN 2
                              WHEN 'normal' THEN 1
                              ELSE 0
                          END DESC,
                          ar.created_at ASC, ar.id ASC"
            ))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(PendingRequest {
                        request: request_from_row(row)?,
                        username: row.get(15)?,
                        email: row.get(16)?,
                        object_title: row.get(17)?,
                        classification_name: row.get(18)?,
                        compartment_name: row.get(19)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The user's own requests, newest first.
    pub fn for_user(&self, user_id: i64) -> Result<Vec<UserRequest>, EngineError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS}, ao.title, cl.name, reviewer.username
                 FROM access_request ar
                 LEFT JOIN archive_object ao ON ao.id = ar.object_id
                 LEFT JOIN classification_level cl ON cl.id = ar.classification_id
                 LEFT JOIN principal reviewer ON reviewer.id = ar.reviewed_by
                 WHERE ar.user_id = ?1
                 ORDER BY ar.created_at DESC, ar.id DESC"
            ))?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok(UserRequest {
                        request: request_from_row(row)?,
                        object_title: row.get(15)?,
                        classification_name: row.get(16)?,
                        reviewed_by_name: row.get(17)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Looks up one request by id.
    pub fn get(&self, request_id: i64) -> Result<Option<AccessRequest>, EngineError> {
        self.store.with_conn(|conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {REQUEST_COLUMNS} FROM access_request ar WHERE ar.id = ?1"),
                    params![request_id],
                    request_from_row,
                )
                .optional()?;
            Ok(found)
        })
    }
}

struct ReviewTarget {
    user_id: i64,
    object_id: Option<i64>,
    classification_id: Option<i64>,
    compartment_id: Option<i64>,
    duration_hours: i64,
}

/// Loads a request for review, enforcing that it is still pending.
fn load_for_review(
    tx: &rusqlite::Transaction<'_>,
    request_id: i64,
) -> Result<ReviewTarget, EngineError> {
    let row: Option<(String, ReviewTarget)> = tx
        .query_row(
            "SELECT status, user_id, object_id, classification_id,
                    compartment_id, duration_hours
             FROM access_request WHERE id = ?1",
            params![request_id],
            |row| {
                Ok((
                    row.get(0)?,
                    ReviewTarget {
                        user_id: row.get(1)?,
                        object_id: row.get(2)?,
                        classification_id: row.get(3)?,
                        compartment_id: row.get(4)?,
                        duration_hours: row.get(5)?,
                    },
                ))
            },
        )
        .optional()?;

    let Some((status, target)) = row else {
        return Err(EngineError::NotFound {
            entity: "access request",
            id: request_id,
        });
    };
    if status != "pending" {
        return Err(EngineError::InvalidTransition { request_id, status });
    }
    Ok(target)
}

const REQUEST_COLUMNS: &str =
    "ar.id, ar.user_id, ar.object_id, ar.classification_id, ar.compartment_id, \
     ar.request_type, ar.justification, ar.duration_hours, ar.priority, ar.status, \
     ar.reviewed_by, ar.reviewed_at, ar.review_notes, ar.access_granted_until, ar.created_at";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<AccessRequest> {
    let kind_raw: String = row.get(5)?;
    let priority_raw: String = row.get(8)?;
    let status_raw: String = row.get(9)?;
    let reviewed_raw: Option<String> = row.get(11)?;
    let granted_raw: Option<String> = row.get(13)?;
    let created_raw: String = row.get(14)?;
    Ok(AccessRequest {
        id: row.get(0)?,
        user_id: row.get(1)?,
        object_id: row.get(2)?,
        classification_id: row.get(3)?,
        compartment_id: row.get(4)?,
        kind: RequestKind::parse(&kind_raw),
        justification: row.get(6)?,
        duration_hours: row.get(7)?,
        priority: RequestPriority::parse(&priority_raw),
        status: RequestStatus::parse(&status_raw),
        reviewed_by: row.get(10)?,
        reviewed_at: reviewed_raw.as_deref().and_then(parse_ts),
        review_notes: row.get(12)?,
        access_granted_until: granted_raw.as_deref().and_then(parse_ts),
        created_at: parse_ts(&created_raw).unwrap_or(DateTime::<Utc>::MIN_UTC),
    })
}

/// Whether the user holds a live approved exception matching the record
/// or its effective level. Connection-level, used by the decision engine.
pub(crate) fn has_live_grant(
    conn: &rusqlite::Connection,
    user_id: i64,
    object_id: i64,
    classification_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM access_request
             WHERE user_id = ?1
               AND status = 'approved'
               AND access_granted_until > ?2
               AND (object_id = ?3
                    OR (?4 IS NOT NULL AND classification_id = ?4))
             LIMIT 1",
            params![user_id, fmt_ts(now), object_id, classification_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Whether the user holds a live approved exception for a compartment.
/// Connection-level, used by the decision engine.
pub(crate) fn has_live_compartment_grant(
    conn: &rusqlite::Connection,
    user_id: i64,
    compartment_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM access_request
             WHERE user_id = ?1
               AND status = 'approved'
               AND access_granted_until > ?2
               AND compartment_id = ?3
             LIMIT 1",
            params![user_id, fmt_ts(now), compartment_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::clock::ManualClock;

    use super::*;

    struct Fixture {
        store: SecurityStore,
        clock: ManualClock,
        reviewer: i64,
        user: i64,
    }

    fn fixture() -> Fixture {
        let store = SecurityStore::in_memory().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap());
        let reviewer = store.register_principal("reviewer", None, clock.now()).unwrap();
        let user = store.register_principal("analyst", None, clock.now()).unwrap();
        Fixture {
            store,
            clock,
            reviewer,
            user,
        }
    }

    #[test]
    fn submit_creates_pending_with_defaults() {
        let fx = fixture();
        let workflow = AccessRequestWorkflow::new(&fx.store, &fx.clock);

        let id = workflow
            .submit(
                fx.user,
                &SubmitRequest::new(RequestKind::ObjectAccess, "research visit"),
            )
            .unwrap();

        let request = workflow.get(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.duration_hours, 24);
        assert_eq!(request.priority, RequestPriority::Normal);
    }

    #[test]
    fn approve_sets_bounded_grant_and_is_terminal() {
        let fx = fixture();
        let workflow = AccessRequestWorkflow::new(&fx.store, &fx.clock);
        let object = fx
            .store
            .register_object(None, "F1", "Dossier", fx.clock.now())
            .unwrap();

        let id = workflow
            .submit(
                fx.user,
                &SubmitRequest::new(RequestKind::ObjectAccess, "research visit")
                    .with_object(object)
                    .with_duration_hours(4),
            )
            .unwrap();

        let granted_until = workflow.approve(id, fx.reviewer, None, None).unwrap();
        assert_eq!(granted_until, fx.clock.now() + Duration::hours(4));

        let request = workflow.get(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        assert_eq!(request.reviewed_by, Some(fx.reviewer));
        assert_eq!(request.access_granted_until, Some(granted_until));

        // Terminal: no further transitions.
        let err = workflow.deny(id, fx.reviewer, None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        let err = workflow.approve(id, fx.reviewer, None, None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn reviewer_duration_overrides_requested() {
        let fx = fixture();
        let workflow = AccessRequestWorkflow::new(&fx.store, &fx.clock);

        let id = workflow
            .submit(
                fx.user,
                &SubmitRequest::new(RequestKind::ObjectAccess, "research")
                    .with_duration_hours(72),
            )
            .unwrap();
        let granted_until = workflow.approve(id, fx.reviewer, None, Some(2)).unwrap();
        assert_eq!(granted_until, fx.clock.now() + Duration::hours(2));
    }

    #[test]
    fn deny_records_reviewer_and_notes() {
        let fx = fixture();
        let workflow = AccessRequestWorkflow::new(&fx.store, &fx.clock);

        let id = workflow
            .submit(fx.user, &SubmitRequest::new(RequestKind::ObjectAccess, "browse"))
            .unwrap();
        workflow
            .deny(id, fx.reviewer, Some("insufficient justification"))
            .unwrap();

        let request = workflow.get(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Denied);
        assert_eq!(
            request.review_notes.as_deref(),
            Some("insufficient justification")
        );
        assert!(request.access_granted_until.is_none());
    }

    #[test]
    fn review_of_unknown_request_is_not_found() {
        let fx = fixture();
        let workflow = AccessRequestWorkflow::new(&fx.store, &fx.clock);
        assert!(matches!(
            workflow.approve(404, fx.reviewer, None, None),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn pending_orders_by_priority_then_age() {
        let fx = fixture();
        let workflow = AccessRequestWorkflow::new(&fx.store, &fx.clock);

        let normal_old = workflow
            .submit(fx.user, &SubmitRequest::new(RequestKind::ObjectAccess, "first"))
            .unwrap();
        fx.clock.advance(Duration::minutes(5));
        let urgent = workflow
            .submit(
                fx.user,
                &SubmitRequest::new(RequestKind::ObjectAccess, "second")
                    .with_priority(RequestPriority::Urgent),
            )
            .unwrap();
        fx.clock.advance(Duration::minutes(5));
        let normal_new = workflow
            .submit(fx.user, &SubmitRequest::new(RequestKind::ObjectAccess, "third"))
            .unwrap();
        fx.clock.advance(Duration::minutes(5));
        let low = workflow
            .submit(
                fx.user,
                &SubmitRequest::new(RequestKind::ObjectAccess, "fourth")
                    .with_priority(RequestPriority::Low),
            )
            .unwrap();

        let queue = workflow.pending().unwrap();
        let ids: Vec<i64> = queue.iter().map(|p| p.request.id).collect();
        assert_eq!(ids, vec![urgent, normal_old, normal_new, low]);
    }

    #[test]
    fn for_user_lists_newest_first_with_reviewer() {
        let fx = fixture();
        let workflow = AccessRequestWorkflow::new(&fx.store, &fx.clock);

        let first = workflow
            .submit(fx.user, &SubmitRequest::new(RequestKind::ObjectAccess, "one"))
            .unwrap();
        fx.clock.advance(Duration::minutes(1));
        workflow
            .submit(fx.user, &SubmitRequest::new(RequestKind::ObjectAccess, "two"))
            .unwrap();
        workflow.deny(first, fx.reviewer, None).unwrap();

        let mine = workflow.for_user(fx.user).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].request.justification, "two");
        assert_eq!(mine[1].reviewed_by_name.as_deref(), Some("reviewer"));
    }
}
