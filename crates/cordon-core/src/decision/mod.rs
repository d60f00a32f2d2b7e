//! Access decision engine.
//!
//! [`AccessDecisionEngine::can_access`] combines effective classification,
//! clearance, step-up verification, compartment membership, and action
//! permissions into a single allow/deny decision. The checks short-circuit
//! in a fixed order so denial reasons are predictable:
//!
//! 1. Unclassified record: public, allow.
//! 2. No active clearance: deny, request path open.
//! 3. Clearance rank below the record's: deny, request path open.
//! 4. Level requires step-up and none is valid: deny, step-up required.
//! 5. Record requires compartments the user lacks: deny, naming the first
//!    missing one, request path open.
//! 6. The level forbids the requested action (download/print): policy
//!    deny, no request path.
//! 7. Allow; `watermark_required` mirrors the level flag.
//!
//! A live approved access request for the record, its effective level, or
//! (step 5) the missing compartment overrides a deny from steps 2-5.
//! Action-permission denials are never overridden.
//!
//! The function is pure with respect to its inputs: it mutates nothing
//! and writes no audit entries. Callers record the outcome through
//! [`crate::audit::AuditLog`] themselves. Denial is a value, not an
//! error; an `Err` from this function is infrastructure failure and call
//! sites must fail closed.

use serde::Serialize;

use crate::audit::AuditAction;
use crate::clearance::active_with_level;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::object::effective_level;
use crate::request::{has_live_compartment_grant, has_live_grant};
use crate::stepup::has_valid_session;
use crate::store::SecurityStore;

/// The action a caller is about to perform on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    /// Render the record on screen.
    View,
    /// Export the record's digital object.
    Download,
    /// Print the record.
    Print,
}

impl AccessAction {
    /// The matching audit action for recording the outcome.
    #[must_use]
    pub const fn audit_action(self) -> AuditAction {
        match self {
            Self::View => AuditAction::View,
            Self::Download => AuditAction::Download,
            Self::Print => AuditAction::Print,
        }
    }
}

/// The outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the action may proceed.
    pub allowed: bool,
    /// Why not, for denials; context for exception-path allows.
    pub reason: Option<String>,
    /// The caller should complete step-up verification and retry.
    pub requires_2fa: bool,
    /// The caller may submit an access request for this denial.
    pub requires_request: bool,
    /// Allowed exports must carry a traceable watermark.
    pub watermark_required: bool,
}

impl Decision {
    /// An unconditional allow (public record).
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            requires_2fa: false,
            requires_request: false,
            watermark_required: false,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_owned()),
            requires_2fa: false,
            requires_request: false,
            watermark_required: false,
        }
    }

    fn deny_requestable(reason: String) -> Self {
        Self {
            requires_request: true,
            ..Self::deny(&reason)
        }
    }
}

/// Read-only service combining the other components into decisions.
pub struct AccessDecisionEngine<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> AccessDecisionEngine<'a> {
    /// Creates the engine over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Decides whether `user_id` may perform `action` on `object_id`.
    ///
    /// `session_id` is the caller's ambient session, consulted for the
    /// step-up check; pass `None` when there is no session context.
    ///
    /// # Errors
    ///
    /// Only on storage failure. Every normal denial is a `Decision`.
    pub fn can_access(
        &self,
        user_id: i64,
        object_id: i64,
        action: AccessAction,
        session_id: Option<&str>,
    ) -> Result<Decision, EngineError> {
        let now = self.clock.now();

        let decision = self.store.with_conn(|conn| {
            // 1. Unclassified records are public.
            let Some(level) = effective_level(conn, object_id)? else {
                return Ok(Decision::allow());
            };

            // A live approved exception for the record or its level
            // overrides the clearance, step-up, and compartment checks.
            let exception = has_live_grant(conn, user_id, object_id, Some(level.id), now)?;

            if !exception {
                // 2. The user must hold an active, non-expired clearance.
                let Some(active) = active_with_level(conn, user_id, now)? else {
                    return Ok(Decision::deny_requestable("No security clearance".to_owned()));
                };

                // 3. Clearance rank must reach the record's rank.
                if active.level.rank < level.rank {
                    return Ok(Decision::deny_requestable(
                        "Insufficient clearance level".to_owned(),
                    ));
                }

                // 4. Step-up verification for levels that demand it.
                if level.requires_2fa {
                    let verified = match session_id {
                        Some(session_id) => has_valid_session(conn, user_id, session_id, now)?,
                        None => false,
                    };
                    if !verified {
                        return Ok(Decision {
                            requires_2fa: true,
                            ..Decision::deny("Two-factor authentication required")
                        });
                    }
                }

                // 5. Every compartment on the record must be held.
                let required = crate::compartment::object_compartment_pairs(conn, object_id)?;
                if !required.is_empty() {
                    let held = crate::compartment::user_compartment_ids(conn, user_id, now)?;
                    for (compartment_id, name) in required {
                        if held.contains(&compartment_id) {
                            continue;
                        }
                        if has_live_compartment_grant(conn, user_id, compartment_id, now)? {
                            continue;
                        }
                        return Ok(Decision::deny_requestable(format!(
                            "Compartment access required: {name}"
                        )));
                    }
                }
            }

            // 6. Action permissions are policy, not clearance: no request
            //    path, and no exception override.
            if action == AccessAction::Download && !level.download_allowed {
                return Ok(Decision::deny(
                    "Downloads not permitted for this classification",
                ));
            }
            if action == AccessAction::Print && !level.print_allowed {
                return Ok(Decision::deny(
                    "Printing not permitted for this classification",
                ));
            }

            // 7. Allowed.
            Ok(Decision {
                reason: exception.then(|| "Temporary access granted".to_owned()),
                watermark_required: level.watermark_required,
                ..Decision::allow()
            })
        })?;

        tracing::debug!(
            user_id,
            object_id,
            action = ?action,
            allowed = decision.allowed,
            reason = decision.reason.as_deref().unwrap_or(""),
            "access decision"
        );
        Ok(decision)
    }
}
