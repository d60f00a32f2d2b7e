//! Step-up authentication sessions.
//!
//! A step-up session is short-lived proof that a user completed a second
//! factor. Levels flagged `requires_2fa` gate access on a valid session
//! for the caller's ambient session id.
//!
//! Creating a session invalidates all of the user's prior sessions in the
//! same transaction, so two sessions are never simultaneously valid.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::audit::{AuditAction, AuditEvent, insert_event};
use crate::clock::{Clock, fmt_ts, parse_ts};
use crate::error::EngineError;
use crate::store::SecurityStore;

/// Default session validity, matching the operational default of one
/// working day.
pub const DEFAULT_VALIDITY_HOURS: i64 = 8;

/// A verified step-up session.
#[derive(Debug, Clone, Serialize)]
pub struct StepUpSession {
    /// The verified user.
    pub user_id: i64,
    /// The ambient session the verification is bound to.
    pub session_id: String,
    /// When the second factor was verified.
    pub verified_at: DateTime<Utc>,
    /// When the session lapses.
    pub expires_at: DateTime<Utc>,
    /// Origin of the verification request, when supplied.
    pub ip_address: Option<String>,
}

/// Service over step-up sessions.
pub struct StepUpSessions<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> StepUpSessions<'a> {
    /// Creates the service over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Records a verified second factor for `(user_id, session_id)`.
    ///
    /// All of the user's prior sessions are deleted in the same
    /// transaction; `valid_for` defaults to
    /// [`DEFAULT_VALIDITY_HOURS`]. The verification is audited.
    pub fn create(
        &self,
        user_id: i64,
        session_id: &str,
        valid_for: Option<Duration>,
        ip_address: Option<&str>,
    ) -> Result<StepUpSession, EngineError> {
        let now = self.clock.now();
        let expires_at = now + valid_for.unwrap_or_else(|| Duration::hours(DEFAULT_VALIDITY_HOURS));

        self.store.with_tx(|tx| {
            tx.execute(
                "DELETE FROM stepup_session WHERE user_id = ?1",
                params![user_id],
            )?;
            tx.execute(
                "INSERT INTO stepup_session
                     (user_id, session_id, verified_at, expires_at, ip_address)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    session_id,
                    fmt_ts(now),
                    fmt_ts(expires_at),
                    ip_address,
                ],
            )?;

            insert_event(
                tx,
                &AuditEvent::granted(user_id, AuditAction::StepUpVerified).with_request_context(
                    ip_address,
                    None,
                    Some(session_id),
                ),
                now,
            )?;
            Ok(())
        })?;

        tracing::info!(user_id, session_id, "step-up session verified");
        Ok(StepUpSession {
            user_id,
            session_id: session_id.to_owned(),
            verified_at: now,
            expires_at,
            ip_address: ip_address.map(str::to_owned),
        })
    }

    /// Whether a valid (unexpired) session exists for
    /// `(user_id, session_id)`.
    pub fn has_valid(&self, user_id: i64, session_id: &str) -> Result<bool, EngineError> {
        let now = self.clock.now();
        self.store
            .with_conn(|conn| has_valid_session(conn, user_id, session_id, now))
    }

    /// Returns the session bound to `(user_id, session_id)` if still
    /// valid.
    pub fn get(
        &self,
        user_id: i64,
        session_id: &str,
    ) -> Result<Option<StepUpSession>, EngineError> {
        let now = fmt_ts(self.clock.now());
        self.store.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT user_id, session_id, verified_at, expires_at, ip_address
                     FROM stepup_session
                     WHERE user_id = ?1 AND session_id = ?2 AND expires_at > ?3",
                    params![user_id, session_id, now],
                    |row| {
                        let verified_raw: String = row.get(2)?;
                        let expires_raw: String = row.get(3)?;
                        Ok(StepUpSession {
                            user_id: row.get(0)?,
                            session_id: row.get(1)?,
                            verified_at: parse_ts(&verified_raw)
                                .unwrap_or(DateTime::<Utc>::MIN_UTC),
                            expires_at: parse_ts(&expires_raw)
                                .unwrap_or(DateTime::<Utc>::MIN_UTC),
                            ip_address: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
    }

    /// Invalidates every step-up session bound to `session_id`, e.g. on
    /// logout.
    pub fn invalidate(&self, session_id: &str) -> Result<(), EngineError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM stepup_session WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
    }

    /// Deletes expired sessions and returns how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize, EngineError> {
        let now = fmt_ts(self.clock.now());
        let removed = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM stepup_session WHERE expires_at <= ?1",
                params![now],
            )?)
        })?;
        if removed > 0 {
            tracing::debug!(removed, "expired step-up sessions removed");
        }
        Ok(removed)
    }
}

/// Connection-level validity check shared with the decision engine.
pub(crate) fn has_valid_session(
    conn: &rusqlite::Connection,
    user_id: i64,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM stepup_session
             WHERE user_id = ?1 AND session_id = ?2 AND expires_at > ?3",
            params![user_id, session_id, fmt_ts(now)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
