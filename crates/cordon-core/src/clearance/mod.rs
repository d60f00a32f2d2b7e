//! User clearance ledger.
//!
//! Tracks each user's current and historical clearance grants. At most one
//! grant is active per user; granting supersedes the prior row inside one
//! transaction and writes a history entry whose action (`granted`,
//! `upgraded`, `downgraded`) comes from comparing the prior and new ranks.
//!
//! Expiry is evaluated at read time, not by a background sweep: every
//! query that reads a clearance applies the non-expired filter.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEvent, insert_event};
use crate::catalog::{ClassificationLevel, get_level, level_columns, level_from_row};
use crate::clock::{Clock, fmt_ts, parse_ts};
use crate::error::EngineError;
use crate::store::SecurityStore;

/// Renewal workflow state carried on the active grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    /// No renewal in flight.
    None,
    /// The holder has asked for renewal.
    Pending,
    /// The last renewal request was approved.
    Approved,
}

impl RenewalStatus {
    /// The stable string form persisted in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "approved" => Self::Approved,
            _ => Self::None,
        }
    }
}

/// History action for a clearance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearanceAction {
    /// First grant, or re-grant at the same rank.
    Granted,
    /// Superseded by a higher-ranked level.
    Upgraded,
    /// Superseded by a lower-ranked level.
    Downgraded,
    /// Active grant deactivated.
    Revoked,
    /// Expiry extended through the renewal workflow.
    Renewed,
}

impl ClearanceAction {
    /// The stable string form persisted in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Upgraded => "upgraded",
            Self::Downgraded => "downgraded",
            Self::Revoked => "revoked",
            Self::Renewed => "renewed",
        }
    }
}

/// A clearance grant row.
#[derive(Debug, Clone, Serialize)]
pub struct UserClearance {
    /// Row id.
    pub id: i64,
    /// The holder.
    pub user_id: i64,
    /// The granted level.
    pub classification_id: i64,
    /// Who granted it.
    pub granted_by: i64,
    /// When it was granted.
    pub granted_at: DateTime<Utc>,
    /// When it lapses, if bounded.
    pub expires_at: Option<DateTime<Utc>>,
    /// Vetting case reference.
    pub vetting_reference: Option<String>,
    /// Free-text notes from the granting officer.
    pub notes: Option<String>,
    /// Renewal workflow state.
    pub renewal_status: RenewalStatus,
    /// Whether this is the user's current grant.
    pub active: bool,
}

/// An active grant joined with its level.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveClearance {
    /// The grant row.
    pub clearance: UserClearance,
    /// The granted level, with its handling controls.
    pub level: ClassificationLevel,
}

/// Optional fields for a grant.
#[derive(Debug, Clone, Default)]
pub struct GrantFields {
    /// When the grant lapses; `None` for an unbounded grant.
    pub expires_at: Option<DateTime<Utc>>,
    /// Vetting case reference.
    pub vetting_reference: Option<String>,
    /// Free-text notes.
    pub notes: Option<String>,
}

/// A clearance history row.
#[derive(Debug, Clone, Serialize)]
pub struct ClearanceHistoryEntry {
    /// Row id.
    pub id: i64,
    /// The affected user.
    pub user_id: i64,
    /// Level before the change, if any.
    pub previous_classification_id: Option<i64>,
    /// Level after the change; `None` for revocations.
    pub new_classification_id: Option<i64>,
    /// What happened, in stable string form.
    pub action: String,
    /// Who made the change.
    pub changed_by: i64,
    /// Free-text reason.
    pub reason: Option<String>,
    /// When the change happened.
    pub created_at: DateTime<Utc>,
}

/// A clearance lapsing soon, for operational alerts.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiringClearance {
    /// The holder.
    pub user_id: i64,
    /// The holder's username.
    pub username: String,
    /// The holder's contact address.
    pub email: Option<String>,
    /// Code of the granted level.
    pub level_code: String,
    /// Name of the granted level.
    pub level_name: String,
    /// When the grant lapses.
    pub expires_at: DateTime<Utc>,
    /// Renewal workflow state.
    pub renewal_status: RenewalStatus,
    /// Whole days until expiry, floored at zero.
    pub days_remaining: i64,
}

/// Service over the clearance ledger.
pub struct ClearanceLedger<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> ClearanceLedger<'a> {
    /// Creates a ledger over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Returns the user's current, non-expired clearance with its level.
    ///
    /// An `active` row whose `expires_at` has passed is never returned.
    pub fn get_active(&self, user_id: i64) -> Result<Option<ActiveClearance>, EngineError> {
        let now = self.clock.now();
        self.store
            .with_conn(|conn| active_with_level(conn, user_id, now))
    }

    /// Grants `classification_id` to `user_id`, superseding any prior
    /// grant.
    ///
    /// Runs in one transaction: the prior active row is read for history,
    /// deactivated, the new row inserted, and a history entry written with
    /// the action derived from the rank comparison. A storage failure
    /// rolls the whole operation back.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown classification.
    pub fn grant(
        &self,
        user_id: i64,
        classification_id: i64,
        fields: &GrantFields,
        granted_by: i64,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        let action = self.store.with_tx(|tx| {
            let new_level =
                get_level(tx, classification_id)?.ok_or(EngineError::NotFound {
                    entity: "classification level",
                    id: classification_id,
                })?;

            let prior: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT id, classification_id FROM user_clearance
                     WHERE user_id = ?1 AND active = 1",
                    params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            tx.execute(
                "UPDATE user_clearance SET active = 0, updated_at = ?2
                 WHERE user_id = ?1 AND active = 1",
                params![user_id, now_str],
            )?;

            tx.execute(
                "INSERT INTO user_clearance
                     (user_id, classification_id, granted_by, granted_at,
                      expires_at, vetting_reference, notes, renewal_status,
                      active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'none', 1, ?4, ?4)",
                params![
                    user_id,
                    classification_id,
                    granted_by,
                    now_str,
                    fields.expires_at.map(fmt_ts),
                    fields.vetting_reference,
                    fields.notes,
                ],
            )?;

            let action = match prior {
                None => ClearanceAction::Granted,
                Some((_, prior_classification_id)) => {
                    let prior_level = get_level(tx, prior_classification_id)?;
                    match prior_level {
                        Some(prior_level) if new_level.rank > prior_level.rank => {
                            ClearanceAction::Upgraded
                        }
                        Some(prior_level) if new_level.rank < prior_level.rank => {
                            ClearanceAction::Downgraded
                        }
                        _ => ClearanceAction::Granted,
                    }
                }
            };

            insert_history(
                tx,
                user_id,
                prior.map(|(_, classification_id)| classification_id),
                Some(classification_id),
                action,
                granted_by,
                fields.notes.as_deref(),
                &now_str,
            )?;

            let mut event = AuditEvent::granted(user_id, AuditAction::ClearanceGranted)
                .with_classification(classification_id);
            if let Some(notes) = &fields.notes {
                event = event.with_justification(notes.clone());
            }
            insert_event(tx, &event, now)?;

            Ok(action)
        })?;

        tracing::info!(
            user_id,
            classification_id,
            granted_by,
            action = action.as_str(),
            "clearance granted"
        );
        Ok(())
    }

    /// Revokes the user's active clearance.
    ///
    /// Returns `Ok(true)` when a grant was deactivated and a `revoked`
    /// history entry written; `Ok(false)` when there was nothing to
    /// revoke (deterministic no-op, no history entry).
    pub fn revoke(
        &self,
        user_id: i64,
        revoked_by: i64,
        reason: Option<&str>,
    ) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        let revoked = self.store.with_tx(|tx| {
            let prior: Option<i64> = tx
                .query_row(
                    "SELECT classification_id FROM user_clearance
                     WHERE user_id = ?1 AND active = 1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(prior_classification_id) = prior else {
                return Ok(false);
            };

            tx.execute(
                "UPDATE user_clearance SET active = 0, updated_at = ?2
                 WHERE user_id = ?1 AND active = 1",
                params![user_id, now_str],
            )?;

            insert_history(
                tx,
                user_id,
                Some(prior_classification_id),
                None,
                ClearanceAction::Revoked,
                revoked_by,
                reason,
                &now_str,
            )?;

            let mut event = AuditEvent::granted(user_id, AuditAction::ClearanceRevoked)
                .with_classification(prior_classification_id);
            if let Some(reason) = reason {
                event = event.with_justification(reason);
            }
            insert_event(tx, &event, now)?;

            Ok(true)
        })?;

        if revoked {
            tracing::info!(user_id, revoked_by, "clearance revoked");
        }
        Ok(revoked)
    }

    /// Marks the user's active grant as awaiting renewal.
    ///
    /// Returns `Ok(false)` when the user has no active grant.
    pub fn request_renewal(&self, user_id: i64, notes: Option<&str>) -> Result<bool, EngineError> {
        let now_str = fmt_ts(self.clock.now());
        let changed = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE user_clearance
                 SET renewal_status = 'pending', renewal_requested_at = ?2,
                     notes = COALESCE(?3, notes), updated_at = ?2
                 WHERE user_id = ?1 AND active = 1",
                params![user_id, now_str, notes],
            )?)
        })?;
        Ok(changed > 0)
    }

    /// Approves a pending renewal, extending expiry to `new_expiry` or by
    /// one year from now.
    ///
    /// Returns the new expiry instant.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the user has no active
    /// grant.
    pub fn approve_renewal(
        &self,
        user_id: i64,
        approved_by: i64,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);
        let expiry = new_expiry.unwrap_or(now + Duration::days(365));
        let expiry_str = fmt_ts(expiry);

        self.store.with_tx(|tx| {
            let clearance: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT id, classification_id FROM user_clearance
                     WHERE user_id = ?1 AND active = 1",
                    params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((row_id, classification_id)) = clearance else {
                return Err(EngineError::NotFound {
                    entity: "active clearance",
                    id: user_id,
                });
            };

            tx.execute(
                "UPDATE user_clearance
                 SET expires_at = ?2, renewal_status = 'approved', updated_at = ?3
                 WHERE id = ?1",
                params![row_id, expiry_str, now_str],
            )?;

            let reason = format!("Renewed until {expiry_str}");
            insert_history(
                tx,
                user_id,
                Some(classification_id),
                Some(classification_id),
                ClearanceAction::Renewed,
                approved_by,
                Some(&reason),
                &now_str,
            )?;

            insert_event(
                tx,
                &AuditEvent::granted(user_id, AuditAction::ClearanceRenewed)
                    .with_classification(classification_id)
                    .with_justification(reason),
                now,
            )?;

            Ok(())
        })?;

        tracing::info!(user_id, approved_by, expires_at = %expiry_str, "clearance renewed");
        Ok(expiry)
    }

    /// Active, bounded clearances lapsing within `days`, soonest first.
    pub fn expiring_within(&self, days: i64) -> Result<Vec<ExpiringClearance>, EngineError> {
        let now = self.clock.now();
        let horizon = fmt_ts(now + Duration::days(days));
        let now_str = fmt_ts(now);

        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT uc.user_id, p.username, p.email, cl.code, cl.name,
                        uc.expires_at, uc.renewal_status
                 FROM user_clearance uc
                 JOIN principal p ON p.id = uc.user_id
                 JOIN classification_level cl ON cl.id = uc.classification_id
                 WHERE uc.active = 1
                   AND uc.expires_at IS NOT NULL
                   AND uc.expires_at <= ?1
                   AND uc.expires_at >= ?2
                 ORDER BY uc.expires_at ASC",
            )?;
            let rows = stmt
                .query_map(params![horizon, now_str], |row| {
                    let expires_raw: String = row.get(5)?;
                    let renewal_raw: String = row.get(6)?;
                    let expires_at = parse_ts(&expires_raw).unwrap_or(DateTime::<Utc>::MIN_UTC);
                    Ok(ExpiringClearance {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        level_code: row.get(3)?,
                        level_name: row.get(4)?,
                        expires_at,
                        renewal_status: RenewalStatus::parse(&renewal_raw),
                        days_remaining: (expires_at - now).num_days().max(0),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The user's clearance history, newest first.
    pub fn history(&self, user_id: i64) -> Result<Vec<ClearanceHistoryEntry>, EngineError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, previous_classification_id,
                        new_classification_id, action, changed_by, reason,
                        created_at
                 FROM clearance_history
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    let created_raw: String = row.get(7)?;
                    Ok(ClearanceHistoryEntry {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        previous_classification_id: row.get(2)?,
                        new_classification_id: row.get(3)?,
                        action: row.get(4)?,
                        changed_by: row.get(5)?,
                        reason: row.get(6)?,
                        created_at: parse_ts(&created_raw).unwrap_or(DateTime::<Utc>::MIN_UTC),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

/// Connection-level active-clearance read shared with the decision
/// engine. Applies the non-expired filter; an `active` row whose expiry
/// has passed is invisible here.
pub(crate) fn active_with_level(
    conn: &rusqlite::Connection,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<ActiveClearance>, EngineError> {
    let sql = format!(
        "SELECT uc.id, uc.user_id, uc.classification_id, uc.granted_by,
                uc.granted_at, uc.expires_at, uc.vetting_reference,
                uc.notes, uc.renewal_status, uc.active, {}
         FROM user_clearance uc
         JOIN classification_level cl ON cl.id = uc.classification_id
         WHERE uc.user_id = ?1
           AND uc.active = 1
           AND (uc.expires_at IS NULL OR uc.expires_at >= ?2)",
        level_columns("cl")
    );
    let found = conn
        .query_row(&sql, params![user_id, fmt_ts(now)], |row| {
            Ok(ActiveClearance {
                clearance: clearance_from_row(row)?,
                level: level_from_row(row, 10)?,
            })
        })
        .optional()?;
    Ok(found)
}

fn clearance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserClearance> {
    let granted_raw: String = row.get(4)?;
    let expires_raw: Option<String> = row.get(5)?;
    let renewal_raw: String = row.get(8)?;
    Ok(UserClearance {
        id: row.get(0)?,
        user_id: row.get(1)?,
        classification_id: row.get(2)?,
        granted_by: row.get(3)?,
        granted_at: parse_ts(&granted_raw).unwrap_or(DateTime::<Utc>::MIN_UTC),
        expires_at: expires_raw.as_deref().and_then(parse_ts),
        vetting_reference: row.get(6)?,
        notes: row.get(7)?,
        renewal_status: RenewalStatus::parse(&renewal_raw),
        active: row.get(9)?,
    })
}

#[allow(clippy::too_many_arguments)]
fn insert_history(
    tx: &rusqlite::Transaction<'_>,
    user_id: i64,
    previous_classification_id: Option<i64>,
    new_classification_id: Option<i64>,
    action: ClearanceAction,
    changed_by: i64,
    reason: Option<&str>,
    now_str: &str,
) -> Result<(), EngineError> {
    tx.execute(
        "INSERT INTO clearance_history
             (user_id, previous_classification_id, new_classification_id,
              action, changed_by, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            previous_classification_id,
            new_classification_id,
            action.as_str(),
            changed_by,
            reason,
            now_str,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::catalog::{ClassificationCatalog, NewLevel};
    use crate::clock::ManualClock;

    use super::*;

    struct Fixture {
        store: SecurityStore,
        clock: ManualClock,
        public_id: i64,
        secret_id: i64,
        admin: i64,
        user: i64,
    }

    fn fixture() -> Fixture {
        let store = SecurityStore::in_memory().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap());
        let catalog = ClassificationCatalog::new(&store);
        let public_id = catalog
            .seed_level(&NewLevel::open("PUBLIC", "Public", 0))
            .unwrap();
        let secret_id = catalog
            .seed_level(&NewLevel::controlled("SECRET", "Secret", 2))
            .unwrap();
        let admin = store
            .register_principal("admin", None, clock.now())
            .unwrap();
        let user = store
            .register_principal("analyst", Some("analyst@example.org"), clock.now())
            .unwrap();
        Fixture {
            store,
            clock,
            public_id,
            secret_id,
            admin,
            user,
        }
    }

    #[test]
    fn grant_then_read_active() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

        ledger
            .grant(fx.user, fx.secret_id, &GrantFields::default(), fx.admin)
            .unwrap();

        let active = ledger.get_active(fx.user).unwrap().unwrap();
        assert_eq!(active.level.code, "SECRET");
        assert_eq!(active.clearance.granted_by, fx.admin);
        assert_eq!(active.clearance.renewal_status, RenewalStatus::None);
    }

    #[test]
    fn grant_unknown_level_is_not_found_and_leaves_no_state() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

        let err = ledger
            .grant(fx.user, 999, &GrantFields::default(), fx.admin)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert!(ledger.get_active(fx.user).unwrap().is_none());
        assert!(ledger.history(fx.user).unwrap().is_empty());
    }

    #[test]
    fn regrant_supersedes_and_labels_direction() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

        ledger
            .grant(fx.user, fx.public_id, &GrantFields::default(), fx.admin)
            .unwrap();
        ledger
            .grant(fx.user, fx.secret_id, &GrantFields::default(), fx.admin)
            .unwrap();
        ledger
            .grant(fx.user, fx.public_id, &GrantFields::default(), fx.admin)
            .unwrap();

        let history = ledger.history(fx.user).unwrap();
        let actions: Vec<&str> = history.iter().map(|h| h.action.as_str()).collect();
        // Newest first: downgrade, upgrade, initial grant.
        assert_eq!(actions, vec!["downgraded", "upgraded", "granted"]);

        // Exactly one active row survives the sequence.
        let active_rows: i64 = fx
            .store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM user_clearance WHERE user_id = ?1 AND active = 1",
                    params![fx.user],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(active_rows, 1);
    }

    #[test]
    fn expired_clearance_is_never_returned() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

        let fields = GrantFields {
            expires_at: Some(fx.clock.now() + Duration::days(10)),
            ..GrantFields::default()
        };
        ledger.grant(fx.user, fx.secret_id, &fields, fx.admin).unwrap();
        assert!(ledger.get_active(fx.user).unwrap().is_some());

        fx.clock.advance(Duration::days(11));
        // Row still has active = 1, but the read filter hides it.
        assert!(ledger.get_active(fx.user).unwrap().is_none());
    }

    #[test]
    fn revoke_is_deterministic_about_missing_grants() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

        assert!(!ledger.revoke(fx.user, fx.admin, None).unwrap());
        assert!(ledger.history(fx.user).unwrap().is_empty());

        ledger
            .grant(fx.user, fx.secret_id, &GrantFields::default(), fx.admin)
            .unwrap();
        assert!(ledger
            .revoke(fx.user, fx.admin, Some("vetting lapsed"))
            .unwrap());
        assert!(ledger.get_active(fx.user).unwrap().is_none());

        let history = ledger.history(fx.user).unwrap();
        assert_eq!(history[0].action, "revoked");
        assert_eq!(history[0].reason.as_deref(), Some("vetting lapsed"));
    }

    #[test]
    fn renewal_extends_expiry_by_default_year() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

        let fields = GrantFields {
            expires_at: Some(fx.clock.now() + Duration::days(20)),
            ..GrantFields::default()
        };
        ledger.grant(fx.user, fx.secret_id, &fields, fx.admin).unwrap();

        assert!(ledger.request_renewal(fx.user, Some("still assigned")).unwrap());
        let active = ledger.get_active(fx.user).unwrap().unwrap();
        assert_eq!(active.clearance.renewal_status, RenewalStatus::Pending);

        let new_expiry = ledger.approve_renewal(fx.user, fx.admin, None).unwrap();
        assert_eq!(new_expiry, fx.clock.now() + Duration::days(365));

        let active = ledger.get_active(fx.user).unwrap().unwrap();
        assert_eq!(active.clearance.renewal_status, RenewalStatus::Approved);
        assert_eq!(active.clearance.expires_at, Some(new_expiry));
        assert_eq!(ledger.history(fx.user).unwrap()[0].action, "renewed");
    }

    #[test]
    fn approve_renewal_without_grant_is_not_found() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);
        assert!(matches!(
            ledger.approve_renewal(fx.user, fx.admin, None),
            Err(EngineError::NotFound { .. })
        ));
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Any interleaving of grants and revokes across several
            /// users leaves at most one active clearance row per user.
            #[test]
            fn prop_at_most_one_active_row(
                ops in prop::collection::vec(
                    (0..3usize, prop::option::of(0..2usize)),
                    1..24,
                )
            ) {
                let fx = fixture();
                let third = fx
                    .store
                    .register_principal("third", None, fx.clock.now())
                    .unwrap();
                let users = [fx.user, fx.admin, third];
                let levels = [fx.public_id, fx.secret_id];
                let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

                for (user_idx, op) in ops {
                    let user_id = users[user_idx];
                    match op {
                        Some(level_idx) => ledger
                            .grant(
                                user_id,
                                levels[level_idx],
                                &GrantFields::default(),
                                fx.admin,
                            )
                            .unwrap(),
                        None => {
                            ledger.revoke(user_id, fx.admin, None).unwrap();
                        }
                    }

                    for user_id in users {
                        let active_rows: i64 = fx
                            .store
                            .with_conn(|conn| {
                                Ok(conn.query_row(
                                    "SELECT COUNT(*) FROM user_clearance
                                     WHERE user_id = ?1 AND active = 1",
                                    params![user_id],
                                    |row| row.get(0),
                                )?)
                            })
                            .unwrap();
                        prop_assert!(active_rows <= 1);
                    }
                }
            }
        }
    }

    #[test]
    fn expiring_within_reports_days_remaining() {
        let fx = fixture();
        let ledger = ClearanceLedger::new(&fx.store, &fx.clock);

        let fields = GrantFields {
            expires_at: Some(fx.clock.now() + Duration::days(14)),
            ..GrantFields::default()
        };
        ledger.grant(fx.user, fx.secret_id, &fields, fx.admin).unwrap();

        let soon = ledger.expiring_within(30).unwrap();
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0].username, "analyst");
        assert_eq!(soon[0].days_remaining, 14);

        assert!(ledger.expiring_within(7).unwrap().is_empty());
    }
}
