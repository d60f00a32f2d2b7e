//! Compartmented access.
//!
//! Compartments partition access orthogonally to clearance rank: a record
//! assigned to compartments requires the user to hold *every* one of them
//! in addition to sufficient clearance. Granting a compartment checks the
//! user's clearance against the compartment's minimum at grant time, not
//! merely at access time; the refused grant is itself audited.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEvent, insert_event};
use crate::clearance::ClearanceLedger;
use crate::clock::{Clock, fmt_ts, parse_ts};
use crate::error::EngineError;
use crate::store::SecurityStore;

/// A named compartment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
    /// Row id.
    pub id: i64,
    /// Short unique code, e.g. `NATSEC`.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Minimum clearance level required to be granted membership.
    pub min_clearance_id: Option<i64>,
    /// Whether membership requires a recorded briefing.
    pub requires_briefing: bool,
    /// Retired compartments leave the active list.
    pub active: bool,
}

/// A user's membership in a compartment, joined with the compartment.
#[derive(Debug, Clone, Serialize)]
pub struct CompartmentGrant {
    /// The member.
    pub user_id: i64,
    /// The compartment.
    pub compartment_id: i64,
    /// Compartment code.
    pub code: String,
    /// Compartment name.
    pub name: String,
    /// Whether the compartment requires a briefing.
    pub requires_briefing: bool,
    /// Who granted membership.
    pub granted_by: i64,
    /// When membership was granted.
    pub granted_at: DateTime<Utc>,
    /// When membership lapses, if bounded.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the member was briefed, if recorded.
    pub briefing_date: Option<DateTime<Utc>>,
}

/// Optional fields for a compartment grant.
#[derive(Debug, Clone, Default)]
pub struct CompartmentGrantFields {
    /// When membership lapses; `None` for unbounded.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the member was briefed.
    pub briefing_date: Option<DateTime<Utc>>,
    /// Free-text notes.
    pub notes: Option<String>,
}

/// A record's assignment to a compartment, joined with the compartment.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectCompartment {
    /// The record.
    pub object_id: i64,
    /// The compartment.
    pub compartment_id: i64,
    /// Compartment code.
    pub code: String,
    /// Compartment name.
    pub name: String,
}

/// Service over compartments and their grants.
pub struct CompartmentRegistry<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> CompartmentRegistry<'a> {
    /// Creates a registry over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Defines a compartment and returns its id.
    ///
    /// Administrative write path.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the code collides, or
    /// [`EngineError::NotFound`] for an unknown minimum clearance level.
    pub fn create(
        &self,
        code: &str,
        name: &str,
        min_clearance_id: Option<i64>,
        requires_briefing: bool,
    ) -> Result<i64, EngineError> {
        self.store.with_conn(|conn| {
            if let Some(level_id) = min_clearance_id {
                if crate::catalog::get_level(conn, level_id)?.is_none() {
                    return Err(EngineError::NotFound {
                        entity: "classification level",
                        id: level_id,
                    });
                }
            }
            conn.execute(
                "INSERT INTO compartment (code, name, min_clearance_id, requires_briefing, active)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![code, name, min_clearance_id, requires_briefing],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// All active compartments, name-ordered.
    pub fn list_active(&self) -> Result<Vec<Compartment>, EngineError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, code, name, min_clearance_id, requires_briefing, active
                 FROM compartment
                 WHERE active = 1
                 ORDER BY name ASC",
            )?;
            let rows = stmt
                .query_map([], compartment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Looks up a compartment by id.
    pub fn get(&self, id: i64) -> Result<Option<Compartment>, EngineError> {
        self.store.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, code, name, min_clearance_id, requires_briefing, active
                     FROM compartment WHERE id = ?1",
                    params![id],
                    compartment_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// The user's active, non-expired compartment memberships.
    pub fn user_compartments(&self, user_id: i64) -> Result<Vec<CompartmentGrant>, EngineError> {
        let now = fmt_ts(self.clock.now());
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT uca.user_id, uca.compartment_id, c.code, c.name,
                        c.requires_briefing, uca.granted_by, uca.granted_at,
                        uca.expires_at, uca.briefing_date
                 FROM user_compartment_access uca
                 JOIN compartment c ON c.id = uca.compartment_id
                 WHERE uca.user_id = ?1
                   AND uca.active = 1
                   AND (uca.expires_at IS NULL OR uca.expires_at >= ?2)
                 ORDER BY c.name ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id, now], |row| {
                    let granted_raw: String = row.get(6)?;
                    let expires_raw: Option<String> = row.get(7)?;
                    let briefed_raw: Option<String> = row.get(8)?;
                    Ok(CompartmentGrant {
                        user_id: row.get(0)?,
                        compartment_id: row.get(1)?,
                        code: row.get(2)?,
                        name: row.get(3)?,
                        requires_briefing: row.get(4)?,
                        granted_by: row.get(5)?,
                        granted_at: parse_ts(&granted_raw).unwrap_or(DateTime::<Utc>::MIN_UTC),
                        expires_at: expires_raw.as_deref().and_then(parse_ts),
                        briefing_date: briefed_raw.as_deref().and_then(parse_ts),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Whether the user holds an active, non-expired grant for the
    /// compartment.
    pub fn has_access(&self, user_id: i64, compartment_id: i64) -> Result<bool, EngineError> {
        Ok(self
            .user_compartments(user_id)?
            .iter()
            .any(|grant| grant.compartment_id == compartment_id))
    }

    /// Grants compartment membership to a user.
    ///
    /// The user's active clearance rank must meet the compartment's
    /// minimum; a refusal is audited as `compartment_denied` and returned
    /// as [`EngineError::InsufficientClearance`]. Re-granting an existing
    /// pair reactivates and updates the row.
    pub fn grant(
        &self,
        user_id: i64,
        compartment_id: i64,
        fields: &CompartmentGrantFields,
        granted_by: i64,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        let compartment = self.get(compartment_id)?.ok_or(EngineError::NotFound {
            entity: "compartment",
            id: compartment_id,
        })?;

        if let Some(min_clearance_id) = compartment.min_clearance_id {
            let required = self
                .store
                .with_conn(|conn| crate::catalog::get_level(conn, min_clearance_id))?
                .ok_or(EngineError::NotFound {
                    entity: "classification level",
                    id: min_clearance_id,
                })?;

            let held = ClearanceLedger::new(self.store, self.clock).get_active(user_id)?;
            let held_rank = held.as_ref().map(|active| active.level.rank);

            if held_rank.map_or(true, |rank| rank < required.rank) {
                let held_level = held
                    .map(|active| active.level.name)
                    .unwrap_or_else(|| "no clearance".to_string());
                let err = EngineError::InsufficientClearance {
                    compartment: compartment.code.clone(),
                    required_level: required.name.clone(),
                    held_level,
                };

                self.store.with_conn(|conn| {
                    insert_event(
                        conn,
                        &AuditEvent::denied(
                            user_id,
                            AuditAction::CompartmentDenied,
                            err.to_string(),
                        )
                        .with_compartment(compartment_id),
                        now,
                    )
                })?;

                tracing::warn!(
                    user_id,
                    compartment = %compartment.code,
                    "compartment grant refused: insufficient clearance"
                );
                return Err(err);
            }
        }

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO user_compartment_access
                     (user_id, compartment_id, granted_by, granted_at,
                      expires_at, briefing_date, notes, active, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?4)
                 ON CONFLICT (user_id, compartment_id) DO UPDATE SET
                     granted_by = excluded.granted_by,
                     granted_at = excluded.granted_at,
                     expires_at = excluded.expires_at,
                     briefing_date = excluded.briefing_date,
                     notes = excluded.notes,
                     active = 1,
                     updated_at = excluded.updated_at",
                params![
                    user_id,
                    compartment_id,
                    granted_by,
                    now_str,
                    fields.expires_at.map(fmt_ts),
                    fields.briefing_date.map(fmt_ts),
                    fields.notes,
                ],
            )?;

            insert_event(
                tx,
                &AuditEvent::granted(user_id, AuditAction::CompartmentGranted)
                    .with_compartment(compartment_id),
                now,
            )?;
            Ok(())
        })?;

        tracing::info!(user_id, compartment = %compartment.code, granted_by, "compartment granted");
        Ok(())
    }

    /// Revokes compartment membership.
    ///
    /// Returns `true` when a row was deactivated.
    pub fn revoke(&self, user_id: i64, compartment_id: i64) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        let revoked = self.store.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE user_compartment_access
                 SET active = 0, updated_at = ?3
                 WHERE user_id = ?1 AND compartment_id = ?2 AND active = 1",
                params![user_id, compartment_id, now_str],
            )?;
            if changed > 0 {
                insert_event(
                    tx,
                    &AuditEvent::granted(user_id, AuditAction::CompartmentRevoked)
                        .with_compartment(compartment_id),
                    now,
                )?;
            }
            Ok(changed > 0)
        })?;

        if revoked {
            tracing::info!(user_id, compartment_id, "compartment revoked");
        }
        Ok(revoked)
    }

    /// The compartments a record is assigned to.
    pub fn object_compartments(&self, object_id: i64) -> Result<Vec<ObjectCompartment>, EngineError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT oc.object_id, oc.compartment_id, c.code, c.name
                 FROM object_compartment oc
                 JOIN compartment c ON c.id = oc.compartment_id
                 WHERE oc.object_id = ?1
                 ORDER BY oc.id ASC",
            )?;
            let rows = stmt
                .query_map(params![object_id], |row| {
                    Ok(ObjectCompartment {
                        object_id: row.get(0)?,
                        compartment_id: row.get(1)?,
                        code: row.get(2)?,
                        name: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Assigns a record to a compartment. Idempotent per pair.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown record or
    /// compartment.
    pub fn assign_object(
        &self,
        object_id: i64,
        compartment_id: i64,
        assigned_by: i64,
        notes: Option<&str>,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        if self.get(compartment_id)?.is_none() {
            return Err(EngineError::NotFound {
                entity: "compartment",
                id: compartment_id,
            });
        }

        self.store.with_tx(|tx| {
            if !crate::store::object_exists(tx, object_id)? {
                return Err(EngineError::NotFound {
                    entity: "archive object",
                    id: object_id,
                });
            }

            tx.execute(
                "INSERT INTO object_compartment
                     (object_id, compartment_id, assigned_by, assigned_at, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (object_id, compartment_id) DO UPDATE SET
                     assigned_by = excluded.assigned_by,
                     assigned_at = excluded.assigned_at,
                     notes = excluded.notes",
                params![object_id, compartment_id, assigned_by, now_str, notes],
            )?;

            insert_event(
                tx,
                &AuditEvent::granted(assigned_by, AuditAction::CompartmentAssigned)
                    .with_object(object_id)
                    .with_compartment(compartment_id),
                now,
            )?;
            Ok(())
        })
    }
}

/// Connection-level `(compartment_id, name)` pairs required by a record,
/// shared with the decision engine.
pub(crate) fn object_compartment_pairs(
    conn: &rusqlite::Connection,
    object_id: i64,
) -> Result<Vec<(i64, String)>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT oc.compartment_id, c.name
         FROM object_compartment oc
         JOIN compartment c ON c.id = oc.compartment_id
         WHERE oc.object_id = ?1
         ORDER BY oc.id ASC",
    )?;
    let pairs = stmt
        .query_map(params![object_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pairs)
}

/// Connection-level set of the user's active, non-expired compartment
/// ids, shared with the decision engine.
pub(crate) fn user_compartment_ids(
    conn: &rusqlite::Connection,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<std::collections::HashSet<i64>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT compartment_id FROM user_compartment_access
         WHERE user_id = ?1
           AND active = 1
           AND (expires_at IS NULL OR expires_at >= ?2)",
    )?;
    let ids = stmt
        .query_map(params![user_id, fmt_ts(now)], |row| row.get(0))?
        .collect::<Result<std::collections::HashSet<_>, _>>()?;
    Ok(ids)
}

fn compartment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Compartment> {
    Ok(Compartment {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        min_clearance_id: row.get(3)?,
        requires_briefing: row.get(4)?,
        active: row.get(5)?,
    })
}
