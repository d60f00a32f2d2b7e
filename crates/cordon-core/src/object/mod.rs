//! Object classification over the record tree.
//!
//! Records inherit classification from their ancestors: the effective
//! classification of a record is its own direct classification if present,
//! otherwise the nearest ancestor's direct classification, provided that
//! ancestor marked it inheritable.
//!
//! The escalation constraint is enforced here: a child record can never be
//! directly classified below its parent's effective classification.
//! Violations are rejected with both level names in the error, never
//! silently clamped.
//!
//! Declassification can be scheduled; [`ObjectClassifier::process_due`] is
//! invoked by an external periodic trigger, not a built-in timer.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::audit::{AuditAction, AuditEvent, insert_event};
use crate::catalog::{ClassificationLevel, get_level, level_columns, level_from_row};
use crate::clock::{Clock, fmt_ts, parse_ts};
use crate::error::EngineError;
use crate::store::{SecurityStore, object_parent};

/// Upper bound on the ancestor walk. Containment trees are expected to be
/// shallow and acyclic; the bound keeps a malformed tree from looping.
const MAX_WALK_DEPTH: usize = 64;

/// A record's direct classification row.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectClassification {
    /// The classified record.
    pub object_id: i64,
    /// The assigned level.
    pub classification_id: i64,
    /// Who classified it.
    pub classified_by: i64,
    /// When it was classified.
    pub classified_at: DateTime<Utc>,
    /// When the classification should be reviewed.
    pub review_date: Option<DateTime<Utc>>,
    /// When the record is due for declassification.
    pub declassify_date: Option<DateTime<Utc>>,
    /// Level to drop to on declassification; `None` removes entirely.
    pub declassify_to_id: Option<i64>,
    /// Free-text reason for the classification.
    pub reason: Option<String>,
    /// Whether descendants without a direct classification inherit this
    /// one.
    pub inherit_to_children: bool,
    /// Whether the scheduled declassification runs automatically.
    pub auto_declassify: bool,
}

/// Optional fields for a classify call.
#[derive(Debug, Clone)]
pub struct ClassifyFields {
    /// When the classification should be reviewed.
    pub review_date: Option<DateTime<Utc>>,
    /// When the record is due for declassification.
    pub declassify_date: Option<DateTime<Utc>>,
    /// Level to drop to on declassification.
    pub declassify_to_id: Option<i64>,
    /// Whether descendants inherit this classification. Defaults to true.
    pub inherit_to_children: bool,
    /// Whether to schedule automatic declassification. Takes effect only
    /// together with `declassify_date`.
    pub auto_declassify: bool,
    /// Free-text reason.
    pub reason: Option<String>,
}

impl Default for ClassifyFields {
    fn default() -> Self {
        Self {
            review_date: None,
            declassify_date: None,
            declassify_to_id: None,
            inherit_to_children: true,
            auto_declassify: false,
            reason: None,
        }
    }
}

/// A due declassification schedule with display context.
#[derive(Debug, Clone, Serialize)]
pub struct DueDeclassification {
    /// Schedule row id.
    pub schedule_id: i64,
    /// The record due for declassification.
    pub object_id: i64,
    /// The record's reference code.
    pub identifier: String,
    /// The record's display title.
    pub title: String,
    /// When the declassification fell due.
    pub scheduled_date: DateTime<Utc>,
    /// Level the record was classified at when scheduled.
    pub from_classification_id: i64,
    /// Name of that level.
    pub from_name: String,
    /// Target level, `None` to remove classification entirely.
    pub to_classification_id: Option<i64>,
    /// Name of the target level.
    pub to_name: Option<String>,
}

/// Service over object classification and declassification.
pub struct ObjectClassifier<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> ObjectClassifier<'a> {
    /// Creates a classifier over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// The record's direct classification with its level, if any.
    pub fn classification(
        &self,
        object_id: i64,
    ) -> Result<Option<(ObjectClassification, ClassificationLevel)>, EngineError> {
        self.store.with_conn(|conn| direct_with_level(conn, object_id))
    }

    /// The classification that actually applies to the record: direct if
    /// present, else inherited from the nearest inheritable ancestor,
    /// else `None` (unclassified means public).
    pub fn effective_classification(
        &self,
        object_id: i64,
    ) -> Result<Option<ClassificationLevel>, EngineError> {
        self.store
            .with_conn(|conn| effective_level(conn, object_id))
    }

    /// The effective classification starting at the record's *parent*,
    /// excluding the record's own direct classification. Used for
    /// escalation validation.
    pub fn parent_effective_classification(
        &self,
        object_id: i64,
    ) -> Result<Option<ClassificationLevel>, EngineError> {
        self.store
            .with_conn(|conn| parent_effective_level(conn, object_id))
    }

    /// Directly classifies a record.
    ///
    /// Enforces the escalation constraint against the parent's effective
    /// classification, replaces any existing direct row, upserts the
    /// declassification schedule when `declassify_date` and
    /// `auto_declassify` are both set, and writes one audit entry.
    ///
    /// # Errors
    ///
    /// - [`EngineError::EscalationViolation`] when the new rank is below
    ///   the parent's effective rank; nothing is changed.
    /// - [`EngineError::NotFound`] for an unknown record or level.
    pub fn classify(
        &self,
        object_id: i64,
        classification_id: i64,
        fields: &ClassifyFields,
        classified_by: i64,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        self.store.with_tx(|tx| {
            let new_level = get_level(tx, classification_id)?.ok_or(EngineError::NotFound {
                entity: "classification level",
                id: classification_id,
            })?;

            // Also proves the object exists.
            let parent_level = parent_effective_level(tx, object_id)?;
            if let Some(parent_level) = parent_level {
                if new_level.rank < parent_level.rank {
                    tracing::warn!(
                        object_id,
                        attempted = %new_level.code,
                        required = %parent_level.code,
                        "escalation constraint rejected classification"
                    );
                    return Err(EngineError::EscalationViolation {
                        child_level: new_level.name,
                        child_rank: new_level.rank,
                        parent_level: parent_level.name,
                        parent_rank: parent_level.rank,
                    });
                }
            }

            // The constraint cuts both ways: raising this record above an
            // already-classified descendant would strand that descendant
            // below its parent. Directly classified nodes shield their
            // own subtrees; with inheritance off, only direct children
            // can be affected.
            if let Some((descendant_level, descendant_rank)) =
                blocking_descendant(tx, object_id, new_level.rank, fields.inherit_to_children)?
            {
                tracing::warn!(
                    object_id,
                    attempted = %new_level.code,
                    descendant = %descendant_level,
                    "escalation constraint rejected reclassification over descendant"
                );
                return Err(EngineError::EscalationViolation {
                    child_level: descendant_level,
                    child_rank: descendant_rank,
                    parent_level: new_level.name,
                    parent_rank: new_level.rank,
                });
            }

            tx.execute(
                "DELETE FROM object_classification WHERE object_id = ?1",
                params![object_id],
            )?;
            tx.execute(
                "INSERT INTO object_classification
                     (object_id, classification_id, classified_by, classified_at,
                      review_date, declassify_date, declassify_to_id, reason,
                      inherit_to_children, auto_declassify, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?4)",
                params![
                    object_id,
                    classification_id,
                    classified_by,
                    now_str,
                    fields.review_date.map(fmt_ts),
                    fields.declassify_date.map(fmt_ts),
                    fields.declassify_to_id,
                    fields.reason,
                    fields.inherit_to_children,
                    fields.auto_declassify,
                ],
            )?;

            if let (Some(declassify_date), true) = (fields.declassify_date, fields.auto_declassify)
            {
                upsert_schedule(
                    tx,
                    object_id,
                    declassify_date,
                    classification_id,
                    fields.declassify_to_id,
                    &now_str,
                )?;
            }

            let mut event = AuditEvent::granted(classified_by, AuditAction::Classify)
                .with_object(object_id)
                .with_classification(classification_id);
            if let Some(reason) = &fields.reason {
                event = event.with_justification(reason.clone());
            }
            insert_event(tx, &event, now)?;
            Ok(())
        })?;

        tracing::info!(object_id, classification_id, classified_by, "object classified");
        Ok(())
    }

    /// Lowers or removes a record's direct classification.
    ///
    /// With a target level the row is updated in place (no escalation
    /// check applies when removing restriction); without one the row is
    /// deleted and the record reverts to its inherited or public state.
    /// Any unprocessed schedule for the record is marked processed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the record has no direct
    /// classification, or for an unknown target level.
    pub fn declassify(
        &self,
        object_id: i64,
        new_classification_id: Option<i64>,
        declassified_by: i64,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        self.store.with_tx(|tx| {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT classification_id FROM object_classification WHERE object_id = ?1",
                    params![object_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current_classification_id) = current else {
                return Err(EngineError::NotFound {
                    entity: "object classification",
                    id: object_id,
                });
            };

            match new_classification_id {
                Some(target_id) => {
                    if get_level(tx, target_id)?.is_none() {
                        return Err(EngineError::NotFound {
                            entity: "classification level",
                            id: target_id,
                        });
                    }
                    tx.execute(
                        "UPDATE object_classification
                         SET classification_id = ?2, declassify_date = NULL,
                             declassify_to_id = NULL, auto_declassify = 0,
                             updated_at = ?3
                         WHERE object_id = ?1",
                        params![object_id, target_id, now_str],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM object_classification WHERE object_id = ?1",
                        params![object_id],
                    )?;
                }
            }

            tx.execute(
                "UPDATE declassification_schedule
                 SET processed = 1, processed_at = ?2, processed_by = ?3
                 WHERE object_id = ?1 AND processed = 0",
                params![object_id, now_str, declassified_by],
            )?;

            let mut event = AuditEvent::granted(declassified_by, AuditAction::Declassify)
                .with_object(object_id)
                .with_classification(current_classification_id);
            if let Some(reason) = reason {
                event = event.with_justification(reason);
            }
            insert_event(tx, &event, now)?;
            Ok(())
        })?;

        tracing::info!(
            object_id,
            to = ?new_classification_id,
            declassified_by,
            "object declassified"
        );
        Ok(())
    }

    /// Schedules a future declassification, replacing any unprocessed
    /// schedule for the record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown record.
    pub fn schedule_declassification(
        &self,
        object_id: i64,
        scheduled_date: DateTime<Utc>,
        from_classification_id: i64,
        to_classification_id: Option<i64>,
    ) -> Result<(), EngineError> {
        let now_str = fmt_ts(self.clock.now());
        self.store.with_tx(|tx| {
            if !crate::store::object_exists(tx, object_id)? {
                return Err(EngineError::NotFound {
                    entity: "archive object",
                    id: object_id,
                });
            }
            upsert_schedule(
                tx,
                object_id,
                scheduled_date,
                from_classification_id,
                to_classification_id,
                &now_str,
            )
        })
    }

    /// Unprocessed schedules whose date has arrived, with display
    /// context.
    pub fn due_declassifications(&self) -> Result<Vec<DueDeclassification>, EngineError> {
        let now = fmt_ts(self.clock.now());
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ds.id, ds.object_id, ao.identifier, ao.title,
                        ds.scheduled_date, ds.from_classification_id, cf.name,
                        ds.to_classification_id, ct.name
                 FROM declassification_schedule ds
                 JOIN archive_object ao ON ao.id = ds.object_id
                 JOIN classification_level cf ON cf.id = ds.from_classification_id
                 LEFT JOIN classification_level ct ON ct.id = ds.to_classification_id
                 WHERE ds.scheduled_date <= ?1 AND ds.processed = 0
                 ORDER BY ds.scheduled_date ASC",
            )?;
            let rows = stmt
                .query_map(params![now], |row| {
                    let scheduled_raw: String = row.get(4)?;
                    Ok(DueDeclassification {
                        schedule_id: row.get(0)?,
                        object_id: row.get(1)?,
                        identifier: row.get(2)?,
                        title: row.get(3)?,
                        scheduled_date: parse_ts(&scheduled_raw)
                            .unwrap_or(DateTime::<Utc>::MIN_UTC),
                        from_classification_id: row.get(5)?,
                        from_name: row.get(6)?,
                        to_classification_id: row.get(7)?,
                        to_name: row.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Processes every due schedule, declassifying each record on behalf
    /// of `system_user_id`.
    ///
    /// A failure on one record does not abort the rest; the count of
    /// successful declassifications is returned.
    pub fn process_due(&self, system_user_id: i64) -> Result<usize, EngineError> {
        let due = self.due_declassifications()?;
        let mut processed = 0;

        for item in due {
            match self.declassify(
                item.object_id,
                item.to_classification_id,
                system_user_id,
                Some("Automatic declassification"),
            ) {
                Ok(()) => processed += 1,
                Err(err) => {
                    tracing::warn!(
                        object_id = item.object_id,
                        schedule_id = item.schedule_id,
                        error = %err,
                        "scheduled declassification failed; continuing"
                    );
                }
            }
        }

        tracing::info!(processed, "due declassifications processed");
        Ok(processed)
    }
}

fn upsert_schedule(
    tx: &rusqlite::Transaction<'_>,
    object_id: i64,
    scheduled_date: DateTime<Utc>,
    from_classification_id: i64,
    to_classification_id: Option<i64>,
    now_str: &str,
) -> Result<(), EngineError> {
    tx.execute(
        "DELETE FROM declassification_schedule WHERE object_id = ?1 AND processed = 0",
        params![object_id],
    )?;
    tx.execute(
        "INSERT INTO declassification_schedule
             (object_id, scheduled_date, from_classification_id,
              to_classification_id, processed, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            object_id,
            fmt_ts(scheduled_date),
            from_classification_id,
            to_classification_id,
            now_str,
        ],
    )?;
    Ok(())
}

/// Direct classification row with its level, at connection level.
pub(crate) fn direct_with_level(
    conn: &Connection,
    object_id: i64,
) -> Result<Option<(ObjectClassification, ClassificationLevel)>, EngineError> {
    let sql = format!(
        "SELECT oc.object_id, oc.classification_id, oc.classified_by,
                oc.classified_at, oc.review_date, oc.declassify_date,
                oc.declassify_to_id, oc.reason, oc.inherit_to_children,
                oc.auto_declassify, {}
         FROM object_classification oc
         JOIN classification_level cl ON cl.id = oc.classification_id
         WHERE oc.object_id = ?1",
        level_columns("cl")
    );
    let found = conn
        .query_row(&sql, params![object_id], |row| {
            let classified_raw: String = row.get(3)?;
            let review_raw: Option<String> = row.get(4)?;
            let declassify_raw: Option<String> = row.get(5)?;
            Ok((
                ObjectClassification {
                    object_id: row.get(0)?,
                    classification_id: row.get(1)?,
                    classified_by: row.get(2)?,
                    classified_at: parse_ts(&classified_raw).unwrap_or(DateTime::<Utc>::MIN_UTC),
                    review_date: review_raw.as_deref().and_then(parse_ts),
                    declassify_date: declassify_raw.as_deref().and_then(parse_ts),
                    declassify_to_id: row.get(6)?,
                    reason: row.get(7)?,
                    inherit_to_children: row.get(8)?,
                    auto_declassify: row.get(9)?,
                },
                level_from_row(row, 10)?,
            ))
        })
        .optional()?;
    Ok(found)
}

/// Effective classification walk, at connection level.
///
/// A record's own direct classification applies unconditionally; an
/// ancestor's applies only when that ancestor marked it inheritable. The
/// walk is bounded and cycle-safe: malformed ancestry yields `None`
/// rather than looping.
pub(crate) fn effective_level(
    conn: &Connection,
    object_id: i64,
) -> Result<Option<ClassificationLevel>, EngineError> {
    if let Some((_, level)) = direct_with_level(conn, object_id)? {
        return Ok(Some(level));
    }
    walk_ancestors(conn, object_id)
}

/// Effective classification starting at the parent, at connection level.
pub(crate) fn parent_effective_level(
    conn: &Connection,
    object_id: i64,
) -> Result<Option<ClassificationLevel>, EngineError> {
    // Errors here double as the object-existence check for classify.
    let Some(parent_id) = object_parent(conn, object_id)? else {
        return Ok(None);
    };
    effective_level(conn, parent_id)
}

/// Upper bound on nodes visited by the descendant sweep.
const MAX_SWEEP_NODES: usize = 100_000;

/// Finds a directly classified descendant of `object_id` whose rank is
/// below `new_rank`, if one exists on the inheritance frontier.
///
/// Walks breadth-first from the record's children. A node with its own
/// direct classification is checked and not descended into (its subtree
/// is constrained against it, not against `object_id`); an unclassified
/// node passes the walk through only while `inherit` holds, since
/// without inheritance its effective classification stays undefined.
fn blocking_descendant(
    conn: &Connection,
    object_id: i64,
    new_rank: i64,
    inherit: bool,
) -> Result<Option<(String, i64)>, EngineError> {
    let mut queue: Vec<i64> = children_of(conn, object_id)?;
    let mut visited = 0usize;

    while let Some(node) = queue.pop() {
        visited += 1;
        if visited > MAX_SWEEP_NODES {
            tracing::warn!(object_id, "descendant sweep exceeded node bound");
            break;
        }

        if let Some((_, level)) = direct_with_level(conn, node)? {
            if level.rank < new_rank {
                return Ok(Some((level.name, level.rank)));
            }
        } else if inherit {
            queue.extend(children_of(conn, node)?);
        }
    }
    Ok(None)
}

fn children_of(conn: &Connection, object_id: i64) -> Result<Vec<i64>, EngineError> {
    let mut stmt = conn.prepare("SELECT id FROM archive_object WHERE parent_id = ?1")?;
    let ids = stmt
        .query_map(params![object_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Walks the ancestor chain of `object_id` (exclusive) looking for the
/// nearest direct classification, honoring `inherit_to_children`.
fn walk_ancestors(
    conn: &Connection,
    object_id: i64,
) -> Result<Option<ClassificationLevel>, EngineError> {
    let mut visited: HashSet<i64> = HashSet::new();
    visited.insert(object_id);
    let mut current = object_id;

    for _ in 0..MAX_WALK_DEPTH {
        let parent = match object_parent(conn, current) {
            Ok(parent) => parent,
            // A dangling parent pointer ends the walk rather than failing
            // the read.
            Err(EngineError::NotFound { .. }) => None,
            Err(err) => return Err(err),
        };
        let Some(parent_id) = parent else {
            return Ok(None);
        };
        if !visited.insert(parent_id) {
            tracing::warn!(object_id, parent_id, "cycle detected in record tree");
            return Ok(None);
        }

        if let Some((classification, level)) = direct_with_level(conn, parent_id)? {
            if classification.inherit_to_children {
                return Ok(Some(level));
            }
            return Ok(None);
        }
        current = parent_id;
    }

    tracing::warn!(object_id, "ancestor walk exceeded depth bound");
    Ok(None)
}
