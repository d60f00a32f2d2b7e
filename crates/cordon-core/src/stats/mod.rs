//! Operational security statistics.
//!
//! Read-only counters for the excluded dashboard layer: clearance and
//! object distribution across levels, queue depths, and recent access
//! activity. Nothing here mutates state.

use chrono::Duration;
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::clock::{Clock, fmt_ts};
use crate::error::EngineError;
use crate::store::SecurityStore;

/// How many of something exist at one classification level.
#[derive(Debug, Clone, Serialize)]
pub struct LevelCount {
    /// Level code.
    pub code: String,
    /// Level name.
    pub name: String,
    /// Level rank.
    pub rank: i64,
    /// The count at this level.
    pub count: u64,
}

/// Granted/denied split of recent access activity.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ActivityCounts {
    /// Audit entries with `access_granted = true`.
    pub granted: u64,
    /// Audit entries with `access_granted = false`.
    pub denied: u64,
}

/// A snapshot of the engine's operational state.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatistics {
    /// Active clearances per level, rank-ordered.
    pub clearances_by_level: Vec<LevelCount>,
    /// Directly classified records per level, rank-ordered.
    pub objects_by_level: Vec<LevelCount>,
    /// Requests awaiting review.
    pub pending_requests: u64,
    /// Active clearances lapsing within 30 days.
    pub expiring_clearances: u64,
    /// Denied audit entries over the last 7 days.
    pub recent_denials: u64,
    /// Classifications whose review date has arrived.
    pub reviews_due: u64,
    /// Unprocessed declassification schedules that are due.
    pub declassifications_due: u64,
    /// Access activity over the last 24 hours.
    pub activity_24h: ActivityCounts,
}

/// Read-only statistics service.
pub struct SecurityStats<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> SecurityStats<'a> {
    /// Creates the service over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Collects the full snapshot.
    pub fn collect(&self) -> Result<SecurityStatistics, EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        self.store.with_conn(|conn| {
            let clearances_by_level = level_counts(
                conn,
                "SELECT cl.code, cl.name, cl.rank, COUNT(uc.id)
                 FROM classification_level cl
                 LEFT JOIN user_clearance uc
                     ON uc.classification_id = cl.id AND uc.active = 1
                 GROUP BY cl.id
                 ORDER BY cl.rank ASC",
            )?;

            let objects_by_level = level_counts(
                conn,
                "SELECT cl.code, cl.name, cl.rank, COUNT(oc.object_id)
                 FROM classification_level cl
                 LEFT JOIN object_classification oc
                     ON oc.classification_id = cl.id
                 GROUP BY cl.id
                 ORDER BY cl.rank ASC",
            )?;

            let pending_requests = count(
                conn,
                "SELECT COUNT(*) FROM access_request WHERE status = 'pending'",
                &[],
            )?;

            let expiring_clearances = count(
                conn,
                "SELECT COUNT(*) FROM user_clearance
                 WHERE active = 1
                   AND expires_at IS NOT NULL
                   AND expires_at <= ?1
                   AND expires_at >= ?2",
                &[&fmt_ts(now + Duration::days(30)), &now_str],
            )?;

            let recent_denials = count(
                conn,
                "SELECT COUNT(*) FROM audit_entry
                 WHERE access_granted = 0 AND created_at >= ?1",
                &[&fmt_ts(now - Duration::days(7))],
            )?;

            let reviews_due = count(
                conn,
                "SELECT COUNT(*) FROM object_classification
                 WHERE review_date IS NOT NULL AND review_date <= ?1",
                &[&now_str],
            )?;

            let declassifications_due = count(
                conn,
                "SELECT COUNT(*) FROM declassification_schedule
                 WHERE processed = 0 AND scheduled_date <= ?1",
                &[&now_str],
            )?;

            let day_ago = fmt_ts(now - Duration::hours(24));
            let activity_24h = conn.query_row(
                "SELECT
                     COALESCE(SUM(CASE WHEN access_granted = 1 THEN 1 ELSE 0 END), 0),
                     COALESCE(SUM(CASE WHEN access_granted = 0 THEN 1 ELSE 0 END), 0)
                 FROM audit_entry
                 WHERE created_at >= ?1",
                params![day_ago],
                |row| {
                    Ok(ActivityCounts {
                        granted: row.get::<_, i64>(0)?.max(0) as u64,
                        denied: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )?;

            Ok(SecurityStatistics {
                clearances_by_level,
                objects_by_level,
                pending_requests,
                expiring_clearances,
                recent_denials,
                reviews_due,
                declassifications_due,
                activity_24h,
            })
        })
    }
}

fn level_counts(conn: &Connection, sql: &str) -> Result<Vec<LevelCount>, EngineError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(LevelCount {
                code: row.get(0)?,
                name: row.get(1)?,
                rank: row.get(2)?,
                count: row.get::<_, i64>(3)?.max(0) as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn count(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<u64, EngineError> {
    let n: i64 = conn.query_row(sql, args, |row| row.get(0))?;
    Ok(n.max(0) as u64)
}
