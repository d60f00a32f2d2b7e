//! Append-only audit trail.
//!
//! Every state-changing operation in this crate writes exactly one entry
//! per outcome, success or failure, with enough context to reconstruct
//! who did what to whom, when, and with what result. Entries are never
//! updated or deleted; the schema enforces that with abort triggers, not
//! just this API.
//!
//! The decision engine itself is pure; callers of
//! [`crate::decision::AccessDecisionEngine::can_access`] record the
//! outcome here separately.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, fmt_ts, parse_ts};
use crate::error::EngineError;
use crate::store::SecurityStore;

/// The auditable actions the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A record view was attempted.
    View,
    /// A record download was attempted.
    Download,
    /// A record print was attempted.
    Print,
    /// An object received a direct classification.
    Classify,
    /// An object classification was lowered or removed.
    Declassify,
    /// An access request was submitted.
    AccessRequest,
    /// An access request was approved.
    AccessGranted,
    /// An access request was denied.
    AccessDenied,
    /// A step-up session was verified.
    StepUpVerified,
    /// A clearance was granted or superseded.
    ClearanceGranted,
    /// A clearance was revoked.
    ClearanceRevoked,
    /// A clearance renewal was approved.
    ClearanceRenewed,
    /// A compartment grant succeeded.
    CompartmentGranted,
    /// A compartment grant was refused for insufficient clearance.
    CompartmentDenied,
    /// A compartment grant was revoked.
    CompartmentRevoked,
    /// An object was assigned to a compartment.
    CompartmentAssigned,
    /// A watermark was generated for an export.
    WatermarkIssued,
}

impl AuditAction {
    /// The stable string form persisted in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Download => "download",
            Self::Print => "print",
            Self::Classify => "classify",
            Self::Declassify => "declassify",
            Self::AccessRequest => "access_request",
            Self::AccessGranted => "access_granted",
            Self::AccessDenied => "access_denied",
            Self::StepUpVerified => "2fa_verified",
            Self::ClearanceGranted => "clearance_granted",
            Self::ClearanceRevoked => "clearance_revoked",
            Self::ClearanceRenewed => "clearance_renewed",
            Self::CompartmentGranted => "compartment_granted",
            Self::CompartmentDenied => "compartment_denied",
            Self::CompartmentRevoked => "compartment_revoked",
            Self::CompartmentAssigned => "compartment_assigned",
            Self::WatermarkIssued => "watermark_issued",
        }
    }
}

/// An audit entry about to be recorded.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// The acting (or denied) user.
    pub user_id: i64,
    /// The record involved, if any.
    pub object_id: Option<i64>,
    /// The classification level involved, if any.
    pub classification_id: Option<i64>,
    /// The compartment involved, if any.
    pub compartment_id: Option<i64>,
    /// What was attempted.
    pub action: AuditAction,
    /// Whether the attempt was permitted.
    pub access_granted: bool,
    /// Why the attempt was refused, for denied outcomes.
    pub denial_reason: Option<String>,
    /// Free-text context for granted outcomes.
    pub justification: Option<String>,
    /// Caller-supplied request origin.
    pub ip_address: Option<String>,
    /// Caller-supplied user agent, truncated to 500 bytes on insert.
    pub user_agent: Option<String>,
    /// Caller-supplied ambient session id.
    pub session_id: Option<String>,
}

impl AuditEvent {
    /// A granted outcome for `action` by `user_id`.
    #[must_use]
    pub const fn granted(user_id: i64, action: AuditAction) -> Self {
        Self {
            user_id,
            object_id: None,
            classification_id: None,
            compartment_id: None,
            action,
            access_granted: true,
            denial_reason: None,
            justification: None,
            ip_address: None,
            user_agent: None,
            session_id: None,
        }
    }

    /// A denied outcome for `action` by `user_id`, with the reason.
    #[must_use]
    pub fn denied(user_id: i64, action: AuditAction, reason: impl Into<String>) -> Self {
        Self {
            denial_reason: Some(reason.into()),
            access_granted: false,
            ..Self::granted(user_id, action)
        }
    }

    /// Attaches the record involved.
    #[must_use]
    pub const fn with_object(mut self, object_id: i64) -> Self {
        self.object_id = Some(object_id);
        self
    }

    /// Attaches the classification level involved.
    #[must_use]
    pub const fn with_classification(mut self, classification_id: i64) -> Self {
        self.classification_id = Some(classification_id);
        self
    }

    /// Attaches the compartment involved.
    #[must_use]
    pub const fn with_compartment(mut self, compartment_id: i64) -> Self {
        self.compartment_id = Some(compartment_id);
        self
    }

    /// Attaches free-text context for a granted outcome.
    #[must_use]
    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    /// Attaches the ambient request origin.
    #[must_use]
    pub fn with_request_context(
        mut self,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        session_id: Option<&str>,
    ) -> Self {
        self.ip_address = ip_address.map(str::to_owned);
        self.user_agent = user_agent.map(str::to_owned);
        self.session_id = session_id.map(str::to_owned);
        self
    }
}

/// A recorded audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Row id; monotonically increasing.
    pub id: i64,
    /// The acting (or denied) user.
    pub user_id: i64,
    /// The record involved, if any.
    pub object_id: Option<i64>,
    /// The classification level involved, if any.
    pub classification_id: Option<i64>,
    /// The compartment involved, if any.
    pub compartment_id: Option<i64>,
    /// What was attempted, in stable string form.
    pub action: String,
    /// Whether the attempt was permitted.
    pub access_granted: bool,
    /// Why the attempt was refused.
    pub denial_reason: Option<String>,
    /// Free-text context for granted outcomes.
    pub justification: Option<String>,
    /// Request origin, when supplied.
    pub ip_address: Option<String>,
    /// User agent, when supplied.
    pub user_agent: Option<String>,
    /// Ambient session id, when supplied.
    pub session_id: Option<String>,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
}

/// A report row: an entry joined with display context.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReportRow {
    /// The underlying entry.
    #[serde(flatten)]
    pub entry: AuditEntry,
    /// Username of the acting user, when still registered.
    pub username: Option<String>,
    /// Title of the record involved.
    pub object_title: Option<String>,
    /// Name of the classification level involved.
    pub classification_name: Option<String>,
}

/// Filters for the audit report.
#[derive(Debug, Clone, Default)]
pub struct AuditReportFilter {
    /// Restrict to one user.
    pub user_id: Option<i64>,
    /// Restrict to one record.
    pub object_id: Option<i64>,
    /// Restrict to one classification level.
    pub classification_id: Option<i64>,
    /// Restrict to one action.
    pub action: Option<AuditAction>,
    /// Restrict to granted (`true`) or denied (`false`) outcomes.
    pub access_granted: Option<bool>,
    /// Entries at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Entries at or before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Row cap; defaults to 1000.
    pub limit: Option<u32>,
}

/// Read/write handle over the audit trail.
pub struct AuditLog<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
}

impl<'a> AuditLog<'a> {
    /// Creates an audit log over `store`.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Appends one entry and returns its id.
    pub fn record(&self, event: &AuditEvent) -> Result<i64, EngineError> {
        let now = self.clock.now();
        self.store.with_conn(|conn| insert_event(conn, event, now))
    }

    /// Entries for one record, newest first.
    pub fn for_object(&self, object_id: i64, limit: u32) -> Result<Vec<AuditEntry>, EngineError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_entry
                 WHERE object_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let entries = stmt
                .query_map(params![object_id, limit], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Entries for one user, newest first.
    pub fn for_user(&self, user_id: i64, limit: u32) -> Result<Vec<AuditEntry>, EngineError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_entry
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let entries = stmt
                .query_map(params![user_id, limit], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Filtered report with display context, newest first.
    pub fn report(&self, filter: &AuditReportFilter) -> Result<Vec<AuditReportRow>, EngineError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(user_id) = filter.user_id {
            clauses.push("ae.user_id = ?");
            args.push(Value::Integer(user_id));
        }
        if let Some(object_id) = filter.object_id {
            clauses.push("ae.object_id = ?");
            args.push(Value::Integer(object_id));
        }
        if let Some(classification_id) = filter.classification_id {
            clauses.push("ae.classification_id = ?");
            args.push(Value::Integer(classification_id));
        }
        if let Some(action) = filter.action {
            clauses.push("ae.action = ?");
            args.push(Value::Text(action.as_str().to_owned()));
        }
        if let Some(granted) = filter.access_granted {
            clauses.push("ae.access_granted = ?");
            args.push(Value::Integer(i64::from(granted)));
        }
        if let Some(from) = filter.from {
            clauses.push("ae.created_at >= ?");
            args.push(Value::Text(fmt_ts(from)));
        }
        if let Some(to) = filter.to {
            clauses.push("ae.created_at <= ?");
            args.push(Value::Text(fmt_ts(to)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        args.push(Value::Integer(i64::from(filter.limit.unwrap_or(1000))));

        let sql = format!(
            "SELECT {ENTRY_COLUMNS_QUALIFIED}, p.username, ao.title, cl.name
             FROM audit_entry ae
             LEFT JOIN principal p ON p.id = ae.user_id
             LEFT JOIN archive_object ao ON ao.id = ae.object_id
             LEFT JOIN classification_level cl ON cl.id = ae.classification_id
             {where_sql}
             ORDER BY ae.created_at DESC, ae.id DESC
             LIMIT ?"
        );

        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args), |row| {
                    Ok(AuditReportRow {
                        entry: entry_from_row(row)?,
                        username: row.get(13)?,
                        object_title: row.get(14)?,
                        classification_name: row.get(15)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const ENTRY_COLUMNS: &str = "id, user_id, object_id, classification_id, compartment_id, action, \
     access_granted, denial_reason, justification, ip_address, user_agent, \
     session_id, created_at";

const ENTRY_COLUMNS_QUALIFIED: &str =
    "ae.id, ae.user_id, ae.object_id, ae.classification_id, ae.compartment_id, ae.action, \
     ae.access_granted, ae.denial_reason, ae.justification, ae.ip_address, ae.user_agent, \
     ae.session_id, ae.created_at";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let created_at: String = row.get(12)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        object_id: row.get(2)?,
        classification_id: row.get(3)?,
        compartment_id: row.get(4)?,
        action: row.get(5)?,
        access_granted: row.get(6)?,
        denial_reason: row.get(7)?,
        justification: row.get(8)?,
        ip_address: row.get(9)?,
        user_agent: row.get(10)?,
        session_id: row.get(11)?,
        created_at: parse_ts(&created_at).unwrap_or(DateTime::<Utc>::MIN_UTC),
    })
}

/// Connection-level append shared with in-transaction callers, so a
/// mutation and its audit entry commit or roll back together.
pub(crate) fn insert_event(
    conn: &Connection,
    event: &AuditEvent,
    now: DateTime<Utc>,
) -> Result<i64, EngineError> {
    let user_agent = event
        .user_agent
        .as_deref()
        .map(|ua| ua.chars().take(500).collect::<String>());

    conn.execute(
        "INSERT INTO audit_entry
             (user_id, object_id, classification_id, compartment_id, action,
              access_granted, denial_reason, justification, ip_address,
              user_agent, session_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            event.user_id,
            event.object_id,
            event.classification_id,
            event.compartment_id,
            event.action.as_str(),
            event.access_granted,
            event.denial_reason,
            event.justification,
            event.ip_address,
            user_agent,
            event.session_id,
            fmt_ts(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
