//! Traceable watermarking of exported artifacts.
//!
//! Every export of a watermark-required record gets a short, high-entropy,
//! globally-unique code embedded in the artifact and recorded against
//! `(user, object, time)`. [`WatermarkTracer::trace`] is the reverse
//! lookup used during leak investigation.
//!
//! Embedding is a pluggable strategy per MIME family. Embedding is
//! fail-open: a missing strategy or a failed embed passes the original
//! artifact through unmodified. Recording is fail-closed: the watermark
//! record is inserted before any artifact is touched, so the trace exists
//! even when embedding does not.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::audit::{AuditAction, AuditEvent, insert_event};
use crate::clock::{Clock, fmt_ts, parse_ts};
use crate::error::EngineError;
use crate::store::SecurityStore;

/// Length of the generated trace code.
const CODE_LEN: usize = 12;

/// Code alphabet: unambiguous, uppercase, case-insensitive to read back
/// over the phone.
const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Attempts before giving up on a unique-code collision. With 36^12
/// codes, a second attempt is already vanishingly unlikely.
const MAX_CODE_ATTEMPTS: usize = 5;

/// A generated watermark, ready for embedding.
#[derive(Debug, Clone, Serialize)]
pub struct Watermark {
    /// The unique, user-opaque trace code.
    pub code: String,
    /// The human-readable stamp interpolating user, time, and code.
    pub text: String,
}

/// A persisted watermark record.
#[derive(Debug, Clone, Serialize)]
pub struct WatermarkRecord {
    /// Row id.
    pub id: i64,
    /// Who exported.
    pub user_id: i64,
    /// Which record was exported.
    pub object_id: i64,
    /// The specific digital object, when the record has several.
    pub digital_object_id: Option<i64>,
    /// The unique trace code.
    pub code: String,
    /// The embedded stamp text.
    pub text: String,
    /// SHA-256 of the watermarked artifact, when embedding ran.
    pub file_hash: Option<String>,
    /// Origin of the export request.
    pub ip_address: Option<String>,
    /// When the watermark was issued.
    pub created_at: DateTime<Utc>,
}

/// A traced watermark with investigation context.
#[derive(Debug, Clone, Serialize)]
pub struct TracedWatermark {
    /// The record.
    #[serde(flatten)]
    pub record: WatermarkRecord,
    /// Username of the exporter.
    pub username: String,
    /// Contact address of the exporter.
    pub email: Option<String>,
    /// Reference code of the exported record.
    pub object_identifier: String,
    /// Title of the exported record.
    pub object_title: String,
}

/// Format-specific watermark embedding for one MIME family.
///
/// Implementations overlay images, stamp PDFs, prepend document headers,
/// and so on. They run outside any open transaction and receive the
/// artifact path plus the watermark to embed.
pub trait EmbedStrategy: Send + Sync {
    /// The MIME family this strategy handles, e.g. `"image"` or
    /// `"application"`.
    fn mime_family(&self) -> &str;

    /// Embeds `watermark` into `source`, returning the path of the
    /// watermarked artifact.
    fn embed(&self, source: &Path, watermark: &Watermark) -> io::Result<PathBuf>;
}

/// Service generating, applying, and tracing watermarks.
pub struct WatermarkTracer<'a> {
    store: &'a SecurityStore,
    clock: &'a dyn Clock,
    strategies: Vec<Box<dyn EmbedStrategy>>,
}

impl<'a> WatermarkTracer<'a> {
    /// Creates a tracer with no embedding strategies. Generation and
    /// tracing work regardless; artifacts pass through unmodified.
    #[must_use]
    pub fn new(store: &'a SecurityStore, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            clock,
            strategies: Vec::new(),
        }
    }

    /// Registers an embedding strategy for its MIME family.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn EmbedStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Issues a watermark for an export of `object_id` by `user_id`.
    ///
    /// The record is inserted (and the issue audited) before the pair is
    /// returned, so the trace exists no matter what happens to the
    /// artifact afterwards. Codes are never reused: the unique index
    /// backs the entropy up, and a collision retries with a fresh code.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown user or record.
    pub fn generate(
        &self,
        user_id: i64,
        object_id: i64,
        digital_object_id: Option<i64>,
        ip_address: Option<&str>,
    ) -> Result<Watermark, EngineError> {
        let now = self.clock.now();
        let now_str = fmt_ts(now);

        let username = self
            .store
            .principal(user_id)?
            .ok_or(EngineError::NotFound {
                entity: "principal",
                id: user_id,
            })?
            .username;
        if self.store.object(object_id)?.is_none() {
            return Err(EngineError::NotFound {
                entity: "archive object",
                id: object_id,
            });
        }

        let mut attempt = 0;
        loop {
            let code = random_code();
            let text = format!(
                "CONFIDENTIAL - {username} - {} - {code}",
                now.format("%Y-%m-%d %H:%M")
            );
            let last_attempt = attempt + 1 == MAX_CODE_ATTEMPTS;

            let inserted = self.store.with_tx(|tx| {
                let result = tx.execute(
                    "INSERT INTO watermark_record
                         (user_id, object_id, digital_object_id, code, text,
                          ip_address, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        user_id,
                        object_id,
                        digital_object_id,
                        code,
                        text,
                        ip_address,
                        now_str,
                    ],
                );
                match result {
                    Ok(_) => {}
                    // Only reachable if OS entropy is catastrophically
                    // broken; give up once the retry budget is spent.
                    Err(err) if is_unique_violation(&err) && !last_attempt => return Ok(false),
                    Err(err) => return Err(err.into()),
                }

                insert_event(
                    tx,
                    &AuditEvent::granted(user_id, AuditAction::WatermarkIssued)
                        .with_object(object_id)
                        .with_justification(code.clone())
                        .with_request_context(ip_address, None, None),
                    now,
                )?;
                Ok(true)
            })?;

            if inserted {
                tracing::info!(user_id, object_id, code = %code, "watermark issued");
                return Ok(Watermark { code, text });
            }
            attempt += 1;
            tracing::warn!(attempt, "watermark code collision, regenerating");
        }
    }

    /// Applies `watermark` to the artifact at `source`.
    ///
    /// Looks up the embedding strategy for the MIME family of
    /// `mime_type`. With no strategy, or when embedding fails, the
    /// original path is returned unmodified; the watermark record from
    /// [`Self::generate`] already preserves the trace. On success the
    /// watermarked file's SHA-256 is stored on the record and the new
    /// path returned.
    pub fn apply_to_artifact(
        &self,
        source: &Path,
        mime_type: &str,
        watermark: &Watermark,
    ) -> Result<PathBuf, EngineError> {
        let family = mime_type.split('/').next().unwrap_or(mime_type);
        let Some(strategy) = self
            .strategies
            .iter()
            .find(|s| s.mime_family() == family)
        else {
            tracing::debug!(mime_type, "no embedding strategy; passing artifact through");
            return Ok(source.to_path_buf());
        };

        match strategy.embed(source, watermark) {
            Ok(output) => {
                match std::fs::read(&output) {
                    Ok(bytes) => {
                        let digest = hex_encode(&Sha256::digest(&bytes));
                        self.store.with_conn(|conn| {
                            conn.execute(
                                "UPDATE watermark_record SET file_hash = ?2 WHERE code = ?1",
                                params![watermark.code, digest],
                            )?;
                            Ok(())
                        })?;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "could not hash watermarked artifact");
                    }
                }
                Ok(output)
            }
            Err(err) => {
                tracing::warn!(
                    mime_type,
                    error = %err,
                    "watermark embedding failed; passing artifact through"
                );
                Ok(source.to_path_buf())
            }
        }
    }

    /// Reverse lookup of a trace code. Indexed; built for leak
    /// investigation under time pressure.
    pub fn trace(&self, code: &str) -> Result<Option<TracedWatermark>, EngineError> {
        self.store.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT wr.id, wr.user_id, wr.object_id, wr.digital_object_id,
                            wr.code, wr.text, wr.file_hash, wr.ip_address,
                            wr.created_at, p.username, p.email, ao.identifier,
                            ao.title
                     FROM watermark_record wr
                     JOIN principal p ON p.id = wr.user_id
                     JOIN archive_object ao ON ao.id = wr.object_id
                     WHERE wr.code = ?1",
                    params![code],
                    |row| {
                        let created_raw: String = row.get(8)?;
                        Ok(TracedWatermark {
                            record: WatermarkRecord {
                                id: row.get(0)?,
                                user_id: row.get(1)?,
                                object_id: row.get(2)?,
                                digital_object_id: row.get(3)?,
                                code: row.get(4)?,
                                text: row.get(5)?,
                                file_hash: row.get(6)?,
                                ip_address: row.get(7)?,
                                created_at: parse_ts(&created_raw)
                                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
                            },
                            username: row.get(9)?,
                            email: row.get(10)?,
                            object_identifier: row.get(11)?,
                            object_title: row.get(12)?,
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
    }
}

fn random_code() -> String {
    let mut bytes = [0u8; CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| CODE_CHARSET[usize::from(*b) % CODE_CHARSET.len()] as char)
        .collect()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Hex-encode a digest for display.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;

    use chrono::TimeZone;

    use crate::clock::ManualClock;

    use super::*;

    struct Fixture {
        store: SecurityStore,
        clock: ManualClock,
        user: i64,
        object: i64,
    }

    fn fixture() -> Fixture {
        let store = SecurityStore::in_memory().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap());
        let user = store
            .register_principal("jsmith", Some("jsmith@example.org"), clock.now())
            .unwrap();
        let object = store
            .register_object(None, "F1", "Fonds", clock.now())
            .unwrap();
        Fixture {
            store,
            clock,
            user,
            object,
        }
    }

    /// Writes the stamp into a sidecar file next to the source.
    struct SidecarStrategy;

    impl EmbedStrategy for SidecarStrategy {
        fn mime_family(&self) -> &str {
            "text"
        }

        fn embed(&self, source: &Path, watermark: &Watermark) -> io::Result<PathBuf> {
            let output = source.with_extension("stamped.txt");
            let body = fs::read_to_string(source)?;
            fs::write(&output, format!("{}\n{body}", watermark.text))?;
            Ok(output)
        }
    }

    /// Always fails, to exercise the fail-open path.
    struct BrokenStrategy;

    impl EmbedStrategy for BrokenStrategy {
        fn mime_family(&self) -> &str {
            "image"
        }

        fn embed(&self, _source: &Path, _watermark: &Watermark) -> io::Result<PathBuf> {
            Err(io::Error::new(io::ErrorKind::Other, "encoder crashed"))
        }
    }

    #[test]
    fn generate_interpolates_user_time_and_code() {
        let fx = fixture();
        let tracer = WatermarkTracer::new(&fx.store, &fx.clock);

        let watermark = tracer.generate(fx.user, fx.object, None, None).unwrap();
        assert_eq!(watermark.code.len(), CODE_LEN);
        assert!(watermark.text.starts_with("CONFIDENTIAL - jsmith - 2025-03-01 09:30 - "));
        assert!(watermark.text.ends_with(&watermark.code));
    }

    #[test]
    fn generate_requires_known_user_and_object() {
        let fx = fixture();
        let tracer = WatermarkTracer::new(&fx.store, &fx.clock);

        assert!(matches!(
            tracer.generate(404, fx.object, None, None),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            tracer.generate(fx.user, 404, None, None),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn codes_do_not_repeat() {
        let fx = fixture();
        let tracer = WatermarkTracer::new(&fx.store, &fx.clock);

        let mut seen = HashSet::new();
        for _ in 0..500 {
            let watermark = tracer.generate(fx.user, fx.object, None, None).unwrap();
            assert!(seen.insert(watermark.code));
        }
    }

    #[test]
    fn trace_resolves_user_and_object() {
        let fx = fixture();
        let tracer = WatermarkTracer::new(&fx.store, &fx.clock);

        let watermark = tracer
            .generate(fx.user, fx.object, Some(7), Some("10.0.0.7"))
            .unwrap();

        let traced = tracer.trace(&watermark.code).unwrap().unwrap();
        assert_eq!(traced.username, "jsmith");
        assert_eq!(traced.object_identifier, "F1");
        assert_eq!(traced.record.digital_object_id, Some(7));
        assert_eq!(traced.record.ip_address.as_deref(), Some("10.0.0.7"));

        assert!(tracer.trace("NOSUCHCODE00").unwrap().is_none());
    }

    #[test]
    fn apply_embeds_and_hashes_with_a_strategy() {
        let fx = fixture();
        let tracer =
            WatermarkTracer::new(&fx.store, &fx.clock).with_strategy(Box::new(SidecarStrategy));

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("finding.txt");
        fs::write(&source, "report body").unwrap();

        let watermark = tracer.generate(fx.user, fx.object, None, None).unwrap();
        let output = tracer
            .apply_to_artifact(&source, "text/plain", &watermark)
            .unwrap();

        assert_ne!(output, source);
        let stamped = fs::read_to_string(&output).unwrap();
        assert!(stamped.contains(&watermark.code));

        let traced = tracer.trace(&watermark.code).unwrap().unwrap();
        assert_eq!(traced.record.file_hash.unwrap().len(), 64);
    }

    #[test]
    fn apply_is_fail_open_on_missing_or_broken_strategy() {
        let fx = fixture();
        let tracer =
            WatermarkTracer::new(&fx.store, &fx.clock).with_strategy(Box::new(BrokenStrategy));

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("scan.png");
        fs::write(&source, [0u8; 16]).unwrap();

        let watermark = tracer.generate(fx.user, fx.object, None, None).unwrap();

        // Broken strategy: original passes through.
        let output = tracer
            .apply_to_artifact(&source, "image/png", &watermark)
            .unwrap();
        assert_eq!(output, source);

        // No strategy for the family: original passes through.
        let output = tracer
            .apply_to_artifact(&source, "application/pdf", &watermark)
            .unwrap();
        assert_eq!(output, source);

        // The trace still exists either way.
        assert!(tracer.trace(&watermark.code).unwrap().is_some());
    }
}
