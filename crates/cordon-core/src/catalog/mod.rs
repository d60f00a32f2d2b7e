//! Classification level catalog.
//!
//! The ordered registry of classification levels. Rank totally orders
//! levels and is the sole basis for higher/lower comparisons. Levels are
//! immutable once referenced by a grant or an object classification:
//! retirement deactivates, never deletes.
//!
//! The catalog is read-mostly; [`ClassificationCatalog`] keeps a
//! process-level cache of the active list and exposes an explicit
//! [`ClassificationCatalog::invalidate`] for the rare writes.

use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::SecurityStore;

/// A single classification level and its handling controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationLevel {
    /// Row id referenced by grants and object classifications.
    pub id: i64,
    /// Short unique code, e.g. `SECRET`.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Position in the total order; higher rank means more sensitive.
    pub rank: i64,
    /// Access to records at this level requires a verified step-up session.
    pub requires_2fa: bool,
    /// Exports of records at this level must carry a traceable watermark.
    pub watermark_required: bool,
    /// Whether downloads are permitted at this level.
    pub download_allowed: bool,
    /// Whether printing is permitted at this level.
    pub print_allowed: bool,
    /// Whether copying is permitted at this level.
    pub copy_allowed: bool,
    /// Retired levels stay resolvable by id but leave the active list.
    pub active: bool,
}

/// Fields for seeding a level into the catalog.
#[derive(Debug, Clone)]
pub struct NewLevel<'a> {
    /// Short unique code.
    pub code: &'a str,
    /// Display name.
    pub name: &'a str,
    /// Position in the total order.
    pub rank: i64,
    /// Requires step-up authentication.
    pub requires_2fa: bool,
    /// Requires watermarking on export.
    pub watermark_required: bool,
    /// Downloads permitted.
    pub download_allowed: bool,
    /// Printing permitted.
    pub print_allowed: bool,
    /// Copying permitted.
    pub copy_allowed: bool,
}

impl<'a> NewLevel<'a> {
    /// A permissive level definition with every control open.
    #[must_use]
    pub const fn open(code: &'a str, name: &'a str, rank: i64) -> Self {
        Self {
            code,
            name,
            rank,
            requires_2fa: false,
            watermark_required: false,
            download_allowed: true,
            print_allowed: true,
            copy_allowed: true,
        }
    }

    /// A restricted level definition: step-up, watermarking, no
    /// downloads, prints, or copies.
    #[must_use]
    pub const fn controlled(code: &'a str, name: &'a str, rank: i64) -> Self {
        Self {
            code,
            name,
            rank,
            requires_2fa: true,
            watermark_required: true,
            download_allowed: false,
            print_allowed: false,
            copy_allowed: false,
        }
    }
}

/// Read-mostly registry over the classification levels.
pub struct ClassificationCatalog<'a> {
    store: &'a SecurityStore,
    cache: Mutex<Option<Vec<ClassificationLevel>>>,
}

impl<'a> ClassificationCatalog<'a> {
    /// Creates a catalog over `store` with an empty cache.
    #[must_use]
    pub fn new(store: &'a SecurityStore) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
        }
    }

    /// Returns all active levels ordered by rank ascending.
    ///
    /// The result is cached until [`Self::invalidate`] or an
    /// administrative write.
    pub fn list_active(&self) -> Result<Vec<ClassificationLevel>, EngineError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(levels) = cache.as_ref() {
                return Ok(levels.clone());
            }
        }

        let levels = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LEVEL_COLUMNS} FROM classification_level
                 WHERE active = 1
                 ORDER BY rank ASC"
            ))?;
            let levels = stmt
                .query_map([], |row| level_from_row(row, 0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(levels)
        })?;

        *self.cache.lock().unwrap() = Some(levels.clone());
        Ok(levels)
    }

    /// Looks up a level by id, active or not.
    ///
    /// Retired levels remain resolvable so historical grants and audit
    /// rows keep their names.
    pub fn get(&self, id: i64) -> Result<Option<ClassificationLevel>, EngineError> {
        self.store.with_conn(|conn| get_level(conn, id))
    }

    /// Looks up an active level by code.
    pub fn get_by_code(&self, code: &str) -> Result<Option<ClassificationLevel>, EngineError> {
        self.store.with_conn(|conn| {
            let level = conn
                .query_row(
                    &format!(
                        "SELECT {LEVEL_COLUMNS} FROM classification_level
                         WHERE code = ?1 AND active = 1"
                    ),
                    params![code],
                    |row| level_from_row(row, 0),
                )
                .optional()?;
            Ok(level)
        })
    }

    /// Returns `(id, name)` pairs rank-ordered, for select lists in the
    /// excluded form layer.
    pub fn choices(&self) -> Result<Vec<(i64, String)>, EngineError> {
        Ok(self
            .list_active()?
            .into_iter()
            .map(|level| (level.id, level.name))
            .collect())
    }

    /// Seeds a level into the catalog and returns its id.
    ///
    /// Administrative write path; invalidates the cache.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the code or rank collides with an
    /// existing level.
    pub fn seed_level(&self, level: &NewLevel<'_>) -> Result<i64, EngineError> {
        let id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO classification_level
                     (code, name, rank, requires_2fa, watermark_required,
                      download_allowed, print_allowed, copy_allowed, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
                params![
                    level.code,
                    level.name,
                    level.rank,
                    level.requires_2fa,
                    level.watermark_required,
                    level.download_allowed,
                    level.print_allowed,
                    level.copy_allowed,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        self.invalidate();
        tracing::info!(code = level.code, rank = level.rank, "classification level seeded");
        Ok(id)
    }

    /// Retires a level. It leaves the active list but stays resolvable
    /// by id for existing references.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn deactivate(&self, id: i64) -> Result<(), EngineError> {
        let changed = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE classification_level SET active = 0 WHERE id = ?1",
                params![id],
            )?)
        })?;

        if changed == 0 {
            return Err(EngineError::NotFound {
                entity: "classification level",
                id,
            });
        }

        self.invalidate();
        tracing::info!(level_id = id, "classification level deactivated");
        Ok(())
    }

    /// Drops the cached active list. The next read reloads from storage.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap() = None;
    }
}

/// Column list every level-returning query selects, in `level_from_row`
/// order.
pub(crate) const LEVEL_COLUMNS: &str = "id, code, name, rank, requires_2fa, watermark_required, \
     download_allowed, print_allowed, copy_allowed, active";

/// [`LEVEL_COLUMNS`] qualified with a table alias, for joined queries.
pub(crate) fn level_columns(alias: &str) -> String {
    LEVEL_COLUMNS
        .split(", ")
        .map(|col| format!("{alias}.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps a level from a row, reading columns starting at `base`.
pub(crate) fn level_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<ClassificationLevel> {
    Ok(ClassificationLevel {
        id: row.get(base)?,
        code: row.get(base + 1)?,
        name: row.get(base + 2)?,
        rank: row.get(base + 3)?,
        requires_2fa: row.get(base + 4)?,
        watermark_required: row.get(base + 5)?,
        download_allowed: row.get(base + 6)?,
        print_allowed: row.get(base + 7)?,
        copy_allowed: row.get(base + 8)?,
        active: row.get(base + 9)?,
    })
}

/// Connection-level lookup shared with in-transaction callers.
pub(crate) fn get_level(
    conn: &Connection,
    id: i64,
) -> Result<Option<ClassificationLevel>, EngineError> {
    let level = conn
        .query_row(
            &format!("SELECT {LEVEL_COLUMNS} FROM classification_level WHERE id = ?1"),
            params![id],
            |row| level_from_row(row, 0),
        )
        .optional()?;
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with_levels(store: &SecurityStore) -> ClassificationCatalog<'_> {
        let catalog = ClassificationCatalog::new(store);
        catalog
            .seed_level(&NewLevel::open("PUBLIC", "Public", 0))
            .unwrap();
        catalog
            .seed_level(&NewLevel::open("RESTRICTED", "Restricted", 1))
            .unwrap();
        catalog
            .seed_level(&NewLevel::controlled("SECRET", "Secret", 2))
            .unwrap();
        catalog
    }

    #[test]
    fn list_active_orders_by_rank() {
        let store = SecurityStore::in_memory().unwrap();
        let catalog = catalog_with_levels(&store);

        let levels = catalog.list_active().unwrap();
        let ranks: Vec<i64> = levels.iter().map(|l| l.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn get_by_code_filters_inactive() {
        let store = SecurityStore::in_memory().unwrap();
        let catalog = catalog_with_levels(&store);

        let secret = catalog.get_by_code("SECRET").unwrap().unwrap();
        assert!(secret.requires_2fa);
        assert!(secret.watermark_required);

        catalog.deactivate(secret.id).unwrap();
        assert!(catalog.get_by_code("SECRET").unwrap().is_none());
        // Still resolvable by id for historical references.
        assert!(catalog.get(secret.id).unwrap().is_some());
    }

    #[test]
    fn deactivate_invalidates_cache() {
        let store = SecurityStore::in_memory().unwrap();
        let catalog = catalog_with_levels(&store);

        assert_eq!(catalog.list_active().unwrap().len(), 3);
        let public = catalog.get_by_code("PUBLIC").unwrap().unwrap();
        catalog.deactivate(public.id).unwrap();
        assert_eq!(catalog.list_active().unwrap().len(), 2);
    }

    #[test]
    fn deactivate_unknown_level_is_not_found() {
        let store = SecurityStore::in_memory().unwrap();
        let catalog = ClassificationCatalog::new(&store);
        assert!(matches!(
            catalog.deactivate(99),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_rank_is_rejected() {
        let store = SecurityStore::in_memory().unwrap();
        let catalog = catalog_with_levels(&store);
        let err = catalog
            .seed_level(&NewLevel::open("DUP", "Duplicate", 2))
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[test]
    fn choices_pair_ids_with_names() {
        let store = SecurityStore::in_memory().unwrap();
        let catalog = catalog_with_levels(&store);
        let choices = catalog.choices().unwrap();
        assert_eq!(choices.len(), 3);
        assert_eq!(choices[0].1, "Public");
        assert_eq!(choices[2].1, "Secret");
    }
}
