//! SQLite schema and migrations
//!
//! The schema is built by an ordered chain of migrations. Each step uses
//! `IF NOT EXISTS` so re-running it is harmless, and each commits together
//! with the version bump that records it.
//!
//! After migrating, the schema is verified: every required table and index
//! must exist. Anything missing is reported as schema drift and opening the
//! store fails. Drift is never patched silently.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::storage::error::{StorageError, StorageResult};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 4;

/// One step in the migration chain
struct Migration {
    version: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "chapters, translation versions, settings",
        sql: r#"
        CREATE TABLE IF NOT EXISTS chapters (
            url TEXT PRIMARY KEY,
            stable_id TEXT UNIQUE,
            canonical_url TEXT,
            original_url TEXT,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            chapter_number INTEGER,
            fan_translation TEXT,
            next_url TEXT,
            prev_url TEXT,
            novel_id TEXT,
            date_added INTEGER NOT NULL,
            last_accessed INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chapters_canonical_url ON chapters(canonical_url);
        CREATE INDEX IF NOT EXISTS idx_chapters_number ON chapters(chapter_number);

        CREATE TABLE IF NOT EXISTS translation_versions (
            id TEXT PRIMARY KEY,
            stable_id TEXT NOT NULL,
            chapter_url TEXT NOT NULL,
            version INTEGER NOT NULL,
            translated_title TEXT NOT NULL DEFAULT '',
            translation TEXT NOT NULL DEFAULT '',
            footnotes TEXT NOT NULL DEFAULT '[]',
            suggested_illustrations TEXT NOT NULL DEFAULT '[]',
            provider TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            temperature REAL NOT NULL DEFAULT 0,
            system_prompt TEXT NOT NULL DEFAULT '',
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost REAL NOT NULL DEFAULT 0,
            request_time REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            UNIQUE (stable_id, version)
        );

        -- Lookup by chapter reference
        CREATE INDEX IF NOT EXISTS idx_versions_chapter_url ON translation_versions(chapter_url);
        CREATE INDEX IF NOT EXISTS idx_versions_stable_id ON translation_versions(stable_id);

        -- Lookup by active flag
        CREATE INDEX IF NOT EXISTS idx_versions_active ON translation_versions(stable_id, is_active);

        -- At most one active version per chapter
        CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_single_active
            ON translation_versions(stable_id) WHERE is_active = 1;

        CREATE INDEX IF NOT EXISTS idx_versions_created_at ON translation_versions(created_at);

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    },
    Migration {
        version: 2,
        description: "url mappings and chapter summaries",
        sql: r#"
        CREATE TABLE IF NOT EXISTS url_mappings (
            url TEXT PRIMARY KEY,
            stable_id TEXT NOT NULL,
            is_canonical INTEGER NOT NULL DEFAULT 0,
            date_added INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_url_mappings_stable_id ON url_mappings(stable_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_url_mappings_single_canonical
            ON url_mappings(stable_id) WHERE is_canonical = 1;

        CREATE TABLE IF NOT EXISTS chapter_summaries (
            stable_id TEXT PRIMARY KEY,
            canonical_url TEXT,
            title TEXT NOT NULL DEFAULT '',
            translated_title TEXT,
            chapter_number INTEGER,
            has_translation INTEGER NOT NULL DEFAULT 0,
            has_images INTEGER NOT NULL DEFAULT 0,
            last_accessed INTEGER,
            last_translated_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_summaries_number ON chapter_summaries(chapter_number);
        "#,
    },
    Migration {
        version: 3,
        description: "amendment logs, novels, prompt templates, feedback",
        sql: r#"
        CREATE TABLE IF NOT EXISTS amendment_logs (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            chapter_id TEXT,
            proposal TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('accepted', 'rejected', 'modified')),
            final_prompt_change TEXT,
            notes TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_amendments_timestamp ON amendment_logs(timestamp);
        CREATE INDEX IF NOT EXISTS idx_amendments_action ON amendment_logs(action);
        CREATE INDEX IF NOT EXISTS idx_amendments_chapter ON amendment_logs(chapter_id);

        CREATE TABLE IF NOT EXISTS novels (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL DEFAULT '',
            source_url TEXT,
            metadata TEXT NOT NULL DEFAULT 'null',
            date_added INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS prompt_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            description TEXT,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            last_used INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_prompt_templates_created_at ON prompt_templates(created_at);

        CREATE TABLE IF NOT EXISTS feedback (
            id TEXT PRIMARY KEY,
            stable_id TEXT NOT NULL,
            translation_id TEXT,
            kind TEXT NOT NULL,
            selection TEXT NOT NULL DEFAULT '',
            comment TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_feedback_stable_id ON feedback(stable_id);
        "#,
    },
    Migration {
        version: 4,
        description: "diff results, image cache, version counters",
        sql: r#"
        CREATE TABLE IF NOT EXISTS diff_results (
            id TEXT PRIMARY KEY,
            stable_id TEXT NOT NULL,
            translation_id TEXT,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_diff_results_stable_id ON diff_results(stable_id);

        CREATE TABLE IF NOT EXISTS image_assets (
            cache_key TEXT PRIMARY KEY,
            stable_id TEXT NOT NULL,
            marker TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            mime_type TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_image_assets_stable_id ON image_assets(stable_id);

        -- High-water mark so version numbers are never reused after deletion
        CREATE TABLE IF NOT EXISTS version_counters (
            stable_id TEXT PRIMARY KEY,
            last_version INTEGER NOT NULL
        );
        "#,
    },
];

/// Tables that must exist once migrations complete
pub const REQUIRED_TABLES: &[&str] = &[
    "schema_info",
    "chapters",
    "translation_versions",
    "settings",
    "url_mappings",
    "chapter_summaries",
    "amendment_logs",
    "novels",
    "prompt_templates",
    "feedback",
    "diff_results",
    "image_assets",
    "version_counters",
];

/// Indexes that must exist once migrations complete
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_chapters_canonical_url",
    "idx_chapters_number",
    "idx_versions_chapter_url",
    "idx_versions_stable_id",
    "idx_versions_active",
    "idx_versions_single_active",
    "idx_versions_created_at",
    "idx_url_mappings_stable_id",
    "idx_url_mappings_single_canonical",
    "idx_summaries_number",
    "idx_amendments_timestamp",
    "idx_amendments_action",
    "idx_amendments_chapter",
    "idx_prompt_templates_created_at",
    "idx_feedback_stable_id",
    "idx_diff_results_stable_id",
    "idx_image_assets_stable_id",
];

/// Outcome of running the migration chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i32,
    pub to_version: i32,
}

impl MigrationReport {
    pub fn migrated(&self) -> bool {
        self.from_version != self.to_version
    }
}

/// Bring the database up to `SCHEMA_VERSION` and verify the result
pub fn migrate(conn: &mut Connection) -> StorageResult<MigrationReport> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let from_version = get_schema_version(conn)?.unwrap_or(0);
    debug!(
        current_version = from_version,
        target_version = SCHEMA_VERSION,
        "Checking migrations"
    );

    if from_version > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            found: from_version,
            supported: SCHEMA_VERSION,
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > from_version) {
        apply_migration(conn, migration)?;
    }

    verify_schema(conn)?;

    Ok(MigrationReport {
        from_version,
        to_version: SCHEMA_VERSION,
    })
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> StorageResult<()> {
    info!(
        version = migration.version,
        "Applying migration: {}", migration.description
    );

    let wrap = |source: rusqlite::Error| StorageError::Migration {
        version: migration.version,
        source,
    };

    let tx = conn.transaction().map_err(wrap)?;
    tx.execute_batch(migration.sql).map_err(wrap)?;
    tx.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [migration.version.to_string()],
    )
    .map_err(wrap)?;
    tx.commit().map_err(wrap)?;
    Ok(())
}

/// Check that every required table and index exists
///
/// Returns `SchemaDrift` naming everything that is missing.
pub fn verify_schema(conn: &Connection) -> StorageResult<()> {
    let mut missing = Vec::new();

    for table in REQUIRED_TABLES {
        if !object_exists(conn, "table", table)? {
            missing.push(format!("table {}", table));
        }
    }
    for index in REQUIRED_INDEXES {
        if !object_exists(conn, "index", index)? {
            missing.push(format!("index {}", index));
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(StorageError::SchemaDrift { missing })
    }
}

fn object_exists(conn: &Connection, kind: &str, name: &str) -> StorageResult<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM sqlite_master WHERE type = ? AND name = ?")?;
    Ok(stmt.exists(params![kind, name])?)
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<Option<i32>> {
    if !table_exists(conn, "schema_info") {
        return Ok(None);
    }
    let value = get_meta(conn, "version")?;
    Ok(value.and_then(|v| v.parse().ok()))
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

/// Read a value from the `schema_info` table
pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_info WHERE key = ?",
        [key],
        |row| row.get(0),
    )
    .optional()
}

/// Write a value to the `schema_info` table
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}

/// SQLite's own schema cookie, bumped on every DDL change
pub fn schema_cookie(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA schema_version", [], |row| row.get(0))
}

fn table_exists(conn: &Connection, name: &str) -> bool {
    conn.prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?")
        .and_then(|mut stmt| stmt.exists([name]))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = ? ORDER BY name")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrate_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        let report = migrate(&mut conn).unwrap();

        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, SCHEMA_VERSION);
        assert!(report.migrated());

        let tables = names(&conn, "table");
        for table in REQUIRED_TABLES {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
        let indexes = names(&conn, "index");
        for index in REQUIRED_INDEXES {
            assert!(indexes.contains(&index.to_string()), "missing {}", index);
        }
    }

    #[test]
    fn test_schema_version() {
        let mut conn = Connection::open_in_memory().unwrap();

        // Before init, needs init
        assert!(needs_init(&conn));
        assert_eq!(get_schema_version(&conn).unwrap(), None);

        migrate(&mut conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let report = migrate(&mut conn).unwrap();
        assert!(!report.migrated());
    }

    #[test]
    fn test_migrate_from_intermediate_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_info (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )
        .unwrap();
        for migration in MIGRATIONS.iter().take(2) {
            apply_migration(&mut conn, migration).unwrap();
        }
        assert_eq!(get_schema_version(&conn).unwrap(), Some(2));

        let report = migrate(&mut conn).unwrap();
        assert_eq!(report.from_version, 2);
        assert_eq!(report.to_version, SCHEMA_VERSION);
        verify_schema(&conn).unwrap();
    }

    #[test]
    fn test_missing_index_is_drift() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute_batch("DROP INDEX idx_versions_active;").unwrap();

        let err = verify_schema(&conn).unwrap_err();
        match err {
            StorageError::SchemaDrift { missing } => {
                assert_eq!(missing, vec!["index idx_versions_active".to_string()]);
            }
            other => panic!("expected drift, got {:?}", other),
        }

        // Re-running migrations at the same version does not patch the hole
        assert!(matches!(
            migrate(&mut conn),
            Err(StorageError::SchemaDrift { .. })
        ));
    }

    #[test]
    fn test_missing_table_is_drift() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute_batch("DROP TABLE chapter_summaries;").unwrap();

        let err = verify_schema(&conn).unwrap_err();
        assert!(err.to_string().contains("table chapter_summaries"));
        assert!(err.to_string().contains("index idx_summaries_number"));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        set_meta(&conn, "version", "99").unwrap();

        assert!(matches!(
            migrate(&mut conn),
            Err(StorageError::SchemaTooNew {
                found: 99,
                supported: SCHEMA_VERSION
            })
        ));
    }

    #[test]
    fn test_single_active_index_enforced() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let insert = "INSERT INTO translation_versions (id, stable_id, chapter_url, version, created_at, is_active)
                      VALUES (?, 'ch1', 'https://x/1', ?, 0, 1)";
        conn.execute(insert, params!["a", 1]).unwrap();
        assert!(conn.execute(insert, params!["b", 2]).is_err());
    }

    #[test]
    fn test_meta_roundtrip() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        assert_eq!(get_meta(&conn, "backfill").unwrap(), None);
        set_meta(&conn, "backfill", "2").unwrap();
        assert_eq!(get_meta(&conn, "backfill").unwrap(), Some("2".to_string()));
    }
}
