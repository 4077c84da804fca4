//! URL mapping index
//!
//! Every URL a chapter has been seen under (raw, normalized, aliases from
//! other mirrors) maps to its stable ID. Each stable ID has exactly one
//! canonical mapping, pointing at its normalized URL.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::identity::{normalize_url, stable_chapter_id};
use crate::models::{Chapter, UrlMapping};
use crate::storage::error::StorageResult;
use crate::storage::schema::{get_meta, set_meta};
use crate::storage::{chapters, from_millis, projection, to_millis, write_tx};

/// Bump when the backfill logic changes so stores re-run it on open
pub const URL_MAPPING_BACKFILL_VERSION: i32 = 2;

const BACKFILL_MARKER: &str = "url_mapping_backfill_version";

/// Whether a backfill should honor the persisted marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillMode {
    #[default]
    IfOutdated,
    Force,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// The marker was current and nothing ran
    pub skipped: bool,
    pub chapters_scanned: usize,
    pub stable_ids_assigned: usize,
    pub mappings_written: usize,
}

fn map_mapping(row: &Row<'_>) -> rusqlite::Result<UrlMapping> {
    Ok(UrlMapping {
        url: row.get(0)?,
        stable_id: row.get(1)?,
        is_canonical: row.get(2)?,
        date_added: from_millis(row.get(3)?),
    })
}

/// Insert or refresh one mapping
///
/// A canonical write demotes any other canonical mapping for the same
/// stable ID. The original `date_added` is kept on refresh.
pub fn upsert(
    conn: &Connection,
    url: &str,
    stable_id: &str,
    is_canonical: bool,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    if is_canonical {
        conn.execute(
            "UPDATE url_mappings SET is_canonical = 0 WHERE stable_id = ? AND url != ? AND is_canonical = 1",
            params![stable_id, url],
        )?;
    }
    conn.execute(
        r#"
        INSERT INTO url_mappings (url, stable_id, is_canonical, date_added)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(url) DO UPDATE SET
            stable_id = excluded.stable_id,
            is_canonical = CASE
                WHEN url_mappings.stable_id = excluded.stable_id
                    THEN MAX(url_mappings.is_canonical, excluded.is_canonical)
                ELSE excluded.is_canonical
            END
        "#,
        params![url, stable_id, is_canonical, to_millis(&now)],
    )?;
    Ok(())
}

/// Record every URL a chapter is known by; returns how many were written
///
/// The normalized URL becomes canonical; the raw storage URL and the
/// original source URL are aliases.
pub fn record_chapter_urls(
    conn: &Connection,
    chapter: &Chapter,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    let Some(stable_id) = chapter.stable_id.as_deref() else {
        return Ok(0);
    };

    let canonical = chapter
        .canonical_url
        .clone()
        .unwrap_or_else(|| normalize_url(&chapter.url));
    upsert(conn, &canonical, stable_id, true, now)?;
    let mut written = 1;

    let aliases = [Some(chapter.url.as_str()), chapter.original_url.as_deref()];
    for alias in aliases.into_iter().flatten() {
        let alias = alias.trim();
        if alias.is_empty() || alias == canonical {
            continue;
        }
        upsert(conn, alias, stable_id, false, now)?;
        written += 1;
    }
    Ok(written)
}

/// Record an extra URL the chapter was reached through
pub fn record_alias(
    conn: &Connection,
    url: &str,
    stable_id: &str,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    if find_mapping(conn, url)?.is_none() {
        upsert(conn, url, stable_id, false, now)?;
    }
    Ok(())
}

pub fn find_mapping(conn: &Connection, url: &str) -> StorageResult<Option<UrlMapping>> {
    Ok(conn
        .query_row(
            "SELECT url, stable_id, is_canonical, date_added FROM url_mappings WHERE url = ?",
            params![url],
            map_mapping,
        )
        .optional()?)
}

/// Resolve a URL to a stable ID: exact match first, then normalized
pub fn find_stable_id(conn: &Connection, url: &str) -> StorageResult<Option<String>> {
    if let Some(mapping) = find_mapping(conn, url)? {
        return Ok(Some(mapping.stable_id));
    }
    let normalized = normalize_url(url);
    if normalized != url {
        if let Some(mapping) = find_mapping(conn, &normalized)? {
            return Ok(Some(mapping.stable_id));
        }
    }
    Ok(None)
}

/// The canonical URL for a stable ID
pub fn canonical_url_for(conn: &Connection, stable_id: &str) -> StorageResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT url FROM url_mappings WHERE stable_id = ? ORDER BY is_canonical DESC, date_added LIMIT 1",
            params![stable_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn all(conn: &Connection) -> StorageResult<Vec<UrlMapping>> {
    let mut stmt = conn.prepare(
        "SELECT url, stable_id, is_canonical, date_added FROM url_mappings ORDER BY stable_id, is_canonical DESC, url",
    )?;
    let mappings = stmt
        .query_map([], map_mapping)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(mappings)
}

/// Write an imported mapping as-is, keeping its timestamp
pub fn restore(conn: &Connection, mapping: &UrlMapping) -> StorageResult<()> {
    if mapping.is_canonical {
        conn.execute(
            "UPDATE url_mappings SET is_canonical = 0 WHERE stable_id = ? AND url != ?",
            params![mapping.stable_id, mapping.url],
        )?;
    }
    conn.execute(
        r#"
        INSERT INTO url_mappings (url, stable_id, is_canonical, date_added)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(url) DO UPDATE SET
            stable_id = excluded.stable_id,
            is_canonical = excluded.is_canonical,
            date_added = excluded.date_added
        "#,
        params![
            mapping.url,
            mapping.stable_id,
            mapping.is_canonical,
            to_millis(&mapping.date_added)
        ],
    )?;
    Ok(())
}

/// Derive missing identities and rewrite mappings for every chapter
///
/// Gated by a marker in `schema_info` so startup runs are a no-op once the
/// current backfill version has completed.
pub fn backfill_from_chapters(
    conn: &mut Connection,
    mode: BackfillMode,
    now: DateTime<Utc>,
) -> StorageResult<BackfillReport> {
    let done: i32 = get_meta(conn, BACKFILL_MARKER)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if mode == BackfillMode::IfOutdated && done >= URL_MAPPING_BACKFILL_VERSION {
        debug!(version = done, "URL mapping backfill already complete");
        return Ok(BackfillReport {
            skipped: true,
            ..Default::default()
        });
    }

    let tx = write_tx(conn)?;
    let mut report = BackfillReport::default();

    for mut chapter in chapters::all(&tx)? {
        report.chapters_scanned += 1;

        let canonical = chapter
            .canonical_url
            .clone()
            .unwrap_or_else(|| normalize_url(&chapter.url));

        if chapter.stable_id.is_none() {
            let derived = stable_chapter_id(&chapter.content, chapter.chapter_number, &chapter.title);
            if chapters::find_by_stable_id(&tx, &derived)?.is_some() {
                warn!(
                    url = %chapter.url,
                    stable_id = %derived,
                    "Duplicate chapter content; leaving row without a stable id"
                );
                continue;
            }
            adopt_orphan_versions(&tx, &chapter.url, &derived)?;
            report.stable_ids_assigned += 1;
            chapter.stable_id = Some(derived);
        }

        let Some(stable_id) = chapter.stable_id.clone() else {
            continue;
        };
        chapter.canonical_url = Some(canonical.clone());
        chapters::assign_identity(&tx, &chapter.url, &stable_id, &canonical)?;
        report.mappings_written += record_chapter_urls(&tx, &chapter, now)?;
        projection::recompute(&tx, &stable_id)?;
    }

    set_meta(&tx, BACKFILL_MARKER, &URL_MAPPING_BACKFILL_VERSION.to_string())?;
    tx.commit()?;

    info!(
        chapters = report.chapters_scanned,
        assigned = report.stable_ids_assigned,
        mappings = report.mappings_written,
        "URL mapping backfill complete"
    );
    Ok(report)
}

/// Move versions stored under a URL-derived fallback ID onto the real ID
///
/// Only done when the real ID has no versions yet, so histories never mix.
fn adopt_orphan_versions(conn: &Connection, chapter_url: &str, stable_id: &str) -> StorageResult<()> {
    let existing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM translation_versions WHERE stable_id = ?",
        params![stable_id],
        |row| row.get(0),
    )?;
    if existing > 0 {
        return Ok(());
    }

    let moved = conn.execute(
        "UPDATE translation_versions SET stable_id = ? WHERE chapter_url = ?",
        params![stable_id, chapter_url],
    )?;
    if moved > 0 {
        debug!(chapter_url, stable_id, moved, "Re-pointed translation versions");
        conn.execute(
            r#"
            INSERT INTO version_counters (stable_id, last_version)
            SELECT ?1, COALESCE(MAX(version), 0) FROM translation_versions WHERE stable_id = ?1
            ON CONFLICT(stable_id) DO UPDATE SET
                last_version = MAX(version_counters.last_version, excluded.last_version)
            "#,
            params![stable_id],
        )?;
    }
    Ok(())
}
