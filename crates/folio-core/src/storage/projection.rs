//! Chapter summary projection
//!
//! Projects chapters and their active translations into the
//! `chapter_summaries` table for fast listing. The projection is never a
//! source of truth: every row can be rebuilt from `chapters` and
//! `translation_versions` at any time.
//!
//! ## Architecture
//!
//! - Per-chapter recompute after each write that touches a chapter
//! - Full rebuild: clears and repopulates every row in one transaction
//! - Seeding: a full rebuild on first access when the table is empty

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::models::ChapterSummary;
use crate::storage::error::StorageResult;
use crate::storage::{chapters, from_millis, to_millis, translations, write_tx};

fn map_summary(row: &Row<'_>) -> rusqlite::Result<ChapterSummary> {
    Ok(ChapterSummary {
        stable_id: row.get(0)?,
        canonical_url: row.get(1)?,
        title: row.get(2)?,
        translated_title: row.get(3)?,
        chapter_number: row.get(4)?,
        has_translation: row.get(5)?,
        has_images: row.get(6)?,
        last_accessed: row.get::<_, Option<i64>>(7)?.map(from_millis),
        last_translated_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
    })
}

const SUMMARY_COLUMNS: &str = "stable_id, canonical_url, title, translated_title, chapter_number, \
     has_translation, has_images, last_accessed, last_translated_at";

/// Derive the summary row for one chapter from current state
pub fn build_summary(conn: &Connection, stable_id: &str) -> StorageResult<Option<ChapterSummary>> {
    let Some(chapter) = chapters::find_by_stable_id(conn, stable_id)? else {
        return Ok(None);
    };
    let active = translations::active(conn, stable_id)?;

    Ok(Some(ChapterSummary {
        stable_id: stable_id.to_string(),
        canonical_url: chapter.canonical_url.clone(),
        title: chapter.title.clone(),
        translated_title: active
            .as_ref()
            .map(|v| v.translated_title.clone())
            .filter(|t| !t.is_empty()),
        chapter_number: chapter.chapter_number,
        has_translation: active.is_some(),
        has_images: active.as_ref().is_some_and(|v| v.has_images()),
        last_accessed: Some(chapter.last_accessed),
        last_translated_at: active.as_ref().map(|v| v.created_at),
    }))
}

fn write_summary(conn: &Connection, summary: &ChapterSummary) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO chapter_summaries (stable_id, canonical_url, title, translated_title,
            chapter_number, has_translation, has_images, last_accessed, last_translated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(stable_id) DO UPDATE SET
            canonical_url = excluded.canonical_url,
            title = excluded.title,
            translated_title = excluded.translated_title,
            chapter_number = excluded.chapter_number,
            has_translation = excluded.has_translation,
            has_images = excluded.has_images,
            last_accessed = excluded.last_accessed,
            last_translated_at = excluded.last_translated_at
        "#,
        params![
            summary.stable_id,
            summary.canonical_url,
            summary.title,
            summary.translated_title,
            summary.chapter_number,
            summary.has_translation,
            summary.has_images,
            summary.last_accessed.as_ref().map(to_millis),
            summary.last_translated_at.as_ref().map(to_millis),
        ],
    )?;
    Ok(())
}

/// Recompute one chapter's row; removes it if the chapter is gone
pub fn recompute(conn: &Connection, stable_id: &str) -> StorageResult<Option<ChapterSummary>> {
    match build_summary(conn, stable_id)? {
        Some(summary) => {
            write_summary(conn, &summary)?;
            debug!(stable_id, "Recomputed chapter summary");
            Ok(Some(summary))
        }
        None => {
            remove(conn, stable_id)?;
            Ok(None)
        }
    }
}

pub fn remove(conn: &Connection, stable_id: &str) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM chapter_summaries WHERE stable_id = ?",
        params![stable_id],
    )?;
    Ok(())
}

/// All summary rows, numbered chapters first in order, then by title
pub fn list(conn: &Connection) -> StorageResult<Vec<ChapterSummary>> {
    let sql = format!(
        "SELECT {} FROM chapter_summaries ORDER BY chapter_number IS NULL, chapter_number, title",
        SUMMARY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_summary)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get(conn: &Connection, stable_id: &str) -> StorageResult<Option<ChapterSummary>> {
    let sql = format!(
        "SELECT {} FROM chapter_summaries WHERE stable_id = ?",
        SUMMARY_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![stable_id], map_summary)
        .optional()?)
}

pub fn count(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM chapter_summaries", [], |row| {
        row.get(0)
    })?)
}

/// Clear and repopulate every row; returns the number written
pub fn rebuild_all(conn: &mut Connection) -> StorageResult<usize> {
    let tx = write_tx(conn)?;
    tx.execute("DELETE FROM chapter_summaries", [])?;

    let mut written = 0;
    for chapter in chapters::all(&tx)? {
        if let Some(stable_id) = chapter.stable_id.as_deref() {
            if recompute(&tx, stable_id)?.is_some() {
                written += 1;
            }
        }
    }

    tx.commit()?;
    info!(rows = written, "Rebuilt chapter summaries");
    Ok(written)
}

/// Rebuild when the projection is empty but chapters exist
///
/// Returns whether a rebuild ran.
pub fn seed_if_empty(conn: &mut Connection) -> StorageResult<bool> {
    if count(conn)? > 0 || chapters::count(conn)? == 0 {
        return Ok(false);
    }
    rebuild_all(conn)?;
    Ok(true)
}
