//! Chapter records
//!
//! Chapters are keyed by the URL they were first stored under and carry a
//! content-derived stable ID that everything else references. Upserts
//! merge forward: a field that already has a value is never blanked by a
//! later write.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::identity::{normalize_url, stable_chapter_id};
use crate::models::{Chapter, ChapterInput};
use crate::storage::error::StorageResult;
use crate::storage::{from_millis, mappings, to_millis};

const CHAPTER_COLUMNS: &str = "url, stable_id, canonical_url, original_url, title, content, \
     chapter_number, fan_translation, next_url, prev_url, novel_id, date_added, last_accessed";

fn map_chapter(row: &Row<'_>) -> rusqlite::Result<Chapter> {
    Ok(Chapter {
        url: row.get(0)?,
        stable_id: row.get(1)?,
        canonical_url: row.get(2)?,
        original_url: row.get(3)?,
        title: row.get(4)?,
        content: row.get(5)?,
        chapter_number: row.get(6)?,
        fan_translation: row.get(7)?,
        next_url: row.get(8)?,
        prev_url: row.get(9)?,
        novel_id: row.get(10)?,
        date_added: from_millis(row.get(11)?),
        last_accessed: from_millis(row.get(12)?),
    })
}

fn find_one(conn: &Connection, column: &str, value: &str) -> StorageResult<Option<Chapter>> {
    let sql = format!(
        "SELECT {} FROM chapters WHERE {} = ? LIMIT 1",
        CHAPTER_COLUMNS, column
    );
    Ok(conn
        .query_row(&sql, params![value], map_chapter)
        .optional()?)
}

/// Find a chapter by the exact URL it is stored under
pub fn find_by_url(conn: &Connection, url: &str) -> StorageResult<Option<Chapter>> {
    find_one(conn, "url", url)
}

pub fn find_by_stable_id(conn: &Connection, stable_id: &str) -> StorageResult<Option<Chapter>> {
    find_one(conn, "stable_id", stable_id)
}

/// Resolve a loose URL to a chapter
///
/// Tries the exact storage key, then the canonical URL, then the URL
/// mapping index (exact, then normalized).
pub fn resolve(conn: &Connection, url: &str) -> StorageResult<Option<Chapter>> {
    if let Some(chapter) = find_by_url(conn, url)? {
        return Ok(Some(chapter));
    }
    if let Some(chapter) = find_one(conn, "canonical_url", &normalize_url(url))? {
        return Ok(Some(chapter));
    }
    match mappings::find_stable_id(conn, url)? {
        Some(stable_id) => find_by_stable_id(conn, &stable_id),
        None => Ok(None),
    }
}

/// All chapters in reading order (unnumbered chapters last)
pub fn all(conn: &Connection) -> StorageResult<Vec<Chapter>> {
    let sql = format!(
        "SELECT {} FROM chapters ORDER BY chapter_number IS NULL, chapter_number, title",
        CHAPTER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let chapters = stmt
        .query_map([], map_chapter)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(chapters)
}

pub fn count(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM chapters", [], |row| row.get(0))?)
}

/// Insert or merge a chapter from fetched input
///
/// The stable ID is computed from content, number and title. An existing
/// row is matched by stable ID first, then by URL. Matching rows keep
/// their storage URL, stable ID and `date_added`; empty fields are filled
/// from the input but populated fields are never overwritten with blanks.
pub fn upsert(conn: &Connection, input: &ChapterInput, now: DateTime<Utc>) -> StorageResult<Chapter> {
    let computed_id = stable_chapter_id(&input.content, input.chapter_number, &input.title);

    let existing = match find_by_stable_id(conn, &computed_id)? {
        Some(chapter) => Some(chapter),
        None => find_by_url(conn, &input.url)?,
    };

    let chapter = match existing {
        Some(existing) => {
            debug!(url = %existing.url, "Merging chapter into existing record");
            merge(existing, input, &computed_id, now)
        }
        None => Chapter {
            url: input.url.clone(),
            stable_id: Some(computed_id),
            canonical_url: Some(normalize_url(&input.url)),
            original_url: non_blank(&input.original_url),
            title: input.title.clone(),
            content: input.content.clone(),
            chapter_number: input.chapter_number,
            fan_translation: non_blank(&input.fan_translation),
            next_url: non_blank(&input.next_url),
            prev_url: non_blank(&input.prev_url),
            novel_id: non_blank(&input.novel_id),
            date_added: now,
            last_accessed: now,
        },
    };

    write(conn, &chapter)?;
    Ok(chapter)
}

fn merge(existing: Chapter, input: &ChapterInput, computed_id: &str, now: DateTime<Utc>) -> Chapter {
    let canonical_url = existing
        .canonical_url
        .clone()
        .unwrap_or_else(|| normalize_url(&existing.url));

    Chapter {
        stable_id: existing
            .stable_id
            .clone()
            .or_else(|| Some(computed_id.to_string())),
        canonical_url: Some(canonical_url),
        original_url: fill(existing.original_url, &input.original_url),
        title: if input.title.trim().is_empty() {
            existing.title
        } else {
            input.title.clone()
        },
        content: if input.content.trim().is_empty() {
            existing.content
        } else {
            input.content.clone()
        },
        chapter_number: existing.chapter_number.or(input.chapter_number),
        fan_translation: fill(existing.fan_translation, &input.fan_translation),
        next_url: fill(existing.next_url, &input.next_url),
        prev_url: fill(existing.prev_url, &input.prev_url),
        novel_id: fill(existing.novel_id, &input.novel_id),
        last_accessed: now,
        ..existing
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

fn fill(current: Option<String>, incoming: &Option<String>) -> Option<String> {
    match current {
        Some(value) if !value.trim().is_empty() => Some(value),
        _ => non_blank(incoming),
    }
}

/// Write a complete chapter record, replacing any row with the same URL
pub fn write(conn: &Connection, chapter: &Chapter) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO chapters (url, stable_id, canonical_url, original_url, title, content,
            chapter_number, fan_translation, next_url, prev_url, novel_id, date_added, last_accessed)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(url) DO UPDATE SET
            stable_id = excluded.stable_id,
            canonical_url = excluded.canonical_url,
            original_url = excluded.original_url,
            title = excluded.title,
            content = excluded.content,
            chapter_number = excluded.chapter_number,
            fan_translation = excluded.fan_translation,
            next_url = excluded.next_url,
            prev_url = excluded.prev_url,
            novel_id = excluded.novel_id,
            last_accessed = excluded.last_accessed
        "#,
        params![
            chapter.url,
            chapter.stable_id,
            chapter.canonical_url,
            chapter.original_url,
            chapter.title,
            chapter.content,
            chapter.chapter_number,
            chapter.fan_translation,
            chapter.next_url,
            chapter.prev_url,
            chapter.novel_id,
            to_millis(&chapter.date_added),
            to_millis(&chapter.last_accessed),
        ],
    )?;
    Ok(())
}

/// Set the stable ID and canonical URL on a legacy row
pub fn assign_identity(
    conn: &Connection,
    url: &str,
    stable_id: &str,
    canonical_url: &str,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE chapters SET stable_id = ?, canonical_url = ? WHERE url = ?",
        params![stable_id, canonical_url, url],
    )?;
    Ok(())
}

pub fn set_chapter_number(conn: &Connection, stable_id: &str, number: Option<i64>) -> StorageResult<bool> {
    let changed = conn.execute(
        "UPDATE chapters SET chapter_number = ? WHERE stable_id = ?",
        params![number, stable_id],
    )?;
    Ok(changed > 0)
}

pub fn touch(conn: &Connection, stable_id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
    let changed = conn.execute(
        "UPDATE chapters SET last_accessed = ? WHERE stable_id = ?",
        params![to_millis(&now), stable_id],
    )?;
    Ok(changed > 0)
}

/// Remove the chapter row and everything owned by it
///
/// Covers translation versions, the summary row, URL mappings, feedback,
/// diff results, cached images and the version counter. Rows belonging to
/// other chapters are untouched.
pub fn delete_cascade(conn: &Connection, chapter: &Chapter) -> StorageResult<()> {
    if let Some(stable_id) = &chapter.stable_id {
        for sql in [
            "DELETE FROM translation_versions WHERE stable_id = ?",
            "DELETE FROM chapter_summaries WHERE stable_id = ?",
            "DELETE FROM url_mappings WHERE stable_id = ?",
            "DELETE FROM feedback WHERE stable_id = ?",
            "DELETE FROM diff_results WHERE stable_id = ?",
            "DELETE FROM image_assets WHERE stable_id = ?",
            "DELETE FROM version_counters WHERE stable_id = ?",
        ] {
            conn.execute(sql, params![stable_id])?;
        }
    }
    conn.execute(
        "DELETE FROM translation_versions WHERE chapter_url = ?",
        params![chapter.url],
    )?;
    conn.execute("DELETE FROM chapters WHERE url = ?", params![chapter.url])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::now_millis;
    use crate::storage::test_support::conn;

    fn input(url: &str, n: i64) -> ChapterInput {
        ChapterInput::new(url, format!("Chapter {}", n), format!("Body of chapter {}", n))
            .with_number(n)
    }

    #[test]
    fn test_upsert_assigns_identity() {
        let conn = conn();
        let chapter = upsert(&conn, &input("https://example.com/c/1?x=1", 1), now_millis()).unwrap();

        let expected = stable_chapter_id("Body of chapter 1", Some(1), "Chapter 1");
        assert_eq!(chapter.stable_id.as_deref(), Some(expected.as_str()));
        assert_eq!(chapter.canonical_url.as_deref(), Some("https://example.com/c/1"));

        let loaded = find_by_stable_id(&conn, &expected).unwrap().unwrap();
        assert_eq!(loaded, chapter);
    }

    #[test]
    fn test_upsert_preserves_date_added_and_fills_blanks() {
        let conn = conn();
        let first_time = from_millis(1_000);
        let original = ChapterInput::new("https://e.com/1", "T", "Body").with_fan_translation("fan");
        upsert(&conn, &original, first_time).unwrap();

        let mut again = ChapterInput::new("https://e.com/1", "T", "Body");
        again.fan_translation = Some("   ".to_string());
        again.next_url = Some("https://e.com/2".to_string());
        let merged = upsert(&conn, &again, from_millis(5_000)).unwrap();

        assert_eq!(merged.date_added, first_time);
        assert_eq!(merged.last_accessed, from_millis(5_000));
        assert_eq!(merged.fan_translation.as_deref(), Some("fan"));
        assert_eq!(merged.next_url.as_deref(), Some("https://e.com/2"));
        assert_eq!(count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_upsert_keeps_existing_chapter_number() {
        let conn = conn();
        let stored = upsert(&conn, &input("https://e.com/7", 7), now_millis()).unwrap();
        let stable_id = stored.stable_id.clone().unwrap();

        // Same URL re-fetched without a number: different computed ID, same row
        let renumbered = ChapterInput::new("https://e.com/7", "Chapter 7", "Body of chapter 7");
        let merged = upsert(&conn, &renumbered, now_millis()).unwrap();

        assert_eq!(merged.chapter_number, Some(7));
        assert_eq!(merged.stable_id.as_deref(), Some(stable_id.as_str()));
    }

    #[test]
    fn test_same_content_from_new_url_lands_on_same_row() {
        let conn = conn();
        let a = upsert(&conn, &input("https://mirror-a.com/c/1", 1), now_millis()).unwrap();
        let b = upsert(&conn, &input("https://mirror-b.com/c/1", 1), now_millis()).unwrap();

        assert_eq!(a.stable_id, b.stable_id);
        assert_eq!(b.url, "https://mirror-a.com/c/1");
        assert_eq!(count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_resolve_by_canonical_and_mapping() {
        let conn = conn();
        let chapter = upsert(&conn, &input("https://e.com/c/1/", 1), now_millis()).unwrap();
        let stable_id = chapter.stable_id.clone().unwrap();

        let by_canonical = resolve(&conn, "https://e.com/c/1?page=2").unwrap().unwrap();
        assert_eq!(by_canonical.url, "https://e.com/c/1/");

        mappings::upsert(&conn, "https://alias.net/one", &stable_id, false, now_millis()).unwrap();
        let by_alias = resolve(&conn, "https://alias.net/one#top").unwrap().unwrap();
        assert_eq!(by_alias.stable_id.as_deref(), Some(stable_id.as_str()));

        assert!(resolve(&conn, "https://unknown.org/x").unwrap().is_none());
    }

    #[test]
    fn test_all_orders_numbered_first() {
        let conn = conn();
        upsert(&conn, &ChapterInput::new("https://e.com/prologue", "Prologue", "p"), now_millis())
            .unwrap();
        upsert(&conn, &input("https://e.com/2", 2), now_millis()).unwrap();
        upsert(&conn, &input("https://e.com/1", 1), now_millis()).unwrap();

        let titles: Vec<String> = all(&conn).unwrap().into_iter().map(|c| c.title).collect();
        assert_eq!(titles, vec!["Chapter 1", "Chapter 2", "Prologue"]);
    }

    #[test]
    fn test_delete_cascade_leaves_other_chapters() {
        let conn = conn();
        let a = upsert(&conn, &input("https://e.com/a", 1), now_millis()).unwrap();
        let b = upsert(&conn, &input("https://e.com/b", 2), now_millis()).unwrap();
        let b_id = b.stable_id.clone().unwrap();
        mappings::upsert(&conn, "https://e.com/b", &b_id, true, now_millis()).unwrap();

        delete_cascade(&conn, &a).unwrap();

        assert!(find_by_url(&conn, "https://e.com/a").unwrap().is_none());
        assert!(find_by_url(&conn, "https://e.com/b").unwrap().is_some());
        assert_eq!(mappings::find_stable_id(&conn, "https://e.com/b").unwrap(), Some(b_id));
    }

    #[test]
    fn test_set_chapter_number_and_touch() {
        let conn = conn();
        let chapter = upsert(&conn, &input("https://e.com/1", 1), from_millis(10)).unwrap();
        let stable_id = chapter.stable_id.unwrap();

        assert!(set_chapter_number(&conn, &stable_id, Some(42)).unwrap());
        assert!(touch(&conn, &stable_id, from_millis(99)).unwrap());
        assert!(!touch(&conn, "missing", from_millis(99)).unwrap());

        let loaded = find_by_stable_id(&conn, &stable_id).unwrap().unwrap();
        assert_eq!(loaded.chapter_number, Some(42));
        assert_eq!(loaded.last_accessed, from_millis(99));
        assert_eq!(loaded.date_added, from_millis(10));
    }
}
