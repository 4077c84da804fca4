//! Translation versions
//!
//! Append-mostly history of translations per chapter. At most one version
//! per stable ID is active; the partial unique index
//! `idx_versions_single_active` enforces it, so every activation change
//! deactivates first and activates second.
//!
//! Version numbers come from `max(existing, high-water mark) + 1`, where
//! the high-water mark in `version_counters` survives deletions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::{fallback_stable_id, stable_chapter_id};
use crate::models::{
    TranslationContent, TranslationPatch, TranslationSettings, TranslationVersion, UsageMetrics,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{chapters, from_millis, json_column, to_millis};

const VERSION_COLUMNS: &str = "id, stable_id, chapter_url, version, translated_title, translation, \
     footnotes, suggested_illustrations, provider, model, temperature, system_prompt, \
     prompt_tokens, completion_tokens, total_tokens, estimated_cost, request_time, created_at, is_active";

fn map_version(row: &Row<'_>) -> rusqlite::Result<TranslationVersion> {
    Ok(TranslationVersion {
        id: row.get(0)?,
        stable_id: row.get(1)?,
        chapter_url: row.get(2)?,
        version: row.get(3)?,
        translated_title: row.get(4)?,
        translation: row.get(5)?,
        footnotes: json_column(row, 6)?,
        suggested_illustrations: json_column(row, 7)?,
        provider: row.get(8)?,
        model: row.get(9)?,
        temperature: row.get(10)?,
        system_prompt: row.get(11)?,
        usage: UsageMetrics {
            prompt_tokens: row.get(12)?,
            completion_tokens: row.get(13)?,
            total_tokens: row.get(14)?,
            estimated_cost: row.get(15)?,
            request_time: row.get(16)?,
        },
        created_at: from_millis(row.get(17)?),
        is_active: row.get(18)?,
    })
}

fn query_versions(
    conn: &Connection,
    where_clause: &str,
    value: &str,
) -> StorageResult<Vec<TranslationVersion>> {
    let sql = format!(
        "SELECT {} FROM translation_versions WHERE {} ORDER BY version",
        VERSION_COLUMNS, where_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let versions = stmt
        .query_map(params![value], map_version)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(versions)
}

/// All versions of a chapter, oldest first
pub fn list(conn: &Connection, stable_id: &str) -> StorageResult<Vec<TranslationVersion>> {
    query_versions(conn, "stable_id = ?", stable_id)
}

pub fn list_for_chapter_url(
    conn: &Connection,
    chapter_url: &str,
) -> StorageResult<Vec<TranslationVersion>> {
    query_versions(conn, "chapter_url = ?", chapter_url)
}

pub fn active(conn: &Connection, stable_id: &str) -> StorageResult<Option<TranslationVersion>> {
    let sql = format!(
        "SELECT {} FROM translation_versions WHERE stable_id = ? AND is_active = 1",
        VERSION_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![stable_id], map_version)
        .optional()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> StorageResult<Option<TranslationVersion>> {
    let sql = format!(
        "SELECT {} FROM translation_versions WHERE id = ?",
        VERSION_COLUMNS
    );
    Ok(conn.query_row(&sql, params![id], map_version).optional()?)
}

pub fn count(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM translation_versions", [], |row| {
        row.get(0)
    })?)
}

fn has_version(conn: &Connection, stable_id: &str, version: i64) -> StorageResult<bool> {
    let mut stmt = conn
        .prepare_cached("SELECT 1 FROM translation_versions WHERE stable_id = ? AND version = ?")?;
    Ok(stmt.exists(params![stable_id, version])?)
}

/// Next version number for a chapter, never reusing a deleted number
pub fn next_version(conn: &Connection, stable_id: &str) -> StorageResult<i64> {
    let (max_existing, high_water): (i64, i64) = conn.query_row(
        r#"
        SELECT
            (SELECT COALESCE(MAX(version), 0) FROM translation_versions WHERE stable_id = ?1),
            (SELECT COALESCE(MAX(last_version), 0) FROM version_counters WHERE stable_id = ?1)
        "#,
        params![stable_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(max_existing.max(high_water) + 1)
}

fn bump_counter(conn: &Connection, stable_id: &str, version: i64) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO version_counters (stable_id, last_version) VALUES (?1, ?2)
        ON CONFLICT(stable_id) DO UPDATE SET
            last_version = MAX(version_counters.last_version, excluded.last_version)
        "#,
        params![stable_id, version],
    )?;
    Ok(())
}

/// Resolve the stable ID a translation for `chapter_url` belongs to
///
/// Order: the chapter's own ID; an ID derived from the chapter's content
/// (persisted onto the chapter); the ID already used by earlier versions
/// stored under this URL; a URL-derived fallback.
pub fn resolve_stable_id(conn: &Connection, chapter_url: &str) -> StorageResult<String> {
    if let Some(chapter) = chapters::resolve(conn, chapter_url)? {
        if let Some(stable_id) = chapter.stable_id {
            return Ok(stable_id);
        }
        let derived = stable_chapter_id(&chapter.content, chapter.chapter_number, &chapter.title);
        if chapters::find_by_stable_id(conn, &derived)?.is_none() {
            let canonical = chapter
                .canonical_url
                .clone()
                .unwrap_or_else(|| crate::identity::normalize_url(&chapter.url));
            chapters::assign_identity(conn, &chapter.url, &derived, &canonical)?;
            debug!(url = %chapter.url, stable_id = %derived, "Derived stable id for chapter");
            return Ok(derived);
        }
    }

    let previous: Option<String> = conn
        .query_row(
            "SELECT stable_id FROM translation_versions WHERE chapter_url = ? ORDER BY version DESC LIMIT 1",
            params![chapter_url],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(stable_id) = previous {
        return Ok(stable_id);
    }

    let fallback = fallback_stable_id(chapter_url);
    warn!(
        chapter_url,
        stable_id = %fallback,
        "No chapter record for translation; using URL-derived stable id"
    );
    Ok(fallback)
}

/// Insert a version row as given
pub fn insert(conn: &Connection, version: &TranslationVersion) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO translation_versions (id, stable_id, chapter_url, version, translated_title,
            translation, footnotes, suggested_illustrations, provider, model, temperature,
            system_prompt, prompt_tokens, completion_tokens, total_tokens, estimated_cost,
            request_time, created_at, is_active)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
        "#,
        params![
            version.id,
            version.stable_id,
            version.chapter_url,
            version.version,
            version.translated_title,
            version.translation,
            serde_json::to_string(&version.footnotes)?,
            serde_json::to_string(&version.suggested_illustrations)?,
            version.provider,
            version.model,
            version.temperature,
            version.system_prompt,
            version.usage.prompt_tokens,
            version.usage.completion_tokens,
            version.usage.total_tokens,
            version.usage.estimated_cost,
            version.usage.request_time,
            to_millis(&version.created_at),
            version.is_active,
        ],
    )?;
    bump_counter(conn, &version.stable_id, version.version)?;
    Ok(())
}

fn deactivate_all(conn: &Connection, stable_id: &str) -> StorageResult<usize> {
    Ok(conn.execute(
        "UPDATE translation_versions SET is_active = 0 WHERE stable_id = ? AND is_active = 1",
        params![stable_id],
    )?)
}

/// Append a new active version
///
/// Numbering, deactivation and insert happen on the caller's transaction.
pub fn append(
    conn: &Connection,
    stable_id: &str,
    chapter_url: &str,
    content: &TranslationContent,
    settings: &TranslationSettings,
    now: DateTime<Utc>,
) -> StorageResult<TranslationVersion> {
    let number = next_version(conn, stable_id)?;
    deactivate_all(conn, stable_id)?;

    let version = TranslationVersion {
        id: Uuid::new_v4().to_string(),
        stable_id: stable_id.to_string(),
        chapter_url: chapter_url.to_string(),
        version: number,
        translated_title: content.translated_title.clone(),
        translation: content.translation.clone(),
        footnotes: content.footnotes.clone(),
        suggested_illustrations: content.suggested_illustrations.clone(),
        provider: settings.provider.clone(),
        model: settings.model.clone(),
        temperature: settings.temperature,
        system_prompt: settings.system_prompt.clone(),
        usage: content.usage.clone(),
        created_at: now,
        is_active: true,
    };
    insert(conn, &version)?;

    debug!(stable_id, version = number, "Stored translation version");
    Ok(version)
}

/// Make exactly `version` the active one
///
/// Returns whether anything changed. A missing version is an error and
/// leaves the current activation untouched.
pub fn set_active(conn: &Connection, stable_id: &str, version: i64) -> StorageResult<bool> {
    if !has_version(conn, stable_id, version)? {
        return Err(StorageError::VersionNotFound {
            stable_id: stable_id.to_string(),
            version,
        });
    }

    if let Some(current) = active(conn, stable_id)? {
        if current.version == version {
            return Ok(false);
        }
    }

    deactivate_all(conn, stable_id)?;
    conn.execute(
        "UPDATE translation_versions SET is_active = 1 WHERE stable_id = ? AND version = ?",
        params![stable_id, version],
    )?;
    Ok(true)
}

/// Promote the highest version if none is active
pub fn ensure_active(conn: &Connection, stable_id: &str) -> StorageResult<Option<TranslationVersion>> {
    if let Some(current) = active(conn, stable_id)? {
        return Ok(Some(current));
    }

    let highest: Option<i64> = conn.query_row(
        "SELECT MAX(version) FROM translation_versions WHERE stable_id = ?",
        params![stable_id],
        |row| row.get(0),
    )?;
    let Some(highest) = highest else {
        return Ok(None);
    };

    conn.execute(
        "UPDATE translation_versions SET is_active = 1 WHERE stable_id = ? AND version = ?",
        params![stable_id, highest],
    )?;
    info!(stable_id, version = highest, "Promoted latest translation to active");
    active(conn, stable_id)
}

/// Delete one version by ID; no other version is promoted
pub fn delete(conn: &Connection, id: &str) -> StorageResult<Option<TranslationVersion>> {
    let Some(version) = find_by_id(conn, id)? else {
        return Ok(None);
    };
    bump_counter(conn, &version.stable_id, version.version)?;
    conn.execute("DELETE FROM translation_versions WHERE id = ?", params![id])?;
    Ok(Some(version))
}

/// Apply corrective fields to an existing version
pub fn update(
    conn: &Connection,
    id: &str,
    patch: &TranslationPatch,
) -> StorageResult<Option<TranslationVersion>> {
    let Some(mut version) = find_by_id(conn, id)? else {
        return Ok(None);
    };
    if patch.is_empty() {
        return Ok(Some(version));
    }

    if let Some(provider) = &patch.provider {
        version.provider = provider.clone();
    }
    if let Some(model) = &patch.model {
        version.model = model.clone();
    }
    if let Some(cost) = patch.estimated_cost {
        version.usage.estimated_cost = cost;
    }
    if let Some(illustrations) = &patch.suggested_illustrations {
        version.suggested_illustrations = illustrations.clone();
    }

    conn.execute(
        "UPDATE translation_versions
         SET provider = ?, model = ?, estimated_cost = ?, suggested_illustrations = ?
         WHERE id = ?",
        params![
            version.provider,
            version.model,
            version.usage.estimated_cost,
            serde_json::to_string(&version.suggested_illustrations)?,
            id
        ],
    )?;
    Ok(Some(version))
}

/// Replace a chapter's whole history with imported versions
///
/// If several imported versions claim to be active only the highest keeps
/// the flag.
pub fn replace_history(
    conn: &Connection,
    stable_id: &str,
    versions: &[TranslationVersion],
) -> StorageResult<usize> {
    conn.execute(
        "DELETE FROM translation_versions WHERE stable_id = ?",
        params![stable_id],
    )?;

    let versions = number_unversioned(versions);
    let active_version = versions
        .iter()
        .filter(|v| v.is_active)
        .map(|v| v.version)
        .max();

    let mut seen = std::collections::HashSet::new();
    let mut written = 0;
    for mut version in versions {
        if !seen.insert(version.version) {
            warn!(stable_id, version = version.version, "Skipping duplicate imported version");
            continue;
        }
        version.stable_id = stable_id.to_string();
        if version.id.trim().is_empty() || find_by_id(conn, &version.id)?.is_some() {
            version.id = Uuid::new_v4().to_string();
        }
        version.is_active = Some(version.version) == active_version;
        insert(conn, &version)?;
        written += 1;
    }
    Ok(written)
}

/// Give versions without a number (`version <= 0`) the next numbers after
/// the highest explicit one, in document order
fn number_unversioned(versions: &[TranslationVersion]) -> Vec<TranslationVersion> {
    let mut next = versions.iter().map(|v| v.version).max().unwrap_or(0).max(0);
    versions
        .iter()
        .cloned()
        .map(|mut version| {
            if version.version <= 0 {
                next += 1;
                version.version = next;
            }
            version
        })
        .collect()
}
