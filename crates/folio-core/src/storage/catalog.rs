//! Auxiliary collections
//!
//! Settings, novels, prompt templates, reader feedback and diff results.
//! None of these take part in chapter identity; they are carried along by
//! session export and removed with their chapter where they reference one.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::models::{DiffResult, FeedbackItem, FeedbackKind, Novel, PromptTemplate};
use crate::storage::error::StorageResult;
use crate::storage::{from_millis, json_column, to_millis};

// ==================== Settings ====================

pub fn set_setting(conn: &Connection, key: &str, value: &Value) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

pub fn get_setting(conn: &Connection, key: &str) -> StorageResult<Option<Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", params![key], |row| row.get(0))
        .optional()?;
    Ok(raw.map(|text| serde_json::from_str(&text)).transpose()?)
}

pub fn settings(conn: &Connection) -> StorageResult<BTreeMap<String, Value>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, json_column::<Value>(row, 1)?)))?;
    let mut map = BTreeMap::new();
    for row in rows {
        let (key, value) = row?;
        map.insert(key, value);
    }
    Ok(map)
}

// ==================== Novels ====================

pub fn upsert_novel(conn: &Connection, novel: &Novel) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO novels (id, title, source_url, metadata, date_added)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            source_url = excluded.source_url,
            metadata = excluded.metadata
        "#,
        params![
            novel.id,
            novel.title,
            novel.source_url,
            serde_json::to_string(&novel.metadata)?,
            to_millis(&novel.date_added),
        ],
    )?;
    Ok(())
}

pub fn novels(conn: &Connection) -> StorageResult<Vec<Novel>> {
    let mut stmt =
        conn.prepare("SELECT id, title, source_url, metadata, date_added FROM novels ORDER BY title, id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Novel {
                id: row.get(0)?,
                title: row.get(1)?,
                source_url: row.get(2)?,
                metadata: json_column(row, 3)?,
                date_added: from_millis(row.get(4)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ==================== Prompt templates ====================

/// Insert or update a template; a new default clears the previous default
pub fn upsert_prompt_template(conn: &Connection, template: &PromptTemplate) -> StorageResult<()> {
    if template.is_default {
        conn.execute(
            "UPDATE prompt_templates SET is_default = 0 WHERE id != ?",
            params![template.id],
        )?;
    }
    conn.execute(
        r#"
        INSERT INTO prompt_templates (id, name, content, description, is_default, created_at, last_used)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            content = excluded.content,
            description = excluded.description,
            is_default = excluded.is_default,
            last_used = excluded.last_used
        "#,
        params![
            template.id,
            template.name,
            template.content,
            template.description,
            template.is_default,
            to_millis(&template.created_at),
            template.last_used.as_ref().map(to_millis),
        ],
    )?;
    Ok(())
}

pub fn prompt_templates(conn: &Connection) -> StorageResult<Vec<PromptTemplate>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, content, description, is_default, created_at, last_used
         FROM prompt_templates ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PromptTemplate {
                id: row.get(0)?,
                name: row.get(1)?,
                content: row.get(2)?,
                description: row.get(3)?,
                is_default: row.get(4)?,
                created_at: from_millis(row.get(5)?),
                last_used: row.get::<_, Option<i64>>(6)?.map(from_millis),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ==================== Feedback ====================

fn map_feedback(row: &Row<'_>) -> rusqlite::Result<FeedbackItem> {
    let kind: String = row.get(3)?;
    let kind = kind.parse::<FeedbackKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(FeedbackItem {
        id: row.get(0)?,
        stable_id: row.get(1)?,
        translation_id: row.get(2)?,
        kind,
        selection: row.get(4)?,
        comment: row.get(5)?,
        created_at: from_millis(row.get(6)?),
    })
}

pub fn upsert_feedback(conn: &Connection, item: &FeedbackItem) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO feedback (id, stable_id, translation_id, kind, selection, comment, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            stable_id = excluded.stable_id,
            translation_id = excluded.translation_id,
            kind = excluded.kind,
            selection = excluded.selection,
            comment = excluded.comment
        "#,
        params![
            item.id,
            item.stable_id,
            item.translation_id,
            item.kind.as_str(),
            item.selection,
            item.comment,
            to_millis(&item.created_at),
        ],
    )?;
    Ok(())
}

pub fn feedback_for(conn: &Connection, stable_id: &str) -> StorageResult<Vec<FeedbackItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, stable_id, translation_id, kind, selection, comment, created_at
         FROM feedback WHERE stable_id = ? ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![stable_id], map_feedback)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ==================== Diff results ====================

pub fn upsert_diff_result(conn: &Connection, diff: &DiffResult) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO diff_results (id, stable_id, translation_id, payload, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            stable_id = excluded.stable_id,
            translation_id = excluded.translation_id,
            payload = excluded.payload
        "#,
        params![
            diff.id,
            diff.stable_id,
            diff.translation_id,
            serde_json::to_string(&diff.payload)?,
            to_millis(&diff.created_at),
        ],
    )?;
    Ok(())
}

/// Diff results for one chapter, or all of them
pub fn diff_results(conn: &Connection, stable_id: Option<&str>) -> StorageResult<Vec<DiffResult>> {
    let map = |row: &Row<'_>| -> rusqlite::Result<DiffResult> {
        Ok(DiffResult {
            id: row.get(0)?,
            stable_id: row.get(1)?,
            translation_id: row.get(2)?,
            payload: json_column(row, 3)?,
            created_at: from_millis(row.get(4)?),
        })
    };
    let base = "SELECT id, stable_id, translation_id, payload, created_at FROM diff_results";
    let rows = match stable_id {
        Some(stable_id) => {
            let mut stmt = conn.prepare(&format!("{} WHERE stable_id = ? ORDER BY created_at, id", base))?;
            let rows = stmt
                .query_map(params![stable_id], map)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!("{} ORDER BY stable_id, created_at, id", base))?;
            let rows = stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}
