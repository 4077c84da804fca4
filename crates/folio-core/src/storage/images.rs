//! Generated image cache
//!
//! Images are cached by key and referenced from suggested illustrations.
//! Data is stored base64-encoded alongside its MIME type.

use base64::Engine as _;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::ImageAsset;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{from_millis, to_millis};

const IMAGE_COLUMNS: &str = "cache_key, stable_id, marker, version, mime_type, data, created_at";

fn map_image(row: &Row<'_>) -> rusqlite::Result<ImageAsset> {
    Ok(ImageAsset {
        cache_key: row.get(0)?,
        stable_id: row.get(1)?,
        marker: row.get(2)?,
        version: row.get(3)?,
        mime_type: row.get(4)?,
        data: row.get(5)?,
        created_at: from_millis(row.get(6)?),
    })
}

/// Split a `data:<mime>;base64,<payload>` URL
///
/// Plain base64 without the prefix is accepted as PNG. The payload must
/// decode.
pub fn parse_data_url(raw: &str) -> StorageResult<(String, String)> {
    let raw = raw.trim();
    let (mime, payload) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| StorageError::InvalidPayload("data URL without payload".to_string()))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| StorageError::InvalidPayload("data URL is not base64".to_string()))?;
            let mime = if mime.is_empty() { "image/png" } else { mime };
            (mime.to_string(), payload.to_string())
        }
        None => ("image/png".to_string(), raw.to_string()),
    };

    base64::engine::general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| StorageError::InvalidPayload(format!("invalid image data: {}", e)))?;
    Ok((mime, payload))
}

pub fn to_data_url(asset: &ImageAsset) -> String {
    format!("data:{};base64,{}", asset.mime_type, asset.data)
}

/// Insert or replace an image; the data must be valid base64
pub fn upsert(conn: &Connection, asset: &ImageAsset) -> StorageResult<()> {
    base64::engine::general_purpose::STANDARD
        .decode(asset.data.as_bytes())
        .map_err(|e| StorageError::InvalidPayload(format!("invalid image data: {}", e)))?;

    conn.execute(
        r#"
        INSERT INTO image_assets (cache_key, stable_id, marker, version, mime_type, data, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(cache_key) DO UPDATE SET
            stable_id = excluded.stable_id,
            marker = excluded.marker,
            version = excluded.version,
            mime_type = excluded.mime_type,
            data = excluded.data
        "#,
        params![
            asset.cache_key,
            asset.stable_id,
            asset.marker,
            asset.version,
            asset.mime_type,
            asset.data,
            to_millis(&asset.created_at),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, cache_key: &str) -> StorageResult<Option<ImageAsset>> {
    let sql = format!("SELECT {} FROM image_assets WHERE cache_key = ?", IMAGE_COLUMNS);
    Ok(conn.query_row(&sql, params![cache_key], map_image).optional()?)
}

pub fn for_chapter(conn: &Connection, stable_id: &str) -> StorageResult<Vec<ImageAsset>> {
    let sql = format!(
        "SELECT {} FROM image_assets WHERE stable_id = ? ORDER BY marker, version",
        IMAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![stable_id], map_image)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
