//! Session import
//!
//! The payload arrives as untyped JSON and is decoded section by section
//! into the store's shapes. Required sections (settings, chapters) abort
//! the import when they fail; optional sections are skipped with a
//! warning.
//!
//! Writes happen in several transactions: catalog sections first, then
//! chapters in batches of `batch_size` (each chapter together with its
//! translations and feedback), then cached images. The task yields between
//! batches so large imports don't starve other work.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::identity::{normalize_url, stable_chapter_id};
use crate::models::{
    AmendmentLogEntry, DiffResult, ImageAsset, Novel, PromptTemplate, UrlMapping,
};
use crate::session::format::{
    ChapterRecord, ImportProgress, ImportStage, ImportSummary, SESSION_FORMAT,
    SESSION_FORMAT_VERSION,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{
    amendments, catalog, chapters, images, mappings, now_millis, projection, translations, write_tx,
    ConnectionManager,
};

/// Everything decoded from a payload, ready to write
#[derive(Debug, Default)]
struct DecodedSession {
    settings: BTreeMap<String, Value>,
    url_mappings: Vec<UrlMapping>,
    novels: Vec<Novel>,
    prompt_templates: Vec<PromptTemplate>,
    amendment_logs: Vec<AmendmentLogEntry>,
    diff_results: Vec<DiffResult>,
    chapters: Vec<ChapterRecord>,
    images: Vec<ImageAsset>,
    skipped: Vec<String>,
}

/// Check the format tag and version
fn check_header(payload: &Value) -> StorageResult<()> {
    let object = payload
        .as_object()
        .ok_or_else(|| StorageError::InvalidPayload("session payload must be a JSON object".to_string()))?;

    match object.get("format").and_then(Value::as_str) {
        Some(SESSION_FORMAT) => {}
        Some(other) => {
            return Err(StorageError::InvalidPayload(format!(
                "unsupported format '{}'",
                other
            )))
        }
        None => return Err(StorageError::InvalidPayload("missing format tag".to_string())),
    }

    let version = object.get("version").and_then(Value::as_u64).unwrap_or(1);
    if version == 0 || version > u64::from(SESSION_FORMAT_VERSION) {
        return Err(StorageError::InvalidPayload(format!(
            "unsupported session version {}",
            version
        )));
    }
    Ok(())
}

fn required<T: DeserializeOwned + Default>(
    payload: &mut Value,
    section: &'static str,
) -> StorageResult<T> {
    match payload.get_mut(section).map(Value::take) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| StorageError::ImportFailed {
            section,
            source: Box::new(StorageError::Serialization(e)),
        }),
    }
}

fn optional<T: DeserializeOwned + Default>(
    payload: &mut Value,
    section: &'static str,
    skipped: &mut Vec<String>,
) -> T {
    match payload.get_mut(section).map(Value::take) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!(section, "Skipping unreadable import section: {}", e);
            skipped.push(section.to_string());
            T::default()
        }),
    }
}

fn decode(mut payload: Value) -> StorageResult<DecodedSession> {
    check_header(&payload)?;

    let mut session = DecodedSession {
        settings: required(&mut payload, "settings")?,
        chapters: required(&mut payload, "chapters")?,
        ..Default::default()
    };
    let skipped = &mut session.skipped;
    session.url_mappings = optional(&mut payload, "urlMappings", skipped);
    session.novels = optional(&mut payload, "novels", skipped);
    session.prompt_templates = optional(&mut payload, "promptTemplates", skipped);
    session.amendment_logs = optional(&mut payload, "amendmentLogs", skipped);
    session.diff_results = optional(&mut payload, "diffResults", skipped);
    session.images = optional(&mut payload, "images", skipped);
    Ok(session)
}

/// Counts written by one transaction
#[derive(Debug, Default)]
struct BatchCounts {
    chapters: usize,
    translations: usize,
    feedback: usize,
}

/// Restore one chapter with its history; returns its stable ID
fn restore_chapter(
    conn: &rusqlite::Connection,
    mut record: ChapterRecord,
    counts: &mut BatchCounts,
) -> StorageResult<String> {
    let chapter = &mut record.chapter;
    let stable_id = chapter
        .stable_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| stable_chapter_id(&chapter.content, chapter.chapter_number, &chapter.title));
    chapter.stable_id = Some(stable_id.clone());
    if chapter.canonical_url.is_none() {
        chapter.canonical_url = Some(normalize_url(&chapter.url));
    }

    // Same identity stored under another URL: the imported row replaces it
    conn.execute(
        "DELETE FROM chapters WHERE stable_id = ?1 AND url != ?2",
        rusqlite::params![stable_id, chapter.url],
    )?;
    // Same URL held by another identity: drop that chapter and its dependents
    if let Some(existing) = chapters::find_by_url(conn, &chapter.url)? {
        if existing.stable_id.as_deref().is_some_and(|id| id != stable_id) {
            debug!(url = %chapter.url, old = ?existing.stable_id, new = %stable_id, "Replacing chapter identity on import");
            chapters::delete_cascade(conn, &existing)?;
        }
    }
    chapters::write(conn, chapter)?;

    for version in &mut record.translations {
        if version.chapter_url.trim().is_empty() {
            version.chapter_url = record.chapter.url.clone();
        }
    }
    counts.translations += translations::replace_history(conn, &stable_id, &record.translations)?;

    for mut item in record.feedback {
        if item.stable_id.is_empty() {
            item.stable_id = stable_id.clone();
        }
        catalog::upsert_feedback(conn, &item)?;
        counts.feedback += 1;
    }

    if mappings::find_mapping(conn, &record.chapter.url)?.is_none() {
        mappings::record_chapter_urls(conn, &record.chapter, now_millis())?;
    }
    projection::recompute(conn, &stable_id)?;
    counts.chapters += 1;
    Ok(stable_id)
}

/// Restore a session payload into the store
pub async fn import_session<F>(
    manager: &ConnectionManager,
    payload: Value,
    batch_size: usize,
    mut on_progress: F,
) -> StorageResult<ImportSummary>
where
    F: FnMut(ImportProgress) + Send,
{
    let DecodedSession {
        settings,
        url_mappings,
        novels,
        prompt_templates,
        amendment_logs,
        diff_results,
        chapters: chapter_records,
        images: image_assets,
        skipped,
    } = decode(payload)?;

    let mut summary = ImportSummary {
        skipped_sections: skipped,
        ..Default::default()
    };
    let batch_size = batch_size.max(1);

    // Catalog sections
    on_progress(ImportProgress::new(
        ImportStage::Settings,
        0,
        settings.len(),
        "Importing settings",
    ));
    summary.settings = settings.len();
    summary.url_mappings = url_mappings.len();
    summary.novels = novels.len();
    summary.prompt_templates = prompt_templates.len();
    summary.amendment_logs = amendment_logs.len();
    summary.diff_results = diff_results.len();

    let handle = manager.acquire().await?;
    handle
        .run(move |conn| {
            let tx = write_tx(conn)?;
            for (key, value) in &settings {
                catalog::set_setting(&tx, key, value)?;
            }
            for mapping in &url_mappings {
                mappings::restore(&tx, mapping)?;
            }
            for novel in &novels {
                catalog::upsert_novel(&tx, novel)?;
            }
            for template in &prompt_templates {
                catalog::upsert_prompt_template(&tx, template)?;
            }
            for entry in &amendment_logs {
                amendments::upsert(&tx, entry)?;
            }
            for diff in &diff_results {
                catalog::upsert_diff_result(&tx, diff)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::ImportFailed {
            section: "settings",
            source: Box::new(e),
        })?;
    on_progress(ImportProgress::new(
        ImportStage::Settings,
        summary.settings,
        summary.settings,
        "Settings imported",
    ));

    // Chapters, batched
    let total_chapters = chapter_records.len();
    let total_translations: usize = chapter_records.iter().map(|r| r.translations.len()).sum();
    on_progress(ImportProgress::new(
        ImportStage::Chapters,
        0,
        total_chapters,
        format!("Importing {} chapters", total_chapters),
    ));

    let mut remaining = chapter_records.into_iter().peekable();
    while remaining.peek().is_some() {
        let batch: Vec<ChapterRecord> = remaining.by_ref().take(batch_size).collect();
        let handle = manager.acquire().await?;
        let counts = handle
            .run(move |conn| {
                let tx = write_tx(conn)?;
                let mut counts = BatchCounts::default();
                for record in batch {
                    restore_chapter(&tx, record, &mut counts)?;
                }
                tx.commit()?;
                Ok(counts)
            })
            .await
            .map_err(|e| StorageError::ImportFailed {
                section: "chapters",
                source: Box::new(e),
            })?;

        summary.chapters += counts.chapters;
        summary.translations += counts.translations;
        summary.feedback += counts.feedback;
        debug!(done = summary.chapters, total = total_chapters, "Imported chapter batch");

        on_progress(ImportProgress::new(
            ImportStage::Chapters,
            summary.chapters,
            total_chapters,
            format!("Imported {}/{} chapters", summary.chapters, total_chapters),
        ));
        on_progress(ImportProgress::new(
            ImportStage::Translations,
            summary.translations,
            total_translations,
            format!("Imported {}/{} translations", summary.translations, total_translations),
        ));

        tokio::task::yield_now().await;
    }

    // Cached images
    if !image_assets.is_empty() {
        let handle = manager.acquire().await?;
        let result = handle
            .run(move |conn| {
                let tx = write_tx(conn)?;
                let mut written = 0;
                for asset in &image_assets {
                    match images::upsert(&tx, asset) {
                        Ok(()) => written += 1,
                        Err(StorageError::InvalidPayload(reason)) => {
                            warn!(cache_key = %asset.cache_key, "Skipping image: {}", reason)
                        }
                        Err(e) => return Err(e),
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await;
        match result {
            Ok(written) => summary.images = written,
            Err(e) => {
                warn!("Skipping images section: {}", e);
                summary.skipped_sections.push("images".to_string());
            }
        }
    }

    on_progress(ImportProgress::new(
        ImportStage::Complete,
        summary.chapters,
        total_chapters,
        "Import complete",
    ));
    info!(
        chapters = summary.chapters,
        translations = summary.translations,
        skipped = summary.skipped_sections.len(),
        "Session import complete"
    );
    Ok(summary)
}
