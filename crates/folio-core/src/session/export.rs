//! Session export
//!
//! Reads the whole store inside one transaction so the document is a
//! consistent snapshot.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{ImageAsset, TranslationVersion};
use crate::session::format::{
    redact_settings, ChapterRecord, ExportOptions, SessionDocument, SESSION_FORMAT,
    SESSION_FORMAT_VERSION,
};
use crate::storage::error::StorageResult;
use crate::storage::{amendments, catalog, chapters, images, mappings, translations};

/// Build the session document for the current store state
pub fn build_document(
    conn: &mut Connection,
    options: &ExportOptions,
    telemetry: Option<Value>,
) -> StorageResult<SessionDocument> {
    let tx = conn.transaction()?;

    let mut records = Vec::new();
    let mut image_assets = Vec::new();
    let mut seen_images = HashSet::new();

    if options.include_chapters {
        for chapter in chapters::all(&tx)? {
            let (versions, feedback) = match chapter.stable_id.as_deref() {
                Some(stable_id) => (
                    translations::list(&tx, stable_id)?,
                    catalog::feedback_for(&tx, stable_id)?,
                ),
                None => (translations::list_for_chapter_url(&tx, &chapter.url)?, Vec::new()),
            };

            let versions = if options.include_images {
                for version in &versions {
                    collect_images(&tx, version, &mut seen_images, &mut image_assets)?;
                }
                versions
            } else {
                versions.into_iter().map(strip_embedded_images).collect()
            };

            records.push(ChapterRecord {
                chapter,
                translations: versions,
                feedback,
            });
        }
    }

    let document = SessionDocument {
        format: SESSION_FORMAT.to_string(),
        version: SESSION_FORMAT_VERSION,
        exported_at: Utc::now(),
        generator: Some(format!("folio {}", env!("CARGO_PKG_VERSION"))),
        settings: redact_settings(catalog::settings(&tx)?),
        url_mappings: mappings::all(&tx)?,
        novels: catalog::novels(&tx)?,
        chapters: records,
        prompt_templates: catalog::prompt_templates(&tx)?,
        amendment_logs: amendments::list(&tx, None, None)?,
        diff_results: catalog::diff_results(&tx, None)?,
        images: options.include_images.then_some(image_assets),
        telemetry: if options.include_telemetry { telemetry } else { None },
    };

    tx.commit()?;
    debug!(
        chapters = document.chapters.len(),
        images = document.images.as_ref().map_or(0, Vec::len),
        "Built session document"
    );
    Ok(document)
}

/// Resolve every illustration image of a version, once per chapter, marker and version
fn collect_images(
    conn: &Connection,
    version: &TranslationVersion,
    seen: &mut HashSet<(String, String, i64)>,
    out: &mut Vec<ImageAsset>,
) -> StorageResult<()> {
    for illustration in &version.suggested_illustrations {
        if !illustration.has_image() {
            continue;
        }
        let key = (
            version.stable_id.clone(),
            illustration.placement_marker.clone(),
            version.version,
        );
        if seen.contains(&key) {
            continue;
        }

        let cached = match illustration.image_cache_key.as_deref() {
            Some(cache_key) if !cache_key.is_empty() => images::get(conn, cache_key)?,
            _ => None,
        };

        let asset = match (cached, illustration.generated_image.as_deref()) {
            (Some(asset), _) => Some(asset),
            (None, Some(data_url)) if !data_url.is_empty() => match images::parse_data_url(data_url) {
                Ok((mime_type, data)) => Some(ImageAsset {
                    cache_key: illustration.image_cache_key.clone().unwrap_or_else(|| {
                        format!("legacy:{}:{}:{}", key.0, key.1, key.2)
                    }),
                    stable_id: key.0.clone(),
                    marker: key.1.clone(),
                    version: key.2,
                    mime_type,
                    data,
                    created_at: version.created_at,
                }),
                Err(e) => {
                    warn!(stable_id = %key.0, marker = %key.1, "Skipping unreadable embedded image: {}", e);
                    None
                }
            },
            _ => {
                warn!(stable_id = %key.0, marker = %key.1, "Image referenced but not cached");
                None
            }
        };

        if let Some(asset) = asset {
            seen.insert(key);
            out.push(asset);
        }
    }
    Ok(())
}

fn strip_embedded_images(mut version: TranslationVersion) -> TranslationVersion {
    for illustration in &mut version.suggested_illustrations {
        illustration.generated_image = None;
    }
    version
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ChapterInput, SuggestedIllustration, TranslationContent, TranslationSettings,
    };
    use crate::storage::test_support::conn;
    use crate::storage::{from_millis, now_millis};
    use serde_json::json;

    fn seed(conn: &Connection) -> String {
        let chapter = chapters::upsert(
            conn,
            &ChapterInput::new("https://e.com/1", "One", "Body").with_number(1),
            now_millis(),
        )
        .unwrap();
        let stable_id = chapter.stable_id.unwrap();

        let illustration = |marker: &str, key: Option<&str>, data: Option<&str>| SuggestedIllustration {
            placement_marker: marker.to_string(),
            image_prompt: "a castle".to_string(),
            generated_image: data.map(str::to_string),
            image_cache_key: key.map(str::to_string),
        };
        let content = TranslationContent {
            translated_title: "One (EN)".to_string(),
            translation: "text".to_string(),
            suggested_illustrations: vec![
                illustration("[ILL-1]", Some("cache-1"), None),
                illustration("[ILL-2]", None, Some("data:image/jpeg;base64,aGVsbG8=")),
                illustration("[ILL-3]", Some("missing"), None),
            ],
            ..Default::default()
        };
        translations::append(conn, &stable_id, "https://e.com/1", &content, &TranslationSettings::default(), now_millis())
            .unwrap();

        images::upsert(
            conn,
            &ImageAsset {
                cache_key: "cache-1".to_string(),
                stable_id: stable_id.clone(),
                marker: "[ILL-1]".to_string(),
                version: 1,
                mime_type: "image/png".to_string(),
                data: "aGk=".to_string(),
                created_at: from_millis(1),
            },
        )
        .unwrap();
        stable_id
    }

    #[test]
    fn test_export_resolves_and_dedups_images() {
        let mut conn = conn();
        let stable_id = seed(&conn);

        let doc = build_document(&mut conn, &ExportOptions::default(), None).unwrap();
        let images = doc.images.unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().any(|i| i.cache_key == "cache-1"));
        let legacy = images.iter().find(|i| i.marker == "[ILL-2]").unwrap();
        assert_eq!(legacy.mime_type, "image/jpeg");
        assert_eq!(legacy.cache_key, format!("legacy:{}:[ILL-2]:1", stable_id));
    }

    #[test]
    fn test_export_without_images_strips_embedded_data() {
        let mut conn = conn();
        seed(&conn);
        let options = ExportOptions {
            include_images: false,
            ..Default::default()
        };

        let doc = build_document(&mut conn, &options, None).unwrap();
        assert!(doc.images.is_none());
        let illustrations = &doc.chapters[0].translations[0].suggested_illustrations;
        assert!(illustrations.iter().all(|i| i.generated_image.is_none()));
    }

    #[test]
    fn test_export_redacts_settings_and_gates_telemetry() {
        let mut conn = conn();
        catalog::set_setting(&conn, "provider", &json!("openai")).unwrap();
        catalog::set_setting(&conn, "apiKeyOpenAI", &json!("sk-secret")).unwrap();

        let doc = build_document(&mut conn, &ExportOptions::default(), Some(json!({"events": 3}))).unwrap();
        assert_eq!(doc.format, SESSION_FORMAT);
        assert_eq!(doc.version, SESSION_FORMAT_VERSION);
        assert!(doc.settings.contains_key("provider"));
        assert!(!doc.settings.contains_key("apiKeyOpenAI"));
        assert!(doc.telemetry.is_none());

        let options = ExportOptions {
            include_telemetry: true,
            include_chapters: false,
            ..Default::default()
        };
        let doc = build_document(&mut conn, &options, Some(json!({"events": 3}))).unwrap();
        assert_eq!(doc.telemetry, Some(json!({"events": 3})));
        assert!(doc.chapters.is_empty());
    }
}
