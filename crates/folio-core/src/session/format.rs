//! Session document shape
//!
//! A session export is one JSON document holding the whole store. Field
//! names are camelCase. Readers ignore unknown fields and default missing
//! ones so documents from older releases still import.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    AmendmentLogEntry, Chapter, DiffResult, FeedbackItem, ImageAsset, Novel, PromptTemplate,
    TranslationVersion, UrlMapping,
};

/// Format tag every session document carries
pub const SESSION_FORMAT: &str = "folio-session";

/// Current document version; version 1 documents are still accepted
pub const SESSION_FORMAT_VERSION: u32 = 2;

/// What an export includes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub include_chapters: bool,
    pub include_telemetry: bool,
    pub include_images: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_chapters: true,
            include_telemetry: false,
            include_images: true,
        }
    }
}

/// A chapter with everything that hangs off it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    #[serde(flatten)]
    pub chapter: Chapter,
    #[serde(default)]
    pub translations: Vec<TranslationVersion>,
    #[serde(default)]
    pub feedback: Vec<FeedbackItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub format: String,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub generator: Option<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub url_mappings: Vec<UrlMapping>,
    #[serde(default)]
    pub novels: Vec<Novel>,
    #[serde(default)]
    pub chapters: Vec<ChapterRecord>,
    #[serde(default)]
    pub prompt_templates: Vec<PromptTemplate>,
    #[serde(default)]
    pub amendment_logs: Vec<AmendmentLogEntry>,
    #[serde(default)]
    pub diff_results: Vec<DiffResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageAsset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Value>,
}

/// Import phase reported to progress callbacks
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImportStage {
    Settings,
    Chapters,
    Translations,
    Complete,
}

impl std::fmt::Display for ImportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImportStage::Settings => "settings",
            ImportStage::Chapters => "chapters",
            ImportStage::Translations => "translations",
            ImportStage::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImportProgress {
    pub stage: ImportStage,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl ImportProgress {
    pub(crate) fn new(stage: ImportStage, current: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            current,
            total,
            message: message.into(),
        }
    }
}

/// Counts of what an import wrote
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub settings: usize,
    pub url_mappings: usize,
    pub novels: usize,
    pub prompt_templates: usize,
    pub amendment_logs: usize,
    pub diff_results: usize,
    pub chapters: usize,
    pub translations: usize,
    pub feedback: usize,
    pub images: usize,
    /// Optional sections that failed to decode and were left out
    pub skipped_sections: Vec<String>,
}

/// Whether a settings key names a credential
pub fn is_secret_key(key: &str) -> bool {
    let folded: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    ["apikey", "secret", "token", "password"]
        .iter()
        .any(|needle| folded.contains(needle))
}

/// Remove credential entries from a settings value, at any depth
pub fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !is_secret_key(key));
            for nested in map.values_mut() {
                redact_secrets(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_secrets(item);
            }
        }
        _ => {}
    }
}

/// Redact a whole settings map
pub fn redact_settings(settings: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    settings
        .into_iter()
        .filter(|(key, _)| !is_secret_key(key))
        .map(|(key, mut value)| {
            redact_secrets(&mut value);
            (key, value)
        })
        .collect()
}
