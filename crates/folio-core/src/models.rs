//! Data models for Folio
//!
//! Defines the entities persisted by the store: chapters, translation
//! versions, URL mappings, summary rows, amendment log entries, and the
//! auxiliary catalog records carried by session exports.
//!
//! All models serialize with camelCase field names, which is the shape of
//! the session export document. Deserialization is lenient: absent fields
//! fall back to defaults so older export payloads still load.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A source chapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    /// Legacy access key (the URL the chapter was first stored under)
    pub url: String,
    /// Content-derived identity; absent only on legacy rows awaiting backfill
    #[serde(default)]
    pub stable_id: Option<String>,
    /// Normalized form of `url`
    #[serde(default)]
    pub canonical_url: Option<String>,
    #[serde(default)]
    pub original_url: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub chapter_number: Option<i64>,
    /// Reference fan translation used for comparison
    #[serde(default)]
    pub fan_translation: Option<String>,
    #[serde(default)]
    pub next_url: Option<String>,
    #[serde(default)]
    pub prev_url: Option<String>,
    #[serde(default)]
    pub novel_id: Option<String>,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub date_added: DateTime<Utc>,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub last_accessed: DateTime<Utc>,
}

/// Input for storing a chapter
///
/// The store derives the stable ID and canonical URL itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterInput {
    pub url: String,
    pub title: String,
    pub content: String,
    pub chapter_number: Option<i64>,
    pub fan_translation: Option<String>,
    pub original_url: Option<String>,
    pub next_url: Option<String>,
    pub prev_url: Option<String>,
    pub novel_id: Option<String>,
}

impl ChapterInput {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_number(mut self, number: i64) -> Self {
        self.chapter_number = Some(number);
        self
    }

    pub fn with_fan_translation(mut self, text: impl Into<String>) -> Self {
        self.fan_translation = Some(text.into());
        self
    }

    pub fn with_navigation(mut self, prev_url: Option<String>, next_url: Option<String>) -> Self {
        self.prev_url = prev_url;
        self.next_url = next_url;
        self
    }
}

/// A translator's footnote attached to a translation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Footnote {
    #[serde(default)]
    pub marker: String,
    #[serde(default)]
    pub text: String,
}

/// An illustration suggested by the translation provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedIllustration {
    /// Marker in the translated text where the image belongs
    #[serde(default)]
    pub placement_marker: String,
    #[serde(default)]
    pub image_prompt: String,
    /// Legacy embedded image (data URL)
    #[serde(default)]
    pub generated_image: Option<String>,
    /// Key into the image cache
    #[serde(default)]
    pub image_cache_key: Option<String>,
}

impl SuggestedIllustration {
    /// Whether this illustration carries generated image data
    pub fn has_image(&self) -> bool {
        self.generated_image
            .as_deref()
            .is_some_and(|data| !data.is_empty())
            || self
                .image_cache_key
                .as_deref()
                .is_some_and(|key| !key.is_empty())
    }
}

/// Token and cost accounting for one translation request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageMetrics {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub estimated_cost: f64,
    /// Request latency in seconds
    pub request_time: f64,
}

/// Provider settings snapshot taken when a translation is requested
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TranslationSettings {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub system_prompt: String,
}

/// Output of a translation request, as handed to the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationContent {
    pub translated_title: String,
    pub translation: String,
    pub footnotes: Vec<Footnote>,
    pub suggested_illustrations: Vec<SuggestedIllustration>,
    pub usage: UsageMetrics,
}

/// One stored translation of a chapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranslationVersion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub stable_id: String,
    #[serde(default)]
    pub chapter_url: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub translated_title: String,
    #[serde(default)]
    pub translation: String,
    #[serde(default)]
    pub footnotes: Vec<Footnote>,
    #[serde(default)]
    pub suggested_illustrations: Vec<SuggestedIllustration>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub usage: UsageMetrics,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
}

impl TranslationVersion {
    /// Whether any suggested illustration has a generated image
    pub fn has_images(&self) -> bool {
        self.suggested_illustrations.iter().any(|i| i.has_image())
    }
}

/// Corrective fields that may change on an existing translation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationPatch {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub estimated_cost: Option<f64>,
    pub suggested_illustrations: Option<Vec<SuggestedIllustration>>,
}

impl TranslationPatch {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none()
            && self.model.is_none()
            && self.estimated_cost.is_none()
            && self.suggested_illustrations.is_none()
    }
}

/// Maps a URL variant to a chapter's stable ID
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UrlMapping {
    pub url: String,
    pub stable_id: String,
    #[serde(default)]
    pub is_canonical: bool,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub date_added: DateTime<Utc>,
}

/// Read-optimized listing row for one chapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSummary {
    pub stable_id: String,
    pub canonical_url: Option<String>,
    pub title: String,
    pub translated_title: Option<String>,
    pub chapter_number: Option<i64>,
    pub has_translation: bool,
    pub has_images: bool,
    pub last_accessed: Option<DateTime<Utc>>,
    pub last_translated_at: Option<DateTime<Utc>>,
}

/// What happened to a proposed prompt amendment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AmendmentAction {
    Accepted,
    Rejected,
    Modified,
}

impl AmendmentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmendmentAction::Accepted => "accepted",
            AmendmentAction::Rejected => "rejected",
            AmendmentAction::Modified => "modified",
        }
    }
}

impl fmt::Display for AmendmentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AmendmentAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accepted" => Ok(AmendmentAction::Accepted),
            "rejected" => Ok(AmendmentAction::Rejected),
            "modified" => Ok(AmendmentAction::Modified),
            other => Err(format!("unknown amendment action '{}'", other)),
        }
    }
}

/// A prompt amendment proposed during translation review
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AmendmentProposal {
    pub observation: String,
    pub current_rule: String,
    pub proposed_change: String,
    pub reasoning: String,
}

/// Audit record of a decision on an amendment proposal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AmendmentLogEntry {
    pub id: String,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub chapter_id: Option<String>,
    #[serde(default)]
    pub proposal: AmendmentProposal,
    pub action: AmendmentAction,
    #[serde(default)]
    pub final_prompt_change: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl AmendmentLogEntry {
    pub fn new(proposal: AmendmentProposal, action: AmendmentAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            chapter_id: None,
            proposal,
            action,
            final_prompt_change: None,
            notes: None,
        }
    }

    pub fn for_chapter(mut self, chapter_id: impl Into<String>) -> Self {
        self.chapter_id = Some(chapter_id.into());
        self
    }

    pub fn with_final_change(mut self, change: impl Into<String>) -> Self {
        self.final_prompt_change = Some(change.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Single-index filter for amendment log retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmendmentFilter {
    Action(AmendmentAction),
    Chapter(String),
}

/// Amendment counts by action
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct AmendmentStats {
    pub total: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub modified: u64,
}

/// Novel-level metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Novel {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub date_added: DateTime<Utc>,
}

/// A reusable system prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "flexible_time::optional")]
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Positive,
    Negative,
    Suggestion,
    Question,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Positive => "positive",
            FeedbackKind::Negative => "negative",
            FeedbackKind::Suggestion => "suggestion",
            FeedbackKind::Question => "question",
        }
    }
}

impl FromStr for FeedbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positive" | "👍" => Ok(FeedbackKind::Positive),
            "negative" | "👎" => Ok(FeedbackKind::Negative),
            "suggestion" => Ok(FeedbackKind::Suggestion),
            "question" | "?" => Ok(FeedbackKind::Question),
            other => Err(format!("unknown feedback kind '{}'", other)),
        }
    }
}

/// Reader feedback on a passage of a translation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    pub id: String,
    #[serde(default)]
    pub stable_id: String,
    #[serde(default)]
    pub translation_id: Option<String>,
    pub kind: FeedbackKind,
    #[serde(default)]
    pub selection: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,
}

impl FeedbackItem {
    pub fn new(stable_id: impl Into<String>, kind: FeedbackKind, selection: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stable_id: stable_id.into(),
            translation_id: None,
            kind,
            selection: selection.into(),
            comment: None,
            created_at: Utc::now(),
        }
    }
}

/// Stored output of a source/translation diff analysis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub id: String,
    pub stable_id: String,
    #[serde(default)]
    pub translation_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,
}

/// A cached generated image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub cache_key: String,
    pub stable_id: String,
    pub marker: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default = "default_mime")]
    pub mime_type: String,
    /// Base64-encoded image bytes
    pub data: String,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,
}

fn default_mime() -> String {
    "image/png".to_string()
}

/// Timestamp deserializers accepting RFC 3339 strings or epoch milliseconds
///
/// Older exports wrote numeric timestamps; current ones write strings.
pub(crate) mod flexible_time {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Float(f64),
        Text(String),
    }

    fn convert<E: Error>(raw: Raw) -> Result<DateTime<Utc>, E> {
        match raw {
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {}", ms))),
            Raw::Float(ms) => Utc
                .timestamp_millis_opt(ms as i64)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {}", ms))),
            Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| E::custom(format!("invalid timestamp '{}': {}", s, e))),
        }
    }

    pub fn required<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        convert(Raw::deserialize(deserializer)?)
    }

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            Some(raw) => convert(raw).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illustration_has_image() {
        let mut ill = SuggestedIllustration {
            placement_marker: "[ILLUSTRATION-1]".to_string(),
            image_prompt: "a castle".to_string(),
            ..Default::default()
        };
        assert!(!ill.has_image());

        ill.generated_image = Some(String::new());
        assert!(!ill.has_image());

        ill.image_cache_key = Some("img-1".to_string());
        assert!(ill.has_image());
    }

    #[test]
    fn test_amendment_action_parse() {
        assert_eq!(
            "Accepted".parse::<AmendmentAction>().unwrap(),
            AmendmentAction::Accepted
        );
        assert_eq!(AmendmentAction::Modified.to_string(), "modified");
        assert!("maybe".parse::<AmendmentAction>().is_err());
    }

    #[test]
    fn test_chapter_deserializes_numeric_timestamps() {
        let json = r#"{
            "url": "https://example.com/c1",
            "title": "One",
            "content": "Body",
            "dateAdded": 1700000000000,
            "lastAccessed": "2024-01-02T03:04:05Z",
            "legacyField": true
        }"#;
        let chapter: Chapter = serde_json::from_str(json).unwrap();
        assert_eq!(chapter.date_added.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(chapter.last_accessed.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert!(chapter.stable_id.is_none());
    }

    #[test]
    fn test_translation_version_defaults() {
        let json = r#"{"id": "t1", "stableId": "ch1_a_b", "version": 2, "translation": "Hi"}"#;
        let version: TranslationVersion = serde_json::from_str(json).unwrap();
        assert_eq!(version.version, 2);
        assert!(!version.is_active);
        assert!(version.footnotes.is_empty());
        assert_eq!(version.usage, UsageMetrics::default());
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(TranslationPatch::default().is_empty());
        let patch = TranslationPatch {
            model: Some("gpt-4o".to_string()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
