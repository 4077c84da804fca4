//! Unified storage interface
//!
//! The `Store` owns the connection manager and is the async entry point for
//! every operation. Each method runs its SQL on the blocking pool and
//! finishes the follow-through work (URL mappings, summary recompute)
//! before returning, so callers never observe a stale projection of their
//! own write.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open().await?;
//!
//! let chapter = store
//!     .store_chapter(ChapterInput::new(url, "Chapter 1", body).with_number(1))
//!     .await?;
//! store.store_translation(&chapter.url, content, settings).await?;
//!
//! for summary in store.get_chapter_summaries().await? {
//!     println!("{}", summary.title);
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::models::{
    AmendmentFilter, AmendmentLogEntry, AmendmentStats, Chapter, ChapterInput, ChapterSummary,
    DiffResult, FeedbackItem, ImageAsset, Novel, PromptTemplate, TranslationContent,
    TranslationPatch, TranslationSettings, TranslationVersion, UrlMapping,
};
use crate::session::{self, ExportOptions, ImportProgress, ImportSummary, SessionDocument, TelemetrySource};
use crate::storage::{
    amendments, catalog, chapters, images, mappings, now_millis, projection, schema, translations,
    write_tx, BackfillMode, BackfillReport, ConnectionManager, ConnectionOptions, StorageError,
    StorageResult,
};

/// Row counts and schema version
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub schema_version: i32,
    pub chapters: i64,
    pub translation_versions: i64,
    pub summaries: i64,
    pub url_mappings: i64,
    pub amendment_logs: i64,
    pub images: i64,
}

/// Unified storage interface for Folio
pub struct Store {
    manager: Arc<ConnectionManager>,
    config: Config,
    summaries_seeded: AtomicBool,
    telemetry: Option<Arc<dyn TelemetrySource>>,
}

/// Find the stable ID a loose chapter URL refers to
///
/// Chapter record first, then the mapping index, then versions stored
/// under that URL.
fn lookup_stable_id(conn: &Connection, url: &str) -> StorageResult<Option<String>> {
    if let Some(stable_id) = chapters::resolve(conn, url)?.and_then(|c| c.stable_id) {
        return Ok(Some(stable_id));
    }
    if let Some(stable_id) = mappings::find_stable_id(conn, url)? {
        return Ok(Some(stable_id));
    }
    Ok(conn
        .query_row(
            "SELECT stable_id FROM translation_versions WHERE chapter_url = ? ORDER BY version DESC LIMIT 1",
            params![url],
            |row| row.get(0),
        )
        .optional()?)
}

fn clear_tables(conn: &mut Connection) -> StorageResult<()> {
    let tx = write_tx(conn)?;
    for table in [
        "translation_versions",
        "chapter_summaries",
        "url_mappings",
        "feedback",
        "diff_results",
        "image_assets",
        "version_counters",
        "chapters",
        "amendment_logs",
        "novels",
        "prompt_templates",
        "settings",
    ] {
        tx.execute(&format!("DELETE FROM {}", table), [])?;
    }
    tx.commit()?;
    Ok(())
}

impl Store {
    /// Open the store using the default configuration
    ///
    /// Runs migrations and the URL mapping backfill.
    pub async fn open() -> anyhow::Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
            .await
            .context("Failed to open store")
    }

    /// Open the store with a specific configuration
    pub async fn open_with_config(config: Config) -> StorageResult<Self> {
        let options = ConnectionOptions::from_config(&config);
        Self::open_with_options(config, options).await
    }

    /// Open a private in-memory store (tests)
    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open_with_options(Config::default(), ConnectionOptions::memory()).await
    }

    async fn open_with_options(config: Config, options: ConnectionOptions) -> StorageResult<Self> {
        let store = Self {
            manager: Arc::new(ConnectionManager::new(options)),
            config,
            summaries_seeded: AtomicBool::new(false),
            telemetry: None,
        };

        let report = store
            .backfill_url_mappings_from_chapters(BackfillMode::IfOutdated)
            .await?;
        if !report.skipped {
            info!(
                assigned = report.stable_ids_assigned,
                mappings = report.mappings_written,
                "Backfilled URL mappings on open"
            );
        }
        Ok(store)
    }

    /// Attach the telemetry source embedded in exports
    pub fn with_telemetry(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(source);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Watch handle invalidations
    pub fn subscribe_invalidations(&self) -> watch::Receiver<u64> {
        self.manager.subscribe()
    }

    async fn with_conn<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.manager.acquire().await?;
        handle.run(f).await
    }

    // ==================== Chapter Operations ====================

    /// Store or merge a chapter, then index its URLs and refresh its summary
    pub async fn store_chapter(&self, input: ChapterInput) -> StorageResult<Chapter> {
        self.with_conn(move |conn| {
            let now = now_millis();
            let tx = write_tx(conn)?;
            let chapter = chapters::upsert(&tx, &input, now)?;
            tx.commit()?;

            let tx = write_tx(conn)?;
            if let Some(stable_id) = chapter.stable_id.as_deref() {
                mappings::record_chapter_urls(&tx, &chapter, now)?;
                if input.url != chapter.url {
                    mappings::record_alias(&tx, &input.url, stable_id, now)?;
                }
                projection::recompute(&tx, stable_id)?;
            }
            tx.commit()?;

            debug!(url = %chapter.url, stable_id = ?chapter.stable_id, "Stored chapter");
            Ok(chapter)
        })
        .await
    }

    pub async fn get_chapter(&self, url: &str) -> StorageResult<Option<Chapter>> {
        let url = url.to_string();
        self.with_conn(move |conn| chapters::resolve(conn, &url)).await
    }

    pub async fn get_chapter_by_stable_id(&self, stable_id: &str) -> StorageResult<Option<Chapter>> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| chapters::find_by_stable_id(conn, &stable_id))
            .await
    }

    pub async fn get_all_chapters(&self) -> StorageResult<Vec<Chapter>> {
        self.with_conn(|conn| chapters::all(conn)).await
    }

    /// Delete a chapter with its versions, summary and other owned rows
    ///
    /// Returns false if no chapter matched.
    pub async fn delete_chapter(&self, url: &str) -> StorageResult<bool> {
        let url = url.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let Some(chapter) = chapters::resolve(&tx, &url)? else {
                return Ok(false);
            };
            chapters::delete_cascade(&tx, &chapter)?;
            tx.commit()?;
            info!(url = %chapter.url, "Deleted chapter");
            Ok(true)
        })
        .await
    }

    pub async fn set_chapter_number_by_stable_id(
        &self,
        stable_id: &str,
        number: Option<i64>,
    ) -> StorageResult<bool> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let changed = chapters::set_chapter_number(&tx, &stable_id, number)?;
            if changed {
                projection::recompute(&tx, &stable_id)?;
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    pub async fn mark_chapter_accessed(&self, stable_id: &str) -> StorageResult<bool> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let changed = chapters::touch(&tx, &stable_id, now_millis())?;
            if changed {
                projection::recompute(&tx, &stable_id)?;
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    // ==================== Translation Operations ====================

    /// Store a new translation as the active version for a chapter URL
    ///
    /// Numbering, deactivation and insert commit together; the summary is
    /// recomputed before this returns.
    pub async fn store_translation(
        &self,
        chapter_url: &str,
        content: TranslationContent,
        settings: TranslationSettings,
    ) -> StorageResult<TranslationVersion> {
        let chapter_url = chapter_url.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let stable_id = translations::resolve_stable_id(&tx, &chapter_url)?;
            let version =
                translations::append(&tx, &stable_id, &chapter_url, &content, &settings, now_millis())?;
            tx.commit()?;

            projection::recompute(conn, &stable_id)?;
            Ok(version)
        })
        .await
    }

    /// Store a new active translation for a stable ID
    ///
    /// Fails with `ChapterNotFound` when neither a chapter nor a mapping
    /// names the ID.
    pub async fn store_translation_by_stable_id(
        &self,
        stable_id: &str,
        content: TranslationContent,
        settings: TranslationSettings,
    ) -> StorageResult<TranslationVersion> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let chapter_url = match chapters::find_by_stable_id(&tx, &stable_id)? {
                Some(chapter) => chapter.url,
                None => mappings::canonical_url_for(&tx, &stable_id)?.ok_or_else(|| {
                    StorageError::ChapterNotFound {
                        reference: stable_id.clone(),
                    }
                })?,
            };
            let version =
                translations::append(&tx, &stable_id, &chapter_url, &content, &settings, now_millis())?;
            tx.commit()?;

            projection::recompute(conn, &stable_id)?;
            Ok(version)
        })
        .await
    }

    /// All versions for a chapter URL, oldest first
    pub async fn get_translation_versions(
        &self,
        chapter_url: &str,
    ) -> StorageResult<Vec<TranslationVersion>> {
        let chapter_url = chapter_url.to_string();
        self.with_conn(move |conn| match lookup_stable_id(conn, &chapter_url)? {
            Some(stable_id) => translations::list(conn, &stable_id),
            None => translations::list_for_chapter_url(conn, &chapter_url),
        })
        .await
    }

    pub async fn get_translation_versions_by_stable_id(
        &self,
        stable_id: &str,
    ) -> StorageResult<Vec<TranslationVersion>> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| translations::list(conn, &stable_id))
            .await
    }

    pub async fn get_active_translation(
        &self,
        chapter_url: &str,
    ) -> StorageResult<Option<TranslationVersion>> {
        let chapter_url = chapter_url.to_string();
        self.with_conn(move |conn| match lookup_stable_id(conn, &chapter_url)? {
            Some(stable_id) => translations::active(conn, &stable_id),
            None => Ok(None),
        })
        .await
    }

    pub async fn get_active_translation_by_stable_id(
        &self,
        stable_id: &str,
    ) -> StorageResult<Option<TranslationVersion>> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| translations::active(conn, &stable_id))
            .await
    }

    /// Make `version` the active translation for a chapter URL
    pub async fn set_active_translation(&self, chapter_url: &str, version: i64) -> StorageResult<()> {
        let chapter_url = chapter_url.to_string();
        self.with_conn(move |conn| {
            let stable_id = lookup_stable_id(conn, &chapter_url)?.ok_or_else(|| {
                StorageError::ChapterNotFound {
                    reference: chapter_url.clone(),
                }
            })?;
            activate(conn, &stable_id, version)
        })
        .await
    }

    pub async fn set_active_translation_by_stable_id(
        &self,
        stable_id: &str,
        version: i64,
    ) -> StorageResult<()> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| activate(conn, &stable_id, version))
            .await
    }

    /// Delete one version; an active version is not replaced
    pub async fn delete_translation_version(&self, id: &str) -> StorageResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let deleted = translations::delete(&tx, &id)?;
            if let Some(version) = &deleted {
                projection::recompute(&tx, &version.stable_id)?;
            }
            tx.commit()?;
            Ok(deleted.is_some())
        })
        .await
    }

    pub async fn update_translation(
        &self,
        id: &str,
        patch: TranslationPatch,
    ) -> StorageResult<Option<TranslationVersion>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let updated = translations::update(&tx, &id, &patch)?;
            if let Some(version) = &updated {
                projection::recompute(&tx, &version.stable_id)?;
            }
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Return the active version, promoting the latest one if none is active
    pub async fn ensure_active_translation_by_stable_id(
        &self,
        stable_id: &str,
    ) -> StorageResult<Option<TranslationVersion>> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let active = translations::ensure_active(&tx, &stable_id)?;
            if active.is_some() {
                projection::recompute(&tx, &stable_id)?;
            }
            tx.commit()?;
            Ok(active)
        })
        .await
    }

    // ==================== Mapping Operations ====================

    pub async fn get_stable_id_by_url(&self, url: &str) -> StorageResult<Option<String>> {
        let url = url.to_string();
        self.with_conn(move |conn| mappings::find_stable_id(conn, &url))
            .await
    }

    pub async fn get_url_for_stable_id(&self, stable_id: &str) -> StorageResult<Option<String>> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| mappings::canonical_url_for(conn, &stable_id))
            .await
    }

    pub async fn get_url_mapping_for_url(&self, url: &str) -> StorageResult<Option<UrlMapping>> {
        let url = url.to_string();
        self.with_conn(move |conn| mappings::find_mapping(conn, &url))
            .await
    }

    pub async fn get_all_url_mappings(&self) -> StorageResult<Vec<UrlMapping>> {
        self.with_conn(|conn| mappings::all(conn)).await
    }

    pub async fn backfill_url_mappings_from_chapters(
        &self,
        mode: BackfillMode,
    ) -> StorageResult<BackfillReport> {
        self.with_conn(move |conn| mappings::backfill_from_chapters(conn, mode, now_millis()))
            .await
    }

    // ==================== Summary Operations ====================

    /// Summary rows in reading order
    ///
    /// The first call seeds the projection if it is empty.
    pub async fn get_chapter_summaries(&self) -> StorageResult<Vec<ChapterSummary>> {
        let seed = !self.summaries_seeded.load(Ordering::SeqCst);
        let rows = self
            .with_conn(move |conn| {
                if seed && projection::seed_if_empty(conn)? {
                    info!("Seeded empty chapter summary projection");
                }
                projection::list(conn)
            })
            .await?;
        self.summaries_seeded.store(true, Ordering::SeqCst);
        Ok(rows)
    }

    pub async fn rebuild_chapter_summaries(&self) -> StorageResult<usize> {
        let written = self.with_conn(|conn| projection::rebuild_all(conn)).await?;
        self.summaries_seeded.store(true, Ordering::SeqCst);
        Ok(written)
    }

    // ==================== Amendment Operations ====================

    pub async fn log_amendment_action(&self, entry: AmendmentLogEntry) -> StorageResult<()> {
        self.with_conn(move |conn| amendments::upsert(conn, &entry))
            .await
    }

    pub async fn get_amendment_logs(
        &self,
        filter: Option<AmendmentFilter>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<AmendmentLogEntry>> {
        self.with_conn(move |conn| amendments::list(conn, filter.as_ref(), limit))
            .await
    }

    pub async fn get_amendment_stats(&self) -> StorageResult<AmendmentStats> {
        self.with_conn(|conn| amendments::stats(conn)).await
    }

    pub async fn delete_amendment_log(&self, id: &str) -> StorageResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| amendments::delete(conn, &id))
            .await
    }

    /// Bulk upsert entries (restore)
    pub async fn import_amendment_logs(&self, entries: Vec<AmendmentLogEntry>) -> StorageResult<usize> {
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            for entry in &entries {
                amendments::upsert(&tx, entry)?;
            }
            tx.commit()?;
            Ok(entries.len())
        })
        .await
    }

    // ==================== Session Operations ====================

    pub async fn export_session(&self, options: ExportOptions) -> StorageResult<SessionDocument> {
        let telemetry = self.telemetry.as_ref().map(|source| source.snapshot());
        let document = self
            .with_conn(move |conn| session::export::build_document(conn, &options, telemetry))
            .await?;
        info!(chapters = document.chapters.len(), "Exported session");
        Ok(document)
    }

    /// Export the whole store as a pretty-printed JSON document
    pub async fn export_full_session_to_json(&self, options: ExportOptions) -> StorageResult<String> {
        let document = self.export_session(options).await?;
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Restore a session payload, reporting progress as it goes
    pub async fn import_full_session_data<F>(
        &self,
        payload: Value,
        on_progress: F,
    ) -> StorageResult<ImportSummary>
    where
        F: FnMut(ImportProgress) + Send,
    {
        let summary = session::import::import_session(
            &self.manager,
            payload,
            self.config.import_batch_size,
            on_progress,
        )
        .await?;
        self.summaries_seeded.store(true, Ordering::SeqCst);
        Ok(summary)
    }

    /// Delete every record; the schema and backfill marker stay
    pub async fn clear_all_data(&self) -> StorageResult<()> {
        self.with_conn(clear_tables).await?;
        info!("Cleared all data");
        Ok(())
    }

    // ==================== Catalog Operations ====================

    pub async fn set_setting(&self, key: &str, value: Value) -> StorageResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| catalog::set_setting(conn, &key, &value))
            .await
    }

    pub async fn get_setting(&self, key: &str) -> StorageResult<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| catalog::get_setting(conn, &key))
            .await
    }

    pub async fn get_settings(&self) -> StorageResult<std::collections::BTreeMap<String, Value>> {
        self.with_conn(|conn| catalog::settings(conn)).await
    }

    pub async fn store_novel(&self, novel: Novel) -> StorageResult<()> {
        self.with_conn(move |conn| catalog::upsert_novel(conn, &novel))
            .await
    }

    pub async fn get_novels(&self) -> StorageResult<Vec<Novel>> {
        self.with_conn(|conn| catalog::novels(conn)).await
    }

    pub async fn store_prompt_template(&self, template: PromptTemplate) -> StorageResult<()> {
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            catalog::upsert_prompt_template(&tx, &template)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_prompt_templates(&self) -> StorageResult<Vec<PromptTemplate>> {
        self.with_conn(|conn| catalog::prompt_templates(conn)).await
    }

    pub async fn store_feedback(&self, item: FeedbackItem) -> StorageResult<()> {
        self.with_conn(move |conn| catalog::upsert_feedback(conn, &item))
            .await
    }

    pub async fn get_feedback(&self, stable_id: &str) -> StorageResult<Vec<FeedbackItem>> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| catalog::feedback_for(conn, &stable_id))
            .await
    }

    pub async fn store_diff_result(&self, diff: DiffResult) -> StorageResult<()> {
        self.with_conn(move |conn| catalog::upsert_diff_result(conn, &diff))
            .await
    }

    pub async fn get_diff_results(&self, stable_id: &str) -> StorageResult<Vec<DiffResult>> {
        let stable_id = stable_id.to_string();
        self.with_conn(move |conn| catalog::diff_results(conn, Some(&stable_id)))
            .await
    }

    pub async fn store_image_asset(&self, asset: ImageAsset) -> StorageResult<()> {
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            images::upsert(&tx, &asset)?;
            projection::recompute(&tx, &asset.stable_id)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_image_asset(&self, cache_key: &str) -> StorageResult<Option<ImageAsset>> {
        let cache_key = cache_key.to_string();
        self.with_conn(move |conn| images::get(conn, &cache_key))
            .await
    }

    // ==================== Stats ====================

    pub async fn stats(&self) -> StorageResult<StoreStats> {
        self.with_conn(|conn| {
            let count = |table: &str| -> StorageResult<i64> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?)
            };
            Ok(StoreStats {
                schema_version: schema::get_schema_version(conn)?.unwrap_or(0),
                chapters: count("chapters")?,
                translation_versions: count("translation_versions")?,
                summaries: count("chapter_summaries")?,
                url_mappings: count("url_mappings")?,
                amendment_logs: count("amendment_logs")?,
                images: count("image_assets")?,
            })
        })
        .await
    }
}

fn activate(conn: &mut Connection, stable_id: &str, version: i64) -> StorageResult<()> {
    let tx = write_tx(conn)?;
    if translations::set_active(&tx, stable_id, version)? {
        projection::recompute(&tx, stable_id)?;
        debug!(stable_id, version, "Activated translation version");
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AmendmentAction, AmendmentProposal, FeedbackKind, SuggestedIllustration};
    use serde_json::json;
    use tempfile::TempDir;

    fn content(text: &str) -> TranslationContent {
        TranslationContent {
            translated_title: format!("{} (EN)", text),
            translation: text.to_string(),
            ..Default::default()
        }
    }

    fn settings() -> TranslationSettings {
        TranslationSettings {
            provider: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.3,
            system_prompt: "Translate".to_string(),
        }
    }

    async fn store_with_chapter(url: &str) -> (Store, Chapter) {
        let store = Store::open_in_memory().await.unwrap();
        let chapter = store
            .store_chapter(ChapterInput::new(url, "Chapter 1", "Source text").with_number(1))
            .await
            .unwrap();
        (store, chapter)
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_database() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let store = Store::open_with_config(config).await.unwrap();

        assert!(dir.path().join("folio.db").exists());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.schema_version, schema::SCHEMA_VERSION);
        assert_eq!(stats.chapters, 0);
    }

    #[tokio::test]
    async fn test_store_chapter_indexes_urls_and_summary() {
        let (store, chapter) = store_with_chapter("https://e.com/c/1?ref=home").await;
        let stable_id = chapter.stable_id.clone().unwrap();

        assert_eq!(
            store.get_stable_id_by_url("https://e.com/c/1").await.unwrap(),
            Some(stable_id.clone())
        );
        assert_eq!(
            store.get_url_for_stable_id(&stable_id).await.unwrap().as_deref(),
            Some("https://e.com/c/1")
        );

        let summaries = store.get_chapter_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(!summaries[0].has_translation);
    }

    #[tokio::test]
    async fn test_same_chapter_from_second_url_is_alias() {
        let (store, first) = store_with_chapter("https://mirror-a.com/1").await;
        let second = store
            .store_chapter(ChapterInput::new("https://mirror-b.com/1", "Chapter 1", "Source text").with_number(1))
            .await
            .unwrap();

        assert_eq!(first.stable_id, second.stable_id);
        let found = store.get_chapter("https://mirror-b.com/1").await.unwrap().unwrap();
        assert_eq!(found.url, "https://mirror-a.com/1");
        assert_eq!(store.get_all_chapters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_translation_supersedes_active() {
        let (store, chapter) = store_with_chapter("https://e.com/1").await;

        let v1 = store.store_translation(&chapter.url, content("one"), settings()).await.unwrap();
        let v2 = store.store_translation(&chapter.url, content("two"), settings()).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let versions = store.get_translation_versions(&chapter.url).await.unwrap();
        assert_eq!(versions.iter().filter(|v| v.is_active).count(), 1);
        let active = store.get_active_translation(&chapter.url).await.unwrap().unwrap();
        assert_eq!(active.id, v2.id);

        let summary = &store.get_chapter_summaries().await.unwrap()[0];
        assert_eq!(summary.translated_title.as_deref(), Some("two (EN)"));
        assert_eq!(summary.last_translated_at, Some(v2.created_at));
    }

    #[tokio::test]
    async fn test_set_active_updates_summary() {
        let (store, chapter) = store_with_chapter("https://e.com/1").await;
        let v1 = store.store_translation(&chapter.url, content("one"), settings()).await.unwrap();
        store.store_translation(&chapter.url, content("two"), settings()).await.unwrap();

        store.set_active_translation(&chapter.url, 1).await.unwrap();

        let active = store.get_active_translation(&chapter.url).await.unwrap().unwrap();
        assert_eq!(active.version, 1);
        let summary = &store.get_chapter_summaries().await.unwrap()[0];
        assert_eq!(summary.last_translated_at, Some(v1.created_at));

        let err = store.set_active_translation(&chapter.url, 7).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionNotFound { version: 7, .. }));
        assert_eq!(store.get_active_translation(&chapter.url).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_unknown_chapter_references_are_reported() {
        let store = Store::open_in_memory().await.unwrap();

        let err = store
            .set_active_translation("https://e.com/unknown", 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::ChapterNotFound { ref reference } if reference == "https://e.com/unknown"
        ));

        let err = store
            .store_translation_by_stable_id("ch1_missing", content("orphan"), settings())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChapterNotFound { .. }));
        assert_eq!(store.stats().await.unwrap().translation_versions, 0);
    }

    #[tokio::test]
    async fn test_store_by_stable_id_uses_chapter_url() {
        let (store, chapter) = store_with_chapter("https://e.com/5").await;
        let stable_id = chapter.stable_id.clone().unwrap();

        let version = store
            .store_translation_by_stable_id(&stable_id, content("five"), settings())
            .await
            .unwrap();
        assert_eq!(version.chapter_url, "https://e.com/5");
        assert!(version.is_active);
    }

    #[tokio::test]
    async fn test_delete_active_version_leaves_none_active() {
        let (store, chapter) = store_with_chapter("https://e.com/1").await;
        let stable_id = chapter.stable_id.clone().unwrap();
        store.store_translation(&chapter.url, content("one"), settings()).await.unwrap();
        let v2 = store.store_translation(&chapter.url, content("two"), settings()).await.unwrap();

        assert!(store.delete_translation_version(&v2.id).await.unwrap());
        assert!(store.get_active_translation_by_stable_id(&stable_id).await.unwrap().is_none());
        assert!(!store.get_chapter_summaries().await.unwrap()[0].has_translation);

        let healed = store.ensure_active_translation_by_stable_id(&stable_id).await.unwrap().unwrap();
        assert_eq!(healed.version, 1);

        let v3 = store.store_translation(&chapter.url, content("three"), settings()).await.unwrap();
        assert_eq!(v3.version, 3);
    }

    #[tokio::test]
    async fn test_update_translation_refreshes_images_flag() {
        let (store, chapter) = store_with_chapter("https://e.com/1").await;
        let v1 = store.store_translation(&chapter.url, content("one"), settings()).await.unwrap();

        let patch = TranslationPatch {
            suggested_illustrations: Some(vec![SuggestedIllustration {
                placement_marker: "[ILL-1]".to_string(),
                image_cache_key: Some("k".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let updated = store.update_translation(&v1.id, patch).await.unwrap().unwrap();
        assert_eq!(updated.translation, "one");
        assert!(store.get_chapter_summaries().await.unwrap()[0].has_images);
    }

    #[tokio::test]
    async fn test_translation_without_chapter_uses_fallback_id() {
        let store = Store::open_in_memory().await.unwrap();
        let version = store
            .store_translation("https://orphan.com/1", content("x"), settings())
            .await
            .unwrap();

        assert_eq!(version.stable_id, crate::identity::fallback_stable_id("https://orphan.com/1"));
        let versions = store.get_translation_versions("https://orphan.com/1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert!(store.get_chapter_summaries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_chapter_cascades() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store
            .store_chapter(ChapterInput::new("https://e.com/a", "A", "alpha").with_number(1))
            .await
            .unwrap();
        let b = store
            .store_chapter(ChapterInput::new("https://e.com/b", "B", "beta").with_number(2))
            .await
            .unwrap();
        store.store_translation(&a.url, content("a"), settings()).await.unwrap();
        store.store_translation(&b.url, content("b"), settings()).await.unwrap();
        let a_id = a.stable_id.clone().unwrap();
        store
            .store_feedback(FeedbackItem::new(a_id.clone(), FeedbackKind::Negative, "odd"))
            .await
            .unwrap();

        assert!(store.delete_chapter(&a.url).await.unwrap());
        assert!(!store.delete_chapter(&a.url).await.unwrap());

        assert!(store.get_chapter(&a.url).await.unwrap().is_none());
        assert!(store.get_translation_versions_by_stable_id(&a_id).await.unwrap().is_empty());
        assert!(store.get_feedback(&a_id).await.unwrap().is_empty());
        let summaries = store.get_chapter_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].title, "B");
        assert_eq!(store.get_translation_versions(&b.url).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chapter_number_and_access_update_summary() {
        let (store, chapter) = store_with_chapter("https://e.com/1").await;
        let stable_id = chapter.stable_id.unwrap();

        assert!(store.set_chapter_number_by_stable_id(&stable_id, Some(12)).await.unwrap());
        assert!(store.mark_chapter_accessed(&stable_id).await.unwrap());
        assert!(!store.mark_chapter_accessed("missing").await.unwrap());

        let summary = &store.get_chapter_summaries().await.unwrap()[0];
        assert_eq!(summary.chapter_number, Some(12));
    }

    #[tokio::test]
    async fn test_amendment_operations() {
        let store = Store::open_in_memory().await.unwrap();
        let entry = AmendmentLogEntry::new(AmendmentProposal::default(), AmendmentAction::Rejected)
            .for_chapter("ch1");
        store.log_amendment_action(entry.clone()).await.unwrap();
        store
            .import_amendment_logs(vec![AmendmentLogEntry::new(
                AmendmentProposal::default(),
                AmendmentAction::Accepted,
            )])
            .await
            .unwrap();

        let stats = store.get_amendment_stats().await.unwrap();
        assert_eq!((stats.total, stats.accepted, stats.rejected), (2, 1, 1));

        let by_chapter = store
            .get_amendment_logs(Some(AmendmentFilter::Chapter("ch1".to_string())), None)
            .await
            .unwrap();
        assert_eq!(by_chapter.len(), 1);
        assert!(store.delete_amendment_log(&entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_all_data() {
        let (store, chapter) = store_with_chapter("https://e.com/1").await;
        store.store_translation(&chapter.url, content("one"), settings()).await.unwrap();
        store.set_setting("provider", json!("gemini")).await.unwrap();

        store.clear_all_data().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chapters, 0);
        assert_eq!(stats.translation_versions, 0);
        assert_eq!(stats.url_mappings, 0);
        assert!(store.get_setting("provider").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidated_store_reopens_on_next_call() {
        let (store, chapter) = store_with_chapter("https://e.com/1").await;
        let mut events = store.subscribe_invalidations();
        let stale = store.connection_manager().acquire().await.unwrap();

        store.connection_manager().invalidate().await;
        assert!(events.has_changed().unwrap());
        assert!(matches!(
            stale.run(|_conn| Ok(())).await,
            Err(StorageError::Invalidated)
        ));

        // In-memory stores start empty on reopen
        assert!(store.get_chapter(&chapter.url).await.unwrap().is_none());
    }

    struct FixedTelemetry;

    impl TelemetrySource for FixedTelemetry {
        fn snapshot(&self) -> Value {
            json!({"sessionMinutes": 12})
        }
    }

    #[tokio::test]
    async fn test_export_includes_telemetry_when_asked() {
        let store = Store::open_in_memory()
            .await
            .unwrap()
            .with_telemetry(Arc::new(FixedTelemetry));

        let options = ExportOptions {
            include_telemetry: true,
            ..Default::default()
        };
        let json = store.export_full_session_to_json(options).await.unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["format"], json!("folio-session"));
        assert_eq!(parsed["telemetry"]["sessionMinutes"], json!(12));
    }
}
