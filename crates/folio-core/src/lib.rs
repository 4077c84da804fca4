//! Folio Core Library
//!
//! This crate provides the persistence core for Folio, a chapter
//! translation workbench: source chapters, competing translation versions
//! per chapter, stable identities that survive URL churn, and a
//! read-optimized chapter listing.
//!
//! # Architecture
//!
//! - **SQLite** (via rusqlite): the single store, migrated on open
//! - **Stable IDs**: content-derived chapter identity; URLs are access keys
//!   indexed by the URL mapping table
//! - **Summaries**: a projection recomputed after every chapter or
//!   translation write
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open().await?;
//!
//! let chapter = store.store_chapter(ChapterInput::new(url, title, body)).await?;
//! store.store_translation(&chapter.url, content, settings).await?;
//!
//! let listing = store.get_chapter_summaries().await?;
//! ```
//!
//! # Modules
//!
//! - `store`: Async operation surface (main entry point)
//! - `models`: Data structures for chapters, translations and logs
//! - `identity`: Stable ID derivation and URL normalization
//! - `storage`: SQLite schema, connection lifecycle and per-table access
//! - `session`: Whole-store export and import
//! - `config`: Application configuration

pub mod config;
pub mod identity;
pub mod models;
pub mod session;
pub mod storage;
pub mod store;

pub use config::Config;
pub use identity::{fallback_stable_id, normalize_url, stable_chapter_id};
pub use models::{
    AmendmentAction, AmendmentFilter, AmendmentLogEntry, AmendmentProposal, AmendmentStats,
    Chapter, ChapterInput, ChapterSummary, DiffResult, FeedbackItem, FeedbackKind, Footnote,
    ImageAsset, Novel, PromptTemplate, SuggestedIllustration, TranslationContent,
    TranslationPatch, TranslationSettings, TranslationVersion, UrlMapping, UsageMetrics,
};
pub use session::{
    ExportOptions, ImportProgress, ImportStage, ImportSummary, SessionDocument, TelemetrySource,
};
pub use storage::{BackfillMode, BackfillReport, StorageError, StorageResult};
pub use store::{Store, StoreStats};
