//! Whole-store export and import
//!
//! - `format`: the session document and its progress/summary types
//! - `export`: builds a document from the store in one read
//! - `import`: restores a document in batched transactions

pub mod export;
pub mod format;
pub mod import;

pub use format::{
    redact_secrets, ChapterRecord, ExportOptions, ImportProgress, ImportStage, ImportSummary,
    SessionDocument, SESSION_FORMAT, SESSION_FORMAT_VERSION,
};

/// Supplies the telemetry snapshot embedded in exports
///
/// Telemetry is collected outside the store; this is the seam it is read
/// through.
pub trait TelemetrySource: Send + Sync {
    fn snapshot(&self) -> serde_json::Value;
}
