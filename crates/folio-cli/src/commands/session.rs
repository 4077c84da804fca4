//! Session export and import handlers

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use folio_core::{ExportOptions, ImportStage, Store};

use crate::output::{Output, OutputFormat};

/// Export the store to a file or stdout
pub async fn export(
    store: &Store,
    path: Option<PathBuf>,
    include_chapters: bool,
    include_images: bool,
    output: &Output,
) -> Result<()> {
    let options = ExportOptions {
        include_chapters,
        include_images,
        include_telemetry: false,
    };
    let json = store
        .export_full_session_to_json(options)
        .await
        .context("Failed to export session")?;

    match path {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write export to {:?}", path))?;
            output.success(&format!("Exported session to {}", path.display()));
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Import a session document from a file
pub async fn import(store: &Store, file: &Path, output: &Output) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read session file {:?}", file))?;
    let payload: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("{:?} is not valid JSON", file))?;

    let show_progress = output.should_prompt();
    let summary = store
        .import_full_session_data(payload, move |progress| {
            if show_progress && progress.stage != ImportStage::Complete {
                eprintln!(
                    "[{}] {} ({}/{})",
                    progress.stage, progress.message, progress.current, progress.total
                );
            }
        })
        .await
        .context("Failed to import session")?;

    match output.format {
        OutputFormat::Json => output.print_json(&summary),
        _ => {
            output.success(&format!(
                "Imported {} chapter(s), {} translation(s), {} image(s)",
                summary.chapters, summary.translations, summary.images
            ));
            if !summary.skipped_sections.is_empty() {
                output.message(&format!(
                    "Skipped unreadable sections: {}",
                    summary.skipped_sections.join(", ")
                ));
            }
        }
    }
    Ok(())
}
