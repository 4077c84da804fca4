//! Chapter listing handlers

use anyhow::{Context, Result};

use folio_core::Store;

use crate::output::Output;

/// List chapter summaries, optionally rebuilding the projection first
pub async fn list(store: &Store, rebuild: bool, output: &Output) -> Result<()> {
    if rebuild {
        let rows = store
            .rebuild_chapter_summaries()
            .await
            .context("Failed to rebuild chapter summaries")?;
        if !output.is_quiet() {
            eprintln!("Rebuilt {} summary row(s)", rows);
        }
    }

    let summaries = store
        .get_chapter_summaries()
        .await
        .context("Failed to list chapters")?;
    output.print_summaries(&summaries);
    Ok(())
}

/// Show the translation history for a chapter URL
pub async fn versions(store: &Store, url: &str, output: &Output) -> Result<()> {
    let versions = store
        .get_translation_versions(url)
        .await
        .with_context(|| format!("Failed to load translations for {}", url))?;
    output.print_versions(&versions);
    Ok(())
}
