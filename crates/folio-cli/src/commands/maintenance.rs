//! Backfill and clear handlers

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};

use folio_core::{BackfillMode, Store};

use crate::output::{Output, OutputFormat};

/// Run the URL mapping backfill
pub async fn backfill(store: &Store, force: bool, output: &Output) -> Result<()> {
    let mode = if force {
        BackfillMode::Force
    } else {
        BackfillMode::IfOutdated
    };
    let report = store
        .backfill_url_mappings_from_chapters(mode)
        .await
        .context("Backfill failed")?;

    match output.format {
        OutputFormat::Json => output.print_json(&report),
        _ if report.skipped => output.message("Backfill already up to date (use --force to rerun)"),
        _ => output.success(&format!(
            "Scanned {} chapter(s): {} stable id(s) assigned, {} mapping(s) written",
            report.chapters_scanned, report.stable_ids_assigned, report.mappings_written
        )),
    }
    Ok(())
}

/// Delete every record after confirmation
pub async fn clear(store: &Store, yes: bool, output: &Output) -> Result<()> {
    if !yes {
        if !output.should_prompt() {
            bail!("Refusing to clear without --yes");
        }
        print!("Delete all chapters, translations and settings? [y/N] ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            output.message("Aborted.");
            return Ok(());
        }
    }

    store.clear_all_data().await.context("Failed to clear store")?;
    output.success("Cleared all data");
    Ok(())
}
