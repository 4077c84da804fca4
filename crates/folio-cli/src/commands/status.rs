//! Status command handler

use anyhow::{Context, Result};

use folio_core::Store;

use crate::output::{Output, OutputFormat};

/// Show store location, schema and contents
pub async fn show(store: &Store, output: &Output) -> Result<()> {
    let config = store.config();
    let stats = store.stats().await.context("Failed to read store stats")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "database": config.sqlite_path(),
                    "stats": stats,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.sqlite_path().display());
        }
        OutputFormat::Human => {
            println!("Folio Status");
            println!("============");
            println!();
            println!("Storage:");
            println!("  Database: {}", config.sqlite_path().display());
            println!("  Schema:   v{}", stats.schema_version);
            println!();
            println!("Contents:");
            println!("  Chapters:     {}", stats.chapters);
            println!("  Translations: {}", stats.translation_versions);
            println!("  Summaries:    {}", stats.summaries);
            println!("  URL mappings: {}", stats.url_mappings);
            println!("  Amendments:   {}", stats.amendment_logs);
            println!("  Images:       {}", stats.images);
        }
    }

    Ok(())
}
