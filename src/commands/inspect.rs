use anyhow::Result;
use tracing::info;

use airops::config::PipelineConfig;
use airops::storage::parse_window_end;
use airops::tables::AnalyticalStore;

use super::open_window_store;

/// Handle the inspect command
///
/// Prints the stored window batches and the derived tables of the last
/// successful analysis pass.
pub async fn handle_inspect(config: PipelineConfig) -> Result<()> {
    let store = open_window_store(&config.storage).await?;
    let keys = store.list_window_keys().await?;
    println!("Window store: {}", store.describe());
    println!("  batches: {}", keys.len());
    if let Some(latest) = keys.last() {
        match parse_window_end(latest) {
            Some(end) => println!("  latest:  {} (window end {})", latest, end),
            None => println!("  latest:  {}", latest),
        }
    }

    let tables = AnalyticalStore::new(&config.analysis.output_dir);
    let infos = tables.inspect()?;
    println!("Analytical tables: {}", tables.root().display());
    if infos.is_empty() {
        println!("  (no tables yet)");
    }
    for table in &infos {
        println!(
            "  {:<28} {:>10} rows  {} columns",
            table.name,
            table.row_count,
            table.columns.len()
        );
    }

    info!(
        "Inspected {} window batches and {} tables",
        keys.len(),
        infos.len()
    );
    Ok(())
}
