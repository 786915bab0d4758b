use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use pillage::{Registry, RegistryClient, Scanner, StorageOptions, StoreOutcome, store_all};
use tabled::{Table, Tabled};

use crate::config::ScanConfig;
use crate::error::Result;
use crate::utils;

#[derive(Tabled)]
struct FailedImage {
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Scans and stores every record under `results`.
pub async fn execute(config: &ScanConfig, results: &Path) -> Result<()> {
    utils::print_header(&format!("Storing results in {}", results.display()));
    tokio::fs::create_dir_all(results).await?;

    let multi = MultiProgress::new();
    let mut client = RegistryClient::new(config.registry_options.clone())?;
    if config.store_images {
        client = client.enable_progress(multi.clone());
    }
    let registry: Arc<dyn Registry> = Arc::new(client);

    let options = Arc::new(
        StorageOptions::new(results, registry.clone())
            .store_images(config.store_images)
            .cache_path(config.cache.as_ref()),
    );

    let pb = multi.add(ProgressBar::new_spinner());
    if let Ok(spinner) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.blue} [{elapsed_precise}] {pos} image(s) processed {msg}")
    {
        pb.set_style(spinner);
    }
    pb.enable_steady_tick(Duration::from_millis(100));

    let scanner = Scanner::new(registry);
    let images = scanner.enum_registries(
        config.registries.clone(),
        config.repositories.clone(),
        config.tags.clone(),
    );

    let outcomes = store_all(images, options, config.workers, |outcome| {
        pb.inc(1);
        pb.set_message(format!("{}", style(&outcome.image).dim()));
    })
    .await;
    pb.finish_and_clear();

    print_summary(&outcomes);
    Ok(())
}

fn print_summary(outcomes: &[StoreOutcome]) {
    let failed: Vec<FailedImage> = outcomes
        .iter()
        .filter_map(|outcome| {
            outcome.error.as_ref().map(|error| FailedImage {
                image: outcome.image.clone(),
                error: error.clone(),
            })
        })
        .collect();
    let stored = outcomes.len() - failed.len();

    utils::print_header("Summary");
    if failed.is_empty() {
        utils::print_success(&format!("Stored {stored} image(s)"));
        return;
    }

    let count = failed.len();
    eprintln!("{}", Table::new(failed));
    eprintln!();
    utils::print_warning(&format!("Stored {stored} image(s), {count} failed"));
    utils::print_info("Each failed image has an errors.log next to its metadata");
}
