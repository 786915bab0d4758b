use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pillage::config::{RegistryOptions, get_default_workers};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod error;
mod utils;

use config::ScanConfig;
use error::Result;

#[derive(Parser)]
#[command(name = "pilreg")]
#[command(about = "Enumerate container registries and collect image metadata")]
#[command(version = "0.1.0")]
struct Cli {
    /// Registries to scan (e.g., registry.example.com, localhost:5000)
    registries: Vec<String>,
    /// Repositories to scan instead of listing the catalog (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    repos: Vec<String>,
    /// Tags to fetch instead of listing each repository's tags (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    tags: Vec<String>,
    /// Directory to store results in; prints JSON to stdout when omitted
    #[arg(short = 'o', long)]
    results: Option<PathBuf>,
    /// Pull every image and store its filesystem as a tarball
    #[arg(short, long)]
    store_images: bool,
    /// Directory used to cache downloaded layers between images
    #[arg(short, long)]
    cache: Option<PathBuf>,
    /// Number of images stored concurrently
    #[arg(short, long, default_value_t = get_default_workers())]
    workers: usize,
    /// Use plain HTTP
    #[arg(short, long)]
    insecure: bool,
    /// Do not verify TLS certificates
    #[arg(short = 'k', long = "skip-tls")]
    skip_tls: bool,
    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> ScanConfig {
        ScanConfig {
            registries: self.registries,
            repositories: self.repos,
            tags: self.tags,
            results: self.results,
            store_images: self.store_images,
            cache: self.cache,
            workers: self.workers,
            registry_options: RegistryOptions::default()
                .insecure(self.insecure)
                .skip_tls_verify(self.skip_tls),
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,pillage={level},pilreg={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: ScanConfig) -> Result<()> {
    config.validate()?;
    info!(
        registries = config.registries.len(),
        store_images = config.store_images,
        "starting scan"
    );

    match &config.results {
        Some(results) => commands::store::execute(&config, results).await,
        None => commands::scan::execute(&config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.into_config()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            utils::print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
