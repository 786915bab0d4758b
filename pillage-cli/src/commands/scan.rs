use std::io::{self, Write};
use std::sync::Arc;

use pillage::{RegistryClient, Scanner, scan};

use crate::config::ScanConfig;
use crate::error::Result;

/// Scans and prints every record as one JSON array on stdout.
pub async fn execute(config: &ScanConfig) -> Result<()> {
    let client = RegistryClient::new(config.registry_options.clone())?;
    let scanner = Scanner::new(Arc::new(client));

    let images = scan::collect(scanner.enum_registries(
        config.registries.clone(),
        config.repositories.clone(),
        config.tags.clone(),
    ))
    .await;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &images)?;
    writeln!(stdout)?;
    Ok(())
}
