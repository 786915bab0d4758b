use std::path::PathBuf;

use pillage::config::RegistryOptions;

use crate::error::{PilregError, Result};

/// Everything a run needs, gathered from the command line.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub registries: Vec<String>,
    pub repositories: Vec<String>,
    pub tags: Vec<String>,
    pub results: Option<PathBuf>,
    pub store_images: bool,
    pub cache: Option<PathBuf>,
    pub workers: usize,
    pub registry_options: RegistryOptions,
}

impl ScanConfig {
    /// Rejects flag combinations that cannot work, before anything touches
    /// the network.
    pub fn validate(&self) -> Result<()> {
        if self.store_images && self.results.is_none() {
            return Err(PilregError::Config(
                "--store-images requires --results".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(PilregError::Config(
                "--workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScanConfig {
        ScanConfig {
            registries: vec!["reg1".to_string()],
            repositories: Vec::new(),
            tags: Vec::new(),
            results: None,
            store_images: false,
            cache: None,
            workers: 8,
            registry_options: RegistryOptions::default(),
        }
    }

    #[test]
    fn test_store_images_requires_results() {
        let mut config = config();
        config.store_images = true;
        assert!(matches!(config.validate(), Err(PilregError::Config(_))));

        config.results = Some(PathBuf::from("out"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = config();
        config.workers = 0;
        assert!(matches!(config.validate(), Err(PilregError::Config(_))));
    }

    #[test]
    fn test_plain_scan_is_valid() {
        assert!(config().validate().is_ok());
    }
}
