use std::env;
use std::time::Duration;

const DEFAULT_CONCURRENT_DOWNLOADS: &str = "4";
const DEFAULT_WORKERS: &str = "8";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

/// Number of layer blobs fetched in parallel while pulling a single image.
pub fn get_concurrent_downloads() -> usize {
    let concurrent_downloads = env::var("PILLAGE_CONCURRENT_DOWNLOADS")
        .unwrap_or(DEFAULT_CONCURRENT_DOWNLOADS.to_string());
    concurrent_downloads.parse().unwrap_or(4).max(1)
}

/// Default size of the storage worker pool.
pub fn get_default_workers() -> usize {
    let workers = env::var("PILLAGE_WORKERS").unwrap_or(DEFAULT_WORKERS.to_string());
    workers.parse().unwrap_or(8).max(1)
}

/// Transport settings shared by every call a [`crate::registry::RegistryClient`] makes.
///
/// Built once when a scan starts and handed to the client; nothing here is
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Accept invalid or self-signed certificates.
    pub skip_tls_verify: bool,
    pub connect_timeout: Duration,
    /// Longest a connection may sit idle. Transfers that keep making
    /// progress are never cut off, however long they take.
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            skip_tls_verify: false,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            user_agent: format!("pillage/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl RegistryOptions {
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.insecure { "http" } else { "https" }
    }
}
