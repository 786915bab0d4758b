#[cfg(feature = "progress")]
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Receives blob download progress while images are pulled.
pub trait ProgressTracker: Send + Sync {
    fn start_download(&self, image: &str, digest: &str, total_bytes: u64);
    fn update(&self, image: &str, digest: &str, bytes: u64);
    fn finish(&self, image: &str, digest: &str);
}

pub struct NoopProgress;

impl ProgressTracker for NoopProgress {
    fn start_download(&self, _image: &str, _digest: &str, _total_bytes: u64) {}
    fn update(&self, _image: &str, _digest: &str, _bytes: u64) {}
    fn finish(&self, _image: &str, _digest: &str) {}
}

/// One bar per in-flight blob, stacked under a shared [`MultiProgress`].
#[cfg(feature = "progress")]
pub struct IndicatifProgress {
    multi: MultiProgress,
    bars: std::sync::Mutex<std::collections::HashMap<String, ProgressBar>>,
}

#[cfg(feature = "progress")]
impl IndicatifProgress {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[cfg(feature = "progress")]
impl ProgressTracker for IndicatifProgress {
    fn start_download(&self, image: &str, digest: &str, total_bytes: u64) {
        let pb = self.multi.add(ProgressBar::new(total_bytes));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        let short = digest.strip_prefix("sha256:").unwrap_or(digest);
        pb.set_message(format!("{image} {}", &short[..12.min(short.len())]));
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(bar_key(image, digest), pb);
        }
    }

    fn update(&self, image: &str, digest: &str, bytes: u64) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(pb) = bars.get(&bar_key(image, digest)) {
                pb.inc(bytes);
            }
        }
    }

    fn finish(&self, image: &str, digest: &str) {
        let pb = self
            .bars
            .lock()
            .ok()
            .and_then(|mut bars| bars.remove(&bar_key(image, digest)));
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
    }
}

// workers pulling images that share a base layer download the same digest
#[cfg(feature = "progress")]
fn bar_key(image: &str, digest: &str) -> String {
    format!("{image}@{digest}")
}
