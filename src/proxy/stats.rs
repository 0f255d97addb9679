use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Byte accounting for one proxy source. Counters only grow; the rate pair
/// is derived once per second from a CAS-updated snapshot.
pub struct SourceStatsCollector {
    source_id: String,
    upload: AtomicU64,
    download: AtomicU64,
    last_upload: AtomicU64,
    last_download: AtomicU64,
    upload_rate: AtomicU64,
    download_rate: AtomicU64,
    last_tick_ms: AtomicU64,
    epoch: Instant,
}

impl SourceStatsCollector {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            last_upload: AtomicU64::new(0),
            last_download: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            last_tick_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Acquire)
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Acquire)
    }

    /// One rate-derivation step, normally driven by the 1 Hz ticker.
    pub fn tick(&self) {
        self.tick_at(self.epoch.elapsed().as_millis() as u64);
    }

    fn tick_at(&self, now_ms: u64) {
        let prev_ms = self.last_tick_ms.swap(now_ms, Ordering::AcqRel);
        let dt_ms = now_ms.saturating_sub(prev_ms);
        if dt_ms == 0 {
            return;
        }
        self.upload_rate.store(
            Self::derive_rate(&self.upload, &self.last_upload, dt_ms),
            Ordering::Release,
        );
        self.download_rate.store(
            Self::derive_rate(&self.download, &self.last_download, dt_ms),
            Ordering::Release,
        );
    }

    fn derive_rate(counter: &AtomicU64, snapshot: &AtomicU64, dt_ms: u64) -> u64 {
        let current = counter.load(Ordering::Acquire);
        let mut previous = snapshot.load(Ordering::Acquire);
        // CAS so concurrent ticks never attribute the same bytes twice
        if let Err(actual) =
            snapshot.compare_exchange(previous, current, Ordering::AcqRel, Ordering::Acquire)
        {
            previous = actual;
        }
        current.saturating_sub(previous) * 1000 / dt_ms
    }
}

struct CollectorEntry {
    collector: Arc<SourceStatsCollector>,
    ticker: JoinHandle<()>,
}

impl Drop for CollectorEntry {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

/// Per-source collectors, created on first use. Each carries its own 1 Hz
/// ticker task; dropping the entry stops the ticker.
pub struct StatCenter {
    sources: DashMap<String, CollectorEntry>,
}

impl StatCenter {
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, source_id: &str) -> Arc<SourceStatsCollector> {
        if let Some(entry) = self.sources.get(source_id) {
            return entry.collector.clone();
        }
        let entry = self
            .sources
            .entry(source_id.to_string())
            .or_insert_with(|| {
                let collector = Arc::new(SourceStatsCollector::new(source_id));
                let ticker = Self::spawn_ticker(collector.clone());
                CollectorEntry { collector, ticker }
            });
        entry.collector.clone()
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<SourceStatsCollector>> {
        self.sources
            .get(source_id)
            .map(|entry| entry.collector.clone())
    }

    pub fn remove(&self, source_id: &str) {
        self.sources.remove(source_id);
    }

    pub fn snapshot(&self) -> Vec<Arc<SourceStatsCollector>> {
        self.sources
            .iter()
            .map(|entry| entry.collector.clone())
            .collect()
    }

    fn spawn_ticker(collector: Arc<SourceStatsCollector>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                collector.tick();
            }
        })
    }
}

impl Default for StatCenter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_speed(bytes_per_second: u64, upload: bool) -> String {
    let arrow = if upload { '↑' } else { '↓' };
    if bytes_per_second < 1024 {
        format!("{} {} B/s", arrow, bytes_per_second)
    } else if bytes_per_second < 1024 * 1024 {
        format!("{} {:.2} KB/s", arrow, bytes_per_second as f64 / 1024.0)
    } else {
        format!(
            "{} {:.2} MB/s",
            arrow,
            bytes_per_second as f64 / (1024.0 * 1024.0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotone() {
        let collector = SourceStatsCollector::new("x");
        let mut last = 0;
        for chunk in [10u64, 0, 3, 1024, 7] {
            collector.add_upload(chunk);
            let now = collector.upload();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(collector.upload(), 1044);
        assert_eq!(collector.download(), 0);
    }

    #[test]
    fn test_rate_derivation() {
        let collector = SourceStatsCollector::new("x");
        // 10 MiB over five seconds derives to 2 MiB/s
        collector.add_upload(10 * 1024 * 1024);
        collector.tick_at(5000);
        assert_eq!(collector.upload_rate(), 2 * 1024 * 1024);
        assert_eq!(collector.download_rate(), 0);

        // quiet second decays the rate to zero
        collector.tick_at(6000);
        assert_eq!(collector.upload_rate(), 0);

        collector.add_download(1536);
        collector.tick_at(7000);
        assert_eq!(collector.download_rate(), 1536);
    }

    #[test]
    fn test_zero_interval_tick_is_ignored() {
        let collector = SourceStatsCollector::new("x");
        collector.add_upload(100);
        collector.tick_at(1000);
        assert_eq!(collector.upload_rate(), 100);
        collector.add_upload(100);
        collector.tick_at(1000);
        // same timestamp: no derivation, previous rate stands
        assert_eq!(collector.upload_rate(), 100);
    }

    #[tokio::test]
    async fn test_center_reuses_collectors() {
        let center = StatCenter::new();
        let a = center.get_or_create("src");
        let b = center.get_or_create("src");
        assert!(Arc::ptr_eq(&a, &b));
        a.add_upload(5);
        assert_eq!(center.get("src").unwrap().upload(), 5);
        center.remove("src");
        assert!(center.get("src").is_none());
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0, true), "↑ 0 B/s");
        assert_eq!(format_speed(1023, false), "↓ 1023 B/s");
        assert_eq!(format_speed(12636, true), "↑ 12.34 KB/s");
        assert_eq!(format_speed(1024 * 1024, false), "↓ 1.00 MB/s");
        assert_eq!(format_speed(5 * 1024 * 1024 + 512 * 1024, true), "↑ 5.50 MB/s");
    }
}
