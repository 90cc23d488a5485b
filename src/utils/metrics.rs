use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct TransferMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub files_sent: u64,
    pub files_received: u64,
    pub send_failures: u64,
    pub hash_failures: u64,
    pub operations_applied: u64,
    pub uptime: Duration,
    pub start_time: Instant,
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            files_sent: 0,
            files_received: 0,
            send_failures: 0,
            hash_failures: 0,
            operations_applied: 0,
            uptime: Duration::new(0, 0),
            start_time: Instant::now(),
        }
    }
}

pub struct MetricsCollector {
    metrics: Arc<RwLock<TransferMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(TransferMetrics::default())),
        }
    }

    pub async fn record_file_sent(&self, bytes: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.files_sent += 1;
        metrics.bytes_sent += bytes;
    }

    pub async fn record_file_received(&self, bytes: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.files_received += 1;
        metrics.bytes_received += bytes;
    }

    pub async fn record_send_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.send_failures += 1;
    }

    pub async fn record_hash_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.hash_failures += 1;
    }

    pub async fn record_operations_applied(&self, count: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.operations_applied += count;
    }

    pub async fn get_metrics(&self) -> TransferMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.uptime = metrics.start_time.elapsed();
        metrics
    }

    pub async fn log_report(&self) {
        let metrics = self.get_metrics().await;

        info!(
            "stats: uptime {:.0?}, sent {} file(s) / {} bytes, received {} file(s) / {} bytes, \
             {} send failure(s), {} hash failure(s), {} operation(s) applied",
            metrics.uptime,
            metrics.files_sent,
            metrics.bytes_sent,
            metrics.files_received,
            metrics.bytes_received,
            metrics.send_failures,
            metrics.hash_failures,
            metrics.operations_applied
        );
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.record_file_sent(100).await;
        collector.record_file_sent(50).await;
        collector.record_file_received(25).await;
        collector.record_send_failure().await;
        collector.record_operations_applied(3).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.files_sent, 2);
        assert_eq!(metrics.bytes_sent, 150);
        assert_eq!(metrics.files_received, 1);
        assert_eq!(metrics.bytes_received, 25);
        assert_eq!(metrics.send_failures, 1);
        assert_eq!(metrics.operations_applied, 3);
    }
}
