use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::domain::error::ErrorCode;

/// 保持するレイテンシ記録の上限
const LATENCY_CAPACITY: usize = 1000;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    jobs_submitted: u64,
    jobs_rejected: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_cancelled: u64,
    persist_failures: u64,
    observer_failures: u64,
    files_swept: u64,
    errors: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub phase: String,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_submitted: u64,
    pub jobs_rejected: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub persist_failures: u64,
    pub observer_failures: u64,
    pub files_swept: u64,
    /// エラーコード別件数 (`E_TIMEOUT` など)
    pub error_counts: BTreeMap<String, u64>,
    pub avg_download_ms: Option<f64>,
    pub recent_latencies: Vec<LatencyRecord>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_jobs_submitted(&self) {
        self.counters.lock().jobs_submitted += 1;
    }

    /// 投入拒否 (重複・不正リクエスト)
    pub fn inc_jobs_rejected(&self, code: ErrorCode) {
        let mut c = self.counters.lock();
        c.jobs_rejected += 1;
        *c.errors.entry(code.as_str()).or_default() += 1;
    }

    pub fn inc_jobs_completed(&self) {
        self.counters.lock().jobs_completed += 1;
    }

    /// 失敗終了。キャンセルは別枠でも数える。
    pub fn inc_jobs_failed(&self, code: ErrorCode) {
        let mut c = self.counters.lock();
        c.jobs_failed += 1;
        if code == ErrorCode::Cancelled {
            c.jobs_cancelled += 1;
        }
        *c.errors.entry(code.as_str()).or_default() += 1;
    }

    pub fn inc_persist_failures(&self) {
        let mut c = self.counters.lock();
        c.persist_failures += 1;
        *c.errors.entry(ErrorCode::Persistence.as_str()).or_default() += 1;
    }

    pub fn inc_observer_failures(&self) {
        self.counters.lock().observer_failures += 1;
    }

    pub fn add_files_swept(&self, n: u64) {
        self.counters.lock().files_swept += n;
    }

    pub fn record_latency(&self, phase: &str, duration_ms: u64) {
        let record = LatencyRecord {
            phase: phase.to_string(),
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push(record);
        if latencies.len() > LATENCY_CAPACITY {
            let excess = latencies.len() - LATENCY_CAPACITY;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let downloads: Vec<f64> = latencies
            .iter()
            .filter(|r| r.phase == "download")
            .map(|r| r.duration_ms as f64)
            .collect();
        let avg_download_ms = if downloads.is_empty() {
            None
        } else {
            Some(downloads.iter().sum::<f64>() / downloads.len() as f64)
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            jobs_submitted: c.jobs_submitted,
            jobs_rejected: c.jobs_rejected,
            jobs_completed: c.jobs_completed,
            jobs_failed: c.jobs_failed,
            jobs_cancelled: c.jobs_cancelled,
            persist_failures: c.persist_failures,
            observer_failures: c.observer_failures,
            files_swept: c.files_swept,
            error_counts: c
                .errors
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            avg_download_ms,
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.inc_jobs_submitted();
        m.inc_jobs_submitted();
        m.inc_jobs_completed();
        m.inc_jobs_rejected(ErrorCode::AlreadyRunning);
        m.inc_jobs_failed(ErrorCode::Cancelled);
        m.inc_jobs_failed(ErrorCode::Timeout);
        m.inc_persist_failures();

        let s = m.summary();
        assert_eq!(s.jobs_submitted, 2);
        assert_eq!(s.jobs_completed, 1);
        assert_eq!(s.jobs_rejected, 1);
        assert_eq!(s.jobs_failed, 2);
        assert_eq!(s.jobs_cancelled, 1);
        assert_eq!(s.persist_failures, 1);
        assert_eq!(s.error_counts.get("E_ALREADY_RUNNING"), Some(&1));
        assert_eq!(s.error_counts.get("E_TIMEOUT"), Some(&1));
        assert_eq!(s.error_counts.get("E_PERSISTENCE"), Some(&1));
    }

    #[test]
    fn test_latency_recording() {
        let m = Metrics::new();
        m.record_latency("download", 1200);
        m.record_latency("download", 800);
        m.record_latency("sweep", 5);

        let s = m.summary();
        assert!((s.avg_download_ms.unwrap() - 1000.0).abs() < f64::EPSILON);
        assert_eq!(s.recent_latencies.len(), 3);
        assert_eq!(s.recent_latencies[0].phase, "sweep");
    }

    #[test]
    fn test_latency_cap() {
        let m = Metrics::new();
        for i in 0..1100 {
            m.record_latency("download", i);
        }
        assert_eq!(m.latencies.lock().len(), LATENCY_CAPACITY);
    }
}
