use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone)]
pub struct ServerObservability {
    started_at: Instant,
    ingest_ok_total: Arc<AtomicU64>,
    ingest_err_total: Arc<dashmap::DashMap<String, AtomicU64>>,
    processed_ok_total: Arc<AtomicU64>,
    bounced_total: Arc<AtomicU64>,
    quarantined_total: Arc<AtomicU64>,
}

impl ServerObservability {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            ingest_ok_total: Arc::new(AtomicU64::new(0)),
            ingest_err_total: Arc::new(dashmap::DashMap::new()),
            processed_ok_total: Arc::new(AtomicU64::new(0)),
            bounced_total: Arc::new(AtomicU64::new(0)),
            quarantined_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_ingest_ok(&self) {
        self.ingest_ok_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingest_err(&self, code: &str) {
        let entry = self
            .ingest_err_total
            .entry(code.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        entry.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed_ok(&self) {
        self.processed_ok_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bounced(&self) {
        self.bounced_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantined(&self) {
        self.quarantined_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let mut errors = BTreeMap::new();
        for item in self.ingest_err_total.iter() {
            errors.insert(item.key().clone(), item.value().load(Ordering::Relaxed));
        }
        ObservabilitySnapshot {
            uptime: self.started_at.elapsed(),
            ingest_ok_total: self.ingest_ok_total.load(Ordering::Relaxed),
            ingest_err_total: errors,
            processed_ok_total: self.processed_ok_total.load(Ordering::Relaxed),
            bounced_total: self.bounced_total.load(Ordering::Relaxed),
            quarantined_total: self.quarantined_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerObservability {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservabilitySnapshot {
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub ingest_ok_total: u64,
    pub ingest_err_total: BTreeMap<String, u64>,
    pub processed_ok_total: u64,
    pub bounced_total: u64,
    pub quarantined_total: u64,
}
