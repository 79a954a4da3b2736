use crate::registry::ConnectionRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub reporters_connected: u64,
    pub clients_connected: u64,
    pub machines_in_snapshot: u64,
    pub reports_processed: u64,
    pub rogue_reports: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    reports_processed: Arc<AtomicU64>,
    rogue_reports: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reports_processed: Arc::new(AtomicU64::new(0)),
            rogue_reports: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_report(&self, rogue: bool) {
        self.reports_processed.fetch_add(1, Ordering::Relaxed);
        if rogue {
            self.rogue_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_health(&self, registry: &ConnectionRegistry) -> KernelHealth {
        let (reporters, clients) = registry.role_counts();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            reporters_connected: reporters as u64,
            clients_connected: clients as u64,
            machines_in_snapshot: registry.snapshot_count() as u64,
            reports_processed: self.reports_processed.load(Ordering::Relaxed),
            rogue_reports: self.rogue_reports.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
