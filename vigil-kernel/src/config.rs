use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub bind_port: u16,
    pub data_dir: String,
    /// Latest published reporter release; reports from newer versions are
    /// tagged rogue (version drift check).
    pub latest_reporter_version: f64,
    pub heartbeat_interval_secs: u64,
    pub snapshot_evict_secs: u64,
    pub speedtest_interval_hours: u64,
    /// Points a connected reporter accrues per award tick.
    pub points_per_award: i64,
    pub point_award_secs: u64,
    pub speedtest_points: i64,
    /// Best-effort geolocation enrichment of reporter static data.
    pub geo_lookup: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bind_port: 8080,
            data_dir: "./data".into(),
            latest_reporter_version: 0.23,
            heartbeat_interval_secs: 1,
            snapshot_evict_secs: 60,
            speedtest_interval_hours: 8,
            points_per_award: 1,
            point_award_secs: 60,
            speedtest_points: 50,
            geo_lookup: true,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| "vigil.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}");
            KernelConfig::default()
        })
    } else {
        warn!("no {path}, using default config");
        KernelConfig::default()
    }
}
