//! Machine store: the persistence collaborator consumed by the gateway.
//!
//! The trait is the seam; the default implementation keeps machines and
//! point ledgers in JSON files under the data dir and appends canonical
//! stats samples to a JSONL log. Startup failure here is fatal (no serving
//! without persistence); a single failed write is the caller's problem to
//! log and swallow.

use crate::report::CanonicalReport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub uuid: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub owner: Option<String>,
    pub country: Option<String>,
    pub registered_at: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub identity: String,
    pub points: i64,
}

/// Persistence contract the gateway depends on. Writes of independent
/// reports are independent; no cross-report transaction exists.
pub trait MachineStore: Send + Sync {
    fn find_machine(&self, uuid: &str) -> Option<MachineRecord>;
    /// Idempotent upsert keyed by hardware identity.
    fn upsert_machine(&self, record: MachineRecord) -> Result<(), StoreError>;
    fn append_stats_sample(&self, report: &CanonicalReport) -> Result<(), StoreError>;
    fn find_user(&self, identity: &str) -> Option<UserRecord>;
    /// Add points to an identity's ledger, returning the new total.
    fn add_points(&self, identity: &str, n: i64) -> Result<i64, StoreError>;
    fn append_speedtest(&self, uuid: &str, result: &serde_json::Value) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    machines: HashMap<String, MachineRecord>,
    points: HashMap<String, i64>,
}

/// JSON-file store: `store.json` for machines and point ledgers,
/// `stats.jsonl` / `speedtests.jsonl` for append-only sample logs.
pub struct JsonStore {
    store_path: PathBuf,
    stats_path: PathBuf,
    speedtest_path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonStore {
    /// Loads existing data; a malformed store file is a hard error so the
    /// kernel refuses to start on corrupt state instead of clobbering it.
    pub fn open(data_dir: &str) -> Result<Self, StoreError> {
        let dir = PathBuf::from(data_dir);
        let store_path = dir.join("store.json");
        let data = if store_path.exists() {
            let content = fs::read_to_string(&store_path)?;
            serde_json::from_str(&content)?
        } else {
            StoreData::default()
        };
        info!(machines = data.machines.len(), "store loaded from {}", store_path.display());
        Ok(Self {
            store_path,
            stats_path: dir.join("stats.jsonl"),
            speedtest_path: dir.join("speedtests.jsonl"),
            data: Mutex::new(data),
        })
    }

    fn save(&self, data: &StoreData) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(data)?;
        fs::write(&self.store_path, content)?;
        Ok(())
    }

    fn append_line(path: &PathBuf, line: &str) -> Result<(), StoreError> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

impl MachineStore for JsonStore {
    fn find_machine(&self, uuid: &str) -> Option<MachineRecord> {
        self.data.lock().machines.get(uuid).cloned()
    }

    fn upsert_machine(&self, record: MachineRecord) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        match data.machines.get_mut(&record.uuid) {
            Some(existing) => {
                // re-registration refreshes the descriptor but keeps the
                // original registration time
                existing.hostname = record.hostname.or(existing.hostname.take());
                existing.os = record.os.or(existing.os.take());
                existing.owner = record.owner.or(existing.owner.take());
                existing.country = record.country.or(existing.country.take());
                existing.last_seen = record.last_seen;
            }
            None => {
                data.machines.insert(record.uuid.clone(), record);
            }
        }
        self.save(&data)
    }

    fn append_stats_sample(&self, report: &CanonicalReport) -> Result<(), StoreError> {
        Self::append_line(&self.stats_path, &serde_json::to_string(report)?)
    }

    fn find_user(&self, identity: &str) -> Option<UserRecord> {
        let points = *self.data.lock().points.get(identity)?;
        Some(UserRecord { identity: identity.to_string(), points })
    }

    fn add_points(&self, identity: &str, n: i64) -> Result<i64, StoreError> {
        let mut data = self.data.lock();
        let total = data.points.entry(identity.to_string()).or_insert(0);
        *total += n;
        let total = *total;
        self.save(&data)?;
        Ok(total)
    }

    fn append_speedtest(&self, uuid: &str, result: &serde_json::Value) -> Result<(), StoreError> {
        let entry = serde_json::json!({
            "uuid": uuid,
            "at": now_rfc3339(),
            "result": result,
        });
        Self::append_line(&self.speedtest_path, &entry.to_string())
    }
}
