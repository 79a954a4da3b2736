//! Telemetry report data model and normalization.
//!
//! Reporters send untrusted, platform-dependent payloads: optional fields,
//! malformed numbers, per-interface network arrays, byte-sized disk stats.
//! `RawReport` deserializes those leniently (a garbage value becomes NaN or
//! an empty string, never a deserialization failure for the whole report)
//! and `normalize` coerces them into the canonical shape the broadcast and
//! storage layers consume. Normalization never fails; the validator decides
//! afterwards whether the result is rogue.

use crate::units::{bytes_per_sec_to_mbps, bytes_to_gib, format_duration, round2, DurationParts};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Platform tag, coerced to `Unknown` for anything but the three
/// exact strings reporters are allowed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Win32,
    Darwin,
    Unknown,
}

impl Platform {
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            Some("linux") => Platform::Linux,
            Some("win32") => Platform::Win32,
            Some("darwin") => Platform::Darwin,
            _ => Platform::Unknown,
        }
    }
}

/// Report as received from a reporter. Every field beyond `uuid` is
/// optional and none of them is trusted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawReport {
    #[serde(deserialize_with = "lenient::string")]
    pub uuid: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub hostname: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub platform: Option<String>,
    pub ram: Option<RawRam>,
    #[serde(deserialize_with = "lenient::number")]
    pub cpu: Option<f64>,
    pub network: Option<Vec<RawInterface>>,
    pub disks: Option<Vec<RawDisk>>,
    #[serde(deserialize_with = "lenient::number")]
    pub uptime: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub reporter_uptime: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub reporter_version: Option<f64>,
    #[serde(deserialize_with = "lenient::boolean")]
    pub is_virtual: Option<bool>,
    #[serde(deserialize_with = "lenient::number")]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRam {
    #[serde(deserialize_with = "lenient::number")]
    pub total: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub free: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawInterface {
    #[serde(deserialize_with = "lenient::number")]
    pub tx_sec: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub rx_sec: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDisk {
    #[serde(deserialize_with = "lenient::string")]
    pub fs: Option<String>,
    #[serde(rename = "type", deserialize_with = "lenient::string")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub size: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub used: Option<f64>,
    #[serde(deserialize_with = "lenient::number")]
    pub available: Option<f64>,
    #[serde(rename = "use", deserialize_with = "lenient::number")]
    pub usage: Option<f64>,
    #[serde(deserialize_with = "lenient::string")]
    pub mount: Option<String>,
}

/// Canonical, trusted-shape report. Produced for *every* raw report; the
/// pipeline never drops input, only flags it with `rogue`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalReport {
    pub uuid: String,
    pub hostname: String,
    pub platform: Platform,
    pub ram: RamStats,
    /// Integer percentage (truncated, not rounded).
    pub cpu: f64,
    pub network: NetworkStats,
    pub disks: Vec<DiskStats>,
    pub uptime: Uptime,
    pub reporter_uptime: f64,
    pub reporter_version: f64,
    pub is_virtual: Option<bool>,
    pub timestamp: f64,
    /// Last measured round-trip latency in ms, 0 when unknown.
    pub ping: f64,
    pub rogue: bool,
}

/// RAM in GiB, rounded to 2 decimals.
#[derive(Debug, Clone, Serialize)]
pub struct RamStats {
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

/// Aggregate over all interfaces that reported both counters,
/// in megabits/sec.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub total_interfaces: usize,
    #[serde(rename = "TxSec")]
    pub tx_sec: f64,
    #[serde(rename = "RxSec")]
    pub rx_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    pub fs: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: f64,
    pub used: f64,
    pub available: f64,
    #[serde(rename = "use")]
    pub usage: f64,
    pub mount: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Uptime {
    pub pure: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<DurationParts>,
}

/// Strip dashes from a producer-supplied machine identity.
pub fn strip_uuid(uuid: &str) -> String {
    uuid.replace('-', "")
}

/// Transform a raw report into the canonical shape. Pure, infallible:
/// garbage input yields NaN/empty fields that the validator flags later.
pub fn normalize(raw: RawReport, latency: &HashMap<String, f64>) -> CanonicalReport {
    let uuid = strip_uuid(&raw.uuid.unwrap_or_default());
    let hostname = raw.hostname.unwrap_or_default();
    let platform = Platform::from_raw(raw.platform.as_deref());

    let ram_raw = raw.ram.unwrap_or_default();
    let total_bytes = ram_raw.total.unwrap_or(f64::NAN);
    let free_bytes = ram_raw.free.unwrap_or(f64::NAN);
    // used must be derived from the byte values before total/free are
    // converted in place
    let ram = RamStats {
        used: round2((total_bytes - free_bytes) / GIB),
        total: bytes_to_gib(total_bytes),
        free: bytes_to_gib(free_bytes),
    };

    let cpu = raw.cpu.unwrap_or(f64::NAN).trunc();

    // interfaces missing either counter are dropped before aggregation
    let interfaces: Vec<(f64, f64)> = raw
        .network
        .unwrap_or_default()
        .into_iter()
        .filter_map(|i| Some((i.tx_sec?, i.rx_sec?)))
        .collect();
    let network = NetworkStats {
        total_interfaces: interfaces.len(),
        tx_sec: bytes_per_sec_to_mbps(interfaces.iter().map(|(tx, _)| tx).sum()),
        rx_sec: bytes_per_sec_to_mbps(interfaces.iter().map(|(_, rx)| rx).sum()),
    };

    let disks = raw
        .disks
        .unwrap_or_default()
        .into_iter()
        .map(|d| DiskStats {
            fs: d.fs.unwrap_or_default(),
            kind: d.kind.unwrap_or_default(),
            size: bytes_to_gib(d.size.unwrap_or(f64::NAN)),
            used: bytes_to_gib(d.used.unwrap_or(f64::NAN)),
            available: bytes_to_gib(d.available.unwrap_or(f64::NAN)),
            usage: d.usage.unwrap_or(f64::NAN),
            mount: d.mount.unwrap_or_default(),
        })
        .collect();

    let pure = raw.uptime.unwrap_or(f64::NAN);
    let uptime = Uptime { pure, formatted: format_duration(pure) };

    let ping = latency.get(&uuid).copied().unwrap_or(0.0);

    CanonicalReport {
        uuid,
        hostname,
        platform,
        ram,
        cpu,
        network,
        disks,
        uptime,
        reporter_uptime: raw.reporter_uptime.unwrap_or(f64::NAN),
        reporter_version: raw.reporter_version.unwrap_or(f64::NAN),
        is_virtual: raw.is_virtual,
        timestamp: raw.timestamp.unwrap_or(f64::NAN),
        ping,
        rogue: false,
    }
}

/// Deserialization helpers for untrusted reporter payloads. A field of the
/// wrong JSON type becomes NaN (numbers), a coerced string, or `None`
/// (booleans) instead of failing the whole envelope.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_f64().unwrap_or(f64::NAN)),
            Some(Value::String(s)) => Some(s.trim().parse().unwrap_or(f64::NAN)),
            Some(_) => Some(f64::NAN),
        })
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => None,
        })
    }

    pub fn boolean<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => Some(b),
            _ => None,
        })
    }
}
