//! Report pipeline: normalize then validate.
//!
//! Tag, don't reject: a report that fails validation is flagged `rogue`
//! and still flows to the broadcast layer. Partial visibility into a
//! misbehaving reporter beats silent data loss; only persistence is
//! withheld for rogue reports, and that decision belongs to the gateway.

use crate::report::{normalize, CanonicalReport, RawReport};
use crate::validate;
use std::collections::HashMap;
use tracing::warn;

pub struct ReportPipeline {
    latest_version: f64,
}

impl ReportPipeline {
    pub fn new(latest_version: f64) -> Self {
        Self { latest_version }
    }

    /// Always returns a canonical report, whatever the input looked like.
    pub fn process(&self, raw: RawReport, latency: &HashMap<String, f64>) -> CanonicalReport {
        let mut report = normalize(raw, latency);
        match validate::validate_all(&report, self.latest_version) {
            Ok(()) => report.rogue = false,
            Err(violation) => {
                warn!(uuid = %report.uuid, hostname = %report.hostname, "rogue report: {violation}");
                report.rogue = true;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Platform;
    use crate::units::DurationParts;
    use serde_json::json;

    const UUID: &str = "9a7b8ccc-0f19-4ab6-93cc-1d7e6f8f9b10";
    const UUID_STRIPPED: &str = "9a7b8ccc0f194ab693cc1d7e6f8f9b10";

    fn windows_sample() -> serde_json::Value {
        json!({
            "uuid": UUID,
            "hostname": "DESKTOP-TEST",
            "platform": "win32",
            "ram": { "total": 8_000_000_000u64, "free": 2_000_000_000u64 },
            "cpu": 30,
            "network": [
                { "tx_sec": 383.0439223697651, "rx_sec": 383.0439223697651 },
                { "tx_sec": 98063.32992849847, "rx_sec": 96748.72318692543 }
            ],
            "disks": [{
                "fs": "C:",
                "type": "NTFS",
                "size": 256_000_000_000u64,
                "used": 120_000_000_000u64,
                "available": 136_000_000_000u64,
                "use": 46.9,
                "mount": "C:"
            }],
            "uptime": 300,
            "reporterUptime": 120,
            "reporterVersion": 0.23,
            "isVirtual": false,
            "timestamp": 1_700_000_000_000u64
        })
    }

    fn process(raw: serde_json::Value, latest: f64) -> CanonicalReport {
        let raw: RawReport = serde_json::from_value(raw).unwrap();
        let mut latency = HashMap::new();
        latency.insert(UUID_STRIPPED.to_string(), 30.0);
        ReportPipeline::new(latest).process(raw, &latency)
    }

    #[test]
    fn test_windows_sample_end_to_end() {
        let report = process(windows_sample(), 0.23);
        assert!(!report.rogue);
        assert_eq!(report.uuid, UUID_STRIPPED);
        assert_eq!(report.platform, Platform::Win32);
        assert_eq!(report.ram.total, 7.45);
        assert_eq!(report.ram.free, 1.86);
        assert_eq!(report.ram.used, 5.59);
        assert_eq!(report.cpu, 30.0);
        assert_eq!(report.network.total_interfaces, 2);
        assert_eq!(report.network.tx_sec, 0.79);
        assert_eq!(report.network.rx_sec, 0.78);
        assert_eq!(report.disks[0].size, 238.42);
        assert_eq!(
            report.uptime.formatted,
            Some(DurationParts { d: 0, h: 0, m: 5, s: 0 })
        );
        assert_eq!(report.ping, 30.0);
    }

    #[test]
    fn test_never_drops_adversarial_input() {
        let mut sample = windows_sample();
        sample["uuid"] = json!("has whitespace in it");
        sample["cpu"] = json!("garbage");
        sample["disks"][0]["size"] = json!(-1);
        let report = process(sample, 0.23);
        assert!(report.rogue);
        // still a full canonical report
        assert_eq!(report.hostname, "DESKTOP-TEST");
        assert_eq!(report.network.total_interfaces, 2);
    }

    #[test]
    fn test_empty_report_is_rogue_not_panic() {
        let report = process(json!({}), 0.23);
        assert!(report.rogue);
    }

    #[test]
    fn test_version_drift_tags_rogue() {
        let mut sample = windows_sample();
        sample["reporterVersion"] = json!(0.25);
        assert!(process(sample, 0.23).rogue);
        assert!(!process(windows_sample(), 0.23).rogue);
    }

    #[test]
    fn test_windows_fs_on_linux_platform_is_rogue() {
        let mut sample = windows_sample();
        sample["platform"] = json!("linux");
        assert!(process(sample, 0.23).rogue);
    }

    #[test]
    fn test_linux_disks_pass_on_linux() {
        let mut sample = windows_sample();
        sample["platform"] = json!("linux");
        sample["disks"] = json!([{
            "fs": "/dev/sda1",
            "type": "ext4",
            "size": 256_000_000_000u64,
            "used": 120_000_000_000u64,
            "available": 136_000_000_000u64,
            "use": 46.9,
            "mount": "/"
        }]);
        assert!(!process(sample, 0.23).rogue);
    }

    #[test]
    fn test_zero_uptime_report() {
        let mut sample = windows_sample();
        sample["uptime"] = json!(0);
        let report = process(sample, 0.23);
        // 0 uptime means "no uptime data" but is still a valid number
        assert!(report.uptime.formatted.is_none());
        assert!(!report.rogue);
    }
}
