//! Report validation predicates.
//!
//! Each predicate either passes or yields a structured [`Violation`] naming
//! the broken rule and the offending field. `validate_all` runs them
//! top-to-bottom over a canonical report and stops at the first failure;
//! the first violation is the report's rogue reason.

use crate::report::{CanonicalReport, Platform};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static UUID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{32}$").expect("uuid pattern"));
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
        .expect("hostname pattern")
});
static DRIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]:$").expect("drive pattern"));
static DEV_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/dev/.+").expect("dev path pattern"));

/// Version-drift tolerance between reporter and server release cadence.
const VERSION_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Empty,
    Whitespace,
    NotANumber,
    Negative,
    NotABoolean,
    BadUuid,
    BadHostname,
    VersionDrift,
    BadFilesystemPath,
    BadFilesystemType,
    BadMountPoint,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::Empty => "empty value",
            Rule::Whitespace => "contains whitespace",
            Rule::NotANumber => "not a finite number",
            Rule::Negative => "negative value",
            Rule::NotABoolean => "not a boolean",
            Rule::BadUuid => "malformed uuid",
            Rule::BadHostname => "malformed hostname",
            Rule::VersionDrift => "reporter version newer than server",
            Rule::BadFilesystemPath => "filesystem path invalid for platform",
            Rule::BadFilesystemType => "filesystem type invalid for platform",
            Rule::BadMountPoint => "mount point invalid for platform",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{rule} in field `{field}`")]
pub struct Violation {
    pub rule: Rule,
    pub field: &'static str,
}

fn fail(rule: Rule, field: &'static str) -> Result<(), Violation> {
    Err(Violation { rule, field })
}

type Check = Result<(), Violation>;

pub fn not_empty(field: &'static str, value: &str) -> Check {
    if value.is_empty() {
        return fail(Rule::Empty, field);
    }
    Ok(())
}

pub fn no_whitespace(field: &'static str, value: &str) -> Check {
    if value.chars().any(char::is_whitespace) {
        return fail(Rule::Whitespace, field);
    }
    Ok(())
}

pub fn valid_number(field: &'static str, value: f64) -> Check {
    if !value.is_finite() {
        return fail(Rule::NotANumber, field);
    }
    Ok(())
}

pub fn non_negative(field: &'static str, value: f64) -> Check {
    if value < 0.0 {
        return fail(Rule::Negative, field);
    }
    Ok(())
}

pub fn valid_boolean(field: &'static str, value: Option<bool>) -> Check {
    if value.is_none() {
        return fail(Rule::NotABoolean, field);
    }
    Ok(())
}

/// 32 hex characters; dashes are stripped upstream by the normalizer.
pub fn valid_uuid(field: &'static str, value: &str) -> Check {
    if !UUID_RE.is_match(value) {
        return fail(Rule::BadUuid, field);
    }
    Ok(())
}

/// RFC-1123 style: alnum/hyphen labels, 253 chars max overall.
pub fn valid_hostname(field: &'static str, value: &str) -> Check {
    if value.len() > 253 || !HOSTNAME_RE.is_match(value) {
        return fail(Rule::BadHostname, field);
    }
    Ok(())
}

/// A reporter may run slightly ahead of the server's known latest release
/// (float drift between release cadences), but no further.
pub fn version_not_newer(field: &'static str, current: f64, latest: f64) -> Check {
    if !current.is_finite() || current > latest + VERSION_TOLERANCE || current < 0.0 {
        return fail(Rule::VersionDrift, field);
    }
    Ok(())
}

/// Windows filesystems are drive letters (`C:`); unix ones live under `/dev`.
pub fn valid_filesystem_path(field: &'static str, fs: &str, platform: Platform) -> Check {
    let ok = match platform {
        Platform::Win32 => DRIVE_RE.is_match(fs),
        Platform::Linux | Platform::Darwin => DEV_PATH_RE.is_match(fs),
        Platform::Unknown => false,
    };
    if !ok {
        return fail(Rule::BadFilesystemPath, field);
    }
    Ok(())
}

const WIN32_FS_TYPES: &[&str] = &["FAT", "FAT32", "NTFS", "exFAT", "UDF"];
const LINUX_FS_TYPES: &[&str] = &["ext2", "ext3", "ext4", "XFS", "JFS", "btrfs", "vfat"];
const DARWIN_FS_TYPES: &[&str] = &["HFS", "APFS"];

pub fn valid_filesystem_type(field: &'static str, kind: &str, platform: Platform) -> Check {
    let allowed = match platform {
        Platform::Win32 => WIN32_FS_TYPES,
        Platform::Linux => LINUX_FS_TYPES,
        Platform::Darwin => DARWIN_FS_TYPES,
        Platform::Unknown => &[],
    };
    if !allowed.contains(&kind) {
        return fail(Rule::BadFilesystemType, field);
    }
    Ok(())
}

/// Windows mounts equal their own filesystem; unix mounts are rooted paths.
pub fn valid_mount(field: &'static str, mount: &str, fs: &str, platform: Platform) -> Check {
    let ok = match platform {
        Platform::Win32 => mount == fs,
        Platform::Linux | Platform::Darwin => mount.starts_with('/'),
        Platform::Unknown => false,
    };
    if !ok {
        return fail(Rule::BadMountPoint, field);
    }
    Ok(())
}

/// Run every predicate over a canonical report, short-circuiting on the
/// first violation.
pub fn validate_all(report: &CanonicalReport, latest_version: f64) -> Check {
    not_empty("uuid", &report.uuid)?;
    no_whitespace("uuid", &report.uuid)?;
    valid_uuid("uuid", &report.uuid)?;

    not_empty("hostname", &report.hostname)?;
    valid_hostname("hostname", &report.hostname)?;

    valid_number("cpu", report.cpu)?;
    non_negative("cpu", report.cpu)?;

    valid_number("ram.total", report.ram.total)?;
    non_negative("ram.total", report.ram.total)?;
    valid_number("ram.free", report.ram.free)?;
    non_negative("ram.free", report.ram.free)?;
    valid_number("ram.used", report.ram.used)?;
    non_negative("ram.used", report.ram.used)?;

    valid_number("network.TxSec", report.network.tx_sec)?;
    non_negative("network.TxSec", report.network.tx_sec)?;
    valid_number("network.RxSec", report.network.rx_sec)?;
    non_negative("network.RxSec", report.network.rx_sec)?;

    valid_number("uptime", report.uptime.pure)?;
    non_negative("uptime", report.uptime.pure)?;
    valid_number("reporterUptime", report.reporter_uptime)?;
    non_negative("reporterUptime", report.reporter_uptime)?;

    version_not_newer("reporterVersion", report.reporter_version, latest_version)?;

    valid_boolean("isVirtual", report.is_virtual)?;

    valid_number("timestamp", report.timestamp)?;
    non_negative("timestamp", report.timestamp)?;

    for disk in &report.disks {
        not_empty("disk.fs", &disk.fs)?;
        valid_filesystem_path("disk.fs", &disk.fs, report.platform)?;
        valid_filesystem_type("disk.type", &disk.kind, report.platform)?;
        valid_mount("disk.mount", &disk.mount, &disk.fs, report.platform)?;
        valid_number("disk.size", disk.size)?;
        non_negative("disk.size", disk.size)?;
        valid_number("disk.used", disk.used)?;
        non_negative("disk.used", disk.used)?;
        valid_number("disk.available", disk.available)?;
        non_negative("disk.available", disk.available)?;
        valid_number("disk.use", disk.usage)?;
        non_negative("disk.use", disk.usage)?;
    }

    Ok(())
}
