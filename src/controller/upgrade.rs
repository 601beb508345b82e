//! Kubernetes version upgrade validation
//!
//! The control plane only moves one minor version at a time and never
//! backwards. Versions are compared on "major.minor"; a leading `v` and any
//! patch or build suffix are ignored.

use std::fmt;

use crate::error::{Error, Result};

/// Why a requested version change was refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeRejection {
    /// Major versions differ
    MajorVersion,
    /// Desired minor is lower than the running one
    Downgrade,
    /// Desired minor skips over at least one release; `next` is the only valid target
    SkippedMinor { next: String },
}

impl fmt::Display for UpgradeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeRejection::MajorVersion => f.write_str("major version changes are not supported"),
            UpgradeRejection::Downgrade => f.write_str("downgrades are not supported"),
            UpgradeRejection::SkippedMinor { next } => {
                write!(f, "minor versions cannot be skipped; upgrade to {next} first")
            }
        }
    }
}

/// Parse a version string into `(major, minor)`
///
/// Accepts `1.29`, `v1.29`, `1.29.3` and `1.29.3-eks-abc`.
pub fn parse_version(version: &str) -> std::result::Result<(u32, u32), String> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let mut parts = trimmed.splitn(3, '.');
    let major = parts.next().unwrap_or_default();
    let minor = parts
        .next()
        .ok_or_else(|| format!("{version:?} is not a \"major.minor\" version"))?;
    // "29-eks" style suffixes can ride on the minor when there is no patch
    let minor = minor.split(['-', '+']).next().unwrap_or_default();

    let major = major
        .parse::<u32>()
        .map_err(|_| format!("{version:?} has an invalid major version"))?;
    let minor = minor
        .parse::<u32>()
        .map_err(|_| format!("{version:?} has an invalid minor version"))?;
    Ok((major, minor))
}

/// Check that moving from `current` to `desired` is a permitted upgrade
///
/// Returns `Ok(false)` when the versions are equal (nothing to do) and
/// `Ok(true)` when an upgrade should be issued.
///
/// # Errors
///
/// [`Error::Configuration`] if either version does not parse,
/// [`Error::UpgradePath`] if the path is not allowed.
pub fn validate_upgrade(current: &str, desired: &str) -> Result<bool> {
    let (cur_major, cur_minor) =
        parse_version(current).map_err(|e| Error::configuration("current version", e))?;
    let (want_major, want_minor) =
        parse_version(desired).map_err(|e| Error::configuration("cluster.kubernetesVersion", e))?;

    let reject = |reason| Error::UpgradePath {
        current: current.to_string(),
        desired: desired.to_string(),
        reason,
    };

    if cur_major != want_major {
        return Err(reject(UpgradeRejection::MajorVersion));
    }
    if want_minor == cur_minor {
        return Ok(false);
    }
    if want_minor < cur_minor {
        return Err(reject(UpgradeRejection::Downgrade));
    }
    if want_minor > cur_minor + 1 {
        return Err(reject(UpgradeRejection::SkippedMinor {
            next: format!("{}.{}", cur_major, cur_minor + 1),
        }));
    }
    Ok(true)
}
