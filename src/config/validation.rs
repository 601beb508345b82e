//! Validation of the desired cluster specification
//!
//! Runs before any API call. Every problem is collected so the operator sees
//! the whole list at once instead of fixing them one run at a time.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use super::settings::MIN_ZONE_COUNT;
use super::types::{ClusterConfig, EndpointAccess, NodePoolSpec, ZoneSelection};
use crate::controller::cidr::MAX_ZONES;
use crate::controller::upgrade::parse_version;
use crate::error::Error;

/// Longest cluster name that still yields valid derived role names
pub const MAX_CLUSTER_NAME_LEN: usize = 40;
pub const MAX_POOL_NAME_LEN: usize = 30;

/// A single validation failure with a hint on how to fix it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, how_to_fix: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

/// Fold a list of validation failures into a single configuration error
pub fn into_error(errors: Vec<SpecValidationError>) -> Error {
    let field = errors
        .iter()
        .map(|e| e.field.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let message = errors
        .iter()
        .map(|e| format!("{}: {}. {}", e.field, e.message, e.how_to_fix))
        .collect::<Vec<_>>()
        .join("; ");
    Error::Configuration { field, message }
}

fn is_dns_label(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    !s.ends_with('-') && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Parse a /16 network CIDR, rejecting host bits
pub fn parse_network_cidr(cidr: &str) -> Result<Ipv4Net, String> {
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|e| format!("{cidr:?} is not an IPv4 CIDR: {e}"))?;
    if net.prefix_len() != 16 {
        return Err(format!("{cidr} has prefix /{}, expected /16", net.prefix_len()));
    }
    if net.addr() != net.network() {
        return Err(format!("{cidr} has host bits set; use {}", net.trunc()));
    }
    if is_reserved_range(&net) {
        return Err(format!("{cidr} is a loopback, link-local or multicast range"));
    }
    Ok(net)
}

impl ClusterConfig {
    /// Validate the whole spec
    ///
    /// # Errors
    ///
    /// Returns every [`SpecValidationError`] found.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        // 1. Identity
        if !is_dns_label(&self.name) || self.name.len() > MAX_CLUSTER_NAME_LEN {
            errors.push(SpecValidationError::new(
                "cluster.name",
                format!("{:?} is not a valid cluster name", self.name),
                format!(
                    "Use 1-{MAX_CLUSTER_NAME_LEN} lowercase letters, digits or hyphens, starting with a letter."
                ),
            ));
        }
        if self.region.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "cluster.region",
                "region must not be empty",
                "Set cluster.region, e.g. us-west-2.",
            ));
        }

        // 2. Version
        if let Err(e) = parse_version(&self.kubernetes_version) {
            errors.push(SpecValidationError::new(
                "cluster.kubernetesVersion",
                e,
                "Use a \"major.minor\" version such as \"1.29\".",
            ));
        }

        // 3. Network
        if let Err(e) = parse_network_cidr(&self.network_cidr) {
            errors.push(SpecValidationError::new(
                "cluster.networkCidr",
                e,
                "Use a /16 block such as 10.10.0.0/16.",
            ));
        }
        if let ZoneSelection::Explicit(zones) = &self.availability_zones {
            validate_zones(zones, &mut errors);
        }

        // 4. Endpoint access
        for cidr in &self.public_access_cidrs {
            if cidr.parse::<Ipv4Net>().is_err() {
                errors.push(SpecValidationError::new(
                    "cluster.publicAccessCidrs",
                    format!("{cidr:?} is not an IPv4 CIDR"),
                    "List CIDR blocks such as 203.0.113.0/24.",
                ));
            }
        }
        if self.endpoint_access == EndpointAccess::Private && !self.public_access_cidrs.is_empty() {
            errors.push(SpecValidationError::new(
                "cluster.publicAccessCidrs",
                "publicAccessCidrs has no effect with a private-only endpoint",
                "Remove publicAccessCidrs or use endpointAccess: public-and-private.",
            ));
        }

        // 5. Encryption
        if let Some(key) = &self.encryption_key_arn {
            if !key.starts_with("arn:") {
                errors.push(SpecValidationError::new(
                    "cluster.encryptionKeyArn",
                    format!("{key:?} is not an ARN"),
                    "Reference the key by its full ARN.",
                ));
            }
        }

        // 6. Node pools
        for (name, pool) in &self.node_pools {
            validate_pool(name, pool, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and convert failures into an [`Error::Configuration`]
    pub fn ensure_valid(&self) -> Result<(), Error> {
        self.validate().map_err(into_error)
    }
}

fn validate_zones(zones: &[String], errors: &mut Vec<SpecValidationError>) {
    if zones.len() < MIN_ZONE_COUNT {
        errors.push(SpecValidationError::new(
            "cluster.availabilityZones",
            format!("{} zone(s) listed, at least {MIN_ZONE_COUNT} required", zones.len()),
            "List at least two zones or use \"auto\".",
        ));
    }
    if zones.len() > MAX_ZONES {
        errors.push(SpecValidationError::new(
            "cluster.availabilityZones",
            format!("{} zones listed, at most {MAX_ZONES} fit in a /16", zones.len()),
            "List fewer zones.",
        ));
    }
    let mut seen = HashSet::new();
    for zone in zones {
        if zone.trim().is_empty() || !seen.insert(zone.as_str()) {
            errors.push(SpecValidationError::new(
                "cluster.availabilityZones",
                format!("zone {zone:?} is empty or listed twice"),
                "List each zone once.",
            ));
        }
    }
}

fn validate_pool(name: &str, pool: &NodePoolSpec, errors: &mut Vec<SpecValidationError>) {
    let field = |f: &str| format!("cluster.nodePools.{name}.{f}");

    if !is_dns_label(name) || name.len() > MAX_POOL_NAME_LEN {
        errors.push(SpecValidationError::new(
            format!("cluster.nodePools.{name}"),
            format!("{name:?} is not a valid node pool name"),
            format!("Use 1-{MAX_POOL_NAME_LEN} lowercase letters, digits or hyphens."),
        ));
    }
    if pool.instance_type.trim().is_empty() {
        errors.push(SpecValidationError::new(
            field("instanceType"),
            "instanceType must not be empty",
            "Set an instance type such as m5.large.",
        ));
    }

    let (min, max) = (pool.effective_min(), pool.effective_max());
    if max == 0 {
        errors.push(SpecValidationError::new(
            field("maxSize"),
            "maxSize must be at least 1",
            "Set maxSize to 1 or more.",
        ));
    }
    if min > max {
        errors.push(SpecValidationError::new(
            field("minSize"),
            format!("minSize {min} is greater than maxSize {max}"),
            "Make minSize less than or equal to maxSize.",
        ));
    }

    if let Some(ami) = &pool.ami_type {
        if ami.trim().is_empty() {
            errors.push(SpecValidationError::new(
                field("amiType"),
                "amiType must not be empty when set",
                "Remove amiType to use the default or set a valid AMI type.",
            ));
        }
    }

    let mut seen = HashSet::new();
    for taint in &pool.taints {
        if taint.key.trim().is_empty() {
            errors.push(SpecValidationError::new(
                field("taints"),
                "taint key must not be empty",
                "Give every taint a key.",
            ));
        }
        if !seen.insert((taint.key.as_str(), taint.effect)) {
            errors.push(SpecValidationError::new(
                field("taints"),
                format!("taint {}:{} is listed twice", taint.key, taint.effect),
                "A key may appear once per effect.",
            ));
        }
    }

    for key in pool.labels.keys() {
        if key.trim().is_empty() || key.starts_with(crate::tags::NODE_POOL_KEY) {
            errors.push(SpecValidationError::new(
                field("labels"),
                format!("label key {key:?} is empty or reserved"),
                "Use a non-empty key outside the eksforge.io/ prefix.",
            ));
        }
    }
}

/// Loopback and link-local ranges cannot host a VPC
pub fn is_reserved_range(net: &Ipv4Net) -> bool {
    let addr: Ipv4Addr = net.network();
    addr.is_loopback() || addr.is_link_local() || addr.is_multicast()
}
