//! Desired cluster specification
//!
//! [`ClusterConfig`] is the fully-typed desired state handed to the
//! reconciler. It is produced once at the process boundary (see
//! [`super::load_config`]) and never persisted.
//!
//! ```yaml
//! cluster:
//!   name: demo
//!   region: us-west-2
//!   kubernetesVersion: "1.29"
//!   networkCidr: 10.10.0.0/16
//!   availabilityZones: auto
//!   endpointAccess: public-and-private
//!   nodePools:
//!     general:
//!       instanceType: m5.large
//!       minSize: 2
//!       maxSize: 5
//! ```

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cloud::{CapacityType, TagSet, Taint};

pub const DEFAULT_KUBERNETES_VERSION: &str = "1.29";
pub const DEFAULT_NETWORK_CIDR: &str = "10.0.0.0/16";
pub const DEFAULT_MIN_SIZE: u32 = 1;
pub const DEFAULT_MAX_SIZE: u32 = 3;
pub const DEFAULT_AMI_TYPE: &str = "AL2023_x86_64_STANDARD";
pub const GPU_AMI_TYPE: &str = "AL2023_x86_64_NVIDIA";

fn default_kubernetes_version() -> String {
    DEFAULT_KUBERNETES_VERSION.to_string()
}

fn default_network_cidr() -> String {
    DEFAULT_NETWORK_CIDR.to_string()
}

/// Desired state of one managed cluster and everything around it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    /// Project / cluster name. Also the value of the ownership cluster tag.
    pub name: String,

    /// Provider region
    pub region: String,

    /// Kubernetes "major.minor" version
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,

    /// IPv4 /16 block the whole network is carved from
    #[serde(default = "default_network_cidr")]
    pub network_cidr: String,

    /// `auto` or an explicit list of zone names
    #[serde(default)]
    #[schemars(with = "ZoneSelectionRepr")]
    pub availability_zones: ZoneSelection,

    /// Control-plane API endpoint reachability
    #[serde(default)]
    pub endpoint_access: EndpointAccess,

    /// CIDRs allowed to reach the public endpoint. Empty means `0.0.0.0/0`.
    #[serde(default)]
    pub public_access_cidrs: Vec<String>,

    /// Customer-managed key ARN for secrets envelope encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_arn: Option<String>,

    /// Extra tags applied to every created resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: TagSet,

    /// Logical node-pool name -> pool spec
    #[serde(default)]
    pub node_pools: BTreeMap<String, NodePoolSpec>,
}

impl ClusterConfig {
    /// Minimal config with defaults for everything optional
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            kubernetes_version: default_kubernetes_version(),
            network_cidr: default_network_cidr(),
            availability_zones: ZoneSelection::Auto,
            endpoint_access: EndpointAccess::default(),
            public_access_cidrs: Vec::new(),
            encryption_key_arn: None,
            tags: TagSet::new(),
            node_pools: BTreeMap::new(),
        }
    }

    /// Public-access allow-list with the implicit default applied
    pub fn effective_public_access_cidrs(&self) -> Vec<String> {
        if self.public_access_cidrs.is_empty() {
            vec!["0.0.0.0/0".to_string()]
        } else {
            let mut cidrs = self.public_access_cidrs.clone();
            cidrs.sort();
            cidrs.dedup();
            cidrs
        }
    }
}

/// Which availability zones the network spans
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ZoneSelectionRepr", into = "ZoneSelectionRepr")]
pub enum ZoneSelection {
    /// Take the first N zones the provider reports as available
    #[default]
    Auto,
    Explicit(Vec<String>),
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
enum ZoneSelectionRepr {
    Keyword(String),
    Zones(Vec<String>),
}

impl TryFrom<ZoneSelectionRepr> for ZoneSelection {
    type Error = String;

    fn try_from(repr: ZoneSelectionRepr) -> Result<Self, Self::Error> {
        match repr {
            ZoneSelectionRepr::Keyword(k) if k.eq_ignore_ascii_case("auto") => Ok(ZoneSelection::Auto),
            ZoneSelectionRepr::Keyword(k) => Err(format!(
                "availabilityZones must be \"auto\" or a list of zone names, got {k:?}"
            )),
            ZoneSelectionRepr::Zones(z) if z.is_empty() => Ok(ZoneSelection::Auto),
            ZoneSelectionRepr::Zones(z) => Ok(ZoneSelection::Explicit(z)),
        }
    }
}

impl From<ZoneSelection> for ZoneSelectionRepr {
    fn from(selection: ZoneSelection) -> Self {
        match selection {
            ZoneSelection::Auto => ZoneSelectionRepr::Keyword("auto".to_string()),
            ZoneSelection::Explicit(z) => ZoneSelectionRepr::Zones(z),
        }
    }
}

/// Control-plane endpoint access mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointAccess {
    #[default]
    Public,
    Private,
    PublicAndPrivate,
}

impl EndpointAccess {
    pub fn public(&self) -> bool {
        matches!(self, EndpointAccess::Public | EndpointAccess::PublicAndPrivate)
    }

    pub fn private(&self) -> bool {
        matches!(self, EndpointAccess::Private | EndpointAccess::PublicAndPrivate)
    }

    /// Fully private clusters need in-network endpoints for node bootstrap
    pub fn requires_private_endpoints(&self) -> bool {
        matches!(self, EndpointAccess::Private)
    }
}

impl fmt::Display for EndpointAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAccess::Public => f.write_str("public"),
            EndpointAccess::Private => f.write_str("private"),
            EndpointAccess::PublicAndPrivate => f.write_str("public-and-private"),
        }
    }
}

/// Desired state of one worker node pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodePoolSpec {
    /// Instance type (immutable once created)
    pub instance_type: String,

    /// Minimum node count (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,

    /// Maximum node count (default 3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,

    /// Use spot capacity (immutable once created)
    #[serde(default)]
    pub spot: bool,

    /// GPU pool; implies the NVIDIA AMI unless `amiType` is set
    #[serde(default)]
    pub gpu: bool,

    /// Explicit AMI type override (immutable once created)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_type: Option<String>,

    /// Ordered taints applied to every node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Extra Kubernetes labels applied to every node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl NodePoolSpec {
    pub fn new(instance_type: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            ..Default::default()
        }
    }

    pub fn effective_min(&self) -> u32 {
        self.min_size.unwrap_or(DEFAULT_MIN_SIZE)
    }

    pub fn effective_max(&self) -> u32 {
        self.max_size.unwrap_or(DEFAULT_MAX_SIZE)
    }

    /// Explicit override, else GPU-implied NVIDIA variant, else platform default
    pub fn resolved_ami_type(&self) -> String {
        match &self.ami_type {
            Some(ami) => ami.clone(),
            None if self.gpu => GPU_AMI_TYPE.to_string(),
            None => DEFAULT_AMI_TYPE.to_string(),
        }
    }

    pub fn capacity_type(&self) -> CapacityType {
        if self.spot {
            CapacityType::Spot
        } else {
            CapacityType::OnDemand
        }
    }
}
