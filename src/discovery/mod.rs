//! Resource discoverers
//!
//! Each discoverer asks the provider for candidates and keeps only resources
//! passing [`crate::tags::is_owned`]. Nothing here mutates anything.

mod cluster;
mod network;
mod nodepool;
mod roles;

pub use cluster::discover_cluster;
pub use network::{discover_inventory, discover_network};
pub use nodepool::{discover_node_pools, index_by_pool};
pub use roles::{discover_role, discover_roles, role_names, RoleLookup, RoleNames};
