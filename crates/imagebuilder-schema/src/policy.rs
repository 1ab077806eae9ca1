//! Service-level policies attached to a service manifest import.
//!
//! Every policy kind is one variant of [`ServicePolicy`]; validation and
//! composition match on it exhaustively.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServicePolicy {
    RunAs(RunAsPolicy),
    SecurityAccess(SecurityAccessPolicy),
    EndpointBinding(EndpointBindingPolicy),
    PackageSharing(PackageSharingPolicy),
    ContainerHost(ContainerHostPolicy),
}

impl ServicePolicy {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ServicePolicy::RunAs(_) => "RunAsPolicy",
            ServicePolicy::SecurityAccess(_) => "SecurityAccessPolicy",
            ServicePolicy::EndpointBinding(_) => "EndpointBindingPolicy",
            ServicePolicy::PackageSharing(_) => "PackageSharingPolicy",
            ServicePolicy::ContainerHost(_) => "ContainerHostPolicy",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryPointKind {
    Setup,
    #[default]
    Main,
    All,
}

impl std::fmt::Display for EntryPointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryPointKind::Setup => write!(f, "setup"),
            EntryPointKind::Main => write!(f, "main"),
            EntryPointKind::All => write!(f, "all"),
        }
    }
}

/// Runs a code package entry point under a declared principal.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RunAsPolicy {
    pub code_package_ref: String,
    pub user_ref: String,
    #[serde(default)]
    pub entry_point_type: EntryPointKind,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessRights {
    #[default]
    Read,
    Change,
    Full,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Endpoint,
    Certificate,
}

/// Grants a principal access to an endpoint or a secrets certificate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecurityAccessPolicy {
    pub resource_ref: String,
    pub principal_ref: String,
    #[serde(default)]
    pub rights: AccessRights,
    #[serde(default)]
    pub resource_type: ResourceKind,
}

/// Binds an https endpoint to an endpoint certificate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EndpointBindingPolicy {
    pub endpoint_ref: String,
    pub certificate_ref: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SharingScope {
    All,
    Code,
    Config,
    Data,
}

/// Marks packages as shared across application instances on a node.
///
/// Exactly one of `package_ref` and `scope` must be set.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PackageSharingPolicy {
    #[serde(default)]
    pub package_ref: Option<String>,
    #[serde(default)]
    pub scope: Option<SharingScope>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DriverOption {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_encrypted: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u32,
    pub endpoint_ref: String,
}

/// Container runtime settings for a container-hosted code package.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerHostPolicy {
    pub code_package_ref: String,
    #[serde(default)]
    pub isolation: Option<String>,
    #[serde(default)]
    pub driver_options: Vec<DriverOption>,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
}
