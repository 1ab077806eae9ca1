use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A service manifest: the packages, service types, and resources of one
/// service, identified by `(name, version)`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub service_types: Vec<ServiceTypeDecl>,
    #[serde(default)]
    pub code_packages: Vec<CodePackage>,
    #[serde(default)]
    pub config_packages: Vec<PackageDecl>,
    #[serde(default)]
    pub data_packages: Vec<PackageDecl>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub diagnostics: Option<Diagnostics>,
}

impl ServiceManifest {
    pub fn code_package(&self, name: &str) -> Option<&CodePackage> {
        self.code_packages.iter().find(|c| c.name == name)
    }

    pub fn config_package(&self, name: &str) -> Option<&PackageDecl> {
        self.config_packages.iter().find(|c| c.name == name)
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.resources.endpoints.iter().find(|e| e.name == name)
    }

    /// Every package of every kind, in manifest order.
    pub fn packages(&self) -> impl Iterator<Item = (PackageKind, &str, &str)> + '_ {
        let code = self
            .code_packages
            .iter()
            .map(|c| (PackageKind::Code, c.name.as_str(), c.version.as_str()));
        let config = self
            .config_packages
            .iter()
            .map(|c| (PackageKind::Config, c.name.as_str(), c.version.as_str()));
        let data = self
            .data_packages
            .iter()
            .map(|d| (PackageKind::Data, d.name.as_str(), d.version.as_str()));
        code.chain(config).chain(data)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    Code,
    Config,
    Data,
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKind::Code => write!(f, "code"),
            PackageKind::Config => write!(f, "config"),
            PackageKind::Data => write!(f, "data"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Stateless,
    Stateful,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceTypeDecl {
    pub service_type_name: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub has_persisted_state: bool,
    #[serde(default)]
    pub placement_constraints: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CodePackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub setup_entry_point: Option<ExeHost>,
    pub entry_point: EntryPoint,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
}

impl CodePackage {
    pub fn is_container(&self) -> bool {
        matches!(self.entry_point, EntryPoint::ContainerHost(_))
    }

    /// A container code package pulled from a registry carries no local content.
    pub fn needs_content(&self) -> bool {
        match &self.entry_point {
            EntryPoint::ExeHost(_) => true,
            EntryPoint::ContainerHost(host) => {
                host.from_source.is_some() || self.setup_entry_point.is_some()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPoint {
    ExeHost(ExeHost),
    ContainerHost(ContainerHost),
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkFolder {
    #[default]
    Work,
    CodePackage,
    CodeBase,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExeHost {
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub working_folder: WorkFolder,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerHost {
    pub image_name: String,
    #[serde(default)]
    pub commands: Option<String>,
    #[serde(default)]
    pub from_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Config or data package declaration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageDecl {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Resources {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Https,
    #[default]
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    #[default]
    Internal,
    Input,
}

impl FromStr for EndpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "internal" => Ok(EndpointType::Internal),
            "input" => Ok(EndpointType::Input),
            other => Err(format!("unknown endpoint type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub uri_scheme: Option<String>,
    #[serde(default)]
    pub path_suffix: Option<String>,
    #[serde(default)]
    pub code_package_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Diagnostics {
    #[serde(default)]
    pub etw_providers: Vec<String>,
}
