use crate::policy::{SecurityAccessPolicy, ServicePolicy};
use crate::service::{EnvironmentVariable, ServiceKind};
use serde::{Deserialize, Serialize};

/// An application type definition identified by `(name, version)`.
///
/// Most scalar fields are strings so that they may hold a `[Parameter]`
/// placeholder until resolution.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplicationManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
    #[serde(default)]
    pub service_manifest_imports: Vec<ServiceManifestImport>,
    #[serde(default)]
    pub default_services: Vec<DefaultService>,
    #[serde(default)]
    pub service_templates: Vec<ServiceDescription>,
    #[serde(default)]
    pub principals: Principals,
    #[serde(default)]
    pub policies: ApplicationPolicies,
    #[serde(default)]
    pub certificates: Certificates,
}

impl ApplicationManifest {
    pub fn import(&self, service_name: &str) -> Option<&ServiceManifestImport> {
        self.service_manifest_imports
            .iter()
            .find(|i| i.service_manifest_ref.name == service_name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParameterDecl {
    pub name: String,
    #[serde(default)]
    pub default_value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceManifestImport {
    pub service_manifest_ref: ServiceManifestRef,
    #[serde(default)]
    pub config_overrides: Vec<ConfigOverride>,
    #[serde(default)]
    pub environment_overrides: Vec<EnvironmentOverrides>,
    #[serde(default)]
    pub endpoint_overrides: Vec<EndpointOverride>,
    #[serde(default)]
    pub policies: Vec<ServicePolicy>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
pub struct ServiceManifestRef {
    pub name: String,
    pub version: String,
}

/// Overrides applied to one config package's settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverride {
    pub name: String,
    #[serde(default)]
    pub sections: Vec<SectionOverride>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SectionOverride {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterOverride>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParameterOverride {
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// Kept as text so it may be parameterized; checked strictly later.
    #[serde(default)]
    pub is_encrypted: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentOverrides {
    pub code_package_ref: String,
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
}

/// Per-attribute endpoint override; unset attributes keep the manifest value.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EndpointOverride {
    pub name: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub endpoint_type: Option<String>,
    #[serde(default)]
    pub uri_scheme: Option<String>,
    #[serde(default)]
    pub path_suffix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DefaultService {
    pub name: String,
    #[serde(default)]
    pub service_dns_name: Option<String>,
    #[serde(default)]
    pub service_package_activation_mode: Option<String>,
    pub service: ServiceDescription,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceDescription {
    pub service_type_name: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub instance_count: Option<String>,
    #[serde(default)]
    pub target_replica_set_size: Option<String>,
    #[serde(default)]
    pub min_replica_set_size: Option<String>,
    #[serde(default)]
    pub replica_restart_wait_duration_seconds: Option<String>,
    #[serde(default)]
    pub quorum_loss_wait_duration_seconds: Option<String>,
    #[serde(default)]
    pub stand_by_replica_keep_duration_seconds: Option<String>,
    #[serde(default)]
    pub placement_constraints: Option<String>,
    #[serde(default)]
    pub partition: Partition,
    #[serde(default)]
    pub service_correlations: Vec<ServiceCorrelation>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    #[default]
    Singleton,
    UniformInt64,
    Named,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Partition {
    #[serde(default)]
    pub scheme: PartitionScheme,
    #[serde(default)]
    pub partition_count: Option<String>,
    #[serde(default)]
    pub low_key: Option<String>,
    #[serde(default)]
    pub high_key: Option<String>,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceCorrelation {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Principals {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Principals {
    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn has_principal(&self, name: &str) -> bool {
        self.users.iter().any(|u| u.name == name) || self.groups.iter().any(|g| g.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum AccountType {
    #[default]
    LocalUser,
    DomainUser,
    ManagedServiceAccount,
    NetworkService,
    LocalService,
    LocalSystem,
}

impl AccountType {
    pub fn is_system(self) -> bool {
        matches!(
            self,
            AccountType::LocalSystem | AccountType::NetworkService | AccountType::LocalService
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub account_type: AccountType,
    #[serde(default)]
    pub member_of: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Group {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplicationPolicies {
    #[serde(default)]
    pub health_policy: Option<HealthPolicy>,
    #[serde(default)]
    pub default_run_as: Option<String>,
    #[serde(default)]
    pub security_access_policies: Vec<SecurityAccessPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HealthPolicy {
    #[serde(default)]
    pub consider_warning_as_error: Option<String>,
    #[serde(default)]
    pub max_percent_unhealthy_deployed_applications: Option<String>,
    #[serde(default)]
    pub default_service_type_health_policy: Option<ServiceTypeHealthPolicy>,
    #[serde(default)]
    pub service_type_health_policies: Vec<ServiceTypeHealthPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceTypeHealthPolicy {
    #[serde(default)]
    pub service_type_name: Option<String>,
    #[serde(default)]
    pub max_percent_unhealthy_services: Option<String>,
    #[serde(default)]
    pub max_percent_unhealthy_partitions_per_service: Option<String>,
    #[serde(default)]
    pub max_percent_unhealthy_replicas_per_partition: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Certificates {
    #[serde(default)]
    pub endpoint_certificates: Vec<CertificateDecl>,
    #[serde(default)]
    pub secrets_certificates: Vec<CertificateDecl>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CertificateDecl {
    pub name: String,
    #[serde(default)]
    pub x509_find_value: String,
    #[serde(default)]
    pub x509_store_name: Option<String>,
}
