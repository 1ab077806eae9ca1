//! Digested artifacts: the fully resolved, immutable outputs of composition.

use crate::application::{
    Certificates, DefaultService, HealthPolicy, Principals, ServiceDescription,
};
use crate::identity::RolloutIdentity;
use crate::policy::{ContainerHostPolicy, RunAsPolicy, SecurityAccessPolicy};
use crate::service::{CodePackage, Diagnostics, Endpoint, ServiceTypeDecl};
use crate::settings::Section;
use crate::types::{ApplicationId, Checksum, RolloutVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServicePackage {
    pub name: String,
    pub manifest_version: String,
    pub rollout_version: RolloutVersion,
    pub content_checksum: Checksum,
    pub service_types: Vec<ServiceTypeDecl>,
    pub code_packages: Vec<DigestedCodePackage>,
    pub config_packages: Vec<DigestedConfigPackage>,
    pub data_packages: Vec<DigestedDataPackage>,
    pub endpoints: Vec<DigestedEndpoint>,
    pub diagnostics: Option<Diagnostics>,
}

impl RolloutIdentity for ServicePackage {
    fn rollout_version_mut(&mut self) -> &mut RolloutVersion {
        &mut self.rollout_version
    }

    fn content_checksum_mut(&mut self) -> Option<&mut Checksum> {
        Some(&mut self.content_checksum)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DigestedCodePackage {
    pub rollout_version: RolloutVersion,
    pub is_shared: bool,
    /// `None` for a registry-pulled container with no local content.
    pub content_checksum: Option<Checksum>,
    pub package: CodePackage,
    pub run_as: Vec<RunAsPolicy>,
    pub container_host: Option<ContainerHostPolicy>,
}

impl RolloutIdentity for DigestedCodePackage {
    fn rollout_version_mut(&mut self) -> &mut RolloutVersion {
        &mut self.rollout_version
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DigestedConfigPackage {
    pub rollout_version: RolloutVersion,
    pub is_shared: bool,
    pub name: String,
    pub version: String,
    pub content_checksum: Checksum,
    /// Settings with overrides merged in.
    pub sections: Vec<Section>,
}

impl RolloutIdentity for DigestedConfigPackage {
    fn rollout_version_mut(&mut self) -> &mut RolloutVersion {
        &mut self.rollout_version
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DigestedDataPackage {
    pub rollout_version: RolloutVersion,
    pub is_shared: bool,
    pub name: String,
    pub version: String,
    pub content_checksum: Checksum,
}

impl RolloutIdentity for DigestedDataPackage {
    fn rollout_version_mut(&mut self) -> &mut RolloutVersion {
        &mut self.rollout_version
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DigestedEndpoint {
    pub endpoint: Endpoint,
    pub certificate_ref: Option<String>,
    pub security_access: Vec<SecurityAccessPolicy>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApplicationPackage {
    pub application_type_name: String,
    pub application_type_version: String,
    pub application_id: ApplicationId,
    pub name_uri: String,
    pub rollout_version: RolloutVersion,
    pub content_checksum: Checksum,
    pub parameters: BTreeMap<String, String>,
    pub principals: Principals,
    pub certificates: Certificates,
    pub health_policy: Option<HealthPolicy>,
    pub default_run_as: Option<String>,
    pub security_access_policies: Vec<SecurityAccessPolicy>,
}

impl RolloutIdentity for ApplicationPackage {
    fn rollout_version_mut(&mut self) -> &mut RolloutVersion {
        &mut self.rollout_version
    }

    fn content_checksum_mut(&mut self) -> Option<&mut Checksum> {
        Some(&mut self.content_checksum)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServicePackageRef {
    pub name: String,
    pub manifest_version: String,
    pub rollout_version: RolloutVersion,
}

/// One version of an application instance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApplicationInstance {
    pub application_type_name: String,
    pub application_type_version: String,
    pub application_id: ApplicationId,
    pub name_uri: String,
    pub instance_version: u32,
    pub application_package_ref: RolloutVersion,
    pub service_package_refs: Vec<ServicePackageRef>,
    pub default_services: Vec<DefaultService>,
    pub service_templates: Vec<ServiceDescription>,
}

impl ApplicationInstance {
    pub fn service_package_ref(&self, name: &str) -> Option<&ServicePackageRef> {
        self.service_package_refs.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::seal;

    fn data_package(version: &str) -> DigestedDataPackage {
        DigestedDataPackage {
            rollout_version: RolloutVersion::default(),
            is_shared: false,
            name: "Data".to_owned(),
            version: version.to_owned(),
            content_checksum: Checksum::new("00"),
        }
    }

    #[test]
    fn sealing_sub_package_sets_rollout_only() {
        let mut pkg = data_package("1.0");
        seal(&mut pkg).unwrap();
        assert_eq!(pkg.rollout_version.len(), 16);
        assert_eq!(pkg.content_checksum, "00");
    }

    #[test]
    fn instance_lookup_by_service_name() {
        let inst = ApplicationInstance {
            application_type_name: "T".to_owned(),
            application_type_version: "1".to_owned(),
            application_id: ApplicationId::new("app"),
            name_uri: "fabric:/app".to_owned(),
            instance_version: 1,
            application_package_ref: RolloutVersion::new("a"),
            service_package_refs: vec![ServicePackageRef {
                name: "Svc".to_owned(),
                manifest_version: "1.0".to_owned(),
                rollout_version: RolloutVersion::new("b"),
            }],
            default_services: vec![],
            service_templates: vec![],
        };
        assert!(inst.service_package_ref("Svc").is_some());
        assert!(inst.service_package_ref("Other").is_none());
    }
}
