//! Composition of digested artifacts from a resolved application type.
//!
//! Every artifact is sealed after composition: its rollout version and
//! content checksum are derived from its own canonical bytes, sub-packages
//! first and the enclosing service package last.

use crate::CoreError;
use imagebuilder_schema::{
    seal, ApplicationId, ApplicationInstance, ApplicationManifest, ApplicationPackage,
    Checksum, CodePackage, DigestedCodePackage, DigestedConfigPackage, DigestedDataPackage,
    DigestedEndpoint, Endpoint, EndpointType, EntryPointKind, PackageKind, Protocol,
    ResourceKind, RolloutVersion, RunAsPolicy, Section, ServiceManifest, ServiceManifestImport,
    ServicePackage, ServicePackageRef, ServicePolicy, Settings, SettingsParameter, SharingScope,
};
use std::collections::BTreeMap;

/// Everything composition and validation need to know about one imported
/// service: its import (resolved once parameters are applied), its manifest,
/// its settings, and the content checksum of each package.
#[derive(Debug, Clone)]
pub struct ServiceSource {
    pub import: ServiceManifestImport,
    pub manifest: ServiceManifest,
    pub manifest_checksum: Checksum,
    /// Settings per config package name.
    pub settings: BTreeMap<String, Settings>,
    /// `None` for a package without content (registry containers).
    pub package_checksums: BTreeMap<(PackageKind, String), Option<Checksum>>,
}

impl ServiceSource {
    pub fn package_checksum(&self, kind: PackageKind, name: &str) -> Option<&Checksum> {
        self.package_checksums
            .get(&(kind, name.to_owned()))
            .and_then(Option::as_ref)
    }
}

/// Replace each source's import with the matching import of `app`.
///
/// Called after parameter resolution so that every source sees resolved values.
pub fn bind_imports(app: &ApplicationManifest, sources: &mut [ServiceSource]) {
    for src in sources {
        if let Some(import) = app.import(&src.manifest.name) {
            src.import = import.clone();
        }
    }
}

/// Whether the sharing policies of an import mark a package as shared.
///
/// An explicit `package_ref` policy wins; otherwise a scope of `all` or the
/// package's own kind shares it.
pub fn is_shared(policies: &[ServicePolicy], kind: PackageKind, name: &str) -> bool {
    let sharing = policies.iter().filter_map(|p| match p {
        ServicePolicy::PackageSharing(s) => Some(s),
        _ => None,
    });
    let mut by_scope = false;
    for policy in sharing {
        if policy.package_ref.as_deref() == Some(name) {
            return true;
        }
        by_scope |= matches!(
            (policy.scope, kind),
            (Some(SharingScope::All), _)
                | (Some(SharingScope::Code), PackageKind::Code)
                | (Some(SharingScope::Config), PackageKind::Config)
                | (Some(SharingScope::Data), PackageKind::Data)
        );
    }
    by_scope
}

/// Composes digested artifacts from a resolved application manifest.
pub struct Composer<'a> {
    app: &'a ApplicationManifest,
}

impl<'a> Composer<'a> {
    pub fn new(app: &'a ApplicationManifest) -> Self {
        Self { app }
    }

    pub fn compose_service_package(
        &self,
        src: &ServiceSource,
    ) -> Result<ServicePackage, CoreError> {
        let m = &src.manifest;
        let policies = &src.import.policies;

        let mut code_packages = Vec::with_capacity(m.code_packages.len());
        for cp in &m.code_packages {
            let mut digested = DigestedCodePackage {
                rollout_version: RolloutVersion::default(),
                is_shared: is_shared(policies, PackageKind::Code, &cp.name),
                content_checksum: src.package_checksum(PackageKind::Code, &cp.name).cloned(),
                package: resolve_environment(src, cp),
                run_as: self.run_as_for(policies, &cp.name),
                container_host: policies.iter().find_map(|p| match p {
                    ServicePolicy::ContainerHost(h) if h.code_package_ref == cp.name => {
                        Some(h.clone())
                    }
                    _ => None,
                }),
            };
            seal(&mut digested)?;
            code_packages.push(digested);
        }

        let mut config_packages = Vec::with_capacity(m.config_packages.len());
        for cfg in &m.config_packages {
            let mut digested = DigestedConfigPackage {
                rollout_version: RolloutVersion::default(),
                is_shared: is_shared(policies, PackageKind::Config, &cfg.name),
                name: cfg.name.clone(),
                version: cfg.version.clone(),
                content_checksum: required_checksum(src, PackageKind::Config, &cfg.name)?,
                sections: merge_settings(src, &cfg.name),
            };
            seal(&mut digested)?;
            config_packages.push(digested);
        }

        let mut data_packages = Vec::with_capacity(m.data_packages.len());
        for data in &m.data_packages {
            let mut digested = DigestedDataPackage {
                rollout_version: RolloutVersion::default(),
                is_shared: is_shared(policies, PackageKind::Data, &data.name),
                name: data.name.clone(),
                version: data.version.clone(),
                content_checksum: required_checksum(src, PackageKind::Data, &data.name)?,
            };
            seal(&mut digested)?;
            data_packages.push(digested);
        }

        let mut package = ServicePackage {
            name: m.name.clone(),
            manifest_version: m.version.clone(),
            rollout_version: RolloutVersion::default(),
            content_checksum: Checksum::default(),
            service_types: m.service_types.clone(),
            code_packages,
            config_packages,
            data_packages,
            endpoints: m
                .resources
                .endpoints
                .iter()
                .map(|ep| digest_endpoint(src, ep))
                .collect(),
            diagnostics: m.diagnostics.clone(),
        };
        seal(&mut package)?;
        Ok(package)
    }

    /// Run-as policies of one code package, falling back to the application default.
    fn run_as_for(&self, policies: &[ServicePolicy], code_package: &str) -> Vec<RunAsPolicy> {
        let explicit: Vec<_> = policies
            .iter()
            .filter_map(|p| match p {
                ServicePolicy::RunAs(r) if r.code_package_ref == code_package => Some(r.clone()),
                _ => None,
            })
            .collect();
        if !explicit.is_empty() {
            return explicit;
        }
        self.app
            .policies
            .default_run_as
            .iter()
            .map(|user| RunAsPolicy {
                code_package_ref: code_package.to_owned(),
                user_ref: user.clone(),
                entry_point_type: EntryPointKind::All,
            })
            .collect()
    }

    pub fn compose_application_package(
        &self,
        application_id: &ApplicationId,
        name_uri: &str,
        parameters: BTreeMap<String, String>,
    ) -> Result<ApplicationPackage, CoreError> {
        let app = self.app;
        let mut package = ApplicationPackage {
            application_type_name: app.name.clone(),
            application_type_version: app.version.clone(),
            application_id: application_id.clone(),
            name_uri: name_uri.to_owned(),
            rollout_version: RolloutVersion::default(),
            content_checksum: Checksum::default(),
            parameters,
            principals: app.principals.clone(),
            certificates: app.certificates.clone(),
            health_policy: app.policies.health_policy.clone(),
            default_run_as: app.policies.default_run_as.clone(),
            security_access_policies: app.policies.security_access_policies.clone(),
        };
        seal(&mut package)?;
        Ok(package)
    }

    pub fn compose_instance(
        &self,
        instance_version: u32,
        app_package: &ApplicationPackage,
        service_packages: &[ServicePackage],
    ) -> ApplicationInstance {
        let mut service_package_refs: Vec<_> = service_packages
            .iter()
            .map(|p| ServicePackageRef {
                name: p.name.clone(),
                manifest_version: p.manifest_version.clone(),
                rollout_version: p.rollout_version.clone(),
            })
            .collect();
        service_package_refs.sort();

        let default_services = self
            .app
            .default_services
            .iter()
            .cloned()
            .map(|mut ds| {
                if ds.service_dns_name.as_deref().is_some_and(str::is_empty) {
                    ds.service_dns_name = None;
                }
                ds
            })
            .collect();

        ApplicationInstance {
            application_type_name: self.app.name.clone(),
            application_type_version: self.app.version.clone(),
            application_id: app_package.application_id.clone(),
            name_uri: app_package.name_uri.clone(),
            instance_version,
            application_package_ref: app_package.rollout_version.clone(),
            service_package_refs,
            default_services,
            service_templates: self.app.service_templates.clone(),
        }
    }
}

/// Declared environment with overrides applied; undeclared names never get in.
fn resolve_environment(src: &ServiceSource, cp: &CodePackage) -> CodePackage {
    let mut resolved = cp.clone();
    let overrides = src
        .import
        .environment_overrides
        .iter()
        .filter(|o| o.code_package_ref == cp.name)
        .flat_map(|o| &o.variables);
    for var in overrides {
        if let Some(declared) = resolved
            .environment_variables
            .iter_mut()
            .find(|d| d.name == var.name)
        {
            declared.value.clone_from(&var.value);
        }
    }
    resolved
}

fn required_checksum(
    src: &ServiceSource,
    kind: PackageKind,
    name: &str,
) -> Result<Checksum, CoreError> {
    src.package_checksum(kind, name).cloned().ok_or_else(|| {
        CoreError::NotFound(format!(
            "content checksum of {kind} package {}.{name}",
            src.manifest.name
        ))
    })
}

/// Settings of one config package with the import's overrides merged in.
fn merge_settings(src: &ServiceSource, package: &str) -> Vec<Section> {
    let mut sections = src
        .settings
        .get(package)
        .map(|s| s.sections.clone())
        .unwrap_or_default();

    let overrides = src
        .import
        .config_overrides
        .iter()
        .filter(|co| co.name == package)
        .flat_map(|co| &co.sections);
    for so in overrides {
        let section = match sections.iter().position(|s| s.name == so.name) {
            Some(i) => &mut sections[i],
            None => {
                sections.push(Section {
                    name: so.name.clone(),
                    parameters: Vec::new(),
                });
                let last = sections.len() - 1;
                &mut sections[last]
            }
        };
        for po in &so.parameters {
            let encrypted = po
                .is_encrypted
                .as_deref()
                .and_then(crate::validate::parse_bool);
            match section.parameters.iter_mut().find(|p| p.name == po.name) {
                Some(param) => {
                    param.value.clone_from(&po.value);
                    if let Some(flag) = encrypted {
                        param.is_encrypted = flag;
                    }
                }
                None => section.parameters.push(SettingsParameter {
                    name: po.name.clone(),
                    value: po.value.clone(),
                    must_override: false,
                    is_encrypted: encrypted.unwrap_or(false),
                }),
            }
        }
    }
    sections
}

/// Apply endpoint overrides and attach this endpoint's own binding and grants.
fn digest_endpoint(src: &ServiceSource, declared: &Endpoint) -> DigestedEndpoint {
    let mut endpoint = declared.clone();
    for o in src
        .import
        .endpoint_overrides
        .iter()
        .filter(|o| o.name == declared.name)
    {
        if let Some(protocol) = o
            .protocol
            .as_deref()
            .and_then(|p| p.trim().parse::<Protocol>().ok())
        {
            endpoint.protocol = protocol;
        }
        if let Some(port) = o.port.as_deref().and_then(|p| p.trim().parse::<u16>().ok()) {
            endpoint.port = Some(u32::from(port));
        }
        if let Some(kind) = o
            .endpoint_type
            .as_deref()
            .and_then(|t| t.trim().parse::<EndpointType>().ok())
        {
            endpoint.endpoint_type = kind;
        }
        if let Some(scheme) = &o.uri_scheme {
            endpoint.uri_scheme = Some(scheme.clone());
        }
        if let Some(suffix) = &o.path_suffix {
            endpoint.path_suffix = Some(suffix.clone());
        }
    }

    // a binding only applies while the endpoint is still https
    let certificate_ref = if endpoint.protocol == Protocol::Https {
        src.import.policies.iter().find_map(|p| match p {
            ServicePolicy::EndpointBinding(b) if b.endpoint_ref == declared.name => {
                Some(b.certificate_ref.clone())
            }
            _ => None,
        })
    } else {
        None
    };

    let security_access = src
        .import
        .policies
        .iter()
        .filter_map(|p| match p {
            ServicePolicy::SecurityAccess(s)
                if s.resource_type == ResourceKind::Endpoint && s.resource_ref == declared.name =>
            {
                Some(s.clone())
            }
            _ => None,
        })
        .collect();

    DigestedEndpoint {
        endpoint,
        certificate_ref,
        security_access,
    }
}
