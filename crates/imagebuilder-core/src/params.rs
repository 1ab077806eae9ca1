//! Parameter resolution.
//!
//! A field whose whole value is `[Name]` is a placeholder for the application
//! parameter `Name`. Names match case-insensitively; the value is the caller's
//! override when one was supplied, otherwise the declared default. Every
//! parameterizable field of an entity is visited by its [`Parameterize`] impl
//! in one pass.

use crate::validate::{Rule, Violations};
use imagebuilder_schema::{
    ApplicationManifest, ApplicationPolicies, Certificates, ConfigOverride, DefaultService,
    EndpointOverride, EnvironmentOverrides, HealthPolicy, ParameterDecl, Partition, Principals,
    SecurityAccessPolicy, ServiceDescription, ServiceManifestImport, ServicePolicy,
    ServiceTypeHealthPolicy,
};
use std::collections::BTreeMap;

/// Reserved parameter accepted without declaration and never composed.
pub const DEBUG_PARAMETER: &str = "_WFDebugParams_";

/// If `value` is a `[Name]` placeholder, return `Name`.
pub fn placeholder_name(value: &str) -> Option<&str> {
    if value.len() > 2 && value.starts_with('[') && value.ends_with(']') {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: String,
}

/// Declared parameters with overrides applied, keyed case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    entries: BTreeMap<String, Entry>,
}

impl ParameterTable {
    /// Build the table, reporting duplicate declarations and undeclared overrides.
    pub fn new(
        decls: &[ParameterDecl],
        overrides: &BTreeMap<String, String>,
        violations: &mut Violations,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for decl in decls {
            let key = decl.name.to_lowercase();
            if entries.contains_key(&key) {
                violations.push(
                    Rule::DuplicateDefinition,
                    format!("Parameter[{}]", decl.name),
                    "parameter is declared more than once",
                );
                continue;
            }
            entries.insert(
                key,
                Entry {
                    name: decl.name.clone(),
                    value: decl.default_value.clone(),
                },
            );
        }

        for (name, value) in overrides {
            match entries.get_mut(&name.to_lowercase()) {
                Some(entry) => entry.value.clone_from(value),
                None if name.eq_ignore_ascii_case(DEBUG_PARAMETER) => {
                    entries.insert(
                        name.to_lowercase(),
                        Entry {
                            name: DEBUG_PARAMETER.to_owned(),
                            value: value.clone(),
                        },
                    );
                }
                None => violations.push(
                    Rule::UndeclaredParameter,
                    format!("Parameter[{name}]"),
                    "override names a parameter the application manifest does not declare",
                ),
            }
        }
        Self { entries }
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_lowercase())
            .map(|e| e.value.as_str())
    }

    /// Resolved values by declared name, excluding the debug parameter.
    pub fn resolved(&self) -> BTreeMap<String, String> {
        self.entries
            .values()
            .filter(|e| e.name != DEBUG_PARAMETER)
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }
}

/// Replaces placeholders in place and records undeclared references.
pub struct Resolver<'a> {
    table: &'a ParameterTable,
    violations: &'a mut Violations,
}

impl<'a> Resolver<'a> {
    pub fn new(table: &'a ParameterTable, violations: &'a mut Violations) -> Self {
        Self { table, violations }
    }

    pub fn resolve(&mut self, element: &str, value: &mut String) {
        let Some(name) = placeholder_name(value) else {
            return;
        };
        match self.table.lookup(name) {
            Some(resolved) => *value = resolved.to_owned(),
            None => self.violations.push(
                Rule::UndeclaredParameter,
                element,
                format!("'{value}' references an undeclared parameter"),
            ),
        }
    }

    pub fn resolve_opt(&mut self, element: &str, value: &mut Option<String>) {
        if let Some(v) = value {
            self.resolve(element, v);
        }
    }
}

/// An entity whose string fields may hold parameter placeholders.
pub trait Parameterize {
    fn parameterize(&mut self, scope: &str, resolver: &mut Resolver<'_>);
}

impl Parameterize for ApplicationManifest {
    fn parameterize(&mut self, _scope: &str, r: &mut Resolver<'_>) {
        for import in &mut self.service_manifest_imports {
            let scope = format!("ServiceManifestImport[{}]", import.service_manifest_ref.name);
            import.parameterize(&scope, r);
        }
        for ds in &mut self.default_services {
            let scope = format!("DefaultService[{}]", ds.name);
            ds.parameterize(&scope, r);
        }
        for template in &mut self.service_templates {
            let scope = format!("ServiceTemplate[{}]", template.service_type_name);
            template.parameterize(&scope, r);
        }
        self.principals.parameterize("Principals", r);
        self.policies.parameterize("Policies", r);
        self.certificates.parameterize("Certificates", r);
    }
}

impl Parameterize for ServiceManifestImport {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        for co in &mut self.config_overrides {
            co.parameterize(scope, r);
        }
        for eo in &mut self.environment_overrides {
            eo.parameterize(scope, r);
        }
        for ep in &mut self.endpoint_overrides {
            ep.parameterize(scope, r);
        }
        for policy in &mut self.policies {
            policy.parameterize(scope, r);
        }
    }
}

impl Parameterize for ConfigOverride {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        for section in &mut self.sections {
            for param in &mut section.parameters {
                let element = format!(
                    "{scope}/ConfigOverride[{}]/{}/{}",
                    self.name, section.name, param.name
                );
                r.resolve(&element, &mut param.value);
                r.resolve_opt(&element, &mut param.is_encrypted);
            }
        }
    }
}

impl Parameterize for EnvironmentOverrides {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        for var in &mut self.variables {
            let element = format!(
                "{scope}/EnvironmentOverrides[{}]/{}",
                self.code_package_ref, var.name
            );
            r.resolve(&element, &mut var.value);
        }
    }
}

impl Parameterize for EndpointOverride {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        let element = format!("{scope}/EndpointOverride[{}]", self.name);
        r.resolve_opt(&element, &mut self.protocol);
        r.resolve_opt(&element, &mut self.port);
        r.resolve_opt(&element, &mut self.endpoint_type);
        r.resolve_opt(&element, &mut self.uri_scheme);
        r.resolve_opt(&element, &mut self.path_suffix);
    }
}

impl Parameterize for ServicePolicy {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        let element = format!("{scope}/{}", self.kind_name());
        match self {
            ServicePolicy::RunAs(p) => r.resolve(&element, &mut p.user_ref),
            ServicePolicy::SecurityAccess(p) => p.parameterize(&element, r),
            ServicePolicy::EndpointBinding(p) => {
                r.resolve(&element, &mut p.endpoint_ref);
                r.resolve(&element, &mut p.certificate_ref);
            }
            ServicePolicy::PackageSharing(_) => {}
            ServicePolicy::ContainerHost(p) => {
                r.resolve_opt(&element, &mut p.isolation);
                for opt in &mut p.driver_options {
                    let opt_element = format!("{element}/DriverOption[{}]", opt.name);
                    r.resolve(&opt_element, &mut opt.value);
                    r.resolve_opt(&opt_element, &mut opt.is_encrypted);
                }
            }
        }
    }
}

impl Parameterize for SecurityAccessPolicy {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        r.resolve(scope, &mut self.principal_ref);
        r.resolve(scope, &mut self.resource_ref);
    }
}

impl Parameterize for DefaultService {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        r.resolve_opt(&format!("{scope}/ServiceDnsName"), &mut self.service_dns_name);
        r.resolve_opt(
            &format!("{scope}/ServicePackageActivationMode"),
            &mut self.service_package_activation_mode,
        );
        self.service.parameterize(scope, r);
    }
}

impl Parameterize for ServiceDescription {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        r.resolve_opt(&format!("{scope}/InstanceCount"), &mut self.instance_count);
        r.resolve_opt(
            &format!("{scope}/TargetReplicaSetSize"),
            &mut self.target_replica_set_size,
        );
        r.resolve_opt(
            &format!("{scope}/MinReplicaSetSize"),
            &mut self.min_replica_set_size,
        );
        r.resolve_opt(
            &format!("{scope}/ReplicaRestartWaitDuration"),
            &mut self.replica_restart_wait_duration_seconds,
        );
        r.resolve_opt(
            &format!("{scope}/QuorumLossWaitDuration"),
            &mut self.quorum_loss_wait_duration_seconds,
        );
        r.resolve_opt(
            &format!("{scope}/StandByReplicaKeepDuration"),
            &mut self.stand_by_replica_keep_duration_seconds,
        );
        r.resolve_opt(
            &format!("{scope}/PlacementConstraints"),
            &mut self.placement_constraints,
        );
        self.partition.parameterize(scope, r);
    }
}

impl Parameterize for Partition {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        let element = format!("{scope}/Partition");
        r.resolve_opt(&element, &mut self.partition_count);
        r.resolve_opt(&element, &mut self.low_key);
        r.resolve_opt(&element, &mut self.high_key);
        for name in &mut self.names {
            r.resolve(&element, name);
        }
    }
}

impl Parameterize for Principals {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        for user in &mut self.users {
            r.resolve(&format!("{scope}/User"), &mut user.name);
        }
        for group in &mut self.groups {
            r.resolve(&format!("{scope}/Group"), &mut group.name);
        }
    }
}

impl Parameterize for ApplicationPolicies {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        r.resolve_opt(&format!("{scope}/DefaultRunAs"), &mut self.default_run_as);
        for sap in &mut self.security_access_policies {
            sap.parameterize(&format!("{scope}/SecurityAccessPolicy"), r);
        }
        if let Some(health) = &mut self.health_policy {
            health.parameterize(&format!("{scope}/HealthPolicy"), r);
        }
    }
}

impl Parameterize for HealthPolicy {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        r.resolve_opt(scope, &mut self.consider_warning_as_error);
        r.resolve_opt(scope, &mut self.max_percent_unhealthy_deployed_applications);
        if let Some(default) = &mut self.default_service_type_health_policy {
            default.parameterize(scope, r);
        }
        for policy in &mut self.service_type_health_policies {
            policy.parameterize(scope, r);
        }
    }
}

impl Parameterize for ServiceTypeHealthPolicy {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        r.resolve_opt(scope, &mut self.max_percent_unhealthy_services);
        r.resolve_opt(scope, &mut self.max_percent_unhealthy_partitions_per_service);
        r.resolve_opt(scope, &mut self.max_percent_unhealthy_replicas_per_partition);
    }
}

impl Parameterize for Certificates {
    fn parameterize(&mut self, scope: &str, r: &mut Resolver<'_>) {
        for cert in self
            .endpoint_certificates
            .iter_mut()
            .chain(self.secrets_certificates.iter_mut())
        {
            r.resolve(
                &format!("{scope}/Certificate[{}]", cert.name),
                &mut cert.x509_find_value,
            );
        }
    }
}

/// Resolve every placeholder of an application manifest in place.
///
/// Returns the parameter table so composition can record resolved values.
pub fn resolve_application(
    app: &mut ApplicationManifest,
    overrides: &BTreeMap<String, String>,
    violations: &mut Violations,
) -> ParameterTable {
    let table = ParameterTable::new(&app.parameters, overrides, violations);
    let mut resolver = Resolver::new(&table, violations);
    app.parameterize("ApplicationManifest", &mut resolver);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{app_manifest_toml, parse_app};

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn placeholder_detection() {
        assert_eq!(placeholder_name("[Count]"), Some("Count"));
        assert_eq!(placeholder_name("[]"), None);
        assert_eq!(placeholder_name("[x"), None);
        assert_eq!(placeholder_name("plain"), None);
        assert_eq!(placeholder_name("a[b]"), None);
    }

    #[test]
    fn override_wins_over_default_case_insensitively() {
        let decls = vec![ParameterDecl {
            name: "InstanceCount".to_owned(),
            default_value: "1".to_owned(),
        }];
        let mut v = Violations::default();
        let table = ParameterTable::new(&decls, &overrides(&[("instancecount", "5")]), &mut v);
        assert!(v.is_empty());
        assert_eq!(table.lookup("INSTANCECOUNT"), Some("5"));
        assert_eq!(table.resolved().get("InstanceCount").map(String::as_str), Some("5"));
    }

    #[test]
    fn undeclared_override_is_violation() {
        let mut v = Violations::default();
        ParameterTable::new(&[], &overrides(&[("Nope", "1")]), &mut v);
        assert_eq!(v.len(), 1);
        assert_eq!(v.iter().next().unwrap().rule, Rule::UndeclaredParameter);
    }

    #[test]
    fn debug_parameter_accepted_but_not_composed() {
        let mut v = Violations::default();
        let table = ParameterTable::new(&[], &overrides(&[(DEBUG_PARAMETER, "x")]), &mut v);
        assert!(v.is_empty());
        assert!(table.resolved().is_empty());
    }

    #[test]
    fn duplicate_declaration_is_violation() {
        let decls = vec![
            ParameterDecl {
                name: "A".to_owned(),
                default_value: String::new(),
            },
            ParameterDecl {
                name: "a".to_owned(),
                default_value: String::new(),
            },
        ];
        let mut v = Violations::default();
        ParameterTable::new(&decls, &BTreeMap::new(), &mut v);
        assert_eq!(v.iter().next().unwrap().rule, Rule::DuplicateDefinition);
    }

    #[test]
    fn resolves_application_fields() {
        let mut app = parse_app(&app_manifest_toml("1.0", "[InstanceCount]", "[DnsName]"));
        let mut v = Violations::default();
        let table = resolve_application(
            &mut app,
            &overrides(&[("InstanceCount", "4"), ("DnsName", "shop.local")]),
            &mut v,
        );
        assert!(v.is_empty(), "{v:?}");
        let ds = &app.default_services[0];
        assert_eq!(ds.service.instance_count.as_deref(), Some("4"));
        assert_eq!(ds.service_dns_name.as_deref(), Some("shop.local"));
        assert_eq!(table.resolved().get("DnsName").map(String::as_str), Some("shop.local"));
    }

    #[test]
    fn undeclared_placeholder_is_violation() {
        let mut app = parse_app(&app_manifest_toml("1.0", "[Missing]", "svc"));
        let mut v = Violations::default();
        resolve_application(&mut app, &BTreeMap::new(), &mut v);
        let found: Vec<_> = v.iter().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule, Rule::UndeclaredParameter);
        assert!(found[0].element.contains("InstanceCount"));
    }

    #[test]
    fn parameter_round_trip_through_defaults() {
        let mut app = parse_app(&app_manifest_toml("1.0", "[InstanceCount]", "[DnsName]"));
        let mut v = Violations::default();
        resolve_application(&mut app, &BTreeMap::new(), &mut v);
        assert!(v.is_empty());
        assert_eq!(
            app.default_services[0].service.instance_count.as_deref(),
            Some("1")
        );
    }
}
