use super::{find_duplicates, parse_bool, Rule, Violations};
use crate::digest::ServiceSource;
use imagebuilder_schema::{
    ApplicationManifest, ContainerHostPolicy, EndpointBindingPolicy, EntryPoint, EntryPointKind,
    PackageKind, PackageSharingPolicy, Protocol, ResourceKind, RunAsPolicy,
    SecurityAccessPolicy, ServicePolicy, WorkFolder,
};

const ISOLATION_MODES: [&str; 3] = ["process", "hyperv", "default"];

pub(super) fn validate_policies(
    app: &ApplicationManifest,
    src: &ServiceSource,
    scope: &str,
    v: &mut Violations,
) {
    let mut run_as = Vec::new();
    let mut bindings = Vec::new();
    let mut sharing = Vec::new();
    let mut hosts = Vec::new();

    for policy in &src.import.policies {
        let element = format!("{scope}/{}", policy.kind_name());
        match policy {
            ServicePolicy::RunAs(p) => {
                check_run_as(app, src, p, &element, v);
                run_as.push(p);
            }
            ServicePolicy::SecurityAccess(p) => check_security_access(app, src, p, &element, v),
            ServicePolicy::EndpointBinding(p) => {
                check_endpoint_binding(app, src, p, &element, v);
                bindings.push(p.endpoint_ref.as_str());
            }
            ServicePolicy::PackageSharing(p) => {
                check_package_sharing(src, p, &element, v);
                sharing.extend(p.package_ref.as_deref());
            }
            ServicePolicy::ContainerHost(p) => {
                check_container_host(src, p, &element, v);
                hosts.push(p.code_package_ref.as_str());
            }
        }
    }

    check_run_as_conflicts(&run_as, scope, v);
    for dup in find_duplicates(bindings) {
        v.push(
            Rule::DuplicateDefinition,
            format!("{scope}/EndpointBindingPolicy[{dup}]"),
            "endpoint is bound more than once",
        );
    }
    for dup in find_duplicates(sharing) {
        v.push(
            Rule::DuplicateDefinition,
            format!("{scope}/PackageSharingPolicy[{dup}]"),
            "package is shared by more than one policy",
        );
    }
    for dup in find_duplicates(hosts) {
        v.push(
            Rule::DuplicateDefinition,
            format!("{scope}/ContainerHostPolicy[{dup}]"),
            "code package has more than one container host policy",
        );
    }
}

fn check_run_as(
    app: &ApplicationManifest,
    src: &ServiceSource,
    p: &RunAsPolicy,
    element: &str,
    v: &mut Violations,
) {
    match src.manifest.code_package(&p.code_package_ref) {
        None => v.push(
            Rule::DanglingReference,
            element,
            format!("code package '{}' is not declared", p.code_package_ref),
        ),
        Some(cp)
            if p.entry_point_type == EntryPointKind::Setup && cp.setup_entry_point.is_none() =>
        {
            v.push(
                Rule::StructuralIncomplete,
                element,
                format!("code package '{}' has no setup entry point", cp.name),
            );
        }
        Some(_) => {}
    }
    if !app.principals.has_principal(&p.user_ref) {
        v.push(
            Rule::DanglingReference,
            element,
            format!("principal '{}' is not declared", p.user_ref),
        );
    }
}

fn check_run_as_conflicts(policies: &[&RunAsPolicy], scope: &str, v: &mut Violations) {
    for (i, a) in policies.iter().enumerate() {
        for b in &policies[i + 1..] {
            if a.code_package_ref != b.code_package_ref {
                continue;
            }
            let clash = a.entry_point_type == b.entry_point_type
                || a.entry_point_type == EntryPointKind::All
                || b.entry_point_type == EntryPointKind::All;
            if clash {
                v.push(
                    Rule::PolicyConflict,
                    format!("{scope}/RunAsPolicy[{}]", a.code_package_ref),
                    format!(
                        "run-as for entry point '{}' overlaps run-as for '{}'",
                        a.entry_point_type, b.entry_point_type
                    ),
                );
            }
        }
    }
}

fn check_security_access(
    app: &ApplicationManifest,
    src: &ServiceSource,
    p: &SecurityAccessPolicy,
    element: &str,
    v: &mut Violations,
) {
    if !app.principals.has_principal(&p.principal_ref) {
        v.push(
            Rule::DanglingReference,
            element,
            format!("principal '{}' is not declared", p.principal_ref),
        );
    }
    let resolves = match p.resource_type {
        ResourceKind::Endpoint => src.manifest.endpoint(&p.resource_ref).is_some(),
        ResourceKind::Certificate => app
            .certificates
            .secrets_certificates
            .iter()
            .any(|c| c.name == p.resource_ref),
    };
    if !resolves {
        v.push(
            Rule::DanglingReference,
            element,
            format!("resource '{}' is not declared", p.resource_ref),
        );
    }
}

fn check_endpoint_binding(
    app: &ApplicationManifest,
    src: &ServiceSource,
    p: &EndpointBindingPolicy,
    element: &str,
    v: &mut Violations,
) {
    if !app
        .certificates
        .endpoint_certificates
        .iter()
        .any(|c| c.name == p.certificate_ref)
    {
        v.push(
            Rule::DanglingReference,
            element,
            format!("endpoint certificate '{}' is not declared", p.certificate_ref),
        );
    }
    let Some(endpoint) = src.manifest.endpoint(&p.endpoint_ref) else {
        v.push(
            Rule::DanglingReference,
            element,
            format!("endpoint '{}' is not declared", p.endpoint_ref),
        );
        return;
    };
    // the last parseable override wins, as in composition
    let overridden = src
        .import
        .endpoint_overrides
        .iter()
        .rev()
        .filter(|o| o.name == endpoint.name)
        .find_map(|o| o.protocol.as_deref()?.trim().parse::<Protocol>().ok());
    let effective = overridden.unwrap_or(endpoint.protocol);
    // an https endpoint overridden to another protocol drops its binding
    let dropped = endpoint.protocol == Protocol::Https && overridden.is_some();
    if effective != Protocol::Https && !dropped {
        v.push(
            Rule::PolicyConflict,
            element,
            format!(
                "endpoint '{}' uses {effective} and cannot take a certificate binding",
                endpoint.name
            ),
        );
    }
}

fn check_package_sharing(
    src: &ServiceSource,
    p: &PackageSharingPolicy,
    element: &str,
    v: &mut Violations,
) {
    match (&p.package_ref, &p.scope) {
        (Some(_), Some(_)) => v.push(
            Rule::PolicyConflict,
            element,
            "package_ref and scope are mutually exclusive",
        ),
        (None, None) => v.push(
            Rule::PolicyConflict,
            element,
            "one of package_ref or scope is required",
        ),
        (Some(name), None) => {
            let Some((kind, _, _)) = src.manifest.packages().find(|(_, n, _)| n == name) else {
                v.push(
                    Rule::DanglingReference,
                    element,
                    format!("package '{name}' is not declared"),
                );
                return;
            };
            if kind == PackageKind::Code {
                check_shared_code_folder(src, name, element, v);
            }
        }
        (None, Some(_)) => {
            for cp in &src.manifest.code_packages {
                if crate::digest::is_shared(&src.import.policies, PackageKind::Code, &cp.name) {
                    check_shared_code_folder(src, &cp.name, element, v);
                }
            }
        }
    }
}

fn check_shared_code_folder(src: &ServiceSource, name: &str, element: &str, v: &mut Violations) {
    let Some(cp) = src.manifest.code_package(name) else {
        return;
    };
    if let EntryPoint::ExeHost(host) = &cp.entry_point {
        if host.working_folder != WorkFolder::Work {
            v.push(
                Rule::PolicyConflict,
                element,
                format!("shared code package '{name}' cannot use a package working folder"),
            );
        }
    }
}

fn check_container_host(
    src: &ServiceSource,
    p: &ContainerHostPolicy,
    element: &str,
    v: &mut Violations,
) {
    match src.manifest.code_package(&p.code_package_ref) {
        None => v.push(
            Rule::DanglingReference,
            element,
            format!("code package '{}' is not declared", p.code_package_ref),
        ),
        Some(cp) if !cp.is_container() => v.push(
            Rule::PolicyConflict,
            element,
            format!("code package '{}' is not container hosted", cp.name),
        ),
        Some(_) => {}
    }

    if let Some(isolation) = &p.isolation {
        let isolation = isolation.trim();
        if !isolation.is_empty()
            && !ISOLATION_MODES
                .iter()
                .any(|m| m.eq_ignore_ascii_case(isolation))
        {
            v.push(
                Rule::PolicyConflict,
                element,
                format!("isolation mode '{isolation}' is not supported"),
            );
        }
    }

    for opt in &p.driver_options {
        if let Some(flag) = &opt.is_encrypted {
            if parse_bool(flag).is_none() {
                v.push(
                    Rule::InvalidValue,
                    format!("{element}/DriverOption[{}]", opt.name),
                    format!("is_encrypted '{flag}' is not a boolean"),
                );
            }
        }
    }

    for binding in &p.port_bindings {
        if src.manifest.endpoint(&binding.endpoint_ref).is_none() {
            v.push(
                Rule::DanglingReference,
                format!("{element}/PortBinding[{}]", binding.endpoint_ref),
                "endpoint is not declared",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{app_manifest_toml, fixture_service_source, parse_app};
    use crate::validate::{validate_service, Rule};
    use imagebuilder_schema::{
        ContainerHostPolicy, DriverOption, EndpointBindingPolicy, EndpointOverride,
        EntryPointKind, PackageSharingPolicy, RunAsPolicy, ServicePolicy, SharingScope,
    };

    fn run(policies: Vec<ServicePolicy>) -> Vec<Rule> {
        let app = parse_app(&app_manifest_toml("1.0", "1", "shop.local"));
        let mut src = fixture_service_source();
        src.import.policies.extend(policies);
        validate_service(&app, &src).iter().map(|v| v.rule).collect()
    }

    fn run_as(cp: &str, user: &str, ep: EntryPointKind) -> ServicePolicy {
        ServicePolicy::RunAs(RunAsPolicy {
            code_package_ref: cp.to_owned(),
            user_ref: user.to_owned(),
            entry_point_type: ep,
        })
    }

    #[test]
    fn run_as_all_conflicts_with_main() {
        // fixture already carries a main run-as for Code
        assert_eq!(
            run(vec![run_as("Code", "Svc", EntryPointKind::All)]),
            vec![Rule::PolicyConflict]
        );
    }

    #[test]
    fn run_as_unknown_principal_is_dangling() {
        assert_eq!(
            run(vec![run_as("Sidecar", "Ghost", EntryPointKind::Main)]),
            vec![Rule::DanglingReference]
        );
    }

    #[test]
    fn setup_run_as_without_setup_entry_point() {
        assert_eq!(
            run(vec![run_as("Sidecar", "Svc", EntryPointKind::Setup)]),
            vec![Rule::StructuralIncomplete]
        );
    }

    #[test]
    fn sharing_scope_and_ref_are_exclusive() {
        let both = ServicePolicy::PackageSharing(PackageSharingPolicy {
            package_ref: Some("Config".to_owned()),
            scope: Some(SharingScope::Config),
        });
        let neither = ServicePolicy::PackageSharing(PackageSharingPolicy::default());
        assert_eq!(
            run(vec![both, neither]),
            vec![Rule::PolicyConflict, Rule::PolicyConflict]
        );
    }

    #[test]
    fn sharing_unknown_package_is_dangling() {
        let p = ServicePolicy::PackageSharing(PackageSharingPolicy {
            package_ref: Some("Nope".to_owned()),
            scope: None,
        });
        assert_eq!(run(vec![p]), vec![Rule::DanglingReference]);
    }

    #[test]
    fn binding_to_non_https_endpoint_conflicts() {
        let p = ServicePolicy::EndpointBinding(EndpointBindingPolicy {
            endpoint_ref: "Internal".to_owned(),
            certificate_ref: "TlsCert".to_owned(),
        });
        assert_eq!(run(vec![p]), vec![Rule::PolicyConflict]);
    }

    #[test]
    fn binding_allowed_when_protocol_overridden() {
        let app = parse_app(&app_manifest_toml("1.0", "1", "shop.local"));
        let mut src = fixture_service_source();
        src.import.endpoint_overrides.push(EndpointOverride {
            name: "Web".to_owned(),
            protocol: Some("http".to_owned()),
            ..Default::default()
        });
        assert!(validate_service(&app, &src).is_empty());
    }

    #[test]
    fn binding_follows_overridden_protocol() {
        let app = parse_app(&app_manifest_toml("1.0", "1", "shop.local"));
        let binding = ServicePolicy::EndpointBinding(EndpointBindingPolicy {
            endpoint_ref: "Internal".to_owned(),
            certificate_ref: "TlsCert".to_owned(),
        });
        let with_override = |protocol: &str| {
            let mut src = fixture_service_source();
            src.import.policies.push(binding.clone());
            src.import.endpoint_overrides.push(EndpointOverride {
                name: "Internal".to_owned(),
                protocol: Some(protocol.to_owned()),
                ..Default::default()
            });
            validate_service(&app, &src)
                .iter()
                .map(|v| v.rule)
                .collect::<Vec<_>>()
        };
        assert_eq!(with_override("udp"), vec![Rule::PolicyConflict]);
        assert!(with_override("https").is_empty());
    }

    #[test]
    fn binding_unknown_certificate_is_dangling() {
        let p = ServicePolicy::EndpointBinding(EndpointBindingPolicy {
            endpoint_ref: "Web".to_owned(),
            certificate_ref: "Missing".to_owned(),
        });
        // second binding of Web is also a duplicate
        assert_eq!(
            run(vec![p]),
            vec![Rule::DanglingReference, Rule::DuplicateDefinition]
        );
    }

    #[test]
    fn container_host_rules() {
        let on_exe = ServicePolicy::ContainerHost(ContainerHostPolicy {
            code_package_ref: "Code".to_owned(),
            isolation: None,
            driver_options: vec![],
            port_bindings: vec![],
        });
        let bad_isolation = ServicePolicy::ContainerHost(ContainerHostPolicy {
            code_package_ref: "Sidecar".to_owned(),
            isolation: Some("vm".to_owned()),
            driver_options: vec![DriverOption {
                name: "opt".to_owned(),
                value: "v".to_owned(),
                is_encrypted: Some("nah".to_owned()),
            }],
            port_bindings: vec![],
        });
        assert_eq!(
            run(vec![on_exe, bad_isolation]),
            vec![Rule::PolicyConflict, Rule::PolicyConflict, Rule::InvalidValue]
        );
    }

    #[test]
    fn hyperv_isolation_accepted() {
        let p = ServicePolicy::ContainerHost(ContainerHostPolicy {
            code_package_ref: "Sidecar".to_owned(),
            isolation: Some("HyperV".to_owned()),
            driver_options: vec![],
            port_bindings: vec![],
        });
        assert!(run(vec![p]).is_empty());
    }
}
