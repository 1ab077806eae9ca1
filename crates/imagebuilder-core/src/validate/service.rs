//! Rules scoped to one imported service.

use super::policies::validate_policies;
use super::{find_duplicates, parse_bool, Rule, Violations};
use crate::digest::ServiceSource;
use imagebuilder_schema::{
    ApplicationManifest, EndpointType, EntryPoint, PackageKind, Protocol, ServicePolicy,
};

/// Validate one service against its import, returning what it found.
pub fn validate_service(app: &ApplicationManifest, src: &ServiceSource) -> Violations {
    let mut v = Violations::default();
    let scope = format!("Service[{}]", src.manifest.name);

    check_manifest_ref(src, &scope, &mut v);
    check_structure(src, &scope, &mut v);
    check_uniqueness(src, &scope, &mut v);
    check_endpoints(src, &scope, &mut v);
    check_config_overrides(src, &scope, &mut v);
    check_environment_overrides(src, &scope, &mut v);
    check_endpoint_overrides(src, &scope, &mut v);
    validate_policies(app, src, &scope, &mut v);
    check_encryption(app, src, &scope, &mut v);
    v
}

fn check_manifest_ref(src: &ServiceSource, scope: &str, v: &mut Violations) {
    let r = &src.import.service_manifest_ref;
    if r.name != src.manifest.name || r.version != src.manifest.version {
        v.push(
            Rule::DanglingReference,
            scope,
            format!(
                "import references {}:{} but the service manifest is {}:{}",
                r.name, r.version, src.manifest.name, src.manifest.version
            ),
        );
    }
}

fn check_structure(src: &ServiceSource, scope: &str, v: &mut Violations) {
    let m = &src.manifest;
    if m.code_packages.is_empty() {
        v.push(
            Rule::StructuralIncomplete,
            scope,
            "service declares no code package",
        );
    }
    if m.service_types.is_empty() {
        v.push(
            Rule::StructuralIncomplete,
            scope,
            "service declares no service type",
        );
    }
    for cp in &m.code_packages {
        let element = format!("{scope}/CodePackage[{}]", cp.name);
        if let Some(setup) = &cp.setup_entry_point {
            if setup.program.trim().is_empty() {
                v.push(
                    Rule::StructuralIncomplete,
                    &element,
                    "setup entry point has no program",
                );
            }
        }
        match &cp.entry_point {
            EntryPoint::ExeHost(host) if host.program.trim().is_empty() => v.push(
                Rule::StructuralIncomplete,
                &element,
                "entry point has no program",
            ),
            EntryPoint::ContainerHost(host) if host.image_name.trim().is_empty() => v.push(
                Rule::StructuralIncomplete,
                &element,
                "container entry point has no image name",
            ),
            _ => {}
        }
    }
}

fn check_uniqueness(src: &ServiceSource, scope: &str, v: &mut Violations) {
    let m = &src.manifest;
    for kind in [PackageKind::Code, PackageKind::Config, PackageKind::Data] {
        let names = m.packages().filter(|(k, _, _)| *k == kind).map(|(_, n, _)| n);
        for dup in find_duplicates(names) {
            v.push(
                Rule::DuplicateDefinition,
                format!("{scope}/Package[{dup}]"),
                format!("{kind} package is declared more than once"),
            );
        }
    }
    for dup in find_duplicates(m.service_types.iter().map(|t| t.service_type_name.as_str())) {
        v.push(
            Rule::DuplicateDefinition,
            format!("{scope}/ServiceType[{dup}]"),
            "service type is declared more than once",
        );
    }
    for dup in find_duplicates(m.resources.endpoints.iter().map(|e| e.name.as_str())) {
        v.push(
            Rule::DuplicateDefinition,
            format!("{scope}/Endpoint[{dup}]"),
            "endpoint is declared more than once",
        );
    }
    for cp in &m.code_packages {
        for dup in find_duplicates(cp.environment_variables.iter().map(|e| e.name.as_str())) {
            v.push(
                Rule::DuplicateDefinition,
                format!("{scope}/CodePackage[{}]/EnvironmentVariable[{dup}]", cp.name),
                "environment variable is declared more than once",
            );
        }
    }
    for (package, settings) in &src.settings {
        for dup in find_duplicates(settings.sections.iter().map(|s| s.name.as_str())) {
            v.push(
                Rule::DuplicateDefinition,
                format!("{scope}/ConfigPackage[{package}]/Section[{dup}]"),
                "settings section is declared more than once",
            );
        }
        for section in &settings.sections {
            for dup in find_duplicates(section.parameters.iter().map(|p| p.name.as_str())) {
                v.push(
                    Rule::DuplicateDefinition,
                    format!(
                        "{scope}/ConfigPackage[{package}]/Section[{}]/Parameter[{dup}]",
                        section.name
                    ),
                    "settings parameter is declared more than once",
                );
            }
        }
    }
}

fn check_endpoints(src: &ServiceSource, scope: &str, v: &mut Violations) {
    for ep in &src.manifest.resources.endpoints {
        let element = format!("{scope}/Endpoint[{}]", ep.name);
        if let Some(cp) = &ep.code_package_ref {
            if src.manifest.code_package(cp).is_none() {
                v.push(
                    Rule::DanglingReference,
                    &element,
                    format!("code package '{cp}' is not declared"),
                );
            }
        }
        if let Some(port) = ep.port {
            if port > u32::from(u16::MAX) {
                v.push(
                    Rule::InvalidValue,
                    &element,
                    format!("port {port} is out of range"),
                );
            }
        }
    }
}

fn check_config_overrides(src: &ServiceSource, scope: &str, v: &mut Violations) {
    for dup in find_duplicates(src.import.config_overrides.iter().map(|c| c.name.as_str())) {
        v.push(
            Rule::DuplicateDefinition,
            format!("{scope}/ConfigOverride[{dup}]"),
            "config package is overridden more than once",
        );
    }

    for co in &src.import.config_overrides {
        let element = format!("{scope}/ConfigOverride[{}]", co.name);
        if src.manifest.config_package(&co.name).is_none() {
            v.push(
                Rule::DanglingReference,
                &element,
                "config package is not declared by the service",
            );
            continue;
        }
        let Some(settings) = src.settings.get(&co.name) else {
            continue;
        };
        for so in &co.sections {
            let Some(section) = settings.section(&so.name) else {
                v.push(
                    Rule::DanglingReference,
                    format!("{element}/Section[{}]", so.name),
                    "section is not defined in the package settings",
                );
                continue;
            };
            for po in &so.parameters {
                let param_element = format!("{element}/{}/{}", so.name, po.name);
                let Some(declared) = section.parameter(&po.name) else {
                    v.push(
                        Rule::DanglingReference,
                        &param_element,
                        "parameter is not defined in the package settings",
                    );
                    continue;
                };
                // overrides are resolved here, so a placeholder that produced "" counts
                let encrypted = declared.is_encrypted
                    || po.is_encrypted.as_deref().and_then(parse_bool) == Some(true);
                if (declared.must_override || encrypted) && po.value.trim().is_empty() {
                    v.push(
                        Rule::MissingRequiredValue,
                        &param_element,
                        "required setting resolves to an empty value",
                    );
                }
                if let Some(flag) = &po.is_encrypted {
                    match parse_bool(flag) {
                        Some(false) if declared.is_encrypted => v.push(
                            Rule::EncryptionIncoherent,
                            &param_element,
                            "encrypted setting overridden with a plain value",
                        ),
                        Some(_) => {}
                        None => v.push(
                            Rule::InvalidValue,
                            &param_element,
                            format!("is_encrypted '{flag}' is not a boolean"),
                        ),
                    }
                }
            }
        }
    }

    for (package, settings) in &src.settings {
        for section in &settings.sections {
            for param in section.parameters.iter().filter(|p| p.must_override) {
                let overridden = src
                    .import
                    .config_overrides
                    .iter()
                    .filter(|co| &co.name == package)
                    .flat_map(|co| &co.sections)
                    .filter(|so| so.name == section.name)
                    .flat_map(|so| &so.parameters)
                    .any(|po| po.name == param.name);
                if !overridden {
                    v.push(
                        Rule::MissingRequiredValue,
                        format!("{scope}/ConfigPackage[{package}]/{}/{}", section.name, param.name),
                        "setting must be overridden by the application",
                    );
                }
            }
        }
    }
}

fn check_environment_overrides(src: &ServiceSource, scope: &str, v: &mut Violations) {
    for eo in &src.import.environment_overrides {
        let element = format!("{scope}/EnvironmentOverrides[{}]", eo.code_package_ref);
        let Some(cp) = src.manifest.code_package(&eo.code_package_ref) else {
            v.push(
                Rule::DanglingReference,
                &element,
                "code package is not declared by the service",
            );
            continue;
        };
        for var in &eo.variables {
            if !cp.environment_variables.iter().any(|d| d.name == var.name) {
                v.push(
                    Rule::DanglingReference,
                    format!("{element}/{}", var.name),
                    "environment variable is not declared by the code package",
                );
            }
        }
    }
}

fn check_endpoint_overrides(src: &ServiceSource, scope: &str, v: &mut Violations) {
    for eo in &src.import.endpoint_overrides {
        let element = format!("{scope}/EndpointOverride[{}]", eo.name);
        if src.manifest.endpoint(&eo.name).is_none() {
            v.push(
                Rule::DanglingReference,
                &element,
                "endpoint is not declared by the service",
            );
            continue;
        }
        if let Some(protocol) = &eo.protocol {
            check_override_value(&element, "protocol", protocol, v, |s| {
                s.parse::<Protocol>().is_ok()
            });
        }
        if let Some(port) = &eo.port {
            check_override_value(&element, "port", port, v, |s| s.parse::<u16>().is_ok());
        }
        if let Some(kind) = &eo.endpoint_type {
            check_override_value(&element, "endpoint_type", kind, v, |s| {
                s.parse::<EndpointType>().is_ok()
            });
        }
    }
}

fn check_override_value(
    element: &str,
    attribute: &str,
    value: &str,
    v: &mut Violations,
    valid: impl Fn(&str) -> bool,
) {
    if value.trim().is_empty() {
        v.push(
            Rule::MissingRequiredValue,
            element,
            format!("{attribute} override is empty"),
        );
    } else if !valid(value.trim()) {
        v.push(
            Rule::InvalidValue,
            element,
            format!("{attribute} override '{value}' is not valid"),
        );
    }
}

/// Encrypted values need a secrets certificate unless every run-as identity
/// of the service is a system account.
fn check_encryption(
    app: &ApplicationManifest,
    src: &ServiceSource,
    scope: &str,
    v: &mut Violations,
) {
    let overrides_encrypted = src
        .import
        .config_overrides
        .iter()
        .flat_map(|co| &co.sections)
        .flat_map(|so| &so.parameters)
        .any(|po| po.is_encrypted.as_deref().and_then(parse_bool) == Some(true));
    let settings_encrypted = src
        .settings
        .values()
        .flat_map(|s| &s.sections)
        .flat_map(|s| &s.parameters)
        .any(|p| p.is_encrypted);
    let driver_encrypted = src.import.policies.iter().any(|p| match p {
        ServicePolicy::ContainerHost(ch) => ch
            .driver_options
            .iter()
            .any(|o| o.is_encrypted.as_deref().and_then(parse_bool) == Some(true)),
        _ => false,
    });
    if !(overrides_encrypted || settings_encrypted || driver_encrypted) {
        return;
    }
    if !app.certificates.secrets_certificates.is_empty() {
        return;
    }

    let run_as: Vec<_> = src
        .import
        .policies
        .iter()
        .filter_map(|p| match p {
            ServicePolicy::RunAs(r) => Some(r),
            _ => None,
        })
        .collect();
    let all_system = !run_as.is_empty()
        && run_as.iter().all(|r| {
            app.principals
                .user(&r.user_ref)
                .is_some_and(|u| u.account_type.is_system())
        });
    if !all_system {
        v.push(
            Rule::EncryptionIncoherent,
            scope,
            "encrypted values require a secrets certificate",
        );
    }
}
