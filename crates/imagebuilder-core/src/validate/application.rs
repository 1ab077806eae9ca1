//! Rules spanning the whole application type.

use super::{find_duplicates, parse_bool, Rule, Violations};
use crate::digest::ServiceSource;
use imagebuilder_schema::{
    ApplicationManifest, HealthPolicy, PartitionScheme, ResourceKind, ServiceDescription,
    ServiceKind, ServiceTypeHealthPolicy,
};
use imagebuilder_store::validate_type_name;
use std::collections::{BTreeMap, HashSet};

const ACTIVATION_MODES: [&str; 2] = ["SharedProcess", "ExclusiveProcess"];
const MAX_DNS_LABEL: usize = 63;
const MAX_DNS_NAME: usize = 255;

/// Host-name syntax check for resolved service DNS names.
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_DNS_NAME {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_DNS_LABEL
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Rules that need every service at once; run after per-service rules.
pub fn validate_application_rules(
    app: &ApplicationManifest,
    services: &[ServiceSource],
    v: &mut Violations,
) {
    if let Err(e) = validate_type_name(&app.name) {
        v.push(Rule::InvalidValue, "ApplicationManifest/Name", e.to_string());
    }
    if app.service_manifest_imports.is_empty() {
        v.push(
            Rule::StructuralIncomplete,
            "ApplicationManifest",
            "application imports no service manifest",
        );
    }
    for dup in find_duplicates(
        app.service_manifest_imports
            .iter()
            .map(|i| i.service_manifest_ref.name.as_str()),
    ) {
        v.push(
            Rule::DuplicateDefinition,
            format!("ServiceManifestImport[{dup}]"),
            "service manifest is imported more than once",
        );
    }

    // service type name -> kind, across every imported service
    let mut types = BTreeMap::new();
    let mut seen = HashSet::new();
    for svc in services {
        for st in &svc.manifest.service_types {
            if !seen.insert(st.service_type_name.as_str()) {
                v.push(
                    Rule::DuplicateDefinition,
                    format!("ServiceType[{}]", st.service_type_name),
                    "service type is declared by more than one imported service",
                );
            }
            types.insert(st.service_type_name.as_str(), st.kind);
        }
    }

    check_principals(app, v);
    check_default_services(app, &types, v);
    check_templates(app, &types, v);
    if let Some(health) = &app.policies.health_policy {
        check_health_policy(health, v);
    }
    check_application_policies(app, v);
    check_certificates(app, v);
}

fn check_principals(app: &ApplicationManifest, v: &mut Violations) {
    let names = app
        .principals
        .users
        .iter()
        .map(|u| u.name.as_str())
        .chain(app.principals.groups.iter().map(|g| g.name.as_str()));
    for dup in find_duplicates(names) {
        v.push(
            Rule::DuplicateDefinition,
            format!("Principal[{dup}]"),
            "principal is declared more than once",
        );
    }
    for user in &app.principals.users {
        for group in &user.member_of {
            if !app.principals.groups.iter().any(|g| &g.name == group) {
                v.push(
                    Rule::DanglingReference,
                    format!("User[{}]", user.name),
                    format!("group '{group}' is not declared"),
                );
            }
        }
    }
}

fn check_default_services(
    app: &ApplicationManifest,
    types: &BTreeMap<&str, ServiceKind>,
    v: &mut Violations,
) {
    for dup in find_duplicates(app.default_services.iter().map(|d| d.name.as_str())) {
        v.push(
            Rule::DuplicateDefinition,
            format!("DefaultService[{dup}]"),
            "default service name is used more than once",
        );
    }

    let mut dns_names: BTreeMap<String, &str> = BTreeMap::new();
    for ds in &app.default_services {
        let element = format!("DefaultService[{}]", ds.name);
        check_description(&element, &ds.service, types, v);

        if let Some(mode) = &ds.service_package_activation_mode {
            if !ACTIVATION_MODES.iter().any(|m| m.eq_ignore_ascii_case(mode)) {
                v.push(
                    Rule::InvalidValue,
                    &element,
                    format!("activation mode '{mode}' is not supported"),
                );
            }
        }

        // an empty DNS name after resolution means none
        let Some(dns) = ds.service_dns_name.as_deref().filter(|d| !d.is_empty()) else {
            continue;
        };
        if !is_valid_dns_name(dns) {
            v.push(
                Rule::DnsName,
                &element,
                format!("'{dns}' is not a valid DNS name"),
            );
        }
        if let Some(first) = dns_names.insert(dns.to_ascii_lowercase(), ds.name.as_str()) {
            v.push(
                Rule::DnsName,
                &element,
                format!("DNS name '{dns}' is already used by default service '{first}'"),
            );
        }
    }
}

fn check_templates(
    app: &ApplicationManifest,
    types: &BTreeMap<&str, ServiceKind>,
    v: &mut Violations,
) {
    for dup in find_duplicates(
        app.service_templates
            .iter()
            .map(|t| t.service_type_name.as_str()),
    ) {
        v.push(
            Rule::DuplicateDefinition,
            format!("ServiceTemplate[{dup}]"),
            "service template is declared more than once",
        );
    }
    for template in &app.service_templates {
        let element = format!("ServiceTemplate[{}]", template.service_type_name);
        check_description(&element, template, types, v);
    }
}

/// Parse an optional numeric field; an empty value is missing, garbage is invalid.
fn number<T: std::str::FromStr>(
    element: &str,
    field: &str,
    value: Option<&str>,
    v: &mut Violations,
) -> Option<T> {
    let value = value?;
    if value.trim().is_empty() {
        v.push(
            Rule::MissingRequiredValue,
            element,
            format!("{field} is empty"),
        );
        return None;
    }
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            v.push(
                Rule::InvalidValue,
                element,
                format!("{field} '{value}' is not a number"),
            );
            None
        }
    }
}

fn check_description(
    element: &str,
    d: &ServiceDescription,
    types: &BTreeMap<&str, ServiceKind>,
    v: &mut Violations,
) {
    match types.get(d.service_type_name.as_str()) {
        None => v.push(
            Rule::DanglingReference,
            element,
            format!(
                "service type '{}' is not declared by any imported service",
                d.service_type_name
            ),
        ),
        Some(kind) if *kind != d.kind => v.push(
            Rule::InvalidValue,
            element,
            format!("service type '{}' is declared with another kind", d.service_type_name),
        ),
        Some(_) => {}
    }

    match d.kind {
        ServiceKind::Stateless => {
            if let Some(count) =
                number::<i64>(element, "InstanceCount", d.instance_count.as_deref(), v)
            {
                if count == -1 {
                    if !d.service_correlations.is_empty() {
                        v.push(
                            Rule::InvalidValue,
                            element,
                            "InstanceCount -1 cannot be combined with service correlations",
                        );
                    }
                } else if count < 1 {
                    v.push(
                        Rule::InvalidValue,
                        element,
                        format!("InstanceCount {count} must be at least 1 or -1"),
                    );
                }
            }
        }
        ServiceKind::Stateful => {
            let target = number::<i64>(
                element,
                "TargetReplicaSetSize",
                d.target_replica_set_size.as_deref(),
                v,
            );
            let min = number::<i64>(
                element,
                "MinReplicaSetSize",
                d.min_replica_set_size.as_deref(),
                v,
            );
            for (field, value, declared) in [
                ("TargetReplicaSetSize", target, &d.target_replica_set_size),
                ("MinReplicaSetSize", min, &d.min_replica_set_size),
            ] {
                if declared.is_none() {
                    v.push(
                        Rule::MissingRequiredValue,
                        element,
                        format!("{field} is required for stateful services"),
                    );
                } else if value.is_some_and(|n| n < 1) {
                    v.push(
                        Rule::InvalidValue,
                        element,
                        format!("{field} must be positive"),
                    );
                }
            }
            if let (Some(t), Some(m)) = (target, min) {
                if m > t {
                    v.push(
                        Rule::InvalidValue,
                        element,
                        format!("MinReplicaSetSize {m} exceeds TargetReplicaSetSize {t}"),
                    );
                }
            }
        }
    }

    for (field, value) in [
        (
            "ReplicaRestartWaitDuration",
            &d.replica_restart_wait_duration_seconds,
        ),
        ("QuorumLossWaitDuration", &d.quorum_loss_wait_duration_seconds),
        (
            "StandByReplicaKeepDuration",
            &d.stand_by_replica_keep_duration_seconds,
        ),
    ] {
        if number::<i64>(element, field, value.as_deref(), v).is_some_and(|n| n < 0) {
            v.push(
                Rule::InvalidValue,
                element,
                format!("{field} must not be negative"),
            );
        }
    }

    check_partition(element, d, v);

    if d.service_correlations.len() > 1 {
        v.push(
            Rule::InvalidValue,
            element,
            "at most one service correlation is allowed",
        );
    }
    if d
        .service_correlations
        .iter()
        .any(|c| c.service_name.trim().is_empty())
    {
        v.push(
            Rule::MissingRequiredValue,
            element,
            "service correlation has no service name",
        );
    }
}

fn check_partition(element: &str, d: &ServiceDescription, v: &mut Violations) {
    let p = &d.partition;
    match p.scheme {
        PartitionScheme::Singleton => {}
        PartitionScheme::UniformInt64 => {
            for (field, value) in [
                ("PartitionCount", &p.partition_count),
                ("LowKey", &p.low_key),
                ("HighKey", &p.high_key),
            ] {
                if value.is_none() {
                    v.push(
                        Rule::MissingRequiredValue,
                        element,
                        format!("{field} is required for uniform partitions"),
                    );
                }
            }
            let count = number::<i64>(element, "PartitionCount", p.partition_count.as_deref(), v);
            let low = number::<i64>(element, "LowKey", p.low_key.as_deref(), v);
            let high = number::<i64>(element, "HighKey", p.high_key.as_deref(), v);
            if let (Some(low), Some(high)) = (low, high) {
                if low > high {
                    v.push(
                        Rule::InvalidValue,
                        element,
                        format!("LowKey {low} exceeds HighKey {high}"),
                    );
                } else if let Some(count) = count {
                    let range = i128::from(high) - i128::from(low) + 1;
                    if count < 1 || i128::from(count) > range {
                        v.push(
                            Rule::InvalidValue,
                            element,
                            format!("PartitionCount {count} does not fit the key range"),
                        );
                    }
                }
            }
        }
        PartitionScheme::Named => {
            if p.names.is_empty() {
                v.push(
                    Rule::StructuralIncomplete,
                    element,
                    "named partition scheme declares no names",
                );
            }
            if p.names.iter().any(|n| n.trim().is_empty()) {
                v.push(
                    Rule::StructuralIncomplete,
                    element,
                    "partition name is empty",
                );
            }
            for dup in find_duplicates(p.names.iter().map(String::as_str)) {
                v.push(
                    Rule::DuplicateDefinition,
                    element,
                    format!("partition name '{dup}' is used more than once"),
                );
            }
        }
    }
}

fn check_percent(element: &str, field: &str, value: &Option<String>, v: &mut Violations) {
    if let Some(n) = number::<i64>(element, field, value.as_deref(), v) {
        if !(0..=100).contains(&n) {
            v.push(
                Rule::InvalidValue,
                element,
                format!("{field} {n} is outside 0..=100"),
            );
        }
    }
}

fn check_type_health(element: &str, p: &ServiceTypeHealthPolicy, v: &mut Violations) {
    check_percent(
        element,
        "MaxPercentUnhealthyServices",
        &p.max_percent_unhealthy_services,
        v,
    );
    check_percent(
        element,
        "MaxPercentUnhealthyPartitionsPerService",
        &p.max_percent_unhealthy_partitions_per_service,
        v,
    );
    check_percent(
        element,
        "MaxPercentUnhealthyReplicasPerPartition",
        &p.max_percent_unhealthy_replicas_per_partition,
        v,
    );
}

fn check_health_policy(h: &HealthPolicy, v: &mut Violations) {
    let element = "Policies/HealthPolicy";
    if let Some(flag) = &h.consider_warning_as_error {
        if parse_bool(flag).is_none() {
            v.push(
                Rule::InvalidValue,
                element,
                format!("ConsiderWarningAsError '{flag}' is not a boolean"),
            );
        }
    }
    check_percent(
        element,
        "MaxPercentUnhealthyDeployedApplications",
        &h.max_percent_unhealthy_deployed_applications,
        v,
    );
    if let Some(default) = &h.default_service_type_health_policy {
        check_type_health(&format!("{element}/Default"), default, v);
    }
    for dup in find_duplicates(
        h.service_type_health_policies
            .iter()
            .filter_map(|p| p.service_type_name.as_deref()),
    ) {
        v.push(
            Rule::DuplicateDefinition,
            format!("{element}/ServiceTypeHealthPolicy[{dup}]"),
            "service type health policy is declared more than once",
        );
    }
    for p in &h.service_type_health_policies {
        let name = p.service_type_name.as_deref().unwrap_or_default();
        check_type_health(&format!("{element}/ServiceTypeHealthPolicy[{name}]"), p, v);
    }
}

fn check_application_policies(app: &ApplicationManifest, v: &mut Violations) {
    if let Some(user) = &app.policies.default_run_as {
        if !app.principals.has_principal(user) {
            v.push(
                Rule::DanglingReference,
                "Policies/DefaultRunAs",
                format!("principal '{user}' is not declared"),
            );
        }
    }
    for sap in &app.policies.security_access_policies {
        let element = format!("Policies/SecurityAccessPolicy[{}]", sap.resource_ref);
        if !app.principals.has_principal(&sap.principal_ref) {
            v.push(
                Rule::DanglingReference,
                &element,
                format!("principal '{}' is not declared", sap.principal_ref),
            );
        }
        let is_secret = sap.resource_type == ResourceKind::Certificate
            && app
                .certificates
                .secrets_certificates
                .iter()
                .any(|c| c.name == sap.resource_ref);
        if !is_secret {
            v.push(
                Rule::DanglingReference,
                &element,
                "application security access must target a secrets certificate",
            );
        }
    }
}

fn check_certificates(app: &ApplicationManifest, v: &mut Violations) {
    let certs = &app.certificates;
    for (kind, list) in [
        ("EndpointCertificate", &certs.endpoint_certificates),
        ("SecretsCertificate", &certs.secrets_certificates),
    ] {
        for dup in find_duplicates(list.iter().map(|c| c.name.as_str())) {
            v.push(
                Rule::DuplicateDefinition,
                format!("{kind}[{dup}]"),
                "certificate is declared more than once",
            );
        }
        for cert in list {
            if cert.x509_find_value.trim().is_empty() {
                v.push(
                    Rule::MissingRequiredValue,
                    format!("{kind}[{}]", cert.name),
                    "certificate has no find value",
                );
            }
        }
    }
}
