//! Manifest fixtures shared by unit tests.

use crate::digest::ServiceSource;
use crate::validate::Violations;
use imagebuilder_schema::{
    checksum_bytes, parse_application_manifest_str, parse_service_manifest_str,
    parse_settings_str, ApplicationManifest, PackageKind,
};
use std::collections::BTreeMap;
use std::path::Path;

pub(crate) const SETTINGS_TOML: &str = r#"
[[sections]]
name = "Db"

[[sections.parameters]]
name = "ConnectionString"
value = "server=local"

[[sections.parameters]]
name = "Password"
must_override = true
"#;

/// `ShopType` importing `FrontEnd`, with placeholders where callers want them.
pub(crate) fn app_manifest_toml_for(
    version: &str,
    service_version: &str,
    instance_count: &str,
    dns_name: &str,
) -> String {
    format!(
        r#"
name = "ShopType"
version = "{version}"

[[parameters]]
name = "InstanceCount"
default_value = "1"

[[parameters]]
name = "DnsName"
default_value = "shop.local"

[[parameters]]
name = "DbPassword"
default_value = "s3cret"

[[service_manifest_imports]]
service_manifest_ref = {{ name = "FrontEnd", version = "{service_version}" }}

[[service_manifest_imports.config_overrides]]
name = "Config"

[[service_manifest_imports.config_overrides.sections]]
name = "Db"
parameters = [{{ name = "Password", value = "[DbPassword]" }}]

[[service_manifest_imports.environment_overrides]]
code_package_ref = "Code"
variables = [{{ name = "MODE", value = "staging" }}]

[[service_manifest_imports.policies]]
kind = "run_as"
code_package_ref = "Code"
user_ref = "Svc"

[[service_manifest_imports.policies]]
kind = "endpoint_binding"
endpoint_ref = "Web"
certificate_ref = "TlsCert"

[[default_services]]
name = "Front"
service_dns_name = "{dns_name}"

[default_services.service]
service_type_name = "FrontEndType"
kind = "stateless"
instance_count = "{instance_count}"

[[principals.users]]
name = "Svc"
account_type = "LocalSystem"

[[certificates.endpoint_certificates]]
name = "TlsCert"
x509_find_value = "ab12cd34"
"#
    )
}

pub(crate) fn app_manifest_toml(version: &str, instance_count: &str, dns_name: &str) -> String {
    app_manifest_toml_for(version, "1.0", instance_count, dns_name)
}

pub(crate) fn service_manifest_toml(version: &str, code_version: &str) -> String {
    format!(
        r#"
name = "FrontEnd"
version = "{version}"

[[service_types]]
service_type_name = "FrontEndType"
kind = "stateless"

[[code_packages]]
name = "Code"
version = "{code_version}"

[code_packages.entry_point]
kind = "exe_host"
program = "frontend.exe"

[[code_packages.environment_variables]]
name = "MODE"
value = "prod"

[[code_packages.environment_variables]]
name = "LOG_LEVEL"
value = "info"

[[code_packages]]
name = "Sidecar"
version = "1.0"

[code_packages.entry_point]
kind = "container_host"
image_name = "registry/sidecar:1"

[[config_packages]]
name = "Config"
version = "1.0"

[[data_packages]]
name = "Data"
version = "1.0"

[[resources.endpoints]]
name = "Web"
protocol = "https"
port = 443
code_package_ref = "Code"

[[resources.endpoints]]
name = "Internal"
protocol = "tcp"
port = 8080
"#
    )
}

pub(crate) fn parse_app(toml: &str) -> ApplicationManifest {
    parse_application_manifest_str(toml).unwrap()
}

/// The resolved `FrontEnd` import as composition sees it.
pub(crate) fn fixture_service_source() -> ServiceSource {
    let mut app = parse_app(&app_manifest_toml("1.0", "1", "shop.local"));
    let mut violations = Violations::default();
    crate::params::resolve_application(&mut app, &BTreeMap::new(), &mut violations);
    assert!(violations.is_empty(), "{violations:?}");

    let manifest_toml = service_manifest_toml("1.0", "1.0");
    let manifest = parse_service_manifest_str(&manifest_toml).unwrap();
    let mut settings = BTreeMap::new();
    settings.insert("Config".to_owned(), parse_settings_str(SETTINGS_TOML).unwrap());

    let mut package_checksums = BTreeMap::new();
    package_checksums.insert((PackageKind::Code, "Code".to_owned()), Some(checksum_bytes(b"code")));
    package_checksums.insert((PackageKind::Code, "Sidecar".to_owned()), None);
    package_checksums.insert(
        (PackageKind::Config, "Config".to_owned()),
        Some(checksum_bytes(SETTINGS_TOML.as_bytes())),
    );
    package_checksums.insert((PackageKind::Data, "Data".to_owned()), Some(checksum_bytes(b"data")));

    ServiceSource {
        import: app.service_manifest_imports.remove(0),
        manifest,
        manifest_checksum: checksum_bytes(manifest_toml.as_bytes()),
        settings,
        package_checksums,
    }
}

/// What a test build layout contains.
pub(crate) struct BuildFixture {
    pub app_version: &'static str,
    pub service_version: &'static str,
    pub code_version: &'static str,
    pub code_content: &'static str,
    pub with_config: bool,
    pub with_data: bool,
}

impl BuildFixture {
    /// Every manifest and package, services and packages at 1.0.
    pub(crate) fn full(app_version: &'static str) -> Self {
        Self {
            app_version,
            service_version: "1.0",
            code_version: "1.0",
            code_content: "frontend build 1",
            with_config: true,
            with_data: true,
        }
    }

    /// Only a new code package; config and data are left to the store.
    pub(crate) fn code_diff(version: &'static str) -> Self {
        Self {
            app_version: version,
            service_version: version,
            code_version: version,
            code_content: "frontend build next",
            with_config: false,
            with_data: false,
        }
    }
}

pub(crate) fn write_build(root: &Path, f: &BuildFixture) {
    let service_dir = root.join("FrontEnd");
    std::fs::create_dir_all(service_dir.join("Code")).unwrap();
    std::fs::write(
        root.join("ApplicationManifest.toml"),
        app_manifest_toml_for(f.app_version, f.service_version, "[InstanceCount]", "[DnsName]"),
    )
    .unwrap();
    std::fs::write(
        service_dir.join("ServiceManifest.toml"),
        service_manifest_toml(f.service_version, f.code_version),
    )
    .unwrap();
    std::fs::write(service_dir.join("Code").join("frontend.exe"), f.code_content).unwrap();
    if f.with_config {
        std::fs::create_dir_all(service_dir.join("Config")).unwrap();
        std::fs::write(service_dir.join("Config").join("Settings.toml"), SETTINGS_TOML).unwrap();
    }
    if f.with_data {
        std::fs::create_dir_all(service_dir.join("Data")).unwrap();
        std::fs::write(service_dir.join("Data").join("seed.dat"), "seed").unwrap();
    }
}
