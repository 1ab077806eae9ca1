//! Application and service manifest model for ImageBuilder.
//!
//! This crate defines the schema layer: TOML manifest parsing
//! (`ApplicationManifest`, `ServiceManifest`, `Settings`), the closed set of
//! service policies (`ServicePolicy`), the digested artifacts produced by
//! composition (`ServicePackage`, `ApplicationPackage`, `ApplicationInstance`),
//! and content-derived rollout identity (`seal`).

pub mod application;
pub mod artifact;
pub mod identity;
pub mod manifest;
pub mod policy;
pub mod service;
pub mod settings;
pub mod types;

pub use application::{
    AccountType, ApplicationManifest, ApplicationPolicies, CertificateDecl, Certificates,
    ConfigOverride, DefaultService, EndpointOverride, EnvironmentOverrides, Group, HealthPolicy,
    ParameterDecl, ParameterOverride, Partition, PartitionScheme, Principals, SectionOverride,
    ServiceCorrelation, ServiceDescription, ServiceManifestImport, ServiceManifestRef,
    ServiceTypeHealthPolicy, User,
};
pub use artifact::{
    ApplicationInstance, ApplicationPackage, DigestedCodePackage, DigestedConfigPackage,
    DigestedDataPackage, DigestedEndpoint, ServicePackage, ServicePackageRef,
};
pub use identity::{checksum_bytes, seal, verify_seal, RolloutIdentity, ROLLOUT_VERSION_LEN};
pub use manifest::{
    from_json_str, parse_application_manifest_file, parse_application_manifest_str,
    parse_service_manifest_file, parse_service_manifest_str, parse_settings_file,
    parse_settings_str, to_json_pretty, to_toml_string, ManifestError,
};
pub use policy::{
    AccessRights, ContainerHostPolicy, DriverOption, EndpointBindingPolicy, EntryPointKind,
    PackageSharingPolicy, PortBinding, ResourceKind, RunAsPolicy, SecurityAccessPolicy,
    ServicePolicy, SharingScope,
};
pub use service::{
    CodePackage, ContainerHost, Diagnostics, Endpoint, EndpointType, EntryPoint,
    EnvironmentVariable, ExeHost, PackageDecl, PackageKind, Protocol, Resources, ServiceKind,
    ServiceManifest, ServiceTypeDecl, WorkFolder,
};
pub use settings::{Section, Settings, SettingsParameter};
pub use types::{ApplicationId, Checksum, RolloutVersion};
