//! Manifest and artifact (de)serialization.
//!
//! Manifests are TOML documents; digested artifacts and records are pretty JSON.

use crate::application::ApplicationManifest;
use crate::service::ServiceManifest;
use crate::settings::Settings;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize manifest: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("failed to (de)serialize artifact: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{document} {field} must not be empty")]
    MissingField {
        document: &'static str,
        field: &'static str,
    },
}

fn require(document: &'static str, field: &'static str, value: &str) -> Result<(), ManifestError> {
    if value.trim().is_empty() {
        return Err(ManifestError::MissingField { document, field });
    }
    Ok(())
}

pub fn parse_application_manifest_str(input: &str) -> Result<ApplicationManifest, ManifestError> {
    let manifest: ApplicationManifest = toml::from_str(input)?;
    require("application manifest", "name", &manifest.name)?;
    require("application manifest", "version", &manifest.version)?;
    Ok(manifest)
}

pub fn parse_application_manifest_file(
    path: impl AsRef<Path>,
) -> Result<ApplicationManifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_application_manifest_str(&content)
}

pub fn parse_service_manifest_str(input: &str) -> Result<ServiceManifest, ManifestError> {
    let manifest: ServiceManifest = toml::from_str(input)?;
    require("service manifest", "name", &manifest.name)?;
    require("service manifest", "version", &manifest.version)?;
    Ok(manifest)
}

pub fn parse_service_manifest_file(
    path: impl AsRef<Path>,
) -> Result<ServiceManifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_service_manifest_str(&content)
}

pub fn parse_settings_str(input: &str) -> Result<Settings, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_settings_file(path: impl AsRef<Path>) -> Result<Settings, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_settings_str(&content)
}

/// Render any manifest type back to TOML.
pub fn to_toml_string<T: Serialize>(manifest: &T) -> Result<String, ManifestError> {
    Ok(toml::to_string_pretty(manifest)?)
}

pub fn to_json_pretty<T: Serialize>(artifact: &T) -> Result<String, ManifestError> {
    Ok(serde_json::to_string_pretty(artifact)?)
}

pub fn from_json_str<T: DeserializeOwned>(input: &str) -> Result<T, ManifestError> {
    Ok(serde_json::from_str(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_APP: &str = r#"
name = "App"
version = "1.0"

[[service_manifest_imports]]
service_manifest_ref = { name = "Svc", version = "1.0" }
"#;

    #[test]
    fn parses_minimal_application_manifest() {
        let m = parse_application_manifest_str(MINIMAL_APP).unwrap();
        assert_eq!(m.name, "App");
        assert_eq!(m.service_manifest_imports.len(), 1);
        assert!(m.parameters.is_empty());
    }

    #[test]
    fn rejects_empty_name() {
        let input = "name = \"  \"\nversion = \"1.0\"\n";
        let err = parse_application_manifest_str(input).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::MissingField { field: "name", .. }
        ));
    }

    #[test]
    fn rejects_missing_version() {
        assert!(matches!(
            parse_service_manifest_str("name = \"Svc\"\n"),
            Err(ManifestError::ParseToml(_))
        ));
        assert!(matches!(
            parse_service_manifest_str("name = \"Svc\"\nversion = \"\"\n"),
            Err(ManifestError::MissingField {
                field: "version",
                ..
            })
        ));
    }

    #[test]
    fn toml_round_trip_preserves_manifest() {
        let m = parse_application_manifest_str(MINIMAL_APP).unwrap();
        let text = to_toml_string(&m).unwrap();
        let back = parse_application_manifest_str(&text).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn parses_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ApplicationManifest.toml");
        fs::write(&path, MINIMAL_APP).unwrap();
        assert_eq!(parse_application_manifest_file(&path).unwrap().name, "App");
        assert!(matches!(
            parse_settings_file(dir.path().join("missing.toml")),
            Err(ManifestError::Io(_))
        ));
    }
}
