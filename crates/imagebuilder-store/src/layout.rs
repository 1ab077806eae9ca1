use std::path::{Path, PathBuf};

/// Top-level directory of every key in the image store.
pub const STORE_ROOT: &str = "Store";
/// Suffix of the sidecar key holding the checksum of another key's content.
pub const CHECKSUM_SUFFIX: &str = ".checksum";

const RECORD_PREFIX: &str = "ApplicationType.";
const RECORD_EXT: &str = ".json";

/// Canonical versioned key layout of provisioned application types.
///
/// Keys are slash-delimited and relative to the store root:
///
/// ```text
/// Store/<AppType>/ApplicationManifest.<Version>.toml
/// Store/<AppType>/<Service>.Manifest.<Version>.toml
/// Store/<AppType>/<Service>.<Package>.<Version>/
/// Store/<AppType>/ApplicationType.<Version>.json
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    application_type: String,
}

impl StoreLayout {
    pub fn new(application_type: impl Into<String>) -> Self {
        Self {
            application_type: application_type.into(),
        }
    }

    pub fn application_type(&self) -> &str {
        &self.application_type
    }

    #[inline]
    pub fn type_dir(&self) -> String {
        format!("{STORE_ROOT}/{}", self.application_type)
    }

    #[inline]
    pub fn application_manifest(&self, version: &str) -> String {
        format!("{}/ApplicationManifest.{version}.toml", self.type_dir())
    }

    #[inline]
    pub fn service_manifest(&self, service: &str, version: &str) -> String {
        format!("{}/{service}.Manifest.{version}.toml", self.type_dir())
    }

    #[inline]
    pub fn package(&self, service: &str, package: &str, version: &str) -> String {
        format!("{}/{service}.{package}.{version}", self.type_dir())
    }

    #[inline]
    pub fn type_record(&self, version: &str) -> String {
        format!("{}/{RECORD_PREFIX}{version}{RECORD_EXT}", self.type_dir())
    }

    /// If `key` names a provisioning record of this type, return its version.
    pub fn record_version<'k>(&self, key: &'k str) -> Option<&'k str> {
        let rest = key.strip_prefix(&self.type_dir())?.strip_prefix('/')?;
        if rest.contains('/') {
            return None;
        }
        rest.strip_prefix(RECORD_PREFIX)?.strip_suffix(RECORD_EXT)
    }

    pub fn digest(&self, application_id: &str) -> DigestLayout {
        DigestLayout {
            dir: format!("{}/apps/{application_id}", self.type_dir()),
        }
    }
}

/// Sidecar key carrying the checksum of `key`'s content.
pub fn checksum_key(key: &str) -> String {
    format!("{key}{CHECKSUM_SUFFIX}")
}

/// Per-application-instance artifact keys.
///
/// ```text
/// Store/<AppType>/apps/<AppId>/ApplicationInstance.<N>.json
/// Store/<AppType>/apps/<AppId>/ApplicationPackage.<RolloutVersion>.json
/// Store/<AppType>/apps/<AppId>/<Service>.Package.<RolloutVersion>.json
/// ```
#[derive(Debug, Clone)]
pub struct DigestLayout {
    dir: String,
}

impl DigestLayout {
    pub fn dir(&self) -> &str {
        &self.dir
    }

    #[inline]
    pub fn application_instance(&self, instance_version: u32) -> String {
        format!("{}/ApplicationInstance.{instance_version}.json", self.dir)
    }

    #[inline]
    pub fn application_package(&self, rollout_version: &str) -> String {
        format!("{}/ApplicationPackage.{rollout_version}.json", self.dir)
    }

    #[inline]
    pub fn service_package(&self, service: &str, rollout_version: &str) -> String {
        format!("{}/{service}.Package.{rollout_version}.json", self.dir)
    }

    /// If `key` is an instance artifact in this layout, return its version.
    pub fn instance_version(&self, key: &str) -> Option<u32> {
        key.strip_prefix(&self.dir)?
            .strip_prefix("/ApplicationInstance.")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }
}

/// Local build directory supplied by the caller, full or diff.
///
/// ```text
/// <root>/ApplicationManifest.toml
/// <root>/<Service>/ServiceManifest.toml
/// <root>/<Service>/<Package>/...
/// <root>/<Service>/<ConfigPackage>/Settings.toml
/// ```
#[derive(Debug, Clone)]
pub struct BuildLayout {
    root: PathBuf,
}

impl BuildLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn application_manifest(&self) -> PathBuf {
        self.root.join("ApplicationManifest.toml")
    }

    #[inline]
    pub fn service_dir(&self, service: &str) -> PathBuf {
        self.root.join(service)
    }

    #[inline]
    pub fn service_manifest(&self, service: &str) -> PathBuf {
        self.service_dir(service).join("ServiceManifest.toml")
    }

    #[inline]
    pub fn package_dir(&self, service: &str, package: &str) -> PathBuf {
        self.service_dir(service).join(package)
    }

    #[inline]
    pub fn settings(&self, service: &str, config_package: &str) -> PathBuf {
        self.package_dir(service, config_package)
            .join("Settings.toml")
    }
}
