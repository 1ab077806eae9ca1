//! Diff reconciliation of a build layout against the store inventory.
//!
//! A build layout may be complete or hold only what changed since the last
//! provisioned version. Every manifest and package an application type
//! references is taken from the layout when present, or reused from the
//! store when already provisioned. Anything found in neither place, or
//! present in both with different content under the same version, is a
//! conflict.

use crate::digest::ServiceSource;
use crate::validate::{Rule, Violations};
use crate::CoreError;
use imagebuilder_schema::{
    parse_application_manifest_file, parse_service_manifest_file, parse_service_manifest_str,
    parse_settings_file, parse_settings_str, ApplicationManifest, Checksum, CodePackage,
    PackageKind, ServiceManifest, ServiceManifestImport, ServiceManifestRef, Settings,
};
use imagebuilder_store::{
    checksum_key, checksum_path, validate_path_segment, validate_type_name, BuildLayout,
    Deadline, ImageStore, StoreError, StoreLayout,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// File holding the settings of a config package, inside the package folder.
pub const SETTINGS_FILE: &str = "Settings.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConflictRule {
    /// Referenced content is neither in the layout nor in the store.
    MissingContent,
    /// Content differs from what the store holds for the same version.
    ModifiedWithoutVersionChange,
}

impl fmt::Display for ConflictRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictRule::MissingContent => f.write_str("MissingContent"),
            ConflictRule::ModifiedWithoutVersionChange => {
                f.write_str("ModifiedWithoutVersionChange")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Conflict {
    pub rule: ConflictRule,
    pub key: String,
    pub message: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.rule, self.key, self.message)
    }
}

#[derive(Debug, Default, Error)]
#[error(
    "build conflicts with the store ({} conflict(s)): {}",
    .conflicts.len(),
    summarize(.conflicts)
)]
pub struct ConflictErrors {
    pub conflicts: Vec<Conflict>,
}

impl ConflictErrors {
    pub fn has_rule(&self, rule: ConflictRule) -> bool {
        self.conflicts.iter().any(|c| c.rule == rule)
    }
}

fn summarize(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Store lookups made during one build, cached until the build ends.
pub struct StoreSnapshot<'s> {
    store: &'s dyn ImageStore,
    deadline: Deadline,
    checksums: HashMap<String, Option<Checksum>>,
}

impl<'s> StoreSnapshot<'s> {
    pub fn new(store: &'s dyn ImageStore, deadline: Deadline) -> Self {
        Self {
            store,
            deadline,
            checksums: HashMap::new(),
        }
    }

    pub fn store(&self) -> &'s dyn ImageStore {
        self.store
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Checksum recorded for a provisioned key, `None` if it was never provisioned.
    pub fn stored_checksum(&mut self, key: &str) -> Result<Option<Checksum>, StoreError> {
        if let Some(cached) = self.checksums.get(key) {
            return Ok(cached.clone());
        }
        let found = match self.store.get_bytes(&checksum_key(key), self.deadline) {
            Ok(bytes) => Some(Checksum::new(String::from_utf8_lossy(&bytes).trim())),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        self.checksums.insert(key.to_owned(), found.clone());
        Ok(found)
    }

    pub fn read_string(&self, key: &str) -> Result<String, StoreError> {
        let bytes = self.store.get_bytes(key, self.deadline)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A local file or folder to publish under a store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub local: PathBuf,
    pub key: String,
    pub checksum: Checksum,
}

/// Inputs of one application type build after diff reconciliation.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    /// Unresolved application manifest as read from the layout.
    pub app: ApplicationManifest,
    pub app_checksum: Checksum,
    pub services: Vec<ServiceSource>,
    /// New content only; content already in the store is never re-uploaded.
    pub uploads: Vec<UploadItem>,
    /// Provisioned keys the build takes from the store instead of the layout.
    pub reused: Vec<String>,
    pub store_layout: StoreLayout,
}

impl ProvisionPlan {
    /// Number of packages reused from the store instead of the layout.
    pub fn reused_packages(&self) -> usize {
        let total: usize = self.services.iter().map(|s| s.package_checksums.len()).sum();
        let uploaded = self
            .uploads
            .iter()
            .filter(|u| {
                self.services.iter().any(|s| {
                    s.manifest.packages().any(|(_, n, v)| {
                        u.key == self.store_layout.package(&s.manifest.name, n, v)
                    })
                })
            })
            .count();
        total.saturating_sub(uploaded)
    }
}

struct Planner<'a, 's> {
    build: &'a BuildLayout,
    snapshot: &'a mut StoreSnapshot<'s>,
    layout: StoreLayout,
    skip_checksum_validation: bool,
    uploads: Vec<UploadItem>,
    reused: Vec<String>,
    conflicts: Vec<Conflict>,
    violations: Violations,
}

/// Read a build layout and reconcile it against the store.
pub fn plan_build(
    build: &BuildLayout,
    snapshot: &mut StoreSnapshot<'_>,
    skip_checksum_validation: bool,
) -> Result<ProvisionPlan, CoreError> {
    let app = read_application_manifest(build)?;
    let app_path = build.application_manifest();

    let mut planner = Planner {
        build,
        snapshot,
        layout: StoreLayout::new(&app.name),
        skip_checksum_validation,
        uploads: Vec::new(),
        reused: Vec::new(),
        conflicts: Vec::new(),
        violations: Violations::default(),
    };

    let app_key = planner.layout.application_manifest(&app.version);
    let app_checksum = checksum_path(&app_path).map_err(StoreError::from)?;
    planner.offer(app_path, &app_key, app_checksum.clone())?;

    let mut services = Vec::with_capacity(app.service_manifest_imports.len());
    for import in &app.service_manifest_imports {
        let reference = &import.service_manifest_ref;
        if let Some(mut source) = planner.service(&reference.name, &reference.version)? {
            source.import = import.clone();
            services.push(source);
        }
    }

    planner.violations.into_result()?;
    if !planner.conflicts.is_empty() {
        return Err(ConflictErrors {
            conflicts: planner.conflicts,
        }
        .into());
    }

    debug!(
        "planned {}:{} with {} service(s), {} upload(s)",
        app.name,
        app.version,
        services.len(),
        planner.uploads.len()
    );
    Ok(ProvisionPlan {
        app,
        app_checksum,
        services,
        uploads: planner.uploads,
        reused: planner.reused,
        store_layout: planner.layout,
    })
}

/// Check that the provisioned keys a plan reuses are still in the store.
///
/// Called once the plan's content keys are locked, so another build cannot
/// roll them back afterwards.
pub fn confirm_reused(
    plan: &ProvisionPlan,
    store: &dyn ImageStore,
    deadline: Deadline,
) -> Result<(), CoreError> {
    let mut conflicts = Vec::new();
    for key in &plan.reused {
        if !store.exists(&checksum_key(key), deadline)? {
            conflicts.push(Conflict {
                rule: ConflictRule::MissingContent,
                key: key.clone(),
                message: "provisioned content was removed after planning".to_owned(),
            });
        }
    }
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(ConflictErrors { conflicts }.into())
    }
}

/// Parse the application manifest of a layout, checking the layout exists.
pub fn read_application_manifest(build: &BuildLayout) -> Result<ApplicationManifest, CoreError> {
    if !build.root().is_dir() {
        return Err(CoreError::NotFound(format!(
            "build path {}",
            build.root().display()
        )));
    }
    let path = build.application_manifest();
    if !path.is_file() {
        return Err(CoreError::NotFound(format!(
            "application manifest {}",
            path.display()
        )));
    }
    let app = parse_application_manifest_file(&path)?;
    // the name becomes a store path segment, so reject it before any key is built
    if let Err(e) = validate_type_name(&app.name) {
        let mut v = Violations::default();
        v.push(Rule::InvalidValue, "ApplicationManifest/Name", e.to_string());
        v.into_result()?;
    }
    Ok(app)
}

impl Planner<'_, '_> {
    /// Take local content if present, comparing it with the store's copy.
    fn offer(
        &mut self,
        local: PathBuf,
        key: &str,
        checksum: Checksum,
    ) -> Result<Checksum, CoreError> {
        match self.snapshot.stored_checksum(key)? {
            None => {
                self.uploads.push(UploadItem {
                    local,
                    key: key.to_owned(),
                    checksum: checksum.clone(),
                });
                Ok(checksum)
            }
            Some(stored) if stored == checksum => {
                self.reused.push(key.to_owned());
                Ok(checksum)
            }
            Some(stored) => {
                self.reused.push(key.to_owned());
                if self.skip_checksum_validation {
                    warn!("{key}: content differs from the provisioned copy; keeping stored");
                } else {
                    self.conflicts.push(Conflict {
                        rule: ConflictRule::ModifiedWithoutVersionChange,
                        key: key.to_owned(),
                        message: format!(
                            "content checksum {} differs from provisioned {}",
                            short(&checksum),
                            short(&stored)
                        ),
                    });
                }
                Ok(stored)
            }
        }
    }

    fn missing(&mut self, key: String, what: String) {
        self.conflicts.push(Conflict {
            rule: ConflictRule::MissingContent,
            key,
            message: format!("{what} is neither in the build layout nor provisioned"),
        });
    }

    /// Record a violation for a name that cannot be a path segment.
    fn check_segment(&mut self, element: String, what: &str, name: &str) -> bool {
        match validate_path_segment(what, name) {
            Ok(()) => true,
            Err(e) => {
                self.violations.push(Rule::InvalidValue, element, e.to_string());
                false
            }
        }
    }

    fn service(
        &mut self,
        name: &str,
        version: &str,
    ) -> Result<Option<ServiceSource>, CoreError> {
        let element = format!("ServiceManifestImport[{name}]");
        let name_ok = self.check_segment(element.clone(), "service name", name);
        if !(self.check_segment(element, "service version", version) && name_ok) {
            return Ok(None);
        }
        let local = self.build.service_manifest(name);
        let (manifest, manifest_checksum) = if local.is_file() {
            let manifest = parse_service_manifest_file(&local)?;
            let key = self.layout.service_manifest(name, &manifest.version);
            let checksum = checksum_path(&local).map_err(StoreError::from)?;
            let checksum = self.offer(local, &key, checksum)?;
            (manifest, checksum)
        } else {
            let key = self.layout.service_manifest(name, version);
            let Some(checksum) = self.snapshot.stored_checksum(&key)? else {
                self.missing(key, format!("service manifest {name}:{version}"));
                return Ok(None);
            };
            let manifest = parse_service_manifest_str(&self.snapshot.read_string(&key)?)?;
            debug!("reusing provisioned service manifest {name}:{version}");
            self.reused.push(key);
            (manifest, checksum)
        };

        let mut segments_ok = self.check_segment(
            format!("ServiceManifest[{name}]/Name"),
            "service name",
            &manifest.name,
        ) && self.check_segment(
            format!("ServiceManifest[{name}]/Version"),
            "service version",
            &manifest.version,
        );
        for (_, package, version) in manifest.packages() {
            let element = format!("ServiceManifest[{name}]/{package}");
            segments_ok &= self.check_segment(element.clone(), "package name", package)
                && self.check_segment(element, "package version", version);
        }
        if !segments_ok {
            return Ok(None);
        }

        let mut package_checksums = BTreeMap::new();
        let mut settings = BTreeMap::new();
        let packages: Vec<(PackageKind, String, String)> = manifest
            .packages()
            .map(|(k, n, v)| (k, n.to_owned(), v.to_owned()))
            .collect();
        for (kind, package, version) in packages {
            let checksum = self.package(&manifest, kind, &package, &version)?;
            if kind == PackageKind::Config {
                settings.insert(package.clone(), self.settings(name, &package, &version)?);
            }
            package_checksums.insert((kind, package), checksum);
        }

        Ok(Some(ServiceSource {
            import: ServiceManifestImport {
                service_manifest_ref: ServiceManifestRef {
                    name: name.to_owned(),
                    version: version.to_owned(),
                },
                config_overrides: Vec::new(),
                environment_overrides: Vec::new(),
                endpoint_overrides: Vec::new(),
                policies: Vec::new(),
            },
            manifest,
            manifest_checksum,
            settings,
            package_checksums,
        }))
    }

    fn package(
        &mut self,
        manifest: &ServiceManifest,
        kind: PackageKind,
        package: &str,
        version: &str,
    ) -> Result<Option<Checksum>, CoreError> {
        let service = manifest.name.as_str();
        let key = self.layout.package(service, package, version);
        let local = self.build.package_dir(service, package);
        if local.is_dir() {
            let checksum = checksum_path(&local).map_err(StoreError::from)?;
            return self.offer(local, &key, checksum).map(Some);
        }
        if let Some(stored) = self.snapshot.stored_checksum(&key)? {
            debug!("reusing provisioned {kind} package {service}.{package}:{version}");
            self.reused.push(key);
            return Ok(Some(stored));
        }
        let needs_content = kind != PackageKind::Code
            || manifest
                .code_package(package)
                .map_or(true, CodePackage::needs_content);
        if needs_content {
            self.missing(key, format!("{kind} package {service}.{package}:{version}"));
        }
        Ok(None)
    }

    fn settings(
        &mut self,
        service: &str,
        package: &str,
        version: &str,
    ) -> Result<Settings, CoreError> {
        let local = self.build.settings(service, package);
        if local.is_file() {
            return Ok(parse_settings_file(&local)?);
        }
        if self.build.package_dir(service, package).is_dir() {
            return Ok(Settings::default());
        }
        stored_settings(&*self.snapshot, &self.layout, service, package, version)
    }
}

/// At most the first twelve characters of a checksum, for messages.
fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

/// Settings of a provisioned config package; a package without a settings
/// file has none.
pub(crate) fn stored_settings(
    snapshot: &StoreSnapshot<'_>,
    layout: &StoreLayout,
    service: &str,
    package: &str,
    version: &str,
) -> Result<Settings, CoreError> {
    let key = format!("{}/{SETTINGS_FILE}", layout.package(service, package, version));
    match snapshot.read_string(&key) {
        Ok(content) => Ok(parse_settings_str(&content)?),
        Err(StoreError::NotFound(_)) => Ok(Settings::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_build, BuildFixture};
    use imagebuilder_store::{CopyMode, FileImageStore};
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    fn publish(store: &FileImageStore, plan: &ProvisionPlan) {
        for item in &plan.uploads {
            store
                .upload(&item.key, &item.local, deadline(), CopyMode::IfDifferent, false)
                .unwrap();
            store
                .put_bytes(
                    &checksum_key(&item.key),
                    item.checksum.as_bytes(),
                    deadline(),
                    true,
                )
                .unwrap();
        }
    }

    #[test]
    fn full_layout_plans_every_item() {
        let build = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        write_build(build.path(), &BuildFixture::full("1.0"));
        let store = FileImageStore::new(store_dir.path());
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let plan = plan_build(&BuildLayout::new(build.path()), &mut snapshot, false).unwrap();
        // app manifest, service manifest, Code, Config, Data
        assert_eq!(plan.uploads.len(), 5);
        assert_eq!(plan.services.len(), 1);
        let src = &plan.services[0];
        assert!(src.package_checksum(PackageKind::Code, "Sidecar").is_none());
        assert!(src.settings["Config"].section("Db").is_some());
        assert_eq!(src.import.config_overrides.len(), 1);
    }

    #[test]
    fn diff_layout_reuses_store_content() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(store_dir.path());
        let full = tempfile::tempdir().unwrap();
        write_build(full.path(), &BuildFixture::full("1.0"));
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let plan = plan_build(&BuildLayout::new(full.path()), &mut snapshot, false).unwrap();
        publish(&store, &plan);

        let diff = tempfile::tempdir().unwrap();
        write_build(diff.path(), &BuildFixture::code_diff("2.0"));
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let plan = plan_build(&BuildLayout::new(diff.path()), &mut snapshot, false).unwrap();
        // app manifest, service manifest, Code only
        assert_eq!(plan.uploads.len(), 3);
        let src = &plan.services[0];
        assert!(src.package_checksum(PackageKind::Config, "Config").is_some());
        assert!(src.settings["Config"].section("Db").is_some());
        assert_eq!(plan.reused_packages(), 3);
    }

    #[test]
    fn missing_content_is_conflict() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(store_dir.path());
        let diff = tempfile::tempdir().unwrap();
        write_build(diff.path(), &BuildFixture::code_diff("3.0"));
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let err = plan_build(&BuildLayout::new(diff.path()), &mut snapshot, false).unwrap_err();
        let CoreError::Conflict(conflicts) = err else {
            panic!("expected conflict, got {err}");
        };
        assert!(conflicts.has_rule(ConflictRule::MissingContent));
        assert!(conflicts.conflicts.iter().any(|c| c.key.contains("FrontEnd.Config.1.0")));
    }

    #[test]
    fn modified_content_same_version_is_conflict_unless_skipped() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(store_dir.path());
        let build = tempfile::tempdir().unwrap();
        write_build(build.path(), &BuildFixture::full("1.0"));
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let plan = plan_build(&BuildLayout::new(build.path()), &mut snapshot, false).unwrap();
        publish(&store, &plan);

        let changed = tempfile::tempdir().unwrap();
        let mut fixture = BuildFixture::full("1.1");
        fixture.code_content = "different binary";
        write_build(changed.path(), &fixture);

        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let err = plan_build(&BuildLayout::new(changed.path()), &mut snapshot, false).unwrap_err();
        let CoreError::Conflict(conflicts) = err else {
            panic!("expected conflict, got {err}");
        };
        assert!(conflicts.has_rule(ConflictRule::ModifiedWithoutVersionChange));

        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let plan = plan_build(&BuildLayout::new(changed.path()), &mut snapshot, true).unwrap();
        assert!(plan.uploads.iter().all(|u| !u.key.contains("FrontEnd.Code.")));
    }

    #[test]
    fn garbled_sidecar_is_a_conflict() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(store_dir.path());
        let build = tempfile::tempdir().unwrap();
        write_build(build.path(), &BuildFixture::full("1.0"));
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let plan = plan_build(&BuildLayout::new(build.path()), &mut snapshot, false).unwrap();
        publish(&store, &plan);
        let code = plan
            .uploads
            .iter()
            .find(|u| u.key.contains("FrontEnd.Code.1.0"))
            .unwrap();
        store
            .put_bytes(&checksum_key(&code.key), "aéééééé".as_bytes(), deadline(), true)
            .unwrap();

        let next = tempfile::tempdir().unwrap();
        write_build(next.path(), &BuildFixture::full("1.1"));
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let err = plan_build(&BuildLayout::new(next.path()), &mut snapshot, false).unwrap_err();
        let CoreError::Conflict(conflicts) = err else {
            panic!("expected conflict, got {err}");
        };
        assert!(conflicts.has_rule(ConflictRule::ModifiedWithoutVersionChange));
    }

    #[test]
    fn names_that_escape_the_type_prefix_are_rejected() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(store_dir.path());
        let escaping = [
            BuildFixture {
                service_version: "..",
                ..BuildFixture::full("1.0")
            },
            BuildFixture {
                code_version: "1.0/../../Other",
                ..BuildFixture::full("1.0")
            },
        ];
        for fixture in &escaping {
            let build = tempfile::tempdir().unwrap();
            write_build(build.path(), fixture);
            let mut snapshot = StoreSnapshot::new(&store, deadline());
            let layout = BuildLayout::new(build.path());
            let err = plan_build(&layout, &mut snapshot, false).unwrap_err();
            let CoreError::Validation(errors) = err else {
                panic!("expected validation error, got {err}");
            };
            assert!(errors.has_rule(Rule::InvalidValue));
        }
        assert!(store.list("Store", deadline()).unwrap().is_empty());
    }

    #[test]
    fn missing_build_path_is_not_found() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(store_dir.path());
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        let err = plan_build(
            &BuildLayout::new(store_dir.path().join("nope")),
            &mut snapshot,
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);

        let empty = tempfile::tempdir().unwrap();
        let err = plan_build(&BuildLayout::new(empty.path()), &mut snapshot, false).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn snapshot_caches_lookups() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(store_dir.path());
        let mut snapshot = StoreSnapshot::new(&store, deadline());
        assert!(snapshot.stored_checksum("Store/T/x").unwrap().is_none());
        store
            .put_bytes("Store/T/x.checksum", b"abc\n", deadline(), false)
            .unwrap();
        // cached negative answer for the lifetime of the snapshot
        assert!(snapshot.stored_checksum("Store/T/x").unwrap().is_none());
        let mut fresh = StoreSnapshot::new(&store, deadline());
        assert_eq!(fresh.stored_checksum("Store/T/x").unwrap().unwrap(), "abc");
    }
}
