use crate::concurrency::{KeyLock, StoreLock};
use crate::config::EngineConfig;
use crate::digest::{bind_imports, Composer, ServiceSource};
use crate::lifecycle::{ProvisionState, Provisioning};
use crate::params::{resolve_application, ParameterTable};
use crate::provision::{
    confirm_reused, plan_build, read_application_manifest, stored_settings, ProvisionPlan,
    StoreSnapshot,
};
use crate::validate::{validate_all, Violations};
use crate::CoreError;
use imagebuilder_schema::{
    parse_application_manifest_str, parse_service_manifest_str, ApplicationId,
    ApplicationInstance, ApplicationManifest, PackageKind, RolloutVersion, ServicePackage,
    ServicePackageRef,
};
use imagebuilder_store::{
    checksum_key, validate_type_name, ApplicationTypeRecord, BuildLayout, CopyMode, Deadline,
    DigestLayout, FileImageStore, ImageStore, IntegrityReport, ProvisionedPackage,
    ProvisionedService, RollbackStep, StoreError, StoreLayout, TypeRegistry, WalOpKind,
    WriteAheadLog,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Scheme every application name URI must carry.
const NAME_URI_SCHEME: &str = "fabric:";

/// Central orchestration engine of ImageBuilder.
///
/// Reads build layouts, reconciles them with the store, resolves parameters,
/// validates, composes digested artifacts, and publishes them. Every store
/// mutation is journaled so a crashed upload is rolled back on the next start.
pub struct ImageBuilder {
    config: EngineConfig,
    store: Box<dyn ImageStore>,
    wal: WriteAheadLog,
}

/// Name and version of the application type a build layout describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationTypeInfo {
    pub name: String,
    pub version: String,
}

/// Outcome of [`ImageBuilder::build_application_type`].
#[derive(Debug, Clone, Serialize)]
pub struct TypeBuildResult {
    pub application_type_name: String,
    pub application_type_version: String,
    /// The version was provisioned before this call; nothing was written.
    pub already_provisioned: bool,
    pub uploaded_keys: Vec<String>,
    pub reused_packages: usize,
    pub service_packages: Vec<ServicePackageRef>,
}

/// Outcome of building or upgrading an application instance.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationBuildResult {
    pub application_id: ApplicationId,
    pub application_type_name: String,
    pub application_type_version: String,
    pub instance_version: u32,
    pub application_package: RolloutVersion,
    pub service_packages: Vec<ServicePackageRef>,
    pub written_keys: Vec<String>,
}

/// Resolved inputs ready for composition.
struct Resolved {
    app: ApplicationManifest,
    services: Vec<ServiceSource>,
    table: ParameterTable,
}

/// Everything that identifies one instance version to write.
struct InstanceRequest<'a> {
    kind: WalOpKind,
    type_name: &'a str,
    type_version: &'a str,
    application_id: &'a ApplicationId,
    name_uri: &'a str,
    instance_version: u32,
    parameters: &'a BTreeMap<String, String>,
}

impl ImageBuilder {
    /// Create an engine over a directory-backed store at `config.store_root`.
    pub fn new(config: EngineConfig) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&config.store_root)?;
        let store = FileImageStore::new(config.store_root.clone());
        Self::with_store(config, Box::new(store))
    }

    /// Create an engine over any [`ImageStore`].
    ///
    /// Incomplete uploads journaled by a previous run are rolled back here,
    /// unless another engine is mid-operation on the same working directory.
    pub fn with_store(
        config: EngineConfig,
        store: Box<dyn ImageStore>,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&config.working_dir)?;
        let wal = WriteAheadLog::new(&config.working_dir);
        wal.initialize()?;

        // every operation holds the store lock shared, so under the exclusive
        // lock no journal entry belongs to a live operation
        match StoreLock::try_exclusive(&config.working_dir) {
            Ok(Some(_lock)) => {
                let deadline = Deadline::after(config.default_timeout());
                match wal.recover(store.as_ref(), deadline) {
                    Ok(0) => {}
                    Ok(n) => info!("rolled back {n} incomplete upload(s)"),
                    Err(e) => warn!("WAL recovery failed: {e}"),
                }
            }
            Ok(None) => debug!("store in use; skipping WAL recovery"),
            Err(e) => warn!("store lock check failed; skipping WAL recovery: {e}"),
        }

        Ok(Self { config, store, wal })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn ImageStore {
        self.store.as_ref()
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.default_timeout())
    }

    /// Undo a failed operation. The failed operation's deadline may be spent,
    /// so the rollback runs under a fresh one; steps that still fail keep the
    /// journal entry for the next recovery.
    fn roll_back(&self, op: &str, target: &str) {
        if let Err(e) = self.wal.rollback(op, self.store.as_ref(), self.deadline()) {
            warn!("rollback of {target} incomplete: {e}");
        }
    }

    /// Name and version of the application type in a build layout.
    pub fn get_application_type_info(
        &self,
        build_path: &Path,
    ) -> Result<ApplicationTypeInfo, CoreError> {
        let app = read_application_manifest(&BuildLayout::new(build_path))?;
        Ok(ApplicationTypeInfo {
            name: app.name,
            version: app.version,
        })
    }

    /// Run every check a type build runs, without writing anything.
    pub fn validate_application_package(
        &self,
        build_path: &Path,
    ) -> Result<ApplicationTypeInfo, CoreError> {
        info!("validating application package at {}", build_path.display());
        let mut snapshot = StoreSnapshot::new(self.store.as_ref(), self.deadline());
        let plan = plan_build(
            &BuildLayout::new(build_path),
            &mut snapshot,
            self.config.skip_checksum_validation,
        )?;
        let resolved = self.resolve(&plan.app, plan.services.clone(), &BTreeMap::new())?;
        let composer = Composer::new(&resolved.app);
        for src in &resolved.services {
            composer.compose_service_package(src)?;
        }
        Ok(ApplicationTypeInfo {
            name: plan.app.name,
            version: plan.app.version,
        })
    }

    /// Validate a build layout and provision its application type.
    ///
    /// Only content the store does not hold yet is uploaded. The provisioning
    /// record is written last; its presence marks the type as provisioned.
    pub fn build_application_type(
        &self,
        build_path: &Path,
    ) -> Result<TypeBuildResult, CoreError> {
        info!("building application type from {}", build_path.display());
        let info = self.get_application_type_info(build_path)?;
        let target = format!("{}:{}", info.name, info.version);
        let _store_lock = StoreLock::shared(&self.config.working_dir)?;
        let _lock = KeyLock::acquire(&self.config.working_dir, &format!("type:{target}"))?;

        let deadline = self.deadline();
        let mut snapshot = StoreSnapshot::new(self.store.as_ref(), deadline);
        let plan = plan_build(
            &BuildLayout::new(build_path),
            &mut snapshot,
            self.config.skip_checksum_validation,
        )?;

        let registry = TypeRegistry::new(self.store.as_ref());
        if registry.exists(&info.name, &info.version, deadline)? {
            info!("{target} is already provisioned");
            return Ok(TypeBuildResult {
                application_type_name: info.name,
                application_type_version: info.version,
                already_provisioned: true,
                uploaded_keys: Vec::new(),
                reused_packages: plan.reused_packages(),
                service_packages: Vec::new(),
            });
        }

        let mut provisioning = Provisioning::new(&target);
        let result = self.provision_type(&plan, &mut provisioning, deadline);
        if result.is_err() {
            provisioning.fail();
        }
        let packages = result?;

        info!(
            "provisioned {target}: {} upload(s), {} package(s) reused",
            plan.uploads.len(),
            plan.reused_packages()
        );
        Ok(TypeBuildResult {
            application_type_name: info.name,
            application_type_version: info.version,
            already_provisioned: false,
            uploaded_keys: plan.uploads.iter().map(|u| u.key.clone()).collect(),
            reused_packages: plan.reused_packages(),
            service_packages: packages.iter().map(package_ref).collect(),
        })
    }

    fn provision_type(
        &self,
        plan: &ProvisionPlan,
        provisioning: &mut Provisioning,
        deadline: Deadline,
    ) -> Result<Vec<ServicePackage>, CoreError> {
        provisioning.advance(ProvisionState::Validating)?;
        let resolved = self.resolve(&plan.app, plan.services.clone(), &BTreeMap::new())?;

        provisioning.advance(ProvisionState::Composing)?;
        let composer = Composer::new(&resolved.app);
        let packages = resolved
            .services
            .iter()
            .map(|src| composer.compose_service_package(src))
            .collect::<Result<Vec<_>, _>>()?;

        provisioning.advance(ProvisionState::Uploading)?;
        // versions of one type share package keys; hold them until the record is in
        let _content_locks = KeyLock::acquire_all(
            &self.config.working_dir,
            plan.uploads
                .iter()
                .map(|u| u.key.as_str())
                .chain(plan.reused.iter().map(String::as_str)),
        )?;
        confirm_reused(plan, self.store.as_ref(), deadline)?;

        let record = type_record(plan);
        let record_key = plan.store_layout.type_record(&plan.app.version);
        let target = format!("{}:{}", plan.app.name, plan.app.version);
        let op = self.wal.begin(WalOpKind::BuildApplicationType, &target)?;

        // only keys this build creates are journaled
        let upload = || -> Result<(), CoreError> {
            for item in &plan.uploads {
                if self.store.exists(&item.key, deadline)? {
                    debug!("{} was provisioned by another build", item.key);
                } else {
                    self.wal
                        .add_rollback_step(&op, RollbackStep::RemoveKey(item.key.clone()))?;
                }
                self.store
                    .upload(&item.key, &item.local, deadline, CopyMode::IfDifferent, false)?;
                let sidecar = checksum_key(&item.key);
                if !self.store.exists(&sidecar, deadline)? {
                    self.wal
                        .add_rollback_step(&op, RollbackStep::RemoveKey(sidecar.clone()))?;
                    self.store
                        .put_bytes(&sidecar, item.checksum.as_bytes(), deadline, false)?;
                }
                debug!("uploaded {}", item.key);
            }
            self.wal
                .add_rollback_step(&op, RollbackStep::RemoveKey(record_key.clone()))?;
            TypeRegistry::new(self.store.as_ref()).put(&record, deadline)?;
            Ok(())
        };

        if let Err(e) = upload() {
            warn!("upload of {target} failed, rolling back: {e}");
            self.roll_back(&op, &target);
            return Err(e);
        }
        self.wal.commit(&op)?;
        provisioning.advance(ProvisionState::Provisioned)?;
        Ok(packages)
    }

    /// Resolve parameters against `overrides` and run the full validation battery.
    fn resolve(
        &self,
        app: &ApplicationManifest,
        mut services: Vec<ServiceSource>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Resolved, CoreError> {
        let mut app = app.clone();
        let mut violations = Violations::default();
        let table = resolve_application(&mut app, overrides, &mut violations);
        bind_imports(&app, &mut services);
        validate_all(
            &app,
            &services,
            self.config.parallel_validation,
            &mut violations,
        );
        if !violations.is_empty() {
            debug!("{} violation(s) in {}:{}", violations.len(), app.name, app.version);
        }
        violations.into_result()?;
        Ok(Resolved {
            app,
            services,
            table,
        })
    }

    /// Read a provisioned application type back from the store.
    fn load_type(
        &self,
        type_name: &str,
        type_version: &str,
        deadline: Deadline,
    ) -> Result<(ApplicationManifest, Vec<ServiceSource>), CoreError> {
        let registry = TypeRegistry::new(self.store.as_ref());
        let record = match registry.get(type_name, type_version, deadline) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Err(CoreError::NotFound(format!(
                    "application type {type_name}:{type_version}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let layout = StoreLayout::new(type_name);
        let snapshot = StoreSnapshot::new(self.store.as_ref(), deadline);
        let app = parse_application_manifest_str(
            &snapshot.read_string(&layout.application_manifest(type_version))?,
        )?;

        let mut services = Vec::with_capacity(record.services.len());
        for svc in &record.services {
            let import = app.import(&svc.name).cloned().ok_or_else(|| {
                CoreError::NotFound(format!(
                    "import of service {} in {type_name}:{type_version}",
                    svc.name
                ))
            })?;
            let manifest = parse_service_manifest_str(
                &snapshot.read_string(&layout.service_manifest(&svc.name, &svc.version))?,
            )?;
            let mut settings = BTreeMap::new();
            let mut package_checksums = BTreeMap::new();
            for pkg in &svc.packages {
                if pkg.kind == PackageKind::Config {
                    settings.insert(
                        pkg.name.clone(),
                        stored_settings(&snapshot, &layout, &svc.name, &pkg.name, &pkg.version)?,
                    );
                }
                package_checksums.insert((pkg.kind, pkg.name.clone()), pkg.checksum.clone());
            }
            services.push(ServiceSource {
                import,
                manifest,
                manifest_checksum: svc.manifest_checksum.clone(),
                settings,
                package_checksums,
            });
        }
        Ok((app, services))
    }

    /// Create instance version 1 of an application from a provisioned type.
    pub fn build_application(
        &self,
        type_name: &str,
        type_version: &str,
        application_id: &str,
        name_uri: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ApplicationBuildResult, CoreError> {
        check_application_args(type_name, type_version, application_id)?;
        if !name_uri.starts_with(NAME_URI_SCHEME) || name_uri.len() == NAME_URI_SCHEME.len() {
            return Err(CoreError::InvalidArgument(format!(
                "name URI '{name_uri}' must be an absolute '{NAME_URI_SCHEME}' URI"
            )));
        }
        info!("building application {application_id} from {type_name}:{type_version}");
        let _store_lock = StoreLock::shared(&self.config.working_dir)?;
        let _lock = KeyLock::acquire(
            &self.config.working_dir,
            &format!("app:{type_name}:{application_id}"),
        )?;
        let deadline = self.deadline();
        let digest = StoreLayout::new(type_name).digest(application_id);
        if self.latest_instance(&digest, deadline)?.is_some() {
            return Err(CoreError::InvalidArgument(format!(
                "application {application_id} already exists; upgrade it instead"
            )));
        }

        self.write_instance(
            &InstanceRequest {
                kind: WalOpKind::BuildApplication,
                type_name,
                type_version,
                application_id: &ApplicationId::new(application_id),
                name_uri,
                instance_version: 1,
                parameters,
            },
            deadline,
        )
    }

    /// Create instance version N+1 of an existing application.
    ///
    /// Service packages whose rollout version did not change are referenced,
    /// not rewritten.
    pub fn upgrade_application(
        &self,
        type_name: &str,
        target_version: &str,
        application_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ApplicationBuildResult, CoreError> {
        check_application_args(type_name, target_version, application_id)?;
        info!("upgrading application {application_id} to {type_name}:{target_version}");
        let _store_lock = StoreLock::shared(&self.config.working_dir)?;
        let _lock = KeyLock::acquire(
            &self.config.working_dir,
            &format!("app:{type_name}:{application_id}"),
        )?;
        let deadline = self.deadline();
        let current = self.get_application_instance(type_name, application_id, None)?;

        self.write_instance(
            &InstanceRequest {
                kind: WalOpKind::UpgradeApplication,
                type_name,
                type_version: target_version,
                application_id: &current.application_id,
                name_uri: &current.name_uri,
                instance_version: current.instance_version + 1,
                parameters,
            },
            deadline,
        )
    }

    fn write_instance(
        &self,
        req: &InstanceRequest<'_>,
        deadline: Deadline,
    ) -> Result<ApplicationBuildResult, CoreError> {
        let target = format!("{}:{}", req.type_name, req.application_id);
        let mut provisioning = Provisioning::new(&target);
        let result = self.compose_and_publish(req, &target, &mut provisioning, deadline);
        if result.is_err() {
            provisioning.fail();
        }
        result
    }

    fn compose_and_publish(
        &self,
        req: &InstanceRequest<'_>,
        target: &str,
        provisioning: &mut Provisioning,
        deadline: Deadline,
    ) -> Result<ApplicationBuildResult, CoreError> {
        provisioning.advance(ProvisionState::Validating)?;
        let (app, services) = self.load_type(req.type_name, req.type_version, deadline)?;
        let resolved = self.resolve(&app, services, req.parameters)?;

        provisioning.advance(ProvisionState::Composing)?;
        let composer = Composer::new(&resolved.app);
        let packages = resolved
            .services
            .iter()
            .map(|src| composer.compose_service_package(src))
            .collect::<Result<Vec<_>, _>>()?;
        let app_package = composer.compose_application_package(
            req.application_id,
            req.name_uri,
            resolved.table.resolved(),
        )?;
        let instance = composer.compose_instance(req.instance_version, &app_package, &packages);

        provisioning.advance(ProvisionState::Uploading)?;
        let digest = StoreLayout::new(req.type_name).digest(req.application_id);
        let mut artifacts = Vec::with_capacity(packages.len() + 2);
        for pkg in &packages {
            artifacts.push((
                digest.service_package(&pkg.name, &pkg.rollout_version),
                serde_json::to_string_pretty(pkg)?,
            ));
        }
        artifacts.push((
            digest.application_package(&app_package.rollout_version),
            serde_json::to_string_pretty(&app_package)?,
        ));
        // the instance goes last; its presence publishes the others
        artifacts.push((
            digest.application_instance(instance.instance_version),
            serde_json::to_string_pretty(&instance)?,
        ));
        let written = self.publish(req.kind, target, &artifacts, deadline)?;
        provisioning.advance(ProvisionState::Provisioned)?;

        info!(
            "{target}: instance {} written ({} new artifact(s))",
            req.instance_version,
            written.len()
        );
        Ok(ApplicationBuildResult {
            application_id: req.application_id.clone(),
            application_type_name: req.type_name.to_owned(),
            application_type_version: req.type_version.to_owned(),
            instance_version: req.instance_version,
            application_package: app_package.rollout_version,
            service_packages: instance.service_package_refs,
            written_keys: written,
        })
    }

    /// Write artifacts not yet in the store, in order, under one journal entry.
    fn publish(
        &self,
        kind: WalOpKind,
        target: &str,
        artifacts: &[(String, String)],
        deadline: Deadline,
    ) -> Result<Vec<String>, CoreError> {
        let op = self.wal.begin(kind, target)?;
        let mut written = Vec::new();
        let mut write_all = || -> Result<(), CoreError> {
            for (key, json) in artifacts {
                // keys carry rollout versions, so an existing key holds identical content
                if self.store.exists(key, deadline)? {
                    debug!("reusing {key}");
                    continue;
                }
                self.wal
                    .add_rollback_step(&op, RollbackStep::RemoveKey(key.clone()))?;
                self.store.put_bytes(key, json.as_bytes(), deadline, false)?;
                written.push(key.clone());
            }
            Ok(())
        };
        if let Err(e) = write_all() {
            warn!("publishing {target} failed, rolling back: {e}");
            self.roll_back(&op, target);
            return Err(e);
        }
        self.wal.commit(&op)?;
        Ok(written)
    }

    fn latest_instance(
        &self,
        digest: &DigestLayout,
        deadline: Deadline,
    ) -> Result<Option<u32>, CoreError> {
        Ok(self
            .store
            .list(digest.dir(), deadline)?
            .iter()
            .filter_map(|k| digest.instance_version(k))
            .max())
    }

    /// Read an application instance; the latest version when none is given.
    pub fn get_application_instance(
        &self,
        type_name: &str,
        application_id: &str,
        instance_version: Option<u32>,
    ) -> Result<ApplicationInstance, CoreError> {
        let deadline = self.deadline();
        let digest = StoreLayout::new(type_name).digest(application_id);
        let version = match instance_version {
            Some(v) => v,
            None => self
                .latest_instance(&digest, deadline)?
                .ok_or_else(|| CoreError::NotFound(format!("application {application_id}")))?,
        };
        let key = digest.application_instance(version);
        match self.store.get_bytes(&key, deadline) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(StoreError::NotFound(_)) => Err(CoreError::NotFound(format!(
                "application {application_id} instance {version}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Provisioned versions of an application type, oldest first.
    pub fn list_application_types(
        &self,
        type_name: &str,
    ) -> Result<Vec<ApplicationTypeRecord>, CoreError> {
        validate_type_name(type_name)
            .map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
        Ok(TypeRegistry::new(self.store.as_ref()).list(type_name, self.deadline())?)
    }

    /// Recompute every checksum sidecar and provisioning record.
    pub fn verify_store(&self) -> Result<IntegrityReport, CoreError> {
        Ok(imagebuilder_store::verify_store_integrity(
            self.store.as_ref(),
            self.deadline(),
        )?)
    }
}

fn check_application_args(
    type_name: &str,
    type_version: &str,
    application_id: &str,
) -> Result<(), CoreError> {
    validate_type_name(type_name).map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
    if type_version.trim().is_empty() {
        return Err(CoreError::InvalidArgument(
            "application type version must not be empty".to_owned(),
        ));
    }
    // the id becomes a store path segment, same rules as a type name
    validate_type_name(application_id).map_err(|_| {
        CoreError::InvalidArgument(format!("invalid application id '{application_id}'"))
    })
}

fn package_ref(pkg: &ServicePackage) -> ServicePackageRef {
    ServicePackageRef {
        name: pkg.name.clone(),
        manifest_version: pkg.manifest_version.clone(),
        rollout_version: pkg.rollout_version.clone(),
    }
}

fn type_record(plan: &ProvisionPlan) -> ApplicationTypeRecord {
    let services = plan
        .services
        .iter()
        .map(|src| ProvisionedService {
            name: src.manifest.name.clone(),
            version: src.manifest.version.clone(),
            manifest_checksum: src.manifest_checksum.clone(),
            packages: src
                .manifest
                .packages()
                .map(|(kind, name, version)| ProvisionedPackage {
                    kind,
                    name: name.to_owned(),
                    version: version.to_owned(),
                    checksum: src.package_checksum(kind, name).cloned(),
                })
                .collect(),
        })
        .collect();
    ApplicationTypeRecord {
        application_type_name: plan.app.name.clone(),
        application_type_version: plan.app.version.clone(),
        manifest_checksum: plan.app_checksum.clone(),
        services,
        provisioned_at: chrono::Utc::now().to_rfc3339(),
        checksum: None,
    }
}
