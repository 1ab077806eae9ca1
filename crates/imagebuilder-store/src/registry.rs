use crate::deadline::Deadline;
use crate::image_store::ImageStore;
use crate::layout::{StoreLayout, STORE_ROOT};
use crate::StoreError;
use imagebuilder_schema::{Checksum, PackageKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedPackage {
    pub kind: PackageKind,
    pub name: String,
    pub version: String,
    /// `None` for content-less registry containers.
    pub checksum: Option<Checksum>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedService {
    pub name: String,
    pub version: String,
    pub manifest_checksum: Checksum,
    pub packages: Vec<ProvisionedPackage>,
}

/// Provisioning record of one application type version.
///
/// Written last during provisioning; its presence marks the version as
/// provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationTypeRecord {
    pub application_type_name: String,
    pub application_type_version: String,
    pub manifest_checksum: Checksum,
    pub services: Vec<ProvisionedService>,
    pub provisioned_at: String,
    /// blake3 checksum for integrity verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ApplicationTypeRecord {
    /// Compute the checksum over the record content (excluding the checksum field itself).
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    pub fn service(&self, name: &str) -> Option<&ProvisionedService> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Store keys of the manifests and package content this record points at.
    /// Content-less packages have no key.
    pub fn referenced_keys(&self) -> Vec<String> {
        let layout = StoreLayout::new(&self.application_type_name);
        let mut keys = vec![layout.application_manifest(&self.application_type_version)];
        for svc in &self.services {
            keys.push(layout.service_manifest(&svc.name, &svc.version));
            keys.extend(
                svc.packages
                    .iter()
                    .filter(|p| p.checksum.is_some())
                    .map(|p| layout.package(&svc.name, &p.name, &p.version)),
            );
        }
        keys
    }
}

/// Names from manifests become store key parts and build layout folders.
pub fn validate_path_segment(what: &str, name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidName(format!("{what} must not be empty")));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(StoreError::InvalidName(format!(
            "{what} '{name}' must not contain path separators or be a relative path"
        )));
    }
    Ok(())
}

pub fn validate_type_name(name: &str) -> Result<(), StoreError> {
    validate_path_segment("application type name", name)
}

/// Reads and writes [`ApplicationTypeRecord`]s through an [`ImageStore`].
pub struct TypeRegistry<'s> {
    store: &'s dyn ImageStore,
}

impl<'s> TypeRegistry<'s> {
    pub fn new(store: &'s dyn ImageStore) -> Self {
        Self { store }
    }

    pub fn put(
        &self,
        record: &ApplicationTypeRecord,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let key = StoreLayout::new(&record.application_type_name)
            .type_record(&record.application_type_version);

        // Compute and embed checksum before writing
        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;
        self.store
            .put_bytes(&key, content.as_bytes(), deadline, true)
    }

    pub fn get(
        &self,
        type_name: &str,
        version: &str,
        deadline: Deadline,
    ) -> Result<ApplicationTypeRecord, StoreError> {
        let key = StoreLayout::new(type_name).type_record(version);
        self.get_key(&key, deadline)
    }

    pub fn exists(
        &self,
        type_name: &str,
        version: &str,
        deadline: Deadline,
    ) -> Result<bool, StoreError> {
        self.store
            .exists(&StoreLayout::new(type_name).type_record(version), deadline)
    }

    fn get_key(&self, key: &str, deadline: Deadline) -> Result<ApplicationTypeRecord, StoreError> {
        let bytes = self.store.get_bytes(key, deadline)?;
        let record: ApplicationTypeRecord = serde_json::from_slice(&bytes)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    key: key.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    /// Provisioned versions of one type, oldest first.
    pub fn list(
        &self,
        type_name: &str,
        deadline: Deadline,
    ) -> Result<Vec<ApplicationTypeRecord>, StoreError> {
        let layout = StoreLayout::new(type_name);
        let mut records = Vec::new();
        for key in self.store.list(&layout.type_dir(), deadline)? {
            if layout.record_version(&key).is_none() {
                continue;
            }
            match self.get_key(&key, deadline) {
                Ok(record) => records.push(record),
                Err(e @ StoreError::Timeout { .. }) => return Err(e),
                Err(e) => tracing::warn!("skipping corrupted provisioning record '{key}': {e}"),
            }
        }
        records.sort_by(|a, b| {
            a.provisioned_at
                .cmp(&b.provisioned_at)
                .then_with(|| a.application_type_version.cmp(&b.application_type_version))
        });
        Ok(records)
    }

    /// Like `list()` across every type, but returns per-record `Result`s so
    /// `verify_store_integrity` can surface individual corruption.
    #[allow(clippy::type_complexity)]
    pub fn list_all_with_errors(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<Result<ApplicationTypeRecord, (String, StoreError)>>, StoreError> {
        let mut results = Vec::new();
        for key in self.store.list(STORE_ROOT, deadline)? {
            let mut parts = key.splitn(3, '/');
            let (Some(_), Some(type_name), Some(_)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if StoreLayout::new(type_name).record_version(&key).is_none() {
                continue;
            }
            match self.get_key(&key, deadline) {
                Ok(record) => results.push(Ok(record)),
                Err(e) => results.push(Err((key, e))),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_store::FileImageStore;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    fn record(version: &str, at: &str) -> ApplicationTypeRecord {
        ApplicationTypeRecord {
            application_type_name: "ShopType".to_owned(),
            application_type_version: version.to_owned(),
            manifest_checksum: Checksum::new("m"),
            services: vec![ProvisionedService {
                name: "Front".to_owned(),
                version: "1.0".to_owned(),
                manifest_checksum: Checksum::new("s"),
                packages: vec![ProvisionedPackage {
                    kind: PackageKind::Code,
                    name: "Code".to_owned(),
                    version: "1.0".to_owned(),
                    checksum: Some(Checksum::new("c")),
                }],
            }],
            provisioned_at: at.to_owned(),
            checksum: None,
        }
    }

    #[test]
    fn put_get_round_trip_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        let registry = TypeRegistry::new(&store);
        registry.put(&record("1.0", "2025-01-01T00:00:00Z"), deadline()).unwrap();

        let back = registry.get("ShopType", "1.0", deadline()).unwrap();
        assert!(back.checksum.is_some());
        assert_eq!(back.service("Front").unwrap().packages.len(), 1);
        assert!(registry.exists("ShopType", "1.0", deadline()).unwrap());
        assert!(!registry.exists("ShopType", "2.0", deadline()).unwrap());
    }

    #[test]
    fn tampered_record_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        let registry = TypeRegistry::new(&store);
        registry.put(&record("1.0", "2025-01-01T00:00:00Z"), deadline()).unwrap();

        let path = dir.path().join("Store/ShopType/ApplicationType.1.0.json");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("Front", "Back")).unwrap();

        assert!(matches!(
            registry.get("ShopType", "1.0", deadline()),
            Err(StoreError::IntegrityFailure { .. })
        ));
        let all = registry.list_all_with_errors(deadline()).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_err());
    }

    #[test]
    fn list_orders_by_provisioning_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        let registry = TypeRegistry::new(&store);
        registry.put(&record("2.0", "2025-02-01T00:00:00Z"), deadline()).unwrap();
        registry.put(&record("1.0", "2025-01-01T00:00:00Z"), deadline()).unwrap();

        let versions: Vec<_> = registry
            .list("ShopType", deadline())
            .unwrap()
            .into_iter()
            .map(|r| r.application_type_version)
            .collect();
        assert_eq!(versions, vec!["1.0", "2.0"]);
        assert!(registry.list("Unknown", deadline()).unwrap().is_empty());
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        let registry = TypeRegistry::new(&store);
        assert!(matches!(
            registry.get("ShopType", "9.9", deadline()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn type_name_validation() {
        assert!(validate_type_name("ShopType").is_ok());
        for bad in ["", "  ", "..", ".", "a/b", "a\\b"] {
            assert!(validate_type_name(bad).is_err(), "{bad:?}");
        }
    }
}
