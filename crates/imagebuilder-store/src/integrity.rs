use crate::deadline::Deadline;
use crate::image_store::ImageStore;
use crate::layout::{checksum_key, StoreLayout, CHECKSUM_SUFFIX, STORE_ROOT};
use crate::registry::{ApplicationTypeRecord, TypeRegistry};
use crate::StoreError;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
    pub records_checked: usize,
    pub records_passed: usize,
    /// Keys referenced by intact records, each checked for presence.
    pub references_checked: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct IntegrityFailure {
    pub key: String,
    pub reason: String,
}

/// Recompute every checksum sidecar and every provisioning record checksum,
/// and check that the content each record references is still there.
pub fn verify_store_integrity(
    store: &dyn ImageStore,
    deadline: Deadline,
) -> Result<IntegrityReport, StoreError> {
    let sidecars: BTreeSet<String> = store
        .list(STORE_ROOT, deadline)?
        .into_iter()
        .filter(|k| k.ends_with(CHECKSUM_SUFFIX))
        .collect();

    let mut report = IntegrityReport {
        checked: sidecars.len(),
        ..Default::default()
    };

    // Verify content against its sidecar
    for sidecar in &sidecars {
        let Some(key) = sidecar.strip_suffix(CHECKSUM_SUFFIX) else {
            continue;
        };
        let expected = match store.get_bytes(sidecar, deadline) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_owned(),
            Err(e @ StoreError::Timeout { .. }) => return Err(e),
            Err(e) => {
                report.failed.push(IntegrityFailure {
                    key: sidecar.clone(),
                    reason: format!("checksum sidecar read error: {e}"),
                });
                continue;
            }
        };
        match store.checksum(key, deadline) {
            Ok(actual) if actual == expected => report.passed += 1,
            Ok(actual) => report.failed.push(IntegrityFailure {
                key: key.to_owned(),
                reason: format!("content checksum mismatch: expected {expected}, got {actual}"),
            }),
            Err(e @ StoreError::Timeout { .. }) => return Err(e),
            Err(e) => report.failed.push(IntegrityFailure {
                key: key.to_owned(),
                reason: format!("content read error: {e}"),
            }),
        }
    }

    // Verify provisioning records (embedded checksum)
    for result in TypeRegistry::new(store).list_all_with_errors(deadline)? {
        report.records_checked += 1;
        match result {
            Ok(record) => {
                report.records_passed += 1;
                check_references(store, &record, deadline, &mut report)?;
            }
            Err((key, StoreError::IntegrityFailure { actual, .. })) => {
                report.failed.push(IntegrityFailure {
                    key,
                    reason: format!("record checksum mismatch: got {actual}"),
                });
            }
            Err((_, e @ StoreError::Timeout { .. })) => return Err(e),
            Err((key, e)) => report.failed.push(IntegrityFailure {
                key,
                reason: format!("record read error: {e}"),
            }),
        }
    }

    Ok(report)
}

fn check_references(
    store: &dyn ImageStore,
    record: &ApplicationTypeRecord,
    deadline: Deadline,
    report: &mut IntegrityReport,
) -> Result<(), StoreError> {
    let record_key = StoreLayout::new(&record.application_type_name)
        .type_record(&record.application_type_version);
    for key in record.referenced_keys() {
        report.references_checked += 1;
        // a key with its sidecar but no content is already reported above
        if !store.exists(&key, deadline)? && !store.exists(&checksum_key(&key), deadline)? {
            report.failed.push(IntegrityFailure {
                reason: format!("referenced by {record_key} but missing from the store"),
                key,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_store::FileImageStore;
    use imagebuilder_schema::{checksum_bytes, Checksum};
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    fn put_with_sidecar(store: &FileImageStore, key: &str, content: &[u8]) {
        store.put_bytes(key, content, deadline(), false).unwrap();
        store
            .put_bytes(
                &checksum_key(key),
                checksum_bytes(content).as_bytes(),
                deadline(),
                false,
            )
            .unwrap();
    }

    #[test]
    fn clean_store_passes_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        put_with_sidecar(&store, "Store/T/ApplicationManifest.1.0.toml", b"name = 'T'");
        put_with_sidecar(&store, "Store/T/Svc.Manifest.1.0.toml", b"name = 'Svc'");
        TypeRegistry::new(&store)
            .put(
                &ApplicationTypeRecord {
                    application_type_name: "T".to_owned(),
                    application_type_version: "1.0".to_owned(),
                    manifest_checksum: Checksum::new("x"),
                    services: vec![],
                    provisioned_at: "2025-01-01T00:00:00Z".to_owned(),
                    checksum: None,
                },
                deadline(),
            )
            .unwrap();

        let report = verify_store_integrity(&store, deadline()).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.passed, 2);
        assert_eq!(report.records_checked, 1);
        assert_eq!(report.records_passed, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn modified_content_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        put_with_sidecar(&store, "Store/T/ApplicationManifest.1.0.toml", b"original");
        std::fs::write(
            dir.path().join("Store/T/ApplicationManifest.1.0.toml"),
            b"tampered",
        )
        .unwrap();

        let report = verify_store_integrity(&store, deadline()).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "Store/T/ApplicationManifest.1.0.toml");
        assert!(report.failed[0].reason.contains("mismatch"));
    }

    #[test]
    fn orphan_sidecar_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        store
            .put_bytes("Store/T/gone.toml.checksum", b"abc", deadline(), false)
            .unwrap();
        let report = verify_store_integrity(&store, deadline()).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("read error"));
    }

    #[test]
    fn record_without_its_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        TypeRegistry::new(&store)
            .put(
                &ApplicationTypeRecord {
                    application_type_name: "T".to_owned(),
                    application_type_version: "2.0".to_owned(),
                    manifest_checksum: Checksum::new("x"),
                    services: vec![],
                    provisioned_at: "2025-01-01T00:00:00Z".to_owned(),
                    checksum: None,
                },
                deadline(),
            )
            .unwrap();

        let report = verify_store_integrity(&store, deadline()).unwrap();
        assert_eq!(report.records_passed, 1);
        assert_eq!(report.references_checked, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "Store/T/ApplicationManifest.2.0.toml");
        assert!(report.failed[0].reason.contains("missing"));
    }

    #[test]
    fn empty_store_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        let report = verify_store_integrity(&store, deadline()).unwrap();
        assert_eq!(report.checked, 0);
        assert!(report.is_clean());
    }
}
