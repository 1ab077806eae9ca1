use crate::checksum::checksum_path;
use crate::deadline::Deadline;
use crate::{fsync_dir, StoreError};
use imagebuilder_schema::Checksum;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

/// How content is copied between a local path and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Always stage into a temporary sibling and rename into place.
    Atomic,
    /// Skip the copy when the destination already has identical content.
    IfDifferent,
}

/// The content store the engine provisions into.
///
/// Keys are slash-delimited relative paths. Every call takes the build's
/// [`Deadline`] and fails with [`StoreError::Timeout`] once it has passed.
pub trait ImageStore: Send + Sync {
    fn upload(
        &self,
        key: &str,
        local: &Path,
        deadline: Deadline,
        mode: CopyMode,
        overwrite: bool,
    ) -> Result<(), StoreError>;

    fn download(
        &self,
        key: &str,
        local: &Path,
        deadline: Deadline,
        mode: CopyMode,
    ) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str, deadline: Deadline) -> Result<(), StoreError>;

    fn exists(&self, key: &str, deadline: Deadline) -> Result<bool, StoreError>;

    /// Every file key under `prefix`, recursively, sorted.
    fn list(&self, prefix: &str, deadline: Deadline) -> Result<Vec<String>, StoreError>;

    fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        deadline: Deadline,
        overwrite: bool,
    ) -> Result<(), StoreError>;

    fn get_bytes(&self, key: &str, deadline: Deadline) -> Result<Vec<u8>, StoreError>;

    /// Content checksum of the file or directory stored at `key`.
    fn checksum(&self, key: &str, deadline: Deadline) -> Result<Checksum, StoreError>;
}

/// Reject empty, absolute, backslashed, or traversing keys.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidKey {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.starts_with('/') {
        return Err(invalid("absolute key"));
    }
    if key.contains('\\') {
        return Err(invalid("backslash in key"));
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            _ => {}
        }
    }
    Ok(())
}

/// [`ImageStore`] over a local directory.
///
/// Writes are published atomically: content is staged in a temporary sibling,
/// synced, and renamed into place, followed by a directory fsync.
#[derive(Debug, Clone)]
pub struct FileImageStore {
    root: PathBuf,
}

impl FileImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn parent_of(path: &Path) -> Result<&Path, StoreError> {
        path.parent()
            .ok_or_else(|| StoreError::Io(io::Error::other("path has no parent")))
    }

    fn same_content(a: &Path, b: &Path) -> Result<bool, StoreError> {
        if !a.exists() || !b.exists() {
            return Ok(false);
        }
        Ok(checksum_path(a)? == checksum_path(b)?)
    }

    /// Copy `src` (file or tree) to `dest` through a staged sibling.
    fn publish(
        src: &Path,
        dest: &Path,
        deadline: Deadline,
        op: &'static str,
        key: &str,
    ) -> Result<(), StoreError> {
        let parent = Self::parent_of(dest)?;
        fs::create_dir_all(parent)?;

        if src.is_file() {
            let mut tmp = NamedTempFile::new_in(parent)?;
            io::copy(&mut File::open(src)?, tmp.as_file_mut())?;
            tmp.as_file().sync_all()?;
            deadline.check(op, key)?;
            if dest.is_dir() {
                fs::remove_dir_all(dest)?;
            }
            tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        } else {
            let staged = tempfile::Builder::new().prefix(".tmp").tempdir_in(parent)?;
            copy_tree(src, staged.path(), deadline, op, key)?;
            deadline.check(op, key)?;
            if dest.is_dir() {
                fs::remove_dir_all(dest)?;
            } else if dest.exists() {
                fs::remove_file(dest)?;
            }
            // The emptied TempDir ignores the failed removal on drop.
            fs::rename(staged.path(), dest)?;
        }
        fsync_dir(parent)?;
        Ok(())
    }
}

fn copy_tree(
    src: &Path,
    dest: &Path,
    deadline: Deadline,
    op: &'static str,
    key: &str,
) -> Result<(), StoreError> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
        deadline.check(op, key)?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

impl ImageStore for FileImageStore {
    fn upload(
        &self,
        key: &str,
        local: &Path,
        deadline: Deadline,
        mode: CopyMode,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        deadline.check("upload", key)?;
        let dest = self.path_for(key)?;
        if !local.exists() {
            return Err(StoreError::NotFound(local.display().to_string()));
        }
        if dest.exists() {
            if mode == CopyMode::IfDifferent && Self::same_content(local, &dest)? {
                debug!("upload {key}: identical content already present");
                return Ok(());
            }
            if !overwrite {
                return Err(StoreError::AlreadyExists(key.to_owned()));
            }
        }
        Self::publish(local, &dest, deadline, "upload", key)?;
        debug!("uploaded {} -> {key}", local.display());
        Ok(())
    }

    fn download(
        &self,
        key: &str,
        local: &Path,
        deadline: Deadline,
        mode: CopyMode,
    ) -> Result<(), StoreError> {
        deadline.check("download", key)?;
        let src = self.path_for(key)?;
        if !src.exists() {
            return Err(StoreError::NotFound(key.to_owned()));
        }
        if mode == CopyMode::IfDifferent && Self::same_content(&src, local)? {
            return Ok(());
        }
        Self::publish(&src, local, deadline, "download", key)
    }

    fn delete(&self, key: &str, deadline: Deadline) -> Result<(), StoreError> {
        deadline.check("delete", key)?;
        let path = self.path_for(key)?;
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if path.exists() {
            fs::remove_file(&path)?;
        } else {
            return Ok(());
        }
        fsync_dir(Self::parent_of(&path)?)?;
        debug!("deleted {key}");
        Ok(())
    }

    fn exists(&self, key: &str, deadline: Deadline) -> Result<bool, StoreError> {
        deadline.check("exists", key)?;
        Ok(self.path_for(key)?.exists())
    }

    fn list(&self, prefix: &str, deadline: Deadline) -> Result<Vec<String>, StoreError> {
        deadline.check("list", prefix)?;
        let dir = self.path_for(prefix)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let walker = WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }

    fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        deadline: Deadline,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        deadline.check("put_bytes", key)?;
        let dest = self.path_for(key)?;
        if dest.exists() && !overwrite {
            return Err(StoreError::AlreadyExists(key.to_owned()));
        }
        let parent = Self::parent_of(&dest)?;
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(parent)?;
        Ok(())
    }

    fn get_bytes(&self, key: &str, deadline: Deadline) -> Result<Vec<u8>, StoreError> {
        deadline.check("get_bytes", key)?;
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(key.to_owned()));
        }
        Ok(fs::read(path)?)
    }

    fn checksum(&self, key: &str, deadline: Deadline) -> Result<Checksum, StoreError> {
        deadline.check("checksum", key)?;
        let path = self.path_for(key)?;
        if !path.exists() {
            return Err(StoreError::NotFound(key.to_owned()));
        }
        Ok(checksum_path(&path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    fn setup() -> (tempfile::TempDir, FileImageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path().join("root"));
        (dir, store)
    }

    #[test]
    fn validate_key_rejects_bad_keys() {
        assert!(validate_key("Store/App/x.toml").is_ok());
        for bad in ["", "/abs", "a/../b", "a//b", "./a", "a\\b", "a/"] {
            assert!(
                matches!(validate_key(bad), Err(StoreError::InvalidKey { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn put_get_bytes_round_trip() {
        let (_dir, store) = setup();
        store.put_bytes("Store/A/f.json", b"{}", deadline(), false).unwrap();
        assert_eq!(store.get_bytes("Store/A/f.json", deadline()).unwrap(), b"{}");
        assert!(store.exists("Store/A/f.json", deadline()).unwrap());
    }

    #[test]
    fn put_bytes_refuses_overwrite_unless_asked() {
        let (_dir, store) = setup();
        store.put_bytes("Store/A/f", b"1", deadline(), false).unwrap();
        assert!(matches!(
            store.put_bytes("Store/A/f", b"2", deadline(), false),
            Err(StoreError::AlreadyExists(_))
        ));
        store.put_bytes("Store/A/f", b"2", deadline(), true).unwrap();
        assert_eq!(store.get_bytes("Store/A/f", deadline()).unwrap(), b"2");
    }

    #[test]
    fn upload_and_download_directory() {
        let (dir, store) = setup();
        let src = dir.path().join("pkg");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/app"), b"exe").unwrap();
        store
            .upload("Store/A/Svc.Code.1.0", &src, deadline(), CopyMode::Atomic, false)
            .unwrap();
        assert_eq!(
            store.list("Store/A", deadline()).unwrap(),
            vec!["Store/A/Svc.Code.1.0/bin/app".to_owned()]
        );
        assert_eq!(
            store.checksum("Store/A/Svc.Code.1.0", deadline()).unwrap(),
            checksum_path(&src).unwrap()
        );

        let out = dir.path().join("out");
        store
            .download("Store/A/Svc.Code.1.0", &out, deadline(), CopyMode::Atomic)
            .unwrap();
        assert_eq!(fs::read(out.join("bin/app")).unwrap(), b"exe");
    }

    #[test]
    fn upload_if_different_skips_identical_content() {
        let (dir, store) = setup();
        let src = dir.path().join("f.txt");
        fs::write(&src, b"same").unwrap();
        store
            .upload("Store/A/f.txt", &src, deadline(), CopyMode::Atomic, false)
            .unwrap();
        store
            .upload("Store/A/f.txt", &src, deadline(), CopyMode::IfDifferent, false)
            .unwrap();
        fs::write(&src, b"changed").unwrap();
        assert!(matches!(
            store.upload("Store/A/f.txt", &src, deadline(), CopyMode::IfDifferent, false),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = setup();
        store.put_bytes("Store/A/f", b"1", deadline(), false).unwrap();
        store.delete("Store/A/f", deadline()).unwrap();
        store.delete("Store/A/f", deadline()).unwrap();
        assert!(!store.exists("Store/A/f", deadline()).unwrap());
    }

    #[test]
    fn missing_key_is_not_found() {
        let (_dir, store) = setup();
        assert!(matches!(
            store.get_bytes("Store/none", deadline()),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list("Store/none", deadline()).unwrap().is_empty());
    }

    #[test]
    fn expired_deadline_times_out_without_writing() {
        let (_dir, store) = setup();
        let expired = Deadline::after(Duration::ZERO);
        assert!(matches!(
            store.put_bytes("Store/A/f", b"1", expired, false),
            Err(StoreError::Timeout { op: "put_bytes", .. })
        ));
        assert!(!store.exists("Store/A/f", deadline()).unwrap());
    }

    #[test]
    fn list_skips_hidden_staging_entries() {
        let (_dir, store) = setup();
        store.put_bytes("Store/A/visible", b"1", deadline(), false).unwrap();
        fs::write(store.root().join("Store/A/.tmpXYZ"), b"partial").unwrap();
        assert_eq!(
            store.list("Store", deadline()).unwrap(),
            vec!["Store/A/visible".to_owned()]
        );
    }
}
