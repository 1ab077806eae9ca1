use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

fn would_block(e: std::io::Error) -> CoreError {
    CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e))
}

/// Store-wide lock under `<working_dir>/locks/store.lock`.
///
/// Every mutating operation holds it shared for its whole duration, so any
/// number of builds run side by side. Journal recovery holds it exclusively:
/// a journal entry seen under the exclusive lock has no live owner.
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    pub fn lock_path(working_dir: &Path) -> PathBuf {
        working_dir.join("locks").join("store.lock")
    }

    pub fn shared(working_dir: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(&Self::lock_path(working_dir))?;
        file.lock_shared().map_err(would_block)?;
        Ok(Self { lock_file: file })
    }

    /// Exclusive access, or `None` while any operation holds the lock.
    pub fn try_exclusive(working_dir: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(&Self::lock_path(working_dir))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Exclusive lock serializing writes of one build key, e.g. `ShopType:1.0`.
///
/// Locks live under `<working_dir>/locks/`; distinct keys never contend.
pub struct KeyLock {
    lock_file: File,
}

impl KeyLock {
    pub fn lock_path(working_dir: &Path, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes()).to_hex();
        working_dir
            .join("locks")
            .join(format!("{}.lock", &digest[..16]))
    }

    pub fn acquire(working_dir: &Path, key: &str) -> Result<Self, CoreError> {
        let file = open_lock_file(&Self::lock_path(working_dir, key))?;
        file.lock_exclusive().map_err(would_block)?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(working_dir: &Path, key: &str) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(&Self::lock_path(working_dir, key))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Lock several keys in sorted order, so overlapping sets never deadlock.
    pub fn acquire_all<'k>(
        working_dir: &Path,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Result<Vec<Self>, CoreError> {
        let mut keys: Vec<&str> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        keys.into_iter()
            .map(|key| Self::acquire(working_dir, key))
            .collect()
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = KeyLock::acquire(dir.path(), "T:1.0").unwrap();
            assert!(KeyLock::lock_path(dir.path(), "T:1.0").exists());
        }
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = KeyLock::acquire(dir.path(), "T:1.0").unwrap();
        assert!(KeyLock::try_acquire(dir.path(), "T:1.0").unwrap().is_none());
    }

    #[test]
    fn different_keys_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = KeyLock::acquire(dir.path(), "T:1.0").unwrap();
        assert!(KeyLock::try_acquire(dir.path(), "T:2.0").unwrap().is_some());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = KeyLock::acquire(dir.path(), "app").unwrap();
        }
        assert!(KeyLock::try_acquire(dir.path(), "app").unwrap().is_some());
    }

    #[test]
    fn acquire_all_holds_each_key_once() {
        let dir = tempfile::tempdir().unwrap();
        let locks = KeyLock::acquire_all(dir.path(), ["b", "a", "b"]).unwrap();
        assert_eq!(locks.len(), 2);
        assert!(KeyLock::try_acquire(dir.path(), "a").unwrap().is_none());
        drop(locks);
        assert!(KeyLock::try_acquire(dir.path(), "b").unwrap().is_some());
    }

    #[test]
    fn shared_store_locks_coexist_and_block_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = StoreLock::shared(dir.path()).unwrap();
        let second = StoreLock::shared(dir.path()).unwrap();
        assert!(StoreLock::try_exclusive(dir.path()).unwrap().is_none());
        drop(first);
        assert!(StoreLock::try_exclusive(dir.path()).unwrap().is_none());
        drop(second);
        assert!(StoreLock::try_exclusive(dir.path()).unwrap().is_some());
    }
}
