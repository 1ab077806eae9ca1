//! blake3 content checksums over files and directory trees.

use imagebuilder_schema::Checksum;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

fn hash_file(path: &Path) -> Result<blake3::Hash, ChecksumError> {
    let read_err = |source| ChecksumError::Read {
        path: path.display().to_string(),
        source,
    };
    let mut file = File::open(path).map_err(read_err)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Checksum a file, or a directory tree deterministically.
///
/// Directory entries are visited in file-name order; each contributes its
/// relative path (with `/` separators) and, for files, the file's own hash.
/// Timestamps and permissions are ignored.
pub fn checksum_path(path: &Path) -> Result<Checksum, ChecksumError> {
    let meta = std::fs::metadata(path).map_err(|source| ChecksumError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if meta.is_file() {
        return Ok(Checksum::new(hash_file(path)?.to_hex().to_string()));
    }

    let mut hasher = blake3::Hasher::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(path) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            hasher.update(b"D:");
            hasher.update(rel.as_bytes());
            hasher.update(b"\n");
        } else if entry.file_type().is_file() {
            let file_hash = hash_file(entry.path())?;
            hasher.update(b"F:");
            hasher.update(rel.as_bytes());
            hasher.update(b":");
            hasher.update(file_hash.to_hex().as_bytes());
            hasher.update(b"\n");
        }
    }
    Ok(Checksum::new(hasher.finalize().to_hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_checksum_matches_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a.txt");
        fs::write(&f, b"hello").unwrap();
        let c = checksum_path(&f).unwrap();
        assert_eq!(c, blake3::hash(b"hello").to_hex().to_string());
    }

    #[test]
    fn directory_checksum_is_deterministic() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for root in [a.path(), b.path()] {
            fs::create_dir_all(root.join("bin")).unwrap();
            fs::write(root.join("bin/app"), b"binary").unwrap();
            fs::write(root.join("readme"), b"docs").unwrap();
        }
        assert_eq!(
            checksum_path(a.path()).unwrap(),
            checksum_path(b.path()).unwrap()
        );
    }

    #[test]
    fn directory_checksum_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"one").unwrap();
        let before = checksum_path(dir.path()).unwrap();
        fs::write(dir.path().join("f"), b"two").unwrap();
        assert_ne!(before, checksum_path(dir.path()).unwrap());
    }

    #[test]
    fn directory_checksum_changes_with_rename() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"same").unwrap();
        let before = checksum_path(dir.path()).unwrap();
        fs::rename(dir.path().join("f"), dir.path().join("g")).unwrap();
        assert_ne!(before, checksum_path(dir.path()).unwrap());
    }

    #[test]
    fn missing_path_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            checksum_path(&dir.path().join("nope")),
            Err(ChecksumError::Read { .. })
        ));
    }
}
