use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/// Key/value blob contract backing identity, trust, and profile caches.
/// The core never assumes anything about where blobs live.
pub trait BlobStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
}

/// Filesystem-backed store rooted at a single directory. Blob paths are
/// relative, forward-slash separated.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Platform data directory for the default store location.
    pub fn default_location() -> Option<PathBuf> {
        ProjectDirs::from("tv", "lanlink", "lanlink").map(|dirs| dirs.data_dir().to_path_buf())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != "..") {
            full.push(part);
        }
        full
    }
}

impl BlobStore for FsBlobStore {
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.resolve(path);
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read blob {path}")),
        }
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create blob directory for {path}"))?;
        }
        fs::write(&full, bytes).with_context(|| format!("failed to write blob {path}"))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete blob {path}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_missing_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(store.read("profiles/x/playlist.m3u").unwrap().is_none());
        store
            .write("profiles/x/playlist.m3u", b"#EXTM3U\n")
            .unwrap();
        assert_eq!(
            store.read("profiles/x/playlist.m3u").unwrap().unwrap(),
            b"#EXTM3U\n"
        );

        store.delete("profiles/x/playlist.m3u").unwrap();
        assert!(store.read("profiles/x/playlist.m3u").unwrap().is_none());
        // deleting again is a no-op
        store.delete("profiles/x/playlist.m3u").unwrap();
    }

    #[test]
    fn parent_traversal_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.write("../escape.txt", b"nope").unwrap();
        assert!(dir.path().join("escape.txt").exists());
    }
}
