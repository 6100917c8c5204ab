//! Collaborators that fetch the registry index and artifact files.

use super::index::{RegistryIndex, SchemaSource, TransformationSource};
use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Fetches the registry index.
pub trait IndexFetcher: Send + Sync {
    /// Returns `None` if the index has not changed since the last fetch.
    fn fetch_index(&self) -> Result<Option<RegistryIndex>>;
}

/// Fetches schema and transformation source files.
pub trait FileFetcher: Send + Sync {
    fn fetch_schema(&self, source: &SchemaSource) -> Result<String>;
    fn fetch_transformation(&self, source: &TransformationSource) -> Result<String>;
}

/// Reads `index.json` from a directory.
pub struct LocalIndexFetcher {
    path: PathBuf,
    last_digest: Mutex<Option<[u8; 32]>>,
}

impl LocalIndexFetcher {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            path: base.as_ref().join("index.json"),
            last_digest: Mutex::new(None),
        }
    }
}

impl IndexFetcher for LocalIndexFetcher {
    fn fetch_index(&self) -> Result<Option<RegistryIndex>> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            StoreError::RegistryFetch(format!("{}: {}", self.path.display(), e))
        })?;
        let digest: [u8; 32] = Sha256::digest(text.as_bytes()).into();

        let mut last = self.last_digest.lock();
        if last.as_ref() == Some(&digest) {
            return Ok(None);
        }
        let index = RegistryIndex::from_json(&text)?;
        *last = Some(digest);
        Ok(Some(index))
    }
}

/// Reads artifacts from paths relative to a directory.
pub struct LocalFileFetcher {
    base: PathBuf,
}

impl LocalFileFetcher {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn read(&self, id: &str, expected_hash: Option<&str>) -> Result<String> {
        let relative = Path::new(id);
        if relative.is_absolute() || relative.components().any(|c| c.as_os_str() == "..") {
            return Err(StoreError::RegistryFetch(format!(
                "refusing to read {} outside the registry",
                id
            )));
        }

        let path = self.base.join(relative);
        let text = fs::read_to_string(&path)
            .map_err(|e| StoreError::RegistryFetch(format!("{}: {}", path.display(), e)))?;

        if let Some(expected) = expected_hash {
            let actual = hex::encode(Sha256::digest(text.as_bytes()));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(StoreError::RegistryFetch(format!(
                    "hash mismatch for {}: expected {}, got {}",
                    id, expected, actual
                )));
            }
        }
        Ok(text)
    }
}

impl FileFetcher for LocalFileFetcher {
    fn fetch_schema(&self, source: &SchemaSource) -> Result<String> {
        self.read(&source.id, source.hash.as_deref())
    }

    fn fetch_transformation(&self, source: &TransformationSource) -> Result<String> {
        self.read(&source.id, source.hash.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sha(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    #[test]
    fn test_local_index_unchanged_returns_none() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.json"), r#"{"schemes": []}"#).unwrap();
        let fetcher = LocalIndexFetcher::new(dir.path());

        assert!(fetcher.fetch_index().unwrap().is_some());
        assert!(fetcher.fetch_index().unwrap().is_none());

        fs::write(
            dir.path().join("index.json"),
            r#"{"schemes": [], "transformations": []}"#,
        )
        .unwrap();
        assert!(fetcher.fetch_index().unwrap().is_some());
    }

    #[test]
    fn test_local_index_missing() {
        let dir = TempDir::new().unwrap();
        let fetcher = LocalIndexFetcher::new(dir.path());
        assert!(matches!(
            fetcher.fetch_index(),
            Err(StoreError::RegistryFetch(_))
        ));
    }

    #[test]
    fn test_local_file_fetch_checks_hash() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("ns/type")).unwrap();
        fs::write(dir.path().join("ns/type/1.json"), "{}").unwrap();
        let fetcher = LocalFileFetcher::new(dir.path());

        let good = SchemaSource::new("ns/type/1.json", sha("{}"), "ns", "type", 1);
        assert_eq!(fetcher.fetch_schema(&good).unwrap(), "{}");

        let bad = SchemaSource::new("ns/type/1.json", "00", "ns", "type", 1);
        assert!(fetcher.fetch_schema(&bad).is_err());

        let escape = TransformationSource::new("../etc/passwd", "ns", "type", None, 1, 2);
        assert!(fetcher.fetch_transformation(&escape).is_err());
    }
}
