use std::io::ErrorKind as IoErrorKind;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;

use super::sha256_hex;
use super::ObjectStore;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::StorageLocation;

/// Object storage rooted at a local directory, laid out as
/// `{root}/{bucket}/{key}` with a `.sha256` sidecar per object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

fn io_err(what: &str, path: &Path, err: std::io::Error) -> EngineError {
    EngineError::TransientNetwork(format!("{what} {path:?}: {err}"))
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, location: &StorageLocation) -> Result<PathBuf> {
        let rel = Path::new(&location.bucket).join(&location.key);
        if location.bucket.is_empty()
            || location.key.is_empty()
            || !rel.components().all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(EngineError::Config(format!(
                "invalid object location {location}"
            )));
        }
        Ok(self.root.join(rel))
    }

    fn sidecar(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".sha256");
        PathBuf::from(name)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, location: &StorageLocation, data: Vec<u8>) -> Result<()> {
        let path = self.path(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_err("creating", parent, err))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|err| io_err("writing", &tmp, err))?;
        // Linking fails on an existing target, which makes the put
        // write-once without a window where a partial object is
        // visible.
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                tokio::fs::write(Self::sidecar(&path), sha256_hex(&data))
                    .await
                    .map_err(|err| io_err("writing checksum for", &path, err))?;
                tracing::debug!("Stored {} bytes at {location}", data.len());
                Ok(())
            }
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => Err(EngineError::Conflict(
                format!("object {location} already exists"),
            )),
            Err(err) => Err(io_err("linking", &path, err)),
        }
    }

    async fn get(&self, location: &StorageLocation) -> Result<Vec<u8>> {
        let path = self.path(location)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                Err(EngineError::NotFound(format!("object {location}")))
            }
            Err(err) => Err(io_err("reading", &path, err)),
        }
    }

    async fn checksum(&self, location: &StorageLocation) -> Result<Option<String>> {
        let path = self.path(location)?;
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|err| io_err("checking", &path, err))?
        {
            return Err(EngineError::NotFound(format!("object {location}")));
        }
        match tokio::fs::read_to_string(Self::sidecar(&path)).await {
            Ok(sum) => Ok(Some(sum.trim().to_string())),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err("reading checksum for", &path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::errors::ErrorKind;

    fn loc(key: &str) -> StorageLocation {
        StorageLocation {
            bucket: "snaps".into(),
            key: key.into(),
        }
    }

    #[tokio::test]
    async fn put_get_checksum() {
        let root = tempdir().unwrap();
        let store = FsObjectStore::new(root.path());
        store.put(&loc("w1/a.tar.gz"), b"test".to_vec()).await.unwrap();

        assert_eq!(store.get(&loc("w1/a.tar.gz")).await.unwrap(), b"test");
        assert_eq!(
            store.checksum(&loc("w1/a.tar.gz")).await.unwrap().as_deref(),
            Some("9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08")
        );
    }

    #[tokio::test]
    async fn objects_are_write_once() {
        let root = tempdir().unwrap();
        let store = FsObjectStore::new(root.path());
        store.put(&loc("k"), b"one".to_vec()).await.unwrap();
        let err = store.put(&loc("k"), b"two".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(store.get(&loc("k")).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn rejects_escaping_keys_and_missing_objects() {
        let root = tempdir().unwrap();
        let store = FsObjectStore::new(root.path());
        let err = store.get(&loc("../../etc/passwd")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = store.get(&loc("absent")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
