//! Local artifact layout and object storage upload.
//!
//! Artifacts are downloaded into `<local_data_dir>/<ds_folder>/<file>.part`. [`StorageManager::store`]
//! only promotes a staging file to its final name if its size matches the size recorded by
//! the source, so truncated downloads never reach the bucket. [`StorageManager::cleanup`] takes
//! the [`Uploaded`] receipt returned by a successful upload, which makes it impossible to
//! delete a local file whose upload failed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const STAGING_SUFFIX: &str = "part";

/// A downloaded file plus what the source told us about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Label of the request that produced it.
    pub request: String,
    pub file_name: String,
    pub local_path: PathBuf,
    /// Bytes written locally.
    pub size: u64,
    /// Size declared by the source (index entry or API report).
    pub expected_size: u64,
}

/// Outcome of streaming a remote resource to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Download {
    pub bytes: u64,
    /// Size reported by the remote side, if any.
    pub declared_size: Option<u64>,
}

/// Proof that `local_path` was uploaded under `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    pub local_path: PathBuf,
    pub key: String,
}

/// Durable object storage. Putting the same key twice with identical content must succeed.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, path: &Path) -> Result<()>;

    fn describe(&self) -> String;
}

/// Select a store from the configured bucket: `file://` URIs map to a local directory,
/// anything else is an S3 bucket name.
pub fn object_store_for(bucket: &str, region: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
    if bucket.starts_with("file://") {
        let url = url::Url::parse(bucket)?;
        let root = url
            .to_file_path()
            .map_err(|_| Error::config(format!("invalid file bucket: {bucket}")))?;
        Ok(Arc::new(LocalObjectStore::new(root)))
    } else {
        Ok(Arc::new(S3ObjectStore::new(bucket, region)?))
    }
}

/// Directory backed store, mostly for dry runs and local mirrors.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, key: &str, path: &Path) -> Result<()> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if let (Ok(existing), Ok(local)) = (fs::metadata(&dest), fs::metadata(path)) {
            if existing.len() == local.len() && fs::read(&dest)? == fs::read(path)? {
                debug!("{key} already stored with identical content");
                return Ok(());
            }
        }

        fs::copy(path, &dest)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// AWS S3 bucket. The SDK is async, so the store drives it from its own runtime.
pub struct S3ObjectStore {
    runtime: tokio::runtime::Runtime,
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(bucket: &str, region: Option<&str>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = runtime.block_on(loader.load());

        Ok(Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            runtime,
            bucket: bucket.to_string(),
        })
    }
}

impl ObjectStore for S3ObjectStore {
    /// S3 PUT overwrites, so re-uploading identical content is a no-op success.
    fn put(&self, key: &str, path: &Path) -> Result<()> {
        self.runtime.block_on(async {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| Error::Storage(format!("cannot read {}: {e}", path.display())))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| Error::Storage(format!("put s3://{}/{key}: {}", self.bucket, DisplayErrorContext(&e))))?;
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Persists, uploads and removes the artifacts of one dataset source.
#[derive(Clone)]
pub struct StorageManager {
    dataset_dir: PathBuf,
    folder: String,
    store: Arc<dyn ObjectStore>,
}

impl StorageManager {
    pub fn new(local_data_dir: &Path, folder: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            dataset_dir: local_data_dir.join(folder),
            folder: folder.to_string(),
            store,
        }
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn final_path(&self, file_name: &str) -> PathBuf {
        self.dataset_dir.join(file_name)
    }

    /// Where an adapter writes a download in progress. Creates the dataset directory.
    pub fn staging_path(&self, file_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dataset_dir)?;
        Ok(self.dataset_dir.join(format!("{file_name}.{STAGING_SUFFIX}")))
    }

    /// Object key of a file: `<ds_folder>/<file_name>`.
    pub fn remote_key(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.folder)
    }

    /// Promote a downloaded artifact to its final local path after checking its size
    /// against the size declared by the source.
    pub fn store(&self, artifact: &Artifact) -> Result<PathBuf> {
        let on_disk = fs::metadata(&artifact.local_path)?.len();
        if on_disk != artifact.expected_size {
            warn!(
                "{}: local size {on_disk} differs from declared size {}, not storing",
                artifact.file_name, artifact.expected_size
            );
            return Err(Error::Integrity {
                expected: artifact.expected_size,
                actual: on_disk,
            });
        }

        fs::create_dir_all(&self.dataset_dir)?;
        let dest = self.final_path(&artifact.file_name);
        if artifact.local_path != dest {
            fs::rename(&artifact.local_path, &dest)?;
        }
        debug!("stored {} ({on_disk} bytes)", dest.display());
        Ok(dest)
    }

    pub fn upload(&self, local_path: &Path) -> Result<Uploaded> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Storage(format!("not a file path: {}", local_path.display())))?;
        let key = self.remote_key(file_name);

        self.store.put(&key, local_path).map_err(|e| match e {
            Error::Storage(_) => e,
            other => Error::Storage(other.to_string()),
        })?;

        info!("uploaded {} to {}/{key}", local_path.display(), self.store.describe());
        Ok(Uploaded {
            local_path: local_path.to_path_buf(),
            key,
        })
    }

    /// Remove the local copy of an uploaded file. Failures are logged, never fatal.
    pub fn cleanup(&self, uploaded: Uploaded) -> String {
        match fs::remove_file(&uploaded.local_path) {
            Ok(()) => debug!("removed {}", uploaded.local_path.display()),
            Err(e) => warn!("cleanup of {} failed: {e}", uploaded.local_path.display()),
        }
        uploaded.key
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;

    /// Store that records keys, optionally failing every put.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub(crate) keys: Mutex<Vec<String>>,
        pub(crate) fail: bool,
    }

    impl ObjectStore for RecordingStore {
        fn put(&self, key: &str, path: &Path) -> Result<()> {
            assert!(path.exists(), "uploading a missing file");
            if self.fail {
                return Err(Error::Storage("bucket unavailable".into()));
            }
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }

        fn describe(&self) -> String {
            "memory://".into()
        }
    }

    fn artifact(mgr: &StorageManager, name: &str, content: &[u8], expected: u64) -> Artifact {
        let path = mgr.staging_path(name).unwrap();
        fs::write(&path, content).unwrap();
        Artifact {
            request: name.into(),
            file_name: name.into(),
            local_path: path,
            size: content.len() as u64,
            expected_size: expected,
        }
    }

    #[test]
    fn store_upload_cleanup_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(bucket.path()));
        let mgr = StorageManager::new(tmp.path(), "0001-era5", store.clone());

        let a = artifact(&mgr, "a.nc", b"hello", 5);
        let path = mgr.store(&a).unwrap();
        assert_eq!(path, tmp.path().join("0001-era5").join("a.nc"));
        assert!(!a.local_path.exists());

        let uploaded = mgr.upload(&path).unwrap();
        assert_eq!(uploaded.key, "0001-era5/a.nc");
        assert_eq!(fs::read(store.object_path("0001-era5/a.nc")).unwrap(), b"hello");

        // identical re-upload is a no-op success
        assert_eq!(mgr.upload(&path).unwrap().key, "0001-era5/a.nc");

        assert_eq!(mgr.cleanup(uploaded.clone()), "0001-era5/a.nc");
        assert!(!path.exists());

        // second cleanup of a vanished file is only logged
        mgr.cleanup(uploaded);
    }

    #[test]
    fn store_rejects_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mgr = StorageManager::new(tmp.path(), "ds", Arc::new(RecordingStore::default()));

        let a = artifact(&mgr, "b.grib2", b"abc", 4);
        let err = mgr.store(&a).unwrap_err();
        assert!(matches!(err, Error::Integrity { expected: 4, actual: 3 }));
        assert!(!mgr.final_path("b.grib2").exists());
    }

    #[test]
    fn failed_upload_keeps_local_file() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RecordingStore { fail: true, ..Default::default() });
        let mgr = StorageManager::new(tmp.path(), "ds", store);

        let a = artifact(&mgr, "c.nc", b"xyz", 3);
        let path = mgr.store(&a).unwrap();
        assert!(matches!(mgr.upload(&path), Err(Error::Storage(_))));
        assert!(path.exists());
    }

    #[test]
    fn file_bucket_selects_local_store() {
        let store = object_store_for("file:///tmp/indra-bucket", None).unwrap();
        assert_eq!(store.describe(), "file:///tmp/indra-bucket");
    }
}
