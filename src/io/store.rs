//! Object storage access for request inputs and merged results.
//!
//! Remote references look like `minio://bucket/key` or `s3://bucket/key`.
//! Buckets live either on an S3-compatible endpoint or, for local runs and
//! tests, as subdirectories of a filesystem root.

use crate::config::StorageConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, ObjectStoreExt, PutPayload, RetryConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const REMOTE_SCHEMES: [&str; 2] = ["minio", "s3"];

/// A parsed `scheme://bucket/key` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri<'a> {
    pub scheme: &'a str,
    pub bucket: &'a str,
    pub key: &'a str,
}

/// Whether `uri` names a remote object rather than a local path.
pub fn is_remote(uri: &str) -> bool {
    uri.split_once("://")
        .is_some_and(|(scheme, _)| REMOTE_SCHEMES.contains(&scheme))
}

/// Parse an object URI into scheme, bucket and key.
///
/// # Errors
/// Returns an error for unknown schemes or when bucket or key is missing.
pub fn parse_object_uri(uri: &str) -> Result<ObjectUri<'_>> {
    let (scheme, rest) = uri
        .split_once("://")
        .with_context(|| format!("Invalid object URI: expected 'scheme://' prefix in '{}'", uri))?;

    if !REMOTE_SCHEMES.contains(&scheme) {
        anyhow::bail!("Invalid object URI: unsupported scheme '{}' in '{}'", scheme, uri);
    }

    let (bucket, key) = rest
        .split_once('/')
        .with_context(|| format!("Invalid object URI: expected '{}://bucket/key' format in '{}'", scheme, uri))?;

    if bucket.is_empty() || key.is_empty() {
        anyhow::bail!("Invalid object URI: missing bucket or key in '{}'", uri);
    }

    Ok(ObjectUri { scheme, bucket, key })
}

fn create_client_options(allow_http: bool) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(120))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_allow_http(allow_http)
}

fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

#[derive(Debug, Clone)]
enum Backend {
    /// Each bucket is a directory under `root`.
    Local { root: PathBuf },
    /// S3-compatible service (MinIO, AWS).
    S3 {
        endpoint: Option<String>,
        region: String,
        allow_http: bool,
        anonymous: bool,
    },
}

/// Fetch-by-URI / put-returns-URI access to buckets.
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    backend: Backend,
    uri_scheme: String,
}

impl ObjectStorage {
    /// Storage backed by directories under `root`.
    pub fn local(root: impl Into<PathBuf>, uri_scheme: impl Into<String>) -> Self {
        Self {
            backend: Backend::Local { root: root.into() },
            uri_scheme: uri_scheme.into(),
        }
    }

    /// Build storage from configuration.
    ///
    /// S3 credentials are read from the environment (`AWS_ACCESS_KEY_ID`,
    /// `AWS_SECRET_ACCESS_KEY`) unless `anonymous` is set.
    pub fn from_config(config: &StorageConfig) -> Self {
        let backend = match &config.local_root {
            Some(root) => Backend::Local {
                root: PathBuf::from(root),
            },
            None => Backend::S3 {
                endpoint: config.endpoint.clone(),
                region: config.region.clone(),
                allow_http: config.allow_http,
                anonymous: config.anonymous,
            },
        };
        Self {
            backend,
            uri_scheme: config.uri_scheme.clone(),
        }
    }

    fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        match &self.backend {
            Backend::Local { root } => {
                let dir = root.join(bucket);
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create bucket directory {}", dir.display()))?;
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&dir)?))
            }
            Backend::S3 {
                endpoint,
                region,
                allow_http,
                anonymous,
            } => {
                tracing::debug!("Creating S3 client for bucket: {}", bucket);
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region)
                    .with_client_options(create_client_options(*allow_http))
                    .with_retry(create_retry_config());

                if let Some(endpoint) = endpoint {
                    // MinIO serves path-style requests.
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_virtual_hosted_style_request(false);
                }
                if *anonymous {
                    builder = builder.with_skip_signature(true);
                }
                Ok(Arc::new(builder.build()?))
            }
        }
    }

    /// Resolve `uri` to a local file.
    ///
    /// Remote objects are downloaded into `dest_dir` under their key's final
    /// path segment; local paths are returned as-is after an existence check.
    pub async fn fetch(&self, uri: &str, dest_dir: &Path) -> Result<PathBuf> {
        if !is_remote(uri) {
            let path = PathBuf::from(uri);
            if !path.is_file() {
                anyhow::bail!("Input file not found: {}", path.display());
            }
            return Ok(path);
        }

        let parsed = parse_object_uri(uri)?;
        let store = self.store_for(parsed.bucket)?;
        let file_name = parsed.key.rsplit('/').next().unwrap_or(parsed.key);
        let dest = dest_dir.join(file_name);

        tracing::info!("Downloading {} to {}", uri, dest.display());
        let data = store
            .get(&ObjectPath::from(parsed.key))
            .await
            .with_context(|| format!("Failed to read {}", uri))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", uri))?;

        tokio::fs::write(&dest, &data)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        Ok(dest)
    }

    /// Upload `local_path` as `object_name` in `bucket` and return its URI.
    pub async fn store(&self, local_path: &Path, bucket: &str, object_name: &str) -> Result<String> {
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;

        let store = self.store_for(bucket)?;
        store
            .put(&ObjectPath::from(object_name), PutPayload::from(Bytes::from(data)))
            .await
            .with_context(|| format!("Failed to upload {} to bucket {}", local_path.display(), bucket))?;

        let uri = format!("{}://{}/{}", self.uri_scheme, bucket, object_name);
        tracing::info!("Uploaded {} to {}", local_path.display(), uri);
        Ok(uri)
    }
}
