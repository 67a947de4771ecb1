use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::ServerSideEncryption;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Time-limited upload/download URLs plus the handful of object operations
/// the dispatch core needs. Implementations are injected so tests can run
/// against an in-memory double.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Presigned PUT URL and the headers the uploader must send with it.
    async fn presign_put(&self, key: &str) -> Result<(String, HashMap<String, String>)>;
    async fn presign_get(&self, key: &str) -> Result<String>;
    async fn head_object_size(&self, key: &str) -> Result<i64>;
    async fn object_exists(&self, key: &str) -> Result<bool>;
    async fn put_file(&self, path: &Path, key: &str) -> Result<()>;
    async fn get_file(&self, key: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint_url: Option<String>,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
    pub presign_expiry: Duration,
    pub sse_algorithm: String,
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    presign_expiry: Duration,
    sse_algorithm: String,
}

impl S3Store {
    pub async fn connect(settings: &S3Settings) -> Result<Self> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            None,
            None,
            "dispatch",
        );
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base)
            .force_path_style(settings.force_path_style);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint.clone());
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket: settings.bucket.clone(),
            presign_expiry: settings.presign_expiry,
            sse_algorithm: settings.sse_algorithm.clone(),
        })
    }

    /// Creates the bucket if it does not exist yet (local object stores).
    pub async fn ensure_bucket(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .context("create bucket")?;
        Ok(())
    }

    fn presigning(&self) -> Result<PresigningConfig> {
        PresigningConfig::expires_in(self.presign_expiry).context("build presigning config")
    }

    fn sse(&self) -> ServerSideEncryption {
        ServerSideEncryption::from(self.sse_algorithm.as_str())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn presign_put(&self, key: &str) -> Result<(String, HashMap<String, String>)> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .server_side_encryption(self.sse())
            .presigned(self.presigning()?)
            .await
            .context("presign put")?;
        let headers = HashMap::from([(
            "x-amz-server-side-encryption".to_string(),
            self.sse_algorithm.clone(),
        )]);
        Ok((presigned.uri().to_string(), headers))
    }

    async fn presign_get(&self, key: &str) -> Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning()?)
            .await
            .context("presign get")?;
        Ok(presigned.uri().to_string())
    }

    async fn head_object_size(&self, key: &str) -> Result<i64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("head object")?;
        Ok(head.content_length().unwrap_or(0))
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .is_ok())
    }

    async fn put_file(&self, path: &Path, key: &str) -> Result<()> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
            .await
            .context("open file for upload")?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .server_side_encryption(self.sse())
            .body(body)
            .send()
            .await
            .context("put object")?;
        Ok(())
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<()> {
        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("get object")?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .context("create download file")?;
        while let Some(chunk) = object.body.try_next().await.context("read object body")? {
            file.write_all(&chunk).await.context("write object chunk")?;
        }
        file.flush().await.context("flush download file")?;
        Ok(())
    }
}

/// In-memory double: keys map to fake sizes, presigned URLs are synthetic.
#[derive(Default)]
pub struct MemoryStore {
    objects: std::sync::Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn with_object(self, key: &str, size: i64) -> Self {
        self.objects.lock().unwrap().insert(key.to_string(), size);
        self
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn presign_put(&self, key: &str) -> Result<(String, HashMap<String, String>)> {
        Ok((
            format!("memory://put/{key}"),
            HashMap::from([(
                "x-amz-server-side-encryption".to_string(),
                "AES256".to_string(),
            )]),
        ))
    }

    async fn presign_get(&self, key: &str) -> Result<String> {
        Ok(format!("memory://get/{key}"))
    }

    async fn head_object_size(&self, key: &str) -> Result<i64> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .with_context(|| format!("no such object: {key}"))
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn put_file(&self, path: &Path, key: &str) -> Result<()> {
        let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), size as i64);
        Ok(())
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<()> {
        if !self.object_exists(key).await? {
            anyhow::bail!("no such object: {key}");
        }
        tokio::fs::write(dest, b"").await.context("write stub file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_tracks_objects() {
        let store = MemoryStore::default().with_object("bundles/u/abc.zip", 42);
        assert!(store.object_exists("bundles/u/abc.zip").await.unwrap());
        assert_eq!(store.head_object_size("bundles/u/abc.zip").await.unwrap(), 42);
        assert!(!store.object_exists("missing").await.unwrap());
        assert!(store.head_object_size("missing").await.is_err());
    }
}
