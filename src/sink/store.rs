//! Uploads flushed buffers as objects
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore,
    PutPayload,
};
use tracing::debug;
use uuid::Uuid;

use super::Uploader;
use crate::{
    error::{SinkError, UploadError},
    settings::{ObjectStoreSettings, StoreKind},
};

const DEFAULT_PREFIX: &str = "logs";

pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreUploader {
    pub fn new(settings: &ObjectStoreSettings) -> Result<Self, SinkError> {
        let store: Arc<dyn ObjectStore> = match settings.store {
            StoreKind::S3 => {
                let bucket = settings
                    .bucket
                    .as_deref()
                    .ok_or_else(|| SinkError::Configuration(String::from("s3 bucket missing")))?;
                let region = settings
                    .region
                    .as_deref()
                    .ok_or_else(|| SinkError::Configuration(String::from("s3 region missing")))?;
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region);
                if let Some(endpoint) = &settings.endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                match (&settings.access_key_id, &settings.secret_access_key) {
                    (Some(key), Some(secret)) => {
                        builder = builder
                            .with_access_key_id(key)
                            .with_secret_access_key(secret);
                    }
                    (None, None) => {}
                    _ => {
                        return Err(SinkError::Configuration(String::from(
                            "s3 access key id and secret must be set together",
                        )))
                    }
                }
                Arc::new(builder.build().map_err(|e| {
                    SinkError::Configuration(format!("creating s3 store: {e}"))
                })?)
            }
            StoreKind::Local => {
                let path = settings.path.as_deref().ok_or_else(|| {
                    SinkError::Configuration(String::from("local store path missing"))
                })?;
                std::fs::create_dir_all(path).map_err(|e| {
                    SinkError::Configuration(format!("creating directory {path}: {e}"))
                })?;
                Arc::new(LocalFileSystem::new_with_prefix(path).map_err(|e| {
                    SinkError::Configuration(format!("creating local store: {e}"))
                })?)
            }
            StoreKind::Memory => Arc::new(InMemory::new()),
        };
        Ok(Self::with_store(
            store,
            settings.prefix.as_deref().unwrap_or(DEFAULT_PREFIX),
        ))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        ObjectStoreUploader {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }
}

/// `{prefix}/{topic}/{YYYY}/{MM}/{DD}/{HH}/{YYYYMMDDTHHMMSS}-{uuid}.log`
pub fn object_key(prefix: &str, topic: &str, at: DateTime<Utc>, id: Uuid) -> Path {
    Path::from(format!(
        "{prefix}/{topic}/{}/{}-{id}.log",
        at.format("%Y/%m/%d/%H"),
        at.format("%Y%m%dT%H%M%S"),
    ))
}

#[async_trait]
impl Uploader for ObjectStoreUploader {
    fn name(&self) -> &'static str {
        "object_store"
    }

    async fn upload(&self, topic: &str, content: Vec<u8>) -> Result<(), UploadError> {
        let key = object_key(&self.prefix, topic, Utc::now(), Uuid::new_v4());
        let bytes = content.len();
        self.store.put(&key, PutPayload::from(content)).await?;
        debug!(topic, %key, bytes, "uploaded object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use futures::TryStreamExt;

    use super::*;

    #[test]
    fn keys_are_partitioned_by_hour() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let id = Uuid::nil();
        assert_eq!(
            object_key("logs", "orders_eu", at, id).as_ref(),
            "logs/orders_eu/2024/03/09/07/20240309T070501-00000000-0000-0000-0000-000000000000.log"
        );
    }

    #[tokio::test]
    async fn uploads_content_under_topic_prefix() {
        let store = Arc::new(InMemory::new());
        let uploader = ObjectStoreUploader::with_store(store.clone(), "/archive/");
        uploader
            .upload("orders_eu", b"a\nb\n".to_vec())
            .await
            .unwrap();

        let objects: Vec<_> = store
            .list(Some(&Path::from("archive/orders_eu")))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
        let body = store.get(&objects[0].location).await.unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], b"a\nb\n");
    }

    #[test]
    fn validates_settings() {
        let mut settings = ObjectStoreSettings {
            store: StoreKind::S3,
            bucket: None,
            region: Some(String::from("eu-west-1")),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            path: None,
            prefix: None,
            format: None,
        };
        assert!(matches!(
            ObjectStoreUploader::new(&settings),
            Err(SinkError::Configuration(_))
        ));
        settings.bucket = Some(String::from("archive"));
        settings.access_key_id = Some(String::from("key"));
        assert!(matches!(
            ObjectStoreUploader::new(&settings),
            Err(SinkError::Configuration(_))
        ));

        settings.store = StoreKind::Local;
        assert!(ObjectStoreUploader::new(&settings).is_err());
        let dir = tempfile::tempdir().unwrap();
        settings.path = Some(dir.path().join("nested").to_string_lossy().into_owned());
        assert!(ObjectStoreUploader::new(&settings).is_ok());
    }
}
