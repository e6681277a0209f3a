use super::{extension_for_mime, sanitize_path_component, AssetStore};
use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Asset store writing into an S3-compatible bucket
pub struct S3AssetStore {
    client: S3Client,
    bucket: String,
    folder: String,
    public_base_url: String,
}

impl S3AssetStore {
    /// Create a new S3 asset store
    pub async fn new(config: &S3Config, folder: &str) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            folder = %folder,
            "S3 asset store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            folder: sanitize_path_component(folder),
            public_base_url: public_base_url(config),
        })
    }

    /// Object key: {folder}/{date}/{uuid}.{ext}
    fn object_key(&self, mime_type: &str, now: DateTime<Utc>, id: Uuid) -> String {
        format!(
            "{folder}/{date}/{id}.{ext}",
            folder = self.folder,
            date = now.format("%Y-%m-%d"),
            id = id,
            ext = extension_for_mime(mime_type)
        )
    }
}

/// Base URL objects are reachable under
fn public_base_url(config: &S3Config) -> String {
    if let Some(ref base) = config.public_base_url {
        return base.trim_end_matches('/').to_string();
    }

    match config.endpoint_url {
        Some(ref endpoint) if config.force_path_style => {
            format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket)
        }
        Some(ref endpoint) => {
            let endpoint = endpoint.trim_end_matches('/');
            match endpoint.split_once("://") {
                Some((scheme, host)) => format!("{}://{}.{}", scheme, config.bucket, host),
                None => format!("https://{}.{}", config.bucket, endpoint),
            }
        }
        None => format!(
            "https://{}.s3.{}.amazonaws.com",
            config.bucket, config.region
        ),
    }
}

#[async_trait]
impl AssetStore for S3AssetStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload(&self, data: &[u8], mime_type: &str) -> Result<String> {
        let key = self.object_key(mime_type, Utc::now(), Uuid::new_v4());

        debug!(s3_key = %key, "Uploading asset to S3");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .content_type(mime_type)
            .send()
            .await
            .context("Failed to upload asset to S3")?;

        let url = format!("{}/{}", self.public_base_url, key);

        info!(url = %url, size_bytes = data.len(), "Asset uploaded");

        Ok(url)
    }
}
