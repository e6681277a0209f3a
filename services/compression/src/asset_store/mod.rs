//! Asset host gateway.
//!
//! Each upload is a single call to the configured provider and yields the
//! durable URL of the stored asset. Failures propagate; nothing is retried.

mod cloudinary;
mod s3;

pub use cloudinary::CloudinaryStore;
pub use s3::S3AssetStore;

use crate::config::{AssetProvider, AssetStoreConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;

/// Remote store for uploaded and compressed images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Upload `data` and return its durable URL
    async fn upload(&self, data: &[u8], mime_type: &str) -> Result<String>;
}

/// Build the provider selected in configuration
pub async fn build_asset_store(config: &AssetStoreConfig) -> Result<Arc<dyn AssetStore>> {
    let store: Arc<dyn AssetStore> = match config.provider {
        AssetProvider::Cloudinary => {
            let cloudinary = config
                .cloudinary
                .as_ref()
                .context("asset_store.cloudinary must be configured for the cloudinary provider")?;
            Arc::new(CloudinaryStore::new(cloudinary, config)?)
        }
        AssetProvider::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .context("asset_store.s3 must be configured for the s3 provider")?;
            Arc::new(S3AssetStore::new(s3, &config.folder).await?)
        }
    };

    Ok(store)
}

/// `data:<mime>;base64,<payload>`
pub fn data_uri(data: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(data))
}

/// File extension for an image MIME type
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Sanitize a path component to prevent path traversal
pub(crate) fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri() {
        assert_eq!(data_uri(b"abc", "image/png"), "data:image/png;base64,YWJj");
        assert_eq!(data_uri(b"", "image/jpeg"), "data:image/jpeg;base64,");
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("text/plain"), "bin");
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("ai-compression"), "ai-compression");
        assert_eq!(sanitize_path_component("a/b"), "a_b");
        assert_eq!(sanitize_path_component("../etc"), "___etc");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }

    #[tokio::test]
    async fn test_missing_provider_section_is_an_error() {
        let config = AssetStoreConfig {
            provider: AssetProvider::Cloudinary,
            folder: "ai-compression".to_string(),
            timeout_secs: 5,
            cloudinary: None,
            s3: None,
        };

        let err = build_asset_store(&config).await.err().unwrap();
        assert!(err.to_string().contains("asset_store.cloudinary"));
    }
}
