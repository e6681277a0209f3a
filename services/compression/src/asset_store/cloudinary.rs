use super::{data_uri, AssetStore};
use crate::config::{AssetStoreConfig, CloudinaryConfig};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Incoming transformation: automatic quality, automatic delivery format
const AUTO_TRANSFORMATION: &str = "q_auto/f_auto";

/// Signed uploads to the Cloudinary upload API
pub struct CloudinaryStore {
    client: reqwest::Client,
    upload_url: String,
    api_key: String,
    api_secret: String,
    folder: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    error: Option<UploadError>,
}

#[derive(Debug, Deserialize)]
struct UploadError {
    message: String,
}

impl CloudinaryStore {
    pub fn new(config: &CloudinaryConfig, store: &AssetStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(store.timeout_secs))
            .build()
            .context("Failed to build asset host HTTP client")?;

        // `auto` lets the host detect the resource type
        let upload_url = format!(
            "{}/v1_1/{}/auto/upload",
            config.base_url.trim_end_matches('/'),
            config.cloud_name
        );

        info!(
            cloud_name = %config.cloud_name,
            folder = %store.folder,
            "Cloudinary asset store initialized"
        );

        Ok(Self {
            client,
            upload_url,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            folder: store.folder.clone(),
        })
    }

    /// Parameters covered by the signature, in any order
    fn signed_params(&self, timestamp: i64) -> Vec<(&'static str, String)> {
        vec![
            ("folder", self.folder.clone()),
            ("timestamp", timestamp.to_string()),
            ("transformation", AUTO_TRANSFORMATION.to_string()),
        ]
    }
}

/// SHA-1 over `k1=v1&k2=v2...` sorted by key, with the secret appended
fn sign(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");

    hex::encode(Sha1::digest(format!("{}{}", joined, api_secret).as_bytes()))
}

#[async_trait]
impl AssetStore for CloudinaryStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload(&self, data: &[u8], mime_type: &str) -> Result<String> {
        let timestamp = chrono::Utc::now().timestamp();
        let mut form = self.signed_params(timestamp);
        let signature = sign(&form, &self.api_secret);

        form.push(("api_key", self.api_key.clone()));
        form.push(("signature", signature));
        form.push(("file", data_uri(data, mime_type)));

        debug!(url = %self.upload_url, "Uploading asset to Cloudinary");

        let response = self
            .client
            .post(&self.upload_url)
            .form(&form)
            .send()
            .await
            .context("Failed to upload asset to Cloudinary")?;

        let status = response.status();
        let body: UploadResponse = response
            .json()
            .await
            .context("Failed to decode Cloudinary upload response")?;

        if let Some(error) = body.error {
            bail!("Cloudinary upload failed ({}): {}", status, error.message);
        }
        if !status.is_success() {
            bail!("Cloudinary upload failed with status {}", status);
        }

        let url = body
            .secure_url
            .context("Cloudinary upload response has no secure_url")?;

        info!(url = %url, size_bytes = data.len(), "Asset uploaded");

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{http::StatusCode, routing::post, Form, Json, Router};
    use std::collections::HashMap;

    fn store() -> CloudinaryStore {
        store_at("https://api.cloudinary.com/")
    }

    fn store_at(base_url: &str) -> CloudinaryStore {
        CloudinaryStore::new(
            &CloudinaryConfig {
                cloud_name: "demo".to_string(),
                api_key: "1234".to_string(),
                api_secret: "abcd".to_string(),
                base_url: base_url.to_string(),
            },
            &AssetStoreConfig {
                provider: crate::config::AssetProvider::Cloudinary,
                folder: "ai-compression".to_string(),
                timeout_secs: 10,
                cloudinary: None,
                s3: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_upload_url() {
        assert_eq!(
            store().upload_url,
            "https://api.cloudinary.com/v1_1/demo/auto/upload"
        );
    }

    #[test]
    fn test_signature_is_order_independent() {
        let a = vec![
            ("timestamp", "1315060510".to_string()),
            ("folder", "ai-compression".to_string()),
        ];
        let b = vec![
            ("folder", "ai-compression".to_string()),
            ("timestamp", "1315060510".to_string()),
        ];

        assert_eq!(sign(&a, "secret"), sign(&b, "secret"));
        assert_ne!(sign(&a, "secret"), sign(&a, "other"));
    }

    #[test]
    fn test_signature_matches_sha1_of_sorted_params() {
        let params = vec![
            ("timestamp", "1315060510".to_string()),
            ("public_id", "sample_image".to_string()),
            ("eager", "w_400,h_300,c_pad|w_260,h_200,c_crop".to_string()),
        ];

        let expected = hex::encode(Sha1::digest(
            b"eager=w_400,h_300,c_pad|w_260,h_200,c_crop&public_id=sample_image&timestamp=1315060510abcd",
        ));
        assert_eq!(sign(&params, "abcd"), expected);
        assert_eq!(expected.len(), 40);
    }

    #[test]
    fn test_signed_params_include_folder_and_transformation() {
        let params = store().signed_params(42);
        assert!(params.contains(&("folder", "ai-compression".to_string())));
        assert!(params.contains(&("transformation", "q_auto/f_auto".to_string())));
        assert!(params.contains(&("timestamp", "42".to_string())));
    }

    /// Serve `router` on an ephemeral local port and return its base URL
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_upload_returns_secure_url() {
        let router = Router::new().route(
            "/v1_1/demo/auto/upload",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                let signed: Vec<(&str, String)> = ["folder", "timestamp", "transformation"]
                    .into_iter()
                    .map(|key| (key, form.get(key).cloned().unwrap_or_default()))
                    .collect();
                let valid = form.get("api_key").map(String::as_str) == Some("1234")
                    && form.get("signature") == Some(&sign(&signed, "abcd"))
                    && form.get("transformation").map(String::as_str) == Some("q_auto/f_auto")
                    && form.get("file").map(String::as_str) == Some("data:image/png;base64,YWJj");

                if valid {
                    (
                        StatusCode::OK,
                        Json(serde_json::json!({
                            "public_id": "ai-compression/abc",
                            "secure_url": "https://res.cloudinary.com/demo/image/upload/abc.png"
                        })),
                    )
                } else {
                    (
                        StatusCode::UNAUTHORIZED,
                        Json(serde_json::json!({"error": {"message": "Invalid Signature"}})),
                    )
                }
            }),
        );
        let store = store_at(&serve(router).await);

        let url = store.upload(b"abc", "image/png").await.unwrap();
        assert_eq!(url, "https://res.cloudinary.com/demo/image/upload/abc.png");
    }

    #[tokio::test]
    async fn test_upload_error_body_is_an_error() {
        let router = Router::new().fallback(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": {"message": "Invalid image file"}})),
            )
        });
        let store = store_at(&serve(router).await);

        let err = store.upload(b"abc", "image/png").await.unwrap_err();
        assert!(err.to_string().contains("Invalid image file"));
    }

    #[tokio::test]
    async fn test_upload_without_secure_url_is_an_error() {
        let router = Router::new()
            .fallback(|| async { Json(serde_json::json!({"public_id": "ai-compression/abc"})) });
        let store = store_at(&serve(router).await);

        let err = store.upload(b"abc", "image/jpeg").await.unwrap_err();
        assert!(err.to_string().contains("secure_url"));
    }
}
