//! Per-request upload pipeline.
//!
//! Stages run strictly in order: validate, read metadata, detect regions,
//! compress, upload (compressed then original), persist. Only detection is
//! allowed to fail softly. The repository write is the last stage, so a
//! failure anywhere earlier leaves nothing behind in the database.

use crate::asset_store::AssetStore;
use crate::compressor::{self, CompressedOutput};
use crate::detector::RegionDetector;
use crate::error::AppError;
use crate::image_store::ImageRepository;
use crate::models::{CompressedImage, DetectedRegion, ImageRecord, NewImageRecord, OriginalImage};
use anyhow::{anyhow, Context};
use axum::body::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// MIME types accepted for upload
pub const ALLOWED_MIME_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

/// MIME type of every compressed output
const COMPRESSED_MIME_TYPE: &str = "image/jpeg";

/// The uploaded file as received
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub data: Bytes,
    /// Declared MIME type of the part
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// Everything the client sent with an upload
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub file: Option<UploadedFile>,
    /// Raw `quality` form field
    pub quality: Option<String>,
}

/// Input that passed validation
#[derive(Debug)]
struct ValidatedUpload {
    data: Bytes,
    quality: i64,
}

/// Sequences detection, compression, upload and persistence
pub struct UploadPipeline {
    detector: Arc<dyn RegionDetector>,
    assets: Arc<dyn AssetStore>,
    repository: Arc<dyn ImageRepository>,
    max_upload_bytes: usize,
}

impl UploadPipeline {
    pub fn new(
        detector: Arc<dyn RegionDetector>,
        assets: Arc<dyn AssetStore>,
        repository: Arc<dyn ImageRepository>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            detector,
            assets,
            repository,
            max_upload_bytes,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ImageRepository> {
        &self.repository
    }

    /// Run the whole pipeline for one upload
    #[instrument(skip(self, request))]
    pub async fn process(&self, request: UploadRequest) -> Result<ImageRecord, AppError> {
        let started = Instant::now();

        let result = self.run_stages(request).await;

        match &result {
            Ok(record) => {
                metrics::counter!("compression.uploads.succeeded").increment(1);
                metrics::histogram!("compression.ratio").record(record.compression_ratio);
                metrics::histogram!("compression.upload.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(
                    image_id = %record.id,
                    original_size = record.original_image.size,
                    compressed_size = record.compressed_image.size,
                    compression_ratio = record.compression_ratio,
                    regions = record.detected_regions.len(),
                    "Image processed"
                );
            }
            Err(AppError::ClientInput(_)) => {
                metrics::counter!("compression.uploads.rejected").increment(1);
            }
            Err(_) => {
                metrics::counter!("compression.uploads.failed").increment(1);
            }
        }

        result
    }

    async fn run_stages(&self, request: UploadRequest) -> Result<ImageRecord, AppError> {
        let upload = self.validate(request)?;

        let format = compressor::detect_format(&upload.data)
            .map_err(|e| anyhow!(e).context("Failed to read image metadata"))?;
        let source_mime = compressor::mime_for_format(&format);

        let regions = self.detector.detect(&upload.data, source_mime).await;
        metrics::counter!("compression.regions.detected").increment(regions.len() as u64);

        let compressed = self
            .compress(upload.data.clone(), regions.clone(), upload.quality)
            .await?;

        let compressed_url = self
            .assets
            .upload(&compressed.data, COMPRESSED_MIME_TYPE)
            .await
            .context("Failed to upload compressed image")?;
        let original_url = self
            .assets
            .upload(&upload.data, source_mime)
            .await
            .context("Failed to upload original image")?;

        let record = NewImageRecord::new(
            OriginalImage {
                url: original_url,
                size: upload.data.len() as i64,
                format,
            },
            CompressedImage {
                url: compressed_url,
                size: compressed.data.len() as i64,
            },
            regions,
        );

        let record = self
            .repository
            .create(record)
            .await
            .context("Failed to save image record")?;

        Ok(record)
    }

    /// Stage 1: presence, declared type, size and quality
    fn validate(&self, request: UploadRequest) -> Result<ValidatedUpload, AppError> {
        let file = request
            .file
            .ok_or_else(|| AppError::client_input("No image file uploaded"))?;

        let declared = file.content_type.as_deref().unwrap_or_default();
        if !ALLOWED_MIME_TYPES.contains(&declared) {
            return Err(AppError::client_input(
                "Invalid file type. Only JPG and PNG are allowed",
            ));
        }

        if file.data.len() > self.max_upload_bytes {
            return Err(AppError::client_input(format!(
                "File too large. Maximum size is {} bytes",
                self.max_upload_bytes
            )));
        }

        let quality = compressor::parse_quality(request.quality.as_deref());
        let quality = compressor::validate_quality(quality)
            .map_err(|e| AppError::client_input(e.to_string()))?;

        debug!(
            file_name = ?file.file_name,
            content_type = %declared,
            size_bytes = file.data.len(),
            quality = quality,
            "Upload validated"
        );

        Ok(ValidatedUpload {
            data: file.data,
            quality,
        })
    }

    /// Stage 4: JPEG re-encode on the blocking pool
    async fn compress(
        &self,
        data: Bytes,
        regions: Vec<DetectedRegion>,
        quality: i64,
    ) -> Result<CompressedOutput, AppError> {
        let output = tokio::task::spawn_blocking(move || {
            compressor::compress_adaptive(&data, &regions, quality)
        })
        .await
        .context("Compression task panicked")?
        .map_err(|e| anyhow!(e).context("Failed to compress image"))?;

        debug!(
            requested_quality = quality,
            effective_quality = output.quality,
            width = output.width,
            height = output.height,
            compressed_size = output.data.len(),
            "Image compressed"
        );

        Ok(output)
    }
}
