//! Compression Service
//!
//! Adaptive image compression with AI region detection. An uploaded JPEG or
//! PNG is shown to a vision model that reports faces, text and salient
//! objects. The image is then re-encoded as JPEG, with the quality floored
//! whenever the model found something worth preserving. Both the original
//! and the compressed bytes go to an asset host, and a record tying the two
//! together is stored in PostgreSQL.
//!
//! ## Architecture
//!
//! ```text
//!   POST /api/images/upload
//!            │
//!            ▼
//! ┌──────────────────┐     ┌──────────────┐
//! │ Upload           │────▶│ Region       │──▶ vision model
//! │ Pipeline         │     │ Detector     │
//! │                  │     └──────────────┘
//! │                  │     ┌──────────────┐
//! │                  │────▶│ Compressor   │
//! │                  │     └──────────────┘
//! │                  │     ┌──────────────┐
//! │                  │────▶│ Asset Store  │──▶ Cloudinary / S3
//! │                  │     └──────────────┘
//! │                  │     ┌──────────────┐
//! │                  │────▶│ Image Store  │──▶ PostgreSQL
//! └──────────────────┘     └──────────────┘
//!                                 ▲
//!                                 │
//!                       GET /api/images/:id
//! ```

pub mod api;
pub mod asset_store;
pub mod compressor;
pub mod config;
pub mod detector;
pub mod error;
pub mod image_store;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;

pub use api::{create_router, start_api_server, AppState};
pub use asset_store::{build_asset_store, AssetStore, CloudinaryStore, S3AssetStore};
pub use config::{Config, Environment};
pub use detector::{GeminiDetector, RegionDetector};
pub use error::{AppError, ErrorResponse};
pub use image_store::{ImageRepository, PgImageStore};
pub use models::{DetectedRegion, ImageRecord, RegionKind};
pub use orchestrator::{UploadPipeline, UploadRequest, UploadedFile};
pub use rate_limit::{RateLimiter, SlidingWindowLimiter};
