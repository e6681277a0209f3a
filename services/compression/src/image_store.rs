use crate::config::DatabaseConfig;
use crate::models::{CompressedImage, DetectedRegion, ImageRecord, NewImageRecord, OriginalImage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Persistence for image records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Insert a record and return it with its assigned id
    async fn create(&self, record: NewImageRecord) -> Result<ImageRecord>;

    /// Fetch a record by id
    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>>;

    /// Check connectivity
    async fn ping(&self) -> Result<()>;
}

/// Row layout of the `images` table
#[derive(Debug, Clone, FromRow)]
struct ImageRow {
    id: Uuid,
    original_url: String,
    original_size: i64,
    original_format: String,
    compressed_url: String,
    compressed_size: i64,
    compression_ratio: f64,
    detected_regions: Json<Vec<DetectedRegion>>,
    created_at: DateTime<Utc>,
}

impl From<ImageRow> for ImageRecord {
    fn from(row: ImageRow) -> Self {
        Self {
            id: row.id,
            original_image: OriginalImage {
                url: row.original_url,
                size: row.original_size,
                format: row.original_format,
            },
            compressed_image: CompressedImage {
                url: row.compressed_url,
                size: row.compressed_size,
            },
            compression_ratio: row.compression_ratio,
            detected_regions: row.detected_regions.0,
            created_at: row.created_at,
        }
    }
}

/// Image record store in PostgreSQL
pub struct PgImageStore {
    pool: PgPool,
}

impl PgImageStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Connect, retrying with a constant delay up to `connect_attempts` times
    pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<Self> {
        retry_constant(
            config.connect_attempts,
            config.connect_retry_delay(),
            || Self::new(config),
        )
        .await
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL connection pool closed");
    }
}

#[async_trait]
impl ImageRepository for PgImageStore {
    #[instrument(skip(self, record), fields(regions = record.detected_regions.len()))]
    async fn create(&self, record: NewImageRecord) -> Result<ImageRecord> {
        let id = Uuid::new_v4();

        let row = sqlx::query_as::<_, ImageRow>(
            r#"
            INSERT INTO images (
                id, original_url, original_size, original_format,
                compressed_url, compressed_size, compression_ratio,
                detected_regions, created_at
            ) VALUES (
                $1, $2, $3, $4,
                $5, $6, $7,
                $8, NOW()
            )
            RETURNING id, original_url, original_size, original_format,
                      compressed_url, compressed_size, compression_ratio,
                      detected_regions, created_at
            "#,
        )
        .bind(id)
        .bind(&record.original_image.url)
        .bind(record.original_image.size)
        .bind(&record.original_image.format)
        .bind(&record.compressed_image.url)
        .bind(record.compressed_image.size)
        .bind(record.compression_ratio)
        .bind(Json(&record.detected_regions))
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert image record")?;

        debug!(image_id = %id, "Image record created");

        Ok(row.into())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT id, original_url, original_size, original_format,
                   compressed_url, compressed_size, compression_ratio,
                   detected_regions, created_at
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query image record")?;

        Ok(row.map(Into::into))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

/// Run `op` until it succeeds or `max_attempts` attempts have failed,
/// sleeping `delay` between attempts.
pub(crate) async fn retry_constant<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut backoff = Constant::new(delay);
    let mut attempts = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempts += 1;

                if attempts >= max_attempts {
                    let error = format!("{e:#}");
                    error!(
                        attempts = attempts,
                        error = %error,
                        "Database connection failed after all retries"
                    );
                    return Err(e.context(format!("giving up after {} attempts", attempts)));
                }

                if let Some(delay) = backoff.next_backoff() {
                    warn!(
                        attempt = attempts,
                        remaining = max_attempts - attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Database connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, RegionKind};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_row_into_record() {
        let row = ImageRow {
            id: Uuid::new_v4(),
            original_url: "https://assets/original.png".to_string(),
            original_size: 4000,
            original_format: "png".to_string(),
            compressed_url: "https://assets/compressed.jpg".to_string(),
            compressed_size: 1000,
            compression_ratio: 0.25,
            detected_regions: Json(vec![DetectedRegion {
                kind: RegionKind::Face,
                confidence: 0.5,
                bbox: BoundingBox {
                    x: 1.0,
                    y: 2.0,
                    width: 3.0,
                    height: 4.0,
                },
                description: String::new(),
            }]),
            created_at: Utc::now(),
        };

        let record: ImageRecord = row.clone().into();
        assert_eq!(record.id, row.id);
        assert_eq!(record.original_image.format, "png");
        assert_eq!(record.compressed_image.size, 1000);
        assert_eq!(record.detected_regions.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);

        let value = retry_constant(5, Duration::from_millis(1), || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 3 {
                    Err(anyhow!("connection refused"))
                } else {
                    Ok(call)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_constant(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("connection refused")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(format!("{:#}", result.unwrap_err()).contains("5 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() {
        let started = tokio::time::Instant::now();

        let _: Result<()> = retry_constant(3, Duration::from_secs(5), || async {
            Err(anyhow!("down"))
        })
        .await;

        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
