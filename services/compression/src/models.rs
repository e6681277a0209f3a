use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of salient content found by the vision model.
///
/// The three kinds the model is asked for are normalised to lowercase. Any
/// other non-empty label is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RegionKind {
    Face,
    Text,
    Object,
    Other(String),
}

impl RegionKind {
    /// Parse a region kind, ignoring case and surrounding whitespace.
    /// Empty labels yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }

        let kind = match trimmed.to_ascii_lowercase().as_str() {
            "face" => Self::Face,
            "text" => Self::Text,
            "object" => Self::Object,
            _ => Self::Other(trimmed.to_string()),
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Face => "face",
            Self::Text => "text",
            Self::Object => "object",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for RegionKind {
    fn from(value: String) -> Self {
        Self::parse(&value).unwrap_or(Self::Other(value))
    }
}

impl From<RegionKind> for String {
    fn from(kind: RegionKind) -> Self {
        match kind {
            RegionKind::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

/// Bounding box, each field a percentage of the image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A region of interest reported by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedRegion {
    #[serde(rename = "type")]
    pub kind: RegionKind,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub description: String,
}

/// Stored details of the uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalImage {
    pub url: String,
    /// Size in bytes
    pub size: i64,
    /// Source format (jpeg, png)
    pub format: String,
}

/// Stored details of the re-encoded JPEG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedImage {
    pub url: String,
    /// Size in bytes
    pub size: i64,
}

/// Everything needed to persist an upload, before the repository assigns an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewImageRecord {
    pub original_image: OriginalImage,
    pub compressed_image: CompressedImage,
    pub compression_ratio: f64,
    pub detected_regions: Vec<DetectedRegion>,
}

impl NewImageRecord {
    /// Assemble a record, deriving the ratio from the two sizes
    pub fn new(
        original_image: OriginalImage,
        compressed_image: CompressedImage,
        detected_regions: Vec<DetectedRegion>,
    ) -> Self {
        let compression_ratio = compression_ratio(compressed_image.size, original_image.size);

        Self {
            original_image,
            compressed_image,
            compression_ratio,
            detected_regions,
        }
    }

    pub fn into_record(self, id: Uuid, created_at: DateTime<Utc>) -> ImageRecord {
        ImageRecord {
            id,
            original_image: self.original_image,
            compressed_image: self.compressed_image,
            compression_ratio: self.compression_ratio,
            detected_regions: self.detected_regions,
            created_at,
        }
    }
}

/// A persisted upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: Uuid,
    pub original_image: OriginalImage,
    pub compressed_image: CompressedImage,
    pub compression_ratio: f64,
    pub detected_regions: Vec<DetectedRegion>,
    pub created_at: DateTime<Utc>,
}

/// compressed / original; zero-length originals yield 0
pub fn compression_ratio(compressed_size: i64, original_size: i64) -> f64 {
    if original_size <= 0 {
        return 0.0;
    }
    compressed_size as f64 / original_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> DetectedRegion {
        DetectedRegion {
            kind: RegionKind::Face,
            confidence: 0.9,
            bbox: BoundingBox {
                x: 10.0,
                y: 20.0,
                width: 30.0,
                height: 40.0,
            },
            description: "a face".to_string(),
        }
    }

    #[test]
    fn test_region_kind_parse() {
        assert_eq!(RegionKind::parse("face"), Some(RegionKind::Face));
        assert_eq!(RegionKind::parse(" Text "), Some(RegionKind::Text));
        assert_eq!(RegionKind::parse("OBJECT"), Some(RegionKind::Object));
        assert_eq!(
            RegionKind::parse(" person "),
            Some(RegionKind::Other("person".to_string()))
        );
        assert_eq!(RegionKind::parse(""), None);
        assert_eq!(RegionKind::parse("   "), None);
    }

    #[test]
    fn test_region_kind_json_passthrough() {
        let kind: RegionKind = serde_json::from_str(r#""Face""#).unwrap();
        assert_eq!(kind, RegionKind::Face);

        let kind: RegionKind = serde_json::from_str(r#""license plate""#).unwrap();
        assert_eq!(kind, RegionKind::Other("license plate".to_string()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), "license plate");
        assert_eq!(serde_json::to_value(RegionKind::Text).unwrap(), "text");
    }

    #[test]
    fn test_ratio_derived_from_sizes() {
        let record = NewImageRecord::new(
            OriginalImage {
                url: "https://assets/original.png".to_string(),
                size: 2000,
                format: "png".to_string(),
            },
            CompressedImage {
                url: "https://assets/compressed.jpg".to_string(),
                size: 500,
            },
            vec![region()],
        );

        assert_eq!(record.compression_ratio, 0.25);
        assert_eq!(compression_ratio(10, 0), 0.0);
    }

    #[test]
    fn test_record_json_shape() {
        let record = NewImageRecord::new(
            OriginalImage {
                url: "o".to_string(),
                size: 100,
                format: "jpeg".to_string(),
            },
            CompressedImage {
                url: "c".to_string(),
                size: 50,
            },
            vec![region()],
        )
        .into_record(Uuid::nil(), Utc::now());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["originalImage"]["format"], "jpeg");
        assert_eq!(json["compressedImage"]["size"], 50);
        assert_eq!(json["compressionRatio"], 0.5);
        assert_eq!(json["detectedRegions"][0]["type"], "face");
        assert_eq!(json["detectedRegions"][0]["bbox"]["width"], 30.0);
        assert!(json.get("createdAt").is_some());
        assert!(json.get("id").is_some());
    }
}
