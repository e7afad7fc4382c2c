use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union of two boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector. All embeddings compared against each other must
/// share one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Squared Euclidean distance. Used for both ranking and acceptance.
    pub fn squared_distance(&self, other: &Embedding) -> f32 {
        squared_l2(&self.values, &other.values)
    }

    /// Encode as little-endian `f32` bytes for blob storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode little-endian `f32` bytes. Returns `None` when the length is not
    /// a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// One face found in a frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// A persistent visitor identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Absent when the store holds a row without a usable encoding.
    pub embedding: Option<Embedding>,
    pub last_visit: DateTime<Utc>,
    pub visit_count: u32,
}

impl Identity {
    /// A first sighting: fresh random id, one visit, now.
    pub fn first_sighting(embedding: Embedding) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            email: None,
            embedding: Some(embedding),
            last_visit: Utc::now(),
            visit_count: 1,
        }
    }
}

/// Outcome of resolving one detection, as published to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recognition {
    pub identity_id: String,
    #[serde(rename = "new")]
    pub is_new: bool,
}
