//! Nearest-neighbor index over known identity embeddings.
//!
//! A flat squared-L2 index: vectors live row-major in one contiguous buffer
//! and are scanned in full on every query. The index is immutable once
//! built; any change to the identity set is handled by building a new one.

use crate::types::{squared_l2, Identity};

/// Closest indexed identity to a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub identity_id: String,
    /// Squared Euclidean distance to the probe.
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct IdentityIndex {
    dimension: usize,
    ids: Vec<String>,
    vectors: Vec<f32>,
}

impl IdentityIndex {
    /// An index with no entries.
    pub fn empty(dimension: usize) -> Self {
        Self {
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Build from a store snapshot. Identities without an embedding, or with
    /// one of the wrong dimension, are skipped.
    pub fn build(identities: &[Identity], dimension: usize) -> Self {
        let mut index = Self::empty(dimension);

        for identity in identities {
            let Some(embedding) = &identity.embedding else {
                tracing::warn!(id = %identity.id, "identity has no embedding; not indexed");
                continue;
            };
            if embedding.dim() != dimension {
                tracing::warn!(
                    id = %identity.id,
                    expected = dimension,
                    actual = embedding.dim(),
                    "embedding dimension mismatch; not indexed"
                );
                continue;
            }
            index.ids.push(identity.id.clone());
            index.vectors.extend_from_slice(&embedding.values);
        }

        tracing::debug!(entries = index.len(), dimension, "identity index built");
        index
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Nearest neighbor of `probe`, returned only if its squared distance is
    /// strictly below `threshold`.
    pub fn query(&self, probe: &[f32], threshold: f32) -> Option<Neighbor> {
        if probe.len() != self.dimension || self.is_empty() {
            return None;
        }

        let mut best: Option<(usize, f32)> = None;
        for (row, stored) in self.vectors.chunks_exact(self.dimension).enumerate() {
            let distance = squared_l2(probe, stored);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((row, distance));
            }
        }

        match best {
            Some((row, distance)) if distance < threshold => Some(Neighbor {
                identity_id: self.ids[row].clone(),
                distance,
            }),
            _ => None,
        }
    }
}
