//! Resolves live embeddings to persistent identities.
//!
//! Two-stage matching: the [`IdentityIndex`] is consulted first; when it has
//! nothing within threshold, the known embeddings are verified one by one in
//! store order and the first one under threshold wins. Anything still
//! unmatched becomes a new identity. Visit writes for matched identities are
//! suppressed while the id sits in the [`RecencyCache`].

use crate::index::IdentityIndex;
use crate::recency::RecencyCache;
use crate::store::{IdentityStore, StoreError};
use crate::types::{Detection, Embedding, Identity, Recognition};
use std::sync::Arc;
use thiserror::Error;

/// Default verification tolerance on raw (non-squared) embedding distance.
pub const DEFAULT_MATCH_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Expected embedding dimension.
    pub dimension: usize,
    /// Squared-distance acceptance threshold (strict).
    pub threshold: f32,
}

impl ResolverConfig {
    /// Threshold derived from a raw-distance tolerance.
    pub fn with_tolerance(dimension: usize, tolerance: f32) -> Self {
        Self {
            dimension,
            threshold: tolerance * tolerance,
        }
    }
}

struct KnownFace {
    id: String,
    embedding: Embedding,
}

enum Stage {
    Index,
    Fallback,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Index => "index",
            Stage::Fallback => "fallback",
        }
    }
}

pub struct MatchResolver {
    store: Box<dyn IdentityStore>,
    cache: Arc<RecencyCache>,
    config: ResolverConfig,
    index: IdentityIndex,
    known: Vec<KnownFace>,
}

impl MatchResolver {
    /// Create a resolver with an empty index. Call [`refresh`](Self::refresh)
    /// to load known identities.
    pub fn new(
        store: Box<dyn IdentityStore>,
        cache: Arc<RecencyCache>,
        config: ResolverConfig,
    ) -> Self {
        let index = IdentityIndex::empty(config.dimension);
        Self {
            store,
            cache,
            config,
            index,
            known: Vec::new(),
        }
    }

    pub fn cache(&self) -> &Arc<RecencyCache> {
        &self.cache
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Number of identities currently matchable.
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Reload all identities from the store and rebuild the index and the
    /// fallback list. Returns the number of indexed identities.
    pub fn refresh(&mut self) -> Result<usize, StoreError> {
        let identities = self.store.fetch_all()?;
        let dimension = self.config.dimension;

        self.index = IdentityIndex::build(&identities, dimension);
        self.known = identities
            .into_iter()
            .filter_map(|identity| match identity.embedding {
                Some(embedding) if embedding.dim() == dimension => Some(KnownFace {
                    id: identity.id,
                    embedding,
                }),
                _ => None,
            })
            .collect();

        tracing::debug!(known = self.known.len(), "resolver refreshed");
        Ok(self.index.len())
    }

    /// Resolve one embedding. `Ok(None)` means the sighting was a duplicate
    /// within the recency window and nothing was written.
    pub fn resolve(&mut self, embedding: &Embedding) -> Result<Option<Recognition>, ResolveError> {
        if embedding.dim() != self.config.dimension {
            return Err(ResolveError::DimensionMismatch {
                expected: self.config.dimension,
                actual: embedding.dim(),
            });
        }

        let matched = self.find_match(embedding);
        let Some((id, stage)) = matched else {
            return self.create_identity(embedding).map(Some);
        };

        if self.cache.contains(&id) {
            tracing::debug!(id = %id, "recently seen; visit not recorded again");
            return Ok(None);
        }

        self.store.update_visit(&id)?;
        self.cache.insert(&id);
        tracing::info!(
            id = %id,
            stage = stage.as_str(),
            "returning visitor recognized"
        );

        Ok(Some(Recognition {
            identity_id: id,
            is_new: false,
        }))
    }

    /// Resolve every detection of one frame. Per-detection failures are
    /// logged and skipped; suppressed sightings are left out of the batch.
    pub fn resolve_all(&mut self, detections: &[Detection]) -> Vec<Recognition> {
        let mut results = Vec::with_capacity(detections.len());
        for detection in detections {
            match self.resolve(&detection.embedding) {
                Ok(Some(recognition)) => results.push(recognition),
                Ok(None) => {}
                Err(e @ ResolveError::DimensionMismatch { .. }) => {
                    tracing::warn!(error = %e, "detection skipped");
                }
                Err(e) => {
                    tracing::error!(error = %e, "detection dropped");
                }
            }
        }
        results
    }

    fn find_match(&self, embedding: &Embedding) -> Option<(String, Stage)> {
        let threshold = self.config.threshold;

        if let Some(neighbor) = self.index.query(&embedding.values, threshold) {
            return Some((neighbor.identity_id, Stage::Index));
        }

        // First match in store order, not the closest one.
        self.known
            .iter()
            .find(|known| known.embedding.squared_distance(embedding) < threshold)
            .map(|known| (known.id.clone(), Stage::Fallback))
    }

    fn create_identity(&mut self, embedding: &Embedding) -> Result<Recognition, ResolveError> {
        let identity = Identity::first_sighting(embedding.clone());
        let id = self.store.insert(&identity)?;
        self.cache.insert(&id);
        tracing::info!(id = %id, "new visitor stored");

        if let Err(e) = self.refresh() {
            // The row exists but cannot be matched until the next refresh.
            tracing::warn!(error = %e, id = %id, "index refresh after insert failed");
        }

        Ok(Recognition {
            identity_id: id,
            is_new: true,
        })
    }
}
