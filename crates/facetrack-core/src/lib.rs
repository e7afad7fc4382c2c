//! facetrack-core — Identity matching engine.
//!
//! Turns face embeddings into persistent visitor identities: a flat
//! nearest-neighbor index with an exhaustive first-match fallback, a
//! recency cache that suppresses duplicate visit writes, and a daily
//! schedule gate. Face detection and embedding run via ONNX Runtime.

pub mod embedder;
pub mod index;
pub mod recency;
pub mod resolver;
pub mod schedule;
pub mod store;
pub mod types;

pub use embedder::{
    EmbedderError, EmbeddingSource, OnnxEmbedder, OnnxEmbedderConfig, ARCFACE_MATCH_TOLERANCE,
};
pub use index::{IdentityIndex, Neighbor};
pub use recency::RecencyCache;
pub use resolver::{MatchResolver, ResolveError, ResolverConfig, DEFAULT_MATCH_TOLERANCE};
pub use schedule::{ScheduleError, ScheduleGate, ScheduleWindow};
pub use store::{IdentityStore, MemoryStore, StoreError};
pub use types::{BoundingBox, Detection, Embedding, Identity, Recognition};
