//! Audio ingestion, acoustic features and the raw-audio ring.

pub mod featurizer;
pub mod ingest;
pub mod mel;

pub use featurizer::{AudioFeaturizer, FeaturePump, FeatureStreams};
