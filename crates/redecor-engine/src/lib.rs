//! Structure-conditioned image generation core.
//!
//! An upload is decoded to RGB, reduced to a line drawing by a
//! [`ConditioningExtractor`], and handed with the prompt and seed to the single
//! shared [`GenerationEngine`]. Every image along the way is persisted by the
//! [`ArtifactStore`] under a unique id. [`GenerationPipeline`] ties the stages
//! together and serializes access to the engine.

pub mod conditioning;
pub mod decoder;
pub mod generation;
pub mod pipeline;
pub mod raster;
pub mod store;

pub use conditioning::{ConditioningExtractor, LineDetector};
pub use decoder::{DecodeError, ImageDecoder};
pub use generation::{load_engine, DryrunEngine, GenerationEngine, GenerationRequest, HttpEngine};
pub use pipeline::{GenerationOutcome, GenerationPipeline, PipelineSettings, UploadRequest};
pub use raster::{CanonicalImage, ConditioningImage, OutputImage};
pub use store::ArtifactStore;
