// Artifact storage: scratch staging and promotion of final outputs

pub mod staging;

pub use staging::{ArtifactDigest, StagingArea};
