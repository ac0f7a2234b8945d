// MSA statistics pipeline: ingestion, processing, storage and the run orchestrator

pub mod ingestion;
pub mod orchestrator;
pub mod processing;
pub mod storage;

pub use orchestrator::{Pipeline, RunReport, Stage};
