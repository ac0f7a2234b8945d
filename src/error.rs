use thiserror::Error;

use crate::pipeline::orchestrator::Stage;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source unavailable: {source_id}: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("format error in {source_id}: {reason}")]
    FormatError { source_id: String, reason: String },

    #[error(
        "{source_id} ({year}): rejected {rejected} of {considered} rows ({pct:.2}% > {max_pct:.2}% allowed)",
        pct = .rate * 100.0,
        max_pct = .threshold * 100.0
    )]
    SchemaRejectionRateExceeded {
        source_id: String,
        year: i32,
        rejected: usize,
        considered: usize,
        rate: f64,
        threshold: f64,
    },

    #[error(
        "{source_id} ({year}): {unmapped} of {total} records have no crosswalk entry ({pct:.2}% > {max_pct:.2}% allowed)",
        pct = .rate * 100.0,
        max_pct = .threshold * 100.0
    )]
    CrosswalkGap {
        source_id: String,
        year: i32,
        unmapped: usize,
        total: usize,
        rate: f64,
        threshold: f64,
    },

    #[error("invalid crosswalk: {0}")]
    InvalidCrosswalk(String),

    #[error(
        "{unmatched} of {total} survey regions matched no supplementary source ({pct:.2}% > {max_pct:.2}% allowed)",
        pct = .rate * 100.0,
        max_pct = .threshold * 100.0
    )]
    IntegrityError {
        unmatched: usize,
        total: usize,
        rate: f64,
        threshold: f64,
    },

    #[error("no geometry for {} region(s): {}", .keys.len(), .keys.join(", "))]
    MissingGeometry { keys: Vec<String> },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn format(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::FormatError {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::SourceUnavailable {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    /// Tag an error with the orchestrator stage it escaped from.
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            already @ PipelineError::Stage { .. } => already,
            other => PipelineError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage-less error underneath any `Stage` wrapper.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
