//! Stage metrics for the pipeline.
//!
//! Recording goes through the `metrics` facade; when no recorder is installed
//! (library use, tests) every call is a no-op.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::fmt;
use tracing::info;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// All metric names emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Fetch
    FetchCacheHits,
    FetchCacheMisses,
    FetchRemoteErrors,
    FetchPayloadBytes,

    // Normalize
    NormalizeRowsAccepted,
    NormalizeRowsRejected,
    NormalizeRowsFiltered,
    NormalizeRejectionRate,

    // Aggregate
    AggregateRecordsUnmapped,
    AggregateCountiesUncovered,
    AggregateRegionMetrics,

    // Merge
    MergeSurveyRegions,
    MergeUnmatchedRegions,

    // Geometry
    GeometryFeatures,
    GeometryVerticesRemoved,

    // Run
    RunsSucceeded,
    RunsFailed,
    RunDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::FetchCacheHits => "msa_fetch_cache_hits_total",
            MetricName::FetchCacheMisses => "msa_fetch_cache_misses_total",
            MetricName::FetchRemoteErrors => "msa_fetch_remote_errors_total",
            MetricName::FetchPayloadBytes => "msa_fetch_payload_bytes",

            MetricName::NormalizeRowsAccepted => "msa_normalize_rows_accepted_total",
            MetricName::NormalizeRowsRejected => "msa_normalize_rows_rejected_total",
            MetricName::NormalizeRowsFiltered => "msa_normalize_rows_filtered_total",
            MetricName::NormalizeRejectionRate => "msa_normalize_rejection_rate",

            MetricName::AggregateRecordsUnmapped => "msa_aggregate_records_unmapped_total",
            MetricName::AggregateCountiesUncovered => "msa_aggregate_counties_uncovered_total",
            MetricName::AggregateRegionMetrics => "msa_aggregate_region_metrics_total",

            MetricName::MergeSurveyRegions => "msa_merge_survey_regions",
            MetricName::MergeUnmatchedRegions => "msa_merge_unmatched_regions",

            MetricName::GeometryFeatures => "msa_geometry_features",
            MetricName::GeometryVerticesRemoved => "msa_geometry_vertices_removed_total",

            MetricName::RunsSucceeded => "msa_runs_succeeded_total",
            MetricName::RunsFailed => "msa_runs_failed_total",
            MetricName::RunDuration => "msa_run_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;
    METRICS_HANDLE.set(handle).ok();
    info!("Metrics recorder installed");
    Ok(())
}

/// Render the current exposition text, if a recorder was installed.
pub fn render() -> Option<String> {
    METRICS_HANDLE.get().map(|h| h.render())
}

pub mod fetch {
    use super::MetricName;

    pub fn cache_hit(source: &str) {
        ::metrics::counter!(MetricName::FetchCacheHits.as_str(), "source" => source.to_string()).increment(1);
    }

    pub fn cache_miss(source: &str) {
        ::metrics::counter!(MetricName::FetchCacheMisses.as_str(), "source" => source.to_string()).increment(1);
    }

    pub fn remote_error(source: &str) {
        ::metrics::counter!(MetricName::FetchRemoteErrors.as_str(), "source" => source.to_string()).increment(1);
    }

    pub fn payload_bytes(bytes: usize) {
        ::metrics::histogram!(MetricName::FetchPayloadBytes.as_str()).record(bytes as f64);
    }
}

pub mod normalize {
    use super::MetricName;

    pub fn rows(source: &str, accepted: usize, rejected: usize, filtered: usize) {
        let label = source.to_string();
        ::metrics::counter!(MetricName::NormalizeRowsAccepted.as_str(), "source" => label.clone())
            .increment(accepted as u64);
        ::metrics::counter!(MetricName::NormalizeRowsRejected.as_str(), "source" => label.clone())
            .increment(rejected as u64);
        ::metrics::counter!(MetricName::NormalizeRowsFiltered.as_str(), "source" => label)
            .increment(filtered as u64);
    }

    pub fn rejection_rate(source: &str, rate: f64) {
        ::metrics::gauge!(MetricName::NormalizeRejectionRate.as_str(), "source" => source.to_string()).set(rate);
    }
}

pub mod aggregate {
    use super::MetricName;

    pub fn gaps(source: &str, unmapped: usize, uncovered: usize) {
        let label = source.to_string();
        ::metrics::counter!(MetricName::AggregateRecordsUnmapped.as_str(), "source" => label.clone())
            .increment(unmapped as u64);
        ::metrics::counter!(MetricName::AggregateCountiesUncovered.as_str(), "source" => label)
            .increment(uncovered as u64);
    }

    pub fn region_metrics(count: usize) {
        ::metrics::counter!(MetricName::AggregateRegionMetrics.as_str()).increment(count as u64);
    }
}

pub mod merge {
    use super::MetricName;

    pub fn regions(survey: usize, unmatched: usize) {
        ::metrics::gauge!(MetricName::MergeSurveyRegions.as_str()).set(survey as f64);
        ::metrics::gauge!(MetricName::MergeUnmatchedRegions.as_str()).set(unmatched as f64);
    }
}

pub mod geometry {
    use super::MetricName;

    pub fn built(features: usize, vertices_removed: usize) {
        ::metrics::gauge!(MetricName::GeometryFeatures.as_str()).set(features as f64);
        ::metrics::counter!(MetricName::GeometryVerticesRemoved.as_str()).increment(vertices_removed as u64);
    }
}

pub mod run {
    use super::MetricName;

    pub fn succeeded(duration_secs: f64) {
        ::metrics::counter!(MetricName::RunsSucceeded.as_str()).increment(1);
        ::metrics::histogram!(MetricName::RunDuration.as_str()).record(duration_secs);
    }

    pub fn failed(stage: &str) {
        ::metrics::counter!(MetricName::RunsFailed.as_str(), "stage" => stage.to_string()).increment(1);
    }
}
