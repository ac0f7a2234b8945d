//! Linear run: Fetching → Cleaning → Aggregating → Merging → Writing → Done.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, instrument};
use uuid::Uuid;

use crate::app::ports::HttpClientPort;
use crate::config::Config;
use crate::constants::RUN_REPORT_FILE;
use crate::error::{PipelineError, Result};
use crate::observability::metrics as obs;
use crate::pipeline::ingestion::{FetchRecord, RawPayload, SourceFetcher};
use crate::pipeline::processing::aggregate::{AggregationDiagnostics, Aggregator};
use crate::pipeline::processing::crosswalk::{Crosswalk, CrosswalkSummary};
use crate::pipeline::processing::gdp::{self, GdpGrowthTable};
use crate::pipeline::processing::geometry::{self, GeometryBuilder, GeometryDiagnostics, RegionGeometry};
use crate::pipeline::processing::merge::{MergeDiagnostics, MergedTable, Merger};
use crate::pipeline::processing::normalize::mappings::MappingSet;
use crate::pipeline::processing::normalize::{NormalizationStats, Normalizer};
use crate::pipeline::processing::survey::SurveyTable;
use crate::pipeline::storage::{ArtifactDigest, StagingArea};
use crate::types::{NormalizedRecord, RegionAggregate, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Cleaning,
    Aggregating,
    Merging,
    Writing,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetching => "fetching",
            Stage::Cleaning => "cleaning",
            Stage::Aggregating => "aggregating",
            Stage::Merging => "merging",
            Stage::Writing => "writing",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a run observed, written next to the outputs as `run_report.json`.
///
/// Carries the run id and timestamps, so unlike the table and geometry it is
/// never byte-identical across reruns.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reference_years: [i32; 2],
    pub fetched: Vec<FetchRecord>,
    pub crosswalk: CrosswalkSummary,
    pub normalization: Vec<NormalizationStats>,
    pub aggregation: Vec<AggregationDiagnostics>,
    pub merge: MergeDiagnostics,
    pub geometry: GeometryDiagnostics,
    pub artifacts: Vec<ArtifactDigest>,
}

/// Fetched payloads keyed by (source, year).
struct Payloads(BTreeMap<(SourceId, Option<i32>), RawPayload>);

impl Payloads {
    fn get(&self, id: SourceId, year: Option<i32>) -> Result<&RawPayload> {
        self.0.get(&(id, year)).ok_or_else(|| {
            PipelineError::unavailable(id.to_string(), "payload was not fetched")
        })
    }
}

struct Cleaned {
    crosswalk: Crosswalk,
    crosswalk_summary: CrosswalkSummary,
    records: Vec<NormalizedRecord>,
    stats: Vec<NormalizationStats>,
    gdp: GdpGrowthTable,
    survey: SurveyTable,
}

struct Merged {
    table: MergedTable,
    diagnostics: MergeDiagnostics,
    regions: Vec<RegionGeometry>,
    geometry: GeometryDiagnostics,
}

pub struct Pipeline {
    config: Config,
    mappings: MappingSet,
    fetcher: SourceFetcher,
}

fn in_stage<T>(stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let span = info_span!("stage", stage = %stage);
    let _guard = span.enter();
    info!("Stage {} started", stage);
    f().map_err(|e| e.at_stage(stage))
}

impl Pipeline {
    /// Load the mapping file named by the config and wire the fetcher.
    pub fn new(config: Config, http: Arc<dyn HttpClientPort>) -> Result<Self> {
        let mappings = MappingSet::load(&config.paths.mappings)?;
        Ok(Self::from_parts(config, mappings, http))
    }

    pub fn from_parts(config: Config, mappings: MappingSet, http: Arc<dyn HttpClientPort>) -> Self {
        let fetcher = SourceFetcher::new(
            config.paths.cache_dir.clone(),
            config.fetch.clone(),
            config.sources.clone(),
            http,
        );
        Self {
            config,
            mappings,
            fetcher,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every (source, year) a full run needs.
    pub fn required_inputs(&self) -> Vec<(SourceId, Option<i32>)> {
        let mut inputs = Vec::new();
        for year in self.config.reference_years() {
            inputs.push((SourceId::Population, Some(year)));
            inputs.push((SourceId::Labor, Some(year)));
        }
        for id in [
            SourceId::Crosswalk,
            SourceId::Gdp,
            SourceId::Survey,
            SourceId::States,
            SourceId::Msas,
        ] {
            inputs.push((id, None));
        }
        inputs
    }

    /// Populate the cache for every input, or the ones matching the filters.
    pub fn warm_cache(&self, source: Option<SourceId>, year: Option<i32>) -> Result<Vec<FetchRecord>> {
        self.required_inputs()
            .into_iter()
            .filter(|(id, y)| source.map_or(true, |s| s == *id) && year.map_or(true, |want| *y == Some(want)))
            .map(|(id, y)| self.fetcher.fetch(id, y).map(|p| FetchRecord::from(&p)))
            .collect()
    }

    pub fn check_crosswalk(&self) -> Result<CrosswalkSummary> {
        let payload = self.fetcher.fetch(SourceId::Crosswalk, None)?;
        let (_, summary) = Crosswalk::from_payload(
            &payload,
            &self.mappings.crosswalk,
            self.config.thresholds.weight_tolerance,
        )?;
        Ok(summary)
    }

    /// One full run. Prior outputs are only replaced if every stage succeeds.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let clock = Instant::now();
        info!("Run {} starting (years {:?})", run_id, self.config.reference_years());

        let result = self.execute(&run_id);
        match &result {
            Ok(report) => {
                obs::run::succeeded(clock.elapsed().as_secs_f64());
                info!(
                    "Run {} done in {:.1}s: {} artifacts",
                    report.run_id,
                    clock.elapsed().as_secs_f64(),
                    report.artifacts.len()
                );
            }
            Err(e) => {
                let stage = match e {
                    PipelineError::Stage { stage, .. } => stage.as_str(),
                    _ => "unknown",
                };
                obs::run::failed(stage);
                error!("Run {} failed: {}", run_id, e);
            }
        }
        result
    }

    fn execute(&self, run_id: &str) -> Result<RunReport> {
        let started_at = Utc::now();
        let years = self.config.reference_years();

        let payloads = in_stage(Stage::Fetching, || {
            StagingArea::clean_stale(&self.config.paths.output_dir)?;
            self.fetch_all()
        })?;
        let fetched: Vec<FetchRecord> = payloads.0.values().map(FetchRecord::from).collect();

        let cleaned = in_stage(Stage::Cleaning, || self.clean(&payloads, years))?;

        let (aggregates, aggregation) = in_stage(Stage::Aggregating, || {
            let outcome = Aggregator::new(&cleaned.crosswalk, self.config.thresholds.max_crosswalk_gap_rate)
                .aggregate(&cleaned.records)?;
            Ok((outcome.aggregates, outcome.diagnostics))
        })?;

        let merged = in_stage(Stage::Merging, || self.merge(&payloads, &cleaned, &aggregates, years))?;

        let mut report = RunReport {
            run_id: run_id.to_string(),
            started_at,
            finished_at: started_at,
            reference_years: years,
            fetched,
            crosswalk: cleaned.crosswalk_summary,
            normalization: cleaned.stats,
            aggregation,
            merge: merged.diagnostics,
            geometry: merged.geometry,
            artifacts: Vec::new(),
        };

        let artifacts = in_stage(Stage::Writing, || {
            let mut staging = StagingArea::create(&self.config.paths.output_dir, run_id)?;
            match self.stage_outputs(&mut staging, &merged.table, &merged.regions, &mut report) {
                Ok(()) => staging.promote(),
                Err(e) => {
                    staging.discard();
                    Err(e)
                }
            }
        })?;
        report.artifacts = artifacts;

        info!("Stage {} reached", Stage::Done);
        Ok(report)
    }

    fn fetch_all(&self) -> Result<Payloads> {
        let mut payloads = BTreeMap::new();
        for (id, year) in self.required_inputs() {
            let payload = self.fetcher.fetch(id, year)?;
            payloads.insert((id, year), payload);
        }
        Ok(Payloads(payloads))
    }

    fn clean(&self, payloads: &Payloads, years: [i32; 2]) -> Result<Cleaned> {
        let thresholds = &self.config.thresholds;
        let (crosswalk, crosswalk_summary) = Crosswalk::from_payload(
            payloads.get(SourceId::Crosswalk, None)?,
            &self.mappings.crosswalk,
            thresholds.weight_tolerance,
        )?;

        let normalizer = Normalizer::new(&self.mappings, thresholds.max_rejection_rate);
        let mut records = Vec::new();
        let mut stats = Vec::new();
        for year in years {
            for id in [SourceId::Population, SourceId::Labor] {
                let outcome = normalizer.normalize(payloads.get(id, Some(year))?, id, year)?;
                records.extend(outcome.records);
                stats.push(outcome.stats);
            }
        }

        let gdp = gdp::growth_table(&gdp::parse_levels(payloads.get(SourceId::Gdp, None)?)?);
        let survey = SurveyTable::from_payload(
            payloads.get(SourceId::Survey, None)?,
            &self.config.merge.survey_key_column,
            &self.config.merge.survey_name_column,
        )?;
        Ok(Cleaned {
            crosswalk,
            crosswalk_summary,
            records,
            stats,
            gdp,
            survey,
        })
    }

    fn merge(
        &self,
        payloads: &Payloads,
        cleaned: &Cleaned,
        aggregates: &[RegionAggregate],
        years: [i32; 2],
    ) -> Result<Merged> {
        let merge_cfg = &self.config.merge;
        let (table, diagnostics) = Merger::new(
            merge_cfg.layout,
            years,
            self.config.thresholds.max_unmatched_survey_rate,
        )
        .merge(&cleaned.survey, aggregates, &cleaned.gdp)?;

        let (regions, geometry) = GeometryBuilder::new(&self.config.geometry).build(
            payloads.get(SourceId::States, None)?,
            payloads.get(SourceId::Msas, None)?,
            &table.region_keys(),
        )?;
        Ok(Merged {
            table,
            diagnostics,
            regions,
            geometry,
        })
    }

    fn stage_outputs(
        &self,
        staging: &mut StagingArea,
        table: &MergedTable,
        regions: &[RegionGeometry],
        report: &mut RunReport,
    ) -> Result<()> {
        staging.write(
            &self.config.merge.output_file,
            &table.to_csv(&self.config.merge.missing_marker)?,
        )?;
        staging.write(&self.config.geometry.output_file, &geometry::to_geojson(regions)?)?;

        report.finished_at = Utc::now();
        report.artifacts = staging.staged().to_vec();
        staging.write(RUN_REPORT_FILE, &serde_json::to_vec_pretty(report)?)?;
        Ok(())
    }
}
