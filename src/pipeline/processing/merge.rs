//! Survey-driven join of regional aggregates and GDP growth.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

use super::gdp::GdpGrowthTable;
use super::normalize::registry;
use super::survey::SurveyTable;
use crate::config::MergeLayout;
use crate::constants;
use crate::error::{PipelineError, Result};
use crate::observability::metrics as obs;
use crate::types::RegionAggregate;

const MAX_LISTED_REGIONS: usize = 25;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Missing,
}

impl Cell {
    fn from_value(value: Option<f64>) -> Self {
        value.map(Cell::Number).unwrap_or(Cell::Missing)
    }

    pub fn render(&self, missing_marker: &str) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(v) => format_number(*v),
            Cell::Missing => missing_marker.to_string(),
        }
    }
}

/// Six decimals at most, no trailing zeros.
fn format_number(v: f64) -> String {
    let rounded = (v * 1e6).round() / 1e6;
    if rounded == 0.0 {
        return "0".to_string();
    }
    format!("{}", rounded)
}

#[derive(Debug, Clone)]
pub struct MergedRow {
    pub region_key: String,
    /// Set in the long layout only.
    pub year: Option<i32>,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone)]
pub struct MergedTable {
    pub headers: Vec<String>,
    pub rows: Vec<MergedRow>,
}

impl MergedTable {
    pub fn region_keys(&self) -> BTreeSet<String> {
        self.rows.iter().map(|r| r.region_key.clone()).collect()
    }

    pub fn to_csv(&self, missing_marker: &str) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        let csv_err = |e: csv::Error| PipelineError::Io(std::io::Error::other(e.to_string()));
        wtr.write_record(&self.headers).map_err(csv_err)?;
        for row in &self.rows {
            wtr.write_record(row.cells.iter().map(|c| c.render(missing_marker)))
                .map_err(csv_err)?;
        }
        wtr.into_inner()
            .map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeDiagnostics {
    pub survey_regions: usize,
    pub rows_out: usize,
    /// Survey regions matched by each supplementary source.
    pub matched_by_source: BTreeMap<String, usize>,
    pub unmatched_survey_regions: Vec<String>,
    pub unmatched_rate: f64,
    /// Regions present in supplementary data but not in the survey.
    pub supplementary_only_regions: usize,
}

pub struct Merger {
    layout: MergeLayout,
    years: [i32; 2],
    max_unmatched_rate: f64,
}

impl Merger {
    pub fn new(layout: MergeLayout, years: [i32; 2], max_unmatched_rate: f64) -> Self {
        Self {
            layout,
            years,
            max_unmatched_rate,
        }
    }

    /// Left-join everything onto the survey; no survey region is ever dropped.
    pub fn merge(
        &self,
        survey: &SurveyTable,
        aggregates: &[RegionAggregate],
        gdp: &GdpGrowthTable,
    ) -> Result<(MergedTable, MergeDiagnostics)> {
        let mut metric_names: Vec<&str> = aggregates
            .iter()
            .map(|a| a.metric_name.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        metric_names.sort_by_key(|m| (registry::position(m), *m));

        let values: HashMap<(&str, i32, &str), f64> = aggregates
            .iter()
            .map(|a| ((a.region_key.as_str(), a.year, a.metric_name.as_str()), a.value))
            .collect();

        let mut regions_by_source: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        for a in aggregates {
            regions_by_source
                .entry(a.source.to_string())
                .or_default()
                .insert(a.region_key.as_str());
        }
        regions_by_source.insert(
            "gdp".to_string(),
            gdp.rows.keys().map(String::as_str).collect(),
        );

        let survey_keys = survey.region_keys();
        let gdp_columns = gdp.columns();
        let mut headers = survey.headers.clone();
        match self.layout {
            MergeLayout::Wide => {
                for metric in &metric_names {
                    for year in self.years {
                        headers.push(constants::metric_year_column(metric, year));
                    }
                }
            }
            MergeLayout::Long => {
                headers.push("year".to_string());
                headers.extend(metric_names.iter().map(|m| m.to_string()));
            }
        }
        headers.extend(gdp_columns.iter().cloned());

        let mut rows = Vec::new();
        for survey_row in &survey.rows {
            let key = survey_row.region_key.as_str();
            let mut base: Vec<Cell> = survey_row.cells.iter().cloned().map(Cell::Text).collect();
            let gdp_cells: Vec<Cell> = gdp
                .years
                .iter()
                .map(|y| Cell::from_value(gdp.growth(key, *y)))
                .collect();
            match self.layout {
                MergeLayout::Wide => {
                    for metric in &metric_names {
                        for year in self.years {
                            base.push(Cell::from_value(values.get(&(key, year, *metric)).copied()));
                        }
                    }
                    base.extend(gdp_cells);
                    rows.push(MergedRow {
                        region_key: key.to_string(),
                        year: None,
                        cells: base,
                    });
                }
                MergeLayout::Long => {
                    for year in self.years {
                        let mut cells = base.clone();
                        cells.push(Cell::Number(f64::from(year)));
                        for metric in &metric_names {
                            cells.push(Cell::from_value(values.get(&(key, year, *metric)).copied()));
                        }
                        cells.extend(gdp_cells.iter().cloned());
                        rows.push(MergedRow {
                            region_key: key.to_string(),
                            year: Some(year),
                            cells,
                        });
                    }
                }
            }
        }

        let matched_by_source: BTreeMap<String, usize> = regions_by_source
            .iter()
            .map(|(source, regions)| {
                let n = survey_keys.iter().filter(|k| regions.contains(k.as_str())).count();
                (source.clone(), n)
            })
            .collect();
        let unmatched: Vec<String> = survey_keys
            .iter()
            .filter(|k| !regions_by_source.values().any(|r| r.contains(k.as_str())))
            .cloned()
            .collect();
        let supplementary: BTreeSet<&str> = regions_by_source.values().flatten().copied().collect();
        let supplementary_only = supplementary
            .iter()
            .filter(|k| !survey_keys.contains(**k))
            .count();
        let unmatched_rate = if survey_keys.is_empty() {
            0.0
        } else {
            unmatched.len() as f64 / survey_keys.len() as f64
        };

        let diagnostics = MergeDiagnostics {
            survey_regions: survey_keys.len(),
            rows_out: rows.len(),
            matched_by_source,
            unmatched_survey_regions: unmatched.clone(),
            unmatched_rate,
            supplementary_only_regions: supplementary_only,
        };
        obs::merge::regions(diagnostics.survey_regions, unmatched.len());

        if !unmatched.is_empty() {
            let shown: Vec<_> = unmatched.iter().take(MAX_LISTED_REGIONS).collect();
            warn!(
                "{} survey region(s) matched no supplementary source: {:?}",
                unmatched.len(),
                shown
            );
        }
        if unmatched_rate > self.max_unmatched_rate {
            return Err(PipelineError::IntegrityError {
                unmatched: unmatched.len(),
                total: survey_keys.len(),
                rate: unmatched_rate,
                threshold: self.max_unmatched_rate,
            });
        }

        info!(
            "Merged {} survey regions into {} rows ({} columns); {} supplementary-only regions",
            diagnostics.survey_regions,
            diagnostics.rows_out,
            headers.len(),
            supplementary_only
        );
        Ok((MergedTable { headers, rows }, diagnostics))
    }
}
