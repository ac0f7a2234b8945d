use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::RawPayload;
use crate::pipeline::processing::normalize::mappings::{CrosswalkMapping, ResidualSpec};
use crate::pipeline::processing::table;
use crate::types::CrosswalkEntry;

const MAX_LISTED_COUNTIES: usize = 10;

/// Weighted county → region membership.
#[derive(Debug, Clone, Default)]
pub struct Crosswalk {
    by_county: BTreeMap<String, Vec<CrosswalkEntry>>,
    regions: BTreeSet<String>,
    residual: Option<Residual>,
}

#[derive(Debug, Clone)]
struct Residual {
    prefix: String,
    state_width: usize,
    county_width: usize,
    states: BTreeSet<String>,
}

/// Where one county's records go.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment<'a> {
    Listed(&'a [CrosswalkEntry]),
    /// Not listed, but its state is: the whole record goes to the state's residual region.
    Residual(String),
    Unmapped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrosswalkSummary {
    pub counties: usize,
    pub regions: usize,
    pub entries: usize,
    pub split_counties: usize,
    pub filtered_rows: usize,
    /// States whose unlisted counties fall into a residual region.
    pub residual_states: usize,
}

impl Crosswalk {
    /// Build from loose entries: duplicate (county, region) pairs are summed, then
    /// every weight and every per-county total is checked.
    pub fn from_entries(entries: Vec<CrosswalkEntry>, tolerance: f64) -> Result<Self> {
        let mut merged: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for entry in entries {
            *merged
                .entry(entry.county_key)
                .or_default()
                .entry(entry.region_key)
                .or_insert(0.0) += entry.weight;
        }

        let mut bad = Vec::new();
        let mut by_county = BTreeMap::new();
        let mut regions = BTreeSet::new();
        for (county, targets) in merged {
            let total: f64 = targets.values().sum();
            let weights_ok = targets.values().all(|w| *w > 0.0 && *w <= 1.0 + tolerance);
            if !weights_ok || (total - 1.0).abs() > tolerance {
                bad.push(format!("{} (sum {:.6})", county, total));
                continue;
            }
            let list: Vec<CrosswalkEntry> = targets
                .into_iter()
                .map(|(region, weight)| {
                    regions.insert(region.clone());
                    CrosswalkEntry {
                        county_key: county.clone(),
                        region_key: region,
                        weight,
                    }
                })
                .collect();
            by_county.insert(county, list);
        }

        if !bad.is_empty() {
            let shown: Vec<_> = bad.iter().take(MAX_LISTED_COUNTIES).cloned().collect();
            return Err(PipelineError::InvalidCrosswalk(format!(
                "{} county(ies) with weights outside (0,1] or not summing to 1: {}{}",
                bad.len(),
                shown.join(", "),
                if bad.len() > shown.len() { ", ..." } else { "" }
            )));
        }
        Ok(Self {
            by_county,
            regions,
            residual: None,
        })
    }

    /// Send unlisted counties of every listed state to `<prefix><state>`.
    pub fn with_residual(mut self, spec: &ResidualSpec, county_width: usize) -> Self {
        let states = self
            .by_county
            .keys()
            .filter(|c| c.len() == county_width && c.is_ascii())
            .map(|c| c[..spec.state_width].to_string())
            .collect();
        self.residual = Some(Residual {
            prefix: spec.prefix.clone(),
            state_width: spec.state_width,
            county_width,
            states,
        });
        self
    }

    /// Read the crosswalk payload through its declarative mapping.
    pub fn from_payload(
        payload: &RawPayload,
        mapping: &CrosswalkMapping,
        tolerance: f64,
    ) -> Result<(Self, CrosswalkSummary)> {
        let label = payload.label();
        let mut rdr = table::reader(payload.text()?, mapping.skip_lines);
        let headers = rdr
            .headers()
            .map_err(|e| PipelineError::format(&label, format!("unreadable header: {}", e)))?
            .clone();
        let county_idx = table::require_columns(&headers, &mapping.county.columns)
            .map_err(|e| PipelineError::format(&label, e))?;
        let region_idx = table::require_columns(&headers, &mapping.region.columns)
            .map_err(|e| PipelineError::format(&label, e))?;
        let filter_idx = table::require_columns(&headers, mapping.filters.iter().map(|f| &f.column))
            .map_err(|e| PipelineError::format(&label, e))?;
        let weight_idx = match &mapping.weight_column {
            Some(col) => Some(
                table::column_index(&headers, col)
                    .ok_or_else(|| PipelineError::format(&label, format!("missing column(s): {}", col)))?,
            ),
            None => None,
        };

        let mut entries = Vec::new();
        let mut filtered_rows = 0;
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| {
                PipelineError::InvalidCrosswalk(format!("row {}: {}", line + 1, e))
            })?;
            let keep = mapping
                .filters
                .iter()
                .zip(&filter_idx)
                .all(|(f, idx)| f.keeps(record.get(*idx).unwrap_or("")));
            if !keep {
                filtered_rows += 1;
                continue;
            }
            let row_error = |what: &str, e: String| {
                PipelineError::InvalidCrosswalk(format!("row {}: {}: {}", line + 1, what, e))
            };
            let county_key = table::compose_key(&record, &county_idx, &mapping.county.widths)
                .map_err(|e| row_error("county key", e))?;
            let region_key = table::compose_key(&record, &region_idx, &mapping.region.widths)
                .map_err(|e| row_error("region key", e))?;
            let weight = match weight_idx {
                Some(idx) => table::parse_number(record.get(idx).unwrap_or(""))
                    .ok_or_else(|| row_error("weight", "not numeric".to_string()))?,
                None => 1.0,
            };
            entries.push(CrosswalkEntry {
                county_key,
                region_key,
                weight,
            });
        }

        let entry_count = entries.len();
        let mut crosswalk = Self::from_entries(entries, tolerance)?;
        if let Some(spec) = &mapping.residual {
            crosswalk = crosswalk.with_residual(spec, mapping.county.width());
        }
        let summary = CrosswalkSummary {
            counties: crosswalk.by_county.len(),
            regions: crosswalk.regions.len(),
            entries: entry_count,
            split_counties: crosswalk.by_county.values().filter(|v| v.len() > 1).count(),
            filtered_rows,
            residual_states: crosswalk.residual.as_ref().map_or(0, |r| r.states.len()),
        };
        info!(
            "Crosswalk: {} counties -> {} regions ({} split, {} rows filtered)",
            summary.counties, summary.regions, summary.split_counties, summary.filtered_rows
        );
        Ok((crosswalk, summary))
    }

    pub fn regions_for(&self, county_key: &str) -> Option<&[CrosswalkEntry]> {
        self.by_county.get(county_key).map(Vec::as_slice)
    }

    pub fn assign(&self, county_key: &str) -> Assignment<'_> {
        if let Some(entries) = self.regions_for(county_key) {
            return Assignment::Listed(entries);
        }
        match &self.residual {
            Some(r)
                if county_key.len() == r.county_width
                    && county_key.bytes().all(|b| b.is_ascii_digit())
                    && r.states.contains(&county_key[..r.state_width]) =>
            {
                Assignment::Residual(format!("{}{}", r.prefix, &county_key[..r.state_width]))
            }
            _ => Assignment::Unmapped,
        }
    }

    pub fn has_region(&self, region_key: &str) -> bool {
        self.regions.contains(region_key)
    }

    pub fn counties(&self) -> impl Iterator<Item = &str> {
        self.by_county.keys().map(String::as_str)
    }
}
