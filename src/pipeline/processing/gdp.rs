//! Regional GDP levels and their year-over-year growth.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::constants::{self, GDP_DATA_VALUE, GDP_GEO_FIPS, GDP_TIME_PERIOD, REGION_KEY_WIDTH};
use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::{PayloadBody, RawPayload};
use crate::pipeline::processing::table;

/// GDP level per region and year; `None` where the publisher suppressed the value.
pub type GdpLevels = BTreeMap<String, BTreeMap<i32, Option<f64>>>;

/// Percent change per region for every year after the first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GdpGrowthTable {
    pub years: Vec<i32>,
    pub rows: BTreeMap<String, BTreeMap<i32, Option<f64>>>,
}

impl GdpGrowthTable {
    pub fn columns(&self) -> Vec<String> {
        self.years.iter().map(|y| constants::gdp_growth_column(*y)).collect()
    }

    pub fn growth(&self, region_key: &str, year: i32) -> Option<f64> {
        self.rows.get(region_key).and_then(|r| r.get(&year)).copied().flatten()
    }
}

/// Read GDP levels from either a BEA API response or a long CSV export.
pub fn parse_levels(payload: &RawPayload) -> Result<GdpLevels> {
    let label = payload.label();
    let mut levels = GdpLevels::new();
    match &payload.body {
        PayloadBody::Json(value) => {
            let root = value.get("BEAAPI").unwrap_or(value);
            let results = root
                .get("Results")
                .ok_or_else(|| PipelineError::format(&label, "response has no Results"))?;
            let results = match results {
                Value::Array(items) => items.first().unwrap_or(&Value::Null),
                other => other,
            };
            if let Some(error) = results.get("Error").or_else(|| root.get("Error")) {
                return Err(PipelineError::format(&label, format!("API error: {}", error)));
            }
            let data = results
                .get("Data")
                .and_then(Value::as_array)
                .ok_or_else(|| PipelineError::format(&label, "Results has no Data array"))?;
            for item in data {
                let field = |name: &str| match item.get(name) {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                let (Some(geo), Some(period)) = (field(GDP_GEO_FIPS), field(GDP_TIME_PERIOD)) else {
                    return Err(PipelineError::format(&label, "Data item lacks GeoFips or TimePeriod"));
                };
                insert_level(&label, &mut levels, &geo, &period, field(GDP_DATA_VALUE).as_deref())?;
            }
        }
        PayloadBody::Text(text) => {
            let mut rdr = table::reader(text, 0);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::format(&label, format!("unreadable header: {}", e)))?
                .clone();
            let names = [GDP_GEO_FIPS, GDP_TIME_PERIOD, GDP_DATA_VALUE].map(String::from);
            let idx = table::require_columns(&headers, &names)
                .map_err(|e| PipelineError::format(&label, e))?;
            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::format(&label, e.to_string()))?;
                insert_level(
                    &label,
                    &mut levels,
                    record.get(idx[0]).unwrap_or(""),
                    record.get(idx[1]).unwrap_or(""),
                    record.get(idx[2]),
                )?;
            }
        }
    }
    if levels.is_empty() {
        return Err(PipelineError::format(&label, "no GDP observations"));
    }
    Ok(levels)
}

fn insert_level(label: &str, levels: &mut GdpLevels, geo: &str, period: &str, value: Option<&str>) -> Result<()> {
    let region = table::normalize_code(geo, REGION_KEY_WIDTH)
        .map_err(|e| PipelineError::format(label, format!("GeoFips: {}", e)))?;
    let year: i32 = period
        .trim()
        .parse()
        .map_err(|_| PipelineError::format(label, format!("TimePeriod '{}' is not a year", period)))?;
    // "(NA)" and "(D)" mark suppressed values
    let value = value.and_then(table::parse_number);
    levels.entry(region).or_default().insert(year, value);
    Ok(())
}

/// Percent change from the previous available year, to one decimal; the first year is dropped.
pub fn growth_table(levels: &GdpLevels) -> GdpGrowthTable {
    let all_years: BTreeSet<i32> = levels.values().flat_map(|y| y.keys().copied()).collect();
    let years: Vec<i32> = all_years.iter().skip(1).copied().collect();

    let mut rows = BTreeMap::new();
    for (region, series) in levels {
        let mut row = BTreeMap::new();
        for pair in all_years.iter().collect::<Vec<_>>().windows(2) {
            let (prev, cur) = (*pair[0], *pair[1]);
            let previous = series.get(&prev).copied().flatten();
            let current = series.get(&cur).copied().flatten();
            let growth = match (previous, current) {
                (Some(p), Some(c)) if p != 0.0 => Some(((c - p) / p * 100.0 * 10.0).round() / 10.0),
                _ => None,
            };
            row.insert(cur, growth);
        }
        rows.insert(region.clone(), row);
    }
    info!("GDP growth: {} regions, years {:?}", rows.len(), years);
    GdpGrowthTable { years, rows }
}
