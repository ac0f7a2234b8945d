//! Schema normalization: raw per-year tables into canonical records.

pub mod mappings;
pub mod registry;

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use self::mappings::{MappingSet, SourceMapping};
use crate::error::{PipelineError, Result};
use crate::observability::metrics as obs;
use crate::pipeline::ingestion::RawPayload;
use crate::pipeline::processing::table;
use crate::types::{NormalizedRecord, SourceId};

const MAX_SAMPLE_REJECTIONS: usize = 5;

/// Row accounting for one (source, year) normalization.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizationStats {
    pub source: SourceId,
    pub year: i32,
    pub rows_read: usize,
    pub filtered: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub rejection_rate: f64,
    /// Derived shares skipped because the denominator was zero.
    pub undefined_shares: usize,
    pub records: usize,
    pub sample_rejections: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NormalizationOutcome {
    pub records: Vec<NormalizedRecord>,
    pub stats: NormalizationStats,
}

pub struct Normalizer<'a> {
    mappings: &'a MappingSet,
    max_rejection_rate: f64,
}

/// Per-row values, keyed by metric.
type RowValues = Vec<(String, f64)>;

impl<'a> Normalizer<'a> {
    pub fn new(mappings: &'a MappingSet, max_rejection_rate: f64) -> Self {
        Self {
            mappings,
            max_rejection_rate,
        }
    }

    /// Map one payload into canonical records, tolerating bad rows up to the
    /// configured rejection rate.
    pub fn normalize(&self, payload: &RawPayload, source: SourceId, year: i32) -> Result<NormalizationOutcome> {
        let label = format!("{}_{}", source, year);
        let mapping = self.mappings.for_source(source, year).ok_or_else(|| {
            PipelineError::Config(format!("no column mapping for {} ({})", source, year))
        })?;

        let mut rdr = table::reader(payload.text()?, mapping.skip_lines);
        let headers = rdr
            .headers()
            .map_err(|e| PipelineError::format(&label, format!("unreadable header: {}", e)))?
            .clone();
        let columns = ResolvedColumns::resolve(mapping, &headers)
            .map_err(|reason| PipelineError::format(&label, reason))?;

        let mut stats = NormalizationStats {
            source,
            year,
            rows_read: 0,
            filtered: 0,
            accepted: 0,
            rejected: 0,
            rejection_rate: 0.0,
            undefined_shares: 0,
            records: 0,
            sample_rejections: Vec::new(),
        };
        let mut totals: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

        for (line, result) in rdr.records().enumerate().skip(mapping.skip_records) {
            stats.rows_read += 1;
            let outcome = result
                .map_err(|e| e.to_string())
                .and_then(|record| columns.read_row(mapping, &record));
            match outcome {
                Ok(None) => stats.filtered += 1,
                Ok(Some((geo_key, values))) => {
                    stats.accepted += 1;
                    let county = totals.entry(geo_key).or_default();
                    for (metric, value) in values {
                        *county.entry(metric).or_insert(0.0) += value;
                    }
                }
                Err(reason) => {
                    stats.rejected += 1;
                    if stats.sample_rejections.len() < MAX_SAMPLE_REJECTIONS {
                        stats
                            .sample_rejections
                            .push(format!("row {}: {}", line + 1, reason));
                    }
                }
            }
        }

        let considered = stats.accepted + stats.rejected;
        if considered == 0 {
            return Err(PipelineError::format(&label, "no data rows survived the row filters"));
        }
        stats.rejection_rate = stats.rejected as f64 / considered as f64;
        obs::normalize::rows(&label, stats.accepted, stats.rejected, stats.filtered);
        obs::normalize::rejection_rate(&label, stats.rejection_rate);

        if stats.rejection_rate > self.max_rejection_rate {
            warn!(
                "{}: rejection rate {:.4} exceeds {:.4}; samples: {:?}",
                label, stats.rejection_rate, self.max_rejection_rate, stats.sample_rejections
            );
            return Err(PipelineError::SchemaRejectionRateExceeded {
                source_id: source.to_string(),
                year,
                rejected: stats.rejected,
                considered,
                rate: stats.rejection_rate,
                threshold: self.max_rejection_rate,
            });
        }
        if stats.rejected > 0 {
            debug!("{}: sample rejections {:?}", label, stats.sample_rejections);
        }

        let records = emit_records(mapping, source, year, totals, &mut stats.undefined_shares);
        stats.records = records.len();
        info!(
            "Normalized {}: {} rows accepted, {} rejected, {} filtered -> {} records",
            label, stats.accepted, stats.rejected, stats.filtered, stats.records
        );
        Ok(NormalizationOutcome { records, stats })
    }
}

/// Column positions for one mapping against one header row.
struct ResolvedColumns {
    geo: Vec<usize>,
    filters: Vec<usize>,
    metrics: Vec<Vec<usize>>,
    pivot: Option<(usize, Vec<usize>)>,
}

impl ResolvedColumns {
    fn resolve(mapping: &SourceMapping, headers: &csv::StringRecord) -> std::result::Result<Self, String> {
        table::require_columns(headers, &mapping.referenced_columns())?;
        let geo = table::require_columns(headers, &mapping.geo_key.columns)?;
        let filters = table::require_columns(headers, mapping.filters.iter().map(|f| &f.column))?;
        let metrics = mapping
            .metrics
            .iter()
            .map(|m| table::require_columns(headers, &m.columns))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let pivot = match &mapping.pivot {
            Some(p) => {
                let column = table::require_columns(headers, std::iter::once(&p.column))?[0];
                Some((column, table::require_columns(headers, &p.values)?))
            }
            None => None,
        };
        Ok(Self {
            geo,
            filters,
            metrics,
            pivot,
        })
    }

    /// `Ok(None)` when a filter drops the row, `Err` when a cell fails coercion.
    fn read_row(
        &self,
        mapping: &SourceMapping,
        record: &csv::StringRecord,
    ) -> std::result::Result<Option<(String, RowValues)>, String> {
        for (filter, idx) in mapping.filters.iter().zip(&self.filters) {
            if !filter.keeps(record.get(*idx).unwrap_or("")) {
                return Ok(None);
            }
        }

        let mut values = RowValues::new();
        if let (Some(pivot), Some((cat_idx, value_idx))) = (&mapping.pivot, &self.pivot) {
            let category = record.get(*cat_idx).unwrap_or("").trim();
            let targets = pivot
                .categories
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(category))
                .map(|(_, metrics)| metrics);
            match targets {
                Some(metrics) => {
                    let value = sum_cells(record, value_idx, &pivot.values)?;
                    values.extend(metrics.iter().map(|m| (m.clone(), value)));
                }
                None if mapping.metrics.is_empty() => return Ok(None),
                None => {}
            }
        }
        for (metric, idx) in mapping.metrics.iter().zip(&self.metrics) {
            values.push((metric.metric.clone(), sum_cells(record, idx, &metric.columns)?));
        }

        let geo_key = table::compose_key(record, &self.geo, &mapping.geo_key.widths)
            .map_err(|e| format!("geo key: {}", e))?;
        Ok(Some((geo_key, values)))
    }
}

fn sum_cells(record: &csv::StringRecord, indices: &[usize], names: &[String]) -> std::result::Result<f64, String> {
    let mut total = 0.0;
    for (idx, name) in indices.iter().zip(names) {
        let raw = record.get(*idx).ok_or_else(|| format!("'{}' is missing", name))?;
        total += table::parse_number(raw).ok_or_else(|| format!("'{}' = '{}' is not numeric", name, raw))?;
    }
    Ok(total)
}

fn emit_records(
    mapping: &SourceMapping,
    source: SourceId,
    year: i32,
    totals: BTreeMap<String, BTreeMap<String, f64>>,
    undefined_shares: &mut usize,
) -> Vec<NormalizedRecord> {
    let mut records = Vec::new();
    for (geo_key, mut metrics) in totals {
        for derived in &mapping.derived {
            let Some(spec) = registry::lookup(&derived.metric) else {
                continue;
            };
            let numerator = metrics.get(&derived.numerator).copied();
            let denominator = spec.denominator.and_then(|d| metrics.get(d).copied());
            match (numerator, denominator) {
                (Some(n), Some(d)) if d > 0.0 => {
                    metrics.insert(derived.metric.clone(), n / d);
                }
                _ => *undefined_shares += 1,
            }
        }
        for (metric_name, value) in metrics {
            let Some(spec) = registry::lookup(&metric_name) else {
                continue;
            };
            records.push(NormalizedRecord {
                source,
                geo_level: mapping.granularity,
                geo_key: geo_key.clone(),
                year,
                metric_name,
                value,
                unit: spec.unit,
            });
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ingestion::{PayloadBody, PayloadOrigin};
    use crate::types::{GeoLevel, Unit};

    const MAPPINGS: &str = r#"
        [[source]]
        id = "labor"
        year = 1980
        geo_key = { columns = ["area_fips"], widths = [5] }
        filters = [{ column = "own_title", equals = "Total Covered" }]
        metrics = [
            { metric = "employment", columns = ["annual_avg_emplvl"] },
            { metric = "total_wages", columns = ["total_annual_wages"] },
        ]

        [[source]]
        id = "population"
        year = 1980
        skip_lines = 1
        geo_key = { columns = ["fips"], widths = [5] }
        derived = [{ metric = "male_share", numerator = "pop_male" }]

        [source.pivot]
        column = "group"
        values = ["young", "old"]
        [source.pivot.categories]
        "White male" = ["pop_white_male", "pop_male", "pop_total"]
        "White female" = ["pop_white_female", "pop_female", "pop_total"]

        [crosswalk]
        county = { columns = ["county"], widths = [5] }
        region = { columns = ["region"], widths = [5] }
    "#;

    fn payload(source: SourceId, text: &str) -> RawPayload {
        RawPayload {
            source,
            year: Some(1980),
            origin: PayloadOrigin::Local,
            sha256: String::new(),
            body: PayloadBody::Text(text.to_string()),
        }
    }

    fn value(records: &[NormalizedRecord], geo: &str, metric: &str) -> f64 {
        records
            .iter()
            .find(|r| r.geo_key == geo && r.metric_name == metric)
            .map(|r| r.value)
            .unwrap()
    }

    #[test]
    fn labor_rows_are_filtered_padded_and_tagged() {
        let set = MappingSet::from_toml(MAPPINGS).unwrap();
        let text = "area_fips,own_title,annual_avg_emplvl,total_annual_wages\n\
                    1001,Total Covered,\"1,200\",5000\n\
                    1001,Private,900,3000\n\
                    01003,Total Covered,300,1200\n";
        let out = Normalizer::new(&set, 0.05)
            .normalize(&payload(SourceId::Labor, text), SourceId::Labor, 1980)
            .unwrap();

        assert_eq!(out.stats.filtered, 1);
        assert_eq!(out.stats.accepted, 2);
        assert_eq!(out.stats.rejected, 0);
        assert_eq!(value(&out.records, "01001", "employment"), 1200.0);
        let wages = out
            .records
            .iter()
            .find(|r| r.metric_name == "total_wages")
            .unwrap();
        assert_eq!(wages.unit, Unit::Currency);
        assert_eq!(wages.geo_level, GeoLevel::County);
        assert!(out.records.iter().all(|r| r.year == 1980));
    }

    #[test]
    fn pivot_rows_sum_into_levels_and_derive_shares() {
        let set = MappingSet::from_toml(MAPPINGS).unwrap();
        let text = "Population estimates by age\n\
                    fips,group,young,old\n\
                    1001,White male,10,20\n\
                    1001,White female,40,30\n\
                    1001,Other races male,5,5\n";
        let out = Normalizer::new(&set, 0.05)
            .normalize(&payload(SourceId::Population, text), SourceId::Population, 1980)
            .unwrap();

        assert_eq!(out.stats.filtered, 1);
        assert_eq!(value(&out.records, "01001", "pop_total"), 100.0);
        assert_eq!(value(&out.records, "01001", "pop_male"), 30.0);
        assert!((value(&out.records, "01001", "male_share") - 0.3).abs() < 1e-12);
        let share = out
            .records
            .iter()
            .find(|r| r.metric_name == "male_share")
            .unwrap();
        assert_eq!(share.unit, Unit::Share);
    }

    #[test]
    fn rejection_rate_above_threshold_is_fatal() {
        let set = MappingSet::from_toml(MAPPINGS).unwrap();
        let mut text = String::from("area_fips,own_title,annual_avg_emplvl,total_annual_wages\n");
        for i in 0..18 {
            text.push_str(&format!("{},Total Covered,10,100\n", 1001 + i));
        }
        text.push_str("1050,Total Covered,(D),100\n");
        text.push_str("1051,Total Covered,,100\n");

        let err = Normalizer::new(&set, 0.05)
            .normalize(&payload(SourceId::Labor, &text), SourceId::Labor, 1980)
            .unwrap_err();
        match err {
            PipelineError::SchemaRejectionRateExceeded {
                rejected, considered, ..
            } => {
                assert_eq!(rejected, 2);
                assert_eq!(considered, 20);
            }
            other => panic!("unexpected error: {other}"),
        }

        let out = Normalizer::new(&set, 0.15)
            .normalize(&payload(SourceId::Labor, &text), SourceId::Labor, 1980)
            .unwrap();
        assert_eq!(out.stats.rejected, 2);
        assert!((out.stats.rejection_rate - 0.1).abs() < 1e-12);
        assert_eq!(out.stats.sample_rejections.len(), 2);
    }

    #[test]
    fn missing_mapped_column_is_a_format_error() {
        let set = MappingSet::from_toml(MAPPINGS).unwrap();
        let text = "area_fips,own_title,annual_avg_emplvl\n1001,Total Covered,10\n";
        let err = Normalizer::new(&set, 0.05)
            .normalize(&payload(SourceId::Labor, text), SourceId::Labor, 1980)
            .unwrap_err();
        assert!(matches!(err, PipelineError::FormatError { .. }));
        assert!(err.to_string().contains("total_annual_wages"));
    }

    #[test]
    fn unmapped_year_is_a_config_error() {
        let set = MappingSet::from_toml(MAPPINGS).unwrap();
        let err = Normalizer::new(&set, 0.05)
            .normalize(&payload(SourceId::Labor, "a\n1\n"), SourceId::Labor, 2022)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
