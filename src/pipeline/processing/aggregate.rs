//! Crosswalk-driven roll-up of county records into regions.

use serde::Serialize;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

use super::crosswalk::{Assignment, Crosswalk};
use super::normalize::registry;
use crate::error::{PipelineError, Result};
use crate::observability::metrics as obs;
use crate::types::{GeoLevel, NormalizedRecord, RegionAggregate, SourceId, Unit};

const MAX_SAMPLE_KEYS: usize = 10;

/// Running total for one (region, year, metric) group.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Accumulator {
    /// Levels and currency: Σ value·weight.
    Sum(f64),
    /// Shares: Σ value·den·weight over Σ den·weight.
    Ratio { numerator: f64, denominator: f64 },
}

impl Accumulator {
    fn empty(unit: Unit) -> Self {
        match unit {
            Unit::Level | Unit::Currency => Accumulator::Sum(0.0),
            Unit::Share => Accumulator::Ratio {
                numerator: 0.0,
                denominator: 0.0,
            },
        }
    }

    fn add(&mut self, value: f64, denominator: Option<f64>, weight: f64) {
        match self {
            Accumulator::Sum(total) => *total += value * weight,
            Accumulator::Ratio {
                numerator,
                denominator: den_total,
            } => {
                let den = denominator.unwrap_or(0.0);
                *numerator += value * den * weight;
                *den_total += den * weight;
            }
        }
    }

    /// `None` for a share whose weighted denominator is zero.
    fn finish(self) -> Option<f64> {
        match self {
            Accumulator::Sum(total) => Some(total),
            Accumulator::Ratio {
                numerator,
                denominator,
            } if denominator > 0.0 => Some(numerator / denominator),
            Accumulator::Ratio { .. } => None,
        }
    }
}

/// Data-quality signals for one (source, year) group.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationDiagnostics {
    pub source: SourceId,
    pub year: i32,
    pub records_in: usize,
    pub unmapped_records: usize,
    pub unmapped_rate: f64,
    pub sample_unmapped_keys: Vec<String>,
    /// Records of unlisted counties folded into a per-state residual region.
    pub residual_records: usize,
    pub sample_residual_keys: Vec<String>,
    /// Crosswalk counties that contributed nothing this year.
    pub uncovered_counties: usize,
    pub sample_uncovered_keys: Vec<String>,
    pub shares_missing_denominator: usize,
    pub undefined_shares: usize,
    pub out_of_bounds_shares: usize,
    pub aggregates_out: usize,
}

#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub aggregates: Vec<RegionAggregate>,
    pub diagnostics: Vec<AggregationDiagnostics>,
}

pub struct Aggregator<'a> {
    crosswalk: &'a Crosswalk,
    max_gap_rate: f64,
}

type GroupKey = (String, String);

impl<'a> Aggregator<'a> {
    pub fn new(crosswalk: &'a Crosswalk, max_gap_rate: f64) -> Self {
        Self {
            crosswalk,
            max_gap_rate,
        }
    }

    /// Roll every record up through the crosswalk, one (source, year) group at a time.
    pub fn aggregate(&self, records: &[NormalizedRecord]) -> Result<AggregationOutcome> {
        let mut groups: BTreeMap<(SourceId, i32), Vec<&NormalizedRecord>> = BTreeMap::new();
        for record in records {
            groups.entry((record.source, record.year)).or_default().push(record);
        }

        let mut aggregates = Vec::new();
        let mut diagnostics = Vec::new();
        for ((source, year), group) in groups {
            let (mut out, diag) = self.aggregate_group(source, year, &group)?;
            aggregates.append(&mut out);
            diagnostics.push(diag);
        }
        obs::aggregate::region_metrics(aggregates.len());
        Ok(AggregationOutcome {
            aggregates,
            diagnostics,
        })
    }

    fn aggregate_group(
        &self,
        source: SourceId,
        year: i32,
        records: &[&NormalizedRecord],
    ) -> Result<(Vec<RegionAggregate>, AggregationDiagnostics)> {
        let label = format!("{}_{}", source, year);

        // Denominators for share metrics come from the same source, year and geo.
        let levels: HashMap<(&str, &str), f64> = records
            .iter()
            .filter(|r| r.unit != Unit::Share)
            .map(|r| ((r.geo_key.as_str(), r.metric_name.as_str()), r.value))
            .collect();

        let mut acc: BTreeMap<GroupKey, (Unit, Accumulator)> = BTreeMap::new();
        let mut unmapped_keys = BTreeSet::new();
        let mut unmapped_records = 0;
        let mut residual_keys = BTreeSet::new();
        let mut residual_records = 0;
        let mut missing_denominator = 0;
        let mut seen_counties = BTreeSet::new();

        for record in records {
            let targets: Vec<(Cow<str>, f64)> = match record.geo_level {
                GeoLevel::Region if self.crosswalk.has_region(&record.geo_key) => {
                    vec![(Cow::Borrowed(record.geo_key.as_str()), 1.0)]
                }
                GeoLevel::Region => Vec::new(),
                GeoLevel::County => {
                    seen_counties.insert(record.geo_key.as_str());
                    match self.crosswalk.assign(&record.geo_key) {
                        Assignment::Listed(entries) => entries
                            .iter()
                            .map(|e| (Cow::Borrowed(e.region_key.as_str()), e.weight))
                            .collect(),
                        Assignment::Residual(region) => {
                            residual_records += 1;
                            residual_keys.insert(record.geo_key.as_str());
                            vec![(Cow::Owned(region), 1.0)]
                        }
                        Assignment::Unmapped => Vec::new(),
                    }
                }
            };
            if targets.is_empty() {
                unmapped_records += 1;
                unmapped_keys.insert(record.geo_key.clone());
                continue;
            }
            let den = denominator_for(record, &levels);
            if record.unit == Unit::Share && den.is_none() {
                missing_denominator += 1;
                continue;
            }
            for (region, weight) in targets {
                accumulate(&mut acc, &region, record, den, weight);
            }
        }

        let records_in = records.len();
        let unmapped_rate = if records_in == 0 {
            0.0
        } else {
            unmapped_records as f64 / records_in as f64
        };

        let uncovered: Vec<&str> = if records.iter().any(|r| r.geo_level == GeoLevel::County) {
            self.crosswalk
                .counties()
                .filter(|c| !seen_counties.contains(c))
                .collect()
        } else {
            Vec::new()
        };

        let mut out = Vec::new();
        let mut undefined_shares = 0;
        let mut out_of_bounds = 0;
        for ((region_key, metric_name), (unit, accumulator)) in acc {
            let Some(value) = accumulator.finish() else {
                undefined_shares += 1;
                continue;
            };
            if let Some(spec) = registry::lookup(&metric_name) {
                if !spec.within_bounds(value) {
                    out_of_bounds += 1;
                    warn!(
                        "{}: {} for region {} is {} (outside {:?})",
                        label, metric_name, region_key, value, spec.bounds
                    );
                }
            }
            out.push(RegionAggregate {
                source,
                region_key,
                year,
                metric_name,
                value,
                unit,
            });
        }

        let diag = AggregationDiagnostics {
            source,
            year,
            records_in,
            unmapped_records,
            unmapped_rate,
            sample_unmapped_keys: unmapped_keys.iter().take(MAX_SAMPLE_KEYS).cloned().collect(),
            residual_records,
            sample_residual_keys: residual_keys.iter().take(MAX_SAMPLE_KEYS).map(|s| s.to_string()).collect(),
            uncovered_counties: uncovered.len(),
            sample_uncovered_keys: uncovered.iter().take(MAX_SAMPLE_KEYS).map(|s| s.to_string()).collect(),
            shares_missing_denominator: missing_denominator,
            undefined_shares,
            out_of_bounds_shares: out_of_bounds,
            aggregates_out: out.len(),
        };
        obs::aggregate::gaps(&label, diag.unmapped_records, diag.uncovered_counties);

        if unmapped_records > 0 {
            warn!(
                "{}: dropped {} record(s) with no crosswalk entry (e.g. {:?})",
                label, unmapped_records, diag.sample_unmapped_keys
            );
        }
        if residual_records > 0 {
            info!(
                "{}: {} record(s) from unlisted counties went to state residual regions (e.g. {:?})",
                label, residual_records, diag.sample_residual_keys
            );
        }
        if diag.uncovered_counties > 0 {
            info!(
                "{}: {} crosswalk county(ies) had no records (e.g. {:?})",
                label, diag.uncovered_counties, diag.sample_uncovered_keys
            );
        }
        if unmapped_rate > self.max_gap_rate {
            return Err(PipelineError::CrosswalkGap {
                source_id: source.to_string(),
                year,
                unmapped: unmapped_records,
                total: records_in,
                rate: unmapped_rate,
                threshold: self.max_gap_rate,
            });
        }

        info!("Aggregated {}: {} records -> {} region metrics", label, records_in, out.len());
        Ok((out, diag))
    }
}

fn denominator_for(record: &NormalizedRecord, levels: &HashMap<(&str, &str), f64>) -> Option<f64> {
    if record.unit != Unit::Share {
        return None;
    }
    registry::lookup(&record.metric_name)
        .and_then(|spec| spec.denominator)
        .and_then(|den| levels.get(&(record.geo_key.as_str(), den)).copied())
}

fn accumulate(
    acc: &mut BTreeMap<GroupKey, (Unit, Accumulator)>,
    region: &str,
    record: &NormalizedRecord,
    denominator: Option<f64>,
    weight: f64,
) {
    let (_, accumulator) = acc
        .entry((region.to_string(), record.metric_name.clone()))
        .or_insert_with(|| (record.unit, Accumulator::empty(record.unit)));
    accumulator.add(record.value, denominator, weight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CrosswalkEntry;

    fn xw(entries: &[(&str, &str, f64)]) -> Crosswalk {
        Crosswalk::from_entries(
            entries
                .iter()
                .map(|(c, r, w)| CrosswalkEntry {
                    county_key: c.to_string(),
                    region_key: r.to_string(),
                    weight: *w,
                })
                .collect(),
            1e-6,
        )
        .unwrap()
    }

    fn rec(geo: &str, metric: &str, value: f64, unit: Unit) -> NormalizedRecord {
        NormalizedRecord {
            source: SourceId::Labor,
            geo_level: GeoLevel::County,
            geo_key: geo.to_string(),
            year: 1980,
            metric_name: metric.to_string(),
            value,
            unit,
        }
    }

    fn find<'a>(out: &'a [RegionAggregate], region: &str, metric: &str) -> Option<&'a RegionAggregate> {
        out.iter().find(|a| a.region_key == region && a.metric_name == metric)
    }

    #[test]
    fn split_county_levels_are_weighted() {
        let crosswalk = xw(&[("A", "X", 0.6), ("A", "Y", 0.4), ("B", "X", 1.0)]);
        let records = vec![
            rec("A", "employment", 100.0, Unit::Level),
            rec("B", "employment", 50.0, Unit::Level),
        ];
        let out = Aggregator::new(&crosswalk, 0.01).aggregate(&records).unwrap();
        let x = find(&out.aggregates, "X", "employment").unwrap().value;
        let y = find(&out.aggregates, "Y", "employment").unwrap().value;
        assert!((x - 110.0).abs() < 1e-9);
        assert!((y - 40.0).abs() < 1e-9);
        assert_eq!(out.diagnostics[0].unmapped_records, 0);
    }

    #[test]
    fn shares_are_reweighted_not_averaged() {
        let crosswalk = xw(&[("A", "X", 1.0), ("B", "X", 1.0)]);
        // A: 10 of 100 male, B: 900 of 1000 male -> 910 / 1100, not (0.1 + 0.9) / 2
        let records = vec![
            rec("A", "pop_total", 100.0, Unit::Level),
            rec("A", "male_share", 0.1, Unit::Share),
            rec("B", "pop_total", 1000.0, Unit::Level),
            rec("B", "male_share", 0.9, Unit::Share),
        ];
        let out = Aggregator::new(&crosswalk, 0.01).aggregate(&records).unwrap();
        let share = find(&out.aggregates, "X", "male_share").unwrap();
        assert_eq!(share.unit, Unit::Share);
        assert!((share.value - 910.0 / 1100.0).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&share.value));
    }

    #[test]
    fn uncovered_counties_are_counted_not_aggregated() {
        let crosswalk = xw(&[("A", "X", 1.0), ("C", "X", 1.0)]);
        let records = vec![rec("A", "employment", 10.0, Unit::Level)];
        let out = Aggregator::new(&crosswalk, 0.01).aggregate(&records).unwrap();
        let diag = &out.diagnostics[0];
        assert_eq!(diag.uncovered_counties, 1);
        assert_eq!(diag.sample_uncovered_keys, vec!["C".to_string()]);
        assert_eq!(find(&out.aggregates, "X", "employment").unwrap().value, 10.0);
    }

    #[test]
    fn unmapped_records_fail_above_the_gap_threshold() {
        let crosswalk = xw(&[("A", "X", 1.0)]);
        let records = vec![
            rec("A", "employment", 10.0, Unit::Level),
            rec("Z", "employment", 5.0, Unit::Level),
        ];
        let err = Aggregator::new(&crosswalk, 0.01).aggregate(&records).unwrap_err();
        assert!(matches!(err, PipelineError::CrosswalkGap { unmapped: 1, total: 2, .. }));

        let out = Aggregator::new(&crosswalk, 0.6).aggregate(&records).unwrap();
        assert_eq!(out.diagnostics[0].sample_unmapped_keys, vec!["Z".to_string()]);
        assert_eq!(out.aggregates.len(), 1);
    }

    #[test]
    fn unlisted_counties_fold_into_state_residuals_without_a_gap() {
        use crate::pipeline::processing::normalize::mappings::ResidualSpec;

        let spec = ResidualSpec {
            prefix: "nonmetro:".to_string(),
            state_width: 2,
        };
        let crosswalk = xw(&[("48059", "10180", 1.0)]).with_residual(&spec, 5);
        let records = vec![
            rec("48059", "employment", 10.0, Unit::Level),
            rec("48001", "employment", 4.0, Unit::Level),
            rec("48003", "employment", 6.0, Unit::Level),
        ];
        let out = Aggregator::new(&crosswalk, 0.0).aggregate(&records).unwrap();
        assert_eq!(find(&out.aggregates, "10180", "employment").unwrap().value, 10.0);
        assert_eq!(find(&out.aggregates, "nonmetro:48", "employment").unwrap().value, 10.0);
        let diag = &out.diagnostics[0];
        assert_eq!(diag.unmapped_records, 0);
        assert_eq!(diag.residual_records, 2);
        assert_eq!(diag.sample_residual_keys, vec!["48001".to_string(), "48003".to_string()]);

        // A county from a state the crosswalk never lists is still a gap
        let mut with_stranger = records.clone();
        with_stranger.push(rec("56001", "employment", 1.0, Unit::Level));
        let err = Aggregator::new(&crosswalk, 0.0).aggregate(&with_stranger).unwrap_err();
        assert!(matches!(err, PipelineError::CrosswalkGap { unmapped: 1, total: 4, .. }));
    }

    #[test]
    fn region_records_bypass_the_crosswalk() {
        let crosswalk = xw(&[("A", "X", 0.5), ("A", "Y", 0.5)]);
        let mut record = rec("Y", "pop_total", 70.0, Unit::Level);
        record.source = SourceId::Population;
        record.geo_level = GeoLevel::Region;
        let out = Aggregator::new(&crosswalk, 0.01).aggregate(&[record]).unwrap();
        assert_eq!(out.aggregates.len(), 1);
        assert_eq!(out.aggregates[0].region_key, "Y");
        assert_eq!(out.aggregates[0].value, 70.0);
        assert_eq!(out.diagnostics[0].uncovered_counties, 0);
    }

    #[test]
    fn shares_without_a_denominator_are_reported() {
        let crosswalk = xw(&[("A", "X", 1.0)]);
        let records = vec![rec("A", "avg_weekly_wage", 300.0, Unit::Share)];
        let out = Aggregator::new(&crosswalk, 0.01).aggregate(&records).unwrap();
        assert!(out.aggregates.is_empty());
        assert_eq!(out.diagnostics[0].shares_missing_denominator, 1);
    }
}
