use crate::types::Unit;

/// A metric the pipeline knows how to carry through aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSpec {
    pub name: &'static str,
    pub unit: Unit,
    /// Share metrics only: the level metric that weights the ratio.
    pub denominator: Option<&'static str>,
    /// Share metrics only: legal range of the aggregated value.
    pub bounds: Option<(f64, f64)>,
}

const fn level(name: &'static str) -> MetricSpec {
    MetricSpec {
        name,
        unit: Unit::Level,
        denominator: None,
        bounds: None,
    }
}

const fn fraction_of(name: &'static str, denominator: &'static str) -> MetricSpec {
    MetricSpec {
        name,
        unit: Unit::Share,
        denominator: Some(denominator),
        bounds: Some((0.0, 1.0)),
    }
}

/// The fixed registry, in output column order.
pub const METRICS: &[MetricSpec] = &[
    level("pop_total"),
    level("pop_male"),
    level("pop_female"),
    level("pop_white_male"),
    level("pop_black_male"),
    level("pop_other_male"),
    level("pop_white_female"),
    level("pop_black_female"),
    level("pop_other_female"),
    fraction_of("male_share", "pop_total"),
    fraction_of("white_male_share", "pop_male"),
    fraction_of("black_male_share", "pop_male"),
    fraction_of("other_male_share", "pop_male"),
    fraction_of("white_female_share", "pop_female"),
    fraction_of("black_female_share", "pop_female"),
    fraction_of("other_female_share", "pop_female"),
    level("establishments"),
    level("employment"),
    MetricSpec {
        name: "total_wages",
        unit: Unit::Currency,
        denominator: None,
        bounds: None,
    },
    MetricSpec {
        name: "avg_weekly_wage",
        unit: Unit::Share,
        denominator: Some("employment"),
        bounds: Some((0.0, f64::INFINITY)),
    },
];

pub fn lookup(name: &str) -> Option<&'static MetricSpec> {
    METRICS.iter().find(|m| m.name == name)
}

/// Position in the registry; used to order output columns.
pub fn position(name: &str) -> usize {
    METRICS
        .iter()
        .position(|m| m.name == name)
        .unwrap_or(METRICS.len())
}

impl MetricSpec {
    pub fn within_bounds(&self, value: f64) -> bool {
        match self.bounds {
            Some((lo, hi)) => value >= lo && value <= hi,
            None => true,
        }
    }
}
