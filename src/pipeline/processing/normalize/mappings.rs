//! Declarative column mappings, one table per (source, year).
//!
//! Schema drift between reference years is absorbed here: a new layout means a
//! new `[[source]]` table in `mappings.toml`, never a code branch.

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use super::registry;
use crate::error::{PipelineError, Result};
use crate::types::{GeoLevel, SourceId, Unit};

#[derive(Debug, Clone, Deserialize)]
pub struct MappingSet {
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceMapping>,
    pub crosswalk: CrosswalkMapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceMapping {
    pub id: SourceId,
    pub year: i32,
    /// Preamble lines before the header row.
    #[serde(default)]
    pub skip_lines: usize,
    /// Data rows directly after the header that carry no observations.
    #[serde(default)]
    pub skip_records: usize,
    #[serde(default = "default_granularity")]
    pub granularity: GeoLevel,
    pub geo_key: KeySpec,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    #[serde(default)]
    pub metrics: Vec<MetricColumns>,
    #[serde(default)]
    pub pivot: Option<PivotSpec>,
    #[serde(default)]
    pub derived: Vec<DerivedShare>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeySpec {
    pub columns: Vec<String>,
    pub widths: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RowFilter {
    pub column: String,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub not_equals: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub not_pattern: Option<String>,
    #[serde(skip)]
    compiled: Vec<(Regex, bool)>,
}

/// A metric read directly as the sum of one or more columns.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricColumns {
    pub metric: String,
    pub columns: Vec<String>,
}

/// Rows whose `column` names a category feed every metric listed for it.
#[derive(Debug, Clone, Deserialize)]
pub struct PivotSpec {
    pub column: String,
    /// Columns summed to get the row's value.
    pub values: Vec<String>,
    pub categories: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DerivedShare {
    pub metric: String,
    pub numerator: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrosswalkMapping {
    #[serde(default)]
    pub skip_lines: usize,
    pub county: KeySpec,
    pub region: KeySpec,
    /// Absent means every row carries weight 1.0.
    #[serde(default)]
    pub weight_column: Option<String>,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    #[serde(default)]
    pub residual: Option<ResidualSpec>,
}

/// Counties the crosswalk omits roll up into one region per state, keyed
/// `<prefix><state code>`, when their state has at least one listed county.
#[derive(Debug, Clone, Deserialize)]
pub struct ResidualSpec {
    pub prefix: String,
    /// Leading digits of a county key that name its state.
    pub state_width: usize,
}

fn default_granularity() -> GeoLevel {
    GeoLevel::County
}

impl MappingSet {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read mapping file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse, compile filter patterns and check every metric against the registry.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut set: MappingSet = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("mappings: {}", e)))?;
        for mapping in &mut set.sources {
            for filter in &mut mapping.filters {
                filter.compile()?;
            }
        }
        for filter in &mut set.crosswalk.filters {
            filter.compile()?;
        }
        set.validate()?;
        Ok(set)
    }

    pub fn for_source(&self, id: SourceId, year: i32) -> Option<&SourceMapping> {
        self.sources.iter().find(|m| m.id == id && m.year == year)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for mapping in &self.sources {
            let label = format!("{} ({})", mapping.id, mapping.year);
            if !seen.insert((mapping.id, mapping.year)) {
                return Err(PipelineError::Config(format!("duplicate mapping for {}", label)));
            }
            if !mapping.id.is_year_partitioned() {
                return Err(PipelineError::Config(format!(
                    "{} has no column mapping; only year-partitioned sources are normalized",
                    mapping.id
                )));
            }
            mapping.geo_key.check(&label)?;
            mapping.check_metrics(&label)?;
        }
        self.crosswalk.county.check("crosswalk county key")?;
        self.crosswalk.region.check("crosswalk region key")?;
        if let Some(residual) = &self.crosswalk.residual {
            if residual.prefix.is_empty()
                || residual.state_width == 0
                || residual.state_width >= self.crosswalk.county.width()
            {
                return Err(PipelineError::Config(format!(
                    "crosswalk residual needs a prefix and a state width below the county width {}",
                    self.crosswalk.county.width()
                )));
            }
        }
        Ok(())
    }
}

impl SourceMapping {
    /// Metrics read straight from the payload (direct columns and pivot categories).
    pub fn read_metrics(&self) -> BTreeSet<&str> {
        let mut out: BTreeSet<&str> = self.metrics.iter().map(|m| m.metric.as_str()).collect();
        if let Some(pivot) = &self.pivot {
            for metrics in pivot.categories.values() {
                out.extend(metrics.iter().map(String::as_str));
            }
        }
        out
    }

    /// Every column the mapping expects in the header.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.geo_key.columns.clone();
        cols.extend(self.filters.iter().map(|f| f.column.clone()));
        for m in &self.metrics {
            cols.extend(m.columns.iter().cloned());
        }
        if let Some(pivot) = &self.pivot {
            cols.push(pivot.column.clone());
            cols.extend(pivot.values.iter().cloned());
        }
        cols.dedup();
        cols
    }

    fn check_metrics(&self, label: &str) -> Result<()> {
        let read = self.read_metrics();
        if read.is_empty() {
            return Err(PipelineError::Config(format!("{} maps no metrics", label)));
        }
        let mut produced = read.clone();
        for name in &read {
            let spec = registry::lookup(name).ok_or_else(|| {
                PipelineError::Config(format!("{}: unknown metric '{}'", label, name))
            })?;
            if let Some(pivot) = &self.pivot {
                let from_pivot = pivot.categories.values().flatten().any(|m| m == name);
                if from_pivot && spec.unit == Unit::Share {
                    return Err(PipelineError::Config(format!(
                        "{}: pivot categories can only feed level metrics, not '{}'",
                        label, name
                    )));
                }
            }
        }
        for derived in &self.derived {
            let spec = registry::lookup(&derived.metric).ok_or_else(|| {
                PipelineError::Config(format!("{}: unknown metric '{}'", label, derived.metric))
            })?;
            if spec.unit != Unit::Share {
                return Err(PipelineError::Config(format!(
                    "{}: derived metric '{}' is not a share",
                    label, derived.metric
                )));
            }
            if !read.contains(derived.numerator.as_str()) {
                return Err(PipelineError::Config(format!(
                    "{}: numerator '{}' of '{}' is not mapped",
                    label, derived.numerator, derived.metric
                )));
            }
            if !produced.insert(spec.name) {
                return Err(PipelineError::Config(format!(
                    "{}: metric '{}' is produced twice",
                    label, derived.metric
                )));
            }
        }
        for name in &produced {
            if let Some(denominator) = registry::lookup(name).and_then(|s| s.denominator) {
                if !read.contains(denominator) {
                    return Err(PipelineError::Config(format!(
                        "{}: share '{}' needs its denominator '{}' mapped",
                        label, name, denominator
                    )));
                }
            }
        }
        Ok(())
    }
}

impl KeySpec {
    fn check(&self, label: &str) -> Result<()> {
        if self.columns.is_empty() || self.columns.len() != self.widths.len() {
            return Err(PipelineError::Config(format!(
                "{}: key needs one width per column",
                label
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.widths.iter().sum()
    }
}

impl RowFilter {
    fn compile(&mut self) -> Result<()> {
        let mut compiled = Vec::new();
        for (pattern, keep_on_match) in [(&self.pattern, true), (&self.not_pattern, false)] {
            if let Some(p) = pattern {
                let re = Regex::new(p).map_err(|e| {
                    PipelineError::Config(format!("filter on '{}': {}", self.column, e))
                })?;
                compiled.push((re, keep_on_match));
            }
        }
        self.compiled = compiled;
        Ok(())
    }

    /// Whether a row with this cell value is kept.
    pub fn keeps(&self, value: &str) -> bool {
        let value = value.trim();
        if let Some(expected) = &self.equals {
            if value != expected {
                return false;
            }
        }
        if let Some(rejected) = &self.not_equals {
            if value == rejected {
                return false;
            }
        }
        self.compiled
            .iter()
            .all(|(re, keep_on_match)| re.is_match(value) == *keep_on_match)
    }
}
