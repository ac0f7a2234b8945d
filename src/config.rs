use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::error::{PipelineError, Result};
use crate::types::SourceId;

/// Digits past which rounding an f64 degree value no longer changes it.
pub const MAX_COORDINATE_PRECISION: u32 = 15;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub years: YearsConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mappings: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Where to write the Prometheus exposition text after a run.
    #[serde(default)]
    pub metrics_snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YearsConfig {
    pub reference: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub max_rejection_rate: f64,
    pub max_crosswalk_gap_rate: f64,
    pub max_unmatched_survey_rate: f64,
    pub weight_tolerance: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            max_rejection_rate: 0.05,
            max_crosswalk_gap_rate: 0.01,
            max_unmatched_survey_rate: 0.10,
            weight_tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_seconds: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retries: 2,
            retry_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeLayout {
    /// One row per region, metrics pivoted to `<metric>_<year>` columns.
    Wide,
    /// One row per region and reference year.
    Long,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub layout: MergeLayout,
    pub missing_marker: String,
    pub survey_key_column: String,
    pub survey_name_column: String,
    pub output_file: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            layout: MergeLayout::Wide,
            missing_marker: constants::DEFAULT_MISSING_MARKER.to_string(),
            survey_key_column: constants::DEFAULT_SURVEY_KEY_COLUMN.to_string(),
            survey_name_column: constants::DEFAULT_SURVEY_NAME_COLUMN.to_string(),
            output_file: constants::DEFAULT_TABLE_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Ramer-Douglas-Peucker epsilon, in degrees.
    pub simplify_tolerance: f64,
    pub coordinate_precision: u32,
    pub clip_states: bool,
    pub include_unreferenced_msas: bool,
    pub msa_id_properties: Vec<String>,
    pub state_id_properties: Vec<String>,
    pub name_property: String,
    pub output_file: String,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            simplify_tolerance: 0.005,
            coordinate_precision: 5,
            clip_states: true,
            include_unreferenced_msas: false,
            msa_id_properties: vec!["CBSAFP".to_string(), "GEOID".to_string()],
            state_id_properties: vec!["STATEFP".to_string(), "GEOID".to_string()],
            name_property: "NAME".to_string(),
            output_file: constants::DEFAULT_GEOMETRY_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Csv,
    Json,
    Geojson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Latin1,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    #[serde(default)]
    pub year: Option<i32>,
    /// `http(s)://` URL or a local path (optionally `file://`).
    pub location: String,
    pub format: PayloadFormat,
    /// Path of the file to extract when the location serves a zip archive.
    #[serde(default)]
    pub archive_member: Option<String>,
    #[serde(default)]
    pub encoding: TextEncoding,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// `MSA_DATA_DIR` re-roots cache and output; `MSA_OUTPUT_DIR` wins for output;
    /// `BEA_API_KEY` fills the `{BEA_API_KEY}` placeholder in source locations.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("MSA_DATA_DIR") {
            let root = PathBuf::from(data_dir);
            self.paths.cache_dir = root.join("raw_data");
            self.paths.output_dir = root;
        }
        if let Ok(output_dir) = std::env::var("MSA_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(output_dir);
        }
        if let Ok(key) = std::env::var("BEA_API_KEY") {
            for source in &mut self.sources {
                source.location = source.location.replace("{BEA_API_KEY}", &key);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let years = &self.years.reference;
        if years.len() != 2 || years[0] == years[1] {
            return Err(PipelineError::Config(format!(
                "exactly two distinct reference years are required, got {:?}",
                years
            )));
        }
        let t = &self.thresholds;
        for (name, value) in [
            ("max_rejection_rate", t.max_rejection_rate),
            ("max_crosswalk_gap_rate", t.max_crosswalk_gap_rate),
            ("max_unmatched_survey_rate", t.max_unmatched_survey_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(0.0..1.0).contains(&t.weight_tolerance) {
            return Err(PipelineError::Config(format!(
                "weight_tolerance must be within [0, 1), got {}",
                t.weight_tolerance
            )));
        }
        let geometry = &self.geometry;
        if !geometry.simplify_tolerance.is_finite() || geometry.simplify_tolerance < 0.0 {
            return Err(PipelineError::Config(
                "simplify_tolerance must be a finite, non-negative number".to_string(),
            ));
        }
        if geometry.coordinate_precision > MAX_COORDINATE_PRECISION {
            return Err(PipelineError::Config(format!(
                "coordinate_precision must be at most {}, got {}",
                MAX_COORDINATE_PRECISION, geometry.coordinate_precision
            )));
        }
        for source in &self.sources {
            match (source.id.is_year_partitioned(), source.year) {
                (true, Some(year)) if !years.contains(&year) => {
                    return Err(PipelineError::Config(format!(
                        "source {} declares year {} which is not a reference year",
                        source.id, year
                    )));
                }
                (true, None) => {
                    return Err(PipelineError::Config(format!(
                        "source {} is year-partitioned and needs a year",
                        source.id
                    )));
                }
                (false, Some(_)) => {
                    return Err(PipelineError::Config(format!(
                        "source {} is not year-partitioned",
                        source.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn reference_years(&self) -> [i32; 2] {
        [self.years.reference[0], self.years.reference[1]]
    }

    pub fn source(&self, id: SourceId, year: Option<i32>) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.id == id && s.year == year)
            .ok_or_else(|| match year {
                Some(y) => PipelineError::Config(format!("no source configured for {} ({})", id, y)),
                None => PipelineError::Config(format!("no source configured for {}", id)),
            })
    }
}
