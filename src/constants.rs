/// Shared names used across the pipeline and its output artifacts.

// Final artifact names (overridable in config.toml)
pub const DEFAULT_TABLE_FILE: &str = "merged_bfi.csv";
pub const DEFAULT_GEOMETRY_FILE: &str = "combined_US_regions.geojson";
pub const RUN_REPORT_FILE: &str = "run_report.json";

// Scratch directory prefix inside the output directory
pub const STAGING_PREFIX: &str = ".staging-";

// Disclosed survey columns
pub const DEFAULT_SURVEY_KEY_COLUMN: &str = "metro13";
pub const DEFAULT_SURVEY_NAME_COLUMN: &str = "metro_title";

// Width of a CBSA / MSA code and of a state FIPS code
pub const REGION_KEY_WIDTH: usize = 5;
pub const STATE_KEY_WIDTH: usize = 2;

// Namespace for state keys in the geometry artifact
pub const STATE_KEY_PREFIX: &str = "state:";

// BEA regional GDP fields (JSON API and CSV export share them)
pub const GDP_GEO_FIPS: &str = "GeoFips";
pub const GDP_TIME_PERIOD: &str = "TimePeriod";
pub const GDP_DATA_VALUE: &str = "DataValue";

pub const DEFAULT_MISSING_MARKER: &str = "NA";

/// Column header for GDP growth in a given year.
pub fn gdp_growth_column(year: i32) -> String {
    format!("gdp_growth_{}_percent", year)
}

/// Column header for a metric pivoted to a reference year.
pub fn metric_year_column(metric: &str, year: i32) -> String {
    format!("{}_{}", metric, year)
}
