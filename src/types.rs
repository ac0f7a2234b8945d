use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every input the pipeline knows how to acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Population,
    Labor,
    Crosswalk,
    Gdp,
    Survey,
    States,
    Msas,
}

impl SourceId {
    pub const ALL: [SourceId; 7] = [
        SourceId::Population,
        SourceId::Labor,
        SourceId::Crosswalk,
        SourceId::Gdp,
        SourceId::Survey,
        SourceId::States,
        SourceId::Msas,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Population => "population",
            SourceId::Labor => "labor",
            SourceId::Crosswalk => "crosswalk",
            SourceId::Gdp => "gdp",
            SourceId::Survey => "survey",
            SourceId::States => "states",
            SourceId::Msas => "msas",
        }
    }

    /// Sources published once per reference year.
    pub fn is_year_partitioned(&self) -> bool {
        matches!(self, SourceId::Population | SourceId::Labor)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown source id '{}'", s))
    }
}

/// How a metric's value combines when counties roll up into a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Level,
    Share,
    Currency,
}

/// Geographic grain of a normalized record's `geo_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoLevel {
    County,
    Region,
}

/// One canonical observation produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source: SourceId,
    pub geo_level: GeoLevel,
    pub geo_key: String,
    pub year: i32,
    pub metric_name: String,
    pub value: f64,
    pub unit: Unit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosswalkEntry {
    pub county_key: String,
    pub region_key: String,
    pub weight: f64,
}

/// A metric rolled up to one region for one reference year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionAggregate {
    pub source: SourceId,
    pub region_key: String,
    pub year: i32,
    pub metric_name: String,
    pub value: f64,
    pub unit: Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionType {
    Msa,
    State,
}

impl RegionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionType::Msa => "msa",
            RegionType::State => "state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids_round_trip_through_their_names() {
        for id in SourceId::ALL {
            assert_eq!(id.as_str().parse::<SourceId>().unwrap(), id);
        }
        assert!("census".parse::<SourceId>().is_err());
    }

    #[test]
    fn only_population_and_labor_are_year_partitioned() {
        let partitioned: Vec<_> = SourceId::ALL
            .iter()
            .filter(|id| id.is_year_partitioned())
            .collect();
        assert_eq!(partitioned, vec![&SourceId::Population, &SourceId::Labor]);
    }
}
