#![allow(dead_code)]

use msa_pipeline::app::ports::{HttpClientPort, HttpGetResult};
use msa_pipeline::config::Config;
use msa_pipeline::pipeline::Pipeline;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const CROSSWALK_URL: &str = "https://example.test/cbsa2fipsxw.csv";

/// Serves canned bodies by URL and counts requests.
#[derive(Default)]
pub struct MockHttp {
    bodies: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    requests: Mutex<usize>,
}

impl MockHttp {
    pub fn serve(&self, url: &str, status: u16, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.as_bytes().to_vec()));
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

impl HttpClientPort for MockHttp {
    fn get(&self, url: &str, _timeout: Duration) -> Result<HttpGetResult, String> {
        *self.requests.lock().unwrap() += 1;
        match self.bodies.lock().unwrap().get(url) {
            Some((status, bytes)) => Ok(HttpGetResult {
                status: *status,
                bytes: bytes.clone(),
                content_type: "text/csv".to_string(),
            }),
            None => Err(format!("connection refused: {}", url)),
        }
    }
}

pub const MAPPINGS: &str = r#"
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

[[source]]
id = "population"
year = 2022
granularity = "region"
geo_key = { columns = ["CBSA"], widths = [5] }
filters = [{ column = "AGEGRP", equals = "0" }]
metrics = [
    { metric = "pop_total", columns = ["TOT_POP"] },
    { metric = "pop_male", columns = ["TOT_MALE"] },
]
derived = [{ metric = "male_share", numerator = "pop_male" }]

[[source]]
id = "labor"
year = 1980
geo_key = { columns = ["area_fips"], widths = [5] }
filters = [{ column = "own_title", equals = "Total Covered" }]
metrics = [
    { metric = "employment", columns = ["annual_avg_emplvl"] },
    { metric = "avg_weekly_wage", columns = ["annual_avg_wkly_wage"] },
]

[[source]]
id = "labor"
year = 2022
geo_key = { columns = ["area_fips"], widths = [5] }
filters = [{ column = "own_title", equals = "Total Covered" }]
metrics = [
    { metric = "employment", columns = ["emplvl"] },
    { metric = "avg_weekly_wage", columns = ["wkly_wage"] },
]

[crosswalk]
county = { columns = ["county"], widths = [5] }
region = { columns = ["cbsa"], widths = [5] }
weight_column = "weight"
"#;

// County A (01001) splits 0.6 / 0.4 between X (10180) and Y (10420).
pub const CROSSWALK: &str = "county,cbsa,weight\n\
                             1001,10180,0.6\n\
                             1001,10420,0.4\n\
                             1003,10180,1.0\n\
                             1005,10420,1.0\n";

pub const POPULATION_1980: &str = "Annual county estimates by race and sex\n\
                                   fips,group,young,old\n\
                                   1001,White male,30,20\n\
                                   1001,White female,25,25\n\
                                   1003,White male,10,10\n\
                                   1003,White female,15,15\n\
                                   1005,White male,5,5\n\
                                   1005,White female,5,5\n";

pub const POPULATION_2022: &str = "CBSA,NAME,AGEGRP,TOT_POP,TOT_MALE\n\
                                   10180,Abilene,0,1000,480\n\
                                   10180,Abilene,1,100,50\n\
                                   10420,Akron,0,2000,990\n";

// County C (01005) has no 1980 labor row.
pub const LABOR_1980: &str = "area_fips,own_title,annual_avg_emplvl,annual_avg_wkly_wage\n\
                              1001,Total Covered,100,200\n\
                              1001,Private,90,210\n\
                              1003,Total Covered,50,500\n";

pub const LABOR_2022: &str = "area_fips,own_title,emplvl,wkly_wage\n\
                              1001,Total Covered,200,300\n\
                              1003,Total Covered,100,600\n\
                              1005,Total Covered,10,100\n";

pub const GDP: &str = "GeoFips,GeoName,TimePeriod,DataValue\n\
                       10180,Abilene,2021,100\n\
                       10180,Abilene,2022,103\n\
                       10420,Akron,2021,50\n\
                       10420,Akron,2022,(NA)\n";

pub const SURVEY: &str = "metro13,metro_title,healthcare_jobs\n\
                          10180,\"Abilene, TX\",1200\n\
                          10420,\"Akron, OH\",3400\n\
                          19999,\"Nowhere, ZZ\",10\n";

fn square(x: f64, y: f64, size: f64) -> Value {
    json!([[[x, y], [x + size, y], [x + size, y + size], [x, y + size], [x, y]]])
}

fn collection(features: Vec<(Value, Value)>) -> String {
    let features: Vec<Value> = features
        .into_iter()
        .map(|(props, coords)| {
            json!({ "type": "Feature", "properties": props,
                    "geometry": { "type": "Polygon", "coordinates": coords } })
        })
        .collect();
    json!({ "type": "FeatureCollection", "features": features }).to_string()
}

pub fn states_geojson() -> String {
    collection(vec![(json!({ "STATEFP": "01", "NAME": "Alabama" }), square(0.0, 0.0, 20.0))])
}

pub fn msas_geojson(keys: &[&str]) -> String {
    collection(
        keys.iter()
            .enumerate()
            .map(|(i, k)| {
                let offset = 1.0 + 4.0 * i as f64;
                (json!({ "CBSAFP": k, "NAME": format!("Metro {}", k) }), square(offset, offset, 2.0))
            })
            .collect(),
    )
}

pub struct Fixture {
    pub dir: TempDir,
    pub http: Arc<MockHttp>,
    pub max_unmatched_survey_rate: f64,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        fs::create_dir_all(&inputs).unwrap();
        let files = [
            ("population_1980.csv", POPULATION_1980.to_string()),
            ("population_2022.csv", POPULATION_2022.to_string()),
            ("labor_1980.csv", LABOR_1980.to_string()),
            ("labor_2022.csv", LABOR_2022.to_string()),
            ("gdp.csv", GDP.to_string()),
            ("survey.csv", SURVEY.to_string()),
            ("states.geojson", states_geojson()),
            ("msas.geojson", msas_geojson(&["10180", "10420", "19999", "99999"])),
        ];
        for (name, body) in files {
            fs::write(inputs.join(name), body).unwrap();
        }
        fs::write(dir.path().join("mappings.toml"), MAPPINGS).unwrap();

        let http = Arc::new(MockHttp::default());
        http.serve(CROSSWALK_URL, 200, CROSSWALK);
        Self {
            dir,
            http,
            max_unmatched_survey_rate: 0.5,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn input(&self, name: &str) -> PathBuf {
        self.root().join("inputs").join(name)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root().join("out")
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.output_dir().join(name)
    }

    pub fn replace_input(&self, name: &str, body: &str) {
        fs::write(self.input(name), body).unwrap();
    }

    pub fn replace_mappings(&self, body: &str) {
        fs::write(self.root().join("mappings.toml"), body).unwrap();
    }

    pub fn config(&self) -> Config {
        let root = self.root().display().to_string();
        let toml = format!(
            r#"
            [paths]
            cache_dir = "{root}/cache"
            output_dir = "{root}/out"
            mappings = "{root}/mappings.toml"
            log_dir = "{root}/logs"

            [years]
            reference = [1980, 2022]

            [thresholds]
            max_unmatched_survey_rate = {rate}

            [fetch]
            retries = 0
            retry_backoff_ms = 0

            [[sources]]
            id = "population"
            year = 1980
            location = "{root}/inputs/population_1980.csv"
            format = "csv"

            [[sources]]
            id = "population"
            year = 2022
            location = "file://{root}/inputs/population_2022.csv"
            format = "csv"

            [[sources]]
            id = "labor"
            year = 1980
            location = "{root}/inputs/labor_1980.csv"
            format = "csv"

            [[sources]]
            id = "labor"
            year = 2022
            location = "{root}/inputs/labor_2022.csv"
            format = "csv"

            [[sources]]
            id = "crosswalk"
            location = "{url}"
            format = "csv"

            [[sources]]
            id = "gdp"
            location = "{root}/inputs/gdp.csv"
            format = "csv"

            [[sources]]
            id = "survey"
            location = "{root}/inputs/survey.csv"
            format = "csv"

            [[sources]]
            id = "states"
            location = "{root}/inputs/states.geojson"
            format = "geojson"

            [[sources]]
            id = "msas"
            location = "{root}/inputs/msas.geojson"
            format = "geojson"
            "#,
            root = root,
            rate = self.max_unmatched_survey_rate,
            url = CROSSWALK_URL,
        );
        let config = Config::from_toml(&toml).unwrap();
        config.validate().unwrap();
        config
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.config(), self.http.clone()).unwrap()
    }
}

/// Parse the merged table into one header → value map per row.
pub fn read_table(path: &Path) -> Vec<HashMap<String, String>> {
    let mut rdr = csv::Reader::from_path(path).unwrap();
    let headers = rdr.headers().unwrap().clone();
    rdr.records()
        .map(|r| {
            let r = r.unwrap();
            headers
                .iter()
                .zip(r.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect()
        })
        .collect()
}

pub fn row<'a>(rows: &'a [HashMap<String, String>], key: &str) -> &'a HashMap<String, String> {
    rows.iter().find(|r| r["metro13"] == key).unwrap()
}
