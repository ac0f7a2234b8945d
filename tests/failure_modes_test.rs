mod common;

use anyhow::Result;
use common::{msas_geojson, Fixture, CROSSWALK_URL};
use msa_pipeline::error::PipelineError;
use msa_pipeline::pipeline::Stage;
use std::fs;

fn stage_of(err: &PipelineError) -> Option<Stage> {
    match err {
        PipelineError::Stage { stage, .. } => Some(*stage),
        _ => None,
    }
}

fn staging_dirs(fixture: &Fixture) -> usize {
    fs::read_dir(fixture.output_dir())
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
                .count()
        })
        .unwrap_or(0)
}

/// Twenty labor rows, two of which carry values that cannot be coerced.
fn labor_with_bad_rows() -> String {
    let mut text = String::from("area_fips,own_title,annual_avg_emplvl,annual_avg_wkly_wage\n");
    for i in 0..20 {
        let county = if i % 2 == 0 { "1001" } else { "1003" };
        let employment = if i < 2 { "n/a".to_string() } else { (10 + i).to_string() };
        text.push_str(&format!("{},Total Covered,{},400\n", county, employment));
    }
    text
}

#[test]
fn test_rejection_rate_over_threshold_keeps_prior_outputs() -> Result<()> {
    let fixture = Fixture::new();
    fixture.pipeline().run()?;
    let table = fs::read(fixture.output("merged_bfi.csv"))?;
    let report = fs::read(fixture.output("run_report.json"))?;

    fixture.replace_input("labor_1980.csv", &labor_with_bad_rows());
    let err = fixture.pipeline().run().unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::Cleaning));
    match err.root() {
        PipelineError::SchemaRejectionRateExceeded {
            rejected, considered, ..
        } => {
            assert_eq!(*rejected, 2);
            assert_eq!(*considered, 20);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // Nothing was promoted and nothing was left behind
    assert_eq!(fs::read(fixture.output("merged_bfi.csv"))?, table);
    assert_eq!(fs::read(fixture.output("run_report.json"))?, report);
    assert_eq!(staging_dirs(&fixture), 0);
    Ok(())
}

#[test]
fn test_rejections_under_a_looser_threshold_pass() -> Result<()> {
    let fixture = Fixture::new();
    fixture.replace_input("labor_1980.csv", &labor_with_bad_rows());
    let mut config = fixture.config();
    config.thresholds.max_rejection_rate = 0.15;
    let mappings = msa_pipeline::pipeline::processing::normalize::mappings::MappingSet::from_toml(
        common::MAPPINGS,
    )?;
    let report =
        msa_pipeline::pipeline::Pipeline::from_parts(config, mappings, fixture.http.clone()).run()?;

    let stats = report
        .normalization
        .iter()
        .find(|s| s.source.as_str() == "labor" && s.year == 1980)
        .expect("labor 1980 stats");
    assert_eq!(stats.rejected, 2);
    assert!((stats.rejection_rate - 0.1).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_failed_promotion_leaves_every_prior_output_in_place() -> Result<()> {
    let fixture = Fixture::new();
    fixture.pipeline().run()?;
    let table = fs::read(fixture.output("merged_bfi.csv"))?;
    let report = fs::read(fixture.output("run_report.json"))?;

    // The geometry target turns into a directory the rename cannot replace
    let geometry = fixture.output("combined_US_regions.geojson");
    fs::remove_file(&geometry)?;
    fs::create_dir_all(geometry.join("keep"))?;

    let err = fixture.pipeline().run().unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::Writing));
    assert_eq!(fs::read(fixture.output("merged_bfi.csv"))?, table);
    assert_eq!(fs::read(fixture.output("run_report.json"))?, report);
    assert!(geometry.join("keep").is_dir());
    assert_eq!(staging_dirs(&fixture), 0);
    Ok(())
}

#[test]
fn test_first_run_failure_writes_no_outputs() -> Result<()> {
    let fixture = Fixture::new();
    fixture.replace_input("labor_1980.csv", &labor_with_bad_rows());
    assert!(fixture.pipeline().run().is_err());
    assert!(!fixture.output("merged_bfi.csv").exists());
    assert!(!fixture.output("combined_US_regions.geojson").exists());
    Ok(())
}

#[test]
fn test_unknown_counties_over_gap_threshold_fail_aggregation() -> Result<()> {
    let fixture = Fixture::new();
    fixture.replace_input(
        "labor_1980.csv",
        "area_fips,own_title,annual_avg_emplvl,annual_avg_wkly_wage\n\
         1001,Total Covered,100,200\n\
         1003,Total Covered,50,500\n\
         1099,Total Covered,7,300\n",
    );
    let err = fixture.pipeline().run().unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::Aggregating));
    assert!(matches!(err.root(), PipelineError::CrosswalkGap { unmapped: 2, .. }));
    Ok(())
}

#[test]
fn test_crosswalk_weights_must_sum_to_one() -> Result<()> {
    let fixture = Fixture::new();
    fixture.http.serve(
        CROSSWALK_URL,
        200,
        "county,cbsa,weight\n1001,10180,0.6\n1001,10420,0.3\n1003,10180,1\n",
    );
    let err = fixture.pipeline().run().unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::Cleaning));
    assert!(matches!(err.root(), PipelineError::InvalidCrosswalk(_)));
    Ok(())
}

#[test]
fn test_unreachable_source_without_cache_is_unavailable() -> Result<()> {
    let fixture = Fixture::new();
    fixture.http.serve(CROSSWALK_URL, 503, "");
    let err = fixture.pipeline().run().unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::Fetching));
    assert!(matches!(err.root(), PipelineError::SourceUnavailable { .. }));
    assert!(!fixture.output("merged_bfi.csv").exists());
    Ok(())
}

#[test]
fn test_survey_region_without_boundary_is_missing_geometry() -> Result<()> {
    let fixture = Fixture::new();
    fixture.replace_input("msas.geojson", &msas_geojson(&["10180", "10420"]));
    let err = fixture.pipeline().run().unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::Merging));
    match err.root() {
        PipelineError::MissingGeometry { keys } => assert_eq!(keys, &vec!["19999".to_string()]),
        other => panic!("unexpected error: {:?}", other),
    }
    Ok(())
}

#[test]
fn test_too_many_unmatched_survey_regions_is_an_integrity_error() -> Result<()> {
    let mut fixture = Fixture::new();
    fixture.max_unmatched_survey_rate = 0.10;
    let err = fixture.pipeline().run().unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::Merging));
    assert!(matches!(
        err.root(),
        PipelineError::IntegrityError { unmatched: 1, total: 3, .. }
    ));
    Ok(())
}
