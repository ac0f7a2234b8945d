//! Consolidated state + MSA boundary artifact.

use geo::{BooleanOps, Coord, CoordsIter, LineString, MapCoords, MultiPolygon, Polygon, Simplify};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::config::GeometryConfig;
use crate::constants::{REGION_KEY_WIDTH, STATE_KEY_PREFIX, STATE_KEY_WIDTH};
use crate::error::{PipelineError, Result};
use crate::observability::metrics as obs;
use crate::pipeline::ingestion::RawPayload;
use crate::pipeline::processing::table;
use crate::types::RegionType;

#[derive(Debug, Clone)]
pub struct RegionGeometry {
    pub region_key: String,
    pub region_type: RegionType,
    pub name: String,
    pub shape: MultiPolygon<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeometryDiagnostics {
    pub msa_features_in: usize,
    pub state_features_in: usize,
    pub msas_out: usize,
    pub states_out: usize,
    /// Features folded into an earlier feature with the same key.
    pub merged_duplicates: usize,
    pub name_collisions: usize,
    pub vertices_in: usize,
    pub vertices_out: usize,
    /// Rings that would collapse under simplification and were kept as-is.
    pub degenerate_rings_kept: usize,
}

/// One boundary layer keyed by its normalized identifier.
struct Layer {
    shapes: BTreeMap<String, (String, Vec<Polygon<f64>>)>,
    features: usize,
    duplicates: usize,
}

pub struct GeometryBuilder<'a> {
    config: &'a GeometryConfig,
}

impl<'a> GeometryBuilder<'a> {
    pub fn new(config: &'a GeometryConfig) -> Self {
        Self { config }
    }

    /// Merge both layers; every key in `referenced` must resolve to exactly one MSA.
    pub fn build(
        &self,
        states: &RawPayload,
        msas: &RawPayload,
        referenced: &BTreeSet<String>,
    ) -> Result<(Vec<RegionGeometry>, GeometryDiagnostics)> {
        let msa_layer = self.read_layer(msas, &self.config.msa_id_properties, REGION_KEY_WIDTH)?;
        let state_layer = self.read_layer(states, &self.config.state_id_properties, STATE_KEY_WIDTH)?;

        let missing: Vec<String> = referenced
            .iter()
            .filter(|k| !msa_layer.shapes.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::MissingGeometry { keys: missing });
        }

        let mut diag = GeometryDiagnostics {
            msa_features_in: msa_layer.features,
            state_features_in: state_layer.features,
            merged_duplicates: msa_layer.duplicates + state_layer.duplicates,
            ..Default::default()
        };

        let mut msa_regions = Vec::new();
        for (key, (name, polygons)) in msa_layer.shapes {
            if !self.config.include_unreferenced_msas && !referenced.contains(&key) {
                continue;
            }
            let shape = self.simplify(MultiPolygon::new(polygons), &mut diag);
            msa_regions.push(RegionGeometry {
                region_key: key,
                region_type: RegionType::Msa,
                name,
                shape,
            });
        }

        let footprint = if self.config.clip_states {
            msa_regions
                .iter()
                .map(|r| r.shape.clone())
                .reduce(|acc, shape| acc.union(&shape))
        } else {
            None
        };

        let mut state_regions = Vec::new();
        for (key, (name, polygons)) in state_layer.shapes {
            let mut shape = self.simplify(MultiPolygon::new(polygons), &mut diag);
            if let Some(footprint) = &footprint {
                shape = shape.difference(footprint);
            }
            state_regions.push(RegionGeometry {
                region_key: format!("{}{}", STATE_KEY_PREFIX, key),
                region_type: RegionType::State,
                name,
                shape,
            });
        }

        diag.name_collisions = resolve_name_collisions(&mut msa_regions, &mut state_regions);

        let factor = 10f64.powi(self.config.coordinate_precision as i32);
        let mut regions: Vec<RegionGeometry> = msa_regions.into_iter().chain(state_regions).collect();
        for region in &mut regions {
            region.shape = region.shape.map_coords(move |c| Coord {
                x: (c.x * factor).round() / factor,
                y: (c.y * factor).round() / factor,
            });
            diag.vertices_out += region.shape.coords_count();
        }
        regions.sort_by(|a, b| {
            (a.region_type, &a.region_key).cmp(&(b.region_type, &b.region_key))
        });

        diag.msas_out = regions.iter().filter(|r| r.region_type == RegionType::Msa).count();
        diag.states_out = regions.len() - diag.msas_out;
        obs::geometry::built(regions.len(), diag.vertices_in.saturating_sub(diag.vertices_out));
        info!(
            "Geometry: {} MSAs + {} states, vertices {} -> {}",
            diag.msas_out, diag.states_out, diag.vertices_in, diag.vertices_out
        );
        Ok((regions, diag))
    }

    fn read_layer(&self, payload: &RawPayload, id_properties: &[String], width: usize) -> Result<Layer> {
        let label = payload.label();
        let features = payload
            .json()?
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| PipelineError::format(&label, "FeatureCollection has no features"))?;

        let mut layer = Layer {
            shapes: BTreeMap::new(),
            features: features.len(),
            duplicates: 0,
        };
        for (i, feature) in features.iter().enumerate() {
            let props = feature.get("properties").unwrap_or(&Value::Null);
            let raw_id = id_properties
                .iter()
                .find_map(|p| match props.get(p) {
                    Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or_else(|| {
                    PipelineError::format(&label, format!("feature {} has none of {:?}", i, id_properties))
                })?;
            let key = table::normalize_code(&raw_id, width)
                .map_err(|e| PipelineError::format(&label, format!("feature {}: {}", i, e)))?;
            let name = props
                .get(&self.config.name_property)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| key.clone());
            let polygons = parse_geometry(feature.get("geometry").unwrap_or(&Value::Null))
                .map_err(|e| PipelineError::format(&label, format!("feature {} ({}): {}", i, key, e)))?;

            match layer.shapes.get_mut(&key) {
                Some((_, existing)) => {
                    existing.extend(polygons);
                    layer.duplicates += 1;
                }
                None => {
                    layer.shapes.insert(key, (name, polygons));
                }
            }
        }
        Ok(layer)
    }

    fn simplify(&self, shape: MultiPolygon<f64>, diag: &mut GeometryDiagnostics) -> MultiPolygon<f64> {
        diag.vertices_in += shape.coords_count();
        let eps = self.config.simplify_tolerance;
        if eps <= 0.0 {
            return shape;
        }
        let polygons = shape
            .0
            .iter()
            .map(|p| {
                let exterior = simplify_ring(p.exterior(), eps, &mut diag.degenerate_rings_kept);
                let interiors = p
                    .interiors()
                    .iter()
                    .map(|r| simplify_ring(r, eps, &mut diag.degenerate_rings_kept))
                    .collect();
                Polygon::new(exterior, interiors)
            })
            .collect();
        MultiPolygon::new(polygons)
    }
}

fn simplify_ring(ring: &LineString<f64>, eps: f64, kept: &mut usize) -> LineString<f64> {
    let simplified = ring.simplify(&eps);
    if simplified.0.len() < 4 {
        *kept += 1;
        ring.clone()
    } else {
        simplified
    }
}

/// Suffix display names shared by an MSA and a state; returns the number of clashes.
fn resolve_name_collisions(msas: &mut [RegionGeometry], states: &mut [RegionGeometry]) -> usize {
    let state_names: BTreeSet<String> = states.iter().map(|s| s.name.to_lowercase()).collect();
    let clashing: BTreeSet<String> = msas
        .iter()
        .map(|m| m.name.to_lowercase())
        .filter(|n| state_names.contains(n))
        .collect();
    for m in msas.iter_mut().filter(|m| clashing.contains(&m.name.to_lowercase())) {
        m.name.push_str(" (MSA)");
    }
    for s in states.iter_mut().filter(|s| clashing.contains(&s.name.to_lowercase())) {
        s.name.push_str(" (State)");
    }
    if !clashing.is_empty() {
        warn!("Namespaced {} MSA/state name collision(s): {:?}", clashing.len(), clashing);
    }
    clashing.len()
}

fn parse_geometry(geometry: &Value) -> std::result::Result<Vec<Polygon<f64>>, String> {
    let kind = geometry.get("type").and_then(Value::as_str).unwrap_or("null");
    let coords = geometry.get("coordinates").unwrap_or(&Value::Null);
    match kind {
        "Polygon" => Ok(vec![parse_polygon(coords)?]),
        "MultiPolygon" => coords
            .as_array()
            .ok_or("MultiPolygon coordinates are not an array")?
            .iter()
            .map(parse_polygon)
            .collect(),
        other => Err(format!("unsupported geometry type {}", other)),
    }
}

fn parse_polygon(value: &Value) -> std::result::Result<Polygon<f64>, String> {
    let rings = value.as_array().ok_or("polygon is not an array of rings")?;
    let mut parsed = rings.iter().map(parse_ring);
    let exterior = parsed.next().ok_or("polygon has no exterior ring")??;
    let interiors = parsed.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn parse_ring(value: &Value) -> std::result::Result<LineString<f64>, String> {
    let positions = value.as_array().ok_or("ring is not an array of positions")?;
    let coords = positions
        .iter()
        .map(|p| match (p.get(0).and_then(Value::as_f64), p.get(1).and_then(Value::as_f64)) {
            (Some(x), Some(y)) => Ok(Coord { x, y }),
            _ => Err("position is not [x, y]".to_string()),
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(LineString::new(coords))
}

/// Serialize as a GeoJSON FeatureCollection with `region_key`, `region_type` and `name` properties.
pub fn to_geojson(regions: &[RegionGeometry]) -> Result<Vec<u8>> {
    let features: Vec<Value> = regions
        .iter()
        .map(|r| {
            json!({
                "type": "Feature",
                "properties": {
                    "region_key": r.region_key,
                    "region_type": r.region_type.as_str(),
                    "name": r.name,
                },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": multipolygon_coords(&r.shape),
                },
            })
        })
        .collect();
    let collection = json!({ "type": "FeatureCollection", "features": features });
    Ok(serde_json::to_vec(&collection)?)
}

fn multipolygon_coords(shape: &MultiPolygon<f64>) -> Value {
    let ring = |r: &LineString<f64>| -> Value {
        Value::Array(r.coords().map(|c| json!([c.x, c.y])).collect())
    };
    Value::Array(
        shape
            .0
            .iter()
            .map(|p| {
                let mut rings = vec![ring(p.exterior())];
                rings.extend(p.interiors().iter().map(ring));
                Value::Array(rings)
            })
            .collect(),
    )
}
