use serde::Serialize;
use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::cache;
use crate::app::ports::HttpClientPort;
use crate::config::{FetchConfig, PayloadFormat, SourceConfig, TextEncoding};
use crate::error::{PipelineError, Result};
use crate::observability::metrics as obs;
use crate::types::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadOrigin {
    Cache,
    Remote,
    Local,
}

#[derive(Debug, Clone)]
pub enum PayloadBody {
    Text(String),
    Json(serde_json::Value),
}

/// A validated payload, still in its source's own schema.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub source: SourceId,
    pub year: Option<i32>,
    pub origin: PayloadOrigin,
    pub sha256: String,
    pub body: PayloadBody,
}

impl RawPayload {
    pub fn text(&self) -> Result<&str> {
        match &self.body {
            PayloadBody::Text(text) => Ok(text),
            PayloadBody::Json(_) => Err(PipelineError::format(
                self.label(),
                "expected a delimited text payload, found JSON",
            )),
        }
    }

    pub fn json(&self) -> Result<&serde_json::Value> {
        match &self.body {
            PayloadBody::Json(value) => Ok(value),
            PayloadBody::Text(_) => Err(PipelineError::format(
                self.label(),
                "expected a JSON payload, found delimited text",
            )),
        }
    }

    pub fn label(&self) -> String {
        source_label(self.source, self.year)
    }
}

/// What the fetch step reports for each payload.
#[derive(Debug, Clone, Serialize)]
pub struct FetchRecord {
    pub source: SourceId,
    pub year: Option<i32>,
    pub origin: PayloadOrigin,
    pub sha256: String,
}

impl From<&RawPayload> for FetchRecord {
    fn from(p: &RawPayload) -> Self {
        Self {
            source: p.source,
            year: p.year,
            origin: p.origin,
            sha256: p.sha256.clone(),
        }
    }
}

pub fn source_label(source: SourceId, year: Option<i32>) -> String {
    match year {
        Some(y) => format!("{}_{}", source, y),
        None => source.to_string(),
    }
}

pub struct SourceFetcher {
    cache_dir: PathBuf,
    settings: FetchConfig,
    sources: Vec<SourceConfig>,
    http: Arc<dyn HttpClientPort>,
}

impl SourceFetcher {
    pub fn new(
        cache_dir: PathBuf,
        settings: FetchConfig,
        sources: Vec<SourceConfig>,
        http: Arc<dyn HttpClientPort>,
    ) -> Self {
        Self {
            cache_dir,
            settings,
            sources,
            http,
        }
    }

    /// Cache first, then the configured location; the cache is filled on success.
    #[instrument(skip(self), fields(source = %source_id))]
    pub fn fetch(&self, source_id: SourceId, year: Option<i32>) -> Result<RawPayload> {
        let label = source_label(source_id, year);
        let source = self
            .sources
            .iter()
            .find(|s| s.id == source_id && s.year == year)
            .ok_or_else(|| PipelineError::unavailable(&label, "no location configured"))?;

        if let Some(path) = local_path(&source.location) {
            let bytes = fs::read(&path).map_err(|e| {
                PipelineError::unavailable(&label, format!("{}: {}", path.display(), e))
            })?;
            debug!("Read {} bytes from {}", bytes.len(), path.display());
            return build_payload(source, &bytes, PayloadOrigin::Local);
        }

        let cache_path = cache::cache_path(&self.cache_dir, source);
        match cache::read_cached(&cache_path) {
            Ok(Some(bytes)) => match build_payload(source, &bytes, PayloadOrigin::Cache) {
                Ok(payload) => {
                    obs::fetch::cache_hit(source_id.as_str());
                    debug!("Cache hit: {}", cache_path.display());
                    return Ok(payload);
                }
                Err(e) => {
                    warn!("Discarding unreadable cache entry {}: {}", cache_path.display(), e);
                    let _ = fs::remove_file(&cache_path);
                }
            },
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {}: {}", cache_path.display(), e),
        }
        obs::fetch::cache_miss(source_id.as_str());

        let bytes = self.download(&label, &source.location)?;
        let payload = build_payload(source, &bytes, PayloadOrigin::Remote)?;
        cache::write_cached(&cache_path, &bytes).map_err(|e| {
            PipelineError::unavailable(&label, format!("cache write {}: {}", cache_path.display(), e))
        })?;
        info!("Fetched {} ({} bytes) into {}", label, bytes.len(), cache_path.display());
        Ok(payload)
    }

    fn download(&self, label: &str, url: &str) -> Result<Vec<u8>> {
        let timeout = Duration::from_secs(self.settings.timeout_seconds);
        let attempts = self.settings.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!("Requesting {} (attempt {}/{})", label, attempt, attempts);
            match self.http.get(url, timeout) {
                Ok(resp) if resp.is_success() => {
                    obs::fetch::payload_bytes(resp.bytes.len());
                    return Ok(resp.bytes);
                }
                Ok(resp) => last_error = format!("HTTP {} from {}", resp.status, url),
                Err(e) => last_error = format!("{}: {}", url, e),
            }
            obs::fetch::remote_error(label);
            warn!("Fetch attempt {} for {} failed: {}", attempt, label, last_error);
            if attempt < attempts && self.settings.retry_backoff_ms > 0 {
                std::thread::sleep(Duration::from_millis(
                    self.settings.retry_backoff_ms * u64::from(attempt),
                ));
            }
        }
        Err(PipelineError::unavailable(label, last_error))
    }
}

fn local_path(location: &str) -> Option<PathBuf> {
    if let Some(rest) = location.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        return None;
    }
    Some(PathBuf::from(location))
}

/// Unpack and validate a payload against its declared container.
fn build_payload(source: &SourceConfig, bytes: &[u8], origin: PayloadOrigin) -> Result<RawPayload> {
    let label = source_label(source.id, source.year);
    let sha256 = cache::digest(bytes);

    let content = match &source.archive_member {
        Some(member) => extract_member(&label, bytes, member)?,
        None => bytes.to_vec(),
    };

    let body = match source.format {
        PayloadFormat::Csv => PayloadBody::Text(decode_text(&label, content, source.encoding)?),
        PayloadFormat::Json | PayloadFormat::Geojson => {
            let value: serde_json::Value = serde_json::from_slice(&content)
                .map_err(|e| PipelineError::format(&label, format!("invalid JSON: {}", e)))?;
            if source.format == PayloadFormat::Geojson
                && value.get("type").and_then(|t| t.as_str()) != Some("FeatureCollection")
            {
                return Err(PipelineError::format(&label, "GeoJSON root is not a FeatureCollection"));
            }
            PayloadBody::Json(value)
        }
    };

    Ok(RawPayload {
        source: source.id,
        year: source.year,
        origin,
        sha256,
        body,
    })
}

fn extract_member(label: &str, bytes: &[u8], member: &str) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::format(label, format!("not a zip archive: {}", e)))?;
    let mut file = archive
        .by_name(member)
        .map_err(|_| PipelineError::format(label, format!("archive has no member '{}'", member)))?;
    let mut out = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut out)
        .map_err(|e| PipelineError::format(label, format!("reading '{}': {}", member, e)))?;
    Ok(out)
}

fn decode_text(label: &str, bytes: Vec<u8>, encoding: TextEncoding) -> Result<String> {
    let text = match encoding {
        TextEncoding::Utf8 => String::from_utf8(bytes)
            .map_err(|e| PipelineError::format(label, format!("not valid UTF-8: {}", e)))?,
        TextEncoding::Latin1 => bytes.into_iter().map(char::from).collect(),
    };
    Ok(text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text))
}
