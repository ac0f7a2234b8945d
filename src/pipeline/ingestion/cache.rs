use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{PayloadFormat, SourceConfig};

/// Hex SHA-256 of a payload.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Cache file for a source: `<id>[_<year>].<ext>`, where archives keep `.zip`.
pub fn cache_path(cache_dir: &Path, source: &SourceConfig) -> PathBuf {
    let ext = if source.archive_member.is_some() {
        "zip"
    } else {
        match source.format {
            PayloadFormat::Csv => "csv",
            PayloadFormat::Json => "json",
            PayloadFormat::Geojson => "geojson",
        }
    };
    let stem = match source.year {
        Some(year) => format!("{}_{}", source.id, year),
        None => source.id.to_string(),
    };
    cache_dir.join(format!("{}.{}", stem, ext))
}

pub fn read_cached(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write through a sibling temp file so a crash never leaves a torn entry.
pub fn write_cached(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("part-{}", std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TextEncoding;
    use crate::types::SourceId;

    fn source(id: SourceId, year: Option<i32>, member: Option<&str>) -> SourceConfig {
        SourceConfig {
            id,
            year,
            location: "https://example.test/x".to_string(),
            format: PayloadFormat::Csv,
            archive_member: member.map(str::to_string),
            encoding: TextEncoding::Utf8,
        }
    }

    #[test]
    fn cache_names_follow_source_and_year() {
        let dir = Path::new("/cache");
        assert_eq!(
            cache_path(dir, &source(SourceId::Labor, Some(1980), Some("a.csv"))),
            PathBuf::from("/cache/labor_1980.zip")
        );
        assert_eq!(
            cache_path(dir, &source(SourceId::Crosswalk, None, None)),
            PathBuf::from("/cache/crosswalk.csv")
        );
    }

    #[test]
    fn write_then_read_round_trips_and_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("gdp.json");
        assert!(read_cached(&path).unwrap().is_none());
        write_cached(&path, b"{}").unwrap();
        assert_eq!(read_cached(&path).unwrap().unwrap(), b"{}");
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
