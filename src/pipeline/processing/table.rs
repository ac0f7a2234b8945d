//! Helpers shared by every component that reads delimited text.

use csv::{Reader, ReaderBuilder, StringRecord};

/// A CSV reader over `text` that starts after `skip_lines` preamble lines.
pub fn reader(text: &str, skip_lines: usize) -> Reader<&[u8]> {
    let mut rest = text;
    for _ in 0..skip_lines {
        match rest.find('\n') {
            Some(pos) => rest = &rest[pos + 1..],
            None => {
                rest = "";
                break;
            }
        }
    }
    ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(rest.as_bytes())
}

pub fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

/// Resolve every column or list the ones that are absent.
pub fn require_columns<'a>(
    headers: &StringRecord,
    names: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<usize>, String> {
    let mut indices = Vec::new();
    let mut missing = Vec::new();
    for name in names {
        match column_index(headers, name) {
            Some(i) => indices.push(i),
            None => missing.push(name.clone()),
        }
    }
    if missing.is_empty() {
        Ok(indices)
    } else {
        Err(format!("missing column(s): {}", missing.join(", ")))
    }
}

/// Parse a numeric cell, tolerating surrounding whitespace and thousands separators.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Zero-pad a numeric code to `width` digits; accepts `"1001"`, `"1001.0"` or `" 01001 "`.
pub fn normalize_code(raw: &str, width: usize) -> Result<String, String> {
    let trimmed = raw.trim();
    let digits = if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        trimmed.trim_start_matches('0').to_string()
    } else {
        match trimmed.parse::<f64>() {
            Ok(v) if v >= 0.0 && v.fract() == 0.0 && v < 1e15 => format!("{}", v as u64),
            _ => return Err(format!("'{}' is not a numeric code", trimmed)),
        }
    };
    let digits = if digits.is_empty() || digits == "0" {
        String::new()
    } else {
        digits
    };
    if digits.len() > width {
        return Err(format!("'{}' is wider than {} digits", trimmed, width));
    }
    Ok(format!("{:0>width$}", digits, width = width))
}

/// Build a composite key from several cells, each padded to its own width.
pub fn compose_key(record: &StringRecord, indices: &[usize], widths: &[usize]) -> Result<String, String> {
    let mut key = String::new();
    for (idx, width) in indices.iter().zip(widths) {
        let cell = record
            .get(*idx)
            .ok_or_else(|| format!("row has no column {}", idx + 1))?;
        key.push_str(&normalize_code(cell, *width)?);
    }
    Ok(key)
}
