use std::collections::BTreeSet;
use tracing::info;

use crate::constants::REGION_KEY_WIDTH;
use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::RawPayload;
use crate::pipeline::processing::table;

#[derive(Debug, Clone)]
pub struct SurveyRow {
    pub region_key: String,
    pub name: Option<String>,
    /// Cells in the order of `SurveyTable::headers`, key column already normalized.
    pub cells: Vec<String>,
}

/// The disclosed survey table: the left side of every join.
#[derive(Debug, Clone)]
pub struct SurveyTable {
    pub headers: Vec<String>,
    pub rows: Vec<SurveyRow>,
}

impl SurveyTable {
    /// Parse the survey; every row must carry a distinct, well-formed region key.
    pub fn from_payload(payload: &RawPayload, key_column: &str, name_column: &str) -> Result<Self> {
        let label = payload.label();
        let mut rdr = table::reader(payload.text()?, 0);
        let header_record = rdr
            .headers()
            .map_err(|e| PipelineError::format(&label, format!("unreadable header: {}", e)))?
            .clone();
        let key_idx = table::column_index(&header_record, key_column)
            .ok_or_else(|| PipelineError::format(&label, format!("missing column(s): {}", key_column)))?;
        let name_idx = table::column_index(&header_record, name_column);
        let headers: Vec<String> = header_record.iter().map(str::to_string).collect();

        let mut seen = BTreeSet::new();
        let mut rows = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| PipelineError::format(&label, e.to_string()))?;
            let raw_key = record.get(key_idx).unwrap_or("");
            let region_key = table::normalize_code(raw_key, REGION_KEY_WIDTH).map_err(|e| {
                PipelineError::format(&label, format!("row {}: {}: {}", line + 1, key_column, e))
            })?;
            if !seen.insert(region_key.clone()) {
                return Err(PipelineError::format(
                    &label,
                    format!("row {}: duplicate region key {}", line + 1, region_key),
                ));
            }
            let mut cells: Vec<String> = (0..headers.len())
                .map(|i| record.get(i).unwrap_or("").to_string())
                .collect();
            cells[key_idx] = region_key.clone();
            rows.push(SurveyRow {
                name: name_idx.and_then(|i| record.get(i)).map(str::to_string),
                region_key,
                cells,
            });
        }
        info!("Survey: {} regions, {} columns", rows.len(), headers.len());
        Ok(Self { headers, rows })
    }

    pub fn region_keys(&self) -> BTreeSet<String> {
        self.rows.iter().map(|r| r.region_key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ingestion::{PayloadBody, PayloadOrigin};
    use crate::types::SourceId;

    fn payload(text: &str) -> RawPayload {
        RawPayload {
            source: SourceId::Survey,
            year: None,
            origin: PayloadOrigin::Local,
            sha256: String::new(),
            body: PayloadBody::Text(text.to_string()),
        }
    }

    #[test]
    fn keys_are_padded_in_place() {
        let survey = SurveyTable::from_payload(
            &payload("metro13,metro_title,jobs\n10180.0,\"Abilene, TX\",12\n1234,Other,3\n"),
            "metro13",
            "metro_title",
        )
        .unwrap();
        assert_eq!(survey.rows.len(), 2);
        assert_eq!(survey.rows[0].region_key, "10180");
        assert_eq!(survey.rows[1].cells[0], "01234");
        assert_eq!(survey.rows[0].name.as_deref(), Some("Abilene, TX"));
    }

    #[test]
    fn duplicate_and_malformed_keys_are_format_errors() {
        let dup = payload("metro13,v\n10180,1\n10180,2\n");
        assert!(matches!(
            SurveyTable::from_payload(&dup, "metro13", "metro_title"),
            Err(PipelineError::FormatError { .. })
        ));
        let bad = payload("metro13,v\nabc,1\n");
        assert!(SurveyTable::from_payload(&bad, "metro13", "metro_title").is_err());
        let missing = payload("cbsa,v\n10180,1\n");
        assert!(SurveyTable::from_payload(&missing, "metro13", "metro_title").is_err());
    }
}
