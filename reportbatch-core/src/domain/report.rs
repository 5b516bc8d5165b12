//! Report request and payload types.

use super::portfolio::Portfolio;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Opaque request parameters, stored verbatim so a failed call can be replayed.
pub type RequestParams = BTreeMap<String, serde_json::Value>;

/// Remote report type, e.g. `"1048"` for the position report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(pub String);

impl Endpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output formats accepted by the reporting API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportFormat {
    Pdf,
    CsvBr,
    CsvUs,
    TxtBr,
    TxtUs,
    Json,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 6] = [
        ReportFormat::Pdf,
        ReportFormat::CsvBr,
        ReportFormat::CsvUs,
        ReportFormat::TxtBr,
        ReportFormat::TxtUs,
        ReportFormat::Json,
    ];

    /// Token sent to the API.
    pub fn api_token(self) -> &'static str {
        match self {
            ReportFormat::Pdf => "PDF",
            ReportFormat::CsvBr => "CSVBR",
            ReportFormat::CsvUs => "CSVUS",
            ReportFormat::TxtBr => "TXTBR",
            ReportFormat::TxtUs => "TXTUS",
            ReportFormat::Json => "JSON",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::CsvBr | ReportFormat::CsvUs => "csv",
            ReportFormat::TxtBr | ReportFormat::TxtUs => "txt",
            ReportFormat::Json => "json",
        }
    }

    pub fn is_csv(self) -> bool {
        matches!(self, ReportFormat::CsvBr | ReportFormat::CsvUs)
    }

    pub fn is_text(self) -> bool {
        matches!(self, ReportFormat::TxtBr | ReportFormat::TxtUs)
    }

    /// Field delimiter for the CSV variants. Brazilian locale uses `;`.
    pub fn csv_delimiter(self) -> u8 {
        match self {
            ReportFormat::CsvBr | ReportFormat::TxtBr => b';',
            _ => b',',
        }
    }

    /// Parse an API token or extension-like name, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|f| f.api_token() == upper)
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_token())
    }
}

/// A parameterized report request applied to every portfolio of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub endpoint: Endpoint,
    pub format: ReportFormat,
    pub reference_date: NaiveDate,
    #[serde(default)]
    pub params: RequestParams,
}

impl ReportRequest {
    pub fn new(endpoint: Endpoint, format: ReportFormat, reference_date: NaiveDate) -> Self {
        Self {
            endpoint,
            format,
            reference_date,
            params: RequestParams::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Concrete parameters sent for one portfolio.
    pub fn params_for(&self, portfolio: &Portfolio) -> RequestParams {
        let mut params = self.params.clone();
        params.insert("portfolio".into(), portfolio.id.clone().into());
        params.insert("format".into(), self.format.api_token().into());
        params.insert(
            "date".into(),
            self.reference_date.format("%Y-%m-%d").to_string().into(),
        );
        params
    }

    /// Artifact path for one portfolio under `dir`.
    pub fn output_path(&self, dir: &Path, portfolio: &Portfolio) -> PathBuf {
        dir.join(format!(
            "{}_{}_{}.{}",
            portfolio.file_stem(),
            self.endpoint,
            self.reference_date.format("%Y%m%d"),
            self.format.extension()
        ))
    }
}

/// Format recorded in replayable params.
pub fn format_from_params(params: &RequestParams) -> Option<ReportFormat> {
    params
        .get("format")
        .and_then(|v| v.as_str())
        .and_then(ReportFormat::parse)
}

/// Reference date recorded in replayable params.
pub fn date_from_params(params: &RequestParams) -> Option<NaiveDate> {
    params
        .get("date")
        .and_then(|v| v.as_str())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

/// Raw response body from the report client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl ReportPayload {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    /// A structurally valid response that carries no data.
    ///
    /// Zero or whitespace-only bodies are always empty. CSV bodies with only a
    /// header line are empty, as are JSON `[]`, `{}` and `null`.
    pub fn is_empty_report(&self, format: ReportFormat) -> bool {
        let text = String::from_utf8_lossy(&self.bytes);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return true;
        }
        match format {
            ReportFormat::CsvBr | ReportFormat::CsvUs => {
                trimmed.lines().filter(|l| !l.trim().is_empty()).count() <= 1
            }
            ReportFormat::Json => match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(serde_json::Value::Null) => true,
                Ok(serde_json::Value::Array(items)) => items.is_empty(),
                Ok(serde_json::Value::Object(fields)) => fields.is_empty(),
                _ => false,
            },
            _ => false,
        }
    }
}
