//! Consolidation: fold a run's successful artifacts into one output.
//!
//! Artifacts are keyed by (portfolio id, reference date); a later artifact for
//! the same key replaces the earlier one. Every row carries provenance so the
//! combined file can be traced back to its source portfolio.
//!
//! | format      | output                                                   |
//! |-------------|----------------------------------------------------------|
//! | CSV         | one table, provenance columns first, union of headers    |
//! | JSON        | one array of objects with provenance fields              |
//! | TXT         | sections separated by provenance banners                 |
//! | PDF         | `<output>.index.txt` listing the artifacts               |
//!
//! Artifacts are decoded as UTF-8, falling back to Latin-1. CSV rows of a
//! known endpoint are normalized (see [`crate::normalize`]); an artifact
//! missing that endpoint's required columns is still merged and counted in
//! `schema_warnings`.
//!
//! A sidecar `<output>.consolidation.json` describes what was written.

use crate::normalize::{decode_text, normalize_row, schema_for};
use crate::stats::SuccessfulOutput;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reportbatch_core::writer::write_atomic;
use reportbatch_core::ReportFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PROVENANCE: [&str; 4] = [
    "source_portfolio",
    "source_portfolio_id",
    "reference_date",
    "consolidated_at",
];

#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error("nothing to consolidate: none of {inputs} artifact(s) had usable data")]
    NoData { inputs: usize },

    #[error("write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a consolidation wrote. Also persisted as the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationSummary {
    pub output_path: PathBuf,
    pub format: ReportFormat,
    /// Artifacts handed in.
    pub inputs: usize,
    /// Artifacts that contributed data.
    pub artifacts: usize,
    /// Artifacts replaced by a later one with the same business key.
    pub superseded: usize,
    /// Artifacts skipped as unreadable, empty or of another format.
    pub skipped: usize,
    pub rows: usize,
    pub duplicates_dropped: usize,
    /// CSV cells rewritten by normalization.
    pub normalized_cells: usize,
    /// CSV artifacts missing a required column of their endpoint.
    pub schema_warnings: usize,
    pub blake3: String,
    pub consolidated_at: DateTime<Utc>,
}

struct Provenance {
    name: String,
    id: String,
    date: NaiveDate,
    stamp: String,
}

impl Provenance {
    fn new(output: &SuccessfulOutput, stamp: &str) -> Self {
        Self {
            name: output.portfolio_name.clone(),
            id: output.portfolio_id.clone(),
            date: output.reference_date,
            stamp: stamp.to_string(),
        }
    }

    fn columns(&self) -> [String; 4] {
        [
            self.name.clone(),
            self.id.clone(),
            self.date.to_string(),
            self.stamp.clone(),
        ]
    }
}

/// Rendered output plus the counters that go into the summary.
#[derive(Default)]
struct Merged {
    bytes: Vec<u8>,
    artifacts: usize,
    skipped: usize,
    rows: usize,
    duplicates_dropped: usize,
    normalized_cells: usize,
    schema_warnings: usize,
}

/// Path of the sidecar written next to `output_path`.
pub fn sidecar_path(output_path: &Path) -> PathBuf {
    with_suffix(output_path, ".consolidation.json")
}

/// Consolidate `outputs` (in run order) into `output_path`.
pub fn consolidate(
    outputs: &[SuccessfulOutput],
    output_path: &Path,
    format: ReportFormat,
    now: DateTime<Utc>,
) -> Result<ConsolidationSummary, ConsolidationError> {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let (latest, superseded) = latest_per_key(outputs);

    let mut readable = Vec::with_capacity(latest.len());
    let mut skipped = 0;
    for output in latest {
        if output.format != format {
            tracing::warn!(
                portfolio_id = %output.portfolio_id,
                found = %output.format,
                expected = %format,
                "skipping artifact of another format"
            );
            skipped += 1;
            continue;
        }
        match std::fs::read(&output.path) {
            Ok(bytes) => readable.push((Provenance::new(output, &stamp), output, bytes)),
            Err(e) => {
                tracing::warn!(path = %output.path.display(), error = %e, "skipping unreadable artifact");
                skipped += 1;
            }
        }
    }

    let (mut merged, target) = if format.is_csv() {
        (merge_csv(&readable, format)?, output_path.to_path_buf())
    } else if format == ReportFormat::Json {
        (merge_json(&readable)?, output_path.to_path_buf())
    } else if format.is_text() {
        (merge_text(&readable), output_path.to_path_buf())
    } else {
        (index_pdf(&readable), with_suffix(output_path, ".index.txt"))
    };
    merged.skipped += skipped;

    if merged.artifacts == 0 || merged.rows == 0 {
        return Err(ConsolidationError::NoData {
            inputs: outputs.len(),
        });
    }

    write_atomic(&merged.bytes, &target).map_err(|source| ConsolidationError::Write {
        path: target.clone(),
        source,
    })?;

    let summary = ConsolidationSummary {
        output_path: target,
        format,
        inputs: outputs.len(),
        artifacts: merged.artifacts,
        superseded,
        skipped: merged.skipped,
        rows: merged.rows,
        duplicates_dropped: merged.duplicates_dropped,
        normalized_cells: merged.normalized_cells,
        schema_warnings: merged.schema_warnings,
        blake3: blake3::hash(&merged.bytes).to_hex().to_string(),
        consolidated_at: now,
    };

    let sidecar = sidecar_path(&summary.output_path);
    let json = serde_json::to_vec_pretty(&summary)?;
    write_atomic(&json, &sidecar).map_err(|source| ConsolidationError::Write {
        path: sidecar.clone(),
        source,
    })?;

    tracing::info!(
        path = %summary.output_path.display(),
        artifacts = summary.artifacts,
        rows = summary.rows,
        duplicates = summary.duplicates_dropped,
        "consolidated"
    );
    Ok(summary)
}

/// Consolidate `outputs` once per format they contain, in first-seen order.
///
/// With a single format the output goes to `output_path`. With several, each
/// goes next to it as `<stem>_<format>.<ext>`, e.g. `all_csvus.csv`. A format
/// with no usable data is logged and left out; `NoData` is returned only
/// when no format produced output.
pub fn consolidate_each_format(
    outputs: &[SuccessfulOutput],
    output_path: &Path,
    now: DateTime<Utc>,
) -> Result<Vec<ConsolidationSummary>, ConsolidationError> {
    let mut formats: Vec<ReportFormat> = Vec::new();
    for output in outputs {
        if !formats.contains(&output.format) {
            formats.push(output.format);
        }
    }

    let mut summaries = Vec::with_capacity(formats.len());
    for &format in &formats {
        let path = if formats.len() == 1 {
            output_path.to_path_buf()
        } else {
            path_for_format(output_path, format)
        };
        match consolidate(outputs, &path, format, now) {
            Ok(summary) => summaries.push(summary),
            Err(ConsolidationError::NoData { .. }) => {
                tracing::warn!(%format, "no usable artifacts for format");
            }
            Err(e) => return Err(e),
        }
    }
    if summaries.is_empty() {
        return Err(ConsolidationError::NoData {
            inputs: outputs.len(),
        });
    }
    Ok(summaries)
}

fn path_for_format(output_path: &Path, format: ReportFormat) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "consolidated".to_string());
    let name = format!(
        "{stem}_{}.{}",
        format.api_token().to_ascii_lowercase(),
        format.extension()
    );
    output_path.with_file_name(name)
}

/// Keep the last artifact per (portfolio id, reference date), at the position
/// of the first one. Returns the kept artifacts and how many were replaced.
fn latest_per_key(outputs: &[SuccessfulOutput]) -> (Vec<&SuccessfulOutput>, usize) {
    let mut index: HashMap<(&str, NaiveDate), usize> = HashMap::new();
    let mut kept: Vec<&SuccessfulOutput> = Vec::new();
    let mut superseded = 0;
    for output in outputs {
        let key = (output.portfolio_id.as_str(), output.reference_date);
        match index.get(&key) {
            Some(&i) => {
                kept[i] = output;
                superseded += 1;
            }
            None => {
                index.insert(key, kept.len());
                kept.push(output);
            }
        }
    }
    (kept, superseded)
}

fn merge_csv(
    inputs: &[(Provenance, &SuccessfulOutput, Vec<u8>)],
    format: ReportFormat,
) -> Result<Merged, ConsolidationError> {
    let delimiter = format.csv_delimiter();
    let mut merged = Merged::default();
    let mut header: Vec<String> = Vec::new();
    let mut tables = Vec::new();

    for (prov, output, bytes) in inputs {
        let text = decode_text(bytes);
        let (columns, mut rows) = match read_table(&text, delimiter) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(path = %output.path.display(), error = %e, "skipping malformed CSV artifact");
                merged.skipped += 1;
                continue;
            }
        };

        if let Some(schema) = schema_for(&output.endpoint) {
            let missing = schema.missing_required(&columns);
            if !missing.is_empty() {
                tracing::warn!(
                    path = %output.path.display(),
                    endpoint = %output.endpoint,
                    missing = ?missing,
                    "CSV artifact lacks required columns"
                );
                merged.schema_warnings += 1;
            }
            let roles = schema.roles(&columns);
            for row in &mut rows {
                merged.normalized_cells += normalize_row(row, &roles);
            }
        }

        let mut seen = HashSet::new();
        rows.retain(|row| {
            let fresh = seen.insert(row.clone());
            if !fresh {
                merged.duplicates_dropped += 1;
            }
            fresh
        });
        if rows.is_empty() {
            tracing::warn!(path = %output.path.display(), "skipping CSV artifact with no rows");
            merged.skipped += 1;
            continue;
        }

        for column in &columns {
            if !header.contains(column) {
                header.push(column.clone());
            }
        }
        tables.push((prov, columns, rows));
    }

    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(vec![]);
    let full_header: Vec<&str> = PROVENANCE
        .iter()
        .copied()
        .chain(header.iter().map(String::as_str))
        .collect();
    wtr.write_record(&full_header)?;

    for (prov, columns, rows) in &tables {
        let positions: Vec<Option<usize>> = header
            .iter()
            .map(|h| columns.iter().position(|c| c == h))
            .collect();
        for row in rows {
            let mut out: Vec<String> = prov.columns().to_vec();
            out.extend(
                positions
                    .iter()
                    .map(|p| p.and_then(|i| row.get(i)).cloned().unwrap_or_default()),
            );
            wtr.write_record(&out)?;
            merged.rows += 1;
        }
        merged.artifacts += 1;
    }

    merged.bytes = wtr
        .into_inner()
        .map_err(|e| ConsolidationError::Csv(e.into_error().into()))?;
    Ok(merged)
}

/// Header and non-blank rows of one CSV artifact. Any malformed record fails
/// the whole artifact.
fn read_table(text: &str, delimiter: u8) -> Result<(Vec<String>, Vec<Vec<String>>), csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());
    let columns: Vec<String> = rdr.headers()?.iter().map(|c| c.trim().to_string()).collect();

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok((columns, rows))
}

fn merge_json(
    inputs: &[(Provenance, &SuccessfulOutput, Vec<u8>)],
) -> Result<Merged, ConsolidationError> {
    let mut merged = Merged::default();
    let mut all = Vec::new();

    for (prov, output, bytes) in inputs {
        let items = match serde_json::from_str::<Value>(&decode_text(bytes)) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Null) => Vec::new(),
            Ok(other) => vec![other],
            Err(e) => {
                tracing::warn!(path = %output.path.display(), error = %e, "skipping malformed JSON artifact");
                merged.skipped += 1;
                continue;
            }
        };

        let mut seen = HashSet::new();
        let mut kept = 0;
        for item in items {
            if !seen.insert(item.to_string()) {
                merged.duplicates_dropped += 1;
                continue;
            }
            let mut object = match item {
                Value::Object(map) => map,
                value => {
                    let mut map = Map::new();
                    map.insert("value".into(), value);
                    map
                }
            };
            for (field, value) in PROVENANCE.iter().zip(prov.columns()) {
                object.insert((*field).to_string(), Value::String(value));
            }
            all.push(Value::Object(object));
            kept += 1;
        }
        if kept == 0 {
            tracing::warn!(path = %output.path.display(), "skipping JSON artifact with no items");
            merged.skipped += 1;
            continue;
        }
        merged.rows += kept;
        merged.artifacts += 1;
    }

    merged.bytes = serde_json::to_vec_pretty(&Value::Array(all))?;
    Ok(merged)
}

fn merge_text(inputs: &[(Provenance, &SuccessfulOutput, Vec<u8>)]) -> Merged {
    let mut merged = Merged::default();
    let mut out = String::new();

    for (prov, output, bytes) in inputs {
        let text = decode_text(bytes);
        let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
        if lines == 0 {
            tracing::warn!(path = %output.path.display(), "skipping empty text artifact");
            merged.skipped += 1;
            continue;
        }
        out.push_str(&format!(
            "===== {} ({}) | reference date {} | consolidated {} =====\n",
            prov.name, prov.id, prov.date, prov.stamp
        ));
        out.push_str(text.trim_end());
        out.push_str("\n\n");
        merged.rows += lines;
        merged.artifacts += 1;
    }

    merged.bytes = out.into_bytes();
    merged
}

fn index_pdf(inputs: &[(Provenance, &SuccessfulOutput, Vec<u8>)]) -> Merged {
    let mut merged = Merged::default();
    let mut out = String::from("portfolio\tportfolio_id\treference_date\tbytes\tpath\n");

    for (prov, output, bytes) in inputs {
        if bytes.is_empty() {
            merged.skipped += 1;
            continue;
        }
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            prov.name,
            prov.id,
            prov.date,
            bytes.len(),
            output.path.display()
        ));
        merged.rows += 1;
        merged.artifacts += 1;
    }

    merged.bytes = out.into_bytes();
    merged
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
