//! Row normalization applied while consolidating CSV artifacts.
//!
//! Known endpoints carry a schema naming their required, date and numeric
//! columns. Numeric cells in Brazilian (`1.234,56`) or US (`1,234.56`)
//! notation become plain decimals (`1234.56`), and dates in the usual
//! day-first layouts become `YYYY-MM-DD`. Column names match
//! case-insensitively. Cells that do not parse are left as they are.

use chrono::{Datelike, NaiveDate};
use reportbatch_core::Endpoint;
use std::borrow::Cow;

/// Column roles for one report endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSchema {
    pub endpoint: &'static str,
    pub required: &'static [&'static str],
    pub dates: &'static [&'static str],
    pub numerics: &'static [&'static str],
}

pub const SCHEMAS: [EndpointSchema; 5] = [
    // Daily portfolio
    EndpointSchema {
        endpoint: "32",
        required: &["DATA", "ATIVO", "QUANTIDADE", "VALOR"],
        dates: &["DATA"],
        numerics: &["QUANTIDADE", "VALOR", "PRECO_UNITARIO"],
    },
    // Quoteholder positions
    EndpointSchema {
        endpoint: "45",
        required: &["COTISTA", "CPF_CNPJ", "QUANTIDADE_COTAS"],
        dates: &["DATA_POSICAO"],
        numerics: &["QUANTIDADE_COTAS", "VALOR_COTAS"],
    },
    // Synthetic profitability
    EndpointSchema {
        endpoint: "1048",
        required: &["FUNDO", "DATA", "RENTABILIDADE"],
        dates: &["DATA", "DATA_INICIAL", "DATA_FINAL"],
        numerics: &["RENTABILIDADE", "PATRIMONIO", "COTAS"],
    },
    // Profitability report
    EndpointSchema {
        endpoint: "1799",
        required: &["CARTEIRA", "DATA", "CDI"],
        dates: &["DATA"],
        numerics: &["CDI", "RENTABILIDADE", "BENCHMARK"],
    },
    // Checking account statement
    EndpointSchema {
        endpoint: "1988",
        required: &["DATA", "DESCRICAO", "VALOR"],
        dates: &["DATA"],
        numerics: &["VALOR", "SALDO"],
    },
];

pub fn schema_for(endpoint: &Endpoint) -> Option<&'static EndpointSchema> {
    SCHEMAS.iter().find(|s| s.endpoint == endpoint.as_str())
}

/// What a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Date,
    Numeric,
    Plain,
}

impl EndpointSchema {
    /// Role of each column in `header`, in order.
    pub fn roles(&self, header: &[String]) -> Vec<ColumnRole> {
        header
            .iter()
            .map(|column| {
                if contains_column(self.dates, column) {
                    ColumnRole::Date
                } else if contains_column(self.numerics, column) {
                    ColumnRole::Numeric
                } else {
                    ColumnRole::Plain
                }
            })
            .collect()
    }

    /// Required columns absent from `header`.
    pub fn missing_required(&self, header: &[String]) -> Vec<&'static str> {
        self.required
            .iter()
            .copied()
            .filter(|name| !header.iter().any(|c| c.eq_ignore_ascii_case(name)))
            .collect()
    }
}

fn contains_column(names: &[&str], column: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(column))
}

/// Normalize `row` in place. Returns how many cells changed.
pub fn normalize_row(row: &mut [String], roles: &[ColumnRole]) -> usize {
    let mut changed = 0;
    for (cell, role) in row.iter_mut().zip(roles) {
        let trimmed = cell.trim();
        let normalized = match role {
            ColumnRole::Date => normalize_date(trimmed),
            ColumnRole::Numeric => normalize_number(trimmed),
            ColumnRole::Plain => None,
        };
        let next = normalized.unwrap_or_else(|| trimmed.to_string());
        if next != *cell {
            *cell = next;
            changed += 1;
        }
    }
    changed
}

/// Plain decimal form of a BR or US formatted number, e.g. `R$ 1.234,56`
/// to `1234.56`. `None` when nothing numeric remains.
///
/// With both separators present the last one is the decimal mark. A lone
/// comma is decimal when at most two digits follow it, else a thousands
/// separator.
pub fn normalize_number(value: &str) -> Option<String> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | ','))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let plain = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => match cleaned.split_once(',') {
            Some((_, decimals)) if !decimals.contains(',') && decimals.len() <= 2 => {
                cleaned.replace(',', ".")
            }
            _ => cleaned.replace(',', ""),
        },
        (None, _) => cleaned,
    };
    let plain = plain.strip_prefix('+').unwrap_or(&plain).to_string();
    plain.parse::<f64>().ok().map(|_| plain)
}

/// `YYYY-MM-DD` form of a date written day-first or ISO-like.
pub fn normalize_date(value: &str) -> Option<String> {
    // (format, four-digit year)
    const FORMATS: [(&str, bool); 5] = [
        ("%d/%m/%Y", true),
        ("%d-%m-%Y", true),
        ("%Y-%m-%d", true),
        ("%d/%m/%y", false),
        ("%Y/%m/%d", true),
    ];
    if value.is_empty() {
        return None;
    }
    FORMATS.iter().find_map(|(format, four_digit)| {
        NaiveDate::parse_from_str(value, format)
            .ok()
            .filter(|d| !four_digit || d.year() >= 1000)
            .map(|d| d.format("%Y-%m-%d").to_string())
    })
}

/// Decode artifact bytes: UTF-8 (BOM stripped) when valid, else Latin-1.
///
/// Latin-1 maps every byte to a char, so decoding always succeeds.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}
