//! Collaborator ports consumed by the batch engine, with their structured errors.
//!
//! The engine never talks to the network or the file system directly: it is
//! handed a [`ReportClient`], an [`OutputWriter`] and a [`PortfolioCatalog`],
//! so every policy can be exercised against in-memory fakes.

use crate::domain::{Endpoint, Portfolio, PortfolioError, ReportFormat, ReportPayload, RequestParams};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Structured failure of a single report fetch.
///
/// Variants carry the status code or transport category so classification
/// never depends on message text.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("rate limited by API (retry after {}s)", retry_after_secs.unwrap_or(0))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("empty report: {detail}")]
    Empty { detail: String },

    #[error("malformed response: {detail}")]
    Malformed { detail: String },

    #[error("failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{message}")]
    Other { message: String },
}

impl FetchError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        FetchError::Status {
            status,
            body: body.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        FetchError::Timeout {
            message: message.into(),
        }
    }

    pub fn empty(detail: impl Into<String>) -> Self {
        FetchError::Empty {
            detail: detail.into(),
        }
    }
}

/// Request/response client for the remote reporting API.
pub trait ReportClient: Send + Sync {
    /// Human-readable name of this client.
    fn name(&self) -> &str;

    /// Fetch one report for one portfolio.
    fn fetch(
        &self,
        portfolio_id: &str,
        endpoint: &Endpoint,
        params: &RequestParams,
    ) -> Result<ReportPayload, FetchError>;
}

/// Persists one fetched artifact. Overwriting an existing path must be safe.
pub trait OutputWriter: Send + Sync {
    fn write(&self, bytes: &[u8], path: &Path, format: ReportFormat) -> io::Result<()>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("read catalog {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse catalog TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid portfolio entry: {0}")]
    Invalid(#[from] PortfolioError),

    #[error("portfolio(s) not in catalog: {}", ids.join(", "))]
    Unknown { ids: Vec<String> },
}

/// Ordered source of configured portfolios.
pub trait PortfolioCatalog {
    fn list_portfolios(&self) -> Result<Vec<Portfolio>, CatalogError>;
}
