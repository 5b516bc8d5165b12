//! Blocking HTTP client for the reporting API.
//!
//! Posts the request parameters as JSON to `{base_url}/report/reports/{endpoint}`
//! and maps every non-success outcome onto a [`FetchError`] variant. Retrying is
//! the orchestrator's job, so this client performs exactly one call per fetch.

use crate::domain::{Endpoint, ReportPayload, RequestParams};
use crate::ports::{FetchError, ReportClient};
use std::time::Duration;

const MAX_ERROR_BODY: usize = 500;

/// Connection settings for [`HttpReportClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct HttpReportClient {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl HttpReportClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("reportbatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Other {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn report_url(&self, endpoint: &Endpoint) -> String {
        format!("{}/report/reports/{}", self.base_url, endpoint)
    }
}

/// Map a non-success HTTP status to a fetch error.
///
/// Returns `None` for 2xx statuses.
pub fn status_error(status: u16, retry_after_secs: Option<u64>, body: &str) -> Option<FetchError> {
    if (200..300).contains(&status) {
        return None;
    }
    if status == 429 {
        return Some(FetchError::RateLimited { retry_after_secs });
    }
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    Some(FetchError::Status { status, body })
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            message: e.to_string(),
        }
    } else if e.is_connect() || e.is_request() || e.is_body() {
        FetchError::Connection {
            message: e.to_string(),
        }
    } else if e.is_decode() {
        FetchError::Malformed {
            detail: e.to_string(),
        }
    } else {
        FetchError::Other {
            message: e.to_string(),
        }
    }
}

impl ReportClient for HttpReportClient {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(
        &self,
        portfolio_id: &str,
        endpoint: &Endpoint,
        params: &RequestParams,
    ) -> Result<ReportPayload, FetchError> {
        let url = self.report_url(endpoint);
        tracing::debug!(portfolio_id, %endpoint, %url, "requesting report");

        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .header("Accept", "application/json")
            .json(params)
            .send()
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = resp.bytes().map_err(transport_error)?;

        if let Some(err) = status_error(status, retry_after, &String::from_utf8_lossy(&bytes)) {
            return Err(err);
        }

        Ok(ReportPayload::new(bytes.to_vec(), content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_map_to_none() {
        assert!(status_error(200, None, "").is_none());
        assert!(status_error(204, None, "").is_none());
    }

    #[test]
    fn rate_limit_keeps_retry_after() {
        match status_error(429, Some(30), "slow down") {
            Some(FetchError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, Some(30))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_body_is_truncated() {
        let body = "x".repeat(2_000);
        match status_error(500, None, &body) {
            Some(FetchError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client =
            HttpReportClient::new(HttpClientConfig::new("https://api.example.com/", "k")).unwrap();
        assert_eq!(
            client.report_url(&Endpoint::new("1048")),
            "https://api.example.com/report/reports/1048"
        );
    }
}
