//! reportbatch core: domain types, collaborator ports and the request policies
//! behind resilient report batches.
//!
//! This crate contains:
//! - Domain types (portfolios, report formats, requests, payloads)
//! - Ports for the report client, output writer, portfolio catalog and clock
//! - Sliding-window rate limiter
//! - Failure classifier with the per-kind retry policy table
//! - Durable failure store with JSON-file and in-memory backends
//! - Per-portfolio circuit breakers
//! - A blocking HTTP report client and an atomic file writer

pub mod catalog;
pub mod clock;
pub mod domain;
pub mod http;
pub mod ports;
pub mod resilience;
pub mod store;
pub mod writer;

pub use catalog::{select_portfolios, StaticCatalog, TomlCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{Endpoint, Portfolio, ReportFormat, ReportPayload, ReportRequest, RequestParams};
pub use http::{HttpClientConfig, HttpReportClient};
pub use ports::{CatalogError, FetchError, OutputWriter, PortfolioCatalog, ReportClient};
pub use resilience::{
    classify, CircuitBoard, CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorClass,
    FailureKind, RateLimiter, RetryPolicy,
};
pub use store::{
    export_csv, FailureBackend, FailureRecord, FailureStats, FailureStore, JsonFileBackend,
    MemoryBackend, StoreError,
};
pub use writer::FsOutputWriter;
