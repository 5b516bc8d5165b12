//! Domain types: portfolios, report formats, requests and payloads.

pub mod portfolio;
pub mod report;

pub use portfolio::{Portfolio, PortfolioError};
pub use report::{
    date_from_params, format_from_params, Endpoint, ReportFormat, ReportPayload, ReportRequest,
    RequestParams,
};
