//! HTTP client for the dealer's work endpoints.

use crate::distributor::{Assignment, ReportSummary, WorkReport, WorkRequest};

use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Client error types.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    /// The dealer refused the request itself; sending it again cannot help.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ClientError {
    /// Whether the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClientError::BadRequest(_))
    }
}

/// The dealer's answer to a report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportAck {
    Accepted(ReportSummary),
    /// The assignment expired or was never issued; the results were discarded.
    Rejected,
}

/// The two calls a worker makes against the dealer.
pub trait DealerApi: Send + Sync {
    /// `Ok(None)` means there is nothing to do right now.
    fn request_work(
        &self,
        request: &WorkRequest,
    ) -> impl Future<Output = Result<Option<Assignment>, ClientError>> + Send;

    fn submit_report(
        &self,
        report: &WorkReport,
    ) -> impl Future<Output = Result<ReportAck, ClientError>> + Send;
}

/// Talks to a dealer over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDealer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDealer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl DealerApi for HttpDealer {
    async fn request_work(&self, request: &WorkRequest) -> Result<Option<Assignment>, ClientError> {
        let response = self
            .client
            .post(self.url("/work/request"))
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::BAD_REQUEST => Err(ClientError::BadRequest(response.text().await?)),
            status => Err(ClientError::Status(status)),
        }
    }

    async fn submit_report(&self, report: &WorkReport) -> Result<ReportAck, ClientError> {
        let response = self
            .client
            .post(self.url("/work/report"))
            .json(report)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(ReportAck::Accepted(response.json().await?)),
            StatusCode::GONE => Ok(ReportAck::Rejected),
            StatusCode::BAD_REQUEST => Err(ClientError::BadRequest(response.text().await?)),
            status => Err(ClientError::Status(status)),
        }
    }
}
