//! Solver backend client
//!
//! Covers the four backend calls the executor makes: solver status checks,
//! fast-fill acceleration, signature post-back, and gasless batch relay. Any
//! non-success HTTP status becomes [`ExecutorError::Api`] carrying the raw body.

use crate::error::{ExecutorError, ExecutorResult};
use crate::quote::{CheckEndpoint, PostData};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default status endpoint when an item does not name its own
pub const STATUS_PATH: &str = "/intents/status/v2";
pub const FAST_FILL_PATH: &str = "/fast-fill";
pub const BATCH_RELAY_PATH: &str = "/execute";

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverStatus {
    /// Solver has seen the deposit and is filling
    Pending,
    Success,
    Failure,
    Refund,
    /// Deposit not yet indexed by the solver
    Waiting,
    #[serde(other)]
    Unknown,
}

impl SolverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolverStatus::Pending => "pending",
            SolverStatus::Success => "success",
            SolverStatus::Failure => "failure",
            SolverStatus::Refund => "refund",
            SolverStatus::Waiting => "waiting",
            SolverStatus::Unknown => "unknown",
        }
    }

    /// Failure and refund end the request; no further polling helps
    pub fn is_definitive_failure(&self) -> bool {
        matches!(self, SolverStatus::Failure | SolverStatus::Refund)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: SolverStatus,
    #[serde(default)]
    pub details: Option<String>,
    /// Origin-chain hashes the solver attributes to the request
    #[serde(default)]
    pub in_tx_hashes: Vec<String>,
    /// Destination-chain fill hashes
    #[serde(default)]
    pub tx_hashes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    pub request_id: String,
    pub tx_hash: Option<String>,
    pub chain_id: Option<u64>,
    pub check: Option<CheckEndpoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FastFillRequest {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solver_input_currency_amount: Option<String>,
}

/// A signed batch handed to the backend for on-chain submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRelayRequest {
    pub chain_id: u64,
    /// The delegated account the batch executes on
    pub to: String,
    pub data: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRelayResponse {
    pub tx_hash: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Backend operations the executor depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SolverApi: Send + Sync {
    async fn get_status(&self, query: &StatusQuery) -> ExecutorResult<StatusResponse>;

    async fn fast_fill(&self, request: &FastFillRequest) -> ExecutorResult<()>;

    async fn post_signature(&self, post: &PostData, signature: &str) -> ExecutorResult<()>;

    async fn relay_batch(&self, request: &BatchRelayRequest) -> ExecutorResult<BatchRelayResponse>;
}

/// reqwest-backed [`SolverApi`]
pub struct HttpSolverApi {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpSolverApi {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> ExecutorResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ExecutorError::Config(format!("Invalid API base URL {}: {}", base_url, e)))?;
        // Endpoints resolve under the base path, so it must end in a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Resolve `path` below the base URL; absolute URLs are used as given
    fn endpoint(&self, path: &str) -> ExecutorResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ExecutorError::Config(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    async fn check(endpoint: &Url, response: Response) -> ExecutorResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ExecutorError::Api {
            endpoint: endpoint.path().to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_method(method: &str) -> ExecutorResult<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ExecutorError::InvalidQuote(format!("unsupported HTTP method {}", method)))
}

#[async_trait]
impl SolverApi for HttpSolverApi {
    async fn get_status(&self, query: &StatusQuery) -> ExecutorResult<StatusResponse> {
        let (url, method) = match &query.check {
            Some(check) => (self.endpoint(&check.endpoint)?, parse_method(&check.method)?),
            None => {
                let mut url = self.endpoint(STATUS_PATH)?;
                url.query_pairs_mut()
                    .append_pair("requestId", &query.request_id);
                (url, Method::GET)
            }
        };

        debug!("Checking solver status for {} at {}", query.request_id, url);
        let response = self.request(method, url.clone()).send().await?;
        let response = Self::check(&url, response).await?;
        Ok(response.json().await?)
    }

    async fn fast_fill(&self, request: &FastFillRequest) -> ExecutorResult<()> {
        if self.api_key.is_none() {
            return Err(ExecutorError::Config(
                "fast fill requires an API key".to_string(),
            ));
        }

        let url = self.endpoint(FAST_FILL_PATH)?;
        let response = self
            .request(Method::POST, url.clone())
            .json(request)
            .send()
            .await?;
        Self::check(&url, response).await?;
        Ok(())
    }

    async fn post_signature(&self, post: &PostData, signature: &str) -> ExecutorResult<()> {
        let mut url = self.endpoint(&post.endpoint)?;
        url.query_pairs_mut().append_pair("signature", signature);

        let method = parse_method(&post.method)?;
        let builder = self.request(method.clone(), url.clone());
        let builder = if method == Method::GET {
            builder
        } else {
            builder.json(&post.body)
        };

        let response = builder.send().await?;
        Self::check(&url, response).await?;
        Ok(())
    }

    async fn relay_batch(&self, request: &BatchRelayRequest) -> ExecutorResult<BatchRelayResponse> {
        let url = self.endpoint(BATCH_RELAY_PATH)?;
        let response = self
            .request(Method::POST, url.clone())
            .json(request)
            .send()
            .await?;
        let response = Self::check(&url, response).await?;
        Ok(response.json().await?)
    }
}
