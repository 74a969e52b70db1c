use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::services::normalizer::{DeferredUrl, ProviderOutput};

/// External image-generation provider.
///
/// `run` is one logical generation attempt. Implementations may retry at the
/// network level, but never re-submit a prediction that was accepted.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Short identifier recorded in asset provenance.
    fn name(&self) -> &str;

    async fn run(&self, model: &str, input: Value) -> Result<ProviderOutput, ProviderError>;
}

/// Client for the Replicate predictions API.
pub struct ReplicateClient {
    http: Client,
    base_url: String,
    api_token: String,
    max_retries: u32,
    poll_interval: Duration,
    max_wait: Duration,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: Option<String>,
}

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

impl ReplicateClient {
    pub fn new(
        base_url: &str,
        api_token: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("studio-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            max_retries,
            poll_interval: Duration::from_secs(2),
            max_wait: timeout,
        })
    }

    fn create_request(&self, model: &str, input: &Value) -> RequestBuilder {
        // "owner/name:version" targets a pinned version, "owner/name" the latest.
        let (url, body) = match model.split_once(':') {
            Some((_, version)) => (
                format!("{}/predictions", self.base_url),
                serde_json::json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.base_url, model),
                serde_json::json!({ "input": input }),
            ),
        };

        self.http
            .post(url)
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&body)
    }

    /// Send with network-level retries for transport errors, 429 and 5xx.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, ProviderError> {
        let mut attempt = 0;
        loop {
            let outcome = build().send().await;

            let retry_after = match outcome {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if is_retryable_status(response.status()) => {
                    let retry_after = parse_retry_after(&response);
                    if attempt >= self.max_retries {
                        return Err(status_error(response).await);
                    }
                    tracing::warn!(
                        status = %response.status(),
                        attempt = attempt + 1,
                        "Provider request throttled or unavailable, retrying"
                    );
                    retry_after
                }
                Ok(response) => return Err(status_error(response).await),
                Err(e) if attempt < self.max_retries && is_transient(&e) => {
                    tracing::warn!(error = %e, attempt = attempt + 1, "Provider request failed, retrying");
                    None
                }
                Err(e) => return Err(ProviderError::Http(e)),
            };

            sleep(retry_delay(attempt, retry_after)).await;
            attempt += 1;
        }
    }

    async fn poll_until_done(&self, mut prediction: Prediction) -> Result<Prediction, ProviderError> {
        let started = Instant::now();

        while matches!(prediction.status.as_str(), "starting" | "processing") {
            if started.elapsed() >= self.max_wait {
                return Err(ProviderError::Timeout(self.max_wait));
            }
            let Some(get_url) = prediction.urls.as_ref().and_then(|u| u.get.clone()) else {
                return Err(ProviderError::Malformed(format!(
                    "prediction {} is {} without a poll url",
                    prediction.id, prediction.status
                )));
            };

            sleep(self.poll_interval).await;
            let response = self
                .send_with_retry(|| self.http.get(&get_url).bearer_auth(&self.api_token))
                .await?;
            prediction = response.json().await?;

            tracing::debug!(prediction_id = %prediction.id, status = %prediction.status, "Polled prediction");
        }

        Ok(prediction)
    }
}

#[async_trait]
impl ImageProvider for ReplicateClient {
    fn name(&self) -> &str {
        "replicate"
    }

    async fn run(&self, model: &str, input: Value) -> Result<ProviderOutput, ProviderError> {
        let start = Instant::now();
        let response = self
            .send_with_retry(|| self.create_request(model, &input))
            .await?;
        let prediction: Prediction = response.json().await?;
        let prediction = self.poll_until_done(prediction).await?;

        tracing::info!(
            prediction_id = %prediction.id,
            model = model,
            status = %prediction.status,
            duration_ms = start.elapsed().as_millis() as u64,
            "Prediction finished"
        );

        match prediction.status.as_str() {
            "succeeded" => Ok(prediction_output(prediction.output.unwrap_or(Value::Null))),
            _ => Err(ProviderError::PredictionFailed {
                status: prediction.status,
                message: prediction
                    .error
                    .map(|e| match e {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .unwrap_or_default(),
            }),
        }
    }
}

/// Map prediction output JSON into a provider tree, exposing every URL string
/// as a file handle the way the official SDKs do.
fn prediction_output(value: Value) -> ProviderOutput {
    match value {
        Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
            ProviderOutput::File(DeferredUrl::ready(s))
        }
        Value::Array(items) => ProviderOutput::List(items.into_iter().map(prediction_output).collect()),
        Value::Object(fields) => ProviderOutput::Record(
            fields
                .into_iter()
                .map(|(key, value)| (key, prediction_output(value)))
                .collect::<BTreeMap<_, _>>(),
        ),
        other => ProviderOutput::Json(other),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Doubling delay from one second, capped; a server-provided `Retry-After`
/// wins but is capped too.
fn retry_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(server_delay) = retry_after {
        return server_delay.min(RETRY_MAX_DELAY);
    }
    RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RETRY_MAX_DELAY)
}

async fn status_error(response: Response) -> ProviderError {
    let code = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Status {
        code,
        body: body.chars().take(500).collect(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Prediction ended with status {status}: {message}")]
    PredictionFailed { status: String, message: String },

    #[error("Prediction did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Unreachable, timed out, throttled or 5xx.
    pub fn is_transient_network(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Timeout(_) => true,
            ProviderError::Status { code, .. } => *code == 429 || *code >= 500,
            ProviderError::PredictionFailed { .. } | ProviderError::Malformed(_) => false,
        }
    }

    /// Rejections a re-run cannot fix: bad credentials, unknown model, invalid input.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Status { code, .. } if matches!(code, 400 | 401 | 403 | 404 | 422))
    }
}
