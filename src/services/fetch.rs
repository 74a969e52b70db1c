use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Bytes downloaded from a remote image URL.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Downloads remote images (provider outputs and reference uploads).
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError>;
}

/// Default download cap for a single image.
pub const DEFAULT_MAX_BYTES: usize = 50 * 1024 * 1024;

/// reqwest-backed fetcher with a hard per-request timeout and a size cap.
pub struct HttpFetcher {
    http: Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("studio-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            max_bytes: DEFAULT_MAX_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        let mut response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: redact(url),
                code: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let too_large = |size| FetchError::TooLarge {
            url: redact(url),
            size,
        };
        if let Some(declared) = response.content_length() {
            let declared = usize::try_from(declared).unwrap_or(usize::MAX);
            if declared > self.max_bytes {
                return Err(too_large(declared));
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            append_capped(&mut bytes, &chunk, self.max_bytes).map_err(too_large)?;
        }
        if bytes.is_empty() {
            return Err(FetchError::Empty(redact(url)));
        }

        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

/// Append `chunk` unless that would take `buf` past `max` bytes, in which
/// case the size it would have reached is returned.
fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], max: usize) -> Result<(), usize> {
    let size = buf.len().saturating_add(chunk.len());
    if size > max {
        return Err(size);
    }
    buf.extend_from_slice(chunk);
    Ok(())
}

/// Strip the query string so signed URLs never reach logs or error text.
pub fn redact(url: &str) -> String {
    url.split(['?', '#']).next().unwrap_or(url).to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download of {url} returned HTTP {code}")]
    Status { url: String, code: u16 },

    #[error("Download of {0} returned no bytes")]
    Empty(String),

    #[error("Download of {url} is too large ({size} bytes)")]
    TooLarge { url: String, size: usize },
}

impl FetchError {
    /// 4xx other than 408/429 will not succeed on retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            FetchError::Status { code, .. } => {
                (400..500).contains(code) && *code != 408 && *code != 429
            }
            FetchError::TooLarge { .. } => true,
            FetchError::Http(_) | FetchError::Empty(_) => false,
        }
    }
}
