use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Result of a single poll that reached the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

impl ProbeResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Transient poll failures; the gate counts them as a bad poll and keeps going
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("Connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("Probe of {url} timed out")]
    Timeout { url: String },

    #[error("Invalid health URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, ProbeError>;
}

/// HTTP prober; `tcp://host:port` URLs are checked with a plain connect
pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, timeout }
    }

    async fn probe_tcp(&self, url: &str, address: &str) -> Result<ProbeResponse, ProbeError> {
        if address.is_empty() || !address.contains(':') {
            return Err(ProbeError::InvalidUrl {
                url: url.to_string(),
                reason: "expected tcp://host:port".to_string(),
            });
        }

        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Ok(ProbeResponse::new(200, "")),
            Ok(Err(e)) => Err(ProbeError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ProbeError::Timeout {
                url: url.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        if let Some(address) = url.strip_prefix("tcp://") {
            return self.probe_tcp(url, address.trim_end_matches('/')).await;
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout {
                    url: url.to_string(),
                }
            } else if e.is_builder() {
                ProbeError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            } else {
                ProbeError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        // An unreadable body still carries a usable status code
        let body = response.text().await.unwrap_or_default();
        Ok(ProbeResponse { status, body })
    }
}
