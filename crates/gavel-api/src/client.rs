//! HTTP-backed peer transport
//!
//! Peer RPCs travel as `POST /rpc` with the JSON envelope from
//! `gavel_core::rpc`. Connections are short-lived with a bounded
//! connect+call timeout; every failure collapses into "no answer", which
//! is all the protocols distinguish.

use std::time::Duration;

use async_trait::async_trait;
use gavel_core::{Error, Request, Response, Result, Transport};

/// Default connect timeout for peer calls
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default total timeout for peer calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// [`Transport`] over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with explicit timeouts
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(call_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Build a transport with the default timeouts
    pub fn with_defaults() -> reqwest::Result<Self> {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, peer: &str, request: Request) -> Result<Response> {
        let method = request.method();
        let url = format!("http://{peer}/rpc");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    Error::Timeout(peer.to_string())
                } else {
                    Error::Unreachable(format!("{peer}: {error}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Unreachable(format!(
                "{peer}: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Response>()
            .await
            .map_err(|_| Error::UnexpectedReply { peer: peer.to_string(), method })
    }
}
