//! HTTP implementation of the `Transport` contract, backed by
//! `reqwest::blocking`. Kept deliberately synchronous: the worker and
//! syncer threads are expected to block on send, never to interleave it
//! with other async work.

use super::{
    BatchEnvelope, FinishRunResponse, InitRunRequest, InitRunResponse, SendBatchResponse,
    Transport,
};
use crate::error::TransportError;
use reqwest::blocking::Client as HttpClient;
use std::time::Duration;

/// Default ingest endpoint used when no override is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:3001";

pub struct HttpTransport {
    base_url: String,
    api_key: Option<String>,
    client: HttpClient,
}

impl HttpTransport {
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::new()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn handle_json_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<T, TransportError> {
        let status = response.status().as_u16();
        if status >= 500 {
            return Err(TransportError::Server { status });
        }
        let body = response.text().unwrap_or_default();
        if status >= 400 {
            return Err(TransportError::Client { status, message: body });
        }
        serde_json::from_str(&body).map_err(|err| TransportError::Malformed(err.to_string()))
    }
}

impl Transport for HttpTransport {
    fn init_run(&self, request: InitRunRequest) -> Result<InitRunResponse, TransportError> {
        let result = self
            .authed(self.client.post(self.endpoint("/api/v1/runs")))
            .json(&request)
            .send();

        match result {
            Ok(response) => self.handle_json_response(response),
            Err(err) if err.is_connect() => {
                tracing::warn!("server unavailable, starting run in offline mode");
                Ok(InitRunResponse {
                    run_id: uuid::Uuid::new_v4().to_string(),
                    offline: true,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn send_batch(
        &self,
        envelope: &BatchEnvelope,
        compressed: bool,
        raw_payload: Option<&[u8]>,
    ) -> Result<SendBatchResponse, TransportError> {
        let mut builder = self.authed(self.client.post(self.endpoint("/api/v1/ingest/batch")));

        builder = match raw_payload {
            Some(bytes) if compressed => builder
                .header("Content-Type", "application/json")
                .header("Content-Encoding", "gzip")
                .body(bytes.to_vec()),
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(bytes.to_vec()),
            None => builder.json(envelope),
        };

        let response = builder.send()?;
        self.handle_json_response(response)
    }

    fn finish_run(&self, run_id: &str, status: &str) -> Result<FinishRunResponse, TransportError> {
        let result = self
            .authed(
                self.client
                    .post(self.endpoint(&format!("/api/v1/runs/{run_id}/finish"))),
            )
            .json(&serde_json::json!({ "status": status }))
            .send();

        match result {
            Ok(response) => self.handle_json_response(response),
            Err(err) if err.is_connect() => {
                tracing::warn!("server unavailable, run finish will be synced later");
                Ok(FinishRunResponse {
                    status: "pending_sync".to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn health_check(&self) -> Result<(), TransportError> {
        let response = self.client.get(self.endpoint("/health")).send()?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::from_status(
                response.status().as_u16(),
                &response.text().unwrap_or_default(),
            ))
        }
    }

    fn close(&self) {}
}

/// Builder for [`HttpTransport`]. Mirrors the construction-time knobs `Config`
/// exposes, so `Pipeline::new` can build one directly from config values.
pub struct HttpTransportBuilder {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTransportBuilder {
    pub fn new() -> Self {
        HttpTransportBuilder {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<HttpTransport, reqwest::Error> {
        let client = HttpClient::builder().timeout(self.timeout).build()?;
        Ok(HttpTransport {
            base_url: self.base_url,
            api_key: self.api_key,
            client,
        })
    }
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_url_and_path() {
        let transport = HttpTransportBuilder::new()
            .base_url("http://localhost:3001/")
            .build()
            .unwrap();
        assert_eq!(
            transport.endpoint("/api/v1/ingest/batch"),
            "http://localhost:3001/api/v1/ingest/batch"
        );
    }
}
