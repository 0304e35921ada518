//! TensorFlow Serving REST client

use super::{Deadline, ModelServerClient};
use crate::error::{ValidatorError, ValidatorResult};
use crate::request_builder::{RequestTarget, SyntheticRequest};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const AVAILABLE: &str = "AVAILABLE";
const END: &str = "END";

/// Client for the TensorFlow Serving REST API of one model
pub struct TensorFlowServingClient {
    http: reqwest::Client,
    base_url: String,
    model_name: String,
}

#[derive(Debug, Deserialize)]
struct ModelStatusResponse {
    #[serde(default)]
    model_version_status: Vec<ModelVersionStatus>,
}

#[derive(Debug, Deserialize)]
struct ModelVersionStatus {
    #[serde(default)]
    version: String,
    state: String,
    #[serde(default)]
    status: Option<StatusBody>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

impl TensorFlowServingClient {
    pub fn new(host: &str, port: u16, model_name: String) -> ValidatorResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: format!("http://{host}:{port}"),
            model_name,
        })
    }

    fn model_url(&self) -> String {
        format!("{}/v1/models/{}", self.base_url, self.model_name)
    }

    async fn model_status(&self) -> ValidatorResult<ModelStatusResponse> {
        let resp = self.http.get(self.model_url()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ValidatorError::client(format!(
                "Model status returned HTTP {status}: {body}"
            )));
        }
        Ok(resp.json().await?)
    }

    async fn send_request(&self, request: &SyntheticRequest) -> ValidatorResult<Value> {
        let RequestTarget::TensorFlowServing(rpc_kind) = request.target else {
            return Err(ValidatorError::request(format!(
                "TensorFlow Serving cannot handle {} requests",
                request.target
            )));
        };
        let url = format!("{}:{}", self.model_url(), rpc_kind.method());
        let resp = self.http.post(&url).json(&request.body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ValidatorError::request(format!(
                "{rpc_kind} returned HTTP {status}: {body}"
            )));
        }

        let body: Value = resp.json().await?;
        if let Some(error) = body.get("error") {
            return Err(ValidatorError::request(format!("{rpc_kind} failed: {error}")));
        }
        Ok(body)
    }
}

/// Whether any version of the model is loaded. A version that ended with an
/// error fails the wait immediately.
fn model_loaded(response: &ModelStatusResponse) -> ValidatorResult<bool> {
    for version in &response.model_version_status {
        if version.state == AVAILABLE {
            return Ok(true);
        }
        if version.state == END {
            if let Some(status) = &version.status {
                if !status.error_code.is_empty() && status.error_code != "OK" {
                    return Err(ValidatorError::client(format!(
                        "Model version {} failed to load: {} {}",
                        version.version, status.error_code, status.error_message
                    )));
                }
            }
        }
    }
    Ok(false)
}

#[async_trait]
impl ModelServerClient for TensorFlowServingClient {
    async fn wait_until_model_loaded(&mut self, timeout: Duration) -> ValidatorResult<()> {
        let deadline = Deadline::after(timeout);

        loop {
            match self.model_status().await {
                Ok(response) => {
                    if model_loaded(&response)? {
                        info!("Model {} is available", self.model_name);
                        return Ok(());
                    }
                    debug!("Model {} status: {:?}", self.model_name, response);
                }
                // The server may not accept connections yet
                Err(e) => debug!("Model {} not reachable yet: {e}", self.model_name),
            }

            let Some(delay) = deadline.next_poll() else {
                return Err(ValidatorError::timeout(
                    format!("model {} to load", self.model_name),
                    timeout,
                ));
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_requests(&mut self, requests: &[SyntheticRequest]) -> ValidatorResult<()> {
        for (i, request) in requests.iter().enumerate() {
            let response = self.send_request(request).await?;
            debug!("Request {i} to {} answered: {response}", self.model_name);
        }
        Ok(())
    }
}
