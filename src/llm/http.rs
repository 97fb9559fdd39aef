use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;
use crate::llm::{ProviderRequest, ProviderResponse, Transport};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
/// Runtime configuration for [`HttpTransport`].
pub struct HttpTransportConfig {
    /// Bearer token sent with every request.
    pub api_key: String,
    /// Model id used when a request carries no override.
    pub model: String,
    /// Optional base URL for proxies or OpenAI-compatible endpoints.
    pub api_base_url: Option<String>,
}

impl HttpTransportConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_base_url: None,
        }
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }
}

/// OpenAI-compatible chat-completions transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Reads `OPENAI_API_KEY` and, if set, `OPENAI_BASE_URL`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, TransportError> {
        Self::from_vars(model, |name| std::env::var(name).ok())
    }

    fn from_vars(
        model: impl Into<String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, TransportError> {
        let api_key = var("OPENAI_API_KEY")
            .ok_or_else(|| TransportError::Config("OPENAI_API_KEY is not set".to_string()))?;

        let mut config = HttpTransportConfig::new(api_key, model);
        if let Some(url) = var("OPENAI_BASE_URL") {
            config = config.api_base_url(url);
        }

        Self::new(config)
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, TransportError> {
        let mut request = request.clone();
        if request.model.is_none() {
            request.model = Some(self.config.model.clone());
        }

        debug!(
            endpoint = %self.endpoint(),
            model = request.model.as_deref().unwrap_or_default(),
            messages = request.messages.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = extract_api_error(status, response).await;
            return Err(classify_status(status, message));
        }

        response
            .json::<ProviderResponse>()
            .await
            .map_err(|err| TransportError::Network(format!("invalid response body: {err}")))
    }
}

/// Only 400 and 422 describe a request shape the provider will not accept, so
/// only those let the session retry with fewer features.
fn classify_status(status: StatusCode, message: String) -> TransportError {
    if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY
    ) {
        TransportError::RejectedRequest(message)
    } else if status.is_client_error() {
        TransportError::Refused {
            status: status.as_u16(),
            message,
        }
    } else if status.is_server_error() {
        TransportError::ServerError(message)
    } else {
        TransportError::Network(message)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<Value>,
}

async fn extract_api_error(status: StatusCode, response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<ApiErrorEnvelope>(&body) {
        let code = parsed
            .error
            .code
            .map(|value| match value {
                Value::String(value) => value,
                other => other.to_string(),
            })
            .unwrap_or_else(|| status.as_u16().to_string());
        let error_type = parsed
            .error
            .type_
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());

        return format!("api error {code} {error_type}: {message}");
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}
