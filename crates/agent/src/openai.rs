//! OpenAI-compatible chat completion client.
//!
//! Works against any server exposing `POST {base}/chat/completions`, which
//! includes OpenAI itself and Ollama's `/v1` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::llm::{Completion, CompletionClient, CompletionRequest, ProviderError};

#[derive(Clone, Debug)]
pub struct OpenAiClientConfig {
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

impl Default for OpenAiClientConfig {
    fn default() -> Self {
        Self { api_key: None, timeout: Duration::from_secs(30) }
    }
}

pub struct OpenAiClient {
    client: Client,
    api_key: Option<SecretString>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl OpenAiClient {
    pub fn new(config: OpenAiClientConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.timeout).build().map_err(|error| {
            ProviderError::Unavailable(format!("failed to build http client: {error}"))
        })?;
        Ok(Self { client, api_key: config.api_key })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let url = format!("{}/chat/completions", request.base_url.trim_end_matches('/'));

        let mut messages = Vec::with_capacity(2);
        if !request.prompt.system_message.is_empty() {
            messages.push(ChatMessage { role: "system", content: &request.prompt.system_message });
        }
        messages.push(ChatMessage { role: "user", content: &request.prompt.prompt });

        let body = ChatCompletionRequest {
            model: &request.model.0,
            messages,
            max_tokens: request.prompt.max_tokens,
            temperature: request.prompt.temperature,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                ProviderError::Unavailable(format!("request to {url} timed out"))
            } else {
                ProviderError::Unavailable(format!("request to {url} failed: {error}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|envelope| envelope.error.message)
                .unwrap_or(text);
            return Err(classify_status(status, message, retry_after));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|error| {
            ProviderError::InvalidResponse(format!("undecodable completion body: {error}"))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("completion contained no text".to_string()));
        }

        // Quota is charged from reported usage.
        let usage = parsed.usage.ok_or_else(|| {
            ProviderError::InvalidResponse("completion did not report token usage".to_string())
        })?;
        let total_tokens = if usage.total_tokens == 0 {
            usage.prompt_tokens.saturating_add(usage.completion_tokens)
        } else {
            usage.total_tokens
        };
        if total_tokens == 0 {
            return Err(ProviderError::InvalidResponse(
                "completion reported zero token usage".to_string(),
            ));
        }

        debug!(
            event_name = "provider.completion.received",
            model = %request.model.0,
            total_tokens,
            "completion received"
        );

        Ok(Completion {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens,
        })
    }
}

fn classify_status(
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { message, retry_after },
        status if status.is_server_error() => {
            ProviderError::Unavailable(format!("{status}: {message}"))
        }
        StatusCode::REQUEST_TIMEOUT => ProviderError::Unavailable(format!("{status}: {message}")),
        status => ProviderError::Rejected { status: status.as_u16(), message },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use noteflow_core::domain::provider::ModelId;
    use noteflow_core::domain::template::RenderedPrompt;

    use super::{OpenAiClient, OpenAiClientConfig};
    use crate::llm::{CompletionClient, CompletionRequest, ProviderError};

    fn request(base_url: String) -> CompletionRequest {
        CompletionRequest {
            base_url,
            model: ModelId("gpt-4o-mini".to_string()),
            prompt: RenderedPrompt {
                template_name: "summarize_default".to_string(),
                system_message: "You summarize notes.".to_string(),
                prompt: "Summarize: the launch moved to May".to_string(),
                max_tokens: 200,
                temperature: 0.3,
            },
        }
    }

    fn client() -> OpenAiClient {
        OpenAiClient::new(OpenAiClientConfig {
            api_key: Some(SecretString::from("sk-test".to_string())),
            timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn successful_completion_returns_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "max_tokens": 200,
                "messages": [
                    { "role": "system", "content": "You summarize notes." },
                    { "role": "user", "content": "Summarize: the launch moved to May" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-1",
                "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Launch is in May." } }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17 }
            })))
            .mount(&server)
            .await;

        let completion = client().complete(&request(server.uri())).await.expect("completion");
        assert_eq!(completion.text, "Launch is in May.");
        assert_eq!(completion.total_tokens, 17);
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "3")
                    .set_body_json(serde_json::json!({
                        "error": { "message": "Rate limit reached", "type": "rate_limit_exceeded" }
                    })),
            )
            .mount(&server)
            .await;

        let error = client().complete(&request(server.uri())).await.expect_err("429");
        assert_eq!(
            error,
            ProviderError::RateLimited {
                message: "Rate limit reached".to_string(),
                retry_after: Some(Duration::from_secs(3)),
            }
        );
    }

    #[tokio::test]
    async fn server_errors_and_auth_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/broken/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/locked/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
            })))
            .mount(&server)
            .await;

        let unavailable = client()
            .complete(&request(format!("{}/broken", server.uri())))
            .await
            .expect_err("503");
        assert!(matches!(unavailable, ProviderError::Unavailable(_)));

        let rejected = client()
            .complete(&request(format!("{}/locked/", server.uri())))
            .await
            .expect_err("401");
        assert!(matches!(rejected, ProviderError::Rejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn completions_without_token_usage_are_invalid_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/no-usage/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-3",
                "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Launch is in May." } }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/zero-usage/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-4",
                "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Launch is in May." } }],
                "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 }
            })))
            .mount(&server)
            .await;

        for prefix in ["no-usage", "zero-usage"] {
            let error = client()
                .complete(&request(format!("{}/{prefix}", server.uri())))
                .await
                .expect_err("usage required");
            assert!(matches!(error, ProviderError::InvalidResponse(_)), "{prefix}: {error}");
        }
    }

    #[tokio::test]
    async fn empty_or_undecodable_bodies_are_invalid_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/empty/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-2",
                "choices": [{ "index": 0, "message": { "role": "assistant", "content": "   " } }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/garbled/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        for prefix in ["empty", "garbled"] {
            let error = client()
                .complete(&request(format!("{}/{prefix}", server.uri())))
                .await
                .expect_err("invalid");
            assert!(matches!(error, ProviderError::InvalidResponse(_)), "{prefix}: {error}");
        }
    }
}
