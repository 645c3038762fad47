//! Client for a local `llama.cpp`-style completion server.
//!
//! The server is stateless over HTTP, so this engine keeps the model context
//! itself: every prompt and reply is appended to it and the whole context is
//! sent with `cache_prompt` enabled, letting the server reuse its KV cache
//! for the unchanged prefix. Replies arrive as server-sent events.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{EngineError, InferenceEngine};
use crate::config::{Config, RetryPolicy, Sampling};
use crate::logging;
use crate::models::Message;
use crate::template::{ChatTemplate, RenderBuffer};

/// Connection and sampling settings for [`LlamaServerEngine`].
#[derive(Debug, Clone)]
pub struct LlamaServerSettings {
    pub base_url: String,
    pub template: ChatTemplate,
    /// Context size in tokens; reaching it ends the session.
    pub context_window: u64,
    pub sampling: Sampling,
    pub retry: RetryPolicy,
}

impl LlamaServerSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.base_url(),
            template: config.template(),
            context_window: config.context_window(),
            sampling: config.sampling(),
            retry: config.retry_policy(),
        }
    }
}

// === LlamaServerEngine ===

#[must_use]
pub struct LlamaServerEngine {
    http_client: reqwest::Client,
    settings: LlamaServerSettings,
    context: String,
}

impl LlamaServerEngine {
    pub fn new(settings: LlamaServerSettings) -> Result<Self, EngineError> {
        let http_client = reqwest::Client::builder().build()?;
        logging::info(format!(
            "Completion server: {} (template {}, context {} tokens)",
            settings.base_url, settings.template, settings.context_window
        ));
        Ok(Self {
            http_client,
            settings,
            context: String::new(),
        })
    }

    /// Text consumed or produced so far in this session.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Probe the server's health endpoint and return its body.
    pub async fn health(&self) -> Result<String, EngineError> {
        let url = format!("{}/health", self.settings.base_url);
        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn request_body(&self) -> Value {
        let sampling = &self.settings.sampling;
        let mut body = json!({
            "prompt": self.context,
            "stream": true,
            "cache_prompt": true,
            "n_predict": sampling.n_predict,
            "temperature": sampling.temperature,
            "min_p": sampling.min_p,
        });
        if let Some(seed) = sampling.seed {
            body["seed"] = json!(seed);
        }
        body
    }

    fn check_final(&self, chunk: &CompletionChunk) -> Result<(), EngineError> {
        if chunk.truncated {
            return Err(EngineError::ContextExhausted(
                "server truncated the prompt to fit its context".to_string(),
            ));
        }
        let used = chunk.tokens_evaluated.unwrap_or(0) + chunk.tokens_predicted.unwrap_or(0);
        if used >= self.settings.context_window {
            return Err(EngineError::ContextExhausted(format!(
                "{used} of {} tokens used",
                self.settings.context_window
            )));
        }
        if chunk.stop_type.as_deref() == Some("limit") && self.settings.sampling.n_predict < 0 {
            return Err(EngineError::ContextExhausted(
                "generation stopped at the server's context limit".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceEngine for LlamaServerEngine {
    fn name(&self) -> &str {
        "llama-server"
    }

    fn render_template(
        &self,
        messages: &[Message],
        add_assistant: bool,
        out: &mut RenderBuffer,
    ) -> Result<usize, EngineError> {
        Ok(self.settings.template.render(messages, add_assistant, out))
    }

    async fn generate(
        &mut self,
        prompt: &str,
        on_piece: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, EngineError> {
        self.context.push_str(prompt);
        let body = self.request_body();
        let url = format!("{}/completion", self.settings.base_url);

        let response =
            send_with_retry(&self.settings.retry, || self.http_client.post(&url).json(&body)).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if looks_like_context_overflow(&body) {
                return Err(EngineError::ContextExhausted(body));
            }
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut reply = String::new();
        let mut decoder = SseDecoder::default();
        let mut byte_stream = std::pin::pin!(response.bytes_stream());
        let mut finished = false;

        'stream: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            for data in decoder.push(&chunk) {
                if data.trim() == "[DONE]" {
                    continue;
                }
                let event: CompletionChunk = serde_json::from_str(&data)
                    .map_err(|err| EngineError::Protocol(format!("bad event `{data}`: {err}")))?;
                if let Some(error) = event.error.as_ref() {
                    return Err(EngineError::Protocol(error.to_string()));
                }
                if !event.content.is_empty() {
                    on_piece(&event.content);
                    reply.push_str(&event.content);
                }
                if event.stop {
                    self.check_final(&event)?;
                    finished = true;
                    break 'stream;
                }
            }
        }

        if !finished {
            return Err(EngineError::Protocol(
                "stream ended before the server finished the reply".to_string(),
            ));
        }

        self.context.push_str(&reply);
        self.context.push_str(self.settings.template.turn_suffix());
        Ok(reply)
    }
}

// === Streaming ===

/// One server-sent event from `/completion`.
#[derive(Debug, Default, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    truncated: bool,
    tokens_evaluated: Option<u64>,
    tokens_predicted: Option<u64>,
    stop_type: Option<String>,
    error: Option<Value>,
}

/// Splits a byte stream into `data:` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            // Other SSE fields (event:, id:, retry:) carry nothing we use.
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

fn looks_like_context_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context") && (lower.contains("exceed") || lower.contains("too long"))
}

async fn send_with_retry<F>(policy: &RetryPolicy, mut build: F) -> Result<reqwest::Response, EngineError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if status.is_success() || !retryable || !policy.enabled || attempt >= policy.max_retries {
                    return Ok(response);
                }
                logging::warn(format!(
                    "Retryable HTTP {} (attempt {} of {})",
                    status.as_u16(),
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
            Err(err) => {
                if !policy.enabled || attempt >= policy.max_retries {
                    return Err(err.into());
                }
                logging::warn(format!(
                    "Request error: {} (attempt {} of {})",
                    err,
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: String) -> LlamaServerSettings {
        LlamaServerSettings {
            base_url,
            template: ChatTemplate::ChatMl,
            context_window: 4096,
            sampling: Sampling {
                seed: Some(42),
                ..Sampling::default()
            },
            retry: RetryPolicy {
                enabled: false,
                ..RetryPolicy::default()
            },
        }
    }

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|event| format!("data: {event}\n\n"))
            .collect()
    }

    async fn mount_stream(server: &MockServer, events: &[Value]) {
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(events), "text/event-stream"))
            .mount(server)
            .await;
    }

    #[test]
    fn decoder_handles_split_lines_and_ignores_other_fields() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: x\ndata: {\"con").is_empty());
        let payloads = decoder.push(b"tent\":\"a\"}\r\n\ndata:[DONE]\n");
        assert_eq!(payloads, vec![r#"{"content":"a"}"#.to_string(), "[DONE]".to_string()]);
    }

    #[tokio::test]
    async fn streams_pieces_and_keeps_context() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            &[
                json!({"content": "Hel", "stop": false}),
                json!({"content": "lo", "stop": false}),
                json!({"content": "", "stop": true, "tokens_evaluated": 10, "tokens_predicted": 2, "stop_type": "eos"}),
            ],
        )
        .await;

        let mut engine = LlamaServerEngine::new(settings(server.uri())).expect("engine");
        let mut pieces = Vec::new();
        let reply = engine
            .generate("<|im_start|>user\nhi<|im_end|>\n", &mut |piece: &str| {
                pieces.push(piece.to_string());
            })
            .await
            .expect("generate");

        assert_eq!(reply, "Hello");
        assert_eq!(pieces, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(
            engine.context(),
            "<|im_start|>user\nhi<|im_end|>\nHello<|im_end|>\n"
        );

        engine
            .generate("more", &mut |_: &str| {})
            .await
            .expect("second turn");
        let requests = server.received_requests().await.expect("recorded");
        assert_eq!(requests.len(), 2);
        let second: Value = requests[1].body_json().expect("json body");
        assert_eq!(
            second["prompt"],
            json!("<|im_start|>user\nhi<|im_end|>\nHello<|im_end|>\nmore")
        );
        assert_eq!(second["stream"], json!(true));
        assert_eq!(second["cache_prompt"], json!(true));
        assert_eq!(second["seed"], json!(42));
    }

    #[tokio::test]
    async fn truncated_prompt_is_context_exhaustion() {
        let server = MockServer::start().await;
        mount_stream(&server, &[json!({"content": "", "stop": true, "truncated": true})]).await;

        let mut engine = LlamaServerEngine::new(settings(server.uri())).expect("engine");
        let err = engine.generate("x", &mut |_: &str| {}).await.expect_err("exhausted");
        assert!(matches!(err, EngineError::ContextExhausted(_)));
    }

    #[tokio::test]
    async fn token_usage_at_window_is_context_exhaustion() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            &[json!({"content": "", "stop": true, "tokens_evaluated": 4000, "tokens_predicted": 96})],
        )
        .await;

        let mut engine = LlamaServerEngine::new(settings(server.uri())).expect("engine");
        let err = engine.generate("x", &mut |_: &str| {}).await.expect_err("exhausted");
        assert!(matches!(err, EngineError::ContextExhausted(_)));
    }

    #[tokio::test]
    async fn http_error_is_reported_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let mut engine = LlamaServerEngine::new(settings(server.uri())).expect("engine");
        let err = engine.generate("x", &mut |_: &str| {}).await.expect_err("status");
        match err {
            EngineError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stream_without_stop_is_a_protocol_error() {
        let server = MockServer::start().await;
        mount_stream(&server, &[json!({"content": "partial", "stop": false})]).await;

        let mut engine = LlamaServerEngine::new(settings(server.uri())).expect("engine");
        let err = engine.generate("x", &mut |_: &str| {}).await.expect_err("protocol");
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn health_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"ok"}"#))
            .mount(&server)
            .await;

        let engine = LlamaServerEngine::new(settings(server.uri())).expect("engine");
        assert_eq!(engine.health().await.expect("health"), r#"{"status":"ok"}"#);
    }
}
