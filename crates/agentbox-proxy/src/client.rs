//! Upstream client: sends translated requests to an OpenAI-compatible API.

use crate::anthropic::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::error::{ProxyError, ProxyResult};
use crate::openai::ChatResponse;
use crate::stream::{parse_line, StreamTranslator, UpstreamLine};
use crate::translate::{translate_request, translate_response};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upstream endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model sent upstream instead of the client's.
    pub model: Option<String>,
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: None,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Stream of translated Anthropic events.
pub type EventStream = BoxStream<'static, StreamEvent>;

pub struct ProxyClient {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl ProxyClient {
    pub fn new(config: UpstreamConfig) -> ProxyResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|_| ProxyError::invalid_request("upstream API key is not a valid header"))?,
            );
        }

        let client = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn send(&self, request: &MessagesRequest) -> ProxyResult<reqwest::Response> {
        if request.messages.is_empty() {
            return Err(ProxyError::invalid_request("`messages` must not be empty"));
        }
        let body = translate_request(request, self.config.model.as_deref());
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            stream = body.stream,
            "Sending upstream request"
        );

        let response = self
            .client
            .post(self.config.completions_url())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %text, "Upstream API error");
            let reason = status.canonical_reason().unwrap_or("error");
            let message = if text.is_empty() {
                reason.to_string()
            } else {
                format!("{}: {}", reason, text)
            };
            return Err(ProxyError::upstream(status.as_u16(), message));
        }
        Ok(response)
    }

    /// Non-streaming round trip.
    pub async fn complete(&self, request: &MessagesRequest) -> ProxyResult<MessagesResponse> {
        let response = self.send(request).await?;
        let body = response.text().await?;
        let chat: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProxyError::invalid_response(e.to_string()))?;
        let message = translate_response(chat, &request.model);
        info!(
            stop_reason = ?message.stop_reason,
            output_tokens = message.usage.output_tokens,
            "Upstream completion translated"
        );
        Ok(message)
    }

    /// Streaming round trip.
    ///
    /// Errors before the upstream starts streaming are returned directly.
    /// Afterwards every failure becomes an `error` event and the stream still
    /// ends with `message_stop`. Cancelling `cancel`, or dropping the stream,
    /// aborts the upstream read.
    pub async fn stream(
        &self,
        request: &MessagesRequest,
        cancel: CancellationToken,
    ) -> ProxyResult<EventStream> {
        let response = self.send(request).await?;
        Ok(translate_stream(response, request.model.clone(), cancel))
    }
}

fn translate_stream(
    response: reqwest::Response,
    model: String,
    cancel: CancellationToken,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let reader = StreamReader::new(
            response
                .bytes_stream()
                .map(|r| r.map_err(std::io::Error::other)),
        );
        let mut lines = reader.lines();
        let mut translator = StreamTranslator::new(model);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Downstream cancelled, aborting upstream stream");
                    return;
                }
                next = lines.next_line() => next,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    for event in translator.on_end() {
                        yield event;
                    }
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Upstream stream failed");
                    for event in translator.on_error(format!("upstream stream failed: {}", e)) {
                        yield event;
                    }
                    break;
                }
            };

            match parse_line(&line) {
                Ok(None) => {}
                Ok(Some(UpstreamLine::Chunk(chunk))) => {
                    for event in translator.on_chunk(chunk) {
                        yield event;
                    }
                }
                Ok(Some(UpstreamLine::Done)) => {
                    for event in translator.on_done() {
                        yield event;
                    }
                    break;
                }
                Err(e) => {
                    warn!(error = %e, line = %line, "Untranslatable upstream chunk");
                    for event in translator.on_error(format!("invalid upstream chunk: {}", e)) {
                        yield event;
                    }
                    break;
                }
            }
        }
    })
}
