//! Protocol proxy between the Anthropic Messages API and OpenAI-compatible
//! chat-completions backends.
//!
//! - [`translate`]: request and non-streaming response translation
//! - [`stream`]: the streaming translation state machine
//! - [`client`]: the upstream HTTP client
//!
//! The proxy never retries. Upstream failures are returned as
//! Anthropic-format error envelopes.

pub mod anthropic;
pub mod client;
pub mod error;
pub mod openai;
pub mod stream;
pub mod translate;

pub use anthropic::{ErrorBody, MessagesRequest, MessagesResponse, StreamEvent};
pub use client::{EventStream, ProxyClient, UpstreamConfig};
pub use error::{ProxyError, ProxyResult};
pub use stream::StreamTranslator;
pub use translate::{translate_request, translate_response};
