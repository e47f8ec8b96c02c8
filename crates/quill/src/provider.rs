//! Model client: a thin streaming wrapper around a local Ollama endpoint.
//!
//! The provider is stateless; conversation history travels with every
//! request. Responses arrive as NDJSON and are surfaced as a unified
//! [`StreamChunk`] stream so the session and intent layers never see the
//! wire format.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::Stream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use url::Url;

pub const OLLAMA_DEFAULT_PORT: u16 = 11434;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Stream decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Network(err.to_string())
    }
}

/// Connection parameters for the model backend.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub host: String,
    pub model: String,
    pub timeout: Duration,
}

/// A single message on the wire, in Ollama `/api/chat` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "assistant".to_string(),
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn tool(name: &str, content: impl Into<String>) -> Self {
        ChatMessage {
            role: "tool".to_string(),
            content: content.into(),
            tool_name: Some(name.to_string()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// A chunk from a streaming completion - the unified type all consumers see.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// One content token. Reasoning sentinels arrive as ordinary tokens.
    Token(String),
    /// The model asked for a tool to be executed.
    ToolCall(ToolInvocation),
    /// Terminal marker for the reply.
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stream one completion for the given history against the given tool set.
    async fn stream_chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChunkStream, ProviderError>;

    /// Cheap probe that the backend is up, used before a turn starts.
    async fn check_reachable(&self) -> Result<(), ProviderError>;
}

pub struct OllamaProvider {
    client: Client,
    host: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(config: &ModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(OllamaProvider {
            client,
            host: config.host.clone(),
            model: config.model.clone(),
        })
    }

    /// Get the base URL for Ollama API calls.
    fn base_url(&self) -> Result<Url, ProviderError> {
        // The host is sometimes just 'host' or 'host:port' without a scheme
        let base = if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("http://{}", self.host)
        };

        let mut base_url = Url::parse(&base)
            .map_err(|e| ProviderError::RequestFailed(format!("Invalid base URL: {e}")))?;

        let explicit_default_port = self.host.ends_with(":80") || self.host.ends_with(":443");
        if base_url.port().is_none() && !explicit_default_port {
            base_url.set_port(Some(OLLAMA_DEFAULT_PORT)).map_err(|_| {
                ProviderError::RequestFailed("Failed to set default port".to_string())
            })?;
        }

        Ok(base_url)
    }

    fn chat_url(&self) -> Result<Url, ProviderError> {
        self.base_url()?.join("api/chat").map_err(|e| {
            ProviderError::RequestFailed(format!("Failed to construct endpoint URL: {e}"))
        })
    }
}

fn tool_payload(tool: &Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description.as_deref().unwrap_or(""),
            "parameters": tool.schema_as_json_value(),
        }
    })
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallEnvelope>,
}

#[derive(Debug, Deserialize)]
struct ToolCallEnvelope {
    function: ToolInvocation,
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    #[tracing::instrument(skip(self, system, messages, tools), fields(model = %self.model))]
    async fn stream_chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChunkStream, ProviderError> {
        let url = self.chat_url()?;

        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(ChatMessage::system(system));
        wire.extend_from_slice(messages);

        let mut payload = json!({
            "model": self.model,
            "messages": wire,
            "stream": true,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(tool_payload).collect());
        }

        let response = self.client.post(url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(format!(
                "status {status}: {body}"
            )));
        }

        let bytes = response.bytes_stream().map_err(io::Error::other);

        Ok(Box::pin(try_stream! {
            let reader = StreamReader::new(bytes);
            let mut lines = FramedRead::new(reader, LinesCodec::new());

            while let Some(line) = lines.next().await {
                let line = line.map_err(|e| ProviderError::Decode(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                let chunk: ChatChunk = serde_json::from_str(&line)
                    .map_err(|e| ProviderError::Decode(format!("bad chunk: {e}")))?;

                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        yield StreamChunk::Token(message.content);
                    }
                    for call in message.tool_calls {
                        yield StreamChunk::ToolCall(call.function);
                    }
                }
                if chunk.done {
                    yield StreamChunk::Done;
                    break;
                }
            }
        }))
    }

    async fn check_reachable(&self) -> Result<(), ProviderError> {
        let url = self.base_url()?.join("api/tags").map_err(|e| {
            ProviderError::RequestFailed(format!("Failed to construct endpoint URL: {e}"))
        })?;
        self.client.get(url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Scripted provider for tests: replays canned chunk sequences and records
/// every request it sees.
pub mod fixture {
    use std::collections::VecDeque;

    use futures::stream;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub system: String,
        pub messages: Vec<ChatMessage>,
        pub tool_names: Vec<String>,
    }

    pub struct Script {
        chunks: Vec<Result<StreamChunk, ProviderError>>,
        /// Keep the stream open after the scripted chunks, so a test can
        /// cancel a turn mid-flight.
        hang_after: bool,
    }

    impl Script {
        pub fn chunks(chunks: Vec<Result<StreamChunk, ProviderError>>) -> Self {
            Script {
                chunks,
                hang_after: false,
            }
        }

        pub fn tokens(tokens: &[&str]) -> Self {
            let mut chunks: Vec<Result<StreamChunk, ProviderError>> = tokens
                .iter()
                .map(|t| Ok(StreamChunk::Token(t.to_string())))
                .collect();
            chunks.push(Ok(StreamChunk::Done));
            Script::chunks(chunks)
        }

        pub fn hanging(tokens: &[&str]) -> Self {
            let chunks = tokens
                .iter()
                .map(|t| Ok(StreamChunk::Token(t.to_string())))
                .collect();
            Script {
                chunks,
                hang_after: true,
            }
        }
    }

    #[derive(Default)]
    pub struct ScriptedProvider {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<RecordedRequest>>,
        unreachable: bool,
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn unreachable() -> Self {
            ScriptedProvider {
                unreachable: true,
                ..Self::default()
            }
        }

        pub fn push_script(&self, script: Script) {
            self.scripts.lock().push_back(script);
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn stream_chat(
            &self,
            system: &str,
            messages: &[ChatMessage],
            tools: &[Tool],
        ) -> Result<ChunkStream, ProviderError> {
            self.requests.lock().push(RecordedRequest {
                system: system.to_string(),
                messages: messages.to_vec(),
                tool_names: tools.iter().map(|t| t.name.to_string()).collect(),
            });

            let script = self
                .scripts
                .lock()
                .pop_front()
                .ok_or_else(|| ProviderError::RequestFailed("no scripted response".to_string()))?;

            let head = stream::iter(script.chunks);
            if script.hang_after {
                Ok(Box::pin(head.chain(stream::pending())))
            } else {
                Ok(Box::pin(head))
            }
        }

        async fn check_reachable(&self) -> Result<(), ProviderError> {
            if self.unreachable {
                Err(ProviderError::Network("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }
}
