//! The visible chat turn: one user prompt driven to completion.
//!
//! A turn is a stream of [`SessionEvent`]s. The model reply streams into
//! the last conversation message token by token; when the model requests
//! tools, each call is executed and its result fed back, and the model is
//! asked again until a reply arrives with no pending calls. Cancellation
//! is checked at every await point and rolls the partial reply back out of
//! the transcript.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use rmcp::model::Tool;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::conversation::{Conversation, Message};
use crate::provider::{ChatMessage, ChatProvider, StreamChunk, ToolInvocation};
use crate::registry::ToolCatalog;

/// Sentinels some local models emit around reasoning segments.
pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Shown in the transcript when the model backend drops mid-turn.
pub const TRANSPORT_ERROR: &str = "Error connecting to the AI service - please try again.";

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The transcript changed; re-render the last message.
    MessageUpdated,
    /// A tool call is about to run.
    ToolCall {
        name: String,
        arguments: Map<String, Value>,
    },
    /// A tool call finished; `result` is the flattened server reply.
    ToolResult {
        name: String,
        arguments: Map<String, Value>,
        result: String,
    },
    /// The turn is over, successfully or not.
    Completed,
}

pub struct ChatSession {
    provider: Arc<dyn ChatProvider>,
    catalog: Arc<dyn ToolCatalog>,
    conversation: Arc<parking_lot::Mutex<Conversation>>,
    pacing: Option<Duration>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

/// Fold one token into the reply being built. Returns whether the
/// transcript visibly changed.
fn apply_token(message: &mut Message, token: &str) -> bool {
    message.loading = false;
    if token == THINK_OPEN {
        message.reasoning = true;
        return true;
    }
    if token == THINK_CLOSE {
        message.reasoning = false;
        return true;
    }
    if message.reasoning {
        return false;
    }
    // Models tend to open with blank lines; drop them until real content.
    if message.content.is_empty() && token.trim().is_empty() {
        return false;
    }
    message.content.push_str(token);
    true
}

impl ChatSession {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        catalog: Arc<dyn ToolCatalog>,
        conversation: Arc<parking_lot::Mutex<Conversation>>,
        pacing: Option<Duration>,
    ) -> Self {
        ChatSession {
            provider,
            catalog,
            conversation,
            pacing,
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn conversation(&self) -> Arc<parking_lot::Mutex<Conversation>> {
        Arc::clone(&self.conversation)
    }

    /// Abort the in-flight turn, if any.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Drive one turn. The caller has already pushed the user's message;
    /// `outgoing` is the wire form of that prompt, which may carry extra
    /// context the transcript does not show.
    pub fn send(&self, outgoing: String, tools: Vec<Tool>) -> BoxStream<'_, SessionEvent> {
        let token = {
            let mut guard = self.cancel.lock();
            let fresh = CancellationToken::new();
            *guard = fresh.clone();
            fresh
        };

        Box::pin(stream! {
            let (preamble, mut wire) = {
                let mut conversation = self.conversation.lock();
                let preamble = conversation.preamble().to_string();
                let mut wire: Vec<ChatMessage> = conversation
                    .messages()
                    .iter()
                    .filter_map(Message::to_wire)
                    .collect();
                if let Some(last) = wire.last_mut() {
                    if last.role == "user" {
                        last.content = outgoing.clone();
                    }
                }
                conversation.push(Message::assistant());
                (preamble, wire)
            };
            yield SessionEvent::MessageUpdated;

            let mut cancelled = false;
            let mut failed = false;

            'turn: loop {
                let started = tokio::select! {
                    result = self.provider.stream_chat(&preamble, &wire, &tools) => result,
                    _ = token.cancelled() => { cancelled = true; break 'turn; }
                };
                let mut chunks = match started {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        error!("model request failed: {e}");
                        failed = true;
                        break 'turn;
                    }
                };

                let mut pending: Vec<ToolInvocation> = Vec::new();
                loop {
                    let next = tokio::select! {
                        chunk = chunks.next() => chunk,
                        _ = token.cancelled() => { cancelled = true; break 'turn; }
                    };
                    let Some(chunk) = next else { break };
                    match chunk {
                        Ok(StreamChunk::Token(text)) => {
                            let changed = {
                                let mut conversation = self.conversation.lock();
                                match conversation.last_mut() {
                                    Some(message) => apply_token(message, &text),
                                    None => false,
                                }
                            };
                            if changed {
                                yield SessionEvent::MessageUpdated;
                                if let Some(pacing) = self.pacing {
                                    tokio::time::sleep(pacing).await;
                                }
                            }
                        }
                        Ok(StreamChunk::ToolCall(call)) => pending.push(call),
                        Ok(StreamChunk::Done) => break,
                        Err(e) => {
                            error!("model stream failed: {e}");
                            failed = true;
                            break 'turn;
                        }
                    }
                }

                if pending.is_empty() {
                    break 'turn;
                }

                // The reply so far goes on the wire before the tool results
                // so the next round sees its own words.
                let content_so_far = {
                    let conversation = self.conversation.lock();
                    conversation
                        .messages()
                        .last()
                        .map(|m| m.content.clone())
                        .unwrap_or_default()
                };
                wire.push(ChatMessage::assistant(content_so_far));

                for call in pending {
                    {
                        let mut conversation = self.conversation.lock();
                        if let Some(message) = conversation.last_mut() {
                            message.tool_calls.push(call.name.clone());
                        }
                    }
                    yield SessionEvent::ToolCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    };

                    let result = tokio::select! {
                        result = self.catalog.call_tool(&call.name, call.arguments.clone()) => {
                            match result {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!(tool = %call.name, "tool call failed: {e}");
                                    format!("Error: {e}")
                                }
                            }
                        }
                        _ = token.cancelled() => { cancelled = true; break 'turn; }
                    };

                    yield SessionEvent::ToolResult {
                        name: call.name.clone(),
                        arguments: call.arguments,
                        result: result.clone(),
                    };
                    wire.push(ChatMessage::tool(&call.name, result));
                }
            }

            {
                let mut conversation = self.conversation.lock();
                if cancelled {
                    // Roll the partial reply out; the user's prompt stays.
                    conversation.remove_last();
                } else {
                    if let Some(message) = conversation.last_mut() {
                        message.loading = false;
                        message.reasoning = false;
                        if failed && message.content.is_empty() {
                            conversation.remove_last();
                        }
                    }
                    if failed {
                        conversation.push(Message::error(TRANSPORT_ERROR));
                    }
                }
            }
            yield SessionEvent::MessageUpdated;
            yield SessionEvent::Completed;
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::conversation::Role;
    use crate::provider::fixture::{Script, ScriptedProvider};
    use crate::provider::ProviderError;
    use crate::registry::fixture::StaticCatalog;

    fn tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            format!("{name} tool"),
            Arc::new(json!({"type": "object"}).as_object().unwrap().clone()),
        )
    }

    fn session_with(
        provider: Arc<ScriptedProvider>,
        catalog: StaticCatalog,
        prompt: &str,
    ) -> ChatSession {
        let mut conversation = Conversation::new("preamble".to_string());
        conversation.push(Message::user(prompt));
        ChatSession::new(
            provider,
            Arc::new(catalog),
            Arc::new(parking_lot::Mutex::new(conversation)),
            None,
        )
    }

    async fn drain(session: &ChatSession, outgoing: &str, tools: Vec<Tool>) -> Vec<SessionEvent> {
        session.send(outgoing.to_string(), tools).collect().await
    }

    #[tokio::test]
    async fn reasoning_segments_are_suppressed() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::tokens(&[
            THINK_OPEN,
            "secret plan",
            THINK_CLOSE,
            "Hello!",
        ]));
        let session = session_with(provider, StaticCatalog::not_loaded(), "hi");

        let events = drain(&session, "hi", vec![]).await;
        assert!(matches!(events.last(), Some(SessionEvent::Completed)));

        let conversation = session.conversation();
        let conversation = conversation.lock();
        let reply = conversation.messages().last().unwrap();
        assert_eq!(reply.content, "Hello!");
        assert!(!reply.reasoning);
        assert!(!reply.loading);
    }

    #[tokio::test]
    async fn leading_whitespace_is_dropped_but_inner_kept() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::tokens(&["\n", "  ", "Hi", " there", "\n", "!"]));
        let session = session_with(provider, StaticCatalog::not_loaded(), "hi");

        drain(&session, "hi", vec![]).await;

        let conversation = session.conversation();
        let conversation = conversation.lock();
        assert_eq!(conversation.messages().last().unwrap().content, "Hi there\n!");
    }

    #[tokio::test]
    async fn outgoing_prompt_replaces_raw_prompt_on_the_wire() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::tokens(&["ok"]));
        let session = session_with(provider.clone(), StaticCatalog::not_loaded(), "raw prompt");

        drain(&session, "raw prompt. Current documents: memo.odt.", vec![]).await;

        let requests = provider.requests();
        let last = requests[0].messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert!(last.content.ends_with("Current documents: memo.odt."));
        // The transcript keeps what the user actually typed.
        let conversation = session.conversation();
        let conversation = conversation.lock();
        assert_eq!(conversation.messages()[0].content, "raw prompt");
    }

    #[tokio::test]
    async fn transport_error_becomes_a_chat_message() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::chunks(vec![Err(ProviderError::Network(
            "connection reset".to_string(),
        ))]));
        let session = session_with(provider, StaticCatalog::not_loaded(), "hi");

        let events = drain(&session, "hi", vec![]).await;
        assert!(matches!(events.last(), Some(SessionEvent::Completed)));

        let conversation = session.conversation();
        let conversation = conversation.lock();
        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Error);
        assert_eq!(messages[1].content, TRANSPORT_ERROR);
    }

    #[tokio::test]
    async fn cancel_removes_the_partial_reply() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::hanging(&["Partial"]));
        let session = session_with(provider, StaticCatalog::not_loaded(), "hi");

        let mut stream = session.send("hi".to_string(), vec![]);
        // Placeholder update, then the first token.
        while let Some(event) = stream.next().await {
            let has_content = {
                let conversation = session.conversation();
                let conversation = conversation.lock();
                conversation
                    .messages()
                    .last()
                    .is_some_and(|m| m.content == "Partial")
            };
            if matches!(event, SessionEvent::MessageUpdated) && has_content {
                break;
            }
        }
        session.cancel();
        while let Some(event) = stream.next().await {
            if matches!(event, SessionEvent::Completed) {
                break;
            }
        }
        drop(stream);

        let conversation = session.conversation();
        let conversation = conversation.lock();
        let messages = conversation.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn tool_round_feeds_results_back_to_the_model() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::chunks(vec![
            Ok(StreamChunk::Token("On it.".to_string())),
            Ok(StreamChunk::ToolCall(ToolInvocation {
                name: "create_blank_document".to_string(),
                arguments: json!({"filename": "notes"}).as_object().unwrap().clone(),
            })),
            Ok(StreamChunk::Done),
        ]));
        provider.push_script(Script::tokens(&[" Created notes.odt."]));
        let catalog = StaticCatalog::loaded(vec![tool("create_blank_document")])
            .with_result("create_blank_document", "created /docs/notes.odt");
        let session = session_with(provider.clone(), catalog, "make notes");

        let events = drain(&session, "make notes", vec![tool("create_blank_document")]).await;

        let mut saw_call = false;
        let mut saw_result = false;
        for event in &events {
            match event {
                SessionEvent::ToolCall { name, .. } => {
                    assert_eq!(name, "create_blank_document");
                    saw_call = true;
                    assert!(!saw_result);
                }
                SessionEvent::ToolResult { result, .. } => {
                    assert_eq!(result, "created /docs/notes.odt");
                    saw_result = true;
                }
                _ => {}
            }
        }
        assert!(saw_call && saw_result);

        // Second round saw the reply so far and the tool result.
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let roles: Vec<_> = requests[1].messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool"]);
        assert_eq!(
            requests[1].messages[2].tool_name.as_deref(),
            Some("create_blank_document")
        );

        let conversation = session.conversation();
        let conversation = conversation.lock();
        let reply = conversation.messages().last().unwrap();
        assert_eq!(reply.content, "On it. Created notes.odt.");
        assert_eq!(reply.tool_calls, vec!["create_blank_document".to_string()]);
    }

    #[tokio::test]
    async fn failing_tool_reports_error_text_to_the_model() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::chunks(vec![
            Ok(StreamChunk::ToolCall(ToolInvocation {
                name: "insert_text".to_string(),
                arguments: Map::new(),
            })),
            Ok(StreamChunk::Done),
        ]));
        provider.push_script(Script::tokens(&["That failed."]));
        let catalog =
            StaticCatalog::loaded(vec![tool("insert_text")]).with_failure("insert_text");
        let session = session_with(provider.clone(), catalog, "add text");

        drain(&session, "add text", vec![tool("insert_text")]).await;

        let requests = provider.requests();
        let tool_message = requests[1]
            .messages
            .iter()
            .find(|m| m.role == "tool")
            .unwrap();
        assert!(tool_message.content.starts_with("Error:"));
    }
}
