//! Hidden tool-intent pass.
//!
//! Before each visible turn, the user's prompt is sent through a separate
//! conversation that asks the model which tools the request would need.
//! Tool names mentioned in the reply are accumulated across the chat, so
//! the visible turn is bound only to the tools that have mattered so far
//! instead of the whole catalog.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use rmcp::model::Tool;
use tracing::debug;

use crate::config::Settings;
use crate::error::Result;
use crate::preamble::intent_preamble;
use crate::provider::{ChatMessage, ChatProvider, StreamChunk};
use crate::registry::ToolCatalog;
use crate::session::{THINK_CLOSE, THINK_OPEN};

pub struct IntentResolver {
    provider: Arc<dyn ChatProvider>,
    catalog: Arc<dyn ToolCatalog>,
    settings: Settings,
    /// Transcript of the hidden conversation, in wire form.
    hidden: tokio::sync::Mutex<Vec<ChatMessage>>,
    /// Tools the chat has needed so far, keyed by name.
    needed: parking_lot::Mutex<HashMap<String, Tool>>,
}

impl IntentResolver {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        catalog: Arc<dyn ToolCatalog>,
        settings: Settings,
    ) -> Self {
        IntentResolver {
            provider,
            catalog,
            settings,
            hidden: tokio::sync::Mutex::new(Vec::new()),
            needed: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the tools the chat needs after this prompt. Returns the full
    /// accumulated set, sorted by name. Empty while discovery has not
    /// finished, so a turn can still run untooled.
    pub async fn resolve_needed_tools(&self, prompt: &str) -> Result<Vec<Tool>> {
        if !self.catalog.is_loaded() {
            return Ok(Vec::new());
        }
        let available = self.catalog.tools().await;
        let system = intent_preamble(&self.settings, &available);

        let mut hidden = self.hidden.lock().await;
        hidden.push(ChatMessage::user(prompt));

        // The intent pass itself never gets tools bound.
        let mut chunks = self.provider.stream_chat(&system, &hidden, &[]).await?;

        let mut reply = String::new();
        let mut thinking = false;
        while let Some(chunk) = chunks.next().await {
            match chunk? {
                StreamChunk::Token(token) => {
                    if token == THINK_OPEN {
                        thinking = true;
                        continue;
                    }
                    if token == THINK_CLOSE {
                        thinking = false;
                        continue;
                    }
                    if !thinking {
                        reply.push_str(&token);
                    }
                }
                StreamChunk::ToolCall(_) | StreamChunk::Done => {}
            }
        }
        hidden.push(ChatMessage::assistant(reply.clone()));
        drop(hidden);

        let mut needed = self.needed.lock();
        for tool in available {
            if reply.contains(tool.name.as_ref()) {
                needed.entry(tool.name.to_string()).or_insert(tool);
            }
        }
        debug!(needed = needed.len(), "tool intent resolved");

        let mut tools: Vec<Tool> = needed.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    /// Forget the hidden transcript and the accumulated tool set.
    pub async fn reset(&self) {
        self.hidden.lock().await.clear();
        self.needed.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::provider::fixture::{Script, ScriptedProvider};
    use crate::registry::fixture::StaticCatalog;

    fn tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            format!("{name} tool"),
            Arc::new(json!({"type": "object"}).as_object().unwrap().clone()),
        )
    }

    fn resolver(provider: ScriptedProvider, catalog: StaticCatalog) -> IntentResolver {
        IntentResolver::new(Arc::new(provider), Arc::new(catalog), Settings::default())
    }

    #[tokio::test]
    async fn skips_resolution_until_tools_are_loaded() {
        let provider = ScriptedProvider::new();
        let resolver = resolver(provider, StaticCatalog::not_loaded());
        let tools = resolver.resolve_needed_tools("make a report").await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn matches_tool_names_and_ignores_reasoning() {
        let provider = ScriptedProvider::new();
        provider.push_script(Script::tokens(&[
            THINK_OPEN,
            "maybe insert_text?",
            THINK_CLOSE,
            "You need create_blank_document here.",
        ]));
        let catalog =
            StaticCatalog::loaded(vec![tool("create_blank_document"), tool("insert_text")]);
        let resolver = resolver(provider, catalog);

        let tools = resolver.resolve_needed_tools("make a report").await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["create_blank_document"]);
    }

    #[tokio::test]
    async fn needed_tools_accumulate_across_prompts() {
        let provider = ScriptedProvider::new();
        provider.push_script(Script::tokens(&["use create_blank_document"]));
        provider.push_script(Script::tokens(&["now insert_text"]));
        let catalog =
            StaticCatalog::loaded(vec![tool("create_blank_document"), tool("insert_text")]);
        let resolver = resolver(provider, catalog);

        resolver.resolve_needed_tools("make a report").await.unwrap();
        let tools = resolver.resolve_needed_tools("add a heading").await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["create_blank_document", "insert_text"]);
    }

    #[tokio::test]
    async fn hidden_pass_sends_no_tools_and_resets_cleanly() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::tokens(&["create_blank_document"]));
        let catalog = StaticCatalog::loaded(vec![tool("create_blank_document")]);
        let resolver = IntentResolver::new(
            provider.clone(),
            Arc::new(catalog),
            Settings::default(),
        );

        resolver.resolve_needed_tools("make a report").await.unwrap();
        let requests = provider.requests();
        assert!(requests[0].tool_names.is_empty());
        assert!(requests[0].system.contains("create_blank_document"));

        resolver.reset().await;
        let tools = resolver.needed.lock().len();
        assert_eq!(tools, 0);
        assert!(resolver.hidden.try_lock().unwrap().is_empty());
    }
}
