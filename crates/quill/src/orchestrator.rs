//! Top-level engine: gates sending, runs the hidden intent pass, augments
//! the outgoing prompt with document context, and forwards turn events
//! while keeping the document registry in sync with tool activity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{error, warn};

use crate::config::Settings;
use crate::conversation::{Conversation, Message};
use crate::documents::DocumentStore;
use crate::intent::IntentResolver;
use crate::preamble::system_preamble;
use crate::provider::ChatProvider;
use crate::registry::ToolCatalog;
use crate::session::{ChatSession, SessionEvent, TRANSPORT_ERROR};

/// Shown when the model backend does not answer the pre-turn probe.
pub const SERVICE_UNAVAILABLE: &str =
    "Could not find the AI service. Please check that it is running.";

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ChatProvider>,
    catalog: Arc<dyn ToolCatalog>,
    intent: IntentResolver,
    session: ChatSession,
    documents: Arc<parking_lot::Mutex<DocumentStore>>,
    settings: Settings,
    busy: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        catalog: Arc<dyn ToolCatalog>,
        settings: Settings,
    ) -> Self {
        let documents = Arc::new(parking_lot::Mutex::new(DocumentStore::new(&settings)));
        let preamble = system_preamble(&settings, &documents.lock());
        let conversation = Arc::new(parking_lot::Mutex::new(Conversation::new(preamble)));

        let intent = IntentResolver::new(
            Arc::clone(&provider),
            Arc::clone(&catalog),
            settings.clone(),
        );
        let session = ChatSession::new(
            Arc::clone(&provider),
            Arc::clone(&catalog),
            conversation,
            settings.pacing(),
        );

        Orchestrator {
            provider,
            catalog,
            intent,
            session,
            documents,
            settings,
            busy: AtomicBool::new(false),
        }
    }

    pub fn conversation(&self) -> Arc<parking_lot::Mutex<Conversation>> {
        self.session.conversation()
    }

    pub fn documents(&self) -> Arc<parking_lot::Mutex<DocumentStore>> {
        Arc::clone(&self.documents)
    }

    /// A prompt can be sent when no turn is running, the prompt has
    /// content, and tool discovery has finished.
    pub fn can_send(&self, prompt: &str) -> bool {
        !self.busy.load(Ordering::SeqCst)
            && !prompt.trim().is_empty()
            && self.catalog.is_loaded()
    }

    pub fn cancel(&self) {
        self.session.cancel();
    }

    /// Run one full turn for `prompt`. The caller is expected to have
    /// checked [`Orchestrator::can_send`] first.
    pub fn send_turn(&self, prompt: String) -> BoxStream<'_, SessionEvent> {
        Box::pin(stream! {
            let _busy = BusyGuard(&self.busy);
            self.busy.store(true, Ordering::SeqCst);

            self.conversation().lock().push(Message::user(prompt.clone()));
            yield SessionEvent::MessageUpdated;

            if let Err(e) = self.provider.check_reachable().await {
                warn!("model backend unreachable: {e}");
                self.conversation().lock().push(Message::error(SERVICE_UNAVAILABLE));
                yield SessionEvent::MessageUpdated;
                yield SessionEvent::Completed;
                return;
            }

            let tools = match self.intent.resolve_needed_tools(&prompt).await {
                Ok(tools) => tools,
                Err(e) => {
                    error!("tool intent pass failed: {e}");
                    self.conversation().lock().push(Message::error(TRANSPORT_ERROR));
                    yield SessionEvent::MessageUpdated;
                    yield SessionEvent::Completed;
                    return;
                }
            };

            // The model sees which documents this chat has touched; the
            // transcript keeps the prompt as typed.
            let outgoing = {
                let summary = self.documents.lock().in_use_summary();
                if summary.is_empty() {
                    prompt.clone()
                } else {
                    format!("{prompt} Current documents: {summary}.")
                }
            };

            let mut turn = self.session.send(outgoing, tools);
            while let Some(event) = turn.next().await {
                if let SessionEvent::ToolResult { name, arguments, .. } = &event {
                    self.documents.lock().on_tool_result(name, arguments);
                }
                yield event;
            }
        })
    }

    /// Start a fresh chat: clear both transcripts, forget the needed-tool
    /// set and the in-use documents, and rebuild the preamble from a fresh
    /// scan of the documents folder.
    pub async fn new_chat(&self) {
        self.intent.reset().await;
        let preamble = {
            let mut documents = self.documents.lock();
            documents.clear_in_use();
            documents.rescan(&self.settings.template_dirs);
            system_preamble(&self.settings, &documents)
        };
        self.conversation().lock().reset(preamble);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use rmcp::model::Tool;
    use serde_json::json;

    use super::*;
    use crate::conversation::Role;
    use crate::provider::fixture::{Script, ScriptedProvider};
    use crate::provider::StreamChunk;
    use crate::provider::ToolInvocation;
    use crate::registry::fixture::StaticCatalog;

    fn tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            format!("{name} tool"),
            Arc::new(json!({"type": "object"}).as_object().unwrap().clone()),
        )
    }

    fn settings_in(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.documents_dir = dir.to_path_buf();
        settings.template_dirs = vec![];
        settings.stream_pacing_ms = None;
        settings
    }

    #[tokio::test]
    async fn can_send_requires_content_and_loaded_tools() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());

        let not_loaded = Orchestrator::new(
            provider.clone(),
            Arc::new(StaticCatalog::not_loaded()),
            settings_in(dir.path()),
        );
        assert!(!not_loaded.can_send("hello"));

        let loaded = Orchestrator::new(
            provider,
            Arc::new(StaticCatalog::loaded(vec![tool("insert_text")])),
            settings_in(dir.path()),
        );
        assert!(loaded.can_send("hello"));
        assert!(!loaded.can_send("   "));
        assert!(!loaded.can_send(""));
    }

    #[tokio::test]
    async fn can_send_is_false_while_a_turn_runs() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        // Intent pass, then a main reply that never finishes.
        provider.push_script(Script::tokens(&["no tools"]));
        provider.push_script(Script::hanging(&["thinking"]));
        let orchestrator = Orchestrator::new(
            provider,
            Arc::new(StaticCatalog::loaded(vec![tool("insert_text")])),
            settings_in(dir.path()),
        );

        let mut turn = orchestrator.send_turn("hello".to_string());
        // Pull a few events so the turn is well underway.
        for _ in 0..3 {
            turn.next().await;
        }
        assert!(!orchestrator.can_send("another"));

        orchestrator.cancel();
        while turn.next().await.is_some() {}
        drop(turn);
        assert!(orchestrator.can_send("another"));
    }

    #[tokio::test]
    async fn unreachable_backend_produces_an_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::unreachable());
        let orchestrator = Orchestrator::new(
            provider,
            Arc::new(StaticCatalog::loaded(vec![])),
            settings_in(dir.path()),
        );

        let events: Vec<_> = orchestrator.send_turn("hello".to_string()).collect().await;
        assert!(matches!(events.last(), Some(SessionEvent::Completed)));

        let conversation = orchestrator.conversation();
        let conversation = conversation.lock();
        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Error);
        assert_eq!(messages[1].content, SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn tool_results_register_documents_and_augment_the_next_prompt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.odt"), b"x").unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        // Turn 1: intent names the tool, the model calls it, then wraps up.
        provider.push_script(Script::tokens(&["use create_blank_document"]));
        provider.push_script(Script::chunks(vec![
            Ok(StreamChunk::ToolCall(ToolInvocation {
                name: "create_blank_document".to_string(),
                arguments: json!({"filename": "notes"}).as_object().unwrap().clone(),
            })),
            Ok(StreamChunk::Done),
        ]));
        provider.push_script(Script::tokens(&["Created notes.odt"]));
        // Turn 2: intent finds nothing new, plain reply.
        provider.push_script(Script::tokens(&["nothing new"]));
        provider.push_script(Script::tokens(&["Sure"]));

        let catalog = StaticCatalog::loaded(vec![tool("create_blank_document")])
            .with_result("create_blank_document", "created notes.odt");
        let orchestrator =
            Orchestrator::new(provider.clone(), Arc::new(catalog), settings_in(dir.path()));

        let _: Vec<_> = orchestrator.send_turn("make notes".to_string()).collect().await;
        assert_eq!(
            orchestrator.documents().lock().in_use_summary(),
            "notes.odt"
        );

        let _: Vec<_> = orchestrator.send_turn("add a title".to_string()).collect().await;
        let requests = provider.requests();
        let wire_user = requests
            .last()
            .unwrap()
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .unwrap();
        assert!(wire_user.content.ends_with("Current documents: notes.odt."));
    }

    #[tokio::test]
    async fn new_chat_clears_transcript_and_document_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memo.odt"), b"x").unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_script(Script::tokens(&["no tools"]));
        provider.push_script(Script::tokens(&["Hello"]));
        let orchestrator = Orchestrator::new(
            provider,
            Arc::new(StaticCatalog::loaded(vec![])),
            settings_in(dir.path()),
        );

        let _: Vec<_> = orchestrator.send_turn("hi".to_string()).collect().await;
        orchestrator
            .documents()
            .lock()
            .register_in_use(&dir.path().join("memo.odt"));

        orchestrator.new_chat().await;

        assert!(orchestrator.conversation().lock().messages().is_empty());
        assert!(orchestrator.documents().lock().in_use().is_empty());
    }
}
