//! System prompt assembly for the visible chat and the hidden tool-intent
//! pass. Both start from built-in instructions that a settings file can
//! override, then get the current document context appended.

use std::fs;
use std::path::Path;

use indoc::indoc;
use rmcp::model::Tool;
use tracing::warn;

use crate::config::Settings;
use crate::documents::DocumentStore;

const DEFAULT_SYSTEM_PROMPT: &str = indoc! {r#"
    You are a document assistant embedded in an office suite. You help the
    user create and edit text documents and presentations by calling the
    tools made available to you. Prefer acting through tools over
    describing steps. Keep replies short and concrete, and report what you
    actually changed.
"#};

const DEFAULT_INTENT_PROMPT: &str = indoc! {r#"
    You are a planning assistant. Given a user request and the list of
    available tools, reply with the names of the tools that would be needed
    to fulfil it. Mention each needed tool by its exact name. Do not call
    any tools and do not answer the request itself.
"#};

fn prompt_or_default(path: Option<&Path>, default: &str) -> String {
    match path {
        Some(path) => match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), "failed to read prompt override: {e}");
                default.to_string()
            }
        },
        None => default.to_string(),
    }
}

/// System prompt for the visible conversation, with the documents folder
/// and the currently known documents and templates appended.
pub fn system_preamble(settings: &Settings, documents: &DocumentStore) -> String {
    let mut prompt = prompt_or_default(
        settings.system_prompt_path.as_deref(),
        DEFAULT_SYSTEM_PROMPT,
    );

    prompt.push_str(&format!(
        "\nDocuments folder: {}.",
        documents.documents_dir().display()
    ));

    let available = documents.available_summary();
    if !available.is_empty() {
        prompt.push_str(&format!(
            "\nDocuments available: {available}. When the user names one of \
             these, use the exact filename as listed."
        ));
    }

    let templates = documents.template_summary();
    if !templates.is_empty() {
        prompt.push_str(&format!(
            "\nPresentation templates available: {templates}. Refer to a \
             template by its exact filename as listed."
        ));
    }

    prompt
}

/// System prompt for the hidden intent pass, listing every tool by name.
pub fn intent_preamble(settings: &Settings, tools: &[Tool]) -> String {
    let mut prompt = prompt_or_default(
        settings.intent_prompt_path.as_deref(),
        DEFAULT_INTENT_PROMPT,
    );

    if !tools.is_empty() {
        prompt.push_str("\nAvailable tools:\n");
        for tool in tools {
            let description = tool.description.as_deref().unwrap_or("");
            prompt.push_str(&format!("- {}: {}\n", tool.name, description.trim()));
        }
    }

    prompt
}
