//! quill - a conversational tool-orchestration engine for office documents
//!
//! This crate drives a chat loop between a user, a local model served by
//! Ollama, and a set of document tool servers spoken to over MCP stdio:
//! - Tool servers are discovered at startup with retries, and their tools
//!   are routed by name
//! - Each prompt first runs through a hidden intent pass that narrows the
//!   tool set to what the chat has actually needed
//! - The visible turn streams tokens into the transcript, executes tool
//!   calls as they arrive, and feeds the results back to the model until
//!   the reply completes
//! - Documents touched by tool calls are tracked and surfaced back to the
//!   model as context on later prompts
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//!     |
//!     +-- ToolRegistry (discovery, routing)   <--stdio--> tool servers
//!     +-- IntentResolver (hidden conversation, needed-tool set)
//!     +-- ChatSession (visible turn loop)     <--http-->  Ollama
//!     +-- DocumentStore (folder scan, in-use tracking)
//! ```

pub mod config;
pub mod conversation;
pub mod documents;
pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod preamble;
pub mod provider;
pub mod registry;
pub mod session;

pub use config::Settings;
pub use conversation::{Conversation, Message, Role};
pub use documents::{Document, DocumentKind, DocumentStore};
pub use error::{Error, Result};
pub use intent::IntentResolver;
pub use orchestrator::Orchestrator;
pub use provider::{ChatProvider, ModelConfig, OllamaProvider};
pub use registry::{RegistryState, ToolCatalog, ToolRegistry};
pub use session::{ChatSession, SessionEvent};
