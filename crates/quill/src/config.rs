//! Engine settings, loaded from a JSON file with serde defaults.
//!
//! Unknown fields are ignored so the settings file can carry UI-only keys
//! the engine does not care about.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::ModelConfig;

pub const DEFAULT_OLLAMA_HOST: &str = "localhost";
pub const DEFAULT_MODEL: &str = "qwen3";
/// Generous default to tolerate cold-start latency of a local model.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Port used by the tool-server handshake; a stuck prior instance is
/// killed here between discovery attempts.
pub const DEFAULT_COORDINATION_PORT: u16 = 8765;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Ollama host, with or without scheme and port.
    pub ollama_host: String,
    /// Model id used for both the visible and the hidden conversation.
    pub model: String,
    pub request_timeout_secs: u64,
    /// Working directory scanned for documents and used to resolve
    /// relative paths from tool results.
    pub documents_dir: PathBuf,
    /// JSON file enumerating the tool servers to discover.
    pub server_config_path: PathBuf,
    pub coordination_port: u16,
    /// Folders scanned recursively for presentation templates (.otp).
    pub template_dirs: Vec<PathBuf>,
    /// Optional overrides for the built-in preambles.
    pub system_prompt_path: Option<PathBuf>,
    pub intent_prompt_path: Option<PathBuf>,
    /// Pacing between visible tokens, purely cosmetic. `None` disables it.
    pub stream_pacing_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        let documents_dir = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let server_config_path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quill")
            .join("servers.json");

        Settings {
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            documents_dir,
            server_config_path,
            coordination_port: DEFAULT_COORDINATION_PORT,
            template_dirs: Vec::new(),
            system_prompt_path: None,
            intent_prompt_path: None,
            stream_pacing_ms: Some(10),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read settings {}: {e}", path.display()))
        })?;
        let settings = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid settings file: {e}")))?;
        Ok(settings)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            host: self.ollama_host.clone(),
            model: self.model.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn pacing(&self) -> Option<Duration> {
        self.stream_pacing_ms.map(Duration::from_millis)
    }
}
