//! Registry of documents the assistant knows about: everything in the
//! documents folder, the subset touched during the current chat, and the
//! presentation templates found under the configured template directories.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::Settings;

/// Extensions the writer component can open, lowercased, dot included.
pub const WRITER_EXTENSIONS: &[&str] = &[
    ".odt", ".docx", ".dotx", ".xml", ".doc", ".dot", ".rtf", ".wpd",
];

/// Extensions the presentation component can open, lowercased, dot included.
pub const PRESENTATION_EXTENSIONS: &[&str] = &[
    ".odp", ".pptx", ".ppsx", ".ppmx", ".potx", ".pomx", ".ppt", ".pps", ".ppm", ".pot", ".pom",
];

const TEMPLATE_EXTENSION: &str = ".otp";

/// Tool-result argument keys whose values name a document path.
const PATH_KEYS: &[&str] = &["file_path", "source_path", "target_path"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Writer,
    Presentation,
}

impl DocumentKind {
    fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if WRITER_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            Some(DocumentKind::Writer)
        } else if PRESENTATION_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            Some(DocumentKind::Presentation)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    /// Lowercased, dot included.
    pub extension: String,
    pub path: PathBuf,
    pub kind: DocumentKind,
}

impl Document {
    fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        let kind = DocumentKind::from_name(&name)?;
        let extension = name
            .rfind('.')
            .map(|dot| name[dot..].to_lowercase())
            .unwrap_or_default();
        Some(Document {
            name,
            extension,
            path: path.to_path_buf(),
            kind,
        })
    }
}

#[derive(Debug)]
pub struct DocumentStore {
    documents_dir: PathBuf,
    all: Vec<Document>,
    in_use: Vec<Document>,
    templates: Vec<String>,
}

impl DocumentStore {
    /// Scan the documents folder (flat) and the template directories
    /// (recursively) and build the initial catalog.
    pub fn new(settings: &Settings) -> Self {
        let mut store = DocumentStore {
            documents_dir: settings.documents_dir.clone(),
            all: Vec::new(),
            in_use: Vec::new(),
            templates: Vec::new(),
        };
        store.rescan(&settings.template_dirs);
        store
    }

    pub fn rescan(&mut self, template_dirs: &[PathBuf]) {
        self.all.clear();
        self.templates.clear();

        match std::fs::read_dir(&self.documents_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_file() {
                        if let Some(document) = Document::from_path(&path) {
                            self.all.push(document);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(dir = %self.documents_dir.display(), "cannot read documents folder: {e}");
            }
        }
        self.all.sort_by(|a, b| a.name.cmp(&b.name));

        let mut seen = HashSet::new();
        for dir in template_dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkBuilder::new(dir).build().flatten() {
                let path = entry.path();
                if path.is_file() {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if name.to_lowercase().ends_with(TEMPLATE_EXTENSION)
                            && seen.insert(name.to_string())
                        {
                            self.templates.push(name.to_string());
                        }
                    }
                }
            }
        }
        self.templates.sort();
    }

    pub fn documents_dir(&self) -> &Path {
        &self.documents_dir
    }

    pub fn available(&self) -> &[Document] {
        &self.all
    }

    pub fn in_use(&self) -> &[Document] {
        &self.in_use
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    pub fn available_summary(&self) -> String {
        self.all
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn in_use_summary(&self) -> String {
        self.in_use
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn template_summary(&self) -> String {
        self.templates.join(", ")
    }

    /// Mark a document as part of the current chat. Paths are deduplicated
    /// and files that do not exist on disk are ignored.
    pub fn register_in_use(&mut self, path: &Path) {
        if self.in_use.iter().any(|d| d.path == path) {
            return;
        }
        if !path.is_file() {
            debug!(path = %path.display(), "skipping document that is not on disk");
            return;
        }
        if let Some(document) = Document::from_path(path) {
            if !self.all.iter().any(|d| d.path == document.path) {
                self.all.push(document.clone());
                self.all.sort_by(|a, b| a.name.cmp(&b.name));
            }
            self.in_use.push(document);
        }
    }

    pub fn clear_in_use(&mut self) {
        self.in_use.clear();
    }

    /// Inspect a completed tool call and register any document it touched.
    /// Empty values are ignored.
    pub fn on_tool_result(&mut self, tool: &str, arguments: &Map<String, Value>) {
        for key in PATH_KEYS {
            if let Some(Value::String(raw)) = arguments.get(*key) {
                if raw.is_empty() {
                    continue;
                }
                let path = PathBuf::from(raw);
                let path = if path.is_absolute() {
                    path
                } else {
                    self.documents_dir.join(path)
                };
                self.register_in_use(&path);
            }
        }

        if let Some(Value::String(filename)) = arguments.get("filename") {
            if filename.is_empty() {
                return;
            }
            let mut name = filename.clone();
            let lower = name.to_lowercase();
            // The creation tools get the default extension for the kind
            // they create unless the name already ends in one of that
            // kind's extensions. An extension of the other kind is not
            // good enough; ".odp" handed to the writer tool still yields
            // a ".odp.odt" document.
            match tool {
                "create_blank_document" => {
                    if !WRITER_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                        name.push_str(".odt");
                    }
                }
                "create_blank_presentation" => {
                    if !PRESENTATION_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                        name.push_str(".odp");
                    }
                }
                _ => {}
            }
            let path = self.documents_dir.join(name);
            self.register_in_use(&path);
        }
    }
}
