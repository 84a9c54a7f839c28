//! Static catalog of downloadable models
//!
//! The catalog ships with the application and never changes at runtime.
//! Entries are kept in display order with the recommended model first.

use serde::{Deserialize, Serialize};

use crate::{error::RuntimeError, Result};

/// A downloadable inference model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /// Stable identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// File name inside the models directory
    pub filename: String,

    /// Source URL
    pub url: String,

    /// Declared size in bytes. Advisory when the server reports a different length.
    pub size_bytes: u64,

    /// Human readable description
    pub description: String,

    /// Recommended by default
    #[serde(default)]
    pub recommended: bool,

    /// Expected SHA-256 of the file, lowercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

struct BuiltinEntry {
    id: &'static str,
    name: &'static str,
    filename: &'static str,
    url: &'static str,
    size_bytes: u64,
    description: &'static str,
    recommended: bool,
}

const BUILTIN_MODELS: &[BuiltinEntry] = &[
    BuiltinEntry {
        id: "qwen2.5-1.5b-instruct",
        name: "Qwen 2.5 1.5B Instruct",
        filename: "Qwen2.5-1.5B-Instruct-Q4_K_M.gguf",
        url: "https://huggingface.co/bartowski/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/Qwen2.5-1.5B-Instruct-Q4_K_M.gguf",
        size_bytes: 986_048_768,
        description: "Fast, small model. Good default for pre-scanning on most laptops.",
        recommended: true,
    },
    BuiltinEntry {
        id: "llama-3.2-3b-instruct",
        name: "Llama 3.2 3B Instruct",
        filename: "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        url: "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        size_bytes: 2_019_377_696,
        description: "Better mapping quality. Needs about 4 GB of free memory.",
        recommended: false,
    },
    BuiltinEntry {
        id: "phi-3.5-mini-instruct",
        name: "Phi 3.5 Mini Instruct",
        filename: "Phi-3.5-mini-instruct-Q4_K_M.gguf",
        url: "https://huggingface.co/bartowski/Phi-3.5-mini-instruct-GGUF/resolve/main/Phi-3.5-mini-instruct-Q4_K_M.gguf",
        size_bytes: 2_393_232_672,
        description: "Strong reasoning for its size. Slower on CPU-only machines.",
        recommended: false,
    },
    BuiltinEntry {
        id: "llama-3.1-8b-instruct",
        name: "Llama 3.1 8B Instruct",
        filename: "Meta-Llama-3.1-8B-Instruct-Q4_K_M.gguf",
        url: "https://huggingface.co/bartowski/Meta-Llama-3.1-8B-Instruct-GGUF/resolve/main/Meta-Llama-3.1-8B-Instruct-Q4_K_M.gguf",
        size_bytes: 4_920_734_016,
        description: "Highest quality. Needs a GPU or 8 GB of free memory.",
        recommended: false,
    },
];

impl From<&BuiltinEntry> for ModelDescriptor {
    fn from(entry: &BuiltinEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            name: entry.name.to_string(),
            filename: entry.filename.to_string(),
            url: entry.url.to_string(),
            size_bytes: entry.size_bytes,
            description: entry.description.to_string(),
            recommended: entry.recommended,
            sha256: None,
        }
    }
}

/// Ordered, immutable set of model descriptors
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    /// Build a catalog, rejecting duplicate ids and unsafe file names
    pub fn new(entries: Vec<ModelDescriptor>) -> Result<Self> {
        if entries.is_empty() {
            return Err(RuntimeError::Config("model catalog cannot be empty".to_string()));
        }

        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_files = std::collections::HashSet::new();

        for entry in &entries {
            if entry.id.trim().is_empty() {
                return Err(RuntimeError::Config("model id cannot be empty".to_string()));
            }
            if !seen_ids.insert(entry.id.as_str()) {
                return Err(RuntimeError::Config(format!(
                    "duplicate model id in catalog: {}",
                    entry.id
                )));
            }
            if !is_plain_filename(&entry.filename) {
                return Err(RuntimeError::Config(format!(
                    "invalid file name for model {}: {:?}",
                    entry.id, entry.filename
                )));
            }
            if !seen_files.insert(entry.filename.as_str()) {
                return Err(RuntimeError::Config(format!(
                    "duplicate file name in catalog: {}",
                    entry.filename
                )));
            }
        }

        Ok(Self { entries })
    }

    /// The catalog shipped with the application
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_MODELS.iter().map(ModelDescriptor::from).collect(),
        }
    }

    /// Look up a descriptor by id
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Look up a descriptor or fail with `UnknownModel`
    pub fn require(&self, id: &str) -> Result<&ModelDescriptor> {
        self.get(id)
            .ok_or_else(|| RuntimeError::UnknownModel(id.to_string()))
    }

    /// Entries in catalog order
    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.entries.iter()
    }

    /// The recommended entry, if any
    pub fn recommended(&self) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|entry| entry.recommended)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.ends_with(crate::store::PARTIAL_SUFFIX)
        && name != crate::store::MANIFEST_FILE
}
