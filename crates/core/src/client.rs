//! Options handed to the protocol client alongside the transport.

use crate::translate::PathTranslator;
use serde::{Deserialize, Serialize};

/// Selects the documents a language server is responsible for.
///
/// Fields left as `None` match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl DocumentFilter {
    pub fn new(scheme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            scheme: Some(scheme.into()),
            language: Some(language.into()),
        }
    }

    pub fn matches(&self, scheme: &str, language: &str) -> bool {
        self.scheme.as_deref().is_none_or(|s| s == scheme)
            && self.language.as_deref().is_none_or(|l| l == language)
    }
}

/// Protocol-client options: which documents to serve and how to translate
/// identifiers for the worker.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub document_selector: Vec<DocumentFilter>,
    pub path_translator: Option<PathTranslator>,
}

impl ClientOptions {
    pub fn new(document_selector: Vec<DocumentFilter>) -> Self {
        Self {
            document_selector,
            path_translator: None,
        }
    }

    /// Options for `.proto` files on disk.
    pub fn proto() -> Self {
        Self::new(vec![DocumentFilter::new("file", "proto")])
    }

    pub fn with_path_translator(mut self, translator: PathTranslator) -> Self {
        self.path_translator = Some(translator);
        self
    }

    /// Whether any filter in the selector covers the document.
    pub fn selects(&self, scheme: &str, language: &str) -> bool {
        self.document_selector
            .iter()
            .any(|filter| filter.matches(scheme, language))
    }
}
