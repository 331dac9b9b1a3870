//! Parsing of fetched documents
//!
//! Remote bodies are turned into [`ASObject`]s by the first registered
//! converter that accepts the response content type.

use std::sync::Arc;

use crate::data::ASObject;
use crate::error::AppError;

/// Turns a fetched body into an ActivityStreams document.
pub trait DocumentConverter: Send + Sync {
    /// True when this converter handles `content_type` (parameters stripped).
    fn accepts(&self, content_type: &str) -> bool;

    /// Parse `body`. `Ok(None)` means the body held nothing usable.
    fn convert(&self, body: &[u8], source_url: &str) -> Result<Option<ASObject>, AppError>;
}

/// JSON and JSON-LD documents.
#[derive(Debug, Default)]
pub struct JsonConverter;

impl DocumentConverter for JsonConverter {
    fn accepts(&self, content_type: &str) -> bool {
        matches!(
            content_type,
            "application/activity+json" | "application/ld+json" | "application/json"
        )
    }

    fn convert(&self, body: &[u8], source_url: &str) -> Result<Option<ASObject>, AppError> {
        let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
            AppError::Federation(format!("Unparseable document from {}: {}", source_url, e))
        })?;
        Ok(ASObject::from_value(value))
    }
}

/// Ordered converter list, consulted first to last.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn DocumentConverter>>,
}

impl ConverterRegistry {
    /// Registry with only the JSON converter.
    pub fn new() -> Self {
        Self {
            converters: vec![Arc::new(JsonConverter)],
        }
    }

    pub fn register(&mut self, converter: Arc<dyn DocumentConverter>) {
        self.converters.push(converter);
    }

    /// Convert with the first converter accepting `content_type`.
    ///
    /// `Ok(None)` when no converter accepts the type.
    pub fn convert(
        &self,
        content_type: &str,
        body: &[u8],
        source_url: &str,
    ) -> Result<Option<ASObject>, AppError> {
        let media_type = media_type(content_type);
        match self.converters.iter().find(|c| c.accepts(&media_type)) {
            Some(converter) => converter.convert(body, source_url),
            None => Ok(None),
        }
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `text/html; charset=utf-8` -> `text/html`
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
