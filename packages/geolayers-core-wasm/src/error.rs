//! Error taxonomy shared by ingestion, the loader and the browser bindings.

use thiserror::Error;
use wasm_bindgen::JsValue;

/// Errors produced by the layer engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Upload extension is not one of the accepted formats.
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Input is structurally invalid (e.g. CSV without coordinate columns).
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Content could not be parsed as the declared format.
    #[error("Failed to parse {format}: {message}")]
    Parse { format: &'static str, message: String },

    /// Network failure or timeout while fetching a remote source.
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// A label layer's source has not been cached yet. Internal signal only.
    #[error("Layer {0} is waiting for its source data")]
    NotReady(String),

    /// No layer with the given id exists in the registry.
    #[error("Unknown layer: {0}")]
    UnknownLayer(String),
}

impl EngineError {
    pub fn parse(format: &'static str, message: impl ToString) -> Self {
        EngineError::Parse {
            format,
            message: message.to_string(),
        }
    }

    pub fn fetch(url: &str, message: impl ToString) -> Self {
        EngineError::Fetch {
            url: url.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether a later reconcile pass may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Fetch { .. } | EngineError::Parse { .. } | EngineError::NotReady(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for JsValue {
    fn from(err: EngineError) -> Self {
        JsValue::from_str(&err.to_string())
    }
}
