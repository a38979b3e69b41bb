use log::LevelFilter;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FETCH_TIMEOUT_MS: u32 = 15_000;
pub const DEFAULT_UPLOAD_OPACITY: f64 = 0.65;
pub const UPLOADED_GROUP_ID: &str = "uploaded";
pub const BASEMAP_GROUP_ID: &str = "basemap";

/// Engine-wide settings. Every field has a default so the browser side can
/// pass a partial object (or nothing at all).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Upper bound for a single remote fetch before it counts as failed.
    pub fetch_timeout_ms: u32,
    /// Opacity given to layers created from uploaded files.
    pub upload_opacity: f64,
    pub uploaded_group_id: String,
    pub uploaded_group_name: String,
    /// Group whose layers are mutually exclusive.
    pub basemap_group_id: String,
    /// Optional cap on markers produced for one label layer.
    pub max_label_features: Option<usize>,
    /// Console log threshold: off, error, warn, info, debug or trace.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            upload_opacity: DEFAULT_UPLOAD_OPACITY,
            uploaded_group_id: UPLOADED_GROUP_ID.to_string(),
            uploaded_group_name: "Uploaded data".to_string(),
            basemap_group_id: BASEMAP_GROUP_ID.to_string(),
            max_label_features: None,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config object; an empty string yields the defaults.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        if json.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        serde_json::from_str(json).map_err(|e| crate::error::EngineError::parse("config", e))
    }

    /// Unknown level names fall back to `Info`.
    pub fn log_level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}
