// This is the models module containing the renderable outputs handed to the
// rendering surface and the events describing how they changed.
use serde::Serialize;
use serde_json::Value;

use crate::labels::LabelOverlay;
use crate::style::StyleProps;
use crate::tile::RasterReference;

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StyledFeature {
    pub feature_index: usize,
    /// GeoJSON Feature object.
    pub feature: Value,
    pub style: StyleProps,
    /// Summary popup markup; `None` when the feature has nothing to show.
    pub popup: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VectorOverlay {
    pub features: Vec<StyledFeature>,
    /// Features in the source before filtering.
    pub source_features: usize,
    /// `[minLng, minLat, maxLng, maxLat]` of the included features.
    pub bounds: Option<[f64; 4]>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Renderable {
    Tile(RasterReference),
    Vector(VectorOverlay),
    Label(LabelOverlay),
}

/// Runtime renderable backing one layer. Replaced as a whole on rebuild.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedLayer {
    pub layer_id: String,
    pub visible: bool,
    pub opacity: f64,
    /// Position in display order.
    pub z_index: usize,
    pub renderable: Renderable,
    #[serde(skip)]
    pub key: String,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Materialized,
    Failed,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A layer was (re)built; fetch it and swap it in.
    #[serde(rename_all = "camelCase")]
    Materialized { layer_id: String },
    /// Only visibility/opacity/order changed.
    #[serde(rename_all = "camelCase")]
    Synced {
        layer_id: String,
        visible: bool,
        opacity: f64,
        z_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    Removed { layer_id: String },
    #[serde(rename_all = "camelCase")]
    LoadStarted { layer_id: String },
    /// Recoverable; retried on the next reconcile.
    #[serde(rename_all = "camelCase")]
    LoadFailed { layer_id: String, message: String },
}
