use std::cell::RefCell;
use std::rc::Rc;

use geo_types::{coord, Rect};
use js_sys::Function;
use log::{info, warn};
use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::spawn_local;

// Browser console log backend
pub mod console;
// Materialization keys
pub mod cache_keys;
pub mod config;
// Explicit engine context
pub mod engine;
pub mod error;
pub mod feature_cache;
// Remote fetch bridge
pub mod fetch;
pub mod filter;
// Import our geojson features module
pub mod geojson_features;
// Upload and source parsing
pub mod ingest;
mod kml;
pub mod labels;
pub mod loader;
pub mod materialize;
// Import our models
pub mod models;
pub mod registry;
mod shapefile_bundle;
pub mod style;
pub mod tile;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use geojson_features::{Feature, FeatureCollection};
pub use models::{EngineEvent, MaterializedLayer, Renderable};
pub use registry::{Layer, LayerGroup, LayerType, Registry};

use fetch::JsFetcher;
use loader::LoadTask;

// Enable better panic messages in console during development
#[cfg(feature = "console_error_panic_hook")]
pub use console_error_panic_hook::set_once as set_panic_hook;

use std::sync::Once;
static INIT: Once = Once::new();

// This sets up the wasm_bindgen start functionality
#[wasm_bindgen(start)]
pub fn start() {
    INIT.call_once(|| {
        // Set the panic hook for better error messages
        #[cfg(feature = "console_error_panic_hook")]
        console_error_panic_hook::set_once();

        console::init(log::LevelFilter::Info);
        info!("WASM module initialized successfully");
    });
}

// Maps and nested objects become plain JS objects rather than `Map`s.
fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(JsValue::from)
}

type Listener = Rc<RefCell<Option<Function>>>;

/// Hand pending events to the registered change callback.
fn notify(engine: &Engine, listener: &Listener) {
    let events = engine.drain_events();
    if events.is_empty() {
        return;
    }
    let Some(callback) = listener.borrow().clone() else {
        return;
    };
    match to_js(&events) {
        Ok(value) => {
            if let Err(err) = callback.call1(&JsValue::NULL, &value) {
                warn!("Change callback threw: {:?}", err);
            }
        }
        Err(err) => warn!("Failed to serialize engine events: {:?}", err),
    }
}

/// Layer engine handle for the page. Every mutation reconciles right away;
/// loads run on the browser's microtask queue and report through the
/// `onChange` callback.
#[wasm_bindgen]
pub struct MapEngine {
    engine: Engine,
    listener: Listener,
}

#[wasm_bindgen]
impl MapEngine {
    #[wasm_bindgen(constructor)]
    pub fn new(
        groups_json: &str,
        config_json: Option<String>,
    ) -> Result<MapEngine, JsValue> {
        let config = EngineConfig::from_json(config_json.as_deref().unwrap_or_default())?;
        log::set_max_level(config.log_level_filter());
        let engine = Engine::from_json(groups_json, config, Rc::new(JsFetcher))?;
        Ok(MapEngine {
            engine,
            listener: Rc::new(RefCell::new(None)),
        })
    }

    /// Register (or clear, with `undefined`) the callback receiving arrays
    /// of change events.
    #[wasm_bindgen(js_name = onChange)]
    pub fn on_change(&self, callback: Option<Function>) {
        *self.listener.borrow_mut() = callback;
    }

    #[wasm_bindgen(js_name = toggleVisibility)]
    pub fn toggle_visibility(&self, layer_id: &str) -> Result<bool, JsValue> {
        let visible = self.engine.toggle_visibility(layer_id)?;
        self.reconcile();
        Ok(visible)
    }

    #[wasm_bindgen(js_name = setVisibility)]
    pub fn set_visibility(&self, layer_id: &str, visible: bool) -> Result<(), JsValue> {
        self.engine.set_visibility(layer_id, visible)?;
        self.reconcile();
        Ok(())
    }

    #[wasm_bindgen(js_name = setOpacity)]
    pub fn set_opacity(&self, layer_id: &str, opacity: f64) -> Result<f64, JsValue> {
        let stored = self.engine.set_opacity(layer_id, opacity)?;
        self.reconcile();
        Ok(stored)
    }

    /// Returns the id of the layer created for the file.
    #[wasm_bindgen(js_name = uploadFile)]
    pub fn upload_file(&self, filename: &str, bytes: &[u8]) -> Result<String, JsValue> {
        let layer_id = self.engine.upload_file(filename, bytes)?;
        self.reconcile();
        Ok(layer_id)
    }

    #[wasm_bindgen(js_name = removeUploadedLayer)]
    pub fn remove_uploaded_layer(&self, layer_id: &str) -> Result<(), JsValue> {
        self.engine.remove_uploaded_layer(layer_id)?;
        self.reconcile();
        Ok(())
    }

    /// Set one filter constraint; `undefined` or an empty string clears it.
    #[wasm_bindgen(js_name = setFilter)]
    pub fn set_filter(&self, key: &str, value: Option<String>) -> bool {
        let changed = self.engine.set_filter(key, value.as_deref());
        if changed {
            self.reconcile();
        }
        changed
    }

    #[wasm_bindgen(js_name = clearFilters)]
    pub fn clear_filters(&self) -> bool {
        let changed = self.engine.clear_filters();
        if changed {
            self.reconcile();
        }
        changed
    }

    #[wasm_bindgen(js_name = filterCriteria)]
    pub fn filter_criteria(&self) -> Result<JsValue, JsValue> {
        to_js(&self.engine.filter_criteria())
    }

    #[wasm_bindgen(js_name = layerGroups)]
    pub fn layer_groups(&self) -> Result<JsValue, JsValue> {
        to_js(&self.engine.layer_groups())
    }

    /// `undefined` until the layer has been materialized.
    #[wasm_bindgen(js_name = materializedLayer)]
    pub fn materialized_layer(&self, layer_id: &str) -> Result<JsValue, JsValue> {
        match self.engine.materialized_layer(layer_id) {
            Some(layer) => to_js(&layer),
            None => Ok(JsValue::undefined()),
        }
    }

    #[wasm_bindgen(js_name = materializedLayers)]
    pub fn materialized_layers(&self) -> Result<JsValue, JsValue> {
        to_js(&self.engine.materialized_layers())
    }

    #[wasm_bindgen(js_name = loadState)]
    pub fn load_state(&self, layer_id: &str) -> Result<JsValue, JsValue> {
        to_js(&self.engine.load_state(layer_id))
    }

    /// Run a reconcile pass; returns how many loads were started.
    pub fn reconcile(&self) -> usize {
        let tasks = self.engine.reconcile();
        self.spawn(tasks)
    }

    #[wasm_bindgen(js_name = reloadLayer)]
    pub fn reload_layer(&self, layer_id: &str) -> Result<usize, JsValue> {
        let tasks = self.engine.reload_layer(layer_id)?;
        Ok(self.spawn(tasks))
    }

    /// Tile urls of a shown raster layer covering a lng/lat box.
    #[wasm_bindgen(js_name = tileUrls)]
    pub fn tile_urls(
        &self,
        layer_id: &str,
        min_lng: f64,
        min_lat: f64,
        max_lng: f64,
        max_lat: f64,
        zoom: u32,
    ) -> Result<Vec<JsValue>, JsValue> {
        let bounds = bounds_rect(min_lng, min_lat, max_lng, max_lat);
        let urls = self.engine.tile_urls(layer_id, &bounds, zoom)?;
        Ok(urls.iter().map(|url| JsValue::from_str(url)).collect())
    }

    #[wasm_bindgen(js_name = cacheStats)]
    pub fn cache_stats(&self) -> Result<JsValue, JsValue> {
        to_js(&self.engine.cache_stats())
    }
}

impl MapEngine {
    fn spawn(&self, tasks: Vec<LoadTask>) -> usize {
        let started = tasks.len();
        for task in tasks {
            let engine = self.engine.clone();
            let listener = self.listener.clone();
            spawn_local(async move {
                task.await;
                notify(&engine, &listener);
            });
        }
        notify(&self.engine, &self.listener);
        started
    }
}

fn bounds_rect(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Rect<f64> {
    Rect::new(
        coord! { x: min_lng, y: min_lat },
        coord! { x: max_lng, y: max_lat },
    )
}

/// File extensions `uploadFile` accepts.
#[wasm_bindgen(js_name = acceptedExtensions)]
pub fn accepted_extensions() -> Vec<JsValue> {
    ingest::ACCEPTED_EXTENSIONS
        .iter()
        .map(|ext| JsValue::from_str(ext))
        .collect()
}

/// Tiles `{x, y, z}` covering a lng/lat box at one zoom level.
#[wasm_bindgen(js_name = tilesForBounds)]
pub fn tiles_for_bounds(
    min_lng: f64,
    min_lat: f64,
    max_lng: f64,
    max_lat: f64,
    zoom: u32,
) -> Result<JsValue, JsValue> {
    let bounds = bounds_rect(min_lng, min_lat, max_lng, max_lat);
    to_js(&tile::tiles_for_bounds(&bounds, zoom))
}
