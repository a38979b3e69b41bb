// Explicit engine context: registry, filter criteria, feature cache and loader
// behind one cheaply cloneable handle. Mutations only change desired state;
// `reconcile` brings the materialized layers in line and hands back the loads
// the caller has to drive.

use std::rc::Rc;
use std::sync::Arc;

use geo_types::Rect;
use log::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::feature_cache::{CacheStats, FeatureCache};
use crate::fetch::SourceFetcher;
use crate::filter::FilterCriteria;
use crate::ingest::ingest_upload;
use crate::loader::{LoadTask, Loader};
use crate::models::{EngineEvent, LoadState, MaterializedLayer, Renderable};
use crate::registry::{Layer, LayerGroup, Registry};
use crate::tile::tiles_for_bounds;

#[derive(Clone)]
pub struct Engine {
    loader: Loader,
    config: Rc<EngineConfig>,
}

impl Engine {
    pub fn new(registry: Registry, config: EngineConfig, fetcher: Rc<dyn SourceFetcher>) -> Self {
        let config = Rc::new(config);
        Engine {
            loader: Loader::new(registry, Arc::new(FeatureCache::new()), fetcher, config.clone()),
            config,
        }
    }

    /// Build from a JSON array of layer groups.
    pub fn from_json(
        groups_json: &str,
        config: EngineConfig,
        fetcher: Rc<dyn SourceFetcher>,
    ) -> Result<Self> {
        let registry = Registry::from_json(groups_json, &config)?;
        info!(
            "Engine configured with {} layer group(s)",
            registry.groups().len()
        );
        Ok(Engine::new(registry, config, fetcher))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn toggle_visibility(&self, layer_id: &str) -> Result<bool> {
        self.loader.state().borrow_mut().registry.toggle_visibility(layer_id)
    }

    pub fn set_visibility(&self, layer_id: &str, visible: bool) -> Result<()> {
        self.loader
            .state()
            .borrow_mut()
            .registry
            .set_visibility(layer_id, visible)
    }

    /// Returns the opacity actually stored after clamping.
    pub fn set_opacity(&self, layer_id: &str, opacity: f64) -> Result<f64> {
        self.loader
            .state()
            .borrow_mut()
            .registry
            .set_opacity(layer_id, opacity)
    }

    /// Parse an uploaded file and register it as a visible layer of the
    /// uploaded group. Returns the new layer id. Nothing changes on error.
    pub fn upload_file(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        let layer = ingest_upload(filename, bytes, &self.config)?;
        let layer_id = layer.id.clone();
        self.loader
            .state()
            .borrow_mut()
            .registry
            .add_uploaded_layer(layer)?;
        // a re-upload under the same name must not see the old features
        self.loader.cache().evict(&layer_id);
        Ok(layer_id)
    }

    pub fn remove_uploaded_layer(&self, layer_id: &str) -> Result<()> {
        let mut state = self.loader.state().borrow_mut();
        state.registry.remove_uploaded_layer(layer_id)?;
        state.loader.forget(layer_id);
        self.loader.cache().evict(layer_id);
        info!("Removed uploaded layer {}", layer_id);
        Ok(())
    }

    /// Set or clear (`None` / empty) one filter constraint. Returns whether
    /// the criteria changed.
    pub fn set_filter(&self, key: &str, value: Option<&str>) -> bool {
        self.loader.state().borrow_mut().criteria.set(key, value)
    }

    pub fn clear_filters(&self) -> bool {
        self.loader.state().borrow_mut().criteria.clear()
    }

    pub fn filter_criteria(&self) -> FilterCriteria {
        self.loader.state().borrow().criteria.clone()
    }

    pub fn layer_groups(&self) -> Vec<LayerGroup> {
        self.loader.state().borrow().registry.groups().to_vec()
    }

    pub fn layer(&self, layer_id: &str) -> Option<Layer> {
        self.loader.state().borrow().registry.layer(layer_id).cloned()
    }

    pub fn reconcile(&self) -> Vec<LoadTask> {
        self.loader.reconcile()
    }

    /// Throw away cached data and the renderable of one layer, then
    /// reconcile so it loads again.
    pub fn reload_layer(&self, layer_id: &str) -> Result<Vec<LoadTask>> {
        {
            let mut state = self.loader.state().borrow_mut();
            if state.registry.layer(layer_id).is_none() {
                return Err(EngineError::UnknownLayer(layer_id.to_string()));
            }
            state.loader.forget(layer_id);
        }
        self.loader.cache().evict(layer_id);
        info!("Reloading layer {}", layer_id);
        Ok(self.loader.reconcile())
    }

    pub fn materialized_layer(&self, layer_id: &str) -> Option<MaterializedLayer> {
        self.loader.materialized(layer_id)
    }

    /// Materialized layers in display order, hidden ones included.
    pub fn materialized_layers(&self) -> Vec<MaterializedLayer> {
        self.loader
            .state()
            .borrow()
            .loader
            .materialized_layers()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn load_state(&self, layer_id: &str) -> LoadState {
        self.loader.load_state(layer_id)
    }

    /// Concrete tile urls of a materialized raster layer covering `bounds`.
    /// Empty while the layer is not materialized or `zoom` is outside its
    /// zoom range.
    pub fn tile_urls(&self, layer_id: &str, bounds: &Rect<f64>, zoom: u32) -> Result<Vec<String>> {
        let state = self.loader.state().borrow();
        let Some(layer) = state.registry.layer(layer_id) else {
            return Err(EngineError::UnknownLayer(layer_id.to_string()));
        };
        let raster = match state.loader.materialized(layer_id).map(|m| &m.renderable) {
            Some(Renderable::Tile(raster)) => raster,
            Some(_) => {
                return Err(EngineError::Validation(format!(
                    "layer {} is not a tile layer",
                    layer.id
                )))
            }
            None => return Ok(Vec::new()),
        };
        let below = raster.min_zoom.map_or(false, |min| zoom < u32::from(min));
        let above = raster.max_zoom.map_or(false, |max| zoom > u32::from(max));
        if below || above {
            return Ok(Vec::new());
        }
        Ok(tiles_for_bounds(bounds, zoom)
            .iter()
            .map(|tile| raster.tile_url(tile))
            .collect())
    }

    pub fn drain_events(&self) -> Vec<EngineEvent> {
        self.loader.drain_events()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.loader.cache().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{villages, MockFetcher};
    use futures::executor::block_on;
    use futures::future::join_all;

    const CONFIG: &str = r#"[
        {"id": "basemap", "name": "Base maps", "layers": [
            {"id": "osm", "name": "OpenStreetMap", "type": "tile",
             "url": "https://{s}.tile.example/{z}/{x}/{y}.png", "subdomains": ["a", "b"],
             "visible": true},
            {"id": "imagery", "name": "Imagery", "type": "tile",
             "url": "https://imagery.example/{z}/{y}/{x}"}
        ]},
        {"id": "admin", "name": "Administrative", "layers": [
            {"id": "kel", "name": "Kelurahan", "type": "vector", "url": "/kel.geojson",
             "filterProperties": {"subregion": "KELURAHAN"}, "opacity": 0.8},
            {"id": "kel-names", "name": "Kelurahan names", "type": "label",
             "sourceLayerId": "kel", "labelProperty": "NAME"}
        ]}
    ]"#;

    fn engine() -> (Engine, Rc<MockFetcher>) {
        let fetcher = Rc::new(MockFetcher::default());
        fetcher.serve("/kel.geojson", villages(&["Menteng", "Koja"]));
        let shared: Rc<dyn SourceFetcher> = fetcher.clone();
        let engine = Engine::from_json(CONFIG, EngineConfig::default(), shared).unwrap();
        (engine, fetcher)
    }

    fn settle(engine: &Engine) {
        block_on(join_all(engine.reconcile()));
    }

    #[test]
    fn basemap_switch_hides_previous() {
        let (engine, _) = engine();
        settle(&engine);
        assert!(engine.materialized_layer("osm").unwrap().visible);

        engine.set_visibility("imagery", true).unwrap();
        settle(&engine);
        assert!(!engine.materialized_layer("osm").unwrap().visible);
        assert!(engine.materialized_layer("imagery").unwrap().visible);
        assert!(!engine.layer("osm").unwrap().visible);
    }

    #[test]
    fn opacity_changes_sync_without_rebuild() {
        let (engine, fetcher) = engine();
        engine.toggle_visibility("kel").unwrap();
        settle(&engine);
        engine.drain_events();

        assert_eq!(engine.set_opacity("kel", 1.7).unwrap(), 1.0);
        settle(&engine);
        assert_eq!(
            engine.drain_events(),
            vec![EngineEvent::Synced {
                layer_id: "kel".into(),
                visible: true,
                opacity: 1.0,
                z_index: 2,
            }]
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn label_follows_source_and_filter() {
        let (engine, _) = engine();
        engine.set_visibility("kel", true).unwrap();
        engine.set_visibility("kel-names", true).unwrap();
        settle(&engine);

        assert!(engine.set_filter("subregion", Some("Koja")));
        assert!(!engine.set_filter("subregion", Some("Koja")));
        settle(&engine);
        match engine.materialized_layer("kel-names").map(|m| m.renderable) {
            Some(Renderable::Label(overlay)) => {
                assert_eq!(overlay.markers.len(), 1);
                assert_eq!(overlay.markers[0].text, "Koja");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.filter_criteria().get("subregion"), Some("Koja"));
    }

    #[test]
    fn upload_registers_visible_layer() {
        let (engine, fetcher) = engine();
        let id = engine
            .upload_file("clinics.csv", b"name,lat,lon\nPuskesmas,-6.2,106.8\nBad,x,106.9\n")
            .unwrap();
        assert_eq!(id, "clinics.csv");
        settle(&engine);

        let layer = engine.layer(&id).unwrap();
        assert_eq!(layer.group, "uploaded");
        assert_eq!(layer.opacity, 0.65);
        let groups = engine.layer_groups();
        assert_eq!(groups.last().unwrap().id, "uploaded");

        let materialized = engine.materialized_layer(&id).unwrap();
        assert_eq!(materialized.opacity, 0.65);
        match materialized.renderable {
            Renderable::Vector(overlay) => assert_eq!(overlay.features.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn reupload_replaces_data() {
        let (engine, _) = engine();
        engine
            .upload_file("sites.wkt", b"POINT(106.8 -6.2)")
            .unwrap();
        settle(&engine);
        engine
            .upload_file("sites.wkt", b"MULTIPOINT((1 1),(2 2))")
            .unwrap();
        settle(&engine);

        match engine.materialized_layer("sites.wkt").map(|m| m.renderable) {
            Some(Renderable::Vector(overlay)) => {
                assert_eq!(overlay.features[0].feature["geometry"]["type"], "MultiPoint");
            }
            other => panic!("unexpected {:?}", other),
        }
        let uploaded = engine
            .layer_groups()
            .into_iter()
            .find(|g| g.id == "uploaded")
            .unwrap();
        assert_eq!(uploaded.layers.len(), 1);
    }

    #[test]
    fn failed_upload_registers_nothing() {
        let (engine, _) = engine();
        let err = engine.upload_file("notes.txt", b"hello").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedFormat(_)));
        let err = engine.upload_file("points.csv", b"a,b\n1,2\n").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(!engine.layer_groups().iter().any(|g| g.id == "uploaded"));
    }

    #[test]
    fn removing_upload_drops_renderable() {
        let (engine, _) = engine();
        let id = engine.upload_file("sites.wkt", b"POINT(1 2)").unwrap();
        settle(&engine);
        engine.drain_events();

        engine.remove_uploaded_layer(&id).unwrap();
        assert!(engine.materialized_layer(&id).is_none());
        assert_eq!(
            engine.drain_events(),
            vec![EngineEvent::Removed { layer_id: id.clone() }]
        );
        assert!(!engine.layer_groups().iter().any(|g| g.id == "uploaded"));
        assert!(matches!(
            engine.remove_uploaded_layer(&id),
            Err(EngineError::UnknownLayer(_))
        ));
        assert!(matches!(
            engine.remove_uploaded_layer("kel"),
            Err(EngineError::UnknownLayer(_))
        ));
    }

    #[test]
    fn reload_fetches_again() {
        let (engine, fetcher) = engine();
        engine.set_visibility("kel", true).unwrap();
        settle(&engine);
        assert_eq!(engine.cache_stats().entries, 1);

        let tasks = engine.reload_layer("kel").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(engine.load_state("kel"), LoadState::Loading);
        block_on(join_all(tasks));
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(engine.load_state("kel"), LoadState::Materialized);

        assert!(matches!(
            engine.reload_layer("nope"),
            Err(EngineError::UnknownLayer(_))
        ));
    }

    #[test]
    fn tile_urls_expand_materialized_template() {
        let (engine, _) = engine();
        settle(&engine);
        let world = Rect::new(
            geo_types::coord! { x: -180.0, y: -85.0 },
            geo_types::coord! { x: 180.0, y: 85.0 },
        );

        assert_eq!(
            engine.tile_urls("osm", &world, 0).unwrap(),
            vec!["https://a.tile.example/0/0/0.png"]
        );
        assert_eq!(engine.tile_urls("osm", &world, 1).unwrap().len(), 4);
        // hidden basemap was never materialized
        assert!(engine.tile_urls("imagery", &world, 0).unwrap().is_empty());
        assert!(matches!(
            engine.tile_urls("nope", &world, 0),
            Err(EngineError::UnknownLayer(_))
        ));
    }

    #[test]
    fn label_over_removed_upload_disappears() {
        let groups = r#"[{"id": "sites", "name": "Sites", "layers": [
            {"id": "site-names", "name": "Site names", "type": "label",
             "sourceLayerId": "sites.csv", "labelProperty": "name", "visible": true}
        ]}]"#;
        let shared: Rc<dyn SourceFetcher> = Rc::new(MockFetcher::default());
        let engine = Engine::from_json(groups, EngineConfig::default(), shared).unwrap();
        settle(&engine);
        assert!(engine.materialized_layer("site-names").is_none());

        engine.upload_file("sites.csv", b"name,lat,lon\nA,1,2\n").unwrap();
        settle(&engine);
        match engine.materialized_layer("site-names").map(|m| m.renderable) {
            Some(Renderable::Label(overlay)) => {
                assert_eq!(overlay.markers[0].text, "A");
                assert_eq!(overlay.markers[0].position, [2.0, 1.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        engine.drain_events();

        engine.remove_uploaded_layer("sites.csv").unwrap();
        settle(&engine);
        assert!(engine.materialized_layer("site-names").is_none());
        assert!(engine.drain_events().contains(&EngineEvent::Removed {
            layer_id: "site-names".into()
        }));
    }

    #[test]
    fn unknown_layer_operations_fail() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.toggle_visibility("nope"),
            Err(EngineError::UnknownLayer(_))
        ));
        assert!(engine.set_opacity("nope", 0.5).is_err());
    }
}
