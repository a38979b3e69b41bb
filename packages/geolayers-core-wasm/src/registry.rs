//! Layer registry: the canonical, mutable description of every layer group
//! and layer. All operations are pure state transitions; the loader is
//! responsible for bringing materialized state in line afterwards.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::geojson_features::FeatureCollection;
use crate::style::LayerStyle;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Tile,
    Vector,
    Label,
}

fn default_opacity() -> f64 {
    1.0
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: LayerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing)]
    pub inline_data: Option<Arc<FeatureCollection>>,
    #[serde(default)]
    pub visible: bool,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<LayerStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    /// Filled in from the owning group when the registry is built.
    #[serde(default)]
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_layer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_property: Option<String>,
    /// Filter constraint key -> feature property it is compared against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_properties: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popup_properties: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_zoom: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_zoom: Option<u8>,
    /// Bumped whenever the layer's data source is replaced.
    #[serde(skip)]
    pub source_revision: u64,
}

impl Layer {
    fn base(id: &str, name: &str, kind: LayerType) -> Self {
        Layer {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            url: None,
            inline_data: None,
            visible: false,
            opacity: 1.0,
            style: None,
            attribution: None,
            group: String::new(),
            source_layer_id: None,
            label_property: None,
            filter_properties: None,
            popup_properties: None,
            subdomains: None,
            min_zoom: None,
            max_zoom: None,
            source_revision: 0,
        }
    }

    pub fn tile(id: &str, name: &str, url_template: &str) -> Self {
        Layer {
            url: Some(url_template.to_string()),
            ..Layer::base(id, name, LayerType::Tile)
        }
    }

    pub fn vector(id: &str, name: &str, url: &str) -> Self {
        Layer {
            url: Some(url.to_string()),
            ..Layer::base(id, name, LayerType::Vector)
        }
    }

    pub fn inline(id: &str, name: &str, data: FeatureCollection) -> Self {
        Layer {
            inline_data: Some(Arc::new(data)),
            ..Layer::base(id, name, LayerType::Vector)
        }
    }

    pub fn label(id: &str, name: &str, source_layer_id: &str, label_property: &str) -> Self {
        Layer {
            source_layer_id: Some(source_layer_id.to_string()),
            label_property: Some(label_property.to_string()),
            ..Layer::base(id, name, LayerType::Label)
        }
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn with_filter(mut self, key: &str, property: &str) -> Self {
        self.filter_properties
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), property.to_string());
        self
    }

    pub fn is_filterable(&self) -> bool {
        self.filter_properties
            .as_ref()
            .map_or(false, |mapping| !mapping.is_empty())
    }

    /// Identity of the data this layer loads: changes whenever the url or
    /// the inline payload is replaced.
    pub fn source_key(&self) -> String {
        match (&self.url, &self.inline_data) {
            (_, Some(_)) => format!("inline#{}", self.source_revision),
            (Some(url), None) => format!("{}#{}", url, self.source_revision),
            (None, None) => format!("none#{}", self.source_revision),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LayerGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

pub fn clamp_opacity(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug)]
pub struct Registry {
    groups: Vec<LayerGroup>,
    basemap_group_id: String,
    uploaded_group_id: String,
    uploaded_group_name: String,
    next_revision: u64,
}

impl Registry {
    pub fn new(config: &EngineConfig) -> Self {
        Registry {
            groups: Vec::new(),
            basemap_group_id: config.basemap_group_id.clone(),
            uploaded_group_id: config.uploaded_group_id.clone(),
            uploaded_group_name: config.uploaded_group_name.clone(),
            next_revision: 1,
        }
    }

    /// Build from static configuration, normalising what the invariants
    /// require: owning group recorded on each layer, opacity clamped, at most
    /// one visible basemap. Duplicate ids are rejected.
    pub fn from_groups(groups: Vec<LayerGroup>, config: &EngineConfig) -> Result<Self> {
        let mut registry = Registry::new(config);
        let mut seen_groups = HashSet::new();
        let mut seen_layers = HashSet::new();

        for mut group in groups {
            if !seen_groups.insert(group.id.clone()) {
                return Err(EngineError::Validation(format!(
                    "duplicate layer group id {}",
                    group.id
                )));
            }
            let mut basemap_visible = false;
            for layer in group.layers.iter_mut() {
                if !seen_layers.insert(layer.id.clone()) {
                    return Err(EngineError::Validation(format!(
                        "duplicate layer id {}",
                        layer.id
                    )));
                }
                layer.group = group.id.clone();
                layer.opacity = clamp_opacity(layer.opacity);
                if group.id == registry.basemap_group_id && layer.visible {
                    if basemap_visible {
                        warn!("Basemap {} configured visible alongside another; hiding it", layer.id);
                        layer.visible = false;
                    }
                    basemap_visible = true;
                }
            }
            registry.groups.push(group);
        }
        Ok(registry)
    }

    pub fn from_json(json: &str, config: &EngineConfig) -> Result<Self> {
        let groups: Vec<LayerGroup> =
            serde_json::from_str(json).map_err(|e| EngineError::parse("layer configuration", e))?;
        Registry::from_groups(groups, config)
    }

    pub fn groups(&self) -> &[LayerGroup] {
        &self.groups
    }

    /// All layers in display order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.groups.iter().flat_map(|g| g.layers.iter())
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers().find(|l| l.id == id)
    }

    fn layer_mut(&mut self, id: &str) -> Result<&mut Layer> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.layers.iter_mut())
            .find(|l| l.id == id)
            .ok_or_else(|| EngineError::UnknownLayer(id.to_string()))
    }

    pub fn toggle_visibility(&mut self, id: &str) -> Result<bool> {
        let visible = !self.layer_mut(id)?.visible;
        self.set_visibility(id, visible)?;
        Ok(visible)
    }

    /// Showing a basemap hides its siblings in the same transition.
    pub fn set_visibility(&mut self, id: &str, visible: bool) -> Result<()> {
        let layer = self.layer_mut(id)?;
        layer.visible = visible;
        let group_id = layer.group.clone();

        if visible && group_id == self.basemap_group_id {
            if let Some(group) = self.groups.iter_mut().find(|g| g.id == group_id) {
                for sibling in group.layers.iter_mut().filter(|l| l.id != id) {
                    sibling.visible = false;
                }
            }
        }
        debug!("Layer {} visibility -> {}", id, visible);
        Ok(())
    }

    pub fn set_opacity(&mut self, id: &str, value: f64) -> Result<f64> {
        let layer = self.layer_mut(id)?;
        layer.opacity = clamp_opacity(value);
        Ok(layer.opacity)
    }

    /// Register a layer created from an uploaded file. Re-uploading a file
    /// with the same name replaces the earlier layer.
    pub fn add_uploaded_layer(&mut self, mut layer: Layer) -> Result<()> {
        if let Some(existing) = self.layer(&layer.id) {
            if existing.group != self.uploaded_group_id {
                return Err(EngineError::Validation(format!(
                    "layer id {} is already used by a configured layer",
                    layer.id
                )));
            }
        }

        layer.group = self.uploaded_group_id.clone();
        layer.opacity = clamp_opacity(layer.opacity);
        layer.source_revision = self.next_revision;
        self.next_revision += 1;

        let uploaded_id = self.uploaded_group_id.clone();
        let group = match self.groups.iter().position(|g| g.id == uploaded_id) {
            Some(index) => &mut self.groups[index],
            None => {
                self.groups.push(LayerGroup {
                    id: uploaded_id,
                    name: self.uploaded_group_name.clone(),
                    layers: Vec::new(),
                });
                let last = self.groups.len() - 1;
                &mut self.groups[last]
            }
        };

        match group.layers.iter_mut().find(|l| l.id == layer.id) {
            Some(slot) => *slot = layer,
            None => group.layers.push(layer),
        }
        Ok(())
    }

    /// Remove an uploaded layer; the uploaded group disappears with its last
    /// layer.
    pub fn remove_uploaded_layer(&mut self, id: &str) -> Result<Layer> {
        let index = self
            .groups
            .iter()
            .position(|g| g.id == self.uploaded_group_id)
            .ok_or_else(|| EngineError::UnknownLayer(id.to_string()))?;

        let group = &mut self.groups[index];
        let position = group
            .layers
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| EngineError::UnknownLayer(id.to_string()))?;
        let removed = group.layers.remove(position);

        if group.layers.is_empty() {
            self.groups.remove(index);
        }
        Ok(removed)
    }

    /// Mark a layer's data source as replaced so cached data keyed on the
    /// old source is no longer considered current.
    pub fn bump_source_revision(&mut self, id: &str) -> Result<u64> {
        let revision = self.next_revision;
        self.next_revision += 1;
        self.layer_mut(id)?.source_revision = revision;
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Registry {
        let groups = vec![
            LayerGroup {
                id: "basemap".into(),
                name: "Base maps".into(),
                layers: vec![
                    Layer::tile("osm", "OpenStreetMap", "https://tile.example/{z}/{x}/{y}.png")
                        .visible(true),
                    Layer::tile("sat", "Satellite", "https://sat.example/{z}/{y}/{x}"),
                    Layer::tile("topo", "Topo", "https://topo.example/{z}/{x}/{y}.png")
                        .visible(true),
                ],
            },
            LayerGroup {
                id: "boundaries".into(),
                name: "Boundaries".into(),
                layers: vec![Layer::vector("kelurahan", "Kelurahan", "/data/kelurahan.geojson")],
            },
        ];
        Registry::from_groups(groups, &EngineConfig::default()).unwrap()
    }

    fn visible_basemaps(registry: &Registry) -> Vec<String> {
        registry
            .layers()
            .filter(|l| l.visible && l.group == "basemap")
            .map(|l| l.id.clone())
            .collect()
    }

    #[test]
    fn configuration_keeps_single_visible_basemap() {
        let registry = sample();
        assert_eq!(visible_basemaps(&registry), vec!["osm"]);
        assert_eq!(registry.layer("kelurahan").unwrap().group, "boundaries");
    }

    #[test]
    fn activating_basemap_leaves_exactly_one_visible() {
        let mut registry = sample();
        for id in ["sat", "topo", "osm", "sat"] {
            registry.set_visibility(id, true).unwrap();
            assert_eq!(visible_basemaps(&registry), vec![id.to_string()]);
        }
        assert!(registry.toggle_visibility("topo").unwrap());
        assert_eq!(visible_basemaps(&registry), vec!["topo"]);
    }

    #[test]
    fn toggling_non_basemap_does_not_touch_others() {
        let mut registry = sample();
        assert!(registry.toggle_visibility("kelurahan").unwrap());
        assert_eq!(visible_basemaps(&registry), vec!["osm"]);
        assert!(!registry.toggle_visibility("kelurahan").unwrap());
    }

    #[test]
    fn opacity_is_clamped() {
        let mut registry = sample();
        for (input, expected) in [
            (0.4, 0.4),
            (-3.0, 0.0),
            (1.7, 1.0),
            (0.0, 0.0),
            (1.0, 1.0),
            (f64::INFINITY, 1.0),
            (f64::NEG_INFINITY, 0.0),
            (f64::NAN, 0.0),
        ] {
            assert_eq!(registry.set_opacity("osm", input).unwrap(), expected);
            assert_eq!(registry.layer("osm").unwrap().opacity, expected);
        }
    }

    #[test]
    fn unknown_layer_is_an_error() {
        let mut registry = sample();
        assert_eq!(
            registry.toggle_visibility("nope"),
            Err(EngineError::UnknownLayer("nope".into()))
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let groups = vec![
            LayerGroup {
                id: "a".into(),
                name: "A".into(),
                layers: vec![Layer::vector("x", "X", "/x.geojson")],
            },
            LayerGroup {
                id: "b".into(),
                name: "B".into(),
                layers: vec![Layer::vector("x", "X again", "/x2.geojson")],
            },
        ];
        assert!(matches!(
            Registry::from_groups(groups, &EngineConfig::default()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn uploaded_group_lifecycle() {
        let mut registry = sample();
        assert!(!registry.groups().iter().any(|g| g.id == "uploaded"));

        let upload = Layer::inline("points.csv", "points.csv", FeatureCollection::default());
        registry.add_uploaded_layer(upload.clone()).unwrap();
        assert!(registry.groups().iter().any(|g| g.id == "uploaded"));
        assert_eq!(registry.groups().last().unwrap().id, "uploaded");
        assert_eq!(registry.layer("points.csv").unwrap().group, "uploaded");

        registry.remove_uploaded_layer("points.csv").unwrap();
        assert!(!registry.groups().iter().any(|g| g.id == "uploaded"));

        registry.add_uploaded_layer(upload).unwrap();
        assert!(registry.groups().iter().any(|g| g.id == "uploaded"));
    }

    #[test]
    fn reupload_replaces_and_bumps_revision() {
        let mut registry = sample();
        let upload = Layer::inline("a.geojson", "a.geojson", FeatureCollection::default());
        registry.add_uploaded_layer(upload.clone()).unwrap();
        let first = registry.layer("a.geojson").unwrap().source_key();
        registry.add_uploaded_layer(upload).unwrap();
        assert_eq!(registry.groups().last().unwrap().layers.len(), 1);
        assert_ne!(registry.layer("a.geojson").unwrap().source_key(), first);
    }

    #[test]
    fn upload_cannot_shadow_configured_layer() {
        let mut registry = sample();
        let clash = Layer::inline("kelurahan", "kelurahan", FeatureCollection::default());
        assert!(matches!(
            registry.add_uploaded_layer(clash),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            registry.remove_uploaded_layer("kelurahan"),
            Err(EngineError::UnknownLayer(_))
        ));
    }

    #[test]
    fn parses_json_configuration() {
        let json = r#"[
            {"id": "facilities", "name": "Facilities", "layers": [
                {"id": "schools", "name": "Schools", "type": "vector",
                 "url": "/data/schools.geojson", "visible": true, "opacity": 3,
                 "filterProperties": {"region": "PROVINSI"}},
                {"id": "school-labels", "name": "School names", "type": "label",
                 "sourceLayerId": "schools", "labelProperty": "NAME"}
            ]}
        ]"#;
        let registry = Registry::from_json(json, &EngineConfig::default()).unwrap();
        let schools = registry.layer("schools").unwrap();
        assert_eq!(schools.kind, LayerType::Vector);
        assert_eq!(schools.opacity, 1.0);
        assert!(schools.is_filterable());
        let labels = registry.layer("school-labels").unwrap();
        assert_eq!(labels.kind, LayerType::Label);
        assert!(!labels.visible);
        assert_eq!(labels.source_layer_id.as_deref(), Some("schools"));
    }
}
