// Utility functions to generate consistent materialization keys.
//
// A materialized layer remembers the key it was built from; when the key
// derived from the current registry, criteria and cache differs, the layer is
// rebuilt. Opacity and visibility are synced in place and never part of a key.

use std::collections::BTreeMap;

use crate::filter::FilterCriteria;
use crate::registry::{Layer, LayerType};

fn kind_prefix(kind: LayerType) -> &'static str {
    match kind {
        LayerType::Tile => "tile",
        LayerType::Vector => "vector",
        LayerType::Label => "label",
    }
}

fn style_key(layer: &Layer) -> String {
    layer
        .style
        .as_ref()
        .and_then(|s| serde_json::to_string(s).ok())
        .unwrap_or_default()
}

/// Join key parts, skipping empty ones: "vector|a|b".
pub fn make_inner_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("|")
}

pub fn make_tile_key(layer: &Layer) -> String {
    let subdomains = layer.subdomains.as_ref().map(|s| s.join(",")).unwrap_or_default();
    make_inner_key(&[
        kind_prefix(LayerType::Tile),
        layer.url.as_deref().unwrap_or_default(),
        layer.attribution.as_deref().unwrap_or_default(),
        &subdomains,
    ])
}

/// Vector key: source identity + cache revision + style + the filter
/// constraints this layer maps.
pub fn make_vector_key(layer: &Layer, cache_revision: u64, criteria: &FilterCriteria) -> String {
    let popup = layer
        .popup_properties
        .as_ref()
        .map(|p| p.join(","))
        .unwrap_or_default();
    make_inner_key(&[
        kind_prefix(LayerType::Vector),
        &layer.source_key(),
        &format!("rev{}", cache_revision),
        &style_key(layer),
        &criteria.relevant_key(layer.filter_properties.as_ref()),
        &popup,
    ])
}

/// Label key: the source layer's cache revision and filter constraints plus
/// the label layer's own property and style.
pub fn make_label_key(
    layer: &Layer,
    source_revision: u64,
    source_mapping: Option<&BTreeMap<String, String>>,
    criteria: &FilterCriteria,
) -> String {
    make_inner_key(&[
        kind_prefix(LayerType::Label),
        layer.source_layer_id.as_deref().unwrap_or_default(),
        &format!("rev{}", source_revision),
        layer.label_property.as_deref().unwrap_or_default(),
        &style_key(layer),
        &criteria.relevant_key(source_mapping),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{REGION, SUBREGION};

    #[test]
    fn vector_key_ignores_unmapped_criteria() {
        let layer = Layer::vector("kel", "Kelurahan", "/kel.geojson").with_filter(SUBREGION, "KELURAHAN");
        let base = make_vector_key(&layer, 1, &FilterCriteria::new());
        let unrelated = make_vector_key(&layer, 1, &FilterCriteria::new().with(REGION, "North"));
        let related = make_vector_key(&layer, 1, &FilterCriteria::new().with(SUBREGION, "X"));
        assert_eq!(base, unrelated);
        assert_ne!(base, related);
        assert_ne!(base, make_vector_key(&layer, 2, &FilterCriteria::new()));
        assert!(base.starts_with("vector|"));
    }

    #[test]
    fn label_key_tracks_source_revision() {
        let layer = Layer::label("kel-names", "Names", "kel", "NAME");
        let a = make_label_key(&layer, 1, None, &FilterCriteria::new());
        let b = make_label_key(&layer, 2, None, &FilterCriteria::new());
        assert_ne!(a, b);
    }

    #[test]
    fn inner_key_skips_empty_parts() {
        assert_eq!(make_inner_key(&["tile", "", "x"]), "tile|x");
    }
}
