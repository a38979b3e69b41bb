use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::geojson_features::{value_as_text, Feature};

pub type StyleProps = Map<String, Value>;

lazy_static! {
    /// Path options applied when a vector layer declares no style.
    pub static ref DEFAULT_VECTOR_STYLE: StyleProps = as_map(json!({
        "color": "#3388ff",
        "weight": 2,
        "opacity": 1.0,
        "fillColor": "#3388ff",
        "fillOpacity": 0.2
    }));

    /// Text options applied to derived label markers.
    pub static ref DEFAULT_LABEL_STYLE: StyleProps = as_map(json!({
        "className": "map-label",
        "fontSize": "12px",
        "color": "#222222",
        "haloColor": "#ffffff"
    }));
}

fn as_map(value: Value) -> StyleProps {
    match value {
        Value::Object(map) => map,
        _ => StyleProps::new(),
    }
}

/// One data-driven override: applies `style` when the feature's `property`
/// equals `equals`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StyleRule {
    pub property: String,
    pub equals: Value,
    pub style: StyleProps,
}

/// Declarative per-feature style. Resolution order: built-in default, then
/// `base`, then every matching rule in declaration order.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct LayerStyle {
    pub base: StyleProps,
    pub rules: Vec<StyleRule>,
}

impl LayerStyle {
    pub fn resolve(&self, defaults: &StyleProps, feature: &Feature) -> StyleProps {
        let mut resolved = defaults.clone();
        merge(&mut resolved, &self.base);
        for rule in &self.rules {
            let matched = match feature.properties.as_ref().and_then(|p| p.get(&rule.property)) {
                Some(value) => {
                    value == &rule.equals
                        || matches!(
                            (value_as_text(value), value_as_text(&rule.equals)),
                            (Some(a), Some(b)) if a == b
                        )
                }
                None => false,
            };
            if matched {
                merge(&mut resolved, &rule.style);
            }
        }
        resolved
    }

    /// Style for things that have no feature attached (label text).
    pub fn resolve_static(&self, defaults: &StyleProps) -> StyleProps {
        let mut resolved = defaults.clone();
        merge(&mut resolved, &self.base);
        resolved
    }
}

fn merge(target: &mut StyleProps, overlay: &StyleProps) {
    for (key, value) in overlay {
        target.insert(key.clone(), value.clone());
    }
}

/// Resolve against the vector defaults when the layer has no style at all.
pub fn resolve_feature_style(style: Option<&LayerStyle>, feature: &Feature) -> StyleProps {
    match style {
        Some(style) => style.resolve(&DEFAULT_VECTOR_STYLE, feature),
        None => DEFAULT_VECTOR_STYLE.clone(),
    }
}
