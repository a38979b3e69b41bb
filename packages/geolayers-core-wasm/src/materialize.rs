// Builders turning a layer plus its cached features into renderables.
// All of these are synchronous; the loader decides when to call them.

use log::debug;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::filter::{FeatureFilter, FilterCriteria};
use crate::geojson_features::{bounds_of, value_as_text, Feature, FeatureCollection};
use crate::labels::{derive_labels, LabelOverlay};
use crate::models::{StyledFeature, VectorOverlay};
use crate::registry::Layer;
use crate::style::resolve_feature_style;
use crate::tile::RasterReference;

pub fn build_tile(layer: &Layer) -> Result<RasterReference> {
    RasterReference::from_layer(layer).ok_or_else(|| {
        EngineError::Validation(format!("tile layer {} has no url template", layer.id))
    })
}

/// Filter, style and summarise the features of one vector layer.
pub fn build_vector(
    layer: &Layer,
    source: &FeatureCollection,
    criteria: &FilterCriteria,
) -> VectorOverlay {
    let filter = if layer.is_filterable() {
        FeatureFilter::new(layer.filter_properties.as_ref(), criteria)
    } else {
        FeatureFilter::none()
    };
    let popup_fields = layer.popup_properties.as_deref();

    let included: Vec<(usize, &Feature)> = source
        .features
        .iter()
        .enumerate()
        .filter(|(_, feature)| filter.includes(feature))
        .collect();

    let bounds = bounds_of(included.iter().map(|(_, f)| *f))
        .map(|rect| [rect.min().x, rect.min().y, rect.max().x, rect.max().y]);

    let features = included
        .into_iter()
        .map(|(index, feature)| StyledFeature {
            feature_index: index,
            feature: feature.to_geojson_value(),
            style: resolve_feature_style(layer.style.as_ref(), feature),
            popup: summary_popup(feature, popup_fields),
        })
        .collect::<Vec<_>>();

    if !filter.is_noop() {
        debug!(
            "Layer {}: {} of {} features pass the filter",
            layer.id,
            features.len(),
            source.len()
        );
    }

    VectorOverlay {
        features,
        source_features: source.len(),
        bounds,
    }
}

/// Label overlay over `source_layer`'s cached features, filtered with the
/// source layer's own mapping.
pub fn build_label(
    layer: &Layer,
    source_layer: &Layer,
    source: &FeatureCollection,
    criteria: &FilterCriteria,
    max_markers: Option<usize>,
) -> Result<LabelOverlay> {
    let label_property = layer.label_property.as_deref().ok_or_else(|| {
        EngineError::Validation(format!("label layer {} has no labelProperty", layer.id))
    })?;
    let filter = FeatureFilter::new(source_layer.filter_properties.as_ref(), criteria);
    Ok(derive_labels(
        &source_layer.id,
        source,
        label_property,
        &filter,
        layer.style.as_ref(),
        max_markers,
    ))
}

/// `key: value` lines for a feature's properties, HTML-escaped. `only`
/// restricts and orders the keys shown.
pub fn summary_popup(feature: &Feature, only: Option<&[String]>) -> Option<String> {
    let properties = feature.properties.as_ref()?;

    let line = |key: &str, value: &Value| -> Option<String> {
        let text = match value {
            Value::Null => return None,
            Value::Array(_) | Value::Object(_) => value.to_string(),
            scalar => value_as_text(scalar)?,
        };
        Some(format!(
            "<strong>{}</strong>: {}",
            escape_html(key),
            escape_html(&text)
        ))
    };

    let lines: Vec<String> = match only {
        Some(keys) => keys
            .iter()
            .filter_map(|key| properties.get(key).and_then(|v| line(key, v)))
            .collect(),
        None => properties
            .iter()
            .filter_map(|(key, value)| line(key, value))
            .collect(),
    };

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("<br/>"))
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
