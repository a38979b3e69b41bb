// Attribute filter: named equality constraints and the per-feature inclusion
// predicate applied when a filterable layer is materialized.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geojson_features::{value_as_text, Feature};

pub const REGION: &str = "region";
pub const SUBREGION: &str = "subregion";
pub const UNIT: &str = "unit";

/// Optional named constraints. A key that is absent is inactive.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct FilterCriteria {
    constraints: BTreeMap<String, String>,
}

impl FilterCriteria {
    pub fn new() -> Self {
        FilterCriteria::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, Some(value));
        self
    }

    /// Set or clear one constraint. Empty strings clear. Returns whether the
    /// criteria actually changed.
    pub fn set(&mut self, key: &str, value: Option<&str>) -> bool {
        match value.filter(|v| !v.is_empty()) {
            Some(value) => {
                let previous = self.constraints.insert(key.to_string(), value.to_string());
                previous.as_deref() != Some(value)
            }
            None => self.constraints.remove(key).is_some(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.constraints.get(key).map(String::as_str)
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.constraints.is_empty();
        self.constraints.clear();
        changed
    }

    /// Stable text form of only the constraints a layer's mapping uses, so
    /// unrelated criteria changes leave that layer untouched.
    pub fn relevant_key(&self, mapping: Option<&BTreeMap<String, String>>) -> String {
        let Some(mapping) = mapping else {
            return String::new();
        };
        mapping
            .keys()
            .filter_map(|key| self.get(key).map(|value| format!("{}={}", key, value)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Inclusion predicate bound to one layer's property mapping.
pub struct FeatureFilter<'a> {
    checks: Vec<(&'a str, &'a str)>,
}

impl<'a> FeatureFilter<'a> {
    pub fn new(mapping: Option<&'a BTreeMap<String, String>>, criteria: &'a FilterCriteria) -> Self {
        let checks = mapping
            .map(|mapping| {
                mapping
                    .iter()
                    .filter_map(|(key, property)| {
                        criteria.get(key).map(|value| (property.as_str(), value))
                    })
                    .collect()
            })
            .unwrap_or_default();
        FeatureFilter { checks }
    }

    /// Passes everything.
    pub fn none() -> Self {
        FeatureFilter { checks: Vec::new() }
    }

    pub fn is_noop(&self) -> bool {
        self.checks.is_empty()
    }

    /// A feature without properties is always kept; otherwise it is dropped
    /// only when a constrained property is present with a different value.
    pub fn includes(&self, feature: &Feature) -> bool {
        let Some(properties) = feature.properties.as_ref() else {
            return true;
        };
        self.checks.iter().all(|(property, expected)| match properties.get(*property) {
            None | Some(Value::Null) => true,
            Some(value) => value_as_text(value).as_deref() == Some(*expected),
        })
    }
}
