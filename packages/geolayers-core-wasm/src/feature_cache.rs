use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::geojson_features::FeatureCollection;

/// One published collection. Entries are immutable once published; a reload
/// publishes a fresh entry with a higher revision.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub data: Arc<FeatureCollection>,
    /// Source identity the data was loaded from (see `Layer::source_key`).
    pub source_key: String,
    pub revision: u64,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub features: usize,
    pub hits: usize,
    pub misses: usize,
    pub hit_rate: f64,
}

/// Parsed feature collections keyed by layer id, shared between the loader
/// and label derivation.
#[derive(Default)]
pub struct FeatureCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    next_revision: AtomicU64,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl FeatureCache {
    pub fn new() -> Self {
        FeatureCache {
            next_revision: AtomicU64::new(1),
            ..FeatureCache::default()
        }
    }

    /// Replace the entry for `layer_id` wholesale and hand back the new entry.
    pub fn publish(
        &self,
        layer_id: &str,
        source_key: &str,
        data: impl Into<Arc<FeatureCollection>>,
    ) -> CacheEntry {
        let revision = self.next_revision.fetch_add(1, Ordering::Relaxed).max(1);
        let entry = CacheEntry {
            data: data.into(),
            source_key: source_key.to_string(),
            revision,
        };
        self.entries.write().insert(layer_id.to_string(), entry.clone());
        entry
    }

    pub fn get(&self, layer_id: &str) -> Option<CacheEntry> {
        let entry = self.entries.read().get(layer_id).cloned();
        self.record(entry.is_some());
        entry
    }

    /// Entry only if it was loaded from `source_key`. An entry from an older
    /// source counts as a miss.
    pub fn get_current(&self, layer_id: &str, source_key: &str) -> Option<CacheEntry> {
        let entry = self
            .entries
            .read()
            .get(layer_id)
            .filter(|e| e.source_key == source_key)
            .cloned();
        self.record(entry.is_some());
        entry
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn contains(&self, layer_id: &str) -> bool {
        self.entries.read().contains_key(layer_id)
    }

    pub fn evict(&self, layer_id: &str) -> bool {
        self.entries.write().remove(layer_id).is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: entries.len(),
            features: entries.values().map(|e| e.data.len()).sum(),
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}
