// Per-layer loading and materialization.
//
// `reconcile` compares the registry and filter criteria against what has been
// materialized so far. Layers whose inputs are already cached are rebuilt on
// the spot; the rest get a load task the caller drives to completion. A load
// commits only while its ticket is still the current one for that layer, and
// its prebuilt result is only used when the desired state did not move on in
// the meantime.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, info, warn};

use crate::cache_keys::{make_label_key, make_tile_key, make_vector_key};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::feature_cache::{CacheEntry, FeatureCache};
use crate::fetch::{fetch_source, SourceFetcher};
use crate::filter::FilterCriteria;
use crate::geojson_features::FeatureCollection;
use crate::ingest::{parse_source, SourceFormat};
use crate::materialize::{build_label, build_tile, build_vector};
use crate::models::{EngineEvent, LoadState, MaterializedLayer, Renderable, VectorOverlay};
use crate::registry::{Layer, LayerType, Registry};

/// Pending fetch + parse + commit for one layer.
pub type LoadTask = LocalBoxFuture<'static, ()>;

struct InFlight {
    ticket: u64,
    source_key: String,
}

struct Failure {
    source_key: String,
    retryable: bool,
}

/// Everything the loader has produced from the desired state.
#[derive(Default)]
pub struct LoaderState {
    materialized: HashMap<String, MaterializedLayer>,
    load_states: HashMap<String, LoadState>,
    in_flight: HashMap<String, InFlight>,
    failures: HashMap<String, Failure>,
    events: Vec<EngineEvent>,
    next_ticket: u64,
}

impl LoaderState {
    pub fn materialized(&self, layer_id: &str) -> Option<&MaterializedLayer> {
        self.materialized.get(layer_id)
    }

    /// Materialized layers in display order.
    pub fn materialized_layers(&self) -> Vec<&MaterializedLayer> {
        let mut layers: Vec<&MaterializedLayer> = self.materialized.values().collect();
        layers.sort_by_key(|m| m.z_index);
        layers
    }

    pub fn load_state(&self, layer_id: &str) -> LoadState {
        self.load_states
            .get(layer_id)
            .copied()
            .unwrap_or(LoadState::Unloaded)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drop everything known about a layer. A load still running for it
    /// will find its ticket gone and be discarded.
    pub fn forget(&mut self, layer_id: &str) {
        if self.materialized.remove(layer_id).is_some() {
            self.events.push(EngineEvent::Removed {
                layer_id: layer_id.to_string(),
            });
        }
        self.load_states.remove(layer_id);
        self.in_flight.remove(layer_id);
        self.failures.remove(layer_id);
    }

    fn is_current(&self, layer_id: &str, key: &str) -> bool {
        self.materialized
            .get(layer_id)
            .map_or(false, |m| m.key == key)
    }

    fn install(&mut self, materialized: MaterializedLayer) {
        let layer_id = materialized.layer_id.clone();
        debug!("Materialized layer {}", layer_id);
        self.load_states.insert(layer_id.clone(), LoadState::Materialized);
        self.failures.remove(&layer_id);
        // single insert: the old renderable is replaced, never patched
        self.materialized.insert(layer_id.clone(), materialized);
        self.events.push(EngineEvent::Materialized { layer_id });
    }

    fn sync(&mut self, layer: &Layer, z_index: usize) {
        let Some(m) = self.materialized.get_mut(&layer.id) else {
            return;
        };
        if m.visible == layer.visible && m.opacity == layer.opacity && m.z_index == z_index {
            return;
        }
        m.visible = layer.visible;
        m.opacity = layer.opacity;
        m.z_index = z_index;
        self.events.push(EngineEvent::Synced {
            layer_id: layer.id.clone(),
            visible: m.visible,
            opacity: m.opacity,
            z_index,
        });
    }

    fn fail(&mut self, layer_id: &str, source_key: String, err: EngineError) {
        warn!("Failed to load layer {}: {}", layer_id, err);
        self.load_states.insert(layer_id.to_string(), LoadState::Failed);
        self.failures.insert(
            layer_id.to_string(),
            Failure {
                source_key,
                retryable: err.is_retryable(),
            },
        );
        self.events.push(EngineEvent::LoadFailed {
            layer_id: layer_id.to_string(),
            message: err.to_string(),
        });
    }

    fn gave_up_on(&self, layer: &Layer, source_key: &str) -> bool {
        self.failures
            .get(&layer.id)
            .map_or(false, |f| !f.retryable && f.source_key == source_key)
    }

    fn drop_missing(&mut self, present: &HashSet<&str>) {
        let gone: Vec<String> = self
            .materialized
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        for layer_id in gone {
            debug!("Layer {} left the registry", layer_id);
            self.forget(&layer_id);
        }
        self.in_flight.retain(|id, _| present.contains(id.as_str()));
        self.failures.retain(|id, _| present.contains(id.as_str()));
        self.load_states.retain(|id, _| present.contains(id.as_str()));
    }
}

/// Desired state next to the loader's output, shared by the engine and
/// pending load tasks.
pub struct EngineState {
    pub registry: Registry,
    pub criteria: FilterCriteria,
    pub loader: LoaderState,
}

enum BuildInput {
    Tile,
    Features(CacheEntry),
    Labels { source: Layer, entry: CacheEntry },
}

enum Plan {
    Ready { key: String, input: BuildInput },
    NeedsLoad,
}

/// Desired state captured when a load starts.
struct LoadSnapshot {
    layer: Layer,
    criteria: FilterCriteria,
    ticket: u64,
}

type LoadOutcome = Result<(FeatureCollection, VectorOverlay)>;

#[derive(Clone)]
pub struct Loader {
    state: Rc<RefCell<EngineState>>,
    cache: Arc<FeatureCache>,
    fetcher: Rc<dyn SourceFetcher>,
    config: Rc<EngineConfig>,
}

impl Loader {
    pub fn new(
        registry: Registry,
        cache: Arc<FeatureCache>,
        fetcher: Rc<dyn SourceFetcher>,
        config: Rc<EngineConfig>,
    ) -> Self {
        Loader {
            state: Rc::new(RefCell::new(EngineState {
                registry,
                criteria: FilterCriteria::new(),
                loader: LoaderState::default(),
            })),
            cache,
            fetcher,
            config,
        }
    }

    pub fn state(&self) -> &Rc<RefCell<EngineState>> {
        &self.state
    }

    pub fn cache(&self) -> &Arc<FeatureCache> {
        &self.cache
    }

    pub fn materialized(&self, layer_id: &str) -> Option<MaterializedLayer> {
        self.state.borrow().loader.materialized(layer_id).cloned()
    }

    pub fn load_state(&self, layer_id: &str) -> LoadState {
        self.state.borrow().loader.load_state(layer_id)
    }

    pub fn drain_events(&self) -> Vec<EngineEvent> {
        self.state.borrow_mut().loader.drain_events()
    }

    /// One pass over every layer, label layers after the layers they read
    /// from. Returns the loads that have to run before the remaining layers
    /// can materialize.
    pub fn reconcile(&self) -> Vec<LoadTask> {
        let mut guard = self.state.borrow_mut();
        let EngineState {
            registry,
            criteria,
            loader,
        } = &mut *guard;
        let registry: &Registry = registry;

        let present: HashSet<&str> = registry.layers().map(|l| l.id.as_str()).collect();
        loader.drop_missing(&present);

        // labels go last so they see data their sources cached in this pass
        let (labels, sources): (Vec<_>, Vec<_>) = registry
            .layers()
            .enumerate()
            .partition(|(_, layer)| layer.kind == LayerType::Label);

        let mut tasks = Vec::new();
        for (z_index, layer) in sources.into_iter().chain(labels) {
            if let Some(task) = self.reconcile_layer(layer, z_index, registry, criteria, loader) {
                tasks.push(task);
            }
        }
        if !tasks.is_empty() {
            debug!("Reconcile started {} load(s)", tasks.len());
        }
        tasks
    }

    fn reconcile_layer(
        &self,
        layer: &Layer,
        z_index: usize,
        registry: &Registry,
        criteria: &FilterCriteria,
        loader: &mut LoaderState,
    ) -> Option<LoadTask> {
        // hidden layers keep their renderable around for the next show
        if !layer.visible {
            loader.sync(layer, z_index);
            return None;
        }
        let source_key = layer.source_key();
        if loader.gave_up_on(layer, &source_key) {
            return None;
        }

        match self.plan(layer, registry, criteria) {
            Ok(Plan::Ready { key, input }) => {
                if loader.is_current(&layer.id, &key) {
                    loader.sync(layer, z_index);
                    return None;
                }
                match self.build(layer, input, criteria) {
                    Ok(renderable) => loader.install(MaterializedLayer {
                        layer_id: layer.id.clone(),
                        visible: layer.visible,
                        opacity: layer.opacity,
                        z_index,
                        renderable,
                        key,
                    }),
                    Err(err) => loader.fail(&layer.id, source_key, err),
                }
                None
            }
            Ok(Plan::NeedsLoad) => {
                loader.sync(layer, z_index);
                self.start_load(layer, criteria, loader)
            }
            Err(EngineError::NotReady(reason)) => {
                debug!("Layer {} not ready: {}", layer.id, reason);
                // markers must not outlive the data they were derived from
                loader.forget(&layer.id);
                None
            }
            Err(err) => {
                loader.fail(&layer.id, source_key, err);
                None
            }
        }
    }

    fn plan(&self, layer: &Layer, registry: &Registry, criteria: &FilterCriteria) -> Result<Plan> {
        match layer.kind {
            LayerType::Tile => Ok(Plan::Ready {
                key: make_tile_key(layer),
                input: BuildInput::Tile,
            }),
            LayerType::Vector => {
                let source_key = layer.source_key();
                let entry = match (
                    self.cache.get_current(&layer.id, &source_key),
                    &layer.inline_data,
                ) {
                    (Some(entry), _) => entry,
                    (None, Some(data)) => {
                        debug!("Caching inline data of layer {}", layer.id);
                        self.cache.publish(&layer.id, &source_key, Arc::clone(data))
                    }
                    (None, None) => return Ok(Plan::NeedsLoad),
                };
                Ok(Plan::Ready {
                    key: make_vector_key(layer, entry.revision, criteria),
                    input: BuildInput::Features(entry),
                })
            }
            LayerType::Label => {
                let source_id = layer.source_layer_id.as_deref().ok_or_else(|| {
                    EngineError::Validation(format!("label layer {} has no sourceLayerId", layer.id))
                })?;
                let source = registry.layer(source_id).ok_or_else(|| {
                    EngineError::NotReady(format!("source layer {} is not registered", source_id))
                })?;
                let entry = self
                    .cache
                    .get_current(source_id, &source.source_key())
                    .ok_or_else(|| {
                        EngineError::NotReady(format!("source layer {} is not cached", source_id))
                    })?;
                Ok(Plan::Ready {
                    key: make_label_key(
                        layer,
                        entry.revision,
                        source.filter_properties.as_ref(),
                        criteria,
                    ),
                    input: BuildInput::Labels {
                        source: source.clone(),
                        entry,
                    },
                })
            }
        }
    }

    fn build(&self, layer: &Layer, input: BuildInput, criteria: &FilterCriteria) -> Result<Renderable> {
        Ok(match input {
            BuildInput::Tile => Renderable::Tile(build_tile(layer)?),
            BuildInput::Features(entry) => {
                Renderable::Vector(build_vector(layer, &entry.data, criteria))
            }
            BuildInput::Labels { source, entry } => Renderable::Label(build_label(
                layer,
                &source,
                &entry.data,
                criteria,
                self.config.max_label_features,
            )?),
        })
    }

    fn start_load(
        &self,
        layer: &Layer,
        criteria: &FilterCriteria,
        loader: &mut LoaderState,
    ) -> Option<LoadTask> {
        let source_key = layer.source_key();
        if loader
            .in_flight
            .get(&layer.id)
            .map_or(false, |f| f.source_key == source_key)
        {
            debug!("Load of layer {} already in flight", layer.id);
            return None;
        }
        let Some(url) = layer.url.clone() else {
            loader.fail(
                &layer.id,
                source_key,
                EngineError::Validation(format!(
                    "vector layer {} has neither url nor inline data",
                    layer.id
                )),
            );
            return None;
        };

        loader.next_ticket += 1;
        let ticket = loader.next_ticket;
        loader.in_flight.insert(layer.id.clone(), InFlight { ticket, source_key });
        loader.load_states.insert(layer.id.clone(), LoadState::Loading);
        loader.events.push(EngineEvent::LoadStarted {
            layer_id: layer.id.clone(),
        });
        info!("Loading layer {} from {}", layer.id, url);

        let snapshot = LoadSnapshot {
            layer: layer.clone(),
            criteria: criteria.clone(),
            ticket,
        };
        let body = fetch_source(self.fetcher.as_ref(), &url, self.config.fetch_timeout_ms);
        let this = self.clone();

        Some(
            async move {
                let outcome = body
                    .await
                    .and_then(|bytes| parse_source(SourceFormat::from_url(&url), &bytes))
                    .map(|data| {
                        let prebuilt = build_vector(&snapshot.layer, &data, &snapshot.criteria);
                        (data, prebuilt)
                    });
                this.commit(snapshot, outcome);
            }
            .boxed_local(),
        )
    }

    fn commit(&self, snapshot: LoadSnapshot, outcome: LoadOutcome) {
        let mut guard = self.state.borrow_mut();
        let EngineState {
            registry,
            criteria,
            loader,
        } = &mut *guard;
        let registry: &Registry = registry;
        let layer_id = snapshot.layer.id.as_str();

        match loader.in_flight.get(layer_id) {
            Some(current) if current.ticket == snapshot.ticket => {}
            _ => {
                debug!("Discarding superseded load of layer {}", layer_id);
                return;
            }
        }
        loader.in_flight.remove(layer_id);

        let source_key = snapshot.layer.source_key();
        let current = match registry.layer(layer_id) {
            Some(layer) if layer.source_key() == source_key => layer,
            _ => {
                debug!("Layer {} changed source while loading", layer_id);
                loader.load_states.remove(layer_id);
                return;
            }
        };

        let (data, prebuilt) = match outcome {
            Ok(loaded) => loaded,
            Err(err) => {
                loader.fail(layer_id, source_key, err);
                return;
            }
        };
        let entry = self.cache.publish(layer_id, &source_key, data);
        info!(
            "Cached {} features for layer {} (revision {})",
            entry.data.len(),
            layer_id,
            entry.revision
        );
        loader.failures.remove(layer_id);
        loader.load_states.insert(layer_id.to_string(), LoadState::Unloaded);

        if current.visible {
            let key = make_vector_key(current, entry.revision, criteria);
            let overlay = if key == make_vector_key(&snapshot.layer, entry.revision, &snapshot.criteria) {
                prebuilt
            } else {
                debug!("Desired state of layer {} moved on; rebuilding from cache", layer_id);
                build_vector(current, &entry.data, criteria)
            };
            let z_index = registry
                .layers()
                .position(|l| l.id == layer_id)
                .unwrap_or_default();
            loader.install(MaterializedLayer {
                layer_id: layer_id.to_string(),
                visible: current.visible,
                opacity: current.opacity,
                z_index,
                renderable: Renderable::Vector(overlay),
                key,
            });
        } else {
            debug!("Layer {} was hidden while loading; data stays cached", layer_id);
        }

        // labels over this layer read the entry just published
        for (z_index, layer) in registry.layers().enumerate() {
            if layer.kind == LayerType::Label && layer.source_layer_id.as_deref() == Some(layer_id) {
                let _ = self.reconcile_layer(layer, z_index, registry, criteria, loader);
            }
        }
    }
}
