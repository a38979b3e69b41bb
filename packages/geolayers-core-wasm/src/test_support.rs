// Scripted fetcher and fixtures shared by the loader and engine tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::fetch::SourceFetcher;

/// Serves canned bodies per url. The n-th request for a url gets the n-th
/// body (the last one once they run out); queued gates hold requests back in
/// call order until released.
#[derive(Default)]
pub struct MockFetcher {
    responses: RefCell<HashMap<String, Vec<Vec<u8>>>>,
    calls: RefCell<Vec<String>>,
    gates: RefCell<VecDeque<oneshot::Receiver<()>>>,
    pub hanging: RefCell<HashSet<String>>,
    pub timer_fires: Cell<bool>,
}

impl MockFetcher {
    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.responses
            .borrow_mut()
            .entry(url.to_string())
            .or_default()
            .push(body);
    }

    /// Hold back the next request until the returned sender fires.
    pub fn gate(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.borrow_mut().push_back(rx);
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl SourceFetcher for MockFetcher {
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Vec<u8>>> {
        let attempt = self.calls.borrow().iter().filter(|u| *u == url).count();
        self.calls.borrow_mut().push(url.to_string());
        if self.hanging.borrow().contains(url) {
            return future::pending().boxed_local();
        }

        let body = self
            .responses
            .borrow()
            .get(url)
            .and_then(|bodies| bodies.get(attempt).or(bodies.last()).cloned());
        let gate = self.gates.borrow_mut().pop_front();
        let url = url.to_string();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            body.ok_or_else(|| EngineError::fetch(&url, "404 Not Found"))
        }
        .boxed_local()
    }

    fn sleep(&self, _ms: u32) -> LocalBoxFuture<'static, ()> {
        if self.timer_fires.get() {
            future::ready(()).boxed_local()
        } else {
            future::pending().boxed_local()
        }
    }
}

/// Point features at (i, i) with `NAME` and `KELURAHAN` both set to the name.
pub fn villages(names: &[&str]) -> Vec<u8> {
    let features: Vec<Value> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            json!({
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [i as f64, i as f64]},
                "properties": {"NAME": name, "KELURAHAN": name}
            })
        })
        .collect();
    serde_json::to_vec(&json!({"type": "FeatureCollection", "features": features})).unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
