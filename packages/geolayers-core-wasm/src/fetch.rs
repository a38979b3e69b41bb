// Remote source fetching. The browser side supplies the actual transfer
// through `wasmJsHelpers.fetch`; the loader only sees the `SourceFetcher`
// trait so it can be driven by a scripted fetcher in tests.

use std::io::Read;

use flate2::read::GzDecoder;
use futures::future::{self, Either, FutureExt, LocalBoxFuture};
use js_sys::{Function, Promise, Uint8Array};
use log::{debug, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use crate::error::{EngineError, Result};

#[wasm_bindgen]
extern "C" {
    // JavaScript function to fetch data from URL
    #[wasm_bindgen(js_namespace = wasmJsHelpers, catch)]
    fn fetch(url: &str) -> std::result::Result<Promise, JsValue>;

    // Global-scope timer, present in windows and workers alike
    #[wasm_bindgen(js_name = setTimeout, catch)]
    fn set_timeout(handler: &Function, timeout_ms: i32) -> std::result::Result<JsValue, JsValue>;
}

pub trait SourceFetcher {
    /// Raw response body for `url`.
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Vec<u8>>>;

    /// Resolves after `ms` milliseconds. Used to bound fetches.
    fn sleep(&self, ms: u32) -> LocalBoxFuture<'static, ()>;
}

/// Fetcher backed by the page's `wasmJsHelpers.fetch` bridge, which resolves
/// to an `ArrayBuffer` or `Uint8Array`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsFetcher;

fn js_error_text(err: &JsValue) -> String {
    err.as_string().unwrap_or_else(|| format!("{:?}", err))
}

impl SourceFetcher for JsFetcher {
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Vec<u8>>> {
        let url = url.to_string();
        async move {
            let promise = fetch(&url).map_err(|e| EngineError::fetch(&url, js_error_text(&e)))?;
            let body = JsFuture::from(promise)
                .await
                .map_err(|e| EngineError::fetch(&url, js_error_text(&e)))?;
            Ok(Uint8Array::new(&body).to_vec())
        }
        .boxed_local()
    }

    fn sleep(&self, ms: u32) -> LocalBoxFuture<'static, ()> {
        let delay = i32::try_from(ms).unwrap_or(i32::MAX);
        // no timer at all: settle at once so the bound still applies
        let promise = Promise::new(&mut |resolve, reject| {
            if let Err(err) = set_timeout(&resolve, delay) {
                warn!("setTimeout unavailable: {}", js_error_text(&err));
                let _ = reject.call1(&JsValue::NULL, &err);
            }
        });
        async move {
            let _ = JsFuture::from(promise).await;
        }
        .boxed_local()
    }
}

/// Fetch `url`, failing with a retryable `Fetch` error once `timeout_ms`
/// elapses (0 disables the bound). Gzip bodies are decompressed.
///
/// Both futures are created before returning so the result does not borrow
/// the fetcher.
pub fn fetch_source(
    fetcher: &dyn SourceFetcher,
    url: &str,
    timeout_ms: u32,
) -> LocalBoxFuture<'static, Result<Vec<u8>>> {
    let request = fetcher.fetch(url);
    let timeout = if timeout_ms > 0 {
        fetcher.sleep(timeout_ms)
    } else {
        future::pending().boxed_local()
    };
    let url = url.to_string();

    async move {
        let body = match future::select(request, timeout).await {
            Either::Left((result, _)) => result?,
            Either::Right(((), _)) => {
                return Err(EngineError::fetch(
                    &url,
                    format!("timed out after {} ms", timeout_ms),
                ))
            }
        };
        decompress_if_gzipped(body).map_err(|e| EngineError::fetch(&url, e))
    }
    .boxed_local()
}

/// Gunzip `data` when it starts with the gzip magic number, otherwise hand
/// it back untouched.
pub fn decompress_if_gzipped(data: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if !data.starts_with(&[0x1f, 0x8b]) {
        return Ok(data);
    }
    debug!("Detected gzipped body, decompressing...");
    let mut decoder = GzDecoder::new(&data[..]);
    let mut decompressed_data = Vec::new();
    decoder.read_to_end(&mut decompressed_data)?;
    Ok(decompressed_data)
}
