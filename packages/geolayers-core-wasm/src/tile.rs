use geo_types::Rect;
use serde::Serialize;

use crate::registry::Layer;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TileRequest {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Raster layer reference. The rendering surface requests the tiles itself;
/// the engine only describes where they come from.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RasterReference {
    pub url_template: String,
    pub attribution: Option<String>,
    pub subdomains: Vec<String>,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
}

impl RasterReference {
    pub fn from_layer(layer: &Layer) -> Option<Self> {
        Some(RasterReference {
            url_template: layer.url.clone()?,
            attribution: layer.attribution.clone(),
            subdomains: layer.subdomains.clone().unwrap_or_default(),
            min_zoom: layer.min_zoom,
            max_zoom: layer.max_zoom,
        })
    }

    /// Substitute `{z}`, `{x}`, `{y}` (and `{s}` when subdomains exist).
    pub fn tile_url(&self, tile: &TileRequest) -> String {
        let mut url = self
            .url_template
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string());
        if !self.subdomains.is_empty() {
            let index = ((tile.x + tile.y) as usize) % self.subdomains.len();
            url = url.replace("{s}", &self.subdomains[index]);
        }
        url
    }
}

// Convert latitude to tile Y coordinate
fn lat_to_tile_y(lat: f64, zoom: u32) -> u32 {
    let lat = lat.clamp(-85.051_128_78, 85.051_128_78);
    let lat_rad = lat.to_radians();
    let n = 2.0_f64.powi(zoom as i32);
    let y = ((1.0 - ((lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI)) / 2.0 * n).floor();
    (y.max(0.0) as u32).min(n as u32 - 1)
}

// Convert longitude to tile X coordinate
fn lng_to_tile_x(lng: f64, zoom: u32) -> u32 {
    let n = 2.0_f64.powi(zoom as i32);
    let x = ((lng.clamp(-180.0, 180.0) + 180.0) / 360.0 * n).floor();
    (x.max(0.0) as u32).min(n as u32 - 1)
}

/// Tiles covering a lng/lat bounding box at one zoom level.
pub fn tiles_for_bounds(bounds: &Rect<f64>, zoom: u32) -> Vec<TileRequest> {
    let min_x = lng_to_tile_x(bounds.min().x, zoom);
    let max_x = lng_to_tile_x(bounds.max().x, zoom);
    // y grows southwards
    let min_y = lat_to_tile_y(bounds.max().y, zoom);
    let max_y = lat_to_tile_y(bounds.min().y, zoom);

    let mut tiles = Vec::new();
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            tiles.push(TileRequest { x, y, z: zoom });
        }
    }
    tiles
}
