//! Upload ingestion: turns raw file bytes into the canonical feature model
//! and, for uploads, into a ready-to-register layer descriptor.

use std::str::FromStr;

use geo_types::{Geometry, Point};
use log::{debug, info, warn};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::geojson_features::{Feature, FeatureCollection, Properties};
use crate::registry::Layer;
use crate::{kml, shapefile_bundle};

pub const ACCEPTED_EXTENSIONS: &[&str] = &["geojson", "json", "csv", "kml", "wkt", "zip", "shp"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    GeoJson,
    Csv,
    Kml,
    Wkt,
    ShapefileZip,
    Shapefile,
}

impl SourceFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "geojson" | "json" => Some(SourceFormat::GeoJson),
            "csv" => Some(SourceFormat::Csv),
            "kml" => Some(SourceFormat::Kml),
            "wkt" => Some(SourceFormat::Wkt),
            "zip" => Some(SourceFormat::ShapefileZip),
            "shp" => Some(SourceFormat::Shapefile),
            _ => None,
        }
    }

    /// Format of an uploaded file, decided by extension alone.
    pub fn from_filename(filename: &str) -> Result<Self> {
        extension(filename)
            .and_then(SourceFormat::from_extension)
            .ok_or_else(|| {
                EngineError::UnsupportedFormat(format!(
                    "{} (accepted: {})",
                    filename,
                    ACCEPTED_EXTENSIONS
                        .iter()
                        .map(|e| format!(".{}", e))
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    /// Format of a remote source; anything unrecognised is read as GeoJSON.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        extension(path)
            .and_then(SourceFormat::from_extension)
            .unwrap_or(SourceFormat::GeoJson)
    }
}

fn extension(name: &str) -> Option<&str> {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    file.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
}

/// Parse bytes of a known format into the canonical model.
pub fn parse_source(format: SourceFormat, bytes: &[u8]) -> Result<FeatureCollection> {
    match format {
        SourceFormat::GeoJson => FeatureCollection::from_geojson_bytes(bytes),
        SourceFormat::Csv => parse_csv(bytes),
        SourceFormat::Kml => kml::parse_kml(bytes),
        SourceFormat::Wkt => parse_wkt(bytes),
        SourceFormat::ShapefileZip => shapefile_bundle::parse_zip(bytes),
        SourceFormat::Shapefile => shapefile_bundle::parse_shp(bytes),
    }
}

/// Convert an uploaded file into a vector layer for the uploaded group.
/// Nothing is registered here; on error the caller gets the message and no
/// layer exists.
pub fn ingest_upload(filename: &str, bytes: &[u8], config: &EngineConfig) -> Result<Layer> {
    let format = SourceFormat::from_filename(filename)?;
    if bytes.is_empty() {
        return Err(EngineError::Validation(format!("{} is empty", filename)));
    }

    let data = parse_source(format, bytes)?;
    info!(
        "Ingested {} as {:?}: {} features",
        filename,
        format,
        data.len()
    );

    let mut layer = Layer::inline(filename, filename, data).visible(true);
    layer.opacity = config.upload_opacity;
    layer.group = config.uploaded_group_id.clone();
    Ok(layer)
}

fn find_column(headers: &csv::StringRecord, exact: &[&str], fragments: &[&str]) -> Option<usize> {
    let lowered: Vec<String> = headers.iter().map(|h| h.trim().to_ascii_lowercase()).collect();
    lowered
        .iter()
        .position(|h| exact.contains(&h.as_str()))
        .or_else(|| {
            lowered
                .iter()
                .position(|h| fragments.iter().any(|f| h.contains(f)))
        })
}

fn parse_coordinate(value: Option<&str>) -> Option<f64> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// CSV with a header row. Coordinate columns are found by name; rows without
/// usable coordinates are dropped rather than failing the file.
pub fn parse_csv(bytes: &[u8]) -> Result<FeatureCollection> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| EngineError::parse("CSV", e))?
        .clone();

    let lat = find_column(&headers, &["lat", "latitude"], &["lat"]);
    let lon = find_column(&headers, &["lon", "lng", "long", "longitude"], &["lon", "lng"]);
    let (lat, lon) = match (lat, lon) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => {
            return Err(EngineError::Validation(
                "CSV needs latitude and longitude columns (e.g. lat, lng)".to_string(),
            ))
        }
    };

    let mut features = Vec::new();
    let mut dropped = 0usize;
    for (row, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("Dropping unreadable CSV row {}: {}", row + 1, e);
                dropped += 1;
                continue;
            }
        };
        let (Some(y), Some(x)) = (parse_coordinate(record.get(lat)), parse_coordinate(record.get(lon)))
        else {
            dropped += 1;
            continue;
        };

        let properties: Properties = headers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = record.get(i).unwrap_or_default();
                (name.to_string(), Value::String(value.to_string()))
            })
            .collect();
        features.push(Feature::new(Geometry::Point(Point::new(x, y)), properties));
    }

    if dropped > 0 {
        debug!("Dropped {} CSV rows without valid coordinates", dropped);
    }
    Ok(FeatureCollection::new(features))
}

/// A single WKT geometry as a one-feature collection.
pub fn parse_wkt(bytes: &[u8]) -> Result<FeatureCollection> {
    let text = std::str::from_utf8(bytes).map_err(|e| EngineError::parse("WKT", e))?;
    let parsed = wkt::Wkt::<f64>::from_str(text.trim()).map_err(|e| EngineError::parse("WKT", e))?;
    let geometry = Geometry::<f64>::try_from(parsed)
        .map_err(|e| EngineError::parse("WKT", format!("{:?}", e)))?;
    Ok(FeatureCollection::new(vec![Feature::new(geometry, Properties::new())]))
}
