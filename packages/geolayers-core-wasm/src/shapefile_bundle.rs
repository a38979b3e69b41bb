// Shapefile ingestion, either a bare .shp or a zipped bundle holding one or
// more .shp/.dbf pairs.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};

use geo_types::Geometry;
use log::{debug, warn};
use serde_json::{Number, Value};
use shapefile::dbase::{self, FieldValue};
use shapefile::{Shape, ShapeReader};

use crate::error::{EngineError, Result};
use crate::geojson_features::{Feature, FeatureCollection, Properties};

const FORMAT: &str = "Shapefile";
// upper bound on the preallocation taken from an entry's declared size
const MAX_SIZE_HINT: u64 = 64 << 20;

#[derive(Default)]
struct ShapefileParts {
    shp: Option<Vec<u8>>,
    dbf: Option<Vec<u8>>,
}

/// Unzip and parse every shapefile in the archive; the resulting
/// collections are concatenated in archive path order.
pub fn parse_zip(bytes: &[u8]) -> Result<FeatureCollection> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| EngineError::parse("zip", e))?;

    let mut bundles: BTreeMap<String, ShapefileParts> = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| EngineError::parse("zip", e))?;
        if entry.is_dir() || entry.name().starts_with("__MACOSX") {
            continue;
        }
        let name = entry.name().to_string();
        let Some((stem, ext)) = name.rsplit_once('.') else {
            continue;
        };
        let ext = ext.to_ascii_lowercase();
        if ext != "shp" && ext != "dbf" {
            continue;
        }

        let mut contents = Vec::with_capacity(entry.size().min(MAX_SIZE_HINT) as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| EngineError::parse("zip", e))?;

        let parts = bundles.entry(stem.to_ascii_lowercase()).or_default();
        if ext == "shp" {
            parts.shp = Some(contents);
        } else {
            parts.dbf = Some(contents);
        }
    }

    let mut collections = Vec::new();
    for (stem, parts) in bundles {
        let Some(shp) = parts.shp else {
            warn!("Ignoring {}.dbf without a matching .shp", stem);
            continue;
        };
        let collection = parse_shapefile(&shp, parts.dbf.as_deref())?;
        debug!("Parsed {} features from {}.shp", collection.len(), stem);
        collections.push(collection);
    }

    if collections.is_empty() {
        return Err(EngineError::Validation(
            "zip archive contains no .shp file".to_string(),
        ));
    }
    Ok(FeatureCollection::concat(collections))
}

/// A bare .shp carries geometry only.
pub fn parse_shp(bytes: &[u8]) -> Result<FeatureCollection> {
    parse_shapefile(bytes, None)
}

fn parse_shapefile(shp: &[u8], dbf: Option<&[u8]>) -> Result<FeatureCollection> {
    let shape_reader =
        ShapeReader::new(Cursor::new(shp)).map_err(|e| EngineError::parse(FORMAT, e))?;

    let mut features = Vec::new();
    match dbf {
        Some(dbf) => {
            let dbase_reader =
                dbase::Reader::new(Cursor::new(dbf)).map_err(|e| EngineError::parse(FORMAT, e))?;
            let mut reader = shapefile::Reader::new(shape_reader, dbase_reader);
            for result in reader.iter_shapes_and_records() {
                let (shape, record) = result.map_err(|e| EngineError::parse(FORMAT, e))?;
                let fields: HashMap<String, FieldValue> = record.into();
                let properties: Properties = fields
                    .into_iter()
                    .map(|(name, value)| (name, field_value(value)))
                    .collect();
                features.push(Feature {
                    id: None,
                    geometry: shape_geometry(shape)?,
                    properties: Some(properties),
                });
            }
        }
        None => {
            let shapes = shape_reader
                .read()
                .map_err(|e| EngineError::parse(FORMAT, e))?;
            for shape in shapes {
                features.push(Feature {
                    id: None,
                    geometry: shape_geometry(shape)?,
                    properties: Some(Properties::new()),
                });
            }
        }
    }
    Ok(FeatureCollection::new(features))
}

fn shape_geometry(shape: Shape) -> Result<Option<Geometry<f64>>> {
    if matches!(shape, Shape::NullShape) {
        return Ok(None);
    }
    Geometry::<f64>::try_from(shape)
        .map(Some)
        .map_err(|e| EngineError::parse(FORMAT, format!("{:?}", e)))
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn field_value(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(text)) => Value::String(text.trim().to_string()),
        FieldValue::Numeric(Some(n)) => number(n),
        FieldValue::Logical(Some(b)) => Value::Bool(b),
        FieldValue::Integer(i) => Value::Number(i.into()),
        FieldValue::Double(d) => number(d),
        FieldValue::Memo(text) => Value::String(text),
        FieldValue::Character(None) | FieldValue::Numeric(None) | FieldValue::Logical(None) => {
            Value::Null
        }
        other => Value::String(format!("{:?}", other)),
    }
}
