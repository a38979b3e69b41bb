// Canonical in-memory feature model and its GeoJSON encoding.
//
// Everything the engine ingests is converted into a FeatureCollection of
// geo-types geometries with a JSON property map; everything it hands to the
// rendering surface is encoded back to plain GeoJSON values.

use geo::BoundingRect;
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon, Rect,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{EngineError, Result};

pub type Properties = Map<String, Value>;

const FORMAT: &str = "GeoJSON";

#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub id: Option<Value>,
    pub geometry: Option<Geometry<f64>>,
    pub properties: Option<Properties>,
}

impl Feature {
    pub fn new(geometry: Geometry<f64>, properties: Properties) -> Self {
        Feature {
            id: None,
            geometry: Some(geometry),
            properties: Some(properties),
        }
    }

    /// Property value as a string; numbers and booleans are rendered, other
    /// JSON kinds count as absent.
    pub fn property_str(&self, name: &str) -> Option<String> {
        self.properties
            .as_ref()
            .and_then(|props| props.get(name))
            .and_then(value_as_text)
    }

    pub fn to_geojson_value(&self) -> Value {
        let mut feature = json!({
            "type": "Feature",
            "geometry": self.geometry.as_ref().map(geometry_to_value).unwrap_or(Value::Null),
            "properties": self
                .properties
                .as_ref()
                .map(|p| Value::Object(p.clone()))
                .unwrap_or(Value::Null),
        });
        if let Some(id) = &self.id {
            feature["id"] = id.clone();
        }
        feature
    }

    fn from_geojson_value(value: &Value) -> Result<Self> {
        let geometry = match value.get("geometry") {
            None | Some(Value::Null) => None,
            Some(geometry) => Some(geometry_from_value(geometry)?),
        };
        let properties = match value.get("properties") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };
        Ok(Feature {
            id: value.get("id").cloned(),
            geometry,
            properties,
        })
    }
}

/// Text form of a scalar property value.
pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        FeatureCollection { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Concatenate several collections into one, preserving order.
    pub fn concat(collections: impl IntoIterator<Item = FeatureCollection>) -> Self {
        FeatureCollection {
            features: collections.into_iter().flat_map(|c| c.features).collect(),
        }
    }

    pub fn from_geojson_str(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EngineError::parse(FORMAT, e))?;
        Self::from_geojson_value(&value)
    }

    pub fn from_geojson_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| EngineError::parse(FORMAT, e))?;
        Self::from_geojson_value(&value)
    }

    /// Accepts a FeatureCollection, a single Feature or a bare geometry.
    pub fn from_geojson_value(value: &Value) -> Result<Self> {
        match type_tag(value)? {
            "FeatureCollection" => {
                let features = value
                    .get("features")
                    .and_then(Value::as_array)
                    .ok_or_else(|| EngineError::parse(FORMAT, "FeatureCollection without features array"))?;
                let features = features
                    .iter()
                    .map(Feature::from_geojson_value)
                    .collect::<Result<Vec<_>>>()?;
                Ok(FeatureCollection { features })
            }
            "Feature" => Ok(FeatureCollection {
                features: vec![Feature::from_geojson_value(value)?],
            }),
            _ => Ok(FeatureCollection {
                features: vec![Feature {
                    id: None,
                    geometry: Some(geometry_from_value(value)?),
                    properties: Some(Properties::new()),
                }],
            }),
        }
    }

    pub fn to_geojson_value(&self) -> Value {
        json!({
            "type": "FeatureCollection",
            "features": self.features.iter().map(Feature::to_geojson_value).collect::<Vec<_>>(),
        })
    }

    /// Bounding box over every geometry, `None` when nothing has extent.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        bounds_of(self.features.iter())
    }
}

/// Bounding box over the geometries of `features`.
pub fn bounds_of<'a>(features: impl Iterator<Item = &'a Feature>) -> Option<Rect<f64>> {
    features
        .filter_map(|f| f.geometry.as_ref())
        .filter_map(|g| g.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                Coord {
                    x: a.min().x.min(b.min().x),
                    y: a.min().y.min(b.min().y),
                },
                Coord {
                    x: a.max().x.max(b.max().x),
                    y: a.max().y.max(b.max().y),
                },
            )
        })
}

impl Serialize for FeatureCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_geojson_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FeatureCollection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FeatureCollection::from_geojson_value(&value).map_err(serde::de::Error::custom)
    }
}

fn type_tag(value: &Value) -> Result<&str> {
    value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::parse(FORMAT, "missing \"type\" member"))
}

fn coordinates(value: &Value) -> Result<&Value> {
    value
        .get("coordinates")
        .ok_or_else(|| EngineError::parse(FORMAT, "geometry without coordinates"))
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| EngineError::parse(FORMAT, format!("expected array of {}", what)))
}

fn parse_position(value: &Value) -> Result<Coord<f64>> {
    let pos = as_array(value, "numbers")?;
    match (pos.first().and_then(Value::as_f64), pos.get(1).and_then(Value::as_f64)) {
        (Some(x), Some(y)) => Ok(Coord { x, y }),
        _ => Err(EngineError::parse(FORMAT, "position needs two numbers")),
    }
}

fn parse_line(value: &Value) -> Result<LineString<f64>> {
    let coords = as_array(value, "positions")?
        .iter()
        .map(parse_position)
        .collect::<Result<Vec<_>>>()?;
    Ok(LineString::new(coords))
}

fn parse_polygon(value: &Value) -> Result<Polygon<f64>> {
    let mut rings = as_array(value, "rings")?
        .iter()
        .map(parse_line)
        .collect::<Result<Vec<_>>>()?
        .into_iter();
    let exterior = rings.next().unwrap_or_else(|| LineString::new(Vec::new()));
    Ok(Polygon::new(exterior, rings.collect()))
}

pub fn geometry_from_value(value: &Value) -> Result<Geometry<f64>> {
    let geometry = match type_tag(value)? {
        "Point" => Geometry::Point(Point::from(parse_position(coordinates(value)?)?)),
        "MultiPoint" => Geometry::MultiPoint(MultiPoint::new(
            as_array(coordinates(value)?, "positions")?
                .iter()
                .map(|p| parse_position(p).map(Point::from))
                .collect::<Result<Vec<_>>>()?,
        )),
        "LineString" => Geometry::LineString(parse_line(coordinates(value)?)?),
        "MultiLineString" => Geometry::MultiLineString(MultiLineString::new(
            as_array(coordinates(value)?, "lines")?
                .iter()
                .map(parse_line)
                .collect::<Result<Vec<_>>>()?,
        )),
        "Polygon" => Geometry::Polygon(parse_polygon(coordinates(value)?)?),
        "MultiPolygon" => Geometry::MultiPolygon(MultiPolygon::new(
            as_array(coordinates(value)?, "polygons")?
                .iter()
                .map(parse_polygon)
                .collect::<Result<Vec<_>>>()?,
        )),
        "GeometryCollection" => {
            let members = value
                .get("geometries")
                .ok_or_else(|| EngineError::parse(FORMAT, "GeometryCollection without geometries"))?;
            Geometry::GeometryCollection(GeometryCollection::new_from(
                as_array(members, "geometries")?
                    .iter()
                    .map(geometry_from_value)
                    .collect::<Result<Vec<_>>>()?,
            ))
        }
        other => {
            return Err(EngineError::parse(
                FORMAT,
                format!("unknown geometry type {}", other),
            ))
        }
    };
    Ok(geometry)
}

fn position_value(c: &Coord<f64>) -> Value {
    json!([c.x, c.y])
}

fn line_value(line: &LineString<f64>) -> Value {
    Value::Array(line.coords().map(position_value).collect())
}

fn polygon_value(polygon: &Polygon<f64>) -> Value {
    Value::Array(
        std::iter::once(polygon.exterior())
            .chain(polygon.interiors())
            .map(line_value)
            .collect(),
    )
}

pub fn geometry_to_value(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": position_value(&p.0)}),
        Geometry::Line(l) => json!({
            "type": "LineString",
            "coordinates": [position_value(&l.start), position_value(&l.end)],
        }),
        Geometry::LineString(ls) => json!({"type": "LineString", "coordinates": line_value(ls)}),
        Geometry::Polygon(p) => json!({"type": "Polygon", "coordinates": polygon_value(p)}),
        Geometry::MultiPoint(mp) => json!({
            "type": "MultiPoint",
            "coordinates": mp.iter().map(|p| position_value(&p.0)).collect::<Vec<_>>(),
        }),
        Geometry::MultiLineString(mls) => json!({
            "type": "MultiLineString",
            "coordinates": mls.iter().map(line_value).collect::<Vec<_>>(),
        }),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.iter().map(polygon_value).collect::<Vec<_>>(),
        }),
        Geometry::GeometryCollection(gc) => json!({
            "type": "GeometryCollection",
            "geometries": gc.iter().map(geometry_to_value).collect::<Vec<_>>(),
        }),
        Geometry::Rect(r) => json!({"type": "Polygon", "coordinates": polygon_value(&r.to_polygon())}),
        Geometry::Triangle(t) => {
            json!({"type": "Polygon", "coordinates": polygon_value(&t.to_polygon())})
        }
    }
}
