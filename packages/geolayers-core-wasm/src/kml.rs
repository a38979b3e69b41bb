// KML -> canonical features. Each Placemark becomes one feature; its name,
// description and ExtendedData values become properties.

use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use roxmltree::{Document, Node};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::geojson_features::{Feature, FeatureCollection, Properties};

const FORMAT: &str = "KML";

fn is(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| is(c, name))
}

fn child_text(node: Node, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|c| c.text())
        .map(|t| t.trim().to_string())
}

fn parse_coords(text: &str) -> Result<Vec<Coord<f64>>> {
    text.split_whitespace()
        .map(|tuple| {
            let mut parts = tuple.split(',').map(|p| p.trim().parse::<f64>());
            match (parts.next(), parts.next()) {
                (Some(Ok(x)), Some(Ok(y))) => Ok(Coord { x, y }),
                _ => Err(EngineError::parse(FORMAT, format!("bad coordinate tuple '{}'", tuple))),
            }
        })
        .collect()
}

fn coords_of(node: Node) -> Result<Vec<Coord<f64>>> {
    let text = child(node, "coordinates")
        .and_then(|c| c.text())
        .unwrap_or_default();
    parse_coords(text)
}

fn ring(boundary: Node) -> Result<LineString<f64>> {
    let linear_ring = child(boundary, "LinearRing")
        .ok_or_else(|| EngineError::parse(FORMAT, "boundary without LinearRing"))?;
    Ok(LineString::new(coords_of(linear_ring)?))
}

fn polygon(node: Node) -> Result<Polygon<f64>> {
    let outer = child(node, "outerBoundaryIs")
        .ok_or_else(|| EngineError::parse(FORMAT, "Polygon without outerBoundaryIs"))?;
    let inners = node
        .children()
        .filter(|c| is(c, "innerBoundaryIs"))
        .map(ring)
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(ring(outer)?, inners))
}

fn geometry(node: Node) -> Result<Option<Geometry<f64>>> {
    let geometry = match node.tag_name().name() {
        "Point" => {
            let coord = coords_of(node)?
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::parse(FORMAT, "Point without coordinates"))?;
            Geometry::Point(Point::from(coord))
        }
        "LineString" => Geometry::LineString(LineString::new(coords_of(node)?)),
        "LinearRing" => Geometry::Polygon(Polygon::new(LineString::new(coords_of(node)?), vec![])),
        "Polygon" => Geometry::Polygon(polygon(node)?),
        "MultiGeometry" => {
            let members = node
                .children()
                .filter(|c| c.is_element())
                .map(geometry)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            collapse(members)
        }
        _ => return Ok(None),
    };
    Ok(Some(geometry))
}

/// Homogeneous MultiGeometry members become the matching Multi* kind.
fn collapse(members: Vec<Geometry<f64>>) -> Geometry<f64> {
    if !members.is_empty() && members.iter().all(|g| matches!(g, Geometry::Polygon(_))) {
        return Geometry::MultiPolygon(MultiPolygon::new(
            members
                .into_iter()
                .filter_map(|g| match g {
                    Geometry::Polygon(p) => Some(p),
                    _ => None,
                })
                .collect(),
        ));
    }
    if !members.is_empty() && members.iter().all(|g| matches!(g, Geometry::Point(_))) {
        return Geometry::MultiPoint(MultiPoint::new(
            members
                .into_iter()
                .filter_map(|g| match g {
                    Geometry::Point(p) => Some(p),
                    _ => None,
                })
                .collect(),
        ));
    }
    if !members.is_empty() && members.iter().all(|g| matches!(g, Geometry::LineString(_))) {
        return Geometry::MultiLineString(MultiLineString::new(
            members
                .into_iter()
                .filter_map(|g| match g {
                    Geometry::LineString(l) => Some(l),
                    _ => None,
                })
                .collect(),
        ));
    }
    Geometry::GeometryCollection(GeometryCollection::new_from(members))
}

fn extended_data(placemark: Node, properties: &mut Properties) {
    let Some(extended) = child(placemark, "ExtendedData") else {
        return;
    };
    for data in extended.descendants().filter(|n| is(n, "Data")) {
        if let Some(name) = data.attribute("name") {
            let value = child_text(data, "value").unwrap_or_default();
            properties.insert(name.to_string(), Value::String(value));
        }
    }
    for simple in extended.descendants().filter(|n| is(n, "SimpleData")) {
        if let Some(name) = simple.attribute("name") {
            let value = simple.text().map(|t| t.trim().to_string()).unwrap_or_default();
            properties.insert(name.to_string(), Value::String(value));
        }
    }
}

fn placemark(node: Node) -> Result<Feature> {
    let mut properties = Properties::new();
    for key in ["name", "description"] {
        if let Some(text) = child_text(node, key) {
            properties.insert(key.to_string(), Value::String(text));
        }
    }
    extended_data(node, &mut properties);

    let mut found = None;
    for c in node.children().filter(|c| c.is_element()) {
        if let Some(g) = geometry(c)? {
            found = Some(g);
            break;
        }
    }

    Ok(Feature {
        id: node.attribute("id").map(|id| Value::String(id.to_string())),
        geometry: found,
        properties: Some(properties),
    })
}

pub fn parse_kml(bytes: &[u8]) -> Result<FeatureCollection> {
    let text = std::str::from_utf8(bytes).map_err(|e| EngineError::parse(FORMAT, e))?;
    let doc = Document::parse(text).map_err(|e| EngineError::parse(FORMAT, e))?;
    let features = doc
        .descendants()
        .filter(|n| is(n, "Placemark"))
        .map(placemark)
        .collect::<Result<Vec<_>>>()?;
    Ok(FeatureCollection::new(features))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Folder>
      <Placemark id="p1">
        <name>Puskesmas Menteng</name>
        <ExtendedData>
          <Data name="kelurahan"><value>Menteng</value></Data>
        </ExtendedData>
        <Point><coordinates>106.83,-6.19,0</coordinates></Point>
      </Placemark>
      <Placemark>
        <name>Block</name>
        <Polygon>
          <outerBoundaryIs><LinearRing><coordinates>
            0,0 0,1 1,1 1,0 0,0
          </coordinates></LinearRing></outerBoundaryIs>
          <innerBoundaryIs><LinearRing><coordinates>
            0.2,0.2 0.2,0.4 0.4,0.4 0.2,0.2
          </coordinates></LinearRing></innerBoundaryIs>
        </Polygon>
      </Placemark>
      <Placemark>
        <name>Islands</name>
        <MultiGeometry>
          <Polygon><outerBoundaryIs><LinearRing><coordinates>0,0 0,1 1,1 0,0</coordinates></LinearRing></outerBoundaryIs></Polygon>
          <Polygon><outerBoundaryIs><LinearRing><coordinates>5,5 5,6 6,6 5,5</coordinates></LinearRing></outerBoundaryIs></Polygon>
        </MultiGeometry>
      </Placemark>
      <Placemark><name>No geometry</name></Placemark>
    </Folder>
  </Document>
</kml>"#;

    #[test]
    fn translates_placemarks() {
        let fc = parse_kml(SAMPLE.as_bytes()).unwrap();
        assert_eq!(fc.len(), 4);

        let point = &fc.features[0];
        assert_eq!(point.id, Some(Value::String("p1".into())));
        assert_eq!(point.property_str("name").as_deref(), Some("Puskesmas Menteng"));
        assert_eq!(point.property_str("kelurahan").as_deref(), Some("Menteng"));
        match point.geometry.as_ref().unwrap() {
            Geometry::Point(p) => assert_eq!((p.x(), p.y()), (106.83, -6.19)),
            other => panic!("expected point, got {other:?}"),
        }

        match fc.features[1].geometry.as_ref().unwrap() {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 5);
                assert_eq!(p.interiors().len(), 1);
            }
            other => panic!("expected polygon, got {other:?}"),
        }

        match fc.features[2].geometry.as_ref().unwrap() {
            Geometry::MultiPolygon(mp) => assert_eq!(mp.0.len(), 2),
            other => panic!("expected multipolygon, got {other:?}"),
        }

        assert!(fc.features[3].geometry.is_none());
    }

    #[test]
    fn malformed_xml_is_parse_error() {
        let err = parse_kml(b"<kml><Placemark><name>x</Placemark>").unwrap_err();
        assert!(matches!(err, EngineError::Parse { format: "KML", .. }));
    }

    #[test]
    fn bad_coordinates_are_parse_error() {
        let kml = "<kml><Placemark><Point><coordinates>abc</coordinates></Point></Placemark></kml>";
        assert!(matches!(parse_kml(kml.as_bytes()), Err(EngineError::Parse { .. })));
    }
}
