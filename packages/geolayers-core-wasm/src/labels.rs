// Point-label overlays derived from another layer's cached features.
//
// The anchor point is a vertex mean, not an area centroid: polygons use the
// mean of their exterior ring vertices and multipolygons the mean over every
// exterior vertex of every member polygon.

use geo_types::{Coord, Geometry, LineString, Polygon};
use log::warn;
use serde::Serialize;

use crate::filter::FeatureFilter;
use crate::geojson_features::{Feature, FeatureCollection};
use crate::style::{LayerStyle, StyleProps, DEFAULT_LABEL_STYLE};

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelMarker {
    /// Index of the feature in the source collection.
    pub feature_index: usize,
    /// `[lng, lat]`
    pub position: [f64; 2],
    pub text: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelOverlay {
    pub source_layer_id: String,
    pub label_property: String,
    pub style: StyleProps,
    pub markers: Vec<LabelMarker>,
    pub skipped: usize,
}

/// Running sum of ring vertices. A ring's closing vertex is counted once.
#[derive(Default)]
struct VertexMean {
    sum_x: f64,
    sum_y: f64,
    count: usize,
}

impl VertexMean {
    fn add_coord(&mut self, c: Coord<f64>) {
        self.sum_x += c.x;
        self.sum_y += c.y;
        self.count += 1;
    }

    fn add_ring(&mut self, ring: &LineString<f64>) {
        let coords = &ring.0;
        let open_len = match (coords.first(), coords.last()) {
            (Some(first), Some(last)) if coords.len() > 1 && first == last => coords.len() - 1,
            _ => coords.len(),
        };
        for c in &coords[..open_len] {
            self.add_coord(*c);
        }
    }

    fn add_line(&mut self, line: &LineString<f64>) {
        for c in line.coords() {
            self.add_coord(*c);
        }
    }

    fn add_exterior(&mut self, polygon: &Polygon<f64>) {
        self.add_ring(polygon.exterior());
    }

    fn finish(self) -> Option<Coord<f64>> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(Coord {
            x: self.sum_x / n,
            y: self.sum_y / n,
        })
    }
}

/// Anchor point for a label, `None` when the geometry has no usable vertex.
pub fn label_point(geometry: &Geometry<f64>) -> Option<Coord<f64>> {
    let mut mean = VertexMean::default();
    match geometry {
        Geometry::Point(p) => return Some(p.0),
        Geometry::Polygon(polygon) => mean.add_exterior(polygon),
        Geometry::MultiPolygon(polygons) => {
            for polygon in polygons.iter() {
                mean.add_exterior(polygon);
            }
        }
        Geometry::LineString(line) => mean.add_line(line),
        Geometry::MultiLineString(lines) => {
            for line in lines.iter() {
                mean.add_line(line);
            }
        }
        Geometry::MultiPoint(points) => {
            for p in points.iter() {
                mean.add_coord(p.0);
            }
        }
        Geometry::Line(line) => {
            mean.add_coord(line.start);
            mean.add_coord(line.end);
        }
        Geometry::Triangle(t) => mean.add_exterior(&t.to_polygon()),
        Geometry::Rect(r) => mean.add_exterior(&r.to_polygon()),
        Geometry::GeometryCollection(_) => return None,
    }
    mean.finish()
}

fn marker_for(index: usize, feature: &Feature, label_property: &str) -> Result<LabelMarker, String> {
    let text = feature
        .property_str(label_property)
        .ok_or_else(|| format!("feature {} has no '{}' property", index, label_property))?;
    let geometry = feature
        .geometry
        .as_ref()
        .ok_or_else(|| format!("feature {} has no geometry", index))?;
    let point = label_point(geometry)
        .filter(|c| c.x.is_finite() && c.y.is_finite())
        .ok_or_else(|| format!("feature {} has no finite label point", index))?;
    Ok(LabelMarker {
        feature_index: index,
        position: [point.x, point.y],
        text,
    })
}

/// Build the label overlay for `source`. Features the filter excludes are
/// left out silently; features that cannot be labelled are skipped with a
/// warning and counted.
pub fn derive_labels(
    source_layer_id: &str,
    source: &FeatureCollection,
    label_property: &str,
    filter: &FeatureFilter<'_>,
    style: Option<&LayerStyle>,
    max_markers: Option<usize>,
) -> LabelOverlay {
    let mut markers = Vec::new();
    let mut skipped = 0;

    for (index, feature) in source.features.iter().enumerate() {
        if !filter.includes(feature) {
            continue;
        }
        if max_markers.map_or(false, |max| markers.len() >= max) {
            warn!(
                "Label layer over {} capped at {} markers",
                source_layer_id,
                markers.len()
            );
            break;
        }
        match marker_for(index, feature, label_property) {
            Ok(marker) => markers.push(marker),
            Err(reason) => {
                warn!("Skipping label on {}: {}", source_layer_id, reason);
                skipped += 1;
            }
        }
    }

    LabelOverlay {
        source_layer_id: source_layer_id.to_string(),
        label_property: label_property.to_string(),
        style: style
            .map(|s| s.resolve_static(&DEFAULT_LABEL_STYLE))
            .unwrap_or_else(|| DEFAULT_LABEL_STYLE.clone()),
        markers,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterCriteria, SUBREGION};
    use crate::geojson_features::Properties;
    use geo_types::{polygon, MultiPolygon, Point};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn named(geometry: Geometry<f64>, name: Option<&str>) -> Feature {
        let mut props = Properties::new();
        if let Some(name) = name {
            props.insert("NAME".into(), json!(name));
        }
        Feature::new(geometry, props)
    }

    #[test]
    fn point_is_its_own_anchor() {
        let c = label_point(&Geometry::Point(Point::new(106.8, -6.2))).unwrap();
        assert_eq!((c.x, c.y), (106.8, -6.2));
    }

    #[test]
    fn square_vertex_mean_is_half_half() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 0.0, y: 1.0), (x: 1.0, y: 1.0), (x: 1.0, y: 0.0)];
        let c = label_point(&Geometry::Polygon(square)).unwrap();
        assert_eq!((c.x, c.y), (0.5, 0.5));
    }

    #[test]
    fn vertex_mean_is_not_area_centroid() {
        // Extra vertex along the bottom edge pulls the mean, an area
        // centroid would stay at (1, 1).
        let shape = polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0),
            (x: 2.0, y: 2.0), (x: 0.0, y: 2.0)
        ];
        let c = label_point(&Geometry::Polygon(shape)).unwrap();
        assert!((c.x - 1.0).abs() < 1e-12);
        assert!((c.y - 0.8).abs() < 1e-12);
    }

    #[test]
    fn multipolygon_averages_all_vertices_together() {
        // Triangle (3 vertices) and square (4 vertices): per-polygon means
        // averaged would differ from the pooled mean.
        let triangle = polygon![(x: 0.0, y: 0.0), (x: 3.0, y: 0.0), (x: 0.0, y: 3.0)];
        let square = polygon![(x: 10.0, y: 10.0), (x: 10.0, y: 11.0), (x: 11.0, y: 11.0), (x: 11.0, y: 10.0)];
        let multi = MultiPolygon::new(vec![triangle, square]);
        let c = label_point(&Geometry::MultiPolygon(multi)).unwrap();
        assert!((c.x - 45.0 / 7.0).abs() < 1e-12);
        assert!((c.y - 45.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn skips_unlabelled_and_non_finite_features() {
        let source = FeatureCollection::new(vec![
            named(Geometry::Point(Point::new(1.0, 2.0)), Some("A")),
            named(Geometry::Point(Point::new(1.0, 2.0)), None),
            named(Geometry::Point(Point::new(f64::NAN, 2.0)), Some("C")),
            Feature {
                id: None,
                geometry: None,
                properties: Some(Properties::new()),
            },
        ]);
        let overlay = derive_labels("facilities", &source, "NAME", &FeatureFilter::none(), None, None);
        assert_eq!(overlay.markers.len(), 1);
        assert_eq!(overlay.markers[0].text, "A");
        assert_eq!(overlay.markers[0].position, [1.0, 2.0]);
        assert_eq!(overlay.skipped, 3);
        assert_eq!(overlay.style, *DEFAULT_LABEL_STYLE);
    }

    #[test]
    fn honours_source_filter() {
        let mut a = named(Geometry::Point(Point::new(0.0, 0.0)), Some("A"));
        a.properties.as_mut().unwrap().insert("KEL".into(), json!("X"));
        let mut b = named(Geometry::Point(Point::new(1.0, 1.0)), Some("B"));
        b.properties.as_mut().unwrap().insert("KEL".into(), json!("Y"));
        let source = FeatureCollection::new(vec![a, b]);

        let criteria = FilterCriteria::new().with(SUBREGION, "Y");
        let mapping = BTreeMap::from([(SUBREGION.to_string(), "KEL".to_string())]);
        let filter = FeatureFilter::new(Some(&mapping), &criteria);
        let overlay = derive_labels("kel", &source, "NAME", &filter, None, None);
        assert_eq!(overlay.markers.len(), 1);
        assert_eq!(overlay.markers[0].text, "B");
        assert_eq!(overlay.markers[0].feature_index, 1);
        assert_eq!(overlay.skipped, 0);
    }

    #[test]
    fn label_style_overrides_defaults() {
        let style: LayerStyle = serde_json::from_value(json!({"base": {"fontSize": "16px"}})).unwrap();
        let source = FeatureCollection::new(vec![named(Geometry::Point(Point::new(0.0, 0.0)), Some("A"))]);
        let overlay = derive_labels("s", &source, "NAME", &FeatureFilter::none(), Some(&style), Some(10));
        assert_eq!(overlay.style["fontSize"], "16px");
        assert_eq!(overlay.style["className"], "map-label");
    }
}
