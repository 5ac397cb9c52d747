use crate::config::InputConfig;
use crate::types::Boundary;
use geo::bounding_rect::BoundingRect;
use geo::coordinate_position::{CoordPos, CoordinatePosition};
use geo::{Coord, MultiPolygon};
use geojson::{GeoJson, JsonObject};
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("failed to open boundary source {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse boundary GeoJSON")]
    GeoJson(#[from] geojson::Error),
    #[error("boundary GeoJSON must be a FeatureCollection")]
    NotFeatureCollection,
    #[error("failed to read shapefile {path:?}")]
    Shapefile {
        path: PathBuf,
        #[source]
        source: shapefile::Error,
    },
    #[error("unsupported boundary format: {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("no boundaries matched the target areas")]
    Empty,
}

// Envelope entry pointing back into the ordered boundary list.
struct BoundaryEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for BoundaryEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Ordered, immutable set of target-area boundaries.
///
/// Order is significant: when polygons overlap, the earliest boundary that
/// contains a location owns it. The R-tree only narrows candidates; it never
/// changes which boundary wins.
pub struct BoundaryCollection {
    generation: u64,
    boundaries: Vec<Boundary>,
    tree: RTree<BoundaryEnvelope>,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

impl BoundaryCollection {
    pub fn new(boundaries: Vec<Boundary>) -> Self {
        let envelopes: Vec<BoundaryEnvelope> = boundaries
            .iter()
            .enumerate()
            .filter_map(|(index, boundary)| {
                let rect = boundary.geometry.bounding_rect()?;
                Some(BoundaryEnvelope {
                    index,
                    aabb: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            boundaries,
            tree: RTree::bulk_load(envelopes),
        }
    }

    /// Distinct per constructed collection; tells a reload apart from the
    /// collection it replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Boundary> {
        self.boundaries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Boundary> {
        self.boundaries.get(index)
    }

    pub fn find(&self, area_id: &str) -> Option<&Boundary> {
        self.boundaries.iter().find(|b| b.area_id == area_id)
    }

    /// Index of the first boundary (in collection order) containing `coord`,
    /// edges included.
    pub fn locate(&self, coord: Coord<f64>) -> Option<usize> {
        let envelope = AABB::from_point([coord.x, coord.y]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|candidate| covers(&self.boundaries[candidate.index].geometry, coord))
            .map(|candidate| candidate.index)
            .min()
    }

    /// Reference linear scan; `locate` must agree with it.
    #[cfg(test)]
    pub(crate) fn locate_linear(&self, coord: Coord<f64>) -> Option<usize> {
        self.boundaries
            .iter()
            .position(|b| covers(&b.geometry, coord))
    }
}

fn covers(geometry: &MultiPolygon<f64>, coord: Coord<f64>) -> bool {
    geometry.coordinate_position(&coord) != CoordPos::Outside
}

/// Which features survive loading: the area id is read from the first
/// present alias and must be in the target set.
#[derive(Debug, Clone)]
pub struct BoundaryFilter {
    area_id_properties: Vec<String>,
    target_areas: HashSet<String>,
}

impl BoundaryFilter {
    pub fn new<I, S>(area_id_properties: Vec<String>, target_areas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            area_id_properties,
            target_areas: target_areas.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(input: &InputConfig) -> Self {
        Self::new(
            input.area_id_properties.clone(),
            input.target_areas.iter().cloned(),
        )
    }

    pub fn read(&self, path: &Path) -> Result<BoundaryCollection, BoundaryError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();

        let boundaries = match extension.as_str() {
            "shp" => self.read_shapefile(path)?,
            "json" | "geojson" => {
                let file = File::open(path).map_err(|source| BoundaryError::Open {
                    path: path.to_path_buf(),
                    source,
                })?;
                let geojson = GeoJson::from_reader(BufReader::new(file))
                    .map_err(geojson::Error::MalformedJson)?;
                self.collect_features(geojson)?
            }
            _ => return Err(BoundaryError::UnsupportedFormat(path.to_path_buf())),
        };

        self.finish(boundaries)
    }

    pub fn read_geojson_str(&self, content: &str) -> Result<BoundaryCollection, BoundaryError> {
        let geojson: GeoJson = content.parse()?;
        let boundaries = self.collect_features(geojson)?;
        self.finish(boundaries)
    }

    fn finish(&self, boundaries: Vec<Boundary>) -> Result<BoundaryCollection, BoundaryError> {
        if boundaries.is_empty() {
            return Err(BoundaryError::Empty);
        }
        info!(count = boundaries.len(), "loaded target-area boundaries");
        Ok(BoundaryCollection::new(boundaries))
    }

    fn accepts(&self, area_id: &str) -> bool {
        !area_id.is_empty() && self.target_areas.contains(area_id)
    }

    /// First alias with a usable value; null or blank ones fall through.
    fn area_id_from_properties(&self, properties: &JsonObject) -> Option<String> {
        self.area_id_properties
            .iter()
            .find_map(|key| match properties.get(key)? {
                serde_json::Value::String(s) => non_blank(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    fn collect_features(&self, geojson: GeoJson) -> Result<Vec<Boundary>, BoundaryError> {
        let collection = match geojson {
            GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(BoundaryError::NotFeatureCollection),
        };

        let mut boundaries = Vec::new();

        for feature in collection.features {
            let area_id = match feature
                .properties
                .as_ref()
                .and_then(|props| self.area_id_from_properties(props))
            {
                Some(id) if self.accepts(&id) => id,
                _ => continue,
            };

            let geometry = match feature.geometry {
                Some(geometry) => match geo::Geometry::<f64>::try_from(geometry.value) {
                    Ok(geo::Geometry::MultiPolygon(mp)) => mp,
                    Ok(geo::Geometry::Polygon(p)) => MultiPolygon::new(vec![p]),
                    Ok(_) => {
                        debug!(area_id = %area_id, "skipping non-polygonal boundary feature");
                        continue;
                    }
                    Err(e) => {
                        debug!(area_id = %area_id, error = %e, "skipping unconvertible boundary geometry");
                        continue;
                    }
                },
                None => continue,
            };

            boundaries.push(Boundary { area_id, geometry });
        }

        Ok(boundaries)
    }

    fn read_shapefile(&self, path: &Path) -> Result<Vec<Boundary>, BoundaryError> {
        let shapefile_error = |source: shapefile::Error| BoundaryError::Shapefile {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = shapefile::Reader::from_path(path).map_err(shapefile_error)?;

        let mut boundaries = Vec::new();

        for result in reader.iter_shapes_and_records() {
            let (shape, record) = result.map_err(shapefile_error)?;

            let area_id = self.area_id_properties.iter().find_map(|key| {
                match record.get(key)? {
                    shapefile::dbase::FieldValue::Character(Some(s)) => non_blank(s),
                    shapefile::dbase::FieldValue::Numeric(Some(n)) => Some(format_numeric_id(*n)),
                    _ => None,
                }
            });
            let area_id = match area_id {
                Some(id) if self.accepts(&id) => id,
                _ => continue,
            };

            let converted: Result<MultiPolygon<f64>, String> = match shape {
                shapefile::Shape::Polygon(polygon) => {
                    polygon.try_into().map_err(|e| format!("{:?}", e))
                }
                shapefile::Shape::PolygonM(polygon) => {
                    polygon.try_into().map_err(|e| format!("{:?}", e))
                }
                shapefile::Shape::PolygonZ(polygon) => {
                    polygon.try_into().map_err(|e| format!("{:?}", e))
                }
                _ => continue,
            };

            match converted {
                Ok(geometry) => boundaries.push(Boundary { area_id, geometry }),
                Err(e) => debug!(area_id = %area_id, error = %e, "skipping unconvertible shapefile polygon"),
            }
        }

        Ok(boundaries)
    }
}

fn non_blank(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

// dBase numerics come back as floats; "78201.0" must still match "78201".
fn format_numeric_id(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Owns the boundary collection for the session. Reloading swaps the whole
/// collection; an existing `Arc` held elsewhere keeps seeing the old one.
pub struct BoundaryStore {
    filter: BoundaryFilter,
    collection: Option<Arc<BoundaryCollection>>,
}

impl BoundaryStore {
    pub fn new(filter: BoundaryFilter) -> Self {
        Self {
            filter,
            collection: None,
        }
    }

    pub fn filter(&self) -> &BoundaryFilter {
        &self.filter
    }

    pub fn load(&mut self, path: &Path) -> Result<Arc<BoundaryCollection>, BoundaryError> {
        let collection = self.filter.read(path)?;
        Ok(self.install(collection))
    }

    pub fn load_geojson_str(
        &mut self,
        content: &str,
    ) -> Result<Arc<BoundaryCollection>, BoundaryError> {
        let collection = self.filter.read_geojson_str(content)?;
        Ok(self.install(collection))
    }

    /// Caches a collection read elsewhere (e.g. on a blocking task).
    pub fn install(&mut self, collection: BoundaryCollection) -> Arc<BoundaryCollection> {
        let collection = Arc::new(collection);
        self.collection = Some(Arc::clone(&collection));
        collection
    }

    pub fn collection(&self) -> Option<Arc<BoundaryCollection>> {
        self.collection.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geo::polygon;

    pub(crate) fn square(area_id: &str, x0: f64, y0: f64, size: f64) -> Boundary {
        Boundary {
            area_id: area_id.to_string(),
            geometry: MultiPolygon::new(vec![polygon![
                (x: x0, y: y0),
                (x: x0 + size, y: y0),
                (x: x0 + size, y: y0 + size),
                (x: x0, y: y0 + size),
                (x: x0, y: y0),
            ]]),
        }
    }

    const FEATURES: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "properties": {"ZCTA5CE10": "78201"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
            {"type": "Feature", "properties": {"ZIP": 78202},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[2,0],[3,0],[3,1],[2,1],[2,0]]]]}},
            {"type": "Feature", "properties": {"zip": "78299", "ZCTA5CE10": "99999"},
             "geometry": {"type": "Polygon", "coordinates": [[[4,0],[5,0],[5,1],[4,1],[4,0]]]}},
            {"type": "Feature", "properties": {"NAME": "nowhere"},
             "geometry": {"type": "Polygon", "coordinates": [[[6,0],[7,0],[7,1],[6,1],[6,0]]]}},
            {"type": "Feature", "properties": {"zip": "78203"},
             "geometry": {"type": "Point", "coordinates": [8, 0]}},
            {"type": "Feature", "properties": {"zip": "78204"}, "geometry": null}
        ]
    }"#;

    fn filter() -> BoundaryFilter {
        BoundaryFilter::new(
            vec!["ZCTA5CE10".into(), "ZIP".into(), "zip".into()],
            ["78201", "78202", "78203", "78204", "78299"],
        )
    }

    #[test]
    fn keeps_only_target_polygons_using_first_alias() {
        let collection = filter().read_geojson_str(FEATURES).unwrap();
        let ids: Vec<&str> = collection.iter().map(|b| b.area_id.as_str()).collect();
        // 78299 is hidden behind ZCTA5CE10 = 99999, which wins as the first alias.
        assert_eq!(ids, vec!["78201", "78202"]);
    }

    #[test]
    fn null_or_blank_alias_falls_through_to_the_next() {
        let content = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"ZCTA5CE10": null, "ZIP": "78201"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
                {"type": "Feature", "properties": {"ZCTA5CE10": "  ", "ZIP": "78202"},
                 "geometry": {"type": "Polygon", "coordinates": [[[2,0],[3,0],[3,1],[2,1],[2,0]]]}}
            ]
        }"#;
        let collection = filter().read_geojson_str(content).unwrap();
        let ids: Vec<&str> = collection.iter().map(|b| b.area_id.as_str()).collect();
        assert_eq!(ids, vec!["78201", "78202"]);
    }

    #[test]
    fn empty_after_filtering_is_data_unavailable() {
        let filter = BoundaryFilter::new(vec!["ZIP".into()], ["00000"]);
        assert!(matches!(
            filter.read_geojson_str(FEATURES),
            Err(BoundaryError::Empty)
        ));
    }

    #[test]
    fn rejects_non_collections_and_garbage() {
        let point = r#"{"type": "Point", "coordinates": [0, 0]}"#;
        assert!(matches!(
            filter().read_geojson_str(point),
            Err(BoundaryError::NotFeatureCollection)
        ));
        assert!(matches!(
            filter().read_geojson_str("not json"),
            Err(BoundaryError::GeoJson(_))
        ));
    }

    #[test]
    fn reads_geojson_files_and_rejects_unknown_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zips.geojson");
        std::fs::write(&path, FEATURES).unwrap();

        let mut store = BoundaryStore::new(filter());
        assert!(store.collection().is_none());
        let collection = store.load(&path).unwrap();
        assert_eq!(collection.len(), 2);
        assert!(Arc::ptr_eq(&collection, &store.collection().unwrap()));

        let kml = dir.path().join("zips.kml");
        std::fs::write(&kml, "").unwrap();
        assert!(matches!(
            store.load(&kml),
            Err(BoundaryError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            store.load(&dir.path().join("missing.json")),
            Err(BoundaryError::Open { .. })
        ));
        let broken = dir.path().join("broken.geojson");
        std::fs::write(&broken, "{ not geojson").unwrap();
        assert!(matches!(store.load(&broken), Err(BoundaryError::GeoJson(_))));
        // A failed reload keeps the previous collection.
        assert_eq!(store.collection().unwrap().len(), 2);
    }

    #[test]
    fn locate_includes_edges_and_prefers_earliest_boundary() {
        let collection = BoundaryCollection::new(vec![
            square("a", 0.0, 0.0, 2.0),
            square("b", 1.0, 1.0, 2.0), // overlaps "a"
            square("c", 2.0, 0.0, 2.0), // shares the x = 2 edge with "a"
        ]);

        assert_eq!(collection.locate(Coord { x: 1.5, y: 1.5 }), Some(0));
        assert_eq!(collection.locate(Coord { x: 2.5, y: 2.5 }), Some(1));
        assert_eq!(collection.locate(Coord { x: 2.0, y: 0.5 }), Some(0));
        assert_eq!(collection.locate(Coord { x: 0.0, y: 0.0 }), Some(0));
        assert_eq!(collection.locate(Coord { x: 9.0, y: 9.0 }), None);
    }

    #[test]
    fn indexed_locate_matches_linear_scan() {
        let mut boundaries = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                boundaries.push(square(&format!("{}-{}", i, j), i as f64, j as f64, 1.5));
            }
        }
        let collection = BoundaryCollection::new(boundaries);

        for step_x in 0..40 {
            for step_y in 0..40 {
                let coord = Coord {
                    x: -0.5 + step_x as f64 * 0.2,
                    y: -0.5 + step_y as f64 * 0.2,
                };
                assert_eq!(collection.locate(coord), collection.locate_linear(coord));
            }
        }
    }

    fn shapefile_square(x0: f64, y0: f64) -> shapefile::Polygon {
        shapefile::Polygon::new(shapefile::PolygonRing::Outer(vec![
            shapefile::Point::new(x0, y0),
            shapefile::Point::new(x0, y0 + 1.0),
            shapefile::Point::new(x0 + 1.0, y0 + 1.0),
            shapefile::Point::new(x0 + 1.0, y0),
            shapefile::Point::new(x0, y0),
        ]))
    }

    #[test]
    fn reads_shapefiles_with_alias_fallback_and_allow_list() {
        use shapefile::dbase::{FieldValue, Record, TableWriterBuilder};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zips.shp");

        let rows = [
            (0.0, Some("78201"), None),
            (2.0, None, Some(78202.0)),
            (4.0, Some("99999"), Some(78203.0)),
        ];
        {
            let table = TableWriterBuilder::new()
                .add_character_field("ZCTA5CE10".try_into().unwrap(), 10)
                .add_numeric_field("ZIP".try_into().unwrap(), 10, 0);
            let mut writer = shapefile::Writer::from_path(&path, table).unwrap();
            for (x0, zcta, zip) in rows {
                let mut record = Record::default();
                record.insert(
                    "ZCTA5CE10".to_string(),
                    FieldValue::Character(zcta.map(str::to_string)),
                );
                record.insert("ZIP".to_string(), FieldValue::Numeric(zip));
                writer
                    .write_shape_and_record(&shapefile_square(x0, 0.0), &record)
                    .unwrap();
            }
        }

        let mut store = BoundaryStore::new(filter());
        let collection = store.load(&path).unwrap();
        let ids: Vec<&str> = collection.iter().map(|b| b.area_id.as_str()).collect();
        // The third row's first alias (99999) is present but not a target.
        assert_eq!(ids, vec!["78201", "78202"]);
        assert_eq!(collection.locate(Coord { x: 2.5, y: 0.5 }), Some(1));

        assert!(matches!(
            store.load(&dir.path().join("missing.shp")),
            Err(BoundaryError::Shapefile { .. })
        ));
    }

    #[test]
    fn numeric_dbase_ids_drop_trailing_zero() {
        assert_eq!(format_numeric_id(78201.0), "78201");
        assert_eq!(format_numeric_id(1.5), "1.5");
    }
}
