use geo::{Coord, MultiPolygon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Category assigned to incidents that arrive without one.
pub const UNKNOWN_CATEGORY: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct Boundary {
    pub area_id: String,
    pub geometry: MultiPolygon<f64>,
}

/// A single geolocated report. Coordinates stay optional so malformed
/// records can travel through the pipeline and be skipped at aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentPoint {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub count: u64,
    pub category: String,
    pub label: Option<String>,
    /// Every field of the source record, for popups.
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl IncidentPoint {
    pub fn new(lat: Option<f64>, lon: Option<f64>) -> Self {
        Self {
            lat,
            lon,
            count: 1,
            category: UNKNOWN_CATEGORY.to_string(),
            label: None,
            properties: serde_json::Map::new(),
        }
    }

    pub fn at(lat: f64, lon: f64) -> Self {
        Self::new(Some(lat), Some(lon))
    }

    /// Zero is not a valid count and falls back to 1.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count.max(1);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Location as a geo coordinate (x = longitude, y = latitude), if both
    /// halves are present.
    pub fn coord(&self) -> Option<Coord<f64>> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coord { x: lon, y: lat }),
            _ => None,
        }
    }
}

/// Per-area totals and per-area category sub-counts.
///
/// Ordered maps keep serialization canonical, which the render key relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationResult {
    pub totals: BTreeMap<String, u64>,
    pub breakdown: BTreeMap<String, BTreeMap<String, u64>>,
}

impl AggregationResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn total(&self, area_id: &str) -> u64 {
        self.totals.get(area_id).copied().unwrap_or(0)
    }

    pub fn categories(&self, area_id: &str) -> Option<&BTreeMap<String, u64>> {
        self.breakdown.get(area_id)
    }

    pub fn grand_total(&self) -> u64 {
        self.totals.values().fold(0, |acc, n| acc.saturating_add(*n))
    }

    /// Sums saturate rather than wrap or abort the batch.
    pub(crate) fn record(&mut self, area_id: &str, category: &str, count: u64) {
        let total = self.totals.entry(area_id.to_string()).or_insert(0);
        *total = total.saturating_add(count);
        let sub = self
            .breakdown
            .entry(area_id.to_string())
            .or_default()
            .entry(category.to_string())
            .or_insert(0);
        *sub = sub.saturating_add(count);
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    /// Boundaries colored by summed incident counts.
    #[default]
    Aggregated,
    /// Individual incidents drawn as markers.
    Raw,
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewMode::Aggregated => f.write_str("aggregated"),
            ViewMode::Raw => f.write_str("raw"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleDescriptor {
    pub color: String, // Hex stroke color
    pub weight: f64,
    pub fill_opacity: f64,
}

impl StyleDescriptor {
    pub fn new(color: impl Into<String>, weight: f64, fill_opacity: f64) -> Self {
        Self {
            color: color.into(),
            weight,
            fill_opacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coord_requires_both_halves() {
        assert!(IncidentPoint::new(Some(29.4), None).coord().is_none());
        assert!(IncidentPoint::new(None, Some(-98.5)).coord().is_none());
        let c = IncidentPoint::at(29.4, -98.5).coord().unwrap();
        assert_eq!((c.x, c.y), (-98.5, 29.4));
    }

    #[test]
    fn zero_count_falls_back_to_one() {
        assert_eq!(IncidentPoint::at(0.0, 0.0).with_count(0).count, 1);
        assert_eq!(IncidentPoint::at(0.0, 0.0).with_count(7).count, 7);
    }

    #[test]
    fn record_keeps_breakdown_in_step_with_totals() {
        let mut result = AggregationResult::empty();
        result.record("78201", "pothole", 3);
        result.record("78201", "debris", 1);
        result.record("78201", "pothole", 2);
        assert_eq!(result.total("78201"), 6);
        assert_eq!(result.categories("78201").unwrap()["pothole"], 5);
        assert_eq!(result.total("78202"), 0);
        assert_eq!(result.grand_total(), 6);
    }

    #[test]
    fn huge_counts_saturate_instead_of_overflowing() {
        let mut result = AggregationResult::empty();
        result.record("78201", "pothole", u64::MAX);
        result.record("78201", "pothole", u64::MAX);
        result.record("78202", "debris", u64::MAX);
        assert_eq!(result.total("78201"), u64::MAX);
        assert_eq!(result.categories("78201").unwrap()["pothole"], u64::MAX);
        assert_eq!(result.grand_total(), u64::MAX);
    }

    #[test]
    fn view_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ViewMode::Raw).unwrap(), "\"raw\"");
        let mode: ViewMode = serde_json::from_str("\"aggregated\"").unwrap();
        assert_eq!(mode, ViewMode::Aggregated);
    }
}
