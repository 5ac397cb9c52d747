use crate::config::MarkerConfig;
use crate::types::{AggregationResult, IncidentPoint};
use serde::Serialize;
use std::collections::BTreeMap;

/// Popup content for an area in aggregated mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AreaSummary {
    pub area_id: String,
    pub total: u64,
    /// Only categories that contributed to the total.
    pub breakdown: BTreeMap<String, u64>,
}

impl AreaSummary {
    pub fn from_aggregation(area_id: &str, aggregation: &AggregationResult) -> Self {
        let breakdown = aggregation
            .categories(area_id)
            .map(|categories| {
                categories
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(category, count)| (category.clone(), *count))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            area_id: area_id.to_string(),
            total: aggregation.total(area_id),
            breakdown,
        }
    }

    pub fn popup_text(&self) -> String {
        let mut text = format!("ZIP Code: {}\nIncidents: {}", self.area_id, self.total);
        for (category, count) in &self.breakdown {
            text.push_str(&format!("\n{}: {}", category, count));
        }
        text
    }
}

/// One raw-mode marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerView {
    pub lat: f64,
    pub lon: f64,
    pub label: String,
    pub category: String,
    pub count: u64,
    pub radius: f64,
    pub color: String,
}

#[derive(Debug, Clone, Default)]
pub struct MarkerBuilder {
    config: MarkerConfig,
}

impl MarkerBuilder {
    pub fn new(config: MarkerConfig) -> Self {
        Self { config }
    }

    /// Radius grows linearly with the count, capped at `max_radius`.
    pub fn radius_for(&self, count: u64) -> f64 {
        (self.config.radius_per_count * count as f64).min(self.config.max_radius)
    }

    // A record may carry its own `marker_radius`; it is still capped.
    fn radius_of(&self, point: &IncidentPoint) -> f64 {
        let explicit = point.properties.get("marker_radius").and_then(|r| match r {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        match explicit {
            Some(r) if r.is_finite() && r > 0.0 => r.min(self.config.max_radius),
            _ => self.radius_for(point.count),
        }
    }

    /// Markers for every point with a usable location, in input order.
    pub fn markers(&self, points: &[IncidentPoint]) -> Vec<MarkerView> {
        points
            .iter()
            .filter_map(|point| {
                let coord = point.coord()?;
                let color = point
                    .properties
                    .get("color")
                    .and_then(|c| c.as_str())
                    .unwrap_or(&self.config.color)
                    .to_string();
                Some(MarkerView {
                    lat: coord.y,
                    lon: coord.x,
                    label: point
                        .label
                        .clone()
                        .unwrap_or_else(|| point.category.clone()),
                    category: point.category.clone(),
                    count: point.count,
                    radius: self.radius_of(point),
                    color,
                })
            })
            .collect()
    }
}
