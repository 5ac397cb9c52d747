//! Point-in-polygon join of incidents onto target-area boundaries.
//!
//! Semantics are those of a linear scan: every usable point is assigned to
//! the first boundary, in collection order, that contains it (edges
//! included), which is O(points × boundaries). `BoundaryCollection::locate`
//! narrows the scan with an R-tree over boundary envelopes but still returns
//! the lowest matching index, so results are identical to the scan.

use crate::boundary::BoundaryCollection;
use crate::types::{AggregationResult, IncidentPoint, ViewMode};
use rayon::prelude::*;
use tracing::debug;

/// Sums incident counts per area and per (area, category).
///
/// `Raw` mode bypasses area aggregation and always yields the empty result.
pub fn aggregate(
    boundaries: &BoundaryCollection,
    points: &[IncidentPoint],
    mode: ViewMode,
) -> AggregationResult {
    if mode == ViewMode::Raw {
        return AggregationResult::empty();
    }

    // Containment tests run in parallel; `collect` keeps input order and the
    // fold below is sequential, so output never depends on scheduling.
    let assignments: Vec<Option<usize>> = points
        .par_iter()
        .map(|point| point.coord().and_then(|coord| boundaries.locate(coord)))
        .collect();

    let mut result = AggregationResult::empty();
    let mut unmatched = 0usize;

    for (point, assignment) in points.iter().zip(assignments) {
        match assignment.and_then(|index| boundaries.get(index)) {
            Some(boundary) => result.record(&boundary.area_id, &point.category, point.count),
            None => unmatched += 1,
        }
    }

    debug!(
        points = points.len(),
        unmatched,
        areas = result.totals.len(),
        "aggregated incidents onto boundaries"
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::tests::square;
    use crate::types::UNKNOWN_CATEGORY;
    use std::collections::BTreeMap;

    // Two disjoint unit-ish squares standing in for ZIP polygons.
    fn zips() -> BoundaryCollection {
        BoundaryCollection::new(vec![
            square("78201", -98.6, 29.4, 0.1),
            square("78202", -98.4, 29.4, 0.1),
        ])
    }

    #[test]
    fn scenario_a_counts_and_breakdown() {
        let points = vec![
            IncidentPoint::at(29.45, -98.55).with_count(3).with_category("pothole"),
            IncidentPoint::at(29.42, -98.52).with_category("debris"),
            IncidentPoint::at(29.45, -98.35).with_count(5),
        ];
        let result = aggregate(&zips(), &points, ViewMode::Aggregated);

        assert_eq!(result.total("78201"), 4);
        assert_eq!(
            result.categories("78201").unwrap(),
            &BTreeMap::from([("debris".to_string(), 1), ("pothole".to_string(), 3)])
        );
        assert_eq!(result.total("78202"), 5);
        assert_eq!(result.categories("78202").unwrap()[UNKNOWN_CATEGORY], 5);
    }

    #[test]
    fn scenario_b_point_without_longitude_is_excluded() {
        let base = vec![IncidentPoint::at(29.45, -98.55).with_count(2)];
        let mut with_broken = base.clone();
        with_broken.push(IncidentPoint::new(Some(29.45), None).with_count(9));

        let expected = aggregate(&zips(), &base, ViewMode::Aggregated);
        let actual = aggregate(&zips(), &with_broken, ViewMode::Aggregated);
        assert_eq!(actual, expected);
        assert_eq!(actual.grand_total(), 2);
    }

    #[test]
    fn scenario_c_no_points_gives_empty_maps() {
        let result = aggregate(&zips(), &[], ViewMode::Aggregated);
        assert!(result.totals.is_empty());
        assert!(result.breakdown.is_empty());
    }

    #[test]
    fn raw_mode_bypasses_aggregation() {
        let points = vec![IncidentPoint::at(29.45, -98.55)];
        assert!(aggregate(&zips(), &points, ViewMode::Raw).is_empty());
    }

    #[test]
    fn counts_are_conserved_and_breakdowns_sum_to_totals() {
        let categories = ["pothole", "debris", "signal"];
        let points: Vec<IncidentPoint> = (0..60)
            .map(|i| {
                let lon = if i % 2 == 0 { -98.55 } else { -98.35 };
                let lat = 29.41 + (i % 8) as f64 * 0.01;
                IncidentPoint::at(lat, lon)
                    .with_count(1 + i % 4)
                    .with_category(categories[i as usize % 3])
            })
            .collect();
        let expected: u64 = points.iter().map(|p| p.count).sum();

        let result = aggregate(&zips(), &points, ViewMode::Aggregated);
        assert_eq!(result.grand_total(), expected);
        for (area, total) in &result.totals {
            let sum: u64 = result.breakdown[area].values().sum();
            assert_eq!(sum, *total, "breakdown mismatch for {}", area);
        }
    }

    #[test]
    fn unmatched_points_are_dropped() {
        let points = vec![IncidentPoint::at(10.0, 10.0).with_count(7)];
        assert!(aggregate(&zips(), &points, ViewMode::Aggregated).is_empty());
    }

    #[test]
    fn overlapping_boundaries_use_first_match() {
        let collection = BoundaryCollection::new(vec![
            square("first", 0.0, 0.0, 2.0),
            square("second", 1.0, 1.0, 2.0),
        ]);
        let points = vec![IncidentPoint::at(1.5, 1.5), IncidentPoint::at(2.5, 2.5)];
        let result = aggregate(&collection, &points, ViewMode::Aggregated);
        assert_eq!(result.total("first"), 1);
        assert_eq!(result.total("second"), 1);
    }

    #[test]
    fn point_on_shared_edge_is_counted_once() {
        let collection = BoundaryCollection::new(vec![
            square("west", 0.0, 0.0, 1.0),
            square("east", 1.0, 0.0, 1.0),
        ]);
        let points = vec![IncidentPoint::at(0.5, 1.0)];
        let result = aggregate(&collection, &points, ViewMode::Aggregated);
        assert_eq!(result.grand_total(), 1);
        assert_eq!(result.total("west"), 1);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let points: Vec<IncidentPoint> = (0..200)
            .map(|i| IncidentPoint::at(29.4 + (i % 10) as f64 * 0.01, -98.6 + (i % 25) as f64 * 0.01))
            .collect();
        let first = aggregate(&zips(), &points, ViewMode::Aggregated);
        for _ in 0..5 {
            assert_eq!(aggregate(&zips(), &points, ViewMode::Aggregated), first);
        }
    }

    #[test]
    fn absurd_counts_from_records_do_not_abort_aggregation() {
        let records = serde_json::json!([
            {"lat": 29.45, "lon": -98.55, "count": 1e19},
            {"lat": 29.45, "lon": -98.55, "count": 1e19},
            {"lat": 29.45, "lon": -98.55, "count": 2}
        ]);
        let points = crate::incident::IncidentReader::default().parse_json(&records);
        let result = aggregate(&zips(), &points, ViewMode::Aggregated);
        assert_eq!(result.total("78201"), 4);
    }
}
