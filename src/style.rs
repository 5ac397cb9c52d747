use crate::config::StyleConfig;
use crate::types::{AggregationResult, StyleDescriptor, ViewMode};

/// Maps an area's aggregation state and the active mode to a style.
///
/// Styles are derived on every call and never cached, so a pointer-out after
/// hovering always reflects the aggregation as it is now.
#[derive(Debug, Clone, Default)]
pub struct StyleResolver {
    palette: StyleConfig,
}

impl StyleResolver {
    pub fn new(palette: StyleConfig) -> Self {
        Self { palette }
    }

    pub fn style_for(
        &self,
        area_id: &str,
        aggregation: &AggregationResult,
        mode: ViewMode,
    ) -> StyleDescriptor {
        match mode {
            ViewMode::Raw => self.palette.neutral.clone(),
            ViewMode::Aggregated if aggregation.total(area_id) > 0 => {
                self.palette.highlight.clone()
            }
            ViewMode::Aggregated => self.palette.default.clone(),
        }
    }

    pub fn hover(&self) -> StyleDescriptor {
        self.palette.hover.clone()
    }

    /// Style to put back on pointer-out.
    pub fn restore(
        &self,
        area_id: &str,
        aggregation: &AggregationResult,
        mode: ViewMode,
    ) -> StyleDescriptor {
        self.style_for(area_id, aggregation, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counted(area_id: &str, count: u64) -> AggregationResult {
        let mut result = AggregationResult::empty();
        result.record(area_id, "pothole", count);
        result
    }

    #[test]
    fn highlights_only_areas_with_incidents() {
        let resolver = StyleResolver::default();
        let palette = StyleConfig::default();
        let result = counted("78201", 2);

        assert_eq!(
            resolver.style_for("78201", &result, ViewMode::Aggregated),
            palette.highlight
        );
        assert_eq!(
            resolver.style_for("78202", &result, ViewMode::Aggregated),
            palette.default
        );
    }

    #[test]
    fn highlight_is_visually_distinct_from_default() {
        let palette = StyleConfig::default();
        assert_ne!(palette.highlight.color, palette.default.color);
        assert!(palette.highlight.weight > palette.default.weight);
        assert!(palette.highlight.fill_opacity > palette.default.fill_opacity);
    }

    #[test]
    fn scenario_c_empty_result_styles_everything_default() {
        let resolver = StyleResolver::default();
        let empty = AggregationResult::empty();
        for area in ["78201", "78202", "78299"] {
            assert_eq!(
                resolver.style_for(area, &empty, ViewMode::Aggregated),
                StyleConfig::default().default
            );
        }
    }

    #[test]
    fn raw_mode_is_neutral_regardless_of_counts() {
        let resolver = StyleResolver::default();
        assert_eq!(
            resolver.style_for("78201", &counted("78201", 9), ViewMode::Raw),
            StyleConfig::default().neutral
        );
    }

    #[test]
    fn restore_reflects_aggregation_changed_during_hover() {
        let resolver = StyleResolver::default();
        let before = AggregationResult::empty();
        let shown = resolver.style_for("78201", &before, ViewMode::Aggregated);
        assert_eq!(resolver.hover(), StyleConfig::default().hover);

        let after = counted("78201", 1);
        let restored = resolver.restore("78201", &after, ViewMode::Aggregated);
        assert_ne!(restored, shown);
        assert_eq!(restored, StyleConfig::default().highlight);
    }
}
