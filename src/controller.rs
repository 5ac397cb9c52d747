use crate::aggregate::aggregate;
use crate::boundary::BoundaryCollection;
use crate::presentation::{AreaSummary, MarkerBuilder, MarkerView};
use crate::render_key::{key_for, RenderKey};
use crate::style::StyleResolver;
use crate::types::{AggregationResult, IncidentPoint, StyleDescriptor, ViewMode};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Everything the rendering layer needs for one frame, computed in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct RenderSnapshot {
    /// Bumped once per recomputation.
    pub revision: u64,
    /// Request sequence whose incident data this frame was computed from.
    pub data_seq: u64,
    pub mode: ViewMode,
    pub boundaries_ready: bool,
    pub aggregation: AggregationResult,
    pub key: RenderKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestTicket {
    seq: u64,
}

impl RequestTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Rebuilds a ticket from a sequence number handed to a client earlier.
    pub fn from_seq(seq: u64) -> Self {
        Self { seq }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Completion {
    Applied { seq: u64 },
    /// A newer request was issued (or this one already completed); nothing
    /// changed.
    Stale { seq: u64, latest: u64 },
}

/// Owns view mode, held incidents and the boundary handle, and republishes a
/// fresh `RenderSnapshot` exactly once whenever one of them changes.
pub struct RenderModeController {
    mode: ViewMode,
    boundaries: Option<Arc<BoundaryCollection>>,
    points: Vec<IncidentPoint>,
    latest_seq: u64,
    data_seq: u64,
    revision: u64,
    styles: StyleResolver,
    markers: MarkerBuilder,
    snapshot: watch::Sender<Arc<RenderSnapshot>>,
}

impl RenderModeController {
    pub fn new(styles: StyleResolver, markers: MarkerBuilder) -> Self {
        let mode = ViewMode::default();
        let aggregation = AggregationResult::empty();
        let initial = RenderSnapshot {
            revision: 0,
            data_seq: 0,
            mode,
            boundaries_ready: false,
            key: key_for(&aggregation, mode),
            aggregation,
        };
        let (snapshot, _) = watch::channel(Arc::new(initial));

        Self {
            mode,
            boundaries: None,
            points: Vec::new(),
            latest_seq: 0,
            data_seq: 0,
            revision: 0,
            styles,
            markers,
            snapshot,
        }
    }

    pub fn current_mode(&self) -> ViewMode {
        self.mode
    }

    /// Switching to the active mode is a no-op.
    pub fn set_mode(&mut self, mode: ViewMode) {
        if mode == self.mode {
            return;
        }
        info!(from = %self.mode, to = %mode, "switching view mode");
        self.mode = mode;
        self.publish();
    }

    pub fn set_boundaries(&mut self, boundaries: Arc<BoundaryCollection>) {
        info!(count = boundaries.len(), "boundaries ready");
        self.boundaries = Some(boundaries);
        self.publish();
    }

    /// Aggregated view degrades to no highlighting; raw markers still work.
    pub fn boundaries_unavailable(&mut self) {
        warn!("boundaries unavailable; aggregated view will show no highlighting");
        self.boundaries = None;
        self.publish();
    }

    pub fn boundaries(&self) -> Option<&Arc<BoundaryCollection>> {
        self.boundaries.as_ref()
    }

    /// Starts a new user query. The previous answer no longer applies, so the
    /// held incidents are cleared right away.
    pub fn begin_request(&mut self) -> RequestTicket {
        self.latest_seq += 1;
        debug!(seq = self.latest_seq, "incident request issued");
        if !self.points.is_empty() {
            self.points.clear();
            self.publish();
        }
        RequestTicket {
            seq: self.latest_seq,
        }
    }

    pub fn complete_request(
        &mut self,
        ticket: RequestTicket,
        points: Vec<IncidentPoint>,
    ) -> Completion {
        if let Some(stale) = self.stale(ticket) {
            return stale;
        }
        debug!(seq = ticket.seq, points = points.len(), "incident request completed");
        self.data_seq = ticket.seq;
        self.points = points;
        self.publish();
        Completion::Applied { seq: ticket.seq }
    }

    /// A failed current request leaves the view empty.
    pub fn fail_request(&mut self, ticket: RequestTicket) -> Completion {
        if let Some(stale) = self.stale(ticket) {
            return stale;
        }
        warn!(seq = ticket.seq, "incident request failed");
        self.data_seq = ticket.seq;
        self.publish();
        Completion::Applied { seq: ticket.seq }
    }

    /// Replaces held incidents outside the request flow (file input, tests).
    pub fn replace_points(&mut self, points: Vec<IncidentPoint>) -> RequestTicket {
        self.latest_seq += 1;
        self.data_seq = self.latest_seq;
        self.points = points;
        self.publish();
        RequestTicket {
            seq: self.latest_seq,
        }
    }

    fn stale(&self, ticket: RequestTicket) -> Option<Completion> {
        if ticket.seq == self.latest_seq && ticket.seq > self.data_seq {
            return None;
        }
        debug!(
            seq = ticket.seq,
            latest = self.latest_seq,
            "ignoring stale incident completion"
        );
        Some(Completion::Stale {
            seq: ticket.seq,
            latest: self.latest_seq,
        })
    }

    pub fn points(&self) -> &[IncidentPoint] {
        &self.points
    }

    pub fn snapshot(&self) -> Arc<RenderSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RenderSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn style_for(&self, area_id: &str) -> StyleDescriptor {
        let snapshot = self.snapshot.borrow();
        self.styles
            .style_for(area_id, &snapshot.aggregation, snapshot.mode)
    }

    pub fn hover_style(&self) -> StyleDescriptor {
        self.styles.hover()
    }

    /// Re-queried on pointer-out; never a cached pre-hover style.
    pub fn restore_style(&self, area_id: &str) -> StyleDescriptor {
        let snapshot = self.snapshot.borrow();
        self.styles
            .restore(area_id, &snapshot.aggregation, snapshot.mode)
    }

    pub fn area_summary(&self, area_id: &str) -> AreaSummary {
        AreaSummary::from_aggregation(area_id, &self.snapshot.borrow().aggregation)
    }

    /// One summary per boundary, in boundary order.
    pub fn area_summaries(&self) -> Vec<AreaSummary> {
        let snapshot = self.snapshot.borrow();
        self.boundaries
            .iter()
            .flat_map(|b| b.iter())
            .map(|boundary| AreaSummary::from_aggregation(&boundary.area_id, &snapshot.aggregation))
            .collect()
    }

    /// Raw-mode markers; aggregated mode draws none.
    pub fn markers(&self) -> Vec<MarkerView> {
        match self.mode {
            ViewMode::Raw => self.markers.markers(&self.points),
            ViewMode::Aggregated => Vec::new(),
        }
    }

    /// Area that owns a location, by the same first-match rule as aggregation.
    pub fn locate(&self, lat: f64, lon: f64) -> Option<AreaSummary> {
        let boundaries = self.boundaries.as_ref()?;
        let index = boundaries.locate(geo::Coord { x: lon, y: lat })?;
        let boundary = boundaries.get(index)?;
        Some(self.area_summary(&boundary.area_id))
    }

    fn publish(&mut self) {
        let aggregation = match (&self.boundaries, self.mode) {
            (Some(boundaries), ViewMode::Aggregated) => {
                aggregate(boundaries, &self.points, self.mode)
            }
            _ => AggregationResult::empty(),
        };
        let key = key_for(&aggregation, self.mode);
        self.revision += 1;

        debug!(revision = self.revision, mode = %self.mode, key = %key, "publishing render snapshot");

        self.snapshot.send_replace(Arc::new(RenderSnapshot {
            revision: self.revision,
            data_seq: self.data_seq,
            mode: self.mode,
            boundaries_ready: self.boundaries.is_some(),
            aggregation,
            key,
        }));
    }
}
