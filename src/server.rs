use crate::boundary::{BoundaryFilter, BoundaryStore};
use crate::config::AppConfig;
use crate::controller::{Completion, RenderModeController, RenderSnapshot, RequestTicket};
use crate::incident::IncidentReader;
use crate::presentation::{AreaSummary, MarkerBuilder, MarkerView};
use crate::render::{encode_png, render_frame, BoundaryLayerCache, Canvas};
use crate::style::StyleResolver;
use crate::types::ViewMode;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

pub struct AppState {
    pub store: Mutex<BoundaryStore>,
    pub controller: Mutex<RenderModeController>,
    pub reader: IncidentReader,
    pub canvas: Canvas,
    pub render_cache: Mutex<BoundaryLayerCache>,
}

impl AppState {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            store: Mutex::new(BoundaryStore::new(BoundaryFilter::from_config(&config.input))),
            controller: Mutex::new(RenderModeController::new(
                StyleResolver::new(config.style.clone()),
                MarkerBuilder::new(config.markers.clone()),
            )),
            reader: IncidentReader::new(config.incidents.clone()),
            canvas: Canvas::from_config(&config.output),
            render_cache: Mutex::new(BoundaryLayerCache::new()),
        }
    }
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
pub struct ModeRequest {
    mode: ViewMode,
}

#[derive(Serialize)]
pub struct StateResponse {
    #[serde(flatten)]
    snapshot: RenderSnapshot,
    markers: Vec<MarkerView>,
}

#[derive(Serialize)]
pub struct RequestIssued {
    seq: u64,
}

type HandlerError = (StatusCode, String);

pub fn router(state: Arc<AppState>, config: &AppConfig) -> Router {
    let mut app = Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/boundaries", get(boundaries_handler))
        .route("/api/mode", put(mode_handler))
        .route("/api/requests", post(begin_request_handler))
        .route(
            "/api/requests/:seq",
            post(complete_request_handler).delete(fail_request_handler),
        )
        .route("/api/query", get(query_handler))
        .route("/api/render.png", get(render_handler));

    if let Some(dir) = &config.server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive()).with_state(state)
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    let state = Arc::new(AppState::new(&config));

    // Boundaries load in the background; until they arrive the aggregated
    // view simply has nothing to highlight.
    let filter = BoundaryFilter::from_config(&config.input);
    let path = config.input.boundaries.clone();
    let loader = Arc::clone(&state);
    tokio::spawn(async move {
        info!("Loading boundaries from {:?}...", path);
        let loaded = tokio::task::spawn_blocking(move || filter.read(&path)).await;
        let mut controller = loader.controller.lock();
        match loaded {
            Ok(Ok(collection)) => {
                let collection = loader.store.lock().install(collection);
                controller.set_boundaries(collection);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "boundary load failed");
                controller.boundaries_unavailable();
            }
            Err(e) => {
                error!(error = %e, "boundary loader task panicked");
                controller.boundaries_unavailable();
            }
        }
    });

    let port = config.server.port;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    info!("Starting server on http://{}", addr);

    let app = router(state, &config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn state_response(controller: &RenderModeController) -> StateResponse {
    StateResponse {
        snapshot: (*controller.snapshot()).clone(),
        markers: controller.markers(),
    }
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    Json(state_response(&state.controller.lock()))
}

async fn boundaries_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FeatureCollection>, HandlerError> {
    let controller = state.controller.lock();
    let boundaries = controller.boundaries().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "boundaries unavailable".to_string(),
    ))?;

    let mut features = Vec::with_capacity(boundaries.len());
    for boundary in boundaries.iter() {
        let summary = controller.area_summary(&boundary.area_id);
        let mut properties = JsonObject::new();
        properties.insert("area_id".into(), boundary.area_id.clone().into());
        properties.insert("popup".into(), summary.popup_text().into());
        properties.insert("style".into(), to_json(&controller.style_for(&boundary.area_id))?);
        properties.insert("hover_style".into(), to_json(&controller.hover_style())?);
        properties.insert("summary".into(), to_json(&summary)?);

        features.push(Feature {
            bbox: None,
            geometry: Some(Geometry::new(geojson::Value::from(&boundary.geometry))),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        });
    }

    Ok(Json(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerError> {
    serde_json::to_value(value).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn mode_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModeRequest>,
) -> Json<StateResponse> {
    let mut controller = state.controller.lock();
    controller.set_mode(request.mode);
    Json(state_response(&controller))
}

async fn begin_request_handler(State(state): State<Arc<AppState>>) -> Json<RequestIssued> {
    let ticket = state.controller.lock().begin_request();
    Json(RequestIssued { seq: ticket.seq() })
}

/// Body is whatever the assistant answered: its `{response, highlight_data}`
/// envelope or a bare array of records.
async fn complete_request_handler(
    State(state): State<Arc<AppState>>,
    Path(seq): Path<u64>,
    Json(payload): Json<serde_json::Value>,
) -> Json<Completion> {
    let points = state.reader.parse_json(&payload);
    let completion = state
        .controller
        .lock()
        .complete_request(RequestTicket::from_seq(seq), points);
    Json(completion)
}

async fn fail_request_handler(
    State(state): State<Arc<AppState>>,
    Path(seq): Path<u64>,
) -> Json<Completion> {
    Json(
        state
            .controller
            .lock()
            .fail_request(RequestTicket::from_seq(seq)),
    )
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<AreaSummary>> {
    Json(state.controller.lock().locate(params.lat, params.lon))
}

async fn render_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HandlerError> {
    let frame = {
        let controller = state.controller.lock();
        let mut cache = state.render_cache.lock();
        render_frame(&controller, &state.canvas, &mut cache)
    };
    let bytes =
        encode_png(frame).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes))
}
