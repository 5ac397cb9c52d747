use anyhow::Result;
use area_incident_map::boundary::{BoundaryFilter, BoundaryStore};
use area_incident_map::config::AppConfig;
use area_incident_map::controller::RenderModeController;
use area_incident_map::incident::IncidentReader;
use area_incident_map::presentation::MarkerBuilder;
use area_incident_map::render::{self, BoundaryLayerCache, Canvas};
use area_incident_map::server;
use area_incident_map::style::StyleResolver;
use area_incident_map::types::ViewMode;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate an incident file onto the configured boundaries and print the result as JSON
    Aggregate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        incidents: PathBuf,
        #[arg(short, long, value_enum, default_value_t = ViewMode::Aggregated)]
        mode: ViewMode,
    },
    /// Render a PNG preview of the map for an incident file
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        incidents: PathBuf,
        #[arg(short, long, value_enum, default_value_t = ViewMode::Aggregated)]
        mode: ViewMode,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Serve the map API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Aggregate {
            config,
            incidents,
            mode,
        } => {
            let app_config = AppConfig::load_from_file(config)?;
            let controller = load_controller(&app_config, incidents, *mode)?;
            let snapshot = controller.snapshot();

            let report = serde_json::json!({
                "mode": snapshot.mode,
                "key": snapshot.key,
                "totals": snapshot.aggregation.totals,
                "breakdown": snapshot.aggregation.breakdown,
                "markers": controller.markers(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Render {
            config,
            incidents,
            mode,
            output,
        } => {
            let app_config = AppConfig::load_from_file(config)?;
            let controller = load_controller(&app_config, incidents, *mode)?;

            let canvas = Canvas::from_config(&app_config.output);
            let image = render::render_frame(&controller, &canvas, &mut BoundaryLayerCache::new());
            let path = output.as_ref().unwrap_or(&app_config.output.image);
            render::save_png(&image, path)?;

            info!("Wrote preview to {:?}", path);
        }
        Commands::Serve { config } => {
            info!("Serving map with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            server::start_server(app_config).await?;
        }
    }

    Ok(())
}

fn load_controller(config: &AppConfig, incidents: &Path, mode: ViewMode) -> Result<RenderModeController> {
    let mut controller = RenderModeController::new(
        StyleResolver::new(config.style.clone()),
        MarkerBuilder::new(config.markers.clone()),
    );

    // Missing boundaries degrade the aggregated view; they do not stop raw mode.
    let mut store = BoundaryStore::new(BoundaryFilter::from_config(&config.input));
    match store.load(&config.input.boundaries) {
        Ok(collection) => controller.set_boundaries(collection),
        Err(e) => {
            warn!(error = %e, "Boundaries unavailable");
            controller.boundaries_unavailable();
        }
    }

    let points = IncidentReader::new(config.incidents.clone()).read_file(incidents)?;
    info!("Loaded {} incident records", points.len());

    controller.set_mode(mode);
    controller.replace_points(points);
    Ok(controller)
}
