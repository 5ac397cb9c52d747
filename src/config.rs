use crate::types::StyleDescriptor;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// San Antonio ZIP codes covered by the service.
const DEFAULT_TARGET_AREAS: &[&str] = &[
    "78201", "78202", "78203", "78204", "78205", "78206", "78207", "78208", "78209", "78210",
    "78211", "78212", "78213", "78214", "78215", "78216", "78217", "78218", "78219", "78220",
    "78221", "78222", "78223", "78224", "78225", "78226", "78227", "78228", "78229", "78230",
    "78231", "78232", "78233", "78234", "78235", "78236", "78237", "78238", "78239", "78240",
    "78241", "78242", "78243", "78244", "78245", "78246", "78247", "78248", "78249", "78250",
    "78251", "78252", "78253", "78254", "78255", "78256", "78257", "78258", "78259", "78260",
    "78261", "78262", "78263", "78264", "78265", "78266", "78268", "78269", "78270", "78275",
    "78278", "78279", "78280", "78283", "78284", "78285", "78286", "78287", "78288", "78289",
    "78291", "78292", "78293", "78294", "78295", "78296", "78297", "78298", "78299",
];

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub incidents: IncidentFieldConfig,
    #[serde(default)]
    pub style: StyleConfig,
    #[serde(default)]
    pub markers: MarkerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub boundaries: PathBuf, // GeoJSON or shapefile
    #[serde(default = "default_area_id_properties")]
    pub area_id_properties: Vec<String>,
    #[serde(default = "default_target_areas")]
    pub target_areas: Vec<String>,
}

/// Property-name aliases tried in order when reading assistant records.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IncidentFieldConfig {
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub count: Vec<String>,
    pub category: Vec<String>,
    pub label: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StyleConfig {
    pub default: StyleDescriptor,
    pub highlight: StyleDescriptor,
    pub hover: StyleDescriptor,
    pub neutral: StyleDescriptor,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarkerConfig {
    pub color: String,
    pub radius_per_count: f64,
    pub max_radius: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub image: PathBuf,
    pub width: u32,
    pub height: u32,
    pub background: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: Option<PathBuf>,
}

fn default_area_id_properties() -> Vec<String> {
    strings(&["ZCTA5CE10", "ZIP", "zip"])
}

fn default_target_areas() -> Vec<String> {
    strings(DEFAULT_TARGET_AREAS)
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl Default for IncidentFieldConfig {
    fn default() -> Self {
        Self {
            latitude: strings(&["lat", "latitude", "Latitude", "LAT"]),
            longitude: strings(&["lon", "lng", "longitude", "Longitude", "LON"]),
            count: strings(&["count", "Count", "injury_count"]),
            category: strings(&["category", "Category", "type"]),
            label: strings(&["name", "label", "MSAG_Name", "Stop", "Sensitive", "intersection"]),
        }
    }
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            default: StyleDescriptor::new("#1E90FF", 1.5, 0.3),
            highlight: StyleDescriptor::new("#FF4500", 3.0, 0.6),
            hover: StyleDescriptor::new("#FFD700", 3.0, 0.6),
            neutral: StyleDescriptor::new("#808080", 1.0, 0.1),
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            color: "#DC143C".to_string(),
            radius_per_count: 4.0,
            max_radius: 48.0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            image: PathBuf::from("map.png"),
            width: 1024,
            height: 1024,
            background: "#FFFFFF".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5006,
            static_dir: None,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = AppConfig::from_toml("[input]\nboundaries = \"tx_zips.geojson\"\n").unwrap();
        assert_eq!(config.input.area_id_properties, vec!["ZCTA5CE10", "ZIP", "zip"]);
        assert!(config.input.target_areas.contains(&"78201".to_string()));
        assert!(!config.input.target_areas.contains(&"78267".to_string()));
        assert_eq!(config.style.default.color, "#1E90FF");
        assert_eq!(config.server.port, 5006);
        assert_eq!(config.incidents.latitude[0], "lat");
    }

    #[test]
    fn sections_override_defaults() {
        let config = AppConfig::from_toml(
            r##"
            [input]
            boundaries = "districts.shp"
            area_id_properties = ["DISTRICT"]
            target_areas = ["1", "2"]

            [style.highlight]
            color = "#00FF00"
            weight = 4.0
            fill_opacity = 0.8

            [markers]
            radius_per_count = 2.5

            [server]
            port = 8080
            "##,
        )
        .unwrap();
        assert_eq!(config.input.target_areas, vec!["1", "2"]);
        assert_eq!(config.style.highlight.weight, 4.0);
        // Unspecified palette entries keep their defaults.
        assert_eq!(config.style.hover.color, "#FFD700");
        assert_eq!(config.markers.radius_per_count, 2.5);
        assert_eq!(config.markers.max_radius, 48.0);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn missing_input_section_is_an_error() {
        assert!(AppConfig::from_toml("[server]\nport = 1\n").is_err());
    }
}
