//! Static PNG preview of the current frame.
//!
//! The boundary layer (fills and strokes) is the expensive part. It is cached
//! and reused until the render key, the boundary collection or the canvas
//! size changes. Markers are drawn fresh on top of it each frame.

use crate::boundary::BoundaryCollection;
use crate::config::OutputConfig;
use crate::controller::RenderModeController;
use crate::presentation::MarkerView;
use crate::render_key::RenderKey;
use crate::types::StyleDescriptor;
use anyhow::{Context, Result};
use geo::bounding_rect::BoundingRect;
use geo::{Coord, Rect};
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgba, RgbaImage};
use rayon::prelude::*;
use std::f64::consts::PI;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

const MARKER_OPACITY: f64 = 0.7;

#[derive(Debug, Clone, Copy)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub background: Rgba<u8>,
}

impl Canvas {
    pub fn from_config(output: &OutputConfig) -> Self {
        Self {
            width: output.width.max(1),
            height: output.height.max(1),
            background: hex_to_rgba(&output.background),
        }
    }
}

// Render key plus what the key does not cover: which boundary collection
// was drawn and at what size.
type LayerIdentity = (RenderKey, Option<u64>, u32, u32);

/// Last built boundary layer and the identity it was built for.
#[derive(Default)]
pub struct BoundaryLayerCache {
    cached: Option<(LayerIdentity, RgbaImage)>,
    builds: usize,
}

impl BoundaryLayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the layer was actually rebuilt.
    pub fn builds(&self) -> usize {
        self.builds
    }

    fn layer(&mut self, identity: LayerIdentity, build: impl FnOnce() -> RgbaImage) -> &RgbaImage {
        let layer = match self.cached.take() {
            Some((cached, layer)) if cached == identity => layer,
            _ => {
                debug!(key = %identity.0, "rebuilding boundary layer");
                self.builds += 1;
                build()
            }
        };
        &self.cached.insert((identity, layer)).1
    }
}

/// Renders the controller's current frame.
pub fn render_frame(
    controller: &RenderModeController,
    canvas: &Canvas,
    cache: &mut BoundaryLayerCache,
) -> RgbaImage {
    let snapshot = controller.snapshot();
    let markers = controller.markers();
    let boundaries = controller.boundaries().map(|b| &**b);

    let viewport = match Viewport::fit(&content_bounds(boundaries, &markers), canvas) {
        Some(viewport) => viewport,
        None => return ImageBuffer::from_pixel(canvas.width, canvas.height, canvas.background),
    };

    let identity = (
        snapshot.key,
        boundaries.map(|b| b.generation()),
        canvas.width,
        canvas.height,
    );
    let layer = cache.layer(identity, || {
        let styles: Vec<StyleDescriptor> = boundaries
            .iter()
            .flat_map(|b| b.iter())
            .map(|boundary| controller.style_for(&boundary.area_id))
            .collect();
        draw_boundary_layer(boundaries, &styles, &viewport, canvas)
    });

    let mut frame = layer.clone();
    for marker in &markers {
        draw_marker(&mut frame, marker, &viewport);
    }
    frame
}

pub fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("Failed to save preview image: {:?}", path))
}

pub fn encode_png(image: RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .context("Failed to encode preview image")?;
    Ok(bytes)
}

fn draw_boundary_layer(
    boundaries: Option<&BoundaryCollection>,
    styles: &[StyleDescriptor],
    viewport: &Viewport,
    canvas: &Canvas,
) -> RgbaImage {
    let mut img = ImageBuffer::from_pixel(canvas.width, canvas.height, canvas.background);
    let boundaries = match boundaries {
        Some(b) => b,
        None => return img,
    };

    // Owner of each pixel center, using the same first-match rule as
    // aggregation so overlaps render the way they are counted.
    let width = canvas.width;
    let owners: Vec<Option<usize>> = (0..canvas.height)
        .into_par_iter()
        .flat_map_iter(|py| {
            (0..width).map(move |px| {
                boundaries.locate(viewport.to_lon_lat(px as f64 + 0.5, py as f64 + 0.5))
            })
        })
        .collect();

    let colors: Vec<Rgba<u8>> = styles.iter().map(|s| hex_to_rgba(&s.color)).collect();

    for (i, owner) in owners.iter().enumerate() {
        if let Some(index) = owner {
            let (x, y) = (i as u32 % width, i as u32 / width);
            blend(img.get_pixel_mut(x, y), colors[*index], styles[*index].fill_opacity);
        }
    }

    for (index, boundary) in boundaries.iter().enumerate() {
        let thickness = styles[index].weight.round().max(1.0);
        for polygon in &boundary.geometry {
            for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
                for line in ring.lines() {
                    let (x0, y0) = viewport.to_pixel(line.start);
                    let (x1, y1) = viewport.to_pixel(line.end);
                    draw_thick_line(&mut img, (x0, y0), (x1, y1), thickness, colors[index]);
                }
            }
        }
    }

    img
}

fn draw_marker(img: &mut RgbaImage, marker: &MarkerView, viewport: &Viewport) {
    let (cx, cy) = viewport.to_pixel(Coord {
        x: marker.lon,
        y: marker.lat,
    });
    let color = hex_to_rgba(&marker.color);
    let r = marker.radius.max(1.0);

    let (w, h) = img.dimensions();
    let x_min = (cx - r).floor().max(0.0) as u32;
    let y_min = (cy - r).floor().max(0.0) as u32;
    let x_max = ((cx + r).ceil().max(0.0) as u32).min(w);
    let y_max = ((cy + r).ceil().max(0.0) as u32).min(h);

    for y in y_min..y_max {
        for x in x_min..x_max {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            if dx * dx + dy * dy <= r * r {
                blend(img.get_pixel_mut(x, y), color, MARKER_OPACITY);
            }
        }
    }
}

fn draw_thick_line(img: &mut RgbaImage, from: (f64, f64), to: (f64, f64), thickness: f64, color: Rgba<u8>) {
    let (w, h) = img.dimensions();
    let length = ((to.0 - from.0).powi(2) + (to.1 - from.1).powi(2)).sqrt();
    let steps = (length * 2.0).ceil().max(1.0) as u32;
    let half = thickness / 2.0;

    for step in 0..=steps {
        let t = step as f64 / steps as f64;
        let x = from.0 + (to.0 - from.0) * t;
        let y = from.1 + (to.1 - from.1) * t;
        let x_start = (x - half).round().max(0.0) as u32;
        let y_start = (y - half).round().max(0.0) as u32;
        let x_end = ((x + half).round().max(0.0) as u32).min(w);
        let y_end = ((y + half).round().max(0.0) as u32).min(h);
        for py in y_start..y_end.max(y_start + 1).min(h) {
            for px in x_start..x_end.max(x_start + 1).min(w) {
                img.put_pixel(px, py, color);
            }
        }
    }
}

fn blend(dst: &mut Rgba<u8>, src: Rgba<u8>, alpha: f64) {
    let alpha = alpha.clamp(0.0, 1.0);
    for c in 0..3 {
        let mixed = src.0[c] as f64 * alpha + dst.0[c] as f64 * (1.0 - alpha);
        dst.0[c] = mixed.round() as u8;
    }
    dst.0[3] = 255;
}

pub fn hex_to_rgba(hex: &str) -> Rgba<u8> {
    let hex = hex.trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .unwrap_or(0)
    };
    Rgba([channel(0..2), channel(2..4), channel(4..6), 255])
}

/// Extent to frame: the boundaries when loaded, otherwise the markers. The
/// cached boundary layer stays valid because markers never move the frame
/// while boundaries are present.
fn content_bounds(boundaries: Option<&BoundaryCollection>, markers: &[MarkerView]) -> Vec<Rect<f64>> {
    match boundaries {
        Some(boundaries) => boundaries
            .iter()
            .filter_map(|boundary| boundary.geometry.bounding_rect())
            .collect(),
        None => markers
            .iter()
            .map(|m| {
                let c = Coord { x: m.lon, y: m.lat };
                Rect::new(c, c)
            })
            .collect(),
    }
}

// Web Mercator in world units ([0, 1] on both axes, y growing southward).
fn mercator(coord: Coord<f64>) -> (f64, f64) {
    let x = (coord.x + 180.0) / 360.0;
    let lat_rad = coord.y.to_radians();
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0;
    (x, y)
}

fn inverse_mercator(x: f64, y: f64) -> Coord<f64> {
    let lon = x * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y)).sinh().atan().to_degrees();
    Coord { x: lon, y: lat }
}

/// Maps Web Mercator world coordinates onto canvas pixels, fitted to the
/// drawn content with a small margin.
struct Viewport {
    origin: (f64, f64),
    scale: f64,
    offset: (f64, f64),
}

impl Viewport {
    fn fit(rects: &[Rect<f64>], canvas: &Canvas) -> Option<Self> {
        let first = rects.first()?;
        let (mut min, mut max) = (first.min(), first.max());
        for rect in &rects[1..] {
            min.x = min.x.min(rect.min().x);
            min.y = min.y.min(rect.min().y);
            max.x = max.x.max(rect.max().x);
            max.y = max.y.max(rect.max().y);
        }

        let top_left = mercator(Coord { x: min.x, y: max.y });
        let bottom_right = mercator(Coord { x: max.x, y: min.y });
        let span_x = (bottom_right.0 - top_left.0).max(1e-9);
        let span_y = (bottom_right.1 - top_left.1).max(1e-9);

        let scale = (canvas.width as f64 / span_x).min(canvas.height as f64 / span_y) * 0.9;
        let offset = (
            (canvas.width as f64 - span_x * scale) / 2.0,
            (canvas.height as f64 - span_y * scale) / 2.0,
        );

        Some(Self {
            origin: top_left,
            scale,
            offset,
        })
    }

    fn to_pixel(&self, coord: Coord<f64>) -> (f64, f64) {
        let (x, y) = mercator(coord);
        (
            (x - self.origin.0) * self.scale + self.offset.0,
            (y - self.origin.1) * self.scale + self.offset.1,
        )
    }

    fn to_lon_lat(&self, px: f64, py: f64) -> Coord<f64> {
        inverse_mercator(
            (px - self.offset.0) / self.scale + self.origin.0,
            (py - self.offset.1) / self.scale + self.origin.1,
        )
    }
}
