//! Spatial aggregation and render-mode engine for an incident map.
//!
//! Incident points reported by an external assistant are joined onto
//! administrative boundaries (ZIP codes, districts) and summarized per area,
//! or shown as raw markers. [`controller::RenderModeController`] ties the
//! pieces together and publishes one consistent [`controller::RenderSnapshot`]
//! per change, keyed by a [`render_key::RenderKey`] the drawing layer can
//! compare instead of diffing aggregation maps.

pub mod aggregate;
pub mod boundary;
pub mod config;
pub mod controller;
pub mod incident;
pub mod presentation;
pub mod render;
pub mod render_key;
pub mod server;
pub mod style;
pub mod types;
