//! Annotation-to-training pipeline for large microscopy images.
//!
//! Data flows leaves-first: [`image_source`] serves pixels, [`annotations`]
//! holds the user's regions, [`dataset`] turns a frozen snapshot into seeded
//! samples, [`training`] runs background jobs over them and [`metrics`] keeps
//! the resulting event history. [`session::Session`] ties them together for
//! the presentation layer.

/// Annotation store, geometry, documents and area reports.
pub mod annotations;
/// Application directory resolution.
pub mod app_dirs;
mod atomic_file;
/// Pipeline settings file.
pub mod config;
/// Deterministic dataset construction.
pub mod dataset;
/// Image source adapters.
pub mod image_source;
/// Logging setup.
pub mod logging;
/// Metric history and subscriptions.
pub mod metrics;
/// Facade used by the interactive surface.
pub mod session;
/// Training jobs and models.
pub mod training;

pub use session::{Session, SessionError};
