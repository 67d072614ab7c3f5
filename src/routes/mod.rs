//! Routes: named fallback chains of provider/model steps.

pub mod executor;

pub use executor::{RouteRequest, execute, step_path};
