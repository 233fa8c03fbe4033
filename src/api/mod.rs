//! HTTP API handlers for clinannot

pub mod diagnostics;
pub mod gallery;
pub mod health;

pub use diagnostics::diagnostic_routes;
pub use gallery::gallery_routes;
pub use health::health_routes;
