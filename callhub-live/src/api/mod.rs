//! HTTP API handlers for callhub-live

pub mod health;
pub mod payload;
pub mod sessions;
pub mod webhooks;

pub use health::health_routes;
pub use sessions::session_routes;
pub use webhooks::webhook_routes;
