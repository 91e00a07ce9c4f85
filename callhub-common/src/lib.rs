//! # callhub Common Library
//!
//! Shared code for the callhub services including:
//! - Observer message types (ObserverMessage enum) and call vocabulary
//! - Configuration loading
//! - Database initialization
//! - SSE helpers
//! - Time utilities

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
