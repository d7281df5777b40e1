//! HTTP request handlers.

pub mod health;

pub use health::{health_check, health_router, readiness};
