//! HTTP API Module
//!
//! Provides a REST API for cluster status and management.

mod http;

pub use http::{ApiError, HttpServer};
