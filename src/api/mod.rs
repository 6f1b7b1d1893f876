//! HTTP API Module
//!
//! Provides a REST API for client writes, shard status and recovery retries.

mod http;

pub use http::{AppState, HttpServer};
