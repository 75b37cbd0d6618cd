//! Core functionality for the routing proxy.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Metrics collection
//! - Request-scoped tracing spans
//! - JSONL writers and partial stream capture

pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod partial;
pub mod stream_metrics;
pub mod usage_log;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::{ProxyConfig, ServerConfig, TimeoutConfig};
pub use error::{AppError, Result};
pub use logging::{generate_request_id, record_lane, request_span};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use stream_metrics::{record_request_metrics, RequestStats};
pub use usage_log::JsonlWriter;
