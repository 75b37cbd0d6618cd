//! HTTP surface of the routing proxy.
//!
//! This module contains the `/v1/messages` pipeline, upstream request
//! construction, the SSE relay and the operator endpoints.

pub mod disconnect;
pub mod health;
pub mod proxy;
pub mod quota_routes;
pub mod routes;
pub mod state;
pub mod streaming;
pub mod upstream;

// Re-export commonly used types
pub use health::{healthz, metrics_handler, readyz};
pub use proxy::{messages, REQUEST_ID_HEADER};
pub use routes::build_router;
pub use state::{AppState, AppStateBuilder};
pub use streaming::{relay_sse, RelayOptions, StreamEnd, StreamSummary};
pub use upstream::{LaneTable, UpstreamClients};
