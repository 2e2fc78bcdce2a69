//! Gantry Gateway - the HTTP/WebSocket surface of the control plane.
//!
//! Hosts the chat WebSocket ingress, the `/internal/*` operator API
//! protected by a shared secret header, and the wiring that assembles
//! queue, orchestrator, workers and monitors into a running service.

pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::build_router;
pub use state::AppState;
