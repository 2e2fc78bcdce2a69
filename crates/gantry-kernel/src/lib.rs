//! Gantry Kernel - shared types for the inference control plane.
//!
//! This crate holds everything the other workspace members agree on:
//! the request/model/route data model, the wire frames spoken over the
//! chat WebSocket, the error taxonomy, runtime settings and the
//! immutable configuration profiles selected at startup.
//!
//! It deliberately contains no I/O: engines, stores and the HTTP
//! surface live in `gantry-foundation` and `gantry-gateway`.

pub mod config;
pub mod error;
pub mod frames;
pub mod message;
pub mod model;
pub mod profile;
pub mod request;
pub mod route;
pub mod user;

pub use config::Settings;
pub use error::{GantryError, GantryResult};
pub use frames::{ClientFrame, ServerFrame};
pub use message::{ConversationMessage, MessageRole};
pub use model::{EngineKind, ModelCapabilities, ModelDescriptor, ModelPriority, ThinkingFormat};
pub use profile::Profile;
pub use request::{ChatRequest, OriginTier};
pub use route::{RouteDecision, RouteKind};
pub use user::UserState;
