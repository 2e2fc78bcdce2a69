//! Request handlers.

pub mod chat_ws;
pub mod health;
pub mod internal;
pub mod metrics;
