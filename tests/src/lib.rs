//! Testing utilities for the Gantry workspace.
//!
//! [`backend`] provides a scripted engine adapter and a pre-wired
//! control-plane harness so scenario tests can exercise queue, router,
//! orchestrator, workers and multiplexer together without a live
//! engine.

pub mod backend;

pub use backend::{Harness, ScriptedEngine};
