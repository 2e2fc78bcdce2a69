//! Gantry Foundation - the inference control plane.
//!
//! Everything between the ingress and the engines lives here: the
//! engine adapters, the VRAM-aware orchestrator with its LRU registry
//! and crash tracker, the bounded admission queue with its visibility
//! monitor, the router/preference layer, the worker pool that drives a
//! request end to end, the streaming multiplexer, and the persistence
//! traits with their in-memory backends.

pub mod accountant;
pub mod context;
pub mod engine;
pub mod mux;
pub mod persistence;
pub mod preferences;
pub mod queue;
pub mod router;
pub mod visibility;
pub mod vram;
pub mod worker;

pub use accountant::{BudgetDecision, TokenAccountant};
pub use context::ContextBuilder;
pub use engine::{EngineAdapter, EngineSet, GenerateParams, GenerationDelta, TokenStream};
pub use mux::StreamMux;
pub use preferences::PreferenceResolver;
pub use queue::AdmissionQueue;
pub use router::Router;
pub use visibility::VisibilityMonitor;
pub use vram::orchestrator::VramOrchestrator;
pub use worker::WorkerPool;
