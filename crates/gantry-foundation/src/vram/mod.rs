//! VRAM-aware model residency management.
//!
//! The registry tracks what the orchestrator believes is loaded, the
//! crash tracker watches for crash loops, the probe reports what the
//! host actually has, and the orchestrator combines the three to admit
//! or refuse model loads.

pub mod crash;
pub mod orchestrator;
pub mod probe;
pub mod registry;

pub use crash::{CrashHistory, CrashTracker};
pub use orchestrator::{OrchestratorStatus, VramOrchestrator};
pub use probe::{FixedProbe, MemoryProbe, MemorySnapshot, PsiSnapshot, SysinfoProbe};
pub use registry::{ModelRegistry, RegistryEntry};
