//! Registry of models believed resident, ordered least-recently-used
//! first.
//!
//! The registry is the orchestrator's private view; every mutation
//! happens through orchestrator methods. A single mutex guards the
//! ordered list; critical sections are short (list surgery only, no
//! I/O under the lock).

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use gantry_kernel::error::{GantryError, GantryResult};
use gantry_kernel::model::{ModelDescriptor, ModelPriority};

/// One resident model.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub descriptor: ModelDescriptor,
    pub loaded_at: Instant,
    pub last_accessed: Instant,
    /// Loaded outside the orchestrator (discovered by reconciliation).
    pub is_external: bool,
}

/// Serializable projection for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshotEntry {
    pub model_id: String,
    pub backend: String,
    pub vram_size_gb: f64,
    pub priority: ModelPriority,
    /// Seconds since last access.
    pub last_accessed_secs: f64,
    pub is_external: bool,
}

/// LRU-ordered set of loaded models. Index 0 is least recently used.
#[derive(Default)]
pub struct ModelRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Insert at the MRU end. Errors if the model is already present.
    pub fn add(&self, descriptor: ModelDescriptor) -> GantryResult<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.descriptor.name == descriptor.name) {
            return Err(GantryError::Internal(format!(
                "model {} already in registry",
                descriptor.name
            )));
        }
        let now = Instant::now();
        entries.push(RegistryEntry {
            descriptor,
            loaded_at: now,
            last_accessed: now,
            is_external: false,
        });
        Ok(())
    }

    /// Insert an entry discovered by reconciliation (externally loaded).
    pub fn add_external(&self, descriptor: ModelDescriptor) -> GantryResult<()> {
        self.add(descriptor)?;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.last_mut() {
            entry.is_external = true;
        }
        Ok(())
    }

    /// Move to the MRU end and refresh the access timestamp.
    pub fn touch(&self, name: &str) -> GantryResult<()> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.descriptor.name == name)
            .ok_or_else(|| GantryError::Internal(format!("model {name} not in registry")))?;
        let mut entry = entries.remove(pos);
        entry.last_accessed = Instant::now();
        entries.push(entry);
        Ok(())
    }

    /// Remove an entry. Errors if absent.
    pub fn remove(&self, name: &str) -> GantryResult<RegistryEntry> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.descriptor.name == name)
            .ok_or_else(|| GantryError::Internal(format!("model {name} not in registry")))?;
        Ok(entries.remove(pos))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.descriptor.name == name)
    }

    /// Least-recently-used entry with priority ≤ `max_priority`.
    ///
    /// The list is LRU-ordered, so the first match is the LRU candidate;
    /// among entries with equal access ordering the older load wins by
    /// position.
    pub fn lru_by_priority(&self, max_priority: ModelPriority) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.descriptor.priority <= max_priority)
            .map(|e| e.descriptor.name.clone())
    }

    /// Sum of declared VRAM footprints.
    pub fn total_declared_gb(&self) -> f64 {
        self.entries
            .lock()
            .iter()
            .map(|e| e.descriptor.vram_gb)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Names of every resident model, LRU first.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    /// Ordered copy for observability endpoints.
    pub fn snapshot(&self) -> Vec<RegistrySnapshotEntry> {
        self.entries
            .lock()
            .iter()
            .map(|e| RegistrySnapshotEntry {
                model_id: e.descriptor.name.clone(),
                backend: e.descriptor.engine.to_string(),
                vram_size_gb: e.descriptor.vram_gb,
                priority: e.descriptor.priority,
                last_accessed_secs: e.last_accessed.elapsed().as_secs_f64(),
                is_external: e.is_external,
            })
            .collect()
    }
}
