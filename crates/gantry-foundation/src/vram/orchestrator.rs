//! The VRAM orchestrator: admits model loads, evicts under pressure,
//! and reconciles its registry against engine truth.
//!
//! One `tokio::sync::Mutex` serialises every residency change, held
//! across the whole headroom-check → evict → load critical section so
//! two concurrent callers cannot both observe sufficient headroom.
//! `reconcile` takes the same mutex and therefore never pre-empts a
//! load in progress.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gantry_kernel::error::{GantryError, GantryResult};
use gantry_kernel::model::ModelPriority;
use gantry_kernel::profile::Profile;

use crate::engine::{EngineSet, GenerateParams};

use super::crash::{CrashHistory, CrashTracker};
use super::probe::{MemoryProbe, MemorySnapshot};
use super::registry::{ModelRegistry, RegistrySnapshotEntry};

/// Snapshot returned by [`VramOrchestrator::status`].
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub memory: MemorySnapshot,
    pub loaded_models: Vec<RegistrySnapshotEntry>,
    pub total_declared_gb: f64,
    pub soft_limit_gb: f64,
    pub hard_limit_gb: f64,
    pub models_with_crashes: Vec<String>,
    pub healthy: bool,
}

/// Result of an emergency eviction request.
#[derive(Debug, Clone, Serialize)]
pub struct EvictionOutcome {
    pub evicted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct VramOrchestrator {
    profile: Arc<Profile>,
    engines: EngineSet,
    probe: Arc<dyn MemoryProbe>,
    registry: ModelRegistry,
    tracker: Arc<CrashTracker>,
    /// Serialises steps 4–8 of the load protocol and reconciliation.
    admission: Mutex<()>,
}

impl VramOrchestrator {
    pub fn new(
        profile: Arc<Profile>,
        engines: EngineSet,
        probe: Arc<dyn MemoryProbe>,
        tracker: Arc<CrashTracker>,
    ) -> Self {
        Self {
            profile,
            engines,
            probe,
            registry: ModelRegistry::new(),
            tracker,
            admission: Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &Arc<CrashTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Ensure `model` is resident, evicting strictly-lower-priority
    /// models if the soft limit requires it.
    pub async fn request_load(&self, model: &str, params: &GenerateParams) -> GantryResult<()> {
        let descriptor = self
            .profile
            .descriptor(model)
            .ok_or_else(|| GantryError::UnknownModel(model.to_string()))?
            .clone();

        let engine = self
            .engines
            .get(descriptor.engine)
            .ok_or_else(|| GantryError::EngineUnavailable(descriptor.engine.to_string()))?;

        // Engines without dynamic load: record intent, track residency.
        if !descriptor.engine.dynamically_loadable() {
            engine.load(model, params).await?;
            if !self.registry.contains(model) {
                let _ = self.registry.add(descriptor);
            }
            debug!(model = %model, "static engine model; recorded intent only");
            return Ok(());
        }

        let history = self.tracker.history(model);
        if history.recommend_evict {
            return Err(GantryError::CircuitOpen {
                model: model.to_string(),
                crash_count: history.crash_count,
            });
        }

        let _guard = self.admission.lock().await;

        if self.registry.contains(model) {
            self.registry.touch(model)?;
            return Ok(());
        }

        let required_headroom = descriptor.vram_gb + self.profile.safety_margin_gb;
        let mut failed_candidates: HashSet<String> = HashSet::new();

        loop {
            let in_use = self
                .registry
                .total_declared_gb()
                .max(self.probe.snapshot().used_gb);
            let free_for_models = (self.profile.soft_limit_gb - in_use).max(0.0);
            if free_for_models >= required_headroom {
                break;
            }

            let candidate = self.eviction_candidate(descriptor.priority, &failed_candidates);
            match candidate {
                Some(victim) => {
                    info!(
                        model = %model,
                        victim = %victim,
                        free_gb = free_for_models,
                        needed_gb = required_headroom,
                        "evicting for headroom"
                    );
                    if let Err(e) = self.unload_via_engine(&victim).await {
                        warn!(victim = %victim, error = %e, "eviction unload failed");
                        self.tracker.record(&victim, "unload_failure");
                        failed_candidates.insert(victim);
                        continue;
                    }
                    self.registry.remove(&victim)?;
                }
                None => {
                    let projected = in_use + descriptor.vram_gb;
                    if projected > self.profile.hard_limit_gb {
                        return Err(GantryError::InsufficientVram {
                            needed_gb: required_headroom,
                            available_gb: free_for_models,
                        });
                    }
                    // Soft limit briefly exceeded; hard limit holds.
                    debug!(
                        model = %model,
                        projected_gb = projected,
                        "no eviction candidate; accepting over soft limit"
                    );
                    break;
                }
            }
        }

        if descriptor.vram_gb >= self.profile.large_model_threshold_gb {
            if let Err(e) = engine.cleanup().await {
                warn!(error = %e, "pre-load cleanup hint failed");
            }
        }

        if let Err(e) = engine.load(model, params).await {
            if e.is_crash() {
                self.tracker.record(model, &e.reason());
            }
            return Err(GantryError::Engine(e));
        }

        self.registry.add(descriptor)?;
        info!(model = %model, "model loaded");
        Ok(())
    }

    /// Mark a model as just used; called immediately before generation.
    pub fn mark_accessed(&self, model: &str) {
        if let Err(e) = self.registry.touch(model) {
            debug!(model = %model, error = %e, "mark_accessed on unregistered model");
        }
    }

    /// Remove a model from the registry; record a crash when asked.
    pub async fn mark_unloaded(
        &self,
        model: &str,
        crashed: bool,
        reason: Option<&str>,
    ) -> GantryResult<()> {
        let _guard = self.admission.lock().await;
        match self.registry.remove(model) {
            Ok(_) => info!(model = %model, crashed = crashed, "model unloaded"),
            Err(_) => debug!(model = %model, "mark_unloaded on unregistered model"),
        }
        if crashed {
            self.tracker.record(model, reason.unwrap_or("unknown"));
        }
        Ok(())
    }

    /// Evict the LRU model strictly below `priority`.
    pub async fn emergency_evict(&self, priority: ModelPriority) -> EvictionOutcome {
        let _guard = self.admission.lock().await;

        let Some(floor) = priority.lower() else {
            return EvictionOutcome {
                evicted: false,
                model_id: None,
                size_gb: None,
                reason: Some("no priority below LOW".into()),
            };
        };

        let candidate = self.eviction_candidate_at_or_below(floor, &HashSet::new());
        let Some(victim) = candidate else {
            return EvictionOutcome {
                evicted: false,
                model_id: None,
                size_gb: None,
                reason: Some(format!("no loaded model below priority {priority}")),
            };
        };

        match self.unload_via_engine(&victim).await {
            Ok(()) => {
                let entry = self.registry.remove(&victim).ok();
                warn!(model = %victim, "emergency eviction complete");
                EvictionOutcome {
                    evicted: true,
                    size_gb: entry.map(|e| e.descriptor.vram_gb),
                    model_id: Some(victim),
                    reason: None,
                }
            }
            Err(e) => {
                self.tracker.record(&victim, "unload_failure");
                EvictionOutcome {
                    evicted: false,
                    model_id: Some(victim),
                    size_gb: None,
                    reason: Some(e.to_string()),
                }
            }
        }
    }

    /// Probe + registry + crash summary.
    pub fn status(&self) -> OrchestratorStatus {
        let memory = self.probe.snapshot();
        let total_declared_gb = self.registry.total_declared_gb();
        let healthy = total_declared_gb.max(memory.used_gb) <= self.profile.hard_limit_gb;
        OrchestratorStatus {
            memory,
            loaded_models: self.registry.snapshot(),
            total_declared_gb,
            soft_limit_gb: self.profile.soft_limit_gb,
            hard_limit_gb: self.profile.hard_limit_gb,
            models_with_crashes: self.tracker.models_with_crashes(),
            healthy,
        }
    }

    pub fn crash_history(&self, model: &str) -> CrashHistory {
        self.tracker.history(model)
    }

    /// Reconcile the registry against each engine's `list_loaded` truth.
    ///
    /// Engine-reported models missing from the registry are adopted as
    /// external loads; registry entries an engine no longer knows are
    /// dropped with a warning.
    pub async fn reconcile(&self) {
        let _guard = self.admission.lock().await;

        for (kind, engine) in self.engines.iter() {
            let engine_truth = match engine.list_loaded().await {
                Ok(set) => set,
                Err(e) => {
                    debug!(engine = %kind, error = %e, "list-loaded failed; skipping reconcile");
                    continue;
                }
            };

            // Adopt externally-loaded models we know descriptors for.
            for name in &engine_truth {
                if self.registry.contains(name) {
                    continue;
                }
                match self.profile.descriptor(name) {
                    Some(descriptor) if descriptor.engine == kind => {
                        info!(model = %name, engine = %kind, "adopting externally loaded model");
                        let _ = self.registry.add_external(descriptor.clone());
                    }
                    _ => {
                        debug!(model = %name, engine = %kind, "engine reports unknown model; ignoring");
                    }
                }
            }

            // Drop registry entries the engine has lost.
            for entry in self.registry.snapshot() {
                let Some(descriptor) = self.profile.descriptor(&entry.model_id) else {
                    continue;
                };
                if descriptor.engine == kind && !engine_truth.contains(&entry.model_id) {
                    warn!(
                        model = %entry.model_id,
                        engine = %kind,
                        "registry drift: engine no longer has model; removing"
                    );
                    let _ = self.registry.remove(&entry.model_id);
                }
            }
        }
    }

    /// First LRU entry with priority strictly below `requested`.
    fn eviction_candidate(
        &self,
        requested: ModelPriority,
        excluded: &HashSet<String>,
    ) -> Option<String> {
        requested
            .lower()
            .and_then(|ceiling| self.eviction_candidate_at_or_below(ceiling, excluded))
    }

    fn eviction_candidate_at_or_below(
        &self,
        ceiling: ModelPriority,
        excluded: &HashSet<String>,
    ) -> Option<String> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|e| !excluded.contains(&e.model_id))
            // Static-engine models cannot actually release VRAM.
            .filter(|e| {
                self.profile
                    .descriptor(&e.model_id)
                    .map(|d| d.engine.dynamically_loadable())
                    .unwrap_or(true)
            })
            .find(|e| e.priority <= ceiling)
            .map(|e| e.model_id)
    }

    async fn unload_via_engine(&self, model: &str) -> GantryResult<()> {
        let descriptor = self
            .profile
            .descriptor(model)
            .ok_or_else(|| GantryError::UnknownModel(model.to_string()))?;
        let engine = self
            .engines
            .get(descriptor.engine)
            .ok_or_else(|| GantryError::EngineUnavailable(descriptor.engine.to_string()))?;
        engine.unload(model).await?;
        if descriptor.vram_gb >= self.profile.large_model_threshold_gb {
            let _ = engine.cleanup().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;
    use crate::vram::probe::FixedProbe;
    use gantry_kernel::model::{EngineKind, ModelCapabilities, ModelDescriptor};
    use gantry_kernel::route::RouteKind;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_profile(models: Vec<ModelDescriptor>, soft: f64, hard: f64) -> Arc<Profile> {
        Arc::new(Profile {
            name: "test".into(),
            models,
            soft_limit_gb: soft,
            hard_limit_gb: hard,
            safety_margin_gb: 0.0,
            large_model_threshold_gb: 40.0,
            router_model: String::new(),
            summarization_model: String::new(),
            route_bindings: HashMap::new(),
            route_temperatures: HashMap::new(),
            thinking_routes: vec![RouteKind::Reasoning],
        })
    }

    fn descriptor(name: &str, vram: f64, priority: ModelPriority) -> ModelDescriptor {
        ModelDescriptor::native(name, "http://localhost:11434", vram).with_priority(priority)
    }

    fn build(
        models: Vec<ModelDescriptor>,
        soft: f64,
        hard: f64,
        used_gb: f64,
    ) -> (Arc<VramOrchestrator>, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new(EngineKind::Native));
        let engines = EngineSet::new().register(Arc::clone(&engine) as _);
        let orchestrator = Arc::new(VramOrchestrator::new(
            test_profile(models, soft, hard),
            engines,
            Arc::new(FixedProbe::new(128.0, used_gb)),
            Arc::new(CrashTracker::new(2, Duration::from_secs(300))),
        ));
        (orchestrator, engine)
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let (orch, _) = build(vec![], 50.0, 60.0, 0.0);
        let err = orch
            .request_load("ghost", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::UnknownModel(_)));
    }

    #[tokio::test]
    async fn load_registers_model() {
        let (orch, engine) = build(
            vec![descriptor("a", 10.0, ModelPriority::Normal)],
            50.0,
            60.0,
            0.0,
        );
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
        assert!(orch.registry().contains("a"));
        assert_eq!(engine.load_calls.lock().as_slice(), ["a"]);
    }

    #[tokio::test]
    async fn reload_of_resident_model_touches_only() {
        let (orch, engine) = build(
            vec![descriptor("a", 10.0, ModelPriority::Normal)],
            50.0,
            60.0,
            0.0,
        );
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(engine.load_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn evicts_strictly_lower_priority_lru() {
        // Soft 50: A(30, NORMAL) + B(15, NORMAL) + C(10, HIGH) loaded.
        // D(20, NORMAL) may only evict LOW models; there are none, and
        // projected use 75 > hard 60, so the load is refused.
        let (orch, _) = build(
            vec![
                descriptor("a", 30.0, ModelPriority::Normal),
                descriptor("b", 15.0, ModelPriority::Normal),
                descriptor("c", 10.0, ModelPriority::High),
                descriptor("d", 20.0, ModelPriority::Normal),
            ],
            50.0,
            60.0,
            0.0,
        );
        for m in ["a", "b", "c"] {
            orch.request_load(m, &GenerateParams::default()).await.unwrap();
        }
        orch.mark_accessed("a");

        let err = orch
            .request_load("d", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::InsufficientVram { .. }));
        assert!(orch.registry().contains("b"));
    }

    #[tokio::test]
    async fn evicts_low_priority_for_normal_load() {
        let (orch, engine) = build(
            vec![
                descriptor("small-low", 30.0, ModelPriority::Low),
                descriptor("incoming", 25.0, ModelPriority::Normal),
            ],
            50.0,
            60.0,
            0.0,
        );
        orch.request_load("small-low", &GenerateParams::default())
            .await
            .unwrap();

        orch.request_load("incoming", &GenerateParams::default())
            .await
            .unwrap();

        assert!(!orch.registry().contains("small-low"));
        assert!(orch.registry().contains("incoming"));
        assert_eq!(engine.unload_calls.lock().as_slice(), ["small-low"]);
    }

    #[tokio::test]
    async fn circuit_open_blocks_load() {
        let (orch, _) = build(
            vec![descriptor("a", 10.0, ModelPriority::Normal)],
            50.0,
            60.0,
            0.0,
        );
        orch.tracker().record("a", "engine_timeout");
        orch.tracker().record("a", "engine_timeout");

        let err = orch
            .request_load("a", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::CircuitOpen { crash_count: 2, .. }));

        // Clearing history lets the next load proceed.
        orch.tracker().clear("a");
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mark_unloaded_with_crash_records_history() {
        let (orch, _) = build(
            vec![descriptor("a", 10.0, ModelPriority::Normal)],
            50.0,
            60.0,
            0.0,
        );
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
        orch.mark_unloaded("a", true, Some("engine_timeout"))
            .await
            .unwrap();
        assert!(!orch.registry().contains("a"));
        assert_eq!(orch.crash_history("a").crash_count, 1);
    }

    #[tokio::test]
    async fn load_unload_roundtrip_leaves_clean_state() {
        let (orch, _) = build(
            vec![descriptor("a", 10.0, ModelPriority::Normal)],
            50.0,
            60.0,
            0.0,
        );
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
        orch.mark_unloaded("a", false, None).await.unwrap();
        assert!(orch.registry().is_empty());
        assert_eq!(orch.crash_history("a").crash_count, 0);
        // Mutex is free: another load succeeds immediately.
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn emergency_evict_respects_priority_floor() {
        let (orch, _) = build(
            vec![
                descriptor("low", 5.0, ModelPriority::Low),
                descriptor("high", 10.0, ModelPriority::High),
            ],
            50.0,
            60.0,
            0.0,
        );
        orch.request_load("low", &GenerateParams::default())
            .await
            .unwrap();
        orch.request_load("high", &GenerateParams::default())
            .await
            .unwrap();

        let outcome = orch.emergency_evict(ModelPriority::Normal).await;
        assert!(outcome.evicted);
        assert_eq!(outcome.model_id.as_deref(), Some("low"));

        let outcome = orch.emergency_evict(ModelPriority::Normal).await;
        assert!(!outcome.evicted);

        let outcome = orch.emergency_evict(ModelPriority::Low).await;
        assert!(!outcome.evicted);
        assert!(outcome.reason.unwrap().contains("below LOW"));
    }

    #[tokio::test]
    async fn reconcile_adopts_and_drops() {
        let (orch, engine) = build(
            vec![
                descriptor("known", 10.0, ModelPriority::Normal),
                descriptor("external", 5.0, ModelPriority::Normal),
            ],
            50.0,
            60.0,
            0.0,
        );
        orch.request_load("known", &GenerateParams::default())
            .await
            .unwrap();

        // Engine truth: "known" vanished, "external" appeared.
        engine.loaded.lock().remove("known");
        engine.loaded.lock().insert("external".into());

        orch.reconcile().await;

        assert!(!orch.registry().contains("known"));
        assert!(orch.registry().contains("external"));
        let snap = orch.registry().snapshot();
        assert!(snap.iter().any(|e| e.model_id == "external" && e.is_external));
    }

    #[tokio::test]
    async fn failed_eviction_tries_next_candidate() {
        let (orch, engine) = build(
            vec![
                descriptor("low-a", 20.0, ModelPriority::Low),
                descriptor("low-b", 20.0, ModelPriority::Low),
                descriptor("incoming", 30.0, ModelPriority::Normal),
            ],
            50.0,
            100.0,
            0.0,
        );
        orch.request_load("low-a", &GenerateParams::default())
            .await
            .unwrap();
        orch.request_load("low-b", &GenerateParams::default())
            .await
            .unwrap();

        // Every unload fails: the loop must move past each failed
        // candidate (recording the failures) rather than spin, and with
        // no candidates left the load is still admitted because the
        // projected use stays under the hard limit.
        *engine.fail_unload.lock() = true;
        orch.request_load("incoming", &GenerateParams::default())
            .await
            .unwrap();

        assert!(orch.registry().contains("incoming"));
        assert!(orch.registry().contains("low-a"));
        assert!(orch.registry().contains("low-b"));
        assert_eq!(orch.crash_history("low-a").crash_count, 1);
        assert_eq!(orch.crash_history("low-b").crash_count, 1);
    }

    #[tokio::test]
    async fn status_reports_health() {
        let (orch, _) = build(
            vec![descriptor("a", 10.0, ModelPriority::Normal)],
            50.0,
            60.0,
            20.0,
        );
        orch.request_load("a", &GenerateParams::default())
            .await
            .unwrap();
        let status = orch.status();
        assert!(status.healthy);
        assert_eq!(status.loaded_models.len(), 1);
        assert!((status.total_declared_gb - 10.0).abs() < 1e-9);
    }
}
