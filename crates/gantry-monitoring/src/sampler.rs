//! Background samplers feeding the metrics store.
//!
//! Every tick (5 s by default) the sampler records host memory and PSI
//! from the probe, queue depth, and the orchestrator's registry totals.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use gantry_foundation::queue::AdmissionQueue;
use gantry_foundation::vram::orchestrator::VramOrchestrator;
use gantry_foundation::vram::probe::MemoryProbe;

use crate::store::MetricsStore;

pub struct MetricsSampler {
    store: Arc<MetricsStore>,
    probe: Arc<dyn MemoryProbe>,
    queue: Arc<AdmissionQueue>,
    orchestrator: Arc<VramOrchestrator>,
    period: Duration,
}

impl MetricsSampler {
    pub fn new(
        store: Arc<MetricsStore>,
        probe: Arc<dyn MemoryProbe>,
        queue: Arc<AdmissionQueue>,
        orchestrator: Arc<VramOrchestrator>,
        period: Duration,
    ) -> Self {
        Self {
            store,
            probe,
            queue,
            orchestrator,
            period,
        }
    }

    /// Record one round of samples.
    pub fn sample_once(&self) {
        let memory = self.probe.snapshot();
        self.store.record("memory.total_gb", memory.total_gb);
        self.store.record("memory.used_gb", memory.used_gb);
        self.store.record("memory.available_gb", memory.available_gb);
        self.store.record("memory.usage_pct", memory.usage_pct);
        self.store.record("psi.cpu", memory.psi.cpu);
        self.store.record("psi.memory", memory.psi.memory);
        self.store.record("psi.io", memory.psi.io);

        self.store.record("queue.depth", self.queue.size() as f64);
        self.store.record(
            "queue.in_flight",
            self.queue.in_flight_snapshot().len() as f64,
        );

        let status = self.orchestrator.status();
        self.store
            .record("models.loaded", status.loaded_models.len() as f64);
        self.store
            .record("models.declared_gb", status.total_declared_gb);
        self.store
            .record("service.healthy", if status.healthy { 1.0 } else { 0.0 });

        debug!(
            queue_depth = self.queue.size(),
            loaded_models = status.loaded_models.len(),
            "metrics sampled"
        );
    }

    /// Spawn the periodic sampling loop.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => self.sample_once(),
                }
            }
        })
    }
}
