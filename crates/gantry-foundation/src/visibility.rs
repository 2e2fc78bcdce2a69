//! Visibility monitor: requeues or fails requests stuck in flight.
//!
//! Workers that die mid-request, or requests whose worker thread is
//! stuck in a remote call, must not occupy an in-flight slot forever.
//! Each tick the monitor snapshots the in-flight map, compares every
//! entry's age against its route's visibility timeout, and either
//! requeues it (head insertion bounds the perceived delay) or fails it
//! terminally with a synthetic crash signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_kernel::config::Settings;

use crate::queue::AdmissionQueue;
use crate::vram::crash::CrashTracker;

pub struct VisibilityMonitor {
    queue: Arc<AdmissionQueue>,
    settings: Arc<Settings>,
    tracker: Arc<CrashTracker>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl VisibilityMonitor {
    pub fn new(
        queue: Arc<AdmissionQueue>,
        settings: Arc<Settings>,
        tracker: Arc<CrashTracker>,
    ) -> Self {
        Self {
            queue,
            settings,
            tracker,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Spawn the background tick loop.
    pub fn start(&mut self) {
        if self.task.is_some() {
            warn!("visibility monitor already running");
            return;
        }

        let queue = Arc::clone(&self.queue);
        let settings = Arc::clone(&self.settings);
        let tracker = Arc::clone(&self.tracker);
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(settings.visibility_check_interval_secs.max(1));

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("visibility monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        check_stuck_requests(&queue, &settings, &tracker);
                    }
                }
            }
        }));
        info!(
            period_secs = period.as_secs(),
            "visibility monitor started"
        );
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// One monitor tick over the in-flight snapshot.
pub fn check_stuck_requests(
    queue: &AdmissionQueue,
    settings: &Settings,
    tracker: &CrashTracker,
) {
    for (id, request) in queue.in_flight_snapshot() {
        let Some(started_at) = request.started_at else {
            continue;
        };
        let timeout = settings.visibility_timeout_for(request.classification);
        let age = started_at.elapsed();
        if age < timeout {
            continue;
        }

        if queue.requeue_for_retry(&id) {
            warn!(
                request_id = %id,
                age_secs = age.as_secs(),
                timeout_secs = timeout.as_secs(),
                retry = request.retry_count + 1,
                "stuck request requeued"
            );
        } else {
            warn!(
                request_id = %id,
                age_secs = age.as_secs(),
                "stuck request exhausted retries; failing"
            );
            queue.mark_failed(&id, "visibility-timeout");
            // Synthetic crash signal against whatever model the request
            // was explicitly pinned to; routed models are covered by the
            // worker's own crash path.
            if let Some(model) = &request.model {
                tracker.record(model, "visibility_timeout");
            }
        }
    }
}
