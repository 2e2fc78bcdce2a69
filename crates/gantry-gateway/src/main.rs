//! Gantry gateway binary: wire the control plane together and serve.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gantry_foundation::accountant::TokenAccountant;
use gantry_foundation::context::ContextBuilder;
use gantry_foundation::engine::{EngineSet, NativeEngine, OpenAiCompatEngine, StaticEngine};
use gantry_foundation::mux::StreamMux;
use gantry_foundation::persistence::{MemoryConversationStore, MemoryUserStore};
use gantry_foundation::preferences::PreferenceResolver;
use gantry_foundation::queue::AdmissionQueue;
use gantry_foundation::router::Router;
use gantry_foundation::visibility::VisibilityMonitor;
use gantry_foundation::vram::crash::CrashTracker;
use gantry_foundation::vram::orchestrator::VramOrchestrator;
use gantry_foundation::vram::probe::SysinfoProbe;
use gantry_foundation::worker::{WorkerContext, WorkerPool};
use gantry_gateway::state::AppState;
use gantry_kernel::config::Settings;
use gantry_kernel::frames::ServerFrame;
use gantry_kernel::model::EngineKind;
use gantry_kernel::profile::Profile;
use gantry_monitoring::sampler::MetricsSampler;
use gantry_monitoring::store::MetricsStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "gateway exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Arc::new(Settings::load()?);
    let profile = Arc::new(Profile::by_name(&settings.profile)?);
    profile.validate()?;
    info!(profile = %profile.name, "profile selected");

    if settings.internal_api_key.is_empty() {
        warn!("GANTRY_INTERNAL_API_KEY is not set; /internal endpoints will refuse all requests");
    }

    // Engines: one adapter per kind referenced by the catalogue,
    // registered statically at startup.
    let mut engines = EngineSet::new();
    for kind in [EngineKind::Native, EngineKind::OpenAiCompat, EngineKind::Static] {
        let Some(endpoint) = profile
            .models
            .iter()
            .find(|m| m.engine == kind)
            .map(|m| m.endpoint.clone())
        else {
            continue;
        };
        engines = match kind {
            EngineKind::Native => engines.register(Arc::new(NativeEngine::new(&endpoint)?)),
            EngineKind::OpenAiCompat => {
                engines.register(Arc::new(OpenAiCompatEngine::new(&endpoint, None)?))
            }
            EngineKind::Static => engines.register(Arc::new(StaticEngine::new(&endpoint)?)),
        };
        info!(engine = %kind, endpoint = %endpoint, "engine registered");
    }

    let metrics = Arc::new(MetricsStore::new(settings.metrics_ttl_hours as i64));

    let tracker = Arc::new(CrashTracker::new(
        settings.crash_threshold,
        Duration::from_secs(settings.crash_window_secs),
    ));
    {
        // Threshold crossings show up in the operator's time series.
        let metrics = Arc::clone(&metrics);
        tracker.add_observer(Box::new(move |model, count, reason| {
            tracing::warn!(model = %model, crashes = count, reason = %reason, "circuit opened");
            metrics.record("circuit_breaker.trips", 1.0);
        }));
    }
    let probe = Arc::new(SysinfoProbe::new());
    let orchestrator = Arc::new(VramOrchestrator::new(
        Arc::clone(&profile),
        engines.clone(),
        probe.clone(),
        Arc::clone(&tracker),
    ));

    let queue = Arc::new(AdmissionQueue::new(
        settings.max_queue_size,
        settings.queue_watermark,
        settings.max_retries,
    ));
    let mux = Arc::new(StreamMux::new(Duration::from_secs(
        settings.mux_send_timeout_secs,
    )));

    let conversations = MemoryConversationStore::shared();
    let users = MemoryUserStore::shared(
        settings.default_weekly_budget,
        settings.summarize_threshold_tokens,
    );

    let router = Arc::new(Router::new(
        Arc::clone(&profile),
        engines.clone(),
        Arc::clone(&settings),
    ));
    let resolver = Arc::new(PreferenceResolver::new(&settings));
    let context_builder = Arc::new(ContextBuilder::new(
        Arc::clone(&conversations) as _,
        Arc::clone(&profile),
        engines.clone(),
        Arc::clone(&settings),
    ));
    let accountant = Arc::new(TokenAccountant::new(Arc::clone(&users) as _, true));

    let shutdown = CancellationToken::new();

    // Worker pool.
    let pool = WorkerPool::new(WorkerContext {
        queue: Arc::clone(&queue),
        mux: Arc::clone(&mux),
        router: Arc::clone(&router),
        resolver: Arc::clone(&resolver),
        orchestrator: Arc::clone(&orchestrator),
        engines: engines.clone(),
        context_builder: Arc::clone(&context_builder),
        accountant: Arc::clone(&accountant),
        conversations: Arc::clone(&conversations) as _,
        users: Arc::clone(&users) as _,
        profile: Arc::clone(&profile),
        settings: Arc::clone(&settings),
    });
    let worker_handles = pool.spawn(settings.worker_count, shutdown.clone());

    // Visibility monitor.
    let mut monitor = VisibilityMonitor::new(
        Arc::clone(&queue),
        Arc::clone(&settings),
        Arc::clone(&tracker),
    );
    monitor.start();

    // Terminal failures raised outside workers (visibility timeouts)
    // still owe the client an error frame.
    {
        let mux = Arc::clone(&mux);
        let mut failures = queue.subscribe_failures();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = failures.recv() => {
                        let Ok(event) = event else { break };
                        if event.reason == "visibility-timeout" {
                            mux.send(
                                &event.client_handle,
                                ServerFrame::Error { error: event.reason.clone() },
                            )
                            .await;
                        }
                    }
                }
            }
        });
    }

    // Periodic reconciliation against engine truth.
    {
        let orchestrator = Arc::clone(&orchestrator);
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(settings.reconcile_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => orchestrator.reconcile().await,
                }
            }
        });
    }

    // Metrics sampling and the weekly budget sweep.
    let sampler = Arc::new(MetricsSampler::new(
        Arc::clone(&metrics),
        probe,
        Arc::clone(&queue),
        Arc::clone(&orchestrator),
        Duration::from_secs(settings.metrics_sample_interval_secs.max(1)),
    ));
    sampler.spawn(shutdown.clone());
    Arc::clone(&accountant).spawn_sweeper(shutdown.clone());

    let state = AppState {
        settings: Arc::clone(&settings),
        profile,
        queue: Arc::clone(&queue),
        mux: Arc::clone(&mux),
        orchestrator,
        engines,
        router,
        resolver,
        context_builder,
        accountant,
        conversations: conversations as _,
        users: users as _,
        metrics,
    };

    // Serve until SIGINT/SIGTERM.
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(gantry_gateway::server::serve(state, server_shutdown));

    wait_for_signal().await;
    info!("shutdown signal received; draining");

    // Stop intake first so workers can finish their current request
    // within the grace period.
    queue.shutdown();
    shutdown.cancel();

    let grace = Duration::from_secs(settings.shutdown_grace_secs);
    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "workers did not drain in time");
    }

    monitor.stop().await;
    mux.close_all();
    let _ = server.await;
    info!("gateway stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
