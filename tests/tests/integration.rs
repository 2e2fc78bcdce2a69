//! Cross-crate scenario tests for the inference control plane.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gantry_foundation::engine::GenerateParams;
use gantry_foundation::persistence::{ConversationStore, UserStore};
use gantry_foundation::queue::{AdmissionQueue, QueuePosition};
use gantry_foundation::visibility::check_stuck_requests;
use gantry_foundation::vram::crash::CrashTracker;
use gantry_foundation::vram::orchestrator::VramOrchestrator;
use gantry_foundation::vram::probe::FixedProbe;
use gantry_foundation::worker::process_request;
use gantry_kernel::config::Settings;
use gantry_kernel::error::GantryError;
use gantry_kernel::frames::ServerFrame;
use gantry_kernel::model::{ModelDescriptor, ModelPriority};
use gantry_kernel::profile::Profile;
use gantry_kernel::request::{ChatRequest, estimate_tokens};
use gantry_kernel::route::RouteKind;
use gantry_testing::{Harness, ScriptedEngine};

fn request(id: &str, handle: &str) -> ChatRequest {
    let mut r = ChatRequest::new(handle, format!("conv-{handle}"), "user-1", "run the numbers");
    r.id = id.to_string();
    r.estimated_tokens = estimate_tokens(&r.content);
    r
}

fn frame_kinds(frames: &[ServerFrame]) -> Vec<&'static str> {
    frames
        .iter()
        .map(|f| match f {
            ServerFrame::Queued { .. } => "queued",
            ServerFrame::Processing { .. } => "processing",
            ServerFrame::Token { .. } => "token",
            ServerFrame::ToolStart { .. } => "tool_start",
            ServerFrame::ToolEnd { .. } => "tool_end",
            ServerFrame::Done { .. } => "done",
            ServerFrame::Error { .. } => "error",
            ServerFrame::History { .. } => "history",
            ServerFrame::CloseComplete { .. } => "close_complete",
            ServerFrame::Notice { .. } => "notice",
            ServerFrame::Pong => "pong",
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: queue capacity
// ---------------------------------------------------------------------------

#[test]
fn queue_capacity_rejects_and_readmits() {
    let queue = AdmissionQueue::new(2, 2, 3);

    assert_eq!(queue.enqueue(request("r1", "h")).unwrap(), 1);
    assert_eq!(queue.enqueue(request("r2", "h")).unwrap(), 2);
    assert!(matches!(
        queue.enqueue(request("r3", "h")).unwrap_err(),
        GantryError::QueueFull { .. }
    ));

    let head = queue.try_dequeue().unwrap();
    assert_eq!(head.id, "r1");
    assert_eq!(queue.position("r1"), QueuePosition::InFlight);

    // Slot freed: r3 is admitted at position 2.
    assert_eq!(queue.enqueue(request("r3", "h")).unwrap(), 2);
    assert_eq!(queue.position("r3"), QueuePosition::Queued(2));
}

// ---------------------------------------------------------------------------
// Scenario 2: FIFO with retry head-insertion
// ---------------------------------------------------------------------------

#[test]
fn retried_request_jumps_the_queue() {
    let queue = AdmissionQueue::new(10, 10, 3);
    queue.enqueue(request("r1", "h")).unwrap();
    queue.enqueue(request("r2", "h")).unwrap();

    assert_eq!(queue.try_dequeue().unwrap().id, "r1");
    assert!(queue.requeue_for_retry("r1"));

    // r1 again, not r2.
    let next = queue.try_dequeue().unwrap();
    assert_eq!(next.id, "r1");
    assert_eq!(next.retry_count, 1);
    assert_eq!(queue.try_dequeue().unwrap().id, "r2");
}

// ---------------------------------------------------------------------------
// Scenario 3: LRU eviction under the strictly-lower-priority rule
// ---------------------------------------------------------------------------

fn eviction_profile() -> Arc<Profile> {
    let endpoint = "http://127.0.0.1:11434";
    Arc::new(Profile {
        name: "eviction-test".into(),
        models: vec![
            ModelDescriptor::native("model-a", endpoint, 30.0),
            ModelDescriptor::native("model-b", endpoint, 15.0),
            ModelDescriptor::native("model-c", endpoint, 10.0)
                .with_priority(ModelPriority::High),
            ModelDescriptor::native("model-d", endpoint, 20.0),
            ModelDescriptor::native("model-e", endpoint, 20.0)
                .with_priority(ModelPriority::High),
        ],
        soft_limit_gb: 50.0,
        hard_limit_gb: 60.0,
        safety_margin_gb: 0.0,
        large_model_threshold_gb: 100.0,
        router_model: "model-c".into(),
        summarization_model: "model-c".into(),
        route_bindings: HashMap::new(),
        route_temperatures: HashMap::new(),
        thinking_routes: Vec::new(),
    })
}

#[tokio::test]
async fn same_priority_pressure_is_refused_not_evicted() {
    let engine = ScriptedEngine::new(gantry_kernel::model::EngineKind::Native);
    let orchestrator = VramOrchestrator::new(
        eviction_profile(),
        gantry_foundation::engine::EngineSet::new().register(Arc::clone(&engine) as _),
        Arc::new(FixedProbe::new(128.0, 0.0)),
        Arc::new(CrashTracker::new(2, Duration::from_secs(300))),
    );

    // Seed residency directly: A(30, NORMAL), B(15, NORMAL),
    // C(10, HIGH); then touch A so B becomes the LRU normal model.
    let endpoint = "http://127.0.0.1:11434";
    orchestrator
        .registry()
        .add(ModelDescriptor::native("model-a", endpoint, 30.0))
        .unwrap();
    orchestrator
        .registry()
        .add(ModelDescriptor::native("model-b", endpoint, 15.0))
        .unwrap();
    orchestrator
        .registry()
        .add(ModelDescriptor::native("model-c", endpoint, 10.0).with_priority(ModelPriority::High))
        .unwrap();
    orchestrator.mark_accessed("model-a");

    // D(20, NORMAL) may only evict strictly-lower priority; none exist,
    // and 55 + 20 > hard 60 means insufficient-vram, nothing evicted.
    let err = orchestrator
        .request_load("model-d", &GenerateParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GantryError::InsufficientVram { .. }));
    assert!(orchestrator.registry().contains("model-b"));
    assert_eq!(orchestrator.registry().len(), 3);
    assert!(engine.unload_calls.lock().is_empty());

    // E(20, HIGH) outranks the NORMAL models: normals are evicted in
    // LRU order (B before the freshly-touched A) until E fits; the
    // HIGH-priority C survives.
    orchestrator
        .request_load("model-e", &GenerateParams::default())
        .await
        .unwrap();
    assert_eq!(engine.unload_calls.lock().as_slice(), ["model-b", "model-a"]);
    assert!(orchestrator.registry().contains("model-c"));
    assert!(orchestrator.registry().contains("model-e"));
    assert_eq!(orchestrator.registry().len(), 2);
}

// ---------------------------------------------------------------------------
// Scenario 4: circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_crashes_open_the_circuit_until_cleared() {
    let harness = Harness::new();
    let orchestrator = &harness.ctx.orchestrator;

    harness.tracker.record("rnj-1:8b", "engine_timeout");
    harness.tracker.record("rnj-1:8b", "engine_timeout");

    let err = orchestrator
        .request_load("rnj-1:8b", &GenerateParams::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GantryError::CircuitOpen { crash_count: 2, .. }
    ));

    harness.tracker.clear("rnj-1:8b");
    orchestrator
        .request_load("rnj-1:8b", &GenerateParams::default())
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 5: visibility timeout ladder
// ---------------------------------------------------------------------------

#[test]
fn visibility_ladder_ends_in_terminal_failure() {
    let queue = AdmissionQueue::new(10, 10, 2);
    let tracker = CrashTracker::new(2, Duration::from_secs(300));
    let settings = Settings {
        visibility_timeout_secs: 0, // every in-flight request is stuck
        ..Settings::default()
    };
    let mut failures = queue.subscribe_failures();

    let mut r = request("r1", "h1");
    r.model = Some("pinned:70b".into());
    queue.enqueue(r).unwrap();

    // Tick 1: retry 1, back at head.
    queue.try_dequeue().unwrap();
    check_stuck_requests(&queue, &settings, &tracker);
    let retried = queue.try_dequeue().unwrap();
    assert_eq!(retried.retry_count, 1);

    // Tick 2: retry 2.
    check_stuck_requests(&queue, &settings, &tracker);
    let retried = queue.try_dequeue().unwrap();
    assert_eq!(retried.retry_count, 2);

    // Tick 3: cap reached: terminal failure + one breaker signal.
    check_stuck_requests(&queue, &settings, &tracker);
    assert!(queue.in_flight_snapshot().is_empty());
    assert_eq!(queue.size(), 0);

    let event = failures.try_recv().unwrap();
    assert_eq!(event.request_id, "r1");
    assert_eq!(event.reason, "visibility-timeout");
    assert!(failures.try_recv().is_err());
    assert_eq!(tracker.history("pinned:70b").crash_count, 1);
}

// ---------------------------------------------------------------------------
// Scenario 6: streaming ordering across concurrent clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn frames_stay_ordered_and_never_cross_connections() {
    let harness = Harness::new();
    // Slow the stream slightly so the two generations interleave.
    *harness.engine.delay.lock() = Duration::from_millis(2);
    *harness.engine.fallback.lock() = "one two three four five".into();

    let mut rx1 = harness.ctx.mux.register("h1");
    let mut rx2 = harness.ctx.mux.register("h2");

    let mut r1 = request("r1", "h1");
    let mut r2 = request("r2", "h2");
    // Hint routes directly so no router round-trip consumes responses.
    r1.classification = Some(RouteKind::SimpleCode);
    r2.classification = Some(RouteKind::SimpleCode);

    harness.ctx.queue.enqueue(r1).unwrap();
    harness.ctx.queue.enqueue(r2).unwrap();
    let d1 = harness.ctx.queue.try_dequeue().unwrap();
    let d2 = harness.ctx.queue.try_dequeue().unwrap();

    let ctx1 = Arc::clone(&harness.ctx);
    let ctx2 = Arc::clone(&harness.ctx);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { process_request(&ctx1, d1).await }),
        tokio::spawn(async move { process_request(&ctx2, d2).await }),
    );
    a.unwrap();
    b.unwrap();

    for rx in [&mut rx1, &mut rx2] {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        let kinds = frame_kinds(&frames);
        assert_eq!(kinds.first(), Some(&"processing"));
        assert_eq!(kinds.last(), Some(&"done"));
        assert_eq!(kinds.iter().filter(|k| **k == "done").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "error").count(), 0);

        // Tokens reassemble the scripted response in emission order.
        let text: String = frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "one two three four five");
    }
}

// ---------------------------------------------------------------------------
// End-to-end: full worker pipeline with routing and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_routes_generates_persists_and_accounts() {
    let harness = Harness::new();
    // First generate call is the router, second the actual answer.
    harness.engine.push_response("SIMPLE_CODE");
    harness.engine.push_response("fn main() {}");

    let mut rx = harness.ctx.mux.register("h1");
    let mut r = request("r1", "h1");
    r.content = "write a minimal rust program".into();
    r.estimated_tokens = estimate_tokens(&r.content);
    let conversation_id = r.conversation_id.clone();

    harness.ctx.queue.enqueue(r).unwrap();
    let dequeued = harness.ctx.queue.try_dequeue().unwrap();
    process_request(&harness.ctx, dequeued).await;

    // The SIMPLE_CODE route's model got loaded and touched.
    assert!(harness.ctx.orchestrator.registry().contains("rnj-1:8b"));

    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    let kinds = frame_kinds(&frames);
    assert!(kinds.contains(&"token"));
    assert_eq!(kinds.last(), Some(&"done"));
    match frames.last().unwrap() {
        ServerFrame::Done { model, tokens_used, .. } => {
            assert_eq!(model, "rnj-1:8b");
            assert!(*tokens_used > 0);
        }
        other => panic!("expected done frame, got {other:?}"),
    }

    // Both sides of the exchange persisted in timestamp order.
    let messages = harness
        .conversations
        .all_messages(&conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].timestamp < messages[1].timestamp);
    assert_eq!(messages[1].model_used.as_deref(), Some("rnj-1:8b"));

    // Token usage accounted.
    let user = harness.users.get_or_create("user-1").await.unwrap();
    assert!(user.used_this_week > 0);
}
