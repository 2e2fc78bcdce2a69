//! The worker pool: drives requests through
//! load → generate → stream → persist.
//!
//! Each worker dequeues one request at a time, emits the `processing`
//! frame, builds context, classifies, ensures model residency, streams
//! deltas to the multiplexer, persists the exchange and updates token
//! usage. Crash-kind engine failures mark the model unloaded and send
//! the request back to the head of the queue; everything else fails the
//! request terminally with an `error` frame.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_kernel::config::Settings;
use gantry_kernel::error::{GantryError, GantryResult};
use gantry_kernel::frames::ServerFrame;
use gantry_kernel::message::MessageRole;
use gantry_kernel::profile::Profile;
use gantry_kernel::request::{ChatRequest, estimate_tokens};

use crate::accountant::{BudgetDecision, TokenAccountant};
use crate::context::ContextBuilder;
use crate::engine::{EngineMessage, EngineSet, GenerateParams, GenerationDelta};
use crate::mux::StreamMux;
use crate::persistence::{ConversationStore, UserStore};
use crate::preferences::PreferenceResolver;
use crate::queue::AdmissionQueue;
use crate::router::Router;
use crate::vram::orchestrator::VramOrchestrator;

/// Everything a worker needs, bundled once at startup.
pub struct WorkerContext {
    pub queue: Arc<AdmissionQueue>,
    pub mux: Arc<StreamMux>,
    pub router: Arc<Router>,
    pub resolver: Arc<PreferenceResolver>,
    pub orchestrator: Arc<VramOrchestrator>,
    pub engines: EngineSet,
    pub context_builder: Arc<ContextBuilder>,
    pub accountant: Arc<TokenAccountant>,
    pub conversations: Arc<dyn ConversationStore>,
    pub users: Arc<dyn UserStore>,
    pub profile: Arc<Profile>,
    pub settings: Arc<Settings>,
}

pub struct WorkerPool {
    context: Arc<WorkerContext>,
}

impl WorkerPool {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Spawn `count` workers; each exits once `shutdown` fires and the
    /// current request (if any) has finished.
    pub fn spawn(&self, count: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let ctx = Arc::clone(&self.context);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(worker_id = worker_id, "worker started");
                    loop {
                        let request = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            request = ctx.queue.dequeue() => request,
                        };
                        let Some(request) = request else {
                            break; // queue shut down
                        };
                        process_request(&ctx, request).await;
                    }
                    info!(worker_id = worker_id, "worker stopped");
                })
            })
            .collect()
    }
}

/// Run one request to a terminal state.
pub async fn process_request(ctx: &WorkerContext, request: ChatRequest) {
    let request_id = request.id.clone();
    let handle = request.client_handle.clone();

    ctx.mux
        .send(
            &handle,
            ServerFrame::Processing {
                request_id: request_id.clone(),
            },
        )
        .await;

    let mut active_model: Option<String> = None;
    match run_pipeline(ctx, &request, &mut active_model).await {
        Ok(PipelineOutcome::Completed) => {
            ctx.queue.ack(&request_id);
        }
        Ok(PipelineOutcome::ClientGone) => {
            // The stream was torn down mid-generation; nothing left to
            // deliver. The model did useful work, so it stays marked
            // accessed, not crashed.
            debug!(request_id = %request_id, "client gone; abandoning request");
            ctx.queue.ack(&request_id);
        }
        Err(err) => {
            let retriable = err.is_retriable();
            if retriable {
                if let Some(model) = &active_model {
                    let reason = match &err {
                        GantryError::Engine(e) => e.reason(),
                        _ => "worker_failure".into(),
                    };
                    let _ = ctx
                        .orchestrator
                        .mark_unloaded(model, true, Some(&reason))
                        .await;
                }
                if ctx.queue.requeue_for_retry(&request_id) {
                    info!(request_id = %request_id, error = %err, "request requeued after crash");
                    return;
                }
            }
            warn!(request_id = %request_id, error = %err, "request failed terminally");
            ctx.queue.mark_failed(&request_id, &err.to_string());
            ctx.mux
                .send(
                    &handle,
                    ServerFrame::Error {
                        error: err.to_string(),
                    },
                )
                .await;
        }
    }
}

enum PipelineOutcome {
    Completed,
    ClientGone,
}

async fn run_pipeline(
    ctx: &WorkerContext,
    request: &ChatRequest,
    active_model: &mut Option<String>,
) -> GantryResult<PipelineOutcome> {
    let user = ctx.users.get_or_create(&request.user_id).await?;

    // Budget gate before any engine work.
    if let BudgetDecision::Deny { remaining } =
        ctx.accountant.check(&user, request.estimated_tokens)
    {
        return Err(GantryError::BudgetExceeded { remaining });
    }

    // Trivial greetings skip the whole model pipeline.
    if let Some(reply) = greeting_reply(&request.content) {
        return finish_exchange(ctx, request, reply.to_string(), 0, 0, 0.0, "greeting").await;
    }

    let context = ctx
        .context_builder
        .load(&request.conversation_id, &user)
        .await?;
    if context.summarized && user.notify_on_summarize {
        ctx.mux
            .send(
                &request.client_handle,
                ServerFrame::Notice {
                    message: "Older messages were summarised to stay within your context budget."
                        .into(),
                },
            )
            .await;
    }

    let route = ctx.router.classify(request).await;
    let resolved = ctx.resolver.resolve(request, &user, &route);

    let descriptor = ctx
        .profile
        .descriptor(&resolved.model)
        .ok_or_else(|| GantryError::UnknownModel(resolved.model.clone()))?;
    let engine = ctx
        .engines
        .get(descriptor.engine)
        .ok_or_else(|| GantryError::EngineUnavailable(descriptor.engine.to_string()))?;

    let params = GenerateParams {
        temperature: Some(resolved.temperature),
        thinking: descriptor.capabilities.thinking.then_some(resolved.thinking),
        max_tokens: None,
        keep_alive: descriptor.keep_alive.clone(),
        allowed_tools: route.allowed_tools.clone(),
        deadline: Some(ctx.settings.request_deadline_for(Some(route.route))),
    };

    ctx.orchestrator
        .request_load(&resolved.model, &params)
        .await?;
    *active_model = Some(resolved.model.clone());
    ctx.orchestrator.mark_accessed(&resolved.model);

    let mut messages = context.messages;
    messages.push(EngineMessage::user(request.content_with_files()));

    let mut stream = engine.generate(&resolved.model, &messages, &params).await?;
    let client_gone = ctx.mux.client_gone(&request.client_handle);

    let mut response = String::new();
    let mut input_tokens = 0u32;
    let mut output_tokens = 0u32;
    let mut generation_secs = 0.0f64;

    loop {
        let delta = tokio::select! {
            biased;
            _ = client_gone.cancelled() => {
                ctx.orchestrator.mark_accessed(&resolved.model);
                return Ok(PipelineOutcome::ClientGone);
            }
            delta = stream.recv() => delta,
        };
        let Some(delta) = delta else {
            break; // stream closed
        };

        match delta? {
            GenerationDelta::Text(chunk) => {
                response.push_str(&chunk);
                ctx.mux
                    .send(&request.client_handle, ServerFrame::Token { content: chunk })
                    .await;
            }
            GenerationDelta::ToolCall { name, .. } => {
                ctx.mux
                    .send(
                        &request.client_handle,
                        ServerFrame::ToolStart { name: name.clone() },
                    )
                    .await;
                // Tool execution is an external collaborator; the
                // intent is surfaced to the client and the stream
                // continues with whatever the engine produces next.
                ctx.mux
                    .send(&request.client_handle, ServerFrame::ToolEnd { name })
                    .await;
            }
            GenerationDelta::Usage {
                input_tokens: input,
                output_tokens: output,
                generation_secs: secs,
            } => {
                input_tokens = input;
                output_tokens = output;
                generation_secs = secs;
            }
        }
    }

    finish_exchange(
        ctx,
        request,
        response,
        input_tokens,
        output_tokens,
        generation_secs,
        &resolved.model,
    )
    .await
}

/// Persist the exchange, update usage and emit the `done` frame.
async fn finish_exchange(
    ctx: &WorkerContext,
    request: &ChatRequest,
    response: String,
    input_tokens: u32,
    output_tokens: u32,
    generation_secs: f64,
    model: &str,
) -> GantryResult<PipelineOutcome> {
    let input_tokens = if input_tokens > 0 {
        input_tokens
    } else {
        request.estimated_tokens.max(estimate_tokens(&request.content))
    };
    let output_tokens = if output_tokens > 0 {
        output_tokens
    } else {
        estimate_tokens(&response)
    };

    // Persistence failures are logged and do not fail the request; the
    // client already has the streamed response.
    if let Err(e) = ctx
        .conversations
        .add_message(
            &request.conversation_id,
            MessageRole::User,
            &request.content,
            input_tokens,
            0,
            None,
            None,
        )
        .await
    {
        warn!(error = %e, "failed to persist user message");
    }

    let message_id = match ctx
        .conversations
        .add_message(
            &request.conversation_id,
            MessageRole::Assistant,
            &response,
            0,
            output_tokens,
            Some(model),
            Some(generation_secs),
        )
        .await
    {
        Ok(message) => message.message_id,
        Err(e) => {
            warn!(error = %e, "failed to persist assistant message");
            uuid::Uuid::new_v4().to_string()
        }
    };

    if let Err(e) = ctx
        .accountant
        .add(&request.user_id, input_tokens, output_tokens)
        .await
    {
        warn!(error = %e, "failed to record token usage");
    }

    ctx.mux
        .send(
            &request.client_handle,
            ServerFrame::Done {
                message_id,
                tokens_used: input_tokens + output_tokens,
                generation_time: generation_secs,
                model: model.to_string(),
                artifacts: Vec::new(),
            },
        )
        .await;

    Ok(PipelineOutcome::Completed)
}

/// Canned reply for trivial greetings, saving a model round-trip.
fn greeting_reply(content: &str) -> Option<&'static str> {
    let normalized: String = content
        .trim()
        .trim_end_matches(['!', '.', '?'])
        .to_lowercase();
    match normalized.as_str() {
        "hi" | "hello" | "hey" | "yo" | "good morning" | "good afternoon" | "good evening" => {
            Some("Hello! What can I help you with?")
        }
        "thanks" | "thank you" | "ty" => Some("You're welcome!"),
        _ => None,
    }
}
