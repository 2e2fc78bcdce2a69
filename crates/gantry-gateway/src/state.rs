//! Shared application state for the gateway's request handlers.

use std::sync::Arc;

use gantry_foundation::accountant::TokenAccountant;
use gantry_foundation::context::ContextBuilder;
use gantry_foundation::engine::EngineSet;
use gantry_foundation::mux::StreamMux;
use gantry_foundation::persistence::{ConversationStore, UserStore};
use gantry_foundation::preferences::PreferenceResolver;
use gantry_foundation::queue::AdmissionQueue;
use gantry_foundation::router::Router;
use gantry_foundation::vram::orchestrator::VramOrchestrator;
use gantry_kernel::config::Settings;
use gantry_kernel::profile::Profile;
use gantry_monitoring::store::MetricsStore;

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub profile: Arc<Profile>,
    pub queue: Arc<AdmissionQueue>,
    pub mux: Arc<StreamMux>,
    pub orchestrator: Arc<VramOrchestrator>,
    pub engines: EngineSet,
    pub router: Arc<Router>,
    pub resolver: Arc<PreferenceResolver>,
    pub context_builder: Arc<ContextBuilder>,
    pub accountant: Arc<TokenAccountant>,
    pub conversations: Arc<dyn ConversationStore>,
    pub users: Arc<dyn UserStore>,
    pub metrics: Arc<MetricsStore>,
}
