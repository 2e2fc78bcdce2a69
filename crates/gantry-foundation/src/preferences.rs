//! Preference resolution: request overrides beat user preferences beat
//! router output, with system defaults at the tail.

use gantry_kernel::config::Settings;
use gantry_kernel::request::ChatRequest;
use gantry_kernel::route::RouteDecision;
use gantry_kernel::user::UserState;

/// The fully-resolved serving parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPreferences {
    pub model: String,
    pub temperature: f32,
    pub thinking: bool,
}

pub struct PreferenceResolver {
    default_temperature: f32,
}

impl PreferenceResolver {
    pub fn new(settings: &Settings) -> Self {
        Self {
            default_temperature: settings.default_temperature,
        }
    }

    /// Merge `(request, user, route)` in that priority order.
    ///
    /// The user's `"auto"` preferred-model sentinel is treated as no
    /// preference. Temperature and thinking follow the same precedence,
    /// except the route's thinking default outranks the bare system
    /// default so reasoning routes keep their thinking mode unless the
    /// user or request explicitly turned it off.
    pub fn resolve(
        &self,
        request: &ChatRequest,
        user: &UserState,
        route: &RouteDecision,
    ) -> ResolvedPreferences {
        let model = request
            .model
            .clone()
            .or_else(|| user.effective_preferred_model().map(str::to_string))
            .unwrap_or_else(|| route.model.clone());

        let temperature = request
            .temperature
            .or(user.temperature)
            .unwrap_or(route.temperature);

        let thinking = request.thinking.or(user.thinking).unwrap_or(route.thinking);

        ResolvedPreferences {
            model,
            temperature,
            thinking,
        }
    }

    pub fn default_temperature(&self) -> f32 {
        self.default_temperature
    }
}
