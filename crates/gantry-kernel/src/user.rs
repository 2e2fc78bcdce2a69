//! Per-user state: token budgets and model preferences.

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Preference value meaning "let the router decide".
pub const AUTO_MODEL: &str = "auto";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    /// Base weekly token allowance.
    pub weekly_budget: i64,
    /// One-off grants on top of the weekly allowance.
    pub bonus_tokens: i64,
    pub used_this_week: i64,
    /// Monday of the accounting week currently in force.
    pub week_start: NaiveDate,
    /// Preferred model; the `"auto"` sentinel behaves as `None`.
    pub preferred_model: Option<String>,
    pub temperature: Option<f32>,
    pub thinking: Option<bool>,
    /// Context size above which history is summarised for this user.
    pub summarize_threshold: u32,
    /// Whether to send a notice frame when summarisation runs.
    pub notify_on_summarize: bool,
}

impl UserState {
    pub fn new(user_id: impl Into<String>, weekly_budget: i64, summarize_threshold: u32) -> Self {
        Self {
            user_id: user_id.into(),
            weekly_budget,
            bonus_tokens: 0,
            used_this_week: 0,
            week_start: current_week_start(),
            preferred_model: None,
            temperature: None,
            thinking: None,
            summarize_threshold,
            notify_on_summarize: false,
        }
    }

    /// Preferred model with the `"auto"` sentinel resolved to `None`.
    pub fn effective_preferred_model(&self) -> Option<&str> {
        match self.preferred_model.as_deref() {
            Some(AUTO_MODEL) | None => None,
            Some(m) => Some(m),
        }
    }

    pub fn remaining_tokens(&self) -> i64 {
        self.weekly_budget + self.bonus_tokens - self.used_this_week
    }

    /// True when the accounting week is stale and usage must be reset.
    pub fn week_is_stale(&self) -> bool {
        current_week_start() > self.week_start
    }

    /// Reset usage for a new week; bonus tokens do not carry over.
    pub fn start_new_week(&mut self) {
        self.week_start = current_week_start();
        self.used_this_week = 0;
        self.bonus_tokens = 0;
    }
}

/// Monday of the current ISO week.
pub fn current_week_start() -> NaiveDate {
    let today = Utc::now().date_naive();
    today - chrono::Duration::days(today.weekday().num_days_from_monday() as i64)
}
