//! Weekly token budget enforcement.
//!
//! Budget checks run at admission; usage updates are optimistic
//! write-through after generation. A race where two concurrent requests
//! both pass the check and briefly overshoot the budget by one request
//! is accepted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_kernel::error::GantryResult;
use gantry_kernel::user::UserState;

use crate::persistence::UserStore;

/// Outcome of a budget check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    Allow,
    Deny { remaining: i64 },
}

pub struct TokenAccountant {
    store: Arc<dyn UserStore>,
    enforce: bool,
}

impl TokenAccountant {
    pub fn new(store: Arc<dyn UserStore>, enforce: bool) -> Self {
        Self { store, enforce }
    }

    /// Whether `user` may spend an estimated `est_input` tokens.
    pub fn check(&self, user: &UserState, est_input: u32) -> BudgetDecision {
        if !self.enforce {
            return BudgetDecision::Allow;
        }
        // A stale week means usage resets at the next sweep; treat the
        // budget as fresh rather than denying over last week's spend.
        if user.week_is_stale() {
            return BudgetDecision::Allow;
        }
        let remaining = user.remaining_tokens();
        if remaining >= est_input as i64 {
            BudgetDecision::Allow
        } else {
            BudgetDecision::Deny { remaining }
        }
    }

    /// Record consumed tokens after a completed generation.
    pub async fn add(&self, user_id: &str, input_tokens: u32, output_tokens: u32) -> GantryResult<()> {
        let total = input_tokens as i64 + output_tokens as i64;
        self.store.add_usage(user_id, total).await?;
        debug!(user_id = %user_id, tokens = total, "usage recorded");
        Ok(())
    }

    /// One sweep: reset accounting weeks that have rolled over.
    pub async fn weekly_sweep(&self) -> GantryResult<usize> {
        let reset = self.store.reset_stale_weeks().await?;
        if reset > 0 {
            info!(users = reset, "weekly token budgets reset");
        }
        Ok(reset)
    }

    /// Background task running the sweep once a day.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let accountant = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = accountant.weekly_sweep().await {
                            warn!(error = %e, "weekly sweep failed");
                        }
                    }
                }
            }
        })
    }
}
