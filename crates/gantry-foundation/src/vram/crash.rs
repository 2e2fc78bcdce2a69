//! Windowed crash tracking with circuit-breaker semantics.
//!
//! Each model accumulates `(timestamp, reason)` records; records older
//! than the window are dropped on access. Crossing the threshold fires
//! every registered observer exactly once; the latch re-arms when the
//! history is cleared or ages out of the window.
//!
//! The tracker publishes, subscribers act: the orchestrator refuses
//! loads for tripped models and the profile layer may re-route, but
//! neither calls back into the tracker beyond `record`/`clear`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Observer invoked on each threshold crossing: `(model, count, reason)`.
pub type CrashObserver = Box<dyn Fn(&str, usize, &str) + Send + Sync>;

/// Summary of a model's recent crash history.
#[derive(Debug, Clone, Serialize)]
pub struct CrashHistory {
    pub crash_count: usize,
    pub last_crash_secs_ago: Option<f64>,
    pub recommend_evict: bool,
}

#[derive(Default)]
struct ModelCrashes {
    records: VecDeque<(Instant, String)>,
    /// Set once the threshold fires; cleared with the history or when
    /// the window empties.
    tripped: bool,
}

pub struct CrashTracker {
    threshold: usize,
    window: Duration,
    crashes: Mutex<HashMap<String, ModelCrashes>>,
    observers: Mutex<Vec<CrashObserver>>,
}

impl CrashTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold,
            window,
            crashes: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer for threshold crossings.
    pub fn add_observer(&self, observer: CrashObserver) {
        self.observers.lock().push(observer);
    }

    /// Record a crash. Fires observers when the in-window count first
    /// reaches the threshold.
    pub fn record(&self, model: &str, reason: &str) {
        let (count, fire) = {
            let mut crashes = self.crashes.lock();
            let entry = crashes.entry(model.to_string()).or_default();
            Self::prune(entry, self.window);
            entry.records.push_back((Instant::now(), reason.to_string()));

            let count = entry.records.len();
            let fire = count >= self.threshold && !entry.tripped;
            if fire {
                entry.tripped = true;
            }
            (count, fire)
        };

        if fire {
            warn!(
                model = %model,
                crashes = count,
                window_secs = self.window.as_secs(),
                reason = %reason,
                "circuit breaker tripped"
            );
            for observer in self.observers.lock().iter() {
                observer(model, count, reason);
            }
        } else {
            info!(
                model = %model,
                crashes = count,
                threshold = self.threshold,
                reason = %reason,
                "crash recorded"
            );
        }
    }

    /// Whether loads of `model` should be refused.
    pub fn is_open(&self, model: &str) -> bool {
        self.history(model).recommend_evict
    }

    /// In-window crash summary for `model`.
    pub fn history(&self, model: &str) -> CrashHistory {
        let mut crashes = self.crashes.lock();
        let Some(entry) = crashes.get_mut(model) else {
            return CrashHistory {
                crash_count: 0,
                last_crash_secs_ago: None,
                recommend_evict: false,
            };
        };
        Self::prune(entry, self.window);
        if entry.records.is_empty() {
            // Window drained; re-arm the observer latch.
            entry.tripped = false;
        }

        CrashHistory {
            crash_count: entry.records.len(),
            last_crash_secs_ago: entry
                .records
                .back()
                .map(|(at, _)| at.elapsed().as_secs_f64()),
            recommend_evict: entry.records.len() >= self.threshold,
        }
    }

    /// Erase all history for `model`, re-arming the breaker.
    pub fn clear(&self, model: &str) {
        let removed = self.crashes.lock().remove(model);
        if let Some(entry) = removed {
            info!(
                model = %model,
                cleared = entry.records.len(),
                "crash history cleared"
            );
        }
    }

    /// Models with at least one in-window crash.
    pub fn models_with_crashes(&self) -> Vec<String> {
        let mut crashes = self.crashes.lock();
        let window = self.window;
        crashes
            .iter_mut()
            .filter_map(|(model, entry)| {
                Self::prune(entry, window);
                (!entry.records.is_empty()).then(|| model.clone())
            })
            .collect()
    }

    fn prune(entry: &mut ModelCrashes, window: Duration) {
        let cutoff = Instant::now() - window;
        while entry
            .records
            .front()
            .is_some_and(|(at, _)| *at < cutoff)
        {
            entry.records.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker() -> CrashTracker {
        CrashTracker::new(2, Duration::from_secs(300))
    }

    #[test]
    fn below_threshold_is_closed() {
        let t = tracker();
        t.record("m", "engine_timeout");
        assert!(!t.is_open("m"));
        let h = t.history("m");
        assert_eq!(h.crash_count, 1);
        assert!(!h.recommend_evict);
    }

    #[test]
    fn threshold_opens_circuit() {
        let t = tracker();
        t.record("m", "engine_timeout");
        t.record("m", "engine_unreachable");
        assert!(t.is_open("m"));
        assert_eq!(t.history("m").crash_count, 2);
    }

    #[test]
    fn observers_fire_once_per_crossing() {
        let t = tracker();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        t.add_observer(Box::new(move |_, _, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        t.record("m", "a");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        t.record("m", "b");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Further crashes while tripped do not re-fire.
        t.record("m", "c");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_rearms_the_breaker() {
        let t = tracker();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        t.add_observer(Box::new(move |_, _, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        t.record("m", "a");
        t.record("m", "b");
        assert!(t.is_open("m"));

        t.clear("m");
        assert!(!t.is_open("m"));
        assert_eq!(t.history("m").crash_count, 0);

        t.record("m", "a");
        t.record("m", "b");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn old_crashes_age_out() {
        let t = CrashTracker::new(2, Duration::from_millis(10));
        t.record("m", "a");
        t.record("m", "b");
        assert!(t.is_open("m"));

        std::thread::sleep(Duration::from_millis(25));
        assert!(!t.is_open("m"));
        assert_eq!(t.history("m").crash_count, 0);
        assert!(t.models_with_crashes().is_empty());
    }

    #[test]
    fn observer_receives_model_and_count() {
        let t = tracker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        t.add_observer(Box::new(move |model, count, reason| {
            seen_clone
                .lock()
                .push((model.to_string(), count, reason.to_string()));
        }));

        t.record("big:70b", "engine_status_502");
        t.record("big:70b", "engine_status_502");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "big:70b");
        assert_eq!(seen[0].1, 2);
        assert_eq!(seen[0].2, "engine_status_502");
    }

    #[test]
    fn histories_are_per_model() {
        let t = tracker();
        t.record("a", "x");
        t.record("b", "x");
        t.record("b", "x");
        assert!(!t.is_open("a"));
        assert!(t.is_open("b"));
        let mut with_crashes = t.models_with_crashes();
        with_crashes.sort();
        assert_eq!(with_crashes, vec!["a", "b"]);
    }
}
