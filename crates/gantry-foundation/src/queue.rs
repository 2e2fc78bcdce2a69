//! Bounded FIFO admission queue with an in-flight set.
//!
//! One mutex protects the FIFO and the in-flight map jointly; dequeue
//! waits on a `Notify` until work arrives or shutdown. Ordering is pure
//! FIFO; the only exception is retry requeues, which go back to the
//! head so a retried request is not penalised a second full wait.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tracing::{info, warn};

use gantry_kernel::error::{GantryError, GantryResult};
use gantry_kernel::request::{ChatRequest, OriginTier};

/// Published when a request fails terminally outside the worker's own
/// frame emission (e.g. visibility timeout).
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub request_id: String,
    pub client_handle: String,
    pub reason: String,
}

/// Where a request currently sits, for the `position` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePosition {
    /// 1-based rank in the FIFO.
    Queued(usize),
    InFlight,
    Unknown,
}

struct QueueState {
    fifo: VecDeque<ChatRequest>,
    in_flight: HashMap<String, ChatRequest>,
    shutdown: bool,
}

pub struct AdmissionQueue {
    capacity: usize,
    /// Size at which Normal-tier requests are refused.
    watermark: usize,
    max_retries: u32,
    state: Mutex<QueueState>,
    notify: Notify,
    failures: broadcast::Sender<FailureEvent>,
}

impl AdmissionQueue {
    pub fn new(capacity: usize, watermark: usize, max_retries: u32) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            capacity,
            watermark: watermark.min(capacity),
            max_retries,
            state: Mutex::new(QueueState {
                fifo: VecDeque::new(),
                in_flight: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            failures,
        }
    }

    /// Subscribe to terminal failures published via [`mark_failed`].
    ///
    /// [`mark_failed`]: AdmissionQueue::mark_failed
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailureEvent> {
        self.failures.subscribe()
    }

    /// Append to the FIFO. Returns the 1-based queue position.
    pub fn enqueue(&self, request: ChatRequest) -> GantryResult<usize> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(GantryError::QueueShutdown);
        }
        if state.fifo.len() >= self.capacity {
            return Err(GantryError::QueueFull {
                capacity: self.capacity,
            });
        }
        if request.tier == OriginTier::Normal && state.fifo.len() >= self.watermark {
            // Watermark admission: leave the remaining slots to
            // priority traffic.
            return Err(GantryError::QueueFull {
                capacity: self.watermark,
            });
        }

        state.fifo.push_back(request);
        let position = state.fifo.len();
        drop(state);
        self.notify.notify_one();
        Ok(position)
    }

    /// Pop the head, blocking until work arrives. Returns `None` after
    /// shutdown once the FIFO drains.
    pub async fn dequeue(&self) -> Option<ChatRequest> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(mut request) = state.fifo.pop_front() {
                    request.started_at = Some(Instant::now());
                    state
                        .in_flight
                        .insert(request.id.clone(), request.clone());
                    return Some(request);
                }
                if state.shutdown {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking dequeue, for drain loops and tests.
    pub fn try_dequeue(&self) -> Option<ChatRequest> {
        let mut state = self.state.lock();
        let mut request = state.fifo.pop_front()?;
        request.started_at = Some(Instant::now());
        state.in_flight.insert(request.id.clone(), request.clone());
        Some(request)
    }

    /// Normal completion: drop the in-flight entry.
    pub fn ack(&self, id: &str) {
        self.state.lock().in_flight.remove(id);
    }

    /// Re-insert a stuck or crashed request at the head with its retry
    /// counter bumped. Returns `false` once the retry cap is reached.
    pub fn requeue_for_retry(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(mut request) = state.in_flight.remove(id) else {
            return false;
        };
        if request.retry_count >= self.max_retries {
            // Caller decides what to do with the exhausted request; put
            // it back in flight so mark_failed can find it.
            state.in_flight.insert(id.to_string(), request);
            return false;
        }
        request.retry_count += 1;
        request.started_at = None;
        warn!(
            request_id = %id,
            retry = request.retry_count,
            max = self.max_retries,
            "requeueing request at head"
        );
        state.fifo.push_front(request);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Terminal failure: drop the in-flight entry and publish an event.
    pub fn mark_failed(&self, id: &str, reason: &str) {
        let removed = self.state.lock().in_flight.remove(id);
        if let Some(request) = removed {
            info!(request_id = %id, reason = %reason, "request failed terminally");
            let _ = self.failures.send(FailureEvent {
                request_id: id.to_string(),
                client_handle: request.client_handle,
                reason: reason.to_string(),
            });
        }
    }

    pub fn position(&self, id: &str) -> QueuePosition {
        let state = self.state.lock();
        if let Some(rank) = state.fifo.iter().position(|r| r.id == id) {
            return QueuePosition::Queued(rank + 1);
        }
        if state.in_flight.contains_key(id) {
            return QueuePosition::InFlight;
        }
        QueuePosition::Unknown
    }

    pub fn size(&self) -> usize {
        self.state.lock().fifo.len()
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    pub fn in_flight_snapshot(&self) -> HashMap<String, ChatRequest> {
        self.state.lock().in_flight.clone()
    }

    /// Drop all pending requests, returning how many were purged.
    /// In-flight work is untouched.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let purged = state.fifo.len();
        state.fifo.clear();
        purged
    }

    /// Stop accepting work and wake all blocked dequeuers.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Test hook: place a request directly in flight (e.g. backdated
    /// `started_at` for visibility-timeout scenarios).
    #[cfg(test)]
    pub(crate) fn force_in_flight(&self, request: ChatRequest) {
        self.state
            .lock()
            .in_flight
            .insert(request.id.clone(), request);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
