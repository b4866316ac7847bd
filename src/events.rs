//! # Flow Events - Typed Engine Event Stream
//!
//! Non-blocking fan-out of engine lifecycle events. Consumers either take a
//! broadcast receiver or register a callback; emission never blocks the
//! execution path and a lagging subscriber only loses its own backlog.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::flow_stage::FlowStage;
use crate::flow_state::StageStatus;

/// Typed engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        flow_id: String,
    },
    StageStarted {
        flow_id: String,
        stage: FlowStage,
        retry_attempt: u32,
    },
    StageCompleted {
        flow_id: String,
        stage: FlowStage,
        status: StageStatus,
        duration_s: f64,
    },
    TransitionRecorded {
        flow_id: String,
        from_stage: FlowStage,
        to_stage: FlowStage,
        reason: String,
    },
    RetryScheduled {
        flow_id: String,
        stage: FlowStage,
        attempt: u32,
        delay_ms: u64,
    },
    CircuitOpened {
        flow_id: String,
        stage: FlowStage,
    },
    CircuitClosed {
        flow_id: String,
        stage: FlowStage,
    },
    ReviewRequested {
        flow_id: String,
        review_point: String,
    },
    ReviewDecided {
        flow_id: String,
        review_point: String,
        decision: String,
        timed_out: bool,
    },
    FlowCompleted {
        flow_id: String,
        duration_s: f64,
    },
    FlowFailed {
        flow_id: String,
        reason: String,
    },
}

/// Timestamped envelope delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: FlowEvent,
}

type EventCallback = Arc<dyn Fn(&FlowEventEnvelope) + Send + Sync>;

/// Event bus backed by a broadcast channel plus direct callbacks.
///
/// `emit` is wait-free for the emitter: broadcast sends drop when nobody
/// listens, and callbacks are invoked inline but must be cheap (consumers
/// that need to do real work should hand off to their own task).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEventEnvelope>,
    callbacks: Arc<RwLock<Vec<EventCallback>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEventEnvelope> {
        self.sender.subscribe()
    }

    /// Register a callback invoked on every event
    pub fn subscribe_fn<F>(&self, callback: F)
    where
        F: Fn(&FlowEventEnvelope) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn emit(&self, event: FlowEvent) {
        let envelope = FlowEventEnvelope {
            timestamp: Utc::now(),
            event,
        };

        // A send error only means there are no broadcast receivers
        let _ = self.sender.send(envelope.clone());

        for callback in self.callbacks.read().iter() {
            callback(&envelope);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
