//! # Review Gate - Human-in-the-Loop Decision Points
//!
//! Four fixed review points where a human decision may steer the run. A
//! review request blocks the calling run up to the point's timeout; without
//! input the configured default decision is applied. Every review emits a
//! decision log entry with timing, point id, decision and feedback.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::logging::{log_info, log_warn, LogCategory, LogEntry, LogLevel, LOGGER};
use crate::{FlowError, Result};

/// Decisions a reviewer may take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Edit,
    Revise,
    Redirect,
    Skip,
}

impl std::fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReviewDecision::Approve => "approve",
            ReviewDecision::Edit => "edit",
            ReviewDecision::Revise => "revise",
            ReviewDecision::Redirect => "redirect",
            ReviewDecision::Skip => "skip",
        };
        f.write_str(name)
    }
}

/// Review point configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanReviewPoint {
    pub id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<ReviewDecision>,
    pub timeout_seconds: u64,
    pub default_decision: ReviewDecision,
    pub required_fields: Vec<String>,
}

/// The four fixed review points
pub fn default_review_points() -> HashMap<String, HumanReviewPoint> {
    let points = [
        HumanReviewPoint {
            id: "draft_completion".to_string(),
            title: "Draft Review".to_string(),
            description: "Review the generated draft content".to_string(),
            options: vec![
                ReviewDecision::Approve,
                ReviewDecision::Edit,
                ReviewDecision::Revise,
            ],
            timeout_seconds: 300,
            default_decision: ReviewDecision::Approve,
            required_fields: Vec::new(),
        },
        HumanReviewPoint {
            id: "quality_gate".to_string(),
            title: "Quality Gate Review".to_string(),
            description: "Final quality check before publication".to_string(),
            options: vec![
                ReviewDecision::Approve,
                ReviewDecision::Revise,
                ReviewDecision::Redirect,
            ],
            timeout_seconds: 600,
            default_decision: ReviewDecision::Revise,
            required_fields: vec!["quality_score".to_string(), "checklist_status".to_string()],
        },
        HumanReviewPoint {
            id: "topic_viability".to_string(),
            title: "Topic Viability Review".to_string(),
            description: "Review low-viability topic for manual override".to_string(),
            options: vec![
                ReviewDecision::Approve,
                ReviewDecision::Skip,
                ReviewDecision::Redirect,
            ],
            timeout_seconds: 180,
            default_decision: ReviewDecision::Skip,
            required_fields: Vec::new(),
        },
        HumanReviewPoint {
            id: "routing_override".to_string(),
            title: "Routing Override".to_string(),
            description: "Override automatic content routing decision".to_string(),
            options: vec![ReviewDecision::Approve, ReviewDecision::Redirect],
            timeout_seconds: 120,
            default_decision: ReviewDecision::Approve,
            required_fields: Vec::new(),
        },
    ];

    points.into_iter().map(|p| (p.id.clone(), p)).collect()
}

/// Outcome returned to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub request_id: String,
    pub review_point: String,
    pub decision: ReviewDecision,
    pub feedback: Option<String>,
    pub timed_out: bool,
    pub elapsed_seconds: f64,
}

/// One entry in the decision log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecisionRecord {
    pub request_id: String,
    pub review_point: String,
    pub decision: ReviewDecision,
    pub feedback: Option<String>,
    pub timed_out: bool,
    pub elapsed_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// A review waiting for input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReview {
    pub request_id: String,
    pub review_point: String,
    pub content: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewGateConfig {
    /// Apply every point's approve path immediately (testing)
    pub auto_approve: bool,
    /// Disable timeouts and wait indefinitely for input
    pub enable_timeouts: bool,
}

impl Default for ReviewGateConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            enable_timeouts: true,
        }
    }
}

#[derive(Default)]
struct GateStats {
    review_count: u64,
    timeout_count: u64,
    total_review_time: f64,
}

struct GateInner {
    pending: HashMap<String, (PendingReview, oneshot::Sender<(ReviewDecision, Option<String>)>)>,
    decision_log: Vec<ReviewDecisionRecord>,
    stats: GateStats,
}

/// Human review gate. The engine calls [`ReviewGate::request_review`] and
/// blocks; an operator surface answers through
/// [`ReviewGate::submit_decision`].
pub struct ReviewGate {
    config: ReviewGateConfig,
    points: HashMap<String, HumanReviewPoint>,
    inner: Mutex<GateInner>,
}

impl ReviewGate {
    pub fn new(config: ReviewGateConfig) -> Self {
        Self {
            config,
            points: default_review_points(),
            inner: Mutex::new(GateInner {
                pending: HashMap::new(),
                decision_log: Vec::new(),
                stats: GateStats::default(),
            }),
        }
    }

    pub fn point(&self, id: &str) -> Option<&HumanReviewPoint> {
        self.points.get(id)
    }

    /// Override one point's timeout (operator tuning and tests)
    pub fn set_point_timeout(&mut self, id: &str, timeout_seconds: u64) -> Result<()> {
        let point = self
            .points
            .get_mut(id)
            .ok_or_else(|| FlowError::Configuration(format!("unknown review point: {id}")))?;
        point.timeout_seconds = timeout_seconds;
        Ok(())
    }

    /// Request a human decision at a review point. Blocks up to the point's
    /// timeout; the default decision is applied when no input arrives.
    pub async fn request_review(
        &self,
        point_id: &str,
        mut content: serde_json::Value,
    ) -> Result<ReviewOutcome> {
        let point = self
            .points
            .get(point_id)
            .ok_or_else(|| FlowError::Configuration(format!("unknown review point: {point_id}")))?
            .clone();

        // Backfill missing required fields instead of rejecting the review
        if let Some(obj) = content.as_object_mut() {
            for field in &point.required_fields {
                if !obj.contains_key(field) {
                    log_warn(
                        LogCategory::Review,
                        &format!("Missing required field '{field}' for {point_id}"),
                    );
                    obj.insert(field.clone(), serde_json::Value::from("Not Available"));
                }
            }
        }

        let request_id = Uuid::new_v4().to_string();
        let started = Utc::now();

        if self.config.auto_approve {
            return Ok(self.record_outcome(
                &request_id,
                &point,
                ReviewDecision::Approve,
                None,
                false,
                started,
            ));
        }

        let (sender, receiver) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.pending.insert(
                request_id.clone(),
                (
                    PendingReview {
                        request_id: request_id.clone(),
                        review_point: point_id.to_string(),
                        content,
                        requested_at: started,
                    },
                    sender,
                ),
            );
        }

        log_info(
            LogCategory::Review,
            &format!("Review requested at {point_id} (request {request_id})"),
        );

        let received = if self.config.enable_timeouts {
            match tokio::time::timeout(Duration::from_secs(point.timeout_seconds), receiver).await
            {
                Ok(Ok(decision)) => Some(decision),
                // Sender dropped or timeout elapsed: fall back to default
                _ => None,
            }
        } else {
            receiver.await.ok()
        };

        // Drop the pending entry whether answered or expired
        self.inner.lock().pending.remove(&request_id);

        let outcome = match received {
            Some((decision, feedback)) => {
                self.record_outcome(&request_id, &point, decision, feedback, false, started)
            }
            None => {
                log_warn(
                    LogCategory::Review,
                    &format!(
                        "Review at {point_id} timed out after {}s, applying default {}",
                        point.timeout_seconds, point.default_decision
                    ),
                );
                self.record_outcome(
                    &request_id,
                    &point,
                    point.default_decision,
                    None,
                    true,
                    started,
                )
            }
        };

        Ok(outcome)
    }

    fn record_outcome(
        &self,
        request_id: &str,
        point: &HumanReviewPoint,
        decision: ReviewDecision,
        feedback: Option<String>,
        timed_out: bool,
        started: DateTime<Utc>,
    ) -> ReviewOutcome {
        let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;

        let record = ReviewDecisionRecord {
            request_id: request_id.to_string(),
            review_point: point.id.clone(),
            decision,
            feedback: feedback.clone(),
            timed_out,
            elapsed_seconds: elapsed,
            timestamp: Utc::now(),
        };

        {
            let mut inner = self.inner.lock();
            inner.decision_log.push(record.clone());
            inner.stats.review_count += 1;
            inner.stats.total_review_time += elapsed;
            if timed_out {
                inner.stats.timeout_count += 1;
            }
        }

        LOGGER.log(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            category: LogCategory::Review,
            message: format!("Review decided at {}: {decision}", point.id),
            data: serde_json::to_value(&record).unwrap_or(serde_json::Value::Null),
            flow_id: None,
            duration_ms: Some((elapsed * 1000.0) as u64),
        });

        ReviewOutcome {
            request_id: request_id.to_string(),
            review_point: point.id.clone(),
            decision,
            feedback,
            timed_out,
            elapsed_seconds: elapsed,
        }
    }

    /// Answer a pending review. Rejects decisions the point does not allow.
    pub fn submit_decision(
        &self,
        request_id: &str,
        decision: ReviewDecision,
        feedback: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let (pending, sender) = inner
            .pending
            .remove(request_id)
            .ok_or_else(|| FlowError::Validation(format!("no pending review {request_id}")))?;

        let point = self.points.get(&pending.review_point).ok_or_else(|| {
            FlowError::Configuration(format!("unknown review point: {}", pending.review_point))
        })?;

        if !point.options.contains(&decision) {
            // Put the pending entry back so the reviewer can retry
            inner.pending.insert(request_id.to_string(), (pending, sender));
            return Err(FlowError::Validation(format!(
                "decision {decision} not allowed at {}",
                point.id
            )));
        }

        sender
            .send((decision, feedback))
            .map_err(|_| FlowError::Validation("review request no longer waiting".to_string()))
    }

    /// Reviews currently waiting for input
    pub fn pending_reviews(&self) -> Vec<PendingReview> {
        self.inner
            .lock()
            .pending
            .values()
            .map(|(pending, _)| pending.clone())
            .collect()
    }

    pub fn decision_log(&self) -> Vec<ReviewDecisionRecord> {
        self.inner.lock().decision_log.clone()
    }

    pub fn stats(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "review_count": inner.stats.review_count,
            "timeout_count": inner.stats.timeout_count,
            "total_review_time_seconds": inner.stats.total_review_time,
            "pending_reviews": inner.pending.len(),
        })
    }
}

impl Default for ReviewGate {
    fn default() -> Self {
        Self::new(ReviewGateConfig::default())
    }
}
