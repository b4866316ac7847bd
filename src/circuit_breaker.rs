//! # Circuit Breaker - Per-Stage Fault Isolation
//!
//! Three-state breaker (closed / open / half-open) guarding stage handler
//! invocations. Calls pass through a closed breaker, fail fast on an open
//! one, and a single probe is allowed once the recovery window elapses.
//!
//! A breaker that was opened by [`CircuitBreaker::force_open`] is promoted
//! to half-open lazily by *status reads* once the recovery window elapses;
//! an organically opened breaker is only promoted when a call is attempted.
//! That read-side state change is unusual but deliberate, and the manual
//! flag is tracked explicitly so the two paths never mix.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::flow_stage::FlowStage;
use crate::flow_state::{CircuitState, FlowControlState};
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::retry::StageError;
use crate::{FlowError, Result};

/// Default failure threshold for general-purpose breakers
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Conservative threshold used by per-stage breakers
pub const STAGE_FAILURE_THRESHOLD: u32 = 3;
/// Default recovery window
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Observable breaker metrics block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub time_since_failure_seconds: Option<f64>,
    pub recovery_timeout_seconds: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    call_count: u64,
    success_count: u64,
    failure_count_total: u64,
    opened_manually: bool,
}

/// Circuit breaker for fault tolerance.
///
/// The breaker has its own lock and never calls back into an attached
/// [`FlowControlState`] while holding it; mirror updates happen after the
/// internal state change is committed.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    flow_state: Option<Arc<FlowControlState>>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str) -> Self {
        Self::with_settings(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT, None)
    }

    pub fn with_settings(
        name: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        flow_state: Option<Arc<FlowControlState>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            recovery_timeout,
            flow_state,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                last_success_time: None,
                call_count: 0,
                success_count: 0,
                failure_count_total: 0,
                opened_manually: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        match inner.last_failure_time {
            None => true,
            Some(last) => {
                (Utc::now() - last).num_seconds() >= self.recovery_timeout.as_secs() as i64
            }
        }
    }

    /// Current state. Reading promotes a *manually* forced-open breaker to
    /// half-open once the recovery window has elapsed; no probe call is
    /// consumed by the promotion.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open
            && inner.opened_manually
            && self.recovery_elapsed(&inner)
        {
            inner.state = CircuitState::HalfOpen;
            log_info(
                LogCategory::Breaker,
                &format!("Circuit breaker '{}' entering half-open state (check)", self.name),
            );
        }
        inner.state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Gate check consumed by call paths: open breakers transition to
    /// half-open when the recovery window elapsed, otherwise the call is
    /// rejected.
    fn check_before_call(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.call_count += 1;

        if inner.state == CircuitState::Open {
            if self.recovery_elapsed(&inner) {
                inner.state = CircuitState::HalfOpen;
                log_info(
                    LogCategory::Breaker,
                    &format!("Circuit breaker '{}' entering half-open state (call)", self.name),
                );
            } else {
                return Err(FlowError::CircuitOpen(self.name.clone()));
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        let mirror = {
            let mut inner = self.inner.lock();
            inner.success_count += 1;
            inner.last_success_time = Some(Utc::now());

            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_manually = false;
                log_info(
                    LogCategory::Breaker,
                    &format!("Circuit breaker '{}' closed after successful recovery", self.name),
                );
            }
            inner.state
        };
        self.mirror_to_flow_state(true, mirror);
    }

    fn on_failure(&self) {
        let mirror = {
            let mut inner = self.inner.lock();
            inner.failure_count += 1;
            inner.failure_count_total += 1;
            inner.last_failure_time = Some(Utc::now());

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.opened_manually = false;
                    log_warn(
                        LogCategory::Breaker,
                        &format!(
                            "Circuit breaker '{}' reopened after failure in half-open state",
                            self.name
                        ),
                    );
                }
                CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                    inner.state = CircuitState::Open;
                    inner.opened_manually = false;
                    log_error(
                        LogCategory::Breaker,
                        &format!(
                            "Circuit breaker '{}' opened after {} failures",
                            self.name, inner.failure_count
                        ),
                    );
                }
                _ => {}
            }
            inner.state
        };
        self.mirror_to_flow_state(false, mirror);
    }

    fn mirror_to_flow_state(&self, success: bool, state: CircuitState) {
        if let Some(flow_state) = &self.flow_state {
            if let Some(stage) = FlowStage::from_key(&self.name) {
                flow_state.update_circuit_breaker(stage, success);
                flow_state.set_circuit_breaker_state(stage, state);
            }
        }
    }

    /// Execute a synchronous operation through the breaker.
    ///
    /// Classified stage errors count as failures; an open breaker rejects
    /// with [`FlowError::CircuitOpen`] without invoking the operation.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> std::result::Result<T, StageError>,
    {
        self.check_before_call()?;

        match f() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(FlowError::from(e))
            }
        }
    }

    /// Execute an async operation through the breaker
    pub async fn call_async<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, StageError>>,
    {
        self.check_before_call()?;

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(FlowError::from(e))
            }
        }
    }

    /// Record an outcome observed outside [`CircuitBreaker::call`], e.g. a
    /// timeout watcher completing the execution on the handler's behalf.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.on_success();
        } else {
            self.on_failure();
        }
    }

    /// Manually reset the breaker to closed
    pub fn reset(&self) {
        let mirror = {
            let mut inner = self.inner.lock();
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.last_failure_time = None;
            inner.opened_manually = false;
            inner.state
        };
        log_info(
            LogCategory::Breaker,
            &format!("Circuit breaker '{}' manually reset to closed", self.name),
        );
        if let Some(flow_state) = &self.flow_state {
            if let Some(stage) = FlowStage::from_key(&self.name) {
                flow_state.set_circuit_breaker_state(stage, mirror);
            }
        }
    }

    /// Manually force the breaker open. Marks the breaker as opened
    /// manually so status reads may later promote it to half-open.
    pub fn force_open(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = CircuitState::Open;
            inner.last_failure_time = Some(Utc::now());
            inner.opened_manually = true;
        }
        log_warn(
            LogCategory::Breaker,
            &format!("Circuit breaker '{}' manually forced open", self.name),
        );
        if let Some(flow_state) = &self.flow_state {
            if let Some(stage) = FlowStage::from_key(&self.name) {
                flow_state.set_circuit_breaker_state(stage, CircuitState::Open);
            }
        }
    }

    /// Detailed status block
    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();

        let success_rate = if inner.call_count > 0 {
            inner.success_count as f64 / inner.call_count as f64
        } else {
            0.0
        };

        let time_since_failure = inner
            .last_failure_time
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0);

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            total_calls: inner.call_count,
            total_successes: inner.success_count,
            total_failures: inner.failure_count_total,
            success_rate,
            time_since_failure_seconds: time_since_failure,
            recovery_timeout_seconds: self.recovery_timeout.as_secs(),
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
        }
    }
}

/// Circuit breaker bound to one flow stage.
///
/// Uses the conservative stage threshold and mirrors state changes into the
/// owning [`FlowControlState`] for centralized monitoring.
pub struct StageCircuitBreaker {
    breaker: CircuitBreaker,
    stage: FlowStage,
}

impl StageCircuitBreaker {
    pub fn new(stage: FlowStage, flow_state: Arc<FlowControlState>) -> Self {
        Self::with_settings(stage, flow_state, STAGE_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }

    pub fn with_settings(
        stage: FlowStage,
        flow_state: Arc<FlowControlState>,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        let breaker = CircuitBreaker::with_settings(
            stage.key(),
            failure_threshold,
            recovery_timeout,
            Some(flow_state.clone()),
        );

        // Adopt the flow state's view so a recovered run resumes with the
        // breaker posture it checkpointed with
        {
            let mut inner = breaker.inner.lock();
            if flow_state.is_circuit_breaker_open(stage) {
                inner.state = if flow_state.should_attempt_circuit_recovery(stage) {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                };
            }
        }

        Self { breaker, stage }
    }

    pub fn stage(&self) -> FlowStage {
        self.stage
    }
}

impl std::ops::Deref for StageCircuitBreaker {
    type Target = CircuitBreaker;

    fn deref(&self) -> &Self::Target {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::StageErrorKind;

    fn stage_err() -> StageError {
        StageError::new(StageErrorKind::ApiError, "backend unavailable")
    }

    #[test]
    fn test_closed_breaker_passes_calls() {
        let breaker = CircuitBreaker::new("test");
        let result: Result<u32> = breaker.call(|| Ok(42));
        assert_eq!(result.unwrap(), 42);
        assert!(breaker.is_closed());
        assert_eq!(breaker.status().total_successes, 1);
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let breaker =
            CircuitBreaker::with_settings("test", 2, Duration::from_secs(300), None);

        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });
        assert!(breaker.is_closed());

        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });
        assert!(breaker.is_open());

        // Open breaker fails fast without invoking the operation
        let mut invoked = false;
        let result: Result<()> = breaker.call(|| {
            invoked = true;
            Ok(())
        });
        assert!(matches!(result, Err(FlowError::CircuitOpen(_))));
        assert!(!invoked);
    }

    #[test]
    fn test_half_open_probe_after_recovery_window() {
        let breaker = CircuitBreaker::with_settings("test", 1, Duration::from_secs(0), None);
        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });

        // Zero-length recovery window: the next call is the probe
        let result: Result<u32> = breaker.call(|| Ok(7));
        assert_eq!(result.unwrap(), 7);
        assert!(breaker.is_closed());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_settings("test", 1, Duration::from_secs(0), None);
        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });
        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });
        // Probe failed, breaker is open again; force the inner clock so the
        // state read cannot promote
        let inner = breaker.inner.lock();
        assert_eq!(inner.state, CircuitState::Open);
    }

    #[test]
    fn test_force_open_promotes_on_read() {
        let breaker = CircuitBreaker::with_settings("test", 5, Duration::from_secs(0), None);
        breaker.force_open();
        // Recovery window elapsed (zero), manual open promotes on read
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_organic_open_does_not_promote_on_read() {
        let breaker = CircuitBreaker::with_settings("test", 1, Duration::from_secs(0), None);
        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });
        // Organically opened: reads keep reporting open even though the
        // window elapsed; only a call attempt probes
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_closes() {
        let breaker = CircuitBreaker::with_settings("test", 1, Duration::from_secs(300), None);
        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });
        assert!(breaker.is_open());
        breaker.reset();
        assert!(breaker.is_closed());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_stage_breaker_mirrors_into_flow_state() {
        let flow_state = Arc::new(FlowControlState::new());
        let breaker = StageCircuitBreaker::with_settings(
            FlowStage::StyleValidation,
            flow_state.clone(),
            2,
            Duration::from_secs(300),
        );

        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });
        let _ = breaker.call(|| -> std::result::Result<(), StageError> { Err(stage_err()) });

        assert!(breaker.is_open());
        assert_eq!(
            flow_state.circuit_breaker_state(FlowStage::StyleValidation),
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_async_call_success() {
        let breaker = CircuitBreaker::new("async_test");
        let result: Result<&str> = breaker.call_async(|| async { Ok("ok") }).await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(breaker.status().success_rate, 1.0);
    }
}
