//! # Alert Manager - Threshold Alerts and Notification Dispatch
//!
//! Rule-driven alerting over the KPI stream. Each rule owns at most one
//! active alert at a time; repeated breaches escalate the alert (even while
//! the notification cooldown suppresses dispatch) and promote its severity
//! to critical once the escalation threshold is reached. Notification
//! dispatch is scheduled on a worker and never blocks the recording path.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::metrics::{KpiType, MetricsObserver};
use crate::{FlowError, Result};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Alert lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
    Suppressed,
    Escalated,
}

/// Threshold comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    LessThan,
    Equals,
}

/// Definition of an alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub kpi_type: KpiType,
    pub threshold: f64,
    pub comparison: Comparison,
    pub severity: AlertSeverity,
    pub description: String,
    pub enabled: bool,
    /// Minimum minutes between notification dispatches
    pub cooldown_minutes: i64,
    /// Breach count before escalation
    pub escalation_threshold: u32,
    pub auto_resolve: bool,
    pub tags: HashMap<String, String>,
}

impl AlertRule {
    pub fn new(
        id: &str,
        kpi_type: KpiType,
        threshold: f64,
        comparison: Comparison,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: id.replace('_', " "),
            kpi_type,
            threshold,
            comparison,
            severity,
            description: String::new(),
            enabled: true,
            cooldown_minutes: 15,
            escalation_threshold: 3,
            auto_resolve: true,
            tags: HashMap::new(),
        }
    }
}

/// Individual alert instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub kpi_type: KpiType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub escalation_count: u32,
    pub notification_count: u32,
}

/// Notification delivery channel
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send_notification(
        &self,
        alert: &Alert,
        context: &HashMap<String, String>,
    ) -> Result<()>;

    /// Channel health probe
    fn test_connection(&self) -> bool;

    fn name(&self) -> &str;
}

/// Console/logging notification channel
pub struct ConsoleNotificationChannel;

#[async_trait]
impl NotificationChannel for ConsoleNotificationChannel {
    async fn send_notification(
        &self,
        alert: &Alert,
        _context: &HashMap<String, String>,
    ) -> Result<()> {
        let message = format!(
            "ALERT [{}] {} (value: {}, threshold: {})",
            alert.severity, alert.message, alert.value, alert.threshold
        );
        match alert.severity {
            AlertSeverity::Low => log_info(LogCategory::Alert, &message),
            AlertSeverity::Medium => log_warn(LogCategory::Alert, &message),
            AlertSeverity::High | AlertSeverity::Critical => {
                log_error(LogCategory::Alert, &message)
            }
        }
        Ok(())
    }

    fn test_connection(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Webhook notification channel (Slack, Discord, generic JSON receivers)
pub struct WebhookNotificationChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl WebhookNotificationChannel {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn build_payload(alert: &Alert, context: &HashMap<String, String>) -> serde_json::Value {
        serde_json::json!({
            "alert_id": alert.id,
            "severity": alert.severity,
            "status": alert.status,
            "kpi": alert.kpi_type,
            "message": alert.message,
            "value": alert.value,
            "threshold": alert.threshold,
            "escalation_count": alert.escalation_count,
            "created_at": alert.created_at,
            "context": context,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotificationChannel {
    async fn send_notification(
        &self,
        alert: &Alert,
        context: &HashMap<String, String>,
    ) -> Result<()> {
        let payload = Self::build_payload(alert, context);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FlowError::Notification(format!("webhook send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FlowError::Notification(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn test_connection(&self) -> bool {
        !self.webhook_url.is_empty()
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Mail notification channel. The stack carries no SMTP client, so delivery
/// goes through an HTTP mail gateway that accepts a JSON envelope.
pub struct MailGatewayNotificationChannel {
    gateway_url: String,
    recipients: Vec<String>,
    client: reqwest::Client,
}

impl MailGatewayNotificationChannel {
    pub fn new(gateway_url: &str, recipients: Vec<String>) -> Self {
        Self {
            gateway_url: gateway_url.to_string(),
            recipients,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl NotificationChannel for MailGatewayNotificationChannel {
    async fn send_notification(
        &self,
        alert: &Alert,
        context: &HashMap<String, String>,
    ) -> Result<()> {
        let subject = format!("[{}] {}", alert.severity, alert.message);
        let body = serde_json::json!({
            "to": self.recipients,
            "subject": subject,
            "body": {
                "kpi": alert.kpi_type,
                "value": alert.value,
                "threshold": alert.threshold,
                "status": alert.status,
                "escalation_count": alert.escalation_count,
                "context": context,
            },
        });

        let response = self
            .client
            .post(&self.gateway_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FlowError::Notification(format!("mail gateway send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FlowError::Notification(format!(
                "mail gateway returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn test_connection(&self) -> bool {
        !self.gateway_url.is_empty() && !self.recipients.is_empty()
    }

    fn name(&self) -> &str {
        "mail_gateway"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertStats {
    pub total_alerts_created: u64,
    pub total_alerts_resolved: u64,
    pub total_notifications_sent: u64,
    pub notification_failures: u64,
}

struct AlertInner {
    rules: HashMap<String, AlertRule>,
    active_alerts: HashMap<String, Alert>,
    alert_history: Vec<Alert>,
    stats: AlertStats,
}

/// Alert manager: evaluates rules against the KPI stream and manages the
/// alert lifecycle. Plugs into [`crate::metrics::FlowMetrics`] as an
/// observer.
pub struct AlertManager {
    inner: Mutex<AlertInner>,
    channels: Mutex<Vec<Arc<dyn NotificationChannel>>>,
    /// Last dispatch epoch-seconds per rule, for cooldown
    last_alert_times: DashMap<String, f64>,
    /// (sent, failed) counters updated by async dispatch workers
    notification_counters: Arc<Mutex<(u64, u64)>>,
    context: HashMap<String, String>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AlertInner {
                rules: HashMap::new(),
                active_alerts: HashMap::new(),
                alert_history: Vec::new(),
                stats: AlertStats::default(),
            }),
            channels: Mutex::new(Vec::new()),
            last_alert_times: DashMap::new(),
            notification_counters: Arc::new(Mutex::new((0, 0))),
            context: HashMap::from([
                ("system_name".to_string(), "Content Flow Engine".to_string()),
                ("environment".to_string(), "production".to_string()),
            ]),
        }
    }

    /// Manager pre-loaded with the stock resource and error-rate rules
    pub fn with_default_rules() -> Self {
        let manager = Self::new();
        manager.add_rule(AlertRule::new(
            "high_cpu_usage",
            KpiType::CpuUsage,
            80.0,
            Comparison::GreaterThan,
            AlertSeverity::High,
        ));
        manager.add_rule(AlertRule::new(
            "high_memory_usage",
            KpiType::MemoryUsage,
            500.0,
            Comparison::GreaterThan,
            AlertSeverity::Medium,
        ));
        manager.add_rule(AlertRule::new(
            "high_error_rate",
            KpiType::ErrorRate,
            10.0,
            Comparison::GreaterThan,
            AlertSeverity::High,
        ));
        manager
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.inner.lock().rules.insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.inner.lock().rules.remove(rule_id).is_some()
    }

    pub fn add_notification_channel(&self, channel: Arc<dyn NotificationChannel>) {
        self.channels.lock().push(channel);
    }

    fn evaluate_rule_condition(rule: &AlertRule, value: f64) -> bool {
        match rule.comparison {
            Comparison::GreaterThan => value > rule.threshold,
            Comparison::LessThan => value < rule.threshold,
            Comparison::Equals => (value - rule.threshold).abs() < 0.001,
        }
    }

    fn build_alert_message(rule: &AlertRule, value: f64) -> String {
        let comparison_text = match rule.comparison {
            Comparison::GreaterThan => "exceeded",
            Comparison::LessThan => "below",
            Comparison::Equals => "equals",
        };
        format!(
            "{}: {} {} threshold ({} vs {})",
            rule.name,
            rule.kpi_type.key().replace('_', " "),
            comparison_text,
            value,
            rule.threshold
        )
    }

    /// Evaluate all applicable rules for a breached KPI value. Called by the
    /// metrics collector's observer hook on every record.
    pub fn evaluate(&self, kpi_type: KpiType, value: f64, metadata: &HashMap<String, serde_json::Value>) {
        let applicable: Vec<AlertRule> = {
            let inner = self.inner.lock();
            inner
                .rules
                .values()
                .filter(|rule| {
                    rule.kpi_type == kpi_type
                        && rule.enabled
                        && Self::evaluate_rule_condition(rule, value)
                })
                .cloned()
                .collect()
        };

        for rule in applicable {
            self.process_rule_trigger(&rule, value, metadata);
        }
    }

    fn process_rule_trigger(
        &self,
        rule: &AlertRule,
        value: f64,
        metadata: &HashMap<String, serde_json::Value>,
    ) {
        let now_epoch = Utc::now().timestamp_millis() as f64 / 1000.0;
        let cooldown_key = format!("{}_{}", rule.id, rule.kpi_type.key());

        // Do not early-return on cooldown: escalation still counts, only
        // value updates and dispatch are suppressed
        let last_dispatch = self
            .last_alert_times
            .get(&cooldown_key)
            .map(|t| *t)
            .unwrap_or(0.0);
        let in_cooldown = (now_epoch - last_dispatch) < (rule.cooldown_minutes * 60) as f64;

        let alert_to_send = {
            let mut inner = self.inner.lock();

            let existing_active = inner
                .active_alerts
                .get(&rule.id)
                .map(|a| a.status == AlertStatus::Active || a.status == AlertStatus::Escalated)
                .unwrap_or(false);

            let alert = if existing_active {
                let alert = inner.active_alerts.get_mut(&rule.id).unwrap();
                if !in_cooldown {
                    alert.value = value;
                    alert.updated_at = Utc::now();
                }
                alert.escalation_count += 1;

                if alert.escalation_count >= rule.escalation_threshold {
                    alert.status = AlertStatus::Escalated;
                    alert.severity = AlertSeverity::Critical;
                }
                alert.clone()
            } else {
                let alert = Alert {
                    id: rule.id.clone(),
                    rule_id: rule.id.clone(),
                    kpi_type: rule.kpi_type,
                    severity: rule.severity,
                    status: AlertStatus::Active,
                    message: Self::build_alert_message(rule, value),
                    value,
                    threshold: rule.threshold,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                    resolved_at: None,
                    metadata: metadata.clone(),
                    escalation_count: 0,
                    notification_count: 0,
                };
                inner.active_alerts.insert(rule.id.clone(), alert.clone());
                inner.stats.total_alerts_created += 1;
                alert
            };

            if in_cooldown {
                None
            } else {
                Some(alert)
            }
        };

        if let Some(alert) = alert_to_send {
            self.last_alert_times.insert(cooldown_key, now_epoch);
            self.dispatch_notifications(alert);
        }
    }

    /// Schedule notification dispatch without blocking the recording path.
    /// Uses the current tokio runtime when one exists, otherwise an ad-hoc
    /// worker thread with its own runtime.
    fn dispatch_notifications(&self, alert: Alert) {
        let channels: Vec<Arc<dyn NotificationChannel>> = self.channels.lock().clone();
        if channels.is_empty() {
            return;
        }
        let context = self.context.clone();
        let counters = self.notification_counters.clone();

        let task = async move {
            let results = futures::future::join_all(
                channels
                    .iter()
                    .map(|channel| channel.send_notification(&alert, &context)),
            )
            .await;

            let mut successes = 0u64;
            let mut failures = 0u64;
            for (channel, result) in channels.iter().zip(results) {
                match result {
                    Ok(()) => successes += 1,
                    Err(e) => {
                        failures += 1;
                        log_error(
                            LogCategory::Alert,
                            &format!("Notification channel '{}' error: {e}", channel.name()),
                        );
                    }
                }
            }
            {
                let mut guard = counters.lock();
                guard.0 += successes;
                guard.1 += failures;
            }
            log_info(
                LogCategory::Alert,
                &format!(
                    "Dispatched {successes} notifications for alert {} ({failures} failed)",
                    alert.id
                ),
            );
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => {
                std::thread::spawn(move || {
                    if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        runtime.block_on(task);
                    }
                });
            }
        }
    }

    /// Manually resolve an alert; moves it from active to history
    pub fn resolve_alert(&self, alert_id: &str, resolution_message: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some(mut alert) = inner.active_alerts.remove(alert_id) {
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(Utc::now());
            alert.updated_at = Utc::now();
            if !resolution_message.is_empty() {
                alert.metadata.insert(
                    "resolution_message".to_string(),
                    serde_json::Value::from(resolution_message),
                );
            }
            inner.alert_history.push(alert);
            inner.stats.total_alerts_resolved += 1;
            log_info(
                LogCategory::Alert,
                &format!("Manually resolved alert: {alert_id}"),
            );
            true
        } else {
            false
        }
    }

    /// Resolve active alerts for a KPI whose rule condition no longer holds
    pub fn auto_resolve_alerts(&self, kpi_type: KpiType, current_value: f64) -> usize {
        let to_resolve: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .active_alerts
                .values()
                .filter(|alert| {
                    alert.kpi_type == kpi_type && alert.status == AlertStatus::Active
                })
                .filter(|alert| {
                    inner
                        .rules
                        .get(&alert.rule_id)
                        .map(|rule| {
                            rule.auto_resolve
                                && !Self::evaluate_rule_condition(rule, current_value)
                        })
                        .unwrap_or(false)
                })
                .map(|alert| alert.id.clone())
                .collect()
        };

        let mut resolved = 0;
        for alert_id in to_resolve {
            if self.resolve_alert(&alert_id, "Auto-resolved: condition cleared") {
                resolved += 1;
            }
        }
        resolved
    }

    /// Mark an alert suppressed for a duration; it stops counting as active
    pub fn suppress_alert(&self, alert_id: &str, duration_minutes: i64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(alert) = inner.active_alerts.get_mut(alert_id) {
            alert.status = AlertStatus::Suppressed;
            alert.updated_at = Utc::now();
            alert.metadata.insert(
                "suppressed_until".to_string(),
                serde_json::Value::from(
                    (Utc::now() + ChronoDuration::minutes(duration_minutes)).to_rfc3339(),
                ),
            );
            true
        } else {
            false
        }
    }

    pub fn get_active_alerts(&self, severity: Option<AlertSeverity>) -> Vec<Alert> {
        let inner = self.inner.lock();
        let mut alerts: Vec<Alert> = inner
            .active_alerts
            .values()
            .filter(|a| severity.map(|s| a.severity == s).unwrap_or(true))
            .cloned()
            .collect();
        // Most severe first, newest within a severity
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.created_at.cmp(&a.created_at))
        });
        alerts
    }

    pub fn get_alert_history(&self, limit: usize) -> Vec<Alert> {
        let inner = self.inner.lock();
        inner
            .alert_history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_alert_statistics(&self) -> AlertStats {
        let mut stats = self.inner.lock().stats.clone();
        let guard = self.notification_counters.lock();
        stats.total_notifications_sent += guard.0;
        stats.notification_failures += guard.1;
        stats
    }

    /// Probe every registered channel
    pub fn test_notification_channels(&self) -> HashMap<String, bool> {
        self.channels
            .lock()
            .iter()
            .map(|c| (c.name().to_string(), c.test_connection()))
            .collect()
    }

    /// Trim history by size and age; returns removed count
    pub fn cleanup_old_alerts(&self, max_history_size: usize, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let mut inner = self.inner.lock();
        let before = inner.alert_history.len();

        inner.alert_history.retain(|a| a.created_at >= cutoff);
        if inner.alert_history.len() > max_history_size {
            let drop_count = inner.alert_history.len() - max_history_size;
            inner.alert_history.drain(0..drop_count);
        }

        before - inner.alert_history.len()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsObserver for AlertManager {
    fn on_threshold_exceeded(
        &self,
        kpi_type: KpiType,
        value: f64,
        _threshold: f64,
        metadata: &HashMap<String, serde_json::Value>,
    ) {
        self.evaluate(kpi_type, value, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_rate_rule() -> AlertRule {
        AlertRule::new(
            "test_error_rate",
            KpiType::ErrorRate,
            10.0,
            Comparison::GreaterThan,
            AlertSeverity::High,
        )
    }

    #[test]
    fn test_first_breach_creates_single_active_alert() {
        let manager = AlertManager::new();
        manager.add_rule(error_rate_rule());

        manager.evaluate(KpiType::ErrorRate, 25.0, &HashMap::new());

        let active = manager.get_active_alerts(None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, AlertStatus::Active);
        assert_eq!(active[0].value, 25.0);

        // Repeated breach keeps a single alert per rule
        manager.evaluate(KpiType::ErrorRate, 30.0, &HashMap::new());
        assert_eq!(manager.get_active_alerts(None).len(), 1);
    }

    #[test]
    fn test_escalation_during_cooldown() {
        let manager = AlertManager::new();
        let mut rule = error_rate_rule();
        rule.escalation_threshold = 3;
        manager.add_rule(rule);

        // First breach creates the alert and starts the cooldown
        manager.evaluate(KpiType::ErrorRate, 20.0, &HashMap::new());
        // Cooldown is active, escalation still counts
        manager.evaluate(KpiType::ErrorRate, 21.0, &HashMap::new());
        manager.evaluate(KpiType::ErrorRate, 22.0, &HashMap::new());
        manager.evaluate(KpiType::ErrorRate, 23.0, &HashMap::new());

        let active = manager.get_active_alerts(None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, AlertStatus::Escalated);
        assert_eq!(active[0].severity, AlertSeverity::Critical);
        assert!(active[0].escalation_count >= 3);
        // Value updates were suppressed by the cooldown
        assert_eq!(active[0].value, 20.0);
    }

    #[test]
    fn test_condition_below_threshold_does_not_trigger() {
        let manager = AlertManager::new();
        manager.add_rule(error_rate_rule());
        manager.evaluate(KpiType::ErrorRate, 5.0, &HashMap::new());
        assert!(manager.get_active_alerts(None).is_empty());
    }

    #[test]
    fn test_auto_resolve_when_condition_clears() {
        let manager = AlertManager::new();
        manager.add_rule(error_rate_rule());
        manager.evaluate(KpiType::ErrorRate, 25.0, &HashMap::new());
        assert_eq!(manager.get_active_alerts(None).len(), 1);

        let resolved = manager.auto_resolve_alerts(KpiType::ErrorRate, 2.0);
        assert_eq!(resolved, 1);
        assert!(manager.get_active_alerts(None).is_empty());
        assert_eq!(manager.get_alert_history(10).len(), 1);
        assert_eq!(manager.get_alert_history(10)[0].status, AlertStatus::Resolved);
    }

    #[test]
    fn test_manual_resolution_moves_to_history() {
        let manager = AlertManager::new();
        manager.add_rule(error_rate_rule());
        manager.evaluate(KpiType::ErrorRate, 25.0, &HashMap::new());

        assert!(manager.resolve_alert("test_error_rate", "operator ack"));
        assert!(manager.get_active_alerts(None).is_empty());

        let history = manager.get_alert_history(10);
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved_at.is_some());
    }

    #[test]
    fn test_suppression() {
        let manager = AlertManager::new();
        manager.add_rule(error_rate_rule());
        manager.evaluate(KpiType::ErrorRate, 25.0, &HashMap::new());

        assert!(manager.suppress_alert("test_error_rate", 60));
        let inner_alerts = manager.get_active_alerts(None);
        // Suppressed alerts remain tracked but not active
        assert!(inner_alerts
            .iter()
            .all(|a| a.status == AlertStatus::Suppressed));
    }

    #[test]
    fn test_less_than_comparison() {
        let manager = AlertManager::new();
        manager.add_rule(AlertRule::new(
            "low_success_rate",
            KpiType::SuccessRate,
            90.0,
            Comparison::LessThan,
            AlertSeverity::Medium,
        ));

        manager.evaluate(KpiType::SuccessRate, 95.0, &HashMap::new());
        assert!(manager.get_active_alerts(None).is_empty());

        manager.evaluate(KpiType::SuccessRate, 60.0, &HashMap::new());
        assert_eq!(manager.get_active_alerts(None).len(), 1);
    }

    #[test]
    fn test_cleanup_bounds_history() {
        let manager = AlertManager::new();
        manager.add_rule(error_rate_rule());
        for i in 0..5 {
            manager.evaluate(KpiType::ErrorRate, 20.0 + i as f64, &HashMap::new());
            manager.resolve_alert("test_error_rate", "cycled");
        }
        assert_eq!(manager.get_alert_history(100).len(), 5);

        let removed = manager.cleanup_old_alerts(2, 30);
        assert_eq!(removed, 3);
        assert_eq!(manager.get_alert_history(100).len(), 2);
    }

    #[tokio::test]
    async fn test_console_channel_dispatch() {
        let manager = AlertManager::new();
        manager.add_rule(error_rate_rule());
        manager.add_notification_channel(Arc::new(ConsoleNotificationChannel));

        let probes = manager.test_notification_channels();
        assert_eq!(probes.get("console"), Some(&true));

        manager.evaluate(KpiType::ErrorRate, 25.0, &HashMap::new());
        // Dispatch is async; give the worker a moment
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(manager.get_active_alerts(None).len(), 1);
    }
}
