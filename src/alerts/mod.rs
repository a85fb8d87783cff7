//! Alert Dispatcher: severity-routed fan-out with duplicate suppression.
//!
//! Webhook and email delivery are external collaborators per spec —
//! this module provides the routing/suppression/ring-buffer core plus an
//! [`AlertChannel`] extension point; callers wire in their own network
//! channels rather than this crate reaching for an HTTP client.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// An alert before it is stamped with dispatcher-owned fields ( "alerts
/// payload carries the alert fields plus id, timestamp, node").
#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: Severity,
    pub alert_type: String,
    pub title: String,
    pub message: String,
    pub metadata: Value,
    pub bypass_rate_limit: bool,
}

/// The fully-stamped alert as delivered to channels and retained in the
/// ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedAlert {
    pub id: Uuid,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub title: String,
    pub message: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
    pub node: String,
}

/// A delivery target for dispatched alerts. Implement this to add a
/// webhook, email, or other network sink outside this crate.
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    fn send(&self, alert: &DispatchedAlert);
}

/// Logs every alert via `tracing` at a level derived from severity.
pub struct LoggerChannel;

impl AlertChannel for LoggerChannel {
    fn name(&self) -> &str {
        "logger"
    }

    fn send(&self, alert: &DispatchedAlert) {
        match alert.severity {
            Severity::Critical | Severity::High => {
                tracing::error!(alert.id = %alert.id, alert.type = %alert.alert_type, "{}", alert.title);
            }
            Severity::Medium => {
                tracing::warn!(alert.id = %alert.id, alert.type = %alert.alert_type, "{}", alert.title);
            }
            Severity::Low => {
                tracing::info!(alert.id = %alert.id, alert.type = %alert.alert_type, "{}", alert.title);
            }
        }
    }
}

/// Publishes each alert onto the event bus's `alerts` and `alerts:{severity}`
/// topics.
pub struct EventBusChannel {
    bus: Arc<crate::event_bus::EventBus>,
}

impl EventBusChannel {
    pub fn new(bus: Arc<crate::event_bus::EventBus>) -> Self {
        Self { bus }
    }
}

impl AlertChannel for EventBusChannel {
    fn name(&self) -> &str {
        "event_bus"
    }

    fn send(&self, alert: &DispatchedAlert) {
        let payload = serde_json::to_value(alert).unwrap_or(Value::Null);
        self.bus.publish("alerts", payload.clone());
        self.bus.publish(&format!("alerts:{}", alert.severity), payload);
    }
}

/// Emits a `tracing` event shaped for metrics scraping, standing in for a
/// dedicated metrics channel without adding a metrics-client dependency.
pub struct MetricsChannel;

impl AlertChannel for MetricsChannel {
    fn name(&self) -> &str {
        "metrics"
    }

    fn send(&self, alert: &DispatchedAlert) {
        tracing::info!(
            target: "durable_flow::metrics",
            metric = "alerts_dispatched_total",
            value = 1,
            severity = %alert.severity,
            alert_type = %alert.alert_type,
            "alert dispatched"
        );
    }
}

#[derive(Debug, Clone)]
pub struct AlertDispatcherConfig {
    pub rate_limit: Duration,
    pub ring_buffer_size: usize,
}

impl Default for AlertDispatcherConfig {
    fn default() -> Self {
        Self {
            rate_limit: Duration::from_secs(60),
            ring_buffer_size: 1_000,
        }
    }
}

struct SuppressionEntry {
    last_sent: DateTime<Utc>,
}

pub struct AlertDispatcher {
    config: AlertDispatcherConfig,
    channels: Mutex<Vec<Arc<dyn AlertChannel>>>,
    suppression: Mutex<HashMap<String, SuppressionEntry>>,
    ring_buffer: Mutex<VecDeque<DispatchedAlert>>,
    node_id: String,
}

impl AlertDispatcher {
    pub fn new(config: AlertDispatcherConfig) -> Self {
        Self {
            config,
            channels: Mutex::new(Vec::new()),
            suppression: Mutex::new(HashMap::new()),
            ring_buffer: Mutex::new(VecDeque::new()),
            node_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string()),
        }
    }

    pub fn register_channel(&self, channel: Arc<dyn AlertChannel>) {
        self.channels.lock().push(channel);
    }

    /// Derive the duplicate-suppression key from `(type, severity, metadata
    /// minus timestamp/bypass)`.
    fn suppression_key(alert: &Alert) -> String {
        let mut metadata = alert.metadata.clone();
        if let Some(obj) = metadata.as_object_mut() {
            obj.remove("timestamp");
            obj.remove("bypass_rate_limit");
        }
        format!("{}:{}:{}", alert.alert_type, alert.severity, metadata)
    }

    /// Route `alert` to every registered channel, unless suppressed as a
    /// duplicate within `rate_limit`.
    pub fn send_alert(&self, alert: Alert) -> Option<Uuid> {
        let key = Self::suppression_key(&alert);
        if !alert.bypass_rate_limit {
            let mut suppression = self.suppression.lock();
            if let Some(entry) = suppression.get(&key) {
                let elapsed = Utc::now() - entry.last_sent;
                if elapsed.to_std().unwrap_or(Duration::ZERO) < self.config.rate_limit {
                    return None;
                }
            }
            suppression.insert(key, SuppressionEntry { last_sent: Utc::now() });
        }

        let dispatched = DispatchedAlert {
            id: Uuid::now_v7(),
            severity: alert.severity,
            alert_type: alert.alert_type,
            title: alert.title,
            message: alert.message,
            metadata: alert.metadata,
            timestamp: Utc::now(),
            node: self.node_id.clone(),
        };

        {
            let mut buffer = self.ring_buffer.lock();
            if buffer.len() >= self.config.ring_buffer_size {
                buffer.pop_front();
            }
            buffer.push_back(dispatched.clone());
        }

        for channel in self.channels.lock().iter() {
            channel.send(&dispatched);
        }

        Some(dispatched.id)
    }

    pub fn recent(&self, limit: usize) -> Vec<DispatchedAlert> {
        self.ring_buffer.lock().iter().rev().take(limit).cloned().collect()
    }
}
