//! Lock-free counters for the MQTT client and the REST caller
//!
//! Each [`MqttClient`](crate::transport::mqtt::MqttClient) owns one
//! [`ConnectionMetrics`] shared with its supervisor task. REST calls are
//! counted in the process-wide [`rest_metrics`] collector.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters for one MQTT client
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    handshakes_completed: AtomicU64,
    connection_failures: AtomicU64,
    reconnects_scheduled: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    pubacks_sent: AtomicU64,
    pings_sent: AtomicU64,
    best_effort_send_failures: AtomicU64,
    bytes_received: AtomicU64,
    connected_since: AtomicU64,
    last_message_at: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since.store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connection_lost();
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at.store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn puback_sent(&self) {
        self.pubacks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn best_effort_send_failed(&self) {
        self.best_effort_send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected_since = self.connected_since.load(Ordering::Relaxed);

        MetricsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            pubacks_sent: self.pubacks_sent.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            best_effort_send_failures: self.best_effort_send_failures.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connection_duration_seconds: if connected_since == 0 {
                0
            } else {
                now.saturating_sub(connected_since)
            },
            last_message_at: self.last_message_at.load(Ordering::Relaxed),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connected: bool,
    pub connection_attempts: u64,
    pub handshakes_completed: u64,
    pub connection_failures: u64,
    pub reconnects_scheduled: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub pubacks_sent: u64,
    pub pings_sent: u64,
    pub best_effort_send_failures: u64,
    pub bytes_received: u64,
    pub connection_duration_seconds: u64,
    /// Unix seconds, 0 if no message yet
    pub last_message_at: u64,
    pub timestamp: u64,
}

/// Global REST call counters
pub static REST_METRICS: Lazy<RestMetrics> = Lazy::new(RestMetrics::default);

pub fn rest_metrics() -> &'static RestMetrics {
    &REST_METRICS
}

#[derive(Debug, Default)]
pub struct RestMetrics {
    requests: AtomicU64,
    failures: AtomicU64,
}

impl RestMetrics {
    pub fn request_sent(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RestMetricsSnapshot {
        RestMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestMetricsSnapshot {
    pub requests: u64,
    pub failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
