//! Pure keepalive, reconnection and health logic for the MQTT client
//!
//! Nothing here touches a socket or a timer. The client task feeds in the
//! current time and phase and acts on the returned decisions.

use super::connection::{ConnectionPhase, ReconnectConfig};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// What to do on a keepalive tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveDecision {
    /// Monitor stopped or not connected
    Skip,
    SendPing,
    /// Nothing received for longer than twice the keepalive
    HeartbeatTimeout { silent_for: Duration },
}

/// PINGREQ scheduling and receive-staleness detection
#[derive(Debug, Clone)]
pub struct KeepaliveMonitor {
    ping_interval: Duration,
    heartbeat_timeout: Duration,
    last_activity: Instant,
    running: bool,
}

impl KeepaliveMonitor {
    pub fn new(ping_interval: Duration, heartbeat_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            heartbeat_timeout,
            last_activity: now,
            running: false,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.last_activity = now;
        debug!(interval = ?self.ping_interval, "Keepalive started");
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Any inbound byte counts as activity
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn tick(&self, now: Instant, phase: ConnectionPhase) -> KeepaliveDecision {
        if !self.running || phase != ConnectionPhase::Connected {
            return KeepaliveDecision::Skip;
        }

        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for > self.heartbeat_timeout {
            return KeepaliveDecision::HeartbeatTimeout { silent_for };
        }
        KeepaliveDecision::SendPing
    }
}

/// Decision result for a reconnect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then connect again
    Proceed { attempt: u32, delay: Duration },
    /// An attempt is already scheduled
    AlreadyScheduled,
    /// The client was stopped
    AbortShutdownRequested,
}

/// Exponential backoff with a capped attempt counter.
///
/// At most one attempt is pending at a time; [`schedule`](Self::schedule)
/// is idempotent until the pending attempt fires or is cancelled.
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    attempt: u32,
    pending: bool,
    reconnect_count: u32,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            pending: false,
            reconnect_count: 0,
        }
    }

    pub fn schedule(&mut self, should_run: bool) -> ReconnectionDecision {
        if !should_run {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if self.pending {
            return ReconnectionDecision::AlreadyScheduled;
        }

        let attempt = self.attempt;
        let delay = self.config.calculate_backoff_delay(attempt);
        self.attempt = (attempt + 1).min(self.config.max_attempt);
        self.pending = true;
        self.reconnect_count = self.reconnect_count.saturating_add(1);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        ReconnectionDecision::Proceed { attempt, delay }
    }

    /// The scheduled delay elapsed. Returns `false` if nothing was pending.
    pub fn fire(&mut self) -> bool {
        std::mem::replace(&mut self.pending, false)
    }

    pub fn cancel(&mut self) {
        self.pending = false;
    }

    /// Successful subscription
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Time since the last application message
    pub time_since_last_message: Option<Duration>,
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

/// Pure health calculations
pub struct HealthMonitor;

impl HealthMonitor {
    /// No telemetry for this long marks a connected client unhealthy
    pub const STALE_MESSAGE_AFTER: Duration = Duration::from_secs(300);

    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
        now: Instant,
    ) -> HealthMetrics {
        let uptime = connect_time.map(|t| now.saturating_duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.saturating_duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last)) => last < Self::STALE_MESSAGE_AFTER,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(now: Instant) -> KeepaliveMonitor {
        KeepaliveMonitor::new(Duration::from_secs(60), Duration::from_secs(240), now)
    }

    #[test]
    fn test_keepalive_skips_until_started_and_connected() {
        let now = Instant::now();
        let mut keepalive = monitor(now);
        assert_eq!(
            keepalive.tick(now, ConnectionPhase::Connected),
            KeepaliveDecision::Skip
        );

        keepalive.start(now);
        assert_eq!(
            keepalive.tick(now, ConnectionPhase::WaitSubAck),
            KeepaliveDecision::Skip
        );
        assert_eq!(
            keepalive.tick(now, ConnectionPhase::Connected),
            KeepaliveDecision::SendPing
        );

        keepalive.stop();
        assert_eq!(
            keepalive.tick(now, ConnectionPhase::Connected),
            KeepaliveDecision::Skip
        );
    }

    #[test]
    fn test_heartbeat_timeout_after_twice_keepalive() {
        let start = Instant::now();
        let mut keepalive = monitor(start);
        keepalive.start(start);

        let at_limit = start + Duration::from_secs(240);
        assert_eq!(
            keepalive.tick(at_limit, ConnectionPhase::Connected),
            KeepaliveDecision::SendPing
        );

        let past_limit = start + Duration::from_secs(241);
        assert_eq!(
            keepalive.tick(past_limit, ConnectionPhase::Connected),
            KeepaliveDecision::HeartbeatTimeout {
                silent_for: Duration::from_secs(241)
            }
        );
    }

    #[test]
    fn test_activity_refreshes_staleness_clock() {
        let start = Instant::now();
        let mut keepalive = monitor(start);
        keepalive.start(start);

        keepalive.record_activity(start + Duration::from_secs(200));
        assert_eq!(
            keepalive.tick(start + Duration::from_secs(400), ConnectionPhase::Connected),
            KeepaliveDecision::SendPing
        );
    }

    #[test]
    fn test_backoff_sequence_and_reset() {
        let mut scheduler = ReconnectScheduler::new(ReconnectConfig::default());
        let mut delays = Vec::new();
        for _ in 0..7 {
            match scheduler.schedule(true) {
                ReconnectionDecision::Proceed { delay, .. } => {
                    delays.push(delay.as_millis() as u64)
                }
                other => panic!("unexpected decision {other:?}"),
            }
            assert!(scheduler.fire());
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);

        scheduler.reset();
        assert_eq!(
            scheduler.schedule(true),
            ReconnectionDecision::Proceed {
                attempt: 0,
                delay: Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn test_attempt_counter_is_capped() {
        let mut scheduler = ReconnectScheduler::new(ReconnectConfig::default());
        for _ in 0..25 {
            scheduler.schedule(true);
            scheduler.fire();
        }
        assert_eq!(scheduler.attempt(), 10);
        assert_eq!(scheduler.reconnect_count(), 25);
    }

    #[test]
    fn test_schedule_is_idempotent_while_pending() {
        let mut scheduler = ReconnectScheduler::new(ReconnectConfig::default());
        assert!(matches!(
            scheduler.schedule(true),
            ReconnectionDecision::Proceed { attempt: 0, .. }
        ));
        assert_eq!(
            scheduler.schedule(true),
            ReconnectionDecision::AlreadyScheduled
        );
        assert_eq!(scheduler.attempt(), 1);

        scheduler.cancel();
        assert!(!scheduler.fire());
    }

    #[test]
    fn test_schedule_after_stop_aborts() {
        let mut scheduler = ReconnectScheduler::new(ReconnectConfig::default());
        assert_eq!(
            scheduler.schedule(false),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert!(!scheduler.is_pending());
        assert_eq!(scheduler.attempt(), 0);
    }

    #[test]
    fn test_calculate_health_metrics() {
        let now = Instant::now();
        let connected_at = now.checked_sub(Duration::from_secs(3600));
        let last_message = now.checked_sub(Duration::from_secs(60));

        let metrics = HealthMonitor::calculate_health_metrics(connected_at, last_message, 2, now);

        assert_eq!(metrics.uptime.is_some(), connected_at.is_some());
        assert_eq!(metrics.reconnect_count, 2);
        assert!(metrics.is_healthy);
    }

    #[test]
    fn test_determine_health_status() {
        let uptime = Some(Duration::from_secs(3600));
        assert!(HealthMonitor::determine_health_status(uptime, None));
        assert!(HealthMonitor::determine_health_status(
            uptime,
            Some(Duration::from_secs(60))
        ));
        assert!(!HealthMonitor::determine_health_status(
            uptime,
            Some(Duration::from_secs(400))
        ));
        assert!(!HealthMonitor::determine_health_status(None, None));
    }
}
