//! Impure I/O for the MQTT client
//!
//! [`MqttClient`] is the public handle. `start()` spawns one supervisor task
//! that owns the socket and drives everything else: connecting, feeding
//! bytes through the [`FrameAssembler`] into the [`Session`], applying the
//! resulting actions, the handshake timer, the keepalive interval and the
//! reconnect delay. Because that task is the only writer, frames are never
//! interleaved on the wire.

use super::codec::encode_ping_request;
use super::connection::{ClientOptions, ConnectionState, MqttError};
use super::framer::FrameAssembler;
use super::health_monitor::{
    HealthMetrics, HealthMonitor, KeepaliveDecision, KeepaliveMonitor, ReconnectScheduler,
    ReconnectionDecision,
};
use super::message_handler::{InboundMessage, MessageForwarder};
use super::session::{SendKind, Session, SessionAction};
use crate::error::sanitize_error_message;
use crate::observability::metrics::{ConnectionMetrics, MetricsSnapshot};
use crate::transport::{Connector, TcpConnector};
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn, Instrument};

const READ_BUFFER_SIZE: usize = 4096;
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Timestamps behind [`MqttClient::health_metrics`]
#[derive(Debug, Default)]
struct HealthState {
    connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
    reconnect_count: u32,
}

fn lock_health(health: &StdMutex<HealthState>) -> MutexGuard<'_, HealthState> {
    health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// MQTT 3.1.1 client for a single telemetry topic
pub struct MqttClient<C: Connector = TcpConnector> {
    options: ClientOptions,
    connector: Arc<C>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    supervisor_handle: Option<JoinHandle<()>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    metrics: Arc<ConnectionMetrics>,
    health: Arc<StdMutex<HealthState>>,
}

impl MqttClient<TcpConnector> {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_connector(options, TcpConnector)
    }
}

impl<C: Connector> MqttClient<C> {
    pub fn with_connector(options: ClientOptions, connector: C) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            connector: Arc::new(connector),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: None,
            supervisor_handle: None,
            message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
            metrics: Arc::new(ConnectionMetrics::new()),
            health: Arc::new(StdMutex::new(HealthState::default())),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Register the channel that receives every delivered message
    pub async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        self.message_forwarder.lock().await.set_sender(sender);
    }

    /// Spawn the supervisor task. Calling it on a running client does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("MQTT client already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            session: Session::new(self.options.topic.clone()),
            scheduler: ReconnectScheduler::new(self.options.reconnect.clone()),
            options: self.options.clone(),
            connector: Arc::clone(&self.connector),
            state_tx: Arc::clone(&self.state_tx),
            shutdown_rx,
            message_forwarder: Arc::clone(&self.message_forwarder),
            metrics: Arc::clone(&self.metrics),
            health: Arc::clone(&self.health),
        };

        info!(
            host = %self.options.host,
            port = self.options.port,
            topic = %self.options.topic,
            "Starting MQTT client"
        );
        self.shutdown_tx = Some(shutdown_tx);
        self.supervisor_handle = Some(tokio::spawn(supervisor.run()));
    }

    pub fn is_running(&self) -> bool {
        self.supervisor_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel all timers, close the socket and suppress further attempts
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        if let Some(mut handle) = self.supervisor_handle.take() {
            match tokio::time::timeout(STOP_GRACE_PERIOD, &mut handle).await {
                Ok(Ok(())) => debug!("Supervisor task stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Supervisor task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Supervisor task didn't stop in time, aborting");
                    handle.abort();
                }
            }
        }

        lock_health(&self.health).connected_at = None;
        self.metrics.connection_lost();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("MQTT client stopped");
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the client reaches `Connected`
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut state_rx = self.state_rx.clone();
        let reached = async {
            state_rx
                .wait_for(ConnectionState::is_connected)
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(timeout, reached).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttError::Stopped),
            Err(_) => Err(MqttError::WaitTimeout(timeout)),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let health = lock_health(&self.health);
        HealthMonitor::calculate_health_metrics(
            health.connected_at,
            health.last_message_at,
            health.reconnect_count,
            Instant::now(),
        )
    }
}

impl<C: Connector> Drop for MqttClient<C> {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        // No async in Drop; call stop() for a graceful shutdown
        if let Some(handle) = self.supervisor_handle.take() {
            handle.abort();
        }
    }
}

/// Resolves once shutdown is requested or the client handle is gone
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Returns `true` if the delay elapsed, `false` if shutdown interrupted it
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown_rx) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Per-connection resources, dropped with the socket
struct ConnectionIo<W> {
    writer: W,
    handshake_deadline: Option<Instant>,
    keepalive: KeepaliveMonitor,
    ping_timer: Option<Interval>,
}

struct Supervisor<C: Connector> {
    options: ClientOptions,
    connector: Arc<C>,
    session: Session,
    scheduler: ReconnectScheduler,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    metrics: Arc<ConnectionMetrics>,
    health: Arc<StdMutex<HealthState>>,
}

impl<C: Connector> Supervisor<C> {
    fn should_run(&self) -> bool {
        !*self.shutdown_rx.borrow()
    }

    async fn run(mut self) {
        let mut attempt = 0u64;
        while self.should_run() {
            attempt += 1;
            self.metrics.connection_attempt();
            self.state_tx.send_replace(ConnectionState::Connecting);

            let span = crate::mqtt_span!(
                host = %self.options.host,
                port = self.options.port,
                attempt
            );
            let outcome = self.run_connection().instrument(span).await;

            self.session.reset();
            lock_health(&self.health).connected_at = None;
            self.metrics.connection_lost();

            let error = match outcome {
                Ok(()) => break,
                Err(error) => error,
            };
            self.metrics.connection_failed();

            match self.scheduler.schedule(self.should_run()) {
                ReconnectionDecision::Proceed {
                    attempt: backoff_attempt,
                    delay,
                } => {
                    let reason = sanitize_error_message(&error.to_string());
                    if error.is_config_error() {
                        error!(error = %reason, "MQTT client misconfigured");
                    } else {
                        warn!(
                            error = %reason,
                            backoff_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "MQTT connection failed, reconnecting"
                        );
                    }
                    self.metrics.reconnect_scheduled();
                    lock_health(&self.health).reconnect_count = self.scheduler.reconnect_count();
                    self.state_tx.send_replace(ConnectionState::Error {
                        reason,
                        retry_in: delay,
                    });

                    let elapsed = interruptible_sleep(&mut self.shutdown_rx, delay).await;
                    self.scheduler.fire();
                    if !elapsed {
                        break;
                    }
                }
                ReconnectionDecision::AlreadyScheduled => {
                    debug!("Reconnect already pending");
                }
                ReconnectionDecision::AbortShutdownRequested => break,
            }
        }

        self.scheduler.cancel();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("MQTT supervisor stopped");
    }

    /// One connection from socket open to teardown. `Ok` only on shutdown.
    async fn run_connection(&mut self) -> Result<(), MqttError> {
        self.options.validate()?;
        let credentials = self.options.credentials.resolve()?;

        let host = self.options.host.trim().to_string();
        let port = self.options.port;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let connect = self
            .connector
            .connect(&host, port, self.options.connect_timeout);
        let stream = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => return Ok(()),
            result = connect => result.map_err(|source| MqttError::ConnectionFailed {
                host: host.clone(),
                port,
                source,
            })?,
        };
        debug!("Socket connected");

        let (mut reader, writer) = tokio::io::split(stream);
        let mut io = ConnectionIo {
            writer,
            handshake_deadline: None,
            keepalive: KeepaliveMonitor::new(
                self.options.ping_interval(),
                self.options.heartbeat_timeout(),
                Instant::now(),
            ),
            ping_timer: None,
        };
        let mut assembler = FrameAssembler::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let actions = self
            .session
            .begin(&credentials, self.options.keep_alive_secs)?;
        self.apply(actions, &mut io).await?;

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    debug!("Shutdown requested, closing connection");
                    return Ok(());
                }
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(MqttError::ConnectionClosed);
                    }
                    io.keepalive.record_activity(Instant::now());
                    self.metrics.bytes_received(n);
                    assembler.extend(&buf[..n]);

                    while let Some(frame) = assembler.next_frame()? {
                        trace!(
                            target: "mqtt_transport",
                            packet_type = frame.packet_type(),
                            remaining_length = frame.remaining_length,
                            "Frame received"
                        );
                        let actions = self.session.handle_frame(&frame)?;
                        self.apply(actions, &mut io).await?;
                    }
                }
                _ = sleep_until_deadline(io.handshake_deadline) => {
                    io.handshake_deadline = None;
                    if let Some(error) = self.session.handshake_timed_out(self.options.handshake_timeout) {
                        return Err(error);
                    }
                }
                _ = next_tick(&mut io.ping_timer) => {
                    match io.keepalive.tick(Instant::now(), self.session.phase()) {
                        KeepaliveDecision::Skip => {}
                        KeepaliveDecision::SendPing => {
                            if self.send_best_effort(&mut io.writer, encode_ping_request(), "PINGREQ").await {
                                self.metrics.ping_sent();
                            }
                        }
                        KeepaliveDecision::HeartbeatTimeout { silent_for } => {
                            return Err(MqttError::HeartbeatTimeout(silent_for));
                        }
                    }
                }
            }
        }
    }

    async fn apply<W: AsyncWrite + Unpin>(
        &mut self,
        actions: Vec<SessionAction>,
        io: &mut ConnectionIo<W>,
    ) -> Result<(), MqttError> {
        for action in actions {
            match action {
                SessionAction::Send {
                    packet,
                    kind: SendKind::Handshake,
                    label,
                } => {
                    write_packet(&mut io.writer, &packet).await?;
                    trace!(target: "mqtt_transport", packet = label, "Sent");
                }
                SessionAction::Send {
                    packet,
                    kind: SendKind::BestEffort,
                    label,
                } => {
                    if self.send_best_effort(&mut io.writer, packet, label).await
                        && label == "PUBACK"
                    {
                        self.metrics.puback_sent();
                    }
                }
                SessionAction::ArmHandshakeTimer => {
                    io.handshake_deadline =
                        Some(Instant::now() + self.options.handshake_timeout);
                }
                SessionAction::ClearHandshakeTimer => io.handshake_deadline = None,
                SessionAction::Subscribed => {
                    let now = Instant::now();
                    self.scheduler.reset();
                    io.keepalive.start(now);

                    let period = io.keepalive.ping_interval();
                    let mut interval =
                        tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    io.ping_timer = Some(interval);

                    lock_health(&self.health).connected_at = Some(now);
                    self.metrics.handshake_completed();
                    self.state_tx.send_replace(ConnectionState::Connected);
                    info!(topic = %self.options.topic, "MQTT client connected");
                }
                SessionAction::Deliver(message) => {
                    self.metrics.message_received();
                    lock_health(&self.health).last_message_at = Some(Instant::now());
                    debug!(
                        topic = %message.topic,
                        bytes = message.payload.len(),
                        "Message received"
                    );

                    let delivered = self.message_forwarder.lock().await.forward(message);
                    if !delivered {
                        self.metrics.message_dropped();
                    }
                }
            }
        }
        Ok(())
    }

    /// Failure is logged and counted, never fatal
    async fn send_best_effort<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        packet: Bytes,
        label: &'static str,
    ) -> bool {
        match write_packet(writer, &packet).await {
            Ok(()) => {
                trace!(target: "mqtt_transport", packet = label, "Sent");
                true
            }
            Err(e) => {
                warn!(packet = label, error = %e, "Best-effort send failed");
                self.metrics.best_effort_send_failed();
                false
            }
        }
    }
}

async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &[u8]) -> std::io::Result<()> {
    writer.write_all(packet).await?;
    writer.flush().await
}
