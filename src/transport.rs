//! Broker connection lifecycle.
//!
//! One background worker owns the rumqttc event loop and drives the whole
//! connection state machine:
//!
//! ```text
//! Disconnected --connect--> Connecting --handshake ok--> Connected
//! Connected --network loss--> Reconnecting --handshake ok--> Connected
//! Connecting/Reconnecting --fatal error--> Failed
//! any state --disconnect--> Disconnected
//! ```
//!
//! Transient failures are retried indefinitely with exponential backoff and
//! uniform jitter; fatal failures (credential or protocol refusal) park the
//! worker until the caller issues a fresh connect. Every successful
//! handshake replays the desired subscription set, and inbound publishes
//! land in the shared ring buffer. Packet ids of outgoing publishes and
//! broker acknowledgments are forwarded to the dispatch worker for
//! correlation.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::InboundBuffer;
use crate::dispatch::PublishSink;
use crate::error::{ConnectError, RequestError};
use crate::message::{InboundMessage, QosLevel};
use crate::session::{SessionManager, SubscribeSink};

/// Connection state as seen by consumers of `status()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Snapshot of the connection, broadcast over a watch channel.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<ConnectError>,
    pub retry_count: u32,
    pub broker: String,
    pub client_id: String,
}

impl ConnectionStatus {
    pub fn new(broker: impl Into<String>, client_id: impl Into<String>) -> Self {
        ConnectionStatus {
            state: ConnectionState::Disconnected,
            last_error: None,
            retry_count: 0,
            broker: broker.into(),
            client_id: client_id.into(),
        }
    }
}

/// Control requests from the facade to the transport worker.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    Connect,
    Disconnect,
}

/// Exponential backoff with uniform jitter.
///
/// The undelayed base doubles per attempt up to `max`; the returned delay
/// is drawn uniformly from the upper half of the base to avoid reconnect
/// stampedes without collapsing the delay to zero.
#[derive(Debug)]
pub(crate) struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl BackoffPolicy {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        BackoffPolicy { initial, max, next: initial }
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.initial;
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(self.max);
        let base_ms = base.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(base_ms / 2..=base_ms.max(1));
        Duration::from_millis(jittered)
    }
}

/// Map a rumqttc connection error onto the bridge's error kinds.
pub(crate) fn classify_connection_error(error: &ConnectionError) -> ConnectError {
    match error {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized
            | ConnectReturnCode::BadClientId => ConnectError::Refused(format!("{code:?}")),
            ConnectReturnCode::RefusedProtocolVersion => {
                ConnectError::ProtocolViolation("broker refused protocol version".into())
            }
            code => ConnectError::Network(format!("broker unavailable: {code:?}")),
        },
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => ConnectError::Timeout,
        ConnectionError::Io(e) => ConnectError::Network(e.to_string()),
        other => ConnectError::Network(other.to_string()),
    }
}

/// Background worker owning the broker connection.
pub(crate) struct TransportConnector {
    pub(crate) client: AsyncClient,
    pub(crate) eventloop: EventLoop,
    pub(crate) commands: mpsc::Receiver<LinkCommand>,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) session: std::sync::Arc<SessionManager>,
    pub(crate) buffer: InboundBuffer,
    pub(crate) sent_tx: mpsc::Sender<u16>,
    pub(crate) ack_tx: mpsc::Sender<u16>,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) cancel: CancellationToken,
}

impl TransportConnector {
    pub(crate) async fn run(mut self) {
        info!(broker = %self.status.borrow().broker, "transport connector started");
        'idle: loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.commands.recv() => match next {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                // The worker also parks here after a fatal handshake
                // error; a disconnect must still leave the published
                // state at Disconnected.
                LinkCommand::Disconnect => {
                    self.update(|s| {
                        s.state = ConnectionState::Disconnected;
                        s.retry_count = 0;
                    });
                    continue;
                }
                LinkCommand::Connect => {}
            }

            self.update(|s| {
                s.state = ConnectionState::Connecting;
                s.last_error = None;
                s.retry_count = 0;
            });
            self.backoff.reset();
            let mut retry_count: u32 = 0;

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.drain_disconnect().await;
                        break 'idle;
                    }
                    next = self.commands.recv() => match next {
                        None => {
                            self.drain_disconnect().await;
                            break 'idle;
                        }
                        Some(LinkCommand::Disconnect) => {
                            self.drain_disconnect().await;
                            self.update(|s| {
                                s.state = ConnectionState::Disconnected;
                                s.retry_count = 0;
                            });
                            info!("disconnected from broker");
                            continue 'idle;
                        }
                        // Connect while connecting/connected is a no-op.
                        Some(LinkCommand::Connect) => {}
                    },
                    event = self.eventloop.poll() => match event {
                        Ok(event) => {
                            retry_count = 0;
                            self.handle_event(event).await;
                        }
                        Err(e) => {
                            let kind = classify_connection_error(&e);
                            if kind.is_fatal() {
                                error!("connection failed permanently: {kind}");
                                self.update(|s| {
                                    s.state = ConnectionState::Failed;
                                    s.last_error = Some(kind);
                                });
                                continue 'idle;
                            }
                            retry_count += 1;
                            let delay = self.backoff.next_delay();
                            warn!(
                                retry = retry_count,
                                delay_ms = delay.as_millis() as u64,
                                "connection lost: {kind}; retrying"
                            );
                            self.update(|s| {
                                s.state = ConnectionState::Reconnecting;
                                s.last_error = Some(kind);
                                s.retry_count = retry_count;
                            });
                            // Backoff sleep, interruptible by disconnect
                            // or shutdown.
                            tokio::select! {
                                _ = self.cancel.cancelled() => break 'idle,
                                next = self.commands.recv() => match next {
                                    None => break 'idle,
                                    Some(LinkCommand::Disconnect) => {
                                        self.update(|s| {
                                            s.state = ConnectionState::Disconnected;
                                            s.retry_count = 0;
                                        });
                                        info!("disconnected during backoff");
                                        continue 'idle;
                                    }
                                    Some(LinkCommand::Connect) => {} // retry now
                                },
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
        self.update(|s| s.state = ConnectionState::Disconnected);
        info!("transport connector stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!(code = ?ack.code, "connected to broker");
                self.backoff.reset();
                self.update(|s| {
                    s.state = ConnectionState::Connected;
                    s.last_error = None;
                    s.retry_count = 0;
                });
                if let Err(e) = self.session.replay(&self.client).await {
                    warn!("subscription replay failed: {e}");
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                self.buffer
                    .push(InboundMessage::new(publish.topic, publish.payload.to_vec()));
            }
            // Pkids are forwarded with try_send so the poll loop never
            // blocks; on overflow the pkid is dropped and the affected
            // command terminates through max-age expiry.
            Event::Incoming(Packet::PubAck(ack)) => {
                if self.ack_tx.try_send(ack.pkid).is_err() {
                    warn!(pkid = ack.pkid, "ack channel full, dropping broker ack");
                }
            }
            // QoS 2 completion is treated like an at-least-once ack.
            Event::Incoming(Packet::PubComp(comp)) => {
                if self.ack_tx.try_send(comp.pkid).is_err() {
                    warn!(pkid = comp.pkid, "ack channel full, dropping broker ack");
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if self.sent_tx.try_send(pkid).is_err() {
                    warn!(pkid, "sent channel full, dropping outgoing pkid");
                }
            }
            _ => {}
        }
    }

    /// Send the MQTT Disconnect packet and poll until the event loop has
    /// flushed it, bounded by a short deadline.
    async fn drain_disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            match tokio::time::timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => break,
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut ConnectionStatus)) {
        self.status.send_modify(apply);
    }
}

impl SubscribeSink for AsyncClient {
    fn subscribe(
        &self,
        topic: String,
        qos: QosLevel,
    ) -> impl std::future::Future<Output = Result<(), RequestError>> + Send {
        let client = self.clone();
        async move {
            client
                .subscribe(topic, qos.into())
                .await
                .map_err(|e| RequestError(e.to_string()))
        }
    }
}

impl PublishSink for AsyncClient {
    fn publish(
        &self,
        topic: String,
        qos: QosLevel,
        payload: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), RequestError>> + Send {
        let client = self.clone();
        async move {
            client
                .publish(topic, qos.into(), false, payload)
                .await
                .map_err(|e| RequestError(e.to_string()))
        }
    }
}
