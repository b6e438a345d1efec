//! Public facade composing the transport, session, buffer and dispatcher.
//!
//! All entry points are non-blocking: control requests go to the transport
//! worker over a channel, publishes are enqueued for the dispatch worker,
//! and reads return snapshots. The two background workers are spawned in
//! [`MqttBridge::new`] and live until [`MqttBridge::shutdown`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::AsyncClient;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::InboundBuffer;
use crate::config::BridgeConfig;
use crate::dispatch::OutboundDispatcher;
use crate::error::{BridgeError, PublishError};
use crate::message::{CommandHandle, InboundMessage, OutboundCommand, QosLevel};
use crate::session::SessionManager;
use crate::transport::{
    BackoffPolicy, ConnectionState, ConnectionStatus, LinkCommand, TransportConnector,
};

/// Capacity of the client's internal request channel.
const CLIENT_REQUEST_CAP: usize = 64;

/// Capacity of the pkid and ack forwarding channels. The transport worker
/// drops on overflow rather than block its poll loop, so these are sized
/// well above the number of publishes that can be in flight at once.
const PKID_CHANNEL_CAP: usize = 256;

/// Reliable MQTT bridge: durable broker connection, subscription replay,
/// bounded inbound buffering and guaranteed-outcome publishing.
pub struct MqttBridge {
    client: AsyncClient,
    commands: mpsc::Sender<LinkCommand>,
    queue: mpsc::Sender<OutboundCommand>,
    status: watch::Receiver<ConnectionStatus>,
    session: Arc<SessionManager>,
    buffer: InboundBuffer,
    default_qos: QosLevel,
    command_max_age: Duration,
    next_command_id: AtomicU64,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl MqttBridge {
    /// Build the bridge and spawn its background workers.
    ///
    /// The bridge starts disconnected; call [`connect`](Self::connect) to
    /// open the broker connection.
    pub fn new(config: BridgeConfig) -> Self {
        let client_id = config.resolve_client_id();
        let broker = config.broker_address();
        info!(%broker, %client_id, "creating MQTT bridge");

        let options = config.mqtt_options(&client_id);
        let (client, eventloop) = AsyncClient::new(options, CLIENT_REQUEST_CAP);

        let (command_tx, command_rx) = mpsc::channel(8);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (sent_tx, sent_rx) = mpsc::channel(PKID_CHANNEL_CAP);
        let (ack_tx, ack_rx) = mpsc::channel(PKID_CHANNEL_CAP);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::new(&broker, &client_id));

        let session = Arc::new(SessionManager::new());
        let buffer = InboundBuffer::new(config.buffer_capacity);
        let cancel = CancellationToken::new();

        let transport = TransportConnector {
            client: client.clone(),
            eventloop,
            commands: command_rx,
            status: status_tx,
            session: session.clone(),
            buffer: buffer.clone(),
            sent_tx,
            ack_tx,
            backoff: BackoffPolicy::new(config.backoff_initial(), config.backoff_max()),
            cancel: cancel.child_token(),
        };

        let dispatcher = OutboundDispatcher {
            queue: queue_rx,
            sink: client.clone(),
            status: status_rx.clone(),
            sent_pkids: sent_rx,
            acks: ack_rx,
            retry_budget: config.command_retry_budget.max(1),
            cancel: cancel.child_token(),
        };

        let workers = vec![tokio::spawn(transport.run()), tokio::spawn(dispatcher.run())];

        MqttBridge {
            client,
            commands: command_tx,
            queue: queue_tx,
            status: status_rx,
            session,
            buffer,
            default_qos: config.default_qos,
            command_max_age: config.command_max_age(),
            next_command_id: AtomicU64::new(1),
            cancel,
            workers,
        }
    }

    /// Ask the transport worker to open (or re-open after `Failed`) the
    /// broker connection. Returns as soon as the request is queued.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.commands
            .send(LinkCommand::Connect)
            .await
            .map_err(|_| BridgeError::WorkerUnavailable("transport worker stopped".into()))
    }

    /// Close the connection. Cancels any in-flight backoff wait; already
    /// acknowledged commands are unaffected.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.commands
            .send(LinkCommand::Disconnect)
            .await
            .map_err(|_| BridgeError::WorkerUnavailable("transport worker stopped".into()))
    }

    /// Add a topic filter to the desired subscription set.
    ///
    /// Applied immediately when connected; otherwise it takes effect on the
    /// next (re)connect, like every other entry in the set.
    pub async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), BridgeError> {
        self.session.record(topic, qos);
        if self.status.borrow().state == ConnectionState::Connected {
            self.client
                .subscribe(topic, qos.into())
                .await
                .map_err(|e| BridgeError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Remove a topic filter from the desired set.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError> {
        if !self.session.forget(topic) {
            debug!(topic, "unsubscribe for unknown topic filter");
        }
        if self.status.borrow().state == ConnectionState::Connected {
            self.client
                .unsubscribe(topic)
                .await
                .map_err(|e| BridgeError::Unsubscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Enqueue a publish regardless of connection state; never blocks.
    ///
    /// The returned handle reports the command's progress through
    /// `Pending -> Sent -> Acknowledged` or to `Failed`.
    pub fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> Result<CommandHandle, PublishError> {
        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let (command, handle) =
            OutboundCommand::new(id, topic.to_owned(), payload, qos, self.command_max_age);

        self.queue.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(command) => {
                warn!(id = command.id, topic, "outbound queue full, dropping command");
                command.fail(PublishError::QueueFull);
                PublishError::QueueFull
            }
            mpsc::error::TrySendError::Closed(command) => {
                let error = PublishError::BrokerRejected("bridge shut down".into());
                command.fail(error.clone());
                error
            }
        })?;
        debug!(id, topic, ?qos, "command enqueued");
        Ok(handle)
    }

    /// [`publish`](Self::publish) with the configured default QoS.
    pub fn publish_default(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<CommandHandle, PublishError> {
        self.publish(topic, payload, self.default_qos)
    }

    /// The `k` most recently received messages, oldest first.
    pub fn recent_messages(&self, k: usize) -> Vec<InboundMessage> {
        self.buffer.peek_recent(k)
    }

    /// Drain and return everything buffered.
    pub fn take_messages(&self) -> Vec<InboundMessage> {
        self.buffer.take_all()
    }

    /// Current connection snapshot (state, last error, retry count).
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Snapshot of the desired subscription set.
    pub fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.session.snapshot()
    }

    /// Wait until the connection reaches the given state.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), BridgeError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::WorkerUnavailable("transport worker stopped".into()))
    }

    /// Disconnect and stop both background workers.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(LinkCommand::Disconnect).await;
        self.cancel.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("bridge worker ended abnormally: {e}");
            }
        }
        info!("bridge shut down");
    }
}
