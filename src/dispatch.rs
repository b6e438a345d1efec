//! Outbound command dispatch.
//!
//! A single worker drains the publish queue whenever the transport reports
//! a live connection. Commands are sent FIFO; for QoS >= 1 the worker
//! correlates the packet id assigned by the client with the broker's
//! acknowledgment before moving on. A connection drop mid-send requeues
//! the command instead of failing it, so the caller sees each state
//! transition at most once while the broker may receive an at-least-once
//! duplicate.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PublishError, RequestError};
use crate::message::{DeliveryState, OutboundCommand, QosLevel};
use crate::transport::{ConnectionState, ConnectionStatus};

/// Pause between consecutive send attempts of the same command.
const RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Sink for publish requests, implemented by the MQTT client.
pub(crate) trait PublishSink: Send + Sync {
    fn publish(
        &self,
        topic: String,
        qos: QosLevel,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
}

enum AckOutcome {
    Acknowledged,
    ConnectionLost,
    Expired,
    Shutdown,
}

/// Background worker owning the outbound queue.
pub(crate) struct OutboundDispatcher<S> {
    pub(crate) queue: mpsc::Receiver<OutboundCommand>,
    pub(crate) sink: S,
    pub(crate) status: watch::Receiver<ConnectionStatus>,
    /// Packet ids the event loop assigned to outgoing publishes.
    pub(crate) sent_pkids: mpsc::Receiver<u16>,
    /// Packet ids acknowledged by the broker (PUBACK / PUBCOMP).
    pub(crate) acks: mpsc::Receiver<u16>,
    pub(crate) retry_budget: u32,
    pub(crate) cancel: CancellationToken,
}

impl<S: PublishSink> OutboundDispatcher<S> {
    pub(crate) async fn run(mut self) {
        info!("outbound dispatcher started");
        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.queue.recv() => match next {
                    Some(command) => command,
                    None => break,
                },
            };
            self.deliver(command).await;
        }
        info!("outbound dispatcher stopped");
    }

    /// Drive one command to a terminal state.
    async fn deliver(&mut self, command: OutboundCommand) {
        let mut attempts: u32 = 0;
        loop {
            if attempts >= self.retry_budget {
                warn!(
                    id = command.id,
                    topic = %command.topic,
                    attempts,
                    "retry budget exhausted"
                );
                command.fail(PublishError::BrokerRejected("retry budget exhausted".into()));
                return;
            }

            // Wait for a live connection, bounded by the command's deadline.
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = timeout_at(command.deadline, wait_connected(&mut self.status)) => result,
            };
            match connected {
                Err(_) => {
                    debug!(
                        id = command.id,
                        topic = %command.topic,
                        age_ms = command.age().as_millis() as u64,
                        "expired before delivery"
                    );
                    command.fail(PublishError::Expired);
                    return;
                }
                Ok(Err(())) => return, // status channel gone: bridge shut down
                Ok(Ok(())) => {}
            }

            attempts += 1;

            // Discard correlation leftovers from a previous connection cycle.
            while self.sent_pkids.try_recv().is_ok() {}
            while self.acks.try_recv().is_ok() {}

            let payload = command.payload.clone();
            if let Err(e) = self.sink.publish(command.topic.clone(), command.qos, payload).await {
                warn!(id = command.id, attempt = attempts, "publish request failed: {e}");
                tokio::time::sleep(RETRY_PAUSE).await;
                continue;
            }
            command.transition(DeliveryState::Sent);

            if command.qos == QosLevel::AtMostOnce {
                // Fire-and-forget; the broker sends no acknowledgment.
                command.transition(DeliveryState::Acknowledged);
                debug!(id = command.id, topic = %command.topic, "sent (qos 0)");
                return;
            }

            match self.await_ack(&command).await {
                AckOutcome::Acknowledged => {
                    debug!(id = command.id, topic = %command.topic, "acknowledged");
                    command.transition(DeliveryState::Acknowledged);
                    return;
                }
                AckOutcome::ConnectionLost => {
                    debug!(
                        id = command.id,
                        topic = %command.topic,
                        "connection lost mid-send, requeueing"
                    );
                    continue;
                }
                AckOutcome::Expired => {
                    command.fail(PublishError::Expired);
                    return;
                }
                AckOutcome::Shutdown => return,
            }
        }
    }

    /// Wait for the packet id of the publish we just issued, then for the
    /// broker's matching acknowledgment.
    async fn await_ack(&mut self, command: &OutboundCommand) -> AckOutcome {
        let pkid = tokio::select! {
            _ = self.cancel.cancelled() => return AckOutcome::Shutdown,
            result = timeout_at(command.deadline, self.sent_pkids.recv()) => match result {
                Err(_) => return AckOutcome::Expired,
                Ok(None) => return AckOutcome::Shutdown,
                Ok(Some(pkid)) => pkid,
            },
            dropped = wait_disconnected(&mut self.status) => {
                return match dropped {
                    Ok(()) => AckOutcome::ConnectionLost,
                    Err(()) => AckOutcome::Shutdown,
                };
            }
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return AckOutcome::Shutdown,
                result = timeout_at(command.deadline, self.acks.recv()) => match result {
                    Err(_) => return AckOutcome::Expired,
                    Ok(None) => return AckOutcome::Shutdown,
                    Ok(Some(acked)) if acked == pkid => return AckOutcome::Acknowledged,
                    Ok(Some(stale)) => {
                        // Acknowledgment for a retransmission of an earlier
                        // cycle; not ours.
                        debug!(pkid = stale, "ignoring unmatched ack");
                    }
                },
                dropped = wait_disconnected(&mut self.status) => {
                    return match dropped {
                        Ok(()) => AckOutcome::ConnectionLost,
                        Err(()) => AckOutcome::Shutdown,
                    };
                }
            }
        }
    }
}

async fn wait_connected(status: &mut watch::Receiver<ConnectionStatus>) -> Result<(), ()> {
    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .map(|_| ())
        .map_err(|_| ())
}

async fn wait_disconnected(status: &mut watch::Receiver<ConnectionStatus>) -> Result<(), ()> {
    status
        .wait_for(|s| s.state != ConnectionState::Connected)
        .await
        .map(|_| ())
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::message::CommandHandle;

    struct FakeSink {
        calls: Arc<Mutex<Vec<(String, QosLevel, u16)>>>,
        fail_remaining: Arc<AtomicU32>,
        next_pkid: Arc<AtomicU16>,
        sent_tx: mpsc::Sender<u16>,
        ack_tx: Option<mpsc::Sender<u16>>,
    }

    impl PublishSink for Arc<FakeSink> {
        async fn publish(
            &self,
            topic: String,
            qos: QosLevel,
            _payload: Vec<u8>,
        ) -> Result<(), RequestError> {
            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RequestError("request channel closed".into()));
            }
            let pkid = self.next_pkid.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls.lock().expect("calls lock").push((topic, qos, pkid));
            if qos != QosLevel::AtMostOnce {
                let _ = self.sent_tx.send(pkid).await;
                if let Some(ack_tx) = &self.ack_tx {
                    let _ = ack_tx.send(pkid).await;
                }
            }
            Ok(())
        }
    }

    struct Harness {
        sink: Arc<FakeSink>,
        queue_tx: mpsc::Sender<OutboundCommand>,
        status_tx: watch::Sender<ConnectionStatus>,
        ack_tx: mpsc::Sender<u16>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn set_state(&self, state: ConnectionState) {
            self.status_tx.send_modify(|s| s.state = state);
        }

        fn enqueue(&self, topic: &str, payload: &[u8], qos: QosLevel, max_age_secs: u64) -> CommandHandle {
            let (command, handle) = OutboundCommand::new(
                1,
                topic.to_owned(),
                payload.to_vec(),
                qos,
                Duration::from_secs(max_age_secs),
            );
            self.queue_tx.try_send(command).expect("enqueue");
            handle
        }

        fn calls(&self) -> Vec<(String, QosLevel, u16)> {
            self.sink.calls.lock().expect("calls lock").clone()
        }

        async fn wait_for_calls(&self, n: usize) {
            while self.calls().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn spawn_dispatcher(
        initial: ConnectionState,
        retry_budget: u32,
        fail_first: u32,
        auto_ack: bool,
    ) -> Harness {
        let (queue_tx, queue_rx) = mpsc::channel(16);
        let (sent_tx, sent_rx) = mpsc::channel(16);
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let mut status = ConnectionStatus::new("test.broker:1883", "test-client");
        status.state = initial;
        let (status_tx, status_rx) = watch::channel(status);
        let cancel = CancellationToken::new();

        let sink = Arc::new(FakeSink {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_remaining: Arc::new(AtomicU32::new(fail_first)),
            next_pkid: Arc::new(AtomicU16::new(0)),
            sent_tx,
            ack_tx: auto_ack.then(|| ack_tx.clone()),
        });

        let dispatcher = OutboundDispatcher {
            queue: queue_rx,
            sink: sink.clone(),
            status: status_rx,
            sent_pkids: sent_rx,
            acks: ack_rx,
            retry_budget,
            cancel: cancel.clone(),
        };
        tokio::spawn(dispatcher.run());

        Harness { sink, queue_tx, status_tx, ack_tx, cancel }
    }

    #[tokio::test(start_paused = true)]
    async fn command_waits_for_connection_then_acknowledges() {
        let harness = spawn_dispatcher(ConnectionState::Disconnected, 5, 0, true);

        let mut handle =
            harness.enqueue("home/controls", b"Turn ON Light", QosLevel::AtLeastOnce, 300);
        assert_eq!(handle.state(), DeliveryState::Pending);

        // Connection comes up two seconds later.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.state(), DeliveryState::Pending);
        harness.set_state(ConnectionState::Connected);

        assert_eq!(handle.wait().await, DeliveryState::Acknowledged);
        assert_eq!(harness.calls().len(), 1, "command must not be sent twice");
    }

    #[tokio::test(start_paused = true)]
    async fn qos0_command_is_terminal_on_send() {
        let harness = spawn_dispatcher(ConnectionState::Connected, 5, 0, false);

        let mut handle = harness.enqueue("home/controls", b"ping", QosLevel::AtMostOnce, 300);
        assert_eq!(handle.wait().await, DeliveryState::Acknowledged);
        assert_eq!(harness.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_mid_send_requeues_without_duplicate_ack() {
        let harness = spawn_dispatcher(ConnectionState::Connected, 5, 0, false);

        let mut handle =
            harness.enqueue("home/controls", b"Turn OFF Fan", QosLevel::AtLeastOnce, 300);

        // First attempt goes out, then the connection drops before the ack.
        harness.wait_for_calls(1).await;
        harness.set_state(ConnectionState::Reconnecting);
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.set_state(ConnectionState::Connected);

        // Second attempt; this time the broker acknowledges.
        harness.wait_for_calls(2).await;
        let resent_pkid = harness.calls()[1].2;
        harness.ack_tx.send(resent_pkid).await.expect("ack");

        assert_eq!(handle.wait().await, DeliveryState::Acknowledged);
        assert_eq!(harness.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn command_expires_while_disconnected() {
        let harness = spawn_dispatcher(ConnectionState::Disconnected, 5, 0, true);

        let mut handle = harness.enqueue("home/controls", b"late", QosLevel::AtLeastOnce, 5);
        assert_eq!(
            handle.wait().await,
            DeliveryState::Failed(PublishError::Expired)
        );
        assert!(harness.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_fails_the_command() {
        // The sink rejects every attempt.
        let harness = spawn_dispatcher(ConnectionState::Connected, 2, u32::MAX, true);

        let mut handle = harness.enqueue("home/controls", b"nope", QosLevel::AtLeastOnce, 300);
        assert_eq!(
            handle.wait().await,
            DeliveryState::Failed(PublishError::BrokerRejected("retry budget exhausted".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_sent_in_enqueue_order() {
        let harness = spawn_dispatcher(ConnectionState::Connected, 5, 0, true);

        let mut first = harness.enqueue("home/controls", b"first", QosLevel::AtLeastOnce, 300);
        let mut second = harness.enqueue("home/controls", b"second", QosLevel::AtLeastOnce, 300);

        assert_eq!(first.wait().await, DeliveryState::Acknowledged);
        assert_eq!(second.wait().await, DeliveryState::Acknowledged);

        let calls = harness.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].2 < calls[1].2, "first enqueued is first sent");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_worker() {
        let harness = spawn_dispatcher(ConnectionState::Disconnected, 5, 0, true);
        harness.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Queue receiver is gone once the worker exits.
        let (command, _handle) = OutboundCommand::new(
            9,
            "home/controls".into(),
            Vec::new(),
            QosLevel::AtLeastOnce,
            Duration::from_secs(30),
        );
        assert!(harness.queue_tx.try_send(command).is_err());
    }
}
