//! Message and command representations shared across the bridge.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::PublishError;

/// MQTT quality-of-service level for subscriptions and publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Raised when converting an out-of-range numeric QoS value.
#[derive(Debug, Error)]
#[error("invalid QoS value: {0}")]
pub struct InvalidQos(pub u8);

impl TryFrom<u8> for QosLevel {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A message received from the broker, stamped on arrival.
///
/// Immutable once created; stored in the inbound ring buffer and handed
/// out by value to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload,
            received_at: Local::now(),
        }
    }

    /// Payload as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            self.text()
        )
    }
}

/// Delivery lifecycle of an outbound command.
///
/// Only moves forward: `Pending -> Sent -> Acknowledged`, with `Failed`
/// as the terminal state for expiry, rejection, or queue overflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeliveryState {
    #[default]
    Pending,
    Sent,
    Acknowledged,
    Failed(PublishError),
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Failed(_))
    }
}

/// A publish request queued for the dispatch worker.
///
/// Mutated only by the dispatcher; callers observe progress through the
/// [`CommandHandle`] created alongside it.
#[derive(Debug)]
pub(crate) struct OutboundCommand {
    pub(crate) id: u64,
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QosLevel,
    pub(crate) enqueued_at: Instant,
    pub(crate) deadline: Instant,
    state_tx: watch::Sender<DeliveryState>,
}

impl OutboundCommand {
    pub(crate) fn new(
        id: u64,
        topic: String,
        payload: Vec<u8>,
        qos: QosLevel,
        max_age: std::time::Duration,
    ) -> (Self, CommandHandle) {
        let now = Instant::now();
        let (state_tx, state_rx) = watch::channel(DeliveryState::Pending);
        let command = OutboundCommand {
            id,
            topic,
            payload,
            qos,
            enqueued_at: now,
            deadline: now + max_age,
            state_tx,
        };
        (command, CommandHandle { id, state: state_rx })
    }

    /// Advance the delivery state. Terminal states are sticky and a
    /// repeated transition to the current state is not re-announced, so
    /// a redelivered acknowledgment is never reported twice.
    pub(crate) fn transition(&self, next: DeliveryState) {
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
    }

    pub(crate) fn fail(&self, error: PublishError) {
        self.transition(DeliveryState::Failed(error));
    }

    /// Time the command has spent queued.
    pub(crate) fn age(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }
}

/// Caller-side view of a queued publish.
///
/// Cheap to clone; poll with [`state`](CommandHandle::state) or await the
/// terminal state with [`wait`](CommandHandle::wait).
#[derive(Debug, Clone)]
pub struct CommandHandle {
    id: u64,
    state: watch::Receiver<DeliveryState>,
}

impl CommandHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current delivery state, without blocking.
    pub fn state(&self) -> DeliveryState {
        self.state.borrow().clone()
    }

    /// Wait until the command reaches `Acknowledged` or `Failed`.
    ///
    /// If the dispatcher shuts down first, returns the last observed state.
    pub async fn wait(&mut self) -> DeliveryState {
        loop {
            let current = self.state.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn qos_from_u8_rejects_out_of_range() {
        assert_eq!(QosLevel::try_from(0).unwrap(), QosLevel::AtMostOnce);
        assert_eq!(QosLevel::try_from(1).unwrap(), QosLevel::AtLeastOnce);
        assert_eq!(QosLevel::try_from(2).unwrap(), QosLevel::ExactlyOnce);
        assert!(QosLevel::try_from(3).is_err());
    }

    #[tokio::test]
    async fn command_state_only_moves_forward() {
        let (command, handle) = OutboundCommand::new(
            1,
            "home/controls".into(),
            b"Turn ON Light".to_vec(),
            QosLevel::AtLeastOnce,
            Duration::from_secs(30),
        );
        assert_eq!(handle.state(), DeliveryState::Pending);

        command.transition(DeliveryState::Sent);
        assert_eq!(handle.state(), DeliveryState::Sent);

        command.transition(DeliveryState::Acknowledged);
        assert_eq!(handle.state(), DeliveryState::Acknowledged);

        // A late failure or duplicate ack must not overwrite the terminal state.
        command.fail(PublishError::Expired);
        command.transition(DeliveryState::Acknowledged);
        assert_eq!(handle.state(), DeliveryState::Acknowledged);
    }

    #[tokio::test]
    async fn handle_wait_returns_terminal_state() {
        let (command, mut handle) = OutboundCommand::new(
            7,
            "home/controls".into(),
            Vec::new(),
            QosLevel::AtMostOnce,
            Duration::from_secs(30),
        );

        let waiter = tokio::spawn(async move { handle.wait().await });
        command.transition(DeliveryState::Sent);
        command.transition(DeliveryState::Acknowledged);

        let state = waiter.await.expect("waiter task");
        assert_eq!(state, DeliveryState::Acknowledged);
    }
}
