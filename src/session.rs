//! Subscription state tracking.
//!
//! The desired subscription set is the source of truth for what the bridge
//! should be subscribed to. The transport worker replays the full set after
//! every successful (re)connect, so a dropped connection never silently
//! loses a subscription.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::RequestError;
use crate::message::QosLevel;

/// Sink for subscribe requests, implemented by the MQTT client.
///
/// Kept as a seam so replay behavior can be exercised without a broker.
pub(crate) trait SubscribeSink: Send + Sync {
    fn subscribe(
        &self,
        topic: String,
        qos: QosLevel,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
}

/// Tracks the desired subscription set across reconnect cycles.
#[derive(Debug, Default)]
pub struct SessionManager {
    desired: Mutex<BTreeMap<String, QosLevel>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, QosLevel>> {
        self.desired.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a topic filter to the desired set.
    ///
    /// Idempotent: a duplicate subscribe replaces the stored QoS instead of
    /// adding a second entry. Returns `true` when the set actually changed.
    pub fn record(&self, filter: &str, qos: QosLevel) -> bool {
        let mut desired = self.lock();
        match desired.insert(filter.to_owned(), qos) {
            Some(previous) if previous == qos => false,
            Some(_) => {
                debug!(topic = filter, ?qos, "subscription QoS updated");
                true
            }
            None => {
                debug!(topic = filter, ?qos, "subscription recorded");
                true
            }
        }
    }

    /// Remove a topic filter from the desired set. Returns `true` when an
    /// entry was removed.
    pub fn forget(&self, filter: &str) -> bool {
        self.lock().remove(filter).is_some()
    }

    /// Consistent snapshot of the desired set, ordered by topic filter.
    pub fn snapshot(&self) -> Vec<(String, QosLevel)> {
        self.lock().iter().map(|(t, q)| (t.clone(), *q)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Re-issue a subscribe for every entry in the desired set.
    ///
    /// Called by the transport worker after each successful handshake.
    /// Duplicate subscribes are safe broker-side and simply refresh the QoS.
    pub(crate) async fn replay<S: SubscribeSink>(&self, sink: &S) -> Result<usize, RequestError> {
        let snapshot = self.snapshot();
        for (topic, qos) in &snapshot {
            sink.subscribe(topic.clone(), *qos).await?;
            debug!(topic, ?qos, "subscription replayed");
        }
        if !snapshot.is_empty() {
            info!(count = snapshot.len(), "subscription set replayed");
        }
        Ok(snapshot.len())
    }
}
