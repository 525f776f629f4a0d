use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A message for one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub recipient_id: String,
    pub payload: Value,
    /// Same key means same logical delivery; gateways drop repeats
    pub idempotency_key: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Recipient {0} is unreachable")]
    Unreachable(String),

    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// Delivers notifications to users
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), GatewayError>;
}

/// Keys of the most recent deliveries, oldest evicted first
#[derive(Debug)]
struct RecentKeys {
    order: VecDeque<String>,
    seen: HashSet<String>,
    limit: usize,
}

impl RecentKeys {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            limit: limit.max(1),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    fn remember(&mut self, key: String) {
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Default number of delivered keys a [`BroadcastGateway`] remembers
pub const DEFAULT_DEDUPE_WINDOW: usize = 4096;

/// In-process fan-out for connected clients (the websocket layer subscribes).
///
/// Remembers the idempotency keys of its most recent deliveries, so a
/// retried job attempt reaches subscribers once. Retries land within
/// seconds of the first try; the window only has to outlast that.
pub struct BroadcastGateway {
    sender: broadcast::Sender<Notification>,
    delivered: Mutex<RecentKeys>,
}

impl BroadcastGateway {
    pub fn new(capacity: usize) -> Self {
        Self::with_dedupe_window(capacity, DEFAULT_DEDUPE_WINDOW)
    }

    /// `window` bounds how many delivered keys are kept for deduplication
    pub fn with_dedupe_window(capacity: usize, window: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            delivered: Mutex::new(RecentKeys::new(window)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastGateway {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl NotificationGateway for BroadcastGateway {
    async fn send(&self, notification: Notification) -> Result<(), GatewayError> {
        let mut delivered = self.delivered.lock();
        if delivered.contains(&notification.idempotency_key) {
            debug!(key = %notification.idempotency_key, "duplicate notification suppressed");
            return Ok(());
        }

        let key = notification.idempotency_key.clone();
        match self.sender.send(notification) {
            Ok(receivers) => debug!(%key, receivers, "notification broadcast"),
            // Nobody connected right now; the notification is simply missed, like a websocket emit
            Err(_) => debug!(%key, "notification broadcast with no subscribers"),
        }
        delivered.remember(key);
        Ok(())
    }
}

/// Writes notifications to the log; used when no client transport is wired
#[derive(Debug, Default)]
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn send(&self, notification: Notification) -> Result<(), GatewayError> {
        info!(
            kind = %notification.kind,
            recipient_id = %notification.recipient_id,
            key = %notification.idempotency_key,
            payload = %notification.payload,
            "notification sent"
        );
        Ok(())
    }
}
