// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-instance pending message queues and the drain task.
//!
//! Each instance owns a bounded FIFO used when a send is requested while the
//! instance is not CONNECTED. Overflow evicts the oldest message: producers
//! prefer recency over completeness, consistent with the short TTL. The
//! queue is not persistent.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use zapgate_core::{DisconnectReason, InstanceStatus, MessageKind, PendingMessage};

use crate::SessionEngine;

/// Map of `instance id -> bounded FIFO of pending messages`.
pub struct PendingQueues {
    queues: DashMap<String, VecDeque<PendingMessage>>,
    capacity: usize,
    ttl: Duration,
}

impl PendingQueues {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Append a message, evicting the oldest on overflow.
    /// Returns the 1-based queue position of the new message.
    pub fn enqueue(&self, id: &str, message: PendingMessage) -> usize {
        let mut queue = self.queues.entry(id.to_string()).or_default();
        if queue.len() >= self.capacity {
            if let Some(evicted) = queue.pop_front() {
                warn!(
                    instance_id = id,
                    message_id = evicted.id.as_str(),
                    "pending queue full, oldest message evicted"
                );
            }
        }
        queue.push_back(message);
        queue.len()
    }

    pub fn pop(&self, id: &str) -> Option<PendingMessage> {
        self.queues.get_mut(id).and_then(|mut q| q.pop_front())
    }

    /// Return a message to the head of the queue for retry.
    pub fn push_front(&self, id: &str, message: PendingMessage) {
        self.queues
            .entry(id.to_string())
            .or_default()
            .push_front(message);
    }

    pub fn len(&self, id: &str) -> usize {
        self.queues.get(id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, id: &str) -> bool {
        self.len(id) == 0
    }

    /// Shallow copy of one instance's queue, FIFO order.
    pub fn snapshot(&self, id: &str) -> Vec<PendingMessage> {
        self.queues
            .get(id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every message for `id`; returns how many were dropped.
    pub fn clear(&self, id: &str) -> usize {
        self.queues
            .remove(id)
            .map(|(_, q)| q.len())
            .unwrap_or(0)
    }

    /// Queue sizes for the health endpoint.
    pub fn sizes(&self) -> HashMap<String, usize> {
        self.queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    /// Whether a message has outlived the TTL.
    pub fn is_expired(&self, message: &PendingMessage) -> bool {
        message.enqueued_at.elapsed() > self.ttl
    }
}

impl SessionEngine {
    /// Kick off a drain after the post-connect stabilisation delay.
    pub(crate) fn spawn_drain(self: &Arc<Self>, id: &str) {
        let engine = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(engine.policy.drain_stabilize()).await;
            engine.drain_queue(&id).await;
        });
    }

    /// Send queued messages FIFO with pacing, stopping early if the instance
    /// falls out of CONNECTED. Expired messages are dropped and reported.
    pub(crate) async fn drain_queue(self: &Arc<Self>, id: &str) {
        if self.queues.is_empty(id) {
            return;
        }
        info!(
            instance_id = id,
            pending = self.queues.len(id),
            "draining pending queue"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let Some(cell) = self.registry.get(id) else {
                break;
            };
            let (status, client) = {
                let state = cell.lock().await;
                (state.status, state.client.clone())
            };
            if status != InstanceStatus::Connected {
                info!(instance_id = id, status = %status, "drain stopped, instance left CONNECTED");
                break;
            }
            let Some(client) = client else { break };

            let Some(mut message) = self.queues.pop(id) else {
                debug!(instance_id = id, "pending queue drained");
                break;
            };

            if self.queues.is_expired(&message) {
                warn!(
                    instance_id = id,
                    message_id = message.id.as_str(),
                    age_secs = message.enqueued_at.elapsed().as_secs(),
                    "pending message expired, dropped"
                );
                continue;
            }

            let result = match message.kind {
                MessageKind::Text => client.send_text(&message.to, &message.content).await,
                MessageKind::Media => {
                    let media = message.media.clone().unwrap_or_default();
                    client
                        .send_media(&message.to, &media, message.caption.as_deref())
                        .await
                }
            };

            match result {
                Ok(wire_id) => {
                    info!(
                        instance_id = id,
                        message_id = message.id.as_str(),
                        wire_id = wire_id.as_str(),
                        "queued message delivered"
                    );
                    if let Some(cell) = self.registry.get(id) {
                        cell.lock().await.last_activity = std::time::Instant::now();
                    }
                }
                Err(e) => {
                    message.attempts += 1;
                    message.last_error = Some(e.to_string());

                    if e.indicates_disconnect() {
                        warn!(
                            instance_id = id,
                            message_id = message.id.as_str(),
                            error = %e,
                            "send failed mid-drain, instance looks disconnected"
                        );
                        self.queues.push_front(id, message);
                        self.schedule_reconnect(id, DisconnectReason::NetworkError);
                        break;
                    }

                    if message.attempts >= self.policy.send_max_retries {
                        error!(
                            instance_id = id,
                            message_id = message.id.as_str(),
                            attempts = message.attempts,
                            error = %e,
                            "pending message dropped after retries"
                        );
                    } else {
                        self.queues.push_front(id, message);
                    }
                }
            }

            tokio::time::sleep(self.policy.drain_pace()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(capacity: usize, ttl_secs: u64) -> PendingQueues {
        PendingQueues::new(capacity, Duration::from_secs(ttl_secs))
    }

    #[test]
    fn enqueue_returns_position() {
        let q = queues(10, 300);
        assert_eq!(q.enqueue("a", PendingMessage::text("x@c.us", "1")), 1);
        assert_eq!(q.enqueue("a", PendingMessage::text("x@c.us", "2")), 2);
        assert_eq!(q.len("a"), 2);
        assert_eq!(q.len("other"), 0);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let q = queues(100, 300);
        for i in 0..100 {
            q.enqueue("a", PendingMessage::text("x@c.us", &format!("m{i}")));
        }
        assert_eq!(q.len("a"), 100);

        // The 101st enqueue evicts the oldest; the newest is present.
        q.enqueue("a", PendingMessage::text("x@c.us", "m100"));
        assert_eq!(q.len("a"), 100);

        let contents = q.snapshot("a");
        assert_eq!(contents.first().unwrap().content, "m1");
        assert_eq!(contents.last().unwrap().content, "m100");
    }

    #[test]
    fn fifo_order_preserved() {
        let q = queues(10, 300);
        q.enqueue("a", PendingMessage::text("x@c.us", "first"));
        q.enqueue("a", PendingMessage::text("x@c.us", "second"));

        assert_eq!(q.pop("a").unwrap().content, "first");
        assert_eq!(q.pop("a").unwrap().content, "second");
        assert!(q.pop("a").is_none());
    }

    #[test]
    fn push_front_retries_at_head() {
        let q = queues(10, 300);
        q.enqueue("a", PendingMessage::text("x@c.us", "first"));
        q.enqueue("a", PendingMessage::text("x@c.us", "second"));

        let msg = q.pop("a").unwrap();
        q.push_front("a", msg);
        assert_eq!(q.pop("a").unwrap().content, "first");
    }

    #[test]
    fn clear_drops_everything() {
        let q = queues(10, 300);
        q.enqueue("a", PendingMessage::text("x@c.us", "1"));
        q.enqueue("a", PendingMessage::text("x@c.us", "2"));
        assert_eq!(q.clear("a"), 2);
        assert!(q.is_empty("a"));
        assert_eq!(q.clear("a"), 0);
    }

    #[test]
    fn expiry_uses_ttl() {
        let q = queues(10, 0);
        let msg = PendingMessage::text("x@c.us", "old");
        std::thread::sleep(Duration::from_millis(5));
        assert!(q.is_expired(&msg));

        let q = queues(10, 300);
        assert!(!q.is_expired(&PendingMessage::text("x@c.us", "fresh")));
    }

    #[test]
    fn sizes_reports_per_instance() {
        let q = queues(10, 300);
        q.enqueue("a", PendingMessage::text("x@c.us", "1"));
        q.enqueue("b", PendingMessage::text("x@c.us", "1"));
        q.enqueue("b", PendingMessage::text("x@c.us", "2"));

        let sizes = q.sizes();
        assert_eq!(sizes.get("a"), Some(&1));
        assert_eq!(sizes.get("b"), Some(&2));
    }
}
