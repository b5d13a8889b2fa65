//! Broadcaster. Delivers each classified Packet to every current
//! subscriber of its owner, with per-subscriber backpressure that drops the
//! oldest queued packet rather than blocking the Pipeline or the tenant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Notify;

use crate::types::{OwnerId, Packet, Subscriber};

/// Bounded, drop-oldest queue feeding one subscriber's socket-send task.
pub struct SubscriberQueue {
    queue: std::sync::Mutex<VecDeque<Packet>>,
    capacity: usize,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self { queue: std::sync::Mutex::new(VecDeque::with_capacity(capacity)), capacity, notify: Notify::new() }
    }

    fn push(&self, packet: Packet) {
        let mut queue = self.queue.lock().expect("subscriber queue lock poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(packet);
        drop(queue);
        self.notify.notify_one();
    }

    /// Waits for and returns the next queued packet, in FIFO order.
    pub async fn recv(&self) -> Packet {
        loop {
            {
                let mut queue = self.queue.lock().expect("subscriber queue lock poisoned");
                if let Some(packet) = queue.pop_front() {
                    return packet;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("subscriber queue lock poisoned").len()
    }
}

#[derive(Default)]
struct OwnerSubscribers {
    by_conn: HashMap<String, Arc<SubscriberQueue>>,
}

/// Maintains `subscribers: map OwnerId → set<Subscriber>` and fans out
/// classified packets. No cross-owner delivery is possible because lookup
/// is always by the packet's own `owner_id`.
pub struct Broadcaster {
    subscribers: RwLock<HashMap<OwnerId, OwnerSubscribers>>,
    backpressure_limit: usize,
}

impl Broadcaster {
    pub fn new(backpressure_limit: usize) -> Self {
        Self { subscribers: RwLock::new(HashMap::new()), backpressure_limit }
    }

    /// Registers a new subscriber and returns its queue plus the
    /// `Subscriber` record. The caller moves the queue into the task that
    /// drains it toward the socket.
    pub fn subscribe(&self, owner_id: OwnerId, conn_id: String) -> (Subscriber, Arc<SubscriberQueue>) {
        let queue = Arc::new(SubscriberQueue::new(self.backpressure_limit));
        let mut subscribers = self.subscribers.write().expect("broadcaster lock poisoned");
        subscribers
            .entry(owner_id.clone())
            .or_default()
            .by_conn
            .insert(conn_id.clone(), queue.clone());

        (Subscriber { conn_id, owner_id, subscribed_at: Utc::now() }, queue)
    }

    /// Removes a subscriber. Returns `true` if that owner now has zero
    /// subscribers, so the caller can start the idle-teardown timer.
    pub fn unsubscribe(&self, owner_id: &OwnerId, conn_id: &str) -> bool {
        let mut subscribers = self.subscribers.write().expect("broadcaster lock poisoned");
        let Some(owner_subs) = subscribers.get_mut(owner_id) else { return true };
        owner_subs.by_conn.remove(conn_id);
        let now_empty = owner_subs.by_conn.is_empty();
        if now_empty {
            subscribers.remove(owner_id);
        }
        now_empty
    }

    /// Fans `packet` out to every current subscriber of `packet.owner_id`.
    /// Never blocks: each subscriber's push is O(1) and non-blocking.
    pub fn publish(&self, packet: Packet) {
        let subscribers = self.subscribers.read().expect("broadcaster lock poisoned");
        let Some(owner_subs) = subscribers.get(&packet.owner_id) else { return };
        for queue in owner_subs.by_conn.values() {
            queue.push(packet.clone());
        }
    }

    pub fn subscriber_count(&self, owner_id: &OwnerId) -> usize {
        self.subscribers
            .read()
            .expect("broadcaster lock poisoned")
            .get(owner_id)
            .map(|s| s.by_conn.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_packet(owner: &OwnerId) -> Packet {
        Packet {
            id: "p1".to_string(),
            owner_id: owner.clone(),
            timestamp: Utc::now(),
            source_ip: "1.2.3.4".to_string(),
            destination_ip: "10.0.0.1".to_string(),
            source_country: None,
            source_lat: None,
            source_lon: None,
            method: "GET".to_string(),
            protocol: "TCP".to_string(),
            dst_port: 443,
            bytes: 100,
            entropy: 0.5,
            ai_scored: true,
            anomaly_score: Some(0.2),
            anomaly_threshold: Some(0.1),
            anomaly_mean: Some(0.2),
            anomaly_warmed_up: Some(true),
            anomaly_baseline_n: Some(40),
            is_anomaly: false,
            attack_vector: None,
            session_started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_only_reaches_its_own_owner() {
        let bc = Broadcaster::new(10);
        let owner_a = OwnerId::anon("a");
        let owner_b = OwnerId::anon("b");
        let (_sub_a, queue_a) = bc.subscribe(owner_a.clone(), "conn-a".to_string());
        let (_sub_b, queue_b) = bc.subscribe(owner_b.clone(), "conn-b".to_string());

        bc.publish(sample_packet(&owner_a));

        assert_eq!(queue_a.len(), 1);
        assert_eq!(queue_b.len(), 0);
    }

    #[tokio::test]
    async fn backpressure_drops_oldest_not_newest() {
        let bc = Broadcaster::new(2);
        let owner = OwnerId::anon("a");
        let (_sub, queue) = bc.subscribe(owner.clone(), "conn".to_string());

        let mut p1 = sample_packet(&owner);
        p1.id = "p1".to_string();
        let mut p2 = sample_packet(&owner);
        p2.id = "p2".to_string();
        let mut p3 = sample_packet(&owner);
        p3.id = "p3".to_string();

        bc.publish(p1);
        bc.publish(p2);
        bc.publish(p3);

        assert_eq!(queue.len(), 2);
        let first = queue.recv().await;
        assert_eq!(first.id, "p2"); // p1 was dropped as the oldest
        let second = queue.recv().await;
        assert_eq!(second.id, "p3");
    }

    #[tokio::test]
    async fn unsubscribe_last_reports_empty() {
        let bc = Broadcaster::new(10);
        let owner = OwnerId::anon("a");
        bc.subscribe(owner.clone(), "conn".to_string());

        let now_empty = bc.unsubscribe(&owner, "conn");
        assert!(now_empty);
        assert_eq!(bc.subscriber_count(&owner), 0);
    }

    #[tokio::test]
    async fn unsubscribe_with_remaining_subscriber_not_empty() {
        let bc = Broadcaster::new(10);
        let owner = OwnerId::anon("a");
        bc.subscribe(owner.clone(), "conn1".to_string());
        bc.subscribe(owner.clone(), "conn2".to_string());

        let now_empty = bc.unsubscribe(&owner, "conn1");
        assert!(!now_empty);
    }
}
