// src/services/event_bus.rs
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::models::driver::Driver;
use crate::models::ride::Ride;

const DEFAULT_CAPACITY: usize = 256;
/// Documents a subscription remembers versions for before forgetting the oldest.
const SEEN_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every ride change (settlement worker).
    Rides,
    /// Every driver change (the matching coordinator's view of the fleet).
    Drivers,
}

#[derive(Debug, Clone)]
pub enum BusPayload {
    Ride(Box<Ride>),
    Driver(Box<Driver>),
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub id: Uuid,
    pub published_at: DateTime<Utc>,
    pub payload: BusPayload,
}

impl BusEvent {
    fn new(payload: BusPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            published_at: Utc::now(),
            payload,
        }
    }

    /// Identity of the document this event is a snapshot of.
    pub fn document_key(&self) -> String {
        match &self.payload {
            BusPayload::Ride(ride) => format!("ride:{}", ride.id),
            BusPayload::Driver(driver) => format!("driver:{}", driver.id),
        }
    }

    pub fn version(&self) -> u64 {
        match &self.payload {
            BusPayload::Ride(ride) => ride.version,
            BusPayload::Driver(driver) => driver.version,
        }
    }

    pub fn ride(&self) -> Option<&Ride> {
        match &self.payload {
            BusPayload::Ride(ride) => Some(ride),
            BusPayload::Driver(_) => None,
        }
    }

    pub fn driver(&self) -> Option<&Driver> {
        match &self.payload {
            BusPayload::Driver(driver) => Some(driver),
            BusPayload::Ride(_) => None,
        }
    }
}

/// In-process pub/sub over document changes. Topics are created on first
/// subscribe and dropped once nobody listens.
pub struct EventBus {
    channels: RwLock<HashMap<Topic, broadcast::Sender<BusEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> Subscription {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription {
            topic,
            receiver: sender.subscribe(),
            seen: HashMap::new(),
            order: VecDeque::new(),
            limit: SEEN_LIMIT,
        }
    }

    pub async fn publish_ride(&self, ride: &Ride) {
        self.publish(Topic::Rides, BusEvent::new(BusPayload::Ride(Box::new(ride.clone()))))
            .await;
    }

    pub async fn publish_driver(&self, driver: &Driver) {
        self.publish(Topic::Drivers, BusEvent::new(BusPayload::Driver(Box::new(driver.clone()))))
            .await;
    }

    async fn publish(&self, topic: Topic, event: BusEvent) {
        let idle = {
            let channels = self.channels.read().await;
            channels
                .get(&topic)
                .is_some_and(|sender| sender.send(event).is_err())
        };

        if idle {
            let mut channels = self.channels.write().await;
            if channels.get(&topic).is_some_and(|s| s.receiver_count() == 0) {
                tracing::debug!("Pruning idle topic {:?}", topic);
                channels.remove(&topic);
            }
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
///
/// Within one document's stream the subscriber only ever sees increasing
/// versions: snapshots that arrive late are skipped. Versions are kept for
/// at most `SEEN_LIMIT` documents, oldest first out, and a ride is
/// forgotten once it reaches a terminal status.
pub struct Subscription {
    topic: Topic,
    receiver: broadcast::Receiver<BusEvent>,
    seen: HashMap<String, u64>,
    order: VecDeque<String>,
    limit: usize,
}

impl Subscription {
    /// Next fresh event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.is_fresh(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber on {:?} lagged by {} events", self.topic, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn is_fresh(&mut self, event: &BusEvent) -> bool {
        let key = event.document_key();
        let version = event.version();
        if self.seen.get(&key).is_some_and(|&last| version <= last) {
            return false;
        }

        if event.ride().is_some_and(|ride| ride.status.is_terminal()) {
            self.seen.remove(&key);
        } else if self.seen.insert(key.clone(), version).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.limit {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ride::RideStatus;
    use std::time::Duration;

    fn ride(id: &str, version: u64, status: &str) -> Ride {
        let json = serde_json::json!({
            "id": id,
            "passenger_id": "usr-250101-a1b2c",
            "driver_id": null,
            "offered_to": "drv-250101-aaaaa",
            "offer_token": "tok",
            "offer_expires_at": null,
            "status": status,
            "pickup": {"latitude": 5.6, "longitude": -0.18, "address": "Osu"},
            "dropoff": {"latitude": 5.65, "longitude": -0.17, "address": "Legon"},
            "distance_km": 5.0,
            "duration_minutes": 15.0,
            "service_type": "economy",
            "estimated_fare": 20.0,
            "fare": 20.0,
            "fare_breakdown": {
                "baseFare": 5.0, "distanceCost": 7.5, "durationCost": 7.5,
                "serviceMultiplier": 1.0, "serviceCost": 0.0, "peakSurcharge": 0.0,
                "specialDaySurcharge": 0.0, "couponDiscount": 0.0,
                "subtotal": 20.0, "total": 20.0
            },
            "coupon_code": null,
            "passenger_band": null,
            "counter_offer": null,
            "cancelled_by": null,
            "cancellation_reason": null,
            "ratings": {"passenger_rated_driver": false, "driver_rated_passenger": false},
            "date": "2025-01-01T10:00:00Z",
            "scheduled_for": null,
            "accepted_at": null,
            "arrived_at": null,
            "started_at": null,
            "completed_at": null,
            "cancelled_at": null,
            "updated_at": "2025-01-01T10:00:00Z",
            "version": version
        });
        serde_json::from_value(json).unwrap()
    }

    fn searching(version: u64) -> Ride {
        ride("rid-250101-a1b2c", version, "searching")
    }

    #[tokio::test]
    async fn ride_changes_reach_ride_subscribers() {
        let bus = EventBus::default();
        let mut first = bus.subscribe(Topic::Rides).await;
        let mut second = bus.subscribe(Topic::Rides).await;
        let mut drivers = bus.subscribe(Topic::Drivers).await;

        bus.publish_ride(&searching(1)).await;

        assert_eq!(first.recv().await.unwrap().ride().unwrap().status, RideStatus::Searching);
        assert!(second.recv().await.is_some());
        let nothing = tokio::time::timeout(Duration::from_millis(20), drivers.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn stale_versions_are_skipped() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(Topic::Rides).await;

        bus.publish_ride(&searching(3)).await;
        bus.publish_ride(&searching(2)).await;
        bus.publish_ride(&searching(4)).await;

        assert_eq!(sub.recv().await.unwrap().version(), 3);
        assert_eq!(sub.recv().await.unwrap().version(), 4);
        let nothing = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn terminal_rides_are_forgotten() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(Topic::Rides).await;

        bus.publish_ride(&ride("rid-250101-aaaaa", 1, "searching")).await;
        bus.publish_ride(&ride("rid-250101-aaaaa", 2, "completed")).await;
        bus.publish_ride(&ride("rid-250101-bbbbb", 1, "cancelled")).await;

        for _ in 0..3 {
            assert!(sub.recv().await.is_some());
        }
        assert!(sub.seen.is_empty());
    }

    #[tokio::test]
    async fn remembered_versions_are_bounded() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(Topic::Rides).await;
        sub.limit = 2;

        for id in ["rid-250101-aaaaa", "rid-250101-bbbbb", "rid-250101-ccccc"] {
            bus.publish_ride(&ride(id, 5, "searching")).await;
            assert!(sub.recv().await.is_some());
        }
        assert_eq!(sub.seen.len(), 2);
        assert!(!sub.seen.contains_key("ride:rid-250101-aaaaa"));
        assert_eq!(sub.order.len(), 2);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let bus = EventBus::default();
        let sub = bus.subscribe(Topic::Rides).await;
        assert_eq!(bus.channels.read().await.len(), 1);
        drop(sub);

        bus.publish_ride(&searching(1)).await;
        assert!(bus.channels.read().await.is_empty());
    }
}
