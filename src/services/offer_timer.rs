// src/services/offer_timer.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::models::ids::{DriverId, RideId};

/// An offer window ran out without an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferExpired {
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub token: String,
}

struct PendingOffer {
    token: String,
    handle: JoinHandle<()>,
}

/// Countdowns for outstanding offers, at most one per (ride, driver) pair.
///
/// Expiries are delivered on the channel returned by [`OfferTimer::new`]. An
/// expiry only counts if [`OfferTimer::complete`] confirms it is still the
/// live countdown for that pair; anything cancelled or replaced in the
/// meantime is stale.
#[derive(Clone)]
pub struct OfferTimer {
    pending: Arc<Mutex<HashMap<(RideId, DriverId), PendingOffer>>>,
    expired_tx: mpsc::UnboundedSender<OfferExpired>,
}

impl OfferTimer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OfferExpired>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let timer = Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            expired_tx,
        };
        (timer, expired_rx)
    }

    /// Start the countdown for an offer, replacing any previous one for the pair.
    pub async fn start(&self, ride_id: RideId, driver_id: DriverId, token: String, window: Duration) {
        let expiry = OfferExpired {
            ride_id: ride_id.clone(),
            driver_id: driver_id.clone(),
            token: token.clone(),
        };
        let tx = self.expired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if tx.send(expiry).is_err() {
                tracing::debug!("Offer expiry dropped, receiver gone");
            }
        });

        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.insert((ride_id, driver_id), PendingOffer { token, handle }) {
            previous.handle.abort();
        }
    }

    /// Stop the countdown for one pair. Returns whether one was running.
    pub async fn cancel(&self, ride_id: &RideId, driver_id: &DriverId) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.remove(&(ride_id.clone(), driver_id.clone())) {
            Some(offer) => {
                offer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every countdown attached to a ride.
    pub async fn cancel_ride(&self, ride_id: &RideId) -> usize {
        let mut pending = self.pending.lock().await;
        let keys: Vec<_> = pending.keys().filter(|(ride, _)| ride == ride_id).cloned().collect();
        for key in &keys {
            if let Some(offer) = pending.remove(key) {
                offer.handle.abort();
            }
        }
        if !keys.is_empty() {
            tracing::debug!("Cancelled {} offer timer(s) for ride {}", keys.len(), ride_id);
        }
        keys.len()
    }

    /// Retire the countdown an expiry came from. `false` means the expiry is
    /// stale and must be ignored.
    pub async fn complete(&self, expiry: &OfferExpired) -> bool {
        let mut pending = self.pending.lock().await;
        let key = (expiry.ride_id.clone(), expiry.driver_id.clone());
        match pending.get(&key) {
            Some(offer) if offer.token == expiry.token => {
                pending.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Instant, timeout};

    fn ids() -> (RideId, DriverId) {
        (RideId::from("rid-250101-a1b2c"), DriverId::from("drv-250101-aaaaa"))
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_the_window_elapses() {
        let (timer, mut rx) = OfferTimer::new();
        let (ride, driver) = ids();
        let started = Instant::now();
        timer.start(ride.clone(), driver.clone(), "t1".into(), Duration::from_secs(30)).await;

        assert!(timeout(Duration::from_secs(29), rx.recv()).await.is_err());
        let expiry = rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(expiry.token, "t1");

        assert!(timer.complete(&expiry).await);
        assert_eq!(timer.outstanding().await, 0);
        assert!(!timer.complete(&expiry).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_offer_never_fires() {
        let (timer, mut rx) = OfferTimer::new();
        let (ride, driver) = ids();
        timer.start(ride.clone(), driver.clone(), "t1".into(), Duration::from_secs(30)).await;

        assert!(timer.cancel(&ride, &driver).await);
        assert!(timeout(Duration::from_secs(120), rx.recv()).await.is_err());
        assert!(!timer.cancel(&ride, &driver).await);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_a_pair_replaces_the_countdown() {
        let (timer, mut rx) = OfferTimer::new();
        let (ride, driver) = ids();
        timer.start(ride.clone(), driver.clone(), "old".into(), Duration::from_secs(10)).await;
        timer.start(ride.clone(), driver.clone(), "new".into(), Duration::from_secs(30)).await;
        assert_eq!(timer.outstanding().await, 1);

        let expiry = rx.recv().await.unwrap();
        assert_eq!(expiry.token, "new");
        assert!(timer.complete(&expiry).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ride_clears_every_driver() {
        let (timer, mut rx) = OfferTimer::new();
        let (ride, driver) = ids();
        let other_ride = RideId::from("rid-250101-zzzzz");
        timer.start(ride.clone(), driver.clone(), "a".into(), Duration::from_secs(30)).await;
        timer.start(ride.clone(), DriverId::from("drv-250101-bbbbb"), "b".into(), Duration::from_secs(30)).await;
        timer.start(other_ride.clone(), driver.clone(), "c".into(), Duration::from_secs(30)).await;

        assert_eq!(timer.cancel_ride(&ride).await, 2);
        let expiry = rx.recv().await.unwrap();
        assert_eq!(expiry.ride_id, other_ride);
        assert!(timeout(Duration::from_secs(60), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_racing_a_cancel_is_stale() {
        let (timer, mut rx) = OfferTimer::new();
        let (ride, driver) = ids();
        timer.start(ride.clone(), driver.clone(), "t1".into(), Duration::from_secs(5)).await;
        let expiry = rx.recv().await.unwrap();

        // Answer arrived just after the window, before the expiry was handled
        timer.cancel(&ride, &driver).await;
        assert!(!timer.complete(&expiry).await);
    }
}
