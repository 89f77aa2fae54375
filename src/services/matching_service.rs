// src/services/matching_service.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::{
        driver::Driver,
        ids::{DriverId, RideId},
        negotiation::{Decision, Direction, NegotiationResponse},
        ride::{CancelRequest, CancelledBy, Ride, RideStatus},
    },
    services::{
        driver_service::{DriverOperations, DriverService},
        event_bus::{EventBus, Topic},
        negotiation_service::NegotiationArbiter,
        offer_timer::{OfferExpired, OfferTimer},
        ride_service::{RideOperations, RideService},
        store_service::{StoreKeys, StoreService, Versioned},
    },
    utils::geo::haversine_km,
};

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// How long a driver has to answer an offer, and a passenger a counter-offer.
    pub offer_window: Duration,
    pub max_pickup_radius_km: f64,
    /// Scheduled rides are held back until this close to their pickup time.
    pub schedule_lead: Duration,
    /// Offers per ride before the system gives up and cancels it.
    pub max_offers: u32,
    /// Period of the sweep over waiting and scheduled rides.
    pub sweep_interval: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            offer_window: Duration::from_secs(30),
            max_pickup_radius_km: 10.0,
            schedule_lead: Duration::from_secs(15 * 60),
            max_offers: 25,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Per-ride matching state: who must not be offered the ride again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingSession {
    pub ride_id: RideId,
    pub excluded: BTreeSet<DriverId>,
    pub offers_made: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl MatchingSession {
    fn new(ride_id: RideId) -> Self {
        let now = Utc::now();
        Self {
            ride_id,
            excluded: BTreeSet::new(),
            offers_made: 0,
            started_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

impl Versioned for MatchingSession {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Offered { driver_id: DriverId, distance_km: f64 },
    /// An offer is already out for this ride.
    Pending { driver_id: DriverId },
    NoCandidates,
    Scheduled { dispatch_after: DateTime<Utc> },
    /// Too many offers went unanswered; the ride was cancelled.
    Exhausted,
    NotSearching { status: RideStatus },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DriverDecision {
    Accept,
    Reject,
    Counter {
        fare: f64,
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub distance_km: f64,
}

/// Order the drivers that may be offered `ride`: closest first, ties by
/// driver id. Drivers that are excluded, out of range, or whose fare policy
/// would reject the ride's fare outright are left out.
pub fn rank_candidates(
    ride: &Ride,
    drivers: &[Driver],
    excluded: &BTreeSet<DriverId>,
    max_radius_km: f64,
    arbiter: &NegotiationArbiter,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = drivers
        .iter()
        .filter(|driver| driver.is_dispatchable() && !excluded.contains(&driver.id))
        .filter_map(|driver| {
            let location = driver.location.as_ref()?;
            let distance_km = haversine_km(
                ride.pickup.latitude,
                ride.pickup.longitude,
                location.latitude,
                location.longitude,
            );
            if distance_km > max_radius_km {
                return None;
            }
            let band = driver.fare_policy.band_for(ride.estimated_fare);
            let verdict = arbiter.decide(ride.fare, band, Direction::ToDriver);
            if verdict.decision == Decision::Rejected {
                tracing::debug!("Skipping driver {} for ride {}: {}", driver.id, ride.id, verdict.reason);
                return None;
            }
            Some(Candidate {
                driver_id: driver.id.clone(),
                distance_km,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.driver_id.cmp(&b.driver_id))
    });
    candidates
}

/// Hands open rides to drivers one offer at a time and reacts to their answers.
pub struct MatchingService {
    store: Arc<StoreService>,
    bus: Arc<EventBus>,
    rides: Arc<RideService>,
    drivers: Arc<DriverService>,
    arbiter: Arc<NegotiationArbiter>,
    timer: OfferTimer,
    config: MatchingConfig,
}

impl MatchingService {
    pub fn new(
        store: Arc<StoreService>,
        bus: Arc<EventBus>,
        rides: Arc<RideService>,
        drivers: Arc<DriverService>,
        arbiter: Arc<NegotiationArbiter>,
        timer: OfferTimer,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            bus,
            rides,
            drivers,
            arbiter,
            timer,
            config,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    async fn session(&self, ride_id: &RideId) -> SparrowResult<MatchingSession> {
        let key = StoreKeys::matching_session(ride_id);
        if let Some(session) = self.store.get(&key).await? {
            return Ok(session);
        }
        let mut session = MatchingSession::new(ride_id.clone());
        match self.store.insert(&key, &mut session).await {
            Ok(()) => Ok(session),
            // Someone else opened it first
            Err(AppError::Conflict(_)) => self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| AppError::not_found(key.render())),
            Err(e) => Err(e),
        }
    }

    async fn update_session<F>(&self, ride_id: &RideId, mut apply: F) -> SparrowResult<MatchingSession>
    where
        F: FnMut(&mut MatchingSession) + Send,
    {
        self.session(ride_id).await?;
        let (session, _) = self
            .store
            .transact(&StoreKeys::matching_session(ride_id), |session: &mut MatchingSession| {
                apply(session);
                session.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(session)
    }

    pub async fn excluded_drivers(&self, ride_id: &RideId) -> SparrowResult<BTreeSet<DriverId>> {
        Ok(self.session(ride_id).await?.excluded)
    }

    /// Keep `driver_id` away from this ride for the rest of its matching.
    pub async fn exclude(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<()> {
        self.update_session(ride_id, |session| {
            session.excluded.insert(driver_id.clone());
        })
        .await?;
        tracing::debug!("Driver {} excluded from ride {}", driver_id, ride_id);
        Ok(())
    }

    /// Take the offer back from a driver who declined it or let it lapse.
    /// The exclusion is stored before the withdrawal frees the driver, so no
    /// dispatch can see them both free and eligible for this ride.
    async fn drop_offer(&self, ride_id: &RideId, driver_id: &DriverId, token: Option<&str>) -> SparrowResult<bool> {
        self.exclude(ride_id, driver_id).await?;
        let withdrawn = self.rides.withdraw_offer(ride_id, driver_id, token).await?;
        if !withdrawn {
            self.close_if_matched(ride_id).await;
        }
        Ok(withdrawn)
    }

    /// Drop the session of a ride that left matching while a driver was
    /// being excluded from it.
    async fn close_if_matched(&self, ride_id: &RideId) {
        match self.rides.get_ride(ride_id).await {
            Ok(ride) if !matches!(ride.status, RideStatus::Searching | RideStatus::CounterOffered) => {
                self.close_session(ride_id).await
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Could not re-read ride {}: {}", ride_id, e),
        }
    }

    async fn close_session(&self, ride_id: &RideId) {
        let cleanup = async {
            self.store.delete(&StoreKeys::matching_session(ride_id)).await?;
            self.store
                .remove_from_index(&StoreKeys::waiting_rides(), ride_id.as_str())
                .await
        };
        if let Err(e) = cleanup.await {
            tracing::warn!("Could not close matching session for ride {}: {}", ride_id, e);
        }
    }

    /// Offer a searching ride to the best remaining candidate.
    pub async fn dispatch(&self, ride_id: &RideId) -> SparrowResult<DispatchOutcome> {
        let ride = self.rides.get_ride(ride_id).await?;
        if ride.status != RideStatus::Searching {
            self.close_session(ride_id).await;
            return Ok(DispatchOutcome::NotSearching { status: ride.status });
        }
        if let Some(driver_id) = ride.offered_to.clone() {
            return Ok(DispatchOutcome::Pending { driver_id });
        }

        let now = Utc::now();
        if let Some(at) = ride.scheduled_for {
            let lead = chrono::Duration::from_std(self.config.schedule_lead)
                .map_err(|e| AppError::InvalidConfiguration(e.to_string()))?;
            let dispatch_after = at - lead;
            if dispatch_after > now {
                self.store
                    .add_to_index(&StoreKeys::waiting_rides(), ride_id.as_str())
                    .await?;
                tracing::debug!("Ride {} is scheduled, dispatching after {}", ride_id, dispatch_after);
                return Ok(DispatchOutcome::Scheduled { dispatch_after });
            }
        }

        let session = self.session(ride_id).await?;
        if session.offers_made >= self.config.max_offers {
            tracing::info!("Ride {} exhausted {} offers, cancelling", ride_id, session.offers_made);
            let request = CancelRequest {
                cancelled_by: CancelledBy::System,
                code: "no-driver-found".to_string(),
                reason: format!("No driver accepted after {} offers", session.offers_made),
            };
            self.rides.cancel_ride(ride_id, request).await?;
            self.close_session(ride_id).await;
            return Ok(DispatchOutcome::Exhausted);
        }

        let drivers = self.drivers.available_drivers().await?;
        let candidates = rank_candidates(
            &ride,
            &drivers,
            &session.excluded,
            self.config.max_pickup_radius_km,
            &self.arbiter,
        );
        tracing::debug!("Ride {}: {} candidate(s) of {} available", ride_id, candidates.len(), drivers.len());

        for candidate in candidates {
            match self.drivers.reserve_offer(&candidate.driver_id, ride_id).await {
                Ok(_) => {}
                // Taken by another ride since the listing
                Err(AppError::DriverNotAvailable(_)) => continue,
                Err(e) => return Err(e),
            }

            if let Err(e) = self.rides.offer(ride_id, &candidate.driver_id, self.config.offer_window).await {
                if let Err(release) = self.drivers.release_offer(&candidate.driver_id, ride_id).await {
                    tracing::warn!("Could not release driver {}: {}", candidate.driver_id, release);
                }
                if !e.is_precondition_failure() {
                    return Err(e);
                }
                // The ride moved on under us
                let ride = self.rides.get_ride(ride_id).await?;
                return Ok(match ride.offered_to {
                    Some(driver_id) => DispatchOutcome::Pending { driver_id },
                    None => DispatchOutcome::NotSearching { status: ride.status },
                });
            }

            self.update_session(ride_id, |session| session.offers_made += 1).await?;
            self.store
                .remove_from_index(&StoreKeys::waiting_rides(), ride_id.as_str())
                .await?;
            return Ok(DispatchOutcome::Offered {
                driver_id: candidate.driver_id,
                distance_km: candidate.distance_km,
            });
        }

        self.store
            .add_to_index(&StoreKeys::waiting_rides(), ride_id.as_str())
            .await?;
        tracing::info!("No driver available for ride {}, waiting", ride_id);
        Ok(DispatchOutcome::NoCandidates)
    }

    async fn redispatch(&self, ride_id: &RideId) {
        match self.dispatch(ride_id).await {
            Ok(outcome) => tracing::debug!("Re-dispatch of ride {}: {:?}", ride_id, outcome),
            Err(e) => tracing::warn!("Re-dispatch of ride {} failed: {}", ride_id, e),
        }
    }

    /// A driver's answer to the ride they were offered.
    pub async fn respond(&self, ride_id: &RideId, driver_id: &DriverId, decision: DriverDecision) -> SparrowResult<Ride> {
        match decision {
            DriverDecision::Accept => self.accept(ride_id, driver_id).await,
            DriverDecision::Reject => {
                let not_held = || AppError::OfferNotHeld {
                    ride_id: ride_id.to_string(),
                    driver_id: driver_id.to_string(),
                };
                let ride = self.rides.get_ride(ride_id).await?;
                if ride.offered_to.as_ref() != Some(driver_id) {
                    return Err(not_held());
                }
                if !self.drop_offer(ride_id, driver_id, None).await? {
                    return Err(not_held());
                }
                tracing::info!("Driver {} rejected ride {}", driver_id, ride_id);
                self.redispatch(ride_id).await;
                self.rides.get_ride(ride_id).await
            }
            DriverDecision::Counter { fare, reason } => self.counter(ride_id, driver_id, fare, reason).await,
        }
    }

    async fn accept(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride> {
        if self.excluded_drivers(ride_id).await?.contains(driver_id) {
            return Err(AppError::Conflict(format!("driver {} is excluded from ride {}", driver_id, ride_id)));
        }
        match self.rides.claim(ride_id, driver_id).await {
            Ok(ride) => {
                self.close_session(ride_id).await;
                Ok(ride)
            }
            Err(e @ AppError::RideAlreadyClaimed { .. }) => {
                // The loser never sees this ride again
                self.exclude(ride_id, driver_id).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// A driver asking for a different fare than the ride was offered at.
    ///
    /// With a passenger ceiling (`max_fare`), a counter inside it binds the
    /// driver at once. A counter past the ceiling but within tolerance is put
    /// to the passenger at the arbiter's counter fare, just under the ceiling,
    /// and still waits for their answer: neither party has named that fare.
    /// Further out, the counter counts as the driver declining. Without a
    /// ceiling every counter waits for the passenger.
    async fn counter(&self, ride_id: &RideId, driver_id: &DriverId, fare: f64, reason: String) -> SparrowResult<Ride> {
        if !fare.is_finite() || fare <= 0.0 {
            return Err(AppError::invalid_value("fare", fare, "must be a positive amount"));
        }
        let ride = self.rides.get_ride(ride_id).await?;
        if ride.offered_to.as_ref() != Some(driver_id) {
            return Err(AppError::OfferNotHeld {
                ride_id: ride_id.to_string(),
                driver_id: driver_id.to_string(),
            });
        }

        let Some(band) = ride.passenger_band else {
            return self.rides.record_counter_offer(ride_id, driver_id, fare, reason).await;
        };

        let verdict = self.arbiter.decide(fare, band, Direction::ToPassenger);
        match verdict.decision {
            Decision::Accepted => {
                // Within what the passenger already agreed to pay
                self.rides.record_counter_offer(ride_id, driver_id, fare, reason).await?;
                let ride = self.rides.respond_to_counter(ride_id, true).await?;
                self.close_session(ride_id).await;
                Ok(ride)
            }
            Decision::CounterOffer => {
                let counter_fare = verdict.counter_fare.unwrap_or(band.max_fare);
                let reason = if reason.is_empty() { verdict.reason } else { reason };
                self.rides.record_counter_offer(ride_id, driver_id, counter_fare, reason).await
            }
            Decision::Rejected => {
                tracing::info!("Counter of {:.2} by driver {} on ride {} refused: {}", fare, driver_id, ride_id, verdict.reason);
                self.drop_offer(ride_id, driver_id, None).await?;
                self.redispatch(ride_id).await;
                self.rides.get_ride(ride_id).await
            }
        }
    }

    /// Answer the pending offer on the driver's behalf, using their fare policy.
    pub async fn negotiate(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<(NegotiationResponse, Ride)> {
        let ride = self.rides.get_ride(ride_id).await?;
        if ride.offered_to.as_ref() != Some(driver_id) {
            return Err(AppError::OfferNotHeld {
                ride_id: ride_id.to_string(),
                driver_id: driver_id.to_string(),
            });
        }
        let driver = self.drivers.get_driver(driver_id).await?;
        let band = driver.fare_policy.band_for(ride.estimated_fare);
        let response = self.arbiter.decide(ride.fare, band, Direction::ToDriver);

        let decision = match (response.decision, response.counter_fare) {
            (Decision::Accepted, _) => DriverDecision::Accept,
            (Decision::CounterOffer, Some(fare)) => DriverDecision::Counter {
                fare,
                reason: response.reason.clone(),
            },
            _ => DriverDecision::Reject,
        };
        let ride = self.respond(ride_id, driver_id, decision).await?;
        Ok((response, ride))
    }

    /// The passenger's answer to a pending counter-offer.
    pub async fn passenger_counter_response(&self, ride_id: &RideId, accept: bool) -> SparrowResult<Ride> {
        let ride = self.rides.get_ride(ride_id).await?;
        let counter = ride.counter_offer.clone().ok_or(AppError::InvalidTransition {
            from: ride.status,
            to: if accept { RideStatus::Accepted } else { RideStatus::Searching },
        })?;

        if accept {
            let ride = self.rides.respond_to_counter(ride_id, true).await?;
            self.close_session(ride_id).await;
            return Ok(ride);
        }

        self.decline_counter(ride_id, &counter.driver_id).await?;
        self.redispatch(ride_id).await;
        self.rides.get_ride(ride_id).await
    }

    /// Reopen a counter-offered ride, excluding the countering driver first.
    async fn decline_counter(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<()> {
        self.exclude(ride_id, driver_id).await?;
        if let Err(e) = self.rides.respond_to_counter(ride_id, false).await {
            self.close_if_matched(ride_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// An offer or counter-offer window ran out. Treated as a reject.
    pub async fn handle_offer_expired(&self, expiry: &OfferExpired) -> SparrowResult<()> {
        if !self.timer.complete(expiry).await {
            tracing::debug!("Ignoring stale expiry for ride {} / driver {}", expiry.ride_id, expiry.driver_id);
            return Ok(());
        }
        let ride = match self.rides.get_ride(&expiry.ride_id).await {
            Ok(ride) => ride,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let offer_lapsed = ride.status == RideStatus::Searching
            && ride.offered_to.as_ref() == Some(&expiry.driver_id)
            && ride.offer_token.as_deref() == Some(expiry.token.as_str());
        let counter_lapsed = ride.status == RideStatus::CounterOffered
            && ride
                .counter_offer
                .as_ref()
                .is_some_and(|c| c.driver_id == expiry.driver_id && c.token == expiry.token);

        if offer_lapsed {
            if self
                .drop_offer(&expiry.ride_id, &expiry.driver_id, Some(&expiry.token))
                .await?
            {
                tracing::info!("Offer of ride {} to driver {} timed out", expiry.ride_id, expiry.driver_id);
                self.redispatch(&expiry.ride_id).await;
            }
        } else if counter_lapsed {
            tracing::info!("Passenger did not answer counter-offer on ride {}", expiry.ride_id);
            self.decline_counter(&expiry.ride_id, &expiry.driver_id).await?;
            self.redispatch(&expiry.ride_id).await;
        }
        Ok(())
    }

    /// Retry every ride waiting for a driver or for its scheduled time.
    pub async fn dispatch_waiting(&self) -> SparrowResult<usize> {
        let mut waiting = self.store.index_members(&StoreKeys::waiting_rides()).await?;
        waiting.sort();
        let mut offered = 0;
        for id in waiting {
            let ride_id = RideId::from(id);
            match self.dispatch(&ride_id).await {
                Ok(DispatchOutcome::Offered { .. }) => offered += 1,
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    self.store
                        .remove_from_index(&StoreKeys::waiting_rides(), ride_id.as_str())
                        .await?;
                }
                Err(e) => tracing::warn!("Dispatch of waiting ride {} failed: {}", ride_id, e),
            }
        }
        Ok(offered)
    }

    pub fn spawn_expiry_worker(self: Arc<Self>, mut expired: mpsc::UnboundedReceiver<OfferExpired>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(expiry) = expired.recv().await {
                if let Err(e) = self.handle_offer_expired(&expiry).await {
                    tracing::warn!("Handling expiry for ride {} failed: {}", expiry.ride_id, e);
                }
            }
            tracing::info!("Offer expiry worker stopped");
        })
    }

    /// Re-dispatch waiting rides whenever a driver becomes free, and on a
    /// fixed sweep for scheduled rides.
    pub async fn spawn_dispatch_worker(self: Arc<Self>) -> JoinHandle<()> {
        let mut drivers = self.bus.subscribe(Topic::Drivers).await;
        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = drivers.recv() => {
                        let Some(event) = event else { break };
                        if !event.driver().is_some_and(Driver::is_dispatchable) {
                            continue;
                        }
                    }
                    _ = sweep.tick() => {}
                }
                if let Err(e) = self.dispatch_waiting().await {
                    tracing::warn!("Waiting-ride sweep failed: {}", e);
                }
            }
            tracing::info!("Dispatch worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::driver::{DriverStatus, FarePolicy, GeoPoint, PaymentModel};
    use crate::models::ids::UserId;
    use crate::models::review::RatingSummary;

    fn driver(id: &str, lat: f64, lng: f64) -> Driver {
        let now = Utc::now();
        Driver {
            id: DriverId::from(id),
            user_id: UserId::from("usr-250101-aaaaa"),
            display_name: id.to_string(),
            status: DriverStatus::Available,
            location: Some(GeoPoint { latitude: lat, longitude: lng, timestamp: now }),
            payment_model: PaymentModel::Commission,
            fare_policy: FarePolicy::default(),
            rating: RatingSummary::default(),
            total_rides: 0,
            current_offer: None,
            current_ride: None,
            device_token: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    fn ride() -> Ride {
        crate::models::ride::tests::sample_ride()
    }

    #[test]
    fn candidates_are_ordered_by_distance_then_id() {
        let ride = ride();
        let drivers = vec![
            driver("drv-250101-ccccc", 5.62, -0.18),
            driver("drv-250101-bbbbb", 5.61, -0.18),
            driver("drv-250101-aaaaa", 5.61, -0.18),
        ];
        let ranked = rank_candidates(&ride, &drivers, &BTreeSet::new(), 10.0, &NegotiationArbiter::default());
        let order: Vec<&str> = ranked.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(order, ["drv-250101-aaaaa", "drv-250101-bbbbb", "drv-250101-ccccc"]);
    }

    #[test]
    fn ranking_is_independent_of_input_order() {
        let ride = ride();
        let mut drivers = vec![
            driver("drv-250101-aaaaa", 5.63, -0.18),
            driver("drv-250101-bbbbb", 5.61, -0.17),
            driver("drv-250101-ccccc", 5.60, -0.19),
        ];
        let arbiter = NegotiationArbiter::default();
        let first = rank_candidates(&ride, &drivers, &BTreeSet::new(), 10.0, &arbiter);
        drivers.reverse();
        let second = rank_candidates(&ride, &drivers, &BTreeSet::new(), 10.0, &arbiter);
        assert_eq!(first, second);
    }

    #[test]
    fn excluded_busy_and_distant_drivers_are_skipped() {
        let ride = ride();
        let mut busy = driver("drv-250101-bbbbb", 5.60, -0.18);
        busy.current_offer = Some(RideId::from("rid-250101-zzzzz"));
        let drivers = vec![
            driver("drv-250101-aaaaa", 5.60, -0.18),
            busy,
            driver("drv-250101-ccccc", 6.60, -0.18), // ~110 km away
            driver("drv-250101-ddddd", 5.61, -0.18),
        ];
        let excluded: BTreeSet<DriverId> = [DriverId::from("drv-250101-aaaaa")].into_iter().collect();

        let ranked = rank_candidates(&ride, &drivers, &excluded, 10.0, &NegotiationArbiter::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].driver_id.as_str(), "drv-250101-ddddd");
    }

    #[test]
    fn drivers_whose_policy_rejects_the_fare_are_skipped() {
        let mut ride = ride();
        ride.fare = 5.0; // far below 90% of the 20.00 estimate
        let drivers = vec![driver("drv-250101-aaaaa", 5.60, -0.18)];
        let ranked = rank_candidates(&ride, &drivers, &BTreeSet::new(), 10.0, &NegotiationArbiter::default());
        assert!(ranked.is_empty());
    }

    #[test]
    fn decisions_deserialize_from_tagged_json() {
        let accept: DriverDecision = serde_json::from_str(r#"{"decision":"accept"}"#).unwrap();
        assert!(matches!(accept, DriverDecision::Accept));
        let counter: DriverDecision = serde_json::from_str(r#"{"decision":"counter","fare":24.5}"#).unwrap();
        assert!(matches!(counter, DriverDecision::Counter { fare, .. } if fare == 24.5));
    }
}
