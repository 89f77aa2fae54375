// src/services/ride_service.rs
use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::{
        fare::FareEstimateRequest,
        ids::{DriverId, PartyRef, RideId, UserId},
        negotiation::{CounterOffer, FareBand},
        ride::{CancellationReason, CancelRequest, RatingFlags, Ride, RideRequest, RideStatus, RideTransition},
        user::User,
    },
    services::{
        driver_service::{DriverOperations, DriverService},
        event_bus::EventBus,
        fare_service::FareCalculator,
        messaging_service::NotificationService,
        offer_timer::OfferTimer,
        store_service::{StoreKey, StoreKeys, StoreService},
        user_service::{UserOperations, UserService},
    },
    utils::{id_generator::IdGenerator, money::round2},
};

#[async_trait]
pub trait RideOperations: Send + Sync {
    async fn create_ride(&self, request: RideRequest) -> SparrowResult<Ride>;
    async fn get_ride(&self, ride_id: &RideId) -> SparrowResult<Ride>;
    async fn rides_for_passenger(&self, passenger_id: &UserId) -> SparrowResult<Vec<Ride>>;
    async fn rides_for_driver(&self, driver_id: &DriverId) -> SparrowResult<Vec<Ride>>;
    async fn claim(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride>;
    async fn record_counter_offer(&self, ride_id: &RideId, driver_id: &DriverId, fare: f64, reason: String) -> SparrowResult<Ride>;
    async fn respond_to_counter(&self, ride_id: &RideId, accept: bool) -> SparrowResult<Ride>;
    async fn mark_arrived(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride>;
    async fn start_trip(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride>;
    async fn complete_trip(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride>;
    async fn cancel_ride(&self, ride_id: &RideId, request: CancelRequest) -> SparrowResult<Ride>;
}

/// Owns every write to a ride document. Each change goes through
/// [`Ride::apply`] inside a store transaction and is then published.
pub struct RideService {
    store: Arc<StoreService>,
    bus: Arc<EventBus>,
    fares: Arc<FareCalculator>,
    drivers: Arc<DriverService>,
    users: Arc<UserService>,
    timer: OfferTimer,
    notifier: Arc<dyn NotificationService>,
    response_window: Duration,
}

impl RideService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StoreService>,
        bus: Arc<EventBus>,
        fares: Arc<FareCalculator>,
        drivers: Arc<DriverService>,
        users: Arc<UserService>,
        timer: OfferTimer,
        notifier: Arc<dyn NotificationService>,
        response_window: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            fares,
            drivers,
            users,
            timer,
            notifier,
            response_window,
        }
    }

    pub fn fares(&self) -> &FareCalculator {
        &self.fares
    }

    /// Run `apply` against the stored ride and publish the result. Also
    /// returns the drivers that were attached before the change and are not
    /// any more.
    async fn commit<R, F>(&self, ride_id: &RideId, mut apply: F) -> SparrowResult<(Ride, R, Vec<DriverId>)>
    where
        R: Send,
        F: FnMut(&mut Ride) -> SparrowResult<R> + Send,
    {
        let (ride, (result, before)) = self
            .store
            .transact(&StoreKeys::ride(ride_id), |ride: &mut Ride| {
                let before = ride.attached_drivers();
                let result = apply(ride)?;
                Ok((result, before))
            })
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => AppError::RideNotFound(ride_id.to_string()),
                other => other,
            })?;

        let after = ride.attached_drivers();
        let detached: Vec<DriverId> = before.into_iter().filter(|d| !after.contains(d)).collect();
        self.bus.publish_ride(&ride).await;
        Ok((ride, result, detached))
    }

    async fn notify_status(&self, ride: &Ride) {
        if let Err(e) = self.notifier.notify_ride_status(ride).await {
            tracing::warn!("Status notification for ride {} failed: {}", ride.id, e);
        }
    }

    async fn release_drivers(&self, ride_id: &RideId, drivers: &[DriverId]) {
        for driver_id in drivers {
            if let Err(e) = self.drivers.finish_ride(driver_id, ride_id, false).await {
                tracing::warn!("Could not release driver {} from ride {}: {}", driver_id, ride_id, e);
            }
        }
    }

    /// Offer an open ride to one driver and start its response window.
    pub async fn offer(&self, ride_id: &RideId, driver_id: &DriverId, window: Duration) -> SparrowResult<Ride> {
        let token = IdGenerator::offer_token();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(window.as_millis() as i64);
        let (ride, _, _) = self
            .commit(ride_id, |ride| ride.offer_to(driver_id.clone(), token.clone(), expires_at, now))
            .await?;

        self.timer.start(ride_id.clone(), driver_id.clone(), token, window).await;
        tracing::info!("Ride {} offered to driver {} until {}", ride_id, driver_id, expires_at);

        if let Err(e) = self.notifier.notify_offer(&ride, driver_id).await {
            tracing::warn!("Offer notification to driver {} failed: {}", driver_id, e);
        }
        Ok(ride)
    }

    /// Take back a pending offer. With a token, only that specific offer is
    /// withdrawn. Returns whether the driver still held it.
    pub async fn withdraw_offer(&self, ride_id: &RideId, driver_id: &DriverId, token: Option<&str>) -> SparrowResult<bool> {
        let now = Utc::now();
        let (_, withdrawn, _) = self
            .commit(ride_id, |ride| Ok(ride.withdraw_offer(driver_id, token, now)))
            .await?;
        if withdrawn {
            self.timer.cancel(ride_id, driver_id).await;
            self.release_drivers(ride_id, std::slice::from_ref(driver_id)).await;
            tracing::info!("Offer of ride {} to driver {} withdrawn", ride_id, driver_id);
        }
        Ok(withdrawn)
    }

    /// Flag on the ride that `rater` has left their post-trip rating.
    pub async fn mark_rated(&self, ride_id: &RideId, rater: &PartyRef) -> SparrowResult<Ride> {
        let (ride, _, _) = self
            .commit(ride_id, |ride| {
                match rater {
                    PartyRef::Passenger(_) => ride.ratings.passenger_rated_driver = true,
                    PartyRef::Driver(_) => ride.ratings.driver_rated_passenger = true,
                }
                ride.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(ride)
    }

    /// Bind `driver_id` to the ride. With `expected_counter`, the claim only
    /// goes through while that exact counter-offer is still pending.
    async fn bind(&self, ride_id: &RideId, driver_id: &DriverId, expected_counter: Option<&str>) -> SparrowResult<Ride> {
        // Driver first: a driver can carry at most one ride
        self.drivers.bind_ride(driver_id, ride_id).await?;

        let now = Utc::now();
        let outcome = self
            .commit(ride_id, |ride| {
                ride.apply(
                    RideTransition::Claim {
                        driver_id: driver_id.clone(),
                        counter_token: expected_counter.map(str::to_string),
                    },
                    now,
                )
            })
            .await;

        match outcome {
            Ok((ride, _, detached)) => {
                self.timer.cancel_ride(ride_id).await;
                self.release_drivers(ride_id, &detached).await;
                tracing::info!("Ride {} accepted by driver {} at {:.2}", ride_id, driver_id, ride.fare);
                self.notify_status(&ride).await;
                Ok(ride)
            }
            Err(e) => {
                self.release_drivers(ride_id, std::slice::from_ref(driver_id)).await;
                tracing::info!("Driver {} lost ride {}: {}", driver_id, ride_id, e);
                Err(e)
            }
        }
    }

    /// Newest first.
    async fn indexed_rides(&self, index: &StoreKey) -> SparrowResult<Vec<Ride>> {
        let ids = self.store.index_members(index).await?;
        let lookups = ids.iter().map(|id| {
            let key = StoreKeys::ride(&RideId::from(id.as_str()));
            let store = self.store.clone();
            async move { store.get::<Ride>(&key).await }
        });

        let mut rides: Vec<Ride> = try_join_all(lookups).await?.into_iter().flatten().collect();
        rides.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        Ok(rides)
    }

    async fn progress(&self, ride_id: &RideId, driver_id: &DriverId, transition: RideTransition) -> SparrowResult<Ride> {
        let now = Utc::now();
        let (ride, _, _) = self
            .commit(ride_id, |ride| {
                if !ride.is_bound_to(driver_id) {
                    return Err(AppError::OfferNotHeld {
                        ride_id: ride.id.to_string(),
                        driver_id: driver_id.to_string(),
                    });
                }
                ride.apply(transition.clone(), now)
            })
            .await?;
        tracing::info!("Ride {} is now {}", ride_id, ride.status);
        self.notify_status(&ride).await;
        Ok(ride)
    }
}

#[async_trait]
impl RideOperations for RideService {
    async fn create_ride(&self, request: RideRequest) -> SparrowResult<Ride> {
        if !request.pickup.is_valid() {
            return Err(AppError::invalid_value(
                "pickup",
                format!("{},{}", request.pickup.latitude, request.pickup.longitude),
                "not a valid coordinate",
            ));
        }
        if !request.dropoff.is_valid() {
            return Err(AppError::invalid_value(
                "dropoff",
                format!("{},{}", request.dropoff.latitude, request.dropoff.longitude),
                "not a valid coordinate",
            ));
        }
        let now = Utc::now();
        if let Some(at) = request.scheduled_for {
            if at < now {
                return Err(AppError::invalid_value("scheduled_for", at.to_rfc3339(), "is in the past"));
            }
        }
        self.users.get_user(&request.passenger_id).await?;

        let (distance_km, duration_minutes) = match (request.distance_km, request.duration_minutes) {
            (Some(d), Some(m)) => (d, m),
            (d, m) => {
                let (estimated_d, estimated_m) = self.fares.estimate_trip(&request.pickup, &request.dropoff);
                (d.unwrap_or(estimated_d), m.unwrap_or(estimated_m))
            }
        };

        let breakdown = self.fares.calculate(
            &FareEstimateRequest {
                distance_km,
                duration_minutes,
                service_type: request.service_type.clone(),
                ride_date: request.scheduled_for,
                coupon_code: request.coupon_code.clone(),
            },
            now,
        )?;

        let fare = match request.proposed_fare {
            Some(f) if f.is_finite() && f > 0.0 => round2(f),
            Some(f) => return Err(AppError::invalid_value("proposed_fare", f, "must be a positive amount")),
            None => breakdown.total,
        };
        let passenger_band = match request.max_fare {
            Some(max) if max.is_finite() && max >= fare => Some(FareBand::new(0.0, round2(max))),
            Some(max) => return Err(AppError::invalid_value("max_fare", max, "must be at least the proposed fare")),
            None => None,
        };

        let mut ride = Ride {
            id: RideId::generate(),
            passenger_id: request.passenger_id,
            driver_id: None,
            offered_to: None,
            offer_token: None,
            offer_expires_at: None,
            status: RideStatus::Searching,
            pickup: request.pickup,
            dropoff: request.dropoff,
            distance_km,
            duration_minutes,
            service_type: request.service_type,
            estimated_fare: breakdown.total,
            fare,
            fare_breakdown: breakdown,
            coupon_code: request.coupon_code,
            passenger_band,
            counter_offer: None,
            cancelled_by: None,
            cancellation_reason: None,
            ratings: RatingFlags::default(),
            date: now,
            scheduled_for: request.scheduled_for,
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            updated_at: now,
            version: 0,
        };

        self.store.insert(&StoreKeys::ride(&ride.id), &mut ride).await?;
        self.store
            .add_to_index(&StoreKeys::rides_by_passenger(&ride.passenger_id), ride.id.as_str())
            .await?;
        self.bus.publish_ride(&ride).await;

        tracing::info!(
            "Ride {} created for passenger {}: {:.2} km, fare {:.2} (estimate {:.2})",
            ride.id,
            ride.passenger_id,
            ride.distance_km,
            ride.fare,
            ride.estimated_fare
        );
        Ok(ride)
    }

    async fn get_ride(&self, ride_id: &RideId) -> SparrowResult<Ride> {
        tracing::debug!("Getting ride: {}", ride_id);
        self.store
            .get(&StoreKeys::ride(ride_id))
            .await?
            .ok_or_else(|| AppError::RideNotFound(ride_id.to_string()))
    }

    async fn rides_for_passenger(&self, passenger_id: &UserId) -> SparrowResult<Vec<Ride>> {
        self.indexed_rides(&StoreKeys::rides_by_passenger(passenger_id)).await
    }

    /// Rides this driver ended up bound to. The index also records claims
    /// the driver lost, so those are filtered out here.
    async fn rides_for_driver(&self, driver_id: &DriverId) -> SparrowResult<Vec<Ride>> {
        self.drivers.get_driver(driver_id).await?;
        let mut rides = self.indexed_rides(&StoreKeys::rides_by_driver(driver_id)).await?;
        rides.retain(|ride| ride.driver_id.as_ref() == Some(driver_id));
        Ok(rides)
    }

    /// A driver taking an open ride. Only `searching` rides can be claimed;
    /// a pending counter-offer is settled through [`respond_to_counter`](Self::respond_to_counter).
    async fn claim(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride> {
        self.drivers.get_driver(driver_id).await?;
        let ride = self.get_ride(ride_id).await?;
        if ride.status != RideStatus::Searching {
            if let (Some(holder), false) = (&ride.driver_id, ride.status.is_terminal()) {
                return Err(AppError::RideAlreadyClaimed {
                    ride_id: ride_id.to_string(),
                    driver_id: holder.to_string(),
                });
            }
            return Err(AppError::InvalidTransition {
                from: ride.status,
                to: RideStatus::Accepted,
            });
        }
        self.bind(ride_id, driver_id, None).await
    }

    async fn record_counter_offer(&self, ride_id: &RideId, driver_id: &DriverId, fare: f64, reason: String) -> SparrowResult<Ride> {
        if !fare.is_finite() || fare <= 0.0 {
            return Err(AppError::invalid_value("fare", fare, "must be a positive amount"));
        }

        let counter = CounterOffer {
            driver_id: driver_id.clone(),
            fare: round2(fare),
            reason,
            token: IdGenerator::offer_token(),
        };
        let token = counter.token.clone();
        let now = Utc::now();
        let (ride, _, _) = self
            .commit(ride_id, |ride| ride.apply(RideTransition::Counter(counter.clone()), now))
            .await?;

        // The passenger gets the same window to answer
        self.timer
            .start(ride_id.clone(), driver_id.clone(), token, self.response_window)
            .await;
        tracing::info!("Driver {} countered ride {} at {:.2}", driver_id, ride_id, counter.fare);

        if let Err(e) = self.notifier.notify_counter_offer(&ride).await {
            tracing::warn!("Counter-offer notification for ride {} failed: {}", ride_id, e);
        }
        Ok(ride)
    }

    async fn respond_to_counter(&self, ride_id: &RideId, accept: bool) -> SparrowResult<Ride> {
        let current = self.get_ride(ride_id).await?;
        let counter = current.counter_offer.clone().ok_or(AppError::InvalidTransition {
            from: current.status,
            to: if accept { RideStatus::Accepted } else { RideStatus::Searching },
        })?;

        if accept {
            return self.bind(ride_id, &counter.driver_id, Some(&counter.token)).await;
        }

        let now = Utc::now();
        let (ride, _, detached) = self
            .commit(ride_id, |ride| {
                if ride.counter_offer.as_ref().map(|c| &c.token) != Some(&counter.token) {
                    return Err(AppError::InvalidTransition {
                        from: ride.status,
                        to: RideStatus::Searching,
                    });
                }
                ride.apply(RideTransition::CounterRejected, now)
            })
            .await?;
        self.timer.cancel(ride_id, &counter.driver_id).await;
        self.release_drivers(ride_id, &detached).await;
        tracing::info!("Counter-offer by driver {} on ride {} rejected", counter.driver_id, ride_id);
        Ok(ride)
    }

    async fn mark_arrived(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride> {
        self.progress(ride_id, driver_id, RideTransition::Arrive).await
    }

    async fn start_trip(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride> {
        self.progress(ride_id, driver_id, RideTransition::Start).await
    }

    async fn complete_trip(&self, ride_id: &RideId, driver_id: &DriverId) -> SparrowResult<Ride> {
        let ride = self.progress(ride_id, driver_id, RideTransition::Complete).await?;

        if let Err(e) = self.drivers.finish_ride(driver_id, ride_id, true).await {
            tracing::warn!("Could not release driver {} after ride {}: {}", driver_id, ride_id, e);
        }
        let passenger = self
            .store
            .transact(&StoreKeys::user(&ride.passenger_id), |user: &mut User| {
                user.total_rides += 1;
                user.updated_at = Utc::now();
                Ok(())
            })
            .await;
        if let Err(e) = passenger {
            tracing::warn!("Could not count ride {} for passenger {}: {}", ride_id, ride.passenger_id, e);
        }
        Ok(ride)
    }

    async fn cancel_ride(&self, ride_id: &RideId, request: CancelRequest) -> SparrowResult<Ride> {
        if request.code.trim().is_empty() {
            return Err(AppError::validation_error("code", "Cancellation code is required"));
        }

        let reason = CancellationReason {
            code: request.code.trim().to_string(),
            reason: request.reason,
        };
        let now = Utc::now();
        let (ride, _, detached) = self
            .commit(ride_id, |ride| {
                ride.apply(
                    RideTransition::Cancel {
                        by: request.cancelled_by,
                        reason: reason.clone(),
                    },
                    now,
                )
            })
            .await?;

        self.timer.cancel_ride(ride_id).await;
        // The bound driver stays attached on the document but is free again
        let mut released = detached;
        released.extend(ride.driver_id.iter().cloned());
        self.release_drivers(ride_id, &released).await;

        tracing::info!("Ride {} cancelled by {:?} ({})", ride_id, request.cancelled_by, reason.code);
        self.notify_status(&ride).await;
        Ok(ride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::driver::{DriverLocationUpdate, DriverRegistration, DriverStatus};
    use crate::models::ride::{CancelledBy, Location};
    use crate::models::user::{UserRegistration, UserType};
    use crate::services::messaging_service::{MockNotificationService, SentNotification};

    struct Fixture {
        rides: RideService,
        drivers: Arc<DriverService>,
        notifier: Arc<MockNotificationService>,
        passenger: UserId,
        timer: OfferTimer,
        _expired: tokio::sync::mpsc::UnboundedReceiver<crate::services::offer_timer::OfferExpired>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(StoreService::new_memory());
        let bus = Arc::new(EventBus::default());
        let users = Arc::new(UserService::new(store.clone()));
        let drivers = Arc::new(DriverService::new(store.clone(), bus.clone()));
        let notifier = Arc::new(MockNotificationService::new());
        let (timer, expired) = OfferTimer::new();
        let passenger = users
            .register_user(UserRegistration {
                user_type: UserType::Passenger,
                first_name: "Ama".into(),
                last_name: "Owusu".into(),
                phone_number: "+233241234567".into(),
                device_token: None,
            })
            .await
            .unwrap()
            .id;
        let rides = RideService::new(
            store,
            bus,
            Arc::new(FareCalculator::default()),
            drivers.clone(),
            users,
            timer.clone(),
            notifier.clone(),
            Duration::from_secs(30),
        );
        Fixture { rides, drivers, notifier, passenger, timer, _expired: expired }
    }

    impl Fixture {
        async fn online_driver(&self, name: &str) -> DriverId {
            let user = UserService::new(self.rides.store.clone())
                .register_user(UserRegistration {
                    user_type: UserType::Driver,
                    first_name: name.into(),
                    last_name: "Driver".into(),
                    phone_number: "+233200000000".into(),
                    device_token: None,
                })
                .await
                .unwrap();
            let driver = self
                .drivers
                .register_driver(DriverRegistration {
                    user_id: user.id,
                    display_name: name.into(),
                    payment_model: Default::default(),
                    fare_policy: None,
                    device_token: None,
                })
                .await
                .unwrap();
            self.drivers.set_availability(&driver.id, DriverStatus::Available).await.unwrap();
            self.drivers
                .update_location(&driver.id, DriverLocationUpdate { latitude: 5.60, longitude: -0.18 })
                .await
                .unwrap();
            driver.id
        }

        async fn request(&self) -> Ride {
            self.rides
                .create_ride(RideRequest {
                    passenger_id: self.passenger.clone(),
                    pickup: Location { latitude: 5.6037, longitude: -0.1870, address: "Osu".into() },
                    dropoff: Location { latitude: 5.6500, longitude: -0.1860, address: "Legon".into() },
                    service_type: "economy".into(),
                    distance_km: Some(5.0),
                    duration_minutes: Some(15.0),
                    coupon_code: None,
                    proposed_fare: None,
                    max_fare: Some(40.0),
                    scheduled_for: None,
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn created_ride_is_searching_with_a_full_breakdown() {
        let fx = fixture().await;
        let ride = fx.request().await;
        assert_eq!(ride.status, RideStatus::Searching);
        assert_eq!(ride.fare, ride.fare_breakdown.total);
        assert_eq!(ride.passenger_band, Some(FareBand::new(0.0, 40.0)));
        assert_eq!(fx.rides.rides_for_passenger(&fx.passenger).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_passenger_cannot_request() {
        let fx = fixture().await;
        let mut req = RideRequest {
            passenger_id: UserId::from("usr-250101-zzzzz"),
            pickup: Location { latitude: 5.6, longitude: -0.18, address: "A".into() },
            dropoff: Location { latitude: 5.7, longitude: -0.18, address: "B".into() },
            service_type: "economy".into(),
            distance_km: None,
            duration_minutes: None,
            coupon_code: None,
            proposed_fare: None,
            max_fare: None,
            scheduled_for: None,
        };
        let err = fx.rides.create_ride(req.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::UserNotFound(_)));

        req.passenger_id = fx.passenger.clone();
        req.max_fare = Some(1.0);
        let err = fx.rides.create_ride(req).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidFieldValue { ref field, .. } if field == "max_fare"));
    }

    #[tokio::test]
    async fn full_trip_lifecycle() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let ride = fx.request().await;

        let ride = fx.rides.claim(&ride.id, &driver).await.unwrap();
        assert_eq!(ride.status, RideStatus::Accepted);
        assert!(ride.is_bound_to(&driver));
        assert!(ride.offered_to.is_none());

        fx.rides.mark_arrived(&ride.id, &driver).await.unwrap();
        fx.rides.start_trip(&ride.id, &driver).await.unwrap();
        let done = fx.rides.complete_trip(&ride.id, &driver).await.unwrap();
        assert_eq!(done.status, RideStatus::Completed);
        assert!(done.completed_at.is_some());

        let after = fx.drivers.get_driver(&driver).await.unwrap();
        assert_eq!(after.status, DriverStatus::Available);
        assert_eq!(after.total_rides, 1);

        let sent = fx.notifier.sent().await;
        assert!(sent.contains(&SentNotification::Status {
            ride_id: ride.id.to_string(),
            status: "completed".into(),
        }));
    }

    #[tokio::test]
    async fn only_the_bound_driver_progresses_the_trip() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let other = fx.online_driver("Yaw").await;
        let ride = fx.request().await;
        fx.rides.claim(&ride.id, &driver).await.unwrap();

        let err = fx.rides.mark_arrived(&ride.id, &other).await.unwrap_err();
        assert!(matches!(err, AppError::OfferNotHeld { .. }));
        let err = fx.rides.start_trip(&ride.id, &driver).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition { from: RideStatus::Accepted, to: RideStatus::InProgress }
        ));
    }

    #[tokio::test]
    async fn completed_ride_cannot_be_cancelled() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let ride = fx.request().await;
        fx.rides.claim(&ride.id, &driver).await.unwrap();
        fx.rides.mark_arrived(&ride.id, &driver).await.unwrap();
        fx.rides.start_trip(&ride.id, &driver).await.unwrap();
        fx.rides.complete_trip(&ride.id, &driver).await.unwrap();

        let err = fx
            .rides
            .cancel_ride(
                &ride.id,
                CancelRequest { cancelled_by: CancelledBy::Passenger, code: "changed-mind".into(), reason: String::new() },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition { from: RideStatus::Completed, to: RideStatus::Cancelled }
        ));
        assert_eq!(fx.rides.get_ride(&ride.id).await.unwrap().status, RideStatus::Completed);
    }

    #[tokio::test]
    async fn cancelling_frees_the_offered_driver_and_its_timer() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let ride = fx.request().await;
        fx.drivers.reserve_offer(&driver, &ride.id).await.unwrap();
        fx.rides.offer(&ride.id, &driver, Duration::from_secs(30)).await.unwrap();
        assert_eq!(fx.timer.outstanding().await, 1);

        let cancelled = fx
            .rides
            .cancel_ride(
                &ride.id,
                CancelRequest { cancelled_by: CancelledBy::Passenger, code: "changed-mind".into(), reason: "late".into() },
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by, Some(CancelledBy::Passenger));
        assert_eq!(cancelled.cancellation_reason.unwrap().code, "changed-mind");
        assert_eq!(fx.timer.outstanding().await, 0);
        assert!(fx.drivers.get_driver(&driver).await.unwrap().is_dispatchable());
    }

    #[tokio::test]
    async fn accepted_counter_sets_the_fare() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let ride = fx.request().await;
        fx.drivers.reserve_offer(&driver, &ride.id).await.unwrap();
        fx.rides.offer(&ride.id, &driver, Duration::from_secs(30)).await.unwrap();

        let countered = fx
            .rides
            .record_counter_offer(&ride.id, &driver, 26.0, "traffic on the motorway".into())
            .await
            .unwrap();
        assert_eq!(countered.status, RideStatus::CounterOffered);
        assert!(countered.offered_to.is_none());

        let accepted = fx.rides.respond_to_counter(&ride.id, true).await.unwrap();
        assert_eq!(accepted.status, RideStatus::Accepted);
        assert_eq!(accepted.fare, 26.0);
        assert!(accepted.is_bound_to(&driver));
        assert_eq!(fx.timer.outstanding().await, 0);
    }

    #[tokio::test]
    async fn claim_does_not_settle_a_pending_counter() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let ride = fx.request().await;
        fx.drivers.reserve_offer(&driver, &ride.id).await.unwrap();
        fx.rides.offer(&ride.id, &driver, Duration::from_secs(30)).await.unwrap();
        fx.rides.record_counter_offer(&ride.id, &driver, 26.0, String::new()).await.unwrap();

        let err = fx.rides.claim(&ride.id, &driver).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition { from: RideStatus::CounterOffered, to: RideStatus::Accepted }
        ));
        let pending = fx.rides.get_ride(&ride.id).await.unwrap();
        assert_eq!(pending.status, RideStatus::CounterOffered);
        assert_eq!(pending.fare, ride.fare);
        assert!(pending.driver_id.is_none());
        assert_eq!(fx.drivers.get_driver(&driver).await.unwrap().status, DriverStatus::Available);
    }

    #[tokio::test]
    async fn rejected_counter_reopens_the_ride() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let ride = fx.request().await;
        fx.drivers.reserve_offer(&driver, &ride.id).await.unwrap();
        fx.rides.offer(&ride.id, &driver, Duration::from_secs(30)).await.unwrap();
        fx.rides.record_counter_offer(&ride.id, &driver, 26.0, String::new()).await.unwrap();

        let reopened = fx.rides.respond_to_counter(&ride.id, false).await.unwrap();
        assert_eq!(reopened.status, RideStatus::Searching);
        assert!(reopened.counter_offer.is_none());
        assert_eq!(reopened.fare, ride.fare);
        assert!(fx.drivers.get_driver(&driver).await.unwrap().is_dispatchable());

        let err = fx.rides.respond_to_counter(&ride.id, true).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn counter_needs_a_held_offer() {
        let fx = fixture().await;
        let driver = fx.online_driver("Kofi").await;
        let ride = fx.request().await;
        let err = fx
            .rides
            .record_counter_offer(&ride.id, &driver, 26.0, String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OfferNotHeld { .. }));
    }

    #[tokio::test]
    async fn losing_claimant_is_released() {
        let fx = fixture().await;
        let winner = fx.online_driver("Kofi").await;
        let loser = fx.online_driver("Yaw").await;
        let ride = fx.request().await;

        fx.rides.claim(&ride.id, &winner).await.unwrap();
        let err = fx.rides.claim(&ride.id, &loser).await.unwrap_err();
        assert!(matches!(err, AppError::RideAlreadyClaimed { .. }));

        let loser = fx.drivers.get_driver(&loser).await.unwrap();
        assert_eq!(loser.status, DriverStatus::Available);
        assert!(loser.current_ride.is_none());
    }

    #[tokio::test]
    async fn driver_history_lists_only_bound_rides() {
        let fx = fixture().await;
        let winner = fx.online_driver("Kofi").await;
        let loser = fx.online_driver("Yaw").await;
        let ride = fx.request().await;
        fx.rides.claim(&ride.id, &winner).await.unwrap();

        // A lost race still leaves the loser in the driver index.
        fx.drivers.bind_ride(&loser, &ride.id).await.unwrap();
        fx.drivers.finish_ride(&loser, &ride.id, false).await.unwrap();

        let history = fx.rides.rides_for_driver(&winner).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, ride.id);
        assert!(fx.rides.rides_for_driver(&loser).await.unwrap().is_empty());
    }
}
