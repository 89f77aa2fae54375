// src/services/driver_service.rs
use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::Arc;

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::{
        driver::{Driver, DriverLocationUpdate, DriverRegistration, DriverStatus, FarePolicy, GeoPoint},
        ids::{DriverId, RideId},
        review::RatingSummary,
        user::User,
    },
    services::{
        event_bus::EventBus,
        store_service::{StoreKeys, StoreService},
    },
    utils::geo::is_valid_coordinate,
};

#[async_trait]
pub trait DriverOperations: Send + Sync {
    async fn register_driver(&self, registration: DriverRegistration) -> SparrowResult<Driver>;
    async fn get_driver(&self, driver_id: &DriverId) -> SparrowResult<Driver>;
    async fn set_availability(&self, driver_id: &DriverId, status: DriverStatus) -> SparrowResult<Driver>;
    async fn update_location(&self, driver_id: &DriverId, update: DriverLocationUpdate) -> SparrowResult<Driver>;
    async fn set_fare_policy(&self, driver_id: &DriverId, policy: FarePolicy) -> SparrowResult<Driver>;
    async fn available_drivers(&self) -> SparrowResult<Vec<Driver>>;
}

pub struct DriverService {
    store: Arc<StoreService>,
    bus: Arc<EventBus>,
}

impl DriverService {
    pub fn new(store: Arc<StoreService>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    async fn update<R, F>(&self, driver_id: &DriverId, apply: F) -> SparrowResult<(Driver, R)>
    where
        R: Send,
        F: FnMut(&mut Driver) -> SparrowResult<R> + Send,
    {
        let (driver, result) = self
            .store
            .transact(&StoreKeys::driver(driver_id), apply)
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => AppError::DriverNotFound(driver_id.to_string()),
                other => other,
            })?;
        self.bus.publish_driver(&driver).await;
        Ok((driver, result))
    }

    /// Hold the driver's single offer slot for `ride_id`. Fails if the
    /// driver is not dispatchable any more.
    pub async fn reserve_offer(&self, driver_id: &DriverId, ride_id: &RideId) -> SparrowResult<Driver> {
        let (driver, _) = self
            .update(driver_id, |driver| {
                if !driver.is_dispatchable() {
                    return Err(AppError::DriverNotAvailable(driver.id.to_string()));
                }
                driver.current_offer = Some(ride_id.clone());
                driver.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(driver)
    }

    /// Free the offer slot if it still holds `ride_id`.
    pub async fn release_offer(&self, driver_id: &DriverId, ride_id: &RideId) -> SparrowResult<()> {
        self.update(driver_id, |driver| {
            if driver.current_offer.as_ref() == Some(ride_id) {
                driver.current_offer = None;
                driver.updated_at = Utc::now();
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Mark the driver as carrying `ride_id`. The driver must be online,
    /// free of other rides, and hold no offer for a different ride.
    pub async fn bind_ride(&self, driver_id: &DriverId, ride_id: &RideId) -> SparrowResult<Driver> {
        let (driver, _) = self
            .update(driver_id, |driver| {
                let offer_elsewhere = driver.current_offer.as_ref().is_some_and(|r| r != ride_id);
                if driver.status != DriverStatus::Available || driver.current_ride.is_some() || offer_elsewhere {
                    return Err(AppError::DriverNotAvailable(driver.id.to_string()));
                }
                driver.current_offer = None;
                driver.current_ride = Some(ride_id.clone());
                driver.status = DriverStatus::OnRide;
                driver.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        self.store
            .add_to_index(&StoreKeys::rides_by_driver(driver_id), ride_id.as_str())
            .await?;
        Ok(driver)
    }

    /// Release the driver from `ride_id`, back to available.
    pub async fn finish_ride(&self, driver_id: &DriverId, ride_id: &RideId, completed: bool) -> SparrowResult<()> {
        self.update(driver_id, |driver| {
            if driver.current_offer.as_ref() == Some(ride_id) {
                driver.current_offer = None;
            }
            if driver.current_ride.as_ref() == Some(ride_id) {
                driver.current_ride = None;
                driver.status = DriverStatus::Available;
                if completed {
                    driver.total_rides += 1;
                }
            }
            driver.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Fold a new rating into the driver's running average.
    pub async fn record_rating(&self, driver_id: &DriverId, rating: u8) -> SparrowResult<RatingSummary> {
        let (driver, _) = self
            .update(driver_id, |driver| {
                driver.rating.record(rating);
                driver.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(driver.rating)
    }
}

#[async_trait]
impl DriverOperations for DriverService {
    async fn register_driver(&self, registration: DriverRegistration) -> SparrowResult<Driver> {
        tracing::info!("Registering driver for user: {}", registration.user_id);

        if registration.display_name.trim().is_empty() {
            return Err(AppError::validation_error("display_name", "Display name is required"));
        }
        let fare_policy = registration.fare_policy.unwrap_or_default();
        if !fare_policy.is_valid() {
            return Err(AppError::validation_error("fare_policy", "Fare policy bounds are inconsistent"));
        }
        if self
            .store
            .get::<User>(&StoreKeys::user(&registration.user_id))
            .await?
            .is_none()
        {
            return Err(AppError::UserNotFound(registration.user_id.to_string()));
        }

        let now = Utc::now();
        let mut driver = Driver {
            id: DriverId::generate(),
            user_id: registration.user_id,
            display_name: registration.display_name.trim().to_string(),
            status: DriverStatus::Unavailable,
            location: None,
            payment_model: registration.payment_model,
            fare_policy,
            rating: RatingSummary::default(),
            total_rides: 0,
            current_offer: None,
            current_ride: None,
            device_token: registration.device_token,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.store.insert(&StoreKeys::driver(&driver.id), &mut driver).await?;
        self.store
            .add_to_index(&StoreKeys::all_drivers(), driver.id.as_str())
            .await?;

        tracing::info!("Driver registered successfully: {}", driver.id);
        Ok(driver)
    }

    async fn get_driver(&self, driver_id: &DriverId) -> SparrowResult<Driver> {
        if !driver_id.is_well_formed() {
            tracing::warn!("Invalid driver ID format: {}", driver_id);
            return Err(AppError::DriverNotFound(driver_id.to_string()));
        }

        tracing::debug!("Getting driver: {}", driver_id);
        self.store
            .get(&StoreKeys::driver(driver_id))
            .await?
            .ok_or_else(|| AppError::DriverNotFound(driver_id.to_string()))
    }

    async fn set_availability(&self, driver_id: &DriverId, status: DriverStatus) -> SparrowResult<Driver> {
        if status == DriverStatus::OnRide {
            return Err(AppError::invalid_value("status", "on-ride", "set by accepting a ride"));
        }

        tracing::info!("Updating driver status: {} to {:?}", driver_id, status);
        let (driver, _) = self
            .update(driver_id, |driver| {
                if let Some(ride) = &driver.current_ride {
                    return Err(AppError::Conflict(format!("driver {} is on ride {}", driver.id, ride)));
                }
                driver.status = status;
                driver.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(driver)
    }

    async fn update_location(&self, driver_id: &DriverId, update: DriverLocationUpdate) -> SparrowResult<Driver> {
        if !is_valid_coordinate(update.latitude, update.longitude) {
            return Err(AppError::invalid_value(
                "location",
                format!("{},{}", update.latitude, update.longitude),
                "not a valid coordinate",
            ));
        }

        tracing::debug!("Updating driver location: {}", driver_id);
        let (driver, _) = self
            .update(driver_id, |driver| {
                let now = Utc::now();
                driver.location = Some(GeoPoint {
                    latitude: update.latitude,
                    longitude: update.longitude,
                    timestamp: now,
                });
                driver.updated_at = now;
                Ok(())
            })
            .await?;
        Ok(driver)
    }

    async fn set_fare_policy(&self, driver_id: &DriverId, policy: FarePolicy) -> SparrowResult<Driver> {
        if !policy.is_valid() {
            return Err(AppError::validation_error("fare_policy", "Fare policy bounds are inconsistent"));
        }

        let (driver, _) = self
            .update(driver_id, |driver| {
                driver.fare_policy = policy;
                driver.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(driver)
    }

    async fn available_drivers(&self) -> SparrowResult<Vec<Driver>> {
        let ids = self.store.index_members(&StoreKeys::all_drivers()).await?;
        let lookups = ids.iter().map(|id| {
            let key = StoreKeys::driver(&DriverId::from(id.as_str()));
            let store = self.store.clone();
            async move { store.get::<Driver>(&key).await }
        });
        let drivers = try_join_all(lookups).await?;

        let available: Vec<Driver> = drivers
            .into_iter()
            .flatten()
            .filter(Driver::is_dispatchable)
            .collect();
        tracing::debug!("{} of {} drivers dispatchable", available.len(), ids.len());
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::{UserRegistration, UserType};
    use crate::services::user_service::{UserOperations, UserService};

    async fn setup() -> (DriverService, Driver) {
        let store = Arc::new(StoreService::new_memory());
        let users = UserService::new(store.clone());
        let user = users
            .register_user(UserRegistration {
                user_type: UserType::Driver,
                first_name: "Kofi".into(),
                last_name: "Mensah".into(),
                phone_number: "+233200000001".into(),
                device_token: None,
            })
            .await
            .unwrap();
        let service = DriverService::new(store, Arc::new(EventBus::default()));
        let driver = service
            .register_driver(DriverRegistration {
                user_id: user.id,
                display_name: "Kofi".into(),
                payment_model: Default::default(),
                fare_policy: None,
                device_token: None,
            })
            .await
            .unwrap();
        (service, driver)
    }

    #[tokio::test]
    async fn new_drivers_start_offline() {
        let (service, driver) = setup().await;
        assert_eq!(driver.status, DriverStatus::Unavailable);
        assert_eq!(driver.version, 1);
        assert!(service.available_drivers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn driver_needs_status_and_location_to_be_dispatchable() {
        let (service, driver) = setup().await;
        service.set_availability(&driver.id, DriverStatus::Available).await.unwrap();
        assert!(service.available_drivers().await.unwrap().is_empty());

        service
            .update_location(&driver.id, DriverLocationUpdate { latitude: 5.6, longitude: -0.19 })
            .await
            .unwrap();
        let available = service.available_drivers().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, driver.id);
    }

    #[tokio::test]
    async fn offer_slot_is_exclusive() {
        let (service, driver) = setup().await;
        service.set_availability(&driver.id, DriverStatus::Available).await.unwrap();
        service
            .update_location(&driver.id, DriverLocationUpdate { latitude: 5.6, longitude: -0.19 })
            .await
            .unwrap();

        let first = RideId::from("rid-250101-aaaaa");
        let second = RideId::from("rid-250101-bbbbb");
        service.reserve_offer(&driver.id, &first).await.unwrap();
        let err = service.reserve_offer(&driver.id, &second).await.unwrap_err();
        assert!(matches!(err, AppError::DriverNotAvailable(_)));

        // Releasing a ride the driver does not hold changes nothing
        service.release_offer(&driver.id, &second).await.unwrap();
        assert_eq!(service.get_driver(&driver.id).await.unwrap().current_offer, Some(first.clone()));
        service.release_offer(&driver.id, &first).await.unwrap();
        assert!(service.get_driver(&driver.id).await.unwrap().current_offer.is_none());
    }

    #[tokio::test]
    async fn finishing_a_ride_frees_the_driver() {
        let (service, driver) = setup().await;
        let ride = RideId::from("rid-250101-aaaaa");
        let err = service.bind_ride(&driver.id, &ride).await.unwrap_err();
        assert!(matches!(err, AppError::DriverNotAvailable(_)));

        service.set_availability(&driver.id, DriverStatus::Available).await.unwrap();
        let bound = service.bind_ride(&driver.id, &ride).await.unwrap();
        assert_eq!(bound.status, DriverStatus::OnRide);
        let err = service.bind_ride(&driver.id, &RideId::from("rid-250101-bbbbb")).await.unwrap_err();
        assert!(matches!(err, AppError::DriverNotAvailable(_)));

        let err = service.set_availability(&driver.id, DriverStatus::Unavailable).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        service.finish_ride(&driver.id, &ride, true).await.unwrap();
        let after = service.get_driver(&driver.id).await.unwrap();
        assert_eq!(after.status, DriverStatus::Available);
        assert_eq!(after.total_rides, 1);
        assert!(after.current_ride.is_none());
    }

    #[tokio::test]
    async fn unknown_driver_is_not_found() {
        let (service, _) = setup().await;
        let err = service.get_driver(&DriverId::from("drv-250101-zzzzz")).await.unwrap_err();
        assert!(matches!(err, AppError::DriverNotFound(_)));
        let err = service
            .set_availability(&DriverId::from("drv-250101-zzzzz"), DriverStatus::Available)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DriverNotFound(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_coordinates() {
        let (service, driver) = setup().await;
        let err = service
            .update_location(&driver.id, DriverLocationUpdate { latitude: 91.0, longitude: 0.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidFieldValue { .. }));
    }
}
