// src/models/driver.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DriverId, RideId, UserId};
use super::negotiation::FareBand;
use super::review::RatingSummary;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DriverStatus {
    Available,   // Online and free for offers
    Unavailable, // Offline or on a break
    OnRide,      // Bound to a ride
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentModel {
    #[default]
    Commission,
    Subscription,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// How a driver's acceptable band is derived from a reference fare.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct FarePolicy {
    pub floor_ratio: f64,
    pub ceiling_ratio: f64,
    /// Absolute lower bound regardless of trip length.
    pub minimum_fare: f64,
}

impl Default for FarePolicy {
    fn default() -> Self {
        Self {
            floor_ratio: 0.9,
            ceiling_ratio: 1.5,
            minimum_fare: 0.0,
        }
    }
}

impl FarePolicy {
    pub fn band_for(&self, reference_fare: f64) -> FareBand {
        let min_fare = (reference_fare * self.floor_ratio).max(self.minimum_fare);
        let max_fare = (reference_fare * self.ceiling_ratio).max(min_fare);
        FareBand::new(
            crate::utils::money::round2(min_fare),
            crate::utils::money::round2(max_fare),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.floor_ratio.is_finite()
            && self.ceiling_ratio.is_finite()
            && self.minimum_fare.is_finite()
            && self.floor_ratio > 0.0
            && self.ceiling_ratio >= self.floor_ratio
            && self.minimum_fare >= 0.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Driver {
    pub id: DriverId,
    pub user_id: UserId,
    pub display_name: String,
    pub status: DriverStatus,
    pub location: Option<GeoPoint>,
    pub payment_model: PaymentModel,
    pub fare_policy: FarePolicy,
    pub rating: RatingSummary,
    pub total_rides: u32,
    pub current_offer: Option<RideId>,
    pub current_ride: Option<RideId>,
    pub device_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Driver {
    /// Free to receive a new offer.
    pub fn is_dispatchable(&self) -> bool {
        self.status == DriverStatus::Available
            && self.current_offer.is_none()
            && self.current_ride.is_none()
            && self.location.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverRegistration {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub payment_model: PaymentModel,
    #[serde(default)]
    pub fare_policy: Option<FarePolicy>,
    #[serde(default)]
    pub device_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverStatusUpdate {
    pub status: DriverStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverLocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_follows_reference_fare() {
        let policy = FarePolicy::default();
        let band = policy.band_for(20.0);
        assert_eq!(band.min_fare, 18.0);
        assert_eq!(band.max_fare, 30.0);
    }

    #[test]
    fn minimum_fare_lifts_short_trips() {
        let policy = FarePolicy { floor_ratio: 0.9, ceiling_ratio: 1.5, minimum_fare: 10.0 };
        let band = policy.band_for(4.0);
        assert_eq!(band.min_fare, 10.0);
        assert_eq!(band.max_fare, 10.0);
    }

    #[test]
    fn rejects_inverted_policy() {
        let policy = FarePolicy { floor_ratio: 1.2, ceiling_ratio: 1.0, minimum_fare: 0.0 };
        assert!(!policy.is_valid());
    }
}
