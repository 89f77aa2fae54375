// src/models/ride.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::fare::FareBreakdown;
use super::ids::{DriverId, RideId, UserId};
use super::negotiation::{CounterOffer, FareBand};
use crate::errors::{SparrowError, SparrowResult};
use crate::utils::geo::is_valid_coordinate;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RideStatus {
    Searching,      // Open, waiting for a driver
    Accepted,       // A driver is bound to the ride
    CounterOffered, // A driver proposed a different fare, passenger to answer
    Arrived,        // Driver at pickup
    InProgress,     // Passenger on board
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const ALL: [RideStatus; 7] = [
        RideStatus::Searching,
        RideStatus::Accepted,
        RideStatus::CounterOffered,
        RideStatus::Arrived,
        RideStatus::InProgress,
        RideStatus::Completed,
        RideStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// The complete transition table. Anything not listed is illegal.
    pub fn can_transition_to(self, next: RideStatus) -> bool {
        use RideStatus::*;
        match (self, next) {
            (Searching, Accepted) | (Searching, CounterOffered) => true,
            (CounterOffered, Accepted) | (CounterOffered, Searching) => true,
            (Accepted, Arrived) | (Arrived, InProgress) | (InProgress, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Searching => "searching",
            RideStatus::Accepted => "accepted",
            RideStatus::CounterOffered => "counter-offered",
            RideStatus::Arrived => "arrived",
            RideStatus::InProgress => "in-progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    Passenger,
    Driver,
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CancellationReason {
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

impl Location {
    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(self.latitude, self.longitude)
    }
}

/// Post-completion bookkeeping flags: each side rates the other once.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RatingFlags {
    pub passenger_rated_driver: bool,
    pub driver_rated_passenger: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Ride {
    pub id: RideId,
    pub passenger_id: UserId,
    pub driver_id: Option<DriverId>,
    pub offered_to: Option<DriverId>,
    pub offer_token: Option<String>,
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub status: RideStatus,

    pub pickup: Location,
    pub dropoff: Location,
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub service_type: String,

    pub estimated_fare: f64,
    pub fare: f64,
    pub fare_breakdown: FareBreakdown,
    pub coupon_code: Option<String>,
    /// Passenger's acceptable range for driver counter-offers, if given.
    pub passenger_band: Option<FareBand>,
    pub counter_offer: Option<CounterOffer>,

    pub cancelled_by: Option<CancelledBy>,
    pub cancellation_reason: Option<CancellationReason>,
    pub ratings: RatingFlags,

    pub date: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// A requested change of a ride's status, with the data its entry needs.
#[derive(Debug, Clone)]
pub enum RideTransition {
    /// Bind a driver. While a counter-offer is pending, only a claim that
    /// carries that counter's token goes through.
    Claim {
        driver_id: DriverId,
        counter_token: Option<String>,
    },
    Counter(CounterOffer),
    CounterRejected,
    Arrive,
    Start,
    Complete,
    Cancel {
        by: CancelledBy,
        reason: CancellationReason,
    },
}

impl RideTransition {
    pub fn target(&self) -> RideStatus {
        match self {
            RideTransition::Claim { .. } => RideStatus::Accepted,
            RideTransition::Counter(_) => RideStatus::CounterOffered,
            RideTransition::CounterRejected => RideStatus::Searching,
            RideTransition::Arrive => RideStatus::Arrived,
            RideTransition::Start => RideStatus::InProgress,
            RideTransition::Complete => RideStatus::Completed,
            RideTransition::Cancel { .. } => RideStatus::Cancelled,
        }
    }
}

impl Ride {
    /// Apply a transition in place, or leave the ride untouched and fail.
    pub fn apply(&mut self, transition: RideTransition, now: DateTime<Utc>) -> SparrowResult<()> {
        let target = transition.target();

        if target == RideStatus::Accepted {
            if let Some(holder) = &self.driver_id {
                if !self.status.is_terminal() {
                    return Err(SparrowError::RideAlreadyClaimed {
                        ride_id: self.id.to_string(),
                        driver_id: holder.to_string(),
                    });
                }
            }
        }

        if !self.status.can_transition_to(target) {
            return Err(SparrowError::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        match transition {
            RideTransition::Claim { driver_id, counter_token } => {
                match (self.counter_offer.take(), counter_token) {
                    (None, None) => {}
                    (Some(counter), Some(token)) if counter.token == token => {
                        if counter.driver_id != driver_id {
                            let holder = counter.driver_id.to_string();
                            self.counter_offer = Some(counter);
                            return Err(SparrowError::RideAlreadyClaimed {
                                ride_id: self.id.to_string(),
                                driver_id: holder,
                            });
                        }
                        self.fare = counter.fare;
                    }
                    // A pending counter is settled by the passenger, not by a plain accept
                    (pending, _) => {
                        self.counter_offer = pending;
                        return Err(SparrowError::InvalidTransition {
                            from: self.status,
                            to: target,
                        });
                    }
                }
                self.driver_id = Some(driver_id);
                self.clear_offer();
                self.accepted_at = Some(now);
            }
            RideTransition::Counter(counter) => {
                if self.offered_to.as_ref() != Some(&counter.driver_id) {
                    return Err(SparrowError::OfferNotHeld {
                        ride_id: self.id.to_string(),
                        driver_id: counter.driver_id.to_string(),
                    });
                }
                self.clear_offer();
                self.counter_offer = Some(counter);
            }
            RideTransition::CounterRejected => {
                self.counter_offer = None;
            }
            RideTransition::Arrive => self.arrived_at = Some(now),
            RideTransition::Start => self.started_at = Some(now),
            RideTransition::Complete => self.completed_at = Some(now),
            RideTransition::Cancel { by, reason } => {
                self.clear_offer();
                self.counter_offer = None;
                self.cancelled_by = Some(by);
                self.cancellation_reason = Some(reason);
                self.cancelled_at = Some(now);
            }
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Hand the open ride to one candidate driver.
    pub fn offer_to(
        &mut self,
        driver_id: DriverId,
        token: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SparrowResult<()> {
        if self.status != RideStatus::Searching {
            return Err(SparrowError::InvalidTransition {
                from: self.status,
                to: RideStatus::Searching,
            });
        }
        if let Some(current) = &self.offered_to {
            return Err(SparrowError::Conflict(format!(
                "ride {} is already offered to {}",
                self.id, current
            )));
        }
        self.offered_to = Some(driver_id);
        self.offer_token = Some(token);
        self.offer_expires_at = Some(expires_at);
        self.updated_at = now;
        Ok(())
    }

    /// Withdraw the pending offer if it still belongs to `driver_id` (and,
    /// when given, carries `token`). Returns whether anything changed.
    pub fn withdraw_offer(&mut self, driver_id: &DriverId, token: Option<&str>, now: DateTime<Utc>) -> bool {
        let holds = self.offered_to.as_ref() == Some(driver_id);
        let token_matches = token.is_none_or(|t| self.offer_token.as_deref() == Some(t));
        if holds && token_matches {
            self.clear_offer();
            self.updated_at = now;
            true
        } else {
            false
        }
    }

    fn clear_offer(&mut self) {
        self.offered_to = None;
        self.offer_token = None;
        self.offer_expires_at = None;
    }

    /// Every driver that currently holds some claim on this ride.
    pub fn attached_drivers(&self) -> Vec<DriverId> {
        let mut drivers = Vec::new();
        drivers.extend(self.offered_to.iter().cloned());
        drivers.extend(self.counter_offer.iter().map(|c| c.driver_id.clone()));
        drivers.extend(self.driver_id.iter().cloned());
        drivers.sort();
        drivers.dedup();
        drivers
    }

    pub fn is_bound_to(&self, driver_id: &DriverId) -> bool {
        self.driver_id.as_ref() == Some(driver_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideRequest {
    pub passenger_id: UserId,
    pub pickup: Location,
    pub dropoff: Location,
    pub service_type: String,
    /// Route distance; estimated from coordinates when absent.
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub duration_minutes: Option<f64>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    /// Passenger's own fare proposal; defaults to the estimate.
    #[serde(default)]
    pub proposed_fare: Option<f64>,
    #[serde(default)]
    pub max_fare: Option<f64>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CancelRequest {
    pub cancelled_by: CancelledBy,
    pub code: String,
    #[serde(default)]
    pub reason: String,
}
