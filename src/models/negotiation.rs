// src/models/negotiation.rs
use serde::{Deserialize, Serialize};

use super::ids::DriverId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Accepted,
    Rejected,
    CounterOffer,
}

/// Which side's acceptable band the proposal is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A passenger's fare judged against a driver's band. Shortfalls below
    /// the minimum are negotiable.
    #[default]
    ToDriver,
    /// A driver's fare judged against a passenger's band. Overshoots above
    /// the maximum are negotiable.
    ToPassenger,
}

/// Inclusive acceptable fare range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareBand {
    pub min_fare: f64,
    pub max_fare: f64,
}

impl FareBand {
    pub fn new(min_fare: f64, max_fare: f64) -> Self {
        Self { min_fare, max_fare }
    }

    pub fn contains(&self, fare: f64) -> bool {
        self.min_fare <= fare && fare <= self.max_fare
    }

    pub fn clamp(&self, fare: f64) -> f64 {
        fare.max(self.min_fare).min(self.max_fare)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRequest {
    pub estimated_fare: f64,
    pub proposed_fare: f64,
    pub min_fare: f64,
    pub max_fare: f64,
    #[serde(default)]
    pub direction: Direction,
}

impl NegotiationRequest {
    pub fn band(&self) -> FareBand {
        FareBand::new(self.min_fare, self.max_fare)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResponse {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_fare: Option<f64>,
    pub reason: String,
}

/// A driver's alternate fare, pending the passenger's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterOffer {
    pub driver_id: DriverId,
    pub fare: f64,
    pub reason: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_wire_names() {
        assert_eq!(
            serde_json::to_string(&Decision::CounterOffer).unwrap(),
            "\"counter-offer\""
        );
    }

    #[test]
    fn band_is_inclusive() {
        let band = FareBand::new(10.0, 20.0);
        assert!(band.contains(10.0));
        assert!(band.contains(20.0));
        assert!(!band.contains(9.99));
        assert_eq!(band.clamp(25.0), 20.0);
    }

    #[test]
    fn request_direction_defaults_to_driver() {
        let req: NegotiationRequest = serde_json::from_str(
            r#"{"estimatedFare":12.0,"proposedFare":11.0,"minFare":10.0,"maxFare":15.0}"#,
        )
        .unwrap();
        assert_eq!(req.direction, Direction::ToDriver);
    }
}
