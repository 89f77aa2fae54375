// src/services/negotiation_service.rs
use serde::{Deserialize, Serialize};

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::negotiation::{Decision, Direction, FareBand, NegotiationRequest, NegotiationResponse},
    utils::money::round2,
    ValidationError,
};

/// How far outside a band a proposal may land and still earn a counter-offer.
///
/// The tolerance is the larger of the absolute amount and the percentage of
/// the violated bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub counter_tolerance_abs: f64,
    pub counter_tolerance_pct: f64,
    /// Distance of the counter fare from the violated bound, inside the band.
    pub counter_markup: f64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            counter_tolerance_abs: 2.0,
            counter_tolerance_pct: 10.0,
            counter_markup: 0.5,
        }
    }
}

/// Decides accept / reject / counter for a proposed fare against a band.
/// Pure: the same request always yields the same response.
#[derive(Debug, Clone, Default)]
pub struct NegotiationArbiter {
    config: NegotiationConfig,
}

impl NegotiationArbiter {
    pub fn new(config: NegotiationConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, request: &NegotiationRequest) -> SparrowResult<NegotiationResponse> {
        validate(request)?;
        Ok(self.decide(request.proposed_fare, request.band(), request.direction))
    }

    /// Decision for a proposal already known to be well-formed.
    pub fn decide(&self, proposed: f64, band: FareBand, direction: Direction) -> NegotiationResponse {
        if band.contains(proposed) {
            return NegotiationResponse {
                decision: Decision::Accepted,
                counter_fare: None,
                reason: format!("{:.2} is within the acceptable range", proposed),
            };
        }

        // The bound the proposal missed, and the one that may be countered
        let (bound, negotiable) = match direction {
            Direction::ToDriver => (band.min_fare, proposed < band.min_fare),
            Direction::ToPassenger => (band.max_fare, proposed > band.max_fare),
        };
        let gap = (proposed - bound).abs();

        if negotiable && gap <= self.tolerance(bound) + 1e-9 {
            let target = match direction {
                Direction::ToDriver => band.min_fare + self.config.counter_markup,
                Direction::ToPassenger => band.max_fare - self.config.counter_markup,
            };
            let counter = band.clamp(round2(target));
            return NegotiationResponse {
                decision: Decision::CounterOffer,
                counter_fare: Some(counter),
                reason: match direction {
                    Direction::ToDriver => format!("{:.2} is {:.2} short of the minimum, countering at {:.2}", proposed, gap, counter),
                    Direction::ToPassenger => format!("{:.2} is {:.2} over the maximum, countering at {:.2}", proposed, gap, counter),
                },
            };
        }

        let reason = if proposed < band.min_fare {
            format!("{:.2} is below the minimum fare of {:.2}", proposed, band.min_fare)
        } else {
            format!("{:.2} is above the maximum fare of {:.2}", proposed, band.max_fare)
        };
        NegotiationResponse {
            decision: Decision::Rejected,
            counter_fare: None,
            reason,
        }
    }

    fn tolerance(&self, bound: f64) -> f64 {
        self.config
            .counter_tolerance_abs
            .max(bound.abs() * self.config.counter_tolerance_pct / 100.0)
    }
}

fn validate(request: &NegotiationRequest) -> SparrowResult<()> {
    let mut errors = Vec::new();
    let amounts = [
        ("estimatedFare", request.estimated_fare),
        ("proposedFare", request.proposed_fare),
        ("minFare", request.min_fare),
        ("maxFare", request.max_fare),
    ];
    for (field, value) in amounts {
        if !value.is_finite() || value < 0.0 {
            errors.push(ValidationError {
                field: field.to_string(),
                message: format!("must be a non-negative amount, got {}", value),
            });
        }
    }
    if errors.is_empty() && request.min_fare > request.max_fare {
        errors.push(ValidationError {
            field: "minFare".to_string(),
            message: format!("exceeds maxFare ({} > {})", request.min_fare, request.max_fare),
        });
    }
    if errors.is_empty() { Ok(()) } else { Err(AppError::ValidationFailed(errors)) }
}
