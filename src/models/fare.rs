// src/models/fare.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every intermediate term of one fare computation.
///
/// Produced whole by the fare calculator and never patched afterwards: a
/// change to trip parameters means a fresh breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareBreakdown {
    pub base_fare: f64,
    pub distance_cost: f64,
    pub duration_cost: f64,
    pub service_multiplier: f64,
    pub service_cost: f64,
    pub peak_surcharge: f64,
    pub special_day_surcharge: f64,
    pub coupon_discount: f64,
    pub subtotal: f64,
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_coupon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_day_rule: Option<String>,
}

impl FareBreakdown {
    /// Sum of the pre-discount terms.
    pub fn recomputed_subtotal(&self) -> f64 {
        crate::utils::money::round2(
            self.base_fare
                + self.distance_cost
                + self.duration_cost
                + self.service_cost
                + self.special_day_surcharge
                + self.peak_surcharge,
        )
    }

    /// Total derived from the breakdown's own terms.
    pub fn recomputed_total(&self) -> f64 {
        crate::utils::money::round2((self.recomputed_subtotal() - self.coupon_discount).max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareEstimateRequest {
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub service_type: String,
    #[serde(default)]
    pub ride_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareEstimateResponse {
    pub estimated_fare: f64,
    pub breakdown: FareBreakdown,
}
