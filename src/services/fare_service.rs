// src/services/fare_service.rs
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::{
        fare::{FareBreakdown, FareEstimateRequest, FareEstimateResponse},
        ride::Location,
    },
    utils::{geo::haversine_km, money::round2},
};

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Surcharge applied when the ride date falls in `[start, end]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialDayRule {
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub surcharge_pct: f64,
}

impl SpecialDayRule {
    fn covers(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Surcharge applied when the ride's minute-of-day falls in
/// `[start_minute, end_minute)`. A window with `start > end` wraps midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakRule {
    pub name: String,
    pub start_minute: u16,
    pub end_minute: u16,
    pub surcharge_pct: f64,
}

impl PeakRule {
    fn covers(&self, minute_of_day: u16) -> bool {
        if self.start_minute <= self.end_minute {
            self.start_minute <= minute_of_day && minute_of_day < self.end_minute
        } else {
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponKind {
    Percent,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub kind: CouponKind,
    pub value: f64,
    /// Subtotal the trip must reach for the coupon to apply. Reaching it
    /// exactly is enough.
    #[serde(default)]
    pub min_spend: f64,
    #[serde(default)]
    pub max_discount: Option<f64>,
}

impl Coupon {
    fn discount_on(&self, subtotal: f64) -> f64 {
        let raw = match self.kind {
            CouponKind::Percent => subtotal * self.value / 100.0,
            CouponKind::Flat => self.value,
        };
        let capped = self.max_discount.map_or(raw, |cap| raw.min(cap));
        round2(capped.clamp(0.0, subtotal))
    }
}

/// Pricing tables. Amounts are in GHS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FareConfig {
    pub base_fare: f64,
    pub per_km_rate: f64,
    pub per_minute_rate: f64,
    pub service_multipliers: BTreeMap<String, f64>,
    pub special_days: Vec<SpecialDayRule>,
    pub peak_hours: Vec<PeakRule>,
    pub coupons: Vec<Coupon>,
    /// Offset of local time from UTC, for day and peak-window matching.
    pub utc_offset_minutes: i32,
    /// Straight-line to road distance factor, used when no route distance is given.
    pub road_factor: f64,
    pub average_speed_kmh: f64,
}

impl Default for FareConfig {
    fn default() -> Self {
        let service_multipliers = [("economy", 1.0), ("comfort", 1.3), ("premium", 1.6), ("xl", 1.5)]
            .into_iter()
            .map(|(name, m)| (name.to_string(), m))
            .collect();

        Self {
            base_fare: 5.0,
            per_km_rate: 1.5,
            per_minute_rate: 0.5,
            service_multipliers,
            special_days: Vec::new(),
            peak_hours: vec![
                PeakRule {
                    name: "morning-rush".to_string(),
                    start_minute: 7 * 60,
                    end_minute: 9 * 60,
                    surcharge_pct: 20.0,
                },
                PeakRule {
                    name: "evening-rush".to_string(),
                    start_minute: 17 * 60,
                    end_minute: 19 * 60 + 30,
                    surcharge_pct: 20.0,
                },
            ],
            coupons: Vec::new(),
            utc_offset_minutes: 0, // Accra runs on UTC
            road_factor: 1.3,
            average_speed_kmh: 30.0,
        }
    }
}

impl FareConfig {
    pub fn from_file(path: impl AsRef<Path>) -> SparrowResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigurationError(format!("cannot read pricing file {}: {}", path.display(), e))
        })?;
        let config: FareConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SparrowResult<()> {
        let rates = [
            ("base_fare", self.base_fare),
            ("per_km_rate", self.per_km_rate),
            ("per_minute_rate", self.per_minute_rate),
        ];
        for (name, value) in rates {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::InvalidConfiguration(format!("{} must be a non-negative amount", name)));
            }
        }
        if let Some((name, _)) = self.service_multipliers.iter().find(|(_, m)| !m.is_finite() || **m <= 0.0) {
            return Err(AppError::InvalidConfiguration(format!("multiplier for {} must be positive", name)));
        }
        if let Some(rule) = self.special_days.iter().find(|r| r.end < r.start) {
            return Err(AppError::InvalidConfiguration(format!("special day {} ends before it starts", rule.name)));
        }
        if let Some(rule) = self
            .peak_hours
            .iter()
            .find(|r| r.start_minute >= MINUTES_PER_DAY || r.end_minute > MINUTES_PER_DAY)
        {
            return Err(AppError::InvalidConfiguration(format!("peak window {} is outside the day", rule.name)));
        }
        if !(self.road_factor >= 1.0 && self.average_speed_kmh > 0.0) {
            return Err(AppError::InvalidConfiguration(
                "road_factor must be >= 1 and average_speed_kmh positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn multiplier_for(&self, service_type: &str) -> f64 {
        self.service_multipliers
            .get(&service_type.trim().to_lowercase())
            .copied()
            .unwrap_or(1.0)
    }

    fn coupon(&self, code: &str) -> Option<&Coupon> {
        let code = code.trim();
        self.coupons.iter().find(|c| c.code.eq_ignore_ascii_case(code))
    }
}

/// Turns trip parameters into a full fare breakdown. Holds no state beyond
/// its pricing tables.
#[derive(Debug, Clone, Default)]
pub struct FareCalculator {
    config: FareConfig,
}

impl FareCalculator {
    pub fn new(config: FareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FareConfig {
        &self.config
    }

    /// Compute the breakdown for a trip. `now` stands in for a missing ride date.
    pub fn calculate(&self, request: &FareEstimateRequest, now: DateTime<Utc>) -> SparrowResult<FareBreakdown> {
        validate_trip(request.distance_km, request.duration_minutes)?;
        let config = &self.config;

        let when = request.ride_date.unwrap_or(now).naive_utc() + Duration::minutes(i64::from(config.utc_offset_minutes));
        let minute_of_day = (when.hour() * 60 + when.minute()) as u16;

        let base_fare = round2(config.base_fare);
        let distance_cost = round2(request.distance_km * config.per_km_rate);
        let duration_cost = round2(request.duration_minutes * config.per_minute_rate);
        let base_cost = base_fare + distance_cost + duration_cost;

        let service_multiplier = config.multiplier_for(&request.service_type);
        let service_cost = round2(base_cost * (service_multiplier - 1.0));
        let mut running = base_cost + service_cost;

        // At most one special-day rule, first match wins
        let special_day = config.special_days.iter().find(|rule| rule.covers(when.date()));
        let special_day_surcharge = special_day.map_or(0.0, |rule| round2(running * rule.surcharge_pct / 100.0));
        running += special_day_surcharge;

        // Peak is computed on the post-special-day subtotal
        let peak = config.peak_hours.iter().find(|rule| rule.covers(minute_of_day));
        let peak_surcharge = peak.map_or(0.0, |rule| round2(running * rule.surcharge_pct / 100.0));
        running += peak_surcharge;

        let subtotal = round2(running);

        let coupon = request
            .coupon_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
            .and_then(|code| {
                let found = config.coupon(code);
                if found.is_none() {
                    tracing::debug!("Unknown coupon code {}, no discount", code);
                }
                found
            })
            .filter(|coupon| subtotal + 1e-9 >= coupon.min_spend);
        let coupon_discount = coupon.map_or(0.0, |c| c.discount_on(subtotal));

        let total = round2((subtotal - coupon_discount).max(0.0));

        Ok(FareBreakdown {
            base_fare,
            distance_cost,
            duration_cost,
            service_multiplier,
            service_cost,
            peak_surcharge,
            special_day_surcharge,
            coupon_discount,
            subtotal,
            total,
            applied_coupon: coupon.map(|c| c.code.to_uppercase()),
            peak_rule: peak.map(|rule| rule.name.clone()),
            special_day_rule: special_day.map(|rule| rule.name.clone()),
        })
    }

    pub fn estimate(&self, request: &FareEstimateRequest) -> SparrowResult<FareEstimateResponse> {
        let breakdown = self.calculate(request, Utc::now())?;
        Ok(FareEstimateResponse {
            estimated_fare: breakdown.total,
            breakdown,
        })
    }

    /// Approximate road distance (km) and duration (minutes) between two points.
    pub fn estimate_trip(&self, pickup: &Location, dropoff: &Location) -> (f64, f64) {
        let straight = haversine_km(pickup.latitude, pickup.longitude, dropoff.latitude, dropoff.longitude);
        let distance_km = round2(straight * self.config.road_factor);
        let duration_minutes = round2(distance_km / self.config.average_speed_kmh * 60.0);
        (distance_km, duration_minutes)
    }
}

fn validate_trip(distance_km: f64, duration_minutes: f64) -> SparrowResult<()> {
    let mut errors = Vec::new();
    if !distance_km.is_finite() || distance_km < 0.0 {
        errors.push(crate::ValidationError {
            field: "distanceKm".to_string(),
            message: format!("must be a non-negative number, got {}", distance_km),
        });
    }
    if !duration_minutes.is_finite() || duration_minutes < 0.0 {
        errors.push(crate::ValidationError {
            field: "durationMinutes".to_string(),
            message: format!("must be a non-negative number, got {}", duration_minutes),
        });
    }
    if errors.is_empty() { Ok(()) } else { Err(AppError::ValidationFailed(errors)) }
}
