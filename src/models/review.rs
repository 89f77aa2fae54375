// src/models/review.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PartyRef, ReviewId, RideId};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

/// Running average kept on the rated party's own record.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct RatingSummary {
    pub average: f64,
    pub count: u32,
}

impl RatingSummary {
    /// Fold one more rating into the average.
    pub fn record(&mut self, rating: u8) {
        let rating = f64::from(rating);
        self.average = if self.count == 0 {
            rating
        } else {
            (self.average * f64::from(self.count) + rating) / f64::from(self.count + 1)
        };
        self.count += 1;
    }
}

/// Append-only review living under the rated party.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Review {
    pub id: ReviewId,
    pub rated: PartyRef,
    pub rater: Option<PartyRef>,
    pub ride_id: Option<RideId>,
    pub rating: u8,
    pub comment: Option<String>,
    pub sentiment: Sentiment,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideRatingRequest {
    pub rater: PartyRef,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReviewRequest {
    pub rated: PartyRef,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_rating_becomes_the_average() {
        let mut summary = RatingSummary::default();
        summary.record(4);
        assert_eq!(summary, RatingSummary { average: 4.0, count: 1 });
    }

    #[test]
    fn sequential_ratings_reproduce_the_mean() {
        let ratings = [5u8, 3, 4, 1, 5, 2, 4];
        let mut summary = RatingSummary::default();
        for r in ratings {
            summary.record(r);
        }
        let mean = ratings.iter().map(|&r| f64::from(r)).sum::<f64>() / ratings.len() as f64;
        assert!((summary.average - mean).abs() < 1e-9);
        assert_eq!(summary.count, ratings.len() as u32);
    }
}
