// src/services/settlement_service.rs
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::{
        ids::{DriverId, PartyRef, ReviewId, RideId, UserId},
        review::{RatingSummary, Review, ReviewRequest, RideRatingRequest, Sentiment},
        ride::{RatingFlags, RideStatus},
    },
    services::{
        driver_service::{DriverOperations, DriverService},
        event_bus::{EventBus, Topic},
        ride_service::{RideOperations, RideService},
        sentiment::SentimentClassifier,
        store_service::{StoreKeys, StoreService, Versioned},
        user_service::{UserOperations, UserService},
    },
};

#[derive(Debug, Clone)]
pub struct RatingConfig {
    /// Upper bound on the sentiment call; past it the review is tagged neutral.
    pub sentiment_timeout: Duration,
    pub max_comment_chars: usize,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            sentiment_timeout: Duration::from_secs(3),
            max_comment_chars: 500,
        }
    }
}

/// Post-trip bookkeeping for one completed ride.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub ride_id: RideId,
    pub passenger_id: UserId,
    pub driver_id: DriverId,
    pub fare: f64,
    pub completed_at: Option<DateTime<Utc>>,
    pub ratings: RatingFlags,
    pub reviews: Vec<ReviewId>,
    pub opened_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for Settlement {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Settlement {
    /// The party `rater` rates on this ride, or `None` if they were not on it.
    pub fn counterpart_of(&self, rater: &PartyRef) -> Option<PartyRef> {
        match rater {
            PartyRef::Passenger(id) if *id == self.passenger_id => Some(PartyRef::Driver(self.driver_id.clone())),
            PartyRef::Driver(id) if *id == self.driver_id => Some(PartyRef::Passenger(self.passenger_id.clone())),
            _ => None,
        }
    }

    fn rated_flag(&mut self, rater: &PartyRef) -> &mut bool {
        match rater {
            PartyRef::Passenger(_) => &mut self.ratings.passenger_rated_driver,
            PartyRef::Driver(_) => &mut self.ratings.driver_rated_passenger,
        }
    }
}

pub struct SettlementService {
    store: Arc<StoreService>,
    bus: Arc<EventBus>,
    rides: Arc<RideService>,
    drivers: Arc<DriverService>,
    users: Arc<UserService>,
    classifier: Arc<dyn SentimentClassifier>,
    config: RatingConfig,
}

impl SettlementService {
    pub fn new(
        store: Arc<StoreService>,
        bus: Arc<EventBus>,
        rides: Arc<RideService>,
        drivers: Arc<DriverService>,
        users: Arc<UserService>,
        classifier: Arc<dyn SentimentClassifier>,
        config: RatingConfig,
    ) -> Self {
        Self {
            store,
            bus,
            rides,
            drivers,
            users,
            classifier,
            config,
        }
    }

    pub async fn get_settlement(&self, ride_id: &RideId) -> SparrowResult<Option<Settlement>> {
        self.store.get(&StoreKeys::settlement(ride_id)).await
    }

    /// Open the settlement of a completed ride. Safe to call any number of
    /// times; later calls return the existing record.
    pub async fn open_settlement(&self, ride_id: &RideId) -> SparrowResult<Settlement> {
        let key = StoreKeys::settlement(ride_id);
        if let Some(existing) = self.store.get(&key).await? {
            return Ok(existing);
        }

        let ride = self.rides.get_ride(ride_id).await?;
        if ride.status != RideStatus::Completed {
            return Err(AppError::Conflict(format!("ride {} is {}, not completed", ride_id, ride.status)));
        }
        let driver_id = ride
            .driver_id
            .clone()
            .ok_or_else(|| AppError::internal_error(format!("completed ride {} has no driver", ride_id)))?;

        let mut settlement = Settlement {
            ride_id: ride.id.clone(),
            passenger_id: ride.passenger_id.clone(),
            driver_id,
            fare: ride.fare,
            completed_at: ride.completed_at,
            ratings: RatingFlags::default(),
            reviews: Vec::new(),
            opened_at: Utc::now(),
            version: 0,
        };
        match self.store.insert(&key, &mut settlement).await {
            Ok(()) => {
                tracing::info!("Settlement opened for ride {} ({:.2})", ride_id, settlement.fare);
                Ok(settlement)
            }
            Err(AppError::Conflict(_)) => self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| AppError::not_found(key.render())),
            Err(e) => Err(e),
        }
    }

    /// One side of a completed ride rates the other. Each side rates once.
    pub async fn rate_ride(&self, ride_id: &RideId, request: RideRatingRequest) -> SparrowResult<Review> {
        validate_rating(request.rating)?;
        let settlement = self.open_settlement(ride_id).await?;
        let rated = settlement
            .counterpart_of(&request.rater)
            .ok_or_else(|| AppError::validation_error("rater", "Rater did not take part in this ride"))?;

        let key = StoreKeys::settlement(ride_id);
        self.store
            .transact(&key, |settlement: &mut Settlement| {
                let flag = settlement.rated_flag(&request.rater);
                if *flag {
                    return Err(AppError::AlreadyRated(format!("{} on ride {}", request.rater.key_fragment(), ride_id)));
                }
                *flag = true;
                Ok(())
            })
            .await?;

        let review = match self
            .record_review(rated, Some(request.rater.clone()), Some(ride_id.clone()), request.rating, request.comment)
            .await
        {
            Ok(review) => review,
            Err(e) => {
                // Give the rater their turn back
                let undo = self
                    .store
                    .transact(&key, |settlement: &mut Settlement| {
                        *settlement.rated_flag(&request.rater) = false;
                        Ok(())
                    })
                    .await;
                if let Err(undo) = undo {
                    tracing::warn!("Could not reset rating flag on ride {}: {}", ride_id, undo);
                }
                return Err(e);
            }
        };

        self.store
            .transact(&key, |settlement: &mut Settlement| {
                settlement.reviews.push(review.id.clone());
                Ok(())
            })
            .await?;
        if let Err(e) = self.rides.mark_rated(ride_id, &request.rater).await {
            tracing::warn!("Could not flag rating on ride {}: {}", ride_id, e);
        }
        Ok(review)
    }

    /// A standalone review, not tied to a ride.
    pub async fn submit_review(&self, request: ReviewRequest) -> SparrowResult<Review> {
        validate_rating(request.rating)?;
        self.record_review(request.rated, None, None, request.rating, request.comment).await
    }

    pub async fn reviews_for(&self, party: &PartyRef) -> SparrowResult<Vec<Review>> {
        self.ensure_party(party).await?;
        let ids = self.store.index_members(&StoreKeys::reviews_for(party)).await?;
        let keys: Vec<_> = ids.into_iter().map(|id| StoreKeys::review(&ReviewId::from(id))).collect();
        let found = try_join_all(keys.iter().map(|key| self.store.get::<Review>(key))).await?;

        let mut reviews: Vec<Review> = found.into_iter().flatten().collect();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(reviews)
    }

    async fn ensure_party(&self, party: &PartyRef) -> SparrowResult<()> {
        match party {
            PartyRef::Passenger(id) => self.users.get_user(id).await.map(|_| ()),
            PartyRef::Driver(id) => self.drivers.get_driver(id).await.map(|_| ()),
        }
    }

    async fn classify(&self, comment: Option<&str>) -> Sentiment {
        let Some(text) = comment.filter(|c| !c.trim().is_empty()) else {
            return Sentiment::Neutral;
        };
        match tokio::time::timeout(self.config.sentiment_timeout, self.classifier.classify(text)).await {
            Ok(Ok(sentiment)) => sentiment,
            Ok(Err(e)) => {
                tracing::warn!("Sentiment classification failed, recording neutral: {}", e);
                Sentiment::Neutral
            }
            Err(_) => {
                tracing::warn!("Sentiment classification timed out, recording neutral");
                Sentiment::Neutral
            }
        }
    }

    async fn record_review(
        &self,
        rated: PartyRef,
        rater: Option<PartyRef>,
        ride_id: Option<RideId>,
        rating: u8,
        comment: Option<String>,
    ) -> SparrowResult<Review> {
        let comment = comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
        if comment.as_ref().is_some_and(|c| c.chars().count() > self.config.max_comment_chars) {
            return Err(AppError::validation_error(
                "comment",
                format!("Comment must be at most {} characters", self.config.max_comment_chars),
            ));
        }
        self.ensure_party(&rated).await?;

        let sentiment = self.classify(comment.as_deref()).await;
        let summary: RatingSummary = match &rated {
            PartyRef::Passenger(id) => self.users.record_rating(id, rating).await?,
            PartyRef::Driver(id) => self.drivers.record_rating(id, rating).await?,
        };

        let review = Review {
            id: ReviewId::generate(),
            rated: rated.clone(),
            rater,
            ride_id,
            rating,
            comment,
            sentiment,
            created_at: Utc::now(),
        };
        self.store.put(&StoreKeys::review(&review.id), &review).await?;
        self.store
            .add_to_index(&StoreKeys::reviews_for(&rated), review.id.as_str())
            .await?;

        tracing::info!(
            "Review {} recorded for {}: {} ({:?}), average now {:.2} over {}",
            review.id,
            rated.key_fragment(),
            rating,
            sentiment,
            summary.average,
            summary.count
        );
        Ok(review)
    }

    /// Open a settlement for every ride seen reaching `completed`.
    pub async fn spawn_settlement_worker(self: Arc<Self>) -> JoinHandle<()> {
        let mut rides = self.bus.subscribe(Topic::Rides).await;
        tokio::spawn(async move {
            while let Some(event) = rides.recv().await {
                let Some(ride) = event.ride() else { continue };
                if ride.status != RideStatus::Completed {
                    continue;
                }
                if let Err(e) = self.open_settlement(&ride.id).await {
                    tracing::warn!("Could not open settlement for ride {}: {}", ride.id, e);
                }
            }
            tracing::info!("Settlement worker stopped");
        })
    }
}

fn validate_rating(rating: u8) -> SparrowResult<()> {
    if (1..=5).contains(&rating) {
        Ok(())
    } else {
        Err(AppError::invalid_value("rating", rating, "must be between 1 and 5"))
    }
}
