// src/state.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::{
    errors::{SparrowError, SparrowResult},
    services::{
        driver_service::DriverService,
        event_bus::EventBus,
        fare_service::{FareCalculator, FareConfig},
        matching_service::{MatchingConfig, MatchingService},
        messaging_service::{FcmConfig, FcmNotificationService, MockNotificationService, NotificationService},
        negotiation_service::{NegotiationArbiter, NegotiationConfig},
        offer_timer::{OfferExpired, OfferTimer},
        ride_service::RideService,
        sentiment::{HttpSentimentClassifier, KeywordClassifier, SentimentClassifier},
        settlement_service::{RatingConfig, SettlementService},
        store_service::{StoreConfig, StoreService},
        user_service::UserService,
    },
};

pub struct AppState {
    pub store: Arc<StoreService>,
    pub bus: Arc<EventBus>,
    pub fares: Arc<FareCalculator>,
    pub arbiter: Arc<NegotiationArbiter>,
    pub user_service: Arc<UserService>,
    pub driver_service: Arc<DriverService>,
    pub ride_service: Arc<RideService>,
    pub matching_service: Arc<MatchingService>,
    pub settlement_service: Arc<SettlementService>,
    pub notification_service: Arc<dyn NotificationService>,
    pub timer: OfferTimer,
    pub config: AppConfig,
    expired: Mutex<Option<mpsc::UnboundedReceiver<OfferExpired>>>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub store: StoreConfig,
    pub fcm: Option<FcmConfig>,
    pub sentiment_url: Option<String>,
    pub fares: FareConfig,
    pub negotiation: NegotiationConfig,
    pub matching: MatchingConfig,
    pub rating: RatingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            store: StoreConfig::default(),
            fcm: None,
            sentiment_url: None,
            fares: FareConfig::default(),
            negotiation: NegotiationConfig::default(),
            matching: MatchingConfig::default(),
            rating: RatingConfig::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> SparrowResult<Option<T>> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| SparrowError::ConfigurationError(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(None),
    }
}

impl AppConfig {
    /// Read `SPARROW_*` environment variables over the defaults.
    pub fn from_env() -> SparrowResult<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_var("SPARROW_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.store.redis_url = env_var("SPARROW_REDIS_URL");
        config.fcm = env_var("SPARROW_FCM_SERVER_KEY").map(|key| FcmConfig {
            fcm_server_key: key,
            ..FcmConfig::default()
        });
        config.sentiment_url = env_var("SPARROW_SENTIMENT_URL");

        if let Some(path) = env_var("SPARROW_PRICING_FILE") {
            config.fares = FareConfig::from_file(&path)?;
        }
        config.fares.validate()?;

        if let Some(secs) = env_parse::<u64>("SPARROW_OFFER_WINDOW_SECS")? {
            if secs == 0 {
                return Err(SparrowError::ConfigurationError("SPARROW_OFFER_WINDOW_SECS must be positive".into()));
            }
            config.matching.offer_window = Duration::from_secs(secs);
        }
        if let Some(radius) = env_parse::<f64>("SPARROW_PICKUP_RADIUS_KM")? {
            config.matching.max_pickup_radius_km = radius;
        }

        Ok(config)
    }
}

impl AppState {
    pub async fn new(config: AppConfig) -> SparrowResult<Self> {
        let store = Arc::new(StoreService::new(config.store.clone()).await?);
        tracing::info!("Using {} store", store.backend_name());

        let notification_service: Arc<dyn NotificationService> = match &config.fcm {
            Some(fcm) => Arc::new(FcmNotificationService::new(fcm.clone(), store.clone())),
            None => {
                tracing::warn!("SPARROW_FCM_SERVER_KEY not set, using mock notification service");
                Arc::new(MockNotificationService::new())
            }
        };

        let classifier: Arc<dyn SentimentClassifier> = match &config.sentiment_url {
            Some(url) => Arc::new(HttpSentimentClassifier::new(url.clone(), config.rating.sentiment_timeout)?),
            None => {
                tracing::warn!("SPARROW_SENTIMENT_URL not set, using keyword sentiment");
                Arc::new(KeywordClassifier)
            }
        };

        Ok(Self::assemble(config, store, notification_service, classifier))
    }

    /// Everything in memory, with mock notifications. Used by tests and local runs.
    pub fn new_in_memory(config: AppConfig) -> Self {
        Self::assemble(
            config,
            Arc::new(StoreService::new_memory()),
            Arc::new(MockNotificationService::new()),
            Arc::new(KeywordClassifier),
        )
    }

    fn assemble(
        config: AppConfig,
        store: Arc<StoreService>,
        notification_service: Arc<dyn NotificationService>,
        classifier: Arc<dyn SentimentClassifier>,
    ) -> Self {
        let bus = Arc::new(EventBus::default());
        let fares = Arc::new(FareCalculator::new(config.fares.clone()));
        let arbiter = Arc::new(NegotiationArbiter::new(config.negotiation.clone()));
        let (timer, expired) = OfferTimer::new();

        let user_service = Arc::new(UserService::new(store.clone()));
        let driver_service = Arc::new(DriverService::new(store.clone(), bus.clone()));
        let ride_service = Arc::new(RideService::new(
            store.clone(),
            bus.clone(),
            fares.clone(),
            driver_service.clone(),
            user_service.clone(),
            timer.clone(),
            notification_service.clone(),
            config.matching.offer_window,
        ));
        let matching_service = Arc::new(MatchingService::new(
            store.clone(),
            bus.clone(),
            ride_service.clone(),
            driver_service.clone(),
            arbiter.clone(),
            timer.clone(),
            config.matching.clone(),
        ));
        let settlement_service = Arc::new(SettlementService::new(
            store.clone(),
            bus.clone(),
            ride_service.clone(),
            driver_service.clone(),
            user_service.clone(),
            classifier,
            config.rating.clone(),
        ));

        Self {
            store,
            bus,
            fares,
            arbiter,
            user_service,
            driver_service,
            ride_service,
            matching_service,
            settlement_service,
            notification_service,
            timer,
            config,
            expired: Mutex::new(Some(expired)),
        }
    }

    /// Start the offer-expiry, dispatch and settlement workers. Only the
    /// first call starts anything.
    pub async fn start_workers(&self) -> Vec<JoinHandle<()>> {
        let Some(expired) = self.expired.lock().await.take() else {
            tracing::warn!("Workers already started");
            return Vec::new();
        };
        vec![
            self.matching_service.clone().spawn_expiry_worker(expired),
            self.matching_service.clone().spawn_dispatch_worker().await,
            self.settlement_service.clone().spawn_settlement_worker().await,
        ]
    }
}
