pub mod driver_service;
pub mod event_bus;
pub mod fare_service;
pub mod matching_service;
pub mod messaging_service;
pub mod negotiation_service;
pub mod offer_timer;
pub mod ride_service;
pub mod sentiment;
pub mod settlement_service;
pub mod store_service;
pub mod user_service;

pub use driver_service::{DriverOperations, DriverService};
pub use event_bus::{EventBus, Topic};
pub use fare_service::{FareCalculator, FareConfig};
pub use matching_service::{DispatchOutcome, DriverDecision, MatchingConfig, MatchingService};
pub use messaging_service::{FcmNotificationService, MockNotificationService, NotificationService};
pub use negotiation_service::{NegotiationArbiter, NegotiationConfig};
pub use offer_timer::{OfferExpired, OfferTimer};
pub use ride_service::{RideOperations, RideService};
pub use settlement_service::{RatingConfig, SettlementService};
pub use store_service::{StoreConfig, StoreService};
pub use user_service::{UserOperations, UserService};
