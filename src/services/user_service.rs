// src/services/user_service.rs
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::{
        ids::UserId,
        review::RatingSummary,
        user::{User, UserRegistration, UserStatus},
    },
    services::store_service::{StoreKeys, StoreService},
    ValidationError,
};

#[async_trait]
pub trait UserOperations: Send + Sync {
    async fn register_user(&self, registration: UserRegistration) -> SparrowResult<User>;
    async fn get_user(&self, user_id: &UserId) -> SparrowResult<User>;
}

pub struct UserService {
    store: Arc<StoreService>,
}

impl UserService {
    pub fn new(store: Arc<StoreService>) -> Self {
        Self { store }
    }

    fn validate_registration(registration: &UserRegistration) -> SparrowResult<()> {
        let mut errors = Vec::new();

        if registration.first_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "first_name".to_string(),
                message: "First name is required".to_string(),
            });
        }

        let phone = registration.phone_number.trim();
        let digits = phone.strip_prefix('+').unwrap_or(phone);
        if digits.len() < 9 || !digits.chars().all(|c| c.is_ascii_digit()) {
            errors.push(ValidationError {
                field: "phone_number".to_string(),
                message: "Phone number must be 9 or more digits, optionally starting with +".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(AppError::ValidationFailed(errors)) }
    }

    /// Fold a new rating into the user's running average.
    pub async fn record_rating(&self, user_id: &UserId, rating: u8) -> SparrowResult<RatingSummary> {
        let (user, _) = self
            .store
            .transact(&StoreKeys::user(user_id), |user: &mut User| {
                user.rating.record(rating);
                user.updated_at = Utc::now();
                Ok(())
            })
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => AppError::UserNotFound(user_id.to_string()),
                other => other,
            })?;
        Ok(user.rating)
    }
}

#[async_trait]
impl UserOperations for UserService {
    async fn register_user(&self, registration: UserRegistration) -> SparrowResult<User> {
        Self::validate_registration(&registration)?;
        tracing::info!("Registering {:?} user: {}", registration.user_type, registration.phone_number);

        let now = Utc::now();
        let mut user = User {
            id: UserId::generate(),
            user_type: registration.user_type,
            status: UserStatus::Active,
            first_name: registration.first_name.trim().to_string(),
            last_name: registration.last_name.trim().to_string(),
            phone_number: registration.phone_number.trim().to_string(),
            device_tokens: registration.device_token.into_iter().collect(),
            rating: RatingSummary::default(),
            total_rides: 0,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.store.insert(&StoreKeys::user(&user.id), &mut user).await?;
        tracing::info!("User registered successfully: {}", user.id);
        Ok(user)
    }

    async fn get_user(&self, user_id: &UserId) -> SparrowResult<User> {
        tracing::debug!("Getting user: {}", user_id);
        self.store
            .get(&StoreKeys::user(user_id))
            .await?
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::UserType;

    fn registration(phone: &str) -> UserRegistration {
        UserRegistration {
            user_type: UserType::Passenger,
            first_name: "Ama".into(),
            last_name: "Owusu".into(),
            phone_number: phone.into(),
            device_token: Some("device-1".into()),
        }
    }

    #[tokio::test]
    async fn registered_user_can_be_read_back() {
        let service = UserService::new(Arc::new(StoreService::new_memory()));
        let user = service.register_user(registration("+233241234567")).await.unwrap();

        let fetched = service.get_user(&user.id).await.unwrap();
        assert_eq!(fetched.display_name(), "Ama Owusu");
        assert_eq!(fetched.device_tokens, vec!["device-1".to_string()]);
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn malformed_phone_is_rejected() {
        let service = UserService::new(Arc::new(StoreService::new_memory()));
        let err = service.register_user(registration("call me")).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed(ref e) if e[0].field == "phone_number"));
    }

    #[tokio::test]
    async fn ratings_accumulate_on_the_user() {
        let service = UserService::new(Arc::new(StoreService::new_memory()));
        let user = service.register_user(registration("+233241234567")).await.unwrap();

        service.record_rating(&user.id, 5).await.unwrap();
        let summary = service.record_rating(&user.id, 2).await.unwrap();
        assert_eq!(summary, RatingSummary { average: 3.5, count: 2 });

        let err = service.record_rating(&UserId::from("usr-250101-zzzzz"), 4).await.unwrap_err();
        assert!(matches!(err, AppError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let service = UserService::new(Arc::new(StoreService::new_memory()));
        let err = service.get_user(&UserId::from("usr-250101-zzzzz")).await.unwrap_err();
        assert!(matches!(err, AppError::UserNotFound(_)));
    }
}
