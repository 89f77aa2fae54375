// src/services/messaging_service.rs
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    models::{driver::Driver, ids::DriverId, ride::{Ride, RideStatus}, user::User},
    services::store_service::{StoreKeys, StoreService},
};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("FCM send failed: {0}")]
    FcmError(String),

    #[error("No device token for {0}")]
    NoDeviceToken(String),

    #[error("Recipient lookup failed: {0}")]
    Lookup(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub fcm_server_key: String,
    pub fcm_url: String,
}

impl Default for FcmConfig {
    fn default() -> Self {
        Self {
            fcm_server_key: String::new(),
            fcm_url: "https://fcm.googleapis.com/fcm/send".to_string(),
        }
    }
}

/// Push notifications to the two sides of a ride. Every call is
/// best-effort: callers log failures and carry on.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_to_device(&self, device_token: &str, message: NotificationMessage) -> Result<(), NotificationError>;
    async fn notify_offer(&self, ride: &Ride, driver_id: &DriverId) -> Result<(), NotificationError>;
    async fn notify_counter_offer(&self, ride: &Ride) -> Result<(), NotificationError>;
    async fn notify_ride_status(&self, ride: &Ride) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum NotificationPriority {
    Normal,
    #[default]
    High, // Will wake sleeping devices
}

impl NotificationMessage {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            data: None,
            priority: NotificationPriority::default(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    fn offer(ride: &Ride) -> Self {
        Self::new(
            "New ride request",
            &format!("{} to {} - {:.2} GHS", ride.pickup.address, ride.dropoff.address, ride.fare),
        )
        .with_data(json!({
            "type": "ride_offer",
            "ride_id": ride.id,
            "fare": ride.fare,
            "expires_at": ride.offer_expires_at.map(|t| t.to_rfc3339()),
        }))
    }

    fn counter_offer(ride: &Ride) -> Self {
        let fare = ride.counter_offer.as_ref().map_or(ride.fare, |c| c.fare);
        Self::new("Counter-offer", &format!("A driver proposed {:.2} GHS for your trip", fare)).with_data(json!({
            "type": "counter_offer",
            "ride_id": ride.id,
            "counter_fare": fare,
        }))
    }

    fn status(ride: &Ride) -> Self {
        let body = match ride.status {
            RideStatus::Accepted => "A driver accepted your ride".to_string(),
            RideStatus::Arrived => "Your driver has arrived at the pickup point".to_string(),
            RideStatus::InProgress => "Your trip has started".to_string(),
            RideStatus::Completed => format!("Trip completed - {:.2} GHS", ride.fare),
            RideStatus::Cancelled => "Your ride was cancelled".to_string(),
            RideStatus::Searching | RideStatus::CounterOffered => format!("Ride status: {}", ride.status),
        };
        Self::new("Ride update", &body)
            .with_data(json!({
                "type": "status_update",
                "ride_id": ride.id,
                "status": ride.status,
            }))
            .with_priority(NotificationPriority::Normal)
    }
}

pub struct FcmNotificationService {
    config: FcmConfig,
    client: reqwest::Client,
    store: Arc<StoreService>,
}

impl FcmNotificationService {
    pub fn new(config: FcmConfig, store: Arc<StoreService>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            store,
        }
    }

    async fn driver_device_token(&self, driver_id: &DriverId) -> Result<String, NotificationError> {
        let driver: Driver = self
            .store
            .get(&StoreKeys::driver(driver_id))
            .await
            .map_err(|e| NotificationError::Lookup(e.to_string()))?
            .ok_or_else(|| NotificationError::Lookup(format!("driver {}", driver_id)))?;
        driver
            .device_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NotificationError::NoDeviceToken(driver_id.to_string()))
    }

    async fn passenger_device_token(&self, ride: &Ride) -> Result<String, NotificationError> {
        let user: User = self
            .store
            .get(&StoreKeys::user(&ride.passenger_id))
            .await
            .map_err(|e| NotificationError::Lookup(e.to_string()))?
            .ok_or_else(|| NotificationError::Lookup(format!("user {}", ride.passenger_id)))?;
        user.device_tokens
            .into_iter()
            .next()
            .ok_or_else(|| NotificationError::NoDeviceToken(ride.passenger_id.to_string()))
    }
}

#[async_trait]
impl NotificationService for FcmNotificationService {
    async fn send_to_device(&self, device_token: &str, message: NotificationMessage) -> Result<(), NotificationError> {
        if device_token.is_empty() {
            return Err(NotificationError::NoDeviceToken("empty token".to_string()));
        }

        tracing::debug!("Sending FCM notification to device: {}", device_token);

        let mut fcm_message = json!({
            "to": device_token,
            "notification": {
                "title": message.title,
                "body": message.body,
                "sound": "default"
            },
            "priority": match message.priority {
                NotificationPriority::High => "high",
                NotificationPriority::Normal => "normal",
            }
        });

        if let Some(data) = message.data {
            fcm_message["data"] = data;
        }

        let response = self
            .client
            .post(&self.config.fcm_url)
            .header("Authorization", format!("key={}", self.config.fcm_server_key))
            .json(&fcm_message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotificationError::FcmError(format!("{}: {}", status, error_text)));
        }

        Ok(())
    }

    async fn notify_offer(&self, ride: &Ride, driver_id: &DriverId) -> Result<(), NotificationError> {
        let token = self.driver_device_token(driver_id).await?;
        self.send_to_device(&token, NotificationMessage::offer(ride)).await
    }

    async fn notify_counter_offer(&self, ride: &Ride) -> Result<(), NotificationError> {
        let token = self.passenger_device_token(ride).await?;
        self.send_to_device(&token, NotificationMessage::counter_offer(ride)).await
    }

    async fn notify_ride_status(&self, ride: &Ride) -> Result<(), NotificationError> {
        let token = self.passenger_device_token(ride).await?;
        self.send_to_device(&token, NotificationMessage::status(ride)).await
    }
}

/// What the mock was asked to deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum SentNotification {
    Offer { ride_id: String, driver_id: String },
    CounterOffer { ride_id: String },
    Status { ride_id: String, status: String },
}

// Mock service for development and testing
#[derive(Debug, Default)]
pub struct MockNotificationService {
    sent: Mutex<Vec<SentNotification>>,
}

impl MockNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationService for MockNotificationService {
    async fn send_to_device(&self, device_token: &str, message: NotificationMessage) -> Result<(), NotificationError> {
        tracing::info!("[MOCK] Would send FCM to {}: {} - {}", device_token, message.title, message.body);
        Ok(())
    }

    async fn notify_offer(&self, ride: &Ride, driver_id: &DriverId) -> Result<(), NotificationError> {
        tracing::info!("[MOCK] Offer for ride {} sent to driver {}", ride.id, driver_id);
        self.sent.lock().await.push(SentNotification::Offer {
            ride_id: ride.id.to_string(),
            driver_id: driver_id.to_string(),
        });
        Ok(())
    }

    async fn notify_counter_offer(&self, ride: &Ride) -> Result<(), NotificationError> {
        tracing::info!("[MOCK] Counter-offer on ride {} sent to passenger {}", ride.id, ride.passenger_id);
        self.sent.lock().await.push(SentNotification::CounterOffer {
            ride_id: ride.id.to_string(),
        });
        Ok(())
    }

    async fn notify_ride_status(&self, ride: &Ride) -> Result<(), NotificationError> {
        tracing::info!("[MOCK] Ride {} is now {}", ride.id, ride.status);
        self.sent.lock().await.push(SentNotification::Status {
            ride_id: ride.id.to_string(),
            status: ride.status.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_status_gets_a_body() {
        let mut ride = crate::models::ride::tests::sample_ride();
        for status in RideStatus::ALL {
            ride.status = status;
            let message = NotificationMessage::status(&ride);
            assert!(!message.body.is_empty());
            assert_eq!(message.priority, NotificationPriority::Normal);
        }

        ride.status = RideStatus::InProgress;
        assert_eq!(NotificationMessage::status(&ride).body, "Your trip has started");
        ride.status = RideStatus::CounterOffered;
        assert_eq!(NotificationMessage::status(&ride).body, format!("Ride status: {}", RideStatus::CounterOffered));
    }
}
