pub mod driver_handler;
pub mod pricing_handler;
pub mod review_handler;
pub mod ride_handler;
pub mod user_handler;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post, put},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::{
    errors::{SparrowError, SparrowResult},
    state::AppState,
};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fares/estimate", post(pricing_handler::estimate_fare))
        .route("/negotiations/evaluate", post(pricing_handler::evaluate_negotiation))
        .route("/users", post(user_handler::create_user))
        .route("/users/:user_id", get(user_handler::get_user))
        .route("/users/:user_id/rides", get(user_handler::get_user_rides))
        .route("/users/:user_id/reviews", get(review_handler::get_user_reviews))
        .route("/drivers", get(driver_handler::list_available).post(driver_handler::create_driver))
        .route("/drivers/:driver_id", get(driver_handler::get_driver))
        .route("/drivers/:driver_id/rides", get(driver_handler::get_driver_rides))
        .route("/drivers/:driver_id/status", put(driver_handler::update_status))
        .route("/drivers/:driver_id/location", put(driver_handler::update_location))
        .route("/drivers/:driver_id/fare-policy", put(driver_handler::update_fare_policy))
        .route("/drivers/:driver_id/reviews", get(review_handler::get_driver_reviews))
        .route("/rides", post(ride_handler::create_ride))
        .route("/rides/:ride_id", get(ride_handler::get_ride))
        .route("/rides/:ride_id/dispatch", post(ride_handler::dispatch_ride))
        .route("/rides/:ride_id/offers/:driver_id", post(ride_handler::respond_to_offer))
        .route("/rides/:ride_id/offers/:driver_id/negotiate", post(ride_handler::negotiate_offer))
        .route("/rides/:ride_id/counter-offer", post(ride_handler::answer_counter_offer))
        .route("/rides/:ride_id/arrive", post(ride_handler::mark_arrived))
        .route("/rides/:ride_id/start", post(ride_handler::start_trip))
        .route("/rides/:ride_id/complete", post(ride_handler::complete_trip))
        .route("/rides/:ride_id/cancel", post(ride_handler::cancel_ride))
        .route("/rides/:ride_id/ratings", post(review_handler::rate_ride))
        .route("/rides/:ride_id/settlement", get(review_handler::get_settlement))
        .route("/reviews", post(review_handler::submit_review))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> SparrowResult<Json<Value>> {
    let store_ok = state
        .store
        .health_check()
        .await
        .map_err(|e| SparrowError::ServiceUnavailable(format!("store: {}", e)))?;
    Ok(Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": state.store.backend_name(),
        "pending_offers": state.timer.outstanding().await,
    })))
}
