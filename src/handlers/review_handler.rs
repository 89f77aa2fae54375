use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::{
    errors::{SparrowError, SparrowResult},
    models::{
        ids::{DriverId, PartyRef, RideId, UserId},
        review::{Review, ReviewRequest, RideRatingRequest},
    },
    services::settlement_service::Settlement,
    state::AppState,
};

pub async fn rate_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
    Json(request): Json<RideRatingRequest>,
) -> SparrowResult<(StatusCode, Json<Review>)> {
    let review = state.settlement_service.rate_ride(&ride_id, request).await?;
    Ok((StatusCode::CREATED, Json(review)))
}

pub async fn submit_review(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReviewRequest>,
) -> SparrowResult<(StatusCode, Json<Review>)> {
    let review = state.settlement_service.submit_review(request).await?;
    Ok((StatusCode::CREATED, Json(review)))
}

pub async fn get_settlement(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
) -> SparrowResult<Json<Settlement>> {
    state
        .settlement_service
        .get_settlement(&ride_id)
        .await?
        .map(Json)
        .ok_or_else(|| SparrowError::not_found(format!("settlement for ride {}", ride_id)))
}

pub async fn get_user_reviews(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> SparrowResult<Json<Vec<Review>>> {
    Ok(Json(state.settlement_service.reviews_for(&PartyRef::Passenger(user_id)).await?))
}

pub async fn get_driver_reviews(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
) -> SparrowResult<Json<Vec<Review>>> {
    Ok(Json(state.settlement_service.reviews_for(&PartyRef::Driver(driver_id)).await?))
}
