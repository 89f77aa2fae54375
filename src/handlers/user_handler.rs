use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::{
    errors::SparrowResult,
    models::{
        ids::UserId,
        ride::Ride,
        user::{User, UserRegistration},
    },
    services::{ride_service::RideOperations, user_service::UserOperations},
    state::AppState,
};

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<UserRegistration>,
) -> SparrowResult<(StatusCode, Json<User>)> {
    let user = state.user_service.register_user(registration).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> SparrowResult<Json<User>> {
    Ok(Json(state.user_service.get_user(&user_id).await?))
}

pub async fn get_user_rides(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> SparrowResult<Json<Vec<Ride>>> {
    Ok(Json(state.ride_service.rides_for_passenger(&user_id).await?))
}
