use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::{
    errors::SparrowResult,
    models::{
        driver::{Driver, DriverLocationUpdate, DriverRegistration, DriverStatusUpdate, FarePolicy},
        ids::DriverId,
        ride::Ride,
    },
    services::{driver_service::DriverOperations, ride_service::RideOperations},
    state::AppState,
};

pub async fn create_driver(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<DriverRegistration>,
) -> SparrowResult<(StatusCode, Json<Driver>)> {
    let driver = state.driver_service.register_driver(registration).await?;
    Ok((StatusCode::CREATED, Json(driver)))
}

pub async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
) -> SparrowResult<Json<Driver>> {
    Ok(Json(state.driver_service.get_driver(&driver_id).await?))
}

pub async fn get_driver_rides(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
) -> SparrowResult<Json<Vec<Ride>>> {
    Ok(Json(state.ride_service.rides_for_driver(&driver_id).await?))
}

pub async fn list_available(State(state): State<Arc<AppState>>) -> SparrowResult<Json<Vec<Driver>>> {
    Ok(Json(state.driver_service.available_drivers().await?))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
    Json(update): Json<DriverStatusUpdate>,
) -> SparrowResult<Json<Driver>> {
    Ok(Json(state.driver_service.set_availability(&driver_id, update.status).await?))
}

pub async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
    Json(update): Json<DriverLocationUpdate>,
) -> SparrowResult<Json<Driver>> {
    Ok(Json(state.driver_service.update_location(&driver_id, update).await?))
}

pub async fn update_fare_policy(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
    Json(policy): Json<FarePolicy>,
) -> SparrowResult<Json<Driver>> {
    Ok(Json(state.driver_service.set_fare_policy(&driver_id, policy).await?))
}
