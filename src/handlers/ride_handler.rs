use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    errors::SparrowResult,
    models::{
        ids::{DriverId, RideId},
        negotiation::NegotiationResponse,
        ride::{CancelRequest, Ride, RideRequest},
    },
    services::{
        matching_service::{DispatchOutcome, DriverDecision},
        ride_service::RideOperations,
    },
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct DispatchedRide {
    pub ride: Ride,
    pub dispatch: DispatchOutcome,
}

#[derive(Debug, Serialize)]
pub struct NegotiatedRide {
    pub negotiation: NegotiationResponse,
    pub ride: Ride,
}

#[derive(Debug, Deserialize)]
pub struct CounterAnswer {
    pub accept: bool,
}

#[derive(Debug, Deserialize)]
pub struct DriverAction {
    pub driver_id: DriverId,
}

pub async fn create_ride(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RideRequest>,
) -> SparrowResult<(StatusCode, Json<DispatchedRide>)> {
    let ride = state.ride_service.create_ride(request).await?;
    let dispatch = state.matching_service.dispatch(&ride.id).await?;
    let ride = state.ride_service.get_ride(&ride.id).await?;
    Ok((StatusCode::CREATED, Json(DispatchedRide { ride, dispatch })))
}

pub async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
) -> SparrowResult<Json<Ride>> {
    Ok(Json(state.ride_service.get_ride(&ride_id).await?))
}

pub async fn dispatch_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
) -> SparrowResult<Json<DispatchedRide>> {
    let dispatch = state.matching_service.dispatch(&ride_id).await?;
    let ride = state.ride_service.get_ride(&ride_id).await?;
    Ok(Json(DispatchedRide { ride, dispatch }))
}

pub async fn respond_to_offer(
    State(state): State<Arc<AppState>>,
    Path((ride_id, driver_id)): Path<(RideId, DriverId)>,
    Json(decision): Json<DriverDecision>,
) -> SparrowResult<Json<Ride>> {
    Ok(Json(state.matching_service.respond(&ride_id, &driver_id, decision).await?))
}

pub async fn negotiate_offer(
    State(state): State<Arc<AppState>>,
    Path((ride_id, driver_id)): Path<(RideId, DriverId)>,
) -> SparrowResult<Json<NegotiatedRide>> {
    let (negotiation, ride) = state.matching_service.negotiate(&ride_id, &driver_id).await?;
    Ok(Json(NegotiatedRide { negotiation, ride }))
}

pub async fn answer_counter_offer(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
    Json(answer): Json<CounterAnswer>,
) -> SparrowResult<Json<Ride>> {
    Ok(Json(state.matching_service.passenger_counter_response(&ride_id, answer.accept).await?))
}

pub async fn mark_arrived(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
    Json(action): Json<DriverAction>,
) -> SparrowResult<Json<Ride>> {
    Ok(Json(state.ride_service.mark_arrived(&ride_id, &action.driver_id).await?))
}

pub async fn start_trip(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
    Json(action): Json<DriverAction>,
) -> SparrowResult<Json<Ride>> {
    Ok(Json(state.ride_service.start_trip(&ride_id, &action.driver_id).await?))
}

pub async fn complete_trip(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
    Json(action): Json<DriverAction>,
) -> SparrowResult<Json<Ride>> {
    Ok(Json(state.ride_service.complete_trip(&ride_id, &action.driver_id).await?))
}

pub async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<RideId>,
    Json(request): Json<CancelRequest>,
) -> SparrowResult<Json<Ride>> {
    Ok(Json(state.ride_service.cancel_ride(&ride_id, request).await?))
}
