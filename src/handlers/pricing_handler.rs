use axum::{Json, extract::State};
use std::sync::Arc;

use crate::{
    errors::SparrowResult,
    models::{
        fare::{FareEstimateRequest, FareEstimateResponse},
        negotiation::{NegotiationRequest, NegotiationResponse},
    },
    state::AppState,
};

pub async fn estimate_fare(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FareEstimateRequest>,
) -> SparrowResult<Json<FareEstimateResponse>> {
    tracing::debug!("Fare estimate for {} km / {} min {}", request.distance_km, request.duration_minutes, request.service_type);
    Ok(Json(state.fares.estimate(&request)?))
}

pub async fn evaluate_negotiation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NegotiationRequest>,
) -> SparrowResult<Json<NegotiationResponse>> {
    Ok(Json(state.arbiter.evaluate(&request)?))
}
