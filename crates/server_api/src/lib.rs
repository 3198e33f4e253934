use std::sync::Arc;

use coordinator::{CoordinatorError, RoomCoordinator, RoomRules};
use places::{enrich_all, PlacesLookup};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Phase, PlaceId, PlaceTally, Readiness, Room, RoomCode, SelectedPlace, UserId},
    error::{ApiError, ErrorCode},
    geo::{AreaPolygon, GeoJson},
    protocol::{IntentionsView, PlaceDetails, RoomSnapshot},
};
use storage::Storage;
use tracing::{error, info};

pub const MAX_USERNAME_CHARS: usize = 64;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Arc<Storage>,
    pub coordinator: RoomCoordinator,
    pub places: Arc<dyn PlacesLookup>,
}

impl ApiContext {
    pub fn new(storage: Storage, rules: RoomRules, places: Arc<dyn PlacesLookup>) -> Self {
        let storage = Arc::new(storage);
        let coordinator = RoomCoordinator::new(storage.clone()).with_rules(rules);
        Self {
            storage,
            coordinator,
            places,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UserRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JoinRoomRequest {
    pub code: String,
    pub user_id: UserId,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PhaseChangeResponse {
    pub changed: bool,
    pub phase: Phase,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetAreaRequest {
    pub user_id: UserId,
    pub area: GeoJson,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AreaResponse {
    pub saved: bool,
    pub area_km2: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IntentionRequest {
    pub user_id: UserId,
    pub task_description: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SelectionRequest {
    pub user_id: UserId,
    pub places: Vec<SelectedPlace>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SelectionResponse {
    pub filled_for_others: usize,
    pub readiness: Readiness,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VoteRequest {
    pub user_id: UserId,
    pub place_id: PlaceId,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetractResponse {
    pub retracted: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WinnerResponse {
    pub winner: Option<PlaceId>,
}

pub async fn login(ctx: &ApiContext, req: &LoginRequest) -> Result<LoginResponse, ApiError> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(ApiError::validation("username cannot be empty"));
    }
    if username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::validation(format!(
            "username exceeds {MAX_USERNAME_CHARS} characters"
        )));
    }
    let user_id = ctx.storage.login(username).await.map_err(internal)?;
    info!(%user_id, "user logged in");
    Ok(LoginResponse { user_id })
}

pub async fn create_room(ctx: &ApiContext, owner_id: UserId) -> Result<Room, ApiError> {
    ctx.coordinator
        .create_room(owner_id)
        .await
        .map_err(coordinator_error)
}

pub async fn join_room(ctx: &ApiContext, req: &JoinRoomRequest) -> Result<Room, ApiError> {
    let code = parse_code(&req.code)?;
    ctx.coordinator
        .join_room(&code, req.user_id)
        .await
        .map_err(coordinator_error)
}

pub async fn room_snapshot(ctx: &ApiContext, code: &str) -> Result<RoomSnapshot, ApiError> {
    let code = parse_code(code)?;
    ctx.coordinator
        .snapshot(&code)
        .await
        .map_err(coordinator_error)
}

pub async fn begin_planning(
    ctx: &ApiContext,
    code: &str,
    caller: UserId,
) -> Result<PhaseChangeResponse, ApiError> {
    let code = parse_code(code)?;
    let changed = ctx
        .coordinator
        .begin_planning(&code, caller)
        .await
        .map_err(coordinator_error)?;
    phase_response(ctx, &code, changed).await
}

pub async fn set_area(
    ctx: &ApiContext,
    code: &str,
    req: &SetAreaRequest,
) -> Result<AreaResponse, ApiError> {
    let code = parse_code(code)?;
    let polygon = AreaPolygon::from_geojson(&req.area)
        .map_err(|err| coordinator_error(CoordinatorError::InvalidPolygon(err)))?;
    let write = ctx
        .coordinator
        .write_area_polygon(&code, req.user_id, &polygon)
        .await
        .map_err(coordinator_error)?;
    Ok(AreaResponse {
        saved: write.saved,
        area_km2: Some(write.area_km2),
    })
}

pub async fn clear_area(
    ctx: &ApiContext,
    code: &str,
    caller: UserId,
) -> Result<AreaResponse, ApiError> {
    let code = parse_code(code)?;
    let saved = ctx
        .coordinator
        .clear_area_polygon(&code, caller)
        .await
        .map_err(coordinator_error)?;
    Ok(AreaResponse {
        saved,
        area_km2: None,
    })
}

pub async fn confirm_area(
    ctx: &ApiContext,
    code: &str,
    caller: UserId,
) -> Result<PhaseChangeResponse, ApiError> {
    let code = parse_code(code)?;
    let changed = ctx
        .coordinator
        .confirm_area(&code, caller)
        .await
        .map_err(coordinator_error)?;
    phase_response(ctx, &code, changed).await
}

pub async fn submit_intention(
    ctx: &ApiContext,
    code: &str,
    req: &IntentionRequest,
) -> Result<IntentionsView, ApiError> {
    let parsed = parse_code(code)?;
    ctx.coordinator
        .submit_intention(&parsed, req.user_id, &req.task_description)
        .await
        .map_err(coordinator_error)?;
    list_intentions(ctx, code).await
}

pub async fn list_intentions(ctx: &ApiContext, code: &str) -> Result<IntentionsView, ApiError> {
    let code = parse_code(code)?;
    let intentions = ctx
        .coordinator
        .list_intentions(&code)
        .await
        .map_err(coordinator_error)?;
    let merged = coordinator::derive::merge_intentions(&intentions);
    Ok(IntentionsView { intentions, merged })
}

pub async fn submit_selection(
    ctx: &ApiContext,
    code: &str,
    req: &SelectionRequest,
) -> Result<SelectionResponse, ApiError> {
    let code = parse_code(code)?;
    let filled_for_others = ctx
        .coordinator
        .submit_selection(&code, req.user_id, &req.places)
        .await
        .map_err(coordinator_error)?;
    let readiness = ctx
        .coordinator
        .compute_readiness(&code)
        .await
        .map_err(coordinator_error)?;
    Ok(SelectionResponse {
        filled_for_others,
        readiness,
    })
}

/// `PlaceSelection -> Voting`; a no-op until every participant is ready.
pub async fn advance_to_voting(
    ctx: &ApiContext,
    code: &str,
) -> Result<PhaseChangeResponse, ApiError> {
    let code = parse_code(code)?;
    let changed = ctx
        .coordinator
        .advance_to_voting(&code)
        .await
        .map_err(coordinator_error)?;
    phase_response(ctx, &code, changed).await
}

pub async fn mark_resolved(ctx: &ApiContext, code: &str) -> Result<PhaseChangeResponse, ApiError> {
    let code = parse_code(code)?;
    let changed = ctx
        .coordinator
        .mark_resolved(&code)
        .await
        .map_err(coordinator_error)?;
    phase_response(ctx, &code, changed).await
}

pub async fn readiness(ctx: &ApiContext, code: &str) -> Result<Readiness, ApiError> {
    let code = parse_code(code)?;
    ctx.coordinator
        .compute_readiness(&code)
        .await
        .map_err(coordinator_error)
}

/// Candidate places enriched through the places lookup.
pub async fn place_details(ctx: &ApiContext, code: &str) -> Result<Vec<PlaceDetails>, ApiError> {
    let code = parse_code(code)?;
    let candidates = ctx
        .coordinator
        .candidate_places(&code)
        .await
        .map_err(coordinator_error)?;
    Ok(enrich_all(ctx.places.as_ref(), &candidates).await)
}

pub async fn cast_vote(
    ctx: &ApiContext,
    code: &str,
    req: &VoteRequest,
) -> Result<Vec<PlaceTally>, ApiError> {
    let parsed = parse_code(code)?;
    ctx.coordinator
        .cast_vote(&parsed, req.user_id, &req.place_id)
        .await
        .map_err(coordinator_error)?;
    tally(ctx, code).await
}

pub async fn retract_vote(
    ctx: &ApiContext,
    code: &str,
    caller: UserId,
) -> Result<RetractResponse, ApiError> {
    let code = parse_code(code)?;
    let retracted = ctx
        .coordinator
        .retract_vote(&code, caller)
        .await
        .map_err(coordinator_error)?;
    Ok(RetractResponse { retracted })
}

pub async fn tally(ctx: &ApiContext, code: &str) -> Result<Vec<PlaceTally>, ApiError> {
    let code = parse_code(code)?;
    ctx.coordinator.tally(&code).await.map_err(coordinator_error)
}

pub async fn winner(ctx: &ApiContext, code: &str) -> Result<WinnerResponse, ApiError> {
    let code = parse_code(code)?;
    let winner = ctx
        .coordinator
        .resolve_winner(&code)
        .await
        .map_err(coordinator_error)?;
    Ok(WinnerResponse { winner })
}

pub fn parse_code(raw: &str) -> Result<RoomCode, ApiError> {
    RoomCode::parse(raw).map_err(|err| coordinator_error(CoordinatorError::InvalidRoomCode(err)))
}

async fn phase_response(
    ctx: &ApiContext,
    code: &RoomCode,
    changed: bool,
) -> Result<PhaseChangeResponse, ApiError> {
    let snapshot = ctx
        .coordinator
        .snapshot(code)
        .await
        .map_err(coordinator_error)?;
    Ok(PhaseChangeResponse {
        changed,
        phase: snapshot.room.phase,
    })
}

pub fn coordinator_error(err: CoordinatorError) -> ApiError {
    let code = match &err {
        e if e.is_not_found() => ErrorCode::NotFound,
        CoordinatorError::CodeCollision => ErrorCode::Conflict,
        CoordinatorError::Store(_) => ErrorCode::Internal,
        _ => ErrorCode::Validation,
    };
    if code == ErrorCode::Internal {
        error!(%err, "room operation failed");
    }
    ApiError::new(code, err.to_string())
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "storage failure");
    ApiError::new(ErrorCode::Internal, err.to_string())
}
