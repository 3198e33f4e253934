use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use coordinator::{ChangeFilter, SharedStore};
use places::{HttpPlacesClient, OfflinePlaces, PlacesLookup};
use serde::Deserialize;
use server_api::{
    ApiContext, AreaResponse, IntentionRequest, JoinRoomRequest, LoginRequest, LoginResponse,
    PhaseChangeResponse, RetractResponse, SelectionRequest, SelectionResponse, SetAreaRequest,
    UserRequest, VoteRequest, WinnerResponse,
};
use shared::{
    domain::{PlaceTally, Readiness, Room, RoomCode},
    error::{ApiError, ErrorCode},
    protocol::{ChangeSignal, IntentionsView, PlaceDetails, RoomSnapshot, StoreTable},
};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info};

mod config;

use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 256 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    room: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let places: Arc<dyn PlacesLookup> = match &settings.places_api_url {
        Some(url) => Arc::new(HttpPlacesClient::new(url, settings.places_search_radius_m)?),
        None => {
            info!("no places service configured; place details stay minimal");
            Arc::new(OfflinePlaces)
        }
    };
    let api = ApiContext::new(storage, settings.room_rules(), places);
    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/rooms", post(create_room))
        .route("/rooms/join", post(join_room))
        .route("/rooms/:code", get(room_snapshot))
        .route("/rooms/:code/planning", post(begin_planning))
        .route("/rooms/:code/area", put(set_area).delete(clear_area))
        .route("/rooms/:code/area/confirm", post(confirm_area))
        .route(
            "/rooms/:code/intentions",
            post(submit_intention).get(list_intentions),
        )
        .route("/rooms/:code/selections", post(submit_selection))
        .route("/rooms/:code/readiness", get(readiness))
        .route("/rooms/:code/voting", post(advance_to_voting))
        .route("/rooms/:code/resolve", post(mark_resolved))
        .route("/rooms/:code/places", get(place_details))
        .route(
            "/rooms/:code/votes",
            post(cast_vote).delete(retract_vote).get(tally),
        )
        .route("/rooms/:code/winner", get(winner))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.api.storage.health_check().await.map_err(|e| {
        error!(error = %e, "health check failed");
        reject(ApiError::internal(e.to_string()))
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    server_api::login(&state.api, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResult<Room> {
    server_api::create_room(&state.api, req.user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn join_room(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinRoomRequest>,
) -> ApiResult<Room> {
    server_api::join_room(&state.api, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn room_snapshot(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<RoomSnapshot> {
    server_api::room_snapshot(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn begin_planning(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<UserRequest>,
) -> ApiResult<PhaseChangeResponse> {
    server_api::begin_planning(&state.api, &code, req.user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn set_area(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<SetAreaRequest>,
) -> ApiResult<AreaResponse> {
    server_api::set_area(&state.api, &code, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn clear_area(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<UserRequest>,
) -> ApiResult<AreaResponse> {
    server_api::clear_area(&state.api, &code, req.user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn confirm_area(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<UserRequest>,
) -> ApiResult<PhaseChangeResponse> {
    server_api::confirm_area(&state.api, &code, req.user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn submit_intention(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<IntentionRequest>,
) -> ApiResult<IntentionsView> {
    server_api::submit_intention(&state.api, &code, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn list_intentions(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<IntentionsView> {
    server_api::list_intentions(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn submit_selection(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<SelectionRequest>,
) -> ApiResult<SelectionResponse> {
    server_api::submit_selection(&state.api, &code, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn advance_to_voting(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<PhaseChangeResponse> {
    server_api::advance_to_voting(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn mark_resolved(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<PhaseChangeResponse> {
    server_api::mark_resolved(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn readiness(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Readiness> {
    server_api::readiness(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn place_details(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Vec<PlaceDetails>> {
    server_api::place_details(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn cast_vote(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<Vec<PlaceTally>> {
    server_api::cast_vote(&state.api, &code, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn retract_vote(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<UserRequest>,
) -> ApiResult<RetractResponse> {
    server_api::retract_vote(&state.api, &code, req.user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn tally(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Vec<PlaceTally>> {
    server_api::tally(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn winner(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<WinnerResponse> {
    server_api::winner(&state.api, &code)
        .await
        .map(Json)
        .map_err(reject)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let code = server_api::parse_code(&q.room).map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, code)))
}

/// Forwards this room's change signals to the socket until either side closes.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, code: RoomCode) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let filter = ChangeFilter::room(code.clone());
    let mut changes = state.api.storage.changes();
    debug!(room_code = %code, "change stream opened");

    let send_task = tokio::spawn(async move {
        loop {
            let signal = match changes.recv().await {
                Ok(signal) if filter.matches(&signal) => signal,
                Ok(_) => continue,
                // Missed signals; any one of them means "re-fetch".
                Err(RecvError::Lagged(_)) => ChangeSignal {
                    table: StoreTable::Rooms,
                    room_code: filter.room_code.clone(),
                },
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&signal) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!(room_code = %code, "change stream closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
