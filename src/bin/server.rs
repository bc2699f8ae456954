use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use openparcel::auth::Credentials;
use openparcel::config::Config;
use openparcel::error::{OpenParcelError, ReqId};
use openparcel::model::{HistorySnapshot, Parcel, User, UserParcelLink};
use openparcel::service::{Service, TrackResult};
use openparcel::store::ParcelStore;

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load_default().context("failed to load configuration")?;

    tracing::info!(db_path = %config.db_path, "connecting to parcel store");
    let store = ParcelStore::connect(&config.db_path)
        .await
        .context("failed to connect to the parcel store")?;

    let bind_addr = config.bind_addr.clone();
    let port = config.port;
    let service = Arc::new(Service::new(store, config));

    let app = build_app(service);

    let addr: SocketAddr = format!("{bind_addr}:{port}")
        .parse()
        .context("invalid bind address/port")?;
    tracing::info!("openparcel listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("openparcel shut down gracefully");
    Ok(())
}

fn build_app(service: Arc<Service>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/", get(liveness))
        .route("/ping", get(ping))
        .route("/track/:carrier_id/:code", get(track_by_natural_key))
        .route("/track/:slug", get(track_by_slug))
        .route("/register", post(register))
        .route("/auth/token/new", post(issue_auth_token))
        .route("/auth/token/:token", delete(revoke_auth_token))
        .route(
            "/save/:carrier_id/:code",
            post(save_by_natural_key).delete(unsave_by_natural_key),
        )
        .route("/save/:slug", post(save_by_slug).delete(unsave_by_slug))
        .route("/archive/:slug", post(archive).delete(unarchive))
        .route("/parcels", get(list_parcels))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

// ---- request identity -----------------------------------------------------

/// Renders request headers into the stable, deterministic form
/// `request_id::generate` expects (spec.md §7/§16).
fn header_digest_input(headers: &HeaderMap) -> String {
    let mut pairs: Vec<String> = headers
        .iter()
        .map(|(name, value)| format!("{}:{}", name.as_str(), value.to_str().unwrap_or("")))
        .collect();
    pairs.sort();
    pairs.join("\n")
}

fn new_req_id(uri: &Uri, headers: &HeaderMap) -> ReqId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    ReqId(openparcel::request_id::generate(
        uri.path(),
        &header_digest_input(headers),
        millis,
    ))
}

// ---- auth extraction --------------------------------------------------------

#[derive(Deserialize)]
struct AuthQuery {
    auth: Option<String>,
    #[serde(default)]
    force: bool,
}

/// `auth=username:secret` form/query parameter or `X-Auth-Token:
/// username:secret` header (spec.md §6).
fn auth_credentials(headers: &HeaderMap, query_auth: Option<&str>) -> Option<Credentials> {
    if let Some(raw) = headers
        .get("X-Auth-Token")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(creds) = Credentials::parse(raw) {
            return Some(creds);
        }
    }
    query_auth.and_then(Credentials::parse)
}

async fn authenticate_optional(
    store: &ParcelStore,
    headers: &HeaderMap,
    query_auth: Option<&str>,
) -> Result<Option<User>, OpenParcelError> {
    match auth_credentials(headers, query_auth) {
        Some(creds) => Ok(Some(openparcel::auth::authenticate(store, &creds).await?)),
        None => Ok(None),
    }
}

async fn authenticate_required(
    store: &ParcelStore,
    headers: &HeaderMap,
    query_auth: Option<&str>,
) -> Result<User, OpenParcelError> {
    let creds = auth_credentials(headers, query_auth).ok_or(OpenParcelError::AuthenticationFailed {
        status_code: 401,
    })?;
    openparcel::auth::authenticate(store, &creds).await
}

// ---- response shapes --------------------------------------------------------

#[derive(Serialize)]
struct ParcelResponse {
    slug: String,
    carrier_id: String,
    tracking_code: String,
    created: chrono::DateTime<chrono::Utc>,
    retrieved: chrono::DateTime<chrono::Utc>,
    history: serde_json::Value,
    cached: bool,
    outdated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    archived: Option<bool>,
}

impl ParcelResponse {
    fn from_result(result: TrackResult) -> Self {
        let TrackResult {
            parcel,
            snapshot,
            link,
            cached,
            outdated,
        } = result;
        let HistorySnapshot { retrieved, data, .. } = snapshot;
        let Parcel {
            carrier_id,
            tracking_code,
            created,
            slug,
            ..
        } = parcel;
        let (name, archived) = match link {
            Some(UserParcelLink { name, archived, .. }) => (Some(name), Some(archived)),
            None => (None, None),
        };
        Self {
            slug,
            carrier_id,
            tracking_code,
            created,
            retrieved,
            history: data,
            cached,
            outdated,
            name,
            archived,
        }
    }
}

// ---- handlers ---------------------------------------------------------------

async fn liveness() -> &'static str {
    "openparcel"
}

async fn ping() -> impl IntoResponse {
    (
        [("X-OpenParcel-Version", env!("CARGO_PKG_VERSION"))],
        "pong",
    )
}

async fn track_by_natural_key(
    State(state): State<AppState>,
    AxPath((carrier_id, code)): AxPath<(String, String)>,
    Query(query): Query<AuthQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        let user = authenticate_optional(&state.service.store, &headers, query.auth.as_deref()).await?;
        let force = query.force && user.as_ref().is_some_and(User::is_superuser);
        state
            .service
            .track_by_natural_key(&carrier_id, &code, user.as_ref(), force)
            .await
    }
    .await;

    match result {
        Ok(track_result) => Json(ParcelResponse::from_result(track_result)).into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

async fn track_by_slug(
    State(state): State<AppState>,
    AxPath(slug): AxPath<String>,
    Query(query): Query<AuthQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        let user = authenticate_optional(&state.service.store, &headers, query.auth.as_deref()).await?;
        let force = query.force && user.as_ref().is_some_and(User::is_superuser);
        state
            .service
            .track_by_slug(&slug, user.as_ref(), force)
            .await
    }
    .await;

    match result {
        Ok(track_result) => Json(ParcelResponse::from_result(track_result)).into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    username: String,
}

async fn register(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    match state.service.register(&body.username, &body.password).await {
        Ok(user) => Json(RegisterResponse { username: user.username }).into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

#[derive(Deserialize)]
struct AuthTokenRequest {
    #[serde(default)]
    description: String,
}

#[derive(Serialize)]
struct AuthTokenResponse {
    token: String,
}

async fn issue_auth_token(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    body: Option<Json<AuthTokenRequest>>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let description = body.map(|Json(b)| b.description).unwrap_or_default();
    let result = async {
        let user = authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        state.service.issue_auth_token(&user, &description).await
    }
    .await;
    match result {
        Ok(token) => Json(AuthTokenResponse { token }).into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

async fn revoke_auth_token(
    State(state): State<AppState>,
    AxPath(token): AxPath<String>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        state.service.revoke_auth_token(&token).await
    }
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

#[derive(Deserialize)]
struct SaveRequest {
    #[serde(default)]
    name: Option<String>,
}

async fn save_by_natural_key(
    State(state): State<AppState>,
    AxPath((carrier_id, code)): AxPath<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    body: Option<Json<SaveRequest>>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let name = body.and_then(|Json(b)| b.name).unwrap_or_else(|| code.clone());
    let result = async {
        let user = authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        let parcel = state
            .service
            .resolve_parcel_by_natural_key(&carrier_id, &code)
            .await?;
        state.service.save_link(&user, &parcel, &name).await
    }
    .await;
    match result {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

async fn unsave_by_natural_key(
    State(state): State<AppState>,
    AxPath((carrier_id, code)): AxPath<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        let user = authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        let parcel = state
            .service
            .resolve_parcel_by_natural_key(&carrier_id, &code)
            .await?;
        state.service.delete_link(&user, &parcel).await
    }
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

async fn save_by_slug(
    State(state): State<AppState>,
    AxPath(slug): AxPath<String>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    body: Option<Json<SaveRequest>>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        let user = authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        let parcel = state.service.resolve_parcel_by_slug(&slug).await?;
        let name = body
            .and_then(|Json(b)| b.name)
            .unwrap_or_else(|| parcel.tracking_code.clone());
        state.service.save_link(&user, &parcel, &name).await
    }
    .await;
    match result {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

async fn unsave_by_slug(
    State(state): State<AppState>,
    AxPath(slug): AxPath<String>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        let user = authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        let parcel = state.service.resolve_parcel_by_slug(&slug).await?;
        state.service.delete_link(&user, &parcel).await
    }
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

async fn archive(
    State(state): State<AppState>,
    AxPath(slug): AxPath<String>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Response {
    set_archived(state, slug, headers, uri, query, true).await
}

async fn unarchive(
    State(state): State<AppState>,
    AxPath(slug): AxPath<String>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Response {
    set_archived(state, slug, headers, uri, query, false).await
}

async fn set_archived(
    state: AppState,
    slug: String,
    headers: HeaderMap,
    uri: Uri,
    query: AuthQuery,
    archived: bool,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        let user = authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        let parcel = state.service.resolve_parcel_by_slug(&slug).await?;
        state.service.set_archived(&user, &parcel, archived).await
    }
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}

async fn list_parcels(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Response {
    let req_id = new_req_id(&uri, &headers);
    let result = async {
        let user = authenticate_required(&state.service.store, &headers, query.auth.as_deref()).await?;
        state.service.list_parcels(&user).await
    }
    .await;
    match result {
        Ok(parcels) => Json(
            parcels
                .into_iter()
                .map(ParcelResponse::from_result)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => err.into_response_with(Some(&req_id)),
    }
}
