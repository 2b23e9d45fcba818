//! api-server — HTTP API over the member/team query model.
//!
//! Provides dynamic member search, registration, team statistics and bulk
//! edits, with:
//! - Storage: In-memory or SQLite (file) when the `sqlite` feature is enabled.
//! - CORS: Configurable via CORS_ALLOW_ORIGIN (origin string) for a frontend.
//! - Demo data: `SEED_FIXTURES=1` loads two teams and four members into an
//!   empty store.
//!
//! Run:
//! ```bash
//! # pretty logs (default); PORT optional
//! SEED_FIXTURES=1 cargo run -p api-server
//!
//! # throwaway in-memory store
//! STORAGE_PROVIDER=memory SEED_FIXTURES=1 cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.
//!

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use domain::adapters::MemoryStore;
use domain::dto::{MemberTeamDto, TeamStats};
use domain::fixtures::seed_basic;
use domain::query::NullOrdering;
use domain::schema::EntityKind;
use domain::service::{MemberSearchCondition, MemberService, MemberSort, MemberSortField};
use domain::{CoreError, DeleteClause, QTeam, Session, Store, Tuple, UpdateClause, Value};
use http_common::{NullsPlacement, SortParam};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Page size used when a search does not ask for one.
const DEFAULT_PAGE_SIZE: usize = 50;

// Local store abstraction supporting memory or sqlite (feature-gated).
enum AnyStore {
    Memory(MemoryStore),
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite_adapter::SqliteStore),
}

impl AnyStore {
    fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    #[cfg(feature = "sqlite")]
    fn sqlite(db_path: Option<&std::path::Path>) -> Result<Self, CoreError> {
        let store = match db_path {
            Some(path) => {
                // Ensure directory exists
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                sqlite_adapter::SqliteStore::new(path)?
            }
            None => sqlite_adapter::SqliteStore::from_env()?,
        };
        Ok(Self::Sqlite(store))
    }

    fn inner(&self) -> &dyn Store {
        match self {
            Self::Memory(s) => s,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(s) => s,
        }
    }
}

impl Store for AnyStore {
    fn next_id(&self, entity: EntityKind) -> Result<i64, CoreError> {
        self.inner().next_id(entity)
    }

    fn insert(&self, entity: EntityKind, row: &[Value]) -> Result<(), CoreError> {
        self.inner().insert(entity, row)
    }

    fn find_row(&self, entity: EntityKind, id: i64) -> Result<Option<Vec<Value>>, CoreError> {
        self.inner().find_row(entity, id)
    }

    fn fetch(&self, query: &domain::Query) -> Result<Vec<Tuple>, CoreError> {
        self.inner().fetch(query)
    }

    fn count(&self, query: &domain::Query) -> Result<u64, CoreError> {
        self.inner().count(query)
    }

    fn fetch_page(&self, query: &domain::Query) -> Result<(Vec<Tuple>, u64), CoreError> {
        self.inner().fetch_page(query)
    }

    fn execute_update(&self, update: &UpdateClause) -> Result<u64, CoreError> {
        self.inner().execute_update(update)
    }

    fn execute_delete(&self, delete: &DeleteClause) -> Result<u64, CoreError> {
        self.inner().execute_delete(delete)
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<MemberService<AnyStore>>,
    max_page_size: usize,
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_volatile();

    let service = match MemberService::new(build_store(&cfg)) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to build member service");
            std::process::exit(1);
        }
    };
    if cfg.seed_fixtures {
        if let Err(e) = seed_if_empty(&service) {
            error!(err = %e, "failed to seed fixtures");
            std::process::exit(1);
        }
    }

    let state = AppState {
        service: Arc::new(service),
        max_page_size: cfg.max_page_size,
    };

    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    let mut app = router(state)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    // CORS - already validated in Config::from_env()
    let cors = if cfg.cors_allow_origin == HeaderValue::from_static("*") {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list([cfg.cors_allow_origin.clone()]))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    };
    app = app.layer(cors);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    info!(%addr, "api-server listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, err = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(err = %e, "server error");
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/members", get(list_members).post(create_member).options(preflight))
        .route("/api/members/bulk/rename", post(bulk_rename).options(preflight))
        .route("/api/members/bulk/delete", post(bulk_delete).options(preflight))
        .route("/api/teams", post(create_team).options(preflight))
        .route("/api/teams/stats", get(team_stats).options(preflight))
        .with_state(state)
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

// Construct a store instance based on config and feature flags.
fn build_store(cfg: &config::Config) -> AnyStore {
    match cfg.storage_provider {
        #[cfg(feature = "sqlite")]
        config::StorageProvider::Sqlite => match AnyStore::sqlite(cfg.db_path.as_deref()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "failed to open sqlite store, falling back to memory");
                AnyStore::memory()
            }
        },
        _ => AnyStore::memory(),
    }
}

/// Load the demo dataset unless the store already holds teams.
fn seed_if_empty<S: Store>(service: &MemberService<S>) -> Result<(), CoreError> {
    let mut session = Session::new(service.store());
    let teams = session.fetch_count(&domain::Query::select_from(QTeam::default()))?;
    if teams > 0 {
        info!(teams, "store not empty, skipping fixtures");
        return Ok(());
    }
    seed_basic(&mut session)?;
    info!("seeded demo fixtures");
    Ok(())
}

// ============================================================================
// Error mapping
// ============================================================================

fn error_status(e: &CoreError) -> (StatusCode, &'static str) {
    match e {
        CoreError::NotUniqueResult(_) => (StatusCode::CONFLICT, "not_unique"),
        CoreError::ConstraintViolation(_) => (StatusCode::CONFLICT, "constraint_violation"),
        CoreError::AlreadyExists => (StatusCode::CONFLICT, "conflict"),
        CoreError::Configuration(_) | CoreError::InvalidQuery(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        CoreError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        CoreError::Mapping(_) | CoreError::Repository(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

fn error_response(e: CoreError) -> Response {
    let (status, code) = error_status(&e);
    let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(err = %e, "request failed");
        http_common::json_err(code)
    } else {
        http_common::json_error_with_message(code, &e.to_string())
    };
    (status, Json(body)).into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(http_common::json_error_with_message("invalid_request", message)),
    )
        .into_response()
}

// ============================================================================
// Members
// ============================================================================

#[derive(Deserialize)]
struct ListQuery {
    username: Option<String>,
    team_name: Option<String>,
    age: Option<i32>,
    age_goe: Option<i32>,
    age_loe: Option<i32>,
    offset: Option<usize>,
    limit: Option<usize>,
    sort: Option<String>,
}

#[derive(Serialize)]
struct ListOut {
    members: Vec<MemberTeamDto>,
    total: u64,
    offset: usize,
    limit: Option<usize>,
    has_more: bool,
}

fn to_member_sort(param: &SortParam) -> Result<MemberSort, String> {
    let field = MemberSortField::from_name(&param.field)
        .ok_or_else(|| format!("cannot sort by '{}'", param.field))?;
    let sort = if param.descending {
        MemberSort::desc(field)
    } else {
        MemberSort::asc(field)
    };
    Ok(MemberSort {
        nulls: match param.nulls {
            NullsPlacement::Default => NullOrdering::Default,
            NullsPlacement::First => NullOrdering::First,
            NullsPlacement::Last => NullOrdering::Last,
        },
        ..sort
    })
}

async fn list_members(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    let limit = match http_common::validate_limit(
        q.limit,
        DEFAULT_PAGE_SIZE.min(state.max_page_size),
        state.max_page_size,
    ) {
        Ok(n) => n,
        Err(msg) => return bad_request(&msg),
    };
    let sort = match q
        .sort
        .as_deref()
        .map(http_common::parse_sort)
        .transpose()
        .and_then(|params| {
            params
                .unwrap_or_default()
                .iter()
                .map(to_member_sort)
                .collect::<Result<Vec<_>, _>>()
        }) {
        Ok(s) => s,
        Err(msg) => return bad_request(&msg),
    };
    let condition = MemberSearchCondition {
        username: q.username,
        team_name: q.team_name,
        age: q.age,
        age_goe: q.age_goe,
        age_loe: q.age_loe,
    };

    match state
        .service
        .search(&condition, q.offset.unwrap_or(0), Some(limit), &sort)
    {
        Ok(page) => {
            let has_more = page.has_more();
            (
                StatusCode::OK,
                Json(ListOut {
                    members: page.items,
                    total: page.total,
                    offset: page.offset,
                    limit: page.limit,
                    has_more,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct CreateMemberReq {
    username: Option<String>,
    age: i32,
    team_id: Option<i64>,
}

#[derive(Serialize)]
struct MemberOut {
    id: Option<i64>,
    username: Option<String>,
    age: i32,
    team_id: Option<i64>,
}

async fn create_member(
    State(state): State<AppState>,
    Json(req): Json<CreateMemberReq>,
) -> Response {
    match state
        .service
        .register_member(req.username, req.age, req.team_id)
    {
        Ok(m) => {
            info!(id = ?m.id, "member registered");
            (
                StatusCode::CREATED,
                Json(MemberOut {
                    id: m.id,
                    username: m.username,
                    age: m.age,
                    team_id: m.team_id,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct BulkRenameReq {
    younger_than: i32,
    username: String,
}

#[derive(Deserialize)]
struct BulkDeleteReq {
    older_than: i32,
}

#[derive(Serialize)]
struct BulkResultOut {
    affected: u64,
}

async fn bulk_rename(State(state): State<AppState>, Json(req): Json<BulkRenameReq>) -> Response {
    match state
        .service
        .rename_younger_than(req.younger_than, &req.username)
    {
        Ok(affected) => {
            info!(affected, "bulk rename");
            (StatusCode::OK, Json(BulkResultOut { affected })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn bulk_delete(State(state): State<AppState>, Json(req): Json<BulkDeleteReq>) -> Response {
    match state.service.delete_older_than(req.older_than) {
        Ok(affected) => {
            info!(affected, "bulk delete");
            (StatusCode::OK, Json(BulkResultOut { affected })).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Teams
// ============================================================================

#[derive(Deserialize)]
struct CreateTeamReq {
    name: String,
}

#[derive(Serialize)]
struct TeamOut {
    id: Option<i64>,
    name: String,
}

#[derive(Serialize)]
struct StatsOut {
    teams: Vec<TeamStats>,
}

async fn create_team(State(state): State<AppState>, Json(req): Json<CreateTeamReq>) -> Response {
    match state.service.register_team(&req.name) {
        Ok(t) => {
            info!(id = ?t.id, "team registered");
            (
                StatusCode::CREATED,
                Json(TeamOut {
                    id: t.id,
                    name: t.name,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn team_stats(State(state): State<AppState>) -> Response {
    match state.service.team_stats() {
        Ok(teams) => (StatusCode::OK, Json(StatsOut { teams })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
