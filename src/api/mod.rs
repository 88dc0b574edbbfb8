use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tokio::sync::{Mutex, RwLock};

use crate::config::AppConfig;
use crate::db;
use crate::error::CoreError;
use crate::models::*;
use crate::services::{
    provider, spawn_update_worker, spawn_weekly_scheduler, EloEngine, PredictionEngine,
    RankingService, TaskRegistry,
};
use crate::utils::{days_in_month, parse_month_key, round2};

/// Explicit runtime context: built once at startup, shared by handlers, the
/// worker and the weekly scheduler. The config snapshot is only replaced via
/// PUT /api/admin/config.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<RwLock<AppConfig>>,
    pub writer_lock: Arc<Mutex<()>>,
    pub registry: TaskRegistry,
}

impl AppState {
    async fn config_snapshot(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    async fn ranking_service(&self) -> RankingService {
        let config = self.config_snapshot().await;
        RankingService::new(
            self.pool.clone(),
            self.writer_lock.clone(),
            EloEngine::from_config(&config),
        )
    }

    async fn prediction_engine(&self) -> PredictionEngine {
        let config = self.config_snapshot().await;
        PredictionEngine::from_config(self.pool.clone(), &config)
    }
}

pub async fn serve(port: u16) -> anyhow::Result<()> {
    let pool = db::create_pool().await?;
    db::init_database_with_pool(&pool).await?;

    let config = match db::load_config(&pool).await? {
        Some(config) => config,
        None => {
            let config = AppConfig::default();
            db::save_config(&pool, &config).await?;
            config
        }
    };
    let config = Arc::new(RwLock::new(config));
    let writer_lock = Arc::new(Mutex::new(()));

    let (registry, queue_rx) = TaskRegistry::new(pool.clone());
    spawn_update_worker(pool.clone(), config.clone(), writer_lock.clone(), queue_rx);
    spawn_weekly_scheduler(registry.clone(), config.clone());

    let state = AppState {
        pool,
        config,
        writer_lock,
        registry,
    };

    let app = create_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("gridrank API listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/rankings", get(get_rankings))
        .route("/api/rankings/history", get(get_ranking_history))
        .route("/api/teams", get(get_teams))
        .route("/api/teams/{id}", get(get_team))
        .route("/api/teams/{id}/schedule", get(get_team_schedule))
        .route("/api/games", get(get_games).post(post_game))
        .route("/api/games/{id}", get(get_game))
        .route("/api/predictions", get(get_predictions))
        .route("/api/predictions/accuracy", get(get_accuracy))
        .route("/api/predictions/accuracy/team/{id}", get(get_team_accuracy))
        .route("/api/predictions/stored", get(get_stored_predictions))
        .route("/api/predictions/comparison", get(get_ap_comparison))
        .route("/api/seasons", get(get_seasons))
        .route("/api/seasons/active", get(get_active_season))
        .route("/api/seasons/{year}/reset", post(post_season_reset))
        .route("/api/stats", get(get_stats))
        .route("/api/admin/trigger-update", post(post_trigger_update))
        .route("/api/admin/update-status/{task_id}", get(get_update_status))
        .route("/api/admin/api-usage", get(get_api_usage))
        .route("/api/admin/usage-dashboard", get(get_usage_dashboard))
        .route("/api/admin/config", get(get_config).put(put_config))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

// ── Error mapping ────────────────────────────────────────────────────────────

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::TaskInProgress => StatusCode::CONFLICT,
            CoreError::QuotaExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ProviderAuth(_)
            | CoreError::ProviderTransient(_)
            | CoreError::ProviderFatal(_) => StatusCode::BAD_GATEWAY,
            CoreError::Integrity(_) | CoreError::Storage(_) | CoreError::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ApiResponse::<()>::error(format!("{}: {}", self.0.kind(), self.0));
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("gridrank API is running"))
}

/// Resolve an explicit season parameter, falling back to the active season.
async fn resolve_season(pool: &SqlitePool, season: Option<i64>) -> Result<i64, CoreError> {
    if let Some(season) = season {
        return Ok(season);
    }
    db::get_active_season(pool)
        .await?
        .map(|s| s.year)
        .ok_or_else(|| CoreError::Validation("no season given and no active season".to_string()))
}

// ── Rankings ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RankingsQuery {
    season: Option<i64>,
    limit: Option<usize>,
}

async fn get_rankings(
    State(state): State<AppState>,
    Query(params): Query<RankingsQuery>,
) -> ApiResult<Vec<RankedTeam>> {
    let season = resolve_season(&state.pool, params.season).await?;
    let service = state.ranking_service().await;
    let mut rankings = service.get_current_rankings(season, params.limit).await?;
    for entry in &mut rankings {
        entry.rating = round2(entry.rating);
        entry.sos = entry.sos.map(round2);
    }
    Ok(Json(ApiResponse::success(rankings)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    team_id: i64,
    season: Option<i64>,
}

async fn get_ranking_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<Vec<RankingSnapshot>> {
    let season = resolve_season(&state.pool, params.season).await?;
    let mut snapshots = db::snapshots_for_team(&state.pool, params.team_id, season).await?;
    for snap in &mut snapshots {
        snap.rating = round2(snap.rating);
        snap.sos = snap.sos.map(round2);
    }
    Ok(Json(ApiResponse::success(snapshots)))
}

// ── Teams ────────────────────────────────────────────────────────────────────

async fn get_teams(State(state): State<AppState>) -> ApiResult<Vec<Team>> {
    let teams = db::get_all_teams(&state.pool).await?;
    Ok(Json(ApiResponse::success(teams)))
}

async fn get_team(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Team> {
    let team = db::get_team(&state.pool, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("team {}", id)))?;
    Ok(Json(ApiResponse::success(team)))
}

/// Game plus resolved team names, for schedule and game listings.
#[derive(Debug, Serialize)]
struct GameView {
    #[serde(flatten)]
    game: Game,
    home_team: String,
    away_team: String,
}

async fn with_team_names(pool: &SqlitePool, games: Vec<Game>) -> Result<Vec<GameView>, CoreError> {
    let teams = db::get_all_teams(pool).await?;
    let names: HashMap<i64, String> = teams.into_iter().map(|t| (t.id, t.name)).collect();
    let lookup = |id: i64| names.get(&id).cloned().unwrap_or_else(|| format!("team {}", id));
    Ok(games
        .into_iter()
        .map(|game| GameView {
            home_team: lookup(game.home_id),
            away_team: lookup(game.away_id),
            game,
        })
        .collect())
}

#[derive(Deserialize)]
struct ScheduleQuery {
    season: Option<i64>,
}

async fn get_team_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ScheduleQuery>,
) -> ApiResult<Vec<GameView>> {
    let season = resolve_season(&state.pool, params.season).await?;
    db::get_team(&state.pool, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("team {}", id)))?;
    let games = db::games_for_team(&state.pool, id, season).await?;
    Ok(Json(ApiResponse::success(
        with_team_names(&state.pool, games).await?,
    )))
}

// ── Games ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GamesQuery {
    season: Option<i64>,
    week: Option<i64>,
    team_id: Option<i64>,
    processed: Option<bool>,
}

async fn get_games(
    State(state): State<AppState>,
    Query(params): Query<GamesQuery>,
) -> ApiResult<Vec<GameView>> {
    let games = db::list_games(
        &state.pool,
        params.season,
        params.week,
        params.team_id,
        params.processed,
    )
    .await?;
    Ok(Json(ApiResponse::success(
        with_team_names(&state.pool, games).await?,
    )))
}

async fn get_game(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<GameView> {
    let game = db::get_game(&state.pool, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("game {}", id)))?;
    let mut views = with_team_names(&state.pool, vec![game]).await?;
    Ok(Json(ApiResponse::success(views.remove(0))))
}

#[derive(Deserialize)]
struct NewGameRequest {
    season: i64,
    week: i64,
    home_id: i64,
    away_id: i64,
    home_score: i64,
    away_score: i64,
    #[serde(default)]
    is_neutral_site: bool,
    game_type: Option<GameType>,
}

#[derive(Serialize)]
struct ProcessedGameResponse {
    game_id: i64,
    excluded_from_rankings: bool,
    home_rating_change: f64,
    away_rating_change: f64,
    new_home_rating: f64,
    new_away_rating: f64,
}

/// Administrative entry of a completed game: upsert, then atomically process.
async fn post_game(
    State(state): State<AppState>,
    Json(request): Json<NewGameRequest>,
) -> ApiResult<ProcessedGameResponse> {
    if !(0..=19).contains(&request.week) {
        return Err(CoreError::Validation(format!("week {} out of range", request.week)).into());
    }
    if request.home_score < 0 || request.away_score < 0 {
        return Err(CoreError::Validation("scores must be non-negative".to_string()).into());
    }
    if request.home_score == 0 && request.away_score == 0 {
        return Err(CoreError::Validation("a completed game needs a score".to_string()).into());
    }
    if request.home_id == request.away_id {
        return Err(CoreError::Validation("a team cannot play itself".to_string()).into());
    }

    let home = db::get_team(&state.pool, request.home_id)
        .await?
        .ok_or_else(|| CoreError::Validation(format!("unknown team {}", request.home_id)))?;
    let away = db::get_team(&state.pool, request.away_id)
        .await?
        .ok_or_else(|| CoreError::Validation(format!("unknown team {}", request.away_id)))?;

    let config = state.config_snapshot().await;
    let game_type = request.game_type.unwrap_or(GameType::Regular);
    let excluded = home.is_fcs()
        || away.is_fcs()
        || (game_type.is_postseason() && !config.count_postseason);

    let existing = db::find_game_by_key(
        &state.pool,
        request.season,
        request.home_id,
        request.away_id,
        request.week,
    )
    .await?;
    let game_id = match existing {
        Some(game) if game.is_processed => {
            return Err(CoreError::Validation(format!("game {} already processed", game.id)).into())
        }
        Some(game) => {
            db::update_game_unprocessed(
                &state.pool,
                game.id,
                request.home_score,
                request.away_score,
                request.is_neutral_site,
                excluded,
                game_type,
                None,
                Some(Utc::now()),
            )
            .await?;
            game.id
        }
        None => {
            db::insert_game(
                &state.pool,
                request.season,
                request.week,
                request.home_id,
                request.away_id,
                request.home_score,
                request.away_score,
                request.is_neutral_site,
                excluded,
                game_type,
                None,
                Some(Utc::now()),
            )
            .await?
        }
    };

    let service = state.ranking_service().await;
    service.process_game(game_id).await?;

    let game = db::get_game(&state.pool, game_id)
        .await?
        .ok_or_else(|| CoreError::Integrity(format!("game {} vanished", game_id)))?;
    let home = db::get_team(&state.pool, request.home_id).await?.unwrap_or(home);
    let away = db::get_team(&state.pool, request.away_id).await?.unwrap_or(away);

    Ok(Json(ApiResponse::success(ProcessedGameResponse {
        game_id,
        excluded_from_rankings: game.excluded_from_rankings,
        home_rating_change: round2(game.home_rating_change),
        away_rating_change: round2(game.away_rating_change),
        new_home_rating: round2(home.current_rating),
        new_away_rating: round2(away.current_rating),
    })))
}

// ── Predictions ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PredictionsQuery {
    season: Option<i64>,
    week: Option<i64>,
    #[serde(default)]
    next_week: bool,
    team_id: Option<i64>,
}

#[derive(Serialize)]
struct PredictionView {
    #[serde(flatten)]
    prediction: Prediction,
    week: i64,
    home_team: String,
    away_team: String,
}

async fn get_predictions(
    State(state): State<AppState>,
    Query(params): Query<PredictionsQuery>,
) -> ApiResult<Vec<PredictionView>> {
    let season = resolve_season(&state.pool, params.season).await?;
    let week = if params.next_week {
        let active = db::get_active_season(&state.pool)
            .await?
            .ok_or_else(|| CoreError::Validation("no active season".to_string()))?;
        Some(active.current_week + 1)
    } else {
        params.week
    };

    let engine = state.prediction_engine().await;
    let predictions = engine.upcoming_predictions(season, week, params.team_id).await?;

    let teams = db::get_all_teams(&state.pool).await?;
    let names: HashMap<i64, String> = teams.into_iter().map(|t| (t.id, t.name)).collect();
    let mut views = Vec::with_capacity(predictions.len());
    for prediction in predictions {
        let game = db::get_game(&state.pool, prediction.game_id)
            .await?
            .ok_or_else(|| {
                CoreError::Integrity(format!("prediction references missing game {}", prediction.game_id))
            })?;
        views.push(PredictionView {
            week: game.week,
            home_team: names.get(&game.home_id).cloned().unwrap_or_default(),
            away_team: names.get(&game.away_id).cloned().unwrap_or_default(),
            prediction,
        });
    }
    Ok(Json(ApiResponse::success(views)))
}

#[derive(Deserialize)]
struct AccuracyQuery {
    season: Option<i64>,
}

async fn get_accuracy(
    State(state): State<AppState>,
    Query(params): Query<AccuracyQuery>,
) -> ApiResult<PredictionAccuracy> {
    let season = resolve_season(&state.pool, params.season).await?;
    let engine = state.prediction_engine().await;
    let accuracy = engine.get_accuracy(Some(season), None).await?;
    Ok(Json(ApiResponse::success(accuracy)))
}

async fn get_team_accuracy(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<AccuracyQuery>,
) -> ApiResult<PredictionAccuracy> {
    let season = resolve_season(&state.pool, params.season).await?;
    db::get_team(&state.pool, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("team {}", id)))?;
    let engine = state.prediction_engine().await;
    let accuracy = engine.get_accuracy(Some(season), Some(id)).await?;
    Ok(Json(ApiResponse::success(accuracy)))
}

async fn get_stored_predictions(
    State(state): State<AppState>,
    Query(params): Query<AccuracyQuery>,
) -> ApiResult<Vec<Prediction>> {
    let season = resolve_season(&state.pool, params.season).await?;
    let predictions = db::predictions_for_season(&state.pool, season).await?;
    Ok(Json(ApiResponse::success(predictions)))
}

async fn get_ap_comparison(
    State(state): State<AppState>,
    Query(params): Query<AccuracyQuery>,
) -> ApiResult<ApComparison> {
    let season = resolve_season(&state.pool, params.season).await?;
    let engine = state.prediction_engine().await;
    let comparison = engine.compare_to_ap(season).await?;
    Ok(Json(ApiResponse::success(comparison)))
}

// ── Seasons ──────────────────────────────────────────────────────────────────

async fn get_seasons(State(state): State<AppState>) -> ApiResult<Vec<Season>> {
    Ok(Json(ApiResponse::success(db::list_seasons(&state.pool).await?)))
}

async fn get_active_season(State(state): State<AppState>) -> ApiResult<Season> {
    let season = db::get_active_season(&state.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound("active season".to_string()))?;
    Ok(Json(ApiResponse::success(season)))
}

#[derive(Serialize)]
struct SeasonResetResponse {
    teams_reset: u32,
    games_replayed: u32,
}

/// Recompute preseason ratings from the stored inputs, then replay the season
/// so processed games stay consistent with the new starting point.
async fn post_season_reset(
    State(state): State<AppState>,
    Path(year): Path<i64>,
) -> ApiResult<SeasonResetResponse> {
    db::get_season(&state.pool, year)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("season {}", year)))?;

    let service = state.ranking_service().await;
    let teams_reset = service.reset_preseason(year).await?;
    let games_replayed = service.recompute_season(year).await?;
    Ok(Json(ApiResponse::success(SeasonResetResponse {
        teams_reset,
        games_replayed,
    })))
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    counts: db::SystemCounts,
    active_season: Option<i64>,
    current_week: Option<i64>,
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    let counts = db::system_counts(&state.pool).await?;
    let active = db::get_active_season(&state.pool).await?;
    Ok(Json(ApiResponse::success(StatsResponse {
        counts,
        active_season: active.as_ref().map(|s| s.year),
        current_week: active.as_ref().map(|s| s.current_week),
    })))
}

// ── Admin ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TriggerResponse {
    task_id: String,
    started_at: chrono::DateTime<Utc>,
}

async fn post_trigger_update(State(state): State<AppState>) -> ApiResult<TriggerResponse> {
    let task_id = state.registry.trigger_manual().await?;
    let task = state
        .registry
        .task_status(&task_id)
        .await?
        .ok_or_else(|| CoreError::Integrity(format!("task {} vanished", task_id)))?;
    Ok(Json(ApiResponse::success(TriggerResponse {
        task_id,
        started_at: task.created_at,
    })))
}

async fn get_update_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<UpdateTask> {
    let task = state
        .registry
        .task_status(&task_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("task {}", task_id)))?;
    Ok(Json(ApiResponse::success(task)))
}

#[derive(Deserialize)]
struct UsageQuery {
    month: Option<String>,
}

async fn get_api_usage(
    State(state): State<AppState>,
    Query(params): Query<UsageQuery>,
) -> ApiResult<provider::UsageSummary> {
    let config = state.config_snapshot().await;
    let summary = provider::usage_summary(
        &state.pool,
        config.monthly_api_limit,
        &config.warning_thresholds,
        params.month,
    )
    .await?;
    Ok(Json(ApiResponse::success(summary)))
}

#[derive(Serialize)]
struct UsageDashboard {
    #[serde(flatten)]
    usage: provider::UsageSummary,
    projected_month_end: f64,
}

async fn get_usage_dashboard(State(state): State<AppState>) -> ApiResult<UsageDashboard> {
    let config = state.config_snapshot().await;
    let usage = provider::usage_summary(
        &state.pool,
        config.monthly_api_limit,
        &config.warning_thresholds,
        None,
    )
    .await?;
    let projected_month_end = parse_month_key(&usage.month)
        .and_then(|(y, m)| days_in_month(y, m))
        .map(|days| usage.average_per_day * days as f64)
        .unwrap_or(usage.total_calls as f64);
    Ok(Json(ApiResponse::success(UsageDashboard {
        usage,
        projected_month_end,
    })))
}

async fn get_config(State(state): State<AppState>) -> ApiResult<AppConfig> {
    Ok(Json(ApiResponse::success(state.config_snapshot().await)))
}

/// Replace the runtime config. Persisted first, swapped under the writer lock
/// so in-flight tasks keep their snapshot and new work sees the new values.
async fn put_config(
    State(state): State<AppState>,
    Json(new_config): Json<AppConfig>,
) -> ApiResult<AppConfig> {
    new_config.validate().map_err(CoreError::Validation)?;

    let _guard = state.writer_lock.lock().await;
    db::save_config(&state.pool, &new_config).await?;
    *state.config.write().await = new_config.clone();
    tracing::info!("Runtime config replaced via admin API");
    Ok(Json(ApiResponse::success(new_config)))
}
