pub mod seed;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use std::env;
use std::str::FromStr;

use crate::config::AppConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::*;

pub async fn create_pool() -> CoreResult<SqlitePool> {
    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/gridrank.db".to_string());

    // Strip the "sqlite:" prefix to get the file path, create parent dir if needed
    let file_path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(&database_url);

    if let Some(parent) = std::path::Path::new(file_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
    }

    let options = SqliteConnectOptions::from_str(&database_url)
        .map_err(|e| CoreError::Validation(format!("bad DATABASE_URL: {}", e)))?
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory pool for tests.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    init_database_with_pool(&pool).await.expect("schema");
    pool
}

/// Called from the CLI where no pool exists yet.
pub async fn init_database() -> CoreResult<()> {
    let pool = create_pool().await?;
    init_database_with_pool(&pool).await
}

pub async fn init_database_with_pool(pool: &SqlitePool) -> CoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            tier TEXT NOT NULL,
            conference TEXT NOT NULL DEFAULT '',
            recruiting_rank INTEGER NOT NULL DEFAULT 999,
            transfer_rank INTEGER NOT NULL DEFAULT 999,
            returning_production REAL NOT NULL DEFAULT 0.0,
            current_rating REAL NOT NULL DEFAULT 1500.0,
            initial_rating REAL NOT NULL DEFAULT 1500.0,
            wins INTEGER NOT NULL DEFAULT 0,
            losses INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            home_id INTEGER NOT NULL,
            away_id INTEGER NOT NULL,
            home_score INTEGER NOT NULL DEFAULT 0,
            away_score INTEGER NOT NULL DEFAULT 0,
            is_neutral_site INTEGER NOT NULL DEFAULT 0,
            is_processed INTEGER NOT NULL DEFAULT 0,
            excluded_from_rankings INTEGER NOT NULL DEFAULT 0,
            game_type TEXT NOT NULL DEFAULT 'regular',
            postseason_name TEXT,
            game_date TEXT,
            home_rating_change REAL NOT NULL DEFAULT 0.0,
            away_rating_change REAL NOT NULL DEFAULT 0.0,
            UNIQUE(season, home_id, away_id, week),
            FOREIGN KEY (home_id) REFERENCES teams (id),
            FOREIGN KEY (away_id) REFERENCES teams (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS seasons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            year INTEGER NOT NULL UNIQUE,
            current_week INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ranking_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id INTEGER NOT NULL,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            rank INTEGER NOT NULL,
            rating REAL NOT NULL,
            wins INTEGER NOT NULL,
            losses INTEGER NOT NULL,
            sos REAL,
            sos_rank INTEGER,
            created_at TEXT NOT NULL,
            UNIQUE(team_id, season, week),
            FOREIGN KEY (team_id) REFERENCES teams (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            game_id INTEGER NOT NULL UNIQUE,
            predicted_winner_id INTEGER NOT NULL,
            predicted_home_score INTEGER NOT NULL,
            predicted_away_score INTEGER NOT NULL,
            home_win_probability REAL NOT NULL,
            away_win_probability REAL NOT NULL,
            pre_game_home_rating REAL NOT NULL,
            pre_game_away_rating REAL NOT NULL,
            confidence TEXT NOT NULL,
            was_correct INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ap_poll_rankings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            rank INTEGER NOT NULL,
            team_id INTEGER NOT NULL,
            first_place_votes INTEGER NOT NULL DEFAULT 0,
            points INTEGER NOT NULL DEFAULT 0,
            UNIQUE(season, week, team_id),
            FOREIGN KEY (team_id) REFERENCES teams (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            month_key TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            called_at TEXT NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS update_tasks (
            task_id TEXT PRIMARY KEY,
            trigger_kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            result TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes: replay scans and per-week reads
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_season_week ON games(season, week)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_season_processed ON games(season, is_processed)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_usage_month ON api_usage(month_key, endpoint)")
        .execute(pool)
        .await?;

    tracing::info!("Database initialized");
    Ok(())
}

// ── Row mapping ──────────────────────────────────────────────────────────────

fn parse_ts(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CoreError::Integrity(format!("bad stored timestamp {:?}: {}", raw, e)))
}

fn team_from_row(row: &SqliteRow) -> CoreResult<Team> {
    let tier_raw: String = row.get("tier");
    Ok(Team {
        id: row.get("id"),
        name: row.get("name"),
        tier: ConferenceTier::parse(&tier_raw)
            .ok_or_else(|| CoreError::Integrity(format!("unknown tier {:?}", tier_raw)))?,
        conference: row.get("conference"),
        recruiting_rank: row.get("recruiting_rank"),
        transfer_rank: row.get("transfer_rank"),
        returning_production: row.get("returning_production"),
        current_rating: row.get("current_rating"),
        initial_rating: row.get("initial_rating"),
        wins: row.get("wins"),
        losses: row.get("losses"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn game_from_row(row: &SqliteRow) -> CoreResult<Game> {
    let type_raw: String = row.get("game_type");
    let date_raw: Option<String> = row.get("game_date");
    Ok(Game {
        id: row.get("id"),
        season: row.get("season"),
        week: row.get("week"),
        home_id: row.get("home_id"),
        away_id: row.get("away_id"),
        home_score: row.get("home_score"),
        away_score: row.get("away_score"),
        is_neutral_site: row.get("is_neutral_site"),
        is_processed: row.get("is_processed"),
        excluded_from_rankings: row.get("excluded_from_rankings"),
        game_type: GameType::parse(&type_raw)
            .ok_or_else(|| CoreError::Integrity(format!("unknown game_type {:?}", type_raw)))?,
        postseason_name: row.get("postseason_name"),
        game_date: date_raw.as_deref().map(parse_ts).transpose()?,
        home_rating_change: row.get("home_rating_change"),
        away_rating_change: row.get("away_rating_change"),
    })
}

fn season_from_row(row: &SqliteRow) -> Season {
    Season {
        id: row.get("id"),
        year: row.get("year"),
        current_week: row.get("current_week"),
        is_active: row.get("is_active"),
    }
}

fn snapshot_from_row(row: &SqliteRow) -> CoreResult<RankingSnapshot> {
    Ok(RankingSnapshot {
        id: row.get("id"),
        team_id: row.get("team_id"),
        season: row.get("season"),
        week: row.get("week"),
        rank: row.get("rank"),
        rating: row.get("rating"),
        wins: row.get("wins"),
        losses: row.get("losses"),
        sos: row.get("sos"),
        sos_rank: row.get("sos_rank"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn prediction_from_row(row: &SqliteRow) -> CoreResult<Prediction> {
    let confidence_raw: String = row.get("confidence");
    Ok(Prediction {
        id: row.get("id"),
        game_id: row.get("game_id"),
        predicted_winner_id: row.get("predicted_winner_id"),
        predicted_home_score: row.get("predicted_home_score"),
        predicted_away_score: row.get("predicted_away_score"),
        home_win_probability: row.get("home_win_probability"),
        away_win_probability: row.get("away_win_probability"),
        pre_game_home_rating: row.get("pre_game_home_rating"),
        pre_game_away_rating: row.get("pre_game_away_rating"),
        confidence: Confidence::parse(&confidence_raw)
            .ok_or_else(|| CoreError::Integrity(format!("unknown confidence {:?}", confidence_raw)))?,
        was_correct: row.get("was_correct"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn poll_from_row(row: &SqliteRow) -> ApPollRanking {
    ApPollRanking {
        id: row.get("id"),
        season: row.get("season"),
        week: row.get("week"),
        rank: row.get("rank"),
        team_id: row.get("team_id"),
        first_place_votes: row.get("first_place_votes"),
        points: row.get("points"),
    }
}

fn task_from_row(row: &SqliteRow) -> CoreResult<UpdateTask> {
    let trigger_raw: String = row.get("trigger_kind");
    let status_raw: String = row.get("status");
    let result_raw: Option<String> = row.get("result");
    Ok(UpdateTask {
        task_id: row.get("task_id"),
        trigger: TaskTrigger::parse(&trigger_raw)
            .ok_or_else(|| CoreError::Integrity(format!("unknown trigger {:?}", trigger_raw)))?,
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| CoreError::Integrity(format!("unknown task status {:?}", status_raw)))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        started_at: row
            .get::<Option<String>, _>("started_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
        result: result_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| CoreError::Integrity(format!("bad task result blob: {}", e)))?,
        error: row.get("error"),
    })
}

// ── Team operations ──────────────────────────────────────────────────────────

/// Insert a brand-new team. Rating fields are set here at creation time only;
/// later refreshes go through `update_team_profile`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_team(
    e: impl SqliteExecutor<'_>,
    name: &str,
    tier: ConferenceTier,
    conference: &str,
    recruiting_rank: i64,
    transfer_rank: i64,
    returning_production: f64,
    rating: f64,
) -> CoreResult<i64> {
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        INSERT INTO teams
        (name, tier, conference, recruiting_rank, transfer_rank, returning_production,
         current_rating, initial_rating, wins, losses, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
        "#,
    )
    .bind(name)
    .bind(tier.as_str())
    .bind(conference)
    .bind(recruiting_rank)
    .bind(transfer_rank)
    .bind(returning_production)
    .bind(rating)
    .bind(rating)
    .bind(&now)
    .bind(&now)
    .execute(e)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Ingestion-side update: schedule/profile fields only, never ratings or records.
pub async fn update_team_profile(
    e: impl SqliteExecutor<'_>,
    id: i64,
    tier: ConferenceTier,
    conference: &str,
    recruiting_rank: i64,
    transfer_rank: i64,
    returning_production: f64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE teams
        SET tier = ?, conference = ?, recruiting_rank = ?, transfer_rank = ?,
            returning_production = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(tier.as_str())
    .bind(conference)
    .bind(recruiting_rank)
    .bind(transfer_rank)
    .bind(returning_production)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(e)
    .await?;
    Ok(())
}

pub async fn get_team(e: impl SqliteExecutor<'_>, id: i64) -> CoreResult<Option<Team>> {
    let row = sqlx::query("SELECT * FROM teams WHERE id = ?")
        .bind(id)
        .fetch_optional(e)
        .await?;
    row.as_ref().map(team_from_row).transpose()
}

pub async fn get_team_by_name(e: impl SqliteExecutor<'_>, name: &str) -> CoreResult<Option<Team>> {
    let row = sqlx::query("SELECT * FROM teams WHERE name = ? COLLATE NOCASE")
        .bind(name)
        .fetch_optional(e)
        .await?;
    row.as_ref().map(team_from_row).transpose()
}

/// All teams ordered by current rating, ties stable by id.
pub async fn get_all_teams(e: impl SqliteExecutor<'_>) -> CoreResult<Vec<Team>> {
    let rows = sqlx::query("SELECT * FROM teams ORDER BY current_rating DESC, id ASC")
        .fetch_all(e)
        .await?;
    rows.iter().map(team_from_row).collect()
}

/// Ranking-service write: rating and record after a processed game.
pub async fn set_team_rating_and_record(
    e: impl SqliteExecutor<'_>,
    id: i64,
    current_rating: f64,
    wins: i64,
    losses: i64,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE teams SET current_rating = ?, wins = ?, losses = ?, updated_at = ? WHERE id = ?",
    )
    .bind(current_rating)
    .bind(wins)
    .bind(losses)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(e)
    .await?;
    Ok(())
}

/// Preseason reset: both rating fields move together.
pub async fn set_team_season_ratings(
    e: impl SqliteExecutor<'_>,
    id: i64,
    rating: f64,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE teams SET current_rating = ?, initial_rating = ?, wins = 0, losses = 0, updated_at = ? WHERE id = ?",
    )
    .bind(rating)
    .bind(rating)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(e)
    .await?;
    Ok(())
}

/// Rewind every team to its season starting point before a replay.
pub async fn reset_teams_to_initial(e: impl SqliteExecutor<'_>) -> CoreResult<()> {
    sqlx::query(
        "UPDATE teams SET current_rating = initial_rating, wins = 0, losses = 0, updated_at = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .execute(e)
    .await?;
    Ok(())
}

// ── Game operations ──────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn insert_game(
    e: impl SqliteExecutor<'_>,
    season: i64,
    week: i64,
    home_id: i64,
    away_id: i64,
    home_score: i64,
    away_score: i64,
    is_neutral_site: bool,
    excluded_from_rankings: bool,
    game_type: GameType,
    postseason_name: Option<&str>,
    game_date: Option<DateTime<Utc>>,
) -> CoreResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO games
        (season, week, home_id, away_id, home_score, away_score, is_neutral_site,
         is_processed, excluded_from_rankings, game_type, postseason_name, game_date,
         home_rating_change, away_rating_change)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 0.0, 0.0)
        "#,
    )
    .bind(season)
    .bind(week)
    .bind(home_id)
    .bind(away_id)
    .bind(home_score)
    .bind(away_score)
    .bind(is_neutral_site)
    .bind(excluded_from_rankings)
    .bind(game_type.as_str())
    .bind(postseason_name)
    .bind(game_date.map(|d| d.to_rfc3339()))
    .execute(e)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get_game(e: impl SqliteExecutor<'_>, id: i64) -> CoreResult<Option<Game>> {
    let row = sqlx::query("SELECT * FROM games WHERE id = ?")
        .bind(id)
        .fetch_optional(e)
        .await?;
    row.as_ref().map(game_from_row).transpose()
}

pub async fn find_game_by_key(
    e: impl SqliteExecutor<'_>,
    season: i64,
    home_id: i64,
    away_id: i64,
    week: i64,
) -> CoreResult<Option<Game>> {
    let row = sqlx::query(
        "SELECT * FROM games WHERE season = ? AND home_id = ? AND away_id = ? AND week = ?",
    )
    .bind(season)
    .bind(home_id)
    .bind(away_id)
    .bind(week)
    .fetch_optional(e)
    .await?;
    row.as_ref().map(game_from_row).transpose()
}

/// Ingestion update for a not-yet-processed row: scores and schedule metadata.
#[allow(clippy::too_many_arguments)]
pub async fn update_game_unprocessed(
    e: impl SqliteExecutor<'_>,
    id: i64,
    home_score: i64,
    away_score: i64,
    is_neutral_site: bool,
    excluded_from_rankings: bool,
    game_type: GameType,
    postseason_name: Option<&str>,
    game_date: Option<DateTime<Utc>>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE games
        SET home_score = ?, away_score = ?, is_neutral_site = ?, excluded_from_rankings = ?,
            game_type = ?, postseason_name = ?, game_date = ?
        WHERE id = ? AND is_processed = 0
        "#,
    )
    .bind(home_score)
    .bind(away_score)
    .bind(is_neutral_site)
    .bind(excluded_from_rankings)
    .bind(game_type.as_str())
    .bind(postseason_name)
    .bind(game_date.map(|d| d.to_rfc3339()))
    .bind(id)
    .execute(e)
    .await?;
    Ok(())
}

/// Ingestion update for an already-processed row: schedule metadata only.
pub async fn update_game_schedule_meta(
    e: impl SqliteExecutor<'_>,
    id: i64,
    game_date: Option<DateTime<Utc>>,
) -> CoreResult<()> {
    sqlx::query("UPDATE games SET game_date = ? WHERE id = ?")
        .bind(game_date.map(|d| d.to_rfc3339()))
        .bind(id)
        .execute(e)
        .await?;
    Ok(())
}

/// Ranking-service write inside the process_game transaction.
pub async fn mark_game_processed(
    e: impl SqliteExecutor<'_>,
    id: i64,
    home_rating_change: f64,
    away_rating_change: f64,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE games SET is_processed = 1, home_rating_change = ?, away_rating_change = ? WHERE id = ?",
    )
    .bind(home_rating_change)
    .bind(away_rating_change)
    .bind(id)
    .execute(e)
    .await?;
    Ok(())
}

/// Chronological replay order within a season: (week, game_date, id).
pub async fn games_for_season(e: impl SqliteExecutor<'_>, season: i64) -> CoreResult<Vec<Game>> {
    let rows =
        sqlx::query("SELECT * FROM games WHERE season = ? ORDER BY week ASC, game_date ASC, id ASC")
            .bind(season)
            .fetch_all(e)
            .await?;
    rows.iter().map(game_from_row).collect()
}

/// Unprocessed games that already have a final score, in replay order.
pub async fn unprocessed_games_with_result(
    e: impl SqliteExecutor<'_>,
    season: i64,
) -> CoreResult<Vec<Game>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM games
        WHERE season = ? AND is_processed = 0 AND NOT (home_score = 0 AND away_score = 0)
        ORDER BY week ASC, game_date ASC, id ASC
        "#,
    )
    .bind(season)
    .fetch_all(e)
    .await?;
    rows.iter().map(game_from_row).collect()
}

/// Future games: unprocessed and still without a score.
pub async fn scheduled_games(e: impl SqliteExecutor<'_>, season: i64) -> CoreResult<Vec<Game>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM games
        WHERE season = ? AND is_processed = 0 AND home_score = 0 AND away_score = 0
        ORDER BY week ASC, game_date ASC, id ASC
        "#,
    )
    .bind(season)
    .fetch_all(e)
    .await?;
    rows.iter().map(game_from_row).collect()
}

pub async fn processed_rated_games(
    e: impl SqliteExecutor<'_>,
    season: i64,
) -> CoreResult<Vec<Game>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM games
        WHERE season = ? AND is_processed = 1 AND excluded_from_rankings = 0
        ORDER BY week ASC, game_date ASC, id ASC
        "#,
    )
    .bind(season)
    .fetch_all(e)
    .await?;
    rows.iter().map(game_from_row).collect()
}

/// Clear processed flags and deltas ahead of a season replay.
pub async fn clear_processing_state(e: impl SqliteExecutor<'_>, season: i64) -> CoreResult<()> {
    sqlx::query(
        "UPDATE games SET is_processed = 0, home_rating_change = 0.0, away_rating_change = 0.0 WHERE season = ?",
    )
    .bind(season)
    .execute(e)
    .await?;
    Ok(())
}

pub async fn list_games(
    pool: &SqlitePool,
    season: Option<i64>,
    week: Option<i64>,
    team_id: Option<i64>,
    processed: Option<bool>,
) -> CoreResult<Vec<Game>> {
    let mut sql = String::from("SELECT * FROM games WHERE 1=1");
    if season.is_some() {
        sql.push_str(" AND season = ?");
    }
    if week.is_some() {
        sql.push_str(" AND week = ?");
    }
    if team_id.is_some() {
        sql.push_str(" AND (home_id = ? OR away_id = ?)");
    }
    if processed.is_some() {
        sql.push_str(" AND is_processed = ?");
    }
    sql.push_str(" ORDER BY week ASC, game_date ASC, id ASC");

    let mut query = sqlx::query(&sql);
    if let Some(s) = season {
        query = query.bind(s);
    }
    if let Some(w) = week {
        query = query.bind(w);
    }
    if let Some(t) = team_id {
        query = query.bind(t).bind(t);
    }
    if let Some(p) = processed {
        query = query.bind(p);
    }

    let rows = query.fetch_all(pool).await?;
    rows.iter().map(game_from_row).collect()
}

pub async fn games_for_team(
    e: impl SqliteExecutor<'_>,
    team_id: i64,
    season: i64,
) -> CoreResult<Vec<Game>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM games
        WHERE season = ? AND (home_id = ? OR away_id = ?)
        ORDER BY week ASC, game_date ASC, id ASC
        "#,
    )
    .bind(season)
    .bind(team_id)
    .bind(team_id)
    .fetch_all(e)
    .await?;
    rows.iter().map(game_from_row).collect()
}

// ── Season operations ────────────────────────────────────────────────────────

pub async fn get_season(e: impl SqliteExecutor<'_>, year: i64) -> CoreResult<Option<Season>> {
    let row = sqlx::query("SELECT * FROM seasons WHERE year = ?")
        .bind(year)
        .fetch_optional(e)
        .await?;
    Ok(row.as_ref().map(season_from_row))
}

pub async fn get_active_season(e: impl SqliteExecutor<'_>) -> CoreResult<Option<Season>> {
    let row = sqlx::query("SELECT * FROM seasons WHERE is_active = 1 LIMIT 1")
        .fetch_optional(e)
        .await?;
    Ok(row.as_ref().map(season_from_row))
}

pub async fn list_seasons(e: impl SqliteExecutor<'_>) -> CoreResult<Vec<Season>> {
    let rows = sqlx::query("SELECT * FROM seasons ORDER BY year DESC")
        .fetch_all(e)
        .await?;
    Ok(rows.iter().map(season_from_row).collect())
}

pub async fn upsert_season(
    e: impl SqliteExecutor<'_>,
    year: i64,
    current_week: i64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO seasons (year, current_week, is_active) VALUES (?, ?, 0)
        ON CONFLICT(year) DO UPDATE SET current_week = excluded.current_week
        "#,
    )
    .bind(year)
    .bind(current_week)
    .execute(e)
    .await?;
    Ok(())
}

/// Activate one season, deactivating every other row so the at-most-one
/// invariant holds.
pub async fn set_active_season(pool: &SqlitePool, year: i64) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE seasons SET is_active = 0 WHERE year != ?")
        .bind(year)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE seasons SET is_active = 1 WHERE year = ?")
        .bind(year)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

// ── Snapshot operations ──────────────────────────────────────────────────────

/// Snapshots are immutable once written: a re-run for the same
/// (team, season, week) is a no-op.
#[allow(clippy::too_many_arguments)]
pub async fn insert_snapshot(
    e: impl SqliteExecutor<'_>,
    team_id: i64,
    season: i64,
    week: i64,
    rank: i64,
    rating: f64,
    wins: i64,
    losses: i64,
    sos: Option<f64>,
    sos_rank: Option<i64>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO ranking_snapshots
        (team_id, season, week, rank, rating, wins, losses, sos, sos_rank, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(team_id)
    .bind(season)
    .bind(week)
    .bind(rank)
    .bind(rating)
    .bind(wins)
    .bind(losses)
    .bind(sos)
    .bind(sos_rank)
    .bind(Utc::now().to_rfc3339())
    .execute(e)
    .await?;
    Ok(())
}

pub async fn snapshots_for_team(
    e: impl SqliteExecutor<'_>,
    team_id: i64,
    season: i64,
) -> CoreResult<Vec<RankingSnapshot>> {
    let rows = sqlx::query(
        "SELECT * FROM ranking_snapshots WHERE team_id = ? AND season = ? ORDER BY week ASC",
    )
    .bind(team_id)
    .bind(season)
    .fetch_all(e)
    .await?;
    rows.iter().map(snapshot_from_row).collect()
}

// ── Prediction operations ────────────────────────────────────────────────────

pub async fn insert_prediction(
    e: impl SqliteExecutor<'_>,
    p: &Prediction,
) -> CoreResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO predictions
        (game_id, predicted_winner_id, predicted_home_score, predicted_away_score,
         home_win_probability, away_win_probability, pre_game_home_rating,
         pre_game_away_rating, confidence, was_correct, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(p.game_id)
    .bind(p.predicted_winner_id)
    .bind(p.predicted_home_score)
    .bind(p.predicted_away_score)
    .bind(p.home_win_probability)
    .bind(p.away_win_probability)
    .bind(p.pre_game_home_rating)
    .bind(p.pre_game_away_rating)
    .bind(p.confidence.as_str())
    .bind(p.was_correct)
    .bind(p.created_at.to_rfc3339())
    .execute(e)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get_prediction_by_game(
    e: impl SqliteExecutor<'_>,
    game_id: i64,
) -> CoreResult<Option<Prediction>> {
    let row = sqlx::query("SELECT * FROM predictions WHERE game_id = ?")
        .bind(game_id)
        .fetch_optional(e)
        .await?;
    row.as_ref().map(prediction_from_row).transpose()
}

pub async fn set_prediction_outcome(
    e: impl SqliteExecutor<'_>,
    game_id: i64,
    was_correct: bool,
) -> CoreResult<()> {
    sqlx::query("UPDATE predictions SET was_correct = ? WHERE game_id = ?")
        .bind(was_correct)
        .bind(game_id)
        .execute(e)
        .await?;
    Ok(())
}

/// All predictions whose game belongs to `season`, replay-ordered.
pub async fn predictions_for_season(
    e: impl SqliteExecutor<'_>,
    season: i64,
) -> CoreResult<Vec<Prediction>> {
    let rows = sqlx::query(
        r#"
        SELECT p.* FROM predictions p
        JOIN games g ON g.id = p.game_id
        WHERE g.season = ?
        ORDER BY g.week ASC, g.game_date ASC, g.id ASC
        "#,
    )
    .bind(season)
    .fetch_all(e)
    .await?;
    rows.iter().map(prediction_from_row).collect()
}

/// (total, resolved, correct) over predictions, optionally scoped to games
/// involving one team.
pub async fn prediction_accuracy_counts(
    e: impl SqliteExecutor<'_>,
    season: Option<i64>,
    team_id: Option<i64>,
) -> CoreResult<(i64, i64, i64)> {
    let mut sql = String::from(
        r#"
        SELECT COUNT(*) AS total,
               SUM(CASE WHEN p.was_correct IS NOT NULL THEN 1 ELSE 0 END) AS resolved,
               SUM(CASE WHEN p.was_correct = 1 THEN 1 ELSE 0 END) AS correct
        FROM predictions p
        JOIN games g ON g.id = p.game_id
        WHERE 1=1
        "#,
    );
    if season.is_some() {
        sql.push_str(" AND g.season = ?");
    }
    if team_id.is_some() {
        sql.push_str(" AND (g.home_id = ? OR g.away_id = ?)");
    }

    let mut query = sqlx::query(&sql);
    if let Some(s) = season {
        query = query.bind(s);
    }
    if let Some(t) = team_id {
        query = query.bind(t).bind(t);
    }

    let row = query.fetch_one(e).await?;
    let total: i64 = row.get("total");
    let resolved: Option<i64> = row.get("resolved");
    let correct: Option<i64> = row.get("correct");
    Ok((total, resolved.unwrap_or(0), correct.unwrap_or(0)))
}

// ── AP poll operations ───────────────────────────────────────────────────────

pub async fn upsert_poll_ranking(
    e: impl SqliteExecutor<'_>,
    season: i64,
    week: i64,
    rank: i64,
    team_id: i64,
    first_place_votes: i64,
    points: i64,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ap_poll_rankings (season, week, rank, team_id, first_place_votes, points)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(season, week, team_id) DO UPDATE SET
            rank = excluded.rank,
            first_place_votes = excluded.first_place_votes,
            points = excluded.points
        "#,
    )
    .bind(season)
    .bind(week)
    .bind(rank)
    .bind(team_id)
    .bind(first_place_votes)
    .bind(points)
    .execute(e)
    .await?;
    Ok(())
}

pub async fn poll_for_week(
    e: impl SqliteExecutor<'_>,
    season: i64,
    week: i64,
) -> CoreResult<Vec<ApPollRanking>> {
    let rows =
        sqlx::query("SELECT * FROM ap_poll_rankings WHERE season = ? AND week = ? ORDER BY rank ASC")
            .bind(season)
            .bind(week)
            .fetch_all(e)
            .await?;
    Ok(rows.iter().map(poll_from_row).collect())
}

// ── API usage operations ─────────────────────────────────────────────────────

pub async fn record_api_call(
    e: impl SqliteExecutor<'_>,
    month_key: &str,
    endpoint: &str,
    duration_ms: i64,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO api_usage (month_key, endpoint, called_at, duration_ms) VALUES (?, ?, ?, ?)",
    )
    .bind(month_key)
    .bind(endpoint)
    .bind(Utc::now().to_rfc3339())
    .bind(duration_ms)
    .execute(e)
    .await?;
    Ok(())
}

pub async fn monthly_call_count(e: impl SqliteExecutor<'_>, month_key: &str) -> CoreResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_usage WHERE month_key = ?")
        .bind(month_key)
        .fetch_one(e)
        .await?;
    Ok(count)
}

pub async fn top_endpoints(
    e: impl SqliteExecutor<'_>,
    month_key: &str,
    limit: i64,
) -> CoreResult<Vec<(String, i64)>> {
    let rows = sqlx::query(
        r#"
        SELECT endpoint, COUNT(*) AS calls FROM api_usage
        WHERE month_key = ? GROUP BY endpoint ORDER BY calls DESC LIMIT ?
        "#,
    )
    .bind(month_key)
    .bind(limit)
    .fetch_all(e)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("endpoint"), row.get("calls")))
        .collect())
}

// ── Update task operations ───────────────────────────────────────────────────

pub async fn insert_task(
    e: impl SqliteExecutor<'_>,
    task_id: &str,
    trigger: TaskTrigger,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO update_tasks (task_id, trigger_kind, status, created_at) VALUES (?, ?, 'pending', ?)",
    )
    .bind(task_id)
    .bind(trigger.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(e)
    .await?;
    Ok(())
}

pub async fn get_task(e: impl SqliteExecutor<'_>, task_id: &str) -> CoreResult<Option<UpdateTask>> {
    let row = sqlx::query("SELECT * FROM update_tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(e)
        .await?;
    row.as_ref().map(task_from_row).transpose()
}

/// True when a task is pending or running; gates new triggers.
pub async fn any_task_active(e: impl SqliteExecutor<'_>) -> CoreResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM update_tasks WHERE status IN ('pending', 'running')",
    )
    .fetch_one(e)
    .await?;
    Ok(count > 0)
}

pub async fn task_mark_running(e: impl SqliteExecutor<'_>, task_id: &str) -> CoreResult<()> {
    sqlx::query(
        "UPDATE update_tasks SET status = 'running', started_at = ? WHERE task_id = ? AND status = 'pending'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(task_id)
    .execute(e)
    .await?;
    Ok(())
}

pub async fn task_mark_completed(
    e: impl SqliteExecutor<'_>,
    task_id: &str,
    summary: &UpdateSummary,
) -> CoreResult<()> {
    let blob = serde_json::to_string(summary)
        .map_err(|e| CoreError::Integrity(format!("unserializable task summary: {}", e)))?;
    sqlx::query(
        "UPDATE update_tasks SET status = 'completed', completed_at = ?, result = ? WHERE task_id = ? AND status = 'running'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(blob)
    .bind(task_id)
    .execute(e)
    .await?;
    Ok(())
}

pub async fn task_mark_failed(
    e: impl SqliteExecutor<'_>,
    task_id: &str,
    error: &str,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE update_tasks SET status = 'failed', completed_at = ?, error = ? WHERE task_id = ? AND status IN ('pending', 'running')",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(error)
    .bind(task_id)
    .execute(e)
    .await?;
    Ok(())
}

// ── Config blob ──────────────────────────────────────────────────────────────

const CONFIG_KEY: &str = "app";

pub async fn load_config(pool: &SqlitePool) -> CoreResult<Option<AppConfig>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT value FROM app_config WHERE key = ?")
        .bind(CONFIG_KEY)
        .fetch_optional(pool)
        .await?;
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| CoreError::Integrity(format!("bad stored config blob: {}", e)))
}

pub async fn save_config(pool: &SqlitePool, config: &AppConfig) -> CoreResult<()> {
    let blob = serde_json::to_string(config)
        .map_err(|e| CoreError::Integrity(format!("unserializable config: {}", e)))?;
    sqlx::query(
        r#"
        INSERT INTO app_config (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(CONFIG_KEY)
    .bind(blob)
    .execute(pool)
    .await?;
    Ok(())
}

// ── System stats ─────────────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
pub struct SystemCounts {
    pub teams: i64,
    pub games: i64,
    pub processed_games: i64,
    pub predictions: i64,
}

pub async fn system_counts(pool: &SqlitePool) -> CoreResult<SystemCounts> {
    let teams: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM teams")
        .fetch_one(pool)
        .await?;
    let games: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM games")
        .fetch_one(pool)
        .await?;
    let processed_games: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM games WHERE is_processed = 1")
            .fetch_one(pool)
            .await?;
    let predictions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM predictions")
        .fetch_one(pool)
        .await?;
    Ok(SystemCounts {
        teams,
        games,
        processed_games,
        predictions,
    })
}
