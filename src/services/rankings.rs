use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::models::{Game, RankedTeam, Team};
use crate::services::elo::{preseason_rating, EloEngine};

/// What `process_game` did, surfaced to callers (the POST /api/games handler
/// returns the deltas).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessOutcome {
    Processed {
        home_delta: f64,
        away_delta: f64,
        new_home_rating: f64,
        new_away_rating: f64,
    },
    /// Excluded games flip to processed with zero deltas and no record change.
    Excluded,
    AlreadyProcessed,
}

/// Sole owner of Team rating/record mutation and Game processed-state. All
/// writes happen under the process-wide writer lock, one transaction per game.
pub struct RankingService {
    pool: SqlitePool,
    writer_lock: Arc<Mutex<()>>,
    engine: EloEngine,
}

impl RankingService {
    pub fn new(pool: SqlitePool, writer_lock: Arc<Mutex<()>>, engine: EloEngine) -> Self {
        Self {
            pool,
            writer_lock,
            engine,
        }
    }

    /// Transition one game from unprocessed to processed. Idempotent; callers
    /// present games in (week, game_date, id) order within a season.
    pub async fn process_game(&self, game_id: i64) -> CoreResult<ProcessOutcome> {
        let _guard = self.writer_lock.lock().await;
        self.process_game_locked(game_id).await
    }

    /// Body of `process_game`, called with the writer lock already held so
    /// batch operations (recompute, replay) take the lock once.
    async fn process_game_locked(&self, game_id: i64) -> CoreResult<ProcessOutcome> {
        let mut tx = self.pool.begin().await?;

        let game = db::get_game(&mut *tx, game_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("game {}", game_id)))?;

        if game.is_processed {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }
        if !game.has_result() {
            return Err(CoreError::Validation(format!(
                "game {} has no final score",
                game_id
            )));
        }

        if game.excluded_from_rankings {
            db::mark_game_processed(&mut *tx, game_id, 0.0, 0.0).await?;
            tx.commit().await?;
            return Ok(ProcessOutcome::Excluded);
        }

        let home = db::get_team(&mut *tx, game.home_id).await?.ok_or_else(|| {
            CoreError::Integrity(format!("game {} references missing home team {}", game_id, game.home_id))
        })?;
        let away = db::get_team(&mut *tx, game.away_id).await?.ok_or_else(|| {
            CoreError::Integrity(format!("game {} references missing away team {}", game_id, game.away_id))
        })?;

        let update = self.engine.update(
            home.current_rating,
            away.current_rating,
            game.home_score,
            game.away_score,
            home.tier,
            away.tier,
            game.is_neutral_site,
        );

        let (home_wins, home_losses, away_wins, away_losses) = match game.winner_id() {
            Some(id) if id == home.id => (home.wins + 1, home.losses, away.wins, away.losses + 1),
            Some(_) => (home.wins, home.losses + 1, away.wins + 1, away.losses),
            None => (home.wins, home.losses, away.wins, away.losses),
        };

        let new_home_rating = home.current_rating + update.home_delta;
        let new_away_rating = away.current_rating + update.away_delta;

        db::set_team_rating_and_record(&mut *tx, home.id, new_home_rating, home_wins, home_losses)
            .await?;
        db::set_team_rating_and_record(&mut *tx, away.id, new_away_rating, away_wins, away_losses)
            .await?;
        db::mark_game_processed(&mut *tx, game_id, update.home_delta, update.away_delta).await?;

        tx.commit().await?;

        tracing::debug!(
            "Processed game {}: {} {:.2} ({:+.2}), {} {:.2} ({:+.2})",
            game_id,
            home.name,
            new_home_rating,
            update.home_delta,
            away.name,
            new_away_rating,
            update.away_delta
        );

        Ok(ProcessOutcome::Processed {
            home_delta: update.home_delta,
            away_delta: update.away_delta,
            new_home_rating,
            new_away_rating,
        })
    }

    /// Rewind the season and replay every finished game in chronological
    /// order. Used after parameter changes or data corrections.
    pub async fn recompute_season(&self, season: i64) -> CoreResult<u32> {
        let _guard = self.writer_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        db::reset_teams_to_initial(&mut *tx).await?;
        db::clear_processing_state(&mut *tx, season).await?;
        tx.commit().await?;

        let games = db::unprocessed_games_with_result(&self.pool, season).await?;
        let mut replayed = 0u32;
        for game in &games {
            self.process_game_locked(game.id).await?;
            replayed += 1;
        }

        tracing::info!("Recomputed season {}: {} games replayed", season, replayed);
        Ok(replayed)
    }

    /// Recompute every team's starting rating from its current preseason
    /// inputs. Follow with `recompute_season` when games were already played.
    pub async fn reset_preseason(&self, _season: i64) -> CoreResult<u32> {
        let _guard = self.writer_lock.lock().await;

        let teams = db::get_all_teams(&self.pool).await?;
        let mut touched = 0u32;
        for team in &teams {
            let rating = preseason_rating(
                team.tier,
                team.recruiting_rank,
                team.transfer_rank,
                team.returning_production,
            );
            db::set_team_season_ratings(&self.pool, team.id, rating).await?;
            touched += 1;
        }

        tracing::info!("Preseason ratings reset for {} teams", touched);
        Ok(touched)
    }

    /// Mean current rating of opponents across a team's processed,
    /// non-excluded games. `None` when no qualifying games exist — never
    /// conflated with a rating of zero.
    pub async fn compute_sos(&self, team_id: i64, season: i64) -> CoreResult<Option<f64>> {
        let games = db::processed_rated_games(&self.pool, season).await?;
        let teams = db::get_all_teams(&self.pool).await?;
        let ratings: HashMap<i64, f64> = teams.iter().map(|t| (t.id, t.current_rating)).collect();
        Ok(Self::sos_for_team(team_id, &games, &ratings))
    }

    fn sos_for_team(team_id: i64, games: &[Game], ratings: &HashMap<i64, f64>) -> Option<f64> {
        let mut total = 0.0;
        let mut count = 0u32;
        for game in games {
            let opponent = if game.home_id == team_id {
                game.away_id
            } else if game.away_id == team_id {
                game.home_id
            } else {
                continue;
            };
            if let Some(rating) = ratings.get(&opponent) {
                total += rating;
                count += 1;
            }
        }
        (count > 0).then(|| total / count as f64)
    }

    /// Current rankings: FBS teams by rating descending (stable by id), with
    /// SOS and SOS rank attached. Teams without qualifying games sort last in
    /// the SOS ordering.
    pub async fn get_current_rankings(
        &self,
        season: i64,
        limit: Option<usize>,
    ) -> CoreResult<Vec<RankedTeam>> {
        let teams: Vec<Team> = db::get_all_teams(&self.pool)
            .await?
            .into_iter()
            .filter(|t| !t.is_fcs())
            .collect();
        let games = db::processed_rated_games(&self.pool, season).await?;
        let ratings: HashMap<i64, f64> = teams.iter().map(|t| (t.id, t.current_rating)).collect();

        let sos: HashMap<i64, Option<f64>> = teams
            .iter()
            .map(|t| (t.id, Self::sos_for_team(t.id, &games, &ratings)))
            .collect();

        // SOS ordering: defined values descending, absent values last.
        let mut by_sos: Vec<(i64, Option<f64>)> = sos.iter().map(|(k, v)| (*k, *v)).collect();
        by_sos.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.0.cmp(&b.0),
        });
        let sos_ranks: HashMap<i64, i64> = by_sos
            .iter()
            .enumerate()
            .filter(|(_, (_, s))| s.is_some())
            .map(|(i, (id, _))| (*id, i as i64 + 1))
            .collect();

        let mut ranked: Vec<RankedTeam> = teams
            .iter()
            .enumerate()
            .map(|(i, t)| RankedTeam {
                rank: i as i64 + 1,
                team_id: t.id,
                name: t.name.clone(),
                conference_tier: t.tier,
                conference_name: t.conference.clone(),
                rating: t.current_rating,
                wins: t.wins,
                losses: t.losses,
                sos: sos.get(&t.id).copied().flatten(),
                sos_rank: sos_ranks.get(&t.id).copied(),
            })
            .collect();

        if let Some(limit) = limit {
            ranked.truncate(limit);
        }
        Ok(ranked)
    }

    /// Persist the current ranking as immutable history for (season, week).
    pub async fn save_snapshot(&self, season: i64, week: i64) -> CoreResult<u32> {
        let rankings = self.get_current_rankings(season, None).await?;
        let mut written = 0u32;
        for entry in &rankings {
            db::insert_snapshot(
                &self.pool,
                entry.team_id,
                season,
                week,
                entry.rank,
                entry.rating,
                entry.wins,
                entry.losses,
                entry.sos,
                entry.sos_rank,
            )
            .await?;
            written += 1;
        }
        Ok(written)
    }
}
