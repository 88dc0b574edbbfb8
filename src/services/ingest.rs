use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::config::AppConfig;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::models::{ConferenceTier, GameType, UpdateSummary, UNRANKED};
use crate::services::elo::preseason_rating;
use crate::services::predictor::PredictionEngine;
use crate::services::provider::{
    ProviderClient, ProviderGame, ProviderPoll, ProviderPollRank, ProviderPollWeek,
    ProviderReturningProduction, ProviderTeam, ProviderTeamRank, SeasonType,
};
use crate::services::rankings::RankingService;
use crate::services::scheduler::CancelFlag;

/// Minimum fuzzy-match score before a provider team name is mapped onto an
/// existing row. Below this the row is skipped with a warning.
const FUZZY_MATCH_THRESHOLD: f64 = 0.92;

const AP_POLL_NAME: &str = "AP Top 25";

/// Conferences treated as power conferences for tier assignment.
const P5_CONFERENCES: &[&str] = &["SEC", "Big Ten", "Big 12", "ACC", "Pac-12"];

/// Owns creation and update of Team (non-rating fields), Game, APPollRanking
/// and Season rows. Upserts are idempotent; replays delegate to the ranking
/// and prediction services.
pub struct IngestionPipeline {
    pool: SqlitePool,
    provider: ProviderClient,
    rankings: RankingService,
    predictor: PredictionEngine,
    count_postseason: bool,
}

impl IngestionPipeline {
    pub fn new(
        pool: SqlitePool,
        provider: ProviderClient,
        rankings: RankingService,
        predictor: PredictionEngine,
        config: &AppConfig,
    ) -> Self {
        Self {
            pool,
            provider,
            rankings,
            predictor,
            count_postseason: config.count_postseason,
        }
    }

    // ── Teams ────────────────────────────────────────────────────────────────

    pub async fn refresh_teams(&self, year: i64) -> CoreResult<u32> {
        let teams = self.provider.get_teams(year).await?;
        let recruiting = self.provider.get_recruiting(year).await?;
        let transfers = self.provider.get_transfer_portal(year).await?;
        let production = self.provider.get_returning_production(year).await?;
        self.upsert_teams(&teams, &recruiting, &transfers, &production)
            .await
    }

    /// Upsert by unique team name. Rating fields are only set at row creation;
    /// refreshes touch tier, conference and preseason inputs.
    pub async fn upsert_teams(
        &self,
        teams: &[ProviderTeam],
        recruiting: &[ProviderTeamRank],
        transfers: &[ProviderTeamRank],
        production: &[ProviderReturningProduction],
    ) -> CoreResult<u32> {
        let recruiting: HashMap<String, i64> = recruiting
            .iter()
            .map(|r| (r.team.to_lowercase(), r.rank))
            .collect();
        let transfers: HashMap<String, i64> = transfers
            .iter()
            .map(|r| (r.team.to_lowercase(), r.rank))
            .collect();
        let production: HashMap<String, f64> = production
            .iter()
            .filter_map(|r| r.overall.map(|v| (r.team.to_lowercase(), v)))
            .collect();

        let mut touched = 0u32;
        for team in teams {
            let key = team.school.to_lowercase();
            let tier = derive_tier(team);
            let recruiting_rank = recruiting.get(&key).copied().unwrap_or(UNRANKED);
            let transfer_rank = transfers.get(&key).copied().unwrap_or(UNRANKED);
            let returning = production.get(&key).copied().unwrap_or(0.0);
            if !(0.0..=1.0).contains(&returning) {
                tracing::warn!(
                    "Quarantined returning-production {} for {} (outside 0..=1)",
                    returning,
                    team.school
                );
                continue;
            }
            let conference = team.conference.as_deref().unwrap_or("");

            match db::get_team_by_name(&self.pool, &team.school).await? {
                Some(existing) => {
                    db::update_team_profile(
                        &self.pool,
                        existing.id,
                        tier,
                        conference,
                        recruiting_rank,
                        transfer_rank,
                        returning,
                    )
                    .await?;
                }
                None => {
                    let rating = preseason_rating(tier, recruiting_rank, transfer_rank, returning);
                    db::insert_team(
                        &self.pool,
                        &team.school,
                        tier,
                        conference,
                        recruiting_rank,
                        transfer_rank,
                        returning,
                        rating,
                    )
                    .await?;
                }
            }
            touched += 1;
        }

        tracing::info!("Teams refreshed: {} rows touched", touched);
        Ok(touched)
    }

    // ── Games ────────────────────────────────────────────────────────────────

    pub async fn refresh_games(&self, year: i64, up_to_week: i64) -> CoreResult<u32> {
        let mut rows = self
            .provider
            .get_games(year, SeasonType::Regular, None)
            .await?;
        rows.retain(|g| g.week <= up_to_week);

        // Postseason rounds only exist once the regular season has run out.
        if up_to_week >= 15 {
            rows.extend(
                self.provider
                    .get_games(year, SeasonType::Postseason, None)
                    .await?,
            );
        }

        self.upsert_games(year, &rows).await
    }

    /// Idempotent upsert keyed by (season, home, away, week). Scores on an
    /// already-processed row are frozen; divergent provider data is reported,
    /// not applied.
    pub async fn upsert_games(&self, year: i64, rows: &[ProviderGame]) -> CoreResult<u32> {
        let mut imported = 0u32;
        for row in rows {
            match self.upsert_game(year, row).await {
                Ok(()) => imported += 1,
                Err(CoreError::Storage(e)) => return Err(CoreError::Storage(e)),
                Err(e) => {
                    // Quarantine the row, keep the batch going.
                    tracing::warn!(
                        "Skipped game {} vs {} (week {}): {}",
                        row.home_team,
                        row.away_team,
                        row.week,
                        e
                    );
                }
            }
        }
        tracing::info!("Games refreshed: {} rows upserted", imported);
        Ok(imported)
    }

    async fn upsert_game(&self, year: i64, row: &ProviderGame) -> CoreResult<()> {
        let week = storage_week(row)?;
        let game_type = derive_game_type(row);

        let home = self.resolve_or_create_participant(&row.home_team).await?;
        let away = self.resolve_or_create_participant(&row.away_team).await?;

        let (home_score, away_score) = match (row.home_points, row.away_points) {
            (Some(h), Some(a)) => (h, a),
            (None, None) => (0, 0),
            _ => {
                tracing::warn!(
                    "Data integrity: {} vs {} (week {}) has exactly one score; ingesting as scheduled",
                    row.home_team,
                    row.away_team,
                    week
                );
                (0, 0)
            }
        };
        if home_score < 0 || away_score < 0 {
            return Err(CoreError::Validation(format!(
                "negative score in {} vs {}",
                row.home_team, row.away_team
            )));
        }

        let excluded = home.tier.is_fcs()
            || away.tier.is_fcs()
            || (game_type.is_postseason() && !self.count_postseason);
        let neutral = row.neutral_site.unwrap_or(false) || game_type.is_postseason();
        let postseason_name = row.notes.as_deref();

        match db::find_game_by_key(&self.pool, year, home.id, away.id, week).await? {
            None => {
                db::insert_game(
                    &self.pool,
                    year,
                    week,
                    home.id,
                    away.id,
                    home_score,
                    away_score,
                    neutral,
                    excluded,
                    game_type,
                    postseason_name,
                    row.start_date,
                )
                .await?;
            }
            Some(existing) if !existing.is_processed => {
                db::update_game_unprocessed(
                    &self.pool,
                    existing.id,
                    home_score,
                    away_score,
                    neutral,
                    excluded,
                    game_type,
                    postseason_name,
                    row.start_date,
                )
                .await?;
            }
            Some(existing) => {
                // Processed rows accept schedule metadata only.
                if existing.has_result()
                    && (existing.home_score, existing.away_score) != (home_score, away_score)
                    && (home_score, away_score) != (0, 0)
                {
                    tracing::warn!(
                        "Data integrity: provider score {}-{} diverges from processed game {} ({}-{}); keeping stored result",
                        home_score,
                        away_score,
                        existing.id,
                        existing.home_score,
                        existing.away_score
                    );
                }
                db::update_game_schedule_meta(&self.pool, existing.id, row.start_date).await?;
            }
        }
        Ok(())
    }

    /// Game participants that the teams feed never delivered (FCS opponents)
    /// get a stub row so the schedule stays representable.
    async fn resolve_or_create_participant(&self, name: &str) -> CoreResult<crate::models::Team> {
        if let Some(id) = self.resolve_team_id(name).await? {
            return Ok(db::get_team(&self.pool, id)
                .await?
                .ok_or_else(|| CoreError::Integrity(format!("team {} vanished", id)))?);
        }
        tracing::debug!("Creating FCS stub for unknown opponent {:?}", name);
        let rating = preseason_rating(ConferenceTier::Fcs, UNRANKED, UNRANKED, 0.0);
        let id = db::insert_team(
            &self.pool,
            name,
            ConferenceTier::Fcs,
            "",
            UNRANKED,
            UNRANKED,
            0.0,
            rating,
        )
        .await?;
        Ok(db::get_team(&self.pool, id)
            .await?
            .ok_or_else(|| CoreError::Integrity(format!("team {} vanished", id)))?)
    }

    /// Exact (case-insensitive) lookup first, then a fuzzy pass for provider
    /// feeds that spell a school slightly differently.
    async fn resolve_team_id(&self, name: &str) -> CoreResult<Option<i64>> {
        if let Some(team) = db::get_team_by_name(&self.pool, name).await? {
            return Ok(Some(team.id));
        }

        let teams = db::get_all_teams(&self.pool).await?;
        let needle = name.to_lowercase();
        let best = teams
            .iter()
            .map(|t| (strsim::jaro_winkler(&t.name.to_lowercase(), &needle), t))
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((score, team)) if score >= FUZZY_MATCH_THRESHOLD => {
                tracing::debug!(
                    "Fuzzy-matched provider name {:?} to {:?} (score {:.3})",
                    name,
                    team.name,
                    score
                );
                Ok(Some(team.id))
            }
            _ => Ok(None),
        }
    }

    // ── Polls ────────────────────────────────────────────────────────────────

    pub async fn refresh_polls(&self, year: i64, week: i64) -> CoreResult<u32> {
        let weeks = self.provider.get_ap_poll(year, week).await?;
        self.upsert_polls(year, &weeks).await
    }

    pub async fn upsert_polls(&self, year: i64, weeks: &[ProviderPollWeek]) -> CoreResult<u32> {
        let mut imported = 0u32;
        for poll_week in weeks {
            let Some(ap) = poll_week.polls.iter().find(|p| p.poll == AP_POLL_NAME) else {
                continue;
            };
            for entry in &ap.ranks {
                let Some(team_id) = self.resolve_team_id(&entry.school).await? else {
                    tracing::warn!("AP poll names unknown team {:?}; skipped", entry.school);
                    continue;
                };
                db::upsert_poll_ranking(
                    &self.pool,
                    year,
                    poll_week.week,
                    entry.rank,
                    team_id,
                    entry.first_place_votes.unwrap_or(0),
                    entry.points.unwrap_or(0),
                )
                .await?;
                imported += 1;
            }
        }
        tracing::info!("AP poll refreshed: {} rows", imported);
        Ok(imported)
    }

    // ── Replay ───────────────────────────────────────────────────────────────

    /// Create predictions for still-unplayed games, then process every
    /// finished unprocessed game chronologically, evaluating each prediction
    /// right after its game commits. Single-game failures do not abort the
    /// batch.
    pub async fn replay_new(
        &self,
        season: i64,
        cancel: &CancelFlag,
    ) -> CoreResult<(u32, u32, u32)> {
        let mut created = 0u32;

        for game in db::scheduled_games(&self.pool, season).await? {
            cancel.check()?;
            match self.predictor.create_and_store(&game).await {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("Prediction for game {} failed: {}", game.id, e),
            }
        }

        let mut processed = 0u32;
        let mut evaluated = 0u32;
        for game in db::unprocessed_games_with_result(&self.pool, season).await? {
            cancel.check()?;
            if let Err(e) = self.rankings.process_game(game.id).await {
                // That game's transaction rolled back; continue with the next.
                tracing::error!("Processing game {} failed: {}", game.id, e);
                continue;
            }
            processed += 1;

            match db::get_game(&self.pool, game.id).await? {
                Some(committed) => match self.predictor.evaluate(&committed).await {
                    Ok(Some(_)) => evaluated += 1,
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Evaluating game {} failed: {}", game.id, e),
                },
                None => {
                    tracing::error!("Game {} vanished after processing", game.id);
                }
            }
        }

        tracing::info!(
            "Replay for {}: {} predictions created, {} games processed, {} evaluated",
            season,
            created,
            processed,
            evaluated
        );
        Ok((created, processed, evaluated))
    }

    // ── Orchestration ────────────────────────────────────────────────────────

    /// Full update pass for one season: teams, games up to `week`, polls,
    /// replay, snapshot.
    pub async fn run_with_week(
        &self,
        year: i64,
        week: i64,
        cancel: &CancelFlag,
    ) -> CoreResult<UpdateSummary> {
        let teams_updated = self.refresh_teams(year).await?;
        cancel.check()?;
        let games_imported = self.refresh_games(year, week).await?;
        cancel.check()?;
        let polls_imported = self.refresh_polls(year, week).await?;
        cancel.check()?;

        db::upsert_season(&self.pool, year, week).await?;
        db::set_active_season(&self.pool, year).await?;

        let (predictions_created, games_processed, predictions_evaluated) =
            self.replay_new(year, cancel).await?;

        self.rankings.save_snapshot(year, week).await?;

        Ok(UpdateSummary {
            games_imported,
            teams_updated,
            polls_imported,
            games_processed,
            predictions_created,
            predictions_evaluated,
        })
    }

    /// Convenience wrapper: resolve the current week from the provider first.
    pub async fn run_once(&self, year: i64, cancel: &CancelFlag) -> CoreResult<UpdateSummary> {
        let week = self
            .provider
            .get_current_week(year)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("no current week for {}", year)))?;
        self.run_with_week(year, week, cancel).await
    }
}

fn derive_tier(team: &ProviderTeam) -> ConferenceTier {
    match team.classification.as_deref() {
        Some("fcs") => ConferenceTier::Fcs,
        _ => match &team.conference {
            Some(conf) if P5_CONFERENCES.contains(&conf.as_str()) => ConferenceTier::P5,
            _ => ConferenceTier::G5,
        },
    }
}

/// Postseason rounds land on storage weeks 16..=19; regular weeks pass
/// through after a range check.
fn storage_week(row: &ProviderGame) -> CoreResult<i64> {
    if row.season_type == "postseason" {
        Ok(15 + row.week.clamp(1, 4))
    } else if (0..=15).contains(&row.week) {
        Ok(row.week)
    } else {
        Err(CoreError::Validation(format!(
            "regular-season week {} out of range",
            row.week
        )))
    }
}

fn derive_game_type(row: &ProviderGame) -> GameType {
    let notes = row.notes.as_deref().unwrap_or("");
    if row.season_type == "postseason" {
        if notes.to_lowercase().contains("playoff") {
            GameType::Playoff
        } else {
            GameType::Bowl
        }
    } else if notes.to_lowercase().contains("championship") {
        GameType::ConferenceChampionship
    } else {
        GameType::Regular
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::elo::EloEngine;
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn pipeline(pool: &SqlitePool) -> IngestionPipeline {
        let config = AppConfig::default();
        IngestionPipeline::new(
            pool.clone(),
            ProviderClient::from_config(pool.clone(), &config),
            RankingService::new(pool.clone(), Arc::new(Mutex::new(())), EloEngine::new()),
            PredictionEngine::new(pool.clone()),
            &config,
        )
    }

    fn provider_team(school: &str, conference: &str) -> ProviderTeam {
        ProviderTeam {
            school: school.to_string(),
            conference: Some(conference.to_string()),
            classification: Some("fbs".to_string()),
        }
    }

    fn provider_game(
        week: i64,
        home: &str,
        away: &str,
        scores: Option<(i64, i64)>,
    ) -> ProviderGame {
        ProviderGame {
            season: 2024,
            week,
            season_type: "regular".to_string(),
            start_date: None,
            neutral_site: Some(false),
            home_team: home.to_string(),
            home_points: scores.map(|s| s.0),
            away_team: away.to_string(),
            away_points: scores.map(|s| s.1),
            notes: None,
        }
    }

    #[tokio::test]
    async fn upsert_teams_creates_then_updates_without_touching_ratings() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);

        let teams = vec![provider_team("Georgia", "SEC")];
        let recruiting = vec![ProviderTeamRank {
            team: "Georgia".to_string(),
            rank: 3,
        }];
        let transfers = vec![ProviderTeamRank {
            team: "Georgia".to_string(),
            rank: 12,
        }];
        let production = vec![ProviderReturningProduction {
            team: "Georgia".to_string(),
            overall: Some(0.72),
        }];

        pipe.upsert_teams(&teams, &recruiting, &transfers, &production)
            .await
            .unwrap();
        let team = db::get_team_by_name(&pool, "Georgia").await.unwrap().unwrap();
        assert_eq!(team.tier, ConferenceTier::P5);
        assert_eq!(team.recruiting_rank, 3);
        // New row starts at its preseason rating: 1500 + 200 + 50 + 25.
        assert_eq!(team.initial_rating, 1775.0);
        assert_eq!(team.current_rating, 1775.0);

        // A later refresh updates inputs but never rating fields.
        let recruiting = vec![ProviderTeamRank {
            team: "Georgia".to_string(),
            rank: 8,
        }];
        sqlx::query("UPDATE teams SET current_rating = 1802.5 WHERE id = ?")
            .bind(team.id)
            .execute(&pool)
            .await
            .unwrap();
        pipe.upsert_teams(&teams, &recruiting, &[], &[]).await.unwrap();

        let updated = db::get_team_by_name(&pool, "Georgia").await.unwrap().unwrap();
        assert_eq!(updated.recruiting_rank, 8);
        assert_eq!(updated.transfer_rank, UNRANKED);
        assert_eq!(updated.current_rating, 1802.5);
        assert_eq!(updated.initial_rating, 1775.0);
    }

    #[tokio::test]
    async fn upsert_games_creates_and_updates_unprocessed_rows() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(
            &[provider_team("Alpha", "SEC"), provider_team("Beta", "MAC")],
            &[],
            &[],
            &[],
        )
        .await
        .unwrap();

        // Scheduled game lands with zero scores.
        pipe.upsert_games(2024, &[provider_game(3, "Alpha", "Beta", None)])
            .await
            .unwrap();
        let games = db::games_for_season(&pool, 2024).await.unwrap();
        assert_eq!(games.len(), 1);
        assert!(!games[0].has_result());
        assert!(!games[0].excluded_from_rankings);

        // The same key with a final score updates in place.
        pipe.upsert_games(2024, &[provider_game(3, "Alpha", "Beta", Some((31, 10)))])
            .await
            .unwrap();
        let games = db::games_for_season(&pool, 2024).await.unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!((games[0].home_score, games[0].away_score), (31, 10));
    }

    #[tokio::test]
    async fn processed_rows_keep_their_scores() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(
            &[provider_team("Alpha", "SEC"), provider_team("Beta", "SEC")],
            &[],
            &[],
            &[],
        )
        .await
        .unwrap();
        pipe.upsert_games(2024, &[provider_game(1, "Alpha", "Beta", Some((28, 14)))])
            .await
            .unwrap();

        let cancel = CancelFlag::default();
        pipe.replay_new(2024, &cancel).await.unwrap();

        // Provider later reports a different score for the processed game.
        let date = Some(Utc::now());
        let mut divergent = provider_game(1, "Alpha", "Beta", Some((28, 21)));
        divergent.start_date = date;
        pipe.upsert_games(2024, &[divergent]).await.unwrap();

        let game = &db::games_for_season(&pool, 2024).await.unwrap()[0];
        assert!(game.is_processed);
        assert_eq!((game.home_score, game.away_score), (28, 14));
        // Schedule metadata still flows through.
        assert!(game.game_date.is_some());
    }

    #[tokio::test]
    async fn half_scored_rows_are_quarantined_as_scheduled() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(
            &[provider_team("Alpha", "SEC"), provider_team("Beta", "SEC")],
            &[],
            &[],
            &[],
        )
        .await
        .unwrap();

        let mut row = provider_game(2, "Alpha", "Beta", None);
        row.home_points = Some(17);
        pipe.upsert_games(2024, &[row]).await.unwrap();

        let game = &db::games_for_season(&pool, 2024).await.unwrap()[0];
        assert!(!game.has_result());
        assert!(!game.is_processed);
    }

    #[tokio::test]
    async fn unknown_opponents_become_excluded_fcs_games() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(&[provider_team("Alpha", "SEC")], &[], &[], &[])
            .await
            .unwrap();

        pipe.upsert_games(
            2024,
            &[provider_game(1, "Alpha", "Mercyhurst", Some((56, 7)))],
        )
        .await
        .unwrap();

        let stub = db::get_team_by_name(&pool, "Mercyhurst").await.unwrap().unwrap();
        assert_eq!(stub.tier, ConferenceTier::Fcs);
        assert_eq!(stub.current_rating, 1300.0);

        let game = &db::games_for_season(&pool, 2024).await.unwrap()[0];
        assert!(game.excluded_from_rankings);
    }

    #[tokio::test]
    async fn postseason_defaults_to_excluded_on_late_weeks() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(
            &[provider_team("Alpha", "SEC"), provider_team("Beta", "Big Ten")],
            &[],
            &[],
            &[],
        )
        .await
        .unwrap();

        let mut bowl = provider_game(1, "Alpha", "Beta", Some((35, 28)));
        bowl.season_type = "postseason".to_string();
        bowl.notes = Some("Citrus Bowl".to_string());
        pipe.upsert_games(2024, &[bowl]).await.unwrap();

        let game = &db::games_for_season(&pool, 2024).await.unwrap()[0];
        assert_eq!(game.week, 16);
        assert_eq!(game.game_type, GameType::Bowl);
        assert!(game.excluded_from_rankings);
        assert!(game.is_neutral_site);
        assert_eq!(game.postseason_name.as_deref(), Some("Citrus Bowl"));
    }

    #[tokio::test]
    async fn poll_rows_fuzzy_match_and_skip_unknowns() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(&[provider_team("Ohio State", "Big Ten")], &[], &[], &[])
            .await
            .unwrap();

        let weeks = vec![ProviderPollWeek {
            season: 2024,
            week: 5,
            polls: vec![ProviderPoll {
                poll: AP_POLL_NAME.to_string(),
                ranks: vec![
                    ProviderPollRank {
                        rank: 1,
                        school: "Ohio State".to_string(),
                        first_place_votes: Some(52),
                        points: Some(1544),
                    },
                    ProviderPollRank {
                        rank: 2,
                        school: "Made Up University".to_string(),
                        first_place_votes: None,
                        points: Some(1410),
                    },
                ],
            }],
        }];

        let imported = pipe.upsert_polls(2024, &weeks).await.unwrap();
        assert_eq!(imported, 1);

        let poll = db::poll_for_week(&pool, 2024, 5).await.unwrap();
        assert_eq!(poll.len(), 1);
        assert_eq!(poll[0].rank, 1);
        assert_eq!(poll[0].first_place_votes, 52);
    }

    #[tokio::test]
    async fn replay_creates_predictions_then_processes_and_evaluates() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(
            &[provider_team("Alpha", "SEC"), provider_team("Beta", "SEC")],
            &[],
            &[],
            &[],
        )
        .await
        .unwrap();

        pipe.upsert_games(
            2024,
            &[
                provider_game(1, "Alpha", "Beta", Some((24, 10))),
                provider_game(2, "Beta", "Alpha", None),
            ],
        )
        .await
        .unwrap();

        let cancel = CancelFlag::default();
        let (created, processed, evaluated) = pipe.replay_new(2024, &cancel).await.unwrap();
        // Only the future week-2 game gets a prediction; week 1 already has a
        // score at prediction time.
        assert_eq!(created, 1);
        assert_eq!(processed, 1);
        assert_eq!(evaluated, 0);

        let games = db::games_for_season(&pool, 2024).await.unwrap();
        let week1 = games.iter().find(|g| g.week == 1).unwrap();
        let week2 = games.iter().find(|g| g.week == 2).unwrap();
        assert!(week1.is_processed);
        assert!(db::get_prediction_by_game(&pool, week1.id).await.unwrap().is_none());

        let week2_prediction = db::get_prediction_by_game(&pool, week2.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(week2_prediction.was_correct, None);

        // Week 2 finishes; the next replay processes it and resolves the
        // prediction without creating a new one.
        pipe.upsert_games(2024, &[provider_game(2, "Beta", "Alpha", Some((13, 27)))])
            .await
            .unwrap();
        let (created, processed, evaluated) = pipe.replay_new(2024, &cancel).await.unwrap();
        assert_eq!(created, 0);
        assert_eq!(processed, 1);
        assert_eq!(evaluated, 1);

        let resolved = db::get_prediction_by_game(&pool, week2.id)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.was_correct.is_some());
    }

    #[tokio::test]
    async fn replay_honors_cancellation_between_games() {
        let pool = db::test_pool().await;
        let pipe = pipeline(&pool);
        pipe.upsert_teams(
            &[provider_team("Alpha", "SEC"), provider_team("Beta", "SEC")],
            &[],
            &[],
            &[],
        )
        .await
        .unwrap();
        pipe.upsert_games(2024, &[provider_game(1, "Alpha", "Beta", Some((20, 3)))])
            .await
            .unwrap();

        let cancel = CancelFlag::default();
        cancel.cancel();
        let err = pipe.replay_new(2024, &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(!db::games_for_season(&pool, 2024).await.unwrap()[0].is_processed);
    }

    #[test]
    fn tier_derivation() {
        assert_eq!(derive_tier(&provider_team("X", "SEC")), ConferenceTier::P5);
        assert_eq!(
            derive_tier(&provider_team("X", "Mountain West")),
            ConferenceTier::G5
        );
        let fcs = ProviderTeam {
            school: "X".to_string(),
            conference: None,
            classification: Some("fcs".to_string()),
        };
        assert_eq!(derive_tier(&fcs), ConferenceTier::Fcs);
    }

    #[test]
    fn week_mapping_for_postseason() {
        let mut row = provider_game(1, "A", "B", None);
        row.season_type = "postseason".to_string();
        assert_eq!(storage_week(&row).unwrap(), 16);
        row.week = 4;
        assert_eq!(storage_week(&row).unwrap(), 19);
        row.week = 9;
        assert_eq!(storage_week(&row).unwrap(), 19);

        let regular = provider_game(16, "A", "B", None);
        assert!(storage_week(&regular).is_err());
    }
}
