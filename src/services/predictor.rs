use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::config::AppConfig;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    ApComparison, Confidence, Disagreement, Game, Prediction, PredictionAccuracy, Team,
    WeeklyComparison,
};
use crate::services::elo::EloEngine;

/// Sole owner of Prediction rows. Shares the Elo probability model with the
/// rating path so predictions and rating updates never disagree.
pub struct PredictionEngine {
    pool: SqlitePool,
    engine: EloEngine,
    home_field_advantage: f64,
    base_score: f64,
    score_sensitivity: f64,
    high_confidence: f64,
    medium_confidence: f64,
}

impl PredictionEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self::from_config(pool, &AppConfig::default())
    }

    pub fn from_config(pool: SqlitePool, config: &AppConfig) -> Self {
        Self {
            pool,
            engine: EloEngine::from_config(config),
            home_field_advantage: config.home_field_advantage,
            base_score: config.base_score,
            score_sensitivity: config.score_sensitivity,
            high_confidence: config.high_confidence,
            medium_confidence: config.medium_confidence,
        }
    }

    /// Draft a prediction from current ratings. Pure — storage untouched.
    pub fn predict(&self, game: &Game, home: &Team, away: &Team) -> Prediction {
        let p_home = self.engine.home_win_probability(
            home.current_rating,
            away.current_rating,
            game.is_neutral_site,
        );

        let bump = if game.is_neutral_site {
            0.0
        } else {
            self.home_field_advantage
        };
        let effective_diff = home.current_rating + bump - away.current_rating;
        let swing = effective_diff / 100.0 * self.score_sensitivity;
        let home_score = ((self.base_score + swing).round()).max(0.0) as i64;
        let away_score = ((self.base_score - swing).round()).max(0.0) as i64;

        // Higher-probability side wins; an exact toss-up goes to the home team.
        let predicted_winner_id = if p_home >= 0.5 { home.id } else { away.id };

        let favorite = p_home.max(1.0 - p_home);
        let confidence = if favorite > self.high_confidence {
            Confidence::High
        } else if favorite > self.medium_confidence {
            Confidence::Medium
        } else {
            Confidence::Low
        };

        Prediction {
            id: 0,
            game_id: game.id,
            predicted_winner_id,
            predicted_home_score: home_score,
            predicted_away_score: away_score,
            home_win_probability: p_home,
            away_win_probability: 1.0 - p_home,
            pre_game_home_rating: home.current_rating,
            pre_game_away_rating: away.current_rating,
            confidence,
            was_correct: None,
            created_at: Utc::now(),
        }
    }

    /// Store a prediction for a future game. No-op when the game already has a
    /// prediction or already has a final score.
    pub async fn create_and_store(&self, game: &Game) -> CoreResult<Option<Prediction>> {
        if game.has_result() || game.is_processed {
            return Ok(None);
        }
        if db::get_prediction_by_game(&self.pool, game.id).await?.is_some() {
            return Ok(None);
        }

        let home = db::get_team(&self.pool, game.home_id).await?.ok_or_else(|| {
            CoreError::Integrity(format!("game {} references missing home team", game.id))
        })?;
        let away = db::get_team(&self.pool, game.away_id).await?.ok_or_else(|| {
            CoreError::Integrity(format!("game {} references missing away team", game.id))
        })?;

        let mut prediction = self.predict(game, &home, &away);
        prediction.id = db::insert_prediction(&self.pool, &prediction).await?;

        tracing::debug!(
            "Prediction stored for game {}: {} over {} ({:.1}%, {})",
            game.id,
            if prediction.predicted_winner_id == home.id { &home.name } else { &away.name },
            if prediction.predicted_winner_id == home.id { &away.name } else { &home.name },
            prediction.home_win_probability.max(prediction.away_win_probability) * 100.0,
            prediction.confidence.as_str()
        );
        Ok(Some(prediction))
    }

    /// Resolve a stored prediction against the final score. Excluded games are
    /// never scored; their predictions stay unresolved.
    pub async fn evaluate(&self, game: &Game) -> CoreResult<Option<bool>> {
        if !game.is_processed || game.excluded_from_rankings {
            return Ok(None);
        }
        let Some(prediction) = db::get_prediction_by_game(&self.pool, game.id).await? else {
            return Ok(None);
        };
        if prediction.was_correct.is_some() {
            return Ok(prediction.was_correct);
        }

        let was_correct = game.winner_id() == Some(prediction.predicted_winner_id);
        db::set_prediction_outcome(&self.pool, game.id, was_correct).await?;
        Ok(Some(was_correct))
    }

    pub async fn get_accuracy(
        &self,
        season: Option<i64>,
        team_id: Option<i64>,
    ) -> CoreResult<PredictionAccuracy> {
        let (total, resolved, correct) =
            db::prediction_accuracy_counts(&self.pool, season, team_id).await?;
        let percentage = if resolved > 0 {
            correct as f64 / resolved as f64 * 100.0
        } else {
            0.0
        };
        Ok(PredictionAccuracy {
            total,
            resolved,
            correct,
            percentage,
        })
    }

    /// Head-to-head against the AP-poll baseline ("better-ranked team wins,
    /// tie to home") over resolved games where both predictors apply.
    pub async fn compare_to_ap(&self, season: i64) -> CoreResult<ApComparison> {
        let games = db::games_for_season(&self.pool, season).await?;

        let mut cells = (0i64, 0i64, 0i64, 0i64); // (both, elo only, ap only, neither)
        let mut weekly: BTreeMap<i64, WeeklyComparison> = BTreeMap::new();
        let mut disagreements = Vec::new();
        let mut compared = 0i64;

        for game in &games {
            if !game.is_processed || game.excluded_from_rankings {
                continue;
            }
            let Some(prediction) = db::get_prediction_by_game(&self.pool, game.id).await? else {
                continue;
            };
            let Some(elo_correct) = prediction.was_correct else {
                continue;
            };

            let poll = db::poll_for_week(&self.pool, season, game.week).await?;
            let home_rank = poll.iter().find(|p| p.team_id == game.home_id).map(|p| p.rank);
            let away_rank = poll.iter().find(|p| p.team_id == game.away_id).map(|p| p.rank);
            let (Some(home_rank), Some(away_rank)) = (home_rank, away_rank) else {
                continue;
            };

            // Smaller rank number is the stronger poll position.
            let ap_pick = if home_rank <= away_rank {
                game.home_id
            } else {
                game.away_id
            };
            let ap_correct = game.winner_id() == Some(ap_pick);

            compared += 1;
            match (elo_correct, ap_correct) {
                (true, true) => cells.0 += 1,
                (true, false) => cells.1 += 1,
                (false, true) => cells.2 += 1,
                (false, false) => cells.3 += 1,
            }

            let entry = weekly.entry(game.week).or_insert(WeeklyComparison {
                week: game.week,
                games: 0,
                elo_correct: 0,
                ap_correct: 0,
            });
            entry.games += 1;
            if elo_correct {
                entry.elo_correct += 1;
            }
            if ap_correct {
                entry.ap_correct += 1;
            }

            if prediction.predicted_winner_id != ap_pick {
                disagreements.push(Disagreement {
                    game_id: game.id,
                    week: game.week,
                    elo_pick: prediction.predicted_winner_id,
                    ap_pick,
                    actual_winner: game.winner_id(),
                    elo_was_right: elo_correct,
                });
            }
        }

        let accuracy = |correct: i64| {
            if compared > 0 {
                correct as f64 / compared as f64 * 100.0
            } else {
                0.0
            }
        };

        Ok(ApComparison {
            season,
            games_compared: compared,
            both_correct: cells.0,
            elo_only_correct: cells.1,
            ap_only_correct: cells.2,
            both_wrong: cells.3,
            elo_accuracy: accuracy(cells.0 + cells.1),
            ap_accuracy: accuracy(cells.0 + cells.2),
            weekly: weekly.into_values().collect(),
            disagreements,
        })
    }

    /// Stored predictions for still-unplayed games, strongest matchup first
    /// (by the higher of the two sides' pre-game ratings).
    pub async fn upcoming_predictions(
        &self,
        season: i64,
        week: Option<i64>,
        team_id: Option<i64>,
    ) -> CoreResult<Vec<Prediction>> {
        let games = db::list_games(&self.pool, Some(season), week, team_id, Some(false)).await?;
        let teams = db::get_all_teams(&self.pool).await?;
        let ratings: std::collections::HashMap<i64, f64> =
            teams.iter().map(|t| (t.id, t.current_rating)).collect();

        let mut out = Vec::new();
        for game in games.iter().filter(|g| !g.has_result()) {
            if let Some(prediction) = db::get_prediction_by_game(&self.pool, game.id).await? {
                let top = ratings
                    .get(&game.home_id)
                    .copied()
                    .unwrap_or(0.0)
                    .max(ratings.get(&game.away_id).copied().unwrap_or(0.0));
                out.push((top, prediction));
            }
        }
        out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out.into_iter().map(|(_, p)| p).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConferenceTier, GameType, UNRANKED};
    use crate::services::rankings::RankingService;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    async fn team(pool: &SqlitePool, name: &str, rating: f64) -> i64 {
        db::insert_team(
            pool,
            name,
            ConferenceTier::P5,
            "Test",
            UNRANKED,
            UNRANKED,
            0.0,
            rating,
        )
        .await
        .unwrap()
    }

    fn bare_team(id: i64, rating: f64) -> Team {
        Team {
            id,
            name: format!("team-{}", id),
            tier: ConferenceTier::P5,
            conference: "Test".to_string(),
            recruiting_rank: UNRANKED,
            transfer_rank: UNRANKED,
            returning_production: 0.0,
            current_rating: rating,
            initial_rating: rating,
            wins: 0,
            losses: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn bare_game(id: i64, home_id: i64, away_id: i64, neutral: bool) -> Game {
        Game {
            id,
            season: 2024,
            week: 4,
            home_id,
            away_id,
            home_score: 0,
            away_score: 0,
            is_neutral_site: neutral,
            is_processed: false,
            excluded_from_rankings: false,
            game_type: GameType::Regular,
            postseason_name: None,
            game_date: None,
            home_rating_change: 0.0,
            away_rating_change: 0.0,
        }
    }

    #[tokio::test]
    async fn predict_scores_and_confidence() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool);
        // Home 1800 vs away 1700, not neutral: effective diff 165.
        let p = engine.predict(&bare_game(1, 10, 20, false), &bare_team(10, 1800.0), &bare_team(20, 1700.0));

        let expected = 1.0 / (1.0 + 10f64.powf((1700.0 - 1865.0) / 400.0));
        assert!((p.home_win_probability - expected).abs() < 1e-9);
        assert!((p.home_win_probability + p.away_win_probability - 1.0).abs() < 1e-9);
        assert_eq!(p.predicted_home_score, 36); // round(30 + 1.65 * 3.5)
        assert_eq!(p.predicted_away_score, 24); // round(30 - 5.775)
        assert_eq!(p.predicted_winner_id, 10);
        assert_eq!(p.confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn predict_tie_breaks_to_home() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool);
        // Neutral site, identical ratings: exact toss-up.
        let p = engine.predict(&bare_game(1, 10, 20, true), &bare_team(10, 1500.0), &bare_team(20, 1500.0));
        assert!((p.home_win_probability - 0.5).abs() < 1e-9);
        assert_eq!(p.predicted_winner_id, 10);
        assert_eq!(p.predicted_home_score, 30);
        assert_eq!(p.predicted_away_score, 30);
        assert_eq!(p.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn predict_confidence_tiers_and_clamping() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool);

        let high = engine.predict(&bare_game(1, 10, 20, true), &bare_team(10, 1900.0), &bare_team(20, 1500.0));
        assert_eq!(high.confidence, Confidence::High);
        assert_eq!(high.predicted_winner_id, 10);

        let away_fav = engine.predict(&bare_game(2, 10, 20, true), &bare_team(10, 1400.0), &bare_team(20, 1600.0));
        assert_eq!(away_fav.predicted_winner_id, 20);

        // A huge gap drives the underdog's score estimate to the floor.
        let rout = engine.predict(&bare_game(3, 10, 20, true), &bare_team(10, 2500.0), &bare_team(20, 1400.0));
        assert_eq!(rout.predicted_away_score, 0);
        assert!(rout.predicted_home_score > 60);
    }

    #[tokio::test]
    async fn create_and_store_captures_pre_game_ratings() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool.clone());
        let home = team(&pool, "Home", 1800.0).await;
        let away = team(&pool, "Away", 1700.0).await;
        let gid = db::insert_game(
            &pool, 2024, 4, home, away, 0, 0, false, false, GameType::Regular, None, None,
        )
        .await
        .unwrap();
        let game = db::get_game(&pool, gid).await.unwrap().unwrap();

        let stored = engine.create_and_store(&game).await.unwrap().unwrap();
        assert_eq!(stored.pre_game_home_rating, 1800.0);
        assert_eq!(stored.pre_game_away_rating, 1700.0);
        assert_eq!(stored.was_correct, None);

        // Second call is a no-op.
        assert!(engine.create_and_store(&game).await.unwrap().is_none());

        // Games that already have a result never get predictions.
        let g2 = db::insert_game(
            &pool, 2024, 5, home, away, 21, 14, false, false, GameType::Regular, None, None,
        )
        .await
        .unwrap();
        let played = db::get_game(&pool, g2).await.unwrap().unwrap();
        assert!(engine.create_and_store(&played).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evaluate_resolves_after_processing() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool.clone());
        let ranking = RankingService::new(pool.clone(), Arc::new(Mutex::new(())), EloEngine::new());

        let home = team(&pool, "Home", 1800.0).await;
        let away = team(&pool, "Away", 1700.0).await;
        let gid = db::insert_game(
            &pool, 2024, 4, home, away, 0, 0, false, false, GameType::Regular, None, None,
        )
        .await
        .unwrap();
        let game = db::get_game(&pool, gid).await.unwrap().unwrap();
        engine.create_and_store(&game).await.unwrap().unwrap();

        // Still unprocessed: evaluation leaves the prediction unresolved.
        assert_eq!(engine.evaluate(&game).await.unwrap(), None);

        // Home wins 28-21 as predicted.
        sqlx::query("UPDATE games SET home_score = 28, away_score = 21 WHERE id = ?")
            .bind(gid)
            .execute(&pool)
            .await
            .unwrap();
        ranking.process_game(gid).await.unwrap();
        let processed = db::get_game(&pool, gid).await.unwrap().unwrap();

        assert_eq!(engine.evaluate(&processed).await.unwrap(), Some(true));
        let stored = db::get_prediction_by_game(&pool, gid).await.unwrap().unwrap();
        assert_eq!(stored.was_correct, Some(true));
    }

    #[tokio::test]
    async fn excluded_games_are_never_scored() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool.clone());
        let ranking = RankingService::new(pool.clone(), Arc::new(Mutex::new(())), EloEngine::new());

        let home = team(&pool, "Home", 1800.0).await;
        let fcs = db::insert_team(
            &pool,
            "Littleton",
            ConferenceTier::Fcs,
            "Test",
            UNRANKED,
            UNRANKED,
            0.0,
            1300.0,
        )
        .await
        .unwrap();
        let gid = db::insert_game(
            &pool, 2024, 4, home, fcs, 0, 0, false, true, GameType::Regular, None, None,
        )
        .await
        .unwrap();
        let game = db::get_game(&pool, gid).await.unwrap().unwrap();
        engine.create_and_store(&game).await.unwrap().unwrap();

        sqlx::query("UPDATE games SET home_score = 56, away_score = 7 WHERE id = ?")
            .bind(gid)
            .execute(&pool)
            .await
            .unwrap();
        ranking.process_game(gid).await.unwrap();
        let processed = db::get_game(&pool, gid).await.unwrap().unwrap();

        assert_eq!(engine.evaluate(&processed).await.unwrap(), None);
        let stored = db::get_prediction_by_game(&pool, gid).await.unwrap().unwrap();
        assert_eq!(stored.was_correct, None);
    }

    #[tokio::test]
    async fn accuracy_counts_and_team_filter() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool.clone());
        let ranking = RankingService::new(pool.clone(), Arc::new(Mutex::new(())), EloEngine::new());

        let a = team(&pool, "A", 1800.0).await;
        let b = team(&pool, "B", 1600.0).await;
        let c = team(&pool, "C", 1550.0).await;

        // A over B (predicted, happens): correct.
        let g1 = db::insert_game(&pool, 2024, 1, a, b, 0, 0, false, false, GameType::Regular, None, None)
            .await
            .unwrap();
        // B over C at home (predicted), but C wins: incorrect.
        let g2 = db::insert_game(&pool, 2024, 2, b, c, 0, 0, false, false, GameType::Regular, None, None)
            .await
            .unwrap();
        // Unresolved future game.
        let g3 = db::insert_game(&pool, 2024, 3, a, c, 0, 0, false, false, GameType::Regular, None, None)
            .await
            .unwrap();

        for gid in [g1, g2, g3] {
            let game = db::get_game(&pool, gid).await.unwrap().unwrap();
            engine.create_and_store(&game).await.unwrap().unwrap();
        }
        for (gid, hs, aws) in [(g1, 35, 17), (g2, 13, 20)] {
            sqlx::query("UPDATE games SET home_score = ?, away_score = ? WHERE id = ?")
                .bind(hs)
                .bind(aws)
                .bind(gid)
                .execute(&pool)
                .await
                .unwrap();
            ranking.process_game(gid).await.unwrap();
            let game = db::get_game(&pool, gid).await.unwrap().unwrap();
            engine.evaluate(&game).await.unwrap();
        }

        let all = engine.get_accuracy(Some(2024), None).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.resolved, 2);
        assert_eq!(all.correct, 1);
        assert_eq!(all.percentage, 50.0);

        let a_only = engine.get_accuracy(Some(2024), Some(a)).await.unwrap();
        assert_eq!(a_only.total, 2);
        assert_eq!(a_only.resolved, 1);
        assert_eq!(a_only.correct, 1);
    }

    #[tokio::test]
    async fn ap_comparison_cells_and_disagreements() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool.clone());
        let ranking = RankingService::new(pool.clone(), Arc::new(Mutex::new(())), EloEngine::new());

        // Elo favors A (higher rating); AP favors B (better rank).
        let a = team(&pool, "A", 1800.0).await;
        let b = team(&pool, "B", 1750.0).await;
        db::upsert_poll_ranking(&pool, 2024, 1, 4, b, 10, 1200).await.unwrap();
        db::upsert_poll_ranking(&pool, 2024, 1, 7, a, 0, 900).await.unwrap();

        let gid = db::insert_game(&pool, 2024, 1, a, b, 0, 0, false, false, GameType::Regular, None, None)
            .await
            .unwrap();
        let game = db::get_game(&pool, gid).await.unwrap().unwrap();
        engine.create_and_store(&game).await.unwrap().unwrap();

        // A wins: Elo right, AP wrong.
        sqlx::query("UPDATE games SET home_score = 31, away_score = 24 WHERE id = ?")
            .bind(gid)
            .execute(&pool)
            .await
            .unwrap();
        ranking.process_game(gid).await.unwrap();
        let processed = db::get_game(&pool, gid).await.unwrap().unwrap();
        engine.evaluate(&processed).await.unwrap();

        let cmp = engine.compare_to_ap(2024).await.unwrap();
        assert_eq!(cmp.games_compared, 1);
        assert_eq!(cmp.elo_only_correct, 1);
        assert_eq!(cmp.ap_only_correct, 0);
        assert_eq!(cmp.elo_accuracy, 100.0);
        assert_eq!(cmp.ap_accuracy, 0.0);
        assert_eq!(cmp.weekly.len(), 1);
        assert_eq!(cmp.weekly[0].games, 1);
        assert_eq!(cmp.disagreements.len(), 1);
        assert_eq!(cmp.disagreements[0].elo_pick, a);
        assert_eq!(cmp.disagreements[0].ap_pick, b);
        assert!(cmp.disagreements[0].elo_was_right);
    }

    #[tokio::test]
    async fn upcoming_sorted_by_strongest_side() {
        let pool = db::test_pool().await;
        let engine = PredictionEngine::new(pool.clone());
        let a = team(&pool, "A", 1900.0).await;
        let b = team(&pool, "B", 1500.0).await;
        let c = team(&pool, "C", 1650.0).await;
        let d = team(&pool, "D", 1600.0).await;

        let g1 = db::insert_game(&pool, 2024, 5, c, d, 0, 0, false, false, GameType::Regular, None, None)
            .await
            .unwrap();
        let g2 = db::insert_game(&pool, 2024, 5, b, a, 0, 0, false, false, GameType::Regular, None, None)
            .await
            .unwrap();
        for gid in [g1, g2] {
            let game = db::get_game(&pool, gid).await.unwrap().unwrap();
            engine.create_and_store(&game).await.unwrap().unwrap();
        }

        let upcoming = engine.upcoming_predictions(2024, Some(5), None).await.unwrap();
        assert_eq!(upcoming.len(), 2);
        // The game involving the 1900-rated team leads.
        assert_eq!(upcoming[0].game_id, g2);
    }
}
