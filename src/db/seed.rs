use sqlx::SqlitePool;

use crate::db;
use crate::error::CoreResult;
use crate::models::{ConferenceTier, GameType, UNRANKED};
use crate::services::elo::preseason_rating;

/// Development fixture: a small FBS slate with preseason inputs and the first
/// weeks of a season, so the server is usable without provider credentials.
/// Never invoked implicitly by `serve`.
pub async fn seed_data(pool: &SqlitePool, year: i64) -> CoreResult<()> {
    use ConferenceTier::*;

    // (name, tier, conference, recruiting, transfer, returning production)
    let teams: &[(&str, ConferenceTier, &str, i64, i64, f64)] = &[
        ("Georgia", P5, "SEC", 2, 14, 0.55),
        ("Alabama", P5, "SEC", 4, 9, 0.48),
        ("Ohio State", P5, "Big Ten", 5, 2, 0.61),
        ("Michigan", P5, "Big Ten", 12, 30, 0.44),
        ("Texas", P5, "SEC", 3, 6, 0.70),
        ("Oregon", P5, "Big Ten", 8, 4, 0.58),
        ("Florida State", P5, "ACC", 18, 1, 0.37),
        ("Utah", P5, "Big 12", 35, 28, 0.81),
        ("Boise State", G5, "Mountain West", 70, UNRANKED, 0.74),
        ("Tulane", G5, "American", 88, 61, 0.52),
        ("Memphis", G5, "American", 77, 55, 0.83),
        ("Appalachian State", G5, "Sun Belt", UNRANKED, UNRANKED, 0.66),
        ("Mercer", Fcs, "Southern", UNRANKED, UNRANKED, 0.0),
        ("Portland State", Fcs, "Big Sky", UNRANKED, UNRANKED, 0.0),
    ];

    let mut ids = Vec::with_capacity(teams.len());
    for (name, tier, conference, recruiting, transfer, production) in teams {
        let id = match db::get_team_by_name(pool, name).await? {
            Some(existing) => existing.id,
            None => {
                let rating = preseason_rating(*tier, *recruiting, *transfer, *production);
                db::insert_team(
                    pool, name, *tier, conference, *recruiting, *transfer, *production, rating,
                )
                .await?
            }
        };
        ids.push(id);
    }

    let id = |i: usize| ids[i];

    // (week, home, away, home_score, away_score, neutral, excluded)
    let games: &[(i64, usize, usize, i64, i64, bool, bool)] = &[
        // Week 1: kickoff weekend, two FCS paycheck games.
        (1, 0, 11, 38, 10, false, false), // Georgia over App State
        (1, 2, 12, 52, 3, false, true),   // Ohio State over Mercer (FCS)
        (1, 4, 3, 31, 12, true, false),   // Texas over Michigan, neutral
        (1, 7, 13, 41, 14, false, true),  // Utah over Portland State (FCS)
        (1, 8, 9, 27, 24, false, false),  // Boise State over Tulane
        // Week 2
        (2, 1, 6, 24, 21, false, false),  // Alabama over Florida State
        (2, 5, 10, 34, 31, false, false), // Oregon over Memphis
        (2, 3, 9, 28, 17, false, false),  // Michigan over Tulane
        // Week 3: still on the schedule.
        (3, 0, 1, 0, 0, false, false), // Georgia vs Alabama
        (3, 2, 5, 0, 0, false, false), // Ohio State vs Oregon
        (3, 10, 8, 0, 0, false, false), // Memphis vs Boise State
    ];

    for (week, home, away, hs, aws, neutral, excluded) in games {
        if db::find_game_by_key(pool, year, id(*home), id(*away), *week)
            .await?
            .is_some()
        {
            continue;
        }
        db::insert_game(
            pool,
            year,
            *week,
            id(*home),
            id(*away),
            *hs,
            *aws,
            *neutral,
            *excluded,
            GameType::Regular,
            None,
            None,
        )
        .await?;
    }

    db::upsert_season(pool, year, 3).await?;
    db::set_active_season(pool, year).await?;

    tracing::info!("Seeded {} teams and {} games for {}", teams.len(), games.len(), year);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_is_idempotent() {
        let pool = db::test_pool().await;
        seed_data(&pool, 2024).await.unwrap();
        seed_data(&pool, 2024).await.unwrap();

        let counts = db::system_counts(&pool).await.unwrap();
        assert_eq!(counts.teams, 14);
        assert_eq!(counts.games, 11);
        assert_eq!(db::get_active_season(&pool).await.unwrap().unwrap().year, 2024);
    }

    #[tokio::test]
    async fn seeded_ratings_follow_preseason_inputs() {
        let pool = db::test_pool().await;
        seed_data(&pool, 2024).await.unwrap();

        let georgia = db::get_team_by_name(&pool, "Georgia").await.unwrap().unwrap();
        assert_eq!(
            georgia.initial_rating,
            preseason_rating(ConferenceTier::P5, 2, 14, 0.55)
        );

        let mercer = db::get_team_by_name(&pool, "Mercer").await.unwrap().unwrap();
        assert_eq!(mercer.initial_rating, 1300.0);
    }
}
