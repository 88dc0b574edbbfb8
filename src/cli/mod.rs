use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::db;
use crate::services::{
    season_year, CancelFlag, EloEngine, IngestionPipeline, PredictionEngine, ProviderClient,
    RankingService,
};

async fn open() -> Result<(sqlx::SqlitePool, AppConfig)> {
    let pool = db::create_pool().await?;
    db::init_database_with_pool(&pool).await?;
    let config = db::load_config(&pool).await?.unwrap_or_default();
    Ok((pool, config))
}

fn ranking_service(pool: &sqlx::SqlitePool, config: &AppConfig) -> RankingService {
    RankingService::new(
        pool.clone(),
        Arc::new(Mutex::new(())),
        EloEngine::from_config(config),
    )
}

/// One-shot ingestion run, same path the background worker takes.
pub async fn run_update(year: Option<i64>) -> Result<()> {
    let (pool, config) = open().await?;
    let year = year.unwrap_or_else(|| season_year(Utc::now()));

    let provider = ProviderClient::from_config(pool.clone(), &config);
    if !provider.has_api_key() {
        println!("No CFB_PROVIDER_API_KEY set; aborting. Try `gridrank seed` for sample data.");
        return Ok(());
    }

    println!("Running update for season {}...", year);
    let pipeline = IngestionPipeline::new(
        pool.clone(),
        provider,
        ranking_service(&pool, &config),
        PredictionEngine::from_config(pool.clone(), &config),
        &config,
    );
    let summary = pipeline.run_once(year, &CancelFlag::default()).await?;

    println!("Update complete:");
    println!("  teams touched:         {}", summary.teams_updated);
    println!("  games imported:        {}", summary.games_imported);
    println!("  poll rows imported:    {}", summary.polls_imported);
    println!("  games processed:       {}", summary.games_processed);
    println!("  predictions created:   {}", summary.predictions_created);
    println!("  predictions evaluated: {}", summary.predictions_evaluated);
    Ok(())
}

/// Reset ratings to preseason and replay the whole season.
pub async fn recompute(year: Option<i64>) -> Result<()> {
    let (pool, config) = open().await?;
    let year = year.unwrap_or_else(|| season_year(Utc::now()));

    let service = ranking_service(&pool, &config);
    println!("Recomputing season {}...", year);
    let teams = service.reset_preseason(year).await?;
    let games = service.recompute_season(year).await?;
    println!("Reset {} teams and replayed {} games.", teams, games);
    Ok(())
}

/// Print the current ranking table.
pub async fn show_rankings(year: Option<i64>, limit: usize) -> Result<()> {
    let (pool, config) = open().await?;
    let year = match year {
        Some(year) => year,
        None => match db::get_active_season(&pool).await? {
            Some(season) => season.year,
            None => {
                println!("No active season. Run `gridrank update` or `gridrank seed` first.");
                return Ok(());
            }
        },
    };

    let service = ranking_service(&pool, &config);
    let rankings = service.get_current_rankings(year, Some(limit)).await?;
    if rankings.is_empty() {
        println!("No teams for season {}.", year);
        return Ok(());
    }

    println!("{} rankings", year);
    println!("{:>4}  {:<24} {:>8} {:>6} {:>9} {:>4}", "Rank", "Team", "Rating", "W-L", "SOS", "SoS#");
    for entry in &rankings {
        println!(
            "{:>4}  {:<24} {:>8.2} {:>6} {:>9} {:>4}",
            entry.rank,
            entry.name,
            entry.rating,
            format!("{}-{}", entry.wins, entry.losses),
            entry
                .sos
                .map(|s| format!("{:.2}", s))
                .unwrap_or_else(|| "-".to_string()),
            entry
                .sos_rank
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

/// Load the development fixture and process what is already final.
pub async fn seed(year: Option<i64>) -> Result<()> {
    let (pool, config) = open().await?;
    let year = year.unwrap_or_else(|| season_year(Utc::now()));

    db::seed::seed_data(&pool, year).await?;

    let pipeline = IngestionPipeline::new(
        pool.clone(),
        ProviderClient::from_config(pool.clone(), &config),
        ranking_service(&pool, &config),
        PredictionEngine::from_config(pool.clone(), &config),
        &config,
    );
    let (created, processed, evaluated) = pipeline.replay_new(year, &CancelFlag::default()).await?;
    println!(
        "Seeded season {}: {} games processed, {} predictions created, {} evaluated.",
        year, processed, created, evaluated
    );
    println!("Try `gridrank rankings` next.");
    Ok(())
}
