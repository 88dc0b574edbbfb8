pub mod elo;
pub mod ingest;
pub mod predictor;
pub mod provider;
pub mod rankings;
pub mod scheduler;

pub use elo::{preseason_rating, EloEngine};
pub use ingest::IngestionPipeline;
pub use predictor::PredictionEngine;
pub use provider::ProviderClient;
pub use rankings::RankingService;
pub use scheduler::{
    season_year, spawn_update_worker, spawn_weekly_scheduler, CancelFlag, TaskRegistry,
    UpdateWorker,
};
