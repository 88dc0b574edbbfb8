use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse conference strength class. Only used for the Elo conference
/// multiplier and the FCS exclusion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConferenceTier {
    P5,
    G5,
    #[serde(rename = "FCS")]
    Fcs,
}

impl ConferenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConferenceTier::P5 => "P5",
            ConferenceTier::G5 => "G5",
            ConferenceTier::Fcs => "FCS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P5" => Some(ConferenceTier::P5),
            "G5" => Some(ConferenceTier::G5),
            "FCS" => Some(ConferenceTier::Fcs),
            _ => None,
        }
    }

    pub fn is_fcs(&self) -> bool {
        matches!(self, ConferenceTier::Fcs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    Regular,
    ConferenceChampionship,
    Bowl,
    Playoff,
}

impl GameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::Regular => "regular",
            GameType::ConferenceChampionship => "conference_championship",
            GameType::Bowl => "bowl",
            GameType::Playoff => "playoff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(GameType::Regular),
            "conference_championship" => Some(GameType::ConferenceChampionship),
            "bowl" => Some(GameType::Bowl),
            "playoff" => Some(GameType::Playoff),
            _ => None,
        }
    }

    pub fn is_postseason(&self) -> bool {
        matches!(self, GameType::Bowl | GameType::Playoff)
    }
}

/// Sentinel recruiting/transfer rank meaning "unranked".
pub const UNRANKED: i64 = 999;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub tier: ConferenceTier,
    pub conference: String,
    pub recruiting_rank: i64,
    pub transfer_rank: i64,
    pub returning_production: f64,
    pub current_rating: f64,
    pub initial_rating: f64,
    pub wins: i64,
    pub losses: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Team {
    pub fn is_fcs(&self) -> bool {
        self.tier.is_fcs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: i64,
    pub season: i64,
    pub week: i64,
    pub home_id: i64,
    pub away_id: i64,
    pub home_score: i64,
    pub away_score: i64,
    pub is_neutral_site: bool,
    pub is_processed: bool,
    pub excluded_from_rankings: bool,
    pub game_type: GameType,
    pub postseason_name: Option<String>,
    pub game_date: Option<DateTime<Utc>>,
    pub home_rating_change: f64,
    pub away_rating_change: f64,
}

impl Game {
    /// A 0-0 scoreline means the game has not been played yet.
    pub fn has_result(&self) -> bool {
        !(self.home_score == 0 && self.away_score == 0)
    }

    /// Winning side's team id; `None` on a tie.
    pub fn winner_id(&self) -> Option<i64> {
        match self.home_score.cmp(&self.away_score) {
            std::cmp::Ordering::Greater => Some(self.home_id),
            std::cmp::Ordering::Less => Some(self.away_id),
            std::cmp::Ordering::Equal => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    pub id: i64,
    pub year: i64,
    pub current_week: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub id: i64,
    pub team_id: i64,
    pub season: i64,
    pub week: i64,
    pub rank: i64,
    pub rating: f64,
    pub wins: i64,
    pub losses: i64,
    pub sos: Option<f64>,
    pub sos_rank: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "High",
            Confidence::Medium => "Medium",
            Confidence::Low => "Low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "High" => Some(Confidence::High),
            "Medium" => Some(Confidence::Medium),
            "Low" => Some(Confidence::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub game_id: i64,
    pub predicted_winner_id: i64,
    pub predicted_home_score: i64,
    pub predicted_away_score: i64,
    pub home_win_probability: f64,
    pub away_win_probability: f64,
    pub pre_game_home_rating: f64,
    pub pre_game_away_rating: f64,
    pub confidence: Confidence,
    /// NULL until the game is processed; stays NULL for excluded games.
    pub was_correct: Option<bool>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApPollRanking {
    pub id: i64,
    pub season: i64,
    pub week: i64,
    pub rank: i64,
    pub team_id: i64,
    pub first_place_votes: i64,
    pub points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTrigger {
    Scheduled,
    Manual,
}

impl TaskTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskTrigger::Scheduled => "scheduled",
            TaskTrigger::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TaskTrigger::Scheduled),
            "manual" => Some(TaskTrigger::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Summary written into a completed task's result blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSummary {
    pub games_imported: u32,
    pub teams_updated: u32,
    pub polls_imported: u32,
    pub games_processed: u32,
    pub predictions_created: u32,
    pub predictions_evaluated: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTask {
    pub task_id: String,
    pub trigger: TaskTrigger,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<UpdateSummary>,
    pub error: Option<String>,
}

// Read-side composites

#[derive(Debug, Clone, Serialize)]
pub struct RankedTeam {
    pub rank: i64,
    pub team_id: i64,
    pub name: String,
    pub conference_tier: ConferenceTier,
    pub conference_name: String,
    pub rating: f64,
    pub wins: i64,
    pub losses: i64,
    pub sos: Option<f64>,
    pub sos_rank: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionAccuracy {
    pub total: i64,
    pub resolved: i64,
    pub correct: i64,
    pub percentage: f64,
}

/// ELO vs AP-poll baseline over resolved games where both predictors apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApComparison {
    pub season: i64,
    pub games_compared: i64,
    pub both_correct: i64,
    pub elo_only_correct: i64,
    pub ap_only_correct: i64,
    pub both_wrong: i64,
    pub elo_accuracy: f64,
    pub ap_accuracy: f64,
    pub weekly: Vec<WeeklyComparison>,
    pub disagreements: Vec<Disagreement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeeklyComparison {
    pub week: i64,
    pub games: i64,
    pub elo_correct: i64,
    pub ap_correct: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Disagreement {
    pub game_id: i64,
    pub week: i64,
    pub elo_pick: i64,
    pub ap_pick: i64,
    pub actual_winner: Option<i64>,
    pub elo_was_right: bool,
}

// API response envelope

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}
