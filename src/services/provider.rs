use chrono::{DateTime, Utc};
use rand::RngExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::env;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::utils::{month_key, usage_percentage, warning_level};

const DEFAULT_BASE_URL: &str = "https://api.collegefootballdata.com";
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;

// ── Provider response types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTeam {
    pub school: String,
    pub conference: Option<String>,
    /// "fbs" or "fcs"; absent for lower divisions.
    pub classification: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderGame {
    pub season: i64,
    pub week: i64,
    pub season_type: String,
    pub start_date: Option<DateTime<Utc>>,
    pub neutral_site: Option<bool>,
    pub home_team: String,
    pub home_points: Option<i64>,
    pub away_team: String,
    pub away_points: Option<i64>,
    /// Bowl/playoff name when the provider knows one.
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTeamRank {
    pub team: String,
    pub rank: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReturningProduction {
    pub team: String,
    /// Share of production returning, 0..=1.
    pub overall: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPollWeek {
    pub season: i64,
    pub week: i64,
    pub polls: Vec<ProviderPoll>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPoll {
    pub poll: String,
    pub ranks: Vec<ProviderPollRank>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPollRank {
    pub rank: i64,
    pub school: String,
    pub first_place_votes: Option<i64>,
    pub points: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCalendarWeek {
    pub week: i64,
    pub season_type: String,
    pub last_game_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonType {
    Regular,
    Postseason,
}

impl SeasonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeasonType::Regular => "regular",
            SeasonType::Postseason => "postseason",
        }
    }
}

/// Monthly usage rollup served by the admin endpoints and consulted by the
/// scheduler pre-flight.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub month: String,
    pub total_calls: i64,
    pub limit: u32,
    pub percentage_used: f64,
    pub remaining: i64,
    pub average_per_day: f64,
    pub warning_level: String,
    pub top_endpoints: Vec<(String, i64)>,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// The only component that performs network I/O. Every request consults and
/// then increments the monthly usage counter; refresh traffic is refused once
/// the configured threshold is crossed.
pub struct ProviderClient {
    client: Client,
    pool: SqlitePool,
    base_url: String,
    api_key: Option<String>,
    monthly_limit: u32,
    block_threshold: f64,
    warning_thresholds: Vec<f64>,
    timeout: Duration,
    max_retries: u32,
}

impl ProviderClient {
    pub fn from_config(pool: SqlitePool, config: &AppConfig) -> Self {
        let base_url =
            env::var("CFB_PROVIDER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = env::var("CFB_PROVIDER_API_KEY").ok();
        Self {
            client: Client::new(),
            pool,
            base_url,
            api_key,
            monthly_limit: config.monthly_api_limit,
            block_threshold: config.quota_block_threshold,
            warning_thresholds: config.warning_thresholds.clone(),
            timeout: Duration::from_secs(config.provider_timeout_secs),
            max_retries: config.provider_max_retries,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    // ── Quota gate ───────────────────────────────────────────────────────────

    /// Refuse refresh traffic once monthly usage reaches the block threshold.
    pub async fn ensure_quota(&self) -> CoreResult<()> {
        let month = month_key(Utc::now());
        let used = db::monthly_call_count(&self.pool, &month).await?;
        let percentage = usage_percentage(used, self.monthly_limit);
        if percentage >= self.block_threshold {
            return Err(CoreError::QuotaExhausted(format!(
                "{} calls in {} is {:.1}% of the {} limit",
                used, month, percentage, self.monthly_limit
            )));
        }
        Ok(())
    }

    /// Record one call and log any soft warning threshold crossed by it.
    /// Counts only grow within a month, so each threshold fires once.
    async fn record_call(&self, endpoint: &str, duration: Duration) -> CoreResult<()> {
        let month = month_key(Utc::now());
        db::record_api_call(&self.pool, &month, endpoint, duration.as_millis() as i64).await?;

        let used = db::monthly_call_count(&self.pool, &month).await?;
        let before = usage_percentage(used - 1, self.monthly_limit);
        let after = usage_percentage(used, self.monthly_limit);
        for threshold in &self.warning_thresholds {
            if before < *threshold && after >= *threshold {
                tracing::warn!(
                    "Provider usage crossed {:.0}% for {} ({}/{} calls)",
                    threshold,
                    month,
                    used,
                    self.monthly_limit
                );
            }
        }
        Ok(())
    }

    pub async fn usage_summary(&self, month: Option<String>) -> CoreResult<UsageSummary> {
        usage_summary(
            &self.pool,
            self.monthly_limit,
            &self.warning_thresholds,
            month,
        )
        .await
    }

    // ── Transport ────────────────────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, path: &str) -> CoreResult<T> {
        let url = format!("{}{}", self.base_url, path);

        let mut attempt = 0u32;
        loop {
            self.ensure_quota().await?;

            let started = std::time::Instant::now();
            let outcome = self.send(&url).await;
            self.record_call(endpoint, started.elapsed()).await?;

            match outcome {
                Ok(body) => {
                    return serde_json::from_str(&body).map_err(|e| {
                        CoreError::ProviderFatal(format!("malformed response from {}: {}", path, e))
                    });
                }
                Err(err) if err.is_transient() && attempt + 1 < self.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        "Provider call {} failed ({}), retry {}/{} in {:?}",
                        path,
                        err,
                        attempt,
                        self.max_retries - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send(&self, url: &str) -> CoreResult<String> {
        let mut request = self.client.get(url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                CoreError::ProviderTransient(e.to_string())
            } else {
                CoreError::ProviderFatal(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CoreError::ProviderAuth(format!("HTTP {} from provider", status)));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CoreError::ProviderTransient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::ProviderFatal(format!("HTTP {}: {}", status, body)));
        }

        response
            .text()
            .await
            .map_err(|e| CoreError::ProviderTransient(e.to_string()))
    }

    // ── Endpoints ────────────────────────────────────────────────────────────

    pub async fn get_teams(&self, year: i64) -> CoreResult<Vec<ProviderTeam>> {
        self.get_json("teams", &format!("/teams/fbs?year={}", year)).await
    }

    pub async fn get_games(
        &self,
        year: i64,
        season_type: SeasonType,
        week: Option<i64>,
    ) -> CoreResult<Vec<ProviderGame>> {
        let mut path = format!("/games?year={}&seasonType={}", year, season_type.as_str());
        if let Some(week) = week {
            path.push_str(&format!("&week={}", week));
        }
        self.get_json("games", &path).await
    }

    pub async fn get_recruiting(&self, year: i64) -> CoreResult<Vec<ProviderTeamRank>> {
        self.get_json("recruiting", &format!("/recruiting/teams?year={}", year))
            .await
    }

    pub async fn get_transfer_portal(&self, year: i64) -> CoreResult<Vec<ProviderTeamRank>> {
        self.get_json("transfer_portal", &format!("/player/portal/teams?year={}", year))
            .await
    }

    pub async fn get_returning_production(
        &self,
        year: i64,
    ) -> CoreResult<Vec<ProviderReturningProduction>> {
        self.get_json(
            "returning_production",
            &format!("/player/returning?year={}", year),
        )
        .await
    }

    pub async fn get_ap_poll(&self, year: i64, week: i64) -> CoreResult<Vec<ProviderPollWeek>> {
        self.get_json(
            "rankings",
            &format!("/rankings?year={}&week={}&seasonType=regular", year, week),
        )
        .await
    }

    /// Regular-season week containing (or next after) now; `None` once the
    /// calendar is exhausted.
    pub async fn get_current_week(&self, year: i64) -> CoreResult<Option<i64>> {
        let calendar: Vec<ProviderCalendarWeek> =
            self.get_json("calendar", &format!("/calendar?year={}", year)).await?;
        let now = Utc::now();
        Ok(calendar
            .iter()
            .filter(|w| w.season_type == "regular")
            .filter(|w| w.last_game_start.map(|d| d >= now).unwrap_or(false))
            .map(|w| w.week)
            .min())
    }
}

/// Jittered exponential backoff: 500ms, 1s, 2s... plus up to 250ms of noise.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1));
    let jitter: u64 = rand::rng().random_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Rollup used by both the client and the admin read endpoints (which must
/// work even when no client is constructed).
pub async fn usage_summary(
    pool: &SqlitePool,
    limit: u32,
    warning_thresholds: &[f64],
    month: Option<String>,
) -> CoreResult<UsageSummary> {
    let now = Utc::now();
    let month = month.unwrap_or_else(|| month_key(now));
    let total_calls = db::monthly_call_count(pool, &month).await?;
    let percentage_used = usage_percentage(total_calls, limit);

    // Average over elapsed days when summarizing the current month, the whole
    // month otherwise.
    let elapsed_days = if month == month_key(now) {
        chrono::Datelike::day(&now) as f64
    } else {
        crate::utils::parse_month_key(&month)
            .and_then(|(y, m)| crate::utils::days_in_month(y, m))
            .unwrap_or(30) as f64
    };
    let average_per_day = if elapsed_days > 0.0 {
        total_calls as f64 / elapsed_days
    } else {
        0.0
    };

    Ok(UsageSummary {
        total_calls,
        limit,
        percentage_used,
        remaining: (limit as i64 - total_calls).max(0),
        average_per_day,
        warning_level: warning_level(percentage_used, warning_thresholds),
        top_endpoints: db::top_endpoints(pool, &month, 5).await?,
        month,
    })
}
