use chrono::{DateTime, Datelike, Timelike, Utc};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::models::{TaskTrigger, UpdateSummary, UpdateTask};
use crate::services::elo::EloEngine;
use crate::services::ingest::IngestionPipeline;
use crate::services::predictor::PredictionEngine;
use crate::services::provider::ProviderClient;
use crate::services::rankings::RankingService;

/// Cooperative cancellation signal. Honored between games and between
/// provider calls, never mid-transaction.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct QueuedTask {
    task_id: String,
    trigger: TaskTrigger,
    cancel: CancelFlag,
}

/// Front door for update tasks: creates the pending row, hands the task to
/// the single worker, answers status queries. Task rows are append-only audit
/// history.
#[derive(Clone)]
pub struct TaskRegistry {
    pool: SqlitePool,
    queue: mpsc::Sender<QueuedTask>,
}

impl TaskRegistry {
    pub fn new(pool: SqlitePool) -> (Self, mpsc::Receiver<QueuedTask>) {
        // One slot: the gate below rejects concurrent work anyway.
        let (queue, rx) = mpsc::channel(1);
        (Self { pool, queue }, rx)
    }

    pub async fn trigger_manual(&self) -> CoreResult<String> {
        self.trigger(TaskTrigger::Manual).await
    }

    pub async fn trigger_scheduled(&self) -> CoreResult<String> {
        self.trigger(TaskTrigger::Scheduled).await
    }

    async fn trigger(&self, trigger: TaskTrigger) -> CoreResult<String> {
        if db::any_task_active(&self.pool).await? {
            return Err(CoreError::TaskInProgress);
        }

        let task_id = Uuid::new_v4().to_string();
        db::insert_task(&self.pool, &task_id, trigger).await?;

        let queued = QueuedTask {
            task_id: task_id.clone(),
            trigger,
            cancel: CancelFlag::default(),
        };
        if self.queue.try_send(queued).is_err() {
            // Lost the race against another trigger; fail the orphaned row.
            db::task_mark_failed(&self.pool, &task_id, "task_in_progress: queue occupied").await?;
            return Err(CoreError::TaskInProgress);
        }

        tracing::info!("Update task {} queued ({})", task_id, trigger.as_str());
        Ok(task_id)
    }

    pub async fn task_status(&self, task_id: &str) -> CoreResult<Option<UpdateTask>> {
        db::get_task(&self.pool, task_id).await
    }
}

/// The single background worker. Drains the queue one task at a time, runs
/// pre-flight checks against the config snapshot taken at task start, then
/// drives the ingestion pipeline.
pub struct UpdateWorker {
    pool: SqlitePool,
    config: Arc<RwLock<AppConfig>>,
    writer_lock: Arc<Mutex<()>>,
}

impl UpdateWorker {
    pub fn new(
        pool: SqlitePool,
        config: Arc<RwLock<AppConfig>>,
        writer_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            pool,
            config,
            writer_lock,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<QueuedTask>) {
        while let Some(task) = rx.recv().await {
            self.execute(task).await;
        }
    }

    async fn execute(&self, task: QueuedTask) {
        let config = self.config.read().await.clone();

        if let Err(e) = db::task_mark_running(&self.pool, &task.task_id).await {
            tracing::error!("Could not start task {}: {}", task.task_id, e);
            return;
        }

        // Overall timeout issues cancellation rather than dropping the task
        // future, so no transaction is ever severed mid-flight.
        let watchdog = {
            let cancel = task.cancel.clone();
            let timeout = std::time::Duration::from_secs(config.task_timeout_secs);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!("Update task timed out after {:?}; cancelling", timeout);
                cancel.cancel();
            })
        };

        let outcome = self.run_task(&task, &config).await;
        watchdog.abort();

        let record = match outcome {
            Ok(Some(summary)) => {
                tracing::info!(
                    "Update task {} completed: {} games imported, {} processed, {} predictions created, {} evaluated",
                    task.task_id,
                    summary.games_imported,
                    summary.games_processed,
                    summary.predictions_created,
                    summary.predictions_evaluated
                );
                db::task_mark_completed(&self.pool, &task.task_id, &summary).await
            }
            Ok(None) => {
                // Scheduled trigger outside the active window: expected no-op.
                tracing::info!(
                    "Update task {} skipped: outside the active-season window",
                    task.task_id
                );
                db::task_mark_completed(&self.pool, &task.task_id, &UpdateSummary::default()).await
            }
            Err(e) => {
                if matches!(e, CoreError::Cancelled) {
                    tracing::info!("Update task {} cancelled", task.task_id);
                } else {
                    tracing::error!("Update task {} failed: {}", task.task_id, e);
                }
                db::task_mark_failed(&self.pool, &task.task_id, &format!("{}: {}", e.kind(), e))
                    .await
            }
        };
        if let Err(e) = record {
            tracing::error!("Could not record outcome for task {}: {}", task.task_id, e);
        }
    }

    async fn run_task(
        &self,
        task: &QueuedTask,
        config: &AppConfig,
    ) -> CoreResult<Option<UpdateSummary>> {
        // Pre-flight 1: active-season window.
        if !config.in_active_window(Utc::now()) {
            return match task.trigger {
                TaskTrigger::Scheduled => Ok(None),
                TaskTrigger::Manual => Err(CoreError::Validation(
                    "outside the active-season window".to_string(),
                )),
            };
        }

        let provider = ProviderClient::from_config(self.pool.clone(), config);
        let year = match db::get_active_season(&self.pool).await? {
            Some(season) => season.year,
            None => season_year(Utc::now()),
        };

        // Pre-flight 2: the provider must know what week it is.
        task.cancel.check()?;
        let week = provider.get_current_week(year).await?.ok_or_else(|| {
            CoreError::ProviderFatal(format!("provider reports no current week for {}", year))
        })?;

        // Pre-flight 3: usage below the block threshold.
        provider.ensure_quota().await?;

        let rankings = RankingService::new(
            self.pool.clone(),
            self.writer_lock.clone(),
            EloEngine::from_config(config),
        );
        let predictor = PredictionEngine::from_config(self.pool.clone(), config);
        let pipeline = IngestionPipeline::new(
            self.pool.clone(),
            provider,
            rankings,
            predictor,
            config,
        );

        let summary = pipeline.run_with_week(year, week, &task.cancel).await?;
        Ok(Some(summary))
    }
}

/// Season year for a date: fall belongs to the current calendar year, the
/// January tail belongs to the previous one.
pub fn season_year(now: DateTime<Utc>) -> i64 {
    if now.month() >= 7 {
        now.year() as i64
    } else {
        now.year() as i64 - 1
    }
}

pub fn spawn_update_worker(
    pool: SqlitePool,
    config: Arc<RwLock<AppConfig>>,
    writer_lock: Arc<Mutex<()>>,
    rx: mpsc::Receiver<QueuedTask>,
) {
    let worker = UpdateWorker::new(pool, config, writer_lock);
    tokio::spawn(worker.run(rx));
}

/// Minute-tick loop that fires `trigger_scheduled` at the configured weekday
/// and UTC wall-clock time, only inside the active window.
pub fn spawn_weekly_scheduler(registry: TaskRegistry, config: Arc<RwLock<AppConfig>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        let mut last_fired: Option<String> = None;

        loop {
            interval.tick().await;
            let config = config.read().await.clone();
            let now = Utc::now();

            if now.weekday() != config.update_weekday()
                || now.hour() != config.update_hour
                || now.minute() != config.update_minute
            {
                continue;
            }
            let stamp = now.format("%Y-%m-%d %H:%M").to_string();
            if last_fired.as_ref() == Some(&stamp) {
                continue;
            }
            last_fired = Some(stamp);

            if !config.in_active_window(now) {
                tracing::debug!("Weekly trigger skipped: outside active window");
                continue;
            }

            match registry.trigger_scheduled().await {
                Ok(task_id) => tracing::info!("Weekly update triggered: task {}", task_id),
                Err(CoreError::TaskInProgress) => {
                    tracing::warn!("Weekly trigger skipped: task already active")
                }
                Err(e) => tracing::error!("Weekly trigger failed: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonthDay;
    use crate::models::TaskStatus;
    use chrono::TimeZone;

    fn closed_window_config() -> AppConfig {
        // Single-day window pinned two days in the past, so now is outside it.
        let target = Utc::now() - chrono::Duration::days(2);
        AppConfig {
            season_start: MonthDay::new(target.month(), target.day()),
            season_end: MonthDay::new(target.month(), target.day()),
            ..AppConfig::default()
        }
    }

    #[test]
    fn cancel_flag_trips_once() {
        let flag = CancelFlag::default();
        assert!(flag.check().is_ok());
        flag.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn season_year_rolls_in_january() {
        let fall = Utc.with_ymd_and_hms(2024, 10, 5, 0, 0, 0).unwrap();
        assert_eq!(season_year(fall), 2024);
        let january = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(season_year(january), 2024);
    }

    #[tokio::test]
    async fn trigger_rejects_concurrent_tasks() {
        let pool = db::test_pool().await;
        let (registry, _rx) = TaskRegistry::new(pool.clone());

        let task_id = registry.trigger_manual().await.unwrap();
        let task = registry.task_status(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.trigger, TaskTrigger::Manual);

        let second = registry.trigger_manual().await;
        assert!(matches!(second, Err(CoreError::TaskInProgress)));
    }

    #[tokio::test]
    async fn trigger_allowed_after_terminal_state() {
        let pool = db::test_pool().await;
        let (registry, mut rx) = TaskRegistry::new(pool.clone());

        let first = registry.trigger_manual().await.unwrap();
        rx.recv().await.unwrap(); // drain the queue slot
        db::task_mark_running(&pool, &first).await.unwrap();
        db::task_mark_failed(&pool, &first, "provider_auth: 401").await.unwrap();

        let second = registry.trigger_scheduled().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn inactive_window_fails_manual_but_completes_scheduled() {
        let pool = db::test_pool().await;
        let config = Arc::new(RwLock::new(closed_window_config()));
        let worker = UpdateWorker::new(pool.clone(), config.clone(), Arc::new(Mutex::new(())));
        let (registry, mut rx) = TaskRegistry::new(pool.clone());

        // Manual trigger outside the window fails with a categorized reason.
        let manual_id = registry.trigger_manual().await.unwrap();
        let manual = rx.recv().await.unwrap();
        worker.execute(manual).await;
        let task = db::get_task(&pool, &manual_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("validation"));

        // Scheduled trigger is an expected no-op completion.
        let scheduled_id = registry.trigger_scheduled().await.unwrap();
        let scheduled = rx.recv().await.unwrap();
        worker.execute(scheduled).await;
        let task = db::get_task(&pool, &scheduled_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap().games_imported, 0);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_task_fails_with_cancelled_reason() {
        let pool = db::test_pool().await;
        // Window open so the task reaches the cancellation check.
        let config = Arc::new(RwLock::new(AppConfig {
            season_start: MonthDay::new(1, 1),
            season_end: MonthDay::new(12, 31),
            ..AppConfig::default()
        }));
        let worker = UpdateWorker::new(pool.clone(), config, Arc::new(Mutex::new(())));
        let (registry, mut rx) = TaskRegistry::new(pool.clone());

        let task_id = registry.trigger_manual().await.unwrap();
        let task = rx.recv().await.unwrap();
        task.cancel.cancel();
        worker.execute(task).await;

        let task = db::get_task(&pool, &task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("cancelled"));
    }
}
