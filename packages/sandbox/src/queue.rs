// ABOUTME: Durable SQLite job queue with bounded retries and a pool of async workers draining it
// ABOUTME: Workers wake on enqueue or on a poll interval and stop through a shared running flag

use crate::jobs::{Job, JobRunner};
use crate::storage::{parse_timestamp, timestamp, Result, StorageError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const MAX_ATTEMPTS: i64 = 3;
const BACKOFF_UNIT_SECS: i64 = 5;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidValue(format!("queue status {}", s))),
        }
    }
}

/// A claimed job. `attempts` counts this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: i64,
    pub job: Job,
    pub attempts: i64,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub kind: String,
    pub status: QueueStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub run_at: chrono::DateTime<Utc>,
}

/// Delay before the next attempt: `attempts² × 5s`.
pub fn backoff(attempts: i64) -> chrono::Duration {
    chrono::Duration::seconds(attempts * attempts * BACKOFF_UNIT_SECS)
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    wake: Arc<Notify>,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            wake: Arc::new(Notify::new()),
        }
    }

    pub async fn enqueue(&self, job: &Job) -> Result<i64> {
        let now = timestamp(Utc::now());
        let payload = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (kind, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
            VALUES (?1, ?2, 'queued', 0, ?3, ?4, ?4, ?4)
            "#,
        )
        .bind(job.name())
        .bind(&payload)
        .bind(MAX_ATTEMPTS)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Queued {} job {} for sandbox {}", job.name(), id, job.sandbox_id());
        self.wake.notify_one();
        Ok(id)
    }

    /// Atomically move the oldest due job to `running`. Unreadable payloads are failed and skipped.
    pub async fn claim_next(&self) -> Result<Option<QueuedJob>> {
        loop {
            let now = timestamp(Utc::now());
            let row = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'running', attempts = attempts + 1, updated_at = ?1
                WHERE id = (
                    SELECT id FROM jobs
                    WHERE status = 'queued' AND run_at <= ?1
                    ORDER BY run_at, id
                    LIMIT 1
                )
                RETURNING id, payload, attempts, max_attempts
                "#,
            )
            .bind(&now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let id: i64 = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;

            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => {
                    return Ok(Some(QueuedJob {
                        id,
                        job,
                        attempts: row.try_get("attempts")?,
                        max_attempts: row.try_get("max_attempts")?,
                    }))
                }
                Err(e) => {
                    warn!("Discarding job {} with unreadable payload: {}", id, e);
                    self.mark(id, QueueStatus::Failed, Some(&e.to_string()))
                        .await?;
                }
            }
        }
    }

    pub async fn complete(&self, id: i64) -> Result<()> {
        self.mark(id, QueueStatus::Done, None).await
    }

    /// Fail permanently, whatever attempts remain.
    pub async fn fail(&self, job: &QueuedJob, error: &str) -> Result<()> {
        self.mark(job.id, QueueStatus::Failed, Some(error)).await?;
        warn!(
            "Job {} ({}) failed without retry: {}",
            job.id,
            job.job.name(),
            error
        );
        Ok(())
    }

    /// Requeue with backoff, or fail permanently once attempts are used up.
    /// Returns whether the job will run again.
    pub async fn retry_or_fail(&self, job: &QueuedJob, error: &str) -> Result<bool> {
        if job.attempts >= job.max_attempts {
            self.mark(job.id, QueueStatus::Failed, Some(error)).await?;
            warn!(
                "Job {} ({}) failed after {} attempts: {}",
                job.id,
                job.job.name(),
                job.attempts,
                error
            );
            return Ok(false);
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', run_at = ?1, last_error = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(timestamp(now + backoff(job.attempts)))
        .bind(error)
        .bind(timestamp(now))
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        debug!(
            "Job {} will retry in {}s",
            job.id,
            backoff(job.attempts).num_seconds()
        );
        Ok(true)
    }

    /// Requeue jobs a crashed process left `running`.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', updated_at = ?1 WHERE status = 'running'",
        )
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Recovered {} interrupted job(s)", recovered);
            self.wake.notify_one();
        }
        Ok(recovered)
    }

    pub async fn get(&self, id: i64) -> Result<JobRecord> {
        let row = sqlx::query(
            "SELECT id, kind, status, attempts, last_error, run_at FROM jobs WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))?;

        let status: String = row.try_get("status")?;
        let run_at: String = row.try_get("run_at")?;
        Ok(JobRecord {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            status: QueueStatus::from_str(&status)?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            run_at: parse_timestamp(&run_at)?,
        })
    }

    /// Jobs waiting to run, due or not.
    pub async fn pending_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn mark(&self, id: i64, status: QueueStatus, error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn wait(&self, poll: Duration) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Run one claimed job and record the outcome in the queue.
async fn process(queue: &JobQueue, runner: &JobRunner, claimed: QueuedJob) -> Result<()> {
    debug!(
        "Worker picked job {} ({}, attempt {})",
        claimed.id,
        claimed.job.name(),
        claimed.attempts
    );
    match runner.run(&claimed.job).await {
        Ok(()) => queue.complete(claimed.id).await,
        Err(e) if !e.is_retryable() => queue.fail(&claimed, &e.to_string()).await,
        Err(e) => queue
            .retry_or_fail(&claimed, &e.to_string())
            .await
            .map(|_| ()),
    }
}

/// Pool of workers consuming the queue
pub struct WorkerPool {
    queue: JobQueue,
    runner: Arc<JobRunner>,
    workers: usize,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, runner: Arc<JobRunner>, workers: usize) -> Self {
        Self {
            queue,
            runner,
            workers: workers.max(1),
            poll_interval: POLL_INTERVAL,
            running: Arc::new(RwLock::new(false)),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Recover interrupted jobs and spawn the workers.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        self.queue.recover_interrupted().await?;

        let mut handles = self.handles.lock().await;
        for worker in 0..self.workers {
            let queue = self.queue.clone();
            let runner = self.runner.clone();
            let running = self.running.clone();
            let poll = self.poll_interval;

            handles.push(tokio::spawn(async move {
                debug!("Worker {} started", worker);
                loop {
                    if !*running.read().await {
                        break;
                    }
                    match queue.claim_next().await {
                        Ok(Some(claimed)) => {
                            if let Err(e) = process(&queue, &runner, claimed).await {
                                error!("Worker {} failed to record job outcome: {}", worker, e);
                            }
                        }
                        Ok(None) => queue.wait(poll).await,
                        Err(e) => {
                            error!("Worker {} failed to claim a job: {}", worker, e);
                            tokio::time::sleep(poll).await;
                        }
                    }
                }
                debug!("Worker {} stopped", worker);
            }));
        }
        info!("Started {} job worker(s)", self.workers);
        Ok(())
    }

    /// Stop the workers after their current job.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.queue.wake.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Job workers stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run every due job in this task until none is left. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut ran = 0;
        while let Some(claimed) = self.queue.claim_next().await? {
            process(&self.queue, &self.runner, claimed).await?;
            ran += 1;
        }
        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_pool;

    async fn queue() -> JobQueue {
        JobQueue::new(test_pool().await)
    }

    #[test]
    fn test_backoff_grows_quadratically() {
        assert_eq!(backoff(1).num_seconds(), 5);
        assert_eq!(backoff(2).num_seconds(), 20);
        assert_eq!(backoff(3).num_seconds(), 45);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let queue = queue().await;
        let first = queue.enqueue(&Job::Start { sandbox_id: 1 }).await.unwrap();
        let second = queue.enqueue(&Job::Stop { sandbox_id: 2 }).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.job, Job::Start { sandbox_id: 1 });
        assert_eq!(claimed.attempts, 1);

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_backs_off_then_fails() {
        let queue = queue().await;
        let id = queue.enqueue(&Job::Start { sandbox_id: 1 }).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert!(queue.retry_or_fail(&claimed, "boom").await.unwrap());

        let record = queue.get(id).await.unwrap();
        assert_eq!(record.status, QueueStatus::Queued);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert!(record.run_at > Utc::now());
        // Not due yet.
        assert!(queue.claim_next().await.unwrap().is_none());

        let exhausted = QueuedJob {
            attempts: MAX_ATTEMPTS,
            ..claimed
        };
        assert!(!queue.retry_or_fail(&exhausted, "still broken").await.unwrap());
        let record = queue.get(id).await.unwrap();
        assert_eq!(record.status, QueueStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("still broken"));
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues_running() {
        let queue = queue().await;
        let id = queue.enqueue(&Job::Stop { sandbox_id: 3 }).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        assert_eq!(queue.recover_interrupted().await.unwrap(), 1);

        assert_eq!(queue.get(id).await.unwrap().status, QueueStatus::Queued);
        let again = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_skipped() {
        let queue = queue().await;
        let now = timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO jobs (kind, payload, run_at, created_at, updated_at) VALUES ('bogus', 'not json', ?1, ?1, ?1)",
        )
        .bind(&now)
        .execute(&queue.pool)
        .await
        .unwrap();
        let good = queue.enqueue(&Job::Start { sandbox_id: 9 }).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();

        assert_eq!(claimed.id, good);
        assert_eq!(queue.get(1).await.unwrap().status, QueueStatus::Failed);
    }
}
