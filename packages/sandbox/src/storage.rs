// ABOUTME: Storage layer for users' mesh identity, sandboxes, job guards and routes
// ABOUTME: SQLite via sqlx with partial unique indexes backing port and name uniqueness

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Host ports handed out for sandbox SSH forwarding.
pub const SSH_PORT_RANGE: RangeInclusive<u16> = 2201..=2299;

/// Second octets handed out for per-user mesh subnets.
pub const MESH_SUBNET_OCTETS: RangeInclusive<u8> = 100..=199;

/// Re-allocation attempts when a concurrent write takes the chosen port or subnet.
const ALLOCATION_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Capacity exhausted: {0}")]
    Capacity(String),
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Destroyed,
}

impl SandboxStatus {
    pub const ALL: [SandboxStatus; 4] = [
        Self::Pending,
        Self::Running,
        Self::Stopped,
        Self::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "destroyed" => Ok(Self::Destroyed),
            _ => Err(StorageError::InvalidValue(format!("sandbox status {}", s))),
        }
    }

    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Pending, Running)
                    | (Pending, Stopped)
                    | (Pending, Destroyed)
                    | (Running, Stopped)
                    | (Running, Destroyed)
                    | (Stopped, Running)
                    | (Stopped, Destroyed)
            )
    }

    pub fn is_active(&self) -> bool {
        *self != Self::Destroyed
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The in-flight operation recorded on a sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Creating,
    Starting,
    Stopping,
    Destroying,
    Snapshotting,
    Restoring,
    OpeningTerminal,
    OpeningVnc,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Destroying => "destroying",
            Self::Snapshotting => "snapshotting",
            Self::Restoring => "restoring",
            Self::OpeningTerminal => "opening_terminal",
            Self::OpeningVnc => "opening_vnc",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "starting" => Ok(Self::Starting),
            "stopping" => Ok(Self::Stopping),
            "destroying" => Ok(Self::Destroying),
            "snapshotting" => Ok(Self::Snapshotting),
            "restoring" => Ok(Self::Restoring),
            "opening_terminal" => Ok(Self::OpeningTerminal),
            "opening_vnc" => Ok(Self::OpeningVnc),
            _ => Err(StorageError::InvalidValue(format!("job status {}", s))),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeshState {
    Disabled,
    Pending,
    Enabled,
}

impl MeshState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Pending => "pending",
            Self::Enabled => "enabled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "pending" => Ok(Self::Pending),
            "enabled" => Ok(Self::Enabled),
            _ => Err(StorageError::InvalidValue(format!("mesh state {}", s))),
        }
    }
}

/// A user's mesh subnet, `172.<octet>.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshSubnet(u8);

impl MeshSubnet {
    pub fn new(octet: u8) -> Result<Self> {
        if MESH_SUBNET_OCTETS.contains(&octet) {
            Ok(Self(octet))
        } else {
            Err(StorageError::InvalidValue(format!("mesh subnet octet {}", octet)))
        }
    }

    pub fn octet(&self) -> u8 {
        self.0
    }

    pub fn cidr(&self) -> String {
        format!("172.{}.0.0/16", self.0)
    }

    pub fn gateway(&self) -> String {
        format!("172.{}.0.1", self.0)
    }

    /// Leading text every address in the subnet starts with.
    pub fn prefix(&self) -> String {
        format!("172.{}.", self.0)
    }
}

impl std::fmt::Display for MeshSubnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cidr())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub ssh_public_key: Option<String>,
    pub admin: bool,
    pub mesh_state: MeshState,
    pub mesh_sidecar: Option<String>,
    pub mesh_network: Option<String>,
    #[serde(skip_serializing)]
    pub mesh_auth_key: Option<String>,
    pub mesh_auto_connect: bool,
    pub mesh_login_url: Option<String>,
    pub mesh_subnet: Option<MeshSubnet>,
    /// The sidecar's address inside the tailnet, once authenticated
    pub mesh_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: i64,
    pub user_id: i64,
    /// Owner's user name, joined from `users`
    pub owner_name: String,
    pub name: String,
    pub status: SandboxStatus,
    pub container_id: Option<String>,
    pub image: String,
    pub ssh_port: u16,

    // Storage options
    pub persistent_volume: bool,
    pub volume_path: Option<String>,
    pub mount_home: bool,
    pub data_path: Option<String>,

    pub mesh: bool,
    pub temporary: bool,

    // Single-flight job tracking
    pub job_status: Option<JobKind>,
    pub job_error: Option<String>,
    pub job_started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sandbox {
    /// Runtime instance name and hostname: `<owner>-<name>`.
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.owner_name, self.name)
    }

    pub fn instance(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSandbox {
    pub user_id: i64,
    pub name: String,
    pub image: String,
    pub persistent_volume: bool,
    pub volume_path: Option<String>,
    pub mount_home: bool,
    pub data_path: Option<String>,
    pub mesh: bool,
    pub temporary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    pub user_id: Option<i64>,
    pub status: Option<SandboxStatus>,
    pub include_destroyed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub id: i64,
    pub sandbox_id: i64,
    pub domain: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

/// A held job slot: the kind and the start stamp written when it was taken.
/// Finishing or failing only clears the slot while both still match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLease {
    pub sandbox_id: i64,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
}

impl JobLease {
    /// The lease the sandbox row currently shows, if a job holds it.
    pub fn held_on(sandbox: &Sandbox) -> Option<Self> {
        Some(Self {
            sandbox_id: sandbox.id,
            kind: sandbox.job_status?,
            started_at: sandbox.job_started_at?,
        })
    }
}

pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidValue(format!("timestamp {}: {}", raw, e)))
}

fn lease(sandbox_id: i64, kind: JobKind, stamp: &str) -> Result<JobLease> {
    Ok(JobLease {
        sandbox_id,
        kind,
        started_at: parse_timestamp(stamp)?,
    })
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn unique_violation(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) if db.is_unique_violation() => Some(db.message().to_string()),
        _ => None,
    }
}

/// Open (creating if needed) the SQLite database behind `url`.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    Ok(SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const SANDBOX_SELECT: &str = r#"
    SELECT s.id, s.user_id, u.name AS owner_name, s.name, s.status, s.container_id,
           s.image, s.ssh_port, s.persistent_volume, s.volume_path, s.mount_home,
           s.data_path, s.mesh, s.temporary, s.job_status, s.job_error,
           s.job_started_at, s.created_at, s.updated_at
    FROM sandboxes s
    JOIN users u ON u.id = s.user_id
"#;

const USER_SELECT: &str = r#"
    SELECT id, name, ssh_public_key, admin, mesh_state, mesh_sidecar, mesh_network,
           mesh_auth_key, mesh_auto_connect, mesh_login_url, mesh_subnet, mesh_ip,
           created_at, updated_at
    FROM users
"#;

#[derive(Clone)]
pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // SANDBOX OPERATIONS
    // ========================================================================

    /// Insert a `pending` sandbox on the lowest free SSH port.
    pub async fn create_sandbox(&self, new: &NewSandbox) -> Result<Sandbox> {
        for attempt in 1..=ALLOCATION_ATTEMPTS {
            let port = self.next_free_port().await?;
            let now = timestamp(Utc::now());

            let result = sqlx::query(
                r#"
                INSERT INTO sandboxes (
                    user_id, name, status, image, ssh_port,
                    persistent_volume, volume_path, mount_home, data_path,
                    mesh, temporary, created_at, updated_at
                ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                "#,
            )
            .bind(new.user_id)
            .bind(&new.name)
            .bind(&new.image)
            .bind(i64::from(port))
            .bind(new.persistent_volume)
            .bind(&new.volume_path)
            .bind(new.mount_home)
            .bind(&new.data_path)
            .bind(new.mesh)
            .bind(new.temporary)
            .bind(&now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => return self.get_sandbox(done.last_insert_rowid()).await,
                Err(e) => match unique_violation(&e) {
                    Some(message) if message.contains("ssh_port") => {
                        warn!(
                            "SSH port {} taken concurrently (attempt {}), reallocating",
                            port, attempt
                        );
                    }
                    Some(_) => {
                        return Err(StorageError::Conflict(format!(
                            "Sandbox {} already exists",
                            new.name
                        )))
                    }
                    None => return Err(e.into()),
                },
            }
        }

        Err(StorageError::Capacity(
            "SSH port allocation kept colliding".to_string(),
        ))
    }

    async fn next_free_port(&self) -> Result<u16> {
        let rows = sqlx::query("SELECT ssh_port FROM sandboxes WHERE status != 'destroyed'")
            .fetch_all(&self.pool)
            .await?;
        let used: HashSet<i64> = rows.iter().map(|r| r.get::<i64, _>("ssh_port")).collect();

        SSH_PORT_RANGE
            .into_iter()
            .find(|port| !used.contains(&i64::from(*port)))
            .ok_or_else(|| StorageError::Capacity("No free SSH ports available".to_string()))
    }

    pub async fn get_sandbox(&self, id: i64) -> Result<Sandbox> {
        let row = sqlx::query(&format!("{} WHERE s.id = ?1", SANDBOX_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.row_to_sandbox(row),
            None => Err(StorageError::NotFound(format!("sandbox {}", id))),
        }
    }

    /// Non-destroyed sandbox `name` owned by `user_id`.
    pub async fn find_active_sandbox(&self, user_id: i64, name: &str) -> Result<Option<Sandbox>> {
        let row = sqlx::query(&format!(
            "{} WHERE s.user_id = ?1 AND s.name = ?2 AND s.status != 'destroyed'",
            SANDBOX_SELECT
        ))
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_sandbox(r)).transpose()
    }

    pub async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        let mut query = format!("{} WHERE 1=1", SANDBOX_SELECT);

        let mut param_count = 0;
        if filter.user_id.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND s.user_id = ?{}", param_count));
        }
        if filter.status.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND s.status = ?{}", param_count));
        } else if !filter.include_destroyed {
            query.push_str(" AND s.status != 'destroyed'");
        }
        query.push_str(" ORDER BY s.id");

        let mut q = sqlx::query(&query);
        if let Some(uid) = filter.user_id {
            q = q.bind(uid);
        }
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(|row| self.row_to_sandbox(row)).collect()
    }

    /// Active sandboxes that have a runtime instance.
    pub async fn list_active_with_instance(&self) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(&format!(
            "{} WHERE s.status != 'destroyed' AND s.container_id IS NOT NULL ORDER BY s.id",
            SANDBOX_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.row_to_sandbox(row)).collect()
    }

    /// Active sandboxes of a user currently attached to the mesh.
    pub async fn list_mesh_sandboxes(&self, user_id: i64) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(&format!(
            "{} WHERE s.user_id = ?1 AND s.mesh = 1 AND s.status != 'destroyed' ORDER BY s.id",
            SANDBOX_SELECT
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.row_to_sandbox(row)).collect()
    }

    pub async fn set_container(&self, id: i64, container_id: Option<&str>) -> Result<()> {
        let result =
            sqlx::query("UPDATE sandboxes SET container_id = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(container_id)
                .bind(timestamp(Utc::now()))
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("sandbox {}", id)));
        }
        Ok(())
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub async fn update_status(&self, id: i64, next: SandboxStatus) -> Result<()> {
        let current = self.get_sandbox(id).await?.status;
        if !current.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                from: current.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if next == SandboxStatus::Destroyed {
            return self.mark_destroyed(id, None).await;
        }

        let result = sqlx::query(
            "UPDATE sandboxes SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(next.as_str())
        .bind(timestamp(Utc::now()))
        .bind(id)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "sandbox {} changed status concurrently",
                id
            )));
        }
        debug!("Sandbox {} status {} -> {}", id, current, next);
        Ok(())
    }

    /// Terminal transition: clears the instance ref and mesh flag in one statement.
    /// A held job slot stays with its lease holder.
    pub async fn mark_destroyed(&self, id: i64, job_error: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = 'destroyed', container_id = NULL, mesh = 0,
                job_error = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(job_error)
        .bind(timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("sandbox {}", id)));
        }
        debug!("Sandbox {} marked destroyed", id);
        Ok(())
    }

    pub async fn set_mesh_flag(&self, id: i64, mesh: bool) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET mesh = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(mesh)
            .bind(timestamp(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_mesh_flags_for_user(&self, user_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sandboxes SET mesh = 0, updated_at = ?1 WHERE user_id = ?2 AND mesh = 1 AND status != 'destroyed'",
        )
        .bind(timestamp(Utc::now()))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_by_status(&self) -> Result<Vec<(SandboxStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sandboxes GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = Vec::new();
        for status in SandboxStatus::ALL {
            let n = rows
                .iter()
                .find(|r| r.get::<String, _>("status") == status.as_str())
                .map(|r| r.get::<i64, _>("n"))
                .unwrap_or(0);
            counts.push((status, n));
        }
        Ok(counts)
    }

    // ========================================================================
    // JOB GUARD
    // ========================================================================

    /// Claim the single-flight slot. Fails with Conflict when another job holds it.
    pub async fn reserve_job(&self, id: i64, kind: JobKind) -> Result<JobLease> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET job_status = ?1, job_error = NULL, job_started_at = ?2, updated_at = ?2
            WHERE id = ?3 AND job_status IS NULL
            "#,
        )
        .bind(kind.as_str())
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let sandbox = self.get_sandbox(id).await?;
            return Err(StorageError::Conflict(format!(
                "{} is busy ({})",
                sandbox.full_name(),
                sandbox
                    .job_status
                    .map(|k| k.as_str())
                    .unwrap_or("unknown")
            )));
        }
        lease(id, kind, &now)
    }

    /// Mark the job as started by a worker, accepting a slot reserved for the same kind.
    /// The returned lease supersedes the reservation's.
    pub async fn begin_job(&self, id: i64, kind: JobKind) -> Result<JobLease> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET job_status = ?1, job_error = NULL, job_started_at = ?2, updated_at = ?2
            WHERE id = ?3 AND (job_status IS NULL OR job_status = ?1)
            "#,
        )
        .bind(kind.as_str())
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get_sandbox(id).await?;
            return Err(StorageError::Conflict(format!(
                "sandbox {} is running another job",
                id
            )));
        }
        lease(id, kind, &now)
    }

    /// Release the slot. Returns false when the lease was already reaped or replaced.
    pub async fn finish_job(&self, lease: &JobLease) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET job_status = NULL, job_error = NULL, job_started_at = NULL, updated_at = ?1
            WHERE id = ?2 AND job_status = ?3 AND job_started_at = ?4
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(lease.sandbox_id)
        .bind(lease.kind.as_str())
        .bind(timestamp(lease.started_at))
        .execute(&self.pool)
        .await?;
        Ok(self.released(lease, result.rows_affected()))
    }

    /// Release the slot and record the error, under the same lease rule as `finish_job`.
    pub async fn fail_job(&self, lease: &JobLease, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET job_status = NULL, job_started_at = NULL, job_error = ?1, updated_at = ?2
            WHERE id = ?3 AND job_status = ?4 AND job_started_at = ?5
            "#,
        )
        .bind(error)
        .bind(timestamp(Utc::now()))
        .bind(lease.sandbox_id)
        .bind(lease.kind.as_str())
        .bind(timestamp(lease.started_at))
        .execute(&self.pool)
        .await?;
        Ok(self.released(lease, result.rows_affected()))
    }

    fn released(&self, lease: &JobLease, rows: u64) -> bool {
        if rows == 0 {
            warn!(
                "Job slot on sandbox {} no longer held by {} started at {}",
                lease.sandbox_id,
                lease.kind,
                timestamp(lease.started_at)
            );
        }
        rows > 0
    }

    /// Sandboxes whose job started before `started_before`.
    pub async fn list_stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(&format!(
            "{} WHERE s.job_status IS NOT NULL AND s.job_started_at < ?1 ORDER BY s.id",
            SANDBOX_SELECT
        ))
        .bind(timestamp(started_before))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.row_to_sandbox(row)).collect()
    }

    // ========================================================================
    // USER OPERATIONS
    // ========================================================================

    pub async fn create_user(
        &self,
        name: &str,
        ssh_public_key: Option<&str>,
        admin: bool,
    ) -> Result<User> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO users (name, ssh_public_key, admin, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(name)
        .bind(ssh_public_key)
        .bind(admin)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => self.get_user(done.last_insert_rowid()).await,
            Err(e) if unique_violation(&e).is_some() => Err(StorageError::Conflict(format!(
                "User {} already exists",
                name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_user(&self, id: i64) -> Result<User> {
        let row = sqlx::query(&format!("{} WHERE id = ?1", USER_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.row_to_user(row),
            None => Err(StorageError::NotFound(format!("user {}", id))),
        }
    }

    pub async fn get_user_by_name(&self, name: &str) -> Result<User> {
        let row = sqlx::query(&format!("{} WHERE name = ?1", USER_SELECT))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.row_to_user(row),
            None => Err(StorageError::NotFound(format!("user {}", name))),
        }
    }

    pub async fn update_ssh_key(&self, user_id: i64, key: Option<&str>) -> Result<()> {
        let result =
            sqlx::query("UPDATE users SET ssh_public_key = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(key)
                .bind(timestamp(Utc::now()))
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    /// Users whose mesh is `enabled` or `pending`.
    pub async fn list_users_with_mesh(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "{} WHERE mesh_state IN ('enabled', 'pending') ORDER BY id",
            USER_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.row_to_user(row)).collect()
    }

    pub async fn set_mesh_state(
        &self,
        user_id: i64,
        state: MeshState,
        sidecar: Option<&str>,
        network: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET mesh_state = ?1, mesh_sidecar = ?2, mesh_network = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(state.as_str())
        .bind(sidecar)
        .bind(network)
        .bind(timestamp(Utc::now()))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Back to `disabled` with every mesh reference, the login URL, the IP and the
    /// subnet cleared. The subnet returns to the pool.
    pub async fn reset_mesh(&self, user_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET mesh_state = 'disabled', mesh_sidecar = NULL, mesh_network = NULL,
                mesh_login_url = NULL, mesh_subnet = NULL, mesh_ip = NULL, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The user's mesh subnet, allocating the lowest free one if none is held yet.
    pub async fn allocate_mesh_subnet(&self, user_id: i64) -> Result<MeshSubnet> {
        for attempt in 1..=ALLOCATION_ATTEMPTS {
            if let Some(subnet) = self.get_user(user_id).await?.mesh_subnet {
                return Ok(subnet);
            }
            let subnet = self.next_free_subnet().await?;

            let result = sqlx::query(
                "UPDATE users SET mesh_subnet = ?1, updated_at = ?2 WHERE id = ?3 AND mesh_subnet IS NULL",
            )
            .bind(i64::from(subnet.octet()))
            .bind(timestamp(Utc::now()))
            .bind(user_id)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => {
                    debug!("Allocated mesh subnet {} to user {}", subnet, user_id);
                    return Ok(subnet);
                }
                // Another caller allocated for this user first; the next pass returns theirs.
                Ok(_) => {}
                Err(e) if unique_violation(&e).is_some() => {
                    warn!(
                        "Mesh subnet {} taken concurrently (attempt {}), reallocating",
                        subnet, attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::Capacity(
            "Mesh subnet allocation kept colliding".to_string(),
        ))
    }

    async fn next_free_subnet(&self) -> Result<MeshSubnet> {
        let rows = sqlx::query("SELECT mesh_subnet FROM users WHERE mesh_subnet IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        let used: HashSet<i64> = rows.iter().map(|r| r.get::<i64, _>("mesh_subnet")).collect();

        MESH_SUBNET_OCTETS
            .into_iter()
            .find(|octet| !used.contains(&i64::from(*octet)))
            .map(MeshSubnet)
            .ok_or_else(|| StorageError::Capacity("No free mesh subnets available".to_string()))
    }

    pub async fn set_mesh_ip(&self, user_id: i64, ip: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE users SET mesh_ip = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(ip)
            .bind(timestamp(Utc::now()))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_mesh_login_url(&self, user_id: i64, url: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE users SET mesh_login_url = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(url)
            .bind(timestamp(Utc::now()))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_mesh_credentials(
        &self,
        user_id: i64,
        auth_key: Option<&str>,
        auto_connect: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET mesh_auth_key = ?1, mesh_auto_connect = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(auth_key)
        .bind(auto_connect)
        .bind(timestamp(Utc::now()))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // ROUTE OPERATIONS
    // ========================================================================

    pub async fn insert_route(&self, sandbox_id: i64, domain: &str, port: u16) -> Result<Route> {
        let result = sqlx::query(
            "INSERT INTO routes (sandbox_id, domain, port, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(sandbox_id)
        .bind(domain)
        .bind(i64::from(port))
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_route_by_domain(domain).await?.ok_or_else(|| {
                StorageError::NotFound(format!("route {}", domain))
            }),
            Err(e) if unique_violation(&e).is_some() => Err(StorageError::Conflict(format!(
                "Domain {} is already routed",
                domain
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_route_by_domain(&self, domain: &str) -> Result<Option<Route>> {
        let row = sqlx::query(
            "SELECT id, sandbox_id, domain, port, created_at FROM routes WHERE domain = ?1",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.row_to_route(r)).transpose()
    }

    pub async fn list_routes(&self, sandbox_id: i64) -> Result<Vec<Route>> {
        let rows = sqlx::query(
            "SELECT id, sandbox_id, domain, port, created_at FROM routes WHERE sandbox_id = ?1 ORDER BY id",
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.row_to_route(row)).collect()
    }

    /// Returns whether a route was deleted.
    pub async fn delete_route(&self, sandbox_id: i64, domain: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM routes WHERE sandbox_id = ?1 AND domain = ?2")
            .bind(sandbox_id)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_routes_for_sandbox(&self, sandbox_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM routes WHERE sandbox_id = ?1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Running sandboxes that have at least one route.
    pub async fn list_routed_running_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(&format!(
            "{} WHERE s.status = 'running' AND EXISTS (SELECT 1 FROM routes r WHERE r.sandbox_id = s.id) ORDER BY s.id",
            SANDBOX_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.row_to_sandbox(row)).collect()
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    fn row_to_sandbox(&self, row: SqliteRow) -> Result<Sandbox> {
        let ssh_port = row.get::<i64, _>("ssh_port");

        Ok(Sandbox {
            id: row.get("id"),
            user_id: row.get("user_id"),
            owner_name: row.get("owner_name"),
            name: row.get("name"),
            status: SandboxStatus::from_str(&row.get::<String, _>("status"))?,
            container_id: row.get("container_id"),
            image: row.get("image"),
            ssh_port: u16::try_from(ssh_port)
                .map_err(|_| StorageError::InvalidValue(format!("ssh_port {}", ssh_port)))?,
            persistent_volume: row.get("persistent_volume"),
            volume_path: row.get("volume_path"),
            mount_home: row.get("mount_home"),
            data_path: row.get("data_path"),
            mesh: row.get("mesh"),
            temporary: row.get("temporary"),
            job_status: row
                .get::<Option<String>, _>("job_status")
                .as_deref()
                .map(JobKind::from_str)
                .transpose()?,
            job_error: row.get("job_error"),
            job_started_at: parse_optional_timestamp(row.get("job_started_at"))?,
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        })
    }

    fn row_to_user(&self, row: SqliteRow) -> Result<User> {
        Ok(User {
            id: row.get("id"),
            name: row.get("name"),
            ssh_public_key: row.get("ssh_public_key"),
            admin: row.get("admin"),
            mesh_state: MeshState::from_str(&row.get::<String, _>("mesh_state"))?,
            mesh_sidecar: row.get("mesh_sidecar"),
            mesh_network: row.get("mesh_network"),
            mesh_auth_key: row.get("mesh_auth_key"),
            mesh_auto_connect: row.get("mesh_auto_connect"),
            mesh_login_url: row.get("mesh_login_url"),
            mesh_subnet: row
                .get::<Option<i64>, _>("mesh_subnet")
                .map(|octet| {
                    u8::try_from(octet)
                        .map_err(|_| StorageError::InvalidValue(format!("mesh subnet {}", octet)))
                        .and_then(MeshSubnet::new)
                })
                .transpose()?,
            mesh_ip: row.get("mesh_ip"),
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        })
    }

    fn row_to_route(&self, row: SqliteRow) -> Result<Route> {
        let port = row.get::<i64, _>("port");

        Ok(Route {
            id: row.get("id"),
            sandbox_id: row.get("sandbox_id"),
            domain: row.get("domain"),
            port: u16::try_from(port)
                .map_err(|_| StorageError::InvalidValue(format!("route port {}", port)))?,
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_pool;
    use chrono::Duration as ChronoDuration;

    async fn setup() -> (SandboxStorage, User) {
        let storage = SandboxStorage::new(test_pool().await);
        let user = storage.create_user("alice", Some("ssh-ed25519 AAAA alice"), false)
            .await
            .unwrap();
        (storage, user)
    }

    fn new_sandbox(user_id: i64, name: &str) -> NewSandbox {
        NewSandbox {
            user_id,
            name: name.to_string(),
            image: "sandcastle-sandbox:latest".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get_sandbox() {
        let (storage, user) = setup().await;

        let sandbox = storage.create_sandbox(&new_sandbox(user.id, "dev")).await.unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Pending);
        assert_eq!(sandbox.ssh_port, 2201);
        assert_eq!(sandbox.full_name(), "alice-dev");
        assert!(sandbox.container_id.is_none());

        let loaded = storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(loaded.name, "dev");
        assert_eq!(loaded.owner_name, "alice");
    }

    #[tokio::test]
    async fn test_ports_allocate_lowest_free_and_reuse_destroyed() {
        let (storage, user) = setup().await;

        let a = storage.create_sandbox(&new_sandbox(user.id, "a")).await.unwrap();
        let b = storage.create_sandbox(&new_sandbox(user.id, "b")).await.unwrap();
        assert_eq!((a.ssh_port, b.ssh_port), (2201, 2202));

        storage.mark_destroyed(a.id, None).await.unwrap();
        let c = storage.create_sandbox(&new_sandbox(user.id, "c")).await.unwrap();
        assert_eq!(c.ssh_port, 2201);
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_capacity_error() {
        let (storage, user) = setup().await;

        for i in 0..SSH_PORT_RANGE.len() {
            storage
                .create_sandbox(&new_sandbox(user.id, &format!("s{}", i)))
                .await
                .unwrap();
        }

        let err = storage
            .create_sandbox(&new_sandbox(user.id, "overflow"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Capacity(_)));
    }

    #[tokio::test]
    async fn test_duplicate_active_name_conflicts() {
        let (storage, user) = setup().await;

        let first = storage.create_sandbox(&new_sandbox(user.id, "dev")).await.unwrap();
        let err = storage
            .create_sandbox(&new_sandbox(user.id, "dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        storage.mark_destroyed(first.id, None).await.unwrap();
        assert!(storage.create_sandbox(&new_sandbox(user.id, "dev")).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_transitions_are_validated() {
        let (storage, user) = setup().await;
        let sandbox = storage.create_sandbox(&new_sandbox(user.id, "dev")).await.unwrap();

        storage
            .update_status(sandbox.id, SandboxStatus::Running)
            .await
            .unwrap();
        storage
            .update_status(sandbox.id, SandboxStatus::Destroyed)
            .await
            .unwrap();

        let err = storage
            .update_status(sandbox.id, SandboxStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[test]
    fn test_transition_table() {
        use SandboxStatus::*;
        assert!(Pending.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Destroyed.can_transition_to(Stopped));
        assert!(Destroyed.can_transition_to(Destroyed));
    }

    #[tokio::test]
    async fn test_mark_destroyed_clears_instance_and_keeps_lease() {
        let (storage, user) = setup().await;
        let sandbox = storage.create_sandbox(&new_sandbox(user.id, "dev")).await.unwrap();
        storage.set_container(sandbox.id, Some("id-alice-dev")).await.unwrap();
        storage.set_mesh_flag(sandbox.id, true).await.unwrap();
        let lease = storage.reserve_job(sandbox.id, JobKind::Destroying).await.unwrap();

        storage.mark_destroyed(sandbox.id, Some("boom")).await.unwrap();

        let loaded = storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(loaded.status, SandboxStatus::Destroyed);
        assert!(loaded.container_id.is_none());
        assert!(!loaded.mesh);
        assert_eq!(loaded.job_error.as_deref(), Some("boom"));
        assert_eq!(JobLease::held_on(&loaded), Some(lease));

        assert!(storage.finish_job(&lease).await.unwrap());
        let loaded = storage.get_sandbox(sandbox.id).await.unwrap();
        assert!(loaded.job_status.is_none());
        assert!(loaded.job_started_at.is_none());
    }

    #[tokio::test]
    async fn test_job_guard_is_single_flight() {
        let (storage, user) = setup().await;
        let sandbox = storage.create_sandbox(&new_sandbox(user.id, "dev")).await.unwrap();

        storage.reserve_job(sandbox.id, JobKind::Stopping).await.unwrap();
        let err = storage
            .reserve_job(sandbox.id, JobKind::Starting)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // The worker for the reserved kind may begin; a different kind may not.
        let lease = storage.begin_job(sandbox.id, JobKind::Stopping).await.unwrap();
        assert!(storage.begin_job(sandbox.id, JobKind::Starting).await.is_err());

        assert!(storage.fail_job(&lease, "Failed to stop: boom").await.unwrap());
        let loaded = storage.get_sandbox(sandbox.id).await.unwrap();
        assert!(loaded.job_status.is_none());
        assert_eq!(loaded.job_error.as_deref(), Some("Failed to stop: boom"));

        let lease = storage.reserve_job(sandbox.id, JobKind::Starting).await.unwrap();
        assert!(storage.finish_job(&lease).await.unwrap());
        let loaded = storage.get_sandbox(sandbox.id).await.unwrap();
        assert!(loaded.job_status.is_none());
        assert!(loaded.job_error.is_none());
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_release_a_newer_job() {
        let (storage, user) = setup().await;
        let sandbox = storage.create_sandbox(&new_sandbox(user.id, "dev")).await.unwrap();

        storage.reserve_job(sandbox.id, JobKind::Stopping).await.unwrap();
        let worker = storage.begin_job(sandbox.id, JobKind::Stopping).await.unwrap();

        // Reaped while the worker is still out talking to the runtime.
        let observed = storage.get_sandbox(sandbox.id).await.unwrap();
        let reaped = JobLease::held_on(&observed).unwrap();
        assert_eq!(reaped, worker);
        assert!(storage.fail_job(&reaped, "Job timed out").await.unwrap());

        let next = storage.reserve_job(sandbox.id, JobKind::Starting).await.unwrap();

        assert!(!storage.finish_job(&worker).await.unwrap());
        assert!(!storage.fail_job(&worker, "Failed to stop: late").await.unwrap());

        let loaded = storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(loaded.job_status, Some(JobKind::Starting));
        assert_eq!(JobLease::held_on(&loaded), Some(next));
        let err = storage
            .reserve_job(sandbox.id, JobKind::Destroying)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_stuck_jobs_uses_started_at() {
        let (storage, user) = setup().await;
        let sandbox = storage.create_sandbox(&new_sandbox(user.id, "dev")).await.unwrap();
        storage.reserve_job(sandbox.id, JobKind::Creating).await.unwrap();

        let none = storage
            .list_stuck_jobs(Utc::now() - ChronoDuration::minutes(5))
            .await
            .unwrap();
        assert!(none.is_empty());

        let stuck = storage
            .list_stuck_jobs(Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].job_status, Some(JobKind::Creating));
    }

    #[tokio::test]
    async fn test_routes_are_globally_unique() {
        let (storage, user) = setup().await;
        let a = storage.create_sandbox(&new_sandbox(user.id, "a")).await.unwrap();
        let b = storage.create_sandbox(&new_sandbox(user.id, "b")).await.unwrap();

        let route = storage.insert_route(a.id, "app.example.com", 9000).await.unwrap();
        assert_eq!(route.port, 9000);

        let err = storage
            .insert_route(b.id, "app.example.com", 8080)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        assert!(storage.delete_route(a.id, "app.example.com").await.unwrap());
        assert!(!storage.delete_route(a.id, "app.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_mesh_state_round_trip() {
        let (storage, user) = setup().await;
        assert_eq!(user.mesh_state, MeshState::Disabled);

        storage
            .set_mesh_state(
                user.id,
                MeshState::Pending,
                Some("sc-ts-alice"),
                Some("sc-ts-net-alice"),
            )
            .await
            .unwrap();
        storage
            .set_mesh_login_url(user.id, Some("https://login.tailscale.com/a/abc"))
            .await
            .unwrap();
        assert_eq!(storage.list_users_with_mesh().await.unwrap().len(), 1);

        let subnet = storage.allocate_mesh_subnet(user.id).await.unwrap();
        storage.set_mesh_ip(user.id, Some("100.64.0.5")).await.unwrap();
        let loaded = storage.get_user(user.id).await.unwrap();
        assert_eq!(loaded.mesh_subnet, Some(subnet));
        assert_eq!(loaded.mesh_ip.as_deref(), Some("100.64.0.5"));

        storage.reset_mesh(user.id).await.unwrap();
        let loaded = storage.get_user(user.id).await.unwrap();
        assert_eq!(loaded.mesh_state, MeshState::Disabled);
        assert!(loaded.mesh_sidecar.is_none());
        assert!(loaded.mesh_login_url.is_none());
        assert!(loaded.mesh_subnet.is_none());
        assert!(loaded.mesh_ip.is_none());
    }

    #[tokio::test]
    async fn test_mesh_subnets_are_exclusive_and_reused() {
        let (storage, alice) = setup().await;
        let bob = storage.create_user("bob", None, false).await.unwrap();

        let a = storage.allocate_mesh_subnet(alice.id).await.unwrap();
        let b = storage.allocate_mesh_subnet(bob.id).await.unwrap();
        assert_eq!(a.cidr(), "172.100.0.0/16");
        assert_eq!(b.cidr(), "172.101.0.0/16");
        assert_eq!(b.gateway(), "172.101.0.1");
        // Held subnets are returned as they are.
        assert_eq!(storage.allocate_mesh_subnet(alice.id).await.unwrap(), a);

        storage.reset_mesh(alice.id).await.unwrap();
        let carol = storage.create_user("carol", None, false).await.unwrap();
        assert_eq!(storage.allocate_mesh_subnet(carol.id).await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_mesh_subnet_exhaustion_is_capacity_error() {
        let (storage, alice) = setup().await;
        storage.allocate_mesh_subnet(alice.id).await.unwrap();
        for i in 1..MESH_SUBNET_OCTETS.len() {
            let user = storage
                .create_user(&format!("user{}", i), None, false)
                .await
                .unwrap();
            storage.allocate_mesh_subnet(user.id).await.unwrap();
        }

        let late = storage.create_user("late", None, false).await.unwrap();
        let err = storage.allocate_mesh_subnet(late.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Capacity(_)));
        assert!(storage.get_user(late.id).await.unwrap().mesh_subnet.is_none());
    }

    #[test]
    fn test_mesh_subnet_octet_range() {
        assert!(MeshSubnet::new(99).is_err());
        assert!(MeshSubnet::new(200).is_err());
        assert_eq!(MeshSubnet::new(150).unwrap().prefix(), "172.150.");
    }

    #[tokio::test]
    async fn test_count_by_status_covers_all_states() {
        let (storage, user) = setup().await;
        let a = storage.create_sandbox(&new_sandbox(user.id, "a")).await.unwrap();
        storage.create_sandbox(&new_sandbox(user.id, "b")).await.unwrap();
        storage.update_status(a.id, SandboxStatus::Running).await.unwrap();

        let counts = storage.count_by_status().await.unwrap();
        assert_eq!(
            counts,
            vec![
                (SandboxStatus::Pending, 1),
                (SandboxStatus::Running, 1),
                (SandboxStatus::Stopped, 0),
                (SandboxStatus::Destroyed, 0),
            ]
        );
    }
}
