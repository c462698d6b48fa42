// ABOUTME: Background job definitions and the handlers that run them against the lifecycle engine
// ABOUTME: Each handler owns the sandbox job guard: begin, run, then finish or record the failure

use crate::error::Result;
use crate::manager::SandboxManager;
use crate::notify::{Notifier, NotifyLevel};
use crate::sidecar::SidecarKind;
use crate::storage::{JobKind, JobLease, Sandbox, SandboxStatus, SandboxStorage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Provision { sandbox_id: i64 },
    Start { sandbox_id: i64 },
    Stop { sandbox_id: i64 },
    Destroy { sandbox_id: i64, keep_volume: bool },
    Restore { sandbox_id: i64, snapshot: String },
    OpenTerminal { sandbox_id: i64 },
    OpenVnc { sandbox_id: i64 },
}

impl Job {
    pub fn sandbox_id(&self) -> i64 {
        match self {
            Job::Provision { sandbox_id }
            | Job::Start { sandbox_id }
            | Job::Stop { sandbox_id }
            | Job::Destroy { sandbox_id, .. }
            | Job::Restore { sandbox_id, .. }
            | Job::OpenTerminal { sandbox_id }
            | Job::OpenVnc { sandbox_id } => *sandbox_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Job::Provision { .. } => "provision",
            Job::Start { .. } => "start",
            Job::Stop { .. } => "stop",
            Job::Destroy { .. } => "destroy",
            Job::Restore { .. } => "restore",
            Job::OpenTerminal { .. } => "open_terminal",
            Job::OpenVnc { .. } => "open_vnc",
        }
    }

    /// The sandbox job status held while this job runs.
    pub fn job_kind(&self) -> JobKind {
        match self {
            Job::Provision { .. } => JobKind::Creating,
            Job::Start { .. } => JobKind::Starting,
            Job::Stop { .. } => JobKind::Stopping,
            Job::Destroy { .. } => JobKind::Destroying,
            Job::Restore { .. } => JobKind::Restoring,
            Job::OpenTerminal { .. } => SidecarKind::Terminal.job_kind(),
            Job::OpenVnc { .. } => SidecarKind::Vnc.job_kind(),
        }
    }
}

/// Runs jobs against the engine and reports the outcome to the owner.
pub struct JobRunner {
    manager: Arc<SandboxManager>,
    notifier: Arc<dyn Notifier>,
}

impl JobRunner {
    pub fn new(manager: Arc<SandboxManager>, notifier: Arc<dyn Notifier>) -> Self {
        Self { manager, notifier }
    }

    fn storage(&self) -> &SandboxStorage {
        self.manager.storage()
    }

    /// Run one job. An error means the job failed; `SandboxError::is_retryable` decides
    /// whether the queue tries again.
    pub async fn run(&self, job: &Job) -> Result<()> {
        let sandbox = self.storage().get_sandbox(job.sandbox_id()).await?;
        let kind = job.job_kind();
        debug!("Running {} job for {}", job.name(), sandbox.full_name());

        match job {
            Job::Provision { .. } => {
                if matches!(
                    sandbox.status,
                    SandboxStatus::Running | SandboxStatus::Destroyed
                ) {
                    return self.skip(&sandbox, kind).await;
                }
                let lease = self.storage().begin_job(sandbox.id, kind).await?;
                let outcome = self
                    .manager
                    .provision(sandbox.id)
                    .await
                    .map(|s| format!("Sandbox {} is ready", s.full_name()));
                self.settle(&sandbox, &lease, outcome, "Failed to create").await
            }
            Job::Start { .. } => {
                if matches!(
                    sandbox.status,
                    SandboxStatus::Running | SandboxStatus::Destroyed
                ) {
                    return self.skip(&sandbox, kind).await;
                }
                let lease = self.storage().begin_job(sandbox.id, kind).await?;
                let outcome = self
                    .manager
                    .start(&sandbox)
                    .await
                    .map(|s| format!("Sandbox {} started", s.full_name()));
                self.settle(&sandbox, &lease, outcome, "Failed to start").await
            }
            Job::Stop { .. } => {
                if matches!(
                    sandbox.status,
                    SandboxStatus::Stopped | SandboxStatus::Destroyed
                ) {
                    return self.skip(&sandbox, kind).await;
                }
                let lease = self.storage().begin_job(sandbox.id, kind).await?;
                let outcome = self
                    .manager
                    .stop(&sandbox)
                    .await
                    .map(|s| format!("Sandbox {} stopped", s.full_name()));
                self.settle(&sandbox, &lease, outcome, "Failed to stop").await
            }
            Job::Destroy { keep_volume, .. } => {
                if sandbox.status == SandboxStatus::Destroyed {
                    return self.skip(&sandbox, kind).await;
                }
                let lease = self.storage().begin_job(sandbox.id, kind).await?;
                let outcome = self
                    .manager
                    .destroy(&sandbox, *keep_volume)
                    .await
                    .map(|s| format!("Sandbox {} destroyed", s.full_name()));
                self.settle(&sandbox, &lease, outcome, "Failed to destroy").await
            }
            Job::Restore { snapshot, .. } => {
                if sandbox.status == SandboxStatus::Destroyed {
                    return self.skip(&sandbox, kind).await;
                }
                let lease = self.storage().begin_job(sandbox.id, kind).await?;
                let outcome = self
                    .manager
                    .restore(&sandbox, snapshot)
                    .await
                    .map(|s| format!("Sandbox {} restored from {}", s.full_name(), snapshot));
                self.settle(&sandbox, &lease, outcome, "Failed to restore").await
            }
            Job::OpenTerminal { .. } => self.open_sidecar(&sandbox, SidecarKind::Terminal).await,
            Job::OpenVnc { .. } => self.open_sidecar(&sandbox, SidecarKind::Vnc).await,
        }
    }

    /// Failures are recorded on the sandbox and never retried.
    async fn open_sidecar(&self, sandbox: &Sandbox, kind: SidecarKind) -> Result<()> {
        if sandbox.status != SandboxStatus::Running {
            debug!(
                "{} is {}, not opening {}",
                sandbox.full_name(),
                sandbox.status.as_str(),
                kind.as_str()
            );
            return self.release_reserved(sandbox, kind.job_kind()).await;
        }
        let lease = self.storage().begin_job(sandbox.id, kind.job_kind()).await?;

        match self.manager.sidecar(kind).open(sandbox).await {
            Ok(url) => {
                self.storage().finish_job(&lease).await?;
                info!("Opened {} for {} at {}", kind.as_str(), sandbox.full_name(), url);
                self.notifier
                    .notify(
                        sandbox.user_id,
                        &format!("{} ready: {}", kind.describe(), url),
                        NotifyLevel::Success,
                    )
                    .await;
            }
            Err(e) => {
                let message = format!("Failed to open {}: {}", kind.describe(), e);
                error!("{} ({})", message, sandbox.full_name());
                self.storage().fail_job(&lease, &message).await?;
                self.notifier
                    .notify(sandbox.user_id, &message, NotifyLevel::Error)
                    .await;
            }
        }
        Ok(())
    }

    /// Nothing to do; release a reserved slot.
    async fn skip(&self, sandbox: &Sandbox, kind: JobKind) -> Result<()> {
        debug!(
            "{} already {}, nothing to do",
            sandbox.full_name(),
            sandbox.status.as_str()
        );
        self.release_reserved(sandbox, kind).await
    }

    /// Release the slot the request side reserved for `kind`. Another kind's slot is left alone.
    async fn release_reserved(&self, sandbox: &Sandbox, kind: JobKind) -> Result<()> {
        if let Some(lease) = JobLease::held_on(sandbox).filter(|l| l.kind == kind) {
            self.storage().finish_job(&lease).await?;
        }
        Ok(())
    }

    async fn settle(
        &self,
        sandbox: &Sandbox,
        lease: &JobLease,
        outcome: Result<String>,
        prefix: &str,
    ) -> Result<()> {
        match outcome {
            Ok(message) => {
                self.storage().finish_job(lease).await?;
                self.notifier
                    .notify(sandbox.user_id, &message, NotifyLevel::Success)
                    .await;
                Ok(())
            }
            Err(e) => {
                let message = format!("{}: {}", prefix, e);
                error!("{} ({})", message, sandbox.full_name());
                self.storage().fail_job(lease, &message).await?;
                self.notifier
                    .notify(sandbox.user_id, &message, NotifyLevel::Error)
                    .await;
                Err(e)
            }
        }
    }
}
