// ABOUTME: Sandcastle core: sandbox lifecycle, runtime backends, routing, mesh networking and sidecars
// ABOUTME: Exposes the Sandcastle facade plus the managers, queue and reconciler it is built from

pub mod config;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod mesh;
pub mod notify;
pub mod queue;
pub mod reconcile;
pub mod routes;
pub mod runtime;
pub mod service;
pub mod sidecar;
pub mod status;
pub mod storage;
pub mod traefik;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{ConfigError, RuntimeBackend, SandcastleConfig, TlsMode};
pub use error::{Result, SandboxError};
pub use jobs::{Job, JobRunner};
pub use manager::{ConnectInfo, CreateSandboxRequest, SandboxManager};
pub use mesh::{LoginStatus, MeshManager, MeshStatus};
pub use notify::{BroadcastNotifier, LogNotifier, Notification, Notifier, NotifyLevel};
pub use queue::{JobQueue, WorkerPool};
pub use reconcile::{ReconcileReport, Reconciler, StuckJobReaper};
pub use routes::RouteManager;
pub use runtime::{RuntimeClient, RuntimeError};
pub use service::{runtime_from_config, Sandcastle};
pub use sidecar::{SidecarKind, SidecarManager};
pub use status::SystemStatus;
pub use storage::{
    JobKind, JobLease, MeshState, MeshSubnet, Route, Sandbox, SandboxFilter, SandboxStatus,
    SandboxStorage, StorageError, User,
};
