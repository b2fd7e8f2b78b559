// Executor module - transport capability and the task-over-target engine

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::output::errors::SpotError;
use crate::parser::ast::Destination;

pub mod hook;
pub mod local;
pub mod scheduler;
pub mod ssh;

pub use local::LocalExecutor;
pub use scheduler::{RunError, RunStats, Scheduler, SchedulerConfig};
pub use ssh::{SshConfig, SshConnector};

/// Operations on one connected host.
///
/// Every call must return `SpotError::Cancelled` promptly once `cancel`
/// fires. Work already handed to the remote side is not interrupted.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a shell command, returning its output lines. Non-zero exit is an error.
    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> Result<Vec<String>, SpotError>;

    /// Copy a local file to the host
    async fn upload(
        &self,
        cancel: &CancellationToken,
        local: &str,
        remote: &str,
        mkdir: bool,
    ) -> Result<(), SpotError>;

    /// Copy a file from the host to the local machine
    async fn download(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &str,
        mkdir: bool,
    ) -> Result<(), SpotError>;

    /// Recursively copy a local directory, returning the files that changed
    async fn sync(
        &self,
        cancel: &CancellationToken,
        local_dir: &str,
        remote_dir: &str,
        delete: bool,
    ) -> Result<Vec<String>, SpotError>;

    async fn delete(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        recursive: bool,
    ) -> Result<(), SpotError>;

    /// Release the session
    async fn close(&self) -> Result<(), SpotError> {
        Ok(())
    }
}

/// Opens sessions to hosts
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        host: &Destination,
    ) -> Result<Box<dyn Executor>, SpotError>;

    /// Identity used for remote sessions
    fn user(&self) -> &str;
}

/// Await `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SpotError>
where
    F: std::future::Future<Output = Result<T, SpotError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SpotError::Cancelled),
        res = fut => res,
    }
}
