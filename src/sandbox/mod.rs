//! Ephemeral execution sandboxes.
//!
//! A [`Sandbox`] wraps one environment allocated by a [`SandboxProvider`]. It owns the
//! lifecycle state and the absolute lifetime deadline; every operation is checked against
//! both before it reaches the provider, and is cut off if the deadline passes mid-flight.

pub mod filesystem;
pub mod local;
pub mod search;

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};

use crate::{
    config::{ConfigError, SandboxConfig},
    events::{EventSink, LogContext, WorkflowEvent},
};

pub use filesystem::{DirEntryInfo, LineSlice};
pub use local::LocalSandboxProvider;
pub use search::SearchResults;

/// Failures reported by a sandbox provider for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("sandbox provider unavailable: {0}")]
    Unavailable(String),
    #[error("unknown sandbox {0}")]
    UnknownSandbox(String),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("path {0} escapes the workspace")]
    Escape(String),
    #[error("file {path} is {size} bytes, over the {limit} byte limit")]
    TooLarge { path: String, size: u64, limit: u64 },
    #[error("lines {start_line}-{end_line} of {path} exceed the {limit} byte limit")]
    RangeTooLarge {
        path:       String,
        start_line: usize,
        end_line:   usize,
        limit:      u64,
    },
    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("i/o failure: {0}")]
    Io(String),
}

/// Sandbox-level failures. Every variant is fatal for the workflow owning the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("invalid sandbox configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to provision sandbox: {0}")]
    Provision(ProviderError),
    #[error("sandbox {id} expired after {lifetime:?}")]
    Expired { id: String, lifetime: Duration },
    #[error("sandbox {id} is {state}, not ready")]
    NotReady { id: String, state: SandboxState },
    #[error("sandbox {id} lost: {reason}")]
    Lost { id: String, reason: String },
}

impl SandboxError {
    /// Whether starting over with a fresh sandbox may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SandboxError::Config(_))
    }
}

/// Error from an operation executed against a live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A [`Sandbox`] only exists once the provider has handed out an id, so there is no
/// provisioning state here; that window is the workflow's `ProvisioningSandbox` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Ready,
    Terminated,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SandboxState::Ready => "ready",
            SandboxState::Terminated => "terminated",
        })
    }
}

/// Point-in-time view of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxHandle {
    pub id:         String,
    pub config:     SandboxConfig,
    pub created_at: DateTime<Utc>,
    pub state:      SandboxState,
}

/// Parameters handed to the provider when allocating a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub vcpus:          u32,
    pub runtime:        String,
    pub workspace_path: String,
    pub timeout:        Duration,
}

/// A process to run inside the sandbox. `cwd` is relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub program:          String,
    pub args:             Vec<String>,
    pub cwd:              PathBuf,
    pub timeout:          Duration,
    pub max_output_bytes: usize,
}

impl ExecRequest {
    /// `sh -c <script>` in the workspace root.
    pub fn shell(script: &str, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: PathBuf::from("."),
            timeout,
            max_output_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code:        Option<i32>,
    pub stdout:           String,
    pub stderr:           String,
    pub output_truncated: bool,
}

/// Backend that hosts sandboxes. Paths are always relative to the workspace root and have
/// already been confined by the caller.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<String, ProviderError>;

    /// Release a sandbox. Unknown ids are not an error.
    async fn terminate(&self, sandbox_id: &str) -> Result<(), ProviderError>;

    async fn exec(&self, sandbox_id: &str, request: &ExecRequest)
    -> Result<ExecOutput, ProviderError>;

    async fn list_dir(
        &self,
        sandbox_id: &str,
        path: &Path,
    ) -> Result<Vec<DirEntryInfo>, ProviderError>;

    async fn read_file(
        &self,
        sandbox_id: &str,
        path: &Path,
        max_bytes: u64,
    ) -> Result<String, ProviderError>;

    /// Lines `start_line..=end_line` (1-based) of a file of any size; only the returned
    /// text counts against `max_bytes`.
    async fn read_lines(
        &self,
        sandbox_id: &str,
        path: &Path,
        start_line: usize,
        end_line: usize,
        max_bytes: u64,
    ) -> Result<LineSlice, ProviderError>;

    async fn search(
        &self,
        sandbox_id: &str,
        path: &Path,
        pattern: &str,
        max_matches: usize,
    ) -> Result<SearchResults, ProviderError>;
}

/// A provisioned sandbox, exclusively owned by one workflow.
pub struct Sandbox {
    provider:   Arc<dyn SandboxProvider>,
    sink:       Arc<dyn EventSink>,
    id:         String,
    run_id:     String,
    config:     SandboxConfig,
    created_at: DateTime<Utc>,
    deadline:   Instant,
    state:      Mutex<SandboxState>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Validate `config` and allocate a sandbox through `provider`.
    pub async fn provision(
        provider: Arc<dyn SandboxProvider>,
        config: SandboxConfig,
        sink: Arc<dyn EventSink>,
        run_id: &str,
    ) -> Result<Self, SandboxError> {
        config.validate()?;

        sink.emit(
            WorkflowEvent::info(LogContext::Sandbox, "sandbox.provisioning")
                .run(run_id)
                .field("vcpus", config.vcpus)
                .field("runtime", &config.runtime)
                .field("timeout_secs", config.timeout.as_secs()),
        );

        let request = ProvisionRequest {
            vcpus:          config.vcpus,
            runtime:        config.runtime.clone(),
            workspace_path: config.workspace_path.clone(),
            timeout:        config.timeout,
        };
        let id = provider.provision(&request).await.map_err(|err| {
            sink.emit(
                WorkflowEvent::error(LogContext::Sandbox, "sandbox.provision_failed")
                    .run(run_id)
                    .field("error", &err),
            );
            SandboxError::Provision(err)
        })?;

        sink.emit(
            WorkflowEvent::info(LogContext::Sandbox, "sandbox.ready")
                .run(run_id)
                .field("sandbox_id", &id),
        );

        Ok(Self {
            provider,
            sink,
            id,
            run_id: run_id.to_string(),
            deadline: Instant::now() + config.timeout,
            config,
            created_at: Utc::now(),
            state: Mutex::new(SandboxState::Ready),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_path(&self) -> &str {
        &self.config.workspace_path
    }

    pub fn state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle {
            id:         self.id.clone(),
            config:     self.config.clone(),
            created_at: self.created_at,
            state:      self.state(),
        }
    }

    fn expired(&self) -> SandboxError {
        SandboxError::Expired {
            id:       self.id.clone(),
            lifetime: self.config.timeout,
        }
    }

    /// Fails with `Expired` past the deadline, regardless of state, or `NotReady`.
    pub fn ensure_ready(&self) -> Result<(), SandboxError> {
        if Instant::now() >= self.deadline {
            return Err(self.expired());
        }
        match self.state() {
            SandboxState::Ready => Ok(()),
            state => Err(SandboxError::NotReady {
                id: self.id.clone(),
                state,
            }),
        }
    }

    async fn guarded<T>(
        &self,
        operation: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, OperationError> {
        self.ensure_ready()?;
        match timeout_at(self.deadline, operation).await {
            Err(_) => Err(self.expired().into()),
            Ok(Err(ProviderError::UnknownSandbox(reason))) => Err(SandboxError::Lost {
                id: self.id.clone(),
                reason,
            }
            .into()),
            Ok(result) => Ok(result?),
        }
    }

    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, OperationError> {
        self.guarded(self.provider.exec(&self.id, request)).await
    }

    pub async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>, OperationError> {
        self.guarded(self.provider.list_dir(&self.id, path)).await
    }

    pub async fn read_file(&self, path: &Path, max_bytes: u64) -> Result<String, OperationError> {
        self.guarded(self.provider.read_file(&self.id, path, max_bytes))
            .await
    }

    pub async fn read_lines(
        &self,
        path: &Path,
        start_line: usize,
        end_line: usize,
        max_bytes: u64,
    ) -> Result<LineSlice, OperationError> {
        self.guarded(
            self.provider
                .read_lines(&self.id, path, start_line, end_line, max_bytes),
        )
        .await
    }

    pub async fn search(
        &self,
        path: &Path,
        pattern: &str,
        max_matches: usize,
    ) -> Result<SearchResults, OperationError> {
        self.guarded(self.provider.search(&self.id, path, pattern, max_matches))
            .await
    }

    /// Release the sandbox. Returns `false` when it had already been terminated.
    pub async fn terminate(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state == SandboxState::Terminated {
                return false;
            }
            *state = SandboxState::Terminated;
        }

        match self.provider.terminate(&self.id).await {
            Ok(()) => self.sink.emit(
                WorkflowEvent::info(LogContext::Sandbox, "sandbox.terminated")
                    .run(&self.run_id)
                    .field("sandbox_id", &self.id),
            ),
            Err(err) => self.sink.emit(
                WorkflowEvent::error(LogContext::Sandbox, "sandbox.terminate_failed")
                    .run(&self.run_id)
                    .field("sandbox_id", &self.id)
                    .field("error", err),
            ),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{FakeProvider, RecordingSink};

    async fn provision(provider: &Arc<FakeProvider>, config: SandboxConfig) -> Sandbox {
        Sandbox::provision(provider.clone(), config, Arc::new(RecordingSink::default()), "run")
            .await
            .expect("provisioned")
    }

    #[tokio::test]
    async fn provision_rejects_invalid_config_before_contacting_provider() {
        let provider = Arc::new(FakeProvider::default());
        let mut config = SandboxConfig::default();
        config.vcpus = 0;

        let err = Sandbox::provision(
            provider.clone(),
            config,
            Arc::new(RecordingSink::default()),
            "run",
        )
        .await
        .unwrap_err();

        assert_eq!(err, SandboxError::Config(ConfigError::ZeroVcpus));
        assert!(!err.is_retryable());
        assert_eq!(provider.provision_calls(), 0);
    }

    #[tokio::test]
    async fn provider_failure_is_retryable_provision_error() {
        let provider = Arc::new(FakeProvider::default());
        provider.fail_provisioning("quota exceeded");

        let err = Sandbox::provision(
            provider.clone(),
            SandboxConfig::default(),
            Arc::new(RecordingSink::default()),
            "run",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SandboxError::Provision(ProviderError::Unavailable(_))));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_reaches_provider_once() {
        let provider = Arc::new(FakeProvider::default());
        let sandbox = provision(&provider, SandboxConfig::default()).await;

        assert_eq!(sandbox.handle().state, SandboxState::Ready);
        assert!(sandbox.terminate().await);
        assert!(!sandbox.terminate().await);
        assert_eq!(sandbox.state(), SandboxState::Terminated);

        let handle = sandbox.handle();
        assert_eq!(handle.id, sandbox.id());
        assert_eq!(handle.state, SandboxState::Terminated);
        assert_eq!(handle.config, SandboxConfig::default());
        assert_eq!(provider.terminate_calls(), 1);

        let err = sandbox.list_dir(Path::new(".")).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::Sandbox(SandboxError::NotReady {
                state: SandboxState::Terminated,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_after_lifetime_fail_with_expired() {
        let provider = Arc::new(FakeProvider::default());
        let sandbox = provision(&provider, SandboxConfig::default()).await;

        tokio::time::advance(Duration::from_secs(20 * 60) - Duration::from_millis(1)).await;
        assert!(sandbox.ensure_ready().is_ok());
        tokio::time::advance(Duration::from_millis(1)).await;

        let err = sandbox.list_dir(Path::new(".")).await.unwrap_err();
        assert!(matches!(err, OperationError::Sandbox(SandboxError::Expired { .. })));
        assert_eq!(sandbox.state(), SandboxState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_in_flight_at_deadline_is_cut_off() {
        let provider = Arc::new(FakeProvider::default());
        provider.set_exec_delay(Duration::from_secs(60));
        let mut config = SandboxConfig::default();
        config.timeout = Duration::from_secs(30);
        let sandbox = provision(&provider, config).await;

        let request = ExecRequest::shell("sleep 60", Duration::from_secs(120), 1024);
        let err = sandbox.exec(&request).await.unwrap_err();
        assert!(matches!(err, OperationError::Sandbox(SandboxError::Expired { .. })));
    }

    #[tokio::test]
    async fn unknown_sandbox_from_provider_is_fatal() {
        let provider = Arc::new(FakeProvider::default());
        let sandbox = provision(&provider, SandboxConfig::default()).await;
        provider.forget(sandbox.id());

        let err = sandbox.list_dir(Path::new(".")).await.unwrap_err();
        assert!(matches!(err, OperationError::Sandbox(SandboxError::Lost { .. })));
    }
}
