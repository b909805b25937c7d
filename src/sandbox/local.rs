use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DirEntryInfo, ExecOutput, ExecRequest, ProviderError, ProvisionRequest, SandboxProvider,
    SearchResults,
    filesystem::{self, LineSlice},
    search,
};

/// How long output is still collected once the command itself has exited. Background jobs
/// inherit the pipes and would otherwise keep them open.
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
struct LocalSandbox {
    dir:       PathBuf,
    workspace: PathBuf,
    /// Process groups started by `exec` that may still have live members.
    groups:    Arc<Mutex<HashSet<u32>>>,
}

impl LocalSandbox {
    fn groups(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hosts sandboxes as private directory trees on the local machine.
///
/// Each sandbox gets `<base>/<id>/` with the workspace at `<base>/<id>/<workspace_path>`.
/// Commands run as child processes of this one, each in its own process group, with the
/// workspace as working directory and `HOME` pointing into the sandbox directory. There is
/// no kernel-level isolation; the vCPU request is only checked against the host's available
/// parallelism.
#[derive(Debug)]
pub struct LocalSandboxProvider {
    base:      PathBuf,
    sandboxes: Mutex<HashMap<String, LocalSandbox>>,
}

impl LocalSandboxProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base:      base.into(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn sandboxes(&self) -> MutexGuard<'_, HashMap<String, LocalSandbox>> {
        self.sandboxes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, sandbox_id: &str) -> Result<LocalSandbox, ProviderError> {
        self.sandboxes()
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownSandbox(sandbox_id.to_string()))
    }

    fn resolve(&self, sandbox_id: &str, path: &Path) -> Result<(LocalSandbox, PathBuf), ProviderError> {
        let sandbox = self.lookup(sandbox_id)?;
        let resolved = filesystem::resolve_within(&sandbox.workspace, path)?;
        Ok((sandbox, resolved))
    }
}

/// Send `SIGKILL` to every member of the group. `false` when the group no longer exists.
#[cfg(unix)]
fn kill_group(pgid: u32) -> bool {
    signal_group(pgid, Some(nix::sys::signal::Signal::SIGKILL))
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    signal_group(pgid, None)
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Option<nix::sys::signal::Signal>) -> bool {
    use nix::{sys::signal::killpg, unistd::Pid};

    match i32::try_from(pgid) {
        Ok(raw) if raw > 0 => killpg(Pid::from_raw(raw), signal).is_ok(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}

/// Keep the last `max_bytes` of `bytes`, on a char boundary.
fn tail_lossy(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return (text.into_owned(), false);
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    (text[start..].to_string(), true)
}

/// The last `limit` bytes of a stream; older bytes are dropped as new ones arrive.
#[derive(Debug)]
struct TailBuffer {
    bytes:     VecDeque<u8>,
    limit:     usize,
    truncated: bool,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit.min(READ_CHUNK)),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        if self.bytes.len() > self.limit {
            let excess = self.bytes.len() - self.limit;
            self.bytes.drain(..excess);
            self.truncated = true;
        }
    }

    fn into_text(self) -> (String, bool) {
        let mut bytes = Vec::from(self.bytes);
        if self.truncated {
            // A cut head may start inside a multi-byte character.
            let partial = bytes
                .iter()
                .take(3)
                .take_while(|byte| (**byte & 0xC0) == 0x80)
                .count();
            bytes.drain(..partial);
        }
        let (text, cut) = tail_lossy(&bytes, self.limit);
        (text, cut || self.truncated)
    }
}

/// Read `reader` to EOF into a [`TailBuffer`], or until [`OUTPUT_GRACE`] after `exited`
/// fires, whichever comes first.
async fn drain_tail<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
    exited: &CancellationToken,
) -> io::Result<TailBuffer> {
    let mut tail = TailBuffer::new(limit);
    let Some(mut reader) = reader else {
        return Ok(tail);
    };

    let settled = async {
        exited.cancelled().await;
        sleep(OUTPUT_GRACE).await;
    };
    tokio::pin!(settled);

    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read? {
                0 => break,
                n => tail.push(&chunk[..n]),
            },
            () = &mut settled => break,
        }
    }
    Ok(tail)
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn provision(&self, request: &ProvisionRequest) -> Result<String, ProviderError> {
        let available = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        if request.vcpus > available {
            return Err(ProviderError::Unavailable(format!(
                "requested {} vCPUs but only {available} are available",
                request.vcpus
            )));
        }

        let id = format!("sbx_{}", Uuid::new_v4().simple());
        let dir = self.base.join(&id);
        let workspace = dir.join(request.workspace_path.trim_start_matches('/'));
        fs::create_dir_all(&workspace)
            .await
            .map_err(|err| ProviderError::Unavailable(format!("{}: {err}", workspace.display())))?;
        let workspace = workspace
            .canonicalize()
            .map_err(|err| ProviderError::Io(err.to_string()))?;

        info!(sandbox_id = %id, runtime = %request.runtime, vcpus = request.vcpus, workspace = %workspace.display(), "local_sandbox.provisioned");
        self.sandboxes().insert(id.clone(), LocalSandbox {
            dir,
            workspace,
            groups: Arc::default(),
        });
        Ok(id)
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let removed = self.sandboxes().remove(sandbox_id);
        let Some(sandbox) = removed else {
            debug!(sandbox_id, "local_sandbox.terminate_unknown");
            return Ok(());
        };

        let groups: Vec<u32> = sandbox.groups().drain().collect();
        for pgid in groups {
            if kill_group(pgid) {
                debug!(sandbox_id, pgid, "local_sandbox.process_group_killed");
            }
        }

        match fs::remove_dir_all(&sandbox.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(sandbox_id, error = %err, "local_sandbox.cleanup_failed");
                Err(ProviderError::Io(err.to_string()))
            }
        }
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ProviderError> {
        let (sandbox, cwd) = self.resolve(sandbox_id, &request.cwd)?;

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .current_dir(&cwd)
            .env("HOME", &sandbox.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| ProviderError::Io(format!("failed to spawn {}: {err}", request.program)))?;
        let group = child.id();
        if let Some(pgid) = group {
            sandbox.groups().insert(pgid);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = request.max_output_bytes;
        let exited = CancellationToken::new();

        let collected = timeout(request.timeout, async {
            let status = async {
                let status = child.wait().await;
                exited.cancel();
                status
            };
            tokio::join!(
                status,
                drain_tail(stdout, limit, &exited),
                drain_tail(stderr, limit, &exited),
            )
        })
        .await;

        let Ok((status, stdout, stderr)) = collected else {
            if let Some(pgid) = group {
                kill_group(pgid);
                sandbox.groups().remove(&pgid);
            }
            let _ = child.start_kill();
            warn!(sandbox_id, program = %request.program, timeout = ?request.timeout, "local_sandbox.exec_timed_out");
            return Err(ProviderError::Timeout(request.timeout));
        };

        // Background jobs stay recorded until they exit or the sandbox is terminated.
        if let Some(pgid) = group {
            if !group_alive(pgid) {
                sandbox.groups().remove(&pgid);
            }
        }

        let io_error = |err: io::Error| ProviderError::Io(err.to_string());
        let status = status.map_err(io_error)?;
        let (stdout, stdout_truncated) = stdout.map_err(io_error)?.into_text();
        let (stderr, stderr_truncated) = stderr.map_err(io_error)?.into_text();
        Ok(ExecOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            output_truncated: stdout_truncated || stderr_truncated,
        })
    }

    async fn list_dir(
        &self,
        sandbox_id: &str,
        path: &Path,
    ) -> Result<Vec<DirEntryInfo>, ProviderError> {
        let (sandbox, dir) = self.resolve(sandbox_id, path)?;
        filesystem::list_dir(&sandbox.workspace, &dir).await
    }

    async fn read_file(
        &self,
        sandbox_id: &str,
        path: &Path,
        max_bytes: u64,
    ) -> Result<String, ProviderError> {
        let (sandbox, file) = self.resolve(sandbox_id, path)?;
        filesystem::read_file_bounded(&sandbox.workspace, &file, max_bytes).await
    }

    async fn read_lines(
        &self,
        sandbox_id: &str,
        path: &Path,
        start_line: usize,
        end_line: usize,
        max_bytes: u64,
    ) -> Result<LineSlice, ProviderError> {
        let (sandbox, file) = self.resolve(sandbox_id, path)?;
        filesystem::read_lines(&sandbox.workspace, &file, start_line, end_line, max_bytes).await
    }

    async fn search(
        &self,
        sandbox_id: &str,
        path: &Path,
        pattern: &str,
        max_matches: usize,
    ) -> Result<SearchResults, ProviderError> {
        let (sandbox, scope) = self.resolve(sandbox_id, path)?;
        search::search_recursive(&sandbox.workspace, &scope, pattern, max_matches).await
    }
}
