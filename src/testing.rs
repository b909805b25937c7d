//! In-memory collaborators shared by the unit tests.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use grep_regex::RegexMatcher;

use crate::{
    events::{EventSink, WorkflowEvent},
    llm::{LlmError, ModelClient},
    model::{Message, ModelResponse},
    sandbox::{
        DirEntryInfo, ExecOutput, ExecRequest, LineSlice, ProviderError, ProvisionRequest,
        SandboxProvider, SearchResults,
        filesystem::{DirEntryKind, LineCollector},
        search::SearchMatch,
    },
    tools::ToolName,
};

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.message).collect()
    }

    pub fn count(&self, message: &str) -> usize {
        self.messages().into_iter().filter(|m| *m == message).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: WorkflowEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Debug, Default)]
struct FakeState {
    live:            HashSet<String>,
    next_id:         usize,
    provision_calls: usize,
    terminate_calls: usize,
    provision_error: Option<ProviderError>,
    provision_panic: bool,
    files:           BTreeMap<PathBuf, String>,
    exec_delay:      Duration,
    exec_outputs:    VecDeque<Result<ExecOutput, ProviderError>>,
    exec_log:        Vec<ExecRequest>,
    read_delays:     BTreeMap<PathBuf, Duration>,
    seen_paths:      Vec<PathBuf>,
}

/// Sandbox provider backed by an in-memory file map. Tracks call counts and whether a
/// mutating operation ever overlapped with another operation.
#[derive(Debug, Default)]
pub struct FakeProvider {
    state:         Mutex<FakeState>,
    in_flight:     AtomicUsize,
    mutating:      AtomicUsize,
    max_in_flight: AtomicUsize,
    overlap:       AtomicBool,
}

struct Flight<'a> {
    provider: &'a FakeProvider,
    mutating: bool,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.provider.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.mutating {
            self.provider.mutating.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl FakeProvider {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let provider = Self::default();
        {
            let mut state = provider.state.lock().unwrap();
            for (path, content) in files {
                state.files.insert(PathBuf::from(path), content.to_string());
            }
        }
        provider
    }

    pub fn fail_provisioning(&self, reason: &str) {
        self.state.lock().unwrap().provision_error =
            Some(ProviderError::Unavailable(reason.to_string()));
    }

    pub fn panic_on_provision(&self) {
        self.state.lock().unwrap().provision_panic = true;
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.state.lock().unwrap().exec_delay = delay;
    }

    pub fn push_exec_output(&self, output: Result<ExecOutput, ProviderError>) {
        self.state.lock().unwrap().exec_outputs.push_back(output);
    }

    pub fn set_read_delay(&self, path: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .read_delays
            .insert(PathBuf::from(path), delay);
    }

    pub fn forget(&self, sandbox_id: &str) {
        self.state.lock().unwrap().live.remove(sandbox_id);
    }

    pub fn provision_calls(&self) -> usize {
        self.state.lock().unwrap().provision_calls
    }

    pub fn terminate_calls(&self) -> usize {
        self.state.lock().unwrap().terminate_calls
    }

    pub fn live_sandboxes(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn exec_log(&self) -> Vec<ExecRequest> {
        self.state.lock().unwrap().exec_log.clone()
    }

    pub fn seen_paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().seen_paths.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn mutation_overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    fn enter(&self, sandbox_id: &str, mutating: bool) -> Result<Flight<'_>, ProviderError> {
        if !self.state.lock().unwrap().live.contains(sandbox_id) {
            return Err(ProviderError::UnknownSandbox(sandbox_id.to_string()));
        }
        let before = self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.max_in_flight.fetch_max(before + 1, Ordering::SeqCst);
        let mutating_before = if mutating {
            self.mutating.fetch_add(1, Ordering::SeqCst)
        } else {
            self.mutating.load(Ordering::SeqCst)
        };
        if (mutating && before > 0) || (!mutating && mutating_before > 0) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        Ok(Flight {
            provider: self,
            mutating,
        })
    }

    fn record_path(&self, path: &Path) {
        self.state.lock().unwrap().seen_paths.push(path.to_path_buf());
    }

    async fn file_content(&self, path: &Path) -> Result<String, ProviderError> {
        let delay = self
            .state
            .lock()
            .unwrap()
            .read_delays
            .get(path)
            .copied()
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        match state.files.get(path) {
            Some(content) => Ok(content.clone()),
            None if state.files.keys().any(|f| f.starts_with(path)) => {
                Err(ProviderError::NotAFile(path.display().to_string()))
            }
            None => Err(ProviderError::NotFound(path.display().to_string())),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    if path == Path::new(".") {
        PathBuf::new()
    } else {
        path.to_path_buf()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn provision(&self, _request: &ProvisionRequest) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.provision_calls += 1;
        if state.provision_panic {
            drop(state);
            panic!("scripted provider panic");
        }
        if let Some(err) = state.provision_error.clone() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("sbx_fake_{}", state.next_id);
        state.live.insert(id.clone());
        Ok(id)
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.terminate_calls += 1;
        state.live.remove(sandbox_id);
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ProviderError> {
        let _flight = self.enter(sandbox_id, true)?;
        let (delay, output) = {
            let mut state = self.state.lock().unwrap();
            state.exec_log.push(request.clone());
            let output = state.exec_outputs.pop_front().unwrap_or_else(|| {
                Ok(ExecOutput {
                    exit_code: Some(0),
                    stdout: "ok\n".into(),
                    ..ExecOutput::default()
                })
            });
            (state.exec_delay, output)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Ok(ExecOutput {
            exit_code: Some(0),
            ..
        }) = &output
        {
            if request.program == "git" {
                if let Some(target) = request.args.last() {
                    self.state
                        .lock()
                        .unwrap()
                        .files
                        .insert(PathBuf::from(target).join("README.md"), "cloned".into());
                }
            }
        }
        output
    }

    async fn list_dir(
        &self,
        sandbox_id: &str,
        path: &Path,
    ) -> Result<Vec<DirEntryInfo>, ProviderError> {
        let _flight = self.enter(sandbox_id, false)?;
        self.record_path(path);
        let dir = normalize(path);
        let state = self.state.lock().unwrap();
        if state.files.contains_key(&dir) {
            return Err(ProviderError::NotADirectory(path.display().to_string()));
        }

        let mut entries: BTreeMap<String, DirEntryInfo> = BTreeMap::new();
        for (file, content) in &state.files {
            let Ok(rest) = file.strip_prefix(&dir) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            let name = first.as_os_str().to_string_lossy().into_owned();
            let is_dir = components.next().is_some();
            entries.entry(name.clone()).or_insert_with(|| DirEntryInfo {
                path: dir.join(&name),
                kind: if is_dir {
                    DirEntryKind::Directory
                } else {
                    DirEntryKind::File
                },
                size: (!is_dir).then_some(content.len() as u64),
                name,
            });
        }

        if entries.is_empty() && !dir.as_os_str().is_empty() {
            return Err(ProviderError::NotFound(path.display().to_string()));
        }
        Ok(entries.into_values().collect())
    }

    async fn read_file(
        &self,
        sandbox_id: &str,
        path: &Path,
        max_bytes: u64,
    ) -> Result<String, ProviderError> {
        let _flight = self.enter(sandbox_id, false)?;
        self.record_path(path);
        let content = self.file_content(path).await?;
        if content.len() as u64 > max_bytes {
            return Err(ProviderError::TooLarge {
                path:  path.display().to_string(),
                size:  content.len() as u64,
                limit: max_bytes,
            });
        }
        Ok(content)
    }

    async fn read_lines(
        &self,
        sandbox_id: &str,
        path: &Path,
        start_line: usize,
        end_line: usize,
        max_bytes: u64,
    ) -> Result<LineSlice, ProviderError> {
        let _flight = self.enter(sandbox_id, false)?;
        self.record_path(path);
        let content = self.file_content(path).await?;
        let mut collector =
            LineCollector::new(path.display().to_string(), start_line, end_line, max_bytes);
        for line in content.lines() {
            if !collector.push(line)? {
                break;
            }
        }
        Ok(collector.finish())
    }

    async fn search(
        &self,
        sandbox_id: &str,
        path: &Path,
        pattern: &str,
        max_matches: usize,
    ) -> Result<SearchResults, ProviderError> {
        let _flight = self.enter(sandbox_id, false)?;
        self.record_path(path);
        RegexMatcher::new_line_matcher(pattern)
            .map_err(|err| ProviderError::InvalidPattern(err.to_string()))?;

        let scope = normalize(path);
        let state = self.state.lock().unwrap();
        let mut results = SearchResults::default();
        for (file, content) in state.files.iter().filter(|(f, _)| f.starts_with(&scope)) {
            for (idx, line) in content.lines().enumerate() {
                if !line.contains(pattern) {
                    continue;
                }
                if results.matches.len() >= max_matches {
                    results.truncated = true;
                    return Ok(results);
                }
                results.matches.push(SearchMatch {
                    path:        file.clone(),
                    line_number: idx + 1,
                    line:        line.to_string(),
                });
            }
        }
        Ok(results)
    }
}

/// One scripted reaction of [`ScriptedModel`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(ModelResponse),
    Fail(LlmError),
    /// Never resolves; used to exercise cancellation.
    Hang,
    Panic,
}

/// Model that replays a fixed script and records every transcript it was shown.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script:    Mutex<VecDeque<Scripted>>,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script:    Mutex::new(script.into_iter().collect()),
            histories: Mutex::new(Vec::new()),
        }
    }

    pub fn responses(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self::new(responses.into_iter().map(Scripted::Respond))
    }

    pub fn push(&self, item: Scripted) {
        self.script.lock().unwrap().push_back(item);
    }

    pub fn calls(&self) -> usize {
        self.histories.lock().unwrap().len()
    }

    pub fn last_history(&self) -> Vec<Message> {
        self.histories
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn respond(
        &self,
        history: &[Message],
        _tools: &[ToolName],
    ) -> Result<ModelResponse, LlmError> {
        self.histories.lock().unwrap().push(history.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Hang) => std::future::pending().await,
            Some(Scripted::Panic) => panic!("scripted model panic"),
            None => Err(LlmError::InvalidResponse("script exhausted".into())),
        }
    }
}
