//! In-memory container engine for tests.
//!
//! Containers follow scripted behavior chosen by matching their command
//! line against registered patterns. The engine counts pulls and removals
//! and can reproduce the auto-removal races a real engine exhibits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use container_engine_interface::{
    ContainerEngine, ContainerInfo, EngineResult, LabelFilter, OutputChunk, OutputStream,
    RemovalNotice, WaitCondition, WaitOutcome,
};
use harness_shared_types::{ContainerSpec, EngineError, ImageRef};

/// Exit code reported for a container force-removed while running.
const KILLED_EXIT_CODE: i64 = 137;

/// Ordering races a script can reproduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Race {
    /// The container is deleted before start sees it.
    RemovedBeforeStart,
    /// The container exits and is deleted during start, before any wait call.
    RemovedBeforeWait,
    /// The wait call never resolves; only the removal signal does.
    RemovalBeforeWaitResult,
}

/// Scripted behavior of one container.
#[derive(Debug, Clone, Default)]
pub struct JobScript {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub run_for: Duration,
    pub never_exits: bool,
    pub race: Option<Race>,
    pub wait_error: Option<String>,
    /// The attach stream stays open after the container exits.
    pub output_stays_open: bool,
}

impl JobScript {
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn never_exits() -> Self {
        Self {
            never_exits: true,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, data: impl AsRef<[u8]>) -> Self {
        self.stdout = data.as_ref().to_vec();
        self
    }

    pub fn stderr(mut self, data: impl AsRef<[u8]>) -> Self {
        self.stderr = data.as_ref().to_vec();
        self
    }

    pub fn running_for(mut self, duration: Duration) -> Self {
        self.run_for = duration;
        self
    }

    pub fn removed_before_start(mut self) -> Self {
        self.race = Some(Race::RemovedBeforeStart);
        self
    }

    pub fn removed_before_wait(mut self) -> Self {
        self.race = Some(Race::RemovedBeforeWait);
        self
    }

    pub fn removal_before_wait_result(mut self) -> Self {
        self.race = Some(Race::RemovalBeforeWaitResult);
        self
    }

    pub fn wait_error(mut self, message: impl Into<String>) -> Self {
        self.wait_error = Some(message.into());
        self
    }

    pub fn output_stays_open(mut self) -> Self {
        self.output_stays_open = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockStatus {
    Created,
    Running,
    Exited(i64),
    Removed(Option<i64>),
}

impl MockStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, MockStatus::Exited(_) | MockStatus::Removed(_))
    }

    fn exit_code(&self) -> Option<i64> {
        match self {
            MockStatus::Exited(code) => Some(*code),
            MockStatus::Removed(code) => *code,
            _ => None,
        }
    }
}

struct MockContainer {
    id: String,
    name: String,
    spec: ContainerSpec,
    script: JobScript,
}

#[derive(Default)]
struct MockState {
    images: HashSet<ImageRef>,
    unknown_repositories: HashSet<String>,
    pulls: HashMap<ImageRef, usize>,
    pull_delay: Duration,
    create_delay: Duration,
    start_delay: Duration,
    scripts: Vec<(String, JobScript)>,
    containers: HashMap<String, MockContainer>,
    // Kept after removal so late waiters still see the final status.
    statuses: HashMap<String, watch::Sender<MockStatus>>,
    created: Vec<(String, ContainerSpec)>,
    volumes: BTreeMap<String, BTreeMap<String, String>>,
    networks: BTreeMap<String, (String, BTreeMap<String, String>)>,
    fail_container_removals: bool,
    fail_volume_removals: bool,
    fail_attaches: bool,
    fail_starts: bool,
    remove_calls: usize,
}

impl MockState {
    fn find(&self, id_or_name: &str) -> Option<&MockContainer> {
        self.containers
            .get(id_or_name)
            .or_else(|| self.containers.values().find(|c| c.name == id_or_name))
    }

    fn set_status(&self, id: &str, status: MockStatus) {
        if let Some(tx) = self.statuses.get(id) {
            tx.send_replace(status);
        }
    }

    fn status(&self, id: &str) -> Option<MockStatus> {
        self.statuses.get(id).map(|tx| *tx.borrow())
    }

    fn subscribe(&self, id: &str) -> EngineResult<watch::Receiver<MockStatus>> {
        if !self.containers.contains_key(id) {
            return Err(EngineError::NotFound(format!("No such container: {}", id)));
        }
        self.statuses
            .get(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))
    }

    /// Mark exited and, for auto-remove containers, delete.
    fn finish(&mut self, id: &str, code: i64) {
        let auto_remove = match self.containers.get(id) {
            Some(c) => c.spec.auto_remove,
            None => return,
        };
        self.set_status(id, MockStatus::Exited(code));
        if auto_remove {
            self.containers.remove(id);
            self.set_status(id, MockStatus::Removed(Some(code)));
        }
    }
}

struct MockInner {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockInner {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn create(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String> {
        let mut state = self.state();
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
        }
        if state.containers.values().any(|c| c.name == name) {
            return Err(EngineError::Conflict(format!(
                "container name {} is already in use",
                name
            )));
        }

        let id = format!("{:064x}", self.next_id());
        let script = MockEngine::script_for(&state, spec);
        let (tx, _) = watch::channel(MockStatus::Created);
        state.statuses.insert(id.clone(), tx);
        state.created.push((name.to_string(), spec.clone()));
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                spec: spec.clone(),
                script,
            },
        );
        debug!(container_id = %id, name, "Mock container created");
        Ok(id)
    }
}

/// Scriptable in-memory [`ContainerEngine`].
#[derive(Clone)]
pub struct MockEngine {
    inner: Arc<MockInner>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // ==================== Scripting ====================

    /// Use `script` for containers whose command line contains `pattern`.
    /// Earlier registrations win.
    pub fn on_command(&self, pattern: impl Into<String>, script: JobScript) {
        self.inner.state().scripts.push((pattern.into(), script));
    }

    pub fn add_image(&self, image: &ImageRef) {
        self.inner.state().images.insert(image.clone());
    }

    /// Pulls of this repository fail as if it did not exist.
    pub fn add_unknown_repository(&self, repository: impl Into<String>) {
        self.inner.state().unknown_repositories.insert(repository.into());
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.inner.state().pull_delay = delay;
    }

    /// Containers appear this long after the create request, even if the
    /// caller stops waiting for the answer.
    pub fn set_create_delay(&self, delay: Duration) {
        self.inner.state().create_delay = delay;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.inner.state().start_delay = delay;
    }

    pub fn fail_attaches(&self, fail: bool) {
        self.inner.state().fail_attaches = fail;
    }

    pub fn fail_starts(&self, fail: bool) {
        self.inner.state().fail_starts = fail;
    }

    pub fn fail_container_removals(&self, fail: bool) {
        self.inner.state().fail_container_removals = fail;
    }

    pub fn fail_volume_removals(&self, fail: bool) {
        self.inner.state().fail_volume_removals = fail;
    }

    // ==================== Inspection ====================

    pub fn pull_count(&self, image: &ImageRef) -> usize {
        self.inner.state().pulls.get(image).copied().unwrap_or(0)
    }

    pub fn remove_calls(&self) -> usize {
        self.inner.state().remove_calls
    }

    pub fn container_count(&self) -> usize {
        self.inner.state().containers.len()
    }

    pub fn volume_count(&self) -> usize {
        self.inner.state().volumes.len()
    }

    /// Name and spec of every container ever created, in order.
    pub fn created_specs(&self) -> Vec<(String, ContainerSpec)> {
        self.inner.state().created.clone()
    }

    fn script_for(state: &MockState, spec: &ContainerSpec) -> JobScript {
        let command_line = spec
            .entrypoint
            .iter()
            .chain(spec.args.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        state
            .scripts
            .iter()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn image_exists(&self, image: &ImageRef) -> EngineResult<bool> {
        Ok(self.inner.state().images.contains(image))
    }

    async fn pull_image(&self, image: &ImageRef) -> EngineResult<()> {
        let (delay, unknown) = {
            let mut state = self.inner.state();
            *state.pulls.entry(image.clone()).or_default() += 1;
            (
                state.pull_delay,
                state.unknown_repositories.contains(&image.repository),
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if unknown {
            return Err(EngineError::NotFound(format!(
                "pull access denied for {}, repository does not exist",
                image.repository
            )));
        }

        self.inner.state().images.insert(image.clone());
        Ok(())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String> {
        let delay = self.inner.state().create_delay;
        if delay.is_zero() {
            return self.inner.create(name, spec);
        }

        let inner = self.inner.clone();
        let name = name.to_string();
        let spec = spec.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.create(&name, &spec)
        })
        .await
        .map_err(|e| EngineError::Transport(e.to_string()))?
    }

    async fn attach_container(&self, id: &str) -> EngineResult<OutputStream> {
        let (mut rx, script) = {
            let state = self.inner.state();
            if state.fail_attaches {
                return Err(EngineError::Api {
                    status: 500,
                    message: "attach failed: hijack connection refused".to_string(),
                });
            }
            let script = state
                .containers
                .get(id)
                .map(|c| c.script.clone())
                .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
            (state.subscribe(id)?, script)
        };

        let mut chunks: Vec<EngineResult<OutputChunk>> = Vec::new();
        if !script.stdout.is_empty() {
            chunks.push(Ok(OutputChunk::Stdout(script.stdout)));
        }
        if !script.stderr.is_empty() {
            chunks.push(Ok(OutputChunk::Stderr(script.stderr)));
        }

        if script.output_stays_open {
            return Ok(Box::pin(stream::iter(chunks).chain(stream::pending())));
        }
        let until_exit = stream::once(async move {
            let _ = rx.wait_for(MockStatus::is_terminal).await;
        })
        .filter_map(|_| async { None::<EngineResult<OutputChunk>> });

        Ok(Box::pin(stream::iter(chunks).chain(until_exit)))
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let delay = self.inner.state().start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let script = {
            let mut state = self.inner.state();
            if state.fail_starts {
                return Err(EngineError::Api {
                    status: 500,
                    message: "OCI runtime create failed: unable to start container process".to_string(),
                });
            }
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
            let script = container.script.clone();

            if script.race == Some(Race::RemovedBeforeStart) {
                state.containers.remove(id);
                state.set_status(id, MockStatus::Removed(None));
                return Err(EngineError::NotFound(format!("No such container: {}", id)));
            }
            if state.status(id) != Some(MockStatus::Created) {
                return Ok(());
            }
            state.set_status(id, MockStatus::Running);

            if script.race == Some(Race::RemovedBeforeWait) {
                state.finish(id, script.exit_code);
                return Ok(());
            }
            script
        };

        if script.never_exits {
            return Ok(());
        }

        let inner = self.inner.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if !script.run_for.is_zero() {
                tokio::time::sleep(script.run_for).await;
            }
            let mut state = inner.state();
            if state.status(&id) == Some(MockStatus::Running) {
                state.finish(&id, script.exit_code);
            }
        });
        Ok(())
    }

    async fn wait_container(&self, id: &str, condition: WaitCondition) -> EngineResult<WaitOutcome> {
        let (mut rx, script) = {
            let state = self.inner.state();
            let rx = state.subscribe(id)?;
            let script = state.containers.get(id).map(|c| c.script.clone()).unwrap_or_default();
            (rx, script)
        };

        if script.race == Some(Race::RemovalBeforeWaitResult) {
            return std::future::pending().await;
        }

        let status = *rx
            .wait_for(|s| match condition {
                WaitCondition::NotRunning => s.is_terminal(),
                WaitCondition::Removed => matches!(s, MockStatus::Removed(_)),
            })
            .await
            .map_err(|e| EngineError::Stream(e.to_string()))?;

        Ok(WaitOutcome {
            status_code: status.exit_code().unwrap_or(KILLED_EXIT_CODE),
            error: script.wait_error,
        })
    }

    async fn wait_removed(&self, id: &str) -> EngineResult<RemovalNotice> {
        // Unlike the other calls this also follows containers that are
        // already gone, like an event stream replaying recent history.
        let mut rx = self
            .inner
            .state()
            .statuses
            .get(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        let status = *rx
            .wait_for(|s| matches!(s, MockStatus::Removed(_)))
            .await
            .map_err(|e| EngineError::Stream(e.to_string()))?;
        Ok(RemovalNotice {
            exit_code: status.exit_code(),
        })
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        let mut state = self.inner.state();
        state.remove_calls += 1;
        if state.fail_container_removals {
            return Err(EngineError::Api {
                status: 500,
                message: "driver failed to remove container".to_string(),
            });
        }

        let id = state
            .find(id)
            .map(|c| c.id.clone())
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        let status = state.status(&id);
        if status == Some(MockStatus::Running) && !force {
            return Err(EngineError::Conflict(format!(
                "cannot remove running container {}",
                id
            )));
        }

        state.containers.remove(&id);
        let exit_code = status.and_then(|s| s.exit_code());
        state.set_status(&id, MockStatus::Removed(exit_code));
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> EngineResult<Option<ContainerInfo>> {
        let state = self.inner.state();
        Ok(state.find(id_or_name).map(|c| ContainerInfo {
            id: c.id.clone(),
            name: c.name.clone(),
            labels: c.spec.labels.clone(),
            running: state.status(&c.id) == Some(MockStatus::Running),
        }))
    }

    async fn list_containers(&self, filter: &LabelFilter) -> EngineResult<Vec<ContainerInfo>> {
        let state = self.inner.state();
        Ok(state
            .containers
            .values()
            .filter(|c| filter.matches(&c.spec.labels))
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.name.clone(),
                labels: c.spec.labels.clone(),
                running: state.status(&c.id) == Some(MockStatus::Running),
            })
            .collect())
    }

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> EngineResult<String> {
        self.inner
            .state()
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(name.to_string())
    }

    async fn list_volumes(&self, filter: &LabelFilter) -> EngineResult<Vec<String>> {
        Ok(self
            .inner
            .state()
            .volumes
            .iter()
            .filter(|(_, labels)| filter.matches(labels))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        let mut state = self.inner.state();
        if state.fail_volume_removals {
            return Err(EngineError::Conflict(format!("volume is in use - [{}]", name)));
        }
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("No such volume: {}", name)))
    }

    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>) -> EngineResult<String> {
        let mut state = self.inner.state();
        if state.networks.values().any(|(n, _)| n == name) {
            return Err(EngineError::Conflict(format!("network with name {} already exists", name)));
        }
        let id = format!("net-{}", self.inner.next_id());
        state.networks.insert(id.clone(), (name.to_string(), labels.clone()));
        Ok(id)
    }

    async fn list_networks(&self, filter: &LabelFilter) -> EngineResult<Vec<String>> {
        Ok(self
            .inner
            .state()
            .networks
            .iter()
            .filter(|(_, (_, labels))| filter.matches(labels))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn remove_network(&self, id: &str) -> EngineResult<()> {
        self.inner
            .state()
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("No such network: {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::RunScope;
    use crate::spec::{self, ContainerOptions};

    fn spec_for(cmd: &str, auto_remove: bool) -> ContainerSpec {
        spec::build(
            ImageRef::new("busybox", "stable"),
            vec!["sh".into(), "-c".into(), cmd.into()],
            ContainerOptions::for_scope(&RunScope::new("TestMock")).auto_remove(auto_remove),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let engine = MockEngine::new();
        let err = engine.create_container("a", &spec_for("true", true)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let engine = MockEngine::new();
        engine.add_image(&ImageRef::new("busybox", "stable"));
        engine.create_container("a", &spec_for("true", true)).await.unwrap();
        let err = engine.create_container("a", &spec_for("true", true)).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_script_matching_and_exit() {
        let engine = MockEngine::new();
        engine.add_image(&ImageRef::new("busybox", "stable"));
        engine.on_command("exit 9", JobScript::exit(9));

        let id = engine.create_container("a", &spec_for("exit 9", false)).await.unwrap();
        engine.start_container(&id).await.unwrap();
        let outcome = engine.wait_container(&id, WaitCondition::NotRunning).await.unwrap();
        assert_eq!(outcome, WaitOutcome::exited(9));
        assert!(engine.inspect_container(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_force_remove_running_container() {
        let engine = MockEngine::new();
        engine.add_image(&ImageRef::new("busybox", "stable"));
        engine.on_command("sleep", JobScript::never_exits());

        let id = engine.create_container("a", &spec_for("sleep 100", true)).await.unwrap();
        engine.start_container(&id).await.unwrap();
        assert!(matches!(
            engine.remove_container(&id, false).await,
            Err(EngineError::Conflict(_))
        ));
        engine.remove_container("a", true).await.unwrap();
        assert_eq!(engine.container_count(), 0);
        assert_eq!(engine.remove_calls(), 2);
    }

    #[tokio::test]
    async fn test_delayed_create_lands_without_a_waiter() {
        let engine = MockEngine::new();
        engine.add_image(&ImageRef::new("busybox", "stable"));
        engine.set_create_delay(Duration::from_millis(20));

        let spec = spec_for("true", true);
        let create = engine.create_container("a", &spec);
        assert!(tokio::time::timeout(Duration::from_millis(5), create).await.is_err());
        assert_eq!(engine.container_count(), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.container_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_attach_and_start() {
        let engine = MockEngine::new();
        engine.add_image(&ImageRef::new("busybox", "stable"));
        let id = engine.create_container("a", &spec_for("true", true)).await.unwrap();

        engine.fail_attaches(true);
        assert!(matches!(
            engine.attach_container(&id).await,
            Err(EngineError::Api { status: 500, .. })
        ));
        engine.fail_starts(true);
        assert!(matches!(
            engine.start_container(&id).await,
            Err(EngineError::Api { status: 500, .. })
        ));
        assert_eq!(engine.container_count(), 1);
    }
}
