//! Drives a layered execution plan with bounded per-level concurrency,
//! retries, cancellation, and skip-on-dependency-failure.
//!
//! Wave-by-wave dispatch over a `tokio::sync::Semaphore`-bounded pool
//! is the same shape the DAG executor this is grounded on uses for its
//! own wave scheduling; the retry loop is a direct generalisation of
//! that executor's per-task retry-with-timeout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::ports::{AgentSelector, SelectionCriteria, TaskExecutor};
use crate::types::{ExecutionPlan, Subtask, TaskId, TaskResult, TaskStatus, TaskWithDependencies};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub continue_on_failure: bool,
    pub level_timeout_ms: Option<u64>,
    pub total_timeout_ms: Option<u64>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            continue_on_failure: false,
            level_timeout_ms: None,
            total_timeout_ms: None,
            retry_attempts: 2,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub results: HashMap<TaskId, TaskResult>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Unwraps `{"result": <value>}` to `<value>`, per the engine's result
/// contract; any other shape passes through unchanged.
fn unwrap_result(value: Value) -> Value {
    if let Value::Object(map) = &value {
        if map.len() == 1 {
            if let Some(inner) = map.get("result") {
                return inner.clone();
            }
        }
    }
    value
}

/// Builds `task -> direct dependents` from a task list's declared
/// dependencies, for skip propagation on failure.
fn dependents_of(tasks: &[TaskWithDependencies]) -> HashMap<TaskId, Vec<TaskId>> {
    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for item in tasks {
        for dep in &item.dependencies {
            dependents.entry(dep.clone()).or_default().push(item.id.clone());
        }
    }
    dependents
}

fn transitive_dependents(roots: &[TaskId], dependents: &HashMap<TaskId, Vec<TaskId>>) -> HashSet<TaskId> {
    let mut seen = HashSet::new();
    let mut queue: Vec<TaskId> = roots.to_vec();
    while let Some(id) = queue.pop() {
        if let Some(direct) = dependents.get(&id) {
            for next in direct {
                if seen.insert(next.clone()) {
                    queue.push(next.clone());
                }
            }
        }
    }
    seen
}

pub struct ExecutionEngine<S: AgentSelector + 'static, E: TaskExecutor + 'static> {
    selector: Arc<S>,
    executor: Arc<E>,
    events: EventBus,
    config: EngineConfig,
    cancelled: Arc<AtomicBool>,
}

impl<S: AgentSelector + 'static, E: TaskExecutor + 'static> ExecutionEngine<S, E> {
    pub fn new(selector: Arc<S>, executor: Arc<E>, events: EventBus) -> Self {
        Self::with_config(selector, executor, events, EngineConfig::default())
    }

    pub fn with_config(
        selector: Arc<S>,
        executor: Arc<E>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self { selector, executor, events, config, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    async fn run_task(
        selector: Arc<S>,
        executor: Arc<E>,
        events: EventBus,
        config: EngineConfig,
        subtask: Subtask,
    ) -> TaskResult {
        let mut result = TaskResult::pending(subtask.id.clone());
        result.status = TaskStatus::Running;
        result.started_at = Some(Utc::now());
        events.publish(Event::TaskStarted { task_id: subtask.id.clone() });

        let criteria = SelectionCriteria { required_skills: subtask.required_skills.clone(), ..Default::default() };
        let max_attempts = config.retry_attempts + 1;

        for attempt in 1..=max_attempts {
            result.attempts = attempt;
            let agent = match selector.select(&criteria).await {
                Ok(agent) => agent,
                Err(err) => {
                    if attempt < max_attempts {
                        events.publish(Event::TaskRetry { task_id: subtask.id.clone(), attempt });
                        tokio::time::sleep(Duration::from_millis(config.retry_delay_ms * attempt as u64)).await;
                        continue;
                    }
                    result.status = TaskStatus::Failed;
                    result.error = Some(err.to_string());
                    result.completed_at = Some(Utc::now());
                    events.publish(Event::TaskFailed { task_id: subtask.id.clone(), error: err.to_string() });
                    return result;
                }
            };
            result.agent_id = Some(agent.id.clone());

            match executor.execute(&agent.id, &subtask).await {
                Ok(value) => {
                    result.status = TaskStatus::Completed;
                    result.result = Some(unwrap_result(value));
                    result.completed_at = Some(Utc::now());
                    events.publish(Event::TaskCompleted { task_id: subtask.id.clone() });
                    return result;
                }
                Err(err) => {
                    if attempt < max_attempts {
                        events.publish(Event::TaskRetry { task_id: subtask.id.clone(), attempt });
                        tokio::time::sleep(Duration::from_millis(config.retry_delay_ms * attempt as u64)).await;
                        continue;
                    }
                    result.status = TaskStatus::Failed;
                    result.error = Some(err.to_string());
                    result.completed_at = Some(Utc::now());
                    events.publish(Event::TaskFailed { task_id: subtask.id.clone(), error: err.to_string() });
                    return result;
                }
            }
        }
        result
    }

    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        tasks: &[TaskWithDependencies],
    ) -> Result<ExecutionResult, EngineError> {
        let by_id: HashMap<TaskId, Subtask> =
            tasks.iter().map(|t| (t.id.clone(), t.task.clone())).collect();
        let dependents = dependents_of(tasks);

        let mut results: HashMap<TaskId, TaskResult> =
            by_id.keys().map(|id| (id.clone(), TaskResult::pending(id.clone()))).collect();
        let mut skip: HashSet<TaskId> = HashSet::new();

        self.events.publish(Event::ExecutionStarted { total_tasks: by_id.len() });
        let overall = async {
            'levels: for level in &plan.levels {
                if self.cancelled.load(Ordering::SeqCst) {
                    break 'levels;
                }

                let runnable: Vec<TaskId> =
                    level.tasks.iter().filter(|id| !skip.contains(*id)).cloned().collect();
                let skipped_now: Vec<TaskId> =
                    level.tasks.iter().filter(|id| skip.contains(*id)).cloned().collect();
                for id in &skipped_now {
                    if let Some(entry) = results.get_mut(id) {
                        entry.status = TaskStatus::Skipped;
                    }
                    self.events.publish(Event::TaskSkipped { task_id: id.clone() });
                }
                if !skipped_now.is_empty() {
                    self.events.publish(Event::TasksShouldSkip { task_ids: skipped_now });
                }

                self.events
                    .publish(Event::LevelStarted { level: level.level, task_count: runnable.len() });

                let permits = runnable.len().min(self.config.max_concurrency).max(1);
                let semaphore = Arc::new(Semaphore::new(permits));
                let mut handles = Vec::new();
                for task_id in &runnable {
                    let subtask = by_id.get(task_id).cloned().expect("task present in plan");
                    let semaphore = semaphore.clone();
                    let selector = self.selector.clone();
                    let executor = self.executor.clone();
                    let events = self.events.clone();
                    let config = self.config.clone();
                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                        Self::run_task(selector, executor, events, config, subtask).await
                    }));
                }

                let level_fut = async {
                    let mut out = Vec::new();
                    for (task_id, handle) in runnable.iter().zip(handles) {
                        let result = handle.await.unwrap_or_else(|_| {
                            let mut r = TaskResult::pending(task_id.clone());
                            r.status = TaskStatus::Cancelled;
                            r
                        });
                        out.push((task_id.clone(), result));
                    }
                    out
                };

                let level_results = match self.config.level_timeout_ms {
                    Some(ms) => match timeout(Duration::from_millis(ms), level_fut).await {
                        Ok(r) => r,
                        Err(_) => runnable
                            .iter()
                            .map(|id| {
                                let mut r = TaskResult::pending(id.clone());
                                r.status = TaskStatus::Failed;
                                r.error = Some("level timed out".to_string());
                                (id.clone(), r)
                            })
                            .collect(),
                    },
                    None => level_fut.await,
                };

                let mut succeeded = 0usize;
                let mut failed = 0usize;
                let mut failed_ids = Vec::new();
                for (id, result) in level_results {
                    match result.status {
                        TaskStatus::Completed => succeeded += 1,
                        TaskStatus::Failed => {
                            failed += 1;
                            failed_ids.push(id.clone());
                        }
                        _ => {}
                    }
                    results.insert(id, result);
                }

                self.events.publish(Event::LevelCompleted { level: level.level, succeeded, failed });

                if failed > 0 {
                    let downstream = transitive_dependents(&failed_ids, &dependents);
                    let new_downstream: Vec<TaskId> =
                        downstream.iter().filter(|id| !skip.contains(*id)).cloned().collect();
                    skip.extend(downstream);
                    if !self.config.continue_on_failure {
                        // No further level starts after this break, so the
                        // should-skip notification has to happen here instead
                        // of at the top of the next level's loop iteration.
                        for id in &new_downstream {
                            if let Some(entry) = results.get_mut(id) {
                                entry.status = TaskStatus::Skipped;
                            }
                            self.events.publish(Event::TaskSkipped { task_id: id.clone() });
                        }
                        if !new_downstream.is_empty() {
                            self.events.publish(Event::TasksShouldSkip { task_ids: new_downstream });
                        }
                        self.events.publish(Event::ExecutionFailed { level: level.level });
                        break 'levels;
                    }
                }
            }
        };

        match self.config.total_timeout_ms {
            Some(ms) => {
                if timeout(Duration::from_millis(ms), overall).await.is_err() {
                    self.events.publish(Event::ExecutionCancelled);
                }
            }
            None => overall.await,
        }

        if self.cancelled.load(Ordering::SeqCst) {
            self.events.publish(Event::ExecutionCancelled);
        }

        // Anything still Pending or Running never reached a terminal state:
        // an aborted level, a total-plan timeout, an external cancel(), or a
        // task whose level was simply never reached but that wasn't itself a
        // dependent of a failed task (so the skip-propagation above never
        // touched it). All of these end the plan as cancelled.
        for result in results.values_mut() {
            if matches!(result.status, TaskStatus::Pending | TaskStatus::Running) {
                result.status = TaskStatus::Cancelled;
            }
        }

        let mut summary = ExecutionResult::default();
        for result in results.values() {
            match result.status {
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => {
                    summary.failed += 1;
                    if let Some(err) = &result.error {
                        summary.errors.push(err.clone());
                    }
                }
                TaskStatus::Cancelled => summary.cancelled += 1,
                TaskStatus::Skipped => summary.skipped += 1,
                _ => {}
            }
        }
        summary.results = results;
        self.events.publish(Event::ExecutionCompleted {
            completed: summary.completed,
            failed: summary.failed,
            cancelled: summary.cancelled,
            skipped: summary.skipped,
        });
        self.events.publish(Event::ProgressUpdated {
            completed: summary.completed,
            total: by_id.len(),
        });

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BalancerError;
    use crate::ports::ProbeOutcome;
    use crate::types::{Agent, AgentId, AgentStatus, Capabilities, Runtime};
    use async_trait::async_trait;
    use std::collections::HashSet as StdHashSet;
    use std::sync::atomic::AtomicU32;

    struct AlwaysAgent;

    #[async_trait]
    impl AgentSelector for AlwaysAgent {
        async fn select(&self, _criteria: &SelectionCriteria) -> Result<Agent, BalancerError> {
            Ok(Agent {
                id: AgentId::from("a1"),
                runtime: Runtime::Process,
                status: AgentStatus::Idle,
                capabilities: Capabilities::default(),
                current_load: 0.0,
                last_heartbeat: Utc::now(),
                metadata: Default::default(),
            })
        }
    }

    struct SucceedingExecutor;

    #[async_trait]
    impl TaskExecutor for SucceedingExecutor {
        async fn execute(&self, _agent_id: &AgentId, subtask: &Subtask) -> Result<Value, EngineError> {
            Ok(serde_json::json!({"result": subtask.id.0}))
        }
        async fn cancel(&self, _task_id: &TaskId) -> bool {
            true
        }
    }

    struct FailingExecutor {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(&self, _agent_id: &AgentId, _subtask: &Subtask) -> Result<Value, EngineError> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(EngineError::NoMatch(TaskId::from("x"), "forced failure".to_string()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
        async fn cancel(&self, _task_id: &TaskId) -> bool {
            true
        }
    }

    struct FailsOnly {
        names: StdHashSet<&'static str>,
    }

    #[async_trait]
    impl TaskExecutor for FailsOnly {
        async fn execute(&self, _agent_id: &AgentId, subtask: &Subtask) -> Result<Value, EngineError> {
            if self.names.contains(subtask.id.0.as_str()) {
                Err(EngineError::NoMatch(subtask.id.clone(), "forced failure".to_string()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
        async fn cancel(&self, _task_id: &TaskId) -> bool {
            true
        }
    }

    fn task(id: &str, deps: &[&str]) -> TaskWithDependencies {
        TaskWithDependencies::new(
            Subtask::new(id, id),
            deps.iter().map(|d| TaskId::from(*d)).collect::<StdHashSet<_>>(),
        )
    }

    #[tokio::test]
    async fn completes_every_task_and_unwraps_result_envelope() {
        let tasks = vec![task("A", &[])];
        let resolver = crate::resolver::DependencyResolver::new();
        resolver.build_graph(&tasks).unwrap();
        let plan = resolver.get_execution_plan().unwrap();

        let engine = ExecutionEngine::new(Arc::new(AlwaysAgent), Arc::new(SucceedingExecutor), EventBus::default());
        let result = engine.execute(&plan, &tasks).await.unwrap();
        assert_eq!(result.completed, 1);
        assert_eq!(result.results[&TaskId::from("A")].result, Some(serde_json::json!("A")));
    }

    #[tokio::test]
    async fn failure_skips_dependents_when_not_continuing() {
        let tasks = vec![task("A", &[]), task("B", &["A"]), task("C", &[])];
        let resolver = crate::resolver::DependencyResolver::new();
        resolver.build_graph(&tasks).unwrap();
        let plan = resolver.get_execution_plan().unwrap();

        let config = EngineConfig { retry_attempts: 0, retry_delay_ms: 1, ..EngineConfig::default() };
        let executor = FailingExecutor { failures_left: AtomicU32::new(100) };
        let engine =
            ExecutionEngine::with_config(Arc::new(AlwaysAgent), Arc::new(executor), EventBus::default(), config);
        let result = engine.execute(&plan, &tasks).await.unwrap();

        assert_eq!(result.results[&TaskId::from("A")].status, TaskStatus::Failed);
        assert_eq!(result.results[&TaskId::from("B")].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn abort_cancels_unreached_tasks_not_downstream_of_a_failure() {
        // A fails, X is independent and succeeds at the same level, B depends
        // on A, Y depends on X. Aborting after level 0 must not leave Y
        // (downstream of the healthy X, never itself scheduled) stuck Pending.
        let tasks = vec![task("A", &[]), task("X", &[]), task("B", &["A"]), task("Y", &["X"])];
        let resolver = crate::resolver::DependencyResolver::new();
        resolver.build_graph(&tasks).unwrap();
        let plan = resolver.get_execution_plan().unwrap();

        let config = EngineConfig { retry_attempts: 0, retry_delay_ms: 1, ..EngineConfig::default() };
        let executor = FailsOnly { names: StdHashSet::from(["A"]) };
        let engine =
            ExecutionEngine::with_config(Arc::new(AlwaysAgent), Arc::new(executor), EventBus::default(), config);
        let result = engine.execute(&plan, &tasks).await.unwrap();

        assert_eq!(result.results[&TaskId::from("A")].status, TaskStatus::Failed);
        assert_eq!(result.results[&TaskId::from("X")].status, TaskStatus::Completed);
        assert_eq!(result.results[&TaskId::from("B")].status, TaskStatus::Skipped);
        assert_eq!(result.results[&TaskId::from("Y")].status, TaskStatus::Cancelled);
        assert_eq!(result.completed + result.failed + result.cancelled + result.skipped, 4);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let tasks = vec![task("A", &[])];
        let resolver = crate::resolver::DependencyResolver::new();
        resolver.build_graph(&tasks).unwrap();
        let plan = resolver.get_execution_plan().unwrap();

        let config = EngineConfig { retry_attempts: 2, retry_delay_ms: 1, ..EngineConfig::default() };
        let executor = FailingExecutor { failures_left: AtomicU32::new(2) };
        let engine =
            ExecutionEngine::with_config(Arc::new(AlwaysAgent), Arc::new(executor), EventBus::default(), config);
        let result = engine.execute(&plan, &tasks).await.unwrap();
        assert_eq!(result.completed, 1);
        assert_eq!(result.results[&TaskId::from("A")].attempts, 3);
    }
}
