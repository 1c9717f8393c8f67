use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, SystemTime},
};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    env::{CopyOutcome, copy_if_absent},
    output::{OutputMode, print_group},
    probe::{ProbeError, Prober, Readiness},
    record::{RunRecord, RunReport},
    state::{Precondition, StateTracker},
    supervisor::{ServiceState, StartOutcome, StopOutcome, Supervisor},
    task::{Action, SkipReason, Task, TaskGraph, TaskStatus},
    util::{CommandError, CommandRunner, output_print_lock, parse_timeout},
};

/// How long a service without a health check must stay up after starting.
const STARTUP_GRACE: Duration = Duration::from_millis(500);

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub workers: Option<usize>,
    pub fail_fast: bool,
    pub default_timeout: Option<String>,
    pub output: OutputMode,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: None,
            fail_fast: false,
            default_timeout: None,
            output: OutputMode::Group,
        }
    }
}

/// Statuses, records and the transition log of one run. Each update holds
/// the lock for a single transition.
#[derive(Default)]
struct StatusBoard {
    statuses: HashMap<String, TaskStatus>,
    records: Vec<RunRecord>,
    transitions: Vec<(String, TaskStatus)>,
}

impl StatusBoard {
    fn transition(&mut self, task_id: &str, status: TaskStatus) {
        self.statuses.insert(task_id.to_string(), status.clone());
        self.transitions.push((task_id.to_string(), status));
    }

    fn finish(&mut self, record: RunRecord) {
        self.transition(record.task(), record.status().clone());
        self.records.push(record);
    }
}

type SharedBoard = Arc<Mutex<StatusBoard>>;

fn lock(board: &SharedBoard) -> MutexGuard<'_, StatusBoard> {
    board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum DependencyState {
    Ready,
    Waiting,
    Broken(String),
}

#[derive(Clone)]
struct TaskContext {
    supervisor: Arc<Supervisor>,
    prober: Arc<Prober>,
    tracker: Arc<StateTracker>,
    runner: Arc<dyn CommandRunner>,
    default_timeout: Option<String>,
    output: OutputMode,
}

pub struct Executor {
    graph: Arc<TaskGraph>,
    context: TaskContext,
    workers: usize,
    fail_fast: bool,
}

impl Executor {
    pub fn new(
        graph: Arc<TaskGraph>,
        supervisor: Arc<Supervisor>,
        prober: Arc<Prober>,
        tracker: Arc<StateTracker>,
        runner: Arc<dyn CommandRunner>,
        options: ExecutorOptions,
    ) -> Self {
        let workers = options.workers.unwrap_or_else(default_workers).max(1);
        Self {
            graph,
            context: TaskContext {
                supervisor,
                prober,
                tracker,
                runner,
                default_timeout: options.default_timeout,
                output: options.output,
            },
            workers,
            fail_fast: options.fail_fast,
        }
    }

    /// Runs `order` (as returned by `TaskGraph::resolve`). A task starts once
    /// all of its dependencies succeeded or were already satisfied; a failed
    /// task takes its dependents down with it but not its siblings.
    pub async fn run(&self, order: &[String], cancel: &CancellationToken) -> RunReport {
        let board: SharedBoard = Arc::new(Mutex::new(StatusBoard::default()));
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let in_run: HashSet<&str> = order.iter().map(String::as_str).collect();

        let mut waiting: Vec<&Task> = order.iter().filter_map(|id| self.graph.get(id)).collect();
        {
            let mut board = lock(&board);
            for task in &waiting {
                board.transition(&task.id, TaskStatus::Pending);
                if !task.dependencies.is_empty() {
                    board.transition(&task.id, TaskStatus::Blocked);
                }
            }
        }

        info!(
            "Running {} tasks with up to {} workers",
            waiting.len(),
            self.workers
        );

        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;

        loop {
            if !halted && cancel.is_cancelled() {
                halted = true;
            }

            if !halted {
                let mut still_waiting = Vec::with_capacity(waiting.len());
                for task in waiting.drain(..) {
                    match dependency_state(task, &board, &in_run) {
                        DependencyState::Ready => {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                still_waiting.push(task);
                                continue;
                            };
                            debug!("Scheduling task '{}'", task.id);
                            let handle = tokio::spawn(run_task(
                                task.clone(),
                                self.context.clone(),
                                Arc::clone(&board),
                                permit,
                                cancel.clone(),
                            ));
                            let task_id = task.id.clone();
                            in_flight.push(async move { (task_id, handle.await) });
                        }
                        DependencyState::Waiting => still_waiting.push(task),
                        DependencyState::Broken(dependency) => {
                            info!(
                                "Skipping '{}': dependency '{}' did not succeed",
                                task.id, dependency
                            );
                            lock(&board).finish(RunRecord::not_run(
                                &task.id,
                                TaskStatus::Skipped(SkipReason::DependencyFailed(dependency)),
                            ));
                        }
                    }
                }
                waiting = still_waiting;
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((task_id, joined)) = in_flight.next() => {
                    let status = match joined {
                        Ok(status) => status,
                        Err(e) => {
                            error!("Task '{}' panicked: {}", task_id, e);
                            let status = TaskStatus::Failed(format!("panicked: {}", e));
                            lock(&board).finish(RunRecord::not_run(&task_id, status.clone()));
                            status
                        }
                    };

                    if self.fail_fast && !halted && matches!(status, TaskStatus::Failed(_)) {
                        warn!("Task '{}' failed, not starting any further tasks (fail-fast)", task_id);
                        halted = true;
                    }
                }
                _ = cancel.cancelled(), if !halted => {
                    warn!("Cancellation requested, not starting any further tasks");
                    halted = true;
                }
            }
        }

        {
            let mut board = lock(&board);
            for task in waiting {
                board.finish(RunRecord::not_run(
                    &task.id,
                    TaskStatus::Skipped(SkipReason::Aborted),
                ));
            }
        }

        if cancel.is_cancelled() {
            for (unit, result) in self.context.supervisor.stop_starting().await {
                match result {
                    Ok(outcome) => debug!("'{}' after cancellation: {:?}", unit, outcome),
                    Err(e) => warn!("Could not stop '{}' after cancellation: {}", unit, e),
                }
            }
        }

        let board = match Arc::try_unwrap(board) {
            Ok(board) => board.into_inner().unwrap_or_else(|p| p.into_inner()),
            Err(shared) => std::mem::take(&mut *lock(&shared)),
        };

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(index, id)| (id.as_str(), index))
            .collect();
        let mut records = board.records;
        records.sort_by_key(|r| position.get(r.task()).copied().unwrap_or(usize::MAX));

        RunReport {
            records,
            transitions: board.transitions,
            cancelled: cancel.is_cancelled(),
        }
    }
}

fn dependency_state(task: &Task, board: &SharedBoard, in_run: &HashSet<&str>) -> DependencyState {
    let board = lock(board);

    for dep in &task.dependencies {
        if !in_run.contains(dep.as_str()) {
            continue;
        }
        match board.statuses.get(dep) {
            Some(status) if status.unblocks_dependents() => {}
            Some(status) if status.is_final() => return DependencyState::Broken(dep.clone()),
            _ => return DependencyState::Waiting,
        }
    }

    DependencyState::Ready
}

async fn run_task(
    task: Task,
    ctx: TaskContext,
    board: SharedBoard,
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) -> TaskStatus {
    let started_at = SystemTime::now();

    if cancel.is_cancelled() {
        let status = TaskStatus::Skipped(SkipReason::Aborted);
        lock(&board).finish(RunRecord::not_run(&task.id, status.clone()));
        return status;
    }

    if let Precondition::Satisfied(reason) = ctx.tracker.check(&task).await {
        info!("Task '{}': {}, skipping", task.id, reason);
        let status = TaskStatus::Skipped(SkipReason::Satisfied(reason));
        lock(&board).finish(RunRecord::new(
            &task.id,
            started_at,
            SystemTime::now(),
            status.clone(),
            String::new(),
        ));
        return status;
    }

    lock(&board).transition(&task.id, TaskStatus::Running);
    info!("Running task '{}': {}", task.id, task.action);

    let (status, output) = tokio::select! {
        _ = cancel.cancelled() => {
            (TaskStatus::Failed("interrupted by cancellation".to_string()), String::new())
        }
        result = perform(&task, &ctx, &cancel) => result,
    };

    match &status {
        TaskStatus::Failed(reason) => error!("Task '{}' failed: {}", task.id, reason),
        TaskStatus::Skipped(reason) => info!("Task '{}' skipped: {}", task.id, reason),
        _ => info!("Task '{}' succeeded", task.id),
    }

    lock(&board).finish(RunRecord::new(
        &task.id,
        started_at,
        SystemTime::now(),
        status.clone(),
        output,
    ));
    status
}

async fn perform(task: &Task, ctx: &TaskContext, cancel: &CancellationToken) -> (TaskStatus, String) {
    match &task.action {
        Action::Command { command, .. } => {
            let timeout = parse_timeout(task.timeout.as_deref(), ctx.default_timeout.as_deref());

            match ctx.runner.run(command, timeout).await {
                Ok(output) => {
                    let text = output.combined();
                    if ctx.output == OutputMode::Group {
                        let _guard = output_print_lock().lock().await;
                        print_group(&task.id, &text);
                    }
                    if output.success() {
                        ctx.tracker.record_success(task);
                        (TaskStatus::Succeeded, text)
                    } else {
                        (TaskStatus::Failed(output.describe_status()), text)
                    }
                }
                Err(CommandError::Timeout) => {
                    let limit = timeout
                        .map(|t| humantime::format_duration(t).to_string())
                        .unwrap_or_default();
                    (TaskStatus::Failed(format!("timed out after {}", limit)), String::new())
                }
                Err(e) => (TaskStatus::Failed(e.to_string()), String::new()),
            }
        }
        Action::CopyIfAbsent { from, to } => match copy_if_absent(from, to) {
            Ok(CopyOutcome::Created) => (
                TaskStatus::Succeeded,
                format!("created {} from {}", to.display(), from.display()),
            ),
            Ok(CopyOutcome::AlreadyPresent) => (
                TaskStatus::Skipped(SkipReason::Satisfied(format!(
                    "{} already exists",
                    to.display()
                ))),
                String::new(),
            ),
            Err(e) => (TaskStatus::Failed(e.to_string()), String::new()),
        },
        Action::Start { service } => start_service(service, ctx, cancel).await,
        Action::Stop { service } => match ctx.supervisor.stop(service).await {
            Ok(StopOutcome::Stopped) => (TaskStatus::Succeeded, format!("{} stopped", service)),
            Ok(StopOutcome::NotRunning) => (
                TaskStatus::Skipped(SkipReason::Satisfied(format!("{} is not running", service))),
                String::new(),
            ),
            Err(e) => (TaskStatus::Failed(e.to_string()), String::new()),
        },
    }
}

/// Start, then wait for readiness. A readiness timeout counts as a failed start.
async fn start_service(
    service: &str,
    ctx: &TaskContext,
    cancel: &CancellationToken,
) -> (TaskStatus, String) {
    let outcome = match ctx.supervisor.start(service).await {
        Ok(outcome) => outcome,
        Err(e) => return (TaskStatus::Failed(e.to_string()), String::new()),
    };
    let started = match outcome {
        StartOutcome::Started => format!("{} started", service),
        StartOutcome::AlreadyRunning => format!("{} was already running", service),
    };

    let Some(check) = ctx.supervisor.unit(service).and_then(|u| u.health.clone()) else {
        if outcome == StartOutcome::Started {
            match ctx.supervisor.confirm_running(service, STARTUP_GRACE).await {
                Ok(ServiceState::StoppedWithError(reason)) => {
                    return (
                        TaskStatus::Failed(format!("{} stopped right after start: {}", service, reason)),
                        started,
                    );
                }
                Ok(_) => {}
                Err(e) => return (TaskStatus::Failed(e.to_string()), started),
            }
        }
        mark(ctx, service, ServiceState::Healthy).await;
        return (TaskStatus::Succeeded, started);
    };

    match ctx.prober.wait_healthy(&check, cancel).await {
        Ok(Readiness::Healthy { attempts }) => {
            mark(ctx, service, ServiceState::Healthy).await;
            (
                TaskStatus::Succeeded,
                format!("{}, ready after {} probe(s)", started, attempts),
            )
        }
        Ok(Readiness::Timeout { attempts }) => {
            mark(ctx, service, ServiceState::Unhealthy).await;
            (
                TaskStatus::Failed(format!(
                    "{} not ready after {} attempts ({})",
                    service,
                    attempts,
                    humantime::format_duration(check.budget())
                )),
                started,
            )
        }
        Err(e @ ProbeError::Cancelled(_)) => (TaskStatus::Failed(e.to_string()), started),
        Err(e) => {
            mark(ctx, service, ServiceState::Unhealthy).await;
            (TaskStatus::Failed(e.to_string()), started)
        }
    }
}

async fn mark(ctx: &TaskContext, service: &str, state: ServiceState) {
    if let Err(e) = ctx.supervisor.mark(service, state).await {
        warn!("Could not record state of '{}': {}", service, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::Duration};

    use crate::{
        cache::Cache,
        error::{EXIT_CANCELLED, EXIT_TASKS_FAILED},
        probe::{Probe, tests::{CountingProbe, tcp_check}},
        record::Verdict,
        supervisor::{ServiceUnit, UnitKind, tests::container},
        task::dependency::tests::task,
        testing::ScriptedRunner,
    };

    struct Harness {
        runner: Arc<ScriptedRunner>,
        supervisor: Arc<Supervisor>,
        graph: Arc<TaskGraph>,
        probe: Arc<dyn Probe>,
    }

    impl Harness {
        fn new(tasks: Vec<Task>, units: Vec<ServiceUnit>, probe: Arc<dyn Probe>) -> Self {
            let runner = ScriptedRunner::new();
            let supervisor = Arc::new(Supervisor::new(units, runner.clone(), Arc::clone(&probe)));
            let graph = Arc::new(TaskGraph::new(tasks));
            graph.validate().unwrap();
            Self {
                runner,
                supervisor,
                graph,
                probe,
            }
        }

        fn executor(&self, options: ExecutorOptions) -> Executor {
            let tracker = Arc::new(StateTracker::new(
                Arc::clone(&self.supervisor),
                Cache::default(),
            ));
            Executor::new(
                Arc::clone(&self.graph),
                Arc::clone(&self.supervisor),
                Arc::new(Prober::new(Arc::clone(&self.probe))),
                tracker,
                self.runner.clone(),
                options,
            )
        }

        async fn run(&self, targets: &[&str], options: ExecutorOptions) -> RunReport {
            let order = self.graph.resolve(targets).unwrap();
            self.executor(options)
                .run(&order, &CancellationToken::new())
                .await
        }
    }

    fn start(id: &str, service: &str, deps: &[&str]) -> Task {
        Task {
            action: Action::Start {
                service: service.to_string(),
            },
            ..task(id, deps)
        }
    }

    fn healthy_container(name: &str) -> ServiceUnit {
        ServiceUnit {
            health: Some(tcp_check(name, Duration::from_millis(10), 5)),
            ..container(name)
        }
    }

    #[tokio::test]
    async fn failure_skips_dependents_but_not_siblings() {
        let harness = Harness::new(
            vec![task("a", &[]), task("b", &[]), task("c", &["a"])],
            vec![],
            CountingProbe::ready_on(1),
        );
        harness.runner.respond("echo a", 1, "boom");

        let report = harness.run(&["b", "c"], ExecutorOptions::default()).await;

        assert!(matches!(report.status_of("a"), Some(TaskStatus::Failed(_))));
        assert_eq!(report.status_of("b"), Some(&TaskStatus::Succeeded));
        assert_eq!(
            report.status_of("c"),
            Some(&TaskStatus::Skipped(SkipReason::DependencyFailed("a".to_string())))
        );
        assert_eq!(report.verdict(), Verdict::Failed);
        assert_eq!(report.exit_code(), EXIT_TASKS_FAILED);
        assert_eq!(report.record("a").unwrap().output(), "boom");
        assert!(!harness.runner.was_called("echo c"));
    }

    #[tokio::test]
    async fn skipped_dependency_failure_propagates_transitively() {
        let harness = Harness::new(
            vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])],
            vec![],
            CountingProbe::ready_on(1),
        );
        harness.runner.respond("echo a", 2, "");

        let report = harness.run(&["c"], ExecutorOptions::default()).await;

        assert_eq!(
            report.status_of("c"),
            Some(&TaskStatus::Skipped(SkipReason::DependencyFailed("b".to_string())))
        );
    }

    #[tokio::test]
    async fn fail_fast_stops_scheduling() {
        let harness = Harness::new(
            vec![task("a", &[]), task("b", &[])],
            vec![],
            CountingProbe::ready_on(1),
        );
        harness.runner.respond("echo a", 1, "");
        let options = ExecutorOptions {
            workers: Some(1),
            fail_fast: true,
            ..ExecutorOptions::default()
        };

        let report = harness.run(&["a", "b"], options).await;

        assert!(matches!(report.status_of("a"), Some(TaskStatus::Failed(_))));
        assert_eq!(
            report.status_of("b"),
            Some(&TaskStatus::Skipped(SkipReason::Aborted))
        );
        assert!(!harness.runner.was_called("echo b"));
    }

    #[tokio::test]
    async fn without_fail_fast_independent_tasks_still_run() {
        let harness = Harness::new(
            vec![task("a", &[]), task("b", &[])],
            vec![],
            CountingProbe::ready_on(1),
        );
        harness.runner.respond("echo a", 1, "");
        let options = ExecutorOptions {
            workers: Some(1),
            ..ExecutorOptions::default()
        };

        let report = harness.run(&["a", "b"], options).await;
        assert_eq!(report.status_of("b"), Some(&TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn middleware_is_healthy_before_dependents_start() {
        let harness = Harness::new(
            vec![
                start("middleware", "middleware", &[]),
                start("api", "api", &["middleware"]),
                start("web", "web", &["middleware"]),
            ],
            vec![
                healthy_container("middleware"),
                healthy_container("api"),
                healthy_container("web"),
            ],
            CountingProbe::ready_on(1),
        );

        let report = harness.run(&["api", "web"], ExecutorOptions::default()).await;
        assert_eq!(report.verdict(), Verdict::Succeeded);

        let middleware_done = report
            .transition_index("middleware", |s| *s == TaskStatus::Succeeded)
            .unwrap();
        for dependent in ["api", "web"] {
            let blocked = report
                .transition_index(dependent, |s| *s == TaskStatus::Blocked)
                .unwrap();
            let running = report
                .transition_index(dependent, |s| *s == TaskStatus::Running)
                .unwrap();
            assert!(blocked < middleware_done);
            assert!(middleware_done < running);
        }

        let middleware = report.record("middleware").unwrap();
        for dependent in ["api", "web"] {
            assert!(report.record(dependent).unwrap().started_at() >= middleware.finished_at());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_fails_the_start() {
        let mut db = container("db");
        db.health = Some(tcp_check("db", Duration::from_secs(1), 3));
        let harness = Harness::new(
            vec![start("db", "db", &[]), start("api", "api", &["db"])],
            vec![db, healthy_container("api")],
            CountingProbe::ready_on(u32::MAX),
        );

        let report = harness.run(&["api"], ExecutorOptions::default()).await;

        assert!(matches!(report.status_of("db"), Some(TaskStatus::Failed(_))));
        assert_eq!(
            report.status_of("api"),
            Some(&TaskStatus::Skipped(SkipReason::DependencyFailed("db".to_string())))
        );
        assert_eq!(
            harness.supervisor.status("db").await.unwrap(),
            ServiceState::Stopped
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exiting_right_after_start_fails_the_start() {
        let worker = ServiceUnit {
            name: "worker".to_string(),
            kind: UnitKind::Process,
            start: "exit 3".to_string(),
            stop: None,
            status: None,
            logs: None,
            logs_follow: None,
            health: None,
        };
        let harness = Harness::new(
            vec![start("worker", "worker", &[]), start("api", "api", &["worker"])],
            vec![worker, healthy_container("api")],
            CountingProbe::ready_on(1),
        );

        let report = harness.run(&["api"], ExecutorOptions::default()).await;

        match report.status_of("worker") {
            Some(TaskStatus::Failed(reason)) => assert!(reason.contains("stopped right after start")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(
            report.status_of("api"),
            Some(&TaskStatus::Skipped(SkipReason::DependencyFailed("worker".to_string())))
        );
        assert!(matches!(
            harness.supervisor.status("worker").await.unwrap(),
            ServiceState::StoppedWithError(_)
        ));
        assert!(!harness.runner.was_called("compose up -d api"));
    }

    #[tokio::test]
    async fn container_without_health_must_be_running_after_start() {
        let harness = Harness::new(
            vec![start("db", "db", &[])],
            vec![container("db")],
            CountingProbe::ready_on(1),
        );

        let report = harness.run(&["db"], ExecutorOptions::default()).await;

        assert!(matches!(report.status_of("db"), Some(TaskStatus::Failed(_))));
        assert!(harness.runner.was_called("compose up -d db"));
        assert!(matches!(
            harness.supervisor.status("db").await.unwrap(),
            ServiceState::StoppedWithError(_)
        ));
    }

    #[tokio::test]
    async fn malformed_health_check_fails_only_that_task() {
        let mut db = container("db");
        db.health = Some(tcp_check("db", Duration::from_secs(1), 0));
        let harness = Harness::new(
            vec![start("db", "db", &[]), task("lint", &[])],
            vec![db],
            CountingProbe::ready_on(1),
        );

        let report = harness.run(&["db", "lint"], ExecutorOptions::default()).await;

        match report.status_of("db") {
            Some(TaskStatus::Failed(reason)) => assert!(reason.contains("malformed")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(report.status_of("lint"), Some(&TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn setup_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join(".env.example");
        let env_file = dir.path().join(".env");
        fs::write(&template, "SECRET_KEY=changeme\n").unwrap();

        let copy_env = Task {
            action: Action::CopyIfAbsent {
                from: template.clone(),
                to: env_file.clone(),
            },
            ..task("env", &[])
        };
        let harness = Harness::new(
            vec![copy_env, start("db", "db", &["env"])],
            vec![healthy_container("db")],
            CountingProbe::ready_on(1),
        );

        let first = harness.run(&["db"], ExecutorOptions::default()).await;
        assert_eq!(first.status_of("env"), Some(&TaskStatus::Succeeded));
        assert_eq!(first.status_of("db"), Some(&TaskStatus::Succeeded));
        assert_eq!(fs::read_to_string(&env_file).unwrap(), "SECRET_KEY=changeme\n");

        fs::write(&env_file, "SECRET_KEY=local\n").unwrap();
        harness.runner.respond("compose ps -q db", 0, "9a0e\n");

        let second = harness.run(&["db"], ExecutorOptions::default()).await;
        assert!(matches!(
            second.status_of("env"),
            Some(TaskStatus::Skipped(SkipReason::Satisfied(_)))
        ));
        assert!(matches!(
            second.status_of("db"),
            Some(TaskStatus::Skipped(SkipReason::Satisfied(_)))
        ));
        assert_eq!(second.exit_code(), 0);
        assert_eq!(fs::read_to_string(&env_file).unwrap(), "SECRET_KEY=local\n");
        assert_eq!(harness.runner.count("compose up -d db"), 1);
        assert!(second.transition_index("db", |s| *s == TaskStatus::Running).is_none());
    }

    #[tokio::test]
    async fn teardown_of_stopped_unit_issues_no_stop() {
        let harness = Harness::new(
            vec![Task {
                action: Action::Stop {
                    service: "db".to_string(),
                },
                ..task("down", &[])
            }],
            vec![container("db")],
            CountingProbe::ready_on(1),
        );

        let report = harness.run(&["down"], ExecutorOptions::default()).await;

        assert!(matches!(
            report.status_of("down"),
            Some(TaskStatus::Skipped(SkipReason::Satisfied(_)))
        ));
        assert!(!harness.runner.was_called("compose stop db"));
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let harness = Harness::new(
            vec![task("a", &[]), task("b", &["a"])],
            vec![],
            CountingProbe::ready_on(1),
        );
        let order = harness.graph.resolve(&["b"]).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = harness
            .executor(ExecutorOptions::default())
            .run(&order, &cancel)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.exit_code(), EXIT_CANCELLED);
        assert_eq!(report.skipped(), vec!["a", "b"]);
        assert!(harness.runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_half_started_units() {
        let mut db = container("db");
        db.status = None;
        db.health = Some(tcp_check("db", Duration::from_secs(1), 600));
        let harness = Harness::new(
            vec![start("db", "db", &[]), start("api", "api", &["db"])],
            vec![db, healthy_container("api")],
            CountingProbe::ready_on(u32::MAX),
        );
        let order = harness.graph.resolve(&["api"]).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let report = harness
            .executor(ExecutorOptions::default())
            .run(&order, &cancel)
            .await;

        assert!(report.cancelled);
        assert!(matches!(report.status_of("db"), Some(TaskStatus::Failed(_))));
        assert_eq!(
            report.status_of("api"),
            Some(&TaskStatus::Skipped(SkipReason::Aborted))
        );
        assert!(harness.runner.was_called("compose up -d db"));
        assert!(harness.runner.was_called("compose stop db"));
    }
}
