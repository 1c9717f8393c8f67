use clap::Parser;
use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod cache;
mod cli;
mod env;
mod error;
mod execution;
mod output;
mod probe;
mod record;
mod state;
mod supervisor;
mod task;
#[cfg(test)]
mod testing;
mod util;

use cache::load_cache;
use cli::{Cli, Command};
use error::{EXIT_TASKS_FAILED, Result, StackError};
use execution::{Executor, ExecutorOptions};
use output::{OutputMode, print_summary};
use probe::{LiveProbe, Probe, Prober};
use state::StateTracker;
use supervisor::{Supervisor, UnitKind};
use task::{StackConfig, TaskGraph, load_stack, show_plan};
use util::{CommandRunner, ShellRunner, parse_timeout};

const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let code = match run_stackup(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("STACKUP_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_stackup(args: Cli) -> Result<i32> {
    let config = load_stack(Path::new(&args.file))?;
    let graph = Arc::new(config.graph.clone());
    let settings = config.settings.clone();

    let output = args.output.or(settings.output).unwrap_or(OutputMode::Group);
    let runner: Arc<dyn CommandRunner> =
        Arc::new(ShellRunner::new(&config.root, output == OutputMode::Stream));
    let probe: Arc<dyn Probe> = Arc::new(LiveProbe::new(Arc::clone(&runner)));
    let mut supervisor = Supervisor::new(config.units.clone(), Arc::clone(&runner), Arc::clone(&probe));
    if let Some(timeout) = parse_timeout(args.timeout.as_deref(), settings.default_timeout.as_deref()) {
        supervisor = supervisor.with_command_timeout(timeout);
    }
    let supervisor = Arc::new(supervisor);
    let tracker = Arc::new(StateTracker::new(
        Arc::clone(&supervisor),
        load_cache(&settings.cache_dir),
    ));

    let executor = Executor::new(
        Arc::clone(&graph),
        Arc::clone(&supervisor),
        Arc::new(Prober::new(probe)),
        Arc::clone(&tracker),
        runner,
        ExecutorOptions {
            workers: args.workers.or(settings.workers),
            fail_fast: args.fail_fast || settings.fail_fast,
            default_timeout: args.timeout.clone().or(settings.default_timeout.clone()),
            output,
        },
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let session = Session {
        config,
        graph,
        supervisor,
        tracker,
        executor,
        cache_dir: settings.cache_dir,
        cancel,
        verbose: args.verbose,
        dry_run: args.dry_run,
    };

    match args.command {
        Command::Setup => session.run_target("setup").await,
        Command::Up => session.up().await,
        Command::Down => session.run_target("down").await,
        Command::Restart => {
            if session.config.has_target("restart") {
                session.run_target("restart").await
            } else {
                let code = session.run_target("down").await?;
                if code != 0 {
                    return Ok(code);
                }
                session.up().await
            }
        }
        Command::Run { service } => session.run_service(&service).await,
        Command::Status => session.print_status().await,
        Command::Logs { service, follow } => session.print_logs(&service, follow).await,
        Command::Exec { tasks } => session.run_tasks(&tasks).await,
    }
}

struct Session {
    config: StackConfig,
    graph: Arc<TaskGraph>,
    supervisor: Arc<Supervisor>,
    tracker: Arc<StateTracker>,
    executor: Executor,
    cache_dir: PathBuf,
    cancel: CancellationToken,
    verbose: bool,
    dry_run: bool,
}

impl Session {
    async fn run_target(&self, target: &str) -> Result<i32> {
        if !self.config.has_target(target) {
            return Err(StackError::Config(format!(
                "no target or task named '{}' in the stack file",
                target
            )));
        }
        self.run_tasks(&self.config.target(target)).await
    }

    async fn run_tasks(&self, task_ids: &[String]) -> Result<i32> {
        let order = self.graph.resolve(task_ids)?;

        if self.verbose {
            info!("Execution order: {}", order.join(" -> "));
        }

        if self.dry_run {
            show_plan(&self.graph, &order);
            return Ok(0);
        }

        let report = self.executor.run(&order, &self.cancel).await;
        print_summary(&report);
        self.tracker.persist(&self.cache_dir);

        Ok(report.exit_code())
    }

    async fn up(&self) -> Result<i32> {
        let code = self.run_target("up").await?;
        if code != 0 {
            return Ok(code);
        }
        Ok(self.attach().await)
    }

    async fn run_service(&self, service: &str) -> Result<i32> {
        if self.supervisor.unit(service).is_none() {
            return Err(StackError::UnknownService(service.to_string()));
        }
        let starter = self.graph.starter_of(service).ok_or_else(|| {
            StackError::Config(format!("no task starts service '{}'", service))
        })?;

        let code = self.run_tasks(&[starter.id.clone()]).await?;
        if code != 0 {
            return Ok(code);
        }
        Ok(self.attach().await)
    }

    /// Keeps local processes in the foreground until Ctrl-C or until they all
    /// exit, then stops whatever is left.
    async fn attach(&self) -> i32 {
        if self.dry_run {
            return 0;
        }

        let attached = self.supervisor.attached().await;
        if attached.is_empty() {
            debug!("No local processes to attach to");
            return self.report_crashes().await;
        }

        info!("Attached to {}, press Ctrl-C to stop", attached.join(", "));
        let mut ticker = tokio::time::interval(ATTACH_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.supervisor.attached().await.is_empty() {
                        warn!("All attached processes have exited");
                        break;
                    }
                }
            }
        }

        let mut code = 0;
        for name in &attached {
            match self.supervisor.stop(name).await {
                Ok(outcome) => debug!("'{}': {:?}", name, outcome),
                Err(e) => {
                    warn!("{}", e);
                    code = EXIT_TASKS_FAILED;
                }
            }
        }
        code.max(self.report_crashes().await)
    }

    /// Logs every local process that exited with an error and returns the
    /// matching exit code.
    async fn report_crashes(&self) -> i32 {
        let crashed = self.supervisor.exited_with_error().await;
        for (name, reason) in &crashed {
            error!("'{}' stopped with error: {}", name, reason);
        }
        if crashed.is_empty() { 0 } else { EXIT_TASKS_FAILED }
    }

    async fn print_status(&self) -> Result<i32> {
        println!("{:<24} {:<10} STATE", "SERVICE", "KIND");

        for name in self.supervisor.names() {
            let kind = match self.supervisor.unit(name).map(|u| u.kind) {
                Some(UnitKind::Container) => "container",
                Some(UnitKind::Process) => "process",
                None => "?",
            };
            match self.supervisor.status(name).await {
                Ok(state) => println!("{:<24} {:<10} {}", name, kind, state),
                Err(e) => println!("{:<24} {:<10} unknown ({})", name, kind, e),
            }
        }

        Ok(0)
    }

    async fn print_logs(&self, service: &str, follow: bool) -> Result<i32> {
        let mut stream = self.supervisor.logs(service, follow).await?;
        if stream.is_follow() {
            debug!("Following logs of '{}' until interrupted", service);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = stream.next_line() => match line? {
                    Some(line) => println!("{}", line),
                    None => break,
                },
            }
        }

        Ok(0)
    }
}
