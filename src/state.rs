//! Decides whether a task's effect is already in place.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};

use tracing::{debug, warn};

use crate::{
    cache::{self, Cache},
    supervisor::{ServiceState, Supervisor},
    task::{Action, Task},
    util::{expand_globs, hash_files},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Unmet,
    Satisfied(String),
}

pub struct StateTracker {
    supervisor: Arc<Supervisor>,
    cache: Mutex<Cache>,
    dirty: Mutex<bool>,
}

impl StateTracker {
    pub fn new(supervisor: Arc<Supervisor>, cache: Cache) -> Self {
        Self {
            supervisor,
            cache: Mutex::new(cache),
            dirty: Mutex::new(false),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn check(&self, task: &Task) -> Precondition {
        match &task.action {
            Action::CopyIfAbsent { to, .. } => {
                if to.exists() {
                    Precondition::Satisfied(format!("{} already exists", to.display()))
                } else {
                    Precondition::Unmet
                }
            }
            Action::Command {
                inputs,
                outputs,
                creates,
                ..
            } => self.check_command(&task.id, inputs, outputs, creates),
            Action::Start { service } => match self.supervisor.status(service).await {
                Ok(ServiceState::Healthy) => {
                    Precondition::Satisfied(format!("{} is already healthy", service))
                }
                Ok(state) => {
                    debug!("'{}' is {}, start needed", service, state);
                    Precondition::Unmet
                }
                Err(e) => {
                    warn!("Could not determine state of '{}': {}", service, e);
                    Precondition::Unmet
                }
            },
            Action::Stop { service } => match self.supervisor.status(service).await {
                Ok(ServiceState::Stopped) | Ok(ServiceState::StoppedWithError(_)) => {
                    Precondition::Satisfied(format!("{} is not running", service))
                }
                Ok(_) => Precondition::Unmet,
                Err(e) => {
                    warn!("Could not determine state of '{}': {}", service, e);
                    Precondition::Unmet
                }
            },
        }
    }

    fn check_command(
        &self,
        task_id: &str,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
        creates: &[PathBuf],
    ) -> Precondition {
        if !creates.is_empty() {
            return if creates.iter().all(|path| path.exists()) {
                Precondition::Satisfied(format!("{} already present", display_paths(creates)))
            } else {
                Precondition::Unmet
            };
        }

        if inputs.is_empty() {
            debug!("Task '{}': no inputs, always run", task_id);
            return Precondition::Unmet;
        }

        if !outputs.iter().all(|output| output.exists()) {
            debug!("Task '{}': outputs missing, must run", task_id);
            return Precondition::Unmet;
        }

        if outputs_outdated(inputs, outputs) {
            debug!("Task '{}': outputs older than inputs, must run", task_id);
            return Precondition::Unmet;
        }

        match hash_files(inputs) {
            Ok(hash) if self.cache().contains(hash.to_hex().as_str()) => {
                Precondition::Satisfied("inputs unchanged since last run".to_string())
            }
            Ok(_) => {
                debug!("Task '{}': input content changed, must run", task_id);
                Precondition::Unmet
            }
            Err(e) => {
                warn!("Could not process inputs for task '{}': {}", task_id, e);
                Precondition::Unmet
            }
        }
    }

    /// Remembers the inputs of a command that just succeeded.
    pub fn record_success(&self, task: &Task) {
        let Action::Command { inputs, .. } = &task.action else {
            return;
        };
        if inputs.is_empty() {
            return;
        }

        match hash_files(inputs) {
            Ok(hash) => {
                if self.cache().insert(hash.to_hex().to_string()) {
                    *self.dirty.lock().unwrap_or_else(|p| p.into_inner()) = true;
                }
            }
            Err(e) => warn!("Could not fingerprint inputs of '{}': {}", task.id, e),
        }
    }

    /// Writes the marker cache if this run added to it.
    pub fn persist(&self, cache_dir: &Path) -> bool {
        let dirty = *self.dirty.lock().unwrap_or_else(|p| p.into_inner());
        if dirty {
            cache::save_cache(&self.cache(), cache_dir);
        } else {
            debug!("No new markers, cache not saved");
        }
        dirty
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn outputs_outdated(inputs: &[PathBuf], outputs: &[PathBuf]) -> bool {
    if outputs.is_empty() {
        return false;
    }

    let Some(newest_input_time) = newest_timestamp(inputs) else {
        return true;
    };

    let Some(oldest_output_time) = oldest_timestamp(outputs) else {
        return true;
    };

    newest_input_time > oldest_output_time
}

fn newest_timestamp(paths: &[PathBuf]) -> Option<SystemTime> {
    let expanded_paths = expand_globs(paths).ok()?;

    expanded_paths
        .iter()
        .filter_map(|path| path.metadata().ok().and_then(|m| m.modified().ok()))
        .max()
}

fn oldest_timestamp(paths: &[PathBuf]) -> Option<SystemTime> {
    paths
        .iter()
        .filter_map(|path| path.metadata().ok().and_then(|m| m.modified().ok()))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::CountingProbe;
    use crate::supervisor::tests::container;
    use crate::testing::ScriptedRunner;
    use std::fs;

    fn tracker(runner: Arc<ScriptedRunner>) -> StateTracker {
        let supervisor = Supervisor::new(
            vec![container("db")],
            runner,
            CountingProbe::ready_on(1),
        );
        StateTracker::new(Arc::new(supervisor), Cache::default())
    }

    fn task(id: &str, action: Action) -> Task {
        Task {
            id: id.to_string(),
            dependencies: vec![],
            action,
            description: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn copy_is_satisfied_once_target_exists() {
        let dir = tempfile::tempdir().unwrap();
        let copy = task(
            "api-env",
            Action::CopyIfAbsent {
                from: dir.path().join(".env.example"),
                to: dir.path().join(".env"),
            },
        );
        let tracker = tracker(ScriptedRunner::new());

        assert_eq!(tracker.check(&copy).await, Precondition::Unmet);
        fs::write(dir.path().join(".env"), "").unwrap();
        assert!(matches!(tracker.check(&copy).await, Precondition::Satisfied(_)));
    }

    #[tokio::test]
    async fn creates_markers() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join(".venv");
        let sync = task(
            "api-deps",
            Action::Command {
                command: "uv sync".to_string(),
                inputs: vec![],
                outputs: vec![],
                creates: vec![venv.clone()],
            },
        );
        let tracker = tracker(ScriptedRunner::new());

        assert_eq!(tracker.check(&sync).await, Precondition::Unmet);
        fs::create_dir(&venv).unwrap();
        assert!(matches!(tracker.check(&sync).await, Precondition::Satisfied(_)));
    }

    #[tokio::test]
    async fn unchanged_inputs_skip_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("package.json");
        let modules = dir.path().join("node_modules");
        fs::write(&manifest, "{}").unwrap();
        let install = task(
            "web-deps",
            Action::Command {
                command: "pnpm install".to_string(),
                inputs: vec![manifest.clone()],
                outputs: vec![modules.clone()],
                creates: vec![],
            },
        );
        let tracker = tracker(ScriptedRunner::new());

        assert_eq!(tracker.check(&install).await, Precondition::Unmet);

        fs::create_dir(&modules).unwrap();
        tracker.record_success(&install);
        assert!(matches!(tracker.check(&install).await, Precondition::Satisfied(_)));

        let cache_dir = dir.path().join(".stackup");
        assert!(tracker.persist(&cache_dir));
        assert_eq!(cache::load_cache(&cache_dir).len(), 1);
    }

    #[tokio::test]
    async fn commands_without_markers_always_run() {
        let tracker = tracker(ScriptedRunner::new());
        let migrate = task(
            "migrate",
            Action::Command {
                command: "flask db upgrade".to_string(),
                inputs: vec![],
                outputs: vec![],
                creates: vec![],
            },
        );
        assert_eq!(tracker.check(&migrate).await, Precondition::Unmet);
        tracker.record_success(&migrate);
        assert_eq!(tracker.check(&migrate).await, Precondition::Unmet);
    }

    #[tokio::test]
    async fn service_markers_follow_unit_state() {
        let runner = ScriptedRunner::new();
        let tracker = tracker(runner.clone());
        let start = task("db", Action::Start { service: "db".to_string() });
        let stop = task("stop-db", Action::Stop { service: "db".to_string() });

        assert_eq!(tracker.check(&start).await, Precondition::Unmet);
        assert!(matches!(tracker.check(&stop).await, Precondition::Satisfied(_)));

        runner.respond("compose ps -q db", 0, "9a0e\n");
        assert!(matches!(tracker.check(&start).await, Precondition::Satisfied(_)));
        assert_eq!(tracker.check(&stop).await, Precondition::Unmet);
    }
}
