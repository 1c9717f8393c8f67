pub mod analysis;
pub mod config;
pub mod dependency;

pub use analysis::show_plan;
pub use config::{StackConfig, load_stack};
pub use dependency::TaskGraph;

use std::{fmt, path::PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub dependencies: Vec<String>,
    pub action: Action,
    pub description: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Shell command, skipped when its markers say it already ran.
    Command {
        command: String,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
        creates: Vec<PathBuf>,
    },
    /// `cp -n from to`.
    CopyIfAbsent { from: PathBuf, to: PathBuf },
    Start { service: String },
    Stop { service: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Setup,
    Start,
    Teardown,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Command { .. } | Action::CopyIfAbsent { .. } => ActionKind::Setup,
            Action::Start { .. } => ActionKind::Start,
            Action::Stop { .. } => ActionKind::Teardown,
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            Action::Start { service } | Action::Stop { service } => Some(service),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command { command, .. } => write!(f, "{}", command),
            Action::CopyIfAbsent { from, to } => {
                write!(f, "copy {} -> {} (if absent)", from.display(), to.display())
            }
            Action::Start { service } => write!(f, "start {}", service),
            Action::Stop { service } => write!(f, "stop {}", service),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The action's effect is already in place.
    Satisfied(String),
    DependencyFailed(String),
    /// Not scheduled because the run stopped early.
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Satisfied(why) => write!(f, "{}", why),
            SkipReason::DependencyFailed(dep) => write!(f, "dependency '{}' did not succeed", dep),
            SkipReason::Aborted => write!(f, "run stopped before it was scheduled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Blocked,
    Running,
    Succeeded,
    Failed(String),
    Skipped(SkipReason),
}

impl TaskStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed(_) | TaskStatus::Skipped(_)
        )
    }

    /// Whether dependents may run after this status.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Skipped(SkipReason::Satisfied(_))
        )
    }

    /// Ordering used for the run verdict: succeeded < skipped < failed.
    pub fn severity(&self) -> u8 {
        match self {
            TaskStatus::Succeeded => 0,
            TaskStatus::Skipped(_) => 1,
            TaskStatus::Failed(_) => 2,
            TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Running => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed(_) => "failed",
            TaskStatus::Skipped(_) => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Failed(reason) => write!(f, "failed: {}", reason),
            TaskStatus::Skipped(reason) => write!(f, "skipped: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}
