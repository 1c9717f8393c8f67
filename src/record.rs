use std::time::SystemTime;

use crate::{
    error::{EXIT_CANCELLED, EXIT_TASKS_FAILED},
    task::TaskStatus,
};

/// Outcome of one task in one run. Built when the task finishes and never
/// changed afterwards.
#[derive(Debug, Clone)]
pub struct RunRecord {
    task: String,
    started_at: SystemTime,
    finished_at: SystemTime,
    status: TaskStatus,
    output: String,
}

impl RunRecord {
    pub fn new(
        task: impl Into<String>,
        started_at: SystemTime,
        finished_at: SystemTime,
        status: TaskStatus,
        output: String,
    ) -> Self {
        Self {
            task: task.into(),
            started_at,
            finished_at,
            status,
            output,
        }
    }

    /// A task that never ran, e.g. skipped because a dependency failed.
    pub fn not_run(task: impl Into<String>, status: TaskStatus) -> Self {
        let now = SystemTime::now();
        Self::new(task, now, now, status, String::new())
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn finished_at(&self) -> SystemTime {
        self.finished_at
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn duration(&self) -> std::time::Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub records: Vec<RunRecord>,
    /// Every status change in the order it happened.
    pub transitions: Vec<(String, TaskStatus)>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn record(&self, task: &str) -> Option<&RunRecord> {
        self.records.iter().find(|r| r.task == task)
    }

    pub fn status_of(&self, task: &str) -> Option<&TaskStatus> {
        self.record(task).map(RunRecord::status)
    }

    /// Worst status across all tasks: succeeded < skipped < failed.
    pub fn verdict(&self) -> Verdict {
        match self.records.iter().map(|r| r.status.severity()).max() {
            Some(2) => Verdict::Failed,
            Some(1) => Verdict::Skipped,
            _ => Verdict::Succeeded,
        }
    }

    pub fn failed(&self) -> Vec<&str> {
        self.with_status(|s| matches!(s, TaskStatus::Failed(_)))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_status(|s| matches!(s, TaskStatus::Skipped(_)))
    }

    fn with_status(&self, predicate: impl Fn(&TaskStatus) -> bool) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| predicate(&r.status))
            .map(|r| r.task.as_str())
            .collect()
    }

    /// Position of the first transition of `task` into a status matching `predicate`.
    pub fn transition_index(
        &self,
        task: &str,
        predicate: impl Fn(&TaskStatus) -> bool,
    ) -> Option<usize> {
        self.transitions
            .iter()
            .position(|(id, status)| id == task && predicate(status))
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.verdict() == Verdict::Failed {
            EXIT_TASKS_FAILED
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SkipReason;

    fn report(statuses: Vec<(&str, TaskStatus)>) -> RunReport {
        RunReport {
            records: statuses
                .into_iter()
                .map(|(task, status)| RunRecord::not_run(task, status))
                .collect(),
            ..RunReport::default()
        }
    }

    #[test]
    fn verdict_is_the_worst_status() {
        let all_good = report(vec![("a", TaskStatus::Succeeded), ("b", TaskStatus::Succeeded)]);
        assert_eq!(all_good.verdict(), Verdict::Succeeded);
        assert_eq!(all_good.exit_code(), 0);

        let idempotent = report(vec![
            ("a", TaskStatus::Succeeded),
            ("b", TaskStatus::Skipped(SkipReason::Satisfied("exists".to_string()))),
        ]);
        assert_eq!(idempotent.verdict(), Verdict::Skipped);
        assert_eq!(idempotent.exit_code(), 0);

        let broken = report(vec![
            ("a", TaskStatus::Failed("exit code 1".to_string())),
            ("b", TaskStatus::Succeeded),
            ("c", TaskStatus::Skipped(SkipReason::DependencyFailed("a".to_string()))),
        ]);
        assert_eq!(broken.verdict(), Verdict::Failed);
        assert_eq!(broken.exit_code(), EXIT_TASKS_FAILED);
        assert_eq!(broken.failed(), vec!["a"]);
        assert_eq!(broken.skipped(), vec!["c"]);
    }

    #[test]
    fn empty_run_succeeds() {
        assert_eq!(RunReport::default().verdict(), Verdict::Succeeded);
    }

    #[test]
    fn cancellation_has_its_own_exit_code() {
        let mut cancelled = report(vec![("a", TaskStatus::Skipped(SkipReason::Aborted))]);
        cancelled.cancelled = true;
        assert_eq!(cancelled.exit_code(), EXIT_CANCELLED);
    }
}
