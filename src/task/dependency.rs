use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use super::Task;
use crate::error::{Result, StackError};

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// The task that starts `service`, if one is declared.
    pub fn starter_of(&self, service: &str) -> Option<&Task> {
        self.tasks.values().find(|task| {
            task.action.kind() == super::ActionKind::Start && task.action.service() == Some(service)
        })
    }

    /// Checks the whole graph: no self-dependencies, no dangling names, no cycles.
    pub fn validate(&self) -> Result<()> {
        for task in self.tasks.values() {
            for dep_id in &task.dependencies {
                if dep_id == &task.id {
                    return Err(StackError::Cycle {
                        path: vec![task.id.clone(), task.id.clone()],
                    });
                }
                if !self.tasks.contains_key(dep_id) {
                    return Err(StackError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep_id.clone(),
                    });
                }
            }
        }

        detect_cycles(self.tasks.keys().map(String::as_str), &self.tasks)
    }

    /// Dependency-first order of `targets` and everything they need.
    ///
    /// Fails before anything runs if a target or dependency is unknown or
    /// the closure contains a cycle.
    pub fn resolve<S: AsRef<str>>(&self, targets: &[S]) -> Result<Vec<String>> {
        let mut needed: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        for target in targets {
            let target = target.as_ref();
            match self.tasks.get_key_value(target) {
                Some((id, _)) => queue.push_back(id),
                None => return Err(StackError::UnknownTask(target.to_string())),
            }
        }

        while let Some(current) = queue.pop_front() {
            if !needed.insert(current) {
                continue;
            }

            let task = &self.tasks[current];
            for dep in &task.dependencies {
                match self.tasks.get_key_value(dep.as_str()) {
                    Some((id, _)) if !needed.contains(id.as_str()) => queue.push_back(id),
                    Some(_) => {}
                    None => {
                        return Err(StackError::UnknownDependency {
                            task: current.to_string(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        let sorted = sort_topologically(&needed, &self.tasks);
        if sorted.len() < needed.len() {
            detect_cycles(needed.iter().copied(), &self.tasks)?;
        }

        Ok(sorted)
    }
}

/// Kahn's algorithm over `ids`; ties are broken by name so plans are stable.
/// Tasks on a cycle are left out of the result.
fn sort_topologically(ids: &BTreeSet<&str>, tasks: &BTreeMap<String, Task>) -> Vec<String> {
    let mut in_degrees: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for &id in ids {
        let task = &tasks[id];
        let mut unique_deps: HashSet<&str> = HashSet::new();
        for dep in &task.dependencies {
            if ids.contains(dep.as_str()) && unique_deps.insert(dep) {
                dependents.entry(dep).or_default().push(id);
            }
        }
        in_degrees.insert(id, unique_deps.len());
    }

    let mut ready: BTreeSet<&str> = in_degrees
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut sorted_tasks: Vec<String> = Vec::with_capacity(ids.len());

    while let Some(task_id) = ready.pop_first() {
        sorted_tasks.push(task_id.to_string());

        for &dependent in dependents.get(task_id).into_iter().flatten() {
            if let Some(degree) = in_degrees.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    sorted_tasks
}

fn detect_cycles<'a>(
    ids: impl Iterator<Item = &'a str>,
    tasks: &BTreeMap<String, Task>,
) -> Result<()> {
    let mut visited = HashSet::new();

    for task_id in ids {
        let mut path = Vec::new();

        if has_cycle(task_id, tasks, &mut visited, &mut path) {
            return Err(StackError::Cycle { path });
        }
    }

    Ok(())
}

/// Depth-first search; on success `path` holds the cycle, closed with its
/// first task repeated.
fn has_cycle(
    task_id: &str,
    tasks: &BTreeMap<String, Task>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if let Some(start) = path.iter().position(|id| id == task_id) {
        path.drain(..start);
        path.push(task_id.to_string());
        return true;
    }

    if visited.contains(task_id) {
        return false;
    }

    visited.insert(task_id.to_string());
    path.push(task_id.to_string());

    if let Some(task) = tasks.get(task_id) {
        for dep in &task.dependencies {
            if has_cycle(dep, tasks, visited, path) {
                return true;
            }
        }
    }

    path.pop();

    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::task::Action;

    pub(crate) fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            action: Action::Command {
                command: format!("echo {}", id),
                inputs: vec![],
                outputs: vec![],
                creates: vec![],
            },
            description: None,
            timeout: None,
        }
    }

    fn assert_topological(graph: &TaskGraph, order: &[String]) {
        for (position, id) in order.iter().enumerate() {
            for dep in &graph.get(id).unwrap().dependencies {
                let dep_position = order.iter().position(|o| o == dep).unwrap();
                assert!(dep_position < position, "{dep} must come before {id}: {order:?}");
            }
        }
    }

    fn dev_stack() -> TaskGraph {
        TaskGraph::new(vec![
            task("env", &[]),
            task("web-deps", &[]),
            task("api-deps", &["env"]),
            task("migrate", &["api-deps", "middleware"]),
            task("middleware", &["env"]),
            task("api", &["migrate", "middleware"]),
            task("worker", &["migrate"]),
            task("web", &["web-deps", "api"]),
            task("lint", &[]),
        ])
    }

    #[test]
    fn resolve_orders_dependencies_first() {
        let graph = dev_stack();
        graph.validate().unwrap();

        for targets in [vec!["web"], vec!["worker", "web"], vec!["migrate"], vec!["lint"]] {
            let order = graph.resolve(targets.as_slice()).unwrap();
            assert_topological(&graph, &order);
            for target in &targets {
                assert!(order.iter().any(|id| id == target));
            }
        }
    }

    #[test]
    fn resolve_is_restricted_to_the_closure() {
        let graph = dev_stack();
        let order = graph.resolve(&["worker"]).unwrap();
        assert_eq!(
            order,
            vec!["env", "api-deps", "middleware", "migrate", "worker"]
        );
        assert!(!order.contains(&"web".to_string()));
        assert!(!order.contains(&"lint".to_string()));
    }

    #[test]
    fn diamond_appears_once() {
        let graph = TaskGraph::new(vec![
            task("base", &[]),
            task("left", &["base"]),
            task("right", &["base"]),
            task("top", &["left", "right", "left"]),
        ]);
        let order = graph.resolve(&["top", "top"]).unwrap();
        assert_eq!(order, vec!["base", "left", "right", "top"]);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let graph = TaskGraph::new(vec![
            task("setup", &[]),
            task("a", &["setup", "c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ]);

        match graph.resolve(&["a"]) {
            Err(StackError::Cycle { path }) => {
                assert_eq!(path.first(), path.last());
                for id in ["a", "b", "c"] {
                    assert!(path.iter().any(|p| p == id), "{path:?}");
                }
                assert!(!path.iter().any(|p| p == "setup"));
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert!(matches!(graph.validate(), Err(StackError::Cycle { .. })));
    }

    #[test]
    fn cycle_outside_the_closure_does_not_block_resolution() {
        let graph = TaskGraph::new(vec![
            task("ok", &[]),
            task("x", &["y"]),
            task("y", &["x"]),
        ]);
        assert_eq!(graph.resolve(&["ok"]).unwrap(), vec!["ok"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let graph = TaskGraph::new(vec![task("loop", &["loop"])]);
        assert!(matches!(graph.validate(), Err(StackError::Cycle { .. })));
        assert!(matches!(graph.resolve(&["loop"]), Err(StackError::Cycle { .. })));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let graph = TaskGraph::new(vec![task("api", &["db"])]);

        assert!(matches!(
            graph.resolve(&["nope"]),
            Err(StackError::UnknownTask(name)) if name == "nope"
        ));
        assert!(matches!(
            graph.resolve(&["api"]),
            Err(StackError::UnknownDependency { task, dependency }) if task == "api" && dependency == "db"
        ));
        assert!(matches!(
            graph.validate(),
            Err(StackError::UnknownDependency { .. })
        ));
    }
}
