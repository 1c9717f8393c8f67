use std::collections::{BTreeMap, HashMap};

use super::TaskGraph;

#[derive(Debug, PartialEq, Eq)]
pub struct ExecutionLevel {
    pub level: usize,
    pub task_ids: Vec<String>,
}

/// Groups an ordered task list into levels: a task sits one level above its
/// deepest dependency. Tasks within a level are independent of each other.
pub fn calculate_dependency_levels(graph: &TaskGraph, order: &[String]) -> Vec<ExecutionLevel> {
    let mut levels: HashMap<&str, usize> = HashMap::new();
    let mut level_groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();

    for task_id in order {
        let level = graph
            .get(task_id)
            .map(|task| {
                task.dependencies
                    .iter()
                    .filter_map(|dep| levels.get(dep.as_str()))
                    .map(|level| level + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        levels.insert(task_id, level);
        level_groups.entry(level).or_default().push(task_id.clone());
    }

    level_groups
        .into_iter()
        .map(|(level, task_ids)| ExecutionLevel { level, task_ids })
        .collect()
}

pub fn show_plan(graph: &TaskGraph, order: &[String]) {
    println!("Plan ({} tasks):", order.len());

    for level in calculate_dependency_levels(graph, order) {
        println!("  Level {}:", level.level);
        for task_id in &level.task_ids {
            let Some(task) = graph.get(task_id) else {
                continue;
            };
            match &task.description {
                Some(description) => println!("    {} would {} ({})", task.id, task.action, description),
                None => println!("    {} would {}", task.id, task.action),
            }
        }
    }
}
