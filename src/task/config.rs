use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{Action, Task, dependency::TaskGraph};
use crate::{
    env::{self as stack_env, StackEnv},
    error::{Result, StackError},
    output::OutputMode,
    probe::{HealthCheck, ProbeStrategy},
    supervisor::{ServiceUnit, UnitKind},
    util::parse_duration,
};

const DEFAULT_CACHE_DIR: &str = ".stackup";
const DEFAULT_COMPOSE_COMMAND: &str = "docker compose";
const DEFAULT_PROBE_INTERVAL: &str = "1s";
const DEFAULT_PROBE_TIMEOUT: &str = "2s";
const DEFAULT_PROBE_ATTEMPTS: u32 = 30;

static BRACED_VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid variable regex")
});
static SIMPLE_VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid variable regex")
});

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StackFile {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    targets: HashMap<String, TargetSpec>,
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default, rename = "service")]
    services: HashMap<String, ServiceSpec>,
    #[serde(default, rename = "task")]
    tasks: HashMap<String, TaskSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigSection {
    workers: Option<usize>,
    default_timeout: Option<String>,
    fail_fast: Option<bool>,
    output: Option<OutputMode>,
    cache_dir: Option<String>,
    env_file: Option<String>,
    env_template: Option<String>,
    compose_file: Option<String>,
    compose_command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetSpec {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSpec {
    kind: UnitKind,
    compose_service: Option<String>,
    compose_file: Option<String>,
    start: Option<String>,
    stop: Option<String>,
    status: Option<String>,
    logs: Option<String>,
    logs_follow: Option<String>,
    health: Option<HealthSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthSpec {
    tcp: Option<String>,
    http: Option<String>,
    command: Option<String>,
    interval: Option<String>,
    timeout: Option<String>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskSpec {
    command: Option<String>,
    copy: Option<CopySpec>,
    start: Option<String>,
    stop: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    inputs: Vec<PathBuf>,
    #[serde(default)]
    outputs: Vec<PathBuf>,
    #[serde(default)]
    creates: Vec<PathBuf>,
    timeout: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CopySpec {
    from: PathBuf,
    to: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub workers: Option<usize>,
    pub default_timeout: Option<String>,
    pub fail_fast: bool,
    pub output: Option<OutputMode>,
    pub cache_dir: PathBuf,
}

/// Everything a run needs, resolved against the stack file's directory.
#[derive(Debug)]
pub struct StackConfig {
    pub root: PathBuf,
    pub graph: TaskGraph,
    pub units: Vec<ServiceUnit>,
    pub targets: HashMap<String, Vec<String>>,
    pub settings: Settings,
    pub env: StackEnv,
}

impl StackConfig {
    /// Task ids a CLI target stands for; unmapped targets name a task directly.
    pub fn target(&self, name: &str) -> Vec<String> {
        self.targets
            .get(name)
            .cloned()
            .unwrap_or_else(|| vec![name.to_string()])
    }

    pub fn has_target(&self, name: &str) -> bool {
        self.targets.contains_key(name) || self.graph.contains(name)
    }
}

pub fn load_stack(path: &Path) -> Result<StackConfig> {
    let contents = fs::read_to_string(path).map_err(|e| {
        StackError::Config(format!("cannot read '{}': {}", path.display(), e))
    })?;
    let root = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parse_stack(&contents, &root)
}

pub fn parse_stack(contents: &str, root: &Path) -> Result<StackConfig> {
    let file: StackFile = toml::from_str(contents)?;
    let config = file.config;

    let env = stack_env::prepare(
        config.env_file.as_deref().map(|p| root.join(p)).as_deref(),
        config.env_template.as_deref().map(|p| root.join(p)).as_deref(),
    )?;

    let mut variables = env.variables();
    variables.extend(file.variables);
    add_builtin_variables(&mut variables, root);

    let compose_file = env
        .compose_file
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .or(config.compose_file.clone());
    let compose_command = config
        .compose_command
        .clone()
        .unwrap_or_else(|| DEFAULT_COMPOSE_COMMAND.to_string());

    let mut units = file
        .services
        .into_iter()
        .map(|(name, spec)| {
            build_unit(name, spec, &variables, &env, compose_file.as_deref(), &compose_command)
        })
        .collect::<Result<Vec<_>>>()?;
    units.sort_by(|a, b| a.name.cmp(&b.name));

    let tasks = file
        .tasks
        .into_iter()
        .map(|(id, spec)| build_task(id, spec, &variables, root, &units))
        .collect::<Result<Vec<_>>>()?;

    let graph = TaskGraph::new(tasks);
    graph.validate()?;

    let targets: HashMap<String, Vec<String>> = file
        .targets
        .into_iter()
        .map(|(name, spec)| {
            let ids = match spec {
                TargetSpec::One(id) => vec![id],
                TargetSpec::Many(ids) => ids,
            };
            (name, ids)
        })
        .collect();

    for (name, ids) in &targets {
        if let Some(missing) = ids.iter().find(|id| !graph.contains(id)) {
            return Err(StackError::Config(format!(
                "target '{}' refers to unknown task '{}'",
                name, missing
            )));
        }
    }

    let cache_dir = root.join(config.cache_dir.as_deref().unwrap_or(DEFAULT_CACHE_DIR));

    debug!(
        "Loaded {} tasks, {} services, {} targets from '{}'",
        graph.tasks().count(),
        units.len(),
        targets.len(),
        root.display()
    );

    Ok(StackConfig {
        root: root.to_path_buf(),
        graph,
        units,
        targets,
        settings: Settings {
            workers: config.workers,
            default_timeout: config.default_timeout,
            fail_fast: config.fail_fast.unwrap_or(false),
            output: config.output,
            cache_dir,
        },
        env,
    })
}

fn add_builtin_variables(variables: &mut HashMap<String, String>, root: &Path) {
    for (key, value) in env::vars() {
        variables.insert(format!("ENV_{}", key), value);
    }

    variables.insert("ROOT".to_string(), root.to_string_lossy().to_string());

    if let Ok(pwd) = env::current_dir() {
        variables.insert("PWD".to_string(), pwd.to_string_lossy().to_string());
    }
}

fn build_unit(
    name: String,
    spec: ServiceSpec,
    variables: &HashMap<String, String>,
    env: &StackEnv,
    compose_file: Option<&str>,
    compose_command: &str,
) -> Result<ServiceUnit> {
    let sub = |text: Option<String>| text.map(|t| substitute_variables(&t, variables));
    let invalid = |reason: &str| StackError::Config(format!("service '{}': {}", name, reason));

    let compose = match (&spec.compose_service, spec.kind) {
        (Some(service), UnitKind::Container) => {
            let file = spec
                .compose_file
                .as_deref()
                .or(compose_file)
                .ok_or_else(|| invalid("compose_service needs a compose_file"))?;
            let base = format!("{} -f {}", compose_command, file);
            Some((base, service.clone()))
        }
        (Some(_), UnitKind::Process) => {
            return Err(invalid("compose_service only applies to containers"));
        }
        (None, _) => None,
    };

    let derived = |make: fn(&str, &str) -> String| {
        compose
            .as_ref()
            .map(|(base, service)| substitute_variables(&make(base, service), variables))
    };

    let start = sub(spec.start)
        .or_else(|| derived(|base, svc| format!("{} up -d {}", base, svc)))
        .ok_or_else(|| invalid("no start command"))?;
    let stop = sub(spec.stop).or_else(|| derived(|base, svc| format!("{} stop {}", base, svc)));
    let status = sub(spec.status)
        .or_else(|| derived(|base, svc| format!("{} ps --status running -q {}", base, svc)));
    let logs = sub(spec.logs)
        .or_else(|| derived(|base, svc| format!("{} logs --no-color --tail 200 {}", base, svc)));
    let logs_follow = sub(spec.logs_follow)
        .or_else(|| derived(|base, svc| format!("{} logs --no-color --follow {}", base, svc)));

    if spec.kind == UnitKind::Container && stop.is_none() {
        return Err(invalid("containers need a stop command or a compose_service"));
    }

    let health = match spec.health {
        Some(health) => Some(build_health_check(&name, health, variables, env)?),
        None => None,
    };

    Ok(ServiceUnit {
        name,
        kind: spec.kind,
        start,
        stop,
        status,
        logs,
        logs_follow,
        health,
    })
}

fn build_health_check(
    unit: &str,
    spec: HealthSpec,
    variables: &HashMap<String, String>,
    env: &StackEnv,
) -> Result<HealthCheck> {
    let invalid = |reason: String| StackError::Config(format!("service '{}' health: {}", unit, reason));

    let mut strategies = Vec::new();
    if let Some(address) = spec.tcp {
        strategies.push(ProbeStrategy::Tcp {
            address: substitute_variables(&address, variables),
        });
    }
    if let Some(url) = spec.http {
        strategies.push(ProbeStrategy::Http {
            url: substitute_variables(&url, variables),
        });
    }
    if let Some(command) = spec.command {
        strategies.push(ProbeStrategy::Command {
            command: substitute_variables(&command, variables),
        });
    }

    let strategy = match strategies.len() {
        0 => match env.binding(unit) {
            Some(binding) => ProbeStrategy::Tcp {
                address: binding.address(),
            },
            None => {
                return Err(invalid(
                    "set one of tcp, http or command, or a host/port binding in the env file"
                        .to_string(),
                ));
            }
        },
        1 => strategies.remove(0),
        _ => return Err(invalid("set only one of tcp, http or command".to_string())),
    };

    let duration = |value: Option<String>, default: &str| -> Result<Duration> {
        parse_duration(value.as_deref().unwrap_or(default)).map_err(invalid)
    };

    Ok(HealthCheck {
        target: unit.to_string(),
        strategy,
        interval: duration(spec.interval, DEFAULT_PROBE_INTERVAL)?,
        timeout: duration(spec.timeout, DEFAULT_PROBE_TIMEOUT)?,
        max_attempts: spec.max_attempts.unwrap_or(DEFAULT_PROBE_ATTEMPTS),
    })
}

fn build_task(
    id: String,
    spec: TaskSpec,
    variables: &HashMap<String, String>,
    root: &Path,
    units: &[ServiceUnit],
) -> Result<Task> {
    let invalid = |reason: &str| StackError::Config(format!("task '{}': {}", id, reason));
    let path = |p: &PathBuf| root.join(substitute_variables(&p.to_string_lossy(), variables));
    let known_service = |service: String| -> Result<String> {
        let service = substitute_variables(&service, variables);
        if units.iter().any(|u| u.name == service) {
            Ok(service)
        } else {
            Err(StackError::UnknownService(service))
        }
    };

    let has_markers = !spec.inputs.is_empty() || !spec.outputs.is_empty() || !spec.creates.is_empty();

    let action = match (spec.command, spec.copy, spec.start, spec.stop) {
        (Some(command), None, None, None) => Action::Command {
            command: substitute_variables(&command, variables),
            inputs: spec.inputs.iter().map(path).collect(),
            outputs: spec.outputs.iter().map(path).collect(),
            creates: spec.creates.iter().map(path).collect(),
        },
        (None, Some(copy), None, None) if !has_markers => Action::CopyIfAbsent {
            from: path(&copy.from),
            to: path(&copy.to),
        },
        (None, None, Some(service), None) if !has_markers => Action::Start {
            service: known_service(service)?,
        },
        (None, None, None, Some(service)) if !has_markers => Action::Stop {
            service: known_service(service)?,
        },
        (None, None, None, None) => {
            return Err(invalid("needs one of command, copy, start or stop"));
        }
        _ if has_markers => {
            return Err(invalid("inputs, outputs and creates only apply to commands"));
        }
        _ => return Err(invalid("set only one of command, copy, start or stop")),
    };

    Ok(Task {
        id,
        dependencies: spec.dependencies,
        action,
        description: spec.description,
        timeout: spec.timeout,
    })
}

fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let result = BRACED_VARIABLE
        .replace_all(text, |caps: &regex::Captures| {
            let var_name = &caps[1];
            variables
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string();

    SIMPLE_VARIABLE
        .replace_all(&result, |caps: &regex::Captures| {
            let var_name = &caps[1];
            variables
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}
