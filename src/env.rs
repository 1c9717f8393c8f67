//! Env-file handling: parsing `KEY=VALUE` files, creating them from
//! templates without ever overwriting, and the typed options the stack
//! file understands.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("valid key regex"));

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{path}:{line}: expected KEY=VALUE, found '{content}'")]
    Syntax {
        path: String,
        line: usize,
        content: String,
    },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}_PORT '{value}' is not a valid port")]
    InvalidPort { name: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Created,
    AlreadyPresent,
}

/// Copies `template` to `target` unless `target` already exists.
///
/// The destination is opened with `create_new`, so a file that appears
/// between the check and the copy is left untouched too.
pub fn copy_if_absent(template: &Path, target: &Path) -> Result<CopyOutcome, EnvError> {
    if target.exists() {
        debug!("'{}' already exists, keeping it", target.display());
        return Ok(CopyOutcome::AlreadyPresent);
    }

    let contents = fs::read(template).map_err(|source| EnvError::Io {
        path: template.display().to_string(),
        source,
    })?;

    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| EnvError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(target) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Ok(CopyOutcome::AlreadyPresent);
        }
        Err(source) => {
            return Err(EnvError::Io {
                path: target.display().to_string(),
                source,
            });
        }
    };

    file.write_all(&contents).map_err(|source| EnvError::Io {
        path: target.display().to_string(),
        source,
    })?;

    info!(
        "Created '{}' from '{}'",
        target.display(),
        template.display()
    );
    Ok(CopyOutcome::Created)
}

pub fn parse_env(contents: &str, path: &str) -> Result<Vec<(String, String)>, EnvError> {
    let mut pairs = Vec::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        let syntax_error = || EnvError::Syntax {
            path: path.to_string(),
            line: index + 1,
            content: raw.to_string(),
        };

        let (key, value) = line.split_once('=').ok_or_else(syntax_error)?;
        let key = key.trim();
        if !KEY_PATTERN.is_match(key) {
            return Err(syntax_error());
        }

        pairs.push((key.to_string(), unquote(value.trim())));
    }

    Ok(pairs)
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }

    match value.find(" #") {
        Some(comment) => value[..comment].trim_end().to_string(),
        None => value.to_string(),
    }
}

pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>, EnvError> {
    let contents = fs::read_to_string(path).map_err(|source| EnvError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_env(&contents, &path.display().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub host: String,
    pub port: u16,
}

impl Binding {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Options recognized in the stack's env file.
#[derive(Debug, Clone, Default)]
pub struct StackEnv {
    pub registry: Option<String>,
    pub version: Option<String>,
    pub compose_file: Option<PathBuf>,
    pub images: HashMap<String, String>,
    pub bindings: HashMap<String, Binding>,
    pub values: HashMap<String, String>,
}

impl StackEnv {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self, EnvError> {
        let values: HashMap<String, String> = pairs.into_iter().collect();
        let mut env = StackEnv {
            registry: values.get("REGISTRY").cloned(),
            version: values.get("VERSION").cloned(),
            compose_file: values.get("COMPOSE_FILE").map(PathBuf::from),
            ..StackEnv::default()
        };

        for (key, value) in &values {
            if let Some(name) = key.strip_suffix("_IMAGE") {
                env.images.insert(name.to_lowercase(), value.clone());
            }

            if let Some(name) = key.strip_suffix("_PORT") {
                let port = value.parse::<u16>().map_err(|_| EnvError::InvalidPort {
                    name: name.to_string(),
                    value: value.clone(),
                })?;
                let host = values
                    .get(&format!("{}_HOST", name))
                    .cloned()
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                env.bindings
                    .insert(name.to_lowercase(), Binding { host, port });
            }
        }

        env.values = values;
        Ok(env)
    }

    /// `registry/image:version` for an image named in the env file.
    pub fn image_ref(&self, name: &str) -> Option<String> {
        let image = self.images.get(&name.to_lowercase())?;
        let mut reference = match &self.registry {
            Some(registry) if !registry.is_empty() => {
                format!("{}/{}", registry.trim_end_matches('/'), image)
            }
            _ => image.clone(),
        };
        if let Some(version) = &self.version {
            reference.push(':');
            reference.push_str(version);
        }
        Some(reference)
    }

    pub fn binding(&self, service: &str) -> Option<&Binding> {
        self.bindings
            .get(&service.to_lowercase().replace('-', "_"))
    }

    /// Variables contributed to `${VAR}` substitution.
    pub fn variables(&self) -> HashMap<String, String> {
        let mut variables = self.values.clone();
        for name in self.images.keys() {
            if let Some(reference) = self.image_ref(name) {
                variables.insert(format!("{}_IMAGE_REF", name.to_uppercase()), reference);
            }
        }
        variables
    }
}

/// Materializes the stack env file from its template and loads it.
pub fn prepare(env_file: Option<&Path>, template: Option<&Path>) -> Result<StackEnv, EnvError> {
    let Some(env_file) = env_file else {
        return Ok(StackEnv::default());
    };

    if let Some(template) = template {
        copy_if_absent(template, env_file)?;
    }

    if !env_file.exists() {
        debug!("No env file at '{}'", env_file.display());
        return Ok(StackEnv::default());
    }

    StackEnv::from_pairs(load_env_file(env_file)?)
}
