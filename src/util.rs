use async_trait::async_trait;
use blake3::Hash;
use glob::{GlobError, PatternError, glob};
use std::process::Stdio;
use std::{
    collections::HashSet,
    fs,
    io::Error as IoError,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Invalid glob pattern: {0}")]
    GlobPattern(#[from] PatternError),
    #[error("Failed to expand glob: {0}")]
    GlobExpansion(#[from] GlobError),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command execution error: {0}")]
    Io(#[from] IoError),
    #[error("Command timed out")]
    Timeout,
}

/// Exit code and captured streams of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }

    pub fn describe_status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Every external tool (compose, package managers, container runtime) is
/// reached through this seam.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError>;

    /// Directory commands run in.
    fn workdir(&self) -> Option<&Path> {
        None
    }

    /// Spawns a long-lived command. With `capture` stdout is piped back to
    /// the caller, otherwise it is inherited.
    fn spawn(&self, command: &str, capture: bool) -> Result<Child, CommandError> {
        let mut cmd = shell_command(command, self.workdir());
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        if capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        }
        cmd.spawn().map_err(CommandError::Io)
    }
}

pub struct ShellRunner {
    workdir: PathBuf,
    stream_output: bool,
}

impl ShellRunner {
    pub fn new(workdir: impl Into<PathBuf>, stream_output: bool) -> Self {
        Self {
            workdir: workdir.into(),
            stream_output,
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        run_command_with_timeout(command, Some(&self.workdir), timeout, self.stream_output).await
    }

    fn workdir(&self) -> Option<&Path> {
        Some(&self.workdir)
    }
}

pub fn shell_command(command: &str, workdir: Option<&Path>) -> TokioCommand {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = TokioCommand::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = TokioCommand::new("sh");
        c.args(["-c", command]);
        c
    };

    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    cmd
}

pub fn parse_duration(text: &str) -> Result<Duration, String> {
    text.parse::<humantime::Duration>()
        .map(Into::into)
        .map_err(|e| format!("invalid duration '{}': {} (use e.g. '500ms', '30s', '5m')", text, e))
}

pub fn parse_timeout(timeout_str: Option<&str>, default_timeout: Option<&str>) -> Option<Duration> {
    let timeout_to_parse = timeout_str.or(default_timeout)?;

    if timeout_to_parse == "0" || timeout_to_parse.is_empty() {
        return None;
    }

    match parse_duration(timeout_to_parse) {
        Ok(duration) => Some(duration),
        Err(e) => {
            warn!("{}; running without a timeout", e);
            None
        }
    }
}

pub fn expand_globs(paths: &[PathBuf]) -> Result<Vec<PathBuf>, FileError> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();

    for path in paths {
        let path_str = path.to_string_lossy();

        if is_glob_pattern(&path_str) {
            let expanded_paths = expand_single_glob(&path_str)?;
            for expanded_path in expanded_paths {
                if expanded_path.is_file() && seen.insert(expanded_path.clone()) {
                    result.push(expanded_path);
                }
            }
        } else {
            add_if_exists(path, &mut result, &mut seen);
        }
    }

    Ok(result)
}

fn is_glob_pattern(path: &str) -> bool {
    path.contains('*') || path.contains('?') || path.contains('[')
}

fn expand_single_glob(pattern: &str) -> Result<Vec<PathBuf>, FileError> {
    let glob_paths = glob(pattern)?;
    glob_paths
        .collect::<Result<Vec<_>, _>>()
        .map_err(FileError::from)
}

fn add_if_exists(path: &Path, result: &mut Vec<PathBuf>, seen: &mut HashSet<PathBuf>) {
    if path.exists() {
        if seen.insert(path.to_path_buf()) {
            result.push(path.to_path_buf());
        }
    } else {
        warn!("Input file '{}' does not exist", path.display());
    }
}

/// Content fingerprint of a set of input paths and globs.
pub fn hash_files(inputs: &[PathBuf]) -> Result<Hash, FileError> {
    let mut sorted_files = expand_globs(inputs)?;
    sorted_files.sort();

    let mut combined_hash_data = Vec::new();

    for file_path in &sorted_files {
        match fs::read(file_path) {
            Ok(contents) => {
                let path_str = file_path.to_string_lossy();
                let mut hasher = blake3::Hasher::new();
                hasher.update(format!("{}:{}", path_str.len(), path_str).as_bytes());
                hasher.update(&contents);
                combined_hash_data.extend_from_slice(hasher.finalize().as_bytes());
            }
            Err(e) => {
                warn!("Could not read file '{}': {}", file_path.display(), e);
            }
        }
    }

    Ok(blake3::hash(&combined_hash_data))
}

pub async fn run_command_with_timeout(
    command: &str,
    workdir: Option<&Path>,
    timeout: Option<Duration>,
    stream_output: bool,
) -> Result<CommandOutput, CommandError> {
    let mut cmd = shell_command(command, workdir);

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(CommandError::Io)?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stdout_handle = tokio::spawn(drain_pipe(stdout_pipe, stream_output.then(tokio::io::stdout)));
    let stderr_handle = tokio::spawn(drain_pipe(stderr_pipe, stream_output.then(tokio::io::stderr)));

    let status = match timeout {
        Some(duration) => {
            tokio::select! {
                result = child.wait() => result?,
                _ = tokio::time::sleep(duration) => {
                    if let Err(kill_err) = child.kill().await {
                        warn!("Failed to kill timed-out process: {}", kill_err);
                    }
                    let _ = child.wait().await;
                    return Err(CommandError::Timeout);
                }
            }
        }
        None => child.wait().await?,
    };

    let stdout = match stdout_handle.await {
        Ok(result) => result?,
        Err(e) => return Err(CommandError::Io(IoError::other(e))),
    };

    let stderr = match stderr_handle.await {
        Ok(result) => result?,
        Err(e) => return Err(CommandError::Io(IoError::other(e))),
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout,
        stderr,
    })
}

/// Reads a child pipe to the end, echoing each chunk to `echo` when given.
async fn drain_pipe<R, W>(pipe: Option<R>, mut echo: Option<W>) -> Result<Vec<u8>, CommandError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut collected = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(collected);
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if let Some(out) = echo.as_mut() {
            out.write_all(&buf[..n]).await?;
        }
    }
    if let Some(out) = echo.as_mut() {
        out.flush().await?;
    }

    Ok(collected)
}

static OUTPUT_PRINT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn output_print_lock() -> &'static Mutex<()> {
    OUTPUT_PRINT_LOCK.get_or_init(|| Mutex::new(()))
}
