//! Test doubles for the command seam.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::util::{CommandError, CommandOutput, CommandRunner};

/// Answers commands from a script; unscripted commands succeed silently.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<HashMap<String, CommandOutput>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, command: &str, code: i32, stdout: &str) {
        self.responses.lock().unwrap().insert(
            command.to_string(),
            CommandOutput {
                code: Some(code),
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, command: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == command)
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == command).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(command.to_string());
        let scripted = self.responses.lock().unwrap().get(command).cloned();
        Ok(scripted.unwrap_or(CommandOutput {
            code: Some(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }))
    }
}
