//! Subprocess execution utilities.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};

use anyhow::{Context, Result};

/// Builder for the shell commands a worker runs.
///
/// Commands are executed through `sh -c`, with stdin closed and stdout and
/// stderr combined into a single capture file.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
}

impl ShellCommand {
    /// Create a builder for a shell command line.
    pub fn new(command: impl Into<String>) -> Self {
        ShellCommand {
            command: command.into(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    /// Set multiple environment variables.
    pub fn envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        for (key, value) in vars {
            self.env.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    /// Get the command line.
    pub fn get_command(&self) -> &str {
        &self.command
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Spawn the command with combined stdout+stderr redirected to `capture`.
    ///
    /// The capture file is truncated first. Stdin is closed.
    pub fn spawn_captured(&self, capture: &Path) -> Result<Child> {
        let out = File::create(capture)
            .with_context(|| format!("failed to create capture file {}", capture.display()))?;
        let err = out
            .try_clone()
            .with_context(|| format!("failed to clone capture handle {}", capture.display()))?;

        let mut cmd = self.build_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));

        cmd.spawn()
            .with_context(|| format!("failed to spawn `{}`", self.command))
    }

    /// Execute the command to completion, capturing output in memory.
    pub fn exec(&self) -> Result<Output> {
        let mut cmd = self.build_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.output()
            .with_context(|| format!("failed to run `{}`", self.command))
    }
}
