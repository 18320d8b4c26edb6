//! Command execution with explicit privilege escalation
//!
//! The adapters never escalate on their own: callers inject a
//! [`PrivilegedRunner`] alongside the plain [`SystemRunner`] and the
//! adapters pick one per call, unprivileged first.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Executes external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its output
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Run a command, feeding the given bytes on stdin
    async fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output>;
}

/// Check an output for success, returning stdout as text
pub fn expect_success(program: &str, output: &Output) -> Result<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(Error::Command {
            program: program.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Runs commands as the current user
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        let output = Command::new(program).args(args).output().await?;
        Ok(output)
    }

    async fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin).await?;
        }
        let output = child.wait_with_output().await?;
        Ok(output)
    }
}

/// Runs commands through sudo.
///
/// With a configured password the runner uses `sudo -S` and feeds the
/// password on stdin; otherwise `sudo -n` so a missing cached
/// credential fails fast instead of prompting.
#[derive(Debug, Default, Clone)]
pub struct PrivilegedRunner {
    password: Option<String>,
}

impl PrivilegedRunner {
    /// Escalation relying on cached sudo credentials
    pub fn new() -> Self {
        Self { password: None }
    }

    /// Escalation with a password supplied out of band
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }

    fn sudo_args<'a>(&self, program: &'a str, args: &'a [&'a str]) -> Vec<&'a str> {
        let mut full = match self.password {
            Some(_) => vec!["-S", "-p", "", program],
            None => vec!["-n", program],
        };
        full.extend_from_slice(args);
        full
    }
}

#[async_trait]
impl CommandRunner for PrivilegedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        let sudo_args = self.sudo_args(program, args);
        match &self.password {
            Some(password) => {
                let stdin = format!("{}\n", password);
                SystemRunner
                    .run_with_stdin("sudo", &sudo_args, stdin.as_bytes())
                    .await
            }
            None => SystemRunner.run("sudo", &sudo_args).await,
        }
    }

    async fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output> {
        // A password would collide with the payload on stdin; require
        // cached credentials for stdin-feeding commands.
        let sudo_args = {
            let mut full = vec!["-n", program];
            full.extend_from_slice(args);
            full
        };
        SystemRunner.run_with_stdin("sudo", &sudo_args, stdin).await
    }
}
