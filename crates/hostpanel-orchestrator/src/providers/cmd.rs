//! External command execution with logging, privilege escalation, and
//! timeouts.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::ProviderError;

/// Longest diagnostic tail kept from a failed command.
const MAX_DIAGNOSTICS: usize = 4000;

/// Check if the current process is running as root.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// stderr then stdout, trimmed, for error reports.
    pub fn diagnostics(&self) -> String {
        let combined = match (self.stderr.trim(), self.stdout.trim()) {
            ("", out) => out.to_string(),
            (err, "") => err.to_string(),
            (err, out) => format!("{err}\n{out}"),
        };
        tail(&combined, MAX_DIAGNOSTICS).to_string()
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// A command to run on the host.
///
/// `privileged` commands go through `sudo -n` unless already root;
/// `run_as` commands always go through `sudo -n -u <user> -H`.
#[derive(Debug, Clone)]
pub struct HostCommand {
    description: String,
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    run_as: Option<String>,
    privileged: bool,
    timeout: Duration,
}

impl HostCommand {
    pub fn new(description: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: Vec::new(),
            run_as: None,
            privileged: false,
            timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command line as the operator would type it (without sudo).
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn needs_sudo(&self) -> bool {
        self.run_as.is_some() || (self.privileged && !is_root())
    }

    /// Full argv, including any sudo prefix and `env` wrapper.
    fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(user) = &self.run_as {
            argv.extend(["sudo", "-n", "-u", user.as_str(), "-H"].map(String::from));
        } else if self.needs_sudo() {
            argv.extend(["sudo", "-n"].map(String::from));
        }
        // sudo scrubs the environment, so pass variables through `env`.
        if self.needs_sudo() && !self.env.is_empty() {
            argv.push("env".to_string());
            argv.extend(self.env.iter().map(|(k, v)| format!("{k}={v}")));
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Run and capture output; a nonzero exit is returned, not an error.
    pub async fn output(&self) -> Result<CommandOutput, ProviderError> {
        let cmd_line = self.command_line();
        let argv = self.argv();
        debug!("exec: {}", argv.join(" "));

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.needs_sudo() {
            command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProviderError::Timeout {
                command: cmd_line.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| ProviderError::Spawn {
                command: cmd_line.clone(),
                source,
            })?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            command = %cmd_line,
            code = ?result.code,
            elapsed_ms = start.elapsed().as_millis(),
            "exec finished"
        );
        Ok(result)
    }

    /// Run, logging the description, and fail on a nonzero exit with the
    /// tool's diagnostics.
    pub async fn run(&self) -> Result<CommandOutput, ProviderError> {
        info!("{}", self.description);
        let output = self.output().await?;
        if !output.success() {
            let diagnostics = output.diagnostics();
            error!(command = %self.command_line(), code = ?output.code, "command failed:\n{diagnostics}");
            return Err(ProviderError::CommandFailed {
                command: self.command_line(),
                code: output.code,
                diagnostics,
            });
        }
        Ok(output)
    }

    /// Run and report only whether the command succeeded.
    pub async fn succeeds(&self) -> bool {
        self.output().await.is_ok_and(|o| o.success())
    }
}

/// Check whether a program exists on PATH.
pub async fn command_exists(program: &str) -> bool {
    HostCommand::new(format!("looking up {program}"), "which")
        .arg(program)
        .timeout(Duration::from_secs(5))
        .succeeds()
        .await
}
