//! Builders: strategies that run one kind of build command in a workspace.
//!
//! The executor owns workspace setup and teardown; a builder only runs its
//! command inside the prepared directory and reports what happened.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::BuilderFault;
use crate::models::build_configuration::BuildConfiguration;

/// Everything a builder may look at while running.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub build_id: i64,
    pub branch: &'a str,
    pub revision: Option<&'a str>,
    pub workspace: &'a Path,
    pub configuration: &'a BuildConfiguration,
    /// Upper bound on the child command's run time; `None` waits forever.
    pub timeout: Option<Duration>,
}

/// Captured result of a build command that ran to completion or timed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl BuildOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait Builder: Send + Sync {
    /// Run the build. `Ok` covers both passing and failing commands; `Err` is
    /// reserved for faults of the runner itself.
    async fn execute(&self, ctx: &BuildContext<'_>) -> Result<BuildOutput, BuilderFault>;
}

/// Runs the configuration's parameters as a shell script.
#[derive(Debug, Clone)]
pub struct ShellBuilder {
    shell: String,
}

impl ShellBuilder {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Normalise line endings so CRLF scripts run unchanged.
    pub fn script(configuration: &BuildConfiguration) -> String {
        configuration
            .parameters
            .as_deref()
            .unwrap_or_default()
            .lines()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Builder for ShellBuilder {
    async fn execute(&self, ctx: &BuildContext<'_>) -> Result<BuildOutput, BuilderFault> {
        let script = Self::script(ctx.configuration);
        run_command(&[self.shell.as_str(), "-c", script.as_str()], ctx).await
    }
}

/// Runs a fixed command line, ignoring the configuration's parameters.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    argv: Vec<String>,
}

impl CommandBuilder {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn execute(&self, ctx: &BuildContext<'_>) -> Result<BuildOutput, BuilderFault> {
        let argv: Vec<&str> = self.argv.iter().map(String::as_str).collect();
        run_command(&argv, ctx).await
    }
}

/// Spawn `argv` in the workspace, capture both streams and apply the timeout.
pub async fn run_command(argv: &[&str], ctx: &BuildContext<'_>) -> Result<BuildOutput, BuilderFault> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BuilderFault::Misconfigured("empty command line".to_string()))?;

    tracing::info!(
        build_id = ctx.build_id,
        configuration = %ctx.configuration.name,
        program = %program,
        "Running build command"
    );

    let mut child = Command::new(program)
        .args(args)
        .current_dir(ctx.workspace)
        .env("CI", "true")
        .env("CI_BUILD_ID", ctx.build_id.to_string())
        .env("CI_BRANCH", ctx.branch)
        .env("CI_COMMIT", ctx.revision.unwrap_or_default())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BuilderFault::Spawn {
            program: program.to_string(),
            source,
        })?;
    let stdout = Capture::start(child.stdout.take());
    let stderr = Capture::start(child.stderr.take());

    let io_fault = |source: std::io::Error| BuilderFault::Io {
        program: program.to_string(),
        source,
    };

    let (exit_code, timed_out) = match ctx.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => (status.map_err(io_fault)?.code(), None),
            Err(_) => {
                tracing::warn!(
                    build_id = ctx.build_id,
                    timeout_secs = limit.as_secs(),
                    "Build command timed out"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(build_id = ctx.build_id, "Failed to kill timed-out command: {e}");
                }
                (None, Some(limit))
            }
        },
        None => (child.wait().await.map_err(io_fault)?.code(), None),
    };

    // Descendants of a killed command may keep the pipes open.
    let grace = timed_out.map(|_| PIPE_GRACE);
    let stdout = stdout.finish(grace).await.map_err(io_fault)?;
    let mut stderr = stderr.finish(grace).await.map_err(io_fault)?;
    if let Some(limit) = timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("Build timed out after {}s\n", limit.as_secs()));
    }

    Ok(BuildOutput {
        exit_code,
        stdout,
        stderr,
        timed_out: timed_out.is_some(),
    })
}

/// How long to keep reading a timed-out command's pipes after killing it.
const PIPE_GRACE: Duration = Duration::from_secs(1);

/// Drains one child pipe into a shared buffer, so output read before a
/// timeout is kept even if the reader has to be abandoned.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Capture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return Ok(());
            };
            let mut chunk = [0u8; 8192];
            loop {
                let n = pipe.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]);
            }
        });
        Self { buf, task }
    }

    /// Wait for end of stream, at most `grace` when given, and return the text read.
    async fn finish(self, grace: Option<Duration>) -> std::io::Result<String> {
        let Capture { buf, mut task } = self;
        let joined = match grace {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    task.abort();
                    None
                }
            },
            None => Some(task.await),
        };
        if let Some(joined) = joined {
            joined.map_err(std::io::Error::other)??;
        }
        let bytes = std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
