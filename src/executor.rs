use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::CoreConfig;
use crate::error::{CoreError, truncate_output};
use crate::fleet::Fleet;

const OUTPUT_TRUNCATE: usize = 4096;
const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

/* ============================= COMMAND ============================= */

/// A typed command fragment to run on a named server.
///
/// Arguments are passed as a list, never interpolated into a shell string.
/// The one exception is `RemoteCommand::shell`, an explicit shell-eval mode
/// reserved for audited snippets (the atomic remote write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    shell: bool,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            shell: false,
        }
    }

    /// Audited shell-eval mode: the literal script is handed to `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: script.into(),
            args: Vec::new(),
            stdin: None,
            shell: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// One-line rendering for logs and for the remote side of SSH.
    pub fn rendered(&self) -> String {
        if self.shell {
            return self.program.clone();
        }
        let mut parts = vec![shell_quote(&self.program)];
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

/// Single-quote `s` for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/* ============================= OUTPUT ============================= */

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit == 0
    }
}

/* ============================= EXECUTOR TRAIT ============================= */

/// Uniform "run this fragment on server X" primitive.
///
/// Implementations never retry; retrying is the caller's policy choice.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command, surfacing the exit code. Errors only on transport
    /// failure or timeout; a nonzero exit is a normal `ExecOutput`.
    async fn run(
        &self,
        server: &str,
        cmd: RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput, CoreError>;

    async fn read_file(&self, server: &str, path: &Path) -> Result<Vec<u8>, CoreError>;

    /// Atomic: writes `path.tmp`, then renames over `path`.
    async fn write_file(&self, server: &str, path: &Path, bytes: &[u8]) -> Result<(), CoreError>;

    async fn mkdir_p(&self, server: &str, path: &Path) -> Result<(), CoreError>;

    /// Like `run`, but a nonzero exit becomes a `nonzero_exit` error.
    async fn exec(
        &self,
        server: &str,
        cmd: RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput, CoreError> {
        let out = self.run(server, cmd, timeout).await?;
        if !out.ok() {
            return Err(CoreError::NonzeroExit {
                exit: out.exit,
                stdout: truncate_output(&out.stdout, OUTPUT_TRUNCATE),
                stderr: truncate_output(&out.stderr, OUTPUT_TRUNCATE),
            });
        }
        Ok(out)
    }
}

/* ============================= SSH EXECUTOR ============================= */

/// Production executor: local fast path for the host the control plane
/// runs on, SSH for the rest of the fleet, at most N in-flight commands
/// per target server.
pub struct SshExecutor {
    fleet: Fleet,
    local_server: String,
    ssh_user: String,
    limits: HashMap<String, Arc<Semaphore>>,
}

impl SshExecutor {
    pub fn new(config: &CoreConfig) -> Self {
        let limits = config
            .fleet
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    Arc::new(Semaphore::new(config.max_remote_concurrency)),
                )
            })
            .collect();
        Self {
            fleet: config.fleet.clone(),
            local_server: config.local_server.clone(),
            ssh_user: config.ssh_user.clone(),
            limits,
        }
    }

    fn is_local(&self, server: &str) -> bool {
        server == self.local_server
    }

    fn resolve(&self, server: &str) -> Result<&crate::fleet::Server, CoreError> {
        self.fleet.get(server).ok_or_else(|| CoreError::Transport {
            server: server.to_string(),
            detail: "not a fleet server".to_string(),
        })
    }

    fn build_command(&self, server: &str, cmd: &RemoteCommand) -> Result<tokio::process::Command, CoreError> {
        let target = self.resolve(server)?;
        let mut c = if self.is_local(server) {
            if cmd.shell {
                let mut c = tokio::process::Command::new("sh");
                c.arg("-c").arg(&cmd.program);
                c
            } else {
                let mut c = tokio::process::Command::new(&cmd.program);
                c.args(&cmd.args);
                c
            }
        } else {
            let mut c = tokio::process::Command::new("ssh");
            c.arg("-o")
                .arg("BatchMode=yes")
                .arg("-o")
                .arg(format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"))
                .arg(format!("{}@{}", self.ssh_user, target.ip))
                .arg("--")
                .arg(cmd.rendered());
            c
        };
        c.stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        Ok(c)
    }

    async fn permit(&self, server: &str) -> Result<tokio::sync::OwnedSemaphorePermit, CoreError> {
        let sem = self.limits.get(server).ok_or_else(|| CoreError::Transport {
            server: server.to_string(),
            detail: "not a fleet server".to_string(),
        })?;
        sem.clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Transport {
                server: server.to_string(),
                detail: "executor shut down".to_string(),
            })
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn run(
        &self,
        server: &str,
        cmd: RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput, CoreError> {
        let _permit = self.permit(server).await?;
        debug!(server, command = %cmd.rendered(), "exec");

        let mut child = self
            .build_command(server, &cmd)?
            .spawn()
            .map_err(|e| CoreError::Transport {
                server: server.to_string(),
                detail: format!("spawn failed: {e}"),
            })?;

        if let Some(bytes) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(bytes)
                    .await
                    .map_err(|e| CoreError::Transport {
                        server: server.to_string(),
                        detail: format!("stdin write failed: {e}"),
                    })?;
                drop(stdin);
            }
        }

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        match waited {
            Err(_) => {
                // Best-effort kill; kill_on_drop covers the rest.
                Err(CoreError::Timeout {
                    server: server.to_string(),
                    secs: timeout.as_secs(),
                })
            }
            Ok(Err(e)) => Err(CoreError::Transport {
                server: server.to_string(),
                detail: format!("wait failed: {e}"),
            }),
            Ok(Ok(output)) => Ok(ExecOutput {
                exit: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }

    async fn read_file(&self, server: &str, path: &Path) -> Result<Vec<u8>, CoreError> {
        if self.is_local(server) {
            self.resolve(server)?;
            return match tokio::fs::read(path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(CoreError::NotFound(path.display().to_string()))
                }
                Err(e) => Err(CoreError::Transport {
                    server: server.to_string(),
                    detail: e.to_string(),
                }),
            };
        }
        let cmd = RemoteCommand::new("cat").arg(path.display().to_string());
        let out = self.run(server, cmd, Duration::from_secs(30)).await?;
        if !out.ok() {
            return Err(CoreError::NotFound(path.display().to_string()));
        }
        Ok(out.stdout.into_bytes())
    }

    async fn write_file(&self, server: &str, path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
        if self.is_local(server) {
            self.resolve(server)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::Transport {
                        server: server.to_string(),
                        detail: e.to_string(),
                    })?;
            }
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, bytes)
                .await
                .map_err(|e| CoreError::Transport {
                    server: server.to_string(),
                    detail: e.to_string(),
                })?;
            tokio::fs::rename(&tmp, path)
                .await
                .map_err(|e| CoreError::Transport {
                    server: server.to_string(),
                    detail: e.to_string(),
                })?;
            return Ok(());
        }
        let quoted = shell_quote(&path.display().to_string());
        let tmp = format!("{quoted}.tmp");
        let cmd = RemoteCommand::shell(format!("cat > {tmp} && mv {tmp} {quoted}"))
            .stdin(bytes.to_vec());
        self.exec(server, cmd, Duration::from_secs(30)).await?;
        Ok(())
    }

    async fn mkdir_p(&self, server: &str, path: &Path) -> Result<(), CoreError> {
        if self.is_local(server) {
            self.resolve(server)?;
            return tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| CoreError::Transport {
                    server: server.to_string(),
                    detail: e.to_string(),
                });
        }
        let cmd = RemoteCommand::new("mkdir")
            .arg("-p")
            .arg(path.display().to_string());
        self.exec(server, cmd, Duration::from_secs(30)).await?;
        Ok(())
    }
}
