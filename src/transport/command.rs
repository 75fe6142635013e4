//! Transport backed by local commands
//!
//! Spawns a configured argv for the interactive shell (`ssh -tt host`,
//! `sh -i`, ...) and another for one-off commands (`ssh host`, `sh -c`),
//! with the command line appended as the last argument. File transfers run
//! `cat` on the remote side through the exec argv.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{parse_listing, DirEntry, DownloadChannel, ExecResult, ShellChannel, Transport, UploadChannel};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::shell::path::quote;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct CommandTransport {
    shell: Vec<String>,
    exec: Vec<String>,
}

impl CommandTransport {
    pub fn new(shell: Vec<String>, exec: Vec<String>) -> Result<Self, TransportError> {
        if shell.is_empty() {
            return Err(TransportError::Misconfigured("shell command is empty".into()));
        }
        if exec.is_empty() {
            return Err(TransportError::Misconfigured("exec command is empty".into()));
        }
        Ok(Self { shell, exec })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        Self::new(config.shell.clone(), config.exec.clone())
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.exec[0]);
        cmd.args(&self.exec[1..]).arg(script).kill_on_drop(true);
        cmd
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child, TransportError> {
        cmd.spawn().map_err(|source| TransportError::Spawn {
            program: self.exec[0].clone(),
            source,
        })
    }
}

/// Forwards everything `reader` produces until it ends or nobody listens.
async fn pump(mut reader: impl AsyncRead + Unpin, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "shell output ended");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for CommandTransport {
    async fn open_shell(&self) -> Result<ShellChannel, TransportError> {
        let mut child = Command::new(&self.shell[0])
            .args(&self.shell[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: self.shell[0].clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(TransportError::Misconfigured("shell pipes unavailable".into()));
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump(stdout, tx.clone()));
        tokio::spawn(pump(stderr, tx));

        debug!(argv = ?self.shell, "shell opened");
        Ok(ShellChannel::new(Box::new(stdin), rx).with_guard(child))
    }

    async fn exec(&self, command: &str) -> Result<ExecResult, TransportError> {
        let mut cmd = self.command(command);
        cmd.stdin(Stdio::null());
        let output = cmd.output().await.map_err(|source| TransportError::Spawn {
            program: self.exec[0].clone(),
            source,
        })?;
        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError> {
        let script = format!("ls -1Ap -- {}", quote(path));
        let result = self.exec(&script).await?;
        if !result.success() {
            return Err(TransportError::CommandFailed {
                command: script,
                code: result.exit_code,
                stderr: result.stderr_text(),
            });
        }
        Ok(parse_listing(&result.stdout_text()))
    }

    async fn open_upload(&self, remote_path: &str) -> Result<Box<dyn UploadChannel>, TransportError> {
        let script = format!("cat > {}", quote(remote_path));
        let mut cmd = self.command(&script);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = self.spawn(cmd)?;
        let stdin = child.stdin.take();
        Ok(Box::new(ProcessUpload { script, child, stdin }))
    }

    async fn open_download(&self, remote_path: &str) -> Result<Box<dyn DownloadChannel>, TransportError> {
        let size_script = format!("wc -c < {}", quote(remote_path));
        let sized = self.exec(&size_script).await?;
        if !sized.success() {
            return Err(TransportError::CommandFailed {
                command: size_script,
                code: sized.exit_code,
                stderr: sized.stderr_text(),
            });
        }
        let size = sized.stdout_text().trim().parse::<u64>().ok();
        if size.is_none() {
            warn!(path = remote_path, "remote size unknown");
        }

        let script = format!("cat -- {}", quote(remote_path));
        let mut cmd = self.command(&script);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn(cmd)?;
        let Some(stdout) = child.stdout.take() else {
            return Err(TransportError::Misconfigured("download pipe unavailable".into()));
        };
        Ok(Box::new(ProcessDownload {
            script,
            child,
            stdout,
            size,
        }))
    }
}

/// Waits for a transfer process and turns a failure into an error.
async fn finish_process(script: &str, child: Child) -> Result<(), TransportError> {
    let output = child.wait_with_output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(TransportError::CommandFailed {
        command: script.to_string(),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

struct ProcessUpload {
    script: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl UploadChannel for ProcessUpload {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::ChannelClosed)?;
        stdin.write_all(chunk).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), TransportError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        let ProcessUpload { script, child, .. } = *self;
        finish_process(&script, child).await
    }
}

struct ProcessDownload {
    script: String,
    child: Child,
    stdout: ChildStdout,
    size: Option<u64>,
}

#[async_trait]
impl DownloadChannel for ProcessDownload {
    fn size(&self) -> Option<u64> {
        self.size
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self.stdout.read(buf).await?)
    }

    async fn finish(self: Box<Self>) -> Result<(), TransportError> {
        let ProcessDownload { script, child, stdout, .. } = *self;
        drop(stdout);
        finish_process(&script, child).await
    }
}
