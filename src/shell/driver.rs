//! Async session driver
//!
//! Owns the I/O around a [`Session`]: terminal input, the remote shell
//! channel and background transfers are multiplexed in one loop, and every
//! [`Effect`] the session returns is carried out in order. Results of remote
//! round trips are fed back into the session, and the effects that produces
//! run after the rest of the current batch.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::dispatch::Refresh;
use super::history::HistoryFile;
use super::path::quote;
use super::{Effect, Session};
use crate::transfer::{TransferEvent, TransferManager};
use crate::transport::{ShellChannel, Transport, TreeRefresher};

/// Asks the remote for its home and working directory, one per line.
pub const SEED_COMMAND: &str = "printf '%s\\n' \"$HOME\"; pwd";

enum Wake {
    Input(Option<Vec<u8>>),
    Remote(Option<Bytes>),
    Transfer(TransferEvent),
}

pub struct Driver {
    session: Session,
    transport: Arc<dyn Transport>,
    tree: Arc<dyn TreeRefresher>,
    transfers: TransferManager,
    history_file: Option<HistoryFile>,
    terminal_width: Option<fn() -> Option<usize>>,
}

impl Driver {
    pub fn new(
        session: Session,
        transport: Arc<dyn Transport>,
        tree: Arc<dyn TreeRefresher>,
        transfers: TransferManager,
    ) -> Self {
        Self {
            session,
            transport,
            tree,
            transfers,
            history_file: None,
            terminal_width: None,
        }
    }

    /// Asks `measure` for the terminal width before every update, so resizes
    /// are picked up.
    pub fn with_terminal_width(mut self, measure: fn() -> Option<usize>) -> Self {
        self.terminal_width = Some(measure);
        self
    }

    fn measure_terminal(&mut self) {
        if let Some(measure) = self.terminal_width {
            self.session.set_terminal_width(measure());
        }
    }

    /// Persists submitted commands to `file`.
    pub fn with_history_file(mut self, file: HistoryFile) -> Self {
        debug!(path = %file.path().display(), "appending history");
        self.history_file = Some(file);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Runs until terminal input ends or the remote shell goes away.
    pub async fn run<W>(&mut self, mut input: mpsc::Receiver<Vec<u8>>, terminal: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut shell = self
            .transport
            .open_shell()
            .await
            .context("failed to open the remote shell")?;
        self.seed_directory().await;

        self.measure_terminal();
        let effects = self.session.start();
        self.apply(effects, &mut shell, terminal).await?;

        while !self.session.is_closed() {
            let wake = tokio::select! {
                bytes = input.recv() => Wake::Input(bytes),
                chunk = shell.output.recv() => Wake::Remote(chunk),
                Some(event) = self.transfers.next_event() => Wake::Transfer(event),
            };
            self.measure_terminal();
            let effects = match wake {
                Wake::Input(Some(bytes)) => self.session.handle_input(&bytes),
                Wake::Input(None) => {
                    info!("terminal input closed");
                    break;
                }
                Wake::Remote(Some(chunk)) => self.session.handle_remote_output(&chunk),
                Wake::Remote(None) => self.session.channel_closed(),
                Wake::Transfer(event) => self.session.transfer_event(event),
            };
            self.apply(effects, &mut shell, terminal).await?;
        }

        self.transfers.abort_all();
        Ok(())
    }

    async fn seed_directory(&mut self) {
        match self.transport.exec(SEED_COMMAND).await {
            Ok(result) if result.success() => {
                let stdout = result.stdout_text();
                let mut lines = stdout.lines();
                let home = lines.next();
                let cwd = lines.next().or(home).unwrap_or_default();
                debug!(cwd, home, "remote directories");
                self.session.set_working_directory(cwd, home);
            }
            Ok(result) => {
                warn!(code = result.exit_code, stderr = %result.stderr_text(), "cannot read remote directories")
            }
            Err(err) => warn!(error = %err, "cannot read remote directories"),
        }
    }

    async fn apply<W>(&mut self, effects: Vec<Effect>, shell: &mut ShellChannel, terminal: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            let follow_up = match effect {
                Effect::Display(bytes) => {
                    terminal.write_all(&bytes).await.context("terminal write failed")?;
                    terminal.flush().await.context("terminal write failed")?;
                    continue;
                }
                Effect::Send(bytes) => match send(shell, &bytes).await {
                    Ok(()) => continue,
                    Err(err) => {
                        warn!(error = %err, "shell write failed");
                        // the rest of the batch was meant for a live shell
                        queue.clear();
                        self.session.transport_failed(&err.to_string())
                    }
                },
                Effect::ResolveDirectory(change) => {
                    let result = resolve_directory(self.transport.as_ref(), &change.target).await;
                    self.session.directory_resolved(change, result)
                }
                Effect::ListDirectory(request) => {
                    let result = self
                        .transport
                        .list_dir(&request.directory)
                        .await
                        .map_err(|err| err.to_string());
                    self.session.completion_ready(request, result)
                }
                Effect::StartTransfer(request) => {
                    match self.transfers.start(request, self.transport.clone()) {
                        Ok(pending) => self.session.transfer_event(TransferEvent::Progress(pending)),
                        Err(err) => {
                            warn!(target: "transfer", error = %err, "transfer rejected");
                            self.session.transfer_rejected(&err)
                        }
                    }
                }
                Effect::RefreshTree(refresh) => {
                    self.schedule_refresh(refresh);
                    continue;
                }
                Effect::HistoryAppend(entry) => {
                    if let Some(file) = self.history_file.as_mut() {
                        file.append(&entry);
                    }
                    continue;
                }
            };
            queue.extend(follow_up);
        }
        Ok(())
    }

    fn schedule_refresh(&self, refresh: Refresh) {
        let tree = self.tree.clone();
        if refresh.delay.is_zero() {
            for path in &refresh.paths {
                tree.refresh(path);
            }
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(refresh.delay).await;
            for path in &refresh.paths {
                tree.refresh(path);
            }
        });
    }
}

/// `cd TARGET && pwd` outside the interactive shell: the confirmed
/// directory, or the shell's complaint.
async fn resolve_directory(transport: &dyn Transport, target: &str) -> Result<String, String> {
    let command = format!("cd {} && pwd", quote(target));
    let result = transport
        .exec(&command)
        .await
        .map_err(|err| err.to_string())?;
    if !result.success() {
        let stderr = result.stderr_text();
        // `sh: 1: cd: can't cd to /x` reads better without the prefix
        return Err(match stderr.lines().last().and_then(|l| l.rsplit(": ").next()) {
            Some(reason) if !reason.is_empty() => reason.to_string(),
            _ => format!("exit code {}", result.exit_code),
        });
    }
    result
        .stdout_text()
        .lines()
        .last()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "no directory reported".to_string())
}

async fn send(shell: &mut ShellChannel, bytes: &[u8]) -> std::io::Result<()> {
    shell.input.write_all(bytes).await?;
    shell.input.flush().await
}
