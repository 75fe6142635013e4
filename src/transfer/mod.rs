//! File transfers between the local machine and the remote host
//!
//! A transfer runs as a background task streaming chunks through the
//! transport's upload or download channel. The session hears about it only
//! through [`TransferEvent`]s, throttled so progress redraws stay cheap.
//! One transfer runs at a time; starting another while one is active is
//! rejected with [`TransferError::Busy`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::shell::path;
use crate::transport::Transport;

pub type TransferId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn verb(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// A transfer the dispatcher asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_path: String,
}

/// A transfer in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub id: TransferId,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// `None` until the size is known, or when the remote never reports it.
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
}

impl PendingTransfer {
    fn new(id: TransferId, request: TransferRequest) -> Self {
        Self {
            id,
            direction: request.direction,
            local_path: request.local_path,
            remote_path: request.remote_path,
            total_bytes: None,
            transferred_bytes: 0,
        }
    }

    pub fn percent(&self) -> Option<u64> {
        match self.total_bytes {
            Some(0) => Some(100),
            Some(total) => Some((self.transferred_bytes.min(total) * 100) / total),
            None => None,
        }
    }

    /// Remote directory whose listing changes when the transfer completes.
    pub fn remote_dir(&self) -> String {
        path::parent(&self.remote_path)
    }

    fn name(&self) -> &str {
        path::basename(&self.remote_path)
    }

    /// One-line status shown while the transfer runs.
    pub fn progress_line(&self) -> String {
        let done = human_bytes(self.transferred_bytes);
        match (self.percent(), self.total_bytes) {
            (Some(pct), Some(total)) => format!(
                "{} {} {:>3}% ({} / {})",
                self.direction.verb(),
                self.name(),
                pct,
                done,
                human_bytes(total)
            ),
            _ => format!("{} {} {}", self.direction.verb(), self.name(), done),
        }
    }

    pub fn summary(&self) -> String {
        match self.direction {
            Direction::Upload => format!(
                "uploaded {} -> {} ({})",
                self.local_path.display(),
                self.remote_path,
                human_bytes(self.transferred_bytes)
            ),
            Direction::Download => format!(
                "downloaded {} -> {} ({})",
                self.remote_path,
                self.local_path.display(),
                human_bytes(self.transferred_bytes)
            ),
        }
    }

    pub fn failure(&self, error: &TransferError) -> String {
        let partial = match self.total_bytes {
            Some(total) => format!("{} of {}", human_bytes(self.transferred_bytes), human_bytes(total)),
            None => human_bytes(self.transferred_bytes),
        };
        format!(
            "{} {} failed after {}: {}",
            self.direction.verb(),
            self.name(),
            partial,
            error
        )
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[derive(Debug)]
pub enum TransferEvent {
    Progress(PendingTransfer),
    Finished(PendingTransfer),
    Failed {
        transfer: PendingTransfer,
        error: TransferError,
    },
}

impl TransferEvent {
    pub fn transfer(&self) -> &PendingTransfer {
        match self {
            TransferEvent::Progress(t) | TransferEvent::Finished(t) => t,
            TransferEvent::Failed { transfer, .. } => transfer,
        }
    }
}

/// Sends progress no more often than `interval`.
struct Reporter {
    tx: mpsc::UnboundedSender<TransferEvent>,
    interval: Duration,
    last: Option<Instant>,
}

impl Reporter {
    fn progress(&mut self, transfer: &PendingTransfer) {
        let due = self.last.map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            self.last = Some(Instant::now());
            let _ = self.tx.send(TransferEvent::Progress(transfer.clone()));
        }
    }
}

struct Active {
    transfer: PendingTransfer,
    handle: JoinHandle<()>,
}

/// Runs transfers and collects their events.
pub struct TransferManager {
    chunk_size: usize,
    progress_interval: Duration,
    next_id: TransferId,
    current: Option<Active>,
    tx: mpsc::UnboundedSender<TransferEvent>,
    rx: mpsc::UnboundedReceiver<TransferEvent>,
}

impl TransferManager {
    pub fn new(chunk_size: usize, progress_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            chunk_size: chunk_size.max(1),
            progress_interval,
            next_id: 1,
            current: None,
            tx,
            rx,
        }
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Starts a transfer in the background.
    pub fn start(
        &mut self,
        request: TransferRequest,
        transport: Arc<dyn Transport>,
    ) -> Result<PendingTransfer, TransferError> {
        if let Some(active) = &self.current {
            return Err(TransferError::Busy(active.transfer.remote_path.clone()));
        }

        let id = self.next_id;
        self.next_id += 1;
        let transfer = PendingTransfer::new(id, request);
        info!(
            target: "transfer",
            id,
            direction = transfer.direction.verb(),
            local = %transfer.local_path.display(),
            remote = %transfer.remote_path,
            "transfer started"
        );

        let reporter = Reporter {
            tx: self.tx.clone(),
            interval: self.progress_interval,
            last: None,
        };
        let handle = tokio::spawn(run(transfer.clone(), transport, self.chunk_size, reporter));
        self.current = Some(Active {
            transfer: transfer.clone(),
            handle,
        });
        Ok(transfer)
    }

    /// Waits for the next event. Finishing events free the manager for the
    /// next transfer.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        let event = self.rx.recv().await?;
        if matches!(event, TransferEvent::Finished(_) | TransferEvent::Failed { .. }) {
            let id = event.transfer().id;
            if self.current.as_ref().is_some_and(|a| a.transfer.id == id) {
                self.current = None;
            }
        }
        Some(event)
    }

    /// Stops the running transfer, if any.
    pub fn abort_all(&mut self) {
        if let Some(active) = self.current.take() {
            warn!(target: "transfer", id = active.transfer.id, "transfer aborted");
            active.handle.abort();
        }
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn run(
    mut transfer: PendingTransfer,
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    mut reporter: Reporter,
) {
    let result = match transfer.direction {
        Direction::Upload => upload(&mut transfer, transport.as_ref(), chunk_size, &mut reporter).await,
        Direction::Download => download(&mut transfer, transport.as_ref(), chunk_size, &mut reporter).await,
    };
    let event = match result {
        Ok(()) => {
            info!(target: "transfer", id = transfer.id, bytes = transfer.transferred_bytes, "transfer finished");
            TransferEvent::Finished(transfer)
        }
        Err(error) => {
            warn!(target: "transfer", id = transfer.id, error = %error, "transfer failed");
            TransferEvent::Failed { transfer, error }
        }
    };
    let _ = reporter.tx.send(event);
}

async fn upload(
    transfer: &mut PendingTransfer,
    transport: &dyn Transport,
    chunk_size: usize,
    reporter: &mut Reporter,
) -> Result<(), TransferError> {
    let local_error = |source| TransferError::Local {
        path: transfer.local_path.clone(),
        source,
    };
    let mut file = File::open(&transfer.local_path).await.map_err(local_error)?;
    let size = file.metadata().await.map_err(local_error)?.len();
    transfer.total_bytes = Some(size);

    let mut channel = transport.open_upload(&transfer.remote_path).await?;
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = file.read(&mut buf).await.map_err(|source| TransferError::Local {
            path: transfer.local_path.clone(),
            source,
        })?;
        if n == 0 {
            break;
        }
        channel.write_chunk(&buf[..n]).await?;
        transfer.transferred_bytes += n as u64;
        reporter.progress(transfer);
    }
    channel.finish().await?;
    Ok(())
}

async fn download(
    transfer: &mut PendingTransfer,
    transport: &dyn Transport,
    chunk_size: usize,
    reporter: &mut Reporter,
) -> Result<(), TransferError> {
    let mut channel = transport.open_download(&transfer.remote_path).await?;
    transfer.total_bytes = channel.size();

    let path = transfer.local_path.clone();
    let mut file = File::create(&path).await.map_err(|source| TransferError::Local {
        path: path.clone(),
        source,
    })?;

    let mut buf = vec![0u8; chunk_size];
    let copied = async {
        loop {
            let n = channel.read_chunk(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(|source| TransferError::Local {
                path: path.clone(),
                source,
            })?;
            transfer.transferred_bytes += n as u64;
            reporter.progress(transfer);
        }
        file.flush().await.map_err(|source| TransferError::Local {
            path: path.clone(),
            source,
        })?;
        channel.finish().await?;
        Ok::<(), TransferError>(())
    }
    .await;

    if copied.is_err() {
        drop(file);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            debug!(target: "transfer", error = %err, "partial download left behind");
        }
    }
    copied
}
