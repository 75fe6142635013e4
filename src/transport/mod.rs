//! Remote transport
//!
//! The session never talks to a connection directly. Everything remote goes
//! through [`Transport`]: an interactive shell channel, one-off command
//! execution, directory listings and streamed file transfers. A
//! [`TreeRefresher`] is told when remote directories may have changed.

use std::any::Any;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::TransportError;

pub mod command;

pub use command::CommandTransport;

/// The kind of a directory entry. Anything that is not a directory,
/// symlinks included, lists as a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// A single entry returned by [`Transport::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Result of running a command on the remote via [`Transport::exec`].
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Interactive shell: keys go into `input`, output comes out of `output`.
/// The channel closes when `output` yields `None`.
pub struct ShellChannel {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: mpsc::Receiver<Bytes>,
    /// Keeps whatever backs the channel (a child process) alive.
    _guard: Option<Box<dyn Any + Send>>,
}

impl ShellChannel {
    pub fn new(input: Box<dyn AsyncWrite + Send + Unpin>, output: mpsc::Receiver<Bytes>) -> Self {
        Self {
            input,
            output,
            _guard: None,
        }
    }

    pub fn with_guard(mut self, guard: impl Any + Send) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }
}

/// Destination of an upload.
#[async_trait]
pub trait UploadChannel: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Flushes and confirms the upload.
    async fn finish(self: Box<Self>) -> Result<(), TransportError>;
}

/// Source of a download.
#[async_trait]
pub trait DownloadChannel: Send {
    /// Total size, when the remote reported it.
    fn size(&self) -> Option<u64>;

    /// Reads into `buf`; 0 means the end of the file.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    async fn finish(self: Box<Self>) -> Result<(), TransportError>;
}

/// A connection to the remote host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the interactive shell the user types into.
    async fn open_shell(&self) -> Result<ShellChannel, TransportError>;

    /// Run a command outside the interactive shell and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecResult, TransportError>;

    /// List the entries in a remote directory.
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError>;

    /// Start writing a remote file, creating or truncating it.
    async fn open_upload(&self, remote_path: &str) -> Result<Box<dyn UploadChannel>, TransportError>;

    /// Start reading a remote file.
    async fn open_download(&self, remote_path: &str) -> Result<Box<dyn DownloadChannel>, TransportError>;
}

/// Something showing the remote file tree.
pub trait TreeRefresher: Send + Sync {
    fn refresh(&self, remote_path: &str);
}

/// Tree refresher without a tree: records the request in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRefresher;

impl TreeRefresher for LoggingRefresher {
    fn refresh(&self, remote_path: &str) {
        info!(target: "tree", path = remote_path, "refresh");
    }
}

/// Parses `ls -1Ap` output: one name per line, directories end with `/`.
pub fn parse_listing(output: &str) -> Vec<DirEntry> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(name) => DirEntry {
                name: name.to_string(),
                kind: EntryKind::Dir,
            },
            None => DirEntry {
                name: line.to_string(),
                kind: EntryKind::File,
            },
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for session and driver tests.

    use std::collections::HashMap;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    use super::*;

    #[derive(Default)]
    pub struct FakeState {
        pub exec_log: Vec<String>,
        pub exec_results: HashMap<String, ExecResult>,
        pub listings: HashMap<String, Vec<DirEntry>>,
        pub files: HashMap<String, Vec<u8>>,
    }

    #[derive(Clone, Default)]
    pub struct FakeTransport {
        pub state: Arc<Mutex<FakeState>>,
        pub shell_output: Arc<Mutex<Option<mpsc::Receiver<Bytes>>>>,
        pub shell_input: Arc<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>,
    }

    /// Shell input whose every write fails, counting the attempts.
    pub struct BrokenPipe {
        writes: Arc<AtomicUsize>,
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    pub fn ok(stdout: &str) -> ExecResult {
        ExecResult {
            stdout: Bytes::from(stdout.to_string()),
            stderr: Bytes::new(),
            exit_code: 0,
        }
    }

    pub fn failed(stderr: &str) -> ExecResult {
        ExecResult {
            stdout: Bytes::new(),
            stderr: Bytes::from(stderr.to_string()),
            exit_code: 1,
        }
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on_exec(&self, command: &str, result: ExecResult) {
            self.state
                .lock()
                .unwrap()
                .exec_results
                .insert(command.to_string(), result);
        }

        pub fn with_file(&self, path: &str, data: &[u8]) {
            self.state
                .lock()
                .unwrap()
                .files
                .insert(path.to_string(), data.to_vec());
        }

        pub fn file(&self, path: &str) -> Option<Vec<u8>> {
            self.state.lock().unwrap().files.get(path).cloned()
        }

        /// Prepares the shell channel; returns the sender for remote output
        /// and the reader side of what the session sends.
        pub fn prepare_shell(&self) -> (mpsc::Sender<Bytes>, tokio::io::DuplexStream) {
            let (tx, rx) = mpsc::channel(64);
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            *self.shell_output.lock().unwrap() = Some(rx);
            *self.shell_input.lock().unwrap() = Some(Box::new(ours));
            (tx, theirs)
        }

        /// Like [`prepare_shell`](Self::prepare_shell), but nothing can be
        /// written to the shell; returns the count of write attempts.
        pub fn prepare_broken_shell(&self) -> (mpsc::Sender<Bytes>, Arc<AtomicUsize>) {
            let (tx, rx) = mpsc::channel(64);
            let writes = Arc::new(AtomicUsize::new(0));
            *self.shell_output.lock().unwrap() = Some(rx);
            *self.shell_input.lock().unwrap() = Some(Box::new(BrokenPipe { writes: writes.clone() }));
            (tx, writes)
        }
    }

    struct FakeUpload {
        state: Arc<Mutex<FakeState>>,
        path: String,
        data: Vec<u8>,
    }

    #[async_trait]
    impl UploadChannel for FakeUpload {
        async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
            self.data.extend_from_slice(chunk);
            Ok(())
        }

        async fn finish(self: Box<Self>) -> Result<(), TransportError> {
            let FakeUpload { state, path, data } = *self;
            state.lock().unwrap().files.insert(path, data);
            Ok(())
        }
    }

    struct FakeDownload {
        data: Vec<u8>,
        offset: usize,
    }

    #[async_trait]
    impl DownloadChannel for FakeDownload {
        fn size(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let n = buf.len().min(self.data.len() - self.offset);
            buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
            self.offset += n;
            Ok(n)
        }

        async fn finish(self: Box<Self>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open_shell(&self) -> Result<ShellChannel, TransportError> {
            let output = self
                .shell_output
                .lock()
                .unwrap()
                .take()
                .ok_or(TransportError::ChannelClosed)?;
            let input = self
                .shell_input
                .lock()
                .unwrap()
                .take()
                .ok_or(TransportError::ChannelClosed)?;
            Ok(ShellChannel::new(input, output))
        }

        async fn exec(&self, command: &str) -> Result<ExecResult, TransportError> {
            let mut state = self.state.lock().unwrap();
            state.exec_log.push(command.to_string());
            Ok(state
                .exec_results
                .get(command)
                .cloned()
                .unwrap_or_else(|| failed("unexpected command")))
        }

        async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError> {
            self.state
                .lock()
                .unwrap()
                .listings
                .get(path)
                .cloned()
                .ok_or_else(|| TransportError::CommandFailed {
                    command: format!("ls {path}"),
                    code: 2,
                    stderr: "No such file or directory".to_string(),
                })
        }

        async fn open_upload(&self, remote_path: &str) -> Result<Box<dyn UploadChannel>, TransportError> {
            Ok(Box::new(FakeUpload {
                state: self.state.clone(),
                path: remote_path.to_string(),
                data: Vec::new(),
            }))
        }

        async fn open_download(&self, remote_path: &str) -> Result<Box<dyn DownloadChannel>, TransportError> {
            let data = self
                .file(remote_path)
                .ok_or_else(|| TransportError::CommandFailed {
                    command: format!("cat {remote_path}"),
                    code: 1,
                    stderr: "No such file or directory".to_string(),
                })?;
            Ok(Box::new(FakeDownload { data, offset: 0 }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let entries = parse_listing("bin/\nnotes.txt\n.profile\nlatest\n\n");
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "bin".into(), kind: EntryKind::Dir },
                DirEntry { name: "notes.txt".into(), kind: EntryKind::File },
                DirEntry { name: ".profile".into(), kind: EntryKind::File },
                // a symlink carries no marker under -p
                DirEntry { name: "latest".into(), kind: EntryKind::File },
            ]
        );
    }

    #[test]
    fn test_exec_result_text() {
        let result = ExecResult {
            stdout: Bytes::from_static(b"/root\n"),
            stderr: Bytes::from_static(b" oops \n"),
            exit_code: 0,
        };
        assert!(result.success());
        assert_eq!(result.stdout_text(), "/root\n");
        assert_eq!(result.stderr_text(), "oops");
    }
}
