//! Byte sources feeding the tee pipeline
//!
//! A source is either an upstream HTTP body or the stdout of a muxer
//! process. Both are read in bounded chunks. A process source owns a task
//! draining its stderr; the tail of that output is kept for error reports.

use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{RelayError, Result};

/// Stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for stderr EOF once the process has exited
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Muxer process
// ============================================================================

/// A running muxer: stdout is the media stream, stderr is diagnostics
pub struct MuxProcess {
    label: String,
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<String>>,
    terminated: bool,
}

impl MuxProcess {
    /// Spawn `command` with piped stdout and stderr.
    ///
    /// The child is killed if this value is dropped before it exits.
    pub fn spawn(mut command: Command, label: &str) -> Result<Self> {
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RelayError::Mux(format!("failed to spawn {}: {}", label, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Mux(format!("{}: stdout not captured", label)))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(process = %label, "{}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        debug!(process = %label, pid = ?child.id(), "Spawned muxer");

        Ok(Self {
            label: label.to_string(),
            child,
            stdout,
            stderr_task,
            terminated: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read up to the buffer's spare capacity from stdout. Zero means EOF.
    pub async fn read_chunk(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stdout.read_buf(buf).await
    }

    /// Request termination without waiting for it
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            // Already exited
            debug!(process = %self.label, error = %e, "Kill request failed");
        }
        self.terminated = true;
    }

    /// Wait for exit and collect the stderr tail
    pub async fn wait(self) -> (io::Result<ExitStatus>, String) {
        let Self {
            label,
            mut child,
            stdout,
            stderr_task,
            ..
        } = self;
        // Grandchildren still writing get EPIPE instead of blocking
        drop(stdout);

        let status = child.wait().await;
        let tail = match stderr_task {
            Some(task) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    debug!(process = %label, "Stderr still open after exit");
                    String::new()
                }
            },
            None => String::new(),
        };
        (status, tail)
    }
}

// ============================================================================
// ByteSource
// ============================================================================

enum Inner {
    Http {
        stream: BoxStream<'static, std::result::Result<Bytes, reqwest::Error>>,
    },
    Stream {
        stream: BoxStream<'static, io::Result<Bytes>>,
    },
    Process(MuxProcess),
}

/// A chunked producer of media bytes
pub struct ByteSource {
    inner: Inner,
    chunk_size: usize,
    /// Remainder of an upstream chunk larger than `chunk_size`
    pending: Bytes,
    bytes_read: u64,
    expected_len: Option<u64>,
}

/// How a source ended, as seen by [`ByteSource::finish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceExit {
    pub bytes_read: u64,
    /// No producer process remains running
    pub terminated: bool,
}

impl ByteSource {
    /// Upstream HTTP response body. A `Content-Length` becomes the expected
    /// length, so a truncated body is detected.
    pub fn http(response: reqwest::Response, chunk_size: usize) -> Self {
        let expected_len = response.content_length();
        Self {
            inner: Inner::Http {
                stream: response.bytes_stream().boxed(),
            },
            chunk_size,
            pending: Bytes::new(),
            bytes_read: 0,
            expected_len,
        }
    }

    /// Stdout of a muxer process
    pub fn process(process: MuxProcess, chunk_size: usize) -> Self {
        Self {
            inner: Inner::Process(process),
            chunk_size,
            pending: Bytes::new(),
            bytes_read: 0,
            expected_len: None,
        }
    }

    /// Any stream of bytes
    pub fn stream(
        stream: BoxStream<'static, io::Result<Bytes>>,
        expected_len: Option<u64>,
        chunk_size: usize,
    ) -> Self {
        Self {
            inner: Inner::Stream { stream },
            chunk_size,
            pending: Bytes::new(),
            bytes_read: 0,
            expected_len,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.expected_len
    }

    /// Next chunk of at most `chunk_size` bytes, or `None` at end of stream
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.pending.is_empty() {
            let next = match &mut self.inner {
                Inner::Http { stream } => match stream.next().await {
                    Some(Ok(bytes)) => Some(bytes),
                    Some(Err(e)) => return Err(RelayError::Upstream(e.to_string())),
                    None => None,
                },
                Inner::Stream { stream } => match stream.next().await {
                    Some(Ok(bytes)) => Some(bytes),
                    Some(Err(e)) => return Err(RelayError::Upstream(e.to_string())),
                    None => None,
                },
                Inner::Process(process) => {
                    let mut buf = BytesMut::with_capacity(self.chunk_size);
                    match process.read_chunk(&mut buf).await {
                        Ok(0) => None,
                        Ok(_) => Some(buf.freeze()),
                        Err(e) => {
                            return Err(RelayError::Mux(format!(
                                "{}: read failed: {}",
                                process.label(),
                                e
                            )))
                        }
                    }
                }
            };
            match next {
                Some(bytes) => self.pending = bytes,
                None => return Ok(None),
            }
        }

        let take = self.pending.len().min(self.chunk_size);
        let chunk = self.pending.split_to(take);
        self.bytes_read += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Put a chunk returned by [`ByteSource::next_chunk`] back in front of
    /// the stream
    pub fn unread(&mut self, chunk: Bytes) {
        self.bytes_read = self.bytes_read.saturating_sub(chunk.len() as u64);
        if self.pending.is_empty() {
            self.pending = chunk;
        } else {
            let mut joined = BytesMut::with_capacity(chunk.len() + self.pending.len());
            joined.extend_from_slice(&chunk);
            joined.extend_from_slice(&self.pending);
            self.pending = joined.freeze();
        }
    }

    /// Stop producing early. For a process this requests termination.
    pub fn abort(&mut self) {
        if let Inner::Process(process) = &mut self.inner {
            process.terminate();
        }
    }

    /// Settle the source after the last chunk (or after [`ByteSource::abort`]).
    ///
    /// With `check` set, verifies the source produced a complete, non-empty
    /// stream: the process exited zero and upstream delivered every announced
    /// byte.
    pub async fn finish(self, check: bool) -> (Result<()>, SourceExit) {
        let bytes_read = self.bytes_read;
        match self.inner {
            Inner::Process(process) => {
                let label = process.label().to_string();
                let (status, tail) = process.wait().await;
                let exit = SourceExit {
                    bytes_read,
                    terminated: status.is_ok(),
                };
                if !check {
                    return (Ok(()), exit);
                }
                let result = match status {
                    Ok(status) if !status.success() => Err(RelayError::Mux(format!(
                        "{} exited with {}: {}",
                        label, status, tail
                    ))),
                    Ok(_) if bytes_read == 0 => {
                        Err(RelayError::Mux(format!("{} produced no output: {}", label, tail)))
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(RelayError::Mux(format!("{}: wait failed: {}", label, e))),
                };
                if result.is_err() {
                    warn!(process = %label, "Muxer failed");
                }
                (result, exit)
            }
            Inner::Http { .. } | Inner::Stream { .. } => {
                let exit = SourceExit {
                    bytes_read,
                    terminated: true,
                };
                if !check {
                    return (Ok(()), exit);
                }
                let result = match self.expected_len {
                    Some(expected) if expected != bytes_read => Err(RelayError::Upstream(format!(
                        "truncated body: {} of {} bytes",
                        bytes_read, expected
                    ))),
                    _ if bytes_read == 0 => Err(RelayError::Upstream("empty body".into())),
                    _ => Ok(()),
                };
                (result, exit)
            }
        }
    }
}
