//! Tee streaming
//!
//! Every chunk read from a [`ByteSource`] is sent to the client and, when a
//! cache fill is attached, written to its staging file at the same time. The
//! next chunk is not read until both have accepted the current one, so
//! memory stays at one chunk and backpressure from either side reaches the
//! source.
//!
//! On a clean end the staging file is published. On any failure or client
//! disconnect it is dropped, which deletes it, and the in-flight claim is
//! released with it.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::body::BodyChunk;
use super::source::ByteSource;
use crate::cache::{CacheStore, ContentKey, InFlightGuard, StagingFile};

/// A cache fill riding along with a stream.
///
/// Dropping it deletes the staging file first, then releases the claim.
pub struct Fill {
    staging: StagingFile,
    store: Arc<CacheStore>,
    _claim: InFlightGuard,
}

impl Fill {
    pub fn new(staging: StagingFile, store: Arc<CacheStore>, claim: InFlightGuard) -> Self {
        Self {
            staging,
            store,
            _claim: claim,
        }
    }
}

/// How a tee run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeeOutcome {
    /// Source exhausted and verified
    Completed,
    /// The client stopped reading
    ClientDisconnected,
    /// Source error, non-zero exit, empty or truncated output
    SourceFailed(String),
}

/// Summary of one tee run
#[derive(Debug, Clone)]
pub struct TeeReport {
    pub key: ContentKey,
    pub bytes_streamed: u64,
    pub outcome: TeeOutcome,
    /// A cache entry was created
    pub published: bool,
    /// No producer process is left running
    pub source_terminated: bool,
}

/// Run the tee on its own task
pub fn spawn_tee(
    key: ContentKey,
    source: ByteSource,
    tx: mpsc::Sender<BodyChunk>,
    fill: Option<Fill>,
) -> JoinHandle<TeeReport> {
    tokio::spawn(run_tee(key, source, tx, fill))
}

/// Pump `source` into `tx` (and `fill`) until it ends, fails or the client
/// goes away
pub async fn run_tee(
    key: ContentKey,
    mut source: ByteSource,
    tx: mpsc::Sender<BodyChunk>,
    mut fill: Option<Fill>,
) -> TeeReport {
    let mut outcome = TeeOutcome::Completed;
    let mut bytes_streamed = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                // A body with a known length is released as soon as its last
                // byte is written
                if !delivered_all(&source, bytes_streamed) {
                    outcome = TeeOutcome::ClientDisconnected;
                }
                break;
            }
            next = source.next_chunk() => next,
        };

        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                outcome = TeeOutcome::SourceFailed(e.to_string());
                break;
            }
        };

        let len = chunk.len() as u64;
        let write = async {
            match fill.as_mut() {
                Some(f) => f.staging.write_all(&chunk).await,
                None => Ok(()),
            }
        };
        let (written, sent) = tokio::join!(write, tx.send(Ok(chunk.clone())));

        if let Err(e) = written {
            warn!(key = %key, error = %e, "Cache write failed, continuing without caching");
            fill = None;
        }
        if sent.is_err() {
            outcome = TeeOutcome::ClientDisconnected;
            break;
        }
        bytes_streamed += len;
    }

    let mut published = false;
    let source_terminated;

    match outcome {
        TeeOutcome::Completed => {
            let (checked, exit) = source.finish(true).await;
            source_terminated = exit.terminated;
            match checked {
                Ok(()) => {
                    if let Some(Fill { staging, store, _claim }) = fill.take() {
                        match store.publish(staging).await {
                            Ok(_) => published = true,
                            Err(e) => {
                                warn!(key = %key, error = %e, "Failed to publish cache entry")
                            }
                        }
                        drop(_claim);
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    outcome = TeeOutcome::SourceFailed(e.to_string());
                }
            }
        }
        TeeOutcome::ClientDisconnected | TeeOutcome::SourceFailed(_) => {
            source.abort();
            let (_, exit) = source.finish(false).await;
            source_terminated = exit.terminated;
        }
    }

    // Anything not published is discarded here
    drop(fill);

    match &outcome {
        TeeOutcome::Completed => {
            debug!(key = %key, bytes = bytes_streamed, published, "Stream completed")
        }
        TeeOutcome::ClientDisconnected => {
            debug!(key = %key, bytes = bytes_streamed, "Client disconnected")
        }
        TeeOutcome::SourceFailed(reason) => {
            warn!(key = %key, bytes = bytes_streamed, reason = %reason, "Stream failed")
        }
    }
    if published {
        info!(key = %key, bytes = bytes_streamed, "Cache filled");
    }

    TeeReport {
        key,
        bytes_streamed,
        outcome,
        published,
        source_terminated,
    }
}

fn delivered_all(source: &ByteSource, bytes_streamed: u64) -> bool {
    matches!(source.expected_len(), Some(len) if bytes_streamed >= len)
}
