//! Response bodies
//!
//! Streaming responses are fed through a bounded channel by a producer task
//! (the tee task or a cached-file reader). The channel holds one chunk, so a
//! slow client slows the producer instead of growing a buffer.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::CachedReader;

/// Body type of every response this crate produces
pub type ResponseBody = BoxBody<Bytes, io::Error>;

/// One item sent to the client. An `Err` aborts the response.
pub type BodyChunk = Result<Bytes, io::Error>;

/// Chunks buffered between a producer and the client
pub const CHANNEL_CAPACITY: usize = 1;

/// Body backed by the receiving half of a chunk channel
pub struct ChannelBody {
    rx: mpsc::Receiver<BodyChunk>,
    remaining: Option<u64>,
}

impl ChannelBody {
    /// Create a body and the sender that feeds it
    pub fn channel() -> (mpsc::Sender<BodyChunk>, ChannelBody) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (tx, ChannelBody { rx, remaining: None })
    }

    /// Announce the exact body length, used for the size hint
    pub fn with_length(mut self, len: u64) -> Self {
        self.remaining = Some(len);
        self
    }

    pub fn boxed(self) -> ResponseBody {
        BodyExt::boxed(self)
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(data))) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(data.len() as u64);
                }
                Poll::Ready(Some(Ok(Frame::data(data))))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.remaining == Some(0)
    }

    fn size_hint(&self) -> SizeHint {
        match self.remaining {
            Some(n) => SizeHint::with_exact(n),
            None => SizeHint::default(),
        }
    }
}

/// Empty body, for HEAD responses and bodiless statuses
pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Body holding `data` in memory
pub fn full(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Stream `len` bytes of a cached entry starting at `start`.
///
/// The reader (and with it the entry's reader count) is held until the
/// producer task ends.
pub fn cached_file_body(
    mut reader: CachedReader,
    start: u64,
    len: u64,
    chunk_size: usize,
) -> ChannelBody {
    let (tx, body) = ChannelBody::channel();

    tokio::spawn(async move {
        if start > 0 {
            if let Err(e) = reader.seek_to(start).await {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return;
            }
        }

        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(chunk_size as u64) as usize;
            let mut buf = BytesMut::with_capacity(want);
            let mut limited = (&mut reader.file).take(want as u64);

            match limited.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = tx
                        .send(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "cached entry shorter than expected",
                        )))
                        .await;
                    return;
                }
                Ok(n) => {
                    remaining -= n as u64;
                    if tx.send(Ok(buf.freeze())).await.is_err() {
                        debug!("Client went away while reading cached entry");
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    body.with_length(len)
}
