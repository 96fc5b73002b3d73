//! Multiplexed stream
//!
//! A [`Stream`] pulls inbound frames from its host without blocking, parks on the
//! host's shared notification when nothing is queued, and pushes outbound data
//! through the host's shared writer in frames bounded by `max_frame_size`.

use crate::error::{SessionError, StreamError};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use smux_proto::{Command, Frame, StreamId, MAX_PAYLOAD_SIZE};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The side of a session a [`Stream`] talks to
///
/// Implemented by [`Session`](crate::Session); tests substitute their own host.
#[async_trait]
pub trait StreamHost: Send + Sync {
    /// Pop the next queued inbound frame for `stream_id`, if any. Must not block.
    fn poll_inbound(&self, stream_id: StreamId) -> Option<Frame>;

    /// Write one fully encoded frame onto the shared connection
    async fn write_frame(&self, frame: Bytes) -> Result<(), SessionError>;

    /// Stop routing frames to `stream_id` and drop anything queued for it
    fn forget(&self, stream_id: StreamId);
}

#[derive(Default)]
struct ReadState {
    /// Unconsumed tail of the last pulled data frame
    pending: Bytes,
    /// Set once the peer reset the stream
    eof: bool,
}

/// Multiplexed stream handle
pub struct Stream {
    id: StreamId,
    max_frame_size: usize,
    host: Arc<dyn StreamHost>,
    notify: Arc<Notify>,
    die: CancellationToken,
    closed: AtomicBool,
    state: Mutex<ReadState>,
}

impl Stream {
    /// Create a stream in the open state.
    ///
    /// `notify` is fired by the host whenever inbound data may exist for any of its
    /// streams. Cancelling `die` (or a parent of it) kills the stream.
    /// `max_frame_size` is clamped to `1..=MAX_PAYLOAD_SIZE`.
    pub fn new(
        id: StreamId,
        max_frame_size: usize,
        notify: Arc<Notify>,
        die: CancellationToken,
        host: Arc<dyn StreamHost>,
    ) -> Self {
        Self {
            id,
            max_frame_size: max_frame_size.clamp(1, MAX_PAYLOAD_SIZE),
            host,
            notify,
            die,
            closed: AtomicBool::new(false),
            state: Mutex::new(ReadState::default()),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Whether the stream was closed locally or its session went away
    pub fn is_closed(&self) -> bool {
        self.die.is_cancelled()
    }

    /// Read stream payload into `buf`.
    ///
    /// Waits until at least one byte is available. Returns
    /// [`StreamError::EndOfStream`] once the peer reset the stream and
    /// [`StreamError::BrokenPipe`] if the stream dies while waiting.
    /// An empty `buf` returns `Ok(0)` immediately.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // Register for the next notification before polling so a frame
            // delivered between the poll and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_read(buf) {
                return result;
            }

            tokio::select! {
                biased;
                _ = self.die.cancelled() => return Err(StreamError::BrokenPipe),
                _ = &mut notified => {
                    trace!("Stream {} woken, polling again", self.id);
                }
            }
        }
    }

    /// One non-blocking pass over the pending buffer and the host queue
    fn try_read(&self, buf: &mut [u8]) -> Option<Result<usize, StreamError>> {
        let mut state = self.lock_state();

        if !state.pending.is_empty() {
            return Some(Ok(copy_into(buf, &mut state.pending)));
        }
        if self.die.is_cancelled() {
            return Some(Err(StreamError::BrokenPipe));
        }
        if state.eof {
            return Some(Err(StreamError::EndOfStream));
        }

        loop {
            let frame = self.host.poll_inbound(self.id)?;
            match frame.cmd {
                Command::Psh if frame.payload.is_empty() => continue,
                Command::Psh => {
                    let mut payload = frame.payload;
                    let n = copy_into(buf, &mut payload);
                    state.pending = payload;
                    trace!("Read {} bytes on stream {}", n, self.id);
                    return Some(Ok(n));
                }
                cmd => {
                    debug!("Stream {} ended by peer ({:?})", self.id, cmd);
                    state.eof = true;
                    return Some(Err(StreamError::EndOfStream));
                }
            }
        }
    }

    /// Write `data` as one or more data frames.
    ///
    /// Returns `data.len()` once every frame is written. The first failed frame
    /// aborts the call; frames written before it stay on the wire and are
    /// reported through [`StreamError::WriteFailure::flushed`].
    pub async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        if self.die.is_cancelled() {
            return Err(StreamError::BrokenPipe);
        }

        let mut flushed = 0;
        for frame in split_frames(self.id, data, self.max_frame_size) {
            let len = frame.payload.len();
            if let Err(source) = self.send_frame(frame).await {
                debug!(
                    "Write on stream {} failed after {} bytes: {}",
                    self.id, flushed, source
                );
                return Err(StreamError::WriteFailure { flushed, source });
            }
            flushed += len;
        }

        trace!("Wrote {} bytes on stream {}", data.len(), self.id);
        Ok(data.len())
    }

    /// Close the stream.
    ///
    /// The first call wakes blocked readers, detaches the stream from its host
    /// and queues a reset to the peer in the background without waiting for the
    /// shared writer; a failure to send the reset is ignored.
    /// Every later call returns [`StreamError::BrokenPipe`] and does nothing.
    /// Must be called inside a Tokio runtime.
    pub async fn close(&self) -> Result<(), StreamError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StreamError::BrokenPipe);
        }

        debug!("Closing stream: {}", self.id);
        self.die.cancel();
        self.host.forget(self.id);

        // The shared writer may be held by a stalled write; send the reset off
        // to the side so close never waits on it.
        let host = self.host.clone();
        let stream_id = self.id;
        tokio::spawn(async move {
            let result = match Frame::fin(stream_id).encode() {
                Ok(reset) => host.write_frame(reset).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                debug!("Failed to send reset for stream {}: {}", stream_id, e);
            }
        });

        Ok(())
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        let encoded = frame.encode()?;
        self.host.write_frame(encoded).await
    }

    fn lock_state(&self) -> MutexGuard<'_, ReadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("max_frame_size", &self.max_frame_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Stop queueing inbound frames for a stream nobody can read anymore
        if !*self.closed.get_mut() {
            self.host.forget(self.id);
        }
    }
}

/// Cut `data` into data frames of at most `max_frame_size` bytes, in order.
///
/// Every frame but the last carries exactly `max_frame_size` bytes; empty input
/// yields no frames.
pub fn split_frames(stream_id: StreamId, data: &[u8], max_frame_size: usize) -> Vec<Frame> {
    let max_frame_size = max_frame_size.max(1);
    let data = Bytes::copy_from_slice(data);

    (0..data.len())
        .step_by(max_frame_size)
        .map(|start| {
            let end = (start + max_frame_size).min(data.len());
            Frame::psh(stream_id, data.slice(start..end))
        })
        .collect()
}

fn copy_into(dst: &mut [u8], src: &mut Bytes) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    src.advance(n);
    n
}
