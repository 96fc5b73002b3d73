//! Multiplexed session over a single connection

use crate::config::Config;
use crate::error::SessionError;
use crate::stream::{Stream, StreamHost};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use smux_proto::{Command, Frame, FrameCodec, StreamId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{interval_at, Instant};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

type SharedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Multiplexed session
///
/// Owns the connection: a background task decodes inbound frames and queues
/// them per stream, another sends keepalives. Must be created inside a Tokio
/// runtime.
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: Config,
    writer: Mutex<SharedWriter>,
    streams: StdMutex<HashMap<StreamId, VecDeque<Frame>>>,
    notify: Arc<Notify>,
    next_stream_id: StdMutex<Option<StreamId>>,
    accept_rx: Mutex<mpsc::Receiver<Stream>>,
    die: CancellationToken,
    closed: AtomicBool,
    data_ready: AtomicBool,
}

impl Session {
    /// Create the client side of a session (opens odd stream ids)
    pub fn client<T>(conn: T, config: Config) -> Result<Self, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, true)
    }

    /// Create the server side of a session (opens even stream ids)
    pub fn server<T>(conn: T, config: Config) -> Result<Self, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, false)
    }

    fn new<T>(conn: T, config: Config, client: bool) -> Result<Self, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.verify()?;

        let (reader, writer) = tokio::io::split(conn);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let inner = Arc::new(SessionInner {
            config,
            writer: Mutex::new(Box::new(writer)),
            streams: StdMutex::new(HashMap::new()),
            notify: Arc::new(Notify::new()),
            next_stream_id: StdMutex::new(Some(if client { 1 } else { 2 })),
            accept_rx: Mutex::new(accept_rx),
            die: CancellationToken::new(),
            closed: AtomicBool::new(false),
            data_ready: AtomicBool::new(false),
        });

        debug!(
            "Starting {} session",
            if client { "client" } else { "server" }
        );

        tokio::spawn(inner.clone().recv_loop(reader, accept_tx));
        tokio::spawn(inner.clone().keepalive_loop());

        Ok(Self { inner })
    }

    /// Open a new stream
    pub async fn open_stream(&self) -> Result<Stream, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let stream_id = self.inner.allocate_stream_id()?;
        self.inner.register(stream_id);

        if let Err(e) = self.inner.send_frame(Frame::syn(stream_id)).await {
            self.inner.forget(stream_id);
            return Err(e);
        }

        debug!("Opened stream: {}", stream_id);
        Ok(self.inner.new_stream(stream_id))
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<Stream, SessionError> {
        let mut accept_rx = self.inner.accept_rx.lock().await;

        tokio::select! {
            stream = accept_rx.recv() => stream.ok_or(SessionError::Closed),
            _ = self.inner.die.cancelled() => Err(SessionError::Closed),
        }
    }

    /// Close the session and every stream on it
    pub async fn close(&self) -> Result<(), SessionError> {
        if !self.inner.shutdown() {
            return Err(SessionError::Closed);
        }

        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Error shutting down connection writer: {}", e);
        }

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.die.is_cancelled()
    }

    /// Number of streams currently routed by this session
    pub fn num_streams(&self) -> usize {
        self.inner.lock_streams().len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Stop the receive and keepalive loops; they hold the inner state alive
        self.inner.shutdown();
    }
}

impl SessionInner {
    fn lock_streams(&self) -> MutexGuard<'_, HashMap<StreamId, VecDeque<Frame>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_stream_id(&self) -> Result<StreamId, SessionError> {
        let mut next = self
            .next_stream_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let stream_id = next.ok_or(SessionError::StreamIdsExhausted)?;
        *next = stream_id.checked_add(2);
        Ok(stream_id)
    }

    /// Start routing frames for `stream_id`; false if it is already routed
    fn register(&self, stream_id: StreamId) -> bool {
        let mut streams = self.lock_streams();
        if streams.contains_key(&stream_id) {
            return false;
        }
        streams.insert(stream_id, VecDeque::new());
        true
    }

    fn new_stream(self: &Arc<Self>, stream_id: StreamId) -> Stream {
        Stream::new(
            stream_id,
            self.config.max_frame_size,
            self.notify.clone(),
            self.die.child_token(),
            self.clone(),
        )
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        let encoded = frame.encode()?;
        self.write_frame(encoded).await
    }

    /// Mark the session dead; true only for the call that did it
    fn shutdown(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        debug!("Closing session");
        self.die.cancel();
        self.notify.notify_waiters();
        true
    }

    /// Run the receive loop (routes incoming frames until the connection ends)
    async fn recv_loop<R>(self: Arc<Self>, reader: R, accept_tx: mpsc::Sender<Stream>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        debug!("Starting receive loop");
        let mut frames = FramedRead::new(reader, FrameCodec);

        loop {
            let next = tokio::select! {
                _ = self.die.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    self.data_ready.store(true, Ordering::Release);
                    self.process_frame(frame, &accept_tx).await;
                }
                Some(Err(e)) => {
                    error!("Error decoding frame: {}", e);
                    break;
                }
                None => {
                    debug!("Connection closed by peer");
                    break;
                }
            }
        }

        self.shutdown();
        debug!("Receive loop ended");
    }

    /// Process a received frame
    async fn process_frame(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<Stream>) {
        trace!(
            "Processing frame: stream_id={}, cmd={:?}, size={}",
            frame.stream_id,
            frame.cmd,
            frame.payload.len()
        );

        match frame.cmd {
            Command::Nop => {}
            Command::Syn => {
                let stream_id = frame.stream_id;
                if !self.register(stream_id) {
                    warn!("Peer reopened existing stream: {}", stream_id);
                    return;
                }

                let stream = self.new_stream(stream_id);
                debug!("Accepted stream: {}", stream_id);

                tokio::select! {
                    sent = accept_tx.send(stream) => {
                        if sent.is_err() {
                            self.forget(stream_id);
                        }
                    }
                    _ = self.die.cancelled() => {}
                }
            }
            Command::Psh | Command::Fin => {
                let stream_id = frame.stream_id;
                let routed = match self.lock_streams().get_mut(&stream_id) {
                    Some(queue) => {
                        queue.push_back(frame);
                        true
                    }
                    None => false,
                };

                if routed {
                    self.notify.notify_waiters();
                } else {
                    trace!("Dropping frame for unknown stream: {}", stream_id);
                }
            }
        }
    }

    /// Send keepalives and close the session if the peer goes quiet
    async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.config.keepalive_interval;
        let timeout = self.config.keepalive_timeout;
        let mut ping = interval_at(Instant::now() + interval, interval);
        let mut check = interval_at(Instant::now() + timeout, timeout);

        loop {
            tokio::select! {
                _ = self.die.cancelled() => break,
                _ = ping.tick() => {
                    if let Err(e) = self.send_frame(Frame::nop()).await {
                        debug!("Failed to send keepalive: {}", e);
                    }
                }
                _ = check.tick() => {
                    if !self.data_ready.swap(false, Ordering::AcqRel) {
                        warn!("No data received within {:?}, closing session", timeout);
                        self.shutdown();
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StreamHost for SessionInner {
    fn poll_inbound(&self, stream_id: StreamId) -> Option<Frame> {
        self.lock_streams().get_mut(&stream_id)?.pop_front()
    }

    async fn write_frame(&self, frame: Bytes) -> Result<(), SessionError> {
        if self.die.is_cancelled() {
            return Err(SessionError::Closed);
        }

        // A write stalled on a peer that stopped reading is abandoned once the
        // session dies; the connection is unusable by then anyway.
        let result = tokio::select! {
            _ = self.die.cancelled() => return Err(SessionError::Closed),
            result = async {
                let mut writer = self.writer.lock().await;
                match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                }
            } => result,
        };

        if let Err(e) = result {
            error!("Connection write failed: {}", e);
            self.shutdown();
            return Err(SessionError::Io(e));
        }

        Ok(())
    }

    fn forget(&self, stream_id: StreamId) {
        if self.lock_streams().remove(&stream_id).is_some() {
            trace!("Forgot stream: {}", stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn read_frame(conn: &mut tokio::io::DuplexStream, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some(frame) = Frame::decode(buf).unwrap() {
                return frame;
            }
            let n = conn.read_buf(buf).await.unwrap();
            assert!(n > 0, "connection closed");
        }
    }

    #[tokio::test]
    async fn test_client_allocates_odd_ids() {
        let (conn, _peer) = tokio::io::duplex(4096);
        let session = Session::client(conn, Config::default()).unwrap();

        let stream1 = session.open_stream().await.unwrap();
        let stream2 = session.open_stream().await.unwrap();

        assert_eq!(stream1.id(), 1);
        assert_eq!(stream2.id(), 3);
        assert_eq!(session.num_streams(), 2);
    }

    #[tokio::test]
    async fn test_server_allocates_even_ids() {
        let (conn, _peer) = tokio::io::duplex(4096);
        let session = Session::server(conn, Config::default()).unwrap();

        assert_eq!(session.open_stream().await.unwrap().id(), 2);
        assert_eq!(session.open_stream().await.unwrap().id(), 4);
    }

    #[tokio::test]
    async fn test_stream_id_exhaustion() {
        let (conn, _peer) = tokio::io::duplex(4096);
        let session = Session::client(conn, Config::default()).unwrap();
        *session.inner.next_stream_id.lock().unwrap() = Some(u32::MAX);

        assert_eq!(session.open_stream().await.unwrap().id(), u32::MAX);
        assert!(matches!(
            session.open_stream().await,
            Err(SessionError::StreamIdsExhausted)
        ));
    }

    #[tokio::test]
    async fn test_open_stream_sends_syn() {
        let (conn, mut peer) = tokio::io::duplex(4096);
        let session = Session::client(conn, Config::default()).unwrap();

        let stream = session.open_stream().await.unwrap();
        stream.write(b"hi").await.unwrap();
        stream.close().await.unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(read_frame(&mut peer, &mut buf).await, Frame::syn(1));
        assert_eq!(
            read_frame(&mut peer, &mut buf).await,
            Frame::psh(1, Bytes::from_static(b"hi"))
        );
        assert_eq!(read_frame(&mut peer, &mut buf).await, Frame::fin(1));
        assert_eq!(session.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_frames_for_unknown_stream_are_dropped() {
        let (conn, mut peer) = tokio::io::duplex(4096);
        let session = Session::server(conn, Config::default()).unwrap();

        let mut out = BytesMut::new();
        Frame::psh(99, Bytes::from_static(b"lost"))
            .encode_into(&mut out)
            .unwrap();
        Frame::syn(1).encode_into(&mut out).unwrap();
        Frame::psh(1, Bytes::from_static(b"kept"))
            .encode_into(&mut out)
            .unwrap();
        peer.write_all(&out).await.unwrap();

        let stream = session.accept_stream().await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"kept");
        assert_eq!(session.num_streams(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let (conn, mut peer) = tokio::io::duplex(4096);
        let session = Session::server(conn, Config::default()).unwrap();

        peer.write_all(&[7, 0, 0, 0, 1, 0, 0, 0]).await.unwrap();

        let result = session.accept_stream().await;
        assert!(matches!(result, Err(SessionError::Closed)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_drop_stops_background_tasks() {
        let (conn, mut peer) = tokio::io::duplex(4096);
        let config = Config {
            keepalive_interval: Duration::from_millis(10),
            keepalive_timeout: Duration::from_millis(1000),
            ..Default::default()
        };
        let session = Session::client(conn, config).unwrap();
        drop(session);

        // Both halves of the connection are released, so the peer sees EOF
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), peer.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(read <= Frame::HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_drop_breaks_open_streams() {
        let (conn, _peer) = tokio::io::duplex(4096);
        let session = Session::client(conn, Config::default()).unwrap();
        let stream = session.open_stream().await.unwrap();
        drop(session);

        let mut buf = [0u8; 8];
        let result = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(result, Err(crate::StreamError::BrokenPipe)));
    }

    #[tokio::test]
    async fn test_dropped_stream_is_forgotten() {
        let (conn, _peer) = tokio::io::duplex(4096);
        let session = Session::client(conn, Config::default()).unwrap();

        let stream = session.open_stream().await.unwrap();
        assert_eq!(session.num_streams(), 1);

        drop(stream);
        assert_eq!(session.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_stalled_writer() {
        // Tiny buffer and a peer that never reads
        let (conn, _peer) = tokio::io::duplex(64);
        let session = Session::client(conn, Config::default()).unwrap();
        let stream = Arc::new(session.open_stream().await.unwrap());

        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(&[0u8; 4096]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), session.close())
            .await
            .unwrap()
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(crate::StreamError::WriteFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let (conn, _peer) = tokio::io::duplex(4096);
        let config = Config {
            max_frame_size: 0,
            ..Default::default()
        };

        assert!(matches!(
            Session::client(conn, config),
            Err(SessionError::Config(_))
        ));
    }
}
