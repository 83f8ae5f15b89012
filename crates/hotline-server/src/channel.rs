//! Per-connection duplex pump.
//!
//! A connection is split into exactly one reader task and one writer task.
//! The reader forwards every inbound frame to a [`ChannelObserver`] and keeps
//! a liveness deadline that only a pong can push back. The writer drains the
//! bounded outbound buffer, applies a write deadline to every frame, and sends
//! a ping every `ping_period`. Whichever task fails first cancels the other;
//! both report the close to the observer, which must tolerate the duplicate.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hotline_core::ConnectionId;
use hotline_core::protocol;
use hotline_settings::{ChannelSettings, OverflowPolicy};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::errors::PumpError;
use crate::metrics::OUTBOUND_DROPS_TOTAL;

/// Receives everything a connection pump produces.
#[async_trait]
pub trait ChannelObserver: Send + Sync + 'static {
    /// A complete text frame arrived on `channel`.
    async fn on_frame(&self, channel: &Arc<ChannelHandle>, payload: String);

    /// `channel` is going away. Called once by each pump task, so at most
    /// twice per connection.
    async fn on_channel_close(&self, channel: &Arc<ChannelHandle>);
}

/// The dispatcher-facing half of a connection: identity plus outbound buffer.
///
/// Cloning the `Arc` is cheap and does not keep the socket open; the socket
/// belongs to the pump tasks.
pub struct ChannelHandle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    overflow: OverflowPolicy,
    cancel: CancellationToken,
    dropped_frames: AtomicU64,
}

impl ChannelHandle {
    /// Create a handle and the receiving end of its outbound buffer.
    pub fn new(
        id: ConnectionId,
        settings: &ChannelSettings,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(settings.outbound_capacity);
        let handle = Arc::new(Self {
            id,
            tx,
            overflow: settings.overflow,
            cancel,
            dropped_frames: AtomicU64::new(0),
        });
        (handle, rx)
    }

    /// Connection identity.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Append a frame to the outbound buffer without waiting.
    ///
    /// Returns `false` if the frame was not queued. A full buffer is handled
    /// according to the configured [`OverflowPolicy`].
    pub fn enqueue(&self, frame: String) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(OUTBOUND_DROPS_TOTAL).increment(1);
                match self.overflow {
                    OverflowPolicy::DropNewest => {
                        warn!(
                            connection_id = %self.id,
                            frame_len = frame.len(),
                            "outbound buffer full, dropping frame"
                        );
                    }
                    OverflowPolicy::Disconnect => {
                        warn!(
                            connection_id = %self.id,
                            "outbound buffer full, closing connection"
                        );
                        self.close();
                    }
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Serialize and enqueue a reply frame.
    pub fn enqueue_json<T: Serialize>(&self, frame: &T) -> bool {
        match protocol::encode(frame) {
            Ok(json) => self.enqueue(json),
            Err(e) => {
                tracing::error!(connection_id = %self.id, error = %e, "failed to encode frame");
                false
            }
        }
    }

    /// Ask the pump to shut the connection down. The writer sends a close
    /// frame and both tasks exit.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether [`close`](Self::close) was called or the pump has stopped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Frames refused because the outbound buffer was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A standalone handle for dispatcher tests. The receiver stands in for the
/// writer task.
#[cfg(test)]
pub(crate) fn test_channel() -> (Arc<ChannelHandle>, mpsc::Receiver<String>) {
    ChannelHandle::new(
        ConnectionId::new(),
        &ChannelSettings::default(),
        CancellationToken::new(),
    )
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelHandle {}

/// Pump timings, copied out of [`ChannelSettings`].
#[derive(Clone, Copy, Debug)]
struct Timings {
    write_wait: Duration,
    pong_wait: Duration,
    ping_period: Duration,
}

/// Run both pump tasks for one connection until they have exited.
///
/// `writer` and `reader` are the two halves of the split transport.
pub async fn run_channel<W, R, E>(
    writer: W,
    reader: R,
    channel: Arc<ChannelHandle>,
    outbound: mpsc::Receiver<String>,
    observer: Arc<dyn ChannelObserver>,
    settings: &ChannelSettings,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let timings = Timings {
        write_wait: settings.write_wait(),
        pong_wait: settings.pong_wait(),
        ping_period: settings.ping_period(),
    };

    let write_task = tokio::spawn(write_pump(
        writer,
        outbound,
        Arc::clone(&channel),
        Arc::clone(&observer),
        timings,
    ));
    let read_task = tokio::spawn(read_pump(reader, channel, observer, timings));

    let (write_res, read_res) = tokio::join!(write_task, read_task);
    if let Err(e) = write_res {
        warn!(error = %e, "writer task panicked");
    }
    if let Err(e) = read_res {
        warn!(error = %e, "reader task panicked");
    }
}

async fn read_pump<R, E>(
    mut reader: R,
    channel: Arc<ChannelHandle>,
    observer: Arc<dyn ChannelObserver>,
    timings: Timings,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let cancel = channel.cancel.clone();
    let mut deadline = Instant::now() + timings.pong_wait;

    let result: Result<(), PumpError> = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            next = time::timeout_at(deadline, reader.next()) => next,
        };

        match next {
            Err(_) => break Err(PumpError::LivenessExpired(timings.pong_wait)),
            Ok(None) => break Ok(()),
            Ok(Some(Err(e))) => break Err(PumpError::Read(e.to_string())),
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => {
                    observer.on_frame(&channel, text.as_str().to_owned()).await;
                }
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => observer.on_frame(&channel, text).await,
                    Err(_) => debug!(connection_id = %channel.id, "dropping non-UTF-8 binary frame"),
                },
                Message::Pong(_) => {
                    deadline = Instant::now() + timings.pong_wait;
                    trace!(connection_id = %channel.id, "pong");
                }
                Message::Ping(_) => {}
                Message::Close(_) => break Ok(()),
            },
        }
    };

    match result {
        Ok(()) => debug!(connection_id = %channel.id, "reader stopped"),
        Err(e) => warn!(connection_id = %channel.id, error = %e, "reader failed"),
    }
    channel.close();
    observer.on_channel_close(&channel).await;
}

async fn write_pump<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
    channel: Arc<ChannelHandle>,
    observer: Arc<dyn ChannelObserver>,
    timings: Timings,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let cancel = channel.cancel.clone();
    let mut ping = time::interval_at(Instant::now() + timings.ping_period, timings.ping_period);

    let result: Result<(), PumpError> = loop {
        tokio::select! {
            // The handle owns the sender, so the buffer only ends through `cancel`.
            Some(text) = outbound.recv() => {
                if let Err(e) = send_frame(&mut writer, Message::Text(text.into()), timings.write_wait).await {
                    break Err(e);
                }
            }
            _ = ping.tick() => {
                if let Err(e) = send_frame(&mut writer, Message::Ping(Vec::new().into()), timings.write_wait).await {
                    break Err(e);
                }
                trace!(connection_id = %channel.id, "ping");
            }
            () = cancel.cancelled() => {
                let _ = send_frame(&mut writer, Message::Close(None), timings.write_wait).await;
                break Ok(());
            }
        }
    };

    match result {
        Ok(()) => debug!(connection_id = %channel.id, "writer stopped"),
        Err(e) => warn!(connection_id = %channel.id, error = %e, "writer failed"),
    }
    channel.close();
    observer.on_channel_close(&channel).await;
}

async fn send_frame<W>(writer: &mut W, message: Message, deadline: Duration) -> Result<(), PumpError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match time::timeout(deadline, writer.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PumpError::Write(e.to_string())),
        Err(_) => Err(PumpError::WriteTimeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    #[derive(Debug, PartialEq, Eq)]
    enum Observed {
        Frame(String),
        Closed(ConnectionId),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Observed>,
    }

    #[async_trait]
    impl ChannelObserver for Recorder {
        async fn on_frame(&self, _channel: &Arc<ChannelHandle>, payload: String) {
            let _ = self.tx.send(Observed::Frame(payload));
        }

        async fn on_channel_close(&self, channel: &Arc<ChannelHandle>) {
            let _ = self.tx.send(Observed::Closed(channel.id().clone()));
        }
    }

    struct Harness {
        channel: Arc<ChannelHandle>,
        /// Frames the pump wrote to the "socket".
        written: fmpsc::UnboundedReceiver<Message>,
        /// Push frames as if they came from the peer.
        peer: fmpsc::UnboundedSender<Result<Message, axum::Error>>,
        observed: mpsc::UnboundedReceiver<Observed>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_pump(settings: ChannelSettings) -> Harness {
        let (sink_tx, written) = fmpsc::unbounded::<Message>();
        let (peer, stream_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let (obs_tx, observed) = mpsc::unbounded_channel();
        let (channel, outbound) =
            ChannelHandle::new(ConnectionId::new(), &settings, CancellationToken::new());
        let observer: Arc<dyn ChannelObserver> = Arc::new(Recorder { tx: obs_tx });
        let pump_channel = Arc::clone(&channel);
        let task = tokio::spawn(async move {
            run_channel(sink_tx, stream_rx, pump_channel, outbound, observer, &settings).await;
        });
        Harness {
            channel,
            written,
            peer,
            observed,
            task,
        }
    }

    fn small_settings(capacity: usize, overflow: OverflowPolicy) -> ChannelSettings {
        ChannelSettings {
            outbound_capacity: capacity,
            overflow,
            ..ChannelSettings::default()
        }
    }

    // ── ChannelHandle ───────────────────────────────────────────────

    #[tokio::test]
    async fn enqueue_delivers_in_order() {
        let (channel, mut rx) = ChannelHandle::new(
            ConnectionId::new(),
            &ChannelSettings::default(),
            CancellationToken::new(),
        );
        for i in 0..5 {
            assert!(channel.enqueue(format!("msg_{i}")));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), format!("msg_{i}"));
        }
    }

    #[test]
    fn overflow_drop_newest_keeps_connection() {
        let (channel, _rx) = ChannelHandle::new(
            ConnectionId::new(),
            &small_settings(1, OverflowPolicy::DropNewest),
            CancellationToken::new(),
        );
        assert!(channel.enqueue("first".into()));
        assert!(!channel.enqueue("second".into()));
        assert_eq!(channel.drop_count(), 1);
        assert!(!channel.is_closed());
    }

    #[test]
    fn overflow_disconnect_closes_connection() {
        let (channel, _rx) = ChannelHandle::new(
            ConnectionId::new(),
            &small_settings(1, OverflowPolicy::Disconnect),
            CancellationToken::new(),
        );
        assert!(channel.enqueue("first".into()));
        assert!(!channel.enqueue("second".into()));
        assert_eq!(channel.drop_count(), 1);
        assert!(channel.is_closed());
    }

    #[test]
    fn enqueue_after_receiver_dropped_fails_without_counting() {
        let (channel, rx) = ChannelHandle::new(
            ConnectionId::new(),
            &ChannelSettings::default(),
            CancellationToken::new(),
        );
        drop(rx);
        assert!(!channel.enqueue("late".into()));
        assert_eq!(channel.drop_count(), 0);
    }

    #[tokio::test]
    async fn enqueue_json_serializes() {
        let (channel, mut rx) = ChannelHandle::new(
            ConnectionId::new(),
            &ChannelSettings::default(),
            CancellationToken::new(),
        );
        assert!(channel.enqueue_json(&serde_json::json!({"cmd": "CMD_HANGUP"})));
        assert_eq!(rx.recv().await.unwrap(), r#"{"cmd":"CMD_HANGUP"}"#);
    }

    #[test]
    fn handles_compare_by_identity() {
        let id = ConnectionId::from_raw("conn_same");
        let settings = ChannelSettings::default();
        let (a, _ra) = ChannelHandle::new(id.clone(), &settings, CancellationToken::new());
        let (b, _rb) = ChannelHandle::new(id, &settings, CancellationToken::new());
        let (c, _rc) = ChannelHandle::new(ConnectionId::new(), &settings, CancellationToken::new());
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    // ── Pump ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn inbound_frames_reach_observer_in_order() {
        let mut h = spawn_pump(ChannelSettings::default());
        for i in 0..3 {
            h.peer.unbounded_send(Ok(Message::Text(format!("f{i}").into()))).unwrap();
        }
        for i in 0..3 {
            assert_eq!(h.observed.recv().await.unwrap(), Observed::Frame(format!("f{i}")));
        }
        h.channel.close();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn binary_utf8_frames_are_forwarded() {
        let mut h = spawn_pump(ChannelSettings::default());
        h.peer
            .unbounded_send(Ok(Message::Binary(b"{\"cmd\":\"CMD_HANGUP\"}".to_vec().into())))
            .unwrap();
        assert_eq!(
            h.observed.recv().await.unwrap(),
            Observed::Frame(r#"{"cmd":"CMD_HANGUP"}"#.into())
        );
        h.channel.close();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn outbound_frames_are_written_as_text() {
        let mut h = spawn_pump(ChannelSettings::default());
        assert!(h.channel.enqueue("hello".into()));
        match h.written.next().await.unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "hello"),
            other => panic!("unexpected frame: {other:?}"),
        }
        h.channel.close();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn close_sends_close_frame_and_notifies_twice() {
        let mut h = spawn_pump(ChannelSettings::default());
        h.channel.close();
        h.task.await.unwrap();

        let written: Vec<Message> = h.written.collect().await;
        assert!(written.iter().any(|m| matches!(m, Message::Close(_))));

        let id = h.channel.id().clone();
        assert_eq!(h.observed.recv().await.unwrap(), Observed::Closed(id.clone()));
        assert_eq!(h.observed.recv().await.unwrap(), Observed::Closed(id));
    }

    #[tokio::test]
    async fn peer_close_ends_both_tasks() {
        let mut h = spawn_pump(ChannelSettings::default());
        h.peer.unbounded_send(Ok(Message::Close(None))).unwrap();
        h.task.await.unwrap();
        assert!(h.channel.is_closed());
        assert!(matches!(h.observed.recv().await.unwrap(), Observed::Closed(_)));
    }

    #[tokio::test]
    async fn peer_stream_end_ends_connection() {
        let mut h = spawn_pump(ChannelSettings::default());
        drop(h.peer);
        h.task.await.unwrap();
        assert!(h.channel.is_closed());
        assert!(matches!(h.observed.recv().await.unwrap(), Observed::Closed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_pinged_then_dropped() {
        let mut h = spawn_pump(ChannelSettings::default());
        let started = Instant::now();

        let first = h.written.next().await.unwrap();
        assert!(matches!(first, Message::Ping(_)), "got {first:?}");
        assert_eq!(started.elapsed(), Duration::from_secs(54));

        // No pong: the 60s liveness deadline closes the connection.
        h.task.await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert!(h.channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_liveness() {
        let mut h = spawn_pump(ChannelSettings::default());
        let started = Instant::now();

        let first = h.written.next().await.unwrap();
        assert!(matches!(first, Message::Ping(_)));
        h.peer.unbounded_send(Ok(Message::Pong(Vec::new().into()))).unwrap();

        // Deadline moved to 54s + 60s, so the second ping at 108s goes out.
        let second = h.written.next().await.unwrap();
        assert!(matches!(second, Message::Ping(_)), "got {second:?}");
        assert_eq!(started.elapsed(), Duration::from_secs(108));
        assert!(!h.channel.is_closed());

        h.task.await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(114));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writer_hits_write_deadline() {
        // A sink that never becomes ready.
        struct Stalled;
        impl Sink<Message> for Stalled {
            type Error = std::io::Error;
            fn poll_ready(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), Self::Error>> {
                std::task::Poll::Pending
            }
            fn start_send(self: std::pin::Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
                Ok(())
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), Self::Error>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_close(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), Self::Error>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let settings = ChannelSettings::default();
        let (_peer, stream_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let (obs_tx, mut observed) = mpsc::unbounded_channel();
        let (channel, outbound) =
            ChannelHandle::new(ConnectionId::new(), &settings, CancellationToken::new());
        let observer: Arc<dyn ChannelObserver> = Arc::new(Recorder { tx: obs_tx });
        assert!(channel.enqueue("stuck".into()));

        let started = Instant::now();
        run_channel(Stalled, stream_rx, Arc::clone(&channel), outbound, observer, &settings).await;

        // Writer gives up on the stuck frame and takes the reader down with it.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(channel.is_closed());
        assert!(matches!(observed.recv().await.unwrap(), Observed::Closed(_)));
    }
}
