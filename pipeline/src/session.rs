use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use frame_feed_common::frame::Frame;
use futures_util::Stream;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broadcaster::{CloseReason, FeedClosed, FeedInner, FeedState};
use crate::multipart;

/// Lifecycle of one viewer connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Streaming,
    Closed,
}

/// Why a session stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Feed(CloseReason),
    /// No new frame arrived within the stall timeout.
    Stalled,
    /// Writing to the viewer failed.
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
#[error("client write failed: {0}")]
pub struct ClientWriteError(#[from] pub std::io::Error);

/// Registration of one viewer with the feed. Dropping it deregisters.
pub struct Subscriber {
    id: u64,
    last_seen: u64,
    feed: Arc<FeedInner>,
}

impl Subscriber {
    fn register(feed: Arc<FeedInner>) -> Self {
        let id = feed.next_subscriber_id.fetch_add(1, Ordering::Relaxed) + 1;
        let subscribers = feed.subscribers.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(id, subscribers, "subscriber registered");
        Self {
            id,
            last_seen: 0,
            feed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sequence number of the last frame delivered, 0 before the first.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let subscribers = self.feed.subscribers.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(
            id = self.id,
            last_seen = self.last_seen,
            subscribers,
            "subscriber deregistered"
        );
    }
}

/// One viewer's view of the feed.
///
/// A session only ever moves forward: each frame it yields has a higher
/// sequence number than the one before. If the viewer is slower than the
/// camera it skips the frames it missed; it never queues them.
pub struct ClientSession {
    subscriber: Subscriber,
    rx: watch::Receiver<FeedState>,
    state: SessionState,
    end: Option<SessionEnd>,
    wake_interval: Duration,
    stall_timeout: Option<Duration>,
}

impl ClientSession {
    pub(crate) fn open(feed: Arc<FeedInner>) -> Result<Self, FeedClosed> {
        if feed.stop_requested() {
            return Err(FeedClosed(CloseReason::Shutdown));
        }
        let rx = feed.slot.subscribe();
        if let FeedState::Closed(reason) = *rx.borrow() {
            return Err(FeedClosed(reason));
        }

        let wake_interval = feed.settings.wake_interval;
        let stall_timeout = feed.settings.stall_timeout;
        Ok(Self {
            subscriber: Subscriber::register(feed),
            rx,
            state: SessionState::Connected,
            end: None,
            wake_interval,
            stall_timeout,
        })
    }

    pub fn id(&self) -> u64 {
        self.subscriber.id()
    }

    pub fn last_seen(&self) -> u64 {
        self.subscriber.last_seen()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn end_reason(&self) -> Option<SessionEnd> {
        self.end
    }

    /// Wait for a frame newer than the last one delivered.
    ///
    /// Returns `None` once the session is closed: the feed shut down, the
    /// camera failed, or nothing new arrived within the stall timeout.
    pub async fn next_frame(&mut self) -> Option<Arc<Frame>> {
        if self.state == SessionState::Closed {
            return None;
        }
        self.state = SessionState::Streaming;
        let waiting_since = Instant::now();

        loop {
            // Only an Arc is cloned under the slot's lock.
            let current = self.rx.borrow_and_update().clone();
            match current {
                FeedState::Live(frame) if frame.seq > self.subscriber.last_seen => {
                    self.subscriber.last_seen = frame.seq;
                    return Some(frame);
                }
                FeedState::Closed(reason) => {
                    self.close(SessionEnd::Feed(reason));
                    return None;
                }
                _ => {}
            }

            if self.subscriber.feed.stop_requested() {
                self.close(SessionEnd::Feed(CloseReason::Shutdown));
                return None;
            }
            if let Some(limit) = self.stall_timeout {
                if waiting_since.elapsed() >= limit {
                    warn!(
                        id = self.subscriber.id,
                        last_seen = self.subscriber.last_seen,
                        "no new frame within stall timeout, closing session"
                    );
                    self.close(SessionEnd::Stalled);
                    return None;
                }
            }

            // Bounded wait so shutdown and stalls are noticed even if the
            // producer never publishes again.
            match tokio::time::timeout(self.wake_interval, self.rx.changed()).await {
                Ok(Ok(())) | Err(_) => continue,
                Ok(Err(_)) => {
                    self.close(SessionEnd::Feed(CloseReason::Shutdown));
                    return None;
                }
            }
        }
    }

    /// The next frame as one multipart chunk.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        let frame = self.next_frame().await?;
        Some(multipart::encode_part(
            &self.subscriber.feed.settings.boundary,
            &frame.jpeg,
        ))
    }

    /// Stream parts into `writer` until the session closes.
    ///
    /// No lock is held while writing, so a slow writer only delays itself.
    pub async fn stream_to<W>(mut self, writer: &mut W) -> Result<SessionEnd, ClientWriteError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(part) = self.next_part().await {
            let written = async {
                writer.write_all(&part).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!(id = self.id(), error = %e, "viewer went away");
                self.close(SessionEnd::Disconnected);
                return Err(ClientWriteError(e));
            }
        }
        Ok(self.end.unwrap_or(SessionEnd::Feed(CloseReason::Shutdown)))
    }

    /// The session as a body stream for the HTTP layer.
    ///
    /// When the peer disconnects the server drops the stream, which drops
    /// the session and deregisters its subscriber.
    pub fn into_body_stream(
        self,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures_util::stream::unfold(self, |mut session| async move {
            let part = session.next_part().await?;
            Some((Ok::<_, Infallible>(part), session))
        })
    }

    fn close(&mut self, end: SessionEnd) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.end = Some(end);
            debug!(
                id = self.subscriber.id,
                last_seen = self.subscriber.last_seen,
                ?end,
                "session closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::{BroadcastSettings, Feed, FrameBroadcaster};
    use crate::camera::{CameraSettings, CameraSource, RawFrame, SyntheticBackend};
    use crate::encoder::{EncodeError, FrameEncoder};
    use crate::multipart::MultipartReader;

    struct RawEncoder;

    impl FrameEncoder for RawEncoder {
        fn encode(&mut self, raw: &RawFrame) -> Result<Bytes, EncodeError> {
            Ok(Bytes::copy_from_slice(&raw.rgb[..16]))
        }
    }

    fn spawn_feed(fps: u32, index: u32, stall_timeout: Option<Duration>) -> Feed {
        let camera = CameraSource::new(
            CameraSettings {
                index,
                width: 16,
                height: 8,
                fps,
                buffer_depth: 1,
            },
            SyntheticBackend::new(1),
        );
        FrameBroadcaster::spawn(
            Arc::new(camera),
            RawEncoder,
            BroadcastSettings {
                max_consecutive_capture_errors: 10,
                wake_interval: Duration::from_millis(25),
                stall_timeout,
                boundary: "frame".into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn states_progress_to_closed() {
        let feed = spawn_feed(100, 0, None);
        let mut session = feed.subscribe().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.last_seen(), 0);

        let frame = session.next_frame().await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.last_seen(), frame.seq);

        feed.stop();
        while session.next_frame().await.is_some() {}
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.end_reason(),
            Some(SessionEnd::Feed(CloseReason::Shutdown))
        );
        // Closed is terminal.
        assert!(session.next_frame().await.is_none());
        feed.join();
    }

    #[tokio::test]
    async fn sequence_strictly_increases() {
        let feed = spawn_feed(200, 0, None);
        let mut session = feed.subscribe().unwrap();
        let mut last = 0;
        for _ in 0..30 {
            let frame = session.next_frame().await.unwrap();
            assert!(frame.seq > last, "{} after {}", frame.seq, last);
            last = frame.seq;
        }
        feed.shutdown();
    }

    #[tokio::test]
    async fn late_joiner_starts_at_current_frame() {
        let feed = spawn_feed(100, 0, None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let joined_at = feed.state().sequence();
        assert!(joined_at > 0);

        let mut session = feed.subscribe().unwrap();
        let first = session.next_frame().await.unwrap();
        assert!(first.seq >= joined_at);
        feed.shutdown();
    }

    #[tokio::test]
    async fn subscriber_deregistered_on_drop() {
        let feed = spawn_feed(100, 0, None);
        let a = feed.subscribe().unwrap();
        let b = feed.subscribe().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(feed.subscriber_count(), 2);
        drop(a);
        assert_eq!(feed.subscriber_count(), 1);
        drop(b);
        assert_eq!(feed.subscriber_count(), 0);
        feed.shutdown();
    }

    #[tokio::test]
    async fn invalid_device_terminates_sessions_cleanly() {
        let feed = spawn_feed(30, 5, None);
        // The session may attach before or after the broadcaster gives up.
        match feed.subscribe() {
            Ok(mut session) => {
                let ended =
                    tokio::time::timeout(Duration::from_secs(2), session.next_frame()).await;
                assert!(matches!(ended, Ok(None)));
                assert_eq!(
                    session.end_reason(),
                    Some(SessionEnd::Feed(CloseReason::CameraUnavailable))
                );
            }
            Err(FeedClosed(reason)) => assert_eq!(reason, CloseReason::CameraUnavailable),
        }
        // Once closed, new viewers are turned away.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(feed.subscribe().is_err());
        feed.join();
    }

    #[tokio::test]
    async fn stop_wakes_blocked_sessions_quickly() {
        // One frame per second keeps sessions parked in the wait.
        let feed = spawn_feed(1, 0, None);
        let mut sessions: Vec<_> = (0..4).map(|_| feed.subscribe().unwrap()).collect();
        for s in &mut sessions {
            s.next_frame().await.unwrap();
        }

        let waiters: Vec<_> = sessions
            .into_iter()
            .map(|mut s| tokio::spawn(async move { s.next_frame().await.is_none() }))
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped_at = std::time::Instant::now();
        feed.stop();
        for w in waiters {
            assert!(w.await.unwrap());
        }
        assert!(stopped_at.elapsed() < Duration::from_millis(500));
        assert_eq!(feed.subscriber_count(), 0);
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }

    #[tokio::test]
    async fn stalled_feed_closes_session() {
        let feed = spawn_feed(1, 0, Some(Duration::from_millis(150)));
        let mut session = feed.subscribe().unwrap();
        session.next_frame().await.unwrap();
        assert!(session.next_frame().await.is_none());
        assert_eq!(session.end_reason(), Some(SessionEnd::Stalled));
        feed.stop();
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }

    #[tokio::test]
    async fn stream_to_writes_multipart() {
        let feed = spawn_feed(100, 0, None);
        let session = feed.subscribe().unwrap();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let writer = tokio::spawn(async move { session.stream_to(&mut server).await });

        let mut reader = MultipartReader::new("frame");
        let mut parts = Vec::new();
        let mut buf = vec![0u8; 4096];
        while parts.len() < 5 {
            let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
            parts.extend(reader.push(&buf[..n]));
        }
        assert!(parts.iter().all(|p| p.len() == 16));

        // Hanging up ends the session with a write error.
        drop(client);
        let result = writer.await.unwrap();
        assert!(matches!(result, Err(ClientWriteError(_))));
        assert_eq!(feed.subscriber_count(), 0);
        feed.shutdown();
    }

    #[tokio::test]
    async fn body_stream_ends_when_feed_stops() {
        use futures_util::StreamExt;

        let feed = spawn_feed(100, 0, None);
        let mut body = Box::pin(feed.subscribe().unwrap().into_body_stream());
        let first = body.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(first.ends_with(b"\r\n"));

        feed.stop();
        while body.next().await.is_some() {}
        drop(body);
        assert_eq!(feed.subscriber_count(), 0);
        tokio::task::spawn_blocking(move || feed.join()).await.unwrap();
    }
}
