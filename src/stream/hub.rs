//! Producer side of streaming
//!
//! [`StreamHub`] is the single entry point for the capture collaborator.
//! Each publish replaces the latest-frame slot and then offers the frame
//! to every registered session of the matching kind. Offers never block:
//! the producer runs at its own pace whatever the clients do.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::frame_bus::FrameBus;
use super::registry::{SessionKind, StreamRegistry};
use super::session::OfferOutcome;
use crate::config::{ConfigStore, QualityTier};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::media::{Frame, FrameEncoder, RawFrame, Resolution, StreamKind};
use crate::utils::LogThrottler;

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Sessions that queued the frame
    pub queued: usize,
    /// Sessions whose queue was full
    pub dropped: usize,
    /// Sessions already closing
    pub closed: usize,
}

/// Frame publisher and fan-out
pub struct StreamHub {
    bus: FrameBus,
    registry: Arc<StreamRegistry>,
    config: ConfigStore,
    events: Arc<EventBus>,
    online: AtomicBool,
    video_sequence: AtomicU64,
    audio_sequence: AtomicU64,
    frames_dropped: AtomicU64,
    throttler: LogThrottler,
}

impl StreamHub {
    /// Create an online hub
    pub fn new(registry: Arc<StreamRegistry>, config: ConfigStore, events: Arc<EventBus>) -> Self {
        Self {
            bus: FrameBus::new(),
            registry,
            config,
            events,
            online: AtomicBool::new(true),
            video_sequence: AtomicU64::new(0),
            audio_sequence: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn bus(&self) -> &FrameBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    fn next_sequence(&self, kind: StreamKind) -> u64 {
        let counter = match kind {
            StreamKind::Video => &self.video_sequence,
            StreamKind::Audio => &self.audio_sequence,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish a frame and fan it out
    ///
    /// While the hub is stopped the frame is discarded. A video frame that
    /// is not a complete JPEG is rejected and the current slot keeps
    /// serving the previous frame. Accepted frames get the next sequence
    /// number of their kind; a caller-supplied sequence is overwritten.
    pub fn publish(&self, mut frame: Frame) -> Result<FanOut> {
        if !self.is_streaming() {
            trace!(kind = %frame.kind, seq = frame.sequence, "Hub offline, frame discarded");
            return Ok(FanOut::default());
        }

        if frame.is_empty() {
            return Err(AppError::InvalidFrame(format!("empty {} frame", frame.kind)));
        }
        if frame.kind == StreamKind::Video && !frame.is_valid_jpeg() {
            if let Some(suppressed) = self.throttler.should_log("invalid_jpeg") {
                warn!(
                    seq = frame.sequence,
                    len = frame.len(),
                    suppressed,
                    "Rejected video frame without JPEG markers"
                );
            }
            return Err(AppError::InvalidFrame("missing JPEG SOI/EOI markers".into()));
        }

        frame.sequence = self.next_sequence(frame.kind);
        self.bus.update(frame.clone())?;

        let mut out = FanOut::default();
        for kind in SessionKind::subscribers_of(frame.kind) {
            self.registry.for_each(*kind, |session| match session.offer(frame.clone()) {
                OfferOutcome::Queued => out.queued += 1,
                OfferOutcome::Dropped => out.dropped += 1,
                OfferOutcome::Closed => out.closed += 1,
            });
        }

        if out.dropped > 0 {
            self.frames_dropped
                .fetch_add(out.dropped as u64, Ordering::Relaxed);
            if let Some(suppressed) = self.throttler.should_log("slow_clients") {
                debug!(
                    kind = %frame.kind,
                    dropped = out.dropped,
                    suppressed,
                    "Dropped frame for slow clients"
                );
            }
        }
        Ok(out)
    }

    /// Publish an already encoded JPEG
    pub fn publish_jpeg(
        &self,
        data: impl Into<Bytes>,
        resolution: Option<Resolution>,
    ) -> Result<FanOut> {
        self.publish(Frame::video(data.into(), resolution, 0))
    }

    /// Encode a raw frame at the current quality tier and publish it
    ///
    /// The caller owns the encoder, so no hub state is locked while
    /// encoding.
    pub fn publish_raw(&self, encoder: &mut dyn FrameEncoder, raw: &RawFrame) -> Result<FanOut> {
        if !self.is_streaming() {
            return Ok(FanOut::default());
        }

        let quality = self.quality().jpeg_quality();
        let data = match encoder.encode(raw, quality) {
            Ok(data) => data,
            Err(e) => {
                if let Some(suppressed) = self.throttler.should_log("encode_failed") {
                    warn!(suppressed, "Frame encode failed: {}", e);
                }
                return Err(e);
            }
        };
        self.publish_jpeg(data, Some(raw.resolution()))
    }

    /// Publish one PCM chunk
    pub fn publish_audio(&self, data: impl Into<Bytes>) -> Result<FanOut> {
        self.publish(Frame::audio(data.into(), 0))
    }

    /// Accept frames again; returns `false` if already streaming
    pub fn start(&self) -> bool {
        if self.online.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("Streaming started");
        self.events
            .publish(SystemEvent::StreamStateChanged { streaming: true });
        true
    }

    /// Stop accepting frames and evict every live session
    ///
    /// The last frames stay in the bus. Returns the number of evicted
    /// sessions.
    pub fn stop(&self) -> usize {
        if !self.online.swap(false, Ordering::AcqRel) {
            return 0;
        }
        let evicted = self.registry.evict_all();
        info!(evicted, "Streaming stopped");
        self.events
            .publish(SystemEvent::StreamStateChanged { streaming: false });
        evicted
    }

    pub fn is_streaming(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Current encode quality tier
    pub fn quality(&self) -> QualityTier {
        self.config.get().stream.quality
    }

    /// Change the encode quality tier
    ///
    /// The nominal resolution follows the tier until a frame reports its own.
    pub fn set_quality(&self, quality: QualityTier) -> Result<()> {
        if self.quality() == quality {
            return Ok(());
        }
        self.config.update("stream.quality", |cfg| {
            cfg.stream.quality = quality;
            cfg.stream.resolution = quality.resolution();
        })?;
        info!(%quality, "Stream quality changed");
        self.events.publish(SystemEvent::QualityChanged { quality });
        Ok(())
    }

    /// Resolution of the latest video frame, or the configured one
    pub fn resolution(&self) -> Resolution {
        self.bus
            .current_frame()
            .and_then(|f| f.resolution)
            .unwrap_or(self.config.get().stream.resolution)
    }

    /// Frames dropped for slow clients since start
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::media::{JpegEncoder, RawFormat};
    use crate::stream::delivery::DeliveryLoop;
    use crate::stream::multipart::MultipartEncoder;
    use crate::stream::session::{ClientGuard, ClientId, ClientSession, SessionState};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        hub: StreamHub,
        registry: Arc<StreamRegistry>,
        events: Arc<EventBus>,
        token: CancellationToken,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(StreamRegistry::new());
        let events = Arc::new(EventBus::new());
        let hub = StreamHub::new(
            registry.clone(),
            ConfigStore::new(AppConfig::default()),
            events.clone(),
        );
        Fixture {
            hub,
            registry,
            events,
            token: CancellationToken::new(),
        }
    }

    impl Fixture {
        fn attach(
            &self,
            conn_id: u64,
            kind: SessionKind,
            depth: usize,
        ) -> (Arc<ClientSession>, mpsc::Receiver<Frame>) {
            let id = ClientId {
                conn_id,
                remote: "10.1.1.1:5555".parse().unwrap(),
            };
            let (session, rx) = ClientSession::new(id, kind, depth, &self.token);
            session.set_state(SessionState::Streaming);
            self.registry.add(kind, session.clone()).unwrap();
            (session, rx)
        }
    }

    fn jpeg(len: usize) -> Vec<u8> {
        let mut data = vec![0x11; len];
        data[0] = 0xFF;
        data[1] = 0xD8;
        data[len - 2] = 0xFF;
        data[len - 1] = 0xD9;
        data
    }

    #[test]
    fn test_video_fans_out_to_video_and_combined() {
        let f = fixture();
        let (_v, mut video_rx) = f.attach(1, SessionKind::Video, 4);
        let (_c, mut combined_rx) = f.attach(2, SessionKind::Combined, 4);
        let (_a, mut audio_rx) = f.attach(3, SessionKind::Audio, 4);

        let out = f.hub.publish_jpeg(jpeg(32), None).unwrap();
        assert_eq!(out.queued, 2);

        assert_eq!(video_rx.try_recv().unwrap().sequence, 1);
        assert_eq!(combined_rx.try_recv().unwrap().sequence, 1);
        assert!(audio_rx.try_recv().is_err());

        let out = f.hub.publish_audio(vec![0u8; 64]).unwrap();
        assert_eq!(out.queued, 1);
        assert_eq!(audio_rx.try_recv().unwrap().kind, StreamKind::Audio);
        assert!(video_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_restamps_caller_sequence() {
        let f = fixture();
        let id = ClientId {
            conn_id: 9,
            remote: "10.1.1.9:5555".parse().unwrap(),
        };
        let (session, queue) = ClientSession::new(id, SessionKind::Video, 8, &f.token);
        let guard =
            ClientGuard::register(session.clone(), f.registry.clone(), f.events.clone()).unwrap();
        let (tx, mut body) = mpsc::channel(1);
        let task = tokio::spawn(
            DeliveryLoop::new(guard, queue, tx, MultipartEncoder::default()).run(),
        );
        body.recv().await.unwrap();

        // Producer reuses sequence 0 for every frame
        for n in 1..=3 {
            let frame = Frame::video(Bytes::from(jpeg(16 + n)), None, 0);
            assert_eq!(f.hub.publish(frame).unwrap().queued, 1);
        }
        for expected in 1..=3u64 {
            let part = timeout(Duration::from_secs(5), body.recv())
                .await
                .expect("part in time")
                .expect("body open");
            let header = format!("X-Sequence: {}\r\n", expected);
            assert!(String::from_utf8_lossy(&part).contains(&header));
        }
        assert_eq!(f.hub.bus().current_frame().unwrap().sequence, 3);

        session.close();
        task.await.unwrap();
        assert_eq!(session.frames_sent(), 3);
    }

    #[test]
    fn test_invalid_jpeg_keeps_previous_frame() {
        let f = fixture();
        let (_v, mut rx) = f.attach(1, SessionKind::Video, 4);

        f.hub.publish_jpeg(jpeg(32), None).unwrap();
        let err = f.hub.publish_jpeg(vec![1, 2, 3, 4, 5], None).unwrap_err();
        assert!(matches!(err, AppError::InvalidFrame(_)));
        assert!(f.hub.publish_jpeg(Vec::new(), None).is_err());

        let current = f.hub.bus().current_frame().unwrap();
        assert_eq!(current.len(), 32);
        assert!(current.is_valid_jpeg());
        assert_eq!(rx.try_recv().unwrap().len(), 32);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_slow_client_drops_only_its_frames() {
        let f = fixture();
        let (slow, mut slow_rx) = f.attach(1, SessionKind::Video, 2);
        let (fast, mut fast_rx) = f.attach(2, SessionKind::Video, 2);

        for _ in 0..5 {
            f.hub.publish_jpeg(jpeg(16), None).unwrap();
            assert!(fast_rx.try_recv().is_ok());
        }

        assert_eq!(fast.frames_dropped(), 0);
        assert_eq!(slow.frames_dropped(), 3);
        assert_eq!(slow.queued(), 2);
        assert_eq!(f.hub.frames_dropped(), 3);

        // The slow client keeps the oldest frames, in order
        assert_eq!(slow_rx.try_recv().unwrap().sequence, 1);
        assert_eq!(slow_rx.try_recv().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_stop_evicts_and_ignores_publishes() {
        let f = fixture();
        let mut events = f.events.subscribe();
        let (session, mut rx) = f.attach(1, SessionKind::Video, 4);
        f.hub.publish_jpeg(jpeg(16), None).unwrap();
        rx.try_recv().unwrap();

        assert!(!f.hub.start());
        assert_eq!(f.hub.stop(), 1);
        assert!(!f.hub.is_streaming());
        assert!(session.cancel_token().is_cancelled());

        assert_eq!(f.hub.publish_jpeg(jpeg(16), None).unwrap(), FanOut::default());
        assert!(rx.try_recv().is_err());
        assert_eq!(f.hub.bus().current_frame().unwrap().sequence, 1);

        assert!(f.hub.start());
        assert!(matches!(
            events.recv().await.unwrap(),
            SystemEvent::StreamStateChanged { streaming: false }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SystemEvent::StreamStateChanged { streaming: true }
        ));
    }

    #[test]
    fn test_publish_raw_encodes_at_tier_quality() {
        let f = fixture();
        let mut encoder = JpegEncoder::new();
        let raw = RawFrame::new(vec![128u8; 32 * 16 * 3], 32, 16, RawFormat::Rgb24);

        f.hub.publish_raw(&mut encoder, &raw).unwrap();
        let frame = f.hub.bus().current_frame().unwrap();
        assert!(frame.is_valid_jpeg());
        assert_eq!(frame.resolution, Some(Resolution::new(32, 16)));
        assert_eq!(f.hub.resolution(), Resolution::new(32, 16));

        let bad = RawFrame::new(vec![0u8; 10], 32, 16, RawFormat::Rgb24);
        assert!(matches!(
            f.hub.publish_raw(&mut encoder, &bad),
            Err(AppError::Encode(_))
        ));
        assert_eq!(f.hub.bus().current_frame().unwrap().sequence, frame.sequence);
    }

    #[tokio::test]
    async fn test_set_quality() {
        let f = fixture();
        let mut events = f.events.subscribe();
        assert_eq!(f.hub.quality(), QualityTier::Medium);

        f.hub.set_quality(QualityTier::High).unwrap();
        f.hub.set_quality(QualityTier::High).unwrap();
        assert_eq!(f.hub.quality(), QualityTier::High);
        assert_eq!(f.hub.resolution(), Resolution::HD1080);

        assert!(matches!(
            events.recv().await.unwrap(),
            SystemEvent::QualityChanged { quality: QualityTier::High }
        ));
        assert!(events.try_recv().is_err());
    }
}
