//! Per-connection delivery loop
//!
//! Drains one session's frame queue into the HTTP response body. The body
//! channel has capacity one, so a client that stops reading blocks only
//! this loop; meanwhile the producer keeps offering into the bounded
//! frame queue and frames beyond its capacity are dropped for this
//! client alone.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::multipart::MultipartEncoder;
use super::session::{ClientGuard, ClientSession};
use crate::media::Frame;

/// Why a delivery loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Response body dropped: the client disconnected
    ClientGone,
    /// Session closed on its own (eviction, stream stopped)
    Evicted,
    /// Server shutdown
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::ClientGone => write!(f, "client gone"),
            ExitReason::Evicted => write!(f, "evicted"),
            ExitReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

type ActivityFn = Box<dyn Fn() + Send + Sync>;

/// Periodic "client still active" notification
struct Activity {
    every: Duration,
    last: Instant,
    notify: ActivityFn,
}

impl Activity {
    fn on_write(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.every {
            self.last = now;
            (self.notify)();
        }
    }
}

/// Delivery loop of one streaming connection
pub struct DeliveryLoop {
    guard: ClientGuard,
    queue: mpsc::Receiver<Frame>,
    sink: mpsc::Sender<Bytes>,
    encoder: MultipartEncoder,
    pacing: Option<Duration>,
    keepalive: Option<Duration>,
    initial: Option<Frame>,
    activity: Option<(Duration, ActivityFn)>,
}

impl DeliveryLoop {
    pub fn new(
        guard: ClientGuard,
        queue: mpsc::Receiver<Frame>,
        sink: mpsc::Sender<Bytes>,
        encoder: MultipartEncoder,
    ) -> Self {
        Self {
            guard,
            queue,
            sink,
            encoder,
            pacing: None,
            keepalive: None,
            initial: None,
            activity: None,
        }
    }

    /// Cap writes at `max_fps` (0 = unpaced)
    pub fn with_max_fps(mut self, max_fps: u32) -> Self {
        self.pacing = (max_fps > 0).then(|| Duration::from_secs(1) / max_fps);
        self
    }

    /// Re-send the last frame after `interval` without new frames (zero disables)
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Frame written right after the preamble, before any queued frame
    ///
    /// Read it from the bus before registering the session: fan-out can
    /// then queue at most this same frame ahead of newer ones.
    pub fn with_initial_frame(mut self, frame: Option<Frame>) -> Self {
        self.initial = frame.filter(|f| !f.is_empty());
        self
    }

    /// Call `notify` after a successful write, at most once per `every`
    pub fn with_activity<F>(mut self, every: Duration, notify: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.activity = (!every.is_zero()).then(|| (every, Box::new(notify) as ActivityFn));
        self
    }

    /// Run until the client leaves, the session is evicted or the server
    /// shuts down; session cleanup has completed when this returns.
    pub async fn run(self) -> ExitReason {
        let DeliveryLoop {
            guard,
            mut queue,
            sink,
            encoder,
            pacing,
            keepalive,
            initial,
            activity,
        } = self;

        let session = guard.session().clone();
        let mut writer = PartWriter {
            sink,
            encoder,
            pacing,
            last_write: None,
            session: session.clone(),
            activity: activity.map(|(every, notify)| Activity {
                every,
                last: Instant::now(),
                notify,
            }),
        };

        let reason = deliver(&session, &mut queue, &mut writer, keepalive, initial).await;
        debug!(client = %session.id(), %reason, "Delivery loop finished");

        // Drop the receiver before cleanup so late offers see a closed queue
        drop(queue);
        guard.close();
        reason
    }
}

async fn deliver(
    session: &ClientSession,
    queue: &mut mpsc::Receiver<Frame>,
    writer: &mut PartWriter,
    keepalive: Option<Duration>,
    initial: Option<Frame>,
) -> ExitReason {
    let cancel = session.cancel_token().clone();
    let media = session.kind().media();

    if let Err(reason) = writer.write(MultipartEncoder::preamble(media), &cancel).await {
        return reason;
    }

    let mut last: Option<Frame> = None;
    let mut pending_initial: Option<Frame> = None;
    if let Some(frame) = initial {
        if let Err(reason) = writer.write_frame(&frame, &cancel).await {
            return reason;
        }
        last = Some(frame.clone());
        pending_initial = Some(frame);
    }

    loop {
        let idle = async {
            match keepalive {
                Some(interval) => sleep(interval).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return cancel_reason(session),

            _ = writer.sink.closed() => return ExitReason::ClientGone,

            next = queue.recv() => {
                let Some(frame) = next else {
                    return cancel_reason(session);
                };
                // Only the first queued frame can repeat the initial one
                if pending_initial
                    .take()
                    .is_some_and(|first| first.same_publish(&frame))
                {
                    continue;
                }
                if let Err(reason) = writer.write_frame(&frame, &cancel).await {
                    return reason;
                }
                last = Some(frame);
            }

            _ = idle => {
                if let Some(frame) = &last {
                    trace!(client = %session.id(), seq = frame.sequence, "Keepalive resend");
                    if let Err(reason) = writer.write_frame(frame, &cancel).await {
                        return reason;
                    }
                }
            }
        }
    }
}

fn cancel_reason(session: &ClientSession) -> ExitReason {
    if session.is_shutting_down() {
        ExitReason::Shutdown
    } else {
        ExitReason::Evicted
    }
}

/// Writes encoded parts into the response body channel
struct PartWriter {
    sink: mpsc::Sender<Bytes>,
    encoder: MultipartEncoder,
    pacing: Option<Duration>,
    last_write: Option<Instant>,
    session: Arc<ClientSession>,
    activity: Option<Activity>,
}

impl PartWriter {
    async fn write_frame(
        &mut self,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> Result<(), ExitReason> {
        let Some(part) = self.encoder.encode(frame) else {
            return Ok(());
        };

        if let (Some(interval), Some(last)) = (self.pacing, self.last_write) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancel_reason(&self.session)),
                _ = sleep_until(last + interval) => {}
            }
        }

        self.write(part, cancel).await?;
        self.last_write = Some(Instant::now());
        self.session.record_frame_sent();
        if let Some(activity) = &mut self.activity {
            activity.on_write();
        }
        Ok(())
    }

    /// Send raw bytes, giving up as soon as the session is cancelled
    async fn write(&self, data: Bytes, cancel: &CancellationToken) -> Result<(), ExitReason> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancel_reason(&self.session)),
            sent = self.sink.send(data) => sent.map_err(|_| ExitReason::ClientGone),
        }
    }
}
