//! **Media Relay** — bridges the telephony audio leg to the conversation engine.
//!
//! Two pumps per call: inbound (telephony → recognizer) and outbound
//! (synthesizer → telephony). Each direction buffers a small, bounded number
//! of frames; under sustained backpressure the oldest buffered frame is
//! dropped rather than blocking the telephony leg, since a stalled leg
//! degrades the live call for the other party.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Samples per frame: 20ms of 16 kHz mono.
pub const FRAME_SAMPLES: usize = 320;

/// Grace given to the pumps to finish draining once their channels close.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// One fixed-size audio frame (f32 PCM, -1.0..1.0, 16 kHz mono).
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            timestamp: Utc::now(),
        }
    }

    /// A frame of silence, used by placeholder synthesis.
    pub fn silence() -> Self {
        Self::new(vec![0.0; FRAME_SAMPLES])
    }
}

/// Bounded FIFO of frames. `push` drops the oldest frame when full and
/// reports the eviction so the relay can count drops.
pub struct FrameBuffer {
    frames: VecDeque<AudioFrame>,
    cap: usize,
    dropped: u64,
}

impl FrameBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(cap),
            cap: cap.max(1),
            dropped: 0,
        }
    }

    /// Returns true when an old frame was evicted to make room.
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        let mut evicted = false;
        if self.frames.len() >= self.cap {
            self.frames.pop_front();
            self.dropped += 1;
            evicted = true;
        }
        self.frames.push_back(frame);
        evicted
    }

    pub fn pop(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    /// Re-parks a frame at the head after a failed downstream send.
    fn unpop(&mut self, frame: AudioFrame) {
        self.frames.push_front(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Handle for a running relay: confirms attachment and owns the pump tasks.
pub struct MediaRelayHandle {
    attached: Option<oneshot::Receiver<()>>,
    inbound_drops: Arc<AtomicU64>,
    outbound_drops: Arc<AtomicU64>,
    inbound: tokio::task::JoinHandle<()>,
    outbound: tokio::task::JoinHandle<()>,
}

impl MediaRelayHandle {
    /// Takes the attach confirmation: resolves once the first inbound frame
    /// arrives from the telephony leg. `None` after the first take.
    pub fn take_attached(&mut self) -> Option<oneshot::Receiver<()>> {
        self.attached.take()
    }

    /// (inbound, outbound) frames dropped so far.
    pub fn drop_counts(&self) -> (u64, u64) {
        (
            self.inbound_drops.load(Ordering::Relaxed),
            self.outbound_drops.load(Ordering::Relaxed),
        )
    }

    /// Lets the pumps drain after their channels close, then stops them.
    /// Returns final (inbound, outbound) drop counts.
    pub async fn shutdown(mut self) -> (u64, u64) {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.inbound)
            .await
            .is_err()
        {
            self.inbound.abort();
        }
        self.outbound.abort();
        let _ = self.outbound.await;
        (
            self.inbound_drops.load(Ordering::Relaxed),
            self.outbound_drops.load(Ordering::Relaxed),
        )
    }
}

/// Spawns the two pump tasks for one call.
///
/// - `from_leg`: frames arriving from the telephony audio channel.
/// - `to_recognizer`: bounded channel feeding the recognition stream.
/// - `from_synth`: synthesized frames from the conversation engine.
/// - `to_leg`: bounded channel back to the telephony audio channel.
///
/// `buffer_frames` bounds each direction's backlog before drop-oldest kicks in.
pub fn spawn_relay(
    call: uuid::Uuid,
    buffer_frames: usize,
    mut from_leg: mpsc::Receiver<AudioFrame>,
    to_recognizer: mpsc::Sender<AudioFrame>,
    mut from_synth: mpsc::Receiver<AudioFrame>,
    to_leg: mpsc::Sender<AudioFrame>,
) -> MediaRelayHandle {
    let (attach_tx, attach_rx) = oneshot::channel();
    let inbound_drops = Arc::new(AtomicU64::new(0));
    let outbound_drops = Arc::new(AtomicU64::new(0));

    let in_counter = Arc::clone(&inbound_drops);
    let inbound = tokio::spawn(async move {
        let mut buf = FrameBuffer::new(buffer_frames);
        let mut attach_tx = Some(attach_tx);
        while let Some(frame) = from_leg.recv().await {
            if let Some(tx) = attach_tx.take() {
                info!(%call, "media channel attached");
                let _ = tx.send(());
            }
            if buf.push(frame) {
                in_counter.fetch_add(1, Ordering::Relaxed);
                debug!(%call, dropped = buf.dropped(), "inbound backpressure, dropped oldest frame");
            }
            drain(&mut buf, &to_recognizer);
        }
        if buf.dropped() > 0 {
            warn!(%call, dropped = buf.dropped(), "inbound relay closed with dropped frames");
        }
    });

    let out_counter = Arc::clone(&outbound_drops);
    let outbound = tokio::spawn(async move {
        let mut buf = FrameBuffer::new(buffer_frames);
        while let Some(frame) = from_synth.recv().await {
            if buf.push(frame) {
                out_counter.fetch_add(1, Ordering::Relaxed);
                debug!(%call, dropped = buf.dropped(), "outbound backpressure, dropped oldest frame");
            }
            drain(&mut buf, &to_leg);
        }
    });

    MediaRelayHandle {
        attached: Some(attach_rx),
        inbound_drops,
        outbound_drops,
        inbound,
        outbound,
    }
}

/// Forwards buffered frames while the downstream has capacity; leaves the rest
/// buffered for the next wakeup.
fn drain(buf: &mut FrameBuffer, tx: &mpsc::Sender<AudioFrame>) {
    while let Some(frame) = buf.pop() {
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                buf.unpop(frame);
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_buffer_drops_oldest_when_full() {
        let mut buf = FrameBuffer::new(2);
        let tagged = |v: f32| AudioFrame::new(vec![v; FRAME_SAMPLES]);

        assert!(!buf.push(tagged(1.0)));
        assert!(!buf.push(tagged(2.0)));
        assert!(buf.push(tagged(3.0)));

        assert_eq!(buf.dropped(), 1);
        assert_eq!(buf.pop().unwrap().samples[0], 2.0);
        assert_eq!(buf.pop().unwrap().samples[0], 3.0);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn relay_confirms_attach_on_first_frame() {
        let (leg_tx, leg_rx) = mpsc::channel(4);
        let (rec_tx, mut rec_rx) = mpsc::channel(4);
        let (_synth_tx, synth_rx) = mpsc::channel::<AudioFrame>(4);
        let (out_tx, _out_rx) = mpsc::channel(4);

        let mut handle = spawn_relay(uuid::Uuid::new_v4(), 8, leg_rx, rec_tx, synth_rx, out_tx);
        let attached = handle.take_attached().unwrap();

        leg_tx.send(AudioFrame::silence()).await.unwrap();
        attached.await.expect("attach confirmation");
        assert!(rec_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn relay_drops_oldest_under_backpressure() {
        let (leg_tx, leg_rx) = mpsc::channel(32);
        // Recognizer channel of 1 that nobody reads: sustained backpressure.
        let (rec_tx, _rec_rx) = mpsc::channel(1);
        let (_synth_tx, synth_rx) = mpsc::channel::<AudioFrame>(4);
        let (out_tx, _out_rx) = mpsc::channel(4);

        let handle = spawn_relay(uuid::Uuid::new_v4(), 2, leg_rx, rec_tx, synth_rx, out_tx);

        for _ in 0..10 {
            leg_tx.send(AudioFrame::silence()).await.unwrap();
        }
        drop(leg_tx);

        // 10 frames in: 1 parked in the channel, 2 buffered, rest dropped.
        let (inbound_drops, _) = handle.shutdown().await;
        assert!(inbound_drops >= 6, "expected drops, got {inbound_drops}");
    }

    #[tokio::test]
    async fn outbound_forwards_synth_frames_to_leg() {
        let (_leg_tx, leg_rx) = mpsc::channel::<AudioFrame>(4);
        let (rec_tx, _rec_rx) = mpsc::channel(4);
        let (synth_tx, synth_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let _handle = spawn_relay(uuid::Uuid::new_v4(), 8, leg_rx, rec_tx, synth_rx, out_tx);

        synth_tx.send(AudioFrame::silence()).await.unwrap();
        assert!(out_rx.recv().await.is_some());
    }
}
