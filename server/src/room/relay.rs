//! Audio Relay Track
//!
//! Wraps one upstream audio track and fans its frames out to any number of
//! independent downstream subscriptions. Sharing one recv() cursor across
//! consumers makes them race and breaks timestamp continuity, so every
//! subscription owns its queue, its pacing clock and its timestamp line.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

/// Opus frame cadence.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// RTP timestamp ticks per 20 ms frame at 48 kHz.
pub const TIMESTAMP_STEP: u32 = 960;

/// Canonical Opus silence frame.
pub const OPUS_SILENCE: &[u8] = &[0xF8, 0xFF, 0xFE];

/// Per-subscription buffer, ~1 s of audio at frame cadence.
const SUBSCRIPTION_CAPACITY: usize = 50;

/// Raw-tap buffer, generously sized; the STT adapter coalesces further
/// downstream.
const TAP_CAPACITY: usize = 256;

/// One audio frame moving through the relay.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    /// Opus payload.
    pub payload: Bytes,
    /// RTP timestamp. Upstream value on the tap; a private monotonic line on
    /// paced subscriptions.
    pub timestamp: u32,
}

struct SubscriptionShared {
    queue: Mutex<VecDeque<Bytes>>,
    ended: AtomicBool,
}

/// One independent paced downstream of a relay track.
pub struct RelaySubscription {
    shared: Arc<SubscriptionShared>,
    interval: Option<tokio::time::Interval>,
    next_timestamp: u32,
}

impl RelaySubscription {
    /// Next frame at the fixed cadence.
    ///
    /// The first call is t=0. When the upstream is late a silence frame is
    /// emitted so the timestamp line keeps advancing; once the upstream has
    /// ended and the queue is drained, returns `None`.
    pub async fn recv(&mut self) -> Option<RelayFrame> {
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(FRAME_DURATION);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;

        let popped = self.shared.queue.lock().unwrap().pop_front();
        let payload = match popped {
            Some(payload) => payload,
            None if self.shared.ended.load(Ordering::Acquire) => return None,
            None => Bytes::from_static(OPUS_SILENCE),
        };

        let timestamp = self.next_timestamp;
        self.next_timestamp = self.next_timestamp.wrapping_add(TIMESTAMP_STEP);
        Some(RelayFrame { payload, timestamp })
    }
}

/// Fan-out hub over one upstream audio track.
pub struct AudioRelayTrack {
    subscriptions: Mutex<Vec<Weak<SubscriptionShared>>>,
    taps: Mutex<Vec<mpsc::Sender<RelayFrame>>>,
    ended: AtomicBool,
}

impl AudioRelayTrack {
    /// Hub with no upstream attached yet; frames arrive via [`Self::push`].
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: Mutex::new(Vec::new()),
            taps: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        })
    }

    /// Hub fed by a reader task over the remote track. The returned handle
    /// must be held strongly for the lifetime of the forwarding path.
    pub fn spawn_reader(self: &Arc<Self>, track: Arc<TrackRemote>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _attributes)) => {
                        hub.push(RelayFrame {
                            payload: packet.payload,
                            timestamp: packet.header.timestamp,
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "Upstream track ended");
                        break;
                    }
                }
            }
            hub.finish();
        })
    }

    /// New independent paced downstream.
    pub fn subscribe(&self) -> RelaySubscription {
        let shared = Arc::new(SubscriptionShared {
            queue: Mutex::new(VecDeque::with_capacity(SUBSCRIPTION_CAPACITY)),
            ended: AtomicBool::new(self.ended.load(Ordering::Acquire)),
        });
        self.subscriptions
            .lock()
            .unwrap()
            .push(Arc::downgrade(&shared));
        RelaySubscription {
            shared,
            interval: None,
            next_timestamp: 0,
        }
    }

    /// Raw pre-pacing frame stream for the STT adapter.
    pub fn tap(&self) -> mpsc::Receiver<RelayFrame> {
        let (tx, rx) = mpsc::channel(TAP_CAPACITY);
        self.taps.lock().unwrap().push(tx);
        rx
    }

    /// Distribute one upstream frame.
    pub fn push(&self, frame: RelayFrame) {
        {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.retain(|weak| {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                let mut queue = shared.queue.lock().unwrap();
                if queue.len() >= SUBSCRIPTION_CAPACITY {
                    queue.pop_front();
                }
                queue.push_back(frame.payload.clone());
                true
            });
        }

        let mut taps = self.taps.lock().unwrap();
        taps.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("STT tap backlogged, dropping frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Mark the upstream as ended; subscriptions drain then report EOF.
    pub fn finish(&self) {
        self.ended.store(true, Ordering::Release);
        let subscriptions = self.subscriptions.lock().unwrap();
        for weak in subscriptions.iter() {
            if let Some(shared) = weak.upgrade() {
                shared.ended.store(true, Ordering::Release);
            }
        }
        self.taps.lock().unwrap().clear();
    }
}

/// Pump one paced subscription into a local RTP track. Runs until the
/// subscription reports EOF or the egress track rejects a write.
pub fn spawn_forwarder(
    mut subscription: RelaySubscription,
    local_track: Arc<TrackLocalStaticRTP>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sequence_number: u16 = 0;
        while let Some(frame) = subscription.recv().await {
            let packet = RtpPacket {
                header: Header {
                    version: 2,
                    payload_type: 111,
                    sequence_number,
                    timestamp: frame.timestamp,
                    ..Default::default()
                },
                payload: frame.payload,
            };
            if let Err(e) = local_track.write_rtp(&packet).await {
                warn!(error = %e, "Egress track write failed, stopping forwarder");
                break;
            }
            sequence_number = sequence_number.wrapping_add(1);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8, timestamp: u32) -> RelayFrame {
        RelayFrame {
            payload: Bytes::from(vec![byte; 4]),
            timestamp,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn paced_recv_keeps_timestamps_strictly_increasing() {
        let hub = AudioRelayTrack::new();
        let mut sub = hub.subscribe();

        hub.push(frame(1, 1000));
        hub.push(frame(2, 1960));

        let mut last_timestamp = None;
        for expect_silence in [false, false, true, true] {
            let frame = sub.recv().await.expect("stream live");
            if expect_silence {
                assert_eq!(&frame.payload[..], OPUS_SILENCE);
            } else {
                assert_ne!(&frame.payload[..], OPUS_SILENCE);
            }
            if let Some(last) = last_timestamp {
                assert!(frame.timestamp > last, "timestamps must advance");
                assert_eq!(frame.timestamp - last, TIMESTAMP_STEP);
            }
            last_timestamp = Some(frame.timestamp);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn eof_after_drain() {
        let hub = AudioRelayTrack::new();
        let mut sub = hub.subscribe();

        hub.push(frame(1, 0));
        hub.finish();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_drops_oldest_frame() {
        let hub = AudioRelayTrack::new();
        let mut sub = hub.subscribe();

        for i in 0..(SUBSCRIPTION_CAPACITY + 2) {
            hub.push(frame(i as u8, i as u32 * TIMESTAMP_STEP));
        }

        let first = sub.recv().await.unwrap();
        // Two oldest frames were displaced.
        assert_eq!(first.payload[0], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_do_not_share_a_cursor() {
        let hub = AudioRelayTrack::new();
        let mut sub_a = hub.subscribe();
        let mut sub_b = hub.subscribe();

        hub.push(frame(7, 0));

        let a = sub_a.recv().await.unwrap();
        let b = sub_b.recv().await.unwrap();
        assert_eq!(a.payload[0], 7);
        assert_eq!(b.payload[0], 7);
        assert_eq!(a.timestamp, 0);
        assert_eq!(b.timestamp, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tap_sees_raw_upstream_timestamps() {
        let hub = AudioRelayTrack::new();
        let mut tap = hub.tap();

        hub.push(frame(3, 12345));

        let raw = tap.recv().await.unwrap();
        assert_eq!(raw.timestamp, 12345);
        assert_eq!(raw.payload[0], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_misses_no_future_frames() {
        let hub = AudioRelayTrack::new();
        hub.push(frame(1, 0));

        let mut sub = hub.subscribe();
        hub.push(frame(2, TIMESTAMP_STEP));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.payload[0], 2);
    }
}
