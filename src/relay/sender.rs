//! # Outbound Sender
//!
//! One task per call that drains the session's sink queue and writes telephony `media`
//! events, tagging every Kth frame with a `mark` for latency measurement.
//!
//! ## Pacing Modes:
//! - **On demand** (no pacing): wait for the next frame and send it immediately
//! - **Paced**: on every tick send the next queued frame, or silence of the same length as
//!   the previous frame when the queue is empty, so the telephony stream keeps a constant
//!   frame rate
//!
//! ## Shutdown:
//! The call driver fires a oneshot and then awaits the task's `JoinHandle`, so no frame
//! is written after the call starts tearing down. The task also ends by itself when the
//! sink closes or the transport reports the socket is gone.

use crate::audio::buffer::{AudioFrameReceiver, TryPopError};
use crate::audio::frame::AudioFrame;
use crate::relay::counters::RelayCounters;
use crate::relay::latency::{LatencyTracker, MarkSchedule};
use crate::relay::protocol::OutboundEvent;
use crate::relay::transport::{TelephonyTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Static parameters of an outbound sender.
#[derive(Debug, Clone, Copy)]
pub struct SenderSettings {
    /// Rate of the mu-law audio sent to the telephony side
    pub telephony_rate: u32,
    /// Which frames carry a mark
    pub schedule: MarkSchedule,
    /// Tick period in paced mode, `None` for on-demand sending
    pub pacing: Option<Duration>,
}

/// Handle the call driver keeps for a running sender.
pub struct SenderHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl SenderHandle {
    /// Stop the sender and wait for it, returning how many media frames it sent.
    pub async fn shutdown(mut self) -> u64 {
        if let Some(shutdown) = self.shutdown.take() {
            // Already finished if the receiver is gone
            let _ = shutdown.send(());
        }

        match self.task.await {
            Ok(sent) => sent,
            Err(err) => {
                warn!("Outbound sender task failed: {}", err);
                0
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Turns sink frames into outbound telephony events.
pub struct OutboundSender {
    stream_sid: String,
    frames: AudioFrameReceiver,
    transport: Arc<dyn TelephonyTransport>,
    latency: Arc<LatencyTracker>,
    counters: Arc<RelayCounters>,
    settings: SenderSettings,
    sequence: u64,
    sent: u64,
    last_frame: Option<AudioFrame>,
}

impl OutboundSender {
    pub fn new(
        stream_sid: impl Into<String>,
        frames: AudioFrameReceiver,
        transport: Arc<dyn TelephonyTransport>,
        latency: Arc<LatencyTracker>,
        counters: Arc<RelayCounters>,
        settings: SenderSettings,
    ) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            frames,
            transport,
            latency,
            counters,
            settings,
            sequence: 0,
            sent: 0,
            last_frame: None,
        }
    }

    pub fn spawn(self) -> SenderHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        SenderHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> u64 {
        debug!(stream_sid = %self.stream_sid, pacing = ?self.settings.pacing, "Outbound sender started");

        match self.settings.pacing {
            None => loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    frame = self.frames.pop() => {
                        let Some(frame) = frame else { break };
                        if self.send_frame(frame).is_err() {
                            break;
                        }
                    }
                }
            },
            Some(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = ticker.tick() => {
                            let frame = match self.frames.try_pop() {
                                Ok(frame) => frame,
                                Err(TryPopError::Empty) => match &self.last_frame {
                                    Some(last) => last.silence_like(),
                                    None => continue,
                                },
                                Err(TryPopError::Closed) => break,
                            };
                            if self.send_frame(frame).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        debug!(stream_sid = %self.stream_sid, sent = self.sent, "Outbound sender finished");
        self.sent
    }

    /// Encode and send one frame, followed by a mark when the schedule says so.
    ///
    /// Frames that fail to convert are skipped; only a closed transport is an error.
    fn send_frame(&mut self, frame: AudioFrame) -> Result<(), TransportError> {
        let mulaw = match frame.to_mulaw8(self.settings.telephony_rate) {
            Ok(mulaw) if !mulaw.is_empty() => mulaw,
            Ok(_) => return Ok(()),
            Err(err) => {
                warn!(stream_sid = %self.stream_sid, "Skipping outbound frame: {}", err);
                return Ok(());
            }
        };

        self.sequence += 1;
        let mark = self.settings.schedule.mark_for(self.sequence);
        if let Some(name) = &mark {
            self.latency.record_send(name);
        }

        if let Err(err) = self.transmit(&mulaw, mark.as_deref()) {
            debug!(stream_sid = %self.stream_sid, "Outbound sender stopping: {}", err);
            return Err(err);
        }

        self.sent += 1;
        self.counters.outbound_frame();
        self.last_frame = Some(mulaw);
        Ok(())
    }

    fn transmit(&self, mulaw: &AudioFrame, mark: Option<&str>) -> Result<(), TransportError> {
        self.transport
            .send(OutboundEvent::media(&self.stream_sid, mulaw.data()))?;

        if let Some(name) = mark {
            self.transport.send(OutboundEvent::mark(&self.stream_sid, name))?;
            self.counters.mark_sent();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BoundedAudioChannel;
    use crate::audio::frame::AudioEncoding;
    use crate::relay::transport::testing::RecordingTransport;

    fn settings(interval: u64, pacing: Option<Duration>) -> SenderSettings {
        SenderSettings {
            telephony_rate: 8000,
            schedule: MarkSchedule::new(interval),
            pacing,
        }
    }

    /// Let the sender run until it ends by itself.
    async fn wait_finished(handle: &SenderHandle) {
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    }

    fn pcm_frame(value: i16) -> AudioFrame {
        AudioFrame::from_pcm16(&[value; 320], 16000, 1).unwrap()
    }

    #[tokio::test]
    async fn test_on_demand_sends_media_and_marks() {
        let (tx, rx) = BoundedAudioChannel::new(16, "test");
        let transport = Arc::new(RecordingTransport::default());
        let latency = Arc::new(LatencyTracker::new());
        let counters = Arc::new(RelayCounters::new());

        let handle = OutboundSender::new(
            "SID1",
            rx,
            transport.clone(),
            latency.clone(),
            counters.clone(),
            settings(3, None),
        )
        .spawn();

        for i in 0..7 {
            tx.push(pcm_frame(i * 100));
        }
        drop(tx);

        wait_finished(&handle).await;
        assert_eq!(handle.shutdown().await, 7);
        assert_eq!(transport.media_count(), 7);
        assert_eq!(transport.mark_names(), vec!["1", "4", "7"]);
        assert_eq!(latency.pending(), 3);
        assert_eq!(counters.snapshot().marks_sent, 3);

        // The mark follows the media frame it tags
        let sent = transport.sent();
        assert!(matches!(sent[0], OutboundEvent::Media { .. }));
        assert!(matches!(&sent[1], OutboundEvent::Mark { mark, stream_sid } if mark.name == "1" && stream_sid == "SID1"));
        assert!(matches!(sent[2], OutboundEvent::Media { .. }));
    }

    #[tokio::test]
    async fn test_frames_are_downsampled_and_companded() {
        let (tx, rx) = BoundedAudioChannel::new(4, "test");
        let transport = Arc::new(RecordingTransport::default());

        let handle = OutboundSender::new(
            "SID1",
            rx,
            transport.clone(),
            Arc::new(LatencyTracker::new()),
            Arc::new(RelayCounters::new()),
            settings(100, None),
        )
        .spawn();

        tx.push(pcm_frame(0));
        drop(tx);
        wait_finished(&handle).await;
        handle.shutdown().await;

        match &transport.sent()[0] {
            OutboundEvent::Media { media, .. } => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&media.payload)
                    .unwrap();
                // 320 samples at 16kHz become 160 mu-law bytes at 8kHz
                assert_eq!(bytes.len(), 160);
                assert!(bytes.iter().all(|&b| b == AudioEncoding::Mulaw8.silence_byte()));
            }
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_sender() {
        let (_tx, rx) = BoundedAudioChannel::new(4, "test");
        let transport = Arc::new(RecordingTransport::default());

        let handle = OutboundSender::new(
            "SID1",
            rx,
            transport.clone(),
            Arc::new(LatencyTracker::new()),
            Arc::new(RelayCounters::new()),
            settings(100, None),
        )
        .spawn();

        assert_eq!(handle.shutdown().await, 0);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sender_stops_when_transport_closes() {
        let (tx, rx) = BoundedAudioChannel::new(8, "test");
        let transport = Arc::new(RecordingTransport::default());
        transport.disconnect();

        let handle = OutboundSender::new(
            "SID1",
            rx,
            transport.clone(),
            Arc::new(LatencyTracker::new()),
            Arc::new(RelayCounters::new()),
            settings(100, None),
        )
        .spawn();

        tx.push(pcm_frame(0));
        tx.push(pcm_frame(0));

        // Exits on the first failed write while the producer is still alive
        wait_finished(&handle).await;
        assert_eq!(handle.shutdown().await, 0);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_mode_fills_gaps_with_silence() {
        let (tx, rx) = BoundedAudioChannel::new(4, "test");
        let transport = Arc::new(RecordingTransport::default());

        let handle = OutboundSender::new(
            "SID1",
            rx,
            transport.clone(),
            Arc::new(LatencyTracker::new()),
            Arc::new(RelayCounters::new()),
            settings(100, Some(Duration::from_millis(20))),
        )
        .spawn();

        // Nothing is sent before the first real frame
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.media_count(), 0);

        tx.push(pcm_frame(1000));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let media: Vec<Vec<u8>> = transport
            .sent()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::Media { media, .. } => {
                    use base64::Engine;
                    Some(base64::engine::general_purpose::STANDARD.decode(media.payload).unwrap())
                }
                _ => None,
            })
            .collect();

        assert!(media.len() >= 4, "expected a steady cadence, got {} frames", media.len());
        assert!(media[0].iter().any(|&b| b != 0xFF));
        for silence in &media[1..] {
            assert_eq!(silence.len(), media[0].len());
            assert!(silence.iter().all(|&b| b == 0xFF));
        }

        drop(tx);
        handle.shutdown().await;
    }
}
