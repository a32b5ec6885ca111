//! In-memory audio devices.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chat_api::Message;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use super::{
    CaptureControl, CaptureHandle, Microphone, PlaybackBackend, PlaybackHandle, VoiceSink,
};
use crate::error::{AudioError, Result};

/// Decoder that accepts any non-empty buffer as a track of fixed length.
pub struct MockBackend {
    duration_secs: f64,
    playable_after: Duration,
    fail_decode: AtomicBool,
    loaded: Mutex<Vec<Arc<MockPlayback>>>,
}

impl MockBackend {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            playable_after: Duration::ZERO,
            fail_decode: AtomicBool::new(false),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Delay between load and the track becoming playable.
    pub fn with_playable_after(mut self, delay: Duration) -> Self {
        self.playable_after = delay;
        self
    }

    pub fn set_fail_decode(&self, fail: bool) {
        self.fail_decode.store(fail, Ordering::SeqCst);
    }

    /// Tracks loaded so far, oldest first.
    pub fn loaded(&self) -> Vec<Arc<MockPlayback>> {
        self.loaded.lock().clone()
    }
}

#[async_trait]
impl PlaybackBackend for MockBackend {
    async fn load(&self, encoded: Bytes) -> std::result::Result<Arc<dyn PlaybackHandle>, AudioError> {
        if encoded.is_empty() || self.fail_decode.load(Ordering::SeqCst) {
            return Err(AudioError::Decode("unrecognised container".into()));
        }
        let track = Arc::new(MockPlayback::new(self.duration_secs, self.playable_after));
        self.loaded.lock().push(track.clone());
        Ok(track)
    }
}

#[derive(Debug, Default)]
struct Transport {
    base: f64,
    playing_since: Option<Instant>,
    stopped: bool,
}

/// Track whose position advances with the tokio clock while playing.
pub struct MockPlayback {
    duration: f64,
    playable_after: Duration,
    transport: Mutex<Transport>,
}

impl MockPlayback {
    fn new(duration: f64, playable_after: Duration) -> Self {
        Self {
            duration,
            playable_after,
            transport: Mutex::new(Transport::default()),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.transport.lock().playing_since.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.transport.lock().stopped
    }

    fn current(&self, t: &Transport) -> f64 {
        let running = t
            .playing_since
            .map_or(0.0, |since| since.elapsed().as_secs_f64());
        (t.base + running).min(self.duration)
    }
}

#[async_trait]
impl PlaybackHandle for MockPlayback {
    async fn wait_playable(&self) -> std::result::Result<(), AudioError> {
        if !self.playable_after.is_zero() {
            time::sleep(self.playable_after).await;
        }
        Ok(())
    }

    fn play(&self) -> std::result::Result<(), AudioError> {
        let mut t = self.transport.lock();
        if t.stopped {
            return Err(AudioError::Playback("track stopped".into()));
        }
        if t.playing_since.is_none() {
            t.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&self) {
        let mut t = self.transport.lock();
        t.base = self.current(&t);
        t.playing_since = None;
    }

    fn seek(&self, secs: f64) {
        let mut t = self.transport.lock();
        t.base = secs.clamp(0.0, self.duration);
        if t.playing_since.is_some() {
            t.playing_since = Some(Instant::now());
        }
    }

    fn position(&self) -> f64 {
        let t = self.transport.lock();
        self.current(&t)
    }

    fn is_ended(&self) -> bool {
        self.position() >= self.duration
    }

    fn stop(&self) {
        let mut t = self.transport.lock();
        t.playing_since = None;
        t.stopped = true;
    }

    fn duration(&self) -> Option<f64> {
        Some(self.duration)
    }
}

/// Microphone producing fixed-size chunks on a fixed period.
pub struct MockMicrophone {
    chunk_size: usize,
    period: Duration,
    final_flush: usize,
    fail: AtomicBool,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl MockMicrophone {
    pub fn new(chunk_size: usize, period: Duration) -> Self {
        Self {
            chunk_size,
            period,
            final_flush: chunk_size / 2,
            fail: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Size of the chunk delivered after stop.
    pub fn with_final_flush(mut self, bytes: usize) -> Self {
        self.final_flush = bytes;
        self
    }

    pub fn set_unavailable(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Whether every opened session was released.
    pub fn is_idle(&self) -> bool {
        self.opened() == self.released()
    }
}

#[async_trait]
impl Microphone for MockMicrophone {
    async fn open(&self) -> std::result::Result<CaptureHandle, AudioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AudioError::Microphone("permission denied".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let chunk = Bytes::from(vec![0x5a; self.chunk_size]);
        let flush = Bytes::from(vec![0xa5; self.final_flush]);
        let period = self.period;
        let producer = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        if !flush.is_empty() {
                            let _ = tx.send(flush).await;
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if tx.send(chunk.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(CaptureHandle {
            chunks: rx,
            control: Box::new(MockCapture {
                stop: Some(stop_tx),
                producer,
                released: self.released.clone(),
                done: false,
            }),
        })
    }
}

struct MockCapture {
    stop: Option<oneshot::Sender<()>>,
    producer: JoinHandle<()>,
    released: Arc<AtomicUsize>,
    done: bool,
}

impl CaptureControl for MockCapture {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    fn release(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.producer.abort();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Voice sink that records what it is given.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(usize, u32)>>,
}

impl RecordingSink {
    /// `(bytes, duration_secs)` per delivered recording.
    pub fn sent(&self) -> Vec<(usize, u32)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl VoiceSink for RecordingSink {
    async fn send_voice(
        &self,
        target: Option<&str>,
        encoded: Bytes,
        duration_secs: u32,
    ) -> Result<Message> {
        self.sent.lock().push((encoded.len(), duration_secs));
        Ok(Message {
            id: format!("voice-{}", self.sent.lock().len()),
            conversation_id: target.unwrap_or("sink").into(),
            text: String::new(),
            audio: Some(chat_api::AudioAttachment::new("mock://sink", duration_secs)),
            sender_id: "me".into(),
            sender_name: "Me".into(),
            status: chat_api::DeliveryStatus::Sent,
            edited: false,
            created_at: 0,
            recipient_count: None,
        })
    }
}
