use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chat_api::Message;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{CaptureControl, Microphone};
use crate::error::{Result, ValidationError};

pub const DEFAULT_RECORDING_CEILING: Duration = Duration::from_secs(60);
/// Anything smaller is treated as an accidental tap.
pub const DEFAULT_MIN_RECORDING_BYTES: usize = 2048;

/// Destination of finished recordings.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Conversation a recording started now belongs to. Asked once at start.
    fn voice_target(&self) -> Option<String> {
        None
    }

    async fn send_voice(
        &self,
        target: Option<&str>,
        encoded: Bytes,
        duration_secs: u32,
    ) -> Result<Message>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderSettings {
    pub ceiling: Duration,
    pub min_bytes: usize,
    /// How long to wait for the device's final flush after stop.
    pub flush_timeout: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_RECORDING_CEILING,
            min_bytes: DEFAULT_MIN_RECORDING_BYTES,
            flush_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecorderStatus {
    pub recording: bool,
    pub elapsed_secs: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingOutcome {
    Sent { message: Message, duration_secs: u32 },
    /// Too little audio was captured; nothing was sent.
    Discarded { bytes: usize },
}

struct Session {
    id: u64,
    target: Option<String>,
    started: Instant,
    control: Box<dyn CaptureControl>,
    buffer: Arc<Mutex<BytesMut>>,
    collector: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

#[derive(Default)]
struct RecorderState {
    next_id: u64,
    session: Option<Session>,
}

struct Inner {
    microphone: Arc<dyn Microphone>,
    sink: Arc<dyn VoiceSink>,
    settings: RecorderSettings,
    state: Mutex<RecorderState>,
    status: watch::Sender<RecorderStatus>,
}

/// One-at-a-time voice capture that hands finished recordings to a sink.
#[derive(Clone)]
pub struct VoiceRecorder {
    inner: Arc<Inner>,
}

impl VoiceRecorder {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        sink: Arc<dyn VoiceSink>,
        settings: RecorderSettings,
    ) -> Self {
        let (status, _) = watch::channel(RecorderStatus::default());
        Self {
            inner: Arc::new(Inner {
                microphone,
                sink,
                settings,
                state: Mutex::new(RecorderState::default()),
                status,
            }),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.lock().session.is_some()
    }

    pub fn status(&self) -> RecorderStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecorderStatus> {
        self.inner.status.subscribe()
    }

    /// Open the microphone and begin collecting chunks.
    pub async fn start(&self) -> Result<()> {
        if self.is_recording() {
            return Err(ValidationError::RecordingActive.into());
        }
        let capture = self.inner.microphone.open().await?;
        let mut control = capture.control;
        let target = self.inner.sink.voice_target();
        let mut st = self.inner.state.lock();
        if st.session.is_some() {
            control.release();
            return Err(ValidationError::RecordingActive.into());
        }
        st.next_id += 1;
        let id = st.next_id;

        let buffer = Arc::new(Mutex::new(BytesMut::new()));
        let sink = buffer.clone();
        let mut chunks = capture.chunks;
        let collector = tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                sink.lock().extend_from_slice(&chunk);
            }
        });
        let ticker = tokio::spawn(tick(Arc::downgrade(&self.inner), id));

        st.session = Some(Session {
            id,
            target,
            started: Instant::now(),
            control,
            buffer,
            collector,
            ticker,
        });
        self.inner.status.send_replace(RecorderStatus {
            recording: true,
            elapsed_secs: 0,
        });
        info!(session = id, "recording started");
        Ok(())
    }

    /// Drop the recording without sending anything. Returns whether a
    /// session was active.
    pub fn cancel(&self) -> bool {
        let Some(mut session) = self.inner.state.lock().session.take() else {
            return false;
        };
        session.ticker.abort();
        session.collector.abort();
        session.control.release();
        self.inner.status.send_replace(RecorderStatus::default());
        info!(session = session.id, "recording cancelled");
        true
    }

    /// Stop capture, collect the final flush and send the recording unless
    /// it is below the minimum size.
    pub async fn stop_and_send(&self) -> Result<RecordingOutcome> {
        let session = self.inner.state.lock().session.take();
        let session = session.ok_or(ValidationError::NotRecording)?;
        finish(&self.inner, session).await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(mut session) = self.state.get_mut().session.take() {
            session.ticker.abort();
            session.collector.abort();
            session.control.release();
        }
    }
}

async fn tick(weak: Weak<Inner>, id: u64) {
    let second = Duration::from_secs(1);
    let mut interval = time::interval_at(Instant::now() + second, second);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let elapsed = {
            let st = inner.state.lock();
            match st.session.as_ref() {
                Some(s) if s.id == id => s.started.elapsed(),
                _ => return,
            }
        };
        inner.status.send_replace(RecorderStatus {
            recording: true,
            elapsed_secs: elapsed.as_secs() as u32,
        });
        if elapsed >= inner.settings.ceiling {
            info!(session = id, "recording ceiling reached");
            // Finishing aborts this ticker, so it runs on its own task.
            tokio::spawn(async move {
                let session = {
                    let mut st = inner.state.lock();
                    match st.session.as_ref() {
                        Some(s) if s.id == id => st.session.take(),
                        _ => None,
                    }
                };
                if let Some(session) = session {
                    if let Err(e) = finish(&inner, session).await {
                        warn!(session = id, error = %e, "automatic send failed");
                    }
                }
            });
            return;
        }
    }
}

async fn finish(inner: &Inner, session: Session) -> Result<RecordingOutcome> {
    let Session {
        id,
        target,
        started,
        mut control,
        buffer,
        mut collector,
        ticker,
    } = session;
    ticker.abort();
    let elapsed = started.elapsed();
    control.stop();
    if time::timeout(inner.settings.flush_timeout, &mut collector)
        .await
        .is_err()
    {
        warn!(session = id, "microphone did not flush in time");
        collector.abort();
    }
    control.release();
    inner.status.send_replace(RecorderStatus::default());

    let encoded = std::mem::take(&mut *buffer.lock()).freeze();
    if encoded.len() < inner.settings.min_bytes {
        debug!(
            session = id,
            bytes = encoded.len(),
            "recording below minimum size, discarded"
        );
        return Ok(RecordingOutcome::Discarded {
            bytes: encoded.len(),
        });
    }
    let ceiling = inner.settings.ceiling.as_secs() as u32;
    let duration_secs = (elapsed.as_secs_f64().round() as u32).min(ceiling);
    info!(session = id, bytes = encoded.len(), duration_secs, "sending recording");
    let message = inner
        .sink
        .send_voice(target.as_deref(), encoded, duration_secs)
        .await?;
    Ok(RecordingOutcome::Sent {
        message,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{MockMicrophone, RecordingSink};
    use crate::error::{AudioError, ChatError};

    fn recorder(chunk: usize) -> (Arc<MockMicrophone>, Arc<RecordingSink>, VoiceRecorder) {
        let mic = Arc::new(MockMicrophone::new(chunk, Duration::from_millis(250)));
        let sink = Arc::new(RecordingSink::default());
        let rec = VoiceRecorder::new(mic.clone(), sink.clone(), RecorderSettings::default());
        (mic, sink, rec)
    }

    #[tokio::test(start_paused = true)]
    async fn stop_sends_rounded_duration() {
        let (mic, sink, rec) = recorder(400);
        rec.start().await.unwrap();
        time::sleep(Duration::from_millis(4600)).await;
        assert_eq!(rec.status().elapsed_secs, 4);

        let outcome = rec.stop_and_send().await.unwrap();
        let RecordingOutcome::Sent { duration_secs, .. } = outcome else {
            panic!("expected a sent recording, got {outcome:?}");
        };
        assert_eq!(duration_secs, 5);
        // 18 periodic chunks plus the final half-chunk flush.
        assert_eq!(sink.sent(), [(18 * 400 + 200, 5)]);
        assert!(mic.is_idle());
        assert!(!rec.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn short_tap_is_discarded() {
        let (mic, sink, rec) = recorder(400);
        rec.start().await.unwrap();
        time::sleep(Duration::from_millis(600)).await;
        let outcome = rec.stop_and_send().await.unwrap();
        assert_eq!(outcome, RecordingOutcome::Discarded { bytes: 1000 });
        assert!(sink.sent().is_empty());
        assert!(mic.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_auto_sends_with_full_duration() {
        let (mic, sink, rec) = recorder(400);
        rec.start().await.unwrap();
        time::sleep(Duration::from_secs(70)).await;
        assert!(!rec.is_recording());
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, 60);
        assert!(mic.is_idle());
        assert!(matches!(
            rec.stop_and_send().await,
            Err(ChatError::Validation(ValidationError::NotRecording))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let (mic, _sink, rec) = recorder(400);
        rec.start().await.unwrap();
        assert!(matches!(
            rec.start().await,
            Err(ChatError::Validation(ValidationError::RecordingActive))
        ));
        assert_eq!(mic.opened(), 1);
        rec.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_without_sending() {
        let (mic, sink, rec) = recorder(4000);
        rec.start().await.unwrap();
        time::sleep(Duration::from_secs(3)).await;
        assert!(rec.cancel());
        assert!(!rec.cancel());
        time::sleep(Duration::from_secs(120)).await;
        assert!(sink.sent().is_empty());
        assert!(mic.is_idle());
        assert_eq!(rec.status(), RecorderStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_microphone_fails_start() {
        let (mic, _sink, rec) = recorder(400);
        mic.set_unavailable(true);
        assert!(matches!(
            rec.start().await,
            Err(ChatError::Audio(AudioError::Microphone(_)))
        ));
        assert!(!rec.is_recording());
    }
}
