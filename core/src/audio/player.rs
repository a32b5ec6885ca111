use std::sync::{Arc, Weak};

use bytes::Bytes;
use chat_api::AudioAttachment;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::download::{fetch_with_progress, DEFAULT_ASSUMED_BYTES_PER_SEC};
use super::{FrameClock, PlaybackBackend, PlaybackHandle};
use crate::error::{AudioError, ChatError, Result, ValidationError};
use crate::transport::ConversationTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Idle,
    Downloading,
    Ready,
    Playing,
    Paused,
}

impl PlayerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerSnapshot {
    pub state: PlayerState,
    /// Downloaded fraction in `[0, 1]`.
    pub downloaded: f64,
    /// Played fraction in `[0, 1]`.
    pub played: f64,
    pub elapsed_secs: f64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSettings {
    /// Bitrate used to estimate download progress when the length is unknown.
    pub assumed_bytes_per_sec: u64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            assumed_bytes_per_sec: DEFAULT_ASSUMED_BYTES_PER_SEC,
        }
    }
}

#[derive(Default)]
struct Core {
    snapshot: PlayerSnapshot,
    buffer: Option<Bytes>,
    handle: Option<Arc<dyn PlaybackHandle>>,
    sampler: Option<JoinHandle<()>>,
    download: Option<CancellationToken>,
    /// Bumped by teardown so late download results are ignored.
    generation: u64,
}

struct Inner {
    transport: Arc<dyn ConversationTransport>,
    backend: Arc<dyn PlaybackBackend>,
    clock: Arc<dyn FrameClock>,
    attachment: AudioAttachment,
    settings: PlayerSettings,
    core: Mutex<Core>,
    watch: watch::Sender<PlayerSnapshot>,
}

enum Step {
    Download(CancellationToken, u64),
    Play,
    Pause,
    Wait,
}

/// Playback controller for one voice attachment.
///
/// `activate` is the single user gesture: it downloads an idle track, plays
/// a ready or paused one and pauses a playing one.
#[derive(Clone)]
pub struct VoicePlayer {
    inner: Arc<Inner>,
}

impl VoicePlayer {
    pub fn new(
        transport: Arc<dyn ConversationTransport>,
        backend: Arc<dyn PlaybackBackend>,
        clock: Arc<dyn FrameClock>,
        attachment: AudioAttachment,
        settings: PlayerSettings,
    ) -> Self {
        let snapshot = PlayerSnapshot {
            duration_secs: attachment.duration_secs as f64,
            ..Default::default()
        };
        let (watch, _) = watch::channel(snapshot);
        Self {
            inner: Arc::new(Inner {
                transport,
                backend,
                clock,
                attachment,
                settings,
                core: Mutex::new(Core {
                    snapshot,
                    ..Default::default()
                }),
                watch,
            }),
        }
    }

    pub fn attachment(&self) -> &AudioAttachment {
        &self.inner.attachment
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.inner.core.lock().snapshot
    }

    pub fn state(&self) -> PlayerState {
        self.snapshot().state
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.inner.watch.subscribe()
    }

    /// Advance the state machine by one user gesture and return the new
    /// state. Downloading runs to completion inside this call.
    pub async fn activate(&self) -> Result<PlayerState> {
        let step = {
            let mut core = self.inner.core.lock();
            match core.snapshot.state {
                PlayerState::Idle => {
                    let token = CancellationToken::new();
                    core.download = Some(token.clone());
                    core.snapshot.state = PlayerState::Downloading;
                    core.snapshot.downloaded = 0.0;
                    self.inner.publish(&core);
                    Step::Download(token, core.generation)
                }
                PlayerState::Downloading => Step::Wait,
                PlayerState::Ready | PlayerState::Paused => Step::Play,
                PlayerState::Playing => Step::Pause,
            }
        };
        match step {
            Step::Download(token, generation) => self.download(token, generation).await?,
            Step::Play => self.play()?,
            Step::Pause => self.pause(),
            Step::Wait => {}
        }
        Ok(self.state())
    }

    async fn download(&self, token: CancellationToken, generation: u64) -> Result<()> {
        let inner = &self.inner;
        let loaded = async {
            let progress_target = Arc::downgrade(inner);
            let bytes = fetch_with_progress(
                inner.transport.as_ref(),
                &inner.attachment.url,
                inner.attachment.duration_secs,
                inner.settings.assumed_bytes_per_sec,
                &token,
                move |fraction| {
                    if let Some(inner) = progress_target.upgrade() {
                        inner.set_downloaded(generation, fraction);
                    }
                },
            )
            .await?;
            let handle = inner.backend.load(bytes.clone()).await?;
            tokio::select! {
                _ = token.cancelled() => {
                    handle.stop();
                    return Err(ChatError::from(AudioError::Cancelled));
                }
                ready = handle.wait_playable() => ready?,
            }
            Ok::<_, ChatError>((bytes, handle))
        }
        .await;

        let mut core = inner.core.lock();
        if core.generation != generation {
            if let Ok((_, handle)) = &loaded {
                handle.stop();
            }
            return Err(AudioError::Cancelled.into());
        }
        core.download = None;
        match loaded {
            Ok((bytes, handle)) => {
                if let Some(secs) = handle.duration().filter(|d| *d > 0.0) {
                    core.snapshot.duration_secs = secs;
                }
                core.buffer = Some(bytes);
                core.handle = Some(handle);
                core.snapshot.state = PlayerState::Ready;
                core.snapshot.downloaded = 1.0;
                inner.publish(&core);
                debug!(url = %inner.attachment.url, "voice message ready");
                Ok(())
            }
            Err(e) => {
                warn!(url = %inner.attachment.url, error = %e, "voice message unavailable");
                core.snapshot.state = PlayerState::Idle;
                core.snapshot.downloaded = 0.0;
                inner.publish(&core);
                Err(e)
            }
        }
    }

    fn play(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        let handle = core
            .handle
            .clone()
            .ok_or(ValidationError::PlayerState(core.snapshot.state.as_str()))?;
        handle.play()?;
        core.snapshot.state = PlayerState::Playing;
        if let Some(old) = core.sampler.take() {
            old.abort();
        }
        core.sampler = Some(tokio::spawn(sample(
            Arc::downgrade(&self.inner),
            self.inner.clock.clone(),
        )));
        self.inner.publish(&core);
        Ok(())
    }

    fn pause(&self) {
        let mut core = self.inner.core.lock();
        if let Some(sampler) = core.sampler.take() {
            sampler.abort();
        }
        if let Some(handle) = core.handle.clone() {
            handle.pause();
            let position = handle.position();
            core.set_position(position);
        }
        core.snapshot.state = PlayerState::Paused;
        self.inner.publish(&core);
    }

    /// Jump to `ratio` of the track. Only valid once the track is loaded.
    pub fn seek(&self, ratio: f64) -> Result<()> {
        let mut core = self.inner.core.lock();
        let state = core.snapshot.state;
        let handle = match (state, core.handle.clone()) {
            (PlayerState::Ready | PlayerState::Playing | PlayerState::Paused, Some(h)) => h,
            _ => return Err(ValidationError::PlayerState(state.as_str()).into()),
        };
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        let secs = ratio * core.snapshot.duration_secs;
        handle.seek(secs);
        core.set_position(secs);
        self.inner.publish(&core);
        Ok(())
    }

    /// Release everything: sampler first, then the buffer, then the handle.
    /// Also cancels a download in progress.
    pub fn teardown(&self) {
        let mut core = self.inner.core.lock();
        core.release();
        self.inner.publish(&core);
    }
}

impl Core {
    fn set_position(&mut self, secs: f64) {
        let duration = self.snapshot.duration_secs;
        self.snapshot.elapsed_secs = secs;
        self.snapshot.played = if duration > 0.0 {
            (secs / duration).clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    fn release(&mut self) {
        self.generation += 1;
        if let Some(token) = self.download.take() {
            token.cancel();
        }
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        self.buffer = None;
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
        self.snapshot.state = PlayerState::Idle;
        self.snapshot.downloaded = 0.0;
        self.set_position(0.0);
    }
}

impl Inner {
    fn publish(&self, core: &Core) {
        self.watch.send_replace(core.snapshot);
    }

    fn set_downloaded(&self, generation: u64, fraction: f64) {
        let mut core = self.core.lock();
        if core.generation != generation || core.snapshot.state != PlayerState::Downloading {
            return;
        }
        core.snapshot.downloaded = fraction;
        self.publish(&core);
    }

    /// One sampler step. Returns false when sampling should stop.
    fn sample(&self) -> bool {
        let mut core = self.core.lock();
        if core.snapshot.state != PlayerState::Playing {
            return false;
        }
        let Some(handle) = core.handle.clone() else {
            return false;
        };
        if handle.is_ended() {
            handle.pause();
            handle.seek(0.0);
            core.sampler = None;
            core.snapshot.state = PlayerState::Ready;
            core.set_position(0.0);
            self.publish(&core);
            return false;
        }
        core.set_position(handle.position());
        self.publish(&core);
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core.get_mut().release();
    }
}

async fn sample(weak: Weak<Inner>, clock: Arc<dyn FrameClock>) {
    loop {
        clock.next_frame().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.sample() {
            return;
        }
    }
}
