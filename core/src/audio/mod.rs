//! Voice message playback and capture.
//!
//! Devices sit behind the traits in this module. A real view supplies
//! platform implementations; [`mock`] provides in-memory ones.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::error::AudioError;

mod download;
pub mod mock;
mod player;
mod recorder;

pub use download::{fetch_with_progress, DownloadProgress, DEFAULT_ASSUMED_BYTES_PER_SEC};
pub use player::{PlayerSettings, PlayerSnapshot, PlayerState, VoicePlayer};
pub use recorder::{
    RecorderSettings, RecorderStatus, RecordingOutcome, VoiceRecorder, VoiceSink,
    DEFAULT_MIN_RECORDING_BYTES, DEFAULT_RECORDING_CEILING,
};

/// Decodes encoded audio into something playable.
#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    async fn load(&self, encoded: Bytes) -> Result<Arc<dyn PlaybackHandle>, AudioError>;
}

/// A loaded track. Positions are in seconds.
#[async_trait]
pub trait PlaybackHandle: Send + Sync {
    /// Resolves once the track can play through without stalling.
    async fn wait_playable(&self) -> Result<(), AudioError>;
    fn play(&self) -> Result<(), AudioError>;
    fn pause(&self);
    fn seek(&self, secs: f64);
    fn position(&self) -> f64;
    fn is_ended(&self) -> bool;
    fn stop(&self);
    /// Decoded duration, if the decoder knows it.
    fn duration(&self) -> Option<f64>;
}

/// Paces the playback progress sampler, normally aligned to repaints.
#[async_trait]
pub trait FrameClock: Send + Sync {
    async fn next_frame(&self);
}

/// Fixed-period frame clock, roughly one display frame by default.
#[derive(Debug, Clone, Copy)]
pub struct IntervalClock {
    period: Duration,
}

impl IntervalClock {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for IntervalClock {
    fn default() -> Self {
        Self::new(Duration::from_millis(16))
    }
}

#[async_trait]
impl FrameClock for IntervalClock {
    async fn next_frame(&self) {
        tokio::time::sleep(self.period).await;
    }
}

/// Source of encoded voice chunks.
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn open(&self) -> Result<CaptureHandle, AudioError>;
}

/// An open capture session.
pub struct CaptureHandle {
    /// Encoded chunks. The stream ends after the final flush that follows
    /// [`CaptureControl::stop`].
    pub chunks: mpsc::Receiver<Bytes>,
    pub control: Box<dyn CaptureControl>,
}

pub trait CaptureControl: Send {
    /// Stop capturing. The device flushes what it holds and closes the
    /// chunk stream.
    fn stop(&mut self);
    /// Give the device back. Safe to call more than once.
    fn release(&mut self);
}
