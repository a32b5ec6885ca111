use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AudioError, Result};
use crate::transport::ConversationTransport;

/// Bitrate assumed for voice objects when the service omits their length.
pub const DEFAULT_ASSUMED_BYTES_PER_SEC: u64 = 8_000;

/// Progress never reaches this value before end-of-stream when the total
/// length is unknown.
const ESTIMATE_CAP: f64 = 0.95;

/// Downloaded fraction of an audio object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    received: u64,
    total: Option<u64>,
    estimated: u64,
    finished: bool,
}

impl DownloadProgress {
    pub fn new(total: Option<u64>, declared_duration_secs: u32, bytes_per_sec: u64) -> Self {
        Self {
            received: 0,
            total,
            estimated: bytes_per_sec.saturating_mul(declared_duration_secs as u64),
            finished: false,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.received += bytes as u64;
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn fraction(&self) -> f64 {
        if self.finished {
            return 1.0;
        }
        match self.total {
            Some(0) => 0.0,
            Some(total) => (self.received as f64 / total as f64).min(1.0),
            None if self.estimated == 0 => 0.0,
            None => (self.received as f64 / self.estimated as f64).min(ESTIMATE_CAP),
        }
    }
}

/// Fetch a whole audio object, reporting the fraction after every chunk.
pub async fn fetch_with_progress<F>(
    transport: &dyn ConversationTransport,
    url: &str,
    declared_duration_secs: u32,
    bytes_per_sec: u64,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<Bytes>
where
    F: FnMut(f64) + Send,
{
    let download = tokio::select! {
        _ = cancel.cancelled() => return Err(AudioError::Cancelled.into()),
        download = transport.download_audio(url) => download?,
    };
    let mut progress =
        DownloadProgress::new(download.total_bytes, declared_duration_secs, bytes_per_sec);
    let capacity = download.total_bytes.unwrap_or(0).min(16 << 20) as usize;
    let mut buffer = BytesMut::with_capacity(capacity);
    let mut body = download.body;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(AudioError::Cancelled.into()),
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                buffer.extend_from_slice(&chunk);
                progress.record(chunk.len());
                on_progress(progress.fraction());
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    progress.finish();
    on_progress(progress.fraction());
    debug!(url, bytes = progress.received(), "audio object downloaded");
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::transport::mock::{MockAudioObject, MockTransport};

    #[test]
    fn known_length_is_exact() {
        let mut p = DownloadProgress::new(Some(1000), 10, DEFAULT_ASSUMED_BYTES_PER_SEC);
        p.record(250);
        assert_eq!(p.fraction(), 0.25);
        p.record(750);
        assert_eq!(p.fraction(), 1.0);
    }

    #[test]
    fn unknown_length_is_capped_until_end() {
        let mut p = DownloadProgress::new(None, 2, DEFAULT_ASSUMED_BYTES_PER_SEC);
        p.record(8_000);
        assert_eq!(p.fraction(), 0.5);
        p.record(100_000);
        assert_eq!(p.fraction(), 0.95);
        p.finish();
        assert_eq!(p.fraction(), 1.0);
    }

    #[test]
    fn unknown_length_without_duration_stays_at_zero() {
        let mut p = DownloadProgress::new(None, 0, DEFAULT_ASSUMED_BYTES_PER_SEC);
        p.record(500);
        assert_eq!(p.fraction(), 0.0);
    }

    #[tokio::test]
    async fn unreported_length_never_reports_complete_early() {
        let mock = MockTransport::default();
        let mut object = MockAudioObject::new(vec![1u8; 40_000]);
        object.report_length = false;
        object.chunk_size = 4_000;
        mock.add_audio_object("mock://a", object);

        let mut seen = Vec::new();
        let bytes = fetch_with_progress(
            &mock,
            "mock://a",
            2,
            DEFAULT_ASSUMED_BYTES_PER_SEC,
            &CancellationToken::new(),
            |f| seen.push(f),
        )
        .await
        .unwrap();
        assert_eq!(bytes.len(), 40_000);
        let (last, early) = seen.split_last().unwrap();
        assert_eq!(*last, 1.0);
        assert!(early.iter().all(|f| *f <= 0.95));
        assert!(early.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn broken_stream_fails() {
        let mock = MockTransport::default();
        let mut object = MockAudioObject::new(vec![1u8; 10_000]);
        object.chunk_size = 1_000;
        object.fail_after_chunks = Some(3);
        mock.add_audio_object("mock://b", object);
        let err = fetch_with_progress(
            &mock,
            "mock://b",
            5,
            DEFAULT_ASSUMED_BYTES_PER_SEC,
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChatError::Audio(AudioError::Download(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_download() {
        let mock = MockTransport::default();
        let mut object = MockAudioObject::new(vec![1u8; 10_000]);
        object.chunk_size = 1_000;
        object.chunk_delay = tokio::time::Duration::from_millis(100);
        mock.add_audio_object("mock://c", object);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
            trigger.cancel();
        });
        let err = fetch_with_progress(&mock, "mock://c", 5, 8_000, &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Audio(AudioError::Cancelled)));
    }
}
