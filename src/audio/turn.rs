//! Listening turns: microphone ownership and the capture loop.
//!
//! A [`CaptureUnit`] holds the device for exactly one turn at a time. The device
//! is opened on `start_turn` and released by the capture loop before the loop's
//! task finishes, whether the turn ended normally, was aborted, or the device
//! failed.

use crate::audio::chunk::AudioChunk;
use crate::audio::recorder::{AudioSource, DeviceProvider};
use crate::config::AudioConfig;
use crate::defaults;
use crate::error::{Result, VoiceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing and buffering for the capture loop.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub chunk_interval: Duration,
    pub acquire_timeout: Duration,
    pub buffer: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunk_interval: Duration::from_millis(defaults::CHUNK_MS),
            acquire_timeout: Duration::from_millis(defaults::ACQUIRE_TIMEOUT_MS),
            buffer: defaults::CAPTURE_BUFFER,
        }
    }
}

impl From<&AudioConfig> for CaptureSettings {
    fn from(config: &AudioConfig) -> Self {
        Self {
            chunk_interval: config.chunk_interval(),
            acquire_timeout: config.acquire_timeout(),
            ..Self::default()
        }
    }
}

/// Output of the capture loop.
#[derive(Debug)]
pub enum CaptureEvent {
    Chunk(AudioChunk),
    /// The device failed mid-turn. It has already been released.
    DeviceLost(VoiceError),
    /// The loop stopped without being asked to.
    Ended,
}

/// Result of checking an incoming chunk against the expected sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// Chunks `[from, to)` never arrived.
    Gap { from: u64, to: u64 },
    /// Chunk belongs to a turn that is no longer active.
    Stale,
}

/// Events still queued when a turn was finalised.
#[derive(Debug)]
pub struct TurnTail {
    pub turn: u64,
    pub events: Vec<CaptureEvent>,
}

struct ListeningTurn {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    events: mpsc::Receiver<CaptureEvent>,
    next_seq: u64,
    delivered: u64,
}

/// The audio capture unit of a session.
pub struct CaptureUnit {
    devices: Arc<dyn DeviceProvider>,
    settings: CaptureSettings,
    turn: Option<ListeningTurn>,
    turns_started: u64,
}

impl CaptureUnit {
    pub fn new(devices: Arc<dyn DeviceProvider>, settings: CaptureSettings) -> Self {
        Self {
            devices,
            settings,
            turn: None,
            turns_started: 0,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.turn.is_some()
    }

    pub fn current_turn(&self) -> Option<u64> {
        self.turn.as_ref().map(|t| t.id)
    }

    pub fn device_description(&self) -> String {
        self.devices.describe()
    }

    /// Chunks handed to the transport in the current turn.
    pub fn delivered(&self) -> u64 {
        self.turn.as_ref().map(|t| t.delivered).unwrap_or(0)
    }

    /// Acquire the microphone and start a new turn.
    ///
    /// If a turn is already running its id is returned and nothing is acquired.
    pub async fn start_turn(&mut self) -> Result<u64> {
        if let Some(turn) = &self.turn {
            debug!(turn = turn.id, "listening turn already active");
            return Ok(turn.id);
        }
        let source = self.acquisition().await?;
        Ok(self.begin_turn(source))
    }

    /// Open and start the device off the async runtime, bounded by the
    /// acquire timeout. The returned future owns everything it needs, so the
    /// caller can run it as a task and abort it.
    pub fn acquisition(
        &self,
    ) -> impl Future<Output = Result<Box<dyn AudioSource>>> + Send + 'static {
        let devices = Arc::clone(&self.devices);
        let limit = self.settings.acquire_timeout;
        async move {
            let acquire = tokio::task::spawn_blocking(move || {
                let mut source = devices.open()?;
                source.start()?;
                Ok::<_, VoiceError>(source)
            });

            // A source acquired after the timeout is dropped with the blocking
            // task's output, which releases the device.
            match tokio::time::timeout(limit, acquire).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(VoiceError::device(format!("device task failed: {}", e))),
                Err(_) => Err(VoiceError::device(format!(
                    "microphone did not start within {}ms",
                    limit.as_millis()
                ))),
            }
        }
    }

    /// Start a turn on an already acquired source.
    ///
    /// If a turn is already running the source is released and the running
    /// turn's id is returned.
    pub fn begin_turn(&mut self, mut source: Box<dyn AudioSource>) -> u64 {
        if let Some(turn) = &self.turn {
            release(turn.id, source.as_mut());
            return turn.id;
        }

        self.turns_started += 1;
        let id = self.turns_started;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.settings.buffer.max(1));
        let task = tokio::spawn(run_capture_loop(
            id,
            source,
            tx,
            cancel.clone(),
            self.settings.chunk_interval,
        ));

        info!(turn = id, device = %self.devices.describe(), "listening turn started");
        self.turn = Some(ListeningTurn {
            id,
            cancel,
            task: Some(task),
            events: rx,
            next_seq: 0,
            delivered: 0,
        });
        id
    }

    /// Wait for the next capture event. Never resolves while idle.
    pub async fn next_event(&mut self) -> CaptureEvent {
        match self.turn.as_mut() {
            Some(turn) => turn.events.recv().await.unwrap_or(CaptureEvent::Ended),
            None => std::future::pending().await,
        }
    }

    /// Validate a chunk's position in the current turn and count it as delivered.
    pub fn accept(&mut self, chunk: &AudioChunk) -> SequenceCheck {
        let Some(turn) = self.turn.as_mut() else {
            return SequenceCheck::Stale;
        };
        if chunk.turn != turn.id || chunk.seq < turn.next_seq {
            return SequenceCheck::Stale;
        }

        let expected = turn.next_seq;
        turn.next_seq = chunk.seq + 1;
        turn.delivered += 1;
        if chunk.seq == expected {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap {
                from: expected,
                to: chunk.seq,
            }
        }
    }

    /// Stop the turn, release the device, and return everything still queued.
    ///
    /// The capture loop flushes its last partial segment before exiting, so the
    /// returned tail holds the end of the utterance. The turn stays current so
    /// the tail can still go through [`accept`](Self::accept); call
    /// [`close_turn`](Self::close_turn) once it has been forwarded.
    pub async fn finish_turn(&mut self) -> Option<TurnTail> {
        let turn = self.turn.as_mut()?;
        turn.cancel.cancel();

        let mut events = Vec::new();
        while let Some(event) = turn.events.recv().await {
            events.push(event);
        }
        if let Some(task) = turn.task.take()
            && let Err(e) = task.await
        {
            warn!(turn = turn.id, error = %e, "capture task did not exit cleanly");
        }

        info!(turn = turn.id, "listening turn finished");
        Some(TurnTail {
            turn: turn.id,
            events,
        })
    }

    /// Forget the finished turn. Returns the number of chunks delivered.
    pub fn close_turn(&mut self) -> Option<u64> {
        let turn = self.turn.take()?;
        if let Some(task) = turn.task {
            turn.cancel.cancel();
            task.abort();
        }
        Some(turn.delivered)
    }

    /// Stop the turn and release the device, discarding anything queued.
    pub async fn abort_turn(&mut self) -> Option<u64> {
        let turn = self.turn.take()?;
        turn.cancel.cancel();
        drop(turn.events);
        if let Some(task) = turn.task
            && let Err(e) = task.await
        {
            warn!(turn = turn.id, error = %e, "capture task did not exit cleanly");
        }
        info!(turn = turn.id, "listening turn aborted");
        Some(turn.id)
    }
}

/// Poll the source every `interval` and forward non-empty segments.
async fn run_capture_loop(
    turn: u64,
    mut source: Box<dyn AudioSource>,
    tx: mpsc::Sender<CaptureEvent>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match source.read_samples() {
                    Ok(samples) if samples.is_empty() => {}
                    Ok(samples) => {
                        let chunk = AudioChunk::new(turn, seq, samples);
                        seq += 1;
                        if tx.send(CaptureEvent::Chunk(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        release(turn, source.as_mut());
                        if tx.send(CaptureEvent::DeviceLost(e)).await.is_err() {
                            debug!(turn, "device loss not delivered, turn already closed");
                        }
                        return;
                    }
                }
            }
        }
    }

    // Final partial segment of the utterance.
    if !tx.is_closed()
        && let Ok(samples) = source.read_samples()
        && !samples.is_empty()
        && tx
            .send(CaptureEvent::Chunk(AudioChunk::new(turn, seq, samples)))
            .await
            .is_err()
    {
        debug!(turn, "final segment dropped with aborted turn");
    }

    release(turn, source.as_mut());
}

fn release(turn: u64, source: &mut dyn AudioSource) {
    if let Err(e) = source.stop() {
        warn!(turn, error = %e, "failed to stop audio source cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recorder::{MockAudioSource, MockDeviceProvider};

    fn settings() -> CaptureSettings {
        CaptureSettings {
            chunk_interval: Duration::from_millis(10),
            acquire_timeout: Duration::from_secs(2),
            buffer: 8,
        }
    }

    #[tokio::test]
    async fn test_start_turn_acquires_device_once() {
        let provider = MockDeviceProvider::default();
        let mut unit = CaptureUnit::new(Arc::new(provider.clone()), settings());

        let first = unit.start_turn().await.unwrap();
        let second = unit.start_turn().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.acquisitions(), 1);
        unit.abort_turn().await;
    }

    #[tokio::test]
    async fn test_chunks_are_sequenced_from_zero() {
        let provider = MockDeviceProvider::default();
        let mut unit = CaptureUnit::new(Arc::new(provider), settings());
        let turn = unit.start_turn().await.unwrap();

        for expected in 0..3 {
            match unit.next_event().await {
                CaptureEvent::Chunk(chunk) => {
                    assert_eq!(chunk.turn, turn);
                    assert_eq!(chunk.seq, expected);
                    assert_eq!(unit.accept(&chunk), SequenceCheck::InOrder);
                }
                other => panic!("Expected chunk, got {:?}", other),
            }
        }
        assert_eq!(unit.delivered(), 3);
        unit.abort_turn().await;
    }

    #[tokio::test]
    async fn test_finish_turn_releases_device() {
        let provider = MockDeviceProvider::default();
        let mut unit = CaptureUnit::new(Arc::new(provider.clone()), settings());
        unit.start_turn().await.unwrap();

        let tail = unit.finish_turn().await.expect("turn was active");
        assert_eq!(tail.turn, 1);
        assert_eq!(provider.releases(), 1);
        assert!(unit.close_turn().is_some());
        assert!(!unit.is_listening());
    }

    #[tokio::test]
    async fn test_abort_turn_releases_device() {
        let provider = MockDeviceProvider::default();
        let mut unit = CaptureUnit::new(Arc::new(provider.clone()), settings());
        unit.start_turn().await.unwrap();

        assert_eq!(unit.abort_turn().await, Some(1));
        assert_eq!(provider.releases(), 1);
        assert!(!unit.is_listening());
        assert_eq!(unit.abort_turn().await, None);
    }

    #[tokio::test]
    async fn test_begin_turn_while_listening_releases_extra_source() {
        let provider = MockDeviceProvider::default();
        let mut unit = CaptureUnit::new(Arc::new(provider.clone()), settings());
        let first = unit.start_turn().await.unwrap();

        let extra = unit.acquisition().await.unwrap();
        assert_eq!(unit.begin_turn(extra), first);
        assert_eq!(provider.releases(), 1);
        unit.abort_turn().await;
        assert_eq!(provider.releases(), 2);
    }

    #[tokio::test]
    async fn test_acquire_failure_leaves_unit_idle() {
        let mut unit = CaptureUnit::new(Arc::new(MockDeviceProvider::unavailable()), settings());
        let result = unit.start_turn().await;
        assert!(matches!(result, Err(VoiceError::Device { .. })));
        assert!(!unit.is_listening());
    }

    #[tokio::test]
    async fn test_start_failure_is_device_error() {
        let provider = MockDeviceProvider::new(MockAudioSource::new().with_start_failure());
        let mut unit = CaptureUnit::new(Arc::new(provider), settings());
        assert!(matches!(
            unit.start_turn().await,
            Err(VoiceError::Device { .. })
        ));
        assert!(!unit.is_listening());
    }

    #[tokio::test]
    async fn test_device_loss_is_reported_after_release() {
        let provider = MockDeviceProvider::new(MockAudioSource::new().with_read_failure_after(1));
        let mut unit = CaptureUnit::new(Arc::new(provider.clone()), settings());
        unit.start_turn().await.unwrap();

        assert!(matches!(unit.next_event().await, CaptureEvent::Chunk(_)));
        assert!(matches!(
            unit.next_event().await,
            CaptureEvent::DeviceLost(VoiceError::Device { .. })
        ));
        assert_eq!(provider.releases(), 1);
        unit.abort_turn().await;
    }

    #[test]
    fn test_sequence_gap_detection() {
        let mut unit = CaptureUnit::new(Arc::new(MockDeviceProvider::default()), settings());
        unit.turns_started = 1;
        unit.turn = Some(ListeningTurn {
            id: 1,
            cancel: CancellationToken::new(),
            task: None,
            events: mpsc::channel(1).1,
            next_seq: 0,
            delivered: 0,
        });

        assert_eq!(
            unit.accept(&AudioChunk::new(1, 0, vec![1])),
            SequenceCheck::InOrder
        );
        assert_eq!(
            unit.accept(&AudioChunk::new(1, 3, vec![1])),
            SequenceCheck::Gap { from: 1, to: 3 }
        );
        assert_eq!(
            unit.accept(&AudioChunk::new(1, 2, vec![1])),
            SequenceCheck::Stale
        );
        assert_eq!(
            unit.accept(&AudioChunk::new(2, 4, vec![1])),
            SequenceCheck::Stale
        );
    }
}
