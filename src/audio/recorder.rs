use crate::error::{Result, VoiceError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Trait for audio source devices.
///
/// This trait allows swapping implementations (real microphone vs mock).
/// Dropping a source must release the underlying device.
pub trait AudioSource: Send + Sync {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio and release the device.
    fn stop(&mut self) -> Result<()>;

    /// Take all samples buffered since the last read.
    ///
    /// # Returns
    /// 16-bit PCM samples (possibly empty), or an error if the device was lost
    fn read_samples(&mut self) -> Result<Vec<i16>>;
}

/// Opens a fresh [`AudioSource`] for each listening turn.
pub trait DeviceProvider: Send + Sync {
    /// Acquire the microphone. Called from a blocking context.
    fn open(&self) -> Result<Box<dyn AudioSource>>;

    /// Human-readable device description for status output.
    fn describe(&self) -> String;
}

/// Mock audio source for testing
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    is_started: bool,
    samples: Vec<i16>,
    should_fail_start: bool,
    fail_read_after: Option<usize>,
    reads: usize,
    error_message: String,
    stops: Arc<AtomicUsize>,
}

impl MockAudioSource {
    /// Create a new mock audio source that yields 10ms of silence per read
    pub fn new() -> Self {
        Self {
            is_started: false,
            samples: vec![0i16; 160],
            should_fail_start: false,
            fail_read_after: None,
            reads: 0,
            error_message: "mock audio error".to_string(),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configure the mock to return specific samples on every read
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to report device loss after `reads` successful reads
    pub fn with_read_failure_after(mut self, reads: usize) -> Self {
        self.fail_read_after = Some(reads);
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Check if the audio source is started
    pub fn is_started(&self) -> bool {
        self.is_started
    }

    /// Number of times `stop()` has been called on this source or its clones
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            Err(VoiceError::device(self.error_message.clone()))
        } else {
            self.is_started = true;
            Ok(())
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if let Some(limit) = self.fail_read_after
            && self.reads >= limit
        {
            return Err(VoiceError::device(self.error_message.clone()));
        }
        self.reads += 1;
        Ok(self.samples.clone())
    }
}

/// Device provider handing out clones of a template [`MockAudioSource`].
///
/// Counts acquisitions so tests can assert the microphone was opened exactly once.
#[derive(Debug, Clone)]
pub struct MockDeviceProvider {
    template: MockAudioSource,
    acquisitions: Arc<AtomicUsize>,
    unavailable: bool,
}

impl MockDeviceProvider {
    pub fn new(template: MockAudioSource) -> Self {
        Self {
            template,
            acquisitions: Arc::new(AtomicUsize::new(0)),
            unavailable: false,
        }
    }

    /// Simulate a missing microphone or revoked permission.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(MockAudioSource::new())
        }
    }

    /// Number of successful `open()` calls so far
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of times any handed-out source was stopped
    pub fn releases(&self) -> usize {
        self.template.stop_count()
    }
}

impl Default for MockDeviceProvider {
    fn default() -> Self {
        Self::new(MockAudioSource::new())
    }
}

impl DeviceProvider for MockDeviceProvider {
    fn open(&self) -> Result<Box<dyn AudioSource>> {
        if self.unavailable {
            return Err(VoiceError::device("no input device (mock)"));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.template.clone()))
    }

    fn describe(&self) -> String {
        "mock microphone".to_string()
    }
}
