//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::recorder::{AudioSource, DeviceProvider};
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL probing makes ALSA/JACK print harmless but alarming noise.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` on fd 2. Safe as long as no other thread is
/// concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Keep JACK from trying to start a server while CPAL enumerates backends.
///
/// # Safety
/// Modifies environment variables; call at startup before threads are spawned.
pub fn suppress_audio_warnings() {
    // SAFETY: called from main before the runtime spawns worker threads
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
    }
}

/// Preferred device names for desktop PipeWire/PulseAudio setups.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never microphones.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

/// How long to wait for the first data callback before falling back to the
/// device's native format.
const FIRST_CALLBACK_GRACE: Duration = Duration::from_millis(200);

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List usable input devices, marking preferred ones with "\[recommended\]".
pub fn list_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let _host = host; // keep host alive while iterating devices
    let devices =
        devices.map_err(|e| VoiceError::device(format!("failed to enumerate input devices: {}", e)))?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Find the named input device, or the best default (PipeWire, then Pulse,
/// then the host default).
fn find_device(device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::device(format!("failed to enumerate devices: {}", e)))?;

        let mut preferred = None;
        for device in devices {
            let Ok(name) = device.name() else { continue };
            match device_name {
                Some(wanted) if name == wanted => return Ok(device),
                None if preferred.is_none() && is_preferred_device(&name) => {
                    preferred = Some(device);
                }
                _ => {}
            }
        }

        if let Some(wanted) = device_name {
            return Err(VoiceError::device(format!("input device '{}' not found", wanted)));
        }

        preferred
            .or_else(|| host.default_input_device())
            .ok_or_else(|| VoiceError::device("no input device available"))
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through the Mutex in `CpalAudioSource`.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Shared between the CPAL callback thread and the capture loop.
#[derive(Default)]
struct CaptureShared {
    buffer: Mutex<Vec<i16>>,
    callbacks: AtomicU64,
    stream_error: Mutex<Option<String>>,
}

impl CaptureShared {
    fn push(&self, samples: &[i16]) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut buf) = self.buffer.lock() {
            buf.extend_from_slice(samples);
        }
    }

    fn fail(&self, message: String) {
        tracing::warn!(error = %message, "audio stream error");
        if let Ok(mut slot) = self.stream_error.lock() {
            slot.get_or_insert(message);
        }
    }
}

/// Microphone source producing 16-bit mono PCM at the configured rate.
///
/// Tries i16 at the target rate, then f32 at the target rate, then the device's
/// native config with software downmix and resampling. A stream error after
/// start is reported by the next `read_samples()` as a device error.
pub struct CpalAudioSource {
    device: cpal::Device,
    stream: Mutex<Option<SendableStream>>,
    shared: Arc<CaptureShared>,
    sample_rate: u32,
}

impl CpalAudioSource {
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        Ok(Self {
            device: find_device(device_name)?,
            stream: Mutex::new(None),
            shared: Arc::new(CaptureShared::default()),
            sample_rate,
        })
    }

    fn error_callback(&self) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let shared = Arc::clone(&self.shared);
        move |err| shared.fail(err.to_string())
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::clone(&self.shared);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| shared.push(data),
            self.error_callback(),
            None,
        ) {
            return Ok(stream);
        }

        let shared = Arc::clone(&self.shared);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                shared.push(&converted);
            },
            self.error_callback(),
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Capture at the device's default config and convert in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config = self
            .device
            .default_input_config()
            .map_err(|e| VoiceError::device(format!("failed to query input config: {}", e)))?;

        let native_rate = default_config.sample_rate();
        let channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            channels,
            native_rate,
            format = ?default_config.sample_format(),
            "using native audio format with software conversion"
        );

        let shared = Arc::clone(&self.shared);
        let result = match default_config.sample_format() {
            SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    shared.push(&to_mono(data, channels, native_rate, target_rate));
                },
                self.error_callback(),
                None,
            ),
            SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let pcm: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                    shared.push(&to_mono(&pcm, channels, native_rate, target_rate));
                },
                self.error_callback(),
                None,
            ),
            fmt => {
                return Err(VoiceError::device(format!(
                    "unsupported native sample format {:?}; pick another device",
                    fmt
                )));
            }
        };

        result.map_err(|e| VoiceError::device(format!("failed to build input stream: {}", e)))
    }

    fn lock_stream(&self) -> Result<std::sync::MutexGuard<'_, Option<SendableStream>>> {
        self.stream
            .lock()
            .map_err(|e| VoiceError::device(format!("stream lock poisoned: {}", e)))
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Downmix interleaved frames to mono and resample by linear interpolation.
fn to_mono(samples: &[i16], channels: usize, source_rate: u32, target_rate: u32) -> Vec<i16> {
    let mono: Vec<i16> = if channels <= 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    if source_rate == target_rate || mono.is_empty() {
        return mono;
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = (mono.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let a = mono[idx] as f64;
            let b = mono.get(idx + 1).copied().unwrap_or(mono[idx]) as f64;
            (a + (b - a) * frac) as i16
        })
        .collect()
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.lock_stream()?.is_some() {
            return Ok(());
        }

        let stream = self.build_stream()?;
        stream
            .play()
            .map_err(|e| VoiceError::device(format!("failed to start audio stream: {}", e)))?;

        // Some PipeWire-ALSA setups accept a non-native config but never call back.
        std::thread::sleep(FIRST_CALLBACK_GRACE);

        let stream = if self.shared.callbacks.load(Ordering::Relaxed) == 0 {
            drop(stream);
            if let Ok(mut buf) = self.shared.buffer.lock() {
                buf.clear();
            }
            let native = self.build_stream_native()?;
            native.play().map_err(|e| {
                VoiceError::device(format!("failed to start native audio stream: {}", e))
            })?;
            native
        } else {
            stream
        };

        *self.lock_stream()? = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.lock_stream()?.take() {
            stream
                .0
                .pause()
                .map_err(|e| VoiceError::device(format!("failed to stop audio stream: {}", e)))?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if let Ok(slot) = self.shared.stream_error.lock()
            && let Some(message) = slot.as_ref()
        {
            return Err(VoiceError::device(message.clone()));
        }

        let mut buffer = self
            .shared
            .buffer
            .lock()
            .map_err(|e| VoiceError::device(format!("audio buffer lock poisoned: {}", e)))?;
        Ok(std::mem::take(&mut *buffer))
    }
}

/// Opens the configured CPAL input device at the start of every listening turn.
#[derive(Debug, Clone)]
pub struct CpalDeviceProvider {
    device_name: Option<String>,
    sample_rate: u32,
}

impl CpalDeviceProvider {
    pub fn new(device_name: Option<String>, sample_rate: u32) -> Self {
        Self {
            device_name,
            sample_rate,
        }
    }
}

impl DeviceProvider for CpalDeviceProvider {
    fn open(&self) -> Result<Box<dyn AudioSource>> {
        let source = CpalAudioSource::new(self.device_name.as_deref(), self.sample_rate)?;
        Ok(Box::new(source))
    }

    fn describe(&self) -> String {
        match &self.device_name {
            Some(name) => format!("{} @ {}Hz", name, self.sample_rate),
            None => format!("default input @ {}Hz", self.sample_rate),
        }
    }
}
