//! Default configuration constants for medvoice.
//!
//! Shared between the config types and the session so that a session built
//! without a config file behaves the same as one built from an empty file.

/// Default backend endpoint.
pub const BACKEND_URL: &str = "ws://127.0.0.1:8787/voice";

/// Upper bound on `connect()` before the session gives up and enters `Error`.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on waiting for the backend to confirm or reject a transfer.
pub const TRANSFER_TIMEOUT_MS: u64 = 8_000;

/// Upper bound on writing one frame to the backend.
pub const SEND_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on the close handshake before the connection is dropped.
pub const CLOSE_TIMEOUT_MS: u64 = 1_000;

/// Consecutive failed connects tolerated before `Error` falls back to `Disconnected`.
pub const ERROR_RETRY_BUDGET: u32 = 3;

/// Default audio sample rate in Hz.
///
/// 16kHz is what the backend speech recognizer expects.
pub const SAMPLE_RATE: u32 = 16000;

/// Time slice between audio chunk boundaries in milliseconds.
pub const CHUNK_MS: u64 = 250;

/// Upper bound on opening and starting the microphone.
pub const ACQUIRE_TIMEOUT_MS: u64 = 3_000;

/// Inbound frames buffered between the transport reader and the session.
pub const INBOUND_BUFFER: usize = 64;

/// Audio chunks buffered between the capture loop and the session.
pub const CAPTURE_BUFFER: usize = 32;

/// Session commands buffered before callers wait.
pub const COMMAND_BUFFER: usize = 16;

/// Conversation events retained for slow subscribers before they lag.
pub const EVENT_FEED_CAPACITY: usize = 256;

/// Default log level when neither `RUST_LOG` nor the config sets one.
pub const LOG_LEVEL: &str = "info";
