//! Microphone capture for listening turns.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod chunk;
pub mod recorder;
pub mod turn;
