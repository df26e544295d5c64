//! Sequence-numbered audio segments for one listening turn.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// One buffered segment of microphone audio.
///
/// `seq` starts at 0 for every listening turn and increases by one per chunk.
/// Raw audio never reaches the conversation log; chunks only travel to the
/// transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub turn: u64,
    pub seq: u64,
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn new(turn: u64, seq: u64, samples: Vec<i16>) -> Self {
        Self { turn, seq, samples }
    }

    /// Little-endian 16-bit PCM bytes.
    pub fn pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Base64 of [`pcm_bytes`](Self::pcm_bytes), as carried in `audio` frames.
    pub fn encode_base64(&self) -> String {
        BASE64.encode(self.pcm_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_bytes_are_little_endian() {
        let chunk = AudioChunk::new(1, 0, vec![1, -1]);
        assert_eq!(chunk.pcm_bytes(), vec![0x01, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_base64_encoding() {
        let chunk = AudioChunk::new(1, 0, vec![1, -1]);
        assert_eq!(chunk.encode_base64(), "AQD//w==");
    }
}
