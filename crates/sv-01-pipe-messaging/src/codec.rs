//! # Frame Codec
//!
//! ```text
//! frame := u16_be(len(payload)) ++ payload
//! ```
//!
//! Payloads are UTF-8: either a bare string (the session type, the
//! authentication lines) or a JSON document.

use crate::error::FrameError;

/// Size of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 2;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Encode one frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        max: MAX_PAYLOAD_LEN,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reassembles frames from arbitrarily split chunks.
///
/// `buffer` only ever holds bytes not yet attributed to a completed frame.
/// `payload_len` is `Some` exactly when the prefix of the next frame has
/// been consumed. `failed` holds an error found after good frames that were
/// already handed out.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    payload_len: Option<usize>,
    failed: Option<FrameError>,
}

impl FrameAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return every frame it completes, in order.
    ///
    /// A bad frame ends assembly. Good frames ahead of it in the same chunk
    /// are still returned and the error is kept for [`take_error`]; every
    /// later push fails with it. The caller closes the stream.
    ///
    /// [`take_error`]: FrameAssembler::take_error
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let len = match self.payload_len {
                Some(len) => len,
                None if self.buffer.len() >= LENGTH_PREFIX_BYTES => {
                    let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
                    self.buffer.drain(..LENGTH_PREFIX_BYTES);
                    self.payload_len = Some(len);
                    len
                }
                None => break,
            };

            if self.buffer.len() < len {
                break;
            }

            let payload: Vec<u8> = self.buffer.drain(..len).collect();
            self.payload_len = None;
            match String::from_utf8(payload) {
                Ok(frame) => frames.push(frame),
                Err(_) if frames.is_empty() => {
                    self.failed = Some(FrameError::InvalidUtf8);
                    return Err(FrameError::InvalidUtf8);
                }
                Err(_) => {
                    self.failed = Some(FrameError::InvalidUtf8);
                    break;
                }
            }
        }

        Ok(frames)
    }

    /// The error that ended assembly after some good frames, if any.
    pub fn take_error(&mut self) -> Option<FrameError> {
        self.failed.take()
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn encode_all(messages: &[&str]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| encode_frame(m.as_bytes()).unwrap())
            .collect()
    }

    #[test]
    fn test_encode_prefix_is_big_endian() {
        let frame = encode_frame(&[0u8; 0x0102]).unwrap();
        assert_eq!(&frame[..2], &[0x01, 0x02]);
        assert_eq!(frame.len(), 0x0102 + 2);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![b'x'; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode_frame(&payload),
            Err(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN
            })
        );
        assert!(encode_frame(&payload[..MAX_PAYLOAD_LEN]).is_ok());
    }

    #[test]
    fn test_one_byte_chunks() {
        let messages = ["gpii", r#"{"request":"a","requestType":"status"}"#, "ü"];
        let bytes = encode_all(&messages);

        let mut assembler = FrameAssembler::new();
        let mut received = Vec::new();
        for byte in &bytes {
            received.extend(assembler.push(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(received, messages);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_many_frames_in_one_chunk() {
        let messages = ["one", "two", "three"];
        let mut bytes = encode_all(&messages);
        // Trailing partial frame stays buffered.
        bytes.extend_from_slice(&[0x00, 0x05, b'f', b'o']);

        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push(&bytes).unwrap(), messages);
        assert_eq!(assembler.buffered(), 2);

        assert_eq!(assembler.push(b"ur!").unwrap(), vec!["four!"]);
    }

    #[test]
    fn test_zero_length_frame() {
        let mut assembler = FrameAssembler::new();
        let frames = assembler.push(&encode_all(&["", "x"])).unwrap();
        assert_eq!(frames, vec!["", "x"]);
    }

    #[test]
    fn test_random_chunking_preserves_messages() {
        let mut rng = rand::thread_rng();
        let messages: Vec<String> = (0..50)
            .map(|i| format!(r#"{{"response":"{i}","data":"{}"}}"#, "7".repeat(i * 13)))
            .collect();
        let refs: Vec<&str> = messages.iter().map(String::as_str).collect();
        let bytes = encode_all(&refs);

        let mut assembler = FrameAssembler::new();
        let mut received = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + rng.gen_range(1..64)).min(bytes.len());
            received.extend(assembler.push(&bytes[offset..end]).unwrap());
            offset = end;
        }

        assert_eq!(received, messages);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut assembler = FrameAssembler::new();
        let frame = encode_frame(&[0xff, 0xfe]).unwrap();
        assert_eq!(assembler.push(&frame), Err(FrameError::InvalidUtf8));
    }

    #[test]
    fn test_good_frames_before_invalid_utf8_are_kept() {
        let mut bytes = encode_all(&["one", "two"]);
        bytes.extend(encode_frame(&[0xff, 0xfe]).unwrap());
        bytes.extend(encode_all(&["after"]));

        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push(&bytes).unwrap(), vec!["one", "two"]);
        assert_eq!(assembler.push(b""), Err(FrameError::InvalidUtf8));
        assert_eq!(assembler.take_error(), Some(FrameError::InvalidUtf8));
        assert_eq!(assembler.take_error(), None);
    }
}
