//! PROPAR framing codec
//!
//! Frames are delimited by `DLE STX` / `DLE ETX` with any `DLE` in the body
//! doubled. The decoder is a byte-fed state machine that survives garbage
//! between frames and never stalls the receive loop on a malformed frame.

use bytes::BytesMut;
use tracing::trace;

use super::constants::{DLE, ETX, STX};

/// Encode a message body into a complete frame.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    // Worst case every body byte is a DLE.
    let mut frame = Vec::with_capacity(body.len() * 2 + 4);
    frame.push(DLE);
    frame.push(STX);
    for &b in body {
        frame.push(b);
        if b == DLE {
            frame.push(DLE);
        }
    }
    frame.push(DLE);
    frame.push(ETX);
    frame
}

/// Decoder states; `Error` is folded into the transitions by resynchronizing
/// on the next `DLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a frame start
    Idle,
    /// Saw a `DLE`, expecting `STX`
    AfterDle1,
    /// Accumulating body bytes
    InBody,
    /// Saw a `DLE` inside the body
    InBodyAfterDle,
}

/// Streaming frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    body: BytesMut,
    /// Bytes seen outside any frame, kept for diagnostics
    non_propar: Vec<u8>,
    malformed_frames: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            body: BytesMut::with_capacity(64),
            non_propar: Vec::new(),
            malformed_frames: 0,
        }
    }

    /// Feed raw bytes; returns every message body completed by this chunk.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut completed = Vec::new();

        for &byte in data {
            match self.state {
                DecodeState::Idle => {
                    if byte == DLE {
                        self.state = DecodeState::AfterDle1;
                    } else {
                        self.non_propar.push(byte);
                    }
                }
                DecodeState::AfterDle1 => {
                    if byte == STX {
                        self.body.clear();
                        self.state = DecodeState::InBody;
                    } else {
                        self.malformed_frames += 1;
                        // Resynchronize: the offending byte may itself open
                        // the next frame.
                        self.state = if byte == DLE {
                            DecodeState::AfterDle1
                        } else {
                            self.non_propar.push(byte);
                            DecodeState::Idle
                        };
                    }
                }
                DecodeState::InBody => {
                    if byte == DLE {
                        self.state = DecodeState::InBodyAfterDle;
                    } else {
                        self.body.extend_from_slice(&[byte]);
                    }
                }
                DecodeState::InBodyAfterDle => match byte {
                    DLE => {
                        self.body.extend_from_slice(&[DLE]);
                        self.state = DecodeState::InBody;
                    }
                    ETX => {
                        completed.push(self.body.split().to_vec());
                        self.state = DecodeState::Idle;
                    }
                    _ => {
                        trace!(byte, "unexpected byte after in-body DLE, dropping frame");
                        self.malformed_frames += 1;
                        self.body.clear();
                        self.non_propar.push(byte);
                        self.state = DecodeState::Idle;
                    }
                },
            }
        }

        completed
    }

    /// Frames abandoned mid-decode so far.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    /// Drain the bytes that arrived outside any frame.
    pub fn take_non_propar(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.non_propar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain_body() {
        let frame = encode_frame(&[0x01, 0x03, 0x03, 0x04, 0x21, 0x40]);
        assert_eq!(
            frame,
            vec![0x10, 0x02, 0x01, 0x03, 0x03, 0x04, 0x21, 0x40, 0x10, 0x03]
        );
    }

    #[test]
    fn test_encode_stuffs_dle() {
        // Body {10 02} -> 10 02 10 10 02 10 03
        let frame = encode_frame(&[0x10, 0x02]);
        assert_eq!(frame, vec![0x10, 0x02, 0x10, 0x10, 0x02, 0x10, 0x03]);
    }

    #[test]
    fn test_decode_restores_stuffed_body() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&[0x10, 0x02, 0x10, 0x10, 0x02, 0x10, 0x03]);
        assert_eq!(frames, vec![vec![0x10, 0x02]]);
    }

    #[test]
    fn test_roundtrip_arbitrary_dle_patterns() {
        let bodies: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x10],
            vec![0x10, 0x10, 0x10],
            vec![0x00, 0x10, 0xFF, 0x10, 0x02, 0x03, 0x10],
            (0u8..=255).collect(),
        ];
        for body in bodies {
            let mut decoder = FrameDecoder::new();
            let frames = decoder.feed(&encode_frame(&body));
            assert_eq!(frames, vec![body]);
        }
    }

    #[test]
    fn test_encoded_dle_always_followed_by_control() {
        let body: Vec<u8> = (0u8..=255).chain(std::iter::repeat(0x10).take(8)).collect();
        let frame = encode_frame(&body);
        let mut i = 0;
        while i < frame.len() {
            if frame[i] == DLE {
                let next = frame[i + 1];
                assert!(next == DLE || next == STX || next == ETX);
                // A stuffed pair consumes both bytes.
                if next == DLE {
                    i += 1;
                }
            }
            i += 1;
        }
    }

    #[test]
    fn test_garbage_between_frames() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![0xAA, 0xBB, 0xCC];
        stream.extend(encode_frame(&[0x01, 0x02, 0x00]));
        stream.extend([0xDE, 0xAD]);
        stream.extend(encode_frame(&[0x03, 0x04, 0x00]));

        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![vec![0x01, 0x02, 0x00], vec![0x03, 0x04, 0x00]]);
        assert_eq!(decoder.take_non_propar(), vec![0xAA, 0xBB, 0xCC, 0xDE, 0xAD]);
    }

    #[test]
    fn test_split_feed_across_chunks() {
        let mut decoder = FrameDecoder::new();
        let frame = encode_frame(&[0x10, 0x55, 0x10]);
        let mut frames = Vec::new();
        for chunk in frame.chunks(1) {
            frames.extend(decoder.feed(chunk));
        }
        assert_eq!(frames, vec![vec![0x10, 0x55, 0x10]]);
    }

    #[test]
    fn test_bad_start_counts_malformed_and_resyncs() {
        let mut decoder = FrameDecoder::new();
        // DLE followed by junk, then a valid frame.
        let mut stream = vec![0x10, 0x77];
        stream.extend(encode_frame(&[0x42]));
        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![vec![0x42]]);
        assert_eq!(decoder.malformed_frames(), 1);
    }

    #[test]
    fn test_dle_dle_stx_recovers_start() {
        // The second DLE is treated as a fresh frame-start candidate.
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![0x10];
        stream.extend(encode_frame(&[0x42]));
        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![vec![0x42]]);
    }

    #[test]
    fn test_malformed_body_does_not_block_next_frame() {
        let mut decoder = FrameDecoder::new();
        // DLE inside body followed by a junk byte aborts the frame.
        let mut stream = vec![0x10, 0x02, 0x01, 0x10, 0x99];
        stream.extend(encode_frame(&[0x05, 0x06]));
        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![vec![0x05, 0x06]]);
        assert_eq!(decoder.malformed_frames(), 1);
    }
}
