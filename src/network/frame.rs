// src/network/frame.rs

use crate::constants::FRAME_DELIMITER;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of at least {pending} bytes exceeds the {max} byte limit")]
    TooLarge { pending: usize, max: usize },
}

/// Reassembles NUL-delimited frames from arbitrarily split reads.
#[derive(Debug)]
pub struct FrameAccumulator {
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no delimiter.
    scanned: usize,
    max_frame_bytes: usize,
}

impl FrameAccumulator {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, without its delimiter. Empty frames are skipped.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            let found = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == FRAME_DELIMITER)
                .map(|off| self.scanned + off);
            match found {
                Some(pos) if pos > self.max_frame_bytes => {
                    return Err(FrameError::TooLarge {
                        pending: pos,
                        max: self.max_frame_bytes,
                    });
                }
                Some(pos) => {
                    let frame = self.buf.split_to(pos);
                    self.buf.advance(1);
                    self.scanned = 0;
                    if frame.is_empty() {
                        continue;
                    }
                    return Ok(Some(frame.freeze()));
                }
                None if self.buf.len() > self.max_frame_bytes => {
                    self.scanned = self.buf.len();
                    return Err(FrameError::TooLarge {
                        pending: self.buf.len(),
                        max: self.max_frame_bytes,
                    });
                }
                None => {
                    self.scanned = self.buf.len();
                    return Ok(None);
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Terminate an encoded message for the wire.
pub fn encode_frame(mut body: Vec<u8>) -> Bytes {
    body.push(FRAME_DELIMITER);
    Bytes::from(body)
}
