//! Meshtastic stream framing: `0x94 0xC3 len_hi len_lo <protobuf>`.
//!
//! The node interleaves protobuf frames with its plain-text debug console on the
//! same byte stream. [`StreamDecoder`] separates the two: complete frames come out
//! as [`Chunk::Frame`], and everything between frames is reassembled into console
//! lines.

use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;

/// Firmware never emits a ToRadio/FromRadio larger than this.
pub const MAX_FRAME_LEN: usize = 512;

const MAX_CONSOLE_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Frame(Vec<u8>),
    Console(String),
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
    console: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every frame and console line they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Chunk> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            let Some(start) = self.find_header() else {
                // a trailing START1 may be the first half of a header
                let keep = usize::from(self.buf.last() == Some(&START1));
                let text = self.buf.split_to(self.buf.len() - keep);
                self.console_bytes(&text, &mut out);
                break;
            };
            if start > 0 {
                let text = self.buf.split_to(start);
                self.console_bytes(&text, &mut out);
            }
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_FRAME_LEN {
                // not a real header, resync one byte further on
                let noise = self.buf[0];
                self.buf.advance(1);
                self.console_bytes(&[noise], &mut out);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                break;
            }

            self.buf.advance(HEADER_LEN);
            let frame = self.buf.split_to(declared);
            out.push(Chunk::Frame(frame.to_vec()));
        }
        out
    }

    /// Bytes currently held waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn find_header(&self) -> Option<usize> {
        self.buf.windows(2).position(|w| w == [START1, START2])
    }

    fn console_bytes(&mut self, bytes: &[u8], out: &mut Vec<Chunk>) {
        for &b in bytes {
            if b == b'\n' || self.console.len() >= MAX_CONSOLE_LINE {
                self.flush_console(out);
                if b == b'\n' {
                    continue;
                }
            }
            self.console.push(b);
        }
    }

    fn flush_console(&mut self, out: &mut Vec<Chunk>) {
        let line = String::from_utf8_lossy(&self.console).trim().to_string();
        self.console.clear();
        if !line.is_empty() {
            out.push(Chunk::Console(line));
        }
    }
}

/// Wrap a protobuf payload in the stream header.
pub fn encode_frame(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame payload of {} bytes out of range", payload.len()),
        ));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(START1);
    frame.push(START2);
    frame.push((payload.len() >> 8) as u8);
    frame.push((payload.len() & 0xFF) as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}
