//! Decoder for the container daemon's multiplexed stdout/stderr stream.
//!
//! Each frame is an 8-byte header `[stream, 0, 0, 0, len (u32, big endian)]`
//! followed by `len` payload bytes. Chunks handed to [`Demultiplexer::feed`]
//! may split headers and payloads anywhere.

use tracing::warn;

const HEADER_LEN: usize = 8;

/// Stream a frame is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Map a header selector byte. Unknown selectors (including stdin) go to stdout.
    pub fn from_selector(byte: u8) -> Self {
        match byte {
            2 => Self::Stderr,
            _ => Self::Stdout,
        }
    }

    pub fn selector(self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader { filled: usize },
    ConsumingPayload { stream: StreamKind, remaining: usize },
}

/// Splits a multiplexed byte stream into stdout and stderr buffers.
#[derive(Debug)]
pub struct Demultiplexer {
    state: DecodeState,
    header: [u8; HEADER_LEN],
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader { filled: 0 },
            header: [0; HEADER_LEN],
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Consume one chunk of the raw stream.
    pub fn feed(&mut self, mut chunk: &[u8]) {
        while !chunk.is_empty() {
            match self.state {
                DecodeState::AwaitingHeader { filled } => {
                    let take = (HEADER_LEN - filled).min(chunk.len());
                    self.header[filled..filled + take].copy_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    let filled = filled + take;
                    self.state = if filled == HEADER_LEN {
                        self.header_complete()
                    } else {
                        DecodeState::AwaitingHeader { filled }
                    };
                },
                DecodeState::ConsumingPayload { stream, remaining } => {
                    let take = remaining.min(chunk.len());
                    self.buffer_mut(stream).extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    self.state = if remaining == take {
                        DecodeState::AwaitingHeader { filled: 0 }
                    } else {
                        DecodeState::ConsumingPayload {
                            stream,
                            remaining: remaining - take,
                        }
                    };
                },
            }
        }
    }

    fn header_complete(&self) -> DecodeState {
        let stream = StreamKind::from_selector(self.header[0]);
        let len = u32::from_be_bytes([self.header[4], self.header[5], self.header[6], self.header[7]]);
        match len {
            0 => DecodeState::AwaitingHeader { filled: 0 },
            len => DecodeState::ConsumingPayload {
                stream,
                remaining: len as usize,
            },
        }
    }

    fn buffer_mut(&mut self, stream: StreamKind) -> &mut Vec<u8> {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// True when the stream ended on a frame boundary.
    #[cfg(test)]
    fn is_at_boundary(&self) -> bool {
        self.state == DecodeState::AwaitingHeader { filled: 0 }
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Take the buffers. A truncated trailing frame is logged; its partial
    /// payload is kept.
    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        match self.state {
            DecodeState::AwaitingHeader { filled: 0 } => {},
            DecodeState::AwaitingHeader { filled } => {
                warn!(header_bytes = filled, "output stream ended inside a frame header");
            },
            DecodeState::ConsumingPayload { stream, remaining } => {
                warn!(?stream, missing = remaining, "output stream ended inside a frame payload");
            },
        }
        (self.stdout, self.stderr)
    }
}

/// Encode one frame. The inverse of what [`Demultiplexer`] decodes.
pub fn encode_frame(stream: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[stream.selector(), 0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
