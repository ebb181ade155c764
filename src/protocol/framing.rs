//! Command framing for the device's raw REPL.
//!
//! Every command is sent as a single wrapped payload:
//! ```text
//! ┌────────┬────────┬──────────────────┬────────┐
//! │  0x03  │  0x01  │   command text   │  0x04  │
//! │ cancel │  raw   │   (UTF-8, CRLF)  │  run   │
//! └────────┴────────┴──────────────────┴────────┘
//! ```
//! which is then cut into chunks that fit a single GATT write.

use bytes::{BufMut, Bytes, BytesMut};

/// Ctrl-C: interrupts whatever is running on the device.
pub const CANCEL: u8 = 0x03;

/// Ctrl-A: enters raw REPL mode (no echo, no auto-indent).
pub const ENTER_RAW_MODE: u8 = 0x01;

/// Ctrl-D: executes the pasted text and leaves raw mode.
pub const EXIT_AND_RUN: u8 = 0x04;

/// Bytes reserved by the ATT header of a GATT write.
pub const ATT_OVERHEAD: usize = 3;

/// MTU used when the platform does not report a negotiated one.
pub const DEFAULT_MTU: usize = 128;

/// Number of framing bytes placed before the command body.
const PREFIX_LEN: usize = 2;

/// How newlines in command text are sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    /// Every `\n` becomes `\r\n`, as the device REPL expects.
    #[default]
    CrLf,
    /// Text is sent unchanged.
    Lf,
}

/// Framing configuration for a session.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// MTU assumed when the transport reports none.
    pub fallback_mtu: usize,
    /// Newline handling for outgoing commands.
    pub line_ending: LineEnding,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            fallback_mtu: DEFAULT_MTU,
            line_ending: LineEnding::default(),
        }
    }
}

impl FrameConfig {
    /// Sets the fallback MTU.
    #[must_use]
    pub const fn fallback_mtu(mut self, mtu: usize) -> Self {
        self.fallback_mtu = mtu;
        self
    }

    /// Sets the line ending.
    #[must_use]
    pub const fn line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }
}

/// Encodes command text into the bytes the device should see.
#[must_use]
pub fn encode(text: &str, line_ending: LineEnding) -> Bytes {
    match line_ending {
        LineEnding::CrLf => Bytes::from(text.replace('\n', "\r\n")),
        LineEnding::Lf => Bytes::copy_from_slice(text.as_bytes()),
    }
}

/// Maximum bytes per chunk for a link, derived once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimit(usize);

impl ChunkLimit {
    /// Derives the limit from a negotiated MTU.
    ///
    /// Never returns zero, even for MTUs smaller than the ATT header.
    #[must_use]
    pub const fn from_mtu(mtu: usize) -> Self {
        let size = mtu.saturating_sub(ATT_OVERHEAD);
        Self(if size == 0 { 1 } else { size })
    }

    /// Returns the limit in bytes.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A command wrapped with cancel and raw-mode control bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedPayload(Bytes);

impl WrappedPayload {
    /// Wraps already-encoded command bytes.
    #[must_use]
    pub fn wrap(body: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(body.len() + PREFIX_LEN + 1);
        buf.put_u8(CANCEL);
        buf.put_u8(ENTER_RAW_MODE);
        buf.put_slice(body);
        buf.put_u8(EXIT_AND_RUN);
        Self(buf.freeze())
    }

    /// Encodes and wraps command text.
    #[must_use]
    pub fn from_command(text: &str, line_ending: LineEnding) -> Self {
        Self::wrap(&encode(text, line_ending))
    }

    /// Returns the full wrapped bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the command body without framing bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.0[PREFIX_LEN..self.0.len() - 1]
    }

    /// Total length including framing.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: framing bytes are present even for empty commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Splits the payload into in-order chunks no longer than `limit`.
    pub fn chunks(&self, limit: ChunkLimit) -> impl ExactSizeIterator<Item = Bytes> + '_ {
        let size = limit.get();
        (0..self.0.len().div_ceil(size)).map(move |i| {
            let start = i * size;
            let end = (start + size).min(self.0.len());
            self.0.slice(start..end)
        })
    }
}
