//! Protocol definitions for device communication.
//!
//! This module contains the text-level protocol spoken over the UART service:
//! - Raw REPL framing and MTU chunking of outgoing commands
//! - UTF-8 decoding and line reassembly of incoming output

pub mod framing;
pub mod line;

pub use framing::{
    ATT_OVERHEAD, CANCEL, ChunkLimit, DEFAULT_MTU, ENTER_RAW_MODE, EXIT_AND_RUN, FrameConfig,
    LineEnding, WrappedPayload, encode as encode_command,
};
pub use line::{LINE_SEPARATOR, LineReader, TextDecoder};
