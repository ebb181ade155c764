//! # monocle
//!
//! A Rust client library for Monocle-style micro-display devices.
//!
//! This library opens a BLE link to the device's Nordic UART service, sends
//! Python commands through the raw REPL and hands back whatever the device
//! prints.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Commands are cut to fit the link MTU and sent strictly in order
//! - Running code is interrupted before each new command
//! - Callback, line listener and event channel views of device output
//!
//! ## Quick Start
//!
//! ```no_run
//! use monocle::{DeviceIdentity, Monocle};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), monocle::Error> {
//!     let mut monocle = Monocle::ble(DeviceIdentity::default(), |_channel, text| {
//!         print!("{text}");
//!     });
//!
//!     monocle
//!         .session(async |m| {
//!             m.send("import display\ndisplay.show(display.Text('hi', 0, 0, 0xffffff))")
//!                 .await
//!         })
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Raw REPL framing, MTU chunking and line reassembly
//! - [`transport`] - Transport implementations (BLE and an in-memory mock)
//! - [`event`] - Async event system for device output
//! - [`listener`] - Line listeners and touch callbacks
//! - [`client`] - High-level [`Monocle`] client

pub mod client;
pub mod error;
pub mod event;
pub mod listener;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use client::{Monocle, TextCallback};
pub use error::{Error, Result};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, Subscription};
pub use listener::{ListenerId, TouchPad};
pub use protocol::{ChunkLimit, FrameConfig, LineEnding, LineReader, TextDecoder, WrappedPayload};
pub use transport::{BleConfig, BleTransport, DeviceIdentity, MockTransport, Transport};
