//! Transport layer for device communication.
//!
//! A transport binds a BLE link to the two characteristics of the Nordic
//! UART service: one written with command bytes, one notifying output.

pub mod ble;
pub mod mock;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::Result;

/// Nordic UART service & characteristic UUIDs.
///
/// RX and TX are named from the peripheral's point of view: the central
/// writes to RX and receives notifications on TX.
pub mod nus_uuids {
    use uuid::Uuid;
    /// NUS service UUID.
    pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);
    /// NUS RX UUID (central writes).
    pub const NUS_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E40_0002_B5A3_F393_E0A9_E50E_24DC_CA9E);
    /// NUS TX UUID (peripheral notifies).
    pub const NUS_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E);
}

/// Callback receiving each notification payload with the UUID of the
/// characteristic that produced it.
pub type NotifyHandler = Arc<dyn Fn(Uuid, Bytes) + Send + Sync>;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Locates the device and opens the link.
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Closes the link. Closing a closed link is a no-op.
    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Performs one characteristic write.
    fn write_chunk<'a>(
        &'a mut self,
        chunk: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Registers the single notification handler for this connection.
    fn subscribe(
        &mut self,
        handler: NotifyHandler,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Negotiated MTU, if the platform exposes it.
    fn mtu(&self) -> Option<usize>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;
}

pub use ble::{BleConfig, BleTransport, DeviceIdentity};
pub use mock::MockTransport;
