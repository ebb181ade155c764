//! In-memory transport for tests.
//!
//! The mock is a cheap handle: clones share state, so a test can keep one
//! clone to inspect writes and inject notifications while the client owns
//! another.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::transport::nus_uuids::NUS_TX_CHAR_UUID;
use crate::transport::{NotifyHandler, Transport};

#[derive(Default)]
struct MockState {
    connected: bool,
    mtu: Option<usize>,
    writes: Vec<Bytes>,
    write_attempts: usize,
    fail_on_write: Option<usize>,
    connect_error: Option<String>,
    handler: Option<NotifyHandler>,
    connects: usize,
    disconnects: usize,
    yield_on_write: bool,
}

/// Scriptable transport that records every chunk written.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a mock that reports no MTU.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock reporting the given MTU.
    #[must_use]
    pub fn with_mtu(mtu: usize) -> Self {
        let mock = Self::default();
        mock.set_mtu(Some(mtu));
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Changes the reported MTU.
    pub fn set_mtu(&self, mtu: Option<usize>) {
        self.state().mtu = mtu;
    }

    /// Makes the `n`th write attempt (1-based) fail.
    pub fn fail_on_write(&self, n: usize) {
        self.state().fail_on_write = Some(n);
    }

    /// Makes the next connect fail with a connection error.
    pub fn fail_connect(&self, message: impl Into<String>) {
        self.state().connect_error = Some(message.into());
    }

    /// Makes every write yield to the scheduler before it lands, so other
    /// tasks can run mid-payload as they would on a real link.
    pub fn yield_on_write(&self, enabled: bool) {
        self.state().yield_on_write = enabled;
    }

    /// Simulates the peripheral dropping the link. The subscription goes
    /// with it.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        state.handler = None;
    }

    /// Delivers a notification to the subscribed handler.
    ///
    /// Returns false if nothing is subscribed.
    pub fn notify(&self, data: impl Into<Bytes>) -> bool {
        let handler = self.state().handler.clone();
        match handler {
            Some(handler) => {
                handler(NUS_TX_CHAR_UUID, data.into());
                true
            }
            None => false,
        }
    }

    /// Returns every chunk written so far.
    #[must_use]
    pub fn writes(&self) -> Vec<Bytes> {
        self.state().writes.clone()
    }

    /// Returns all written bytes concatenated.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state().writes.iter().flat_map(|c| c.iter().copied()).collect()
    }

    /// Number of connect calls.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Number of disconnect calls.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    /// Returns true if a handler is subscribed.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.state().handler.is_some()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state();
            state.connects += 1;
            if let Some(message) = state.connect_error.take() {
                return Err(Error::connection(message));
            }
            state.connected = true;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state();
            state.disconnects += 1;
            state.connected = false;
            state.handler = None;
            Ok(())
        })
    }

    fn write_chunk<'a>(
        &'a mut self,
        chunk: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let yield_first = self.state().yield_on_write;
            if yield_first {
                tokio::task::yield_now().await;
            }

            let mut state = self.state();
            if !state.connected {
                return Err(Error::transport("link lost"));
            }
            state.write_attempts += 1;
            if state.fail_on_write == Some(state.write_attempts) {
                return Err(Error::transport(format!(
                    "write {} rejected",
                    state.write_attempts
                )));
            }
            state.writes.push(Bytes::copy_from_slice(chunk));
            Ok(())
        })
    }

    fn subscribe(
        &mut self,
        handler: NotifyHandler,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            if state.handler.is_some() {
                return Err(Error::AlreadySubscribed);
            }
            state.handler = Some(handler);
            Ok(())
        })
    }

    fn mtu(&self) -> Option<usize> {
        self.state().mtu
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}
