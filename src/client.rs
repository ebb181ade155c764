//! Main [`Monocle`] client implementation.
//!
//! This module provides the high-level [`Monocle`] client that combines
//! transport, command framing and inbound text handling into a session.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, EventFilter, Subscription};
use crate::listener::{ListenerId, Listeners, TOUCH_CALLBACK_COMMAND, TouchPad};
use crate::protocol::{CANCEL, ChunkLimit, FrameConfig, LineReader, TextDecoder, WrappedPayload};
use crate::transport::{BleConfig, BleTransport, DeviceIdentity, Transport};

/// Callback receiving device output as `(channel, text)`.
pub type TextCallback = Arc<dyn Fn(Uuid, &str) + Send + Sync>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inbound side of a session: decodes notifications and fans them out.
struct Inbound {
    on_text: TextCallback,
    dispatcher: EventDispatcher,
    decoder: StdMutex<TextDecoder>,
    reader: StdMutex<LineReader>,
    listeners: StdMutex<Listeners>,
}

impl Inbound {
    fn reset(&self) {
        lock(&self.decoder).clear();
        lock(&self.reader).clear();
    }

    fn deliver(&self, channel: Uuid, data: &[u8]) {
        let text = lock(&self.decoder).decode(data);
        if text.is_empty() {
            return;
        }
        tracing::trace!("notify: <<{}>>", text);

        (self.on_text)(channel, &text);

        let lines = lock(&self.reader).feed(&text);
        self.dispatcher.dispatch(Event::Text { channel, text });
        if lines.is_empty() {
            return;
        }

        // Snapshot so callbacks may add or remove listeners
        let (line_listeners, touch_enabled) = {
            let listeners = lock(&self.listeners);
            (listeners.line_listeners(), listeners.touch_enabled())
        };

        for line in lines {
            for listener in &line_listeners {
                listener(&line);
            }

            if touch_enabled {
                for pad in TouchPad::detect(&line) {
                    let callback = lock(&self.listeners).touch_callback(pad);
                    if let Some(callback) = callback {
                        callback();
                    }
                    self.dispatcher.dispatch(Event::Touch(pad));
                }
            }

            self.dispatcher.dispatch(Event::Line(line));
        }
    }
}

/// Client for sending commands to a device and receiving its output.
///
/// A session is open between [`connect`](Self::connect) and
/// [`disconnect`](Self::disconnect), or for the duration of
/// [`session`](Self::session).
pub struct Monocle<T> {
    transport: Arc<Mutex<T>>,
    config: FrameConfig,
    inbound: Arc<Inbound>,
    chunk_limit: Option<ChunkLimit>,
}

impl Monocle<BleTransport> {
    /// Creates a new client for a BLE device.
    ///
    /// # Arguments
    ///
    /// * `identity` - Address or advertised name of the device
    /// * `on_text` - Called with each piece of output the device sends
    ///
    /// # Returns
    ///
    /// A new client (not yet connected).
    #[must_use]
    pub fn ble(
        identity: DeviceIdentity,
        on_text: impl Fn(Uuid, &str) + Send + Sync + 'static,
    ) -> Self {
        Self::with_ble_config(BleConfig::new(identity), on_text)
    }

    /// Creates a new client with custom BLE configuration.
    #[must_use]
    pub fn with_ble_config(
        config: BleConfig,
        on_text: impl Fn(Uuid, &str) + Send + Sync + 'static,
    ) -> Self {
        Self::new(BleTransport::new(config), on_text)
    }
}

impl<T: Transport + 'static> Monocle<T> {
    /// Creates a new client over the given transport. No I/O happens here.
    #[must_use]
    pub fn new(transport: T, on_text: impl Fn(Uuid, &str) + Send + Sync + 'static) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            config: FrameConfig::default(),
            inbound: Arc::new(Inbound {
                on_text: Arc::new(on_text),
                dispatcher: EventDispatcher::new(256),
                decoder: StdMutex::new(TextDecoder::new()),
                reader: StdMutex::new(LineReader::default()),
                listeners: StdMutex::new(Listeners::default()),
            }),
            chunk_limit: None,
        }
    }

    /// Sets the framing configuration.
    #[must_use]
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.config = config;
        self
    }

    /// Opens the session.
    ///
    /// This will:
    /// 1. Open the transport connection
    /// 2. Subscribe to device output
    /// 3. Fix the chunk size for the lifetime of the connection
    pub async fn connect(&mut self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if self.chunk_limit.is_some() && transport.is_connected() {
            return Ok(());
        }

        // Until the new link is subscribed there is no session
        self.chunk_limit = None;
        transport.connect().await?;

        self.inbound.reset();
        let inbound = Arc::clone(&self.inbound);
        let subscribed = transport
            .subscribe(Arc::new(move |channel: Uuid, data: Bytes| {
                inbound.deliver(channel, &data);
            }))
            .await;
        if let Err(e) = subscribed {
            if let Err(close_err) = transport.disconnect().await {
                tracing::warn!("failed to disconnect after subscribe error: {}", close_err);
            }
            return Err(e);
        }

        let mtu = transport.mtu().unwrap_or(self.config.fallback_mtu);
        let limit = ChunkLimit::from_mtu(mtu);
        tracing::info!("MTU size is {}, chunk size is {}", mtu, limit.get());
        self.chunk_limit = Some(limit);

        self.inbound.dispatcher.dispatch(Event::Connected);
        Ok(())
    }

    /// Closes the session. Closing a closed session is a no-op.
    pub async fn disconnect(&mut self) -> Result<()> {
        let was_open = self.chunk_limit.take().is_some();

        {
            let mut transport = self.transport.lock().await;
            transport.disconnect().await?;
        }

        if was_open {
            self.inbound.dispatcher.dispatch(Event::Disconnected);
        }
        Ok(())
    }

    /// Runs `body` inside a session.
    ///
    /// The transport is disconnected exactly once on every exit path. An
    /// error from `body` takes precedence over one from disconnecting.
    pub async fn session<R>(&mut self, body: impl AsyncFnOnce(&Self) -> Result<R>) -> Result<R> {
        let outcome = match self.connect().await {
            Ok(()) => body(&*self).await,
            Err(e) => Err(e),
        };
        let closed = self.disconnect().await;

        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                tracing::warn!("disconnect failed after session error: {}", close_err);
                Err(e)
            }
        }
    }

    /// Returns true if a session is open and the link is up.
    pub async fn is_connected(&self) -> bool {
        self.chunk_limit.is_some() && self.transport.lock().await.is_connected()
    }

    /// Chunk size fixed at connect time.
    #[must_use]
    pub const fn chunk_limit(&self) -> Option<ChunkLimit> {
        self.chunk_limit
    }

    /// Sends a command to run on the device.
    ///
    /// Whatever is running is interrupted first. Returns once every chunk has
    /// been written. A failed chunk aborts the rest of the command; the device
    /// may then hold partial input, which [`interrupt`](Self::interrupt)
    /// clears.
    pub async fn send(&self, command: &str) -> Result<()> {
        let limit = self.chunk_limit.ok_or(Error::NotConnected)?;
        let payload = WrappedPayload::from_command(command, self.config.line_ending);

        // Held for the whole payload so concurrent sends cannot interleave
        let mut transport = self.transport.lock().await;

        let chunks = payload.chunks(limit);
        let total = chunks.len();
        for (i, chunk) in chunks.enumerate() {
            tracing::trace!("sending chunk {}/{}: {} bytes", i + 1, total, chunk.len());
            transport.write_chunk(&chunk).await?;
        }

        tracing::debug!("sent {} bytes in {} chunks", payload.len(), total);
        Ok(())
    }

    /// Sends the cancel byte alone, stopping any running code.
    pub async fn interrupt(&self) -> Result<()> {
        if self.chunk_limit.is_none() {
            return Err(Error::NotConnected);
        }
        let mut transport = self.transport.lock().await;
        transport.write_chunk(&[CANCEL]).await
    }

    /// Sends a command and waits for a matching event.
    pub async fn send_and_wait(
        &self,
        command: &str,
        filter: EventFilter,
        timeout: Duration,
    ) -> Result<Event> {
        // Subscribe before sending so a fast reply is not missed
        let mut subscription = self.subscribe();
        self.send(command).await?;

        EventDispatcher::wait_on(&mut subscription, &filter, timeout)
            .await
            .ok_or_else(|| Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.inbound.dispatcher.subscribe()
    }

    /// Waits for an event matching the filter.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        self.inbound.dispatcher.wait_for(filter, timeout).await
    }

    // ==================== Listeners ====================

    /// Adds a callback fired for each complete line from the device.
    ///
    /// Returns a token for [`remove_line_listener`](Self::remove_line_listener).
    pub fn add_line_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        lock(&self.inbound.listeners).add_line_listener(Arc::new(listener))
    }

    /// Removes a line listener. Returns false for an unknown token.
    pub fn remove_line_listener(&self, id: ListenerId) -> bool {
        lock(&self.inbound.listeners).remove_line_listener(id)
    }

    /// Installs touch detectors on the device.
    ///
    /// Replaces any `touch.callback` set on the device by other code. Setting
    /// one later breaks detection until this is called again.
    pub async fn install_touch_events(&self) -> Result<()> {
        if lock(&self.inbound.listeners).enable_touch() {
            tracing::info!("touch detection enabled");
        }
        self.send(TOUCH_CALLBACK_COMMAND).await
    }

    /// Sets the callback for taps on a pad.
    pub fn set_touch_callback(&self, pad: TouchPad, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.inbound.listeners).set_touch_callback(pad, Some(Arc::new(callback)));
    }

    /// Clears the callback for a pad.
    pub fn clear_touch_callback(&self, pad: TouchPad) {
        lock(&self.inbound.listeners).set_touch_callback(pad, None);
    }
}

impl<T> Drop for Monocle<T> {
    fn drop(&mut self) {
        if self.chunk_limit.is_some() {
            tracing::warn!("client dropped with an open session; call disconnect first");
        }
    }
}
