//! Bluetooth Low Energy transport implementation.
//!
//! This module locates a device over btleplug, opens the link and binds the
//! Nordic UART characteristics.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::ATT_OVERHEAD;
use crate::transport::nus_uuids::{NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID};
use crate::transport::{NotifyHandler, Transport};

/// Name advertised by the device firmware.
pub const DEFAULT_DEVICE_NAME: &str = "monocle";

/// Default discovery window.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default link establishment timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How to pick the peripheral to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdentity {
    /// A specific Bluetooth address.
    Address(BDAddr),
    /// The only peripheral advertising this local name.
    Name(String),
}

impl DeviceIdentity {
    /// Returns true if an advertisement matches this identity.
    #[must_use]
    pub fn matches(&self, address: BDAddr, local_name: Option<&str>) -> bool {
        match self {
            Self::Address(addr) => *addr == address,
            Self::Name(name) => local_name == Some(name.as_str()),
        }
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::Name(DEFAULT_DEVICE_NAME.to_owned())
    }
}

impl FromStr for DeviceIdentity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match BDAddr::from_str(s) {
            Ok(addr) => Self::Address(addr),
            Err(_) => Self::Name(s.to_owned()),
        })
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{addr}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

/// Configuration for BLE transport.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Device to connect to.
    pub identity: DeviceIdentity,
    /// How long to scan for the device.
    pub scan_timeout: Duration,
    /// How long to wait for the link to come up.
    pub connect_timeout: Duration,
    /// MTU to report when the platform does not expose one.
    pub mtu: Option<usize>,
}

impl BleConfig {
    /// Creates a new BLE configuration with default settings.
    #[must_use]
    pub const fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            mtu: None,
        }
    }

    /// Sets the discovery window.
    #[must_use]
    pub const fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the MTU reported for the link.
    #[must_use]
    pub const fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self::new(DeviceIdentity::default())
    }
}

/// Up/down flag of one link, shared with the tasks watching it.
#[derive(Debug, Clone)]
struct LinkState(Arc<AtomicBool>);

impl LinkState {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark_down(&self, reason: &str) {
        if self.0.swap(false, Ordering::AcqRel) {
            tracing::warn!("link lost: {}", reason);
        }
    }
}

/// An open link with its UART characteristics.
struct Link {
    peripheral: Peripheral,
    rx: Characteristic,
    tx: Characteristic,
    state: LinkState,
    watch: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.watch.abort();
    }
}

/// BLE transport bound to the Nordic UART service.
pub struct BleTransport {
    config: BleConfig,
    link: Option<Link>,
    notify_task: Option<JoinHandle<()>>,
}

impl BleTransport {
    /// Creates a new BLE transport with the given configuration.
    #[must_use]
    pub const fn new(config: BleConfig) -> Self {
        Self {
            config,
            link: None,
            notify_task: None,
        }
    }

    /// Creates a new BLE transport for the given device with default settings.
    #[must_use]
    pub const fn with_identity(identity: DeviceIdentity) -> Self {
        Self::new(BleConfig::new(identity))
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &BleConfig {
        &self.config
    }

    async fn open(&self) -> Result<Link> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::connection("no Bluetooth adapter found"))?;

        let peripheral =
            find_peripheral(&adapter, &self.config.identity, self.config.scan_timeout).await?;

        tracing::info!("connecting to {}", self.config.identity);
        let limit = self.config.connect_timeout;
        bounded(limit, "link setup", async {
            peripheral
                .connect()
                .await
                .map_err(|e| Error::connection(e.to_string()))
        })
        .await?;

        let bound = async {
            let (rx, tx) = bounded(limit, "service discovery", find_uart(&peripheral)).await?;
            let events = adapter.events().await?;
            Ok::<_, Error>((rx, tx, events))
        }
        .await;
        let (rx, tx, events) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                if let Err(close_err) = peripheral.disconnect().await {
                    tracing::warn!("failed to close link after lookup error: {}", close_err);
                }
                return Err(e);
            }
        };

        let state = LinkState::new();
        let id = peripheral.id();
        let watch = tokio::spawn(watch_link(
            events,
            move |event: &CentralEvent| {
                matches!(event, CentralEvent::DeviceDisconnected(gone) if *gone == id)
            },
            state.clone(),
        ));

        Ok(Link {
            peripheral,
            rx,
            tx,
            state,
            watch,
        })
    }
}

/// Runs one step of link setup, failing with a connection error once
/// `limit` has passed.
async fn bounded<T>(
    limit: Duration,
    step: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, future).await.map_err(|_| {
        Error::connection(format!("{step} not done within {}ms", limit.as_millis()))
    })?
}

/// Marks the link down on the first event `ends_link` accepts.
async fn watch_link<S>(mut events: S, ends_link: impl Fn(&S::Item) -> bool, state: LinkState)
where
    S: Stream + Unpin,
{
    while let Some(event) = events.next().await {
        if ends_link(&event) {
            state.mark_down("peripheral disconnected");
            return;
        }
    }
    tracing::debug!("adapter event stream ended");
}

/// Scans until the identity is matched or the window closes.
///
/// An address returns on the first match. A name needs exactly one matching
/// peripheral over the whole window.
async fn find_peripheral(
    adapter: &Adapter,
    identity: &DeviceIdentity,
    window: Duration,
) -> Result<Peripheral> {
    tracing::info!("scanning for {}...", identity);
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let mut found: HashMap<PeripheralId, Peripheral> = HashMap::new();

    // Peripherals cached from earlier scans do not raise a fresh discovery
    for peripheral in adapter.peripherals().await? {
        if is_match(&peripheral, identity).await? {
            found.insert(peripheral.id(), peripheral);
        }
    }

    if !matches!(identity, DeviceIdentity::Address(_)) || found.is_empty() {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            let id = tokio::select! {
                () = &mut deadline => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => id,
                    Some(_) => continue,
                    None => break,
                },
            };

            let peripheral = adapter.peripheral(&id).await?;
            if is_match(&peripheral, identity).await? {
                found.insert(id, peripheral);
                if matches!(identity, DeviceIdentity::Address(_)) {
                    break;
                }
            }
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        tracing::warn!("failed to stop scan: {}", e);
    }

    match found.len() {
        0 => Err(Error::DeviceNotFound {
            identity: identity.to_string(),
        }),
        1 => {
            let peripheral = found.into_values().next().ok_or_else(|| Error::DeviceNotFound {
                identity: identity.to_string(),
            })?;
            tracing::info!("found {} at {}", identity, peripheral.address());
            Ok(peripheral)
        }
        count => Err(Error::AmbiguousDevice {
            name: identity.to_string(),
            count,
        }),
    }
}

async fn is_match(peripheral: &Peripheral, identity: &DeviceIdentity) -> Result<bool> {
    let Some(props) = peripheral.properties().await? else {
        return Ok(false);
    };
    Ok(identity.matches(props.address, props.local_name.as_deref()))
}

/// Discovers services and returns the (RX, TX) UART characteristics.
async fn find_uart(peripheral: &Peripheral) -> Result<(Characteristic, Characteristic)> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| Error::connection(e.to_string()))?;

    tracing::info!("finding UART service...");
    let service = peripheral
        .services()
        .into_iter()
        .find(|s| s.uuid == NUS_SERVICE_UUID)
        .ok_or_else(|| Error::connection("no UART service found"))?;

    let find = |uuid| {
        service
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
    };

    let rx = find(NUS_RX_CHAR_UUID)
        .ok_or_else(|| Error::connection("unable to find RX characteristic"))?;
    let tx = find(NUS_TX_CHAR_UUID)
        .ok_or_else(|| Error::connection("unable to find TX characteristic"))?;

    tracing::info!("found UART service");
    Ok((rx, tx))
}

impl Transport for BleTransport {
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(stale) = self.link.take() {
                if stale.state.is_up() {
                    self.link = Some(stale);
                    return Ok(());
                }
                if let Some(task) = self.notify_task.take() {
                    task.abort();
                }
                if let Err(e) = stale.peripheral.disconnect().await {
                    tracing::debug!("closing lost link: {}", e);
                }
            }

            let link = self.open().await?;
            tracing::info!("connected {}", link.peripheral.address());
            self.link = Some(link);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(task) = self.notify_task.take() {
                task.abort();
            }

            if let Some(link) = self.link.take() {
                let address = link.peripheral.address();
                match link.peripheral.disconnect().await {
                    Ok(()) => tracing::info!("disconnected {}", address),
                    // Already gone on the peripheral side
                    Err(e) if !link.state.is_up() => {
                        tracing::debug!("closing lost link {}: {}", address, e);
                    }
                    Err(e) => return Err(Error::transport(e.to_string())),
                }
            }
            Ok(())
        })
    }

    fn write_chunk<'a>(
        &'a mut self,
        chunk: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let link = self.link.as_ref().ok_or(Error::NotConnected)?;
            if !link.state.is_up() {
                return Err(Error::transport("link lost"));
            }

            if let Some(mtu) = self.config.mtu {
                if chunk.len() > mtu.saturating_sub(ATT_OVERHEAD) {
                    return Err(Error::transport(format!(
                        "chunk of {} bytes exceeds MTU {}",
                        chunk.len(),
                        mtu
                    )));
                }
            }

            link.peripheral
                .write(&link.rx, chunk, WriteType::WithResponse)
                .await
                .map_err(|e| Error::transport(e.to_string()))
        })
    }

    fn subscribe(
        &mut self,
        handler: NotifyHandler,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let link = self.link.as_ref().ok_or(Error::NotConnected)?;
            if self.notify_task.is_some() {
                return Err(Error::AlreadySubscribed);
            }

            let mut notifications = bounded(self.config.connect_timeout, "subscribe", async {
                let notifications = link
                    .peripheral
                    .notifications()
                    .await
                    .map_err(|e| Error::connection(e.to_string()))?;
                link.peripheral
                    .subscribe(&link.tx)
                    .await
                    .map_err(|e| Error::connection(e.to_string()))?;
                Ok::<_, Error>(notifications)
            })
            .await?;

            let tx_uuid = link.tx.uuid;
            let state = link.state.clone();
            self.notify_task = Some(tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != tx_uuid {
                        continue;
                    }
                    tracing::trace!("notify: {} bytes", notification.value.len());
                    handler(notification.uuid, Bytes::from(notification.value));
                }
                state.mark_down("notification stream ended");
            }));
            Ok(())
        })
    }

    fn mtu(&self) -> Option<usize> {
        // btleplug does not report the negotiated MTU
        self.config.mtu
    }

    fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.state.is_up())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_config_defaults() {
        let config = BleConfig::default();
        assert_eq!(config.identity, DeviceIdentity::Name("monocle".into()));
        assert_eq!(config.scan_timeout, DEFAULT_SCAN_TIMEOUT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.mtu, None);
    }

    #[test]
    fn test_ble_config_builder() {
        let config = BleConfig::new(DeviceIdentity::Name("frame".into()))
            .scan_timeout(Duration::from_secs(2))
            .connect_timeout(Duration::from_secs(3))
            .mtu(247);
        assert_eq!(config.scan_timeout, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.mtu, Some(247));
    }

    #[test]
    fn test_identity_parse() {
        let addr: DeviceIdentity = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert!(matches!(addr, DeviceIdentity::Address(_)));

        let name: DeviceIdentity = "monocle".parse().unwrap();
        assert_eq!(name, DeviceIdentity::Name("monocle".into()));
    }

    #[test]
    fn test_identity_matches() {
        let addr = BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let other = BDAddr::from([0, 0, 0, 0, 0, 1]);

        let by_addr = DeviceIdentity::Address(addr);
        assert!(by_addr.matches(addr, None));
        assert!(!by_addr.matches(other, Some("monocle")));

        let by_name = DeviceIdentity::default();
        assert!(by_name.matches(other, Some("monocle")));
        assert!(!by_name.matches(addr, Some("Monocle")));
        assert!(!by_name.matches(addr, None));
    }

    #[tokio::test]
    async fn test_unconnected_transport() {
        let mut transport = BleTransport::new(BleConfig::default().mtu(64));
        assert!(!transport.is_connected());
        assert_eq!(transport.mtu(), Some(64));
        assert!(matches!(
            transport.write_chunk(b"x").await,
            Err(Error::NotConnected)
        ));
        // Closing a link that was never opened is a no-op
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_step_times_out() {
        let result = bounded(
            Duration::from_secs(10),
            "service discovery",
            std::future::pending::<Result<()>>(),
        )
        .await;

        match result {
            Err(Error::Connection { message }) => {
                assert_eq!(message, "service discovery not done within 10000ms");
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bounded_step_passes_result() {
        let done = bounded(Duration::from_secs(1), "subscribe", async { Ok::<_, Error>(7) }).await;
        assert_eq!(done.unwrap(), 7);

        let failed = bounded(Duration::from_secs(1), "subscribe", async {
            Err::<(), _>(Error::NotConnected)
        })
        .await;
        assert!(matches!(failed, Err(Error::NotConnected)));
    }

    #[test]
    fn test_link_state_shared() {
        let state = LinkState::new();
        let watcher = state.clone();
        assert!(state.is_up());

        watcher.mark_down("test");
        assert!(!state.is_up());
        // A second loss report is ignored
        watcher.mark_down("test");
        assert!(!watcher.is_up());
    }

    #[tokio::test]
    async fn test_watch_link_marks_down() {
        let state = LinkState::new();
        watch_link(futures::stream::iter([1, 2, 3]), |n: &i32| *n == 2, state.clone()).await;
        assert!(!state.is_up());

        let state = LinkState::new();
        watch_link(futures::stream::iter([1, 3]), |n: &i32| *n == 2, state.clone()).await;
        assert!(state.is_up());
    }
}
