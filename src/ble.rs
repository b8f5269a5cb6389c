use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{AromaTechError, Result},
    negotiator::known_product,
    types::DiscoveredDevice,
    CHARACTERISTIC_UUID, MANUFACTURER_ID, SERVICE_UUID,
};

const DISCOVERY_POLL_MS: u64 = 250;

/// One frame pushed by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Raw frame
    pub data: Bytes,
    /// Signal strength when the frame arrived
    pub rssi: Option<i16>,
}

/// Which advertisements count as diffusers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Manufacturer id in advertising data
    pub manufacturer_id: u16,
    /// Accept devices whose name matches a known product
    pub match_names: bool,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            manufacturer_id: MANUFACTURER_ID,
            match_names: true,
        }
    }
}

impl DiscoveryFilter {
    /// Check an advertisement against this filter
    #[must_use]
    pub fn matches(&self, name: Option<&str>, manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
        if manufacturer_data.contains_key(&self.manufacturer_id) {
            return true;
        }
        self.match_names && name.and_then(known_product).is_some()
    }
}

/// Check advertising data for an AromaTech diffuser
#[must_use]
pub fn is_aromatech_device(name: Option<&str>, manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
    DiscoveryFilter::default().matches(name, manufacturer_data)
}

/// BLE capability the session drives
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection handle produced by [`Transport::connect`]
    type Link: Link;

    /// Scan for `window` and return the devices accepted by `filter`
    async fn scan(&self, filter: &DiscoveryFilter, window: Duration)
        -> Result<Vec<DiscoveredDevice>>;

    /// Open a GATT connection to the diffuser at `address`
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Self::Link>;
}

/// An open GATT connection to one diffuser
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Write a frame to the command characteristic
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Start notification delivery
    ///
    /// The channel closes when the link drops.
    async fn subscribe(&self, queue: usize) -> Result<mpsc::Receiver<Notification>>;

    /// Current signal strength
    async fn rssi(&self) -> Option<i16>;

    /// Check if the link is still up
    async fn is_connected(&self) -> bool;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;
}

/// [`Transport`] over the host's first Bluetooth adapter
pub struct BleTransport {
    manager: Manager,
}

impl BleTransport {
    /// Create a new BLE transport
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(AromaTechError::DeviceNotFound)
    }

    async fn find_peripheral(
        adapter: &Adapter,
        address: BDAddr,
        within: Duration,
    ) -> Result<Peripheral> {
        let deadline = Instant::now() + within;
        let mut scanning = false;

        loop {
            let found = adapter
                .peripherals()
                .await?
                .into_iter()
                .find(|p| p.address() == address);

            if let Some(peripheral) = found {
                if scanning {
                    adapter.stop_scan().await?;
                }
                return Ok(peripheral);
            }

            if Instant::now() >= deadline {
                if scanning {
                    adapter.stop_scan().await?;
                }
                return Err(AromaTechError::DeviceNotFound);
            }

            if !scanning {
                debug!("{} not cached, scanning", address);
                adapter.start_scan(ScanFilter::default()).await?;
                scanning = true;
            }
            sleep(Duration::from_millis(DISCOVERY_POLL_MS)).await;
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    type Link = BleLink;

    async fn scan(
        &self,
        filter: &DiscoveryFilter,
        window: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        info!("Starting scan for AromaTech diffusers...");

        let adapter = self.adapter().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        sleep(window).await;
        adapter.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let name = properties.local_name.as_deref();
            if !filter.matches(name, &properties.manufacturer_data) {
                continue;
            }

            let device = DiscoveredDevice {
                name: name.unwrap_or("Unknown AromaTech").to_string(),
                address: properties.address.to_string(),
                rssi: properties.rssi,
            };
            info!("Found diffuser: {} ({})", device.name, device.address);
            devices.push(device);
        }

        info!("Scan completed. Found {} diffuser(s)", devices.len());
        Ok(devices)
    }

    async fn connect(&self, address: &str, connect_timeout: Duration) -> Result<BleLink> {
        info!("Connecting to diffuser at {}", address);

        let addr: BDAddr = address
            .parse()
            .map_err(|e| AromaTechError::Transport(format!("Invalid address {address}: {e}")))?;
        let adapter = self.adapter().await?;
        let peripheral = Self::find_peripheral(&adapter, addr, connect_timeout).await?;

        let timeout_ms = u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX);
        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| AromaTechError::Timeout { timeout_ms })?
            .map_err(|e| AromaTechError::Transport(format!("Connect failed: {e}")))?;

        peripheral.discover_services().await?;

        let service_uuid = Uuid::parse_str(SERVICE_UUID)
            .map_err(|e| AromaTechError::Protocol(format!("Invalid service UUID: {e}")))?;
        let char_uuid = Uuid::parse_str(CHARACTERISTIC_UUID)
            .map_err(|e| AromaTechError::Protocol(format!("Invalid characteristic UUID: {e}")))?;

        let characteristic = peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service_uuid)
            .and_then(|s| s.characteristics.iter().find(|c| c.uuid == char_uuid))
            .cloned()
            .ok_or_else(|| {
                AromaTechError::Protocol("Diffuser characteristic not found".to_string())
            })?;

        info!("Connected to {}", address);

        Ok(BleLink {
            adapter,
            peripheral,
            characteristic,
            forwarder: Mutex::new(None),
        })
    }
}

/// [`Link`] over a btleplug peripheral
pub struct BleLink {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristic: Characteristic,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BleLink {
    /// Device address
    #[must_use]
    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }
}

#[async_trait]
impl Link for BleLink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        debug!("Writing frame: {:02X?}", data);

        self.peripheral
            .write(&self.characteristic, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| AromaTechError::Transport(format!("Write failed: {e}")))
    }

    async fn subscribe(&self, queue: usize) -> Result<mpsc::Receiver<Notification>> {
        self.peripheral.subscribe(&self.characteristic).await?;

        let mut notifications = self.peripheral.notifications().await?;
        let mut events = self.adapter.events().await?;
        let peripheral = self.peripheral.clone();
        let char_uuid = self.characteristic.uuid;
        let (tx, rx) = mpsc::channel(queue.max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            debug!("Notification stream ended");
                            break;
                        };
                        if notification.uuid != char_uuid {
                            continue;
                        }
                        let rssi = peripheral
                            .properties()
                            .await
                            .ok()
                            .flatten()
                            .and_then(|p| p.rssi);
                        let frame = Notification {
                            data: Bytes::from(notification.value),
                            rssi,
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral.id() => {
                            warn!("Diffuser {} disconnected", peripheral.address());
                            break;
                        }
                        None => break,
                        Some(_) => {}
                    },
                }
            }
        });

        if let Some(previous) = self.forwarder.lock().await.replace(handle) {
            previous.abort();
        }

        Ok(rx)
    }

    async fn rssi(&self) -> Option<i16> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.rssi)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            forwarder.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        if let Ok(mut forwarder) = self.forwarder.try_lock() {
            if let Some(handle) = forwarder.take() {
                handle.abort();
            }
        }
    }
}
