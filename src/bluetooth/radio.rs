/// Platform radio access behind a trait, with a BlueZ implementation
use std::collections::HashSet;
use std::pin::Pin;

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use futures_util::{Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::OnceCell;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::bluetooth::error::BleError;
use crate::models::{PeripheralHandle, RawNotification};

const SERVICE_RESOLVE_ATTEMPTS: u32 = 20;
const SERVICE_RESOLVE_POLL_MS: u64 = 250;

pub type DiscoveryStream = Pin<Box<dyn Stream<Item = PeripheralHandle> + Send>>;
pub type DisconnectStream = Pin<Box<dyn Stream<Item = ()> + Send>>;
pub type PayloadStream = Pin<Box<dyn Stream<Item = RawNotification> + Send>>;

/// Operations the session core needs from the radio
///
/// Streams returned here end their radio-side session when dropped.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Bring the radio up; safe to call repeatedly
    async fn initialize(&self) -> Result<(), BleError>;

    /// Start discovery of peripherals advertising `service`
    async fn start_scan(&self, service: Uuid) -> Result<DiscoveryStream, BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Connect and return a stream yielding once when the link drops
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<DisconnectStream, BleError>;

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), BleError>;

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<PayloadStream, BleError>;

    async fn unsubscribe(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError>;
}

/// BlueZ radio using the default adapter
pub struct BluerRadio {
    adapter: OnceCell<Adapter>,
}

impl BluerRadio {
    pub fn new() -> Self {
        BluerRadio {
            adapter: OnceCell::new(),
        }
    }

    async fn adapter(&self) -> Result<&Adapter, BleError> {
        self.adapter
            .get_or_try_init(|| async {
                // Initialize Bluetooth session
                let session = bluer::Session::new().await.map_err(|e| {
                    error!("Failed to create Bluetooth session: {}", e);
                    BleError::RadioInit(e.to_string())
                })?;

                // Get the default Bluetooth adapter
                let adapter = session.default_adapter().await.map_err(|e| {
                    error!("Failed to get default Bluetooth adapter: {}", e);
                    BleError::RadioInit(e.to_string())
                })?;

                // Ensure Bluetooth adapter is powered on
                adapter.set_powered(true).await.map_err(|e| {
                    error!("Failed to power on adapter: {}", e);
                    BleError::RadioInit(e.to_string())
                })?;

                info!("Using Bluetooth adapter {}", adapter.name());
                Ok::<Adapter, BleError>(adapter)
            })
            .await
    }

    async fn device(&self, peripheral: &PeripheralHandle) -> Result<Device, String> {
        let address: Address = peripheral
            .id
            .parse()
            .map_err(|e| format!("invalid address {}: {}", peripheral.id, e))?;
        let adapter = self.adapter().await.map_err(|e| e.to_string())?;
        adapter.device(address).map_err(|e| e.to_string())
    }

    async fn wait_for_services(device: &Device) -> Result<(), String> {
        for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
            if device.is_services_resolved().await.map_err(|e| e.to_string())? {
                return Ok(());
            }
            sleep(Duration::from_millis(SERVICE_RESOLVE_POLL_MS)).await;
        }
        Err("GATT services were not resolved in time".to_string())
    }
}

impl Default for BluerRadio {
    fn default() -> Self {
        Self::new()
    }
}

async fn describe_device(adapter: &Adapter, address: Address) -> Option<PeripheralHandle> {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("Discovered device {} vanished: {}", address, e);
            return None;
        }
    };

    Some(PeripheralHandle {
        id: address.to_string(),
        name: device.name().await.ok().flatten(),
        rssi: device.rssi().await.ok().flatten(),
    })
}

#[async_trait]
impl Radio for BluerRadio {
    async fn initialize(&self) -> Result<(), BleError> {
        self.adapter().await.map(|_| ())
    }

    async fn start_scan(&self, service: Uuid) -> Result<DiscoveryStream, BleError> {
        let adapter = self.adapter().await?.clone();

        // Configure discovery filter for Low Energy devices advertising our service
        let filter = bluer::DiscoveryFilter {
            uuids: HashSet::from([service]),
            transport: bluer::DiscoveryTransport::Le,
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let events = adapter.discover_devices().await.map_err(|e| {
            error!("Failed to start device discovery: {}", e);
            BleError::Scan(e.to_string())
        })?;

        let handles = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(address) => describe_device(&adapter, address).await,
                    other => {
                        debug!("Discovery event: {:?}", other);
                        None
                    }
                }
            }
        });

        Ok(Box::pin(handles))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        // BlueZ ends discovery once the event stream from start_scan is dropped
        debug!("Discovery session released");
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<DisconnectStream, BleError> {
        let device = self.device(peripheral).await.map_err(BleError::Connect)?;

        if !device.is_connected().await.unwrap_or(false) {
            device
                .connect()
                .await
                .map_err(|e| BleError::Connect(e.to_string()))?;
        }

        let events = device
            .events()
            .await
            .map_err(|e| BleError::Connect(e.to_string()))?;

        let disconnects = events.filter_map(|event| async move {
            match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => Some(()),
                _ => None,
            }
        });

        Ok(Box::pin(disconnects))
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), BleError> {
        let device = self.device(peripheral).await.map_err(BleError::Disconnect)?;
        device
            .disconnect()
            .await
            .map_err(|e| BleError::Disconnect(e.to_string()))
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<PayloadStream, BleError> {
        let device = self
            .device(peripheral)
            .await
            .map_err(BleError::Subscription)?;
        Self::wait_for_services(&device)
            .await
            .map_err(BleError::Subscription)?;

        let services = device
            .services()
            .await
            .map_err(|e| BleError::Subscription(e.to_string()))?;

        for gatt_service in services {
            if gatt_service.uuid().await.ok() != Some(service) {
                continue;
            }

            let characteristics = gatt_service
                .characteristics()
                .await
                .map_err(|e| BleError::Subscription(e.to_string()))?;

            for gatt_char in characteristics {
                if gatt_char.uuid().await.ok() != Some(characteristic) {
                    continue;
                }

                let notifications = gatt_char
                    .notify()
                    .await
                    .map_err(|e| BleError::Subscription(e.to_string()))?;
                debug!(
                    "Notifications enabled on {} for {}",
                    characteristic,
                    peripheral.display_name()
                );
                return Ok(Box::pin(notifications));
            }
        }

        Err(BleError::Subscription(format!(
            "characteristic {} not found in service {}",
            characteristic, service
        )))
    }

    async fn unsubscribe(
        &self,
        peripheral: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        // BlueZ stops notifying once the stream from subscribe is dropped
        debug!(
            "Notification session for {} on {} released",
            characteristic,
            peripheral.display_name()
        );
        Ok(())
    }
}
