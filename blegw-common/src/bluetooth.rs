use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic as BtleCharacteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral as InnerDevice, PeripheralId};
use futures::StreamExt;
use log::*;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::address::Address;
use crate::error::{Error, Result, TransportError};
use crate::gateway::{Handle, TransportEvent};
use crate::transport::Transport;

const NO_ADAPTER_FOUND: &str = "Failed to get Bluetooth adapter. (maybe your Bluetooth is OFF ?)";

#[derive(Default)]
struct Registry {
    /// Configured addresses, the only devices worth caching
    known: HashSet<Address>,
    /// Platform devices seen during scans
    devices: HashMap<Address, InnerDevice>,
    /// Handle of the connection currently bound to each address
    handles: HashMap<Address, Handle>,
    /// Notification forwarder of the current connection, the platform stream outlives it
    listeners: HashMap<Address, JoinHandle<()>>,
}

impl Registry {
    fn stop_listening(&mut self, address: &Address) {
        if let Some(listener) = self.listeners.remove(address) {
            listener.abort();
        }
    }

    fn release(&mut self, handle: &Handle) {
        if self.handles.get(&handle.address) == Some(handle) {
            self.handles.remove(&handle.address);
            self.stop_listening(&handle.address);
        }
    }

    fn device(&self, address: &Address) -> std::result::Result<InnerDevice, TransportError> {
        self.devices
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::new(format!("{address} has not been seen by a scan")))
    }

    fn handle_of(&self, id: &PeripheralId) -> Option<Handle> {
        let (address, _) = self.devices.iter().find(|(_, device)| &device.id() == id)?;
        self.handles.get(address).copied()
    }
}

/// btleplug backed transport.
///
/// Each request runs on its own task, results and adapter events come back on one channel so the
/// gateway consumes them in order from a single place.
#[derive(Clone)]
pub struct BtleTransport {
    adapter: Adapter,
    registry: Arc<Mutex<Registry>>,
    tx: UnboundedSender<TransportEvent>,
    scan_duration: Duration,
}

impl BtleTransport {
    /// Only devices in `known` are kept around for connecting, every device is still reported
    pub async fn new(
        scan_duration: Duration,
        known: impl IntoIterator<Item = Address>,
    ) -> Result<(Self, UnboundedReceiver<TransportEvent>)> {
        let manager = Manager::new().await.map_err(TransportError::from)?;
        let adapters = manager.adapters().await.map_err(TransportError::from)?;
        let Some(adapter) = adapters.into_iter().next() else {
            return Err(Error::Transport(TransportError::new(NO_ADAPTER_FOUND)));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            adapter,
            registry: Arc::new(Mutex::new(Registry {
                known: known.into_iter().collect(),
                ..Default::default()
            })),
            tx,
            scan_duration,
        };

        let events = transport
            .adapter
            .events()
            .await
            .map_err(TransportError::from)?;
        tokio::spawn(transport.clone().forward_adapter_events(events));

        Ok((transport, rx))
    }

    async fn forward_adapter_events(
        self,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    ) {
        while let Some(event) = events.next().await {
            match event {
                // Devices cached by the OS stack only show up as updates on later scans, the
                // gateway keeps the first report of each scan
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let Ok(device) = self.adapter.peripheral(&id).await else {
                        continue;
                    };
                    let address = Address::from(device.address());
                    {
                        let mut registry = self.registry.lock().await;
                        if registry.known.contains(&address) {
                            registry.devices.insert(address, device);
                        }
                    }

                    // If it errors, channel is closed and the gateway is shutting down
                    if self.tx.send(TransportEvent::Discovered { address }).is_err() {
                        break;
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let handle = {
                        let mut registry = self.registry.lock().await;
                        let handle = registry.handle_of(&id);
                        if let Some(handle) = &handle {
                            registry.release(handle);
                        }
                        handle
                    };

                    if let Some(handle) = handle {
                        let _ = self.tx.send(TransportEvent::Disconnected {
                            handle,
                            error: None,
                        });
                    }
                }
                _ => (),
            }
        }

        debug!("Adapter event stream ended");
    }

    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = TransportEvent> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(request.await);
        });
    }

    async fn device(&self, address: &Address) -> std::result::Result<InnerDevice, TransportError> {
        self.registry.lock().await.device(address)
    }

    async fn characteristic(
        &self,
        handle: &Handle,
        service: Uuid,
        characteristic: Uuid,
    ) -> std::result::Result<(InnerDevice, BtleCharacteristic), TransportError> {
        let device = self.device(&handle.address).await?;
        let charac = device
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| {
                TransportError::new(format!(
                    "characteristic {characteristic} of service {service} not exposed by {}",
                    handle.address
                ))
            })?;

        Ok((device, charac))
    }

    /// Forwards notifications of one connection until its stream ends
    async fn forward_notifications(self, handle: Handle, device: InnerDevice) {
        let mut notifications = match device.notifications().await {
            Ok(stream) => stream,
            Err(error) => {
                warn!("Cannot listen to notifications of {handle}: {error}");
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            let service = device
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == notification.uuid)
                .map(|c| c.service_uuid);

            let Some(service) = service else {
                trace!("Notification from unknown characteristic {}", notification.uuid);
                continue;
            };

            let event = TransportEvent::Notification {
                handle,
                service,
                characteristic: notification.uuid,
                value: notification.value,
            };
            if self.tx.send(event).is_err() {
                break;
            }
        }
    }
}

impl Transport for BtleTransport {
    fn scan(&mut self) {
        let this = self.clone();
        self.spawn_request(async move {
            match this.adapter.start_scan(ScanFilter::default()).await {
                Ok(()) => {
                    sleep(this.scan_duration).await;
                    if let Err(error) = this.adapter.stop_scan().await {
                        warn!("Failed to stop scan: {error}");
                    }
                }
                Err(error) => error!("Failed to start scan: {error}"),
            }

            TransportEvent::ScanStopped
        });
    }

    fn connect(&mut self, handle: Handle) {
        let this = self.clone();
        self.spawn_request(async move {
            let device = {
                let mut registry = this.registry.lock().await;
                registry.handles.insert(handle.address, handle);
                registry.device(&handle.address)
            };

            let device = match device {
                Ok(device) => device,
                Err(error) => return TransportEvent::ConnectFailed { handle, error },
            };

            if let Err(error) = device.connect().await {
                this.registry.lock().await.handles.remove(&handle.address);
                return TransportEvent::ConnectFailed {
                    handle,
                    error: error.into(),
                };
            }

            let listener = tokio::spawn(this.clone().forward_notifications(handle, device));
            let mut registry = this.registry.lock().await;
            if let Some(previous) = registry.listeners.insert(handle.address, listener) {
                previous.abort();
            }

            TransportEvent::Connected { handle }
        });
    }

    fn disconnect(&mut self, handle: Handle) {
        let this = self.clone();
        tokio::spawn(async move {
            let device = {
                let mut registry = this.registry.lock().await;
                registry.release(&handle);
                registry.device(&handle.address)
            };

            let result = match device {
                Ok(device) => device.disconnect().await.map_err(TransportError::from),
                Err(error) => Err(error),
            };

            // The peripheral released this handle already, nothing to report back
            if let Err(error) = result {
                debug!("Disconnecting {handle} failed: {error}");
            }
        });
    }

    fn discover_services(&mut self, handle: Handle) {
        let this = self.clone();
        self.spawn_request(async move {
            let result = async {
                let device = this.device(&handle.address).await?;
                device.discover_services().await?;

                Ok::<_, TransportError>(device.services().iter().map(|s| s.uuid).collect())
            };

            match result.await {
                Ok(services) => TransportEvent::ServicesDiscovered { handle, services },
                Err(error) => TransportEvent::ServicesFailed { handle, error },
            }
        });
    }

    fn discover_characteristics(&mut self, handle: Handle, service: Uuid) {
        let this = self.clone();
        self.spawn_request(async move {
            let result = this.device(&handle.address).await.and_then(|device| {
                device
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service)
                    .map(|s| s.characteristics.iter().map(|c| c.uuid).collect::<Vec<_>>())
                    .ok_or_else(|| TransportError::new(format!("service {service} vanished")))
            });

            match result {
                Ok(characteristics) => TransportEvent::CharacteristicsDiscovered {
                    handle,
                    service,
                    characteristics,
                },
                Err(error) => TransportEvent::CharacteristicsFailed {
                    handle,
                    service,
                    error,
                },
            }
        });
    }

    fn read(&mut self, handle: Handle, service: Uuid, characteristic: Uuid) {
        let this = self.clone();
        self.spawn_request(async move {
            let result = async {
                let (device, charac) = this.characteristic(&handle, service, characteristic).await?;

                Ok::<_, TransportError>(device.read(&charac).await?)
            };

            match result.await {
                Ok(value) => TransportEvent::ReadComplete {
                    handle,
                    service,
                    characteristic,
                    value,
                },
                Err(error) => TransportEvent::ReadFailed {
                    handle,
                    service,
                    characteristic,
                    error,
                },
            }
        });
    }

    fn subscribe(&mut self, handle: Handle, service: Uuid, characteristic: Uuid) {
        let this = self.clone();
        self.spawn_request(async move {
            let result = async {
                let (device, charac) = this.characteristic(&handle, service, characteristic).await?;

                Ok::<_, TransportError>(device.subscribe(&charac).await?)
            };

            match result.await {
                Ok(()) => TransportEvent::Subscribed {
                    handle,
                    service,
                    characteristic,
                },
                Err(error) => TransportEvent::SubscribeFailed {
                    handle,
                    service,
                    characteristic,
                    error,
                },
            }
        });
    }
}
