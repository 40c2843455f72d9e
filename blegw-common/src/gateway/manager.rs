use std::time::Instant;

use log::*;

use crate::address::Address;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::gateway::{Peripheral, PeripheralState, ScanResult, TransportEvent, ValueReceived};
use crate::transport::Transport;

/// Orchestration layer: owns every configured peripheral and routes transport events to them.
///
/// All methods are meant to be called from the single task consuming the transport event stream,
/// nothing in here locks.
#[derive(Debug)]
pub struct GatewayManager {
    peripherals: Vec<Peripheral>,
    scanning: bool,
    /// Every device reported since the last scan started, first report only
    scan_results: Vec<ScanResult>,
}

impl GatewayManager {
    pub fn new(config: &GatewayConfig) -> Self {
        let peripherals = config
            .peripherals
            .iter()
            .map(|peripheral| {
                Peripheral::from_config(
                    peripheral.clone(),
                    config.retry,
                    config.max_service_retries,
                )
            })
            .collect();

        Self {
            peripherals,
            scanning: false,
            scan_results: Vec::new(),
        }
    }

    pub fn peripherals(&self) -> &[Peripheral] {
        &self.peripherals
    }

    pub fn find_peripheral(&self, address: &Address) -> Option<&Peripheral> {
        self.peripherals.iter().find(|p| &p.address() == address)
    }

    fn peripheral_mut(&mut self, address: &Address) -> Result<&mut Peripheral> {
        self.peripherals
            .iter_mut()
            .find(|p| &p.address() == address)
            .ok_or_else(|| Error::NotFound(format!("peripheral {address}")))
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn scan_results(&self) -> &[ScanResult] {
        &self.scan_results
    }

    /// True while some peripheral can only be revived by a scan match
    pub fn needs_scan(&self) -> bool {
        self.peripherals
            .iter()
            .any(|p| p.is_dormant() && !p.is_stopped())
    }

    pub fn scan(&mut self, transport: &mut dyn Transport) {
        if self.scanning {
            debug!("Scan already running");
            return;
        }

        info!("Scanning for {} configured peripheral(s)", self.peripherals.len());
        self.scanning = true;
        self.scan_results.clear();
        transport.scan();
    }

    /// Routes one transport event, returning the value to forward upstream if it carried one
    pub fn handle_event(
        &mut self,
        event: TransportEvent,
        transport: &mut dyn Transport,
    ) -> Option<ValueReceived> {
        match self.dispatch(event, transport) {
            Ok(received) => received,
            // Already logged where it was rejected
            Err(Error::InvalidState { .. }) => None,
            Err(err) => {
                warn!("Dropping transport event: {err}");
                None
            }
        }
    }

    fn dispatch(
        &mut self,
        event: TransportEvent,
        transport: &mut dyn Transport,
    ) -> Result<Option<ValueReceived>> {
        let handle = match &event {
            TransportEvent::Discovered { address } => {
                self.on_scan_match(*address, transport)?;
                return Ok(None);
            }
            TransportEvent::ScanStopped => {
                debug!("Scan stopped, {} device(s) reported", self.scan_results.len());
                self.scanning = false;
                return Ok(None);
            }
            event => match event.handle() {
                Some(handle) => *handle,
                None => return Ok(None),
            },
        };

        let peripheral = self.peripheral_mut(&handle.address)?;
        if !peripheral.accepts(&handle) {
            debug!("Discarding stale completion for {handle}");
            return Ok(None);
        }

        match event {
            TransportEvent::Connected { .. } => peripheral.on_connect_success(transport)?,
            TransportEvent::ConnectFailed { error, .. } => peripheral.on_connect_failure(&error)?,
            TransportEvent::Disconnected { error, .. } => {
                peripheral.on_disconnect(error.as_ref())?
            }
            TransportEvent::ServicesDiscovered { services, .. } => {
                peripheral.on_discover_services_success(&services, transport)?
            }
            TransportEvent::ServicesFailed { error, .. } => {
                peripheral.on_discover_services_failure(&error, transport)?
            }
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                ..
            } => peripheral.on_discover_characteristics_success(
                &service,
                &characteristics,
                transport,
            )?,
            TransportEvent::CharacteristicsFailed { service, error, .. } => {
                peripheral.on_discover_characteristics_failure(&service, &error, transport)?
            }
            TransportEvent::Subscribed {
                service,
                characteristic,
                ..
            } => peripheral.on_subscribed(&service, &characteristic)?,
            TransportEvent::SubscribeFailed {
                service,
                characteristic,
                error,
                ..
            } => peripheral.on_subscribe_failed(&service, &characteristic, &error)?,
            TransportEvent::ReadComplete {
                service,
                characteristic,
                value,
                ..
            } => {
                return peripheral
                    .on_read_complete(&service, &characteristic, value)
                    .map(Some)
            }
            TransportEvent::ReadFailed {
                service,
                characteristic,
                error,
                ..
            } => peripheral.on_read_failed(&service, &characteristic, &error)?,
            TransportEvent::Notification {
                service,
                characteristic,
                value,
                ..
            } => {
                return peripheral
                    .on_notification(&service, &characteristic, value)
                    .map(Some)
            }
            // Scan level events never carry a handle
            _ => return Ok(None),
        }

        Ok(None)
    }

    /// Records the report and revives the matching peripheral. The radio repeats reports on every
    /// advertisement, only the first one of a scan counts.
    fn on_scan_match(&mut self, address: Address, transport: &mut dyn Transport) -> Result<()> {
        if self.scan_results.iter().any(|r| r.address == address) {
            return Ok(());
        }

        let peripheral = self.peripherals.iter_mut().find(|p| p.address() == address);
        self.scan_results.push(ScanResult {
            address,
            name: peripheral
                .as_ref()
                .and_then(|p| p.name().map(str::to_owned)),
            configured: peripheral.is_some(),
        });

        match peripheral {
            Some(peripheral) => peripheral.on_discovered(address, transport),
            None => {
                trace!("Ignoring unknown device {address}");
                Ok(())
            }
        }
    }

    /// Fires due reconnects and reads
    pub fn poll(&mut self, now: Instant, transport: &mut dyn Transport) {
        for peripheral in self.peripherals.iter_mut() {
            peripheral.poll(now, transport);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.peripherals
            .iter()
            .filter_map(Peripheral::next_deadline)
            .min()
    }

    /// Operator read cycle on one peripheral
    pub fn prepare_for_read(&mut self, address: &Address) -> Result<()> {
        self.peripheral_mut(address)?.prepare_for_read()
    }

    pub fn stop(&mut self, address: &Address, transport: &mut dyn Transport) -> Result<()> {
        self.peripheral_mut(address)?.stop(transport);

        Ok(())
    }

    /// Operator start, undoes a previous [`Self::stop`]
    pub fn start(&mut self, address: &Address, transport: &mut dyn Transport) -> Result<()> {
        self.peripheral_mut(address)?.start(transport);

        Ok(())
    }

    pub fn stop_all(&mut self, transport: &mut dyn Transport) {
        for peripheral in self
            .peripherals
            .iter_mut()
            .filter(|p| p.state() != PeripheralState::Unconnected || p.retry_at().is_some())
        {
            peripheral.stop(transport);
        }
    }
}
