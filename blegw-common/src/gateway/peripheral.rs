use std::fmt;
use std::time::Instant;

use log::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::config::PeripheralConfig;
use crate::error::{Error, Result, TransportError};
use crate::gateway::{DiscoveryFailure, Handle, Service, ValueReceived};
use crate::retry::RetryPolicy;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralState {
    #[default]
    Unconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    DiscoveredServices,
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A configured device and its connection/discovery state machine.
///
/// The transport handle is only bound while the state is one of the connected family, every
/// transition back to [`PeripheralState::Unconnected`] releases it.
#[derive(Clone, Debug)]
pub struct Peripheral {
    config: PeripheralConfig,
    state: PeripheralState,
    handle: Option<Handle>,
    services: Vec<Service>,
    epoch: u32,
    attempts: u32,
    retry_at: Option<Instant>,
    policy: RetryPolicy,
    max_service_retries: u32,
    /// Set by an operator stop, only an operator start clears it
    stopped: bool,
}

impl Peripheral {
    pub fn from_config(config: PeripheralConfig, policy: RetryPolicy, max_service_retries: u32) -> Self {
        Self {
            config,
            state: PeripheralState::Unconnected,
            handle: None,
            services: Vec::new(),
            epoch: 0,
            attempts: 0,
            retry_at: None,
            policy,
            max_service_retries,
            stopped: false,
        }
    }

    pub fn address(&self) -> Address {
        self.config.address
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn stay_connected(&self) -> bool {
        self.config.stay_connected
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Unconnected with nothing scheduled, only a scan match or the operator wakes it up
    pub fn is_dormant(&self) -> bool {
        self.state == PeripheralState::Unconnected && self.retry_at.is_none()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Whether a completion carrying `handle` belongs to the current connection
    pub fn accepts(&self, handle: &Handle) -> bool {
        self.handle.as_ref() == Some(handle)
    }

    pub fn find_service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| s.uuid).collect()
    }

    fn reject<T>(&self, op: &'static str) -> Result<T> {
        error!("{op} rejected for {} in state {}", self.config.address, self.state);

        Err(Error::InvalidState {
            op,
            entity: format!("peripheral {}", self.config.address),
            state: self.state.to_string(),
        })
    }

    fn bound_handle(&self, op: &'static str) -> Result<Handle> {
        match self.handle {
            Some(handle) => Ok(handle),
            None => self.reject(op),
        }
    }

    fn service_mut(&mut self, uuid: &Uuid) -> Result<&mut Service> {
        let address = self.config.address;
        self.services
            .iter_mut()
            .find(|s| &s.uuid == uuid)
            .ok_or_else(|| Error::NotFound(format!("service {uuid} of {address}")))
    }

    fn is_connected_family(&self) -> bool {
        self.state != PeripheralState::Unconnected
    }

    /// Binds a fresh handle and asks the transport to connect
    fn connect(&mut self, transport: &mut dyn Transport) {
        self.epoch = self.epoch.wrapping_add(1);
        let handle = Handle::new(self.config.address, self.epoch);

        info!("Connecting to {} ({handle})", self.config.label());
        self.handle = Some(handle);
        self.state = PeripheralState::Connecting;
        transport.connect(handle);
    }

    /// Drops the connection state and, when configured to stay connected, schedules a reconnect
    fn fall_back(&mut self, reason: &str) {
        self.services.iter_mut().for_each(Service::reset);
        self.handle = None;
        self.state = PeripheralState::Unconnected;

        if !self.config.stay_connected {
            info!(
                "{} is now unconnected ({reason}), waiting for the next scan match",
                self.config.address
            );
            self.retry_at = None;
            return;
        }

        self.attempts += 1;
        match self.policy.delay(self.attempts) {
            Some(delay) => {
                info!(
                    "{} is now unconnected ({reason}), reconnecting in {}ms (attempt {}/{})",
                    self.config.address,
                    delay.as_millis(),
                    self.attempts,
                    self.policy.max_attempts
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                warn!(
                    "{} gave up after {} attempts ({reason}), dormant until the next scan match",
                    self.config.address, self.policy.max_attempts
                );
                self.retry_at = None;
            }
        }
    }

    /// Failure while the link is still up: drop it at the radio level too
    fn abort_connection(&mut self, reason: &str, transport: &mut dyn Transport) {
        if let Some(handle) = self.handle {
            transport.disconnect(handle);
        }

        self.fall_back(reason);
    }

    /// Resets every service's pending bookkeeping and arms the read cycle
    pub fn prepare_for_read(&mut self) -> Result<()> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("prepare_for_read");
        }

        let now = Instant::now();
        self.services
            .iter_mut()
            .for_each(|service| service.prepare_for_read(now));

        Ok(())
    }

    pub fn any_pending_responses(&self) -> bool {
        self.services.iter().any(Service::any_pending_responses)
    }

    /// Scan match. Only a dormant peripheral is revived, reports while connecting, connected,
    /// backing off or stopped by the operator are ignored.
    pub fn on_discovered(&mut self, address: Address, transport: &mut dyn Transport) -> Result<()> {
        if address != self.config.address {
            return Err(Error::NotFound(format!(
                "{address} does not identify peripheral {}",
                self.config.address
            )));
        }

        if self.stopped {
            debug!("{address} was stopped by the operator, ignoring scan match");
            return Ok(());
        }

        if self.is_connected_family() {
            trace!("{address} reported again while {}, ignoring", self.state);
            return Ok(());
        }

        if self.retry_at.is_some() {
            trace!("{address} reported while backing off, ignoring");
            return Ok(());
        }

        self.attempts = 0;
        self.retry_at = None;
        self.connect(transport);

        Ok(())
    }

    pub fn on_connect_success(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if self.state != PeripheralState::Connecting {
            return self.reject("on_connect_success");
        }

        let handle = self.bound_handle("on_connect_success")?;
        self.state = PeripheralState::Connected;
        info!("Connected to {}", self.config.label());

        transport.discover_services(handle);
        self.state = PeripheralState::DiscoveringServices;

        Ok(())
    }

    pub fn on_connect_failure(&mut self, error: &TransportError) -> Result<()> {
        if self.state != PeripheralState::Connecting {
            return self.reject("on_connect_failure");
        }

        warn!("Connecting to {} failed: {error}", self.config.address);
        self.fall_back("connect failed");

        Ok(())
    }

    pub fn on_disconnect(&mut self, error: Option<&TransportError>) -> Result<()> {
        if !self.is_connected_family() {
            return self.reject("on_disconnect");
        }

        match error {
            Some(error) => warn!("{} disconnected: {error}", self.config.address),
            None => info!("{} disconnected", self.config.address),
        }
        self.fall_back("disconnected");

        Ok(())
    }

    /// Attaches a service for every configured uuid in `uuids` (configuration order) and starts
    /// their characteristic discovery
    pub fn on_discover_services_success(
        &mut self,
        uuids: &[Uuid],
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.state != PeripheralState::DiscoveringServices {
            return self.reject("on_discover_services_success");
        }

        let handle = self.bound_handle("on_discover_services_success")?;
        let address = self.config.address;
        let mut previous = std::mem::take(&mut self.services);

        for config in self.config.services.iter().filter(|s| uuids.contains(&s.uuid)) {
            let service = match previous.iter().position(|s| s.uuid == config.uuid) {
                Some(idx) => previous.swap_remove(idx),
                None => Service::new(address, config.clone(), self.max_service_retries),
            };
            self.services.push(service);
        }

        for uuid in uuids.iter().filter(|uuid| self.config.find_service(uuid).is_none()) {
            trace!("Ignoring unconfigured service {uuid} of {address}");
        }

        self.state = PeripheralState::DiscoveredServices;
        self.attempts = 0;
        self.retry_at = None;
        info!(
            "{} discovered {} configured service(s)",
            self.config.label(),
            self.services.len()
        );

        for service in self.services.iter_mut() {
            service.discover_characteristics(handle, transport)?;
        }

        Ok(())
    }

    pub fn on_discover_services_failure(
        &mut self,
        error: &TransportError,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.state != PeripheralState::DiscoveringServices {
            return self.reject("on_discover_services_failure");
        }

        warn!("Service discovery on {} failed: {error}", self.config.address);
        self.abort_connection("service discovery failed", transport);

        Ok(())
    }

    pub fn on_discover_characteristics_success(
        &mut self,
        service: &Uuid,
        uuids: &[Uuid],
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("on_discover_characteristics_success");
        }

        let handle = self.bound_handle("on_discover_characteristics_success")?;
        self.service_mut(service)?
            .on_discover_characteristics_success(uuids, handle, transport)
    }

    /// Service-local retries first, then a full reconnect
    pub fn on_discover_characteristics_failure(
        &mut self,
        service: &Uuid,
        error: &TransportError,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("on_discover_characteristics_failure");
        }

        let handle = self.bound_handle("on_discover_characteristics_failure")?;
        let target = self.service_mut(service)?;
        match target.on_discover_characteristics_failure(error)? {
            DiscoveryFailure::Retry => target.discover_characteristics(handle, transport),
            DiscoveryFailure::Escalate => {
                self.abort_connection("characteristic discovery failed", transport);
                Ok(())
            }
        }
    }

    /// Explicit read, rejected outside of the operating window
    pub fn read(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        transport: &mut dyn Transport,
    ) -> Result<bool> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("read");
        }

        let handle = self.bound_handle("read")?;
        self.service_mut(service)?
            .read(characteristic, handle, transport)
    }

    pub fn on_read_complete(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        value: Vec<u8>,
    ) -> Result<ValueReceived> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("on_read_complete");
        }

        let received = self
            .service_mut(service)?
            .on_read_complete(characteristic, value)?;

        if !self.any_pending_responses() {
            trace!("Read cycle of {} drained", self.config.address);
        }

        Ok(received)
    }

    pub fn on_read_failed(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        error: &TransportError,
    ) -> Result<()> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("on_read_failed");
        }

        self.service_mut(service)?
            .on_read_failed(characteristic, error)
    }

    pub fn on_subscribed(&mut self, service: &Uuid, characteristic: &Uuid) -> Result<()> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("on_subscribed");
        }

        self.service_mut(service)?.on_subscribed(characteristic)
    }

    pub fn on_subscribe_failed(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        error: &TransportError,
    ) -> Result<()> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("on_subscribe_failed");
        }

        self.service_mut(service)?
            .on_subscribe_failed(characteristic, error)
    }

    pub fn on_notification(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        value: Vec<u8>,
    ) -> Result<ValueReceived> {
        if self.state != PeripheralState::DiscoveredServices {
            return self.reject("on_notification");
        }

        self.service_mut(service)?
            .on_notification(characteristic, value)
    }

    /// Fires a due reconnect, or the due reads once the peripheral is operating
    pub fn poll(&mut self, now: Instant, transport: &mut dyn Transport) {
        match self.state {
            PeripheralState::Unconnected => {
                if self.retry_at.is_some_and(|due| due <= now) {
                    self.retry_at = None;
                    self.connect(transport);
                }
            }
            PeripheralState::DiscoveredServices => {
                let Some(handle) = self.handle else {
                    return;
                };

                for service in self.services.iter_mut() {
                    service.poll(handle, now, transport);
                }
            }
            _ => (),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            PeripheralState::Unconnected => self.retry_at,
            PeripheralState::DiscoveredServices => {
                self.services.iter().filter_map(Service::next_read).min()
            }
            _ => None,
        }
    }

    /// Operator stop: cancels whatever is in flight, scan matches are ignored until [`Self::start`]
    pub fn stop(&mut self, transport: &mut dyn Transport) {
        if let Some(handle) = self.handle.take() {
            info!("Stopping {} ({handle})", self.config.label());
            transport.disconnect(handle);
        }

        self.services.iter_mut().for_each(Service::stop);
        self.state = PeripheralState::Unconnected;
        self.retry_at = None;
        self.attempts = 0;
        self.stopped = true;
    }

    /// Operator start: lifts a previous stop and connects right away if nothing else is going on
    pub fn start(&mut self, transport: &mut dyn Transport) {
        if self.stopped {
            info!("{} released by the operator", self.config.address);
            self.stopped = false;
        }

        if self.is_dormant() {
            self.attempts = 0;
            self.connect(transport);
        }
    }
}
