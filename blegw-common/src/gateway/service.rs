use std::fmt;
use std::time::Instant;

use log::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::config::ServiceConfig;
use crate::error::{Error, Result, TransportError};
use crate::gateway::{Characteristic, Handle, ValueReceived};
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    #[default]
    Sleep,
    DiscoveringCharacteristics,
    DiscoveredCharacteristics,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the owning peripheral should do after a characteristic discovery failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryFailure {
    /// Retry budget left, discover again on the same connection
    Retry,
    /// Local retries exhausted, the whole peripheral must reconnect
    Escalate,
}

#[derive(Clone, Debug)]
pub struct Service {
    pub uuid: Uuid,
    /// Owning peripheral, lookup only
    pub peripheral: Address,
    state: ServiceState,
    config: ServiceConfig,
    characteristics: Vec<Characteristic>,
    failures: u32,
    max_retries: u32,
}

impl Service {
    pub fn new(peripheral: Address, config: ServiceConfig, max_retries: u32) -> Self {
        Self {
            uuid: config.uuid,
            peripheral,
            state: ServiceState::Sleep,
            config,
            characteristics: Vec::new(),
            failures: 0,
            max_retries,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    pub fn characteristic_uuids(&self) -> Vec<Uuid> {
        self.characteristics.iter().map(|c| c.uuid).collect()
    }

    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }

    fn reject<T>(&self, op: &'static str) -> Result<T> {
        error!(
            "{op} rejected for service {} of {} in state {}",
            self.uuid, self.peripheral, self.state
        );

        Err(Error::InvalidState {
            op,
            entity: format!("service {}", self.uuid),
            state: self.state.to_string(),
        })
    }

    fn characteristic_mut(&mut self, uuid: &Uuid) -> Result<&mut Characteristic> {
        let service = self.uuid;
        self.characteristics
            .iter_mut()
            .find(|c| &c.uuid == uuid)
            .ok_or_else(|| Error::NotFound(format!("characteristic {uuid} in service {service}")))
    }

    pub fn discover_characteristics(
        &mut self,
        handle: Handle,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.state != ServiceState::Sleep {
            return self.reject("discover_characteristics");
        }

        debug!("Discovering characteristics of service {} on {handle}", self.uuid);
        transport.discover_characteristics(handle, self.uuid);
        self.state = ServiceState::DiscoveringCharacteristics;

        Ok(())
    }

    /// Instantiates every configured characteristic among `uuids`, then subscribes and arms reads
    pub fn on_discover_characteristics_success(
        &mut self,
        uuids: &[Uuid],
        handle: Handle,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.state != ServiceState::DiscoveringCharacteristics {
            return self.reject("on_discover_characteristics_success");
        }

        let mut characteristics = Vec::with_capacity(self.config.characteristics.len());
        for uuid in uuids {
            if characteristics.iter().any(|c: &Characteristic| &c.uuid == uuid) {
                continue;
            }

            match self.config.find_characteristic(uuid) {
                Some(config) => characteristics.push(Characteristic::from_config(self.uuid, config)),
                None => trace!("Ignoring unconfigured characteristic {uuid} of service {}", self.uuid),
            }
        }

        for missing in self
            .config
            .characteristics
            .iter()
            .filter(|c| !characteristics.iter().any(|found| found.uuid == c.uuid))
        {
            warn!(
                "Configured characteristic {} not exposed by service {} of {}",
                missing.uuid, self.uuid, self.peripheral
            );
        }

        self.characteristics = characteristics;
        self.state = ServiceState::DiscoveredCharacteristics;
        self.failures = 0;

        info!(
            "Service {} of {} discovered {} characteristic(s)",
            self.uuid,
            self.peripheral,
            self.characteristics.len()
        );

        let now = Instant::now();
        for charac in self.characteristics.iter_mut() {
            if charac.request_subscribe() {
                transport.subscribe(handle, self.uuid, charac.uuid);
            }
            charac.arm(now);
        }

        Ok(())
    }

    pub fn on_discover_characteristics_failure(
        &mut self,
        error: &TransportError,
    ) -> Result<DiscoveryFailure> {
        if self.state != ServiceState::DiscoveringCharacteristics {
            return self.reject("on_discover_characteristics_failure");
        }

        self.state = ServiceState::Sleep;
        self.failures += 1;

        if self.failures > self.max_retries {
            warn!(
                "Characteristic discovery of service {} failed {} times ({error}), escalating",
                self.uuid, self.failures
            );
            self.failures = 0;
            return Ok(DiscoveryFailure::Escalate);
        }

        warn!(
            "Characteristic discovery of service {} failed ({error}), retry {}/{}",
            self.uuid, self.failures, self.max_retries
        );

        Ok(DiscoveryFailure::Retry)
    }

    pub fn any_pending_responses(&self) -> bool {
        self.characteristics.iter().any(|c| c.has_pending_response())
    }

    /// Back to `Sleep` without issuing anything, the caller decides whether to discover again
    pub fn reset(&mut self) {
        self.state = ServiceState::Sleep;
        self.failures = 0;
        self.characteristics.iter_mut().for_each(Characteristic::reset);
    }

    /// Any discovery completion still in flight is discarded once it arrives
    pub fn stop(&mut self) {
        if self.state == ServiceState::DiscoveringCharacteristics {
            debug!("Cancelling characteristic discovery of service {}", self.uuid);
        }

        self.reset();
    }

    /// Clears pending bookkeeping and schedules every periodic characteristic for an immediate read
    pub fn prepare_for_read(&mut self, now: Instant) {
        for charac in self.characteristics.iter_mut() {
            charac.clear_pending();
            charac.arm(now);
        }
    }

    /// Issues the periodic reads that are due and subscriptions that failed on a previous tick
    pub fn poll(&mut self, handle: Handle, now: Instant, transport: &mut dyn Transport) {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return;
        }

        for charac in self.characteristics.iter_mut() {
            if charac.request_subscribe() {
                debug!("Subscribing again to characteristic {}", charac.uuid);
                transport.subscribe(handle, self.uuid, charac.uuid);
            }

            if charac.take_due_read(now) {
                trace!("Reading characteristic {} on {handle}", charac.uuid);
                transport.read(handle, self.uuid, charac.uuid);
            }
        }
    }

    pub fn next_read(&self) -> Option<Instant> {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return None;
        }

        self.characteristics.iter().filter_map(|c| c.next_read()).min()
    }

    /// Returns whether a request went out, at most one read is ever outstanding
    pub fn read(
        &mut self,
        characteristic: &Uuid,
        handle: Handle,
        transport: &mut dyn Transport,
    ) -> Result<bool> {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return self.reject("read");
        }

        let service = self.uuid;
        let charac = self.characteristic_mut(characteristic)?;
        if !charac.request_read() {
            debug!("Read of characteristic {characteristic} already pending");
            return Ok(false);
        }

        transport.read(handle, service, *characteristic);

        Ok(true)
    }

    pub fn on_read_complete(&mut self, characteristic: &Uuid, value: Vec<u8>) -> Result<ValueReceived> {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return self.reject("on_read_complete");
        }

        let timestamp = self.characteristic_mut(characteristic)?.on_read_complete();

        Ok(self.value_received(characteristic, value, timestamp))
    }

    pub fn on_read_failed(&mut self, characteristic: &Uuid, error: &TransportError) -> Result<()> {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return self.reject("on_read_failed");
        }

        warn!("Read of characteristic {characteristic} failed: {error}");
        self.characteristic_mut(characteristic)?.on_read_failed();

        Ok(())
    }

    pub fn on_subscribed(&mut self, characteristic: &Uuid) -> Result<()> {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return self.reject("on_subscribed");
        }

        debug!("Subscribed to characteristic {characteristic}");
        self.characteristic_mut(characteristic)?.on_subscribed();

        Ok(())
    }

    pub fn on_subscribe_failed(
        &mut self,
        characteristic: &Uuid,
        error: &TransportError,
    ) -> Result<()> {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return self.reject("on_subscribe_failed");
        }

        warn!("Subscribing to characteristic {characteristic} failed: {error}");
        self.characteristic_mut(characteristic)?.on_subscribe_failed();

        Ok(())
    }

    pub fn on_notification(&mut self, characteristic: &Uuid, value: Vec<u8>) -> Result<ValueReceived> {
        if self.state != ServiceState::DiscoveredCharacteristics {
            return self.reject("on_notification");
        }

        let timestamp = self.characteristic_mut(characteristic)?.on_notification();

        Ok(self.value_received(characteristic, value, timestamp))
    }

    fn value_received(
        &self,
        characteristic: &Uuid,
        value: Vec<u8>,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> ValueReceived {
        ValueReceived {
            peripheral: self.peripheral,
            service: self.uuid,
            characteristic: *characteristic,
            value,
            timestamp,
        }
    }
}
