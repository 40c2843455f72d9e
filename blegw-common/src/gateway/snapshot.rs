use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::gateway::{
    Characteristic, GatewayManager, Peripheral, PeripheralState, Service, ServiceState,
};

/// Read-only copy of the gateway tree handed to operator tooling
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub scanning: bool,
    pub peripherals: Vec<PeripheralSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeripheralSnapshot {
    pub address: Address,
    pub name: Option<String>,
    pub stay_connected: bool,
    pub stopped: bool,
    pub state: PeripheralState,
    pub attempts: u32,
    pub retry_in_ms: Option<u64>,
    pub services: Vec<ServiceSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub uuid: Uuid,
    pub state: ServiceState,
    pub characteristics: Vec<CharacteristicSnapshot>,
}

/// One device reported by the last scan, configured or not
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub address: Address,
    pub name: Option<String>,
    pub configured: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicSnapshot {
    pub uuid: Uuid,
    pub notify: bool,
    pub read_interval_secs: Option<u64>,
    pub subscribed: bool,
    pub pending: bool,
    pub last_value_at: Option<DateTime<Utc>>,
}

impl GatewayManager {
    pub fn snapshot(&self) -> GatewaySnapshot {
        let now = Instant::now();

        GatewaySnapshot {
            scanning: self.is_scanning(),
            peripherals: self
                .peripherals()
                .iter()
                .map(|p| PeripheralSnapshot::new(p, now))
                .collect(),
        }
    }
}

impl PeripheralSnapshot {
    fn new(peripheral: &Peripheral, now: Instant) -> Self {
        Self {
            address: peripheral.address(),
            name: peripheral.name().map(str::to_owned),
            stay_connected: peripheral.stay_connected(),
            stopped: peripheral.is_stopped(),
            state: peripheral.state(),
            attempts: peripheral.attempts(),
            retry_in_ms: peripheral
                .retry_at()
                .map(|due| due.saturating_duration_since(now).as_millis() as u64),
            services: peripheral.services().iter().map(ServiceSnapshot::from).collect(),
        }
    }
}

impl From<&Service> for ServiceSnapshot {
    fn from(service: &Service) -> Self {
        Self {
            uuid: service.uuid,
            state: service.state(),
            characteristics: service
                .characteristics()
                .iter()
                .map(CharacteristicSnapshot::from)
                .collect(),
        }
    }
}

impl From<&Characteristic> for CharacteristicSnapshot {
    fn from(charac: &Characteristic) -> Self {
        Self {
            uuid: charac.uuid,
            notify: charac.notify,
            read_interval_secs: charac.read_interval.map(|interval| interval.as_secs()),
            subscribed: charac.is_subscribed(),
            pending: charac.has_pending_response(),
            last_value_at: charac.last_value_at(),
        }
    }
}

impl fmt::Display for GatewaySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scanning {
            writeln!(f, "(scanning)")?;
        }

        if self.peripherals.is_empty() {
            return writeln!(f, "No peripheral configured");
        }

        for peripheral in &self.peripherals {
            write!(f, "{}", peripheral.address)?;
            if let Some(name) = &peripheral.name {
                write!(f, " {name}")?;
            }
            write!(f, " [{}]", peripheral.state)?;
            if peripheral.stay_connected {
                write!(f, " stay-connected")?;
            }
            if peripheral.stopped {
                write!(f, " stopped")?;
            }
            if let Some(retry) = peripheral.retry_in_ms {
                write!(f, " retry #{} in {retry}ms", peripheral.attempts)?;
            }
            writeln!(f)?;

            for service in &peripheral.services {
                writeln!(f, "  service {} [{}]", service.uuid, service.state)?;

                for charac in &service.characteristics {
                    write!(f, "    characteristic {}", charac.uuid)?;
                    if charac.notify {
                        write!(
                            f,
                            " notify({})",
                            if charac.subscribed { "on" } else { "off" }
                        )?;
                    }
                    if let Some(secs) = charac.read_interval_secs {
                        write!(f, " every {secs}s")?;
                    }
                    if charac.pending {
                        write!(f, " pending")?;
                    }
                    if let Some(at) = charac.last_value_at {
                        write!(f, " last value {}", at.format("%Y-%m-%d %H:%M:%S"))?;
                    }
                    writeln!(f)?;
                }
            }
        }

        Ok(())
    }
}
