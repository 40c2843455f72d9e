use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::constants::{defaults, APP_ID};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Read-only snapshot of the persisted catalog, consumed once at startup
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub peripherals: Vec<PeripheralConfig>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_max_service_retries")]
    pub max_service_retries: u32,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeripheralConfig {
    pub address: Address,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stay_connected: bool,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub uuid: Uuid,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CharacteristicConfig {
    pub uuid: Uuid,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub read_freq_secs: Option<u64>,
}

fn default_max_service_retries() -> u32 {
    defaults::MAX_SERVICE_RETRIES
}

fn default_scan_interval_secs() -> u64 {
    defaults::SCAN_INTERVAL_SECS
}

fn default_scan_duration_secs() -> u64 {
    defaults::SCAN_DURATION_SECS
}

impl CharacteristicConfig {
    /// `None` and `0` both mean "never polled"
    pub fn read_interval(&self) -> Option<Duration> {
        self.read_freq_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl PeripheralConfig {
    pub fn find_service(&self, uuid: &Uuid) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} ({})", self.address),
            None => self.address.to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicConfig> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|err| {
            Error::Config(format!("cannot open config file {}: {err}", path.display()))
        })?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config = Self::from_json(&content)?;
        info!(
            "Loaded {} configured peripheral(s) from {}",
            config.peripherals.len(),
            path.display()
        );

        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config = serde_json::from_str::<Self>(content)
            .map_err(|err| Error::Config(format!("failed to deserialize config {err}")))?;
        config.validate()?;

        Ok(config)
    }

    /// Services and characteristics are ordered sets: identifiers must be unique at every level
    pub fn validate(&self) -> Result<()> {
        let mut addresses = HashSet::new();

        for peripheral in &self.peripherals {
            if !addresses.insert(peripheral.address) {
                return Err(Error::Config(format!(
                    "peripheral {} is configured twice",
                    peripheral.address
                )));
            }

            let mut services = HashSet::new();
            for service in &peripheral.services {
                if !services.insert(service.uuid) {
                    return Err(Error::Config(format!(
                        "service {} is configured twice for peripheral {}",
                        service.uuid, peripheral.address
                    )));
                }

                let mut characteristics = HashSet::new();
                for charac in &service.characteristics {
                    if !characteristics.insert(charac.uuid) {
                        return Err(Error::Config(format!(
                            "characteristic {} is configured twice for service {}",
                            charac.uuid, service.uuid
                        )));
                    }
                }
            }
        }

        if self.retry.max_attempts == 0 {
            warn!("retry.max_attempts is 0, peripherals go dormant on the first failure");
        }

        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc").join(APP_ID).join("config.json")
}
