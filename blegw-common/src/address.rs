use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::ADDR_LEN;
use crate::error::Error;

/// Bluetooth device address, the identity a configured peripheral is matched on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDR_LEN]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self
            .0
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(":");

        f.write_str(&hex)
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Accepts `xx:xx:xx:xx:xx:xx` or `xxxxxxxxxxxx`, case-insensitive
    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let digits = address
            .trim()
            .chars()
            .filter(|c| *c != ':')
            .collect::<Vec<_>>();

        if digits.len() != ADDR_LEN * 2 {
            return Err(Error::Address(format!(
                "{address} must be of length {ADDR_LEN} => xx:xx:xx:xx:xx:xx"
            )));
        }

        let mut addr = [0; ADDR_LEN];
        for (i, pair) in digits.chunks(2).enumerate() {
            let pair = pair.iter().collect::<String>();
            addr[i] = u8::from_str_radix(&pair, 16).map_err(|err| {
                Error::Address(format!("cannot parse {address} to hex value ({err})"))
            })?;
        }

        Ok(Self(addr))
    }
}

impl From<[u8; ADDR_LEN]> for Address {
    fn from(bytes: [u8; ADDR_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<btleplug::api::BDAddr> for Address {
    fn from(addr: btleplug::api::BDAddr) -> Self {
        Self(addr.into_inner())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
