use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::address::Address;
use crate::error::TransportError;

/// Binding between a configured peripheral and one physical connection attempt.
///
/// The epoch is bumped every time the peripheral binds again, so a completion carrying an older
/// handle is stale and gets discarded even if the address matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub address: Address,
    pub epoch: u32,
}

impl Handle {
    pub fn new(address: Address, epoch: u32) -> Self {
        Self { address, epoch }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.epoch)
    }
}

/// Completion or unsolicited event delivered by the transport on the serialized event stream
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Discovered {
        address: Address,
    },
    ScanStopped,
    Connected {
        handle: Handle,
    },
    ConnectFailed {
        handle: Handle,
        error: TransportError,
    },
    Disconnected {
        handle: Handle,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        handle: Handle,
        services: Vec<Uuid>,
    },
    ServicesFailed {
        handle: Handle,
        error: TransportError,
    },
    CharacteristicsDiscovered {
        handle: Handle,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    CharacteristicsFailed {
        handle: Handle,
        service: Uuid,
        error: TransportError,
    },
    Subscribed {
        handle: Handle,
        service: Uuid,
        characteristic: Uuid,
    },
    SubscribeFailed {
        handle: Handle,
        service: Uuid,
        characteristic: Uuid,
        error: TransportError,
    },
    ReadComplete {
        handle: Handle,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ReadFailed {
        handle: Handle,
        service: Uuid,
        characteristic: Uuid,
        error: TransportError,
    },
    Notification {
        handle: Handle,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    /// Handle the event belongs to, `None` for scan level events
    pub fn handle(&self) -> Option<&Handle> {
        match self {
            Self::Discovered { .. } | Self::ScanStopped => None,
            Self::Connected { handle }
            | Self::ConnectFailed { handle, .. }
            | Self::Disconnected { handle, .. }
            | Self::ServicesDiscovered { handle, .. }
            | Self::ServicesFailed { handle, .. }
            | Self::CharacteristicsDiscovered { handle, .. }
            | Self::CharacteristicsFailed { handle, .. }
            | Self::Subscribed { handle, .. }
            | Self::SubscribeFailed { handle, .. }
            | Self::ReadComplete { handle, .. }
            | Self::ReadFailed { handle, .. }
            | Self::Notification { handle, .. } => Some(handle),
        }
    }
}

/// Emitted for every characteristic value the gateway receives, forwarded upstream as is
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValueReceived {
    pub peripheral: Address,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}
