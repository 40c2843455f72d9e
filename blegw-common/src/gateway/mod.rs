mod characteristic;
mod event;
mod manager;
mod peripheral;
mod service;
mod snapshot;

pub use characteristic::Characteristic;
pub use event::{Handle, TransportEvent, ValueReceived};
pub use manager::GatewayManager;
pub use peripheral::{Peripheral, PeripheralState};
pub use service::{DiscoveryFailure, Service, ServiceState};
pub use snapshot::{
    CharacteristicSnapshot, GatewaySnapshot, PeripheralSnapshot, ScanResult, ServiceSnapshot,
};
