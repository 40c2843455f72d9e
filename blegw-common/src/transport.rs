use uuid::Uuid;

use crate::gateway::Handle;

/// Capability interface over the radio.
///
/// Every method only issues the request and returns immediately, the outcome comes back later as a
/// [`TransportEvent`](crate::gateway::TransportEvent) carrying the same handle.
pub trait Transport {
    fn scan(&mut self);
    fn connect(&mut self, handle: Handle);
    fn disconnect(&mut self, handle: Handle);
    fn discover_services(&mut self, handle: Handle);
    fn discover_characteristics(&mut self, handle: Handle, service: Uuid);
    fn read(&mut self, handle: Handle, service: Uuid, characteristic: Uuid);
    fn subscribe(&mut self, handle: Handle, service: Uuid, characteristic: Uuid);
}
