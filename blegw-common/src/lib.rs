pub mod address;
pub mod bluetooth;
pub mod config;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod logger;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod tests;

pub use address::Address;
pub use error::{Error, Result, TransportError};
pub use transport::Transport;
