// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hierarchical configuration store contract.
//!
//! The store holds `/`-separated string keys and is shared with the host
//! control plane. The driver uses it for the plug handshake: it reads the
//! back-end's coordinates, publishes its ring references and event channel
//! in one transaction, and reads the back-end's advertised features in
//! another.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist.
    #[error("no such key: {0}")]
    NoSuchKey(String),
    /// The transaction could not be committed.
    #[error("store transaction failed")]
    TransactionFailed,
}

/// The configuration store client.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the value at `path`.
    async fn read(&self, path: &str) -> Result<String, StoreError>;

    /// Lists the immediate child names under `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Opens a transaction. Reads and writes inside it commit atomically.
    async fn transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// An open store transaction.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn read(&mut self, path: &str) -> Result<String, StoreError>;

    async fn write(&mut self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Commits the transaction's writes atomically.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// The standard device state enumeration used on `state` keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
}

impl DeviceState {
    /// The decimal wire form written to the store.
    pub fn wire(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "0",
            DeviceState::Initialising => "1",
            DeviceState::InitWait => "2",
            DeviceState::Initialised => "3",
            DeviceState::Connected => "4",
            DeviceState::Closing => "5",
            DeviceState::Closed => "6",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        match value {
            "1" => DeviceState::Initialising,
            "2" => DeviceState::InitWait,
            "3" => DeviceState::Initialised,
            "4" => DeviceState::Connected,
            "5" => DeviceState::Closing,
            "6" => DeviceState::Closed,
            _ => DeviceState::Unknown,
        }
    }
}

/// The store directory for virtual interface `id`.
pub fn vif_path(id: u32) -> String {
    format!("device/vif/{id}")
}

#[cfg(test)]
mod tests {
    use super::DeviceState;

    #[test]
    fn state_wire_round_trip() {
        for state in [
            DeviceState::Initialising,
            DeviceState::InitWait,
            DeviceState::Initialised,
            DeviceState::Connected,
            DeviceState::Closing,
            DeviceState::Closed,
        ] {
            assert_eq!(DeviceState::from_wire(state.wire()), state);
        }
        assert_eq!(DeviceState::from_wire("junk"), DeviceState::Unknown);
    }
}
