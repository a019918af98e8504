// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The inter-domain event channel contract.
//!
//! Signals are edge-triggered and carry no payload; waiters observe them
//! through a monotonically increasing per-port epoch. Spurious wakeups are
//! allowed, so waiters must re-check their condition after every wait.

use crate::gnttab::DomId;
use async_trait::async_trait;
use thiserror::Error;

/// An event channel port.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Port(u32);

impl Port {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw port number, as published in the configuration store.
    pub fn to_int(self) -> u32 {
        self.0
    }
}

/// Error returned when no event channel port can be bound.
#[derive(Debug, Error)]
#[error("no free event channel ports")]
pub struct NoFreePorts;

/// The event channel service.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Binds a fresh port to the remote domain. The port starts masked.
    fn bind_unbound_port(&self, remote: DomId) -> Result<Port, NoFreePorts>;

    /// Signals the remote end of `port`.
    fn notify(&self, port: Port);

    /// Enables signal delivery on `port`.
    fn unmask(&self, port: Port);

    /// Closes `port`. Pending and future waits on it complete immediately.
    fn close(&self, port: Port);

    /// Returns whether `port` names a live channel.
    fn is_valid(&self, port: Port) -> bool;

    /// Waits for a signal on `port` strictly after `epoch`, returning the
    /// new epoch. Returns immediately if one has already arrived, or if the
    /// port is closed or unknown.
    async fn after(&self, port: Port, epoch: u64) -> u64;
}
