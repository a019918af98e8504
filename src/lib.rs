// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A paravirtualized network front-end driver.
//!
//! The front-end exchanges Ethernet frames with a back-end peer in another
//! domain over a pair of shared-memory rings, one per direction. Pages
//! carrying ring state and frame payloads are shared through grant
//! capabilities, work is signalled over an inter-domain event channel, and the
//! initial handshake (ring references, event channel, feature negotiation)
//! happens through a hierarchical configuration store.
//!
//! The platform services the driver depends on — the grant table, the event
//! channel service, the configuration store, and the page allocator — are
//! injected as trait objects via [`Platform`], so the driver runs unmodified
//! against the real hypervisor interfaces or against the in-process
//! simulation in [`sim`].

#![forbid(unsafe_code)]

pub mod device;
pub mod evtchn;
pub mod gnttab;
pub mod mac_address;
pub mod mm;
pub mod protocol;
pub mod ring;
pub mod sim;
pub mod store;
mod transport;

use crate::evtchn::EventChannel;
use crate::gnttab::GrantTable;
use crate::mm::PageAllocator;
use crate::store::Store;
use std::sync::Arc;
use thiserror::Error;

pub use device::Device;
pub use device::Driver;
pub use mac_address::MacAddress;
pub use transport::Features;
pub use transport::InterfaceStats;

/// Errors surfaced to users of the driver.
#[derive(Debug, Error)]
pub enum Error {
    /// Any unanticipated failure, with a human-readable detail string.
    #[error("unknown: {0}")]
    Unknown(String),
    /// The operation is recognized but unsupported in the current build.
    #[error("operation not implemented")]
    Unimplemented,
    /// The device was previously connected but has since been removed.
    #[error("device has been disconnected")]
    Disconnected,
}

pub(crate) fn unknown(err: impl std::fmt::Display) -> Error {
    Error::Unknown(err.to_string())
}

/// The platform services the driver runs against.
///
/// Cloning is cheap; all services are shared.
#[derive(Clone)]
pub struct Platform {
    /// The grant table allocator.
    pub grants: Arc<dyn GrantTable>,
    /// The inter-domain event channel service.
    pub events: Arc<dyn EventChannel>,
    /// The configuration store client.
    pub store: Arc<dyn Store>,
    /// The page allocator.
    pub pages: Arc<dyn PageAllocator>,
}
