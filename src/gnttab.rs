// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The grant table contract.
//!
//! A grant reference is a capability naming one page the peer domain may
//! access. References move through acquired, granted, access-ended, and
//! released states; a reference must have access ended before it is
//! released, except when the ring it was queued on has been shut down and
//! the peer can no longer reach it.

use crate::mm::Page;
use thiserror::Error;

/// A domain identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DomId(pub u16);

/// An opaque grant reference issued by the grant allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantRef(pub u32);

impl GrantRef {
    /// The ring request id used for requests carrying this grant: the
    /// reference truncated to 16 bits.
    pub fn request_id(&self) -> u16 {
        self.0 as u16
    }
}

impl std::fmt::Display for GrantRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when no grant references are available.
#[derive(Debug, Error)]
#[error("grant references exhausted")]
pub struct GrantsExhausted;

/// The grant table allocator.
pub trait GrantTable: Send + Sync {
    /// Acquires an unused grant reference.
    fn get(&self) -> Result<GrantRef, GrantsExhausted>;

    /// Acquires `n` unused grant references.
    fn get_n(&self, n: usize) -> Result<Vec<GrantRef>, GrantsExhausted>;

    /// Grants `domid` access to `page` through `gref`, read-only unless
    /// `writable`.
    fn grant_access(&self, gref: GrantRef, domid: DomId, page: &Page, writable: bool);

    /// Revokes the peer's access through `gref`.
    fn end_access(&self, gref: GrantRef);

    /// Returns `gref` to the allocator.
    fn put(&self, gref: GrantRef);
}
