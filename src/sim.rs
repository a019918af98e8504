// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process simulation of the platform services.
//!
//! [`SimPlatform`] bundles a grant table, event channel service,
//! configuration store, and page allocator that behave like the real ones
//! but live in this process, plus a scriptable back-end peer
//! ([`BackendVif`]) that operates the back half of a device's rings.
//! Useful for tests and for running the driver without a hypervisor.

use crate::evtchn::EventChannel;
use crate::evtchn::NoFreePorts;
use crate::evtchn::Port;
use crate::gnttab::DomId;
use crate::gnttab::GrantRef;
use crate::gnttab::GrantTable;
use crate::gnttab::GrantsExhausted;
use crate::mm::HeapPages;
use crate::mm::Page;
use crate::mm::PAGE_SIZE;
use crate::protocol;
use crate::protocol::RxRequest;
use crate::protocol::RxResponse;
use crate::protocol::TxRequest;
use crate::protocol::TxResponse;
use crate::protocol::RX_SLOT_SIZE;
use crate::protocol::TX_SLOT_SIZE;
use crate::ring;
use crate::ring::MAX_SLOT_SIZE;
use crate::store::vif_path;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreTransaction;
use crate::Platform;
use async_trait::async_trait;
use event_listener::Event;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// References start above zero so truncated request ids are recognizable in
/// test failures.
const GREF_BASE: u32 = 8;

struct GrantEntry {
    page: Option<Page>,
    domid: Option<DomId>,
    writable: bool,
    active: bool,
}

#[derive(Default)]
struct GrantState {
    next: u32,
    free: Vec<u32>,
    entries: HashMap<u32, GrantEntry>,
    limit: Option<usize>,
    granted: u64,
    ended: u64,
}

/// A grant table over in-process pages.
pub struct SimGrantTable {
    state: parking_lot::Mutex<GrantState>,
}

impl SimGrantTable {
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(GrantState {
                next: GREF_BASE,
                ..Default::default()
            }),
        }
    }

    /// Caps the number of outstanding references, to provoke allocation
    /// failure in tests. `None` removes the cap.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.state.lock().limit = limit;
    }

    /// The number of references currently held by the driver.
    pub fn outstanding(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Total `grant_access` and `end_access` calls so far.
    pub fn counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.granted, state.ended)
    }

    /// Maps an actively granted reference the way the peer domain would,
    /// returning the page, the domain it was granted to, and writability.
    pub fn page_for(&self, gref: GrantRef) -> Option<(Page, DomId, bool)> {
        let state = self.state.lock();
        let entry = state.entries.get(&gref.0)?;
        if !entry.active {
            return None;
        }
        Some((entry.page.clone()?, entry.domid?, entry.writable))
    }
}

impl Default for SimGrantTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GrantTable for SimGrantTable {
    fn get(&self) -> Result<GrantRef, GrantsExhausted> {
        let mut state = self.state.lock();
        if state.limit.is_some_and(|limit| state.entries.len() >= limit) {
            return Err(GrantsExhausted);
        }
        let gref = state.free.pop().unwrap_or_else(|| {
            let gref = state.next;
            state.next += 1;
            gref
        });
        state.entries.insert(
            gref,
            GrantEntry {
                page: None,
                domid: None,
                writable: false,
                active: false,
            },
        );
        Ok(GrantRef(gref))
    }

    fn get_n(&self, n: usize) -> Result<Vec<GrantRef>, GrantsExhausted> {
        {
            let state = self.state.lock();
            if state.limit.is_some_and(|limit| state.entries.len() + n > limit) {
                return Err(GrantsExhausted);
            }
        }
        (0..n).map(|_| self.get()).collect()
    }

    fn grant_access(&self, gref: GrantRef, domid: DomId, page: &Page, writable: bool) {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&gref.0)
            .expect("grant_access on unallocated ref");
        assert!(!entry.active, "grant_access on active ref");
        entry.page = Some(page.clone());
        entry.domid = Some(domid);
        entry.writable = writable;
        entry.active = true;
        state.granted += 1;
    }

    fn end_access(&self, gref: GrantRef) {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&gref.0)
            .expect("end_access on unallocated ref");
        assert!(entry.active, "end_access on inactive ref");
        entry.active = false;
        state.ended += 1;
    }

    fn put(&self, gref: GrantRef) {
        let mut state = self.state.lock();
        // A ref may be put while still active when its ring has been shut
        // down and the peer can no longer reach it.
        state
            .entries
            .remove(&gref.0)
            .expect("put of unallocated ref");
        state.free.push(gref.0);
    }
}

struct PortState {
    epoch: parking_lot::Mutex<u64>,
    event: Event,
    closed: AtomicBool,
    masked: AtomicBool,
}

/// An event channel service whose signals stay in this process.
pub struct SimEventChannels {
    ports: parking_lot::Mutex<HashMap<u32, Arc<PortState>>>,
    next_port: AtomicU32,
    notifies: AtomicU64,
}

impl SimEventChannels {
    pub fn new() -> Self {
        Self {
            ports: parking_lot::Mutex::new(HashMap::new()),
            next_port: AtomicU32::new(1),
            notifies: AtomicU64::new(0),
        }
    }

    fn port_state(&self, port: Port) -> Option<Arc<PortState>> {
        self.ports.lock().get(&port.to_int()).cloned()
    }

    /// Signals `port` from the peer side, without counting it as a driver
    /// notification.
    pub fn signal(&self, port: Port) {
        if let Some(state) = self.port_state(port) {
            *state.epoch.lock() += 1;
            state.event.notify(usize::MAX);
        }
    }

    /// The number of [`EventChannel::notify`] calls the driver has made.
    pub fn notify_count(&self) -> u64 {
        self.notifies.load(Ordering::Relaxed)
    }

    /// Whether `port` still has delivery masked.
    pub fn is_masked(&self, port: Port) -> bool {
        self.port_state(port)
            .map(|state| state.masked.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl Default for SimEventChannels {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventChannel for SimEventChannels {
    fn bind_unbound_port(&self, _remote: DomId) -> Result<Port, NoFreePorts> {
        let raw = self.next_port.fetch_add(1, Ordering::Relaxed);
        self.ports.lock().insert(
            raw,
            Arc::new(PortState {
                epoch: parking_lot::Mutex::new(0),
                event: Event::new(),
                closed: AtomicBool::new(false),
                masked: AtomicBool::new(true),
            }),
        );
        Ok(Port::new(raw))
    }

    fn notify(&self, port: Port) {
        self.notifies.fetch_add(1, Ordering::Relaxed);
        self.signal(port);
    }

    fn unmask(&self, port: Port) {
        if let Some(state) = self.port_state(port) {
            state.masked.store(false, Ordering::Relaxed);
        }
    }

    fn close(&self, port: Port) {
        if let Some(state) = self.port_state(port) {
            state.closed.store(true, Ordering::Relaxed);
            state.event.notify(usize::MAX);
        }
    }

    fn is_valid(&self, port: Port) -> bool {
        self.port_state(port)
            .is_some_and(|state| !state.closed.load(Ordering::Relaxed))
    }

    async fn after(&self, port: Port, epoch: u64) -> u64 {
        loop {
            let Some(state) = self.port_state(port) else {
                return epoch;
            };
            let listener = state.event.listen();
            let current = *state.epoch.lock();
            if current > epoch || state.closed.load(Ordering::Relaxed) {
                return current;
            }
            listener.await;
        }
    }
}

/// An in-process configuration store with last-writer-wins transactions.
pub struct SimStore {
    tree: Arc<parking_lot::Mutex<BTreeMap<String, String>>>,
}

impl SimStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(parking_lot::Mutex::new(BTreeMap::new())),
        }
    }

    /// Seeds a key, as the host toolstack would.
    pub fn insert(&self, path: &str, value: &str) {
        self.tree.lock().insert(path.to_string(), value.to_string());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.tree.lock().get(path).cloned()
    }

    pub fn remove(&self, path: &str) {
        self.tree.lock().remove(path);
    }
}

impl Default for SimStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for SimStore {
    async fn read(&self, path: &str) -> Result<String, StoreError> {
        self.tree
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchKey(path.to_string()))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{path}/");
        let children: BTreeSet<String> = self
            .tree
            .lock()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| {
                let rest = &key[prefix.len()..];
                rest.split('/').next().unwrap_or(rest).to_string()
            })
            .collect();
        if children.is_empty() {
            return Err(StoreError::NoSuchKey(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    async fn transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(SimTransaction {
            tree: self.tree.clone(),
            writes: Vec::new(),
        }))
    }
}

struct SimTransaction {
    tree: Arc<parking_lot::Mutex<BTreeMap<String, String>>>,
    writes: Vec<(String, String)>,
}

#[async_trait]
impl StoreTransaction for SimTransaction {
    async fn read(&mut self, path: &str) -> Result<String, StoreError> {
        if let Some((_, value)) = self.writes.iter().rev().find(|(key, _)| key == path) {
            return Ok(value.clone());
        }
        self.tree
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchKey(path.to_string()))
    }

    async fn write(&mut self, path: &str, value: &str) -> Result<(), StoreError> {
        self.writes.push((path.to_string(), value.to_string()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tree = self.tree.lock();
        for (key, value) in self.writes {
            tree.insert(key, value);
        }
        Ok(())
    }
}

/// The full set of simulated services.
pub struct SimPlatform {
    pub grants: Arc<SimGrantTable>,
    pub events: Arc<SimEventChannels>,
    pub store: Arc<SimStore>,
    pub pages: Arc<HeapPages>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            grants: Arc::new(SimGrantTable::new()),
            events: Arc::new(SimEventChannels::new()),
            store: Arc::new(SimStore::new()),
            pages: Arc::new(HeapPages),
        }
    }

    /// The services as a [`Platform`] for the driver.
    pub fn platform(&self) -> Platform {
        Platform {
            grants: self.grants.clone(),
            events: self.events.clone(),
            store: self.store.clone(),
            pages: self.pages.clone(),
        }
    }

    /// Seeds the store entries the toolstack writes for interface `id`,
    /// returning the back-end path.
    pub fn add_vif(&self, id: u32, backend_domid: DomId, mac: &str) -> String {
        let path = vif_path(id);
        let backend = format!("backend/vif/{id}");
        self.store
            .insert(&format!("{path}/backend-id"), &backend_domid.0.to_string());
        self.store.insert(&format!("{path}/backend"), &backend);
        self.store.insert(&format!("{path}/mac"), mac);
        backend
    }

    /// Attaches a back-end to the rings interface `id` has published.
    ///
    /// Must be called after the driver has connected (or resumed) the
    /// interface, and again after every resume: the published ring
    /// references change.
    pub fn attach_backend(&self, id: u32) -> BackendVif {
        let path = vif_path(id);
        let ring_page = |key: &str| {
            let gref = self
                .store
                .get(&format!("{path}/{key}"))
                .expect("ring reference not published")
                .parse()
                .expect("malformed ring reference");
            let (page, _, writable) = self
                .grants
                .page_for(GrantRef(gref))
                .expect("ring page not granted");
            assert!(writable, "ring pages are granted writable");
            page
        };
        let tx_page = ring_page("tx-ring-ref");
        let rx_page = ring_page("rx-ring-ref");
        let port = Port::new(
            self.store
                .get(&format!("{path}/event-channel"))
                .expect("event channel not published")
                .parse()
                .expect("malformed event channel"),
        );
        BackendVif {
            grants: self.grants.clone(),
            events: self.events.clone(),
            port,
            tx: ring::Back::new(tx_page, TX_SLOT_SIZE),
            rx: ring::Back::new(rx_page, RX_SLOT_SIZE),
        }
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// A transmit request as observed by the back-end, with the payload bytes
/// read out of the granted page.
#[derive(Debug, Clone)]
pub struct TxSeen {
    pub id: u16,
    pub gref: u32,
    pub offset: u16,
    pub flags: u16,
    pub size: u16,
    pub data: Vec<u8>,
}

/// The back half of one interface's rings, driven by a test or by
/// [`BackendVif::run_echo`].
pub struct BackendVif {
    grants: Arc<SimGrantTable>,
    events: Arc<SimEventChannels>,
    port: Port,
    tx: ring::Back,
    rx: ring::Back,
}

impl BackendVif {
    pub fn port(&self) -> Port {
        self.port
    }

    /// Signals the front, as the peer would after producing responses.
    pub fn signal(&self) {
        self.events.signal(self.port);
    }

    /// Consumes up to `limit` transmit requests, completing each with
    /// `OKAY`, and returns what was seen.
    pub fn process_tx_limit(&mut self, limit: usize) -> Vec<TxSeen> {
        let mut seen = Vec::new();
        let mut slot = [0u8; MAX_SLOT_SIZE];
        while seen.len() < limit && self.tx.take_request(&mut slot[..TX_SLOT_SIZE]) {
            let req = TxRequest::read_from_prefix(&slot[..TX_SLOT_SIZE]).unwrap().0;
            let (page, _, writable) = self
                .grants
                .page_for(GrantRef(req.gref.get()))
                .expect("tx gref not granted");
            assert!(!writable, "tx pages are granted read-only");
            let offset = req.offset.get() as usize;
            // For the head of a fragment group `size` declares the whole
            // frame, so this over-reads; assemble_frames trims it.
            let len = (req.size.get() as usize).min(PAGE_SIZE - offset);
            let mut data = vec![0u8; len];
            page.read_at(offset, &mut data);
            seen.push(TxSeen {
                id: req.id.get(),
                gref: req.gref.get(),
                offset: req.offset.get(),
                flags: req.flags.get(),
                size: req.size.get(),
                data,
            });
            self.tx
                .push_response(TxResponse::new(req.id.get(), protocol::RSP_OKAY).as_bytes());
        }
        if !seen.is_empty() && self.tx.push_responses_and_check_notify() {
            self.signal();
        }
        self.tx.final_check_for_requests();
        seen
    }

    /// Consumes and completes every pending transmit request.
    pub fn process_tx(&mut self) -> Vec<TxSeen> {
        self.process_tx_limit(usize::MAX)
    }

    /// Reassembles whole frames from a run of observed requests, honoring
    /// the fragment-group convention: the head carries the frame total and
    /// `MORE_DATA`, and the final fragment carries no flags.
    pub fn assemble_frames(seen: &[TxSeen]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut iter = seen.iter();
        while let Some(head) = iter.next() {
            if head.flags & protocol::TXF_MORE_DATA == 0 {
                frames.push(head.data.clone());
                continue;
            }
            let total = head.size as usize;
            let mut tail = Vec::new();
            let mut tail_len = 0;
            loop {
                let frag = iter.next().expect("fragment group truncated");
                tail_len += frag.data.len();
                tail.push(frag);
                if frag.flags & protocol::TXF_MORE_DATA == 0 {
                    break;
                }
            }
            let head_len = total.checked_sub(tail_len).expect("fragment sizes exceed total");
            let mut frame = head.data[..head_len].to_vec();
            for frag in tail {
                frame.extend_from_slice(&frag.data);
            }
            frames.push(frame);
        }
        frames
    }

    /// Writes `frame` into the next posted receive buffer and completes it.
    /// Returns false if the front has no buffers posted.
    pub fn deliver_rx(&mut self, frame: &[u8]) -> bool {
        assert!(frame.len() <= PAGE_SIZE);
        let mut slot = [0u8; MAX_SLOT_SIZE];
        if !self.rx.take_request(&mut slot[..RX_SLOT_SIZE]) {
            return false;
        }
        let req = RxRequest::read_from_prefix(&slot[..RX_SLOT_SIZE]).unwrap().0;
        let (page, _, writable) = self
            .grants
            .page_for(GrantRef(req.gref.get()))
            .expect("rx gref not granted");
        assert!(writable, "rx pages are granted writable");
        page.write_at(0, frame);
        self.rx.push_response(
            RxResponse::new(req.id.get(), 0, 0, frame.len() as i16).as_bytes(),
        );
        if self.rx.push_responses_and_check_notify() {
            self.signal();
        }
        self.rx.final_check_for_requests();
        true
    }

    /// Fails the next posted receive buffer with `status`.
    pub fn fail_rx(&mut self, status: i16) -> bool {
        assert!(status <= 0);
        let mut slot = [0u8; MAX_SLOT_SIZE];
        if !self.rx.take_request(&mut slot[..RX_SLOT_SIZE]) {
            return false;
        }
        let req = RxRequest::read_from_prefix(&slot[..RX_SLOT_SIZE]).unwrap().0;
        self.rx
            .push_response(RxResponse::new(req.id.get(), 0, 0, status).as_bytes());
        if self.rx.push_responses_and_check_notify() {
            self.signal();
        }
        self.rx.final_check_for_requests();
        true
    }

    /// Echoes every transmitted frame back to the front until the event
    /// channel closes.
    pub async fn run_echo(mut self) {
        let mut epoch = 0;
        loop {
            let seen = self.process_tx();
            for frame in Self::assemble_frames(&seen) {
                if !self.deliver_rx(&frame) {
                    tracing::warn!("echo dropped a frame: no rx buffer posted");
                }
            }
            if !self.events.is_valid(self.port) {
                break;
            }
            epoch = self.events.after(self.port, epoch).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn store_lists_immediate_children() {
        let store = SimStore::new();
        store.insert("device/vif/0/mac", "00:16:3e:00:00:01");
        store.insert("device/vif/0/backend", "backend/vif/0");
        store.insert("device/vif/2/mac", "00:16:3e:00:00:02");
        let mut children = block_on(store.list("device/vif")).unwrap();
        children.sort();
        assert_eq!(children, ["0", "2"]);
        assert!(block_on(store.list("device/net")).is_err());
    }

    #[test]
    fn transaction_commits_atomically_and_reads_its_writes() {
        let store = SimStore::new();
        store.insert("a", "1");
        let mut txn = block_on(store.transaction()).unwrap();
        block_on(txn.write("a", "2")).unwrap();
        block_on(txn.write("b", "3")).unwrap();
        assert_eq!(block_on(txn.read("a")).unwrap(), "2");
        // Nothing visible before commit.
        assert_eq!(store.get("a").unwrap(), "1");
        assert!(store.get("b").is_none());
        block_on(txn.commit()).unwrap();
        assert_eq!(store.get("a").unwrap(), "2");
        assert_eq!(store.get("b").unwrap(), "3");
    }

    #[test]
    fn grant_refs_recycle() {
        let table = SimGrantTable::new();
        let page = Page::new_zeroed();
        let gref = table.get().unwrap();
        table.grant_access(gref, DomId(0), &page, false);
        assert!(table.page_for(gref).is_some());
        table.end_access(gref);
        assert!(table.page_for(gref).is_none());
        table.put(gref);
        assert_eq!(table.outstanding(), 0);
        // The freed ref comes back.
        assert_eq!(table.get().unwrap(), gref);
    }

    #[test]
    fn grant_limit_fails_bulk_acquire() {
        let table = SimGrantTable::new();
        table.set_limit(Some(2));
        let held = table.get_n(2).unwrap();
        assert!(table.get().is_err());
        assert!(table.get_n(1).is_err());
        for gref in held {
            table.put(gref);
        }
        assert!(table.get_n(2).is_ok());
    }

    #[test]
    fn event_epochs_advance_and_close_wakes() {
        let events = SimEventChannels::new();
        let port = events.bind_unbound_port(DomId(0)).unwrap();
        assert!(events.is_masked(port));
        events.unmask(port);
        assert!(!events.is_masked(port));
        events.signal(port);
        let epoch = block_on(events.after(port, 0));
        assert_eq!(epoch, 1);
        events.close(port);
        assert!(!events.is_valid(port));
        // A wait on a closed port returns immediately.
        block_on(events.after(port, epoch));
    }
}
