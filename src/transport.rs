// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-device transport state: the plugged rings, grant bookkeeping, and the
//! transmit and receive data paths.
//!
//! A `Transport` is built by [`plug`] and owned by a
//! [`Device`](crate::device::Device), which swaps in a fresh one on resume.
//! Once shut down a transport never carries new work; outstanding transmit
//! completions abort with [`Shutdown`] so callers can re-drive their frames
//! on the replacement.

use crate::evtchn::Port;
use crate::gnttab::DomId;
use crate::gnttab::GrantRef;
use crate::mac_address::MacAddress;
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
use crate::store::vif_path;
use crate::store::DeviceState;
use crate::store::StoreError;
use crate::store::StoreTransaction;
use crate::unknown;
use crate::Error;
use crate::Platform;
use futures::channel::oneshot;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Features advertised by the back-end. A missing store key reads as the
/// feature being absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct Features {
    pub sg: bool,
    pub gso_tcpv4: bool,
    pub rx_copy: bool,
    pub rx_flip: bool,
    pub smart_poll: bool,
}

/// A snapshot of the interface counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_pkts: u64,
    pub tx_bytes: u64,
    pub tx_pkts: u64,
}

#[derive(Default)]
struct Stats {
    rx_bytes: AtomicU64,
    rx_pkts: AtomicU64,
    tx_bytes: AtomicU64,
    tx_pkts: AtomicU64,
}

/// The rings this transmit or receive was queued on have been shut down.
/// Retryable: a fresh transport may take the same frame.
#[derive(Debug, thiserror::Error)]
#[error("ring shut down")]
pub(crate) struct Shutdown;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TxError {
    #[error(transparent)]
    Shutdown(#[from] Shutdown),
    #[error(transparent)]
    Fatal(Error),
}

impl From<TxError> for Error {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Shutdown(_) => Error::Unknown("ring shutdown during transmit".into()),
            TxError::Fatal(err) => err,
        }
    }
}

struct TxInFlight {
    gref: GrantRef,
    page: Page,
    done: oneshot::Sender<i16>,
}

struct TxState {
    ring: ring::Front,
    in_flight: HashMap<u16, TxInFlight>,
}

struct RxState {
    ring: ring::Front,
    map: HashMap<u16, (GrantRef, Page)>,
    scratch: Vec<u8>,
}

pub(crate) struct Transport {
    id: u32,
    backend_domid: DomId,
    backend_path: String,
    mac: MacAddress,
    evtchn: Port,
    features: Features,
    tx_ring_gref: GrantRef,
    rx_ring_gref: GrantRef,
    tx: parking_lot::Mutex<TxState>,
    rx: parking_lot::Mutex<RxState>,
    /// Serializes whole transmit operations so the fragments of one
    /// vectored send are never interleaved with other traffic.
    tx_lock: futures::lock::Mutex<()>,
    stats: Stats,
    shut_down: AtomicBool,
    platform: Platform,
}

async fn read_feature(
    txn: &mut Box<dyn StoreTransaction>,
    backend: &str,
    name: &str,
) -> Result<bool, Error> {
    match txn.read(&format!("{backend}/{name}")).await {
        Ok(value) => Ok(value == "1"),
        Err(StoreError::NoSuchKey(_)) => Ok(false),
        Err(err) => Err(unknown(err)),
    }
}

/// Ends access on a ring page grant and returns the reference.
fn unplug_ring(platform: &Platform, gref: GrantRef) {
    platform.grants.end_access(gref);
    platform.grants.put(gref);
}

/// The store side of the plug handshake: reads the back-end coordinates,
/// publishes the rings and event channel, and reads the advertised features.
async fn handshake(
    platform: &Platform,
    path: &str,
    tx_ring_gref: GrantRef,
    rx_ring_gref: GrantRef,
    evtchn: Port,
) -> Result<(String, MacAddress, Features), Error> {
    let store = &platform.store;
    let backend_path = store
        .read(&format!("{path}/backend"))
        .await
        .map_err(unknown)?;
    let mac = store
        .read(&format!("{path}/mac"))
        .await
        .map_err(unknown)?
        .parse::<MacAddress>()
        .map_err(|_| Error::Unknown("invalid mac".into()))?;

    // Publish our side of the handshake atomically.
    let mut txn = store.transaction().await.map_err(unknown)?;
    txn.write(&format!("{path}/tx-ring-ref"), &tx_ring_gref.to_string())
        .await
        .map_err(unknown)?;
    txn.write(&format!("{path}/rx-ring-ref"), &rx_ring_gref.to_string())
        .await
        .map_err(unknown)?;
    txn.write(
        &format!("{path}/event-channel"),
        &evtchn.to_int().to_string(),
    )
    .await
    .map_err(unknown)?;
    txn.write(&format!("{path}/request-rx-copy"), "1")
        .await
        .map_err(unknown)?;
    txn.write(&format!("{path}/feature-rx-notify"), "1")
        .await
        .map_err(unknown)?;
    txn.write(&format!("{path}/feature-sg"), "1")
        .await
        .map_err(unknown)?;
    txn.write(&format!("{path}/state"), DeviceState::Connected.wire())
        .await
        .map_err(unknown)?;
    txn.commit().await.map_err(unknown)?;

    // Read the advertised feature set in one consistent snapshot.
    let mut txn = store.transaction().await.map_err(unknown)?;
    let features = Features {
        sg: read_feature(&mut txn, &backend_path, "feature-sg").await?,
        gso_tcpv4: read_feature(&mut txn, &backend_path, "feature-gso-tcpv4").await?,
        rx_copy: read_feature(&mut txn, &backend_path, "feature-rx-copy").await?,
        rx_flip: read_feature(&mut txn, &backend_path, "feature-rx-flip").await?,
        smart_poll: read_feature(&mut txn, &backend_path, "feature-smart-poll").await?,
    };
    txn.commit().await.map_err(unknown)?;

    Ok((backend_path, mac, features))
}

/// Performs the plug handshake for interface `id` and returns the connected
/// transport.
pub(crate) async fn plug(platform: &Platform, id: u32) -> Result<Transport, Error> {
    let grants = &platform.grants;
    let path = vif_path(id);

    let backend_domid = platform
        .store
        .read(&format!("{path}/backend-id"))
        .await
        .map_err(unknown)?
        .parse::<u16>()
        .map(DomId)
        .map_err(|_| Error::Unknown("invalid backend-id".into()))?;

    // Ring pages are granted writable: the peer produces responses in place.
    let rx_page = platform.pages.alloc().map_err(unknown)?;
    let tx_page = platform.pages.alloc().map_err(unknown)?;
    let rx_ring_gref = grants.get().map_err(unknown)?;
    let tx_ring_gref = match grants.get() {
        Ok(gref) => gref,
        Err(err) => {
            grants.put(rx_ring_gref);
            return Err(unknown(err));
        }
    };
    grants.grant_access(rx_ring_gref, backend_domid, &rx_page, true);
    grants.grant_access(tx_ring_gref, backend_domid, &tx_page, true);
    let rx_ring = ring::Front::new(rx_page, RX_SLOT_SIZE);
    let tx_ring = ring::Front::new(tx_page, TX_SLOT_SIZE);

    let evtchn = match platform.events.bind_unbound_port(backend_domid) {
        Ok(port) => port,
        Err(err) => {
            unplug_ring(platform, rx_ring_gref);
            unplug_ring(platform, tx_ring_gref);
            return Err(unknown(err));
        }
    };

    let (backend_path, mac, features) =
        match handshake(platform, &path, tx_ring_gref, rx_ring_gref, evtchn).await {
            Ok(handshake) => handshake,
            Err(err) => {
                unplug_ring(platform, rx_ring_gref);
                unplug_ring(platform, tx_ring_gref);
                platform.events.close(evtchn);
                return Err(err);
            }
        };

    platform.events.unmask(evtchn);

    tracing::info!(
        id,
        %mac,
        backend = backend_path.as_str(),
        backend_domid = backend_domid.0,
        "network front plugged"
    );

    Ok(Transport {
        id,
        backend_domid,
        backend_path,
        mac,
        evtchn,
        features,
        tx_ring_gref,
        rx_ring_gref,
        tx: parking_lot::Mutex::new(TxState {
            ring: tx_ring,
            in_flight: HashMap::new(),
        }),
        rx: parking_lot::Mutex::new(RxState {
            ring: rx_ring,
            map: HashMap::new(),
            scratch: vec![0; PAGE_SIZE],
        }),
        tx_lock: futures::lock::Mutex::new(()),
        stats: Stats::default(),
        shut_down: AtomicBool::new(false),
        platform: platform.clone(),
    })
}

impl Transport {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn backend_id(&self) -> DomId {
        self.backend_domid
    }

    pub fn backend_path(&self) -> &str {
        &self.backend_path
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn evtchn(&self) -> Port {
        self.evtchn
    }

    pub fn stats(&self) -> InterfaceStats {
        InterfaceStats {
            rx_bytes: self.stats.rx_bytes.load(Ordering::Relaxed),
            rx_pkts: self.stats.rx_pkts.load(Ordering::Relaxed),
            tx_bytes: self.stats.tx_bytes.load(Ordering::Relaxed),
            tx_pkts: self.stats.tx_pkts.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.stats.rx_bytes.store(0, Ordering::Relaxed);
        self.stats.rx_pkts.store(0, Ordering::Relaxed);
        self.stats.tx_bytes.store(0, Ordering::Relaxed);
        self.stats.tx_pkts.store(0, Ordering::Relaxed);
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Relaxed)
    }

    /// The number of posted receive buffers awaiting the back-end.
    #[cfg(test)]
    pub fn rx_pending(&self) -> usize {
        self.rx.lock().map.len()
    }

    /// Waits until the transmit ring has room for `n` more requests,
    /// reaping completions between checks so headroom is observed as soon
    /// as the peer produces responses.
    async fn wait_tx_headroom(&self, n: u32) -> Result<(), Shutdown> {
        let mut epoch = 0;
        loop {
            self.tx_reap();
            {
                let tx = self.tx.lock();
                if self.is_shut_down() {
                    return Err(Shutdown);
                }
                if tx.ring.free_requests() >= n {
                    return Ok(());
                }
            }
            epoch = self.platform.events.after(self.evtchn, epoch).await;
        }
    }

    /// Grants a page holding `frame` to the back-end and places the request
    /// in the transmit ring without publishing it. The returned receiver
    /// resolves with the completion status once the reaper sees the
    /// response.
    fn queue_tx(
        &self,
        frame: &[u8],
        size: Option<u16>,
        flags: u16,
    ) -> Result<oneshot::Receiver<i16>, TxError> {
        if frame.len() > PAGE_SIZE || frame.len() > u16::MAX as usize {
            return Err(TxError::Fatal(Error::Unknown(format!(
                "frame of {} bytes exceeds a page",
                frame.len()
            ))));
        }
        let gref = self
            .platform
            .grants
            .get()
            .map_err(|err| TxError::Fatal(unknown(err)))?;
        let page = match self.platform.pages.alloc() {
            Ok(page) => page,
            Err(err) => {
                self.platform.grants.put(gref);
                return Err(TxError::Fatal(unknown(err)));
            }
        };
        page.write_at(0, frame);
        self.platform
            .grants
            .grant_access(gref, self.backend_domid, &page, false);

        let id = gref.request_id();
        let (done, rx_done) = oneshot::channel();
        {
            let mut tx = self.tx.lock();
            if self.is_shut_down() {
                drop(tx);
                self.platform.grants.end_access(gref);
                self.platform.grants.put(gref);
                return Err(Shutdown.into());
            }
            if tx.in_flight.contains_key(&id) {
                drop(tx);
                self.platform.grants.end_access(gref);
                self.platform.grants.put(gref);
                return Err(TxError::Fatal(Error::Unknown("tx id collision".into())));
            }
            let size = size.unwrap_or(frame.len() as u16);
            let cursor = tx.ring.next_req_id();
            tx.ring
                .write_slot(cursor, TxRequest::new(gref.0, 0, flags, id, size).as_bytes());
            tx.in_flight.insert(id, TxInFlight { gref, page, done });
        }
        self.stats.tx_pkts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .tx_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(rx_done)
    }

    /// Publishes queued transmit requests, notifying the peer if it asked.
    fn push_tx(&self) {
        let notify = self.tx.lock().ring.push_requests_and_check_notify();
        if notify {
            self.platform.events.notify(self.evtchn);
        }
    }

    async fn tx_status(&self, done: oneshot::Receiver<i16>) -> Result<(), TxError> {
        match done.await {
            Ok(protocol::RSP_OKAY) => Ok(()),
            Ok(status) => Err(TxError::Fatal(Error::Unknown(format!(
                "tx completion status {status}"
            )))),
            // The sender was dropped by shutdown before a response arrived.
            Err(oneshot::Canceled) => Err(Shutdown.into()),
        }
    }

    /// Sends a single frame and waits for the peer to acknowledge it.
    pub async fn write(&self, frame: &[u8]) -> Result<(), TxError> {
        let _tx = self.tx_lock.lock().await;
        self.wait_tx_headroom(1).await?;
        let done = self.queue_tx(frame, None, 0)?;
        self.push_tx();
        self.tx_status(done).await
    }

    /// Sends a frame as a sequence of fragments placed back to back in the
    /// ring with a single notification.
    ///
    /// The first request carries the total size and `MORE_DATA`; middle
    /// fragments carry their own size and `MORE_DATA`; the last carries no
    /// flags, which tells the peer the declared total has been satisfied.
    /// Returns once all requests are placed; completions are reaped in the
    /// background and are not retried on shutdown.
    pub async fn write_vectored(&self, frames: &[&[u8]]) -> Result<(), TxError> {
        if frames.is_empty() {
            return Ok(());
        }
        if frames.len() == 1 {
            return self.write(frames[0]).await;
        }
        let _tx = self.tx_lock.lock().await;
        self.wait_tx_headroom(frames.len() as u32).await?;
        let total: usize = frames.iter().map(|frame| frame.len()).sum();
        if total > u16::MAX as usize {
            return Err(TxError::Fatal(Error::Unknown(format!(
                "vectored frame of {total} bytes exceeds the declarable size"
            ))));
        }
        let last = frames.len() - 1;
        let mut result = Ok(());
        for (i, frame) in frames.iter().enumerate() {
            let (size, flags) = if i == 0 {
                (Some(total as u16), protocol::TXF_MORE_DATA)
            } else if i == last {
                (None, 0)
            } else {
                (None, protocol::TXF_MORE_DATA)
            };
            if let Err(err) = self.queue_tx(frame, size, flags) {
                result = Err(err);
                break;
            }
        }
        self.push_tx();
        result
    }

    /// Posts empty writably granted pages for every free receive slot.
    ///
    /// Allocation failure abandons the cycle; the reactor retries on the
    /// next event.
    pub fn refill(&self) -> Result<(), Error> {
        if self.is_shut_down() {
            return Ok(());
        }
        let mut rx = self.rx.lock();
        let n = rx.ring.free_requests() as usize;
        if n == 0 {
            return Ok(());
        }
        let grefs = match self.platform.grants.get_n(n) {
            Ok(grefs) => grefs,
            Err(err) => {
                tracing::warn!(
                    id = self.id,
                    error = &err as &dyn std::error::Error,
                    "rx refill skipped"
                );
                return Ok(());
            }
        };
        let pages = match self.platform.pages.alloc_n(n) {
            Ok(pages) => pages,
            Err(err) => {
                for gref in grefs {
                    self.platform.grants.put(gref);
                }
                tracing::warn!(
                    id = self.id,
                    error = &err as &dyn std::error::Error,
                    "rx refill skipped"
                );
                return Ok(());
            }
        };
        for (gref, page) in grefs.into_iter().zip(pages) {
            self.platform
                .grants
                .grant_access(gref, self.backend_domid, &page, true);
            let id = gref.request_id();
            if rx.map.insert(id, (gref, page)).is_some() {
                return Err(Error::Unknown("rx id collision".into()));
            }
            let cursor = rx.ring.next_req_id();
            rx.ring
                .write_slot(cursor, RxRequest::new(id, gref.0).as_bytes());
        }
        if rx.ring.push_requests_and_check_notify() {
            self.platform.events.notify(self.evtchn);
        }
        Ok(())
    }

    /// Drains receive completions, handing each filled frame to `handler`.
    ///
    /// Handler failures are logged and swallowed so a bad frame cannot stall
    /// the reactor.
    pub fn rx_drain(&self, handler: &mut dyn FnMut(&[u8]) -> anyhow::Result<()>) {
        let mut rx = self.rx.lock();
        let RxState {
            ring,
            map,
            scratch,
        } = &mut *rx;
        let grants = &self.platform.grants;
        ring.ack_responses(|slot| {
            let rsp = RxResponse::read_from_prefix(slot).unwrap().0;
            let id = rsp.id.get();
            let Some((gref, page)) = map.remove(&id) else {
                tracing::warn!(id, "rx response for unknown id");
                return;
            };
            grants.end_access(gref);
            grants.put(gref);
            let status = rsp.status.get();
            if status <= 0 {
                tracing::warn!(id, status, "rx error response");
                return;
            }
            let len = status as usize;
            if len > PAGE_SIZE {
                tracing::warn!(id, len, "rx response larger than a page");
                return;
            }
            page.read_at(0, &mut scratch[..len]);
            self.stats.rx_pkts.fetch_add(1, Ordering::Relaxed);
            self.stats.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
            if let Err(err) = handler(&scratch[..len]) {
                tracing::warn!(id = self.id, err = %err, "receive callback failed");
            }
        });
    }

    /// Drains transmit completions, revoking each finished grant and waking
    /// the sender. Waiters resolve in the order the peer wrote responses.
    pub fn tx_reap(&self) {
        let mut tx = self.tx.lock();
        let TxState { ring, in_flight } = &mut *tx;
        let grants = &self.platform.grants;
        ring.ack_responses(|slot| {
            let rsp = TxResponse::read_from_prefix(slot).unwrap().0;
            let id = rsp.id.get();
            let Some(TxInFlight { gref, page, done }) = in_flight.remove(&id) else {
                tracing::warn!(id, "tx completion for unknown id");
                return;
            };
            grants.end_access(gref);
            grants.put(gref);
            drop(page);
            // The sender may have given up waiting; that is fine.
            let _ = done.send(rsp.status.get());
        });
    }

    /// Tears the transport down: aborts in-flight transmits, reclaims every
    /// outstanding grant, and closes the event channel. The peer can no
    /// longer reach granted pages through the dead rings, so their access
    /// does not need to be ended individually.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let grants = &self.platform.grants;
        {
            let mut tx = self.tx.lock();
            for (_, in_flight) in tx.in_flight.drain() {
                grants.put(in_flight.gref);
                // Dropping the sender resolves the waiter with a shutdown.
            }
        }
        {
            let mut rx = self.rx.lock();
            for (_, (gref, _page)) in rx.map.drain() {
                grants.put(gref);
            }
        }
        unplug_ring(&self.platform, self.tx_ring_gref);
        unplug_ring(&self.platform, self.rx_ring_gref);
        self.platform.events.close(self.evtchn);
        tracing::info!(id = self.id, "transport shut down");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
