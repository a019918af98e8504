// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Devices and the driver registry.
//!
//! A [`Device`] is the stable identity of a virtual interface. It wraps the
//! current [`Transport`] and survives host suspend/resume: resume builds a
//! fresh transport, swaps it in, and shuts the old one down, so handles and
//! the reactor keep working across the swap.

use crate::evtchn::Port;
use crate::gnttab::DomId;
use crate::mac_address::MacAddress;
use crate::transport;
use crate::transport::Features;
use crate::transport::InterfaceStats;
use crate::transport::Transport;
use crate::transport::TxError;
use crate::Error;
use crate::Platform;
use event_listener::Event;
use futures::future::join_all;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A callback invoked after a device has been re-plugged on resume.
///
/// Hooks receive a fresh handle and must not capture the device they are
/// registered on, or the device can never be dropped.
pub type ResumeHook = Arc<dyn Fn(Device) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

struct DeviceInner {
    id: u32,
    platform: Platform,
    transport: parking_lot::RwLock<Arc<Transport>>,
    plug_epoch: AtomicU64,
    plug_event: Event,
    resume_hooks: parking_lot::Mutex<Vec<ResumeHook>>,
    gone: AtomicBool,
    listening: AtomicBool,
}

/// A handle to a connected virtual interface. Clones share the device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    fn new(platform: Platform, id: u32, transport: Transport) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                id,
                platform,
                transport: parking_lot::RwLock::new(Arc::new(transport)),
                plug_epoch: AtomicU64::new(0),
                plug_event: Event::new(),
                resume_hooks: parking_lot::Mutex::new(Vec::new()),
                gone: AtomicBool::new(false),
                listening: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn transport(&self) -> Arc<Transport> {
        self.inner.transport.read().clone()
    }

    /// The interface id.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The interface MAC address.
    pub fn mac(&self) -> MacAddress {
        self.transport().mac()
    }

    /// The domain hosting the back-end.
    pub fn backend_id(&self) -> DomId {
        self.transport().backend_id()
    }

    /// The back-end's configuration store directory.
    pub fn backend_path(&self) -> String {
        self.transport().backend_path().to_string()
    }

    /// The features negotiated with the back-end.
    pub fn features(&self) -> Features {
        self.transport().features()
    }

    pub fn get_stats(&self) -> InterfaceStats {
        self.transport().stats()
    }

    pub fn reset_stats(&self) {
        self.transport().reset_stats()
    }

    fn is_gone(&self) -> bool {
        self.inner.gone.load(Ordering::Relaxed)
    }

    /// Waits until a transport newer than `epoch_seen` has been plugged.
    async fn wait_for_plug(&self, epoch_seen: u64) -> Result<(), Error> {
        loop {
            if self.is_gone() {
                return Err(Error::Disconnected);
            }
            if self.inner.plug_epoch.load(Ordering::SeqCst) > epoch_seen {
                return Ok(());
            }
            let listener = self.inner.plug_event.listen();
            // Re-check after registering to close the race with notify.
            if self.is_gone() || self.inner.plug_epoch.load(Ordering::SeqCst) > epoch_seen {
                continue;
            }
            listener.await;
        }
    }

    /// Sends one frame and waits for the peer to acknowledge it.
    ///
    /// If the rings are shut down mid-send (host resume), the frame is
    /// re-driven once on the replacement transport.
    pub async fn write(&self, frame: &[u8]) -> Result<(), Error> {
        if self.is_gone() {
            return Err(Error::Disconnected);
        }
        let epoch = self.inner.plug_epoch.load(Ordering::SeqCst);
        match self.transport().write(frame).await {
            Err(TxError::Shutdown(_)) => {
                tracing::debug!(id = self.id(), "retrying frame on replacement rings");
                self.wait_for_plug(epoch).await?;
                self.transport().write(frame).await.map_err(Error::from)
            }
            other => other.map_err(Error::from),
        }
    }

    /// Sends one frame as multiple fragments. Not retried on shutdown.
    pub async fn write_vectored(&self, frames: &[&[u8]]) -> Result<(), Error> {
        if self.is_gone() {
            return Err(Error::Disconnected);
        }
        self.transport()
            .write_vectored(frames)
            .await
            .map_err(Error::from)
    }

    /// Runs the device reactor: refills receive buffers, hands received
    /// frames to `handler`, reaps transmit completions, and sleeps on the
    /// event channel between rounds.
    ///
    /// There is exactly one reactor per device. Returns `Ok(())` once the
    /// device is disconnected; handler failures are logged and swallowed.
    pub async fn listen<F>(&self, mut handler: F) -> Result<(), Error>
    where
        F: FnMut(&[u8]) -> anyhow::Result<()>,
    {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Err(Error::Unknown("reactor already running".into()));
        }
        let result = self.listen_inner(&mut handler).await;
        self.inner.listening.store(false, Ordering::SeqCst);
        result
    }

    async fn listen_inner(
        &self,
        handler: &mut dyn FnMut(&[u8]) -> anyhow::Result<()>,
    ) -> Result<(), Error> {
        let mut epoch = 0u64;
        let mut last_port: Option<Port> = None;
        loop {
            if self.is_gone() {
                return Ok(());
            }
            let transport = self.transport();
            transport.refill()?;
            transport.rx_drain(handler);
            transport.tx_reap();
            let port = transport.evtchn();
            if last_port != Some(port) {
                // A resume swapped the transport; epochs are per port.
                epoch = 0;
                last_port = Some(port);
            }
            epoch = self.inner.platform.events.after(port, epoch).await;
        }
    }

    /// Registers a hook to run after every future resume, in registration
    /// order.
    pub fn add_resume_hook(&self, hook: ResumeHook) {
        self.inner.resume_hooks.lock().push(hook);
    }

    /// Replaces the transport with a freshly plugged one, runs the resume
    /// hooks, wakes plug waiters, and shuts the old rings down (aborting
    /// their outstanding work).
    pub async fn resume(&self) -> Result<(), Error> {
        let fresh = transport::plug(&self.inner.platform, self.inner.id).await?;
        let old = {
            let mut transport = self.inner.transport.write();
            std::mem::replace(&mut *transport, Arc::new(fresh))
        };
        let hooks: Vec<ResumeHook> = self.inner.resume_hooks.lock().clone();
        for hook in hooks {
            if let Err(err) = hook(self.clone()).await {
                tracing::warn!(id = self.id(), err = %err, "resume hook failed");
            }
        }
        self.inner.plug_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.plug_event.notify(usize::MAX);
        old.shutdown();
        tracing::info!(id = self.id(), "device resumed");
        Ok(())
    }

    fn mark_gone(&self) {
        self.inner.gone.store(true, Ordering::SeqCst);
        self.inner.plug_event.notify(usize::MAX);
        // Shutting the transport down wakes the reactor and aborts in-flight
        // sends with a terminal error.
        self.transport().shutdown();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("id", &self.id()).finish()
    }
}

/// The driver: owns the platform services and the registry of connected
/// devices. An embedder creates exactly one.
pub struct Driver {
    platform: Platform,
    devices: parking_lot::Mutex<HashMap<u32, Device>>,
}

impl Driver {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            devices: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Connects interface `name`: either a decimal id, or empty/unparseable
    /// to pick the first interface the store enumerates. Returns the
    /// existing device if it is already connected.
    pub async fn connect(&self, name: &str) -> Result<Device, Error> {
        let id = match name.parse::<u32>() {
            Ok(id) => id,
            Err(_) => self.first_vif().await?,
        };
        if let Some(device) = self.devices.lock().get(&id) {
            return Ok(device.clone());
        }
        let transport = transport::plug(&self.platform, id).await?;
        let device = Device::new(self.platform.clone(), id, transport);
        match self.devices.lock().entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                // Lost a connect race; the new transport is dropped and
                // shuts itself down.
                Ok(entry.get().clone())
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(device.clone());
                Ok(device)
            }
        }
    }

    async fn first_vif(&self) -> Result<u32, Error> {
        let names = self
            .platform
            .store
            .list("device/vif")
            .await
            .map_err(|_| Error::Unknown("no network interfaces".into()))?;
        names
            .iter()
            .find_map(|name| name.parse().ok())
            .ok_or_else(|| Error::Unknown("no network interfaces".into()))
    }

    /// Returns the connected device with the given id, if any.
    pub fn get(&self, id: u32) -> Option<Device> {
        self.devices.lock().get(&id).cloned()
    }

    /// Removes `device` from the registry and shuts its transport down.
    /// Returns immediately; outstanding operations abort asynchronously.
    pub fn disconnect(&self, device: &Device) {
        self.devices.lock().remove(&device.id());
        device.mark_gone();
        tracing::info!(id = device.id(), "device disconnected");
    }

    /// Resumes every registered device concurrently. Run on host resume.
    pub async fn resume_all(&self) -> Result<(), Error> {
        let devices: Vec<Device> = self.devices.lock().values().cloned().collect();
        let results = join_all(devices.iter().map(|device| device.resume())).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}
