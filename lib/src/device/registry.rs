//! Registry of the devices available to clients.
//!
//! Devices are registered under a numeric id and opened by path
//! (`/dev/videoN`). A device can only be opened by one client at a time.
//! Registration and opening may happen on different threads: `open_timeout`
//! waits for a device to show up, which lets sessions start before the
//! devices they depend on have been brought up.
use super::h264::H264Device;
use super::jpeg::JpegDevice;
use super::VideoDevice;
use crate::error::ErrorKind;
use crate::lock;

use log::{debug, info, warn};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of device ids.
pub const MAX_DEVICES: usize = 16;
/// Id under which the JPEG encoder is registered by `register_default_codecs`.
pub const JPEG_DEVICE_ID: usize = 10;
/// Id under which the H.264 encoder is registered by `register_default_codecs`.
pub const H264_DEVICE_ID: usize = 11;

const PATH_PREFIX: &str = "/dev/video";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid device id {0}")]
    InvalidId(usize),
    #[error("a device is already registered with id {0}")]
    AlreadyRegistered(usize),
    #[error("invalid device path {0:?}")]
    InvalidPath(String),
    #[error("no device registered at {0}")]
    NotFound(String),
    #[error("device {0} is already open")]
    Busy(String),
    #[error("device handle does not match any registered device")]
    UnknownHandle,
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound(_) => ErrorKind::Configuration,
            RegistryError::Busy(_) => ErrorKind::Device,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

/// Path of the device registered with `id`.
pub fn device_path(id: usize) -> String {
    format!("{}{}", PATH_PREFIX, id)
}

fn parse_path(path: &str) -> Result<usize, RegistryError> {
    path.strip_prefix(PATH_PREFIX)
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|&id| id < MAX_DEVICES)
        .ok_or_else(|| RegistryError::InvalidPath(path.into()))
}

struct Entry {
    device: Arc<dyn VideoDevice>,
    generation: u64,
    in_use: bool,
}

struct RegistryInner {
    entries: Mutex<Vec<Option<Entry>>>,
    registered: Condvar,
    next_generation: Mutex<u64>,
}

/// Proof of registration, needed to unregister a device.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    id: usize,
    generation: u64,
}

impl DeviceHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn path(&self) -> String {
        device_path(self.id)
    }
}

/// Shared registry of devices. Clones refer to the same registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new((0..MAX_DEVICES).map(|_| None).collect()),
                registered: Condvar::new(),
                next_generation: Mutex::new(0),
            }),
        }
    }

    pub fn register(
        &self,
        id: usize,
        device: Arc<dyn VideoDevice>,
    ) -> Result<DeviceHandle, RegistryError> {
        let generation = {
            let mut next = lock(&self.inner.next_generation);
            *next += 1;
            *next
        };

        let mut entries = lock(&self.inner.entries);
        let slot = entries.get_mut(id).ok_or(RegistryError::InvalidId(id))?;
        if slot.is_some() {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let card = device.query_capabilities().card;
        *slot = Some(Entry {
            device,
            generation,
            in_use: false,
        });
        drop(entries);

        info!("Registered {} as {}", card, device_path(id));
        self.inner.registered.notify_all();
        Ok(DeviceHandle { id, generation })
    }

    /// Remove a device from the registry. Clients that opened it keep using
    /// it until they close it.
    pub fn unregister(&self, handle: DeviceHandle) -> Result<(), RegistryError> {
        let mut entries = lock(&self.inner.entries);
        let slot = entries
            .get_mut(handle.id)
            .ok_or(RegistryError::UnknownHandle)?;
        let in_use = match slot {
            Some(entry) if entry.generation == handle.generation => entry.in_use,
            _ => return Err(RegistryError::UnknownHandle),
        };
        if in_use {
            warn!("Unregistering {} while it is open", handle.path());
        }
        *slot = None;
        debug!("Unregistered {}", handle.path());
        Ok(())
    }

    pub fn is_registered(&self, path: &str) -> bool {
        parse_path(path)
            .map(|id| {
                lock(&self.inner.entries)
                    .get(id)
                    .map(Option::is_some)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Open the device at `path` for exclusive use.
    pub fn open(&self, path: &str) -> Result<OpenDevice, RegistryError> {
        let id = parse_path(path)?;
        let mut entries = lock(&self.inner.entries);
        self.try_open(&mut entries, id, path)
    }

    /// Open the device at `path`, waiting up to `timeout` for it to be
    /// registered.
    pub fn open_timeout(&self, path: &str, timeout: Duration) -> Result<OpenDevice, RegistryError> {
        let id = parse_path(path)?;
        let deadline = Instant::now() + timeout;
        let mut entries = lock(&self.inner.entries);

        loop {
            match self.try_open(&mut entries, id, path) {
                Err(RegistryError::NotFound(_)) => (),
                res => return res,
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("{} did not show up within {:?}", path, timeout);
                return Err(RegistryError::NotFound(path.into()));
            }
            debug!("Waiting for {} to be registered", path);
            entries = self
                .inner
                .registered
                .wait_timeout(entries, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn try_open(
        &self,
        entries: &mut [Option<Entry>],
        id: usize,
        path: &str,
    ) -> Result<OpenDevice, RegistryError> {
        let entry = entries
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| RegistryError::NotFound(path.into()))?;
        if entry.in_use {
            return Err(RegistryError::Busy(path.into()));
        }
        entry.in_use = true;
        debug!("Opened {}", path);

        Ok(OpenDevice {
            device: Arc::clone(&entry.device),
            registry: Arc::clone(&self.inner),
            id,
            generation: entry.generation,
        })
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = lock(&self.inner.entries);
        f.debug_list()
            .entries(
                entries
                    .iter()
                    .enumerate()
                    .filter_map(|(id, e)| e.as_ref().map(|e| (device_path(id), e.in_use))),
            )
            .finish()
    }
}

/// A device opened from a `DeviceRegistry`. The device is closed when this
/// is dropped.
pub struct OpenDevice {
    device: Arc<dyn VideoDevice>,
    registry: Arc<RegistryInner>,
    id: usize,
    generation: u64,
}

impl OpenDevice {
    pub fn path(&self) -> String {
        device_path(self.id)
    }

    /// Close the device. Same as dropping it.
    pub fn close(self) {}
}

impl Deref for OpenDevice {
    type Target = dyn VideoDevice;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        let mut entries = lock(&self.registry.entries);
        if let Some(Some(entry)) = entries.get_mut(self.id) {
            if entry.generation == self.generation {
                entry.in_use = false;
            }
        }
        debug!("Closed {}", device_path(self.id));
    }
}

impl fmt::Debug for OpenDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDevice")
            .field("path", &self.path())
            .finish()
    }
}

/// Register the JPEG and H.264 encoders under their well-known ids. Devices
/// already registered there are left in place.
pub fn register_default_codecs(registry: &DeviceRegistry) -> Result<(), RegistryError> {
    let codecs: [(usize, Arc<dyn VideoDevice>); 2] = [
        (JPEG_DEVICE_ID, Arc::new(JpegDevice::new())),
        (H264_DEVICE_ID, Arc::new(H264Device::new())),
    ];

    for (id, device) in codecs {
        match registry.register(id, device) {
            Ok(_) => (),
            Err(RegistryError::AlreadyRegistered(_)) => {
                debug!("{} already registered", device_path(id))
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
