//! Registry of attached devices.

use std::{
    collections::{hash_map::Entry as MapEntry, HashMap},
    ffi::OsStr,
    fmt, fs,
    os::unix::prelude::OsStrExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{trim_os_str, Access, Config, DeviceOpener, FoundDevice, Handle};

/// Higher-level transport layer that is notified about attached and detached devices.
pub trait Transport: Send + Sync + 'static {
    /// A device has been attached.
    ///
    /// `serial` is empty if the device has no serial number.
    fn attach(&self, handle: Arc<Handle>, serial: &str, stable_path: Option<&str>, writable: bool);

    /// A read-only device has been disconnected.
    ///
    /// Writable devices are not reported, since all transfers on them fail after
    /// disconnection.
    fn detach(&self, handle: &Arc<Handle>);
}

/// Registered handle.
struct Entry {
    handle: Arc<Handle>,
    /// Set when the device was seen during the current scan cycle.
    mark: bool,
}

/// Registry of attached devices.
///
/// Holds at most one handle per device path.
/// A handle stays registered after it has been kicked until it is [closed](Self::close)
/// by the transport layer.
pub struct Registry {
    config: Config,
    opener: Arc<dyn DeviceOpener>,
    transport: Arc<dyn Transport>,
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry").field("config", &self.config).field("len", &self.len()).finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    ///
    /// Devices are opened using `opener` and reported to `transport`.
    pub fn new(config: Config, opener: Arc<dyn DeviceOpener>, transport: Arc<dyn Transport>) -> Self {
        Self { config, opener, transport, entries: Mutex::new(HashMap::new()) }
    }

    /// Configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a found device, registers it and notifies the transport layer.
    ///
    /// Returns `None` if the device is already registered or cannot be opened.
    pub fn register(&self, found: &FoundDevice) -> Option<Arc<Handle>> {
        if self.entries.lock().unwrap().contains_key(&found.path) {
            return None;
        }

        let path = found.path.display();
        let (device, access) = match self.opener.open(&found.path, Access::ReadWrite) {
            Ok(device) => (device, Access::ReadWrite),
            Err(err) => {
                log::debug!("cannot open {path} read-write: {err}");
                match self.opener.open(&found.path, Access::ReadOnly) {
                    Ok(device) => (device, Access::ReadOnly),
                    Err(err) => {
                        log::debug!("cannot open {path}: {err}");
                        return None;
                    }
                }
            }
        };

        if access == Access::ReadWrite {
            if let Err(err) = device.claim_interface(found.interface.interface) {
                log::warn!("cannot claim interface {} of {path}: {err}", found.interface.interface);
                return None;
            }
            log::debug!("claimed interface {} of {path}", found.interface.interface);
        }

        let serial = self.read_serial(found.stable_path.as_deref());
        let handle = Arc::new(Handle::new(found, serial, device, access, self.config.write_timeout));

        match self.entries.lock().unwrap().entry(found.path.clone()) {
            MapEntry::Occupied(_) => {
                log::debug!("{path} was registered concurrently");
                return None;
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry { handle: handle.clone(), mark: true });
            }
        }
        log::debug!(
            "registered {path} {access} with endpoints 0x{:02x}/0x{:02x} and serial {:?}",
            handle.ep_in(),
            handle.ep_out(),
            handle.serial()
        );

        self.transport.attach(handle.clone(), handle.serial(), handle.stable_path(), handle.is_writable());
        Some(handle)
    }

    /// Reads the serial number of the device from sysfs.
    fn read_serial(&self, stable_path: Option<&str>) -> String {
        let Some(name) = stable_path.and_then(|path| path.strip_prefix("usb:")) else {
            return String::new();
        };

        let path = self.config.serial_path(name);
        match fs::read(&path) {
            Ok(data) => trim_os_str(OsStr::from_bytes(&data)).to_string_lossy().into_owned(),
            Err(err) => {
                log::trace!("cannot read {}: {err}", path.display());
                String::new()
            }
        }
    }

    /// Whether a handle is registered for the device path.
    ///
    /// Marks the device as seen during the current scan cycle.
    pub fn is_known(&self, path: impl AsRef<Path>) -> bool {
        match self.entries.lock().unwrap().get_mut(path.as_ref()) {
            Some(entry) => {
                entry.mark = true;
                true
            }
            None => false,
        }
    }

    /// Kicks all handles whose devices were not seen since the last call.
    ///
    /// Clears the marks of all other handles.
    pub fn kick_disconnected(&self) {
        let vanished: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .values_mut()
            .filter_map(|entry| {
                if entry.mark {
                    entry.mark = false;
                    None
                } else {
                    Some(entry.handle.clone())
                }
            })
            .collect();

        for handle in vanished {
            log::debug!("{} has vanished", handle.path().display());
            self.kick(&handle);
        }
    }

    /// Kicks a handle, making all its transfers fail.
    ///
    /// The transport layer is notified if the handle is read-only.
    pub fn kick(&self, handle: &Arc<Handle>) {
        if handle.kick() && !handle.is_writable() {
            self.transport.detach(handle);
        }
    }

    /// Removes a handle from the registry.
    ///
    /// The device is closed once the last reference to the handle is dropped.
    pub fn close(&self, handle: &Arc<Handle>) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(handle.path()) {
            Some(entry) if Arc::ptr_eq(&entry.handle, handle) => {
                entries.remove(handle.path());
                log::debug!("unregistered {}", handle.path().display());
            }
            _ => log::debug!("{} is not registered", handle.path().display()),
        }
    }

    /// Registered handles ordered by device path.
    pub fn handles(&self) -> Vec<Arc<Handle>> {
        let mut handles: Vec<_> = self.entries.lock().unwrap().values().map(|entry| entry.handle.clone()).collect();
        handles.sort_by(|a, b| a.path().cmp(b.path()));
        handles
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no handles are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
