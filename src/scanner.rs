//! Discovery of USB devices on the usbfs bus hierarchy.

use rustix::fs::{fstat, major, minor, Dev, FileType, RawMode};
use std::{
    fmt,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use crate::{desc, is_numeric_name, Config, InterfaceFilter, InterfaceMatch, Registry};

/// Maximum number of descriptor bytes read from a device node.
pub const DESCRIPTOR_BUFFER_SIZE: usize = 4096;

/// USB device exposing a matching interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    /// Device node path.
    pub path: PathBuf,
    /// Stable device path of the form `usb:<sysfs name>`, if it could be determined.
    pub stable_path: Option<String>,
    /// Matching interface.
    pub interface: InterfaceMatch,
}

/// Stable device path of the character device with the specified numbers.
fn stable_path_for(config: &Config, major: u32, minor: u32) -> Option<String> {
    let link = config.char_dev_path(major, minor);
    let target = match fs::read_link(&link) {
        Ok(target) => target,
        Err(err) => {
            log::trace!("cannot read link {}: {err}", link.display());
            return None;
        }
    };
    let name = target.file_name()?.to_str()?;
    Some(format!("usb:{name}"))
}

/// Stable device path of an opened device node.
fn stable_path(config: &Config, file: &File) -> Option<String> {
    let stat = fstat(file).ok()?;
    if FileType::from_raw_mode(stat.st_mode as RawMode) != FileType::CharacterDevice {
        return None;
    }
    let rdev = stat.st_rdev as Dev;
    stable_path_for(config, major(rdev), minor(rdev))
}

/// Scans for USB devices exposing an interface accepted by a filter.
#[derive(Clone)]
pub struct Scanner {
    registry: Arc<Registry>,
    filter: Arc<dyn InterfaceFilter>,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scanner").field("registry", &self.registry).finish_non_exhaustive()
    }
}

impl Scanner {
    /// Creates a scanner registering found devices in `registry`.
    pub fn new(registry: Arc<Registry>, filter: Arc<dyn InterfaceFilter>) -> Self {
        Self { registry, filter }
    }

    /// Registry found devices are registered in.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn config(&self) -> &Config {
        self.registry.config()
    }

    /// Probes the device node at `path` for a matching interface.
    pub fn probe(&self, path: impl AsRef<Path>) -> Option<FoundDevice> {
        let path = path.as_ref();

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                log::debug!("cannot open {}: {err}", path.display());
                return None;
            }
        };

        let mut buf = Vec::with_capacity(DESCRIPTOR_BUFFER_SIZE);
        if let Err(err) = (&file).take(DESCRIPTOR_BUFFER_SIZE as u64).read_to_end(&mut buf) {
            log::debug!("cannot read descriptors of {}: {err}", path.display());
            return None;
        }

        let Some(interface) = desc::parse(&buf, &*self.filter) else {
            log::trace!("{} has no matching interface", path.display());
            return None;
        };

        let stable_path = stable_path(self.config(), &file);
        log::trace!("found {} with {} at interface {}", path.display(), interface.class, interface.interface);

        Some(FoundDevice { path: path.to_path_buf(), stable_path, interface })
    }

    /// Scans all buses once, calling `register` for each matching device that is not registered yet.
    ///
    /// Registered devices are marked as seen.
    pub fn scan(&self, mut register: impl FnMut(FoundDevice)) {
        let root = &self.config().dev_root;
        let buses = match fs::read_dir(root) {
            Ok(buses) => buses,
            Err(err) => {
                log::debug!("cannot read {}: {err}", root.display());
                return;
            }
        };

        for bus in buses.flatten() {
            if !is_numeric_name(&bus.file_name()) {
                continue;
            }

            let devices = match fs::read_dir(bus.path()) {
                Ok(devices) => devices,
                Err(err) => {
                    log::debug!("cannot read {}: {err}", bus.path().display());
                    continue;
                }
            };

            for device in devices.flatten() {
                if !is_numeric_name(&device.file_name()) {
                    continue;
                }

                let path = device.path();
                if self.registry.is_known(&path) {
                    continue;
                }

                if let Some(found) = self.probe(&path) {
                    register(found);
                }
            }
        }
    }

    /// Performs one scan cycle.
    ///
    /// Found devices are registered and registered devices that have vanished are kicked.
    pub fn cycle(&self) {
        self.scan(|found| {
            self.registry.register(&found);
        });
        self.registry.kick_disconnected();
    }

    /// Starts a thread that performs a scan cycle periodically.
    pub fn spawn(self) -> io::Result<Monitor> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let interval = self.config().scan_interval;

        let thread = thread::Builder::new().name("device poll".to_string()).spawn({
            let stop = stop.clone();
            move || {
                log::debug!("device poll started with interval {interval:?}");
                let (stopped, cv) = &*stop;
                loop {
                    self.cycle();

                    let stopped = stopped.lock().unwrap();
                    let (stopped, _) = cv.wait_timeout_while(stopped, interval, |stopped| !*stopped).unwrap();
                    if *stopped {
                        break;
                    }
                }
                log::debug!("device poll stopped");
            }
        })?;

        Ok(Monitor { stop, thread })
    }
}

/// Running device poll thread.
///
/// Dropping the monitor leaves the thread running.
#[derive(Debug)]
pub struct Monitor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: JoinHandle<()>,
}

impl Monitor {
    /// Stops the thread and waits for it to exit.
    pub fn stop(self) {
        let (stopped, cv) = &*self.stop;
        *stopped.lock().unwrap() = true;
        cv.notify_all();

        if self.thread.join().is_err() {
            log::warn!("device poll thread panicked");
        }
    }
}
