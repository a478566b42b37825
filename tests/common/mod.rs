//! Common test functions.
#![allow(dead_code)]

use bytes::BytesMut;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::{Error, ErrorKind, Result},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, Once},
    thread::sleep,
    time::{Duration, Instant},
};

use usb_bridge_host::{
    usbfs::{Buffer, Completion, Slot},
    Access, Class, Config, DeviceOpener, FoundDevice, Handle, Id, InterfaceMatch, Registry, Transport, UsbDevice,
};

pub const BRIDGE: Class = Class::vendor_specific(0x42, 0x01);
pub const EP_IN: u8 = 0x81;
pub const EP_OUT: u8 = 0x02;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Waits until the condition holds or panics after five seconds.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timeout waiting for {what}");
        sleep(Duration::from_millis(5));
    }
}

/// Descriptors of a device with one bridge interface.
pub fn descriptors(class: Class, max_packet_size: u16) -> Vec<u8> {
    let mps = max_packet_size.to_le_bytes();
    let mut data = vec![18, 1, 0x00, 0x02, 0, 0, 0, 64, 0xd1, 0x18, 0xe7, 0x4e, 0x00, 0x01, 1, 2, 3, 1];
    data.extend([9, 2, 32, 0, 1, 1, 0, 0x80, 250]);
    data.extend([9, 4, 0, 0, 2, class.class, class.sub_class, class.protocol, 0]);
    data.extend([7, 5, EP_IN, 2, mps[0], mps[1], 0]);
    data.extend([7, 5, EP_OUT, 2, mps[0], mps[1], 0]);
    data
}

/// Found bridge device.
pub fn found(path: impl AsRef<Path>, zero_mask: u16) -> FoundDevice {
    FoundDevice {
        path: path.as_ref().to_path_buf(),
        stable_path: None,
        interface: InterfaceMatch {
            id: Id::new(0x18d1, 0x4ee7),
            class: BRIDGE,
            interface: 0,
            ep_in: EP_IN,
            ep_out: EP_OUT,
            serial_idx: 3,
            zero_mask,
        },
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<Slot, (u8, Buffer)>,
    completed: VecDeque<Completion>,
    incoming: VecDeque<(i32, Vec<u8>)>,
    reap_errors: VecDeque<Error>,
    auto_complete_writes: bool,
    fail_claim: bool,
    written: Vec<Vec<u8>>,
    submits: Vec<(Slot, u8, usize)>,
    discards: Vec<Slot>,
    claimed: Vec<u8>,
}

/// State of a scripted in-memory USB device.
#[derive(Default)]
pub struct MockState {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl MockState {
    /// Completes writes as soon as they are submitted.
    pub fn auto_complete_writes(&self, enabled: bool) {
        self.inner.lock().unwrap().auto_complete_writes = enabled;
    }

    /// Makes claiming the interface fail.
    pub fn fail_claim(&self) {
        self.inner.lock().unwrap().fail_claim = true;
    }

    /// Queues data for the next read.
    pub fn push_in(&self, data: &[u8]) {
        self.push_in_status(0, data);
    }

    /// Queues data with completion status for the next read.
    pub fn push_in_status(&self, status: i32, data: &[u8]) {
        self.inner.lock().unwrap().incoming.push_back((status, data.to_vec()));
        self.cv.notify_all();
    }

    /// Makes the next reap fail with the error.
    pub fn fail_reap(&self, err: Error) {
        self.inner.lock().unwrap().reap_errors.push_back(err);
        self.cv.notify_all();
    }

    /// Data of all completed writes.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Submitted transfers as slot, endpoint and length.
    pub fn submits(&self) -> Vec<(Slot, u8, usize)> {
        self.inner.lock().unwrap().submits.clone()
    }

    /// Discarded slots.
    pub fn discards(&self) -> Vec<Slot> {
        self.inner.lock().unwrap().discards.clone()
    }

    /// Claimed interfaces.
    pub fn claimed(&self) -> Vec<u8> {
        self.inner.lock().unwrap().claimed.clone()
    }

    /// Whether a transfer is in flight on the slot.
    pub fn is_pending(&self, slot: Slot) -> bool {
        self.inner.lock().unwrap().pending.contains_key(&slot)
    }
}

fn complete_write(inner: &mut Inner, buf: Buffer) {
    let data = buf.data().to_vec();
    inner.completed.push_back(Completion { slot: Slot::Out, status: 0, actual_length: data.len(), buf });
    inner.written.push(data);
}

/// Scripted in-memory USB device.
pub struct MockDevice(Arc<MockState>);

impl UsbDevice for MockDevice {
    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.fail_claim {
            return Err(Error::from_raw_os_error(libc::EBUSY));
        }
        inner.claimed.push(interface);
        Ok(())
    }

    fn submit(&self, slot: Slot, endpoint: u8, buf: Buffer) -> Result<()> {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.pending.contains_key(&slot) {
            return Err(Error::new(ErrorKind::WouldBlock, "transfer slot is busy"));
        }
        inner.submits.push((slot, endpoint, buf.size()));

        if slot == Slot::Out && inner.auto_complete_writes {
            complete_write(&mut inner, buf);
        } else {
            inner.pending.insert(slot, (endpoint, buf));
        }

        self.0.cv.notify_all();
        Ok(())
    }

    fn reap(&self) -> Result<Completion> {
        let mut inner = self.0.inner.lock().unwrap();
        loop {
            if let Some(err) = inner.reap_errors.pop_front() {
                return Err(err);
            }

            if let Some(comp) = inner.completed.pop_front() {
                return Ok(comp);
            }

            if inner.pending.contains_key(&Slot::In) && !inner.incoming.is_empty() {
                let (_, buf) = inner.pending.remove(&Slot::In).unwrap();
                let (status, data) = inner.incoming.pop_front().unwrap();
                let len = data.len().min(buf.size());
                return Ok(Completion {
                    slot: Slot::In,
                    status,
                    actual_length: len,
                    buf: BytesMut::from(&data[..len]).into(),
                });
            }

            inner = self.0.cv.wait(inner).unwrap();
        }
    }

    fn discard(&self, slot: Slot) -> Result<()> {
        let mut inner = self.0.inner.lock().unwrap();
        inner.discards.push(slot);
        if let Some((_, buf)) = inner.pending.remove(&slot) {
            inner.completed.push_back(Completion { slot, status: -libc::ENOENT, actual_length: 0, buf });
            self.0.cv.notify_all();
        }
        Ok(())
    }
}

/// Opens scripted in-memory USB devices.
#[derive(Default)]
pub struct MockOpener {
    devices: Mutex<HashMap<PathBuf, Arc<MockState>>>,
    read_only: Mutex<HashSet<PathBuf>>,
    opens: Mutex<Vec<(PathBuf, Access)>>,
}

impl MockOpener {
    /// State of the device at `path`.
    pub fn device(&self, path: impl AsRef<Path>) -> Arc<MockState> {
        self.devices.lock().unwrap().entry(path.as_ref().to_path_buf()).or_default().clone()
    }

    /// Makes opening the device at `path` for writing fail.
    pub fn deny_write(&self, path: impl AsRef<Path>) {
        self.read_only.lock().unwrap().insert(path.as_ref().to_path_buf());
    }

    /// Successful open calls.
    pub fn opens(&self) -> Vec<(PathBuf, Access)> {
        self.opens.lock().unwrap().clone()
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self, path: &Path, access: Access) -> Result<Box<dyn UsbDevice>> {
        if access == Access::ReadWrite && self.read_only.lock().unwrap().contains(path) {
            return Err(Error::from_raw_os_error(libc::EACCES));
        }
        self.opens.lock().unwrap().push((path.to_path_buf(), access));
        Ok(Box::new(MockDevice(self.device(path))))
    }
}

/// Attach notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub path: PathBuf,
    pub serial: String,
    pub stable_path: Option<String>,
    pub writable: bool,
}

/// Transport recording notifications.
#[derive(Default)]
pub struct RecordingTransport {
    attached: Mutex<Vec<Attached>>,
    detached: Mutex<Vec<PathBuf>>,
}

impl RecordingTransport {
    pub fn attached(&self) -> Vec<Attached> {
        self.attached.lock().unwrap().clone()
    }

    pub fn detached(&self) -> Vec<PathBuf> {
        self.detached.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn attach(&self, handle: Arc<Handle>, serial: &str, stable_path: Option<&str>, writable: bool) {
        self.attached.lock().unwrap().push(Attached {
            path: handle.path().to_path_buf(),
            serial: serial.to_string(),
            stable_path: stable_path.map(str::to_string),
            writable,
        });
    }

    fn detach(&self, handle: &Arc<Handle>) {
        self.detached.lock().unwrap().push(handle.path().to_path_buf());
    }
}

pub struct Setup {
    pub registry: Arc<Registry>,
    pub opener: Arc<MockOpener>,
    pub transport: Arc<RecordingTransport>,
}

pub fn setup(config: Config) -> Setup {
    init();

    let opener = Arc::new(MockOpener::default());
    let transport = Arc::new(RecordingTransport::default());
    let registry = Arc::new(Registry::new(config, opener.clone(), transport.clone()));

    Setup { registry, opener, transport }
}
