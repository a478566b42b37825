//! Asynchronous bulk transfers through Linux usbfs.
//!
//! [`UsbDevice`] is the kernel transfer interface used by the transfer engine of a
//! [`Handle`](crate::Handle): submitting a transfer, blocking until any submitted
//! transfer completes, discarding a transfer in flight and claiming an interface.
//! [`UsbFsDevice`] implements it on an opened usbfs device node.

use bytes::{Bytes, BytesMut};
use libc::{c_int, c_uint};
use std::{
    fmt,
    fs::File,
    io::{Error, ErrorKind, Result},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    pin::Pin,
    ptr,
    sync::Mutex,
};

mod sys;

/// Transfer slot of a handle.
///
/// Each slot holds at most one transfer in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum Slot {
    /// Transfers from device to host.
    #[strum(serialize = "in")]
    In,
    /// Transfers from host to device.
    #[strum(serialize = "out")]
    Out,
}

impl Slot {
    /// Both slots.
    pub const ALL: [Slot; 2] = [Slot::In, Slot::Out];

    const fn index(self) -> usize {
        match self {
            Self::In => 0,
            Self::Out => 1,
        }
    }
}

/// Access mode for opening a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Access {
    /// Read and write access, required for transfers.
    #[strum(serialize = "read-write")]
    ReadWrite,
    /// Read-only access.
    #[strum(serialize = "read-only")]
    ReadOnly,
}

/// Data buffer of a transfer.
#[derive(Debug)]
pub enum Buffer {
    /// Initialized buffer for writing data.
    Write(Bytes),
    /// Possibly uninitialized buffer for reading data.
    Read(BytesMut),
}

impl Buffer {
    /// Length or capacity of buffer.
    pub fn size(&self) -> usize {
        match self {
            Self::Write(buf) => buf.len(),
            Self::Read(buf) => buf.capacity(),
        }
    }

    /// Get pointer to buffer.
    ///
    /// ## Safety
    /// If this is a write buffer the pointer must only be read from.
    unsafe fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Self::Write(buf) => buf.as_ptr() as *mut _,
            Self::Read(buf) => buf.as_mut_ptr(),
        }
    }

    /// Assume buffer is initialized to given length.
    ///
    /// ## Safety
    /// The first `len` bytes of a read buffer must have been written.
    pub unsafe fn assume_init(&mut self, len: usize) {
        match self {
            Self::Write(_) => (),
            Self::Read(buf) => buf.set_len(len),
        }
    }

    /// Received or sent data.
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Write(buf) => buf,
            Self::Read(buf) => buf,
        }
    }
}

impl From<Bytes> for Buffer {
    fn from(buf: Bytes) -> Self {
        Self::Write(buf)
    }
}

impl From<BytesMut> for Buffer {
    fn from(buf: BytesMut) -> Self {
        Self::Read(buf)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::Write(Bytes::new())
    }
}

/// Completed transfer.
#[derive(Debug)]
pub struct Completion {
    /// Slot the transfer was submitted on.
    pub slot: Slot,
    /// Completion status reported by the kernel, a negated errno value or zero.
    pub status: i32,
    /// Number of bytes transferred.
    pub actual_length: usize,
    /// Transfer buffer.
    ///
    /// A read buffer has its length set to [`actual_length`](Self::actual_length).
    pub buf: Buffer,
}

impl Completion {
    /// Number of bytes transferred or the error reported by the kernel.
    pub fn result(&self) -> Result<usize> {
        match self.status {
            0 => Ok(self.actual_length),
            status => Err(Error::from_raw_os_error(-status)),
        }
    }
}

/// Kernel transfer interface of an opened USB device node.
pub trait UsbDevice: Send + Sync + 'static {
    /// Claims the interface for exclusive use.
    fn claim_interface(&self, interface: u8) -> Result<()>;

    /// Submits a bulk transfer on `endpoint` using the specified slot.
    ///
    /// Fails if the slot still holds a transfer that has not been reaped.
    fn submit(&self, slot: Slot, endpoint: u8, buf: Buffer) -> Result<()>;

    /// Waits for any submitted transfer to complete and returns it.
    ///
    /// Blocks until a transfer completes, or fails with [`ErrorKind::Interrupted`]
    /// when the calling thread receives a signal.
    fn reap(&self) -> Result<Completion>;

    /// Requests cancellation of the transfer in flight on the specified slot.
    ///
    /// A cancelled transfer still completes and must be reaped.
    fn discard(&self, slot: Slot) -> Result<()>;
}

/// Opens device nodes.
pub trait DeviceOpener: Send + Sync + 'static {
    /// Opens the device node at `path`.
    fn open(&self, path: &Path, access: Access) -> Result<Box<dyn UsbDevice>>;
}

/// Submitted transfer.
struct Op {
    /// USB request block, referenced by the kernel while in flight.
    urb: Pin<Box<sys::Urb>>,
    /// Buffer referenced by [`Self::urb`].
    buf: Buffer,
}

impl Op {
    /// Get pointer to USB request block.
    fn urb_ptr(&mut self) -> *mut sys::Urb {
        Pin::into_inner(self.urb.as_mut()) as *mut _
    }

    /// Convert reaped operation to completion.
    fn complete(mut self, slot: Slot) -> Completion {
        let actual_length = usize::try_from(self.urb.actual_length).unwrap_or_default().min(self.buf.size());
        unsafe { self.buf.assume_init(actual_length) };
        Completion { slot, status: self.urb.status, actual_length, buf: self.buf }
    }
}

/// USB device node opened through usbfs.
pub struct UsbFsDevice {
    path: PathBuf,
    // Closing the file kills all outstanding URBs, thus it must be dropped
    // before the operations referencing the buffers.
    file: File,
    ops: [Mutex<Option<Op>>; 2],
}

impl fmt::Debug for UsbFsDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsbFsDevice").field("path", &self.path).field("fd", &self.file.as_raw_fd()).finish()
    }
}

impl UsbFsDevice {
    /// Opens the usbfs device node at `path`.
    pub fn open(path: impl AsRef<Path>, access: Access) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().read(true).write(access == Access::ReadWrite).open(&path)?;
        log::debug!("opened {} {access} with fd {}", path.display(), file.as_raw_fd());
        Ok(Self { path, file, ops: Default::default() })
    }
}

impl UsbDevice for UsbFsDevice {
    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut interface = c_uint::from(interface);
        unsafe { sys::claim_interface(self.file.as_raw_fd(), &mut interface) }?;
        Ok(())
    }

    fn submit(&self, slot: Slot, endpoint: u8, mut buf: Buffer) -> Result<()> {
        let mut pending = self.ops[slot.index()].lock().unwrap();
        if pending.is_some() {
            return Err(Error::new(ErrorKind::WouldBlock, "transfer slot is busy"));
        }

        let len = c_int::try_from(buf.size()).map_err(|_| Error::new(ErrorKind::InvalidInput, "transfer too large"))?;
        let urb = sys::Urb::bulk(endpoint, unsafe { buf.as_mut_ptr() }, len);
        let mut op = Op { urb: Box::pin(urb), buf };

        // The slot stays locked until the operation is stored, so that a concurrent
        // reap finds it.
        loop {
            match unsafe { sys::submit_urb(self.file.as_raw_fd(), op.urb_ptr()) } {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        log::trace!("{}: submitted {slot} transfer of {len} bytes on endpoint 0x{endpoint:02x}", self.path.display());

        *pending = Some(op);
        Ok(())
    }

    fn reap(&self) -> Result<Completion> {
        let mut urb: *mut sys::Urb = ptr::null_mut();
        unsafe { sys::reap_urb(self.file.as_raw_fd(), &mut urb as *mut *mut sys::Urb as *const *mut sys::Urb) }?;

        for slot in Slot::ALL {
            let mut pending = self.ops[slot.index()].lock().unwrap();
            if !pending.as_mut().is_some_and(|op| op.urb_ptr() == urb) {
                continue;
            }
            if let Some(op) = pending.take() {
                return Ok(op.complete(slot));
            }
        }

        Err(Error::new(ErrorKind::InvalidData, "reaped unknown URB"))
    }

    fn discard(&self, slot: Slot) -> Result<()> {
        let mut pending = self.ops[slot.index()].lock().unwrap();
        if let Some(op) = pending.as_mut() {
            unsafe { sys::discard_urb(self.file.as_raw_fd(), op.urb_ptr()) }?;
        }
        Ok(())
    }
}

impl Drop for UsbFsDevice {
    fn drop(&mut self) {
        log::debug!("closing {}", self.path.display());
    }
}

/// Opens usbfs device nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsbFs;

impl DeviceOpener for UsbFs {
    fn open(&self, path: &Path, access: Access) -> Result<Box<dyn UsbDevice>> {
        Ok(Box::new(UsbFsDevice::open(path, access)?))
    }
}
