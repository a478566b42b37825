//! Transport handle and bulk transfer engine.

use bytes::{Bytes, BytesMut};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    interrupt::{self, Interruptible},
    usbfs::{Access, Slot, UsbDevice},
    FoundDevice,
};

/// Transfer error.
#[derive(Debug)]
pub enum Error {
    /// The handle has been kicked, because the device was disconnected or shut down.
    Dead,
    /// The transfer did not complete in time.
    TimedOut {
        /// Number of bytes transferred before the timeout.
        transferred: usize,
    },
    /// The kernel reported a failed transfer.
    Failed(io::Error),
    /// The transfer could not be submitted.
    Submit(io::Error),
    /// Waiting for transfer completion failed.
    Reap(io::Error),
    /// Fewer bytes than requested were transferred.
    Short {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes transferred.
        actual: usize,
    },
}

impl Error {
    /// Equivalent OS error number.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Dead => Some(libc::EINVAL),
            Self::TimedOut { .. } => Some(libc::ETIMEDOUT),
            Self::Failed(err) | Self::Submit(err) | Self::Reap(err) => err.raw_os_error(),
            Self::Short { .. } => Some(libc::EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Dead => write!(f, "USB device is gone"),
            Self::TimedOut { transferred } => write!(f, "USB transfer timed out after {transferred} bytes"),
            Self::Failed(err) => write!(f, "USB transfer failed: {err}"),
            Self::Submit(err) => write!(f, "cannot submit USB transfer: {err}"),
            Self::Reap(err) => write!(f, "cannot reap USB transfer: {err}"),
            Self::Short { expected, actual } => {
                write!(f, "short USB transfer of {actual} bytes, expected {expected} bytes")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(err) | Self::Submit(err) | Self::Reap(err) => Some(err),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Dead => io::ErrorKind::InvalidInput,
            Error::TimedOut { .. } => io::ErrorKind::TimedOut,
            Error::Failed(err) | Error::Submit(err) | Error::Reap(err) => err.kind(),
            Error::Short { .. } => io::ErrorKind::UnexpectedEof,
        };
        io::Error::new(kind, err)
    }
}

/// Transfer result.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a transfer of `len` bytes must be followed by a zero-length packet.
fn zero_packet_required(zero_mask: u16, len: usize) -> bool {
    zero_mask != 0 && len != 0 && len & usize::from(zero_mask) == 0
}

/// Transfer state protected by the handle lock.
#[derive(Debug, Default)]
struct State {
    dead: bool,
    in_busy: bool,
    out_busy: bool,
    /// Result of the last reaped write.
    out_result: Option<io::Result<usize>>,
    /// Thread currently waiting in [`UsbDevice::reap`].
    reaper: Option<Interruptible>,
}

/// Transport handle of an attached USB device.
///
/// Provides blocking byte-stream transfers over the bulk endpoints of the matched interface.
/// Only one thread at a time may read from a handle. Completions of writes are collected
/// by the reading thread, thus writes only complete while a read is in progress.
pub struct Handle {
    path: PathBuf,
    stable_path: Option<String>,
    serial: String,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
    zero_mask: u16,
    writable: bool,
    write_timeout: Duration,
    device: Box<dyn UsbDevice>,
    state: Mutex<State>,
    cv: Condvar,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handle")
            .field("path", &self.path)
            .field("stable_path", &self.stable_path)
            .field("serial", &self.serial)
            .field("ep_in", &self.ep_in)
            .field("ep_out", &self.ep_out)
            .field("writable", &self.writable)
            .field("dead", &self.is_dead())
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(
        found: &FoundDevice, serial: String, device: Box<dyn UsbDevice>, access: Access, write_timeout: Duration,
    ) -> Self {
        interrupt::init();

        Self {
            path: found.path.clone(),
            stable_path: found.stable_path.clone(),
            serial,
            interface: found.interface.interface,
            ep_in: found.interface.ep_in,
            ep_out: found.interface.ep_out,
            zero_mask: found.interface.zero_mask,
            writable: access == Access::ReadWrite,
            write_timeout,
            device,
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
        }
    }

    /// Device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable device path of the form `usb:<sysfs name>`, if known.
    pub fn stable_path(&self) -> Option<&str> {
        self.stable_path.as_deref()
    }

    /// Serial number of the device.
    ///
    /// Empty if the device does not provide one.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Number of the claimed interface.
    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Address of the bulk endpoint from device to host.
    pub fn ep_in(&self) -> u8 {
        self.ep_in
    }

    /// Address of the bulk endpoint from host to device.
    pub fn ep_out(&self) -> u8 {
        self.ep_out
    }

    /// Zero-length packet mask.
    pub fn zero_mask(&self) -> u16 {
        self.zero_mask
    }

    /// Whether the device node could be opened for writing.
    ///
    /// Transfers on a read-only handle fail.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether the handle has been kicked.
    pub fn is_dead(&self) -> bool {
        self.state.lock().unwrap().dead
    }

    /// Waits for a notification on the handle until the deadline.
    ///
    /// Returns `false` without waiting if the deadline has passed.
    fn wait_until<'a>(&self, state: MutexGuard<'a, State>, deadline: Instant) -> (MutexGuard<'a, State>, bool) {
        let now = Instant::now();
        if now >= deadline {
            return (state, false);
        }
        let (state, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
        (state, true)
    }

    /// Performs a single bulk transfer to the device.
    ///
    /// Blocks until the transfer has been reaped by a reading thread or the write timeout
    /// has elapsed. Returns the number of bytes transferred.
    pub fn bulk_write(&self, data: &[u8]) -> Result<usize> {
        let deadline = Instant::now() + self.write_timeout;

        let mut state = self.state.lock().unwrap();
        if state.dead {
            return Err(Error::Dead);
        }

        // A timed out write stays in flight until it has been reaped.
        while state.out_busy {
            let (s, waited) = self.wait_until(state, deadline);
            state = s;
            if state.dead {
                return Err(Error::Dead);
            }
            if !waited {
                return Err(Error::TimedOut { transferred: 0 });
            }
        }

        self.device.submit(Slot::Out, self.ep_out, Bytes::copy_from_slice(data).into()).map_err(Error::Submit)?;
        state.out_busy = true;
        state.out_result = None;

        loop {
            let (s, waited) = self.wait_until(state, deadline);
            state = s;

            if state.dead {
                return Err(Error::TimedOut { transferred: 0 });
            }

            if !state.out_busy {
                return match state.out_result.take() {
                    Some(Ok(n)) => Ok(n),
                    Some(Err(err)) => Err(Error::Failed(err)),
                    None => Err(Error::Failed(io::Error::from_raw_os_error(libc::ENODEV))),
                };
            }

            if !waited {
                log::debug!("{}: write of {} bytes timed out", self.path.display(), data.len());
                if let Err(err) = self.device.discard(Slot::Out) {
                    log::trace!("{}: discarding timed out write failed: {err}", self.path.display());
                }
                return Err(Error::TimedOut { transferred: 0 });
            }
        }
    }

    /// Performs a single bulk transfer from the device.
    ///
    /// Blocks until data has been received. Completions of writes are processed while waiting.
    /// Returns the number of bytes received.
    pub fn bulk_read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return Err(Error::Dead);
        }

        self.device.submit(Slot::In, self.ep_in, BytesMut::with_capacity(buf.len()).into()).map_err(Error::Submit)?;
        state.in_busy = true;

        loop {
            state.reaper = Some(Interruptible::current());
            drop(state);

            let res = self.device.reap();

            state = self.state.lock().unwrap();
            state.reaper = None;

            if state.dead {
                return Err(Error::Dead);
            }

            let comp = match res {
                Ok(comp) => comp,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("{}: reaping transfer failed: {err}", self.path.display());
                    return Err(Error::Reap(err));
                }
            };
            log::trace!(
                "{}: reaped {} transfer with status {} and {} bytes",
                self.path.display(),
                comp.slot,
                comp.status,
                comp.actual_length
            );

            match comp.slot {
                Slot::Out => {
                    state.out_busy = false;
                    state.out_result = Some(comp.result());
                    self.cv.notify_all();
                }
                Slot::In => {
                    state.in_busy = false;

                    let data = comp.buf.data();
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);

                    return match comp.status {
                        0 => Ok(n),
                        status if status == -libc::ETIMEDOUT => Err(Error::TimedOut { transferred: n }),
                        status => Err(Error::Failed(io::Error::from_raw_os_error(-status))),
                    };
                }
            }
        }
    }

    /// Writes all data to the device.
    ///
    /// If required by the interface protocol, a zero-length packet follows data that
    /// is an exact multiple of the packet size.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let n = self.bulk_write(data)?;
        if n != data.len() {
            log::debug!("{}: short write of {n} of {} bytes", self.path.display(), data.len());
            return Err(Error::Short { expected: data.len(), actual: n });
        }

        if zero_packet_required(self.zero_mask, data.len()) {
            self.bulk_write(&[])?;
        }

        Ok(())
    }

    /// Fills the buffer with data read from the device.
    ///
    /// Data received before a transfer times out is kept and reading continues
    /// with the remaining length.
    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let remaining = buf.len() - offset;
            match self.bulk_read(&mut buf[offset..]) {
                Ok(n) if n == remaining => offset += n,
                Ok(n) => {
                    log::debug!("{}: short read of {n} of {remaining} bytes", self.path.display());
                    return Err(Error::Short { expected: remaining, actual: n });
                }
                Err(Error::TimedOut { transferred }) => {
                    log::trace!("{}: read timed out after {transferred} bytes", self.path.display());
                    offset += transferred;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Reads exactly `len` bytes from the device.
    pub fn read_bytes(&self, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        self.read(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Marks the handle as dead and cancels all transfers.
    ///
    /// Returns whether the handle was alive.
    pub(crate) fn kick(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return false;
        }

        log::debug!("kicking {}", self.path.display());
        state.dead = true;

        if self.writable {
            if let Some(reaper) = state.reaper {
                reaper.interrupt();
            }

            for slot in Slot::ALL {
                if let Err(err) = self.device.discard(slot) {
                    log::trace!("{}: discarding {slot} transfer failed: {err}", self.path.display());
                }
            }

            state.out_result = Some(Err(io::Error::from_raw_os_error(libc::ENODEV)));
            state.in_busy = false;
            state.out_busy = false;
            self.cv.notify_all();
        }

        true
    }
}
