//! Linux usbfs interface.

use libc::{c_int, c_uint};
use nix::{ioctl_read, ioctl_write_ptr, ioctl_write_ptr_bad, request_code_none};

/// URB type of bulk transfers, `USBDEVFS_URB_TYPE_BULK`.
pub const URB_TYPE_BULK: u8 = 3;

/// USB request block, `struct usbdevfs_urb`.
///
/// Pointers are stored as `usize` so that the block can be moved between threads
/// together with the buffer it references.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Urb {
    /// URB type.
    pub type_: u8,
    /// Endpoint address.
    pub endpoint: u8,
    /// Completion status, a negated errno value.
    pub status: c_int,
    /// `USBDEVFS_URB_*` flags.
    pub flags: c_uint,
    /// Data buffer.
    pub buffer: usize,
    /// Length of [`buffer`](Self::buffer).
    pub buffer_length: c_int,
    /// Number of bytes transferred.
    pub actual_length: c_int,
    pub start_frame: c_int,
    /// Union with `stream_id`.
    pub number_of_packets: c_int,
    pub error_count: c_int,
    /// Signal to deliver on completion, zero for none.
    pub signr: c_uint,
    /// Opaque user data.
    pub usercontext: usize,
}

impl Urb {
    pub fn bulk(endpoint: u8, buffer: *mut u8, buffer_length: c_int) -> Self {
        Self {
            type_: URB_TYPE_BULK,
            endpoint,
            status: -1,
            buffer: buffer as usize,
            buffer_length,
            ..Default::default()
        }
    }
}

ioctl_read!(submit_urb, b'U', 10, Urb);
ioctl_write_ptr_bad!(discard_urb, request_code_none!(b'U', 11), Urb);
ioctl_write_ptr!(reap_urb, b'U', 12, *mut Urb);
ioctl_read!(claim_interface, b'U', 15, c_uint);
