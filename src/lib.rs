//! This library implements the host side of a USB bulk transport on Linux.
//! It discovers USB devices exposing a matching two-endpoint bulk interface
//! and provides blocking byte-stream reads and writes over that interface
//! to a higher-level transport layer.
//!
//! ### Requirements
//!
//! usbfs must be available at `/dev/bus/usb` (configurable) and sysfs at `/sys`.
//! Write access to the device nodes is required to claim interfaces and transfer data;
//! devices that can only be opened read-only are still reported to the transport layer.
//!
//! ### Usage
//!
//! Create a [`Registry`] with a [`DeviceOpener`] (normally [`UsbFs`]) and an implementation
//! of [`Transport`] that receives attached devices. Then create a [`Scanner`] with an
//! [`InterfaceFilter`] deciding which interfaces to use and call [`Scanner::spawn`] to
//! start the background discovery loop.
//!
//! Every attached [`Handle`] provides [`Handle::read`] and [`Handle::write`].
//! When a device disappears its handle is kicked: all blocked and future calls fail.
//! The transport layer then calls [`Registry::close`] to remove it.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(not(target_os = "linux"))]
compile_error!("usb_bridge_host only supports Linux");

use std::{ffi::OsStr, os::unix::prelude::OsStrExt};

mod config;
pub use config::*;

pub mod desc;
pub use desc::{Class, ClassFilter, Id, InterfaceFilter, InterfaceMatch};

mod handle;
pub use handle::{Error, Handle, Result};

mod interrupt;

mod registry;
pub use registry::*;

mod scanner;
pub use scanner::*;

pub mod usbfs;
pub use usbfs::{Access, DeviceOpener, UsbDevice, UsbFs};

/// 8-bit value to hexadecimal notation.
fn hex_u8(value: u8) -> String {
    format!("0x{:02x}", value)
}

/// 16-bit value to hexadecimal notation.
fn hex_u16(value: u16) -> String {
    format!("0x{:04x}", value)
}

/// Trims whitespace and NUL bytes from both ends of an OsStr.
fn trim_os_str(value: &OsStr) -> &OsStr {
    let mut value = value.as_bytes();

    while value.first() == Some(&b'\n') || value.first() == Some(&b' ') || value.first() == Some(&b'\0') {
        value = &value[1..];
    }

    while value.last() == Some(&b'\n') || value.last() == Some(&b' ') || value.last() == Some(&b'\0') {
        value = &value[..value.len() - 1];
    }

    OsStr::from_bytes(value)
}

/// Whether a directory entry name consists only of ASCII digits.
///
/// Bus and device directories of usbfs are named by number.
fn is_numeric_name(name: &OsStr) -> bool {
    !name.is_empty() && name.as_bytes().iter().all(u8::is_ascii_digit)
}
