//! USB descriptor parsing.
//!
//! A usbfs device node starts with the device descriptor, followed by the
//! descriptors of the active configuration: the configuration descriptor and
//! a sequence of interface, endpoint and other descriptors, each prefixed by
//! its length and type.

use byteorder::{ReadBytesExt, LE};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
};

use crate::{hex_u16, hex_u8};

/// Direction bit of an endpoint address, set for endpoints to the host.
pub const DIR_IN: u8 = 0x80;

/// Mask of the transfer type in endpoint attributes.
const TRANSFER_TYPE_MASK: u8 = 0x03;
/// Bulk transfer type.
pub const TRANSFER_BULK: u8 = 0x02;

/// Interface protocol that requires zero-length packets after transfers that are
/// an exact multiple of the packet size.
pub const ZERO_PACKET_PROTOCOL: u8 = 0x01;

/// USB vendor and product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id {
    /// Vendor id.
    pub vendor: u16,
    /// Product id.
    pub product: u16,
}

impl Id {
    /// Creates a new USB device id.
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", hex_u16(self.vendor), hex_u16(self.product))
    }
}

/// USB interface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Class {
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub sub_class: u8,
    /// Protocol code.
    pub protocol: u8,
}

impl Class {
    /// Vendor specific class code.
    pub const VENDOR_SPECIFIC: u8 = 0xff;

    /// Creates a new USB interface class.
    pub const fn new(class: u8, sub_class: u8, protocol: u8) -> Self {
        Self { class, sub_class, protocol }
    }

    /// Creates a new USB interface class with vendor specific class code.
    pub const fn vendor_specific(sub_class: u8, protocol: u8) -> Self {
        Self::new(Self::VENDOR_SPECIFIC, sub_class, protocol)
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", hex_u8(self.class), hex_u8(self.sub_class), hex_u8(self.protocol))
    }
}

fn invalid(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

/// USB device descriptor.
#[derive(Clone, Debug)]
pub struct DeviceDesc {
    /// USB specification release.
    pub usb: u16,
    /// Device class.
    pub class: Class,
    /// Maximum packet size of endpoint 0.
    pub max_packet_size0: u8,
    /// Vendor and product id.
    pub id: Id,
    /// Device release.
    pub device: u16,
    /// Manufacturer string index.
    pub manufacturer_idx: u8,
    /// Product string index.
    pub product_idx: u8,
    /// Serial number string index.
    pub serial_number_idx: u8,
    /// Number of configurations.
    pub num_configurations: u8,
}

impl DeviceDesc {
    /// Device descriptor type.
    pub const TYPE: u8 = 0x01;
    /// Size of device descriptor.
    pub const SIZE: usize = 18;

    /// Parse from raw descriptor data.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if usize::from(data.read_u8()?) != Self::SIZE {
            return Err(invalid("device descriptor size mismatch"));
        }
        if data.read_u8()? != Self::TYPE {
            return Err(invalid("device descriptor type mismatch"));
        }

        let usb = data.read_u16::<LE>()?;
        let class = Class::new(data.read_u8()?, data.read_u8()?, data.read_u8()?);
        let max_packet_size0 = data.read_u8()?;
        let id = Id::new(data.read_u16::<LE>()?, data.read_u16::<LE>()?);
        let device = data.read_u16::<LE>()?;
        let manufacturer_idx = data.read_u8()?;
        let product_idx = data.read_u8()?;
        let serial_number_idx = data.read_u8()?;
        let num_configurations = data.read_u8()?;

        Ok(Self {
            usb,
            class,
            max_packet_size0,
            id,
            device,
            manufacturer_idx,
            product_idx,
            serial_number_idx,
            num_configurations,
        })
    }
}

/// USB configuration descriptor.
#[derive(Clone, Debug)]
pub struct ConfigDesc {
    /// Total length of configuration data.
    pub total_length: u16,
    /// Number of interfaces.
    pub num_interfaces: u8,
    /// Configuration value.
    pub configuration_value: u8,
    /// Configuration string index.
    pub configuration_idx: u8,
    /// Attributes.
    pub attributes: u8,
    /// Maximum power in units of 2 mA.
    pub max_power: u8,
}

impl ConfigDesc {
    /// Configuration descriptor type.
    pub const TYPE: u8 = 0x02;
    /// Size of configuration descriptor.
    pub const SIZE: usize = 9;

    /// Parse from raw descriptor data.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if usize::from(data.read_u8()?) != Self::SIZE {
            return Err(invalid("configuration descriptor size mismatch"));
        }
        if data.read_u8()? != Self::TYPE {
            return Err(invalid("configuration descriptor type mismatch"));
        }

        Ok(Self {
            total_length: data.read_u16::<LE>()?,
            num_interfaces: data.read_u8()?,
            configuration_value: data.read_u8()?,
            configuration_idx: data.read_u8()?,
            attributes: data.read_u8()?,
            max_power: data.read_u8()?,
        })
    }
}

/// USB interface descriptor.
#[derive(Clone, Debug)]
pub struct InterfaceDesc {
    /// Interface number.
    pub interface_number: u8,
    /// Alternate setting.
    pub alternate_setting: u8,
    /// Number of endpoints.
    pub num_endpoints: u8,
    /// Interface class.
    pub class: Class,
    /// Interface string index.
    pub name_idx: u8,
}

impl InterfaceDesc {
    /// Interface descriptor type.
    pub const TYPE: u8 = 0x04;
    /// Size of interface descriptor.
    pub const SIZE: usize = 9;

    /// Parse from raw descriptor data.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if usize::from(data.read_u8()?) != Self::SIZE {
            return Err(invalid("interface descriptor size mismatch"));
        }
        if data.read_u8()? != Self::TYPE {
            return Err(invalid("interface descriptor type mismatch"));
        }

        let interface_number = data.read_u8()?;
        let alternate_setting = data.read_u8()?;
        let num_endpoints = data.read_u8()?;
        let class = Class::new(data.read_u8()?, data.read_u8()?, data.read_u8()?);
        let name_idx = data.read_u8()?;

        Ok(Self { interface_number, alternate_setting, num_endpoints, class, name_idx })
    }
}

/// USB endpoint descriptor.
#[derive(Clone, Debug)]
pub struct EndpointDesc {
    /// Endpoint address.
    pub endpoint_address: u8,
    /// Attributes.
    pub attributes: u8,
    /// Maximum packet size.
    pub max_packet_size: u16,
    /// Interval.
    pub interval: u8,
}

impl EndpointDesc {
    /// Endpoint descriptor type.
    pub const TYPE: u8 = 0x05;
    /// Size of endpoint descriptor.
    pub const SIZE: usize = 7;

    /// Parse from raw descriptor data.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if usize::from(data.read_u8()?) != Self::SIZE {
            return Err(invalid("endpoint descriptor size mismatch"));
        }
        if data.read_u8()? != Self::TYPE {
            return Err(invalid("endpoint descriptor type mismatch"));
        }

        let endpoint_address = data.read_u8()?;
        let attributes = data.read_u8()?;
        let max_packet_size = data.read_u16::<LE>()?;
        let interval = data.read_u8()?;

        Ok(Self { endpoint_address, attributes, max_packet_size, interval })
    }

    /// Whether this is a bulk endpoint.
    pub fn is_bulk(&self) -> bool {
        self.attributes & TRANSFER_TYPE_MASK == TRANSFER_BULK
    }

    /// Whether this endpoint transfers data to the host.
    pub fn is_in(&self) -> bool {
        self.endpoint_address & DIR_IN != 0
    }
}

/// SuperSpeed endpoint companion descriptor.
pub struct SsEndpointComp;

impl SsEndpointComp {
    /// SuperSpeed endpoint companion descriptor type.
    pub const TYPE: u8 = 0x30;
    /// Size of SuperSpeed endpoint companion descriptor.
    pub const SIZE: usize = 6;
}

/// Decides whether an interface is used for the transport.
pub trait InterfaceFilter: Send + Sync {
    /// Whether the interface of class `class` on the device with id `id` is a transport interface.
    fn matches(&self, id: Id, class: Class) -> bool;
}

impl<F> InterfaceFilter for F
where
    F: Fn(Id, Class) -> bool + Send + Sync,
{
    fn matches(&self, id: Id, class: Class) -> bool {
        self(id, class)
    }
}

/// Rule of a [`ClassFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterRule {
    /// Interface class that must match exactly.
    pub class: Class,
    /// Restrict to devices with this vendor id.
    pub vendor: Option<u16>,
    /// Restrict to devices with this product id.
    pub product: Option<u16>,
}

impl FilterRule {
    /// Whether the rule accepts the interface.
    pub fn matches(&self, id: Id, class: Class) -> bool {
        self.class == class
            && self.vendor.map(|v| v == id.vendor).unwrap_or(true)
            && self.product.map(|p| p == id.product).unwrap_or(true)
    }
}

/// Interface filter accepting interfaces matching any of a list of rules.
#[derive(Debug, Clone, Default)]
pub struct ClassFilter {
    /// Rules.
    pub rules: Vec<FilterRule>,
}

impl ClassFilter {
    /// Creates a filter that accepts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept interfaces of the specified class on any device.
    #[must_use]
    pub fn with_class(mut self, class: Class) -> Self {
        self.rules.push(FilterRule { class, vendor: None, product: None });
        self
    }

    /// Add a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: FilterRule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl InterfaceFilter for ClassFilter {
    fn matches(&self, id: Id, class: Class) -> bool {
        self.rules.iter().any(|rule| rule.matches(id, class))
    }
}

/// Transport interface found in a device's descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceMatch {
    /// Vendor and product id of the device.
    pub id: Id,
    /// Class of the interface.
    pub class: Class,
    /// Interface number.
    pub interface: u8,
    /// Address of the bulk endpoint from device to host.
    pub ep_in: u8,
    /// Address of the bulk endpoint from host to device.
    pub ep_out: u8,
    /// Serial number string index from the device descriptor.
    pub serial_idx: u8,
    /// Mask for detecting transfers that must be followed by a zero-length packet.
    ///
    /// Zero if no zero-length packets are required.
    pub zero_mask: u16,
}

/// Parses the endpoint descriptor at `pos` and skips a following SuperSpeed
/// endpoint companion descriptor.
///
/// Returns the descriptor and the position after it.
fn endpoint_at(buf: &[u8], mut pos: usize) -> Option<(EndpointDesc, usize)> {
    let data = buf.get(pos..pos + EndpointDesc::SIZE)?;
    let ep = match EndpointDesc::parse(data) {
        Ok(ep) => ep,
        Err(err) => {
            log::trace!("endpoint descriptor at {pos} invalid: {err}");
            return None;
        }
    };
    pos += EndpointDesc::SIZE;

    if let Some(&[len, ty]) = buf.get(pos..pos + 2) {
        if usize::from(len) == SsEndpointComp::SIZE && ty == SsEndpointComp::TYPE {
            pos += SsEndpointComp::SIZE;
        }
    }

    if pos > buf.len() {
        return None;
    }

    Some((ep, pos))
}

/// Searches the descriptors of a device for a transport interface.
///
/// Returns `None` if no interface accepted by `filter` with two bulk endpoints
/// is found or the descriptors are malformed.
pub fn parse(buf: &[u8], filter: &dyn InterfaceFilter) -> Option<InterfaceMatch> {
    if buf.len() < DeviceDesc::SIZE + ConfigDesc::SIZE {
        log::trace!("descriptor length {} is too small", buf.len());
        return None;
    }

    let device = match DeviceDesc::parse(&buf[..DeviceDesc::SIZE]) {
        Ok(device) => device,
        Err(err) => {
            log::trace!("{err}");
            return None;
        }
    };
    log::trace!("device {}", device.id);

    if let Err(err) = ConfigDesc::parse(&buf[DeviceDesc::SIZE..DeviceDesc::SIZE + ConfigDesc::SIZE]) {
        log::trace!("{err}");
        return None;
    }

    let mut pos = DeviceDesc::SIZE + ConfigDesc::SIZE;
    while pos < buf.len() {
        let Some(&[len, ty]) = buf.get(pos..pos + 2) else {
            log::trace!("truncated descriptor header at {pos}");
            return None;
        };
        let len = usize::from(len);
        if len < 2 {
            log::trace!("descriptor at {pos} has impossible length {len}");
            return None;
        }

        if ty != InterfaceDesc::TYPE {
            pos += len;
            continue;
        }

        let Some(data) = buf.get(pos..pos + len) else {
            log::trace!("interface descriptor at {pos} exceeds buffer");
            return None;
        };
        let intf = match InterfaceDesc::parse(data) {
            Ok(intf) => intf,
            Err(err) => {
                log::trace!("{err}");
                return None;
            }
        };
        pos += len;

        log::trace!(
            "interface {} class {} with {} endpoints",
            intf.interface_number,
            intf.class,
            intf.num_endpoints
        );
        if intf.num_endpoints != 2 || !filter.matches(device.id, intf.class) {
            continue;
        }

        let Some((ep1, next)) = endpoint_at(buf, pos) else {
            log::trace!("endpoints not found");
            return None;
        };
        let Some((ep2, next)) = endpoint_at(buf, next) else {
            log::trace!("endpoints not found");
            return None;
        };
        pos = next;

        if !ep1.is_bulk() || !ep2.is_bulk() {
            log::trace!("bulk endpoints not found");
            continue;
        }

        let zero_mask = if intf.class.protocol == ZERO_PACKET_PROTOCOL {
            ep1.max_packet_size.saturating_sub(1)
        } else {
            0
        };

        let (ep_in, ep_out) = if ep1.is_in() {
            (ep1.endpoint_address, ep2.endpoint_address)
        } else {
            (ep2.endpoint_address, ep1.endpoint_address)
        };

        return Some(InterfaceMatch {
            id: device.id,
            class: intf.class,
            interface: intf.interface_number,
            ep_in,
            ep_out,
            serial_idx: device.serial_number_idx,
            zero_mask,
        });
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const BRIDGE: Class = Class::vendor_specific(0x42, 0x01);

    pub fn device() -> Vec<u8> {
        let mut data = vec![18, 1, 0x00, 0x02, 0, 0, 0, 64, 0xd1, 0x18, 0xe7, 0x4e, 0x00, 0x01, 1, 2, 3, 1];
        data.extend([9, 2, 0, 0, 1, 1, 0, 0x80, 250]);
        data
    }

    pub fn interface(number: u8, num_endpoints: u8, class: Class) -> [u8; 9] {
        [9, 4, number, 0, num_endpoints, class.class, class.sub_class, class.protocol, 0]
    }

    pub fn endpoint(address: u8, attributes: u8, max_packet_size: u16) -> [u8; 7] {
        let mps = max_packet_size.to_le_bytes();
        [7, 5, address, attributes, mps[0], mps[1], 0]
    }

    fn bridge_only(_id: Id, class: Class) -> bool {
        class == BRIDGE
    }

    #[test]
    fn bridge_interface() {
        let mut data = device();
        data.extend(interface(0, 2, BRIDGE));
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));

        let m = parse(&data, &bridge_only).unwrap();
        assert_eq!(m.id, Id::new(0x18d1, 0x4ee7));
        assert_eq!(m.interface, 0);
        assert_eq!(m.ep_in, 0x81);
        assert_eq!(m.ep_out, 0x01);
        assert_eq!(m.serial_idx, 3);
        assert_eq!(m.zero_mask, 511);
    }

    #[test]
    fn endpoint_order() {
        let mut data = device();
        data.extend(interface(1, 2, BRIDGE));
        data.extend(endpoint(0x02, TRANSFER_BULK, 64));
        data.extend(endpoint(0x83, TRANSFER_BULK, 64));

        let m = parse(&data, &bridge_only).unwrap();
        assert_eq!(m.interface, 1);
        assert_eq!(m.ep_in, 0x83);
        assert_eq!(m.ep_out, 0x02);
        assert_eq!(m.zero_mask, 63);
    }

    #[test]
    fn no_zero_mask_without_protocol() {
        let class = Class::vendor_specific(0x42, 0x00);
        let mut data = device();
        data.extend(interface(0, 2, class));
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));

        let m = parse(&data, &|_: Id, c: Class| c == class).unwrap();
        assert_eq!(m.zero_mask, 0);
    }

    #[test]
    fn superspeed_companions() {
        let mut data = device();
        data.extend(interface(0, 2, BRIDGE));
        data.extend(endpoint(0x81, TRANSFER_BULK, 1024));
        data.extend([6, 0x30, 0, 0, 0, 0]);
        data.extend(endpoint(0x01, TRANSFER_BULK, 1024));
        data.extend([6, 0x30, 0, 0, 0, 0]);

        let m = parse(&data, &bridge_only).unwrap();
        assert_eq!((m.ep_in, m.ep_out), (0x81, 0x01));
        assert_eq!(m.zero_mask, 1023);
    }

    #[test]
    fn skips_other_interfaces() {
        let hid = Class::new(3, 0, 0);
        let mut data = device();
        data.extend(interface(0, 1, hid));
        data.extend([9, 0x21, 0x11, 0x01, 0, 1, 0x22, 0x3f, 0]);
        data.extend(endpoint(0x84, 0x03, 8));
        data.extend(interface(1, 2, BRIDGE));
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));

        let m = parse(&data, &bridge_only).unwrap();
        assert_eq!(m.interface, 1);
    }

    #[test]
    fn non_bulk_continues_scan() {
        let mut data = device();
        data.extend(interface(0, 2, BRIDGE));
        data.extend(endpoint(0x81, 0x03, 64));
        data.extend(endpoint(0x01, 0x03, 64));
        data.extend(interface(1, 2, BRIDGE));
        data.extend(endpoint(0x82, TRANSFER_BULK, 512));
        data.extend(endpoint(0x02, TRANSFER_BULK, 512));

        let m = parse(&data, &bridge_only).unwrap();
        assert_eq!(m.interface, 1);
        assert_eq!((m.ep_in, m.ep_out), (0x82, 0x02));
    }

    #[test]
    fn filter_rejects() {
        let mut data = device();
        data.extend(interface(0, 2, BRIDGE));
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));

        assert!(parse(&data, &|_: Id, _: Class| false).is_none());
        assert!(parse(&data, &ClassFilter::new()).is_none());
        assert!(parse(&data, &ClassFilter::new().with_class(BRIDGE)).is_some());
    }

    #[test]
    fn too_short() {
        let data = device();
        for len in 0..data.len() {
            assert!(parse(&data[..len], &|_: Id, _: Class| true).is_none());
        }
    }

    #[test]
    fn bad_device_header() {
        let mut data = device();
        data[1] = 2;
        data.extend(interface(0, 2, BRIDGE));
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));
        assert!(parse(&data, &bridge_only).is_none());
    }

    #[test]
    fn truncated_endpoints() {
        let mut data = device();
        data.extend(interface(0, 2, BRIDGE));
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(&endpoint(0x01, TRANSFER_BULK, 512)[..4]);

        for len in DeviceDesc::SIZE + ConfigDesc::SIZE..=data.len() {
            assert!(parse(&data[..len], &bridge_only).is_none());
        }
    }

    #[test]
    fn record_past_end() {
        let mut data = device();
        data.extend([200, 0x24, 0, 0]);
        data.extend(interface(0, 2, BRIDGE));
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));
        assert!(parse(&data, &bridge_only).is_none());
    }

    #[test]
    fn zero_length_record() {
        let mut data = device();
        data.extend([0, 0x24]);
        data.extend(interface(0, 2, BRIDGE));
        assert!(parse(&data, &bridge_only).is_none());
    }

    #[test]
    fn wrong_interface_size() {
        let mut data = device();
        let mut intf = interface(0, 2, BRIDGE).to_vec();
        intf[0] = 10;
        intf.push(0);
        data.extend(intf);
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));
        assert!(parse(&data, &bridge_only).is_none());
    }

    #[test]
    fn endpoints_must_follow_interface() {
        let mut data = device();
        data.extend(interface(0, 2, BRIDGE));
        data.extend([9, 0x21, 0x11, 0x01, 0, 1, 0x22, 0x3f, 0]);
        data.extend(endpoint(0x81, TRANSFER_BULK, 512));
        data.extend(endpoint(0x01, TRANSFER_BULK, 512));
        assert!(parse(&data, &bridge_only).is_none());
    }

    #[test]
    fn class_filter_rules() {
        let filter = ClassFilter::new().with_rule(FilterRule { class: BRIDGE, vendor: Some(0x18d1), product: None });
        assert!(filter.matches(Id::new(0x18d1, 1), BRIDGE));
        assert!(!filter.matches(Id::new(0x0bb4, 1), BRIDGE));
        assert!(!filter.matches(Id::new(0x18d1, 1), Class::vendor_specific(0x42, 0x03)));
    }
}
