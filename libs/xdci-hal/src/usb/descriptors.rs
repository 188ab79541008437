//! USB standard descriptors, control requests and the descriptor set a class driver binds with.

use alloc::vec::Vec;

use num_traits::FromPrimitive;

use super::{DeviceError, EpDirection, EpInfo, EpType, Result};

pub const USB_DIR_IN: u8 = 0x80;

pub const USB_TYPE_MASK: u8 = 0x03 << 5;
pub const USB_TYPE_STANDARD: u8 = 0x00 << 5;
pub const USB_TYPE_CLASS: u8 = 0x01 << 5;
pub const USB_TYPE_VENDOR: u8 = 0x02 << 5;
/*
 * USB recipients, the third of three bRequestType fields
 */
pub const USB_RECIP_MASK: u8 = 0x1f;
pub const USB_RECIP_DEVICE: u8 = 0x00;
pub const USB_RECIP_INTERFACE: u8 = 0x01;
pub const USB_RECIP_ENDPOINT: u8 = 0x02;

pub const USB_REQ_GET_STATUS: u8 = 0x00;
pub const USB_REQ_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQ_SET_FEATURE: u8 = 0x03;
pub const USB_REQ_SET_ADDRESS: u8 = 0x05;
pub const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQ_GET_CONFIGURATION: u8 = 0x08;
pub const USB_REQ_SET_CONFIGURATION: u8 = 0x09;
pub const USB_REQ_GET_INTERFACE: u8 = 0x0A;
pub const USB_REQ_SET_INTERFACE: u8 = 0x0B;
pub const USB_REQ_SET_SEL: u8 = 0x30;
pub const USB_REQ_SET_ISOCH_DELAY: u8 = 0x31;

pub const USB_DT_DEVICE: u8 = 0x01;
pub const USB_DT_CONFIG: u8 = 0x02;
pub const USB_DT_STRING: u8 = 0x03;
pub const USB_DT_INTERFACE: u8 = 0x04;
pub const USB_DT_ENDPOINT: u8 = 0x05;
pub const USB_DT_DEVICE_QUALIFIER: u8 = 0x06;
pub const USB_DT_OTHER_SPEED_CONFIG: u8 = 0x07;
pub const USB_DT_BOS: u8 = 0x0f;
pub const USB_DT_DEVICE_CAPABILITY: u8 = 0x10;
/* USB 3.0 additions */
pub const USB_DT_SS_ENDPOINT_COMP: u8 = 0x30;

pub const USB_CAP_TYPE_EXT: u8 = 0x2;

/* feature selectors */
pub const USB_ENDPOINT_HALT: u16 = 0;
pub const USB_DEVICE_REMOTE_WAKEUP: u16 = 1;

pub const USB_DEVICE_SELF_POWERED: u16 = 1 << 0;

/// US English, the only language most devices advertise.
pub const LANG_ID_EN_US: u16 = 0x0409;

/// Decoded 8-byte SETUP packet.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl From<[u8; 8]> for SetupPacket {
    fn from(raw: [u8; 8]) -> Self {
        SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }
}

impl SetupPacket {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[0] = self.request_type;
        raw[1] = self.request;
        raw[2..4].copy_from_slice(&self.value.to_le_bytes());
        raw[4..6].copy_from_slice(&self.index.to_le_bytes());
        raw[6..8].copy_from_slice(&self.length.to_le_bytes());
        raw
    }

    /// Data stage direction; meaningless when `length` is 0.
    pub fn direction(&self) -> EpDirection {
        if self.request_type & USB_DIR_IN != 0 { EpDirection::In } else { EpDirection::Out }
    }

    pub fn kind(&self) -> u8 { self.request_type & USB_TYPE_MASK }

    pub fn recipient(&self) -> u8 { self.request_type & USB_RECIP_MASK }
}

macro_rules! descriptor_bytes {
    ($t:ty) => {
        impl AsRef<[u8]> for $t {
            fn as_ref(&self) -> &[u8] {
                unsafe {
                    core::slice::from_raw_parts(self as *const $t as *const u8, core::mem::size_of::<$t>())
                        as &[u8]
                }
            }
        }
    };
}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_cd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub b_cd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}
descriptor_bytes!(DeviceDescriptor);

impl DeviceDescriptor {
    pub fn new(vendor: u16, product: u16, max_packet_size0: u8) -> Self {
        Self {
            b_length: core::mem::size_of::<Self>() as u8,
            b_descriptor_type: USB_DT_DEVICE,
            b_cd_usb: 0x0300,
            b_device_class: 0,
            b_device_sub_class: 0,
            b_device_protocol: 0,
            b_max_packet_size0: max_packet_size0,
            id_vendor: vendor,
            id_product: product,
            b_cd_device: 0x0100,
            i_manufacturer: 0x01, // string index for manufacturer
            i_product: 0x02,      // string index for product
            i_serial_number: 0x03,
            b_num_configurations: 1,
        }
    }
}

/* USB_DT_DEVICE_QUALIFIER: Device Qualifier descriptor */
#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct QualifierDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_cd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub b_num_configurations: u8,
    pub b_reserved: u8,
}
descriptor_bytes!(QualifierDescriptor);

impl From<&DeviceDescriptor> for QualifierDescriptor {
    fn from(dd: &DeviceDescriptor) -> Self {
        QualifierDescriptor {
            b_length: core::mem::size_of::<Self>() as u8,
            b_descriptor_type: USB_DT_DEVICE_QUALIFIER,
            // qualifiers only exist for USB 2.0
            b_cd_usb: 0x0200,
            b_device_class: dd.b_device_class,
            b_device_sub_class: dd.b_device_sub_class,
            b_device_protocol: dd.b_device_protocol,
            b_max_packet_size0: 0x40,
            b_num_configurations: dd.b_num_configurations,
            b_reserved: 0,
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ConfigDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}
descriptor_bytes!(ConfigDescriptor);

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}
descriptor_bytes!(InterfaceDescriptor);

impl InterfaceDescriptor {
    pub fn new(if_num: u8, class: u8, sub_class: u8, protocol: u8) -> Self {
        InterfaceDescriptor {
            b_length: core::mem::size_of::<Self>() as u8,
            b_descriptor_type: USB_DT_INTERFACE,
            b_interface_number: if_num,
            b_alternate_setting: 0,
            b_num_endpoints: 0,
            b_interface_class: class,
            b_interface_sub_class: sub_class,
            b_interface_protocol: protocol,
            i_interface: 0,
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}
descriptor_bytes!(EndpointDescriptor);

impl EndpointDescriptor {
    pub fn new(addr: u8, ep_type: EpType, max_packet_size: u16, interval: u8) -> Self {
        EndpointDescriptor {
            b_length: core::mem::size_of::<Self>() as u8,
            b_descriptor_type: USB_DT_ENDPOINT,
            b_endpoint_address: addr,
            bm_attributes: ep_type as u8,
            w_max_packet_size: max_packet_size,
            b_interval: interval,
        }
    }

    pub fn ep_num(&self) -> u8 { self.b_endpoint_address & 0x0F }

    pub fn direction(&self) -> EpDirection { EpDirection::from_address(self.b_endpoint_address) }

    pub fn ep_type(&self) -> EpType { EpType::from_u8(self.bm_attributes & 0x3).unwrap_or(EpType::Control) }
}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SsEndpointCompanionDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_max_burst: u8,
    pub bm_attributes: u8,
    pub w_bytes_per_interval: u16,
}
descriptor_bytes!(SsEndpointCompanionDescriptor);

impl SsEndpointCompanionDescriptor {
    pub fn new(max_burst: u8, attributes: u8) -> Self {
        SsEndpointCompanionDescriptor {
            b_length: core::mem::size_of::<Self>() as u8,
            b_descriptor_type: USB_DT_SS_ENDPOINT_COMP,
            b_max_burst: max_burst,
            bm_attributes: attributes,
            w_bytes_per_interval: 0,
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct BosDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_device_caps: u8,
}
descriptor_bytes!(BosDescriptor);

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ExtCapDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_dev_capability_type: u8,
    pub bm_attributes: u32,
}
descriptor_bytes!(ExtCapDescriptor);

/// BOS descriptor advertising only the USB 2.0 extension (LPM) capability.
pub fn bos_usb2_ext(attributes: u32) -> Vec<u8> {
    let total = core::mem::size_of::<BosDescriptor>() + core::mem::size_of::<ExtCapDescriptor>();
    let bos = BosDescriptor {
        b_length: core::mem::size_of::<BosDescriptor>() as u8,
        b_descriptor_type: USB_DT_BOS,
        w_total_length: total as u16,
        b_num_device_caps: 1,
    };
    let ext = ExtCapDescriptor {
        b_length: core::mem::size_of::<ExtCapDescriptor>() as u8,
        b_descriptor_type: USB_DT_DEVICE_CAPABILITY,
        b_dev_capability_type: USB_CAP_TYPE_EXT,
        bm_attributes: attributes,
    };
    let mut v = Vec::with_capacity(total);
    v.extend_from_slice(bos.as_ref());
    v.extend_from_slice(ext.as_ref());
    v
}

/// String descriptor for `s`, UTF-16LE encoded.
pub fn string_descriptor(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + s.len() * 2);
    v.push(0);
    v.push(USB_DT_STRING);
    for unit in s.encode_utf16() {
        v.extend_from_slice(&unit.to_le_bytes());
    }
    v[0] = v.len() as u8;
    v
}

/// String descriptor zero: the supported language ids.
pub fn language_descriptor(langs: &[u16]) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + langs.len() * 2);
    v.push((2 + langs.len() * 2) as u8);
    v.push(USB_DT_STRING);
    for lang in langs {
        v.extend_from_slice(&lang.to_le_bytes());
    }
    v
}

#[derive(Debug, Clone)]
pub struct EndpointObj {
    pub desc: EndpointDescriptor,
    pub companion: Option<SsEndpointCompanionDescriptor>,
}

impl EndpointObj {
    pub fn new(desc: EndpointDescriptor) -> Self { EndpointObj { desc, companion: None } }

    pub fn with_companion(desc: EndpointDescriptor, companion: SsEndpointCompanionDescriptor) -> Self {
        EndpointObj { desc, companion: Some(companion) }
    }

    pub fn ep_info(&self) -> EpInfo {
        let (burst, streams) = match self.companion {
            Some(c) if self.desc.ep_type() == EpType::Bulk => (c.b_max_burst, c.bm_attributes & 0x1F),
            Some(c) => (c.b_max_burst, 0),
            None => (0, 0),
        };
        EpInfo {
            ep_num: self.desc.ep_num(),
            ep_dir: self.desc.direction(),
            ep_type: self.desc.ep_type(),
            max_pkt_size: self.desc.w_max_packet_size & 0x7FF,
            burst_size: burst,
            interval: self.desc.b_interval,
            max_streams: streams,
        }
    }

    fn len(&self) -> usize {
        core::mem::size_of::<EndpointDescriptor>()
            + self.companion.map(|_| core::mem::size_of::<SsEndpointCompanionDescriptor>()).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceObj {
    pub desc: InterfaceDescriptor,
    /// Class-specific descriptors emitted between the interface and its endpoints
    pub class_specific: Vec<u8>,
    pub endpoints: Vec<EndpointObj>,
}

impl InterfaceObj {
    pub fn new(mut desc: InterfaceDescriptor, endpoints: Vec<EndpointObj>) -> Self {
        desc.b_num_endpoints = endpoints.len() as u8;
        InterfaceObj { desc, class_specific: Vec::new(), endpoints }
    }

    fn len(&self) -> usize {
        core::mem::size_of::<InterfaceDescriptor>()
            + self.class_specific.len()
            + self.endpoints.iter().map(|e| e.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigObj {
    pub desc: ConfigDescriptor,
    pub interfaces: Vec<InterfaceObj>,
}

impl ConfigObj {
    /// Build a configuration, deriving `wTotalLength` and `bNumInterfaces` from the contents.
    pub fn new(value: u8, attributes: u8, max_power: u8, interfaces: Vec<InterfaceObj>) -> Self {
        let total =
            core::mem::size_of::<ConfigDescriptor>() + interfaces.iter().map(|i| i.len()).sum::<usize>();
        ConfigObj {
            desc: ConfigDescriptor {
                b_length: core::mem::size_of::<ConfigDescriptor>() as u8,
                b_descriptor_type: USB_DT_CONFIG,
                w_total_length: total as u16,
                b_num_interfaces: interfaces.len() as u8,
                b_configuration_value: value,
                i_configuration: 0,
                bm_attributes: attributes,
                b_max_power: max_power,
            },
            interfaces,
        }
    }

    pub fn value(&self) -> u8 { self.desc.b_configuration_value }

    pub fn total_length(&self) -> usize { self.desc.w_total_length as usize }

    /// The configuration descriptor followed by every interface, class-specific and endpoint
    /// descriptor in declared order, cut to the declared total length.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.total_length());
        v.extend_from_slice(self.desc.as_ref());
        for iface in self.interfaces.iter() {
            v.extend_from_slice(iface.desc.as_ref());
            v.extend_from_slice(&iface.class_specific);
            for ep in iface.endpoints.iter() {
                v.extend_from_slice(ep.desc.as_ref());
                if let Some(comp) = ep.companion.as_ref() {
                    v.extend_from_slice(comp.as_ref());
                }
            }
        }
        v.truncate(self.total_length());
        v
    }

    /// Endpoint parameters in declared interface order.
    pub fn ep_infos(&self) -> Vec<EpInfo> {
        self.interfaces.iter().flat_map(|i| i.endpoints.iter().map(|e| e.ep_info())).collect()
    }
}

/// Everything a host can ask for over GET_DESCRIPTOR, owned by the class driver.
#[derive(Debug, Clone)]
pub struct DeviceDescriptorSet {
    pub device: DeviceDescriptor,
    pub configs: Vec<ConfigObj>,
    /// Raw string descriptors; entry 0 is the language id list
    pub strings: Vec<Vec<u8>>,
    pub bos: Option<Vec<u8>>,
}

impl DeviceDescriptorSet {
    pub fn config_by_index(&self, index: usize) -> Option<&ConfigObj> { self.configs.get(index) }

    pub fn config_by_value(&self, value: u8) -> Option<&ConfigObj> {
        self.configs.iter().find(|c| c.value() == value)
    }

    pub fn languages(&self) -> Vec<u16> {
        match self.strings.first() {
            Some(d) if d.len() >= 2 => {
                d[2..].chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()
            }
            _ => Vec::new(),
        }
    }

    /// String descriptor `index` in language `lang`. Index 0 ignores `lang`.
    pub fn string(&self, index: u8, lang: u16) -> Result<&[u8]> {
        if index != 0 && !self.languages().contains(&lang) {
            log::warn!("string {} requested in unsupported language {:04x}", index, lang);
            return Err(DeviceError::InvalidParameter);
        }
        self.strings.get(index as usize).map(|s| s.as_slice()).ok_or(DeviceError::InvalidParameter)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::vec;

    use super::*;

    /// One configuration, one interface, one bulk endpoint pair.
    pub(crate) fn bulk_pair_set(mps: u16) -> DeviceDescriptorSet {
        let iface = InterfaceObj::new(
            InterfaceDescriptor::new(0, 0xFF, 0, 0),
            vec![
                EndpointObj::new(EndpointDescriptor::new(0x81, EpType::Bulk, mps, 0)),
                EndpointObj::new(EndpointDescriptor::new(0x01, EpType::Bulk, mps, 0)),
            ],
        );
        DeviceDescriptorSet {
            device: DeviceDescriptor::new(0x1209, 0x3613, 9),
            configs: vec![ConfigObj::new(1, 0xC0, 50, vec![iface])],
            strings: vec![
                language_descriptor(&[LANG_ID_EN_US]),
                string_descriptor("Kosagi"),
                string_descriptor("xDCI gadget"),
                string_descriptor("0001"),
            ],
            bos: Some(bos_usb2_ext(1 << 1)),
        }
    }

    #[test]
    fn layouts() {
        assert_eq!(core::mem::size_of::<DeviceDescriptor>(), 18);
        assert_eq!(core::mem::size_of::<QualifierDescriptor>(), 10);
        assert_eq!(core::mem::size_of::<ConfigDescriptor>(), 9);
        assert_eq!(core::mem::size_of::<InterfaceDescriptor>(), 9);
        assert_eq!(core::mem::size_of::<EndpointDescriptor>(), 7);
        assert_eq!(core::mem::size_of::<SsEndpointCompanionDescriptor>(), 6);
        assert_eq!(core::mem::size_of::<BosDescriptor>(), 5);
        assert_eq!(core::mem::size_of::<ExtCapDescriptor>(), 7);
    }

    #[test]
    fn config_chain() {
        let set = bulk_pair_set(512);
        let cfg = set.config_by_index(0).unwrap();
        assert_eq!(cfg.total_length(), 9 + 9 + 7 + 7);
        let bytes = cfg.to_bytes();
        assert_eq!(bytes.len(), cfg.total_length());
        assert_eq!(&bytes[..4], &[9, USB_DT_CONFIG, 32, 0]);
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[9 + 4], 2);
        assert_eq!(&bytes[18..22], &[7, USB_DT_ENDPOINT, 0x81, 0x02]);
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 512);
    }

    #[test]
    fn companion_feeds_ep_info() {
        let ep = EndpointObj::with_companion(
            EndpointDescriptor::new(0x82, EpType::Bulk, 1024, 0),
            SsEndpointCompanionDescriptor::new(15, 4),
        );
        let info = ep.ep_info();
        assert_eq!(info.ep_num, 2);
        assert_eq!(info.ep_dir, EpDirection::In);
        assert_eq!(info.burst_size, 15);
        assert_eq!(info.max_streams, 4);
        assert_eq!(info.physical(), 5);
    }

    #[test]
    fn strings() {
        let set = bulk_pair_set(512);
        assert_eq!(set.string(0, 0).unwrap(), &[4, USB_DT_STRING, 0x09, 0x04]);
        assert_eq!(
            set.string(1, LANG_ID_EN_US).unwrap(),
            &[14, 3, b'K', 0, b'o', 0, b's', 0, b'a', 0, b'g', 0, b'i', 0]
        );
        assert_eq!(set.string(1, 0x0407), Err(DeviceError::InvalidParameter));
        assert_eq!(set.string(9, LANG_ID_EN_US), Err(DeviceError::InvalidParameter));
    }

    #[test]
    fn setup_packet_parse() {
        let s = SetupPacket::from([0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(s.request, USB_REQ_GET_DESCRIPTOR);
        assert_eq!(s.value, 0x0200);
        assert_eq!(s.length, 255);
        assert_eq!(s.direction(), EpDirection::In);
        assert_eq!(s.kind(), USB_TYPE_STANDARD);
        assert_eq!(SetupPacket::from(s.to_bytes()), s);
    }

    #[test]
    fn qualifier_from_device() {
        let set = bulk_pair_set(512);
        let q = QualifierDescriptor::from(&set.device);
        assert_eq!(q.as_ref()[0], 10);
        assert_eq!(q.as_ref()[1], USB_DT_DEVICE_QUALIFIER);
        assert_eq!(q.as_ref()[8], 1);
    }
}
