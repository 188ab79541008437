pub mod cmd;
pub mod compat;
pub mod core_driver;
pub mod descriptors;
pub mod device_mode;
pub mod driver;
pub mod event;
pub mod fnio;
pub mod trb;
pub mod utra;

#[cfg(test)]
pub(crate) mod mock;

pub use cmd::PollConfig;
pub use compat::{PhysMmio, RegisterBank};
pub use core_driver::UsbDeviceCoreDriver;
pub use device_mode::{UsbClassDriver, UsbDeviceMode};
pub use driver::{XdciConfig, XdciCore};
pub use fnio::UsbFnIo;

/// Errors reported by every layer of the stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Bad caller input: out of range address, null buffer, zero size and the like.
    InvalidParameter,
    /// The hardware reported, or we detected, an inconsistent condition.
    Device,
    /// A bounded poll ran out of attempts.
    Timeout,
    /// TRB chain, event pool or buffer tracking space exhausted.
    OutOfResources,
    /// The endpoint already has a request in flight.
    NotReady,
    /// Recognized, but not implemented.
    Unsupported,
}

impl core::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceError::InvalidParameter => f.write_str("invalid parameter"),
            DeviceError::Device => f.write_str("device error"),
            DeviceError::Timeout => f.write_str("hardware timeout"),
            DeviceError::OutOfResources => f.write_str("out of resources"),
            DeviceError::NotReady => f.write_str("endpoint busy"),
            DeviceError::Unsupported => f.write_str("unsupported"),
        }
    }
}

pub type Result<T> = core::result::Result<T, DeviceError>;

pub const USB_SEND: u8 = 1;
pub const USB_RECV: u8 = 0;

/// Endpoint transfer direction, as seen from the host.
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum EpDirection {
    /// host-to-device
    #[default]
    Out = USB_RECV,
    /// device-to-host
    In = USB_SEND,
}
impl EpDirection {
    pub fn from_address(addr: u8) -> Self {
        if addr & 0x80 != 0 { EpDirection::In } else { EpDirection::Out }
    }

    pub fn from_physical(phys_ep: usize) -> Self {
        if phys_ep & 1 != 0 { EpDirection::In } else { EpDirection::Out }
    }
}

#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum EpType {
    #[default]
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Negotiated or desired bus speed, encoded as the DCFG/DSTS speed field.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum UsbSpeed {
    High = 0,
    Full = 1,
    Low = 2,
    Full48 = 3,
    Super = 4,
    SuperPlus = 5,
}
impl UsbSpeed {
    /// EP0 max packet size for a control endpoint running at this speed.
    pub fn ctrl_max_packet_size(&self) -> u16 {
        match self {
            UsbSpeed::Super | UsbSpeed::SuperPlus => SS_CTRL_EP_MPS,
            UsbSpeed::High => HS_CTRL_EP_MPS,
            UsbSpeed::Full | UsbSpeed::Full48 => FS_CTRL_EP_MPS,
            UsbSpeed::Low => LS_CTRL_EP_MPS,
        }
    }

    pub fn is_super(&self) -> bool { matches!(self, UsbSpeed::Super | UsbSpeed::SuperPlus) }
}

pub const SS_CTRL_EP_MPS: u16 = 512;
pub const HS_CTRL_EP_MPS: u16 = 64;
pub const FS_CTRL_EP_MPS: u16 = 8;
pub const LS_CTRL_EP_MPS: u16 = 8;

/// Port capability direction programmed into GCTL.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortRole {
    Host = 1,
    Device = 2,
    Otg = 3,
}

/* device state */
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDeviceState {
    Default = 0,
    Address,
    Configured,
}

/// Link state as reported in DSTS and in link-state-change event info.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum LinkState {
    U0 = 0,
    U1 = 1,
    U2 = 2,
    U3 = 3,
    SsDisabled = 4,
    RxDetect = 5,
    SsInactive = 6,
    Polling = 7,
    Recovery = 8,
    HotReset = 9,
    Compliance = 10,
    Loopback = 11,
    Reset = 14,
    Resume = 15,
}

/// Endpoint description programmed into the controller with SET_EP_CONFIG.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EpInfo {
    pub ep_num: u8,
    pub ep_dir: EpDirection,
    pub ep_type: EpType,
    pub max_pkt_size: u16,
    /// SuperSpeed max burst, zero based (the companion descriptor's `bMaxBurst`)
    pub burst_size: u8,
    /// `bInterval` as found in the endpoint descriptor
    pub interval: u8,
    pub max_streams: u8,
}
impl EpInfo {
    pub const fn control(dir: EpDirection, max_pkt_size: u16) -> Self {
        EpInfo {
            ep_num: 0,
            ep_dir: dir,
            ep_type: EpType::Control,
            max_pkt_size,
            burst_size: 0,
            interval: 0,
            max_streams: 0,
        }
    }

    pub const fn physical(&self) -> usize { physical_ep(self.ep_num, self.ep_dir) }
}

/// Convert a logical endpoint number and direction into the physical endpoint index.
pub const fn physical_ep(ep_num: u8, dir: EpDirection) -> usize { ep_num as usize * 2 + dir as usize }
