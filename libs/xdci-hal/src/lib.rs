#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Device-mode driver stack for the Synopsys DesignWare USB3 device controller (xDCI).
//!
//! The stack is layered bottom-up:
//!
//! - [`usb::compat`] raw register access and the CSR accessor
//! - [`usb::cmd`] endpoint and generic hardware commands
//! - [`usb::trb`] the Transfer Request Block pool
//! - [`usb::event`] event buffer decoding
//! - [`usb::driver`] the controller core, which owns all of the above
//! - [`usb::device_mode`] the USB chapter 9 protocol layer that drives a class driver
//! - [`usb::fnio`] a transfer-oriented facade for class drivers that want raw messages
//!
//! Nothing here is interrupt driven: the embedding firmware calls the poll entry points often
//! enough that the event buffer never overflows.

extern crate alloc;

pub mod usb;

pub use usb::DeviceError;
