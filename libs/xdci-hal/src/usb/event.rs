//! Event buffer entries and the per-interrupt-line event buffers.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use bitfield::bitfield;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::{DeviceError, Result};

/// Default bytes per event buffer.
pub const EVENT_BUFFER_BYTES: usize = 1024;
/// Event buffers we are willing to program, regardless of what GHWPARAMS1 advertises.
pub const MAX_EVENT_BUFFERS: usize = 4;

pub const EVENT_SIZE: usize = 4;
/// Vendor device test LMP events carry two extra words.
pub const TEST_LMP_EVENT_SIZE: usize = 12;

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum DeviceEventCode {
    Disconnect = 0,
    UsbReset = 1,
    ConnectionDone = 2,
    LinkStateChange = 3,
    Wakeup = 4,
    HibernationRequest = 5,
    Suspend = 6,
    Sof = 7,
    ErraticError = 9,
    CommandComplete = 10,
    BufferOverflow = 11,
    TestLmp = 12,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum EpEventType {
    XferComplete = 1,
    XferInProgress = 2,
    XferNotReady = 3,
    StreamEvent = 6,
    CommandComplete = 7,
}

bitfield! {
    pub struct DeviceEventEntry(u32);
    impl Debug;
    pub is_device, _: 0;
    pub dev_specific, _: 7, 1;
    pub code, _: 11, 8;
    pub info, _: 24, 16;
    pub link_state, _: 19, 16;
}

bitfield! {
    pub struct EpEventEntry(u32);
    impl Debug;
    pub is_device, _: 0;
    pub phys_ep, _: 5, 1;
    pub event_type, _: 9, 6;
    pub status, _: 15, 12;
    pub params, _: 31, 16;
}

/// A decoded event buffer entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    Device { code: DeviceEventCode, info: u32 },
    Endpoint { phys_ep: usize, kind: EpEventType, status: u32, params: u32 },
    Unknown(u32),
}

impl Event {
    pub fn decode(raw: u32) -> Event {
        if DeviceEventEntry(raw).is_device() {
            let entry = DeviceEventEntry(raw);
            match DeviceEventCode::from_u32(entry.code()) {
                Some(code) if entry.dev_specific() == 0 => Event::Device { code, info: entry.info() },
                _ => Event::Unknown(raw),
            }
        } else {
            let entry = EpEventEntry(raw);
            match EpEventType::from_u32(entry.event_type()) {
                Some(kind) => Event::Endpoint {
                    phys_ep: entry.phys_ep() as usize,
                    kind,
                    status: entry.status(),
                    params: entry.params(),
                },
                None => Event::Unknown(raw),
            }
        }
    }

    /// Bytes this entry occupies in the event buffer.
    pub fn size(&self) -> usize {
        match self {
            Event::Device { code: DeviceEventCode::TestLmp, .. } => TEST_LMP_EVENT_SIZE,
            _ => EVENT_SIZE,
        }
    }
}

/// One circular, hardware-written event buffer and our read cursor into it.
pub struct EventBuffer {
    mem: Box<[u32]>,
    cursor: usize,
}

impl EventBuffer {
    pub fn new(bytes: usize) -> Result<Self> {
        if bytes < TEST_LMP_EVENT_SIZE || bytes % EVENT_SIZE != 0 || bytes > 0xFFFF {
            return Err(DeviceError::InvalidParameter);
        }
        Ok(EventBuffer { mem: vec![0u32; bytes / EVENT_SIZE].into_boxed_slice(), cursor: 0 })
    }

    pub fn addr(&self) -> u64 { self.mem.as_ptr() as usize as u64 }

    pub fn len_bytes(&self) -> usize { self.mem.len() * EVENT_SIZE }

    pub fn cursor(&self) -> usize { self.cursor }

    /// Raw entry under the cursor.
    pub fn peek(&self) -> u32 { unsafe { core::ptr::read_volatile(&self.mem[self.cursor / EVENT_SIZE]) } }

    pub fn advance(&mut self, bytes: usize) {
        self.cursor += bytes;
        if self.cursor >= self.len_bytes() {
            self.cursor -= self.len_bytes();
        }
    }

    pub fn reset(&mut self) {
        for word in self.mem.iter_mut() {
            unsafe { core::ptr::write_volatile(word, 0) };
        }
        self.cursor = 0;
    }
}

/// Event buffers, one per interrupt line.
pub struct EventPool {
    bufs: Vec<EventBuffer>,
}

impl EventPool {
    pub fn new(lines: usize, bytes: usize) -> Result<Self> {
        let mut bufs = Vec::with_capacity(lines);
        for _ in 0..lines {
            bufs.push(EventBuffer::new(bytes)?);
        }
        Ok(EventPool { bufs })
    }

    pub fn lines(&self) -> usize { self.bufs.len() }

    pub fn get(&self, line: usize) -> Option<&EventBuffer> { self.bufs.get(line) }

    pub fn get_mut(&mut self, line: usize) -> Option<&mut EventBuffer> { self.bufs.get_mut(line) }

    pub fn iter(&self) -> impl Iterator<Item = &EventBuffer> { self.bufs.iter() }
}

#[cfg(test)]
pub(crate) fn encode_device_event(code: DeviceEventCode, info: u32) -> u32 {
    1 | (code as u32) << 8 | (info & 0x1FF) << 16
}

#[cfg(test)]
pub(crate) fn encode_ep_event(phys_ep: usize, kind: EpEventType, status: u32, params: u32) -> u32 {
    (phys_ep as u32 & 0x1F) << 1 | (kind as u32) << 6 | (status & 0xF) << 12 | (params & 0xFFFF) << 16
}
