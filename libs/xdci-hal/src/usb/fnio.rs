//! Transfer-oriented facade for class drivers that want messages instead of callbacks.
//!
//! Every poll of [`UsbFnIo::event_handler`] hands back at most one [`FnIoMessage`]; events
//! decoded in the same drain are queued and returned by later calls, in order.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use super::core_driver::UsbDeviceCoreDriver;
use super::descriptors::*;
use super::device_mode::{
    device_info_string, rx_length, DeviceInfoId, DEFAULT_MANUFACTURER, DEFAULT_PRODUCT, DEFAULT_SERIAL,
};
use super::driver::{CallbackEvent, CallbackParam, XferRequest};
use super::trb::TrbControl;
use super::*;

pub const MAX_TRACKED_BUFFERS: usize = 64;
/// Bulk packet size a short TX is measured against when deciding on a trailing ZLP.
pub const ZLP_PACKET_SIZE: u32 = 512;
const MAX_LOGICAL_EPS: usize = 16;

/// Opaque reference to a buffer owned by a [`BufferArena`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    index: u16,
    generation: u16,
}

struct Slot {
    generation: u16,
    buf: Option<Box<[u8]>>,
}

/// Fixed-capacity pool of DMA buffers addressed by generation-checked handles.
pub struct BufferArena {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl BufferArena {
    pub fn new() -> Self { BufferArena { slots: Vec::new(), free: Vec::new() } }

    pub fn allocate(&mut self, size: usize) -> Result<(BufferHandle, usize)> {
        if size == 0 {
            return Err(DeviceError::InvalidParameter);
        }
        let index = match self.free.pop() {
            Some(i) => i,
            None if self.slots.len() < MAX_TRACKED_BUFFERS => {
                self.slots.push(Slot { generation: 0, buf: None });
                (self.slots.len() - 1) as u16
            }
            None => return Err(DeviceError::OutOfResources),
        };
        let slot = &mut self.slots[index as usize];
        let buf = slot.buf.insert(vec![0u8; size].into_boxed_slice());
        Ok((BufferHandle { index, generation: slot.generation }, buf.as_ptr() as usize))
    }

    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        let slot = self.slot_mut(handle).ok_or(DeviceError::InvalidParameter)?;
        slot.buf = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    fn slot_mut(&mut self, handle: BufferHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.buf.is_some())
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&[u8]> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.buf.as_deref())
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> Option<&mut [u8]> {
        self.slot_mut(handle).and_then(|s| s.buf.as_deref_mut())
    }

    pub fn in_use(&self) -> usize { self.slots.iter().filter(|s| s.buf.is_some()).count() }
}

impl Default for BufferArena {
    fn default() -> Self { Self::new() }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub ep_index: u8,
    pub direction: EpDirection,
    pub length: u32,
    pub status: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FnIoMessage {
    None,
    BusAttach(Option<UsbSpeed>),
    BusReset,
    BusSuspend,
    BusResume,
    SetupPacket(SetupPacket),
    EpStatusChangedRx(TransferResult),
    EpStatusChangedTx(TransferResult),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ZlpState {
    Idle,
    Armed,
    /// ZLP in flight; the data completion is reported once it retires
    Sending(TransferResult),
}

/// State shared with the controller core callbacks.
pub struct FnIoContext {
    messages: VecDeque<FnIoMessage>,
    zlp: [ZlpState; MAX_LOGICAL_EPS],
    endpoints: Vec<EpInfo>,
    suspended: bool,
}

impl FnIoContext {
    fn new() -> Self {
        FnIoContext {
            messages: VecDeque::new(),
            zlp: [ZlpState::Idle; MAX_LOGICAL_EPS],
            endpoints: Vec::new(),
            suspended: false,
        }
    }
}

pub struct UsbFnIo<D> {
    core: D,
    ctx: FnIoContext,
    arena: BufferArena,
    descriptors: Option<DeviceDescriptorSet>,
}

impl<D: UsbDeviceCoreDriver<FnIoContext>> UsbFnIo<D> {
    pub fn new(mut core: D) -> Self {
        core.register_callback(CallbackEvent::SetupPktReceived, Self::on_setup);
        core.register_callback(CallbackEvent::XferDone, Self::on_xfer_done);
        core.register_callback(CallbackEvent::BusReset, Self::on_bus_reset);
        core.register_callback(CallbackEvent::ResetDone, Self::on_reset_done);
        core.register_callback(CallbackEvent::LinkStateChange, Self::on_link_state);
        core.register_callback(CallbackEvent::Wakeup, Self::on_wakeup);
        UsbFnIo { core, ctx: FnIoContext::new(), arena: BufferArena::new(), descriptors: None }
    }

    pub fn core(&self) -> &D { &self.core }

    pub fn core_mut(&mut self) -> &mut D { &mut self.core }

    pub fn start_controller(&mut self) -> Result<()> {
        self.core.connect()?;
        self.core.ep0_rx_setup()
    }

    pub fn stop_controller(&mut self) -> Result<()> { self.core.disconnect(&mut self.ctx) }

    pub fn allocate_buffer(&mut self, size: usize) -> Result<(BufferHandle, usize)> {
        self.arena.allocate(size)
    }

    pub fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> { self.arena.free(handle) }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&[u8]> { self.arena.get(handle) }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Option<&mut [u8]> { self.arena.get_mut(handle) }

    /// Record the single configuration, interface and endpoint pair this path supports.
    pub fn configure_endpoints(&mut self, set: &DeviceDescriptorSet) -> Result<()> {
        let cfg = set.configs.first().ok_or(DeviceError::InvalidParameter)?;
        if set.configs.len() > 1 {
            log::warn!("{} configurations supplied, only the first is used", set.configs.len());
        }
        let iface = cfg.interfaces.first().ok_or(DeviceError::InvalidParameter)?;
        if cfg.interfaces.len() > 1 {
            log::warn!("{} interfaces supplied, only the first is used", cfg.interfaces.len());
        }
        if iface.endpoints.len() > 2 {
            log::warn!("{} endpoints supplied, only one IN and one OUT are used", iface.endpoints.len());
        }
        let infos: Vec<EpInfo> = iface.endpoints.iter().map(|e| e.ep_info()).collect();
        let mut endpoints = Vec::with_capacity(2);
        for dir in [EpDirection::In, EpDirection::Out] {
            if let Some(info) = infos.iter().find(|i| i.ep_dir == dir) {
                endpoints.push(*info);
            }
        }
        log::debug!("function endpoints: {:?}", endpoints);
        self.ctx.endpoints = endpoints;
        self.descriptors = Some(set.clone());
        Ok(())
    }

    fn endpoint(&self, ep_index: u8, dir: EpDirection) -> Result<EpInfo> {
        self.ctx
            .endpoints
            .iter()
            .find(|i| i.ep_num == ep_index && i.ep_dir == dir)
            .copied()
            .ok_or(DeviceError::InvalidParameter)
    }

    /// Start a transfer. On endpoint 0 a zero `size` is a status stage, anything else a data
    /// stage.
    pub fn transfer(&mut self, ep_index: u8, dir: EpDirection, buffer: usize, size: u32) -> Result<()> {
        if ep_index as usize >= MAX_LOGICAL_EPS {
            return Err(DeviceError::InvalidParameter);
        }
        if ep_index == 0 {
            let phys = physical_ep(0, dir);
            let mps = self.core.ep_info(phys).map(|i| i.max_pkt_size).unwrap_or(0);
            return match (dir, size) {
                (EpDirection::In, 0) => self.core.ep0_tx_status(),
                (EpDirection::Out, 0) => self.core.ep0_rx_status(),
                (EpDirection::In, _) => {
                    self.core.tx_data(XferRequest::new(EpInfo::control(EpDirection::In, mps), buffer, size))
                }
                (EpDirection::Out, _) => {
                    let len = rx_length(size, mps)?;
                    self.core.rx_data(XferRequest::new(EpInfo::control(EpDirection::Out, mps), buffer, len))
                }
            };
        }
        let info = self.endpoint(ep_index, dir)?;
        match dir {
            EpDirection::In => {
                self.core.tx_data(XferRequest::new(info, buffer, size))?;
                if size != 0 && size % ZLP_PACKET_SIZE == 0 {
                    self.ctx.zlp[ep_index as usize] = ZlpState::Armed;
                }
                Ok(())
            }
            EpDirection::Out => {
                let len = rx_length(size, info.max_pkt_size)?;
                self.core.rx_data(XferRequest::new(info, buffer, len))
            }
        }
    }

    pub fn abort_transfer(&mut self, ep_index: u8, dir: EpDirection) -> Result<()> {
        let phys = physical_ep(ep_index, dir);
        self.core.ep_cancel_transfer(phys)?;
        if dir == EpDirection::In {
            if let Some(z) = self.ctx.zlp.get_mut(ep_index as usize) {
                *z = ZlpState::Idle;
            }
        }
        Ok(())
    }

    pub fn get_endpoint_stall_state(&self, ep_index: u8, dir: EpDirection) -> Result<bool> {
        let phys = physical_ep(ep_index, dir);
        self.core.ep_info(phys).ok_or(DeviceError::InvalidParameter)?;
        Ok(self.core.is_stalled(phys))
    }

    pub fn set_endpoint_stall_state(&mut self, ep_index: u8, dir: EpDirection, stall: bool) -> Result<()> {
        let phys = physical_ep(ep_index, dir);
        if stall { self.core.stall_ep(phys) } else { self.core.clear_stall(phys) }
    }

    /// Largest packet an endpoint of `ep_type` can move at the negotiated speed.
    pub fn get_max_transfer_size(&self, ep_type: EpType) -> Result<u32> {
        let speed = self.core.get_speed().ok_or(DeviceError::NotReady)?;
        let size = match (ep_type, speed) {
            (EpType::Control, s) => s.ctrl_max_packet_size() as u32,
            (_, UsbSpeed::Super | UsbSpeed::SuperPlus) => 1024,
            (EpType::Bulk, UsbSpeed::High) => 512,
            (_, UsbSpeed::High) => 1024,
            (EpType::Isochronous, _) => 1023,
            (EpType::Interrupt, UsbSpeed::Low) => 8,
            _ => 64,
        };
        Ok(size)
    }

    pub fn get_device_info(&self, id: DeviceInfoId) -> Vec<u8> {
        let set = self.descriptors.as_ref();
        let (index, fallback) = match id {
            DeviceInfoId::Manufacturer => (set.map(|s| s.device.i_manufacturer), DEFAULT_MANUFACTURER),
            DeviceInfoId::Product => (set.map(|s| s.device.i_product), DEFAULT_PRODUCT),
            DeviceInfoId::SerialNumber => (set.map(|s| s.device.i_serial_number), DEFAULT_SERIAL),
        };
        device_info_string(set, index.unwrap_or(0), fallback)
    }

    pub fn get_vendor_product_id(&self) -> Result<(u16, u16)> {
        let dd = self.descriptors.as_ref().ok_or(DeviceError::NotReady)?.device;
        Ok((dd.id_vendor, dd.id_product))
    }

    /// Poll once if nothing is queued, then hand out the oldest message.
    pub fn event_handler(&mut self) -> Result<FnIoMessage> {
        if self.ctx.messages.is_empty() {
            self.core.isr_routine(&mut self.ctx)?;
        }
        Ok(self.ctx.messages.pop_front().unwrap_or(FnIoMessage::None))
    }

    fn on_setup(core: &mut D, ctx: &mut FnIoContext, p: &CallbackParam) -> Result<()> {
        let setup = SetupPacket::from(p.setup);
        if setup.kind() == USB_TYPE_STANDARD {
            match setup.request {
                USB_REQ_SET_ADDRESS => {
                    let result = if setup.value > 127 {
                        Err(DeviceError::InvalidParameter)
                    } else {
                        core.set_address(setup.value as u8)
                    };
                    if result.is_ok() {
                        core.set_dev_state(UsbDeviceState::Address);
                    }
                    core.ep0_tx_status()?;
                    return result;
                }
                USB_REQ_SET_CONFIGURATION if setup.value != 0 => {
                    core.set_config(&ctx.endpoints)?;
                }
                _ => {}
            }
        }
        ctx.messages.push_back(FnIoMessage::SetupPacket(setup));
        Ok(())
    }

    fn on_xfer_done(core: &mut D, ctx: &mut FnIoContext, p: &CallbackParam) -> Result<()> {
        let result =
            TransferResult { ep_index: p.ep_num, direction: p.ep_dir, length: p.length, status: p.status };
        if p.ep_num == 0 && p.trb_control != Some(TrbControl::ControlData) {
            return Ok(());
        }
        if p.ep_dir == EpDirection::Out {
            ctx.messages.push_back(FnIoMessage::EpStatusChangedRx(result));
            return Ok(());
        }
        let Some(zlp) = ctx.zlp.get_mut(p.ep_num as usize) else {
            return Err(DeviceError::InvalidParameter);
        };
        match *zlp {
            ZlpState::Armed => {
                let info = core.ep_info(physical_ep(p.ep_num, EpDirection::In)).ok_or(DeviceError::Device)?;
                *zlp = ZlpState::Sending(result);
                core.tx_data(XferRequest::new(info, 0, 0))
            }
            ZlpState::Sending(data) => {
                *zlp = ZlpState::Idle;
                ctx.messages.push_back(FnIoMessage::EpStatusChangedTx(data));
                Ok(())
            }
            ZlpState::Idle => {
                ctx.messages.push_back(FnIoMessage::EpStatusChangedTx(result));
                Ok(())
            }
        }
    }

    fn on_bus_reset(_core: &mut D, ctx: &mut FnIoContext, _p: &CallbackParam) -> Result<()> {
        ctx.zlp = [ZlpState::Idle; MAX_LOGICAL_EPS];
        ctx.suspended = false;
        ctx.messages.push_back(FnIoMessage::BusReset);
        Ok(())
    }

    fn on_reset_done(_core: &mut D, ctx: &mut FnIoContext, p: &CallbackParam) -> Result<()> {
        ctx.messages.push_back(FnIoMessage::BusAttach(p.speed));
        Ok(())
    }

    fn on_link_state(_core: &mut D, ctx: &mut FnIoContext, p: &CallbackParam) -> Result<()> {
        if p.link_state == LinkState::U3 as u32 && !ctx.suspended {
            ctx.suspended = true;
            ctx.messages.push_back(FnIoMessage::BusSuspend);
        } else if p.link_state == LinkState::U0 as u32 && ctx.suspended {
            ctx.suspended = false;
            ctx.messages.push_back(FnIoMessage::BusResume);
        }
        Ok(())
    }

    fn on_wakeup(_core: &mut D, ctx: &mut FnIoContext, _p: &CallbackParam) -> Result<()> {
        if ctx.suspended {
            ctx.suspended = false;
            ctx.messages.push_back(FnIoMessage::BusResume);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::descriptors::tests::bulk_pair_set;
    use crate::usb::driver::{EpState, XdciCore};
    use crate::usb::event::{encode_device_event, DeviceEventCode};
    use crate::usb::mock::{test_config, MockXdci};
    use crate::usb::utra;

    type FnIo<'a> = UsbFnIo<XdciCore<&'a MockXdci, FnIoContext>>;

    fn started(mock: &MockXdci) -> FnIo<'_> {
        let core = XdciCore::init(mock, test_config()).unwrap();
        let mut io = FnIo::new(core);
        io.configure_endpoints(&bulk_pair_set(512)).unwrap();
        io.start_controller().unwrap();
        io
    }

    #[test]
    fn arena_handles() {
        let mut arena = BufferArena::new();
        let (a, pa) = arena.allocate(64).unwrap();
        let (b, _) = arena.allocate(128).unwrap();
        assert_ne!(pa, 0);
        assert_eq!(arena.get(b).map(|s| s.len()), Some(128));
        arena.free(a).unwrap();
        assert_eq!(arena.free(a), Err(DeviceError::InvalidParameter));
        // slot reused, old handle stays dead
        let (c, _) = arena.allocate(16).unwrap();
        assert_eq!(c.index, a.index);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(c).map(|s| s.len()), Some(16));
        assert_eq!(arena.allocate(0), Err(DeviceError::InvalidParameter));
        assert_eq!(arena.in_use(), 2);
    }

    #[test]
    fn arena_capacity() {
        let mut arena = BufferArena::new();
        for _ in 0..MAX_TRACKED_BUFFERS {
            arena.allocate(8).unwrap();
        }
        assert_eq!(arena.allocate(8).err(), Some(DeviceError::OutOfResources));
        let bogus = BufferHandle { index: MAX_TRACKED_BUFFERS as u16 + 3, generation: 0 };
        assert_eq!(arena.free(bogus), Err(DeviceError::InvalidParameter));
    }

    #[test]
    fn configure_picks_one_pair() {
        let mock = MockXdci::new();
        let core = XdciCore::init(&mock, test_config()).unwrap();
        let mut io = FnIo::new(core);
        let mut set = bulk_pair_set(512);
        set.configs.push(set.configs[0].clone());
        io.configure_endpoints(&set).unwrap();
        assert_eq!(io.ctx.endpoints.len(), 2);
        assert_eq!(io.ctx.endpoints[0].ep_dir, EpDirection::In);
        set.configs.clear();
        assert_eq!(io.configure_endpoints(&set), Err(DeviceError::InvalidParameter));
    }

    #[test]
    fn messages_queue_in_order() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        assert_eq!(io.event_handler(), Ok(FnIoMessage::None));
        mock.poke(utra::DSTS.offset(), UsbSpeed::High as u32);
        mock.raise_events(
            0,
            &[
                encode_device_event(DeviceEventCode::UsbReset, 0),
                encode_device_event(DeviceEventCode::ConnectionDone, 0),
                encode_device_event(DeviceEventCode::LinkStateChange, LinkState::U3 as u32),
                encode_device_event(DeviceEventCode::Wakeup, 0),
            ],
        );
        assert_eq!(io.event_handler(), Ok(FnIoMessage::BusReset));
        assert_eq!(io.event_handler(), Ok(FnIoMessage::BusAttach(Some(UsbSpeed::High))));
        assert_eq!(io.event_handler(), Ok(FnIoMessage::BusSuspend));
        assert_eq!(io.event_handler(), Ok(FnIoMessage::BusResume));
        assert_eq!(io.event_handler(), Ok(FnIoMessage::None));
        assert_eq!(io.get_max_transfer_size(EpType::Bulk), Ok(512));
        assert_eq!(io.get_max_transfer_size(EpType::Control), Ok(64));
    }

    #[test]
    fn set_address_intercepted() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        mock.deliver_setup([0x00, 0x05, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(io.event_handler(), Ok(FnIoMessage::None));
        assert_eq!((mock.peek(utra::DCFG.offset()) >> 3) & 0x7F, 0x22);
        assert_eq!(io.core().dev_state(), UsbDeviceState::Address);
        assert_eq!(mock.armed_control_type(1), Some(TrbControl::ControlStatus2 as u32));
    }

    #[test]
    fn control_read_through_transfer() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        mock.deliver_setup(setup);
        assert_eq!(io.event_handler(), Ok(FnIoMessage::SetupPacket(SetupPacket::from(setup))));

        let (h, ptr) = io.allocate_buffer(18).unwrap();
        io.buffer_mut(h).unwrap().copy_from_slice(&[0xAB; 18]);
        io.transfer(0, EpDirection::In, ptr, 18).unwrap();
        assert_eq!(mock.armed_data(1), vec![0xAB; 18]);
        mock.complete_in(1);
        let done = TransferResult { ep_index: 0, direction: EpDirection::In, length: 18, status: 0 };
        assert_eq!(io.event_handler(), Ok(FnIoMessage::EpStatusChangedTx(done)));

        io.transfer(0, EpDirection::Out, 0, 0).unwrap();
        assert_eq!(mock.armed_control_type(0), Some(TrbControl::ControlStatus3 as u32));
        mock.complete_in(0);
        assert_eq!(io.event_handler(), Ok(FnIoMessage::None));
        assert_eq!(mock.armed_control_type(0), Some(TrbControl::ControlSetup as u32));
        io.free_buffer(h).unwrap();
    }

    #[test]
    fn control_write_with_data_stage() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        let setup = [0x21, 0x20, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00];
        mock.deliver_setup(setup);
        assert_eq!(io.event_handler(), Ok(FnIoMessage::SetupPacket(SetupPacket::from(setup))));
        // EP0 waits for the data stage instead of re-arming SETUP
        assert_eq!(io.core().ep_state(0), Some(EpState::Data));

        let (h, ptr) = io.allocate_buffer(512).unwrap();
        io.transfer(0, EpDirection::Out, ptr, 4).unwrap();
        assert_eq!(mock.armed_control_type(0), Some(TrbControl::ControlData as u32));
        assert_eq!(mock.count_ep_commands(0, utra::DEPCMD_START_XFER), 2);
        assert_eq!(io.transfer(0, EpDirection::Out, ptr, 4), Err(DeviceError::NotReady));
        assert_eq!(mock.count_ep_commands(0, utra::DEPCMD_END_XFER), 0);

        mock.complete_out(0, &[0xC0, 0xFF, 0xEE, 0x01]);
        let done = TransferResult { ep_index: 0, direction: EpDirection::Out, length: 4, status: 0 };
        assert_eq!(io.event_handler(), Ok(FnIoMessage::EpStatusChangedRx(done)));
        assert_eq!(&io.buffer(h).unwrap()[..4], &[0xC0, 0xFF, 0xEE, 0x01]);

        io.transfer(0, EpDirection::In, 0, 0).unwrap();
        assert_eq!(mock.armed_control_type(1), Some(TrbControl::ControlStatus3 as u32));
        mock.complete_in(1);
        assert_eq!(io.event_handler(), Ok(FnIoMessage::None));
        assert_eq!(io.core().ep_state(0), Some(EpState::Setup));
        assert_eq!(mock.armed_control_type(0), Some(TrbControl::ControlSetup as u32));
    }

    #[test]
    fn set_configuration_enables_endpoints() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        let setup = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        mock.deliver_setup(setup);
        assert_eq!(io.event_handler(), Ok(FnIoMessage::SetupPacket(SetupPacket::from(setup))));
        assert_eq!(mock.peek(utra::DALEPENA.offset()) & 0b1100, 0b1100);
        assert_eq!(io.core().dev_state(), UsbDeviceState::Configured);
    }

    #[test]
    fn zlp_follows_packet_multiple() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        mock.deliver_setup([0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        io.event_handler().unwrap();

        let (_h, ptr) = io.allocate_buffer(1024).unwrap();
        io.transfer(1, EpDirection::In, ptr, 1024).unwrap();
        mock.complete_in(3);
        // data done, ZLP queued, nothing reported yet
        assert_eq!(io.event_handler(), Ok(FnIoMessage::None));
        assert_eq!(mock.count_ep_commands(3, utra::DEPCMD_START_XFER), 2);
        mock.complete_in(3);
        let done = TransferResult { ep_index: 1, direction: EpDirection::In, length: 1024, status: 0 };
        assert_eq!(io.event_handler(), Ok(FnIoMessage::EpStatusChangedTx(done)));

        // short transfers go out alone
        io.transfer(1, EpDirection::In, ptr, 100).unwrap();
        mock.complete_in(3);
        let done = TransferResult { ep_index: 1, direction: EpDirection::In, length: 100, status: 0 };
        assert_eq!(io.event_handler(), Ok(FnIoMessage::EpStatusChangedTx(done)));
        assert_eq!(mock.count_ep_commands(3, utra::DEPCMD_START_XFER), 3);
    }

    #[test]
    fn bulk_receive() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        mock.deliver_setup([0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        io.event_handler().unwrap();
        let (h, ptr) = io.allocate_buffer(512).unwrap();
        io.transfer(1, EpDirection::Out, ptr, 10).unwrap();
        assert_eq!(mock.armed_data(2).len(), 512);
        mock.complete_out(2, b"abc");
        let done = TransferResult { ep_index: 1, direction: EpDirection::Out, length: 3, status: 0 };
        assert_eq!(io.event_handler(), Ok(FnIoMessage::EpStatusChangedRx(done)));
        assert_eq!(&io.buffer(h).unwrap()[..3], b"abc");
    }

    #[test]
    fn unconfigured_endpoint_rejected() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        assert_eq!(io.transfer(5, EpDirection::In, 0x1000, 8), Err(DeviceError::InvalidParameter));
        assert_eq!(io.transfer(16, EpDirection::In, 0x1000, 8), Err(DeviceError::InvalidParameter));
    }

    #[test]
    fn stall_and_abort() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        mock.deliver_setup([0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        io.event_handler().unwrap();

        io.set_endpoint_stall_state(1, EpDirection::Out, true).unwrap();
        assert_eq!(io.get_endpoint_stall_state(1, EpDirection::Out), Ok(true));
        io.set_endpoint_stall_state(1, EpDirection::Out, false).unwrap();
        assert_eq!(io.get_endpoint_stall_state(1, EpDirection::Out), Ok(false));

        let (_h, ptr) = io.allocate_buffer(512).unwrap();
        io.transfer(1, EpDirection::In, ptr, 512).unwrap();
        io.abort_transfer(1, EpDirection::In).unwrap();
        assert_eq!(io.ctx.zlp[1], ZlpState::Idle);
        assert_eq!(mock.count_ep_commands(3, utra::DEPCMD_END_XFER), 1);
        // endpoint free again
        io.transfer(1, EpDirection::In, ptr, 8).unwrap();
    }

    #[test]
    fn device_info_and_ids() {
        let mock = MockXdci::new();
        let io = started(&mock);
        assert_eq!(io.get_vendor_product_id(), Ok((0x1209, 0x3613)));
        let product = io.get_device_info(DeviceInfoId::Product);
        assert_eq!(product, string_descriptor("xDCI gadget")[2..].to_vec());
        assert_eq!(io.get_max_transfer_size(EpType::Bulk), Err(DeviceError::NotReady));
    }

    #[test]
    fn stop_controller_halts() {
        let mock = MockXdci::new();
        let mut io = started(&mock);
        io.stop_controller().unwrap();
        assert_eq!(mock.peek(utra::DCTL.offset()) >> 31, 0);
    }
}
