//! Device-mode protocol layer: standard request handling on top of the controller core, and
//! the class driver binding.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::cmd::spin_delay;
use super::core_driver::UsbDeviceCoreDriver;
use super::descriptors::*;
use super::driver::{CallbackEvent, CallbackParam, XferRequest};
use super::trb::TrbControl;
use super::*;

/// Bytes available to a single control transfer data stage.
pub const CTRL_BUF_LEN: usize = 1024;

/// Strings reported by [`UsbDeviceMode::get_device_info`] when the bound set has none.
pub const DEFAULT_MANUFACTURER: &str = "Synopsys";
pub const DEFAULT_PRODUCT: &str = "xDCI Device";
pub const DEFAULT_SERIAL: &str = "00000001";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Attach,
    Detach,
    Reset,
    Suspend,
    Resume,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceInfoId {
    Manufacturer,
    Product,
    SerialNumber,
}

/// What a class driver provides to the protocol layer. Only `descriptors` and `setup` are
/// mandatory.
pub trait UsbClassDriver {
    fn descriptors(&self) -> &DeviceDescriptorSet;

    /// Class or vendor request. For device-to-host requests stage the reply in `buf` and
    /// return its length; host-to-device data arrives later in `data_phase_complete`.
    fn setup(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> Result<usize>;

    fn data_phase_complete(&mut self, _setup: &SetupPacket, _data: &[u8]) -> Result<()> { Ok(()) }

    fn configuration_selected(&mut self, _value: u8) -> Result<()> { Ok(()) }

    fn bus_event(&mut self, _event: BusEvent, _speed: Option<UsbSpeed>) {}

    /// A non-control transfer finished.
    fn xfer_done(&mut self, _param: &CallbackParam) -> Result<()> { Ok(()) }
}

#[repr(C, align(64))]
struct CtrlBuf([u8; CTRL_BUF_LEN]);

enum Response {
    NoData,
    Send(usize),
    Receive(usize),
}

/// State shared with the controller core callbacks.
pub struct DeviceContext<K> {
    class: Option<K>,
    active_config: Option<u8>,
    suspended: bool,
    ctrl: Box<CtrlBuf>,
    /// Host-to-device request whose data stage is armed
    pending_out: Option<SetupPacket>,
    stop: Arc<AtomicBool>,
}

impl<K: UsbClassDriver> DeviceContext<K> {
    fn new() -> Self {
        DeviceContext {
            class: None,
            active_config: None,
            suspended: false,
            ctrl: Box::new(CtrlBuf([0; CTRL_BUF_LEN])),
            pending_out: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn class_mut(&mut self) -> Result<&mut K> { self.class.as_mut().ok_or(DeviceError::NotReady) }

    fn descriptors(&self) -> Result<&DeviceDescriptorSet> {
        self.class.as_ref().map(|c| c.descriptors()).ok_or(DeviceError::NotReady)
    }

    fn stage(&mut self, bytes: &[u8], requested: u16) -> Response {
        let len = bytes.len().min(requested as usize).min(CTRL_BUF_LEN);
        self.ctrl.0[..len].copy_from_slice(&bytes[..len]);
        Response::Send(len)
    }

    fn ctrl_addr(&self) -> usize { self.ctrl.0.as_ptr() as usize }
}

pub type DeviceRequest<K> = XferRequest<DeviceContext<K>>;

pub struct UsbDeviceMode<D, K> {
    core: D,
    ctx: DeviceContext<K>,
    /// Called once per idle `run` iteration with a microsecond count
    tick: fn(u32),
}

impl<D, K> UsbDeviceMode<D, K>
where
    D: UsbDeviceCoreDriver<DeviceContext<K>>,
    K: UsbClassDriver,
{
    /// Take over an initialized core and hook its callbacks.
    pub fn new(mut core: D) -> Self {
        core.register_callback(CallbackEvent::SetupPktReceived, Self::on_setup);
        core.register_callback(CallbackEvent::XferDone, Self::on_xfer_done);
        core.register_callback(CallbackEvent::BusReset, Self::on_bus_reset);
        core.register_callback(CallbackEvent::ResetDone, Self::on_reset_done);
        core.register_callback(CallbackEvent::Disconnect, Self::on_disconnect);
        core.register_callback(CallbackEvent::LinkStateChange, Self::on_link_state);
        core.register_callback(CallbackEvent::Wakeup, Self::on_wakeup);
        UsbDeviceMode { core, ctx: DeviceContext::new(), tick: spin_delay }
    }

    pub fn with_tick(mut self, tick: fn(u32)) -> Self {
        self.tick = tick;
        self
    }

    pub fn core(&self) -> &D { &self.core }

    pub fn core_mut(&mut self) -> &mut D { &mut self.core }

    pub fn class(&self) -> Option<&K> { self.ctx.class.as_ref() }

    pub fn class_mut(&mut self) -> Option<&mut K> { self.ctx.class.as_mut() }

    pub fn state(&self) -> UsbDeviceState { self.core.dev_state() }

    pub fn active_config(&self) -> Option<u8> { self.ctx.active_config }

    pub fn is_suspended(&self) -> bool { self.ctx.suspended }

    /// Attach a class driver and its descriptor set.
    pub fn bind(&mut self, class: K) -> Result<()> {
        if self.ctx.class.is_some() {
            return Err(DeviceError::NotReady);
        }
        let set = class.descriptors();
        if set.configs.is_empty() {
            log::error!("descriptor set has no configuration");
            return Err(DeviceError::InvalidParameter);
        }
        log::info!(
            "bound class driver {:04x}:{:04x}, {} configuration(s)",
            { set.device.id_vendor },
            { set.device.id_product },
            set.configs.len()
        );
        self.ctx.class = Some(class);
        Ok(())
    }

    /// Detach the class driver, disabling the endpoints of the active configuration.
    pub fn unbind(&mut self) -> Result<Option<K>> {
        Self::deconfigure(&mut self.core, &mut self.ctx)?;
        self.ctx.pending_out = None;
        Ok(self.ctx.class.take())
    }

    pub fn connect(&mut self) -> Result<()> {
        self.core.connect()?;
        self.core.ep0_rx_setup()
    }

    pub fn disconnect(&mut self) -> Result<()> { self.core.disconnect(&mut self.ctx) }

    /// Drain the event buffers once.
    pub fn poll(&mut self) -> Result<()> { self.core.isr_routine(&mut self.ctx) }

    /// Flag observed by [`run`](Self::run); settable from another context.
    pub fn stop_handle(&self) -> Arc<AtomicBool> { self.ctx.stop.clone() }

    pub fn stop(&self) { self.ctx.stop.store(true, Ordering::Release) }

    /// Poll until stopped, or for `timeout_ms` iterations of roughly a millisecond each.
    /// A `timeout_ms` of 0 polls forever.
    pub fn run(&mut self, timeout_ms: u32) -> Result<()> {
        let mut remaining = timeout_ms;
        loop {
            if self.ctx.stop.swap(false, Ordering::AcqRel) {
                log::debug!("run loop stopped");
                return Ok(());
            }
            if let Err(e) = self.core.isr_routine(&mut self.ctx) {
                log::warn!("event processing: {:?}", e);
            }
            if timeout_ms != 0 {
                remaining -= 1;
                if remaining == 0 {
                    return Err(DeviceError::Timeout);
                }
            }
            (self.tick)(1000);
        }
    }

    pub fn ep_tx(&mut self, req: DeviceRequest<K>) -> Result<()> { self.core.tx_data(req) }

    /// Queue a receive. The length is rounded up to a whole number of packets.
    pub fn ep_rx(&mut self, mut req: DeviceRequest<K>) -> Result<()> {
        req.length = rx_length(req.length, req.ep_info.max_pkt_size)?;
        self.core.rx_data(req)
    }

    pub fn get_device_info(&self, id: DeviceInfoId) -> Vec<u8> {
        let set = self.ctx.descriptors().ok();
        let (index, fallback) = match id {
            DeviceInfoId::Manufacturer => (set.map(|s| s.device.i_manufacturer), DEFAULT_MANUFACTURER),
            DeviceInfoId::Product => (set.map(|s| s.device.i_product), DEFAULT_PRODUCT),
            DeviceInfoId::SerialNumber => (set.map(|s| s.device.i_serial_number), DEFAULT_SERIAL),
        };
        device_info_string(set, index.unwrap_or(0), fallback)
    }

    pub fn get_vendor_product_id(&self) -> Result<(u16, u16)> {
        let dd = self.ctx.descriptors()?.device;
        Ok((dd.id_vendor, dd.id_product))
    }

    fn deconfigure(core: &mut D, ctx: &mut DeviceContext<K>) -> Result<()> {
        let Some(value) = ctx.active_config.take() else {
            return Ok(());
        };
        let infos = match ctx.descriptors()?.config_by_value(value) {
            Some(cfg) => cfg.ep_infos(),
            None => Vec::new(),
        };
        for info in infos.iter() {
            core.disable_ep(info.physical())?;
        }
        Ok(())
    }

    fn on_setup(core: &mut D, ctx: &mut DeviceContext<K>, p: &CallbackParam) -> Result<()> {
        let setup = SetupPacket::from(p.setup);
        log::debug!("SETUP {:?}", setup);
        let dispatched = match setup.kind() {
            USB_TYPE_STANDARD => Self::standard_request(core, ctx, &setup),
            USB_TYPE_CLASS | USB_TYPE_VENDOR => Self::class_request(ctx, &setup),
            _ => Err(DeviceError::Unsupported),
        };
        match dispatched {
            Ok(Response::Send(len)) => {
                let mps = core.ep_info(1).map(|i| i.max_pkt_size).unwrap_or(0);
                let info = EpInfo::control(EpDirection::In, mps);
                core.tx_data(XferRequest::new(info, ctx.ctrl_addr(), len as u32))
            }
            Ok(Response::Receive(len)) => {
                let mps = core.ep_info(0).map(|i| i.max_pkt_size).unwrap_or(0);
                let len = rx_length(len as u32, mps)?.min(CTRL_BUF_LEN as u32);
                ctx.pending_out = Some(setup);
                let info = EpInfo::control(EpDirection::Out, mps);
                core.rx_data(XferRequest::new(info, ctx.ctrl_addr(), len))
            }
            Ok(Response::NoData) => core.ep0_tx_status(),
            Err(e) => {
                log::warn!("request {:02x}/{:02x} failed: {:?}", setup.request_type, setup.request, e);
                // answer anyway so the host doesn't hang on the status stage
                core.ep0_tx_status()?;
                Err(e)
            }
        }
    }

    fn class_request(ctx: &mut DeviceContext<K>, setup: &SetupPacket) -> Result<Response> {
        let class = ctx.class.as_mut().ok_or(DeviceError::NotReady)?;
        let staged = class.setup(setup, &mut ctx.ctrl.0[..])?;
        if setup.length == 0 {
            return Ok(Response::NoData);
        }
        match setup.direction() {
            EpDirection::In if staged == 0 => Ok(Response::NoData),
            EpDirection::In => Ok(Response::Send(staged.min(setup.length as usize).min(CTRL_BUF_LEN))),
            EpDirection::Out => Ok(Response::Receive(setup.length as usize)),
        }
    }

    fn standard_request(core: &mut D, ctx: &mut DeviceContext<K>, setup: &SetupPacket) -> Result<Response> {
        match setup.request {
            USB_REQ_GET_DESCRIPTOR => Self::get_descriptor(ctx, setup),
            USB_REQ_SET_ADDRESS => {
                if setup.value > 127 {
                    return Err(DeviceError::InvalidParameter);
                }
                core.set_address(setup.value as u8)?;
                core.set_dev_state(UsbDeviceState::Address);
                log::info!("address {}", setup.value);
                Ok(Response::NoData)
            }
            USB_REQ_SET_CONFIGURATION => {
                let value = (setup.value & 0xFF) as u8;
                Self::deconfigure(core, ctx)?;
                if value == 0 {
                    core.set_dev_state(UsbDeviceState::Address);
                    return Ok(Response::NoData);
                }
                let cfg = ctx.descriptors()?.config_by_value(value).ok_or(DeviceError::InvalidParameter)?;
                let infos = cfg.ep_infos();
                core.set_config(&infos)?;
                ctx.active_config = Some(value);
                ctx.class_mut()?.configuration_selected(value)?;
                Ok(Response::NoData)
            }
            USB_REQ_GET_CONFIGURATION => {
                let value = ctx.active_config.ok_or(DeviceError::NotReady)?;
                Ok(ctx.stage(&[value], setup.length))
            }
            USB_REQ_GET_STATUS => match setup.recipient() {
                USB_RECIP_DEVICE => Ok(ctx.stage(&USB_DEVICE_SELF_POWERED.to_le_bytes(), setup.length)),
                _ => Ok(Response::NoData),
            },
            USB_REQ_CLEAR_FEATURE | USB_REQ_SET_FEATURE => {
                if setup.recipient() != USB_RECIP_ENDPOINT || setup.value != USB_ENDPOINT_HALT {
                    return Err(DeviceError::Unsupported);
                }
                let addr = (setup.index & 0xFF) as u8;
                let phys = physical_ep(addr & 0x0F, EpDirection::from_address(addr));
                if setup.request == USB_REQ_SET_FEATURE {
                    core.stall_ep(phys)?;
                } else {
                    core.clear_stall(phys)?;
                }
                Ok(Response::NoData)
            }
            USB_REQ_GET_INTERFACE => Ok(ctx.stage(&[0], setup.length)),
            USB_REQ_SET_INTERFACE if setup.value == 0 => Ok(Response::NoData),
            USB_REQ_SET_SEL => Ok(Response::Receive(setup.length as usize)),
            USB_REQ_SET_ISOCH_DELAY => Ok(Response::NoData),
            _ => Err(DeviceError::Unsupported),
        }
    }

    fn get_descriptor(ctx: &mut DeviceContext<K>, setup: &SetupPacket) -> Result<Response> {
        let index = (setup.value & 0xFF) as u8;
        let bytes: Vec<u8> = {
            let set = ctx.descriptors()?;
            match (setup.value >> 8) as u8 {
                USB_DT_DEVICE => set.device.as_ref().to_vec(),
                USB_DT_CONFIG => {
                    set.config_by_index(index as usize).ok_or(DeviceError::InvalidParameter)?.to_bytes()
                }
                USB_DT_STRING => set.string(index, setup.index)?.to_vec(),
                USB_DT_BOS => set.bos.clone().ok_or(DeviceError::Unsupported)?,
                USB_DT_DEVICE_QUALIFIER => QualifierDescriptor::from(&set.device).as_ref().to_vec(),
                other => {
                    log::debug!("descriptor type {:x} not supported", other);
                    return Err(DeviceError::Unsupported);
                }
            }
        };
        Ok(ctx.stage(&bytes, setup.length))
    }

    fn on_xfer_done(core: &mut D, ctx: &mut DeviceContext<K>, p: &CallbackParam) -> Result<()> {
        if p.ep_num != 0 {
            return ctx.class_mut()?.xfer_done(p);
        }
        if p.trb_control != Some(TrbControl::ControlData) {
            // status stage retired; the core re-arms SETUP
            return Ok(());
        }
        match p.ep_dir {
            EpDirection::In => core.ep0_rx_status(),
            EpDirection::Out => {
                let len = (p.length as usize).min(CTRL_BUF_LEN);
                let result = match ctx.pending_out.take() {
                    Some(setup) if setup.kind() != USB_TYPE_STANDARD => match ctx.class.as_mut() {
                        Some(class) => class.data_phase_complete(&setup, &ctx.ctrl.0[..len]),
                        None => Err(DeviceError::NotReady),
                    },
                    _ => Ok(()),
                };
                core.ep0_tx_status()?;
                result
            }
        }
    }

    fn on_bus_reset(_core: &mut D, ctx: &mut DeviceContext<K>, _p: &CallbackParam) -> Result<()> {
        ctx.active_config = None;
        ctx.pending_out = None;
        ctx.suspended = false;
        if let Some(class) = ctx.class.as_mut() {
            class.bus_event(BusEvent::Reset, None);
        }
        Ok(())
    }

    fn on_reset_done(_core: &mut D, ctx: &mut DeviceContext<K>, p: &CallbackParam) -> Result<()> {
        if let Some(class) = ctx.class.as_mut() {
            class.bus_event(BusEvent::Attach, p.speed);
        }
        Ok(())
    }

    fn on_disconnect(_core: &mut D, ctx: &mut DeviceContext<K>, _p: &CallbackParam) -> Result<()> {
        ctx.active_config = None;
        if let Some(class) = ctx.class.as_mut() {
            class.bus_event(BusEvent::Detach, None);
        }
        Ok(())
    }

    fn on_link_state(_core: &mut D, ctx: &mut DeviceContext<K>, p: &CallbackParam) -> Result<()> {
        let event = if p.link_state == LinkState::U3 as u32 && !ctx.suspended {
            ctx.suspended = true;
            BusEvent::Suspend
        } else if p.link_state == LinkState::U0 as u32 && ctx.suspended {
            ctx.suspended = false;
            BusEvent::Resume
        } else {
            return Ok(());
        };
        if let Some(class) = ctx.class.as_mut() {
            class.bus_event(event, p.speed);
        }
        Ok(())
    }

    fn on_wakeup(_core: &mut D, ctx: &mut DeviceContext<K>, p: &CallbackParam) -> Result<()> {
        if ctx.suspended {
            ctx.suspended = false;
            if let Some(class) = ctx.class.as_mut() {
                class.bus_event(BusEvent::Resume, p.speed);
            }
        }
        Ok(())
    }
}

/// Round a receive length up to whole packets; at least one packet is always armed.
pub fn rx_length(length: u32, max_pkt_size: u16) -> Result<u32> {
    let mps = max_pkt_size as u32;
    if mps == 0 {
        return Err(DeviceError::InvalidParameter);
    }
    Ok(length.max(1).div_ceil(mps) * mps)
}

/// UTF-16LE payload of string `index`, or `fallback` encoded the same way.
pub(crate) fn device_info_string(set: Option<&DeviceDescriptorSet>, index: u8, fallback: &str) -> Vec<u8> {
    if let Some(set) = set {
        if index != 0 {
            if let Some(lang) = set.languages().first() {
                if let Some(payload) = set.string(index, *lang).ok().and_then(|d| d.get(2..)) {
                    return payload.to_vec();
                }
            }
        }
    }
    string_descriptor(fallback)[2..].to_vec()
}
