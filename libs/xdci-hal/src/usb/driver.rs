use alloc::boxed::Box;
use alloc::vec::Vec;

use num_traits::FromPrimitive;

use super::cmd::{self, ConfigAction, PollConfig, DEFAULT_POLL, RESET_POLL};
use super::compat::{Csr, RegisterBank};
use super::event::{DeviceEventCode, EpEventType, Event, EventPool, EVENT_BUFFER_BYTES, MAX_EVENT_BUFFERS};
use super::trb::{self, TrbControl, TrbPool, NUM_PHYS_EPS, TRBSTS_SETUP_PENDING};
use super::utra;
use super::*;

pub const SETUP_PKT_LEN: usize = 8;

/// Bring-up parameters for [`XdciCore::init`].
#[derive(Debug, Copy, Clone)]
pub struct XdciConfig {
    pub role: PortRole,
    /// Fastest speed the device will try to connect at
    pub speed: UsbSpeed,
    /// Endpoint and generic command completion
    pub poll: PollConfig,
    /// Soft reset and run/stop transitions
    pub reset_poll: PollConfig,
    pub event_buffer_bytes: usize,
}

impl Default for XdciConfig {
    fn default() -> Self {
        XdciConfig {
            role: PortRole::Device,
            speed: UsbSpeed::Super,
            poll: DEFAULT_POLL,
            reset_poll: RESET_POLL,
            event_buffer_bytes: EVENT_BUFFER_BYTES,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EpState {
    Disabled,
    Enabled,
    Stalled,
    /// EP0 has a SETUP receive armed
    Setup,
    InData,
    OutData,
    /// Between control phases: SETUP seen, data or status not yet issued
    Data,
    Status,
}

/// Events a client can hook with [`XdciCore::register_callback`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Disconnect = 0,
    BusReset,
    ResetDone,
    LinkStateChange,
    Wakeup,
    Hibernation,
    Sof,
    ErraticError,
    CommandComplete,
    BufferOverflow,
    TestLmp,
    SetupPktReceived,
    XferNotReady,
    XferDone,
}
pub const NUM_CALLBACKS: usize = CallbackEvent::XferDone as usize + 1;

/// Parameters handed to every callback. Fields that don't apply to an event are left default.
#[derive(Debug, Default, Copy, Clone)]
pub struct CallbackParam {
    pub ep_num: u8,
    pub ep_dir: EpDirection,
    pub ep_type: EpType,
    pub buffer: usize,
    /// Actual bytes moved, for transfer completions
    pub length: u32,
    pub status: u32,
    pub link_state: u32,
    pub speed: Option<UsbSpeed>,
    pub setup: [u8; SETUP_PKT_LEN],
    pub trb_control: Option<TrbControl>,
}

pub type CoreCallback<D, C> = fn(&mut D, &mut C, &CallbackParam) -> Result<()>;

/// A transfer handed to [`XdciCore::tx_data`] or [`XdciCore::rx_data`].
///
/// `buffer` is a DMA address; the caller keeps it alive until completion or cancel.
pub struct XferRequest<C> {
    pub ep_info: EpInfo,
    pub buffer: usize,
    pub length: u32,
    /// Filled in on completion
    pub actual: u32,
    pub status: u32,
    /// Terminate with a zero-length packet when `length` is a multiple of the packet size
    pub zlp: bool,
    pub stream_id: u16,
    pub frame_number: u16,
    pub on_complete: Option<fn(&mut C, &XferRequest<C>)>,
}

impl<C> XferRequest<C> {
    pub fn new(ep_info: EpInfo, buffer: usize, length: u32) -> Self {
        XferRequest {
            ep_info,
            buffer,
            length,
            actual: 0,
            status: 0,
            zlp: false,
            stream_id: 0,
            frame_number: 0,
            on_complete: None,
        }
    }
}
impl<C> Clone for XferRequest<C> {
    fn clone(&self) -> Self { *self }
}
impl<C> Copy for XferRequest<C> {}
impl<C> core::fmt::Debug for XferRequest<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("XferRequest")
            .field("ep", &self.ep_info.physical())
            .field("buffer", &format_args!("{:x}", self.buffer))
            .field("length", &self.length)
            .field("actual", &self.actual)
            .field("zlp", &self.zlp)
            .finish()
    }
}

pub struct Endpoint<C> {
    pub info: EpInfo,
    pub state: EpState,
    /// Transfer resource index of the transfer currently owned by hardware
    pub rsc_idx: Option<u32>,
    pub req: Option<XferRequest<C>>,
    pub in_flight: bool,
}

impl<C> Endpoint<C> {
    fn new(phys_ep: usize) -> Self {
        Endpoint {
            info: EpInfo {
                ep_num: (phys_ep / 2) as u8,
                ep_dir: EpDirection::from_physical(phys_ep),
                ep_type: EpType::Control,
                max_pkt_size: 0,
                burst_size: 0,
                interval: 0,
                max_streams: 0,
            },
            state: EpState::Disabled,
            rsc_idx: None,
            req: None,
            in_flight: false,
        }
    }

    fn retire(&mut self) -> Option<XferRequest<C>> {
        self.rsc_idx = None;
        self.in_flight = false;
        self.req.take()
    }
}

#[repr(C, align(8))]
struct SetupBuf([u8; SETUP_PKT_LEN]);

/// The controller core. `C` is the context type threaded through every callback.
pub struct XdciCore<B: RegisterBank, C> {
    csr: Csr<B>,
    config: XdciConfig,
    live: bool,
    speed: Option<UsbSpeed>,
    dev_state: UsbDeviceState,
    attached: bool,
    link_state: u32,
    address: u8,
    trbs: TrbPool,
    events: EventPool,
    eps: Vec<Endpoint<C>>,
    in_isr: bool,
    ep0_three_stage: bool,
    setup_buf: Box<SetupBuf>,
    callbacks: [Option<CoreCallback<XdciCore<B, C>, C>>; NUM_CALLBACKS],
}

impl<B: RegisterBank, C> XdciCore<B, C> {
    /// Reset and program the controller for device mode. On error nothing is left allocated.
    pub fn init(bank: B, config: XdciConfig) -> Result<Self> {
        if bank.base() == 0 {
            log::error!("xDCI MMIO base is null");
            return Err(DeviceError::InvalidParameter);
        }
        let csr = Csr::new(bank);
        log::info!("xDCI init at {:x}, role {:?}, speed {:?}", csr.bank().base(), config.role, config.speed);

        csr.rmwf(utra::DCTL_CSFTRST, 1);
        if let Err(e) = config.reset_poll.wait_until(|| csr.rf(utra::DCTL_CSFTRST) == 0) {
            log::error!("core soft reset did not complete");
            return Err(e);
        }

        let mut eps: Vec<Endpoint<C>> = (0..NUM_PHYS_EPS).map(Endpoint::new).collect();
        let mps = config.speed.ctrl_max_packet_size();
        eps[0].info = EpInfo::control(EpDirection::Out, mps);
        eps[1].info = EpInfo::control(EpDirection::In, mps);

        csr.rmwf(utra::DCTL_KEEP_CONNECT, 0);
        // clock gating and scale-down both trip a known erratum
        let mut gctl = csr.r(utra::GCTL);
        gctl = csr.zf(utra::GCTL_SCALEDOWN, gctl);
        gctl |= utra::GCTL_DSBLCLKGTNG.bits();
        csr.wo(utra::GCTL, gctl);
        csr.rmwf(utra::DCFG_DEVSPD, config.speed as u32);
        csr.wo(utra::DEVTEN, utra::DEVTEN_DEFAULT);
        csr.rmwf(utra::GCTL_PRTCAPDIR, config.role as u32);

        let lines = (csr.rf(utra::GHWPARAMS1_NUM_INT) as usize).clamp(1, MAX_EVENT_BUFFERS);
        let events = EventPool::new(lines, config.event_buffer_bytes)?;
        for (line, buf) in events.iter().enumerate() {
            csr.wo(utra::GEVNTADRLO.at(line, utra::GEVNT_STRIDE), buf.addr() as u32);
            csr.wo(utra::GEVNTADRHI.at(line, utra::GEVNT_STRIDE), (buf.addr() >> 32) as u32);
            csr.wo(utra::GEVNTSIZ.at(line, utra::GEVNT_STRIDE), buf.len_bytes() as u32);
            // count goes last: hardware starts writing once it is programmed
            csr.wo(utra::GEVNTCOUNT.at(line, utra::GEVNT_STRIDE), 0);
        }
        log::debug!("{} event buffer(s) of {} bytes", lines, config.event_buffer_bytes);

        let mut core = XdciCore {
            csr,
            config,
            live: true,
            speed: None,
            dev_state: UsbDeviceState::Default,
            attached: false,
            link_state: 0,
            address: 0,
            trbs: TrbPool::new(),
            events,
            eps,
            in_isr: false,
            ep0_three_stage: false,
            setup_buf: Box::new(SetupBuf([0; SETUP_PKT_LEN])),
            callbacks: [None; NUM_CALLBACKS],
        };
        core.init_ep0().map_err(|e| {
            log::error!("EP0 configuration failed: {:?}", e);
            DeviceError::Device
        })?;
        Ok(core)
    }

    fn init_ep0(&mut self) -> Result<()> {
        cmd::start_new_config(&self.csr, &self.config.poll, 0)?;
        for phys in 0..2 {
            cmd::set_ep_config(&self.csr, &self.config.poll, &self.eps[phys].info, ConfigAction::Init)?;
            cmd::set_ep_xfer_res_config(&self.csr, &self.config.poll, phys)?;
        }
        let ena = self.csr.r(utra::DALEPENA) | 0b11;
        self.csr.wo(utra::DALEPENA, ena);
        self.eps[0].state = EpState::Enabled;
        self.eps[1].state = EpState::Enabled;
        Ok(())
    }

    /// Stop the controller and release the event buffers and TRBs.
    pub fn deinit(&mut self, ctx: &mut C) -> Result<()> {
        self.ensure_live()?;
        let result = self.disconnect(ctx);
        for line in 0..self.events.lines() {
            self.csr.wo(utra::GEVNTSIZ.at(line, utra::GEVNT_STRIDE), utra::GEVNTSIZ_INTMASK.bits());
            self.csr.wo(utra::GEVNTADRLO.at(line, utra::GEVNT_STRIDE), 0);
            self.csr.wo(utra::GEVNTADRHI.at(line, utra::GEVNT_STRIDE), 0);
        }
        self.csr.wo(utra::DALEPENA, 0);
        for ep in self.eps.iter_mut() {
            ep.retire();
            ep.state = EpState::Disabled;
        }
        self.events = EventPool::new(0, 0)?;
        self.trbs.reset();
        self.live = false;
        self.attached = false;
        self.dev_state = UsbDeviceState::Default;
        log::info!("xDCI deinit");
        result
    }

    fn ensure_live(&self) -> Result<()> { if self.live { Ok(()) } else { Err(DeviceError::Device) } }

    pub fn bank(&self) -> &B { self.csr.bank() }

    pub fn config(&self) -> &XdciConfig { &self.config }

    pub fn dev_state(&self) -> UsbDeviceState { self.dev_state }

    pub fn set_dev_state(&mut self, state: UsbDeviceState) { self.dev_state = state }

    pub fn attached(&self) -> bool { self.attached }

    pub fn address(&self) -> u8 { self.address }

    pub fn link_state(&self) -> u32 { self.link_state }

    pub fn event_lines(&self) -> usize { self.events.lines() }

    pub fn ep_info(&self, phys_ep: usize) -> Option<EpInfo> { self.eps.get(phys_ep).map(|ep| ep.info) }

    pub fn ep_state(&self, phys_ep: usize) -> Option<EpState> { self.eps.get(phys_ep).map(|ep| ep.state) }

    pub fn ep_busy(&self, phys_ep: usize) -> bool {
        self.eps.get(phys_ep).map(|ep| ep.in_flight).unwrap_or(false)
    }

    pub fn register_callback(&mut self, event: CallbackEvent, cb: CoreCallback<XdciCore<B, C>, C>) {
        self.callbacks[event as usize] = Some(cb);
    }

    pub fn unregister_callback(&mut self, event: CallbackEvent) { self.callbacks[event as usize] = None; }

    fn fire(&mut self, ctx: &mut C, event: CallbackEvent, param: &CallbackParam) -> Result<()> {
        let cb = self.callbacks[event as usize];
        match cb {
            Some(cb) => cb(self, ctx, param),
            None => Ok(()),
        }
    }

    /// Drain every event buffer, dispatching to callbacks. A nested call made from inside a
    /// callback returns immediately.
    pub fn isr_routine(&mut self, ctx: &mut C) -> Result<()> {
        if self.in_isr || !self.live {
            return Ok(());
        }
        self.in_isr = true;
        let mut result = Ok(());
        for line in 0..self.events.lines() {
            if let Err(e) = self.process_line(ctx, line) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.in_isr = false;
        result
    }

    /// Timer-driven variant: the line interrupt stays masked while the buffers drain.
    pub fn isr_routine_timer_based(&mut self, ctx: &mut C) -> Result<()> {
        for line in 0..self.events.lines() {
            self.csr.rmwf(utra::GEVNTSIZ_INTMASK.at(line, utra::GEVNT_STRIDE), 1);
        }
        let result = self.isr_routine(ctx);
        for line in 0..self.events.lines() {
            self.csr.rmwf(utra::GEVNTSIZ_INTMASK.at(line, utra::GEVNT_STRIDE), 0);
        }
        result
    }

    fn process_line(&mut self, ctx: &mut C, line: usize) -> Result<()> {
        let count_reg = utra::GEVNTCOUNT.at(line, utra::GEVNT_STRIDE);
        let mut remaining = self.csr.r(count_reg) as usize;
        if remaining == 0 {
            return Ok(());
        }
        let mut consumed = 0;
        let mut result = Ok(());
        while remaining > 0 {
            let raw = match self.events.get(line) {
                Some(buf) => buf.peek(),
                None => break,
            };
            let event = Event::decode(raw);
            log::trace!("event {:08x}: {:?}", raw, event);
            if let Err(e) = self.dispatch(ctx, event) {
                log::warn!("event {:?} handler failed: {:?}", event, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
            let size = event.size();
            if let Some(buf) = self.events.get_mut(line) {
                buf.advance(size);
            }
            consumed += size;
            remaining = remaining.saturating_sub(size);
        }
        // acknowledge; hardware stops posting events if this is skipped
        self.csr.wo(count_reg, consumed as u32);
        result
    }

    fn dispatch(&mut self, ctx: &mut C, event: Event) -> Result<()> {
        match event {
            Event::Device { code, info } => self.device_event(ctx, code, info),
            Event::Endpoint { phys_ep, kind, status, .. } => match kind {
                EpEventType::XferComplete if phys_ep < 2 => self.ep0_phase_done(ctx, phys_ep, status),
                EpEventType::XferComplete => self.xfer_done(ctx, phys_ep, status),
                EpEventType::XferNotReady => {
                    let param = self.ep_param(phys_ep, status);
                    self.fire(ctx, CallbackEvent::XferNotReady, &param)
                }
                _ => Ok(()),
            },
            Event::Unknown(raw) => {
                log::warn!("unrecognized event {:08x}", raw);
                Ok(())
            }
        }
    }

    fn device_event(&mut self, ctx: &mut C, code: DeviceEventCode, info: u32) -> Result<()> {
        let mut param =
            CallbackParam { link_state: self.link_state, speed: self.speed, ..Default::default() };
        match code {
            DeviceEventCode::Disconnect => {
                log::info!("bus disconnect");
                self.attached = false;
                self.fire(ctx, CallbackEvent::Disconnect, &param)
            }
            DeviceEventCode::UsbReset => self.bus_reset(ctx),
            DeviceEventCode::ConnectionDone => self.connection_done(ctx),
            DeviceEventCode::LinkStateChange | DeviceEventCode::Suspend => {
                self.link_state = info & 0xF;
                param.link_state = self.link_state;
                log::debug!("link state {:?}", LinkState::from_u32(self.link_state));
                self.fire(ctx, CallbackEvent::LinkStateChange, &param)
            }
            DeviceEventCode::Wakeup => self.fire(ctx, CallbackEvent::Wakeup, &param),
            DeviceEventCode::HibernationRequest => self.fire(ctx, CallbackEvent::Hibernation, &param),
            DeviceEventCode::Sof => self.fire(ctx, CallbackEvent::Sof, &param),
            DeviceEventCode::ErraticError => {
                log::error!("erratic error event");
                self.fire(ctx, CallbackEvent::ErraticError, &param)
            }
            DeviceEventCode::CommandComplete => self.fire(ctx, CallbackEvent::CommandComplete, &param),
            DeviceEventCode::BufferOverflow => {
                log::error!("event buffer overflow");
                self.fire(ctx, CallbackEvent::BufferOverflow, &param)
            }
            DeviceEventCode::TestLmp => self.fire(ctx, CallbackEvent::TestLmp, &param),
        }
    }

    fn bus_reset(&mut self, ctx: &mut C) -> Result<()> {
        log::info!("bus reset");
        #[cfg(feature = "verbose-debug")]
        self.print_status();
        for phys in 0..NUM_PHYS_EPS {
            // an armed SETUP receive stays armed
            if phys == 0 && self.eps[0].state == EpState::Setup {
                continue;
            }
            if let Some(rsc) = self.eps[phys].rsc_idx {
                cmd::end_xfer(&self.csr, &self.config.poll, phys, rsc, true)?;
            }
            self.eps[phys].retire();
            match self.eps[phys].state {
                EpState::Stalled => {
                    cmd::clear_stall(&self.csr, &self.config.poll, phys)?;
                    self.eps[phys].state = EpState::Enabled;
                }
                EpState::InData | EpState::OutData | EpState::Data | EpState::Status => {
                    self.eps[phys].state = EpState::Enabled;
                }
                _ => {}
            }
        }
        self.ep0_three_stage = false;
        cmd::flush_all_fifos(&self.csr, &self.config.poll)?;
        self.set_address(0)?;
        self.dev_state = UsbDeviceState::Default;
        self.ep0_rx_setup()?;
        let param = CallbackParam { link_state: self.link_state, ..Default::default() };
        self.fire(ctx, CallbackEvent::BusReset, &param)
    }

    fn connection_done(&mut self, ctx: &mut C) -> Result<()> {
        let raw = self.csr.rf(utra::DSTS_CONNECTSPD);
        let speed = UsbSpeed::from_u32(raw).ok_or(DeviceError::Device)?;
        let mps = speed.ctrl_max_packet_size();
        log::info!("connected at {:?}, EP0 max packet {}", speed, mps);
        #[cfg(feature = "verbose-debug")]
        self.print_status();

        self.speed = Some(speed);
        self.attached = true;
        for phys in 0..2 {
            self.eps[phys].info.max_pkt_size = mps;
            cmd::set_ep_config(&self.csr, &self.config.poll, &self.eps[phys].info, ConfigAction::Modify)?;
        }
        // park the PHY we aren't using
        let susp_usb2 = speed.is_super() as u32;
        self.csr.rmwf(utra::GUSB2PHYCFG_SUSPHY, susp_usb2);
        self.csr.rmwf(utra::GUSB3PIPECTL_SUSPHY, susp_usb2 ^ 1);
        self.set_address(0)?;

        let param = CallbackParam { speed: Some(speed), link_state: self.link_state, ..Default::default() };
        self.fire(ctx, CallbackEvent::ResetDone, &param)
    }

    fn ep_param(&self, phys_ep: usize, status: u32) -> CallbackParam {
        let info = self.eps[phys_ep].info;
        CallbackParam {
            ep_num: info.ep_num,
            ep_dir: info.ep_dir,
            ep_type: info.ep_type,
            status,
            speed: self.speed,
            link_state: self.link_state,
            ..Default::default()
        }
    }

    fn setup_packet(&self) -> [u8; SETUP_PKT_LEN] { unsafe { core::ptr::read_volatile(&self.setup_buf.0) } }

    fn setup_buf_addr(&self) -> u64 { self.setup_buf.0.as_ptr() as usize as u64 }

    fn ep0_phase_done(&mut self, ctx: &mut C, phys_ep: usize, status: u32) -> Result<()> {
        let (ctl, trbsts, residue) = {
            let slice = self.trbs.ep_slice(phys_ep);
            (slice[0].control_type(), slice[0].size().trbsts(), trb::residue(slice))
        };
        match ctl {
            Some(TrbControl::ControlSetup) => {
                let setup = self.setup_packet();
                self.eps[0].retire();
                self.eps[0].state = EpState::Data;
                self.ep0_three_stage = false;
                log::trace!("SETUP {:02x?}", setup);
                let mut param = self.ep_param(0, status);
                param.setup = setup;
                param.buffer = self.setup_buf_addr() as usize;
                param.length = SETUP_PKT_LEN as u32;
                param.trb_control = ctl;
                let result = self.fire(ctx, CallbackEvent::SetupPktReceived, &param);
                // only a host-to-device request without a data stage frees EP0 for the next SETUP
                let w_length = u16::from_le_bytes([setup[6], setup[7]]);
                if setup[0] & 0x80 == 0
                    && w_length == 0
                    && !self.eps[0].in_flight
                    && self.eps[0].state != EpState::Setup
                {
                    self.ep0_rx_setup()?;
                }
                result
            }
            Some(TrbControl::ControlData) => {
                if trbsts == TRBSTS_SETUP_PENDING {
                    log::warn!("control data stage aborted by a new SETUP");
                    cmd::flush_fifo(&self.csr, &self.config.poll, 0, EpDirection::Out)?;
                    cmd::flush_fifo(&self.csr, &self.config.poll, 0, EpDirection::In)?;
                    for phys in 0..2 {
                        self.eps[phys].retire();
                        self.eps[phys].state = EpState::Enabled;
                    }
                    return self.ep0_rx_setup();
                }
                let req = self.eps[phys_ep].retire();
                self.eps[phys_ep].state = EpState::Data;
                let mut param = self.ep_param(phys_ep, status);
                param.trb_control = ctl;
                if let Some(mut req) = req {
                    req.actual = req.length.saturating_sub(residue);
                    req.status = status;
                    param.buffer = req.buffer;
                    param.length = req.actual;
                    if let Some(cb) = req.on_complete {
                        cb(ctx, &req);
                    }
                }
                self.fire(ctx, CallbackEvent::XferDone, &param)
            }
            Some(TrbControl::ControlStatus2) | Some(TrbControl::ControlStatus3) => {
                self.eps[phys_ep].retire();
                self.eps[phys_ep].state = EpState::Enabled;
                if phys_ep == 1 && self.eps[0].state == EpState::Data {
                    self.eps[0].state = EpState::Enabled;
                }
                let mut param = self.ep_param(phys_ep, status);
                param.trb_control = ctl;
                let result = self.fire(ctx, CallbackEvent::XferDone, &param);
                self.ep0_rx_setup()?;
                result
            }
            other => {
                log::warn!("unhandled TRB type {:?} completed on EP{}", other, phys_ep);
                Ok(())
            }
        }
    }

    fn xfer_done(&mut self, ctx: &mut C, phys_ep: usize, status: u32) -> Result<()> {
        if phys_ep >= NUM_PHYS_EPS {
            return Err(DeviceError::Device);
        }
        let residue = trb::residue(self.trbs.ep_slice(phys_ep));
        let Some(mut req) = self.eps[phys_ep].retire() else {
            log::warn!("completion on idle endpoint {}", phys_ep);
            return Ok(());
        };
        req.actual = req.length.saturating_sub(residue);
        req.status = status;
        log::trace!("ep{} done: {} of {} bytes", phys_ep, req.actual, req.length);
        if let Some(cb) = req.on_complete {
            cb(ctx, &req);
        }
        let mut param = self.ep_param(phys_ep, status);
        param.buffer = req.buffer;
        param.length = req.actual;
        param.trb_control = Some(TrbControl::Normal);
        self.fire(ctx, CallbackEvent::XferDone, &param)
    }

    /// Set run/stop and wait for the controller to leave the halted state.
    pub fn connect(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.csr.rmwf(utra::DCTL_RUN_STOP, 1);
        let csr = &self.csr;
        self.config.reset_poll.wait_until(|| csr.rf(utra::DSTS_DEVCTRLHLT) == 0).map_err(|e| {
            log::error!("controller did not start");
            e
        })?;
        log::info!("xDCI connected");
        Ok(())
    }

    /// Drain pending events, end every outstanding transfer, then halt the controller.
    pub fn disconnect(&mut self, ctx: &mut C) -> Result<()> {
        self.ensure_live()?;
        if let Err(e) = self.isr_routine(ctx) {
            log::warn!("draining events before disconnect: {:?}", e);
        }
        for phys in 0..NUM_PHYS_EPS {
            if let Some(rsc) = self.eps[phys].rsc_idx {
                cmd::end_xfer(&self.csr, &self.config.poll, phys, rsc, true)?;
            }
            self.eps[phys].retire();
            if self.eps[phys].state == EpState::Setup || self.eps[phys].state == EpState::Status {
                self.eps[phys].state = EpState::Enabled;
            }
        }
        self.csr.rmwf(utra::DCTL_RUN_STOP, 0);
        let csr = &self.csr;
        self.config.reset_poll.wait_until(|| csr.rf(utra::DSTS_DEVCTRLHLT) == 1).map_err(|e| {
            log::error!("controller did not halt");
            e
        })?;
        self.attached = false;
        log::info!("xDCI disconnected");
        Ok(())
    }

    /// Negotiated speed, `None` before the first connection done.
    pub fn get_speed(&self) -> Option<UsbSpeed> { self.speed }

    pub fn set_address(&mut self, address: u8) -> Result<()> {
        if address > 127 {
            return Err(DeviceError::InvalidParameter);
        }
        self.csr.rmwf(utra::DCFG_DEVADDR, address as u32);
        self.address = address;
        log::debug!("device address {}", address);
        Ok(())
    }

    /// Configure and enable every endpoint of a newly selected configuration, in order.
    pub fn set_config(&mut self, endpoints: &[EpInfo]) -> Result<()> {
        self.ensure_live()?;
        // resources 0 and 1 stay with EP0/EP1
        cmd::start_new_config(&self.csr, &self.config.poll, 2)?;
        for ep in endpoints {
            self.enable_ep(ep)?;
        }
        self.dev_state = UsbDeviceState::Configured;
        log::info!("configured {} endpoint(s)", endpoints.len());
        Ok(())
    }

    pub fn set_link_state(&mut self, state: LinkState) -> Result<()> {
        self.ensure_live()?;
        self.csr.rmwf(utra::DCTL_ULSTCHNGREQ, state as u32);
        Ok(())
    }

    fn check_ep(&self, phys_ep: usize) -> Result<()> {
        if phys_ep >= NUM_PHYS_EPS {
            return Err(DeviceError::InvalidParameter);
        }
        self.ensure_live()
    }

    /// Record endpoint parameters without touching hardware.
    pub fn init_ep(&mut self, info: &EpInfo) -> Result<()> {
        self.check_ep(info.physical())?;
        self.eps[info.physical()].info = *info;
        Ok(())
    }

    pub fn enable_ep(&mut self, info: &EpInfo) -> Result<()> {
        let phys = info.physical();
        self.check_ep(phys)?;
        self.eps[phys].info = *info;
        cmd::set_ep_config(&self.csr, &self.config.poll, info, ConfigAction::Init)?;
        cmd::set_ep_xfer_res_config(&self.csr, &self.config.poll, phys)?;
        let ena = self.csr.r(utra::DALEPENA) | 1 << phys;
        self.csr.wo(utra::DALEPENA, ena);
        self.eps[phys].state = EpState::Enabled;
        log::debug!("ep{} enabled: {:?}", phys, info);
        Ok(())
    }

    pub fn disable_ep(&mut self, phys_ep: usize) -> Result<()> {
        self.check_ep(phys_ep)?;
        if let Some(rsc) = self.eps[phys_ep].rsc_idx {
            cmd::end_xfer(&self.csr, &self.config.poll, phys_ep, rsc, true)?;
        }
        self.eps[phys_ep].retire();
        let ena = self.csr.r(utra::DALEPENA) & !(1 << phys_ep);
        self.csr.wo(utra::DALEPENA, ena);
        self.eps[phys_ep].state = EpState::Disabled;
        Ok(())
    }

    /// Stall an endpoint. A control stall also re-arms the next SETUP.
    pub fn stall_ep(&mut self, phys_ep: usize) -> Result<()> {
        self.check_ep(phys_ep)?;
        if phys_ep < 2 {
            // protocol stall, cleared by hardware on the next SETUP
            cmd::set_stall(&self.csr, &self.config.poll, 0)?;
            for phys in 0..2 {
                self.eps[phys].retire();
                self.eps[phys].state = EpState::Enabled;
            }
            return self.ep0_rx_setup();
        }
        if let Some(rsc) = self.eps[phys_ep].rsc_idx {
            cmd::end_xfer(&self.csr, &self.config.poll, phys_ep, rsc, true)?;
            self.eps[phys_ep].retire();
        }
        cmd::set_stall(&self.csr, &self.config.poll, phys_ep)?;
        self.eps[phys_ep].state = EpState::Stalled;
        Ok(())
    }

    pub fn clear_stall(&mut self, phys_ep: usize) -> Result<()> {
        self.check_ep(phys_ep)?;
        cmd::clear_stall(&self.csr, &self.config.poll, phys_ep)?;
        if self.eps[phys_ep].state == EpState::Stalled {
            self.eps[phys_ep].state = EpState::Enabled;
        }
        Ok(())
    }

    pub fn is_stalled(&self, phys_ep: usize) -> bool {
        self.eps.get(phys_ep).map(|ep| ep.state == EpState::Stalled).unwrap_or(false)
    }

    pub fn ep_set_nrdy(&mut self, phys_ep: usize) -> Result<()> {
        self.check_ep(phys_ep)?;
        cmd::set_ep_nrdy(&self.csr, &self.config.poll, phys_ep)
    }

    /// Raw endpoint state word as reported by GET_EP_STATE.
    pub fn get_ep_state(&self, phys_ep: usize) -> Result<u32> {
        self.check_ep(phys_ep)?;
        cmd::get_ep_state(&self.csr, &self.config.poll, phys_ep)
    }

    /// Arm an 8-byte SETUP receive on EP0. No-op if one is already armed.
    pub fn ep0_rx_setup(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.eps[0].state == EpState::Setup {
            return Ok(());
        }
        let buf = self.setup_buf_addr();
        let len = SETUP_PKT_LEN as u32;
        trb::prepare_transfer(self.trbs.ep_slice_mut(0), TrbControl::ControlSetup, buf, len)?;
        let rsc = cmd::start_xfer(&self.csr, &self.config.poll, 0, self.trbs.ep_addr(0), 0)?;
        self.eps[0].rsc_idx = Some(rsc);
        self.eps[0].state = EpState::Setup;
        Ok(())
    }

    fn ep0_status(&mut self, phys_ep: usize) -> Result<()> {
        self.ensure_live()?;
        let ep = &self.eps[phys_ep];
        if ep.in_flight || ep.state == EpState::Setup {
            return Err(DeviceError::NotReady);
        }
        let ctl = if self.ep0_three_stage { TrbControl::ControlStatus3 } else { TrbControl::ControlStatus2 };
        let buf = self.setup_buf_addr();
        trb::prepare_transfer(self.trbs.ep_slice_mut(phys_ep), ctl, buf, 0)?;
        let rsc = cmd::start_xfer(&self.csr, &self.config.poll, phys_ep, self.trbs.ep_addr(phys_ep), 0)?;
        let ep = &mut self.eps[phys_ep];
        ep.rsc_idx = Some(rsc);
        ep.in_flight = true;
        ep.state = EpState::Status;
        Ok(())
    }

    /// OUT status stage, after an IN data stage.
    pub fn ep0_rx_status(&mut self) -> Result<()> {
        self.ep0_three_stage = true;
        self.ep0_status(0)
    }

    /// IN status stage, after an OUT data stage or for a request without one.
    pub fn ep0_tx_status(&mut self) -> Result<()> { self.ep0_status(1) }

    fn submit(&mut self, req: XferRequest<C>, dir: EpDirection) -> Result<()> {
        self.ensure_live()?;
        let phys = physical_ep(req.ep_info.ep_num, dir);
        if phys >= NUM_PHYS_EPS {
            return Err(DeviceError::InvalidParameter);
        }
        if req.buffer == 0 && req.length != 0 {
            return Err(DeviceError::InvalidParameter);
        }
        if self.eps[phys].in_flight || self.eps[phys].state == EpState::Disabled {
            return Err(DeviceError::NotReady);
        }
        // EP0's TRBs belong to the armed SETUP receive
        if phys < 2 && self.eps[0].state == EpState::Setup {
            return Err(DeviceError::NotReady);
        }
        let ctl = match self.eps[phys].info.ep_type {
            _ if phys < 2 => TrbControl::ControlData,
            EpType::Isochronous => TrbControl::IsochFirst,
            _ => TrbControl::Normal,
        };
        let mps = self.eps[phys].info.max_pkt_size as u32;
        let zlp = dir == EpDirection::In && req.zlp && req.length != 0 && mps != 0 && req.length % mps == 0;
        let slice = self.trbs.ep_slice_mut(phys);
        if zlp {
            trb::prepare_transfer_zlp(slice, ctl, req.buffer as u64, req.length)?;
        } else {
            trb::prepare_transfer(slice, ctl, req.buffer as u64, req.length)?;
        }
        let param = if ctl == TrbControl::IsochFirst { req.frame_number } else { req.stream_id };
        let rsc = cmd::start_xfer(&self.csr, &self.config.poll, phys, self.trbs.ep_addr(phys), param)?;

        if phys < 2 {
            self.ep0_three_stage = true;
        }
        let ep = &mut self.eps[phys];
        ep.rsc_idx = Some(rsc);
        ep.req = Some(req);
        ep.in_flight = true;
        if phys < 2 {
            ep.state = if dir == EpDirection::In { EpState::InData } else { EpState::OutData };
        }
        Ok(())
    }

    /// Queue an IN transfer. Endpoint 0 requests become the control data stage.
    pub fn tx_data(&mut self, req: XferRequest<C>) -> Result<()> { self.submit(req, EpDirection::In) }

    /// Queue an OUT transfer. Endpoint 0 requests become the control data stage.
    pub fn rx_data(&mut self, req: XferRequest<C>) -> Result<()> { self.submit(req, EpDirection::Out) }

    /// End the outstanding transfer on an endpoint and hand back its request.
    pub fn ep_cancel_transfer(&mut self, phys_ep: usize) -> Result<Option<XferRequest<C>>> {
        self.check_ep(phys_ep)?;
        if let Some(rsc) = self.eps[phys_ep].rsc_idx {
            cmd::end_xfer(&self.csr, &self.config.poll, phys_ep, rsc, true)?;
        }
        let req = self.eps[phys_ep].retire();
        let state = self.eps[phys_ep].state;
        if matches!(state, EpState::Setup | EpState::InData | EpState::OutData | EpState::Status) {
            self.eps[phys_ep].state = EpState::Enabled;
        }
        Ok(req)
    }

    #[cfg(feature = "verbose-debug")]
    pub fn print_status(&self) {
        log::info!(
            "DSTS: speed {} link {} halted {} | DCTL: run {} | DCFG: speed {} addr {}",
            self.csr.rf(utra::DSTS_CONNECTSPD),
            self.csr.rf(utra::DSTS_USBLNKST),
            self.csr.rf(utra::DSTS_DEVCTRLHLT),
            self.csr.rf(utra::DCTL_RUN_STOP),
            self.csr.rf(utra::DCFG_DEVSPD),
            self.csr.rf(utra::DCFG_DEVADDR),
        );
    }
}
