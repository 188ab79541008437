//! Endpoint and generic hardware commands.
//!
//! Every command follows the same pattern: write the parameters, write the command word with
//! the ACTIVE bit set, then poll until the hardware drops ACTIVE. Completion is not guaranteed
//! by the hardware, so the poll is always bounded by a [`PollConfig`].

use super::compat::{Csr, RegisterBank};
use super::utra;
use super::{DeviceError, EpDirection, EpInfo, EpType, Result};

/// Bounded busy-wait: `max_attempts` checks separated by `delay(interval_us)`.
#[derive(Copy, Clone)]
pub struct PollConfig {
    pub interval_us: u32,
    pub max_attempts: u32,
    pub delay: fn(u32),
}

impl core::fmt::Debug for PollConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PollConfig({}us x {})", self.interval_us, self.max_attempts)
    }
}

/// Endpoint and generic command completion.
pub const DEFAULT_POLL: PollConfig = PollConfig { interval_us: 1, max_attempts: 1000, delay: spin_delay };
/// Soft reset and run/stop transitions.
pub const RESET_POLL: PollConfig = PollConfig { interval_us: 1, max_attempts: 5000, delay: spin_delay };

const SPINS_PER_US: u32 = 100;

/// Calibration-free busy wait. Good enough for the microsecond-scale gaps between polls.
pub fn spin_delay(us: u32) {
    for _ in 0..us.saturating_mul(SPINS_PER_US) {
        core::hint::spin_loop();
    }
}

impl PollConfig {
    /// Check `done` up to `max_attempts` times, sleeping `interval_us` after every miss.
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) -> Result<()> {
        for _ in 0..self.max_attempts {
            if done() {
                return Ok(());
            }
            (self.delay)(self.interval_us);
        }
        Err(DeviceError::Timeout)
    }
}

/// The three parameter words of an endpoint command.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EpCommandParams {
    pub p0: u32,
    pub p1: u32,
    pub p2: u32,
}

/// SET_EP_CONFIG "configuration action".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    Init = 0,
    Restore = 1,
    Modify = 2,
    /// Leave the action field clear.
    None = 3,
}

/// Write the parameters and command, then wait for ACTIVE to drop.
///
/// `cmd` is the full command word minus ACTIVE. Returns the command register contents as
/// left by the hardware, which carries the transfer resource index for START_XFER.
pub fn issue_ep_command<B: RegisterBank>(
    csr: &Csr<B>,
    poll: &PollConfig,
    phys_ep: usize,
    cmd: u32,
    params: EpCommandParams,
) -> Result<u32> {
    let depcmd = utra::DEPCMD.at(phys_ep, utra::DEP_STRIDE);
    log::trace!(
        "ep{} cmd {:x} p0 {:08x} p1 {:08x} p2 {:08x}",
        phys_ep,
        cmd & utra::DEPCMD_CMDTYP.mask(),
        params.p0,
        params.p1,
        params.p2
    );
    csr.wo(utra::DEPCMDPAR2.at(phys_ep, utra::DEP_STRIDE), params.p2);
    csr.wo(utra::DEPCMDPAR1.at(phys_ep, utra::DEP_STRIDE), params.p1);
    csr.wo(utra::DEPCMDPAR0.at(phys_ep, utra::DEP_STRIDE), params.p0);
    csr.wo(depcmd, cmd | utra::DEPCMD_CMDACT.bits());

    let act = utra::DEPCMD_CMDACT.at(phys_ep, utra::DEP_STRIDE);
    if let Err(e) = poll.wait_until(|| csr.rf(act) == 0) {
        log::error!("ep{} command {:x} timed out", phys_ep, cmd & utra::DEPCMD_CMDTYP.mask());
        return Err(e);
    }
    let result = csr.r(depcmd);
    let status = (result >> utra::DEPCMD_CMDSTATUS.offset()) & utra::DEPCMD_CMDSTATUS.mask();
    if status != 0 {
        let typ = cmd & utra::DEPCMD_CMDTYP.mask();
        log::error!("ep{} command {:x} failed with status {:x}", phys_ep, typ, status);
        return Err(DeviceError::Device);
    }
    Ok(result)
}

/// Controller-wide command through DGCMD/DGCMDPAR.
pub fn issue_generic_command<B: RegisterBank>(
    csr: &Csr<B>,
    poll: &PollConfig,
    cmd: u32,
    param: u32,
) -> Result<()> {
    log::trace!("generic cmd {:x} param {:08x}", cmd, param);
    csr.wo(utra::DGCMDPAR, param);
    csr.wo(utra::DGCMD, cmd | utra::DGCMD_CMDACT.bits());
    if let Err(e) = poll.wait_until(|| csr.rf(utra::DGCMD_CMDACT) == 0) {
        log::error!("generic command {:x} timed out", cmd);
        return Err(e);
    }
    if csr.rf(utra::DGCMD_CMDSTATUS) != 0 {
        log::error!("generic command {:x} failed", cmd);
        return Err(DeviceError::Device);
    }
    Ok(())
}

/// Parameter encoding for SET_EP_CONFIG.
pub fn ep_config_params(ep: &EpInfo, action: ConfigAction) -> EpCommandParams {
    use utra::*;
    let mut p0 = EPCFG0_EPTYPE.bits() & ((ep.ep_type as u32) << EPCFG0_EPTYPE.offset());
    p0 |= (ep.max_pkt_size as u32 & EPCFG0_MPS.mask()) << EPCFG0_MPS.offset();
    // only transmit FIFOs are numbered
    if ep.ep_num != 0 && ep.ep_dir == EpDirection::In {
        p0 |= (ep.ep_num as u32 & EPCFG0_FIFO_NUM.mask()) << EPCFG0_FIFO_NUM.offset();
    }
    if ep.ep_type != EpType::Control {
        p0 |= (ep.burst_size as u32 & EPCFG0_BRST.mask()) << EPCFG0_BRST.offset();
    }
    if action != ConfigAction::None {
        p0 |= (action as u32) << EPCFG0_ACTION.offset();
    }

    // interrupt line is always 0
    let mut p1 = EPCFG1_XFER_CMPLT_EN.bits() | EPCFG1_XFER_IN_PRGRS_EN.bits() | EPCFG1_XFER_NRDY_EN.bits();
    p1 |= (ep.interval.saturating_sub(1) as u32 & EPCFG1_INTERVAL.mask()) << EPCFG1_INTERVAL.offset();
    if ep.max_streams != 0 && ep.ep_type == EpType::Bulk {
        p1 |= EPCFG1_STRM_CAP.bits() | EPCFG1_STRM_EVT_EN.bits();
    }
    p1 |= (ep.ep_dir as u32) << EPCFG1_EP_DIR.offset();
    p1 |= (ep.ep_num as u32 & EPCFG1_EP_NUM.mask()) << EPCFG1_EP_NUM.offset();

    EpCommandParams { p0, p1, p2: 0 }
}

pub fn set_ep_config<B: RegisterBank>(
    csr: &Csr<B>,
    poll: &PollConfig,
    ep: &EpInfo,
    action: ConfigAction,
) -> Result<()> {
    issue_ep_command(csr, poll, ep.physical(), utra::DEPCMD_SET_EP_CONFIG, ep_config_params(ep, action))
        .map(|_| ())
}

/// Allocate one transfer resource for the endpoint.
pub fn set_ep_xfer_res_config<B: RegisterBank>(
    csr: &Csr<B>,
    poll: &PollConfig,
    phys_ep: usize,
) -> Result<()> {
    issue_ep_command(
        csr,
        poll,
        phys_ep,
        utra::DEPCMD_SET_EP_XFER_RES_CONFIG,
        EpCommandParams { p0: 1, p1: 0, p2: 0 },
    )
    .map(|_| ())
}

/// Reset the transfer resource index space. Always issued on physical endpoint 0;
/// `rsc_base` is the first resource index handed out afterwards.
pub fn start_new_config<B: RegisterBank>(csr: &Csr<B>, poll: &PollConfig, rsc_base: u32) -> Result<()> {
    let cmd = utra::DEPCMD_START_NEW_CONFIG
        | ((rsc_base & utra::DEPCMD_XFER_RSC_IDX.mask()) << utra::DEPCMD_XFER_RSC_IDX.offset());
    issue_ep_command(csr, poll, 0, cmd, EpCommandParams::default()).map(|_| ())
}

pub fn get_ep_state<B: RegisterBank>(csr: &Csr<B>, poll: &PollConfig, phys_ep: usize) -> Result<u32> {
    issue_ep_command(csr, poll, phys_ep, utra::DEPCMD_GET_EP_STATE, EpCommandParams::default())?;
    Ok(csr.r(utra::DEPCMDPAR2.at(phys_ep, utra::DEP_STRIDE)))
}

pub fn set_stall<B: RegisterBank>(csr: &Csr<B>, poll: &PollConfig, phys_ep: usize) -> Result<()> {
    issue_ep_command(csr, poll, phys_ep, utra::DEPCMD_SET_STALL, EpCommandParams::default()).map(|_| ())
}

pub fn clear_stall<B: RegisterBank>(csr: &Csr<B>, poll: &PollConfig, phys_ep: usize) -> Result<()> {
    issue_ep_command(csr, poll, phys_ep, utra::DEPCMD_CLEAR_STALL, EpCommandParams::default()).map(|_| ())
}

/// Hand a TRB chain to the hardware. Returns the transfer resource index it assigned.
pub fn start_xfer<B: RegisterBank>(
    csr: &Csr<B>,
    poll: &PollConfig,
    phys_ep: usize,
    trb_addr: u64,
    stream_or_frame: u16,
) -> Result<u32> {
    let cmd = utra::DEPCMD_START_XFER | ((stream_or_frame as u32) << utra::DEPCMD_PARAM.offset());
    let result = issue_ep_command(
        csr,
        poll,
        phys_ep,
        cmd,
        EpCommandParams { p0: (trb_addr >> 32) as u32, p1: trb_addr as u32, p2: 0 },
    )?;
    Ok((result >> utra::DEPCMD_XFER_RSC_IDX.offset()) & utra::DEPCMD_XFER_RSC_IDX.mask())
}

/// Abort the transfer occupying `rsc_idx`. `force_rm` drops it without waiting for the bus.
pub fn end_xfer<B: RegisterBank>(
    csr: &Csr<B>,
    poll: &PollConfig,
    phys_ep: usize,
    rsc_idx: u32,
    force_rm: bool,
) -> Result<()> {
    let mut cmd = utra::DEPCMD_END_XFER
        | ((rsc_idx & utra::DEPCMD_XFER_RSC_IDX.mask()) << utra::DEPCMD_XFER_RSC_IDX.offset());
    if force_rm {
        cmd |= utra::DEPCMD_HIPRI_FORCERM.bits();
    }
    issue_ep_command(csr, poll, phys_ep, cmd, EpCommandParams::default()).map(|_| ())
}

pub fn flush_all_fifos<B: RegisterBank>(csr: &Csr<B>, poll: &PollConfig) -> Result<()> {
    issue_generic_command(csr, poll, utra::DGCMD_ALL_FIFO_FLUSH, 0)
}

pub fn flush_fifo<B: RegisterBank>(
    csr: &Csr<B>,
    poll: &PollConfig,
    ep_num: u8,
    dir: EpDirection,
) -> Result<()> {
    let mut param = ep_num as u32 & 0x1F;
    if dir == EpDirection::In {
        param |= utra::DGCMDPAR_FIFO_TX;
    }
    issue_generic_command(csr, poll, utra::DGCMD_SEL_FIFO_FLUSH, param)
}

pub fn set_ep_nrdy<B: RegisterBank>(csr: &Csr<B>, poll: &PollConfig, phys_ep: usize) -> Result<()> {
    issue_generic_command(csr, poll, utra::DGCMD_SET_EP_NRDY, phys_ep as u32)
}
