//! Reactive register file standing in for the controller in unit tests.
//!
//! Behaves enough like the silicon for the driver's bring-up and transfer paths: soft reset
//! and command ACTIVE bits self-clear, the halted bit follows run/stop, event count writes
//! acknowledge, and "host" helpers retire TRBs and post events into the driver's buffers.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::vec::Vec;

use super::cmd::PollConfig;
use super::compat::RegisterBank;
use super::driver::XdciConfig;
use super::event::{encode_device_event, encode_ep_event, DeviceEventCode, EpEventType};
use super::trb::Trb;
use super::utra;

const MOCK_BASE: usize = 0x4800_0000;

fn no_delay(_us: u32) {}

/// Driver configuration with short poll budgets and no delays.
pub fn test_config() -> XdciConfig {
    XdciConfig {
        poll: PollConfig { interval_us: 1, max_attempts: 10, delay: no_delay },
        reset_poll: PollConfig { interval_us: 1, max_attempts: 10, delay: no_delay },
        ..Default::default()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CmdRecord {
    /// Physical endpoint, `None` for generic commands
    pub ep: Option<usize>,
    pub cmd: u32,
    pub params: [u32; 3],
}

pub struct MockXdci {
    regs: RefCell<BTreeMap<usize, u32>>,
    writes: RefCell<Vec<(usize, u32)>>,
    commands: RefCell<Vec<CmdRecord>>,
    epcmd_reads: Cell<usize>,
    dsts_reads: Cell<usize>,
    evt_producer: RefCell<[usize; 4]>,
    /// Leave ACTIVE set forever on every command
    pub stuck_commands: Cell<bool>,
    /// Complete every command with a nonzero status
    pub fail_commands: Cell<bool>,
    /// Ignore CSFTRST self-clear
    pub stuck_reset: Cell<bool>,
    /// Reported in DEPCMDPAR2 by GET_EP_STATE
    pub ep_state_word: Cell<u32>,
    /// Halted bit never settles to what run/stop asks for
    pub stuck_halt: Cell<bool>,
}

fn depcmd_index(offset: usize) -> Option<usize> {
    let base = utra::DEPCMD.offset();
    if offset >= base && offset < base + 32 * utra::DEP_STRIDE && (offset - base) % utra::DEP_STRIDE == 0 {
        Some((offset - base) / utra::DEP_STRIDE)
    } else {
        None
    }
}

fn gevntcount_index(offset: usize) -> Option<usize> {
    let base = utra::GEVNTCOUNT.offset();
    if offset >= base && offset < base + 4 * utra::GEVNT_STRIDE && (offset - base) % utra::GEVNT_STRIDE == 0 {
        Some((offset - base) / utra::GEVNT_STRIDE)
    } else {
        None
    }
}

impl MockXdci {
    pub fn new() -> Self {
        MockXdci {
            regs: RefCell::new(BTreeMap::new()),
            writes: RefCell::new(Vec::new()),
            commands: RefCell::new(Vec::new()),
            epcmd_reads: Cell::new(0),
            dsts_reads: Cell::new(0),
            evt_producer: RefCell::new([0; 4]),
            stuck_commands: Cell::new(false),
            fail_commands: Cell::new(false),
            stuck_reset: Cell::new(false),
            ep_state_word: Cell::new(0),
            stuck_halt: Cell::new(false),
        }
    }

    fn get(&self, offset: usize) -> u32 { self.regs.borrow().get(&offset).copied().unwrap_or(0) }

    fn set(&self, offset: usize, value: u32) { self.regs.borrow_mut().insert(offset, value); }

    /// Preload a register without it counting as a driver write.
    pub fn poke(&self, offset: usize, value: u32) { self.set(offset, value) }

    pub fn peek(&self, offset: usize) -> u32 { self.get(offset) }

    pub fn write_count(&self) -> usize { self.writes.borrow().len() }

    pub fn write_log(&self) -> Vec<(usize, u32)> { self.writes.borrow().clone() }

    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes.borrow().iter().filter(|(o, _)| *o == offset).map(|(_, v)| *v).collect()
    }

    pub fn commands(&self) -> Vec<CmdRecord> { self.commands.borrow().clone() }

    pub fn clear_log(&self) {
        self.writes.borrow_mut().clear();
        self.commands.borrow_mut().clear();
        self.epcmd_reads.set(0);
        self.dsts_reads.set(0);
    }

    pub fn epcmd_reads(&self) -> usize { self.epcmd_reads.get() }

    pub fn dsts_reads(&self) -> usize { self.dsts_reads.get() }

    /// Commands of type `cmd` issued on physical endpoint `ep`.
    pub fn count_ep_commands(&self, ep: usize, cmd: u32) -> usize {
        self.commands.borrow().iter().filter(|c| c.ep == Some(ep) && c.cmd & 0xF == cmd).count()
    }

    pub fn resource_index_for(&self, ep: usize) -> u32 { ep as u32 + 1 }

    /// TRB address handed over by the most recent START_XFER on `ep`.
    pub fn last_start_xfer(&self, ep: usize) -> Option<usize> {
        self.commands
            .borrow()
            .iter()
            .rev()
            .find(|c| c.ep == Some(ep) && c.cmd & 0xF == utra::DEPCMD_START_XFER)
            .map(|c| ((c.params[0] as u64) << 32 | c.params[1] as u64) as usize)
    }

    /// Mimic the DMA engine writing event entries into line `line`'s buffer.
    pub fn raise_events(&self, line: usize, words: &[u32]) {
        let lo = self.get(utra::GEVNTADRLO.at(line, utra::GEVNT_STRIDE).offset()) as u64;
        let hi = self.get(utra::GEVNTADRHI.at(line, utra::GEVNT_STRIDE).offset()) as u64;
        let addr = (hi << 32 | lo) as usize;
        let size = (self.get(utra::GEVNTSIZ.at(line, utra::GEVNT_STRIDE).offset()) & 0xFFFF) as usize;
        assert!(addr != 0 && size != 0, "event buffer {} not programmed", line);
        let mut producer = self.evt_producer.borrow_mut();
        for &w in words {
            unsafe { ((addr + producer[line]) as *mut u32).write_volatile(w) };
            producer[line] = (producer[line] + 4) % size;
        }
        let count = utra::GEVNTCOUNT.at(line, utra::GEVNT_STRIDE).offset();
        self.set(count, self.get(count) + 4 * words.len() as u32);
    }

    pub fn raise_device_event(&self, code: DeviceEventCode, info: u32) {
        self.raise_events(0, &[encode_device_event(code, info)]);
    }

    /// Retire the chain starting at `trb_addr` the way hardware would, leaving `remaining`
    /// untransferred bytes in the final TRB.
    pub fn retire_chain(&self, trb_addr: usize, remaining: u32, trbsts: u32) {
        let mut p = trb_addr as *mut u32;
        loop {
            unsafe {
                let ctrl = p.add(3).read_volatile();
                let chained = ctrl & (1 << 2) != 0;
                let size = p.add(2).read_volatile();
                let left = if chained { 0 } else { remaining };
                p.add(2).write_volatile((size & 0x0300_0000) | (trbsts & 0xF) << 28 | left);
                p.add(3).write_volatile(ctrl & !1);
                if !chained {
                    break;
                }
                p = p.add(4);
            }
        }
    }

    /// Host side of a control SETUP: fill the armed SETUP buffer, retire it, post the event.
    pub fn deliver_setup(&self, setup: [u8; 8]) {
        let trb = self.last_start_xfer(0).expect("no SETUP armed on EP0");
        let t = unsafe { &*(trb as *const Trb) };
        let buf = t.buffer() as usize as *mut u8;
        unsafe { core::ptr::copy_nonoverlapping(setup.as_ptr(), buf, 8) };
        self.retire_chain(trb, 0, 0);
        self.raise_events(0, &[encode_ep_event(0, EpEventType::XferComplete, 0, 0)]);
    }

    /// Host writes `data` into the OUT transfer armed on `ep` and the transfer completes.
    pub fn complete_out(&self, ep: usize, data: &[u8]) {
        let trb = self.last_start_xfer(ep).expect("no OUT transfer armed");
        let t = unsafe { &*(trb as *const Trb) };
        let requested = t.size().bufsiz();
        let buf = t.buffer() as usize as *mut u8;
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len()) };
        self.retire_chain(trb, requested.saturating_sub(data.len() as u32), 0);
        self.raise_events(0, &[encode_ep_event(ep, EpEventType::XferComplete, 0, 0)]);
    }

    /// Host consumed everything armed on `ep`.
    pub fn complete_in(&self, ep: usize) {
        let trb = self.last_start_xfer(ep).expect("no IN transfer armed");
        self.retire_chain(trb, 0, 0);
        self.raise_events(0, &[encode_ep_event(ep, EpEventType::XferComplete, 0, 0)]);
    }

    /// Bytes of the data stage currently armed on `ep`.
    pub fn armed_data(&self, ep: usize) -> Vec<u8> {
        let trb = self.last_start_xfer(ep).expect("nothing armed");
        let t = unsafe { &*(trb as *const Trb) };
        let len = t.size().bufsiz() as usize;
        let buf = t.buffer() as usize as *const u8;
        unsafe { core::slice::from_raw_parts(buf, len) }.to_vec()
    }

    pub fn armed_control_type(&self, ep: usize) -> Option<u32> {
        let trb = self.last_start_xfer(ep)?;
        let t = unsafe { &*(trb as *const Trb) };
        Some(t.ctrl().trbctl())
    }
}

impl RegisterBank for MockXdci {
    fn read32(&self, offset: usize) -> u32 {
        if offset == utra::DSTS.offset() {
            self.dsts_reads.set(self.dsts_reads.get() + 1);
            let running = self.get(utra::DCTL.offset()) & utra::DCTL_RUN_STOP.bits() != 0;
            let halted = running == self.stuck_halt.get();
            let dsts = self.get(offset) & !utra::DSTS_DEVCTRLHLT.bits();
            return if halted { dsts | utra::DSTS_DEVCTRLHLT.bits() } else { dsts };
        }
        if depcmd_index(offset).is_some() {
            self.epcmd_reads.set(self.epcmd_reads.get() + 1);
        }
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.writes.borrow_mut().push((offset, value));

        if offset == utra::DCTL.offset() {
            let v = if self.stuck_reset.get() { value } else { value & !utra::DCTL_CSFTRST.bits() };
            self.set(offset, v);
        } else if let Some(ep) = depcmd_index(offset) {
            let params = [
                self.get(utra::DEPCMDPAR0.at(ep, utra::DEP_STRIDE).offset()),
                self.get(utra::DEPCMDPAR1.at(ep, utra::DEP_STRIDE).offset()),
                self.get(utra::DEPCMDPAR2.at(ep, utra::DEP_STRIDE).offset()),
            ];
            let cmd = value & !utra::DEPCMD_CMDACT.bits();
            self.commands.borrow_mut().push(CmdRecord { ep: Some(ep), cmd, params });
            if self.stuck_commands.get() {
                self.set(offset, value);
                return;
            }
            let mut done = value & !utra::DEPCMD_CMDACT.bits();
            if value & 0xF == utra::DEPCMD_GET_EP_STATE {
                self.set(utra::DEPCMDPAR2.at(ep, utra::DEP_STRIDE).offset(), self.ep_state_word.get());
            }
            if value & 0xF == utra::DEPCMD_START_XFER {
                done = (done & !utra::DEPCMD_PARAM.bits()) | self.resource_index_for(ep) << 16;
            }
            if self.fail_commands.get() {
                done |= 1 << utra::DEPCMD_CMDSTATUS.offset();
            }
            self.set(offset, done);
        } else if offset == utra::DGCMD.offset() {
            let param = self.get(utra::DGCMDPAR.offset());
            let cmd = value & !utra::DGCMD_CMDACT.bits();
            self.commands.borrow_mut().push(CmdRecord { ep: None, cmd, params: [param, 0, 0] });
            if self.stuck_commands.get() {
                self.set(offset, value);
                return;
            }
            let mut done = value & !utra::DGCMD_CMDACT.bits();
            if self.fail_commands.get() {
                done |= utra::DGCMD_CMDSTATUS.bits();
            }
            self.set(offset, done);
        } else if gevntcount_index(offset).is_some() {
            let current = self.get(offset);
            self.set(offset, current.saturating_sub(value & 0xFFFF));
        } else {
            self.set(offset, value);
        }
    }

    fn base(&self) -> usize { MOCK_BASE }
}
