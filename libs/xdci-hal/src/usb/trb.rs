//! Transfer Request Blocks and the per-endpoint TRB pool.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{compiler_fence, Ordering};

use bitfield::bitfield;
use num_derive::FromPrimitive;

use super::{DeviceError, Result};

/// Largest byte count a single TRB can describe.
pub const MAX_TRB_PAYLOAD: u32 = 0xFF_FFFF;
/// TRB slots reserved per physical endpoint.
pub const TRBS_PER_EP: usize = 32;
/// Physical endpoints the pool is sized for.
pub const NUM_PHYS_EPS: usize = 32;

/// TRB status code reported when a SETUP arrived while a control data stage was pending.
pub const TRBSTS_SETUP_PENDING: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum TrbControl {
    Normal = 1,
    ControlSetup = 2,
    ControlStatus2 = 3,
    ControlStatus3 = 4,
    ControlData = 5,
    IsochFirst = 6,
    Isoch = 7,
    Link = 8,
}
impl TrbControl {
    fn is_isoch(&self) -> bool { matches!(self, TrbControl::IsochFirst | TrbControl::Isoch) }
}

bitfield! {
    pub struct TrbSize(u32);
    impl Debug;
    pub bufsiz, set_bufsiz: 23, 0;
    pub pcm1, set_pcm1: 25, 24;
    pub trbsts, set_trbsts: 31, 28;
}

bitfield! {
    pub struct TrbCtrl(u32);
    impl Debug;
    pub hwo, set_hwo: 0;
    pub lst, set_lst: 1;
    pub chn, set_chn: 2;
    pub csp, set_csp: 3;
    pub trbctl, set_trbctl: 9, 4;
    pub isp_imi, set_isp_imi: 10;
    pub ioc, set_ioc: 11;
    pub sid_sofn, set_sid_sofn: 29, 14;
}

/// Hardware TRB. Shared with the controller's DMA engine, so every access is volatile.
#[repr(C, align(16))]
#[derive(Debug, Default)]
pub struct Trb {
    buf_lo: u32,
    buf_hi: u32,
    size: u32,
    control: u32,
}

impl Trb {
    pub fn buffer(&self) -> u64 {
        let lo = unsafe { core::ptr::read_volatile(&self.buf_lo) };
        let hi = unsafe { core::ptr::read_volatile(&self.buf_hi) };
        (hi as u64) << 32 | lo as u64
    }

    pub fn size(&self) -> TrbSize { TrbSize(unsafe { core::ptr::read_volatile(&self.size) }) }

    pub fn ctrl(&self) -> TrbCtrl { TrbCtrl(unsafe { core::ptr::read_volatile(&self.control) }) }

    /// Owned by hardware: do not interpret size or status while this is set.
    pub fn hw_owned(&self) -> bool { self.ctrl().hwo() }

    pub fn control_type(&self) -> Option<TrbControl> {
        num_traits::FromPrimitive::from_u32(self.ctrl().trbctl())
    }

    pub fn clear(&mut self) {
        unsafe {
            core::ptr::write_volatile(&mut self.control, 0);
            core::ptr::write_volatile(&mut self.buf_lo, 0);
            core::ptr::write_volatile(&mut self.buf_hi, 0);
            core::ptr::write_volatile(&mut self.size, 0);
        }
        compiler_fence(Ordering::SeqCst);
    }

    /// Fill in the descriptor and hand it to hardware. HWO goes in with the final write.
    fn publish(&mut self, buffer: u64, size: TrbSize, mut ctrl: TrbCtrl) {
        ctrl.set_hwo(false);
        ctrl.set_isp_imi(false);
        unsafe {
            core::ptr::write_volatile(&mut self.buf_lo, buffer as u32);
            core::ptr::write_volatile(&mut self.buf_hi, (buffer >> 32) as u32);
            core::ptr::write_volatile(&mut self.size, size.0);
            core::ptr::write_volatile(&mut self.control, ctrl.0);
        }
        compiler_fence(Ordering::SeqCst);
        ctrl.set_isp_imi(true);
        ctrl.set_hwo(true);
        unsafe { core::ptr::write_volatile(&mut self.control, ctrl.0) };
        compiler_fence(Ordering::SeqCst);
    }
}

/// Describe `length` bytes at `buffer` in `trbs`, splitting at [`MAX_TRB_PAYLOAD`].
///
/// Returns how many TRBs were used.
pub fn prepare_transfer(trbs: &mut [Trb], ctl: TrbControl, buffer: u64, length: u32) -> Result<usize> {
    build_chain(trbs, ctl, buffer, length, false)
}

/// Same as [`prepare_transfer`], then chain a trailing zero-length TRB so the host sees a
/// short packet after a transfer that ended on a packet boundary.
pub fn prepare_transfer_zlp(trbs: &mut [Trb], ctl: TrbControl, buffer: u64, length: u32) -> Result<usize> {
    build_chain(trbs, ctl, buffer, length, true)
}

fn build_chain(trbs: &mut [Trb], ctl: TrbControl, buffer: u64, length: u32, zlp: bool) -> Result<usize> {
    let data_trbs = if length == 0 { 1 } else { ((length - 1) / MAX_TRB_PAYLOAD + 1) as usize };
    let count = data_trbs + zlp as usize;
    if count > trbs.len() {
        log::warn!("transfer of {} bytes needs {} TRBs, only {} available", length, count, trbs.len());
        return Err(DeviceError::OutOfResources);
    }

    let mut remaining = length;
    let mut addr = buffer;
    for (i, trb) in trbs.iter_mut().take(count).enumerate() {
        let last = i == count - 1;
        let chunk = if i < data_trbs { remaining.min(MAX_TRB_PAYLOAD) } else { 0 };

        let mut size = TrbSize(0);
        size.set_bufsiz(chunk);
        let mut ctrl = TrbCtrl(0);
        ctrl.set_trbctl(ctl as u32);
        ctrl.set_chn(!last);
        ctrl.set_lst(last);
        if last && ctl.is_isoch() {
            ctrl.set_ioc(true);
        }
        trb.publish(if chunk == 0 { buffer } else { addr }, size, ctrl);

        remaining -= chunk;
        addr += chunk as u64;
    }
    Ok(count)
}

/// Bytes left untransferred across a retired chain.
pub fn residue(trbs: &[Trb]) -> u32 {
    let mut total = 0;
    for trb in trbs {
        total += trb.size().bufsiz();
        if !trb.ctrl().chn() {
            break;
        }
    }
    total
}

/// Owns the TRB memory for every physical endpoint.
pub struct TrbPool {
    trbs: Box<[Trb]>,
}

impl TrbPool {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(NUM_PHYS_EPS * TRBS_PER_EP);
        v.resize_with(NUM_PHYS_EPS * TRBS_PER_EP, Trb::default);
        TrbPool { trbs: v.into_boxed_slice() }
    }

    pub fn ep_slice(&self, phys_ep: usize) -> &[Trb] {
        &self.trbs[phys_ep * TRBS_PER_EP..(phys_ep + 1) * TRBS_PER_EP]
    }

    pub fn ep_slice_mut(&mut self, phys_ep: usize) -> &mut [Trb] {
        &mut self.trbs[phys_ep * TRBS_PER_EP..(phys_ep + 1) * TRBS_PER_EP]
    }

    /// DMA address of the first TRB of an endpoint's slice.
    pub fn ep_addr(&self, phys_ep: usize) -> u64 { self.ep_slice(phys_ep).as_ptr() as usize as u64 }

    pub fn reset(&mut self) {
        for trb in self.trbs.iter_mut() {
            trb.clear();
        }
    }
}

impl Default for TrbPool {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn slots(n: usize) -> Vec<Trb> {
        let mut v = Vec::new();
        v.resize_with(n, Trb::default);
        v
    }

    #[test]
    fn layout() {
        assert_eq!(core::mem::size_of::<Trb>(), 16);
        assert_eq!(core::mem::align_of::<Trb>(), 16);
    }

    #[test]
    fn single_trb() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut trbs = slots(TRBS_PER_EP);
        for length in [0u32, 1, 8, 512, MAX_TRB_PAYLOAD - 1, MAX_TRB_PAYLOAD]
            .into_iter()
            .chain((0..64).map(|_| rng.gen_range(0..=MAX_TRB_PAYLOAD)))
        {
            let used = prepare_transfer(&mut trbs, TrbControl::Normal, 0x8000_0000, length).unwrap();
            assert_eq!(used, 1);
            let ctrl = trbs[0].ctrl();
            assert!(!ctrl.chn());
            assert!(ctrl.lst());
            assert!(ctrl.hwo());
            assert!(ctrl.isp_imi());
            assert_eq!(ctrl.trbctl(), TrbControl::Normal as u32);
            assert_eq!(trbs[0].size().bufsiz(), length);
            assert_eq!(trbs[0].buffer(), 0x8000_0000);
        }
    }

    #[test]
    fn split_chain() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        let mut trbs = slots(TRBS_PER_EP);
        for _ in 0..64 {
            let length = rng.gen_range(MAX_TRB_PAYLOAD + 1..=8 * MAX_TRB_PAYLOAD);
            let base = 0x1_0000_0000u64;
            let used = prepare_transfer(&mut trbs, TrbControl::Normal, base, length).unwrap();
            let expected = ((length as u64 + MAX_TRB_PAYLOAD as u64 - 1) / MAX_TRB_PAYLOAD as u64) as usize;
            assert_eq!(used, expected);
            let mut sum = 0u64;
            for (i, trb) in trbs[..used].iter().enumerate() {
                let ctrl = trb.ctrl();
                assert!(ctrl.hwo());
                assert_eq!(trb.buffer(), base + i as u64 * MAX_TRB_PAYLOAD as u64);
                if i == used - 1 {
                    assert!(!ctrl.chn());
                    assert!(ctrl.lst());
                } else {
                    assert!(ctrl.chn());
                    assert!(!ctrl.lst());
                    assert_eq!(trb.size().bufsiz(), MAX_TRB_PAYLOAD);
                }
                sum += trb.size().bufsiz() as u64;
            }
            assert_eq!(sum, length as u64);
        }
    }

    #[test]
    fn out_of_trbs() {
        let mut trbs = slots(2);
        assert_eq!(
            prepare_transfer(&mut trbs, TrbControl::Normal, 0x1000, 2 * MAX_TRB_PAYLOAD + 1),
            Err(DeviceError::OutOfResources)
        );
        // nothing was handed to hardware
        assert!(trbs.iter().all(|t| !t.hw_owned()));
    }

    #[test]
    fn zero_length_tail() {
        let mut trbs = slots(4);
        let used = prepare_transfer_zlp(&mut trbs, TrbControl::Normal, 0x2000, 1024).unwrap();
        assert_eq!(used, 2);
        assert!(trbs[0].ctrl().chn());
        assert!(!trbs[0].ctrl().lst());
        assert_eq!(trbs[0].size().bufsiz(), 1024);
        assert!(trbs[1].ctrl().lst());
        assert_eq!(trbs[1].size().bufsiz(), 0);
    }

    #[test]
    fn residue_walks_chain() {
        let mut trbs = slots(4);
        prepare_transfer(&mut trbs, TrbControl::Normal, 0x2000, 2 * MAX_TRB_PAYLOAD).unwrap();
        assert_eq!(residue(&trbs), 2 * MAX_TRB_PAYLOAD);
    }

    #[test]
    fn pool_slices_are_disjoint() {
        let pool = TrbPool::new();
        assert_eq!(pool.ep_addr(1) - pool.ep_addr(0), (TRBS_PER_EP * 16) as u64);
        assert_eq!(pool.ep_addr(0) % 16, 0);
    }
}
