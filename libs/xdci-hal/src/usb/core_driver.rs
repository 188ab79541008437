//! The controller capability set consumed by the upper layers.
//!
//! [`XdciCore`] is the only implementor; the protocol and function-IO layers are written
//! against the trait so another controller variant can slot in underneath.

use super::compat::RegisterBank;
use super::driver::{CallbackEvent, CoreCallback, XdciConfig, XdciCore, XferRequest};
use super::{EpInfo, LinkState, Result, UsbDeviceState, UsbSpeed};

pub trait UsbDeviceCoreDriver<C>: Sized {
    type Bank;

    fn init(bank: Self::Bank, config: XdciConfig) -> Result<Self>;
    fn deinit(&mut self, ctx: &mut C) -> Result<()>;
    fn register_callback(&mut self, event: CallbackEvent, cb: CoreCallback<Self, C>);
    fn unregister_callback(&mut self, event: CallbackEvent);
    fn isr_routine(&mut self, ctx: &mut C) -> Result<()>;
    fn isr_routine_timer_based(&mut self, ctx: &mut C) -> Result<()>;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self, ctx: &mut C) -> Result<()>;
    fn get_speed(&self) -> Option<UsbSpeed>;
    fn set_address(&mut self, address: u8) -> Result<()>;
    fn set_config(&mut self, endpoints: &[EpInfo]) -> Result<()>;
    fn set_link_state(&mut self, state: LinkState) -> Result<()>;
    fn init_ep(&mut self, info: &EpInfo) -> Result<()>;
    fn enable_ep(&mut self, info: &EpInfo) -> Result<()>;
    fn disable_ep(&mut self, phys_ep: usize) -> Result<()>;
    fn stall_ep(&mut self, phys_ep: usize) -> Result<()>;
    fn clear_stall(&mut self, phys_ep: usize) -> Result<()>;
    fn ep_set_nrdy(&mut self, phys_ep: usize) -> Result<()>;
    fn ep0_rx_setup(&mut self) -> Result<()>;
    fn ep0_rx_status(&mut self) -> Result<()>;
    fn ep0_tx_status(&mut self) -> Result<()>;
    fn tx_data(&mut self, req: XferRequest<C>) -> Result<()>;
    fn rx_data(&mut self, req: XferRequest<C>) -> Result<()>;
    fn ep_cancel_transfer(&mut self, phys_ep: usize) -> Result<Option<XferRequest<C>>>;

    /* state queries the upper layers rely on */
    fn ep_info(&self, phys_ep: usize) -> Option<EpInfo>;
    fn is_stalled(&self, phys_ep: usize) -> bool;
    fn dev_state(&self) -> UsbDeviceState;
    fn set_dev_state(&mut self, state: UsbDeviceState);
}

impl<B: RegisterBank, C> UsbDeviceCoreDriver<C> for XdciCore<B, C> {
    type Bank = B;

    fn init(bank: B, config: XdciConfig) -> Result<Self> { XdciCore::init(bank, config) }

    fn deinit(&mut self, ctx: &mut C) -> Result<()> { XdciCore::deinit(self, ctx) }

    fn register_callback(&mut self, event: CallbackEvent, cb: CoreCallback<Self, C>) {
        XdciCore::register_callback(self, event, cb)
    }

    fn unregister_callback(&mut self, event: CallbackEvent) { XdciCore::unregister_callback(self, event) }

    fn isr_routine(&mut self, ctx: &mut C) -> Result<()> { XdciCore::isr_routine(self, ctx) }

    fn isr_routine_timer_based(&mut self, ctx: &mut C) -> Result<()> {
        XdciCore::isr_routine_timer_based(self, ctx)
    }

    fn connect(&mut self) -> Result<()> { XdciCore::connect(self) }

    fn disconnect(&mut self, ctx: &mut C) -> Result<()> { XdciCore::disconnect(self, ctx) }

    fn get_speed(&self) -> Option<UsbSpeed> { XdciCore::get_speed(self) }

    fn set_address(&mut self, address: u8) -> Result<()> { XdciCore::set_address(self, address) }

    fn set_config(&mut self, endpoints: &[EpInfo]) -> Result<()> { XdciCore::set_config(self, endpoints) }

    fn set_link_state(&mut self, state: LinkState) -> Result<()> { XdciCore::set_link_state(self, state) }

    fn init_ep(&mut self, info: &EpInfo) -> Result<()> { XdciCore::init_ep(self, info) }

    fn enable_ep(&mut self, info: &EpInfo) -> Result<()> { XdciCore::enable_ep(self, info) }

    fn disable_ep(&mut self, phys_ep: usize) -> Result<()> { XdciCore::disable_ep(self, phys_ep) }

    fn stall_ep(&mut self, phys_ep: usize) -> Result<()> { XdciCore::stall_ep(self, phys_ep) }

    fn clear_stall(&mut self, phys_ep: usize) -> Result<()> { XdciCore::clear_stall(self, phys_ep) }

    fn ep_set_nrdy(&mut self, phys_ep: usize) -> Result<()> { XdciCore::ep_set_nrdy(self, phys_ep) }

    fn ep0_rx_setup(&mut self) -> Result<()> { XdciCore::ep0_rx_setup(self) }

    fn ep0_rx_status(&mut self) -> Result<()> { XdciCore::ep0_rx_status(self) }

    fn ep0_tx_status(&mut self) -> Result<()> { XdciCore::ep0_tx_status(self) }

    fn tx_data(&mut self, req: XferRequest<C>) -> Result<()> { XdciCore::tx_data(self, req) }

    fn rx_data(&mut self, req: XferRequest<C>) -> Result<()> { XdciCore::rx_data(self, req) }

    fn ep_cancel_transfer(&mut self, phys_ep: usize) -> Result<Option<XferRequest<C>>> {
        XdciCore::ep_cancel_transfer(self, phys_ep)
    }

    fn ep_info(&self, phys_ep: usize) -> Option<EpInfo> { XdciCore::ep_info(self, phys_ep) }

    fn is_stalled(&self, phys_ep: usize) -> bool { XdciCore::is_stalled(self, phys_ep) }

    fn dev_state(&self) -> UsbDeviceState { XdciCore::dev_state(self) }

    fn set_dev_state(&mut self, state: UsbDeviceState) { XdciCore::set_dev_state(self, state) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::{test_config, MockXdci};
    use crate::usb::utra;

    // drive the controller purely through the trait
    fn bring_up<D: UsbDeviceCoreDriver<()>>(bank: D::Bank) -> D {
        let mut core = D::init(bank, test_config()).unwrap();
        core.connect().unwrap();
        core.ep0_rx_setup().unwrap();
        core
    }

    #[test]
    fn generic_driver_path() {
        let mock = MockXdci::new();
        let mut core: XdciCore<&MockXdci, ()> = bring_up(&mock);
        assert_eq!(mock.count_ep_commands(0, utra::DEPCMD_START_XFER), 1);
        assert_eq!(UsbDeviceCoreDriver::dev_state(&core), UsbDeviceState::Default);
        UsbDeviceCoreDriver::disconnect(&mut core, &mut ()).unwrap();
        assert_eq!(mock.count_ep_commands(0, utra::DEPCMD_END_XFER), 1);
    }
}
