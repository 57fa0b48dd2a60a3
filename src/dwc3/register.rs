//! Register access for the DWC3 register block
//!
//! [`RegisterIo`] is the only primitive: a 32-bit read or write at a byte
//! offset. [`Mmio`] implements it against real silicon with the memory
//! barriers a weakly-ordered Cortex-M bus needs; tests implement it with a
//! fake. [`Registers`] layers typed accessors for each register group on top.

use core::ptr::{read_volatile, write_volatile};
use core::task::Poll;

use super::{
    offset, Dcfg, Dctl, Devten, Dsts, EventSize, Gctl, Gfladj, Gsbuscfg0, PhyCfg,
    EVENT_COUNT_MASK,
};
use super::command::{CommandParams, DepCmd};
use crate::error::{Result, UsbError};

/// 32-bit register access by byte offset
pub trait RegisterIo {
    /// Read the register at `offset`
    fn read(&self, offset: usize) -> u32;

    /// Write the register at `offset`
    fn write(&mut self, offset: usize, value: u32);

    /// Read-modify-write
    #[inline(always)]
    fn modify<F>(&mut self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let value = self.read(offset);
        self.write(offset, f(value));
    }

    /// Set bits
    #[inline(always)]
    fn set_bits(&mut self, offset: usize, mask: u32) {
        self.modify(offset, |v| v | mask);
    }

    /// Clear bits
    #[inline(always)]
    fn clear_bits(&mut self, offset: usize, mask: u32) {
        self.modify(offset, |v| v & !mask);
    }
}

#[inline(always)]
fn barrier() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::dmb();
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[inline(always)]
fn write_barrier() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::dsb();
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Memory-mapped register block
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Bind to the register block at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the address of a DWC3 register block and the caller
    /// must guarantee exclusive access to it for the lifetime of this value.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Base address
    pub const fn base(&self) -> usize {
        self.base
    }
}

impl RegisterIo for Mmio {
    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        barrier();
        // SAFETY: base validity and exclusivity guaranteed by `Mmio::new`
        let value = unsafe { read_volatile((self.base + offset) as *const u32) };
        barrier();
        value
    }

    #[inline(always)]
    fn write(&mut self, offset: usize, value: u32) {
        barrier();
        // SAFETY: base validity and exclusivity guaranteed by `Mmio::new`
        unsafe { write_volatile((self.base + offset) as *mut u32, value) };
        write_barrier();
    }
}

/// Poll `probe` up to `max_attempts` times
///
/// `Poll::Ready` ends the loop with the probe's own result (success or a
/// hardware-reported error); running out of attempts yields `on_timeout`.
pub fn poll_until<T, F>(max_attempts: u32, on_timeout: UsbError, mut probe: F) -> Result<T>
where
    F: FnMut() -> Poll<Result<T>>,
{
    for _ in 0..max_attempts {
        if let Poll::Ready(result) = probe() {
            return result;
        }
    }
    Err(on_timeout)
}

/// Typed view of the DWC3 register block
pub struct Registers<R> {
    io: R,
}

impl<R: RegisterIo> Registers<R> {
    /// Wrap a raw register block
    pub const fn new(io: R) -> Self {
        Self { io }
    }

    /// Raw access
    pub fn io(&self) -> &R {
        &self.io
    }

    /// Raw mutable access
    pub fn io_mut(&mut self) -> &mut R {
        &mut self.io
    }

    /// Core identification (GSNPSID)
    pub fn snpsid(&self) -> u32 {
        self.io.read(offset::GSNPSID)
    }

    /// Hardware parameter word `n` (GHWPARAMS0..=8)
    pub fn hwparams(&self, n: usize) -> u32 {
        self.io.read(offset::ghwparams(n))
    }

    /// Global core control
    pub fn gctl(&self) -> Gctl {
        Gctl::from_bits_retain(self.io.read(offset::GCTL))
    }

    /// Update global core control
    pub fn modify_gctl(&mut self, f: impl FnOnce(Gctl) -> Gctl) {
        self.io
            .modify(offset::GCTL, |v| f(Gctl::from_bits_retain(v)).bits());
    }

    /// Update SoC bus configuration 0
    pub fn modify_sbuscfg0(&mut self, f: impl FnOnce(Gsbuscfg0) -> Gsbuscfg0) {
        self.io
            .modify(offset::GSBUSCFG0, |v| f(Gsbuscfg0::from_bits_retain(v)).bits());
    }

    /// USB2 PHY configuration
    pub fn phy_cfg(&self) -> PhyCfg {
        PhyCfg::from_bits_retain(self.io.read(offset::GUSB2PHYCFG0))
    }

    /// Write USB2 PHY configuration
    pub fn set_phy_cfg(&mut self, cfg: PhyCfg) {
        self.io.write(offset::GUSB2PHYCFG0, cfg.bits());
    }

    /// Update USB2 PHY configuration
    pub fn modify_phy_cfg(&mut self, f: impl FnOnce(PhyCfg) -> PhyCfg) {
        let cfg = f(self.phy_cfg());
        self.set_phy_cfg(cfg);
    }

    /// Frame length adjustment
    pub fn fladj(&self) -> Gfladj {
        Gfladj::from_bits_retain(self.io.read(offset::GFLADJ))
    }

    /// Write frame length adjustment
    pub fn set_fladj(&mut self, value: Gfladj) {
        self.io.write(offset::GFLADJ, value.bits());
    }

    /// Device configuration
    pub fn dcfg(&self) -> Dcfg {
        Dcfg::from_bits_retain(self.io.read(offset::DCFG))
    }

    /// Update device configuration
    pub fn modify_dcfg(&mut self, f: impl FnOnce(Dcfg) -> Dcfg) {
        self.io
            .modify(offset::DCFG, |v| f(Dcfg::from_bits_retain(v)).bits());
    }

    /// Device control
    pub fn dctl(&self) -> Dctl {
        Dctl::from_bits_retain(self.io.read(offset::DCTL))
    }

    /// Update device control
    pub fn modify_dctl(&mut self, f: impl FnOnce(Dctl) -> Dctl) {
        self.io
            .modify(offset::DCTL, |v| f(Dctl::from_bits_retain(v)).bits());
    }

    /// Device status
    pub fn dsts(&self) -> Dsts {
        Dsts::from_bits_retain(self.io.read(offset::DSTS))
    }

    /// Enable device events
    pub fn set_devten(&mut self, events: Devten) {
        self.io.write(offset::DEVTEN, events.bits());
    }

    /// Physical endpoint enable bitmask
    pub fn enabled_endpoints(&self) -> u32 {
        self.io.read(offset::DALEPENA)
    }

    /// Set or clear one bit of the endpoint enable bitmask
    pub fn set_endpoint_enabled(&mut self, phy: usize, enabled: bool) {
        let mask = 1u32 << phy;
        if enabled {
            self.io.set_bits(offset::DALEPENA, mask);
        } else {
            self.io.clear_bits(offset::DALEPENA, mask);
        }
    }

    /// Program the event buffer address and size, zero the count
    pub fn set_event_buffer(&mut self, global_addr: u32, size: EventSize) {
        self.io.write(offset::GEVNTADRLO0, global_addr);
        self.io.write(offset::GEVNTADRHI0, 0);
        self.io.write(offset::GEVNTSIZ0, size.bits());
        self.io.write(offset::GEVNTCOUNT0, 0);
    }

    /// Event buffer size register
    pub fn event_size(&self) -> EventSize {
        EventSize::from_bits_retain(self.io.read(offset::GEVNTSIZ0))
    }

    /// Mask or unmask the event interrupt
    pub fn mask_event_interrupt(&mut self, masked: bool) {
        if masked {
            self.io.set_bits(offset::GEVNTSIZ0, EventSize::INTMASK.bits());
        } else {
            self.io.clear_bits(offset::GEVNTSIZ0, EventSize::INTMASK.bits());
        }
    }

    /// Bytes of unprocessed events
    pub fn event_count(&self) -> u32 {
        self.io.read(offset::GEVNTCOUNT0) & EVENT_COUNT_MASK
    }

    /// Tell the controller `bytes` of events were consumed
    pub fn ack_events(&mut self, bytes: u32) {
        self.io.write(offset::GEVNTCOUNT0, bytes);
    }

    /// Load the parameter registers of an endpoint command group
    pub fn write_ep_params(&mut self, phy: usize, params: CommandParams) {
        self.io.write(offset::depcmdpar2(phy), params.param2);
        self.io.write(offset::depcmdpar1(phy), params.param1);
        self.io.write(offset::depcmdpar0(phy), params.param0);
    }

    /// Write an endpoint command register
    pub fn write_ep_cmd(&mut self, phy: usize, cmd: DepCmd) {
        self.io.write(offset::depcmd(phy), cmd.bits());
    }

    /// Read back an endpoint command register
    pub fn ep_cmd(&self, phy: usize) -> DepCmd {
        DepCmd::from_bits(self.io.read(offset::depcmd(phy)))
    }

    /// Write the generic command parameter and command registers
    pub fn write_generic_cmd(&mut self, param: u32, cmd: u32) {
        self.io.write(offset::DGCMDPAR, param);
        self.io.write(offset::DGCMD, cmd);
    }

    /// Read back the generic command register
    pub fn generic_cmd(&self) -> u32 {
        self.io.read(offset::DGCMD)
    }
}
