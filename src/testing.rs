//! Fakes shared by the unit tests

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;

use crate::config::Dwc3Config;
use crate::controller::Dwc3Core;
use crate::dma::{DmaBuffer, DmaRegion, Platform};
use crate::dwc3::command::{DepCmd, EpCommand, GenericCommand};
use crate::dwc3::{offset, RegisterIo, MAX_PHYSICAL_ENDPOINTS};

#[derive(Default)]
struct FakeState {
    regs: HashMap<usize, u32>,
    status: u32,
    hang: bool,
}

/// Register file that completes commands as soon as they are written
///
/// Clones share the same registers, so a test keeps one handle for
/// inspection after moving another into the core.
#[derive(Clone, Default)]
pub struct FakeIo {
    state: Rc<RefCell<FakeState>>,
}

impl FakeIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, reg: usize, value: u32) {
        self.state.borrow_mut().regs.insert(reg, value);
    }

    pub fn get(&self, reg: usize) -> u32 {
        self.state.borrow().regs.get(&reg).copied().unwrap_or(0)
    }

    /// Every following command completes with `status`
    pub fn complete_commands_with(&self, status: u32) {
        self.state.borrow_mut().status = status & 0xF;
    }

    /// Commands stay active forever
    pub fn hang_commands(&self) {
        self.state.borrow_mut().hang = true;
    }

    fn depcmd_phy(reg: usize) -> Option<usize> {
        (0..MAX_PHYSICAL_ENDPOINTS).find(|&phy| offset::depcmd(phy) == reg)
    }
}

impl RegisterIo for FakeIo {
    fn read(&self, reg: usize) -> u32 {
        self.get(reg)
    }

    fn write(&mut self, reg: usize, value: u32) {
        let mut state = self.state.borrow_mut();
        let mut value = value;

        if let Some(phy) = Self::depcmd_phy(reg) {
            if value & DepCmd::CMDACT != 0 && !state.hang {
                value &= !(DepCmd::CMDACT | (0xF << 12));
                value |= state.status << 12;
                let started = DepCmd::from_bits(value).command() == Some(EpCommand::StartTransfer);
                if started && state.status == 0 {
                    value = (value & 0xFFFF) | ((phy as u32 + 1) << 16);
                }
            }
        } else if reg == offset::DGCMD && value & GenericCommand::CMDACT != 0 && !state.hang {
            value &= !(GenericCommand::CMDACT | (0xF << 12));
            value |= state.status << 12;
        }

        state.regs.insert(reg, value);
    }
}

/// Platform that only counts cache operations
#[derive(Debug, Default)]
pub struct NullPlatform {
    pub cleaned: usize,
    pub invalidated: usize,
    pub delayed_ns: u64,
}

impl DelayNs for NullPlatform {
    fn delay_ns(&mut self, ns: u32) {
        self.delayed_ns += u64::from(ns);
    }
}

impl Platform for NullPlatform {
    fn clean_dcache(&mut self, _addr: usize, _len: usize) {
        self.cleaned += 1;
    }

    fn invalidate_dcache(&mut self, _addr: usize, _len: usize) {
        self.invalidated += 1;
    }

    fn to_global(&self, addr: usize) -> u32 {
        addr as u32
    }
}

/// Core over `io` with small polling budgets
pub fn core_with(io: FakeIo) -> Dwc3Core<'static, FakeIo, NullPlatform> {
    let dma: &'static DmaRegion = Box::leak(Box::new(DmaRegion::new()));
    let config = Dwc3Config::new()
        .command_retries(4)
        .generic_command_retries(4)
        .run_stop_retries(4)
        .soft_reset_retries(4)
        .link_state_retries(4)
        .wakeup_retries(4);
    Dwc3Core::new(io, NullPlatform::default(), dma, config)
}

/// Buffer that outlives the test
pub fn leak_buffer(len: usize) -> DmaBuffer {
    DmaBuffer::from_static(Box::leak(vec![0u8; len].into_boxed_slice()))
}
