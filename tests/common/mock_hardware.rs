//! Register-level model of a DWC3 device controller
//!
//! Simulates the parts of the controller the driver polls on: endpoint and
//! generic command completion, core soft reset, run/stop halting, link state
//! requests and the event buffer count register. Every endpoint command is
//! logged so tests can assert on the exact sequence.

use std::cell::RefCell;
use std::rc::Rc;

use core::sync::atomic::Ordering;

use dwc3_usbd::dma::{DmaRegion, Platform, EVENT_BUFFER_SIZE};
use dwc3_usbd::dwc3::{
    offset, Dctl, DepCmd, Dsts, EpCommand, GenericCommand, LinkState, RegisterIo,
};
use dwc3_usbd::{DeviceBus, Direction, SetupPacket, UsbDeviceHandler};
use embedded_hal::delay::DelayNs;

/// GSNPSID of a 3.30a core
pub const SNPSID: u32 = 0x5533_330A;

/// GHWPARAMS3: 8 device endpoints, 4 IN, UTMI+ PHY
pub const HWPARAMS3: u32 = (4 << 18) | (8 << 12) | (1 << 2);

/// One endpoint command as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    /// Physical endpoint
    pub phy: usize,
    /// Command word as written
    pub cmd: DepCmd,
    /// DEPCMDPAR0
    pub param0: u32,
    /// DEPCMDPAR1
    pub param1: u32,
    /// DEPCMDPAR2
    pub param2: u32,
    /// DCFG when the command was written
    pub dcfg: u32,
    /// GUSB2PHYCFG0 when the command was written
    pub phycfg: u32,
}

impl CommandRecord {
    /// Decoded opcode
    pub fn command(&self) -> Option<EpCommand> {
        self.cmd.command()
    }
}

struct Model {
    regs: heapless::FnvIndexMap<usize, u32, 128>,
    commands: heapless::Vec<CommandRecord, 128>,
    generic: heapless::Vec<(u32, u32), 8>,
    statuses: heapless::Deque<u8, 16>,
    hang: bool,
    stuck_soft_reset: bool,
    next_resource: u8,
    dma: &'static DmaRegion,
    write_pos: usize,
    pending: u32,
    raise_on_ack: heapless::Vec<u32, 8>,
}

impl Model {
    fn reg(&self, reg: usize) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn store(&mut self, reg: usize, value: u32) {
        self.regs.insert(reg, value).ok();
    }

    fn raise(&mut self, word: u32) {
        self.dma.events()[self.write_pos / 4].store(word, Ordering::Release);
        self.write_pos = (self.write_pos + 4) % EVENT_BUFFER_SIZE;
        self.pending += 4;
    }

    fn endpoint_command(&mut self, phy: usize, value: u32) -> u32 {
        let record = CommandRecord {
            phy,
            cmd: DepCmd::from_bits(value),
            param0: self.reg(offset::depcmdpar0(phy)),
            param1: self.reg(offset::depcmdpar1(phy)),
            param2: self.reg(offset::depcmdpar2(phy)),
            dcfg: self.reg(offset::DCFG),
            phycfg: self.reg(offset::GUSB2PHYCFG0),
        };
        self.commands.push(record).ok();

        if value & DepCmd::CMDACT == 0 || self.hang {
            return value;
        }
        let status = u32::from(self.statuses.pop_front().unwrap_or(0));
        let mut done = (value & !(DepCmd::CMDACT | (0xF << 12))) | (status << 12);
        if status == 0 && record.command() == Some(EpCommand::StartTransfer) {
            done = (done & 0xFFFF) | (u32::from(self.next_resource) << 16);
            self.next_resource = self.next_resource.wrapping_add(1) & 0x7F;
        }
        done
    }

    fn device_control(&mut self, value: u32) -> u32 {
        let previous = Dctl::from_bits_retain(self.reg(offset::DCTL));
        let mut dctl = Dctl::from_bits_retain(value);

        if dctl.contains(Dctl::CSFTRST) && !self.stuck_soft_reset {
            dctl.remove(Dctl::CSFTRST);
        }

        let mut dsts = Dsts::from_bits_retain(self.reg(offset::DSTS));
        dsts.set(Dsts::DEVCTRLHLT, !dctl.contains(Dctl::RUN_STOP));
        if dctl.link_request() != previous.link_request() && dctl.link_request() != 0 {
            dsts = Dsts::from_bits_retain(
                (dsts.bits() & !Dsts::USBLNKST_MASK.bits()) | (dctl.link_request() << 18),
            );
        }
        self.store(offset::DSTS, dsts.bits());
        dctl.bits()
    }
}

/// Fake DWC3 register block
///
/// Clones share state: keep one in the test, move one into the core.
#[derive(Clone)]
pub struct FakeRegisters {
    model: Rc<RefCell<Model>>,
}

impl FakeRegisters {
    /// A device-capable core bound to `dma`, halted, link on
    pub fn new(dma: &'static DmaRegion) -> Self {
        let mut model = Model {
            regs: heapless::FnvIndexMap::new(),
            commands: heapless::Vec::new(),
            generic: heapless::Vec::new(),
            statuses: heapless::Deque::new(),
            hang: false,
            stuck_soft_reset: false,
            next_resource: 1,
            dma,
            write_pos: 0,
            pending: 0,
            raise_on_ack: heapless::Vec::new(),
        };
        model.store(offset::GSNPSID, SNPSID);
        model.store(offset::ghwparams(0), 0x2);
        model.store(offset::ghwparams(3), HWPARAMS3);
        model.store(offset::DSTS, Dsts::DEVCTRLHLT.bits());
        Self { model: Rc::new(RefCell::new(model)) }
    }

    /// Set a register without side effects
    pub fn poke(&self, reg: usize, value: u32) {
        self.model.borrow_mut().store(reg, value);
    }

    /// Read a register without side effects
    pub fn peek(&self, reg: usize) -> u32 {
        self.model.borrow().reg(reg)
    }

    /// Report `state` in DSTS
    pub fn set_link_state(&self, state: LinkState) {
        let mut model = self.model.borrow_mut();
        let dsts = model.reg(offset::DSTS);
        model.store(
            offset::DSTS,
            (dsts & !Dsts::USBLNKST_MASK.bits()) | (state.bits() << 18),
        );
    }

    /// Complete the next endpoint commands with these status codes, in order
    pub fn script_statuses(&self, statuses: &[u8]) {
        let mut model = self.model.borrow_mut();
        for &status in statuses {
            model.statuses.push_back(status).ok();
        }
    }

    /// Commands never complete
    pub fn hang_commands(&self) {
        self.model.borrow_mut().hang = true;
    }

    /// CSFTRST never self-clears
    pub fn stick_soft_reset(&self) {
        self.model.borrow_mut().stuck_soft_reset = true;
    }

    /// Endpoint commands seen so far
    pub fn commands(&self) -> heapless::Vec<CommandRecord, 128> {
        self.model.borrow().commands.clone()
    }

    /// Endpoint commands with opcode `cmd`
    pub fn commands_of(&self, cmd: EpCommand) -> heapless::Vec<CommandRecord, 128> {
        self.model
            .borrow()
            .commands
            .iter()
            .filter(|record| record.command() == Some(cmd))
            .copied()
            .collect()
    }

    /// Most recent endpoint command
    pub fn last_command(&self) -> Option<CommandRecord> {
        self.model.borrow().commands.last().copied()
    }

    /// Forget logged commands
    pub fn clear_commands(&self) {
        self.model.borrow_mut().commands.clear();
    }

    /// Generic commands seen so far, as (command, parameter)
    pub fn generic_commands(&self) -> heapless::Vec<(u32, u32), 8> {
        self.model.borrow().generic.clone()
    }

    /// Append event words to the buffer and bump the count
    pub fn raise_events(&self, words: &[u32]) {
        let mut model = self.model.borrow_mut();
        for &word in words {
            model.raise(word);
        }
    }

    /// Append these words when the driver acknowledges its first event
    pub fn raise_on_first_ack(&self, words: &[u32]) {
        let mut model = self.model.borrow_mut();
        for &word in words {
            model.raise_on_ack.push(word).ok();
        }
    }

    /// Move the hardware write position (buffer wrap tests)
    pub fn set_write_position(&self, byte_offset: usize) {
        self.model.borrow_mut().write_pos = byte_offset % EVENT_BUFFER_SIZE;
    }

    /// Unacknowledged event bytes
    pub fn pending_bytes(&self) -> u32 {
        self.model.borrow().pending
    }
}

impl RegisterIo for FakeRegisters {
    fn read(&self, reg: usize) -> u32 {
        let mut model = self.model.borrow_mut();
        if reg == offset::GEVNTCOUNT0 {
            return model.pending;
        }
        let value = model.reg(reg);
        if reg == offset::DSTS && Dsts::from_bits_retain(value).link_state() == LinkState::Recovery {
            // Resume signalling ends after one observation
            model.store(reg, value & !Dsts::USBLNKST_MASK.bits());
        }
        value
    }

    fn write(&mut self, reg: usize, value: u32) {
        let mut model = self.model.borrow_mut();

        if let Some(phy) = (0..8).find(|&phy| offset::depcmd(phy) == reg) {
            let done = model.endpoint_command(phy, value);
            model.store(reg, done);
            return;
        }

        match reg {
            offset::DCTL => {
                let dctl = model.device_control(value);
                model.store(reg, dctl);
            }
            offset::DGCMD => {
                let param = model.reg(offset::DGCMDPAR);
                model.generic.push((value & 0xFF, param)).ok();
                let done = if model.hang {
                    value
                } else {
                    value & !GenericCommand::CMDACT
                };
                model.store(reg, done);
            }
            offset::GEVNTCOUNT0 => {
                if value == 0 {
                    model.pending = 0;
                    model.write_pos = 0;
                    return;
                }
                model.pending = model.pending.saturating_sub(value);
                let late = core::mem::take(&mut model.raise_on_ack);
                for word in late {
                    model.raise(word);
                }
            }
            _ => model.store(reg, value),
        }
    }
}

/// Platform recording cache maintenance and delays
#[derive(Debug, Default)]
pub struct FakePlatform {
    /// Ranges cleaned, as (address, length)
    pub cleaned: heapless::Vec<(usize, usize), 256>,
    /// Ranges invalidated
    pub invalidated: heapless::Vec<(usize, usize), 256>,
    /// Total busy-wait time
    pub delayed_ns: u64,
}

impl FakePlatform {
    /// Whether a clean covered `addr`
    pub fn was_cleaned(&self, addr: usize) -> bool {
        self.cleaned
            .iter()
            .any(|&(start, len)| addr >= start && addr < start + len.max(1))
    }

    /// Whether an invalidate covered `addr`
    pub fn was_invalidated(&self, addr: usize) -> bool {
        self.invalidated
            .iter()
            .any(|&(start, len)| addr >= start && addr < start + len.max(1))
    }
}

impl DelayNs for FakePlatform {
    fn delay_ns(&mut self, ns: u32) {
        self.delayed_ns += u64::from(ns);
    }
}

impl Platform for FakePlatform {
    fn clean_dcache(&mut self, addr: usize, len: usize) {
        self.cleaned.push((addr, len)).ok();
    }

    fn invalidate_dcache(&mut self, addr: usize, len: usize) {
        self.invalidated.push((addr, len)).ok();
    }

    fn to_global(&self, addr: usize) -> u32 {
        addr as u32
    }
}

/// Callback observed by [`RecordingHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    Reset,
    Connect,
    Disconnect,
    Setup(SetupPacket),
    DataIn(u8),
    DataOut(u8),
}

/// Reply hook for setup packets
pub type SetupHook = fn(&mut dyn DeviceBus, &SetupPacket);

/// Reply hook for data completions
pub type DataHook = fn(&mut dyn DeviceBus, u8);

/// Handler that records every callback and optionally replies
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: heapless::Vec<Callback, 64>,
    pub on_setup: Option<SetupHook>,
    pub on_data: Option<DataHook>,
    /// Bytes reported at each data callback
    pub lengths: heapless::Vec<u32, 64>,
}

fn observed_length(bus: &dyn DeviceBus, endpoint: u8) -> u32 {
    match endpoint & 0x7F {
        0 => bus.actual_length(),
        number => bus
            .transferred_bytes(number, Direction::from_address(endpoint))
            .unwrap_or(0),
    }
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replying(on_setup: SetupHook) -> Self {
        Self { on_setup: Some(on_setup), ..Self::default() }
    }
}

impl UsbDeviceHandler for RecordingHandler {
    fn on_reset(&mut self, _bus: &mut dyn DeviceBus) {
        self.calls.push(Callback::Reset).ok();
    }

    fn on_connect(&mut self, _bus: &mut dyn DeviceBus) {
        self.calls.push(Callback::Connect).ok();
    }

    fn on_disconnect(&mut self, _bus: &mut dyn DeviceBus) {
        self.calls.push(Callback::Disconnect).ok();
    }

    fn on_setup_received(&mut self, bus: &mut dyn DeviceBus, setup: &SetupPacket) {
        self.calls.push(Callback::Setup(*setup)).ok();
        if let Some(hook) = self.on_setup {
            hook(bus, setup);
        }
    }

    fn on_data_in(&mut self, bus: &mut dyn DeviceBus, endpoint: u8) {
        self.calls.push(Callback::DataIn(endpoint)).ok();
        self.lengths.push(observed_length(bus, endpoint)).ok();
        if let Some(hook) = self.on_data {
            hook(bus, endpoint);
        }
    }

    fn on_data_out(&mut self, bus: &mut dyn DeviceBus, endpoint: u8) {
        self.calls.push(Callback::DataOut(endpoint)).ok();
        self.lengths.push(observed_length(bus, endpoint)).ok();
        if let Some(hook) = self.on_data {
            hook(bus, endpoint);
        }
    }
}
