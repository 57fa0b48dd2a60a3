//! Shared test utilities for dwc3-usbd tests
//!
//! Builders for a core or a running device on top of the register model in
//! [`mock_hardware`], plus event-word and setup-packet helpers.

#![allow(dead_code)]

pub mod mock_hardware;

use core::sync::atomic::Ordering;

pub use mock_hardware::{
    Callback, CommandRecord, FakePlatform, FakeRegisters, RecordingHandler,
};

use dwc3_usbd::dwc3::event::{device_event_word, endpoint_event_word};
use dwc3_usbd::{DmaBuffer, DmaRegion, Dwc3Config, Dwc3Core, LinkState, UsbDevice};

pub type TestCore = Dwc3Core<'static, FakeRegisters, FakePlatform>;
pub type TestDevice = UsbDevice<'static, FakeRegisters, FakePlatform, RecordingHandler>;

// Device event types
pub const DISCONNECT: u8 = 0;
pub const RESET: u8 = 1;
pub const CONNECT_DONE: u8 = 2;
pub const LINK_CHANGE: u8 = 3;

// Endpoint event types
pub const XFER_COMPLETE: u8 = 1;
pub const XFER_IN_PROGRESS: u8 = 2;
pub const XFER_NOT_READY: u8 = 3;

// Control stages reported with transfer-not-ready
pub const STAGE_DATA: u8 = 1;
pub const STAGE_STATUS: u8 = 2;

/// Hardware side of a test setup
pub struct Rig {
    pub hw: FakeRegisters,
    pub dma: &'static DmaRegion,
}

impl Rig {
    /// Write a setup packet where the controller would put it
    pub fn write_setup(&self, bytes: [u8; 8]) {
        let words = self.dma.setup_words();
        words[0].store(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Ordering::Release,
        );
        words[1].store(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            Ordering::Release,
        );
    }

    /// Complete the EP0 TRB with `remaining` bytes left over
    pub fn complete_ep0_trb(&self, remaining: u32) {
        let trb = self.dma.ep0_trb();
        trb.size.store(remaining, Ordering::Release);
        trb.ctrl.fetch_and(!1, Ordering::Release);
    }

    /// Complete ring slot `slot` of physical endpoint `phy`
    pub fn complete_ring_trb(&self, phy: usize, slot: usize, remaining: u32) {
        let trb = self.dma.ring(phy).slot(slot);
        trb.size.store(remaining, Ordering::Release);
        trb.ctrl.fetch_and(!1, Ordering::Release);
    }
}

/// Retry budgets small enough to keep timeout tests fast
pub fn test_config() -> Dwc3Config {
    Dwc3Config::new()
        .command_retries(16)
        .generic_command_retries(16)
        .run_stop_retries(16)
        .soft_reset_retries(16)
        .link_state_retries(16)
        .wakeup_retries(16)
}

/// A core over a fresh register model, not initialized
pub fn new_core() -> (TestCore, Rig) {
    core_with_config(test_config())
}

/// A core over a fresh register model with `config`
pub fn core_with_config(config: Dwc3Config) -> (TestCore, Rig) {
    let dma: &'static DmaRegion = Box::leak(Box::new(DmaRegion::new()));
    let hw = FakeRegisters::new(dma);
    let core = Dwc3Core::new(hw.clone(), FakePlatform::default(), dma, config);
    (core, Rig { hw, dma })
}

/// An initialized core with an empty command log
pub fn initialized_core() -> (TestCore, Rig) {
    let (mut core, rig) = new_core();
    core.init().expect("init");
    rig.hw.clear_commands();
    (core, rig)
}

/// A device that has been reset and enumerated at high speed, SETUP armed
pub fn running_device(handler: RecordingHandler) -> (TestDevice, Rig) {
    let (core, rig) = new_core();
    let mut device = UsbDevice::new(core, handler);
    device.init().expect("init");
    device.connect().expect("connect");

    rig.hw.raise_events(&[device_event(RESET), device_event(CONNECT_DONE)]);
    device.on_interrupt();

    rig.hw.clear_commands();
    device.handler_mut().calls.clear();
    (device, rig)
}

pub fn device_event(kind: u8) -> u32 {
    device_event_word(kind, 0)
}

pub fn link_event(state: LinkState) -> u32 {
    device_event_word(LINK_CHANGE, state.bits() as u16)
}

pub fn ep_event(phy: u8, kind: u8, status: u8) -> u32 {
    endpoint_event_word(phy, kind, status)
}

/// Buffer that outlives the test
pub fn leak_buffer(len: usize) -> DmaBuffer {
    DmaBuffer::from_static(Box::leak(vec![0u8; len].into_boxed_slice()))
}

/// Buffer filled with `bytes`
pub fn buffer_with(bytes: &[u8]) -> DmaBuffer {
    DmaBuffer::from_static(Box::leak(bytes.to_vec().into_boxed_slice()))
}
