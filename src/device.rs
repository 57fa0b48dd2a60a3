//! Device-side event processing and the upper-layer interface
//!
//! [`UsbDevice`] pairs a [`Dwc3Core`] with a [`UsbDeviceHandler`]. The
//! interrupt handler calls [`UsbDevice::on_interrupt`], which drains the event
//! buffer in FIFO order and turns each word into core state changes and
//! handler callbacks. Callbacks receive the core as a [`DeviceBus`] so they
//! can queue the next transfer from inside the notification.
//!
//! # Example
//!
//! ```ignore
//! static USB_DMA: DmaRegion = DmaRegion::new();
//!
//! let io = unsafe { Mmio::new(0x4820_0000) };
//! let core = Dwc3Core::new(io, platform, &USB_DMA, Dwc3Config::default());
//! let mut device = UsbDevice::new(core, MyClass::new());
//! device.init()?;
//! device.connect()?;
//!
//! // USB interrupt
//! device.on_interrupt();
//! ```

use core::sync::atomic::Ordering;

use crate::config::DeviceSpeed;
use crate::controller::Dwc3Core;
use crate::dma::{DmaBuffer, Platform, EVENT_BUFFER_SIZE};
use crate::dwc3::{
    Dcfg, Dctl, DeviceEvent, DeviceEventKind, EndpointEvent, EndpointEventKind, Event,
    LinkState, RegisterIo,
};
use crate::endpoint::PhysicalEndpoint;
use crate::error::Result;
use crate::transfer::control::Ep0Action;
use crate::transfer::{DeviceState, Direction, Ep0State, EndpointType, SetupPacket};

/// Transfer and endpoint operations available to the upper layer
///
/// Object safe; callbacks receive it as `&mut dyn DeviceBus`.
pub trait DeviceBus {
    /// Most recent setup packet
    fn setup_packet(&self) -> SetupPacket;

    /// Chapter 9 device state
    fn device_state(&self) -> DeviceState;

    /// Speed negotiated at connection done
    fn speed(&self) -> Option<DeviceSpeed>;

    /// Bytes moved by the last EP0 data stage
    fn actual_length(&self) -> u32;

    /// Bytes moved by the last completion on an endpoint
    fn transferred_bytes(&self, number: u8, direction: Direction) -> Result<u32>;

    /// Start the IN data stage of the current control transfer
    fn ep0_send(&mut self, buffer: DmaBuffer, len: u32) -> Result<()>;

    /// Start the OUT data stage of the current control transfer
    fn ep0_recv(&mut self, buffer: DmaBuffer, len: u32) -> Result<()>;

    /// Reject the current control request
    fn ep0_stall(&mut self) -> Result<()>;

    /// Queue a bulk or interrupt IN transfer
    fn bulk_send(&mut self, number: u8, direction: Direction, buffer: DmaBuffer, len: u32)
        -> Result<()>;

    /// Queue a bulk or interrupt OUT transfer
    fn bulk_recv(&mut self, number: u8, direction: Direction, buffer: DmaBuffer, len: u32)
        -> Result<()>;

    /// Configure and enable an endpoint
    fn endpoint_create(
        &mut self,
        ep_type: EndpointType,
        number: u8,
        direction: Direction,
        max_packet: u16,
        interval: u8,
    ) -> Result<()>;

    /// Disable an endpoint
    fn endpoint_disable(&mut self, number: u8, direction: Direction) -> Result<()>;

    /// Halt an endpoint
    fn endpoint_stall(&mut self, number: u8, direction: Direction) -> Result<()>;

    /// Clear an endpoint halt
    fn endpoint_clear_stall(&mut self, number: u8, direction: Direction) -> Result<()>;

    /// End the transfer in flight on an endpoint
    fn stop_transfer(&mut self, number: u8, direction: Direction, force: bool) -> Result<()>;

    /// Mark a configuration as selected or deselected
    fn set_configured(&mut self, configured: bool);
}

impl<'a, R: RegisterIo, P: Platform> DeviceBus for Dwc3Core<'a, R, P> {
    fn setup_packet(&self) -> SetupPacket {
        self.setup
    }

    fn device_state(&self) -> DeviceState {
        self.device_state
    }

    fn speed(&self) -> Option<DeviceSpeed> {
        self.speed
    }

    fn actual_length(&self) -> u32 {
        self.actual_length
    }

    fn transferred_bytes(&self, number: u8, direction: Direction) -> Result<u32> {
        Dwc3Core::transferred_bytes(self, number, direction)
    }

    fn ep0_send(&mut self, buffer: DmaBuffer, len: u32) -> Result<()> {
        Dwc3Core::ep0_send(self, buffer, len)
    }

    fn ep0_recv(&mut self, buffer: DmaBuffer, len: u32) -> Result<()> {
        Dwc3Core::ep0_recv(self, buffer, len)
    }

    fn ep0_stall(&mut self) -> Result<()> {
        Dwc3Core::ep0_stall(self)
    }

    fn bulk_send(
        &mut self,
        number: u8,
        direction: Direction,
        buffer: DmaBuffer,
        len: u32,
    ) -> Result<()> {
        Dwc3Core::bulk_send(self, number, direction, buffer, len)
    }

    fn bulk_recv(
        &mut self,
        number: u8,
        direction: Direction,
        buffer: DmaBuffer,
        len: u32,
    ) -> Result<()> {
        Dwc3Core::bulk_recv(self, number, direction, buffer, len)
    }

    fn endpoint_create(
        &mut self,
        ep_type: EndpointType,
        number: u8,
        direction: Direction,
        max_packet: u16,
        interval: u8,
    ) -> Result<()> {
        Dwc3Core::endpoint_create(self, ep_type, number, direction, max_packet, interval)
    }

    fn endpoint_disable(&mut self, number: u8, direction: Direction) -> Result<()> {
        Dwc3Core::endpoint_disable(self, number, direction)
    }

    fn endpoint_stall(&mut self, number: u8, direction: Direction) -> Result<()> {
        Dwc3Core::endpoint_stall(self, number, direction)
    }

    fn endpoint_clear_stall(&mut self, number: u8, direction: Direction) -> Result<()> {
        Dwc3Core::endpoint_clear_stall(self, number, direction)
    }

    fn stop_transfer(&mut self, number: u8, direction: Direction, force: bool) -> Result<()> {
        Dwc3Core::stop_transfer(self, number, direction, force)
    }

    fn set_configured(&mut self, configured: bool) {
        Dwc3Core::set_configured(self, configured)
    }
}

/// Upper-layer callbacks
///
/// Invoked synchronously from [`UsbDevice::on_interrupt`]; implementations
/// must not block.
pub trait UsbDeviceHandler {
    /// Bus reset; the device is back at address 0
    fn on_reset(&mut self, _bus: &mut dyn DeviceBus) {}

    /// Speed enumeration finished
    fn on_connect(&mut self, _bus: &mut dyn DeviceBus) {}

    /// Host went away
    fn on_disconnect(&mut self, _bus: &mut dyn DeviceBus) {}

    /// A setup packet arrived on EP0
    ///
    /// For requests with a data stage, start it with
    /// [`DeviceBus::ep0_send`] or [`DeviceBus::ep0_recv`]; the status stage
    /// is driven by the controller.
    fn on_setup_received(&mut self, _bus: &mut dyn DeviceBus, _setup: &SetupPacket) {}

    /// IN transfer finished; `endpoint` is the address (bit 7 set)
    fn on_data_in(&mut self, _bus: &mut dyn DeviceBus, _endpoint: u8) {}

    /// OUT transfer finished; `endpoint` is the address
    fn on_data_out(&mut self, _bus: &mut dyn DeviceBus, _endpoint: u8) {}
}

impl<'a, R: RegisterIo, P: Platform> Dwc3Core<'a, R, P> {
    /// Host disconnected: abort EP0 and forget the connection
    pub(crate) fn handle_disconnect(&mut self) {
        self.abort_control();
        self.device_state = DeviceState::NotAttached;
        self.ep0_state = Ep0State::Unconnected;
        self.link_state = LinkState::Disconnected;
        self.speed = None;
    }

    /// Bus reset: back to the default state at address 0
    pub(crate) fn handle_reset(&mut self) {
        self.regs.modify_dctl(|dctl| dctl.difference(Dctl::TSTCTRL_MASK));
        self.abort_control();
        self.clear_all_stalls();
        self.reset_endpoints();
        self.config_done = false;
        self.regs.modify_dcfg(|dcfg| dcfg.with_address(0));

        self.device_state = DeviceState::Default;
        self.ep0_state = Ep0State::Setup;
        #[cfg(feature = "defmt")]
        defmt::debug!("bus reset");
    }

    /// Speed enumeration done: enable LPM, start a new connection
    pub(crate) fn handle_connect_done(&mut self) {
        let speed = DeviceSpeed::from_dsts(self.regs.dsts().connect_speed());
        self.speed = speed;
        self.regs.modify_dcfg(|dcfg| dcfg | Dcfg::LPM_CAP);
        self.regs.modify_dctl(|dctl| dctl | Dctl::HIRD_THRES_MASK);
        self.config_done = false;
        self.link_state = LinkState::On;

        #[cfg(feature = "defmt")]
        defmt::info!("connected at {}", speed);
    }

    /// Cache a new link state
    pub(crate) fn handle_link_state(&mut self, state: LinkState) {
        self.link_state = state;
        match state {
            LinkState::L2 | LinkState::EarlySuspend => {
                if matches!(
                    self.device_state,
                    DeviceState::Default | DeviceState::Address | DeviceState::Configured
                ) {
                    self.resume_state = self.device_state;
                    self.device_state = DeviceState::Suspended;
                }
            }
            LinkState::On => {
                if self.device_state == DeviceState::Suspended {
                    self.device_state = self.resume_state;
                }
            }
            _ => {}
        }
        #[cfg(feature = "defmt")]
        defmt::trace!("link state {}", state);
    }
}

/// A DWC3 device controller driving a class implementation
pub struct UsbDevice<'a, R, P, H> {
    core: Dwc3Core<'a, R, P>,
    handler: H,
}

impl<'a, R: RegisterIo, P: Platform, H: UsbDeviceHandler> UsbDevice<'a, R, P, H> {
    /// Pair a core with a handler
    pub fn new(core: Dwc3Core<'a, R, P>, handler: H) -> Self {
        Self { core, handler }
    }

    /// Bring the controller up
    pub fn init(&mut self) -> Result<()> {
        self.core.init()
    }

    /// Attach to the bus
    pub fn connect(&mut self) -> Result<()> {
        self.core.connect()
    }

    /// Detach from the bus
    pub fn disconnect(&mut self) {
        self.core.disconnect()
    }

    /// Controller core
    pub fn core(&self) -> &Dwc3Core<'a, R, P> {
        &self.core
    }

    /// Mutable controller core
    pub fn core_mut(&mut self) -> &mut Dwc3Core<'a, R, P> {
        &mut self.core
    }

    /// Class handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable class handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Split into core and handler
    pub fn into_parts(self) -> (Dwc3Core<'a, R, P>, H) {
        (self.core, self.handler)
    }

    /// Process every pending event
    ///
    /// The count read on entry is drained completely; the count is then read
    /// once more and that batch drained too, so events raised while the first
    /// batch was processed do not wait for another interrupt.
    pub fn on_interrupt(&mut self) {
        let pending = self.core.regs.event_count();
        if pending == 0 {
            self.core.stats.record_interrupt(true);
            #[cfg(feature = "defmt")]
            defmt::warn!("interrupt with no pending events");
            return;
        }
        self.core.stats.record_interrupt(false);

        self.core.regs.mask_event_interrupt(true);
        self.drain(pending);

        let late = self.core.regs.event_count();
        if late != 0 {
            self.drain(late);
        }
        self.core.regs.mask_event_interrupt(false);
    }

    fn drain(&mut self, mut pending: u32) {
        self.core
            .platform
            .invalidate_dcache(self.core.dma.events_addr(), EVENT_BUFFER_SIZE);

        while pending >= 4 {
            let word = self.core.dma.events()[self.core.events.word_index()].load(Ordering::Acquire);
            let event = Event::decode(word);

            if let Err(_err) = self.dispatch(event) {
                #[cfg(feature = "defmt")]
                defmt::error!("event {:#010x} failed: {}", word, _err);
            }

            self.core.events.advance();
            pending -= 4;
            self.core.regs.ack_events(4);
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Device(event) => {
                self.core.stats.record_event(true);
                self.handle_device_event(event)
            }
            Event::Endpoint(event) => {
                self.core.stats.record_event(false);
                self.handle_endpoint_event(event)
            }
        }
    }

    fn handle_device_event(&mut self, event: DeviceEvent) -> Result<()> {
        match event.kind {
            DeviceEventKind::Disconnect => {
                self.core.handle_disconnect();
                self.handler.on_disconnect(&mut self.core);
            }
            DeviceEventKind::Reset => {
                self.core.handle_reset();
                self.handler.on_reset(&mut self.core);
            }
            DeviceEventKind::ConnectDone => {
                self.core.handle_connect_done();
                self.handler.on_connect(&mut self.core);
                self.core.prepare_setup()?;
            }
            DeviceEventKind::LinkStatusChange => {
                self.core.handle_link_state(event.link_state());
            }
            DeviceEventKind::Wakeup => {
                self.core.handle_link_state(event.link_state());
                #[cfg(feature = "defmt")]
                defmt::debug!("wakeup");
            }
            DeviceEventKind::HibernationRequest => {
                #[cfg(feature = "defmt")]
                defmt::debug!("hibernation request ignored");
            }
            _other => {
                #[cfg(feature = "defmt")]
                defmt::trace!("device event {} ignored", _other);
            }
        }
        Ok(())
    }

    fn handle_endpoint_event(&mut self, event: EndpointEvent) -> Result<()> {
        let phy = PhysicalEndpoint::from_index(usize::from(event.phy))?;
        if !self.core.endpoint(phy).is_enabled() {
            #[cfg(feature = "defmt")]
            defmt::warn!("event for disabled ep{} dropped", phy.index());
            return Ok(());
        }

        if phy.is_control() {
            match self.core.handle_ep0_event(event)? {
                Ep0Action::SetupReceived => {
                    let setup = self.core.setup;
                    self.handler.on_setup_received(&mut self.core, &setup);
                }
                Ep0Action::DataIn => self.handler.on_data_in(&mut self.core, 0x80),
                Ep0Action::DataOut => self.handler.on_data_out(&mut self.core, 0x00),
                Ep0Action::None => {}
            }
            return Ok(());
        }

        match event.kind {
            EndpointEventKind::TransferInProgress => {
                if self.core.complete_ring_transfer(phy).is_some() {
                    match phy.direction() {
                        Direction::In => self.handler.on_data_in(&mut self.core, phy.address()),
                        Direction::Out => self.handler.on_data_out(&mut self.core, phy.address()),
                    }
                }
            }
            EndpointEventKind::TransferComplete => {
                self.core.endpoints[phy.index()].mark_idle();
            }
            _other => {
                #[cfg(feature = "defmt")]
                defmt::trace!("ep{} event {} ignored", phy.index(), _other);
            }
        }
        Ok(())
    }
}
