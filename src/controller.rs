//! DWC3 device controller core
//!
//! [`Dwc3Core`] owns the register block, the platform services and the
//! software state of every endpoint. Bring-up follows the controller
//! programming model:
//!
//! 1. Identify the core and read the hardware parameters
//! 2. Device soft reset, then PHY reset
//! 3. PHY interface, clock gating, frame length and burst configuration
//! 4. Port capability: device
//! 5. Event buffer, scratchpad, speed, control endpoints, event enables
//!
//! After [`Dwc3Core::init`] the controller is configured but not on the bus;
//! [`Dwc3Core::connect`] sets run/stop.

use core::task::Poll;

use crate::config::{timing, DeviceSpeed, Dwc3Config, PhyInterface};
use crate::dma::{DmaRegion, Platform, EVENT_BUFFER_SIZE};
use crate::dwc3::{
    poll_until, Dcfg, Dctl, Devten, Dsts, EventCursor, EventSize, Gctl, Gfladj, Gsbuscfg0,
    GenericCommand, HsPhyType, HwParams, LinkState, PhyCfg, RegisterIo, Registers,
    DWC3_PRODUCT_ID, DWC3_PRODUCT_ID_MASK, MAX_PHYSICAL_ENDPOINTS,
};
use crate::endpoint::{EndpointRecord, PhysicalEndpoint};
use crate::error::{Result, UsbError};
use crate::perf::DriverStats;
use crate::transfer::{DeviceState, Direction, Ep0State, EndpointType, SetupPacket};

/// Highest assignable USB device address
pub const MAX_DEVICE_ADDRESS: u16 = 127;

/// DWC3 device controller
pub struct Dwc3Core<'a, R, P> {
    pub(crate) regs: Registers<R>,
    pub(crate) platform: P,
    pub(crate) dma: &'a DmaRegion,
    pub(crate) config: Dwc3Config,
    pub(crate) endpoints: [EndpointRecord; MAX_PHYSICAL_ENDPOINTS],
    pub(crate) events: EventCursor,

    // Control endpoint
    pub(crate) setup: SetupPacket,
    pub(crate) ep0_state: Ep0State,
    pub(crate) three_stage: bool,
    pub(crate) data_direction: Direction,
    pub(crate) setup_pending: bool,
    pub(crate) actual_length: u32,

    pub(crate) device_state: DeviceState,
    /// State to return to when the link leaves suspend
    pub(crate) resume_state: DeviceState,
    pub(crate) link_state: LinkState,
    pub(crate) speed: Option<DeviceSpeed>,

    pub(crate) hwparams: HwParams,
    pub(crate) revision: u32,
    pub(crate) num_in_eps: u8,
    pub(crate) num_out_eps: u8,
    pub(crate) num_endpoints: usize,

    /// Start-config issued for the control group; never reset
    pub(crate) control_config_done: bool,
    /// Start-config issued for the non-control group in this connection
    pub(crate) config_done: bool,

    pub(crate) stats: DriverStats,
}

impl<'a, R: RegisterIo, P: Platform> Dwc3Core<'a, R, P> {
    /// Create a controller bound to a register block and DMA region
    ///
    /// Nothing is written to hardware until [`Dwc3Core::init`].
    pub fn new(io: R, platform: P, dma: &'a DmaRegion, config: Dwc3Config) -> Self {
        let endpoints = core::array::from_fn(|index| {
            EndpointRecord::new(
                PhysicalEndpoint::from_index(index).unwrap_or(PhysicalEndpoint::EP0_OUT),
            )
        });

        Self {
            regs: Registers::new(io),
            platform,
            dma,
            config,
            endpoints,
            events: EventCursor::new(),
            setup: SetupPacket::default(),
            ep0_state: Ep0State::Unconnected,
            three_stage: false,
            data_direction: Direction::Out,
            setup_pending: false,
            actual_length: 0,
            device_state: DeviceState::NotAttached,
            resume_state: DeviceState::Default,
            link_state: LinkState::Disconnected,
            speed: None,
            hwparams: HwParams::default(),
            revision: 0,
            num_in_eps: 0,
            num_out_eps: 0,
            num_endpoints: MAX_PHYSICAL_ENDPOINTS,
            control_config_done: false,
            config_done: false,
            stats: DriverStats::new(),
        }
    }

    /// Bring the controller up in device mode
    pub fn init(&mut self) -> Result<()> {
        self.identify()?;
        self.core_soft_reset()?;
        self.platform.delay_us(timing::SOFT_RESET_SETTLE_US);
        self.phy_reset();
        self.phy_setup();

        self.regs.modify_gctl(|gctl| gctl | Gctl::DSBLCLKGTNG);
        self.adjust_frame_length();
        self.regs
            .modify_sbuscfg0(|cfg| cfg | Gsbuscfg0::INCRBRSTENA | Gsbuscfg0::INCR16BRSTENA);
        self.regs
            .modify_gctl(|gctl| gctl.difference(Gctl::PRTCAPDIR_MASK) | Gctl::PRTCAP_DEVICE);

        if let Err(err) = self.device_init() {
            self.cleanup_event_buffer();
            #[cfg(feature = "defmt")]
            defmt::error!("device init failed: {}", err);
            return Err(err);
        }

        #[cfg(feature = "defmt")]
        defmt::info!(
            "dwc3 rev {:#x} ready: {} endpoints ({} in / {} out)",
            self.revision,
            self.num_endpoints,
            self.num_in_eps,
            self.num_out_eps
        );
        Ok(())
    }

    fn identify(&mut self) -> Result<()> {
        let id = self.regs.snpsid();
        if id & DWC3_PRODUCT_ID_MASK != DWC3_PRODUCT_ID {
            #[cfg(feature = "defmt")]
            defmt::error!("GSNPSID {:#x} is not a DWC3 core", id);
            return Err(UsbError::InvalidCore);
        }
        self.revision = id;

        let mut words = [0u32; 9];
        for (n, word) in words.iter_mut().enumerate() {
            *word = self.regs.hwparams(n);
        }
        self.hwparams = HwParams(words);

        if !self.hwparams.mode().supports_device() {
            return Err(UsbError::ModeMismatch);
        }
        Ok(())
    }

    fn core_soft_reset(&mut self) -> Result<()> {
        self.regs.modify_dctl(|dctl| dctl | Dctl::CSFTRST);

        let regs = &self.regs;
        poll_until(self.config.soft_reset_retries, UsbError::SoftResetTimeout, || {
            if regs.dctl().contains(Dctl::CSFTRST) {
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            }
        })
    }

    fn phy_reset(&mut self) {
        self.regs.modify_gctl(|gctl| gctl | Gctl::CORESOFTRESET);

        self.regs.modify_phy_cfg(|cfg| cfg | PhyCfg::PHYSOFTRST);
        self.platform.delay_us(timing::PHY_RESET_SETTLE_US);

        self.regs.modify_phy_cfg(|cfg| cfg.difference(PhyCfg::PHYSOFTRST));
        self.platform.delay_us(timing::PHY_RESET_SETTLE_US);

        self.regs.modify_gctl(|gctl| gctl.difference(Gctl::CORESOFTRESET));
    }

    fn phy_setup(&mut self) {
        let hsphy = self.hwparams.hsphy_type();
        let interface = self.config.phy_interface;

        self.regs.modify_phy_cfg(|mut cfg| {
            // Auto-resume must be off in device mode
            cfg.remove(PhyCfg::ULPIAUTORES);
            if hsphy == HsPhyType::UtmiUlpi {
                cfg.remove(PhyCfg::ULPI_UTMI);
            }

            match interface {
                PhyInterface::Utmi8 => cfg
                    .difference(PhyCfg::PHYIF)
                    .with_turnaround(PhyCfg::TURNAROUND_8BIT),
                PhyInterface::Utmi16 => cfg
                    .difference(PhyCfg::ULPI_UTMI)
                    .union(PhyCfg::PHYIF | PhyCfg::SUSPHY)
                    .with_turnaround(PhyCfg::TURNAROUND_16BIT),
            }
        });
    }

    fn adjust_frame_length(&mut self) {
        let wanted = u32::from(self.config.frame_length_adjust);
        let current = self.regs.fladj();
        if current.bits() & Gfladj::FLADJ_30MHZ_MASK.bits() == wanted {
            return;
        }
        let value = current.difference(Gfladj::FLADJ_30MHZ_MASK)
            | Gfladj::FLADJ_30MHZ_SDBND_SEL
            | Gfladj::from_bits_retain(wanted);
        self.regs.set_fladj(value);
    }

    fn device_init(&mut self) -> Result<()> {
        self.dma.clear_events();
        self.platform
            .clean_dcache(self.dma.events_addr(), EVENT_BUFFER_SIZE);
        let events = self.platform.to_global(self.dma.events_addr());
        self.regs
            .set_event_buffer(events, EventSize::with_size(EVENT_BUFFER_SIZE));
        self.events.reset();

        let total = self.hwparams.num_eps();
        let num_in = self.hwparams.num_in_eps().min(total);
        self.num_in_eps = num_in as u8;
        self.num_out_eps = (total - num_in) as u8;
        self.num_endpoints = (total as usize).min(MAX_PHYSICAL_ENDPOINTS);
        if self.num_endpoints < 2 {
            return Err(UsbError::InvalidCore);
        }

        let scratchpad = self.platform.to_global(self.dma.scratchpad_addr());
        self.send_generic_command(GenericCommand::SetScratchpadLo, scratchpad)?;
        self.send_generic_command(GenericCommand::SetScratchpadHi, 0)?;

        let speed = self.config.speed;
        self.regs.modify_dcfg(|dcfg| dcfg.with_speed(speed.dcfg_bits()));

        let mps = self.config.control_max_packet;
        self.endpoint_enable(0, Direction::Out, EndpointType::Control, mps, 0)?;
        self.endpoint_enable(0, Direction::In, EndpointType::Control, mps, 0)?;

        self.regs.set_devten(
            Devten::DISCONNEVTEN
                | Devten::USBRSTEVTEN
                | Devten::CONNECTDONEEVTEN
                | Devten::ULSTCNGEN,
        );
        Ok(())
    }

    fn cleanup_event_buffer(&mut self) {
        self.regs
            .set_event_buffer(0, EventSize::INTMASK | EventSize::with_size(0));
    }

    /// Set run/stop and wait for the controller to leave the halted state
    pub fn connect(&mut self) -> Result<()> {
        self.regs.modify_dctl(|dctl| dctl | Dctl::RUN_STOP);

        let regs = &self.regs;
        poll_until(self.config.run_stop_retries, UsbError::ControllerHalted, || {
            if regs.dsts().contains(Dsts::DEVCTRLHLT) {
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            }
        })?;

        self.device_state = DeviceState::Attached;
        #[cfg(feature = "defmt")]
        defmt::info!("controller running");
        Ok(())
    }

    /// Clear run/stop
    pub fn disconnect(&mut self) {
        self.regs.modify_dctl(|dctl| dctl.difference(Dctl::RUN_STOP));
        self.device_state = DeviceState::NotAttached;
        self.ep0_state = Ep0State::Unconnected;
    }

    /// Program the device address (0 returns to the default state)
    pub fn set_address(&mut self, address: u16) -> Result<()> {
        if address > MAX_DEVICE_ADDRESS {
            return Err(UsbError::AddressOutOfRange);
        }
        if self.device_state == DeviceState::Configured {
            return Err(UsbError::AlreadyConfigured);
        }

        let address = address as u8;
        self.regs.modify_dcfg(|dcfg: Dcfg| dcfg.with_address(address));
        self.device_state = if address != 0 {
            DeviceState::Address
        } else {
            DeviceState::Default
        };

        #[cfg(feature = "defmt")]
        defmt::debug!("address {}", address);
        Ok(())
    }

    /// Record that a configuration was selected (or deselected)
    pub fn set_configured(&mut self, configured: bool) {
        self.device_state = match (configured, self.device_state) {
            (true, _) => DeviceState::Configured,
            (false, DeviceState::Configured) => DeviceState::Address,
            (false, state) => state,
        };
    }

    /// Request a link state change and wait for the link to reach it
    pub fn set_link_state(&mut self, state: LinkState) -> Result<()> {
        let budget = self.config.link_state_retries;

        {
            let Self { regs, platform, .. } = self;
            poll_until(budget, UsbError::LinkStateTimeout, || {
                if regs.dsts().contains(Dsts::DCNRD) {
                    platform.delay_us(timing::LINK_STATE_POLL_US);
                    Poll::Pending
                } else {
                    Poll::Ready(Ok(()))
                }
            })?;
        }

        self.regs
            .modify_dctl(|dctl| dctl.with_link_request(state));

        let regs = &self.regs;
        poll_until(budget, UsbError::LinkStateChangeFailed, || {
            if regs.dsts().link_state() == state {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        })?;

        self.link_state = state;
        Ok(())
    }

    /// Signal remote wakeup from a low-power link state
    pub fn remote_wakeup(&mut self) -> Result<()> {
        let current = self.regs.dsts().link_state();
        if !current.allows_remote_wakeup() {
            return Err(UsbError::InvalidLinkState);
        }

        self.set_link_state(LinkState::Recovery)?;

        let regs = &self.regs;
        poll_until(self.config.wakeup_retries, UsbError::RemoteWakeupFailed, || {
            if regs.dsts().link_state() == LinkState::On {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        })?;

        self.link_state = LinkState::On;
        if self.device_state == DeviceState::Suspended {
            self.device_state = self.resume_state;
        }
        Ok(())
    }

    /// Driver statistics
    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Chapter 9 device state
    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    /// Control transfer stage
    pub fn ep0_state(&self) -> Ep0State {
        self.ep0_state
    }

    /// Most recent setup packet
    pub fn setup_packet(&self) -> SetupPacket {
        self.setup
    }

    /// Bytes moved by the last EP0 data stage
    pub fn actual_length(&self) -> u32 {
        self.actual_length
    }

    /// Last link state reported by the controller
    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    /// Speed negotiated at connection done
    pub fn speed(&self) -> Option<DeviceSpeed> {
        self.speed
    }

    /// GSNPSID read during bring-up
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Hardware parameters read during bring-up
    pub fn hwparams(&self) -> &HwParams {
        &self.hwparams
    }

    /// Physical endpoints in use
    pub fn num_endpoints(&self) -> usize {
        self.num_endpoints
    }

    /// Typed register access
    pub fn regs(&self) -> &Registers<R> {
        &self.regs
    }

    /// Platform services
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Mutable platform services
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Controller configuration
    pub fn config(&self) -> &Dwc3Config {
        &self.config
    }
}
