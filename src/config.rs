//! Controller configuration
//!
//! Every polling loop in the driver is bounded by a retry budget taken from
//! [`Dwc3Config`]; nothing is hard-wired at the call sites.

/// Settle delays used during bring-up and transfer teardown
#[allow(missing_docs)]
pub mod timing {
    /// PHY reset assert/deassert hold time
    pub const PHY_RESET_SETTLE_US: u32 = 50_000;
    /// Delay after a device core soft reset
    pub const SOFT_RESET_SETTLE_US: u32 = 5_000;
    /// Delay after an end-transfer command
    pub const END_TRANSFER_SETTLE_US: u32 = 100;
    /// Delay between link state polls
    pub const LINK_STATE_POLL_US: u32 = 5;
}

/// High-speed PHY interface width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhyInterface {
    /// UTMI 8-bit, 60 MHz
    Utmi8,
    /// UTMI+ 16-bit, 30 MHz
    Utmi16,
}

/// Maximum device speed programmed into DCFG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceSpeed {
    /// 480 Mbit/s
    High,
    /// 12 Mbit/s
    Full,
}

impl DeviceSpeed {
    /// DCFG.DEVSPD encoding
    pub const fn dcfg_bits(self) -> u32 {
        match self {
            Self::High => 0,
            Self::Full => 1,
        }
    }

    /// Decode DSTS.CONNECTSPD
    pub const fn from_dsts(bits: u32) -> Option<Self> {
        match bits & 0x7 {
            0 => Some(Self::High),
            1 | 3 => Some(Self::Full),
            _ => None,
        }
    }
}

/// DWC3 device controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dwc3Config {
    /// Polls of DEPCMD.CMDACT before an endpoint command times out
    pub command_retries: u32,
    /// Polls of DGCMD.CMDACT before a generic command times out
    pub generic_command_retries: u32,
    /// Polls of DSTS.DEVCTRLHLT after run/stop changes
    pub run_stop_retries: u32,
    /// Polls of DCTL.CSFTRST during device soft reset
    pub soft_reset_retries: u32,
    /// Polls of DSTS during a link state change
    pub link_state_retries: u32,
    /// Polls of DSTS while waiting for remote wakeup to finish
    pub wakeup_retries: u32,
    /// PHY interface width
    pub phy_interface: PhyInterface,
    /// Maximum device speed
    pub speed: DeviceSpeed,
    /// GFLADJ 30 MHz frame length adjustment
    pub frame_length_adjust: u8,
    /// EP0 max packet size
    pub control_max_packet: u16,
}

impl Dwc3Config {
    /// Configuration matching the reference board bring-up
    pub const fn new() -> Self {
        Self {
            command_retries: 1000,
            generic_command_retries: 500,
            run_stop_retries: 500,
            soft_reset_retries: 1000,
            link_state_retries: 10_000,
            wakeup_retries: 20_000,
            phy_interface: PhyInterface::Utmi16,
            speed: DeviceSpeed::High,
            frame_length_adjust: 0x20,
            control_max_packet: 64,
        }
    }

    /// Set the endpoint command retry budget
    pub const fn command_retries(mut self, retries: u32) -> Self {
        self.command_retries = retries;
        self
    }

    /// Set the generic command retry budget
    pub const fn generic_command_retries(mut self, retries: u32) -> Self {
        self.generic_command_retries = retries;
        self
    }

    /// Set the run/stop retry budget
    pub const fn run_stop_retries(mut self, retries: u32) -> Self {
        self.run_stop_retries = retries;
        self
    }

    /// Set the soft reset retry budget
    pub const fn soft_reset_retries(mut self, retries: u32) -> Self {
        self.soft_reset_retries = retries;
        self
    }

    /// Set the link state change retry budget
    pub const fn link_state_retries(mut self, retries: u32) -> Self {
        self.link_state_retries = retries;
        self
    }

    /// Set the remote wakeup retry budget
    pub const fn wakeup_retries(mut self, retries: u32) -> Self {
        self.wakeup_retries = retries;
        self
    }

    /// Select the PHY interface
    pub const fn phy_interface(mut self, phy: PhyInterface) -> Self {
        self.phy_interface = phy;
        self
    }

    /// Select the device speed
    pub const fn speed(mut self, speed: DeviceSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Set the frame length adjustment (6 bits)
    pub const fn frame_length_adjust(mut self, value: u8) -> Self {
        self.frame_length_adjust = value & 0x3F;
        self
    }

    /// Set the EP0 max packet size
    pub const fn control_max_packet(mut self, size: u16) -> Self {
        self.control_max_packet = size;
        self
    }
}

impl Default for Dwc3Config {
    fn default() -> Self {
        Self::new()
    }
}
