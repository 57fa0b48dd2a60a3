//! DWC3 (Synopsys DesignWare USB3) device controller interface
//!
//! Register offsets and bit definitions for the global and device register
//! groups, plus the descriptor, command and event formats built on them.
//!
//! # Register Memory Layout
//!
//! - Global registers (`G*`) at 0xC100-0xC6FF: core identity, hardware
//!   parameters, PHY configuration, event buffer
//! - Device registers (`D*`) at 0xC700-0xC7FF: configuration, control,
//!   status, generic command, endpoint enable
//! - Endpoint command groups at 0xC800, 16 bytes per physical endpoint

pub mod register;
pub mod command;
pub mod trb;
pub mod event;

pub use command::{CommandParams, DepCmd, EpCommand, EpConfig, GenericCommand};
pub use event::{
    ControlStage, DeviceEvent, DeviceEventKind, EndpointEvent, EndpointEventKind, Event,
    EventCursor,
};
pub use register::{poll_until, Mmio, RegisterIo, Registers};
pub use trb::{RingCursor, Trb, TrbCompletion, TrbControl, TrbRing, TrbStatus, TrbType};

use bitflags::bitflags;

/// Physical endpoints handled by the driver
pub const MAX_PHYSICAL_ENDPOINTS: usize = 8;

/// Expected GSNPSID product code
pub const DWC3_PRODUCT_ID: u32 = 0x5533_0000;

/// GSNPSID product code mask
pub const DWC3_PRODUCT_ID_MASK: u32 = 0xFFFF_0000;

/// Register byte offsets from the controller base
#[allow(missing_docs)]
pub mod offset {
    pub const GSBUSCFG0: usize = 0xC100;
    pub const GCTL: usize = 0xC110;
    pub const GSTS: usize = 0xC118;
    pub const GSNPSID: usize = 0xC120;
    pub const GUID: usize = 0xC128;
    pub const GHWPARAMS0: usize = 0xC140;
    pub const GUSB2PHYCFG0: usize = 0xC200;
    pub const GEVNTADRLO0: usize = 0xC400;
    pub const GEVNTADRHI0: usize = 0xC404;
    pub const GEVNTSIZ0: usize = 0xC408;
    pub const GEVNTCOUNT0: usize = 0xC40C;
    pub const GHWPARAMS8: usize = 0xC600;
    pub const GFLADJ: usize = 0xC630;
    pub const DCFG: usize = 0xC700;
    pub const DCTL: usize = 0xC704;
    pub const DEVTEN: usize = 0xC708;
    pub const DSTS: usize = 0xC70C;
    pub const DGCMDPAR: usize = 0xC710;
    pub const DGCMD: usize = 0xC714;
    pub const DALEPENA: usize = 0xC720;

    /// GHWPARAMS0..=7 are contiguous, GHWPARAMS8 lives apart
    pub const fn ghwparams(n: usize) -> usize {
        if n == 8 {
            GHWPARAMS8
        } else {
            GHWPARAMS0 + n * 4
        }
    }

    /// Start of the endpoint command group of physical endpoint `phy`
    pub const fn depcmd_base(phy: usize) -> usize {
        0xC800 + phy * 0x10
    }

    pub const fn depcmdpar2(phy: usize) -> usize {
        depcmd_base(phy)
    }

    pub const fn depcmdpar1(phy: usize) -> usize {
        depcmd_base(phy) + 0x4
    }

    pub const fn depcmdpar0(phy: usize) -> usize {
        depcmd_base(phy) + 0x8
    }

    pub const fn depcmd(phy: usize) -> usize {
        depcmd_base(phy) + 0xC
    }
}

bitflags! {
    /// Global Core Control (GCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gctl: u32 {
        /// Disable clock gating
        const DSBLCLKGTNG = 1 << 0;
        /// Core soft reset (PHY reset sequencing)
        const CORESOFTRESET = 1 << 11;
        /// Port capability direction mask
        const PRTCAPDIR_MASK = 0x3 << 12;
        /// Port capability: host
        const PRTCAP_HOST = 0x1 << 12;
        /// Port capability: device
        const PRTCAP_DEVICE = 0x2 << 12;
        /// Port capability: OTG
        const PRTCAP_OTG = 0x3 << 12;

        const _ = !0;
    }
}

bitflags! {
    /// Global SoC Bus Configuration 0 (GSBUSCFG0)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gsbuscfg0: u32 {
        /// Undefined-length INCR bursts
        const INCRBRSTENA = 1 << 0;
        /// INCR16 bursts
        const INCR16BRSTENA = 1 << 3;

        const _ = !0;
    }
}

bitflags! {
    /// Global USB2 PHY Configuration (GUSB2PHYCFG0)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PhyCfg: u32 {
        /// PHY interface: 0 = 8-bit, 1 = 16-bit
        const PHYIF = 1 << 3;
        /// ULPI or UTMI+ select
        const ULPI_UTMI = 1 << 4;
        /// Suspend the USB2.0 PHY
        const SUSPHY = 1 << 6;
        /// Enable utmi_sleep_n / utmi_l1_suspend_n
        const ENBLSLPM = 1 << 8;
        /// USB turnaround time mask
        const USBTRDTIM_MASK = 0xF << 10;
        /// ULPI auto resume
        const ULPIAUTORES = 1 << 15;
        /// PHY soft reset
        const PHYSOFTRST = 1 << 31;

        const _ = !0;
    }
}

impl PhyCfg {
    /// Bits the controller refuses endpoint commands under
    pub const LOW_POWER: Self = Self::SUSPHY.union(Self::ENBLSLPM);

    /// Turnaround time for an 8-bit UTMI interface
    pub const TURNAROUND_8BIT: u32 = 9;

    /// Turnaround time for a 16-bit UTMI+ interface
    pub const TURNAROUND_16BIT: u32 = 5;

    /// Replace the turnaround time field
    pub fn with_turnaround(self, value: u32) -> Self {
        let cleared = self.difference(Self::USBTRDTIM_MASK);
        cleared.union(Self::from_bits_retain((value & 0xF) << 10))
    }

    /// Turnaround time field
    pub fn turnaround(self) -> u32 {
        (self.bits() >> 10) & 0xF
    }
}

bitflags! {
    /// Event buffer size register (GEVNTSIZ0)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSize: u32 {
        /// Event interrupt mask
        const INTMASK = 1 << 31;
        /// Buffer size in bytes
        const SIZE_MASK = 0xFFFF;

        const _ = !0;
    }
}

impl EventSize {
    /// Register value for a buffer of `size` bytes
    pub const fn with_size(size: usize) -> Self {
        Self::from_bits_retain(size as u32 & Self::SIZE_MASK.bits())
    }
}

/// GEVNTCOUNT pending byte count mask
pub const EVENT_COUNT_MASK: u32 = 0xFFFC;

bitflags! {
    /// Global Frame Length Adjustment (GFLADJ)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gfladj: u32 {
        /// 30 MHz frame length adjustment
        const FLADJ_30MHZ_MASK = 0x3F;
        /// Use the GFLADJ_30MHZ field instead of the strap
        const FLADJ_30MHZ_SDBND_SEL = 1 << 7;

        const _ = !0;
    }
}

bitflags! {
    /// Device Configuration (DCFG)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dcfg: u32 {
        /// Device speed mask
        const DEVSPD_MASK = 0x7;
        /// Device address mask
        const DEVADDR_MASK = 0x7F << 3;
        /// LPM capable
        const LPM_CAP = 1 << 22;

        const _ = !0;
    }
}

impl Dcfg {
    /// Device address field
    pub fn address(self) -> u8 {
        ((self.bits() >> 3) & 0x7F) as u8
    }

    /// Replace the device address field
    pub fn with_address(self, address: u8) -> Self {
        self.difference(Self::DEVADDR_MASK)
            .union(Self::from_bits_retain((u32::from(address) & 0x7F) << 3))
    }

    /// Replace the device speed field
    pub fn with_speed(self, bits: u32) -> Self {
        self.difference(Self::DEVSPD_MASK)
            .union(Self::from_bits_retain(bits & 0x7))
    }
}

bitflags! {
    /// Device Control (DCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dctl: u32 {
        /// Test control mask
        const TSTCTRL_MASK = 0xF << 1;
        /// USB/link state change request mask
        const ULSTCHNGREQ_MASK = 0xF << 5;
        /// Keep connect
        const KEEP_CONNECT = 1 << 19;
        /// LPM NYET threshold / HIRD threshold mask
        const HIRD_THRES_MASK = 0x1F << 24;
        /// Core soft reset
        const CSFTRST = 1 << 30;
        /// Run/stop
        const RUN_STOP = 1 << 31;

        const _ = !0;
    }
}

impl Dctl {
    /// Request a link state change
    pub fn with_link_request(self, state: LinkState) -> Self {
        self.difference(Self::ULSTCHNGREQ_MASK)
            .union(Self::from_bits_retain((state.bits() & 0xF) << 5))
    }

    /// Requested link state field
    pub fn link_request(self) -> u32 {
        (self.bits() >> 5) & 0xF
    }
}

bitflags! {
    /// Device Status (DSTS)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dsts: u32 {
        /// Connected speed mask
        const CONNECTSPD_MASK = 0x7;
        /// USB/link state mask
        const USBLNKST_MASK = 0xF << 18;
        /// Device controller halted
        const DEVCTRLHLT = 1 << 22;
        /// Device controller not ready
        const DCNRD = 1 << 29;

        const _ = !0;
    }
}

impl Dsts {
    /// Connected speed field
    pub fn connect_speed(self) -> u32 {
        self.bits() & 0x7
    }

    /// Current link state
    pub fn link_state(self) -> LinkState {
        LinkState::from_bits((self.bits() >> 18) & 0xF)
    }
}

bitflags! {
    /// Device Event Enable (DEVTEN)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Devten: u32 {
        /// Disconnect detected
        const DISCONNEVTEN = 1 << 0;
        /// USB reset
        const USBRSTEVTEN = 1 << 1;
        /// Connection done
        const CONNECTDONEEVTEN = 1 << 2;
        /// USB/link state change
        const ULSTCNGEN = 1 << 3;
        /// Resume/remote wakeup detected
        const WKUPEVTEN = 1 << 4;

        const _ = !0;
    }
}

/// Core operating mode from GHWPARAMS0[1:0]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CoreMode {
    /// Device only
    Device,
    /// Host only
    Host,
    /// Dual-role
    DualRole,
    /// Reserved encoding
    Unknown,
}

impl CoreMode {
    /// Decode GHWPARAMS0
    pub const fn from_hwparams0(value: u32) -> Self {
        match value & 0x3 {
            0 => Self::Device,
            1 => Self::Host,
            2 => Self::DualRole,
            _ => Self::Unknown,
        }
    }

    /// Core can act as a USB device
    pub const fn supports_device(self) -> bool {
        matches!(self, Self::Device | Self::DualRole)
    }
}

/// High-speed PHY interface type from GHWPARAMS3[3:2]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HsPhyType {
    /// No high-speed PHY
    None,
    /// UTMI+
    Utmi,
    /// ULPI
    Ulpi,
    /// UTMI+ and ULPI
    UtmiUlpi,
}

/// Cached GHWPARAMS words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HwParams(pub [u32; 9]);

impl HwParams {
    /// Operating mode
    pub const fn mode(&self) -> CoreMode {
        CoreMode::from_hwparams0(self.0[0])
    }

    /// Total device endpoints (GHWPARAMS3 DWC_USB3_NUM_EPS)
    pub const fn num_eps(&self) -> u32 {
        (self.0[3] & 0x3_F000) >> 12
    }

    /// Device IN endpoints (GHWPARAMS3 DWC_USB3_NUM_IN_EPS)
    pub const fn num_in_eps(&self) -> u32 {
        (self.0[3] & 0x7C_0000) >> 18
    }

    /// High-speed PHY interface
    pub const fn hsphy_type(&self) -> HsPhyType {
        match (self.0[3] >> 2) & 0x3 {
            0 => HsPhyType::None,
            1 => HsPhyType::Utmi,
            2 => HsPhyType::Ulpi,
            _ => HsPhyType::UtmiUlpi,
        }
    }
}

/// USB2 link states (DSTS.USBLNKST / DCTL.ULSTCHNGREQ)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// L0, on
    On,
    /// L1, sleep
    L1,
    /// L2, suspend
    L2,
    /// Disconnected
    Disconnected,
    /// Early suspend
    EarlySuspend,
    /// Recovery (resume signalling)
    Recovery,
    /// Reset
    Reset,
    /// Resume
    Resume,
    /// Any other encoding
    Other(u8),
}

impl LinkState {
    /// Decode a 4-bit link state field
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0xF {
            0x0 => Self::On,
            0x2 => Self::L1,
            0x3 => Self::L2,
            0x4 => Self::Disconnected,
            0x5 => Self::EarlySuspend,
            0x8 => Self::Recovery,
            0xE => Self::Reset,
            0xF => Self::Resume,
            other => Self::Other(other as u8),
        }
    }

    /// Encode as a 4-bit link state field
    pub const fn bits(self) -> u32 {
        match self {
            Self::On => 0x0,
            Self::L1 => 0x2,
            Self::L2 => 0x3,
            Self::Disconnected => 0x4,
            Self::EarlySuspend => 0x5,
            Self::Recovery => 0x8,
            Self::Reset => 0xE,
            Self::Resume => 0xF,
            Self::Other(bits) => bits as u32 & 0xF,
        }
    }

    /// States the device may leave by signalling remote wakeup
    pub const fn allows_remote_wakeup(self) -> bool {
        matches!(self, Self::L1 | Self::L2 | Self::EarlySuspend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets() {
        assert_eq!(offset::ghwparams(3), 0xC14C);
        assert_eq!(offset::ghwparams(8), 0xC600);
        assert_eq!(offset::depcmdpar2(0), 0xC800);
        assert_eq!(offset::depcmd(0), 0xC80C);
        assert_eq!(offset::depcmdpar1(5), 0xC854);
        assert_eq!(offset::depcmdpar0(5), 0xC858);
        assert_eq!(offset::depcmd(7), 0xC87C);
    }

    #[test]
    fn dcfg_address_field() {
        let dcfg = Dcfg::from_bits_retain(0x0008_0804).with_address(5);
        assert_eq!(dcfg.address(), 5);
        assert_eq!(dcfg.bits() & 0x7, 4);
        assert_eq!(dcfg.with_address(0).address(), 0);
        assert_eq!(dcfg.with_speed(0).bits() & 0x7, 0);
    }

    #[test]
    fn dctl_link_request_field() {
        let dctl = Dctl::RUN_STOP.with_link_request(LinkState::Recovery);
        assert_eq!(dctl.link_request(), 8);
        assert!(dctl.contains(Dctl::RUN_STOP));
        assert_eq!(dctl.with_link_request(LinkState::On).link_request(), 0);
    }

    #[test]
    fn dsts_fields() {
        let dsts = Dsts::from_bits_retain((0x3 << 18) | Dsts::DCNRD.bits() | 1);
        assert_eq!(dsts.link_state(), LinkState::L2);
        assert_eq!(dsts.connect_speed(), 1);
        assert!(dsts.contains(Dsts::DCNRD));
        assert!(!dsts.contains(Dsts::DEVCTRLHLT));
    }

    #[test]
    fn phy_turnaround_field() {
        let cfg = PhyCfg::SUSPHY.with_turnaround(PhyCfg::TURNAROUND_8BIT);
        assert_eq!(cfg.turnaround(), 9);
        let cfg = cfg.with_turnaround(PhyCfg::TURNAROUND_16BIT);
        assert_eq!(cfg.turnaround(), 5);
        assert!(cfg.contains(PhyCfg::SUSPHY));
    }

    #[test]
    fn hwparams_decoding() {
        let mut words = [0u32; 9];
        words[0] = 0x2;
        words[3] = (4 << 18) | (8 << 12) | (1 << 2);
        let params = HwParams(words);
        assert_eq!(params.mode(), CoreMode::DualRole);
        assert!(params.mode().supports_device());
        assert_eq!(params.num_eps(), 8);
        assert_eq!(params.num_in_eps(), 4);
        assert_eq!(params.hsphy_type(), HsPhyType::Utmi);
        assert!(!CoreMode::from_hwparams0(1).supports_device());
    }

    #[test]
    fn link_state_roundtrip_known_values() {
        for bits in [0x0, 0x2, 0x3, 0x4, 0x5, 0x8, 0xE, 0xF, 0x6] {
            assert_eq!(LinkState::from_bits(bits).bits(), bits);
        }
        assert!(LinkState::L2.allows_remote_wakeup());
        assert!(!LinkState::On.allows_remote_wakeup());
    }
}
