//! Endpoint and generic command dispatch
//!
//! Every physical endpoint owns a four-register command group
//! (DEPCMDPAR2, DEPCMDPAR1, DEPCMDPAR0, DEPCMD). A command is issued by
//! loading the parameters and writing DEPCMD with CMDACT set; the controller
//! clears CMDACT when done and leaves a status code, and for start-transfer
//! the assigned transfer resource index, in the same register.

use core::task::Poll;

use super::register::{poll_until, RegisterIo};
use super::{PhyCfg, MAX_PHYSICAL_ENDPOINTS};
use crate::controller::Dwc3Core;
use crate::dma::Platform;
use crate::error::{Result, UsbError};
use crate::transfer::EndpointType;

/// Endpoint command opcodes (DEPCMD[3:0])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EpCommand {
    /// DEPCFG
    SetEndpointConfig = 1,
    /// DEPXFERCFG
    SetTransferResource = 2,
    /// DEPGETSTATE
    GetEndpointState = 3,
    /// DEPSSTALL
    SetStall = 4,
    /// DEPCSTALL
    ClearStall = 5,
    /// DEPSTRTXFER
    StartTransfer = 6,
    /// DEPUPDXFER
    UpdateTransfer = 7,
    /// DEPENDXFER
    EndTransfer = 8,
    /// DEPSTARTCFG
    StartConfig = 9,
}

impl EpCommand {
    /// Decode an opcode
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & 0xF {
            1 => Self::SetEndpointConfig,
            2 => Self::SetTransferResource,
            3 => Self::GetEndpointState,
            4 => Self::SetStall,
            5 => Self::ClearStall,
            6 => Self::StartTransfer,
            7 => Self::UpdateTransfer,
            8 => Self::EndTransfer,
            9 => Self::StartConfig,
            _ => return None,
        })
    }
}

/// Endpoint command register value (DEPCMD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DepCmd(u32);

impl DepCmd {
    const CMD_MASK: u32 = 0xF;
    /// Interrupt on command completion
    pub const CMDIOC: u32 = 1 << 8;
    /// Command active
    pub const CMDACT: u32 = 1 << 10;
    /// High priority / force resource removal (end transfer)
    pub const HIPRI_FORCERM: u32 = 1 << 11;
    /// Clear pending (set stall)
    pub const CLEARPENDIN: u32 = 1 << 11;
    const STATUS_SHIFT: u32 = 12;
    const PARAM_SHIFT: u32 = 16;
    const RESOURCE_MASK: u32 = 0x7F;

    /// Command word for `cmd` with no flags
    pub const fn new(cmd: EpCommand) -> Self {
        Self(cmd as u32)
    }

    /// Wrap a raw register value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Opcode
    pub const fn command(self) -> Option<EpCommand> {
        EpCommand::from_bits(self.0 & Self::CMD_MASK)
    }

    /// Set the command parameter field (DEPCMD[31:16])
    pub const fn with_param(self, param: u16) -> Self {
        Self((self.0 & 0xFFFF) | ((param as u32) << Self::PARAM_SHIFT))
    }

    /// Request a command-complete event
    pub const fn with_ioc(self) -> Self {
        Self(self.0 | Self::CMDIOC)
    }

    /// Force transfer resource removal (end transfer)
    pub const fn with_force_rm(self) -> Self {
        Self(self.0 | Self::HIPRI_FORCERM)
    }

    /// Clear the pending flag (set stall)
    pub const fn with_clear_pending(self) -> Self {
        Self(self.0 | Self::CLEARPENDIN)
    }

    /// Word actually written to issue the command
    ///
    /// Update transfer is issued as a "no response" command: CMDACT and
    /// CMDIOC both clear. Everything else sets CMDACT.
    pub const fn issue(self) -> Self {
        match self.command() {
            Some(EpCommand::UpdateTransfer) => Self(self.0 & !(Self::CMDIOC | Self::CMDACT)),
            _ => Self(self.0 | Self::CMDACT),
        }
    }

    /// Command still executing
    pub const fn is_active(self) -> bool {
        self.0 & Self::CMDACT != 0
    }

    /// Completion status (DEPCMD[15:12])
    pub const fn status(self) -> u8 {
        ((self.0 >> Self::STATUS_SHIFT) & 0xF) as u8
    }

    /// Parameter field as written
    pub const fn param(self) -> u16 {
        (self.0 >> Self::PARAM_SHIFT) as u16
    }

    /// Transfer resource index reported after start transfer
    pub const fn resource_index(self) -> u8 {
        ((self.0 >> Self::PARAM_SHIFT) & Self::RESOURCE_MASK) as u8
    }

    /// Map the completion status to a result
    pub const fn result(self) -> Result<()> {
        match self.status() {
            0 => Ok(()),
            1 => Err(UsbError::NoResource),
            2 => Err(UsbError::BusExpiry),
            _ => Err(UsbError::UnknownCommandStatus),
        }
    }
}

/// Endpoint command parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandParams {
    /// DEPCMDPAR0
    pub param0: u32,
    /// DEPCMDPAR1
    pub param1: u32,
    /// DEPCMDPAR2
    pub param2: u32,
}

impl CommandParams {
    /// All parameters zero
    pub const fn none() -> Self {
        Self { param0: 0, param1: 0, param2: 0 }
    }

    /// Parameters for PAR0 and PAR1
    pub const fn new(param0: u32, param1: u32) -> Self {
        Self { param0, param1, param2: 0 }
    }

    /// Start/update transfer: PAR0 = TRB address high, PAR1 = TRB address low
    pub const fn trb_address(global_addr: u32) -> Self {
        Self::new(0, global_addr)
    }
}

/// DEPCFG parameter fields
#[allow(missing_docs)]
pub mod depcfg {
    // PAR0
    pub const EP_TYPE_SHIFT: u32 = 1;
    pub const MAX_PACKET_SHIFT: u32 = 3;
    pub const FIFO_NUMBER_SHIFT: u32 = 17;
    pub const BURST_SIZE_SHIFT: u32 = 22;
    pub const ACTION_INIT: u32 = 0 << 30;
    pub const ACTION_RESTORE: u32 = 1 << 30;
    pub const ACTION_MODIFY: u32 = 2 << 30;

    // PAR1
    pub const XFER_COMPLETE_EN: u32 = 1 << 8;
    pub const XFER_IN_PROGRESS_EN: u32 = 1 << 9;
    pub const XFER_NOT_READY_EN: u32 = 1 << 10;
    pub const BINTERVAL_M1_SHIFT: u32 = 16;
    pub const EP_NUMBER_SHIFT: u32 = 25;

    /// DEPXFERCFG PAR0: one transfer resource
    pub const NUM_XFER_RES_1: u32 = 1;
}

/// Set-endpoint-config request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EpConfig {
    /// Physical endpoint
    pub phy: u8,
    /// Transfer type
    pub ep_type: EndpointType,
    /// Max packet size
    pub max_packet: u16,
    /// bInterval, 0 for none
    pub interval: u8,
}

impl EpConfig {
    /// Encode as DEPCFG parameters (action: initialize)
    pub const fn to_params(&self) -> CommandParams {
        let mut param0 = ((self.ep_type as u32) << depcfg::EP_TYPE_SHIFT)
            | ((self.max_packet as u32 & 0x7FF) << depcfg::MAX_PACKET_SHIFT)
            | depcfg::ACTION_INIT;
        // IN endpoints (odd index) own TX FIFO phy / 2
        if self.phy & 1 == 1 {
            param0 |= ((self.phy as u32 >> 1) & 0x1F) << depcfg::FIFO_NUMBER_SHIFT;
        }

        let mut param1 = depcfg::XFER_COMPLETE_EN
            | depcfg::XFER_NOT_READY_EN
            | ((self.phy as u32 & 0x1F) << depcfg::EP_NUMBER_SHIFT);
        if !matches!(self.ep_type, EndpointType::Control) {
            param1 |= depcfg::XFER_IN_PROGRESS_EN;
        }
        if self.interval > 0 {
            param1 |= ((self.interval as u32 - 1) & 0xFF) << depcfg::BINTERVAL_M1_SHIFT;
        }

        CommandParams::new(param0, param1)
    }
}

/// Generic (device-level) commands written to DGCMD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum GenericCommand {
    /// Scratchpad buffer array address, low word
    SetScratchpadLo = 0x04,
    /// Scratchpad buffer array address, high word
    SetScratchpadHi = 0x05,
}

impl GenericCommand {
    /// Command active
    pub const CMDACT: u32 = 1 << 10;
    /// Interrupt on completion
    pub const CMDIOC: u32 = 1 << 8;

    /// Word written to DGCMD
    pub const fn issue(self) -> u32 {
        self as u32 | Self::CMDACT
    }

    /// Completion status of a DGCMD read-back
    pub const fn status(value: u32) -> u8 {
        ((value >> 12) & 0xF) as u8
    }
}

impl<'a, R: RegisterIo, P: Platform> Dwc3Core<'a, R, P> {
    /// Run `f` with the PHY low-power bits cleared, restoring them afterwards
    ///
    /// The controller does not execute endpoint commands while SUSPHY or
    /// ENBLSLPM are set. Whatever subset was set on entry is set again on
    /// exit, on every return path of `f`.
    pub(crate) fn with_phy_awake<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.regs.phy_cfg().intersection(PhyCfg::LOW_POWER);
        if !saved.is_empty() {
            self.regs.modify_phy_cfg(|cfg| cfg.difference(saved));
        }

        let out = f(self);

        if !saved.is_empty() {
            self.regs.modify_phy_cfg(|cfg| cfg.union(saved));
        }
        out
    }

    /// Issue an endpoint command and wait for it to complete
    ///
    /// Returns the completed command register, from which start-transfer
    /// callers read the transfer resource index.
    pub fn send_ep_command(
        &mut self,
        phy: usize,
        cmd: DepCmd,
        params: CommandParams,
    ) -> Result<DepCmd> {
        if phy >= MAX_PHYSICAL_ENDPOINTS {
            return Err(UsbError::InvalidEndpoint);
        }

        let budget = self.config.command_retries;
        self.stats.record_command();

        let result = self.with_phy_awake(|core| {
            core.regs.write_ep_params(phy, params);
            core.regs.write_ep_cmd(phy, cmd.issue());

            let regs = &core.regs;
            poll_until(budget, UsbError::CommandTimeout, || {
                let completed = regs.ep_cmd(phy);
                if completed.is_active() {
                    Poll::Pending
                } else {
                    Poll::Ready(completed.result().map(|()| completed))
                }
            })
        });

        if let Err(err) = result {
            self.stats.record_command_failure(err == UsbError::CommandTimeout);
            #[cfg(feature = "defmt")]
            defmt::error!("ep{} command {:#x} failed: {}", phy, cmd.bits(), err);
        }
        result
    }

    /// Issue a generic command and wait for it to complete
    pub(crate) fn send_generic_command(&mut self, cmd: GenericCommand, param: u32) -> Result<()> {
        let budget = self.config.generic_command_retries;
        self.regs.write_generic_cmd(param, cmd.issue());

        let regs = &self.regs;
        poll_until(budget, UsbError::GenericCommandTimeout, || {
            let value = regs.generic_cmd();
            if value & GenericCommand::CMDACT != 0 {
                Poll::Pending
            } else if GenericCommand::status(value) != 0 {
                Poll::Ready(Err(UsbError::GenericCommandFailed))
            } else {
                Poll::Ready(Ok(()))
            }
        })
    }
}
