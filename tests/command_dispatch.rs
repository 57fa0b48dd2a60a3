//! Endpoint and generic command dispatch tests
//!
//! Tests run the dispatcher against the register model and check the
//! parameter/command write order, status decoding, the timeout path and the
//! PHY low-power save/restore around every command.

mod common;

use common::{new_core, initialized_core};
use dwc3_usbd::dwc3::{offset, CommandParams, DepCmd, EpCommand, PhyCfg};
use dwc3_usbd::UsbError;

#[cfg(test)]
mod tests {
    use super::*;

    /// Start transfer hands back the resource index the controller assigned
    #[test]
    fn test_start_transfer_reports_resource_index() {
        let (mut core, rig) = new_core();

        let done = core
            .send_ep_command(
                3,
                DepCmd::new(EpCommand::StartTransfer),
                CommandParams::trb_address(0x2000_1000),
            )
            .unwrap();
        assert_eq!(done.resource_index(), 1);

        let record = rig.hw.last_command().unwrap();
        assert_eq!(record.phy, 3);
        assert_eq!(record.command(), Some(EpCommand::StartTransfer));
        assert_eq!(record.param0, 0);
        assert_eq!(record.param1, 0x2000_1000);
        assert!(record.cmd.is_active(), "issued with CMDACT set");
    }

    /// Each hardware status code maps to its own error
    #[test]
    fn test_hardware_status_codes_are_distinct() {
        let (mut core, rig) = new_core();
        rig.hw.script_statuses(&[1, 2, 7, 0]);

        let mut issue = || {
            core.send_ep_command(2, DepCmd::new(EpCommand::SetStall), CommandParams::none())
                .map(|_| ())
        };
        assert_eq!(issue(), Err(UsbError::NoResource));
        assert_eq!(issue(), Err(UsbError::BusExpiry));
        assert_eq!(issue(), Err(UsbError::UnknownCommandStatus));
        assert_eq!(issue(), Ok(()));
    }

    /// A command that never completes times out, separately from a failure
    #[test]
    fn test_timeout_is_not_a_hardware_error() {
        let (mut core, rig) = new_core();
        rig.hw.hang_commands();

        let err = core
            .send_ep_command(4, DepCmd::new(EpCommand::ClearStall), CommandParams::none())
            .unwrap_err();
        assert_eq!(err, UsbError::CommandTimeout);
        assert!(err.is_timeout());

        let stats = core.stats().snapshot();
        assert_eq!(stats.commands_issued, 1);
        assert_eq!(stats.command_timeouts, 1);
        assert_eq!(stats.command_failures, 0);
    }

    /// Update transfer is fire-and-forget: no CMDACT, nothing to wait for
    #[test]
    fn test_update_transfer_does_not_wait() {
        let (mut core, rig) = new_core();
        rig.hw.hang_commands();

        let result = core.send_ep_command(
            5,
            DepCmd::new(EpCommand::UpdateTransfer).with_param(3),
            CommandParams::trb_address(0x100),
        );
        assert!(result.is_ok());

        let record = rig.hw.last_command().unwrap();
        assert!(!record.cmd.is_active());
        assert_eq!(record.cmd.bits() & DepCmd::CMDIOC, 0);
        assert_eq!(record.cmd.param(), 3);
    }

    /// PHY low-power bits are clear during the command and restored after it
    #[test]
    fn test_phy_low_power_bits_restored_on_every_outcome() {
        let (mut core, rig) = new_core();
        let before = PhyCfg::SUSPHY.bits() | PhyCfg::ENBLSLPM.bits() | (9 << 10);
        rig.hw.poke(offset::GUSB2PHYCFG0, before);

        // Success, hardware error, timeout
        rig.hw.script_statuses(&[0, 2]);
        let ok = core.send_ep_command(2, DepCmd::new(EpCommand::SetStall), CommandParams::none());
        let failed =
            core.send_ep_command(2, DepCmd::new(EpCommand::SetStall), CommandParams::none());
        assert!(ok.is_ok());
        assert_eq!(failed.unwrap_err(), UsbError::BusExpiry);
        assert_eq!(rig.hw.peek(offset::GUSB2PHYCFG0), before);

        rig.hw.hang_commands();
        let timed_out =
            core.send_ep_command(2, DepCmd::new(EpCommand::SetStall), CommandParams::none());
        assert_eq!(timed_out.unwrap_err(), UsbError::CommandTimeout);
        assert_eq!(rig.hw.peek(offset::GUSB2PHYCFG0), before);

        for record in rig.hw.commands() {
            assert_eq!(record.phycfg & PhyCfg::LOW_POWER.bits(), 0);
            assert_eq!(record.phycfg, before & !PhyCfg::LOW_POWER.bits());
        }
    }

    /// With only some low-power bits set, only those come back
    #[test]
    fn test_phy_partial_low_power_restored_exactly() {
        let (mut core, rig) = new_core();
        rig.hw.poke(offset::GUSB2PHYCFG0, PhyCfg::ENBLSLPM.bits());
        core.send_ep_command(6, DepCmd::new(EpCommand::GetEndpointState), CommandParams::none())
            .unwrap();
        assert_eq!(rig.hw.peek(offset::GUSB2PHYCFG0), PhyCfg::ENBLSLPM.bits());
    }

    /// Physical endpoints past the command groups are refused without I/O
    #[test]
    fn test_out_of_range_endpoint_not_dispatched() {
        let (mut core, rig) = new_core();
        let result =
            core.send_ep_command(8, DepCmd::new(EpCommand::SetStall), CommandParams::none());
        assert_eq!(result, Err(UsbError::InvalidEndpoint));
        assert!(rig.hw.commands().is_empty());
    }

    /// Bring-up hands the scratchpad to the core through DGCMD
    #[test]
    fn test_scratchpad_generic_commands() {
        let (core, rig) = initialized_core();
        drop(core);

        let generic = rig.hw.generic_commands();
        assert_eq!(generic.len(), 2);
        assert_eq!(generic[0], (0x04, rig.dma.scratchpad_addr() as u32));
        assert_eq!(generic[1], (0x05, 0));
    }
}
