//! Error handling and recovery tests
//!
//! Tests verify that failures are reported with the right error, leave the
//! driver in a usable state, and that a retry after the fault succeeds.

mod common;

use core::fmt::Write;

use common::{initialized_core, leak_buffer, running_device, RecordingHandler};
use dwc3_usbd::dwc3::{offset, EpCommand};
use dwc3_usbd::error::ErrorCategory;
use dwc3_usbd::{DeviceState, Direction, EndpointType, PhysicalEndpoint, UsbError};

#[cfg(test)]
mod tests {
    use super::*;

    /// Addresses above 127 are rejected without touching DCFG
    #[test]
    fn test_address_out_of_range() {
        let (mut core, rig) = initialized_core();
        let dcfg = rig.hw.peek(offset::DCFG);

        let err = core.set_address(128).unwrap_err();
        assert_eq!(err, UsbError::AddressOutOfRange);
        assert_eq!(err.category(), ErrorCategory::Address);
        assert_eq!(rig.hw.peek(offset::DCFG), dcfg);

        core.set_address(127).unwrap();
        assert_eq!(core.device_state(), DeviceState::Address);
    }

    /// A configured device refuses a new address
    #[test]
    fn test_address_change_when_configured() {
        let (mut core, _rig) = initialized_core();
        core.set_address(4).unwrap();
        core.set_configured(true);
        assert_eq!(core.set_address(5), Err(UsbError::AlreadyConfigured));
        assert_eq!(core.device_state(), DeviceState::Configured);

        core.set_configured(false);
        assert_eq!(core.device_state(), DeviceState::Address);
        core.set_address(5).unwrap();
    }

    /// Address 0 puts the device back in the default state
    #[test]
    fn test_address_zero_is_default_state() {
        let (mut core, _rig) = initialized_core();
        core.set_address(7).unwrap();
        core.set_address(0).unwrap();
        assert_eq!(core.device_state(), DeviceState::Default);
    }

    /// A transfer refused for lack of a resource can be retried
    #[test]
    fn test_retry_after_no_resource() {
        let (mut device, rig) = running_device(RecordingHandler::new());
        let core = device.core_mut();
        core.endpoint_enable(1, Direction::In, EndpointType::Bulk, 512, 0)
            .unwrap();

        rig.hw.script_statuses(&[1]);
        let buffer = leak_buffer(64);
        let err = core.bulk_send(1, Direction::In, buffer, 64).unwrap_err();
        assert_eq!(err, UsbError::NoResource);
        assert_eq!(err.category(), ErrorCategory::Command);

        core.bulk_send(1, Direction::In, buffer, 64).unwrap();
        let phy = PhysicalEndpoint::new(1, Direction::In).unwrap();
        assert!(core.endpoint(phy).is_busy());
        assert_eq!(core.endpoint(phy).cursor().in_flight(), 1);
        assert_eq!(rig.hw.commands_of(EpCommand::StartTransfer).len(), 2);
    }

    /// A failed EP0 stall leaves the control stage untouched
    #[test]
    fn test_ep0_stall_failure_propagates() {
        let (mut device, rig) = running_device(RecordingHandler::new());
        rig.hw.script_statuses(&[2]);

        assert_eq!(device.core_mut().ep0_stall(), Err(UsbError::BusExpiry));
        assert!(!device.core().endpoint(PhysicalEndpoint::EP0_OUT).is_stalled());
        assert_eq!(rig.hw.commands_of(EpCommand::StartTransfer).len(), 0);
    }

    /// Command stats separate failures from timeouts
    #[test]
    fn test_command_failure_statistics() {
        let (mut device, rig) = running_device(RecordingHandler::new());
        let core = device.core_mut();
        core.endpoint_enable(1, Direction::In, EndpointType::Bulk, 512, 0)
            .unwrap();
        core.stats().reset();

        rig.hw.script_statuses(&[2]);
        assert!(core.endpoint_stall(1, Direction::In).is_err());
        rig.hw.hang_commands();
        assert!(core.endpoint_clear_stall(1, Direction::In).is_err());

        let stats = core.stats().snapshot();
        assert_eq!(stats.commands_issued, 2);
        assert_eq!(stats.command_failures, 1);
        assert_eq!(stats.command_timeouts, 1);
        assert_eq!(stats.command_error_rate(), 100);
    }

    /// Errors render a readable message
    #[test]
    fn test_error_messages() {
        let mut message: heapless::String<64> = heapless::String::new();
        write!(message, "{}", UsbError::RingFull).unwrap();
        assert_eq!(message.as_str(), "Descriptor ring full");

        message.clear();
        write!(message, "{}", UsbError::CommandTimeout).unwrap();
        assert_eq!(message.as_str(), "Endpoint command timeout");
    }

    /// Timeouts and hardware rejections are classified apart
    #[test]
    fn test_timeout_classification() {
        for err in [
            UsbError::SoftResetTimeout,
            UsbError::ControllerHalted,
            UsbError::GenericCommandTimeout,
            UsbError::CommandTimeout,
            UsbError::LinkStateTimeout,
        ] {
            assert!(err.is_timeout(), "{:?}", err);
        }
        for err in [
            UsbError::NoResource,
            UsbError::BusExpiry,
            UsbError::GenericCommandFailed,
            UsbError::LinkStateChangeFailed,
        ] {
            assert!(!err.is_timeout(), "{:?}", err);
        }
        assert_eq!(UsbError::RingFull.category(), ErrorCategory::Transfer);
        assert_eq!(UsbError::InvalidLinkState.category(), ErrorCategory::LinkState);
    }
}
