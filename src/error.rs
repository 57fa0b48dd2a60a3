//! USB device controller error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB device controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Core identification register does not name a DWC3 core
    InvalidCore,
    /// Core synthesized without device-mode support
    ModeMismatch,
    /// Device core soft reset did not complete
    SoftResetTimeout,
    /// Controller did not leave the halted state after run/stop
    ControllerHalted,
    /// Generic (device-level) command reported failure
    GenericCommandFailed,
    /// Generic (device-level) command did not complete
    GenericCommandTimeout,
    /// Transfer direction does not match the endpoint
    WrongDirection,
    /// Endpoint already has a transfer in flight
    EndpointBusy,
    /// Endpoint number out of range or endpoint not enabled
    InvalidEndpoint,
    /// No transfer resource is assigned to the endpoint
    ResourceIndexInvalid,
    /// Endpoint command rejected: no transfer resource available
    NoResource,
    /// Endpoint command rejected: bus expiry
    BusExpiry,
    /// Endpoint command returned an undefined status code
    UnknownCommandStatus,
    /// Endpoint command still active after the retry budget
    CommandTimeout,
    /// Buffer length not acceptable for this transfer
    InvalidLength,
    /// Every data descriptor of the ring is owned by hardware
    RingFull,
    /// Link state does not allow the requested operation
    InvalidLinkState,
    /// Controller never became ready for a link state change
    LinkStateTimeout,
    /// Link did not reach the requested state
    LinkStateChangeFailed,
    /// Link did not return to ON after remote wakeup
    RemoteWakeupFailed,
    /// Device address above 127
    AddressOutOfRange,
    /// Address change requested while configured
    AlreadyConfigured,
    /// Invalid parameter
    InvalidParameter,
    /// Unsupported operation
    Unsupported,
}

/// Error classes used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCategory {
    /// Bring-up failures, the controller cannot start
    Initialization,
    /// Endpoint configuration and state errors
    Endpoint,
    /// Endpoint command protocol errors
    Command,
    /// Transfer submission errors
    Transfer,
    /// Link power management errors
    LinkState,
    /// Device address errors
    Address,
}

impl UsbError {
    /// Classify the error
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidCore
            | Self::ModeMismatch
            | Self::SoftResetTimeout
            | Self::ControllerHalted
            | Self::GenericCommandFailed
            | Self::GenericCommandTimeout => ErrorCategory::Initialization,
            Self::WrongDirection
            | Self::EndpointBusy
            | Self::InvalidEndpoint
            | Self::ResourceIndexInvalid
            | Self::Unsupported => ErrorCategory::Endpoint,
            Self::NoResource
            | Self::BusExpiry
            | Self::UnknownCommandStatus
            | Self::CommandTimeout => ErrorCategory::Command,
            Self::InvalidLength | Self::RingFull | Self::InvalidParameter => {
                ErrorCategory::Transfer
            }
            Self::InvalidLinkState
            | Self::LinkStateTimeout
            | Self::LinkStateChangeFailed
            | Self::RemoteWakeupFailed => ErrorCategory::LinkState,
            Self::AddressOutOfRange | Self::AlreadyConfigured => ErrorCategory::Address,
        }
    }

    /// True when the hardware never answered (as opposed to answering with an error)
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::SoftResetTimeout
                | Self::ControllerHalted
                | Self::GenericCommandTimeout
                | Self::CommandTimeout
                | Self::LinkStateTimeout
        )
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCore => write!(f, "Not a DWC3 core"),
            Self::ModeMismatch => write!(f, "Core has no device mode"),
            Self::SoftResetTimeout => write!(f, "Core soft reset timeout"),
            Self::ControllerHalted => write!(f, "Controller halted"),
            Self::GenericCommandFailed => write!(f, "Generic command failed"),
            Self::GenericCommandTimeout => write!(f, "Generic command timeout"),
            Self::WrongDirection => write!(f, "Wrong endpoint direction"),
            Self::EndpointBusy => write!(f, "Endpoint busy"),
            Self::InvalidEndpoint => write!(f, "Invalid endpoint"),
            Self::ResourceIndexInvalid => write!(f, "Transfer resource index invalid"),
            Self::NoResource => write!(f, "No transfer resource"),
            Self::BusExpiry => write!(f, "Bus expiry"),
            Self::UnknownCommandStatus => write!(f, "Unknown command status"),
            Self::CommandTimeout => write!(f, "Endpoint command timeout"),
            Self::InvalidLength => write!(f, "Invalid buffer length"),
            Self::RingFull => write!(f, "Descriptor ring full"),
            Self::InvalidLinkState => write!(f, "Invalid link state"),
            Self::LinkStateTimeout => write!(f, "Link state change timeout"),
            Self::LinkStateChangeFailed => write!(f, "Link state change failed"),
            Self::RemoteWakeupFailed => write!(f, "Remote wakeup failed"),
            Self::AddressOutOfRange => write!(f, "Device address out of range"),
            Self::AlreadyConfigured => write!(f, "Device already configured"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::Unsupported => write!(f, "Unsupported operation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_are_distinct_from_timeout() {
        assert_eq!(UsbError::NoResource.category(), ErrorCategory::Command);
        assert_eq!(UsbError::BusExpiry.category(), ErrorCategory::Command);
        assert!(!UsbError::NoResource.is_timeout());
        assert!(UsbError::CommandTimeout.is_timeout());
        assert_ne!(UsbError::NoResource, UsbError::CommandTimeout);
    }

    #[test]
    fn address_errors_classified() {
        assert_eq!(UsbError::AddressOutOfRange.category(), ErrorCategory::Address);
        assert_eq!(UsbError::AlreadyConfigured.category(), ErrorCategory::Address);
    }
}
