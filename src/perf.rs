//! Driver statistics
//!
//! Cheap relaxed counters updated from the event and command paths.

use core::sync::atomic::{AtomicU32, Ordering};

/// Counters for controller activity
pub struct DriverStats {
    /// Interrupts that found pending events
    pub interrupts: AtomicU32,

    /// Interrupts with an empty event buffer
    pub spurious_interrupts: AtomicU32,

    /// Event words drained
    pub events: AtomicU32,

    /// Device-level events
    pub device_events: AtomicU32,

    /// Endpoint-level events
    pub endpoint_events: AtomicU32,

    /// Endpoint commands issued
    pub commands_issued: AtomicU32,

    /// Endpoint commands answered with an error status
    pub command_failures: AtomicU32,

    /// Endpoint commands that never completed
    pub command_timeouts: AtomicU32,

    /// Data transfers completed (EP0 data stage and ring descriptors)
    pub transfers_completed: AtomicU32,

    /// Bytes moved by completed transfers (saturating)
    pub bytes_transferred: AtomicU32,
}

impl DriverStats {
    /// Create a zeroed counter set
    pub const fn new() -> Self {
        Self {
            interrupts: AtomicU32::new(0),
            spurious_interrupts: AtomicU32::new(0),
            events: AtomicU32::new(0),
            device_events: AtomicU32::new(0),
            endpoint_events: AtomicU32::new(0),
            commands_issued: AtomicU32::new(0),
            command_failures: AtomicU32::new(0),
            command_timeouts: AtomicU32::new(0),
            transfers_completed: AtomicU32::new(0),
            bytes_transferred: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn record_interrupt(&self, spurious: bool) {
        if spurious {
            self.spurious_interrupts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.interrupts.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub(crate) fn record_event(&self, device: bool) {
        self.events.fetch_add(1, Ordering::Relaxed);
        if device {
            self.device_events.fetch_add(1, Ordering::Relaxed);
        } else {
            self.endpoint_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub(crate) fn record_command(&self) {
        self.commands_issued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_command_failure(&self, timeout: bool) {
        if timeout {
            self.command_timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.command_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a completed transfer
    #[inline(always)]
    pub(crate) fn record_transfer(&self, bytes: u32) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        let _ = self.bytes_transferred.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |current| Some(current.saturating_add(bytes)),
        );
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            spurious_interrupts: self.spurious_interrupts.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            device_events: self.device_events.load(Ordering::Relaxed),
            endpoint_events: self.endpoint_events.load(Ordering::Relaxed),
            commands_issued: self.commands_issued.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.interrupts,
            &self.spurious_interrupts,
            &self.events,
            &self.device_events,
            &self.endpoint_events,
            &self.commands_issued,
            &self.command_failures,
            &self.command_timeouts,
            &self.transfers_completed,
            &self.bytes_transferred,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for DriverStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`DriverStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub interrupts: u32,
    pub spurious_interrupts: u32,
    pub events: u32,
    pub device_events: u32,
    pub endpoint_events: u32,
    pub commands_issued: u32,
    pub command_failures: u32,
    pub command_timeouts: u32,
    pub transfers_completed: u32,
    pub bytes_transferred: u32,
}

impl StatsSnapshot {
    /// Fraction of issued commands that failed or timed out, in percent
    pub fn command_error_rate(&self) -> u32 {
        if self.commands_issued == 0 {
            return 0;
        }
        let errors = self.command_failures + self.command_timeouts;
        errors.saturating_mul(100) / self.commands_issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_stats() {
        let stats = DriverStats::new();

        stats.record_interrupt(false);
        stats.record_interrupt(true);
        stats.record_event(true);
        stats.record_event(false);
        stats.record_event(false);
        for _ in 0..4 {
            stats.record_command();
        }
        stats.record_command_failure(true);
        stats.record_transfer(512);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.interrupts, 1);
        assert_eq!(snapshot.spurious_interrupts, 1);
        assert_eq!(snapshot.events, 3);
        assert_eq!(snapshot.device_events, 1);
        assert_eq!(snapshot.endpoint_events, 2);
        assert_eq!(snapshot.command_timeouts, 1);
        assert_eq!(snapshot.command_error_rate(), 25);
        assert_eq!(snapshot.bytes_transferred, 512);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn byte_counter_saturates() {
        let stats = DriverStats::new();
        stats.record_transfer(u32::MAX);
        stats.record_transfer(10);
        assert_eq!(stats.snapshot().bytes_transferred, u32::MAX);
    }
}
