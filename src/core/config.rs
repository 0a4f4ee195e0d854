//! # Global container configuration.
//!
//! Provides [`Config`], the centralized settings for one container.
//!
//! ## Sentinel values
//! - All capacities are clamped to a minimum of 1 by their accessors.
//! - `grace = 0s` means teardown does not wait for side jobs at all.

use std::time::Duration;

use crate::core::queue::InputStrategy;

/// Global configuration for one container.
///
/// Defines:
/// - **Input discipline**: which ordering strategy the queue applies
/// - **Capacities**: input queue, event queue, notification bus
/// - **Teardown behavior**: grace period for side jobs to stop
///
/// ## Field semantics
/// - `strategy`: ordering discipline for inbound inputs (see
///   [`InputStrategy`])
/// - `inputs_capacity`: bounded input queue size; `try_send_now` fails with
///   `QueueFull` when reached, `send` waits for space
/// - `events_capacity`: bounded hand-off queue into the event dispatcher
///   (the dispatcher's own buffer while no handler is attached is unbounded)
/// - `bus_capacity`: notification bus ring buffer; lagging receivers skip
///   the oldest items
/// - `grace`: maximum wait for side jobs to stop during shutdown or clear
#[derive(Clone, Debug)]
pub struct Config {
    /// Ordering discipline for inbound inputs.
    pub strategy: InputStrategy,

    /// Capacity of the input queue (min 1; clamped).
    pub inputs_capacity: usize,

    /// Capacity of the event hand-off queue (min 1; clamped).
    pub events_capacity: usize,

    /// Capacity of the notification bus ring buffer (min 1; clamped).
    pub bus_capacity: usize,

    /// Maximum time to wait for side jobs to stop cooperatively before
    /// reporting them stuck.
    pub grace: Duration,
}

impl Config {
    /// Returns the input queue capacity clamped to a minimum of 1.
    #[inline]
    pub fn inputs_capacity_clamped(&self) -> usize {
        self.inputs_capacity.max(1)
    }

    /// Returns the event queue capacity clamped to a minimum of 1.
    #[inline]
    pub fn events_capacity_clamped(&self) -> usize {
        self.events_capacity.max(1)
    }

    /// Returns the bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `strategy = InputStrategy::Fifo` (strict serialization)
    /// - `inputs_capacity = 64`
    /// - `events_capacity = 64`
    /// - `bus_capacity = 1024`
    /// - `grace = 10s`
    fn default() -> Self {
        Self {
            strategy: InputStrategy::Fifo,
            inputs_capacity: 64,
            events_capacity: 64,
            bus_capacity: 1024,
            grace: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacities_clamp_to_one() {
        let cfg = Config {
            inputs_capacity: 0,
            events_capacity: 0,
            bus_capacity: 0,
            ..Config::default()
        };
        assert_eq!(cfg.inputs_capacity_clamped(), 1);
        assert_eq!(cfg.events_capacity_clamped(), 1);
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
