//! Compile-time configuration.

use embassy_time::Duration;

/// Upper bound on the number of advertising instances the manager will track.
///
/// The controller reports how many advertising sets it supports at
/// construction; the instance table is sized to that count, clamped to this
/// capacity.
pub const MAX_ADV_INSTANCES: usize = 16;

/// Largest advertising-data fragment a single HCI command carries.
pub const ADV_DATA_LEN_MAX: usize = 251;

/// Largest total extended-advertising payload accepted by [`set_data`].
///
/// [`set_data`]: crate::AdvertisingManager::set_data
pub const ADV_PAYLOAD_MAX: usize = 1650;

/// Default interval between resolvable-private-address rotations.
///
/// Default: 15 minutes.
pub const PRIVATE_ADDR_ROTATION_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Capacity of the queue buffering controller "advertising set terminated"
/// events until the run loop picks them up.
pub const TERMINATED_QUEUE_SIZE: usize = 4;
