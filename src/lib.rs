#![no_std]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

use bt_hci::param::{AddrKind, BdAddr};

mod fmt;

pub mod advertise;
pub mod config;
mod fragment;
pub mod hci;
mod instance;
mod manager;
mod rpa;

pub use manager::{AdvertisingManager, EventHandler, PrivacyConfig};

pub mod prelude {
    //! Convenience include of the commonly used types.
    pub use bt_hci::param::{AddrKind, BdAddr, ConnHandle, Status};

    pub use crate::advertise::*;
    pub use crate::hci::{AdvSetTerminated, AdvertiserHci, CmdError, Operation};
    pub use crate::{Address, AdvError, AdvertisingManager, Error, EventHandler, PrivacyConfig};
}

/// A BLE device address with its type.
///
/// The six address bytes are in controller (little-endian) order, so the
/// most significant byte of the address is `addr` byte 5.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    /// Address type.
    pub kind: AddrKind,
    /// Address value.
    pub addr: BdAddr,
}

impl Address {
    /// Create a new random address.
    pub fn random(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(val),
        }
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let a = self.addr.into_inner();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[5], a[4], a[3], a[2], a[1], a[0]
        )
    }
}

/// Errors returned by the advertising manager.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A controller command completed with a non-success status.
    Hci(bt_hci::param::Error),
    /// The instance id does not name a slot in the table.
    InvalidInstance,
    /// The instance exists but no advertiser is registered on it.
    NotInUse,
    /// Every advertising instance is already registered.
    TooManyAdvertisers,
    /// The advertising payload does not fit the staging buffer.
    InsufficientSpace,
    /// Other error.
    Other,
}

/// Errors returned across the controller seam: either a manager-level
/// [`Error`] or the transport error of the controller implementation.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvError<E> {
    /// Error from the controller transport.
    Controller(E),
    /// Error from the manager.
    Adv(Error),
}

impl<E> From<Error> for AdvError<E> {
    fn from(value: Error) -> Self {
        Self::Adv(value)
    }
}

impl From<bt_hci::param::Error> for Error {
    fn from(error: bt_hci::param::Error) -> Self {
        Self::Hci(error)
    }
}

impl<E> From<bt_hci::param::Error> for AdvError<E> {
    fn from(error: bt_hci::param::Error) -> Self {
        Self::Adv(Error::Hci(error))
    }
}

impl<E> From<bt_hci::cmd::Error<E>> for AdvError<E> {
    fn from(error: bt_hci::cmd::Error<E>) -> Self {
        match error {
            bt_hci::cmd::Error::Hci(p) => Self::Adv(Error::Hci(p)),
            bt_hci::cmd::Error::Io(p) => Self::Controller(p),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use rand_core::RngCore;

    /// Deterministic xorshift generator for tests.
    pub(crate) struct TestRng(u64);

    impl TestRng {
        pub(crate) fn new(seed: u64) -> Self {
            Self(seed.max(1))
        }
    }

    impl RngCore for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(8) {
                let bytes = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }
}
