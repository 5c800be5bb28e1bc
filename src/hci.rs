//! The HCI interface consumed by the advertising manager.
//!
//! The manager does not talk to a transport directly; it drives the LE
//! extended-advertising command set through [`AdvertiserHci`] and receives
//! the controller's out-of-band set-terminated events as
//! [`AdvSetTerminated`] values. Anything able to issue these commands can
//! back the trait; tests use a recording mock.

use bt_hci::param::{AddrKind, BdAddr, ConnHandle, Status};

/// Errors produced by a single HCI command: a non-zero status from the
/// controller, or a transport failure below it.
pub use bt_hci::cmd::Error as CmdError;

/// Operation tag of an advertising-data command, describing which part of
/// the full payload a fragment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Operation {
    /// Middle fragment of fragmented data.
    Intermediate = 0x00,
    /// First fragment of fragmented data.
    First = 0x01,
    /// Last fragment of fragmented data.
    Last = 0x02,
    /// Complete payload in a single fragment.
    Complete = 0x03,
}

/// An unsolicited LE Advertising Set Terminated event.
///
/// The controller emits one when an advertising set stops on its own,
/// either because a connection was created from it or because its duration
/// expired. Feed these to
/// [`AdvertisingManager::advertising_set_terminated`].
///
/// [`AdvertisingManager::advertising_set_terminated`]: crate::AdvertisingManager::advertising_set_terminated
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvSetTerminated {
    /// Why the set terminated.
    pub status: Status,
    /// The advertising handle that stopped.
    pub adv_handle: u8,
    /// Connection created from the set, when `status` is success.
    pub conn_handle: ConnHandle,
    /// Number of extended advertising events sent before termination.
    pub num_completed_ext_adv_events: u8,
}

/// The LE extended-advertising command surface required by the manager.
///
/// One method per command; each resolves once the controller reports the
/// command complete. A non-zero completion status surfaces as
/// [`CmdError::Hci`], a transport fault as [`CmdError::Io`].
#[allow(async_fn_in_trait)]
pub trait AdvertiserHci {
    /// Transport error type.
    type Error;

    /// Query how many advertising sets the controller supports.
    async fn read_instance_count(&self) -> Result<u8, CmdError<Self::Error>>;

    /// Configure an advertising set.
    ///
    /// Returns the transmit power the controller actually selected, which
    /// may differ from the requested `tx_power`.
    #[allow(clippy::too_many_arguments)]
    async fn set_parameters(
        &self,
        inst_id: u8,
        properties: u16,
        interval_min: u32,
        interval_max: u32,
        channel_map: u8,
        own_address_kind: AddrKind,
        own_address: BdAddr,
        peer_address_kind: AddrKind,
        peer_address: BdAddr,
        filter_policy: u8,
        tx_power: i8,
        primary_phy: u8,
        secondary_max_skip: u8,
        secondary_phy: u8,
        sid: u8,
        scan_request_notification: bool,
    ) -> Result<i8, CmdError<Self::Error>>;

    /// Set the random address an advertising set transmits from.
    async fn set_random_address(&self, inst_id: u8, address: BdAddr) -> Result<(), CmdError<Self::Error>>;

    /// Write one fragment of advertising data.
    async fn set_advertising_data(
        &self,
        inst_id: u8,
        operation: Operation,
        fragment_preference: u8,
        data: &[u8],
    ) -> Result<(), CmdError<Self::Error>>;

    /// Write one fragment of scan-response data.
    async fn set_scan_response_data(
        &self,
        inst_id: u8,
        operation: Operation,
        fragment_preference: u8,
        data: &[u8],
    ) -> Result<(), CmdError<Self::Error>>;

    /// Configure periodic advertising for a set.
    async fn set_periodic_advertising_parameters(
        &self,
        inst_id: u8,
        interval_min: u16,
        interval_max: u16,
        properties: u16,
    ) -> Result<(), CmdError<Self::Error>>;

    /// Write one fragment of periodic-advertising data.
    async fn set_periodic_advertising_data(
        &self,
        inst_id: u8,
        operation: Operation,
        data: &[u8],
    ) -> Result<(), CmdError<Self::Error>>;

    /// Start or stop periodic advertising on a set.
    async fn set_periodic_advertising_enable(&self, enable: bool, inst_id: u8)
        -> Result<(), CmdError<Self::Error>>;

    /// Start or stop advertising on a set.
    async fn set_advertising_enable(
        &self,
        enable: bool,
        inst_id: u8,
        duration: u16,
        max_ext_adv_events: u8,
    ) -> Result<(), CmdError<Self::Error>>;

    /// Whether the controller cannot use advertising handle 0.
    ///
    /// When `true`, the manager reserves handle 0 at construction and never
    /// hands it out.
    fn quirk_advertiser_zero_handle(&self) -> bool {
        false
    }
}
