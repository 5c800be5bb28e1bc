//! The advertising manager.
//!
//! Owns the controller's pool of advertising sets and drives the command
//! sequences behind every operation: registration, the multi-step start
//! chains, enable timeouts, resolvable-private-address rotation and the
//! reactions to controller-initiated set termination.
//!
//! Every sequence is a straight line of awaited commands; the first
//! failing step aborts the rest. The periodic work (rotation, timeouts,
//! terminated events) runs on [`AdvertisingManager::run`], which the
//! application drives alongside its other tasks on the same executor, so
//! all mutation of instance state is serialised.

use core::cell::RefCell;

use bt_hci::param::{AddrKind, BdAddr, ConnHandle};
use embassy_futures::select::{select, select3, Either, Either3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;
use rand_core::RngCore;

use crate::advertise::{self, AdvertisementParameters, PeriodicAdvertisingParameters};
use crate::config::{ADV_PAYLOAD_MAX, MAX_ADV_INSTANCES, PRIVATE_ADDR_ROTATION_INTERVAL, TERMINATED_QUEUE_SIZE};
use crate::fragment::Fragments;
use crate::hci::{AdvSetTerminated, AdvertiserHci, CmdError};
use crate::instance::InstanceTable;
use crate::{rpa, Address, AdvError, Error};

/// Local-privacy configuration: advertise from resolvable private
/// addresses derived from the device identity resolving key, rotating
/// them periodically.
pub struct PrivacyConfig {
    irk: u128,
    /// Interval between address rotations.
    pub interval: Duration,
}

impl PrivacyConfig {
    /// Privacy under the given identity resolving key (most significant
    /// byte first), rotating at [`PRIVATE_ADDR_ROTATION_INTERVAL`].
    pub fn new(irk: [u8; 16]) -> Self {
        Self {
            irk: u128::from_be_bytes(irk),
            interval: PRIVATE_ADDR_ROTATION_INTERVAL,
        }
    }
}

/// Receiver of manager events that outlive the call that caused them.
///
/// All methods default to doing nothing; implement the ones of interest
/// and pass the handler to [`AdvertisingManager::run_with_handler`].
pub trait EventHandler {
    /// An enable timeout elapsed and the set was disabled.
    fn on_advertising_set_stopped(&self, _inst_id: u8, _status: Result<(), Error>) {}

    /// A set terminated into a connection while privacy is enabled; the
    /// connection's local address is the instance's current private
    /// address.
    fn on_connection_address_updated(&self, _conn_handle: ConnHandle, _address: Address) {}
}

struct DummyHandler;
impl EventHandler for DummyHandler {}

/// Multi-instance BLE advertising manager.
///
/// Create one per controller with [`AdvertisingManager::new`], then drive
/// [`run`] (or [`run_with_handler`]) while issuing operations from the
/// same executor.
///
/// [`run`]: AdvertisingManager::run
/// [`run_with_handler`]: AdvertisingManager::run_with_handler
pub struct AdvertisingManager<C, R> {
    hci: C,
    rng: RefCell<R>,
    public_address: BdAddr,
    privacy: Option<PrivacyConfig>,
    instances: RefCell<InstanceTable>,
    timer_rearm: Signal<NoopRawMutex, ()>,
    terminated: Channel<NoopRawMutex, AdvSetTerminated, TERMINATED_QUEUE_SIZE>,
}

fn flatten<E>(result: Result<(), CmdError<E>>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(CmdError::Hci(e)) => Err(Error::Hci(e)),
        Err(CmdError::Io(_)) => Err(Error::Other),
    }
}

impl<C: AdvertiserHci, R: RngCore> AdvertisingManager<C, R> {
    /// Create a new manager.
    ///
    /// Queries the controller for its supported advertising-set count and
    /// sizes the instance table to it (capped at
    /// [`MAX_ADV_INSTANCES`]). `public_address` is advertised from when
    /// `privacy` is `None`. On controllers that cannot use advertising
    /// handle 0, the handle is registered here and never handed out.
    pub async fn new(
        controller: C,
        rng: R,
        public_address: BdAddr,
        privacy: Option<PrivacyConfig>,
    ) -> Result<Self, AdvError<C::Error>> {
        let count = usize::from(controller.read_instance_count().await?);
        if count > MAX_ADV_INSTANCES {
            warn!("[adv] controller supports {} sets, tracking {}", count, MAX_ADV_INSTANCES);
        }

        let manager = Self {
            hci: controller,
            rng: RefCell::new(rng),
            public_address,
            privacy,
            instances: RefCell::new(InstanceTable::new(count)),
            timer_rearm: Signal::new(),
            terminated: Channel::new(),
        };

        if manager.hci.quirk_advertiser_zero_handle() {
            let _ = manager.register_advertiser();
        }

        Ok(manager)
    }

    /// Number of advertising instances the manager tracks.
    pub fn instance_count(&self) -> usize {
        self.instances.borrow().len()
    }

    /// Claim the lowest-indexed free advertising instance.
    ///
    /// With privacy enabled the instance gets a fresh resolvable private
    /// address and its rotation timer starts; otherwise it advertises
    /// from the device public address.
    pub fn register_advertiser(&self) -> Result<u8, Error> {
        let mut instances = self.instances.borrow_mut();
        let Some(slot) = instances.allocate() else {
            info!("[adv] no free advertiser instance");
            return Err(Error::TooManyAdvertisers);
        };

        let inst_id = slot.inst_id;
        match &self.privacy {
            Some(privacy) => {
                slot.own_address_kind = AddrKind::RANDOM;
                slot.own_address = rpa::generate(privacy.irk, &mut *self.rng.borrow_mut());
                slot.next_rotation = Some(Instant::now() + privacy.interval);
            }
            None => {
                slot.own_address_kind = AddrKind::PUBLIC;
                slot.own_address = self.public_address;
            }
        }
        drop(instances);

        if self.privacy.is_some() {
            self.timer_rearm.signal(());
        }
        trace!("[adv] registered instance {}", inst_id);
        Ok(inst_id)
    }

    /// Release an advertising instance.
    ///
    /// Issues a best-effort disable and disarms the instance's rotation
    /// and timeout timers.
    pub async fn unregister(&self, inst_id: u8) -> Result<(), Error> {
        {
            let mut instances = self.instances.borrow_mut();
            let slot = instances.get_mut(inst_id).ok_or(Error::InvalidInstance)?;
            slot.release();
        }
        trace!("[adv] unregistered instance {}", inst_id);

        if let Err(e) = flatten(self.hci.set_advertising_enable(false, inst_id, 0x0000, 0x00).await) {
            warn!("[adv] instance {}: disable on unregister failed: {:?}", inst_id, e);
        }
        Ok(())
    }

    /// The address an instance currently advertises from.
    pub fn own_address(&self, inst_id: u8) -> Result<Address, Error> {
        let instances = self.instances.borrow();
        let slot = instances.get(inst_id).ok_or(Error::InvalidInstance)?;
        if !slot.in_use {
            return Err(Error::NotInUse);
        }
        Ok(Address {
            kind: slot.own_address_kind,
            addr: slot.own_address,
        })
    }

    /// Configure and start advertising on an already-registered instance.
    ///
    /// Runs the parameter, random-address, data and scan-response steps,
    /// then enables the set, optionally with a timeout after which the
    /// set is disabled again (reported through the event handler). A
    /// failing step aborts the sequence and surfaces its error; the
    /// registration is left as-is.
    pub async fn start_advertising(
        &self,
        inst_id: u8,
        params: &AdvertisementParameters,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), AdvError<C::Error>> {
        self.start_chain(inst_id, params, adv_data, scan_rsp_data, None, timeout)
            .await?;
        Ok(())
    }

    /// Register, configure and start a complete advertising set in one
    /// call, with optional periodic advertising.
    ///
    /// Returns the instance id and the transmit power the controller
    /// selected. If any step after registration fails, the instance is
    /// unregistered before the error is returned.
    pub async fn start_advertising_set(
        &self,
        params: &AdvertisementParameters,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
        periodic_params: &PeriodicAdvertisingParameters,
        periodic_data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(u8, i8), AdvError<C::Error>> {
        let inst_id = self
            .register_advertiser()
            .inspect_err(|_| error!("[adv] registering advertiser failed"))?;

        let periodic = periodic_params.enable.then_some((periodic_params, periodic_data));
        match self
            .start_chain(inst_id, params, adv_data, scan_rsp_data, periodic, timeout)
            .await
        {
            Ok(tx_power) => Ok((inst_id, tx_power)),
            Err(e) => {
                let _ = self.unregister(inst_id).await;
                Err(e)
            }
        }
    }

    async fn start_chain(
        &self,
        inst_id: u8,
        params: &AdvertisementParameters,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
        periodic: Option<(&PeriodicAdvertisingParameters, &[u8])>,
        timeout: Option<Duration>,
    ) -> Result<i8, AdvError<C::Error>> {
        let own_address = {
            let mut instances = self.instances.borrow_mut();
            let slot = instances.get_mut(inst_id).ok_or(Error::InvalidInstance)?;
            if !slot.in_use {
                error!("[adv] instance {} not in use", inst_id);
                return Err(Error::NotInUse.into());
            }
            // Recorded before the data steps; flags injection reads it.
            slot.timeout = timeout;
            slot.own_address
        };

        let tx_power = self
            .set_parameters(inst_id, params)
            .await
            .inspect_err(|_| error!("[adv] instance {}: setting parameters failed", inst_id))?;

        self.hci
            .set_random_address(inst_id, own_address)
            .await
            .inspect_err(|_| error!("[adv] instance {}: setting random address failed", inst_id))?;

        self.set_data(inst_id, false, adv_data)
            .await
            .inspect_err(|_| error!("[adv] instance {}: setting advertise data failed", inst_id))?;

        self.set_data(inst_id, true, scan_rsp_data)
            .await
            .inspect_err(|_| error!("[adv] instance {}: setting scan response data failed", inst_id))?;

        if let Some((periodic_params, periodic_data)) = periodic {
            self.set_periodic_advertising_parameters(inst_id, periodic_params)
                .await
                .inspect_err(|_| error!("[adv] instance {}: setting periodic parameters failed", inst_id))?;

            self.set_periodic_advertising_data(inst_id, periodic_data)
                .await
                .inspect_err(|_| error!("[adv] instance {}: setting periodic data failed", inst_id))?;

            self.set_periodic_advertising_enable(inst_id, true)
                .await
                .inspect_err(|_| error!("[adv] instance {}: enabling periodic advertising failed", inst_id))?;
        }

        self.enable(inst_id, true, timeout)
            .await
            .inspect_err(|_| error!("[adv] instance {}: enabling advertiser failed", inst_id))?;

        Ok(tx_power)
    }

    /// Configure an instance's advertising parameters.
    ///
    /// Returns the transmit power the controller selected; it is stored
    /// on the instance and patched into TX Power Level structures of any
    /// data set afterwards.
    pub async fn set_parameters(
        &self,
        inst_id: u8,
        params: &AdvertisementParameters,
    ) -> Result<i8, AdvError<C::Error>> {
        let properties = params.properties.to_bits();
        let (own_address_kind, own_address) = {
            let mut instances = self.instances.borrow_mut();
            let slot = instances.get_mut(inst_id).ok_or(Error::InvalidInstance)?;
            if !slot.in_use {
                error!("[adv] set_parameters: instance {} not in use", inst_id);
                return Err(Error::NotInUse.into());
            }
            slot.advertising_event_properties = properties;
            slot.tx_power = params.tx_power;
            (slot.own_address_kind, slot.own_address)
        };
        trace!("[adv] instance {}: set parameters", inst_id);

        let tx_power = self
            .hci
            .set_parameters(
                inst_id,
                properties,
                params.interval_min,
                params.interval_max,
                params.channel_map,
                own_address_kind,
                own_address,
                AddrKind::PUBLIC,
                BdAddr::default(),
                params.filter_policy,
                params.tx_power,
                params.primary_phy,
                0x01,
                params.secondary_phy,
                0x01, // TODO: allocate a distinct SID per advertising set
                params.scan_request_notification,
            )
            .await?;

        if let Some(slot) = self.instances.borrow_mut().get_mut(inst_id) {
            slot.tx_power = tx_power;
        }
        Ok(tx_power)
    }

    /// Set the advertising or scan-response payload of an instance.
    ///
    /// Legacy connectable advertising data gets a flags structure
    /// prepended (limited discoverable while an enable timeout is
    /// pending, general otherwise), TX Power Level structures are
    /// rewritten to the controller-selected power, and the result is
    /// fragmented across as many data commands as it needs.
    pub async fn set_data(
        &self,
        inst_id: u8,
        scan_response: bool,
        data: &[u8],
    ) -> Result<(), AdvError<C::Error>> {
        let (properties, limited, tx_power) = {
            let instances = self.instances.borrow();
            let slot = instances.get(inst_id).ok_or(Error::InvalidInstance)?;
            if !slot.in_use {
                error!("[adv] set_data: instance {} not in use", inst_id);
                return Err(Error::NotInUse.into());
            }
            (slot.advertising_event_properties, slot.timeout.is_some(), slot.tx_power)
        };
        trace!("[adv] instance {}: set data, scan_response={} len={}", inst_id, scan_response, data.len());

        let mut payload: Vec<u8, ADV_PAYLOAD_MAX> = Vec::new();
        if !scan_response && advertise::is_legacy_connectable(properties) {
            payload
                .extend_from_slice(&advertise::discoverable_flags(limited))
                .map_err(|_| Error::InsufficientSpace)?;
        }
        payload.extend_from_slice(data).map_err(|_| Error::InsufficientSpace)?;
        advertise::patch_tx_power(&mut payload, tx_power);

        for (operation, chunk) in Fragments::new(&payload) {
            if scan_response {
                self.hci.set_scan_response_data(inst_id, operation, 0x01, chunk).await?;
            } else {
                self.hci.set_advertising_data(inst_id, operation, 0x01, chunk).await?;
            }
        }
        Ok(())
    }

    /// Start or stop advertising on an instance.
    ///
    /// Enabling with a timeout arms a one-shot timer that disables the
    /// set when it elapses; the deadline is armed even when the enable
    /// command itself failed, matching the controller-side bookkeeping.
    /// Disabling (and enabling without a timeout) cancels any armed
    /// timeout first.
    pub async fn enable(
        &self,
        inst_id: u8,
        enable: bool,
        timeout: Option<Duration>,
    ) -> Result<(), AdvError<C::Error>> {
        self.check_in_use(inst_id).inspect_err(|_| {
            error!("[adv] enable: invalid or inactive instance {}", inst_id);
        })?;
        trace!("[adv] instance {}: enable={}", inst_id, enable);

        match timeout {
            Some(timeout) if enable => {
                let result = self.hci.set_advertising_enable(true, inst_id, 0x0000, 0x00).await;
                if let Some(slot) = self.instances.borrow_mut().get_mut(inst_id) {
                    slot.timeout = Some(timeout);
                    slot.timeout_at = Some(Instant::now() + timeout);
                }
                self.timer_rearm.signal(());
                result?;
            }
            _ => {
                {
                    let mut instances = self.instances.borrow_mut();
                    if let Some(slot) = instances.get_mut(inst_id) {
                        slot.timeout = None;
                        slot.timeout_at = None;
                    }
                }
                self.hci.set_advertising_enable(enable, inst_id, 0x0000, 0x00).await?;
            }
        }
        Ok(())
    }

    /// Configure the periodic-advertising train of an instance.
    pub async fn set_periodic_advertising_parameters(
        &self,
        inst_id: u8,
        params: &PeriodicAdvertisingParameters,
    ) -> Result<(), AdvError<C::Error>> {
        self.check_in_use(inst_id)?;
        trace!("[adv] instance {}: set periodic parameters", inst_id);

        self.hci
            .set_periodic_advertising_parameters(inst_id, params.interval_min, params.interval_max, params.properties)
            .await?;
        Ok(())
    }

    /// Set the periodic-advertising payload of an instance, fragmenting
    /// as needed.
    pub async fn set_periodic_advertising_data(&self, inst_id: u8, data: &[u8]) -> Result<(), AdvError<C::Error>> {
        self.check_in_use(inst_id)?;
        trace!("[adv] instance {}: set periodic data, len={}", inst_id, data.len());

        for (operation, chunk) in Fragments::new(data) {
            self.hci.set_periodic_advertising_data(inst_id, operation, chunk).await?;
        }
        Ok(())
    }

    /// Start or stop the periodic-advertising train of an instance.
    pub async fn set_periodic_advertising_enable(&self, inst_id: u8, enable: bool) -> Result<(), AdvError<C::Error>> {
        self.check_in_use(inst_id)?;
        trace!("[adv] instance {}: periodic enable={}", inst_id, enable);

        self.hci.set_periodic_advertising_enable(enable, inst_id).await?;
        Ok(())
    }

    /// Feed a controller "advertising set terminated" event to the
    /// manager.
    ///
    /// Non-blocking; the event is processed by the run loop. Call this
    /// from wherever controller events are demultiplexed.
    pub fn advertising_set_terminated(&self, event: AdvSetTerminated) {
        if self.terminated.try_send(event).is_err() {
            warn!("[adv] terminated-event queue full, dropping event for handle {}", event.adv_handle);
        }
    }

    /// Run the manager's timer and event processing with a no-op event
    /// handler.
    pub async fn run(&self) -> Result<(), AdvError<C::Error>> {
        self.run_with_handler(&DummyHandler).await
    }

    /// Run the manager's timer and event processing.
    ///
    /// Drives address rotation, timeout-driven disables and the reaction
    /// to terminated sets. Must run on the same executor the operations
    /// are issued from; it never returns.
    pub async fn run_with_handler(&self, handler: &dyn EventHandler) -> Result<(), AdvError<C::Error>> {
        loop {
            let event = match self.next_deadline() {
                Some(deadline) => {
                    match select3(self.terminated.receive(), self.timer_rearm.wait(), Timer::at(deadline)).await {
                        Either3::First(event) => Some(event),
                        Either3::Second(()) | Either3::Third(()) => None,
                    }
                }
                None => match select(self.terminated.receive(), self.timer_rearm.wait()).await {
                    Either::First(event) => Some(event),
                    Either::Second(()) => None,
                },
            };

            if let Some(event) = event {
                self.process_terminated(event, handler).await;
            }
            self.service_timers(handler).await;
        }
    }

    fn check_in_use(&self, inst_id: u8) -> Result<(), Error> {
        let instances = self.instances.borrow();
        let slot = instances.get(inst_id).ok_or(Error::InvalidInstance)?;
        if !slot.in_use {
            return Err(Error::NotInUse);
        }
        Ok(())
    }

    /// Earliest armed rotation or timeout deadline across all instances.
    fn next_deadline(&self) -> Option<Instant> {
        let instances = self.instances.borrow();
        let mut next: Option<Instant> = None;
        for slot in instances.iter() {
            let rotation = if slot.in_use { slot.next_rotation } else { None };
            for deadline in [slot.timeout_at, rotation] {
                if let Some(at) = deadline {
                    next = Some(match next {
                        Some(current) if current <= at => current,
                        _ => at,
                    });
                }
            }
        }
        next
    }

    /// Handle every deadline that has passed: rotate due private
    /// addresses and disable timed-out sets.
    async fn service_timers(&self, handler: &dyn EventHandler) {
        let now = Instant::now();

        if let Some(privacy) = &self.privacy {
            loop {
                let due = {
                    let mut instances = self.instances.borrow_mut();
                    let mut rng = self.rng.borrow_mut();
                    let slot = instances
                        .iter_mut()
                        .find(|slot| slot.in_use && slot.next_rotation.is_some_and(|at| at <= now));
                    match slot {
                        Some(slot) => {
                            slot.own_address = rpa::generate(privacy.irk, &mut *rng);
                            slot.next_rotation = Some(now + privacy.interval);
                            Some((slot.inst_id, slot.own_address))
                        }
                        None => None,
                    }
                };
                let Some((inst_id, address)) = due else { break };

                trace!("[adv] instance {}: rotating private address", inst_id);
                if let Err(e) = flatten(self.hci.set_random_address(inst_id, address).await) {
                    warn!("[adv] instance {}: pushing rotated address failed: {:?}", inst_id, e);
                }
            }
        }

        loop {
            let due = {
                let mut instances = self.instances.borrow_mut();
                let slot = instances
                    .iter_mut()
                    .find(|slot| slot.timeout_at.is_some_and(|at| at <= now));
                match slot {
                    Some(slot) => {
                        slot.timeout = None;
                        slot.timeout_at = None;
                        Some(slot.inst_id)
                    }
                    None => None,
                }
            };
            let Some(inst_id) = due else { break };

            debug!("[adv] instance {}: advertising timeout", inst_id);
            let status = self.enable(inst_id, false, None).await.map_err(|e| match e {
                AdvError::Adv(e) => e,
                AdvError::Controller(_) => Error::Other,
            });
            handler.on_advertising_set_stopped(inst_id, status);
        }
    }

    /// React to a terminated set: with privacy on, report the address the
    /// new connection uses; then re-enable the set, unless it was
    /// directed advertising, which is one-shot and returns its handle to
    /// the pool.
    async fn process_terminated(&self, event: AdvSetTerminated, handler: &dyn EventHandler) {
        debug!("[adv] set terminated: handle {} status {:?}", event.adv_handle, event.status);

        let state = {
            let instances = self.instances.borrow();
            instances.get(event.adv_handle).map(|slot| {
                (
                    slot.in_use,
                    slot.advertising_event_properties,
                    Address {
                        kind: slot.own_address_kind,
                        addr: slot.own_address,
                    },
                )
            })
        };
        let Some((in_use, properties, address)) = state else {
            warn!("[adv] terminated event for unknown handle {}", event.adv_handle);
            return;
        };

        if self.privacy.is_some() {
            handler.on_connection_address_updated(event.conn_handle, address);
        }

        if !in_use {
            return;
        }

        if advertise::is_directed(properties) {
            // Directed sets are one-shot; the handle goes back to the pool.
            if let Some(slot) = self.instances.borrow_mut().get_mut(event.adv_handle) {
                slot.release();
            }
        } else {
            trace!("[adv] instance {}: re-enabling after termination", event.adv_handle);
            if let Err(e) = flatten(self.hci.set_advertising_enable(true, event.adv_handle, 0x0000, 0x00).await) {
                warn!("[adv] instance {}: re-enable failed: {:?}", event.adv_handle, e);
            }
        }
    }
}
