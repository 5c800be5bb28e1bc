//! Per-handle advertising instance records and the fixed instance table.

use bt_hci::param::{AddrKind, BdAddr};
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::config::MAX_ADV_INSTANCES;

/// State of one controller advertising handle.
///
/// A record exists for every handle the controller reports, for the life of
/// the manager; `in_use` tracks whether a client currently owns it.
pub(crate) struct AdvertisingInstance {
    pub(crate) inst_id: u8,
    pub(crate) in_use: bool,
    pub(crate) advertising_event_properties: u16,
    /// Transmit power the controller accepted in the last SetParameters
    /// completion, re-injected into TX Power Level AD structures.
    pub(crate) tx_power: i8,
    pub(crate) own_address_kind: AddrKind,
    pub(crate) own_address: BdAddr,
    /// Requested enable timeout; `None` when the set advertises until told
    /// to stop.
    pub(crate) timeout: Option<Duration>,
    /// Armed deadline of the one-shot timeout.
    pub(crate) timeout_at: Option<Instant>,
    /// Next resolvable-private-address rotation, when privacy is enabled.
    pub(crate) next_rotation: Option<Instant>,
}

impl AdvertisingInstance {
    fn new(inst_id: u8) -> Self {
        Self {
            inst_id,
            in_use: false,
            advertising_event_properties: 0,
            tx_power: 0,
            own_address_kind: AddrKind::PUBLIC,
            own_address: BdAddr::default(),
            timeout: None,
            timeout_at: None,
            next_rotation: None,
        }
    }

    /// Return the handle to the pool, disarming its timers.
    pub(crate) fn release(&mut self) {
        self.in_use = false;
        self.timeout = None;
        self.timeout_at = None;
        self.next_rotation = None;
    }
}

/// The pool of advertising instances, sized once from the controller's
/// supported-set count.
pub(crate) struct InstanceTable {
    slots: Vec<AdvertisingInstance, MAX_ADV_INSTANCES>,
}

impl InstanceTable {
    pub(crate) fn new(count: usize) -> Self {
        let mut slots = Vec::new();
        for inst_id in 0..count.min(MAX_ADV_INSTANCES) {
            let _ = slots.push(AdvertisingInstance::new(inst_id as u8));
        }
        Self { slots }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Claim the lowest-indexed free handle.
    pub(crate) fn allocate(&mut self) -> Option<&mut AdvertisingInstance> {
        let slot = self.slots.iter_mut().find(|slot| !slot.in_use)?;
        slot.in_use = true;
        Some(slot)
    }

    pub(crate) fn get(&self, inst_id: u8) -> Option<&AdvertisingInstance> {
        self.slots.get(usize::from(inst_id))
    }

    pub(crate) fn get_mut(&mut self, inst_id: u8) -> Option<&mut AdvertisingInstance> {
        self.slots.get_mut(usize::from(inst_id))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &AdvertisingInstance> {
        self.slots.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut AdvertisingInstance> {
        self.slots.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_allocate_dense_from_zero() {
        let mut table = InstanceTable::new(3);
        assert_eq!(table.allocate().map(|i| i.inst_id), Some(0));
        assert_eq!(table.allocate().map(|i| i.inst_id), Some(1));
        assert_eq!(table.allocate().map(|i| i.inst_id), Some(2));
        assert!(table.allocate().is_none());
    }

    #[test]
    fn released_handle_is_reused_first() {
        let mut table = InstanceTable::new(3);
        table.allocate();
        table.allocate();
        table.allocate();

        table.get_mut(1).unwrap().release();
        assert_eq!(table.allocate().map(|i| i.inst_id), Some(1));
    }

    #[test]
    fn release_disarms_timers() {
        let mut table = InstanceTable::new(1);
        let slot = table.allocate().unwrap();
        slot.timeout = Some(Duration::from_secs(30));
        slot.timeout_at = Some(Instant::now() + Duration::from_secs(30));
        slot.next_rotation = Some(Instant::now());
        slot.release();

        let slot = table.get(0).unwrap();
        assert!(!slot.in_use);
        assert!(slot.timeout.is_none());
        assert!(slot.timeout_at.is_none());
        assert!(slot.next_rotation.is_none());
    }

    #[test]
    fn table_is_capped_at_capacity() {
        let table = InstanceTable::new(64);
        assert_eq!(table.len(), MAX_ADV_INSTANCES);
    }
}
