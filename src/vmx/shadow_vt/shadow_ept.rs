//! The module containing the shadow EPT and shadow VPID caches.
//!
//! The guest hypervisor may run many guests, each with its own EPT
//! pointer and VPID. Real shadow trees and real VPIDs are scarce, so both
//! are cached with LRU reuse: `NUM_OF_SHADOW_EPT` trees keyed by the
//! guest's EPT pointer, and `NUM_OF_SHADOW_VPID` real VPIDs keyed by the
//! (guest EPT pointer, guest VPID) pair. Real VPIDs start at 0x10 to stay
//! clear of the VPIDs used for L1 itself.

use crate::{config, vmx::ept::Ept};

pub(crate) const NUM_OF_SHADOW_EPT: usize = 2;
pub(crate) const NUM_OF_SHADOW_VPID: usize = 16;

/// Real VPIDs evicted by a cache operation; the caller owes a
/// single-context INVVPID for each before the slots are reused.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EvictedVpids {
    vpids: [u16; NUM_OF_SHADOW_VPID],
    count: usize,
}

impl EvictedVpids {
    fn push(&mut self, vpid: u16) {
        self.vpids[self.count] = vpid;
        self.count += 1;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.vpids[..self.count].iter().copied()
    }
}

#[derive(Default)]
struct EptInfo {
    shadow_ept: Option<Ept>,
    /// The guest's EPT pointer, masked to the address bits, with bit 0 as
    /// the occupancy tag.
    ep4ta: u64,
    active: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct VpidInfo {
    ep4ta: u64,
    vpid: u16,
}

/// The per-vCPU shadow EPT/VPID caches, created on the first L2 entry
/// that uses EPT.
pub(crate) struct ShadowEptData {
    ept: [EptInfo; NUM_OF_SHADOW_EPT],
    /// Slot indices, most recently used first.
    ept_order: [usize; NUM_OF_SHADOW_EPT],
    vpid: [VpidInfo; NUM_OF_SHADOW_VPID],
    vpid_order: [usize; NUM_OF_SHADOW_VPID],
}

/// Tags a guest EPT pointer for cache keying: address bits only, plus an
/// occupancy flag so that pointer 0 is distinguishable from an empty slot.
fn ep4ta_tag(guest_eptp: u64) -> u64 {
    (guest_eptp & 0xF_FFFF_FFFF_F000) | 1
}

fn promote(order: &mut [usize], slot: usize) {
    if let Some(pos) = order.iter().position(|&s| s == slot) {
        order[..=pos].rotate_right(1);
    }
}

impl ShadowEptData {
    pub(crate) fn new() -> Self {
        Self {
            ept: core::array::from_fn(|_| EptInfo::default()),
            ept_order: core::array::from_fn(|i| i),
            vpid: [VpidInfo::default(); NUM_OF_SHADOW_VPID],
            vpid_order: core::array::from_fn(|i| i),
        }
    }

    /// The real VPID assigned to a VPID cache slot. Offset past the VPIDs
    /// used for L1 to avoid unnecessary invalidation.
    fn real_vpid(slot: usize) -> u16 {
        (slot + 0x10) as u16
    }

    /// Invalidates cached shadow trees: the one built for `guest_eptp`,
    /// or every tree when `guest_eptp` is 0 (INVEPT all-contexts).
    pub(crate) fn clear_ept(&mut self, guest_eptp: u64) {
        let tag = if guest_eptp == 0 {
            0
        } else {
            ep4ta_tag(guest_eptp)
        };
        for info in &mut self.ept {
            if tag == 0 || info.ep4ta == tag {
                if info.active {
                    if let Some(ept) = info.shadow_ept.as_mut() {
                        ept.clear();
                    }
                    info.active = false;
                }
                if tag != 0 {
                    break;
                }
            }
        }
    }

    /// Finds or builds the shadow tree for `guest_eptp`. A miss reuses
    /// the least recently used slot, wiping its tree and dropping the
    /// VPID entries keyed to its old EPT pointer; those real VPIDs are
    /// returned for hardware invalidation.
    pub(crate) fn get_ept_info(&mut self, guest_eptp: u64) -> (usize, EvictedVpids) {
        let tag = ep4ta_tag(guest_eptp);
        let mut evicted = EvictedVpids::default();
        let slot = if let Some(&hit) = self.ept_order.iter().find(|&&s| self.ept[s].ep4ta == tag) {
            hit
        } else {
            let victim = self.ept_order[NUM_OF_SHADOW_EPT - 1];
            let info = &mut self.ept[victim];
            if let Some(ept) = info.shadow_ept.as_mut() {
                if info.active {
                    ept.clear();
                    info.active = false;
                }
            } else {
                info.shadow_ept = Some(Ept::new(config::SHADOW_EPT_TABLE_COUNT));
            }
            let old_tag = core::mem::replace(&mut info.ep4ta, tag);
            if old_tag != 0 {
                for (i, vpid_info) in self.vpid.iter_mut().enumerate() {
                    if vpid_info.ep4ta == old_tag {
                        evicted.push(Self::real_vpid(i));
                        *vpid_info = VpidInfo::default();
                    }
                }
            }
            victim
        };
        promote(&mut self.ept_order, slot);
        (slot, evicted)
    }

    /// Marks a slot's tree live under the guest's current EPT pointer and
    /// returns the EPT pointer to enter L2 with.
    pub(crate) fn activate(&mut self, slot: usize) -> u64 {
        let info = &mut self.ept[slot];
        info.active = true;
        info.shadow_ept.as_ref().unwrap().eptp()
    }

    pub(crate) fn ept_mut(&mut self, slot: usize) -> &mut Ept {
        self.ept[slot].shadow_ept.as_mut().unwrap()
    }

    /// Finds or assigns the real VPID for `(guest_eptp, guest_vpid)`. A
    /// miss evicts the least recently used assignment; the evicted real
    /// VPID is returned for hardware invalidation before reuse.
    pub(crate) fn get_vpid_info(&mut self, guest_eptp: u64, guest_vpid: u16) -> (u16, Option<u16>) {
        let tag = ep4ta_tag(guest_eptp);
        let hit = self
            .vpid_order
            .iter()
            .find(|&&s| self.vpid[s].ep4ta == tag && self.vpid[s].vpid == guest_vpid)
            .copied();
        if let Some(slot) = hit {
            promote(&mut self.vpid_order, slot);
            return (Self::real_vpid(slot), None);
        }
        let victim = self.vpid_order[NUM_OF_SHADOW_VPID - 1];
        let evicted = Self::real_vpid(victim);
        self.vpid[victim] = VpidInfo {
            ep4ta: tag,
            vpid: guest_vpid,
        };
        promote(&mut self.vpid_order, victim);
        (Self::real_vpid(victim), Some(evicted))
    }

    /// Collects the real VPIDs standing in for `guest_vpid`, in recency
    /// order. The guest may use one VPID across several EPT pointers;
    /// every corresponding real VPID must be invalidated.
    pub(crate) fn real_vpids_of(&self, guest_vpid: u16) -> EvictedVpids {
        let mut matches = EvictedVpids::default();
        for &slot in &self.vpid_order {
            if (self.vpid[slot].ep4ta & 1) != 0 && self.vpid[slot].vpid == guest_vpid {
                matches.push(Self::real_vpid(slot));
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ept_cache_hits_do_not_allocate() {
        let mut d = ShadowEptData::new();
        let (a, _) = d.get_ept_info(0x1000);
        let (b, _) = d.get_ept_info(0x2000);
        assert_ne!(a, b);
        let (a2, _) = d.get_ept_info(0x1000);
        assert_eq!(a, a2);
    }

    #[test]
    fn ept_cache_evicts_least_recently_used() {
        let mut d = ShadowEptData::new();
        let (a, _) = d.get_ept_info(0x1000);
        let (b, _) = d.get_ept_info(0x2000);
        // Touch A so that B is the LRU entry.
        let _ = d.get_ept_info(0x1000);
        let (c, _) = d.get_ept_info(0x3000);
        assert_eq!(c, b);
        // A is still cached.
        let (a2, _) = d.get_ept_info(0x1000);
        assert_eq!(a2, a);
    }

    #[test]
    fn ept_eviction_drops_vpids_of_old_pointer() {
        let mut d = ShadowEptData::new();
        let _ = d.get_ept_info(0x1000);
        let (v1, _) = d.get_vpid_info(0x1000, 7);
        let (v2, _) = d.get_vpid_info(0x1000, 8);
        let _ = d.get_ept_info(0x2000);
        // 0x1000 is now the LRU tree; building a third evicts it along
        // with its VPID assignments.
        let (_, evicted) = d.get_ept_info(0x3000);
        let reported: alloc::vec::Vec<u16> = evicted.iter().collect();
        assert!(reported.contains(&v1));
        assert!(reported.contains(&v2));
        assert!(d.real_vpids_of(7).iter().next().is_none());
    }

    #[test]
    fn clear_ept_single_and_all_contexts() {
        let mut d = ShadowEptData::new();
        let (a, _) = d.get_ept_info(0x1000);
        let a_eptp = d.activate(a);
        assert_ne!(a_eptp, 0);
        assert!(d.ept[a].active);
        d.clear_ept(0x1000);
        assert!(!d.ept[a].active);
        // All-contexts clears every active tree.
        let _ = d.activate(a);
        let (b, _) = d.get_ept_info(0x2000);
        let _ = d.activate(b);
        d.clear_ept(0);
        assert!(!d.ept[a].active && !d.ept[b].active);
    }

    #[test]
    fn vpid_cache_is_stable_and_bounded() {
        let mut d = ShadowEptData::new();
        let (first, evicted) = d.get_vpid_info(0x1000, 7);
        assert!(first >= 0x10);
        assert!(evicted.is_some()); // a fresh slot still reports its old tag
        let (again, none) = d.get_vpid_info(0x1000, 7);
        assert_eq!(first, again);
        assert!(none.is_none());
        // Same guest VPID under a different EPTP is a separate context.
        let (other, _) = d.get_vpid_info(0x2000, 7);
        assert_ne!(first, other);
        // Fill every slot; the first assignment is eventually evicted.
        for i in 0..NUM_OF_SHADOW_VPID as u64 {
            let _ = d.get_vpid_info(0x3000 + (i << 12), 9);
        }
        let (reassigned, _) = d.get_vpid_info(0x1000, 7);
        let _ = reassigned;
        let matches: alloc::vec::Vec<u16> = d.real_vpids_of(7).iter().collect();
        assert!(matches.len() >= 2);
    }

    #[test]
    fn real_vpids_of_finds_duplicate_guest_vpids() {
        let mut d = ShadowEptData::new();
        let (a, _) = d.get_vpid_info(0x1000, 7);
        let (b, _) = d.get_vpid_info(0x2000, 7);
        let (_c, _) = d.get_vpid_info(0x3000, 8);
        let matches: alloc::vec::Vec<u16> = d.real_vpids_of(7).iter().collect();
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(&a));
        assert!(matches.contains(&b));
        assert!(d.real_vpids_of(99).iter().next().is_none());
    }
}
