//! The module containing the EPT engine.
//!
//! Tables come from a fixed preallocated pool indexed by a running counter;
//! there is no allocator on the VM-exit path. When the pool runs dry the
//! whole tree is wiped and rebuilt on demand ("wipe when full"). A cursor
//! caches the partial walk to the last-touched guest-physical address so
//! that adjacent faults do not re-walk from the root.
//!
//! The same type backs the shadow EPT trees used for nested
//! virtualization; those are filled from the guest hypervisor's EPT via
//! [`read_guest_epte`] and [`Ept::shadow_write`] instead of the violation
//! handler.

use crate::{platform::Platform, vmx::vmcs::bits};
use alloc::boxed::Box;
use bitfield::bitfield;

pub(crate) const EPT_LEVELS: usize = 4;

const EPTE_READ: u64 = 0x1;
const EPTE_WRITE: u64 = 0x2;
const EPTE_READEXEC: u64 = 0x5;
const EPTE_LARGE: u64 = 0x80;
const EPTE_MT_SHIFT: u64 = 3;
const EPT_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = 0xFFF;
const PAGE_2M_SIZE: u64 = 0x20_0000;
const PAGE_2M_MASK: u64 = 0x1F_FFFF;

bitfield! {
    /// One EPT entry at any level.
    ///
    /// See: Table 29-6. Format of an EPT Page-Table Entry that Maps a
    /// 4-KByte Page
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EptEntry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

impl EptEntry {
    fn present(self) -> bool {
        (self.0 & 0x7) != 0
    }

    fn table_addr(self) -> u64 {
        self.0 & EPT_ADDR_MASK
    }
}

/// A single EPT paging structure (PML4, PDPT, PD or PT).
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct EptTable {
    entries: [EptEntry; 512],
}
const _: () = assert!(core::mem::size_of::<EptTable>() == 0x1000);

/// Which page a cursor slot lives in.
#[derive(Debug, Clone, Copy)]
enum TableRef {
    Root,
    Pool(usize),
}

/// One entry position in the tree: a table and an index into it.
#[derive(Debug, Clone, Copy)]
struct EntrySlot {
    table: TableRef,
    index: usize,
}

/// The breadcrumb trail to the last-touched address. `path[l]` is the
/// position of the entry at level `l` (0 = PT) and is meaningful for
/// levels at or above `level`.
struct Cursor {
    level: usize,
    gphys: u64,
    path: [EntrySlot; EPT_LEVELS],
}

/// An EPT tree: the root page plus the fixed table pool.
pub struct Ept {
    root: Box<EptTable>,
    pool: Box<[EptTable]>,
    cnt: usize,
    cleared: bool,
    flush_pending: bool,
    cur: Cursor,
}

impl core::fmt::Debug for Ept {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ept")
            .field("cnt", &self.cnt)
            .field("cleared", &self.cleared)
            .field("pool_pages", &self.pool.len())
            .finish_non_exhaustive()
    }
}

impl Ept {
    /// Allocates the root and a pool of `pool_pages` tables, all zeroed.
    /// The tree starts in the cleared state so that the first mapping
    /// replays the force-mapped ranges.
    #[must_use]
    pub fn new(pool_pages: usize) -> Self {
        let root = unsafe { Box::<EptTable>::new_zeroed().assume_init() };
        let pool = unsafe { Box::<[EptTable]>::new_zeroed_slice(pool_pages).assume_init() };
        Self {
            root,
            pool,
            cnt: 0,
            cleared: true,
            flush_pending: false,
            cur: Cursor {
                level: EPT_LEVELS,
                gphys: 0,
                path: [EntrySlot {
                    table: TableRef::Root,
                    index: 0,
                }; EPT_LEVELS],
            },
        }
    }

    /// The EPT pointer for this tree: root, write-back structures, 4-level
    /// walk.
    #[must_use]
    pub fn eptp(&self) -> u64 {
        self.root_phys() | bits::EPTP_MEMORY_TYPE_WB | bits::EPTP_PAGE_WALK_LENGTH_4
    }

    fn root_phys(&self) -> u64 {
        core::ptr::from_ref(self.root.as_ref()) as u64
    }

    fn table_phys(&self, index: usize) -> u64 {
        core::ptr::from_ref(&self.pool[index]) as u64
    }

    /// Maps a table physical address back to its pool index. Every
    /// non-leaf entry must point into the pool; anything else is a
    /// corrupted tree.
    fn table_index_of(&self, phys: u64) -> usize {
        let base = self.pool.as_ptr() as u64;
        let offset = phys.wrapping_sub(base);
        assert!(
            offset < self.pool.len() as u64 * PAGE_SIZE && (offset & PAGE_MASK) == 0,
            "EPT entry points outside the table pool"
        );
        (offset / PAGE_SIZE) as usize
    }

    fn entry(&self, slot: EntrySlot) -> EptEntry {
        match slot.table {
            TableRef::Root => self.root.entries[slot.index],
            TableRef::Pool(t) => self.pool[t].entries[slot.index],
        }
    }

    fn set_entry(&mut self, slot: EntrySlot, entry: EptEntry) {
        match slot.table {
            TableRef::Root => self.root.entries[slot.index] = entry,
            TableRef::Pool(t) => self.pool[t].entries[slot.index] = entry,
        }
    }

    /// Moves the cursor to `gphys`: pops cached levels while the shared
    /// prefix shrinks, then descends through present non-leaf entries.
    fn cur_move(&mut self, gphys: u64) {
        let mut mask = 0xFFFF_FFFF_FFFF_F000u64;
        if self.cur.level > 0 {
            mask <<= 9 * self.cur.level;
        }
        while self.cur.level < EPT_LEVELS && (gphys & mask) != (self.cur.gphys & mask) {
            self.cur.level += 1;
            mask <<= 9;
        }
        self.cur.gphys = gphys;
        if self.cur.level == 0 {
            return;
        }
        let mut slot;
        if self.cur.level >= EPT_LEVELS {
            slot = EntrySlot {
                table: TableRef::Root,
                index: ((gphys >> (9 * EPT_LEVELS + 3)) & 0x1FF) as usize,
            };
            self.cur.level = EPT_LEVELS - 1;
            self.cur.path[EPT_LEVELS - 1] = slot;
        } else {
            slot = self.cur.path[self.cur.level];
        }
        while self.cur.level > 0 {
            let e = self.entry(slot);
            if !e.read() || e.large() {
                break;
            }
            let table = TableRef::Pool(self.table_index_of(e.table_addr()));
            let index = ((gphys >> (9 * self.cur.level + 3)) & 0x1FF) as usize;
            self.cur.level -= 1;
            slot = EntrySlot { table, index };
            self.cur.path[self.cur.level] = slot;
        }
    }

    /// Fills intermediate tables from the pool down to `level` and returns
    /// the slot for the leaf. Wipes the whole tree first if the pool
    /// cannot cover the descent.
    fn cur_fill(&mut self, gphys: u64, level: usize) -> EntrySlot {
        if self.cnt + self.cur.level - level > self.pool.len() {
            self.root.entries = [EptEntry::default(); 512];
            self.cleared = true;
            self.cnt = 0;
            self.flush_pending = true;
            self.cur.level = EPT_LEVELS - 1;
            self.cur.path[EPT_LEVELS - 1] = EntrySlot {
                table: TableRef::Root,
                index: ((gphys >> (9 * EPT_LEVELS + 3)) & 0x1FF) as usize,
            };
        }
        let mut l = self.cur.level;
        let mut slot = self.cur.path[l];
        while l > level {
            let t = self.cnt;
            self.set_entry(slot, EptEntry(self.table_phys(t) | EPTE_READEXEC | EPTE_WRITE));
            self.cnt += 1;
            self.pool[t].entries = [EptEntry::default(); 512];
            slot = EntrySlot {
                table: TableRef::Pool(t),
                index: ((gphys >> (9 * l + 3)) & 0x1FF) as usize,
            };
            l -= 1;
        }
        slot
    }

    /// The level the cursor stops at for `gphys`: 0 means a full walk
    /// exists (or a 4 KiB slot is reachable), higher values mean the walk
    /// ended at an empty or large entry.
    fn level_of(&mut self, gphys: u64) -> usize {
        self.cur_move(gphys);
        self.cur.level
    }

    /// Installs a 4 KiB leaf for `gphys`. Panics if the guest is writing
    /// to a hypervisor-owned page.
    fn map_page_sub(&mut self, platform: &mut dyn Platform, write: bool, gphys: u64) {
        self.cur_move(gphys);
        let slot = self.cur_fill(gphys, 0);
        let translation = platform.gp2hp(gphys);
        let hphys = translation.hphys & !PAGE_MASK;
        if translation.fakerom && write {
            panic!("EPT: Writing to VMM memory.");
        }
        let mut hattr =
            (u64::from(platform.gmtrr_type(gphys)) << EPTE_MT_SHIFT) | EPTE_READEXEC | EPTE_WRITE;
        if translation.fakerom {
            hattr &= !EPTE_WRITE;
        }
        self.set_entry(slot, EptEntry(hphys | hattr));
    }

    /// Tries to install a 2 MiB leaf covering `gphys`. Returns true if the
    /// large mapping is not possible and the caller must fall back to
    /// 4 KiB pages.
    fn map_2mpage(&mut self, platform: &mut dyn Platform, gphys: u64) -> bool {
        self.cur_move(gphys);
        if self.cur.level == 0 {
            return true;
        }
        let Some(hphys) = platform.gp2hp_2m(gphys & !PAGE_2M_MASK) else {
            return true;
        };
        if !platform.gmtrr_type_equal(gphys & !PAGE_2M_MASK, PAGE_2M_MASK) {
            return true;
        }
        let hattr = (u64::from(platform.gmtrr_type(gphys & !PAGE_2M_MASK)) << EPTE_MT_SHIFT)
            | EPTE_READEXEC
            | EPTE_WRITE
            | EPTE_LARGE;
        let slot = self.cur_fill(gphys, 1);
        self.set_entry(slot, EptEntry(hphys | hattr));
        false
    }

    /// Replays the force-mapped ranges after a wipe. The ranges must be
    /// fully mapped before the faulting access is serviced.
    fn map_page_clear_cleared(&mut self, platform: &mut dyn Platform) {
        self.cleared = false;
        let mut n = 0;
        loop {
            let range = platform.forcemap(n);
            n = range.next;
            if range.len != 0 {
                let mut len = range.len + (range.base & PAGE_MASK);
                let mut base = range.base & !PAGE_MASK;
                while len > 0 {
                    let mut size = PAGE_SIZE;
                    if self.level_of(base) > 0
                        && platform.mmio_range(base & !PAGE_2M_MASK, PAGE_2M_SIZE) == 0
                        && !self.map_2mpage(platform, base)
                    {
                        size = (base | PAGE_2M_MASK) + 1 - base;
                    } else {
                        let next_mmio = platform.mmio_range(base, PAGE_SIZE);
                        if next_mmio == 0 {
                            self.map_page_sub(platform, true, base);
                        } else {
                            // Skip over the MMIO hole; device emulation
                            // services it on access.
                            size = (next_mmio - base + PAGE_SIZE - 1) & !PAGE_MASK;
                        }
                    }
                    if size > len {
                        size = len;
                    }
                    base += size;
                    len -= size;
                }
            }
            if n == 0 {
                break;
            }
        }
        assert!(!self.cleared, "force-map replay exhausted the EPT pool");
    }

    fn map_page(&mut self, platform: &mut dyn Platform, write: bool, gphys: u64) {
        if self.cleared {
            self.map_page_clear_cleared(platform);
        }
        self.map_page_sub(platform, write, gphys);
        if self.cleared {
            self.map_page_clear_cleared(platform);
        }
    }

    /// Services an EPT violation at `gphys`. Installs a 2 MiB leaf when
    /// the whole large range is MMIO-free and uniformly typed, otherwise
    /// consults the MMIO emulator and installs a 4 KiB leaf.
    pub fn violation(&mut self, platform: &mut dyn Platform, write: bool, gphys: u64) {
        platform.mmio_lock();
        if self.level_of(gphys) > 0
            && platform.mmio_range(gphys & !PAGE_2M_MASK, PAGE_2M_SIZE) == 0
            && !self.map_2mpage(platform, gphys)
        {
            // Mapped large.
        } else if !platform.mmio_access_page(gphys, true) {
            self.map_page(platform, write, gphys);
        }
        platform.mmio_unlock();
    }

    /// Drops every mapping and marks the tree cleared. The guest TLB must
    /// be flushed before the next entry; see [`Ept::take_flush_pending`].
    pub fn clear_all(&mut self) {
        self.root.entries = [EptEntry::default(); 512];
        self.cleared = true;
        self.cnt = 0;
        self.cur.level = EPT_LEVELS;
        self.flush_pending = true;
    }

    /// Bulk-maps guest-physical `[0, 0x100000)` for legacy BIOS access,
    /// leaving MMIO holes to the device emulator.
    pub fn map_1mb(&mut self, platform: &mut dyn Platform) {
        self.clear_all();
        let mut gphys = 0;
        while gphys < 0x10_0000 {
            platform.mmio_lock();
            if !platform.mmio_access_page(gphys, false) {
                self.map_page(platform, false, gphys);
            }
            platform.mmio_unlock();
            gphys += PAGE_SIZE;
        }
    }

    /// Searches populated leaves whose physical range intersects
    /// `[start, end]`. On the active vCPU the matching entries are
    /// cleared; on any other vCPU the first match reports true so that
    /// the caller can IPI the owner.
    pub fn extern_mapsearch(&mut self, active: bool, amask: u64, start: u64, end: u64) -> bool {
        for t in 0..self.cnt {
            for j in 0..512 {
                let e = self.pool[t].entries[j];
                if !e.read() {
                    continue;
                }
                let mut low = e.0 & amask;
                let mut high = low | PAGE_MASK;
                if e.large() {
                    low &= !PAGE_2M_MASK;
                    high |= PAGE_2M_MASK;
                }
                if start <= high && low <= end {
                    if !active {
                        return true;
                    }
                    self.pool[t].entries[j] = EptEntry::default();
                }
            }
        }
        false
    }

    /// True once after any operation that wiped mappings; the caller owns
    /// the TLB flush and must perform it before the guest resumes.
    pub(crate) fn take_flush_pending(&mut self) -> bool {
        core::mem::replace(&mut self.flush_pending, false)
    }

    // Shadow-EPT entry points, used only by the nested engine. The tree
    // then mirrors the guest hypervisor's EPT one 4 KiB leaf at a time.

    /// Installs a shadow leaf for `gphys` from the guest's entry `gentry`
    /// found at `level` of the guest walk. The guest's target address is
    /// re-translated through `gp2hp`; a fakerom target loses its write
    /// permission. Returns the installed entry.
    pub(crate) fn shadow_write(
        &mut self,
        platform: &mut dyn Platform,
        amask: u64,
        gphys: u64,
        level: usize,
        gentry: u64,
    ) -> u64 {
        let offset_mask = if level > 0 {
            (1u64 << (12 + 9 * level)) - 1
        } else {
            PAGE_MASK
        };
        let target = (gentry & amask & !offset_mask) | (gphys & offset_mask & !PAGE_MASK);
        let translation = platform.gp2hp(target);
        let mut perms = gentry & 0x7;
        if translation.fakerom {
            perms &= !EPTE_WRITE;
        }
        let entry = (translation.hphys & !PAGE_MASK)
            | (u64::from(platform.gmtrr_type(target)) << EPTE_MT_SHIFT)
            | perms;
        self.cur_move(gphys);
        let slot = self.cur_fill(gphys, 0);
        self.set_entry(slot, EptEntry(entry));
        entry
    }

    /// Drops the cached shadow leaf covering `gphys`, if any. Used when
    /// the guest's entry changed or was found misconfigured.
    pub(crate) fn shadow_invalidate(&mut self, gphys: u64) {
        self.cur_move(gphys);
        if self.cur.level >= EPT_LEVELS {
            return;
        }
        let slot = self.cur.path[self.cur.level];
        let e = self.entry(slot);
        if (self.cur.level == 0 || e.large()) && e.present() {
            self.set_entry(slot, EptEntry::default());
        }
    }

    /// Wipes a shadow tree for reuse under a different guest EPT pointer.
    pub(crate) fn clear(&mut self) {
        self.root.entries = [EptEntry::default(); 512];
        self.cnt = 0;
        self.cleared = false;
        self.cur.level = EPT_LEVELS;
    }
}

/// Walks the guest hypervisor's EPT tree for `gphys`, reading each table
/// through guest-physical memory. Returns the level the walk stopped at
/// (0 = 4 KiB PTE) and the raw entry found there; a non-present entry
/// terminates the walk at its level.
pub(crate) fn read_guest_epte(
    platform: &mut dyn Platform,
    amask: u64,
    eptp: u64,
    gphys: u64,
) -> (usize, u64) {
    let mut table = eptp & amask & !PAGE_MASK;
    let mut level = EPT_LEVELS - 1;
    loop {
        let index = (gphys >> (12 + 9 * level)) & 0x1FF;
        let entry = platform.read_gphys_u64(table + index * 8);
        if level == 0 || (entry & 0x7) == 0 || (entry & EPTE_LARGE) != 0 {
            return (level, entry);
        }
        table = entry & amask & !PAGE_MASK;
        level -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ForceMap, SegReg, Translation};
    use std::collections::BTreeMap;
    use std::vec::Vec;

    const AMASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// A deterministic memory model: hphys = gphys + 0x1000_0000, with
    /// configurable fakerom pages, MMIO ranges and force-map ranges.
    #[derive(Default)]
    struct MockPlatform {
        fakerom: Vec<u64>,
        mmio: Vec<(u64, u64)>,
        forcemaps: Vec<(u64, u64)>,
        nonuniform_mtrr: Vec<u64>,
        no_2m_backing: bool,
        guest_mem: BTreeMap<u64, u64>,
        mmio_locked: bool,
    }

    const HP_OFFSET: u64 = 0x1000_0000;

    impl Platform for MockPlatform {
        fn gp2hp(&mut self, gphys: u64) -> Translation {
            Translation {
                hphys: gphys + HP_OFFSET,
                fakerom: self.fakerom.contains(&(gphys & !0xFFF)),
            }
        }

        fn gp2hp_2m(&mut self, gphys: u64) -> Option<u64> {
            (!self.no_2m_backing).then_some(gphys + HP_OFFSET)
        }

        fn forcemap(&mut self, index: u32) -> ForceMap {
            let i = index as usize;
            if i >= self.forcemaps.len() {
                return ForceMap::default();
            }
            let (base, len) = self.forcemaps[i];
            ForceMap {
                next: if i + 1 < self.forcemaps.len() {
                    index + 1
                } else {
                    0
                },
                base,
                len,
            }
        }

        fn mmio_range(&mut self, base: u64, len: u64) -> u64 {
            self.mmio
                .iter()
                .filter(|(mb, ml)| *mb < base + len && base < *mb + *ml)
                .map(|(mb, _)| (*mb).max(base))
                .min()
                .unwrap_or(0)
        }

        fn mmio_access_page(&mut self, gphys: u64, _readonly: bool) -> bool {
            self.mmio_range(gphys & !0xFFF, 0x1000) != 0
        }

        fn mmio_lock(&mut self) {
            assert!(!self.mmio_locked);
            self.mmio_locked = true;
        }

        fn mmio_unlock(&mut self) {
            assert!(self.mmio_locked);
            self.mmio_locked = false;
        }

        fn gmtrr_type(&mut self, _gphys: u64) -> u8 {
            6 // write-back
        }

        fn gmtrr_type_equal(&mut self, base: u64, _mask: u64) -> bool {
            !self.nonuniform_mtrr.contains(&base)
        }

        fn get_gpat(&mut self) -> (bool, u64) {
            (false, 0)
        }

        fn set_gpat(&mut self, _pat: u64) -> bool {
            false
        }

        fn read_gphys_u64(&mut self, gphys: u64) -> u64 {
            self.guest_mem.get(&gphys).copied().unwrap_or(0)
        }

        fn read_gphys_u32(&mut self, gphys: u64) -> u32 {
            self.read_gphys_u64(gphys) as u32
        }

        fn write_gphys_u32(&mut self, gphys: u64, value: u32) {
            let _ = self.guest_mem.insert(gphys, u64::from(value));
        }

        fn seg_read(&mut self, _sreg: SegReg, _offset: u64, _buf: &mut [u8]) -> bool {
            false
        }

        fn seg_write(&mut self, _sreg: SegReg, _offset: u64, _buf: &[u8]) -> bool {
            false
        }

        fn exint_pass_intr_call(&mut self, vector: u8) -> Option<u8> {
            Some(vector)
        }

        fn pte_addr_mask(&self) -> u64 {
            AMASK
        }

        fn spt_init(&mut self) {}
        fn spt_map_1mb(&mut self) {}
        fn spt_pagefault(&mut self, _err: u64, _cr2: u64) {}
        fn spt_tlbflush(&mut self) {}
        fn spt_invalidate(&mut self, _addr: u64) {}
        fn spt_updatecr3(&mut self) {}
        fn spt_clear_all(&mut self) {}
        fn spt_extern_mapsearch(&mut self, _start: u64, _end: u64) -> bool {
            false
        }
    }

    /// Walks the tree the way the processor would and returns the leaf
    /// entry with the level it was found at.
    fn host_walk(ept: &Ept, gphys: u64) -> Option<(usize, EptEntry)> {
        let mut table = &ept.root.entries;
        let mut level = EPT_LEVELS - 1;
        loop {
            let e = table[((gphys >> (12 + 9 * level)) & 0x1FF) as usize];
            if !e.present() {
                return None;
            }
            if level == 0 || e.large() {
                return Some((level, e));
            }
            let idx = ept.table_index_of(e.table_addr());
            table = &ept.pool[idx].entries;
            level -= 1;
        }
    }

    fn fresh_ept(platform: &mut MockPlatform) -> Ept {
        let mut ept = Ept::new(64);
        // Drop the initial cleared state with an empty force-map list.
        ept.map_page_clear_cleared(platform);
        ept
    }

    #[test]
    fn maps_4k_when_2m_is_not_possible() {
        let mut p = MockPlatform {
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0x1234_5678);
        let (level, e) = host_walk(&ept, 0x1234_5678).unwrap();
        assert_eq!(level, 0);
        assert_eq!(e.0 & AMASK, (0x1234_5000u64) + HP_OFFSET);
        assert_eq!(e.0 & 0x7, 0x7);
        assert_eq!(e.memory_type(), 6);
    }

    #[test]
    fn mapping_is_idempotent() {
        let mut p = MockPlatform {
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0x40_0000);
        let first = host_walk(&ept, 0x40_0000).unwrap();
        let cnt = ept.cnt;
        ept.violation(&mut p, false, 0x40_0000);
        let second = host_walk(&ept, 0x40_0000).unwrap();
        assert_eq!(first.1, second.1);
        assert_eq!(ept.cnt, cnt);
    }

    #[test]
    fn installs_2m_leaf_and_reuses_it() {
        let mut p = MockPlatform::default();
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0x20_1000);
        let (level, e) = host_walk(&ept, 0x20_1000).unwrap();
        assert_eq!(level, 1);
        assert!(e.large());
        assert_eq!(e.0 & AMASK, 0x20_0000 + HP_OFFSET);
        // A nearby fault within the same 2 MiB range allocates nothing.
        let cnt = ept.cnt;
        ept.violation(&mut p, false, 0x20_5000);
        assert_eq!(ept.cnt, cnt);
    }

    #[test]
    fn mmio_in_range_forces_4k_and_leaves_hole() {
        let mut p = MockPlatform {
            mmio: alloc::vec![(0x20_3000, 0x1000)],
            no_2m_backing: false,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        // The 2 MiB range contains MMIO, so a 4 KiB page is installed.
        ept.violation(&mut p, false, 0x20_1000);
        let (level, _) = host_walk(&ept, 0x20_1000).unwrap();
        assert_eq!(level, 0);
        // The MMIO page itself stays unmapped.
        ept.violation(&mut p, false, 0x20_3000);
        assert!(host_walk(&ept, 0x20_3000).is_none());
    }

    #[test]
    fn nonuniform_mtrr_forces_4k() {
        let mut p = MockPlatform {
            nonuniform_mtrr: alloc::vec![0x20_0000],
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0x20_1000);
        let (level, _) = host_walk(&ept, 0x20_1000).unwrap();
        assert_eq!(level, 0);
    }

    #[test]
    fn fakerom_page_loses_write_permission() {
        let mut p = MockPlatform {
            fakerom: alloc::vec![0xF0000],
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0xF0000);
        let (_, e) = host_walk(&ept, 0xF0000).unwrap();
        assert!(e.read());
        assert!(!e.write());
        assert!(e.execute());
    }

    #[test]
    #[should_panic(expected = "Writing to VMM memory")]
    fn fakerom_write_panics() {
        let mut p = MockPlatform {
            fakerom: alloc::vec![0xF0000],
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, true, 0xF0000);
    }

    #[test]
    fn cleared_replays_forcemap_before_fault() {
        let mut p = MockPlatform {
            forcemaps: alloc::vec![(0xE0000, 0x20000)],
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = Ept::new(64);
        assert!(ept.cleared);
        ept.violation(&mut p, false, 0x500_0000);
        // Both the force-mapped firmware range and the faulting page are
        // now present.
        assert!(host_walk(&ept, 0xE0000).is_some());
        assert!(host_walk(&ept, 0xFF000).is_some());
        assert!(host_walk(&ept, 0x500_0000).is_some());
    }

    #[test]
    fn clear_all_wipes_and_requires_flush() {
        let mut p = MockPlatform {
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0x40_0000);
        ept.clear_all();
        assert!(host_walk(&ept, 0x40_0000).is_none());
        assert!(ept.take_flush_pending());
        assert!(!ept.take_flush_pending());
    }

    #[test]
    fn pool_exhaustion_wipes_and_restarts() {
        let mut p = MockPlatform {
            no_2m_backing: true,
            ..Default::default()
        };
        // 4 tables: one full 4 KiB walk consumes 3 (PDPT, PD, PT).
        let mut ept = Ept::new(4);
        ept.map_page_clear_cleared(&mut p);
        ept.violation(&mut p, false, 0x1000);
        assert_eq!(ept.cnt, 3);
        // A fault in a distant region needs 3 more tables; the pool wipes
        // and the new mapping still lands.
        ept.violation(&mut p, false, 0x80_0000_0000);
        assert!(host_walk(&ept, 0x80_0000_0000).is_some());
        assert!(host_walk(&ept, 0x1000).is_none());
        assert!(ept.take_flush_pending());
    }

    #[test]
    fn map_1mb_covers_low_memory_minus_mmio() {
        let mut p = MockPlatform {
            mmio: alloc::vec![(0xA0000, 0x1000)],
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = Ept::new(64);
        ept.map_1mb(&mut p);
        assert!(host_walk(&ept, 0).is_some());
        assert!(host_walk(&ept, 0xFF000).is_some());
        assert!(host_walk(&ept, 0xA0000).is_none());
    }

    #[test]
    fn extern_mapsearch_reports_and_clears() {
        let mut p = MockPlatform {
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0x40_0000);
        let hp = 0x40_0000 + HP_OFFSET;
        // On a foreign vCPU the search only reports.
        assert!(ept.extern_mapsearch(false, AMASK, hp, hp + 0xFFF));
        assert!(host_walk(&ept, 0x40_0000).is_some());
        // On the active vCPU it clears the match.
        assert!(!ept.extern_mapsearch(true, AMASK, hp, hp + 0xFFF));
        assert!(host_walk(&ept, 0x40_0000).is_none());
        // Non-overlapping ranges match nothing.
        assert!(!ept.extern_mapsearch(false, AMASK, 0x9000_0000, 0x9000_0FFF));
    }

    /// Builds a one-page guest EPT hierarchy in mock guest memory mapping
    /// `gphys` to `target` and returns its EPTP.
    fn build_guest_ept(p: &mut MockPlatform, gphys: u64, target: u64) -> u64 {
        let pml4 = 0x7_0000;
        let pdpt = 0x7_1000;
        let pd = 0x7_2000;
        let pt = 0x7_3000;
        let idx = |g: u64, l: usize| (g >> (12 + 9 * l)) & 0x1FF;
        let _ = p.guest_mem.insert(pml4 + idx(gphys, 3) * 8, pdpt | 0x7);
        let _ = p.guest_mem.insert(pdpt + idx(gphys, 2) * 8, pd | 0x7);
        let _ = p.guest_mem.insert(pd + idx(gphys, 1) * 8, pt | 0x7);
        let _ = p.guest_mem.insert(pt + idx(gphys, 0) * 8, target | 0x7);
        pml4 | 0x5E // WB | walk length 4, as a guest would build it
    }

    #[test]
    fn guest_walk_then_shadow_write_translates_twice() {
        let mut p = MockPlatform::default();
        let eptp = build_guest_ept(&mut p, 0x1000, 0x2000);
        let (level, gentry) = read_guest_epte(&mut p, AMASK, eptp, 0x1000);
        assert_eq!(level, 0);
        assert_eq!(gentry & AMASK, 0x2000);

        let mut sept = Ept::new(16);
        let written = sept.shadow_write(&mut p, AMASK, 0x1000, level, gentry);
        assert_eq!(written & AMASK, 0x2000 + HP_OFFSET);
        let (l, e) = host_walk(&sept, 0x1000).unwrap();
        assert_eq!(l, 0);
        assert_eq!(e.0, written);
    }

    #[test]
    fn guest_walk_stops_at_missing_entry() {
        let mut p = MockPlatform::default();
        let eptp = build_guest_ept(&mut p, 0x1000, 0x2000);
        // A different PML4 slot is empty.
        let (level, gentry) = read_guest_epte(&mut p, AMASK, eptp, 0x80_0000_0000);
        assert_eq!(level, 3);
        assert_eq!(gentry & 0x7, 0);
    }

    #[test]
    fn guest_large_page_resolves_by_4k_piece() {
        let mut p = MockPlatform::default();
        let pml4 = 0x7_0000u64;
        let pdpt = 0x7_1000u64;
        let pd = 0x7_2000u64;
        let _ = p.guest_mem.insert(pml4, pdpt | 0x7);
        let _ = p.guest_mem.insert(pdpt, pd | 0x7);
        // PDE maps 2 MiB at 0x40_0000 with the large bit.
        let _ = p.guest_mem.insert(pd, 0x40_0000 | 0x87);
        let (level, gentry) = read_guest_epte(&mut p, AMASK, pml4 | 0x5E, 0x5000);
        assert_eq!(level, 1);

        let mut sept = Ept::new(16);
        let written = sept.shadow_write(&mut p, AMASK, 0x5000, level, gentry);
        // The shadow leaf is the 4 KiB piece of the large page.
        assert_eq!(written & AMASK, 0x40_5000 + HP_OFFSET);
    }

    #[test]
    fn shadow_write_drops_w_for_fakerom_target() {
        let mut p = MockPlatform {
            fakerom: alloc::vec![0x2000],
            ..Default::default()
        };
        let eptp = build_guest_ept(&mut p, 0x1000, 0x2000);
        let (level, gentry) = read_guest_epte(&mut p, AMASK, eptp, 0x1000);
        let mut sept = Ept::new(16);
        let written = sept.shadow_write(&mut p, AMASK, 0x1000, level, gentry);
        assert_eq!(written & 0x2, 0);
        assert_eq!(gentry & 0x2, 0x2);
    }

    #[test]
    fn shadow_invalidate_drops_only_the_leaf() {
        let mut p = MockPlatform::default();
        let eptp = build_guest_ept(&mut p, 0x1000, 0x2000);
        let (level, gentry) = read_guest_epte(&mut p, AMASK, eptp, 0x1000);
        let mut sept = Ept::new(16);
        let _ = sept.shadow_write(&mut p, AMASK, 0x1000, level, gentry);
        sept.shadow_invalidate(0x1000);
        assert!(host_walk(&sept, 0x1000).is_none());
        // Invalidating an unmapped address is a no-op.
        sept.shadow_invalidate(0x9_0000_0000);
    }

    #[test]
    fn cursor_keeps_locality_across_adjacent_faults() {
        let mut p = MockPlatform {
            no_2m_backing: true,
            ..Default::default()
        };
        let mut ept = fresh_ept(&mut p);
        ept.violation(&mut p, false, 0x1000);
        let cnt = ept.cnt;
        // The next page shares all table levels; no new tables appear.
        ept.violation(&mut p, false, 0x2000);
        assert_eq!(ept.cnt, cnt);
        assert!(host_walk(&ept, 0x2000).is_some());
    }
}
