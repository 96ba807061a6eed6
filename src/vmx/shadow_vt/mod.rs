//! The module containing the nested-virtualization ("shadow VT") engine.
//!
//! Once the guest executes VMXON it owns a [`ShadowVt`]: the per-vCPU
//! record of its VMX operation. The guest's VMXON region doubles as the
//! hardware shadow VMCS when the processor has VMCS shadowing, letting the
//! guest hypervisor VMREAD/VMWRITE its current VMCS without exiting.
//!
//! The VMCS the guest last loaded is handled in one of four modes:
//! `Cleared` (no current VMCS), `Normal` (no hardware shadowing),
//! `Shadowing` (guest VMCS mirrored into the auxiliary region), and
//! `NestedShadowing` (the guest's VMCS is itself a shadow VMCS for the
//! guest's own nested guest).

pub mod emulator;
pub mod run;
pub mod shadow_ept;

use crate::{
    platform::Platform,
    vmx::{
        vmcs::{self, bits, VmFail, VMCS_POINTER_INVALID},
        PCpu,
    },
    Page,
};
use alloc::boxed::Box;
use shadow_ept::ShadowEptData;
use spin::Once;
use x86::vmx::vmcs::{control, guest, host, ro};

/// How the guest's current VMCS is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsMode {
    /// No current VMCS (VMXON just executed, or VMCLEAR of the current).
    Cleared,
    /// A current VMCS without hardware shadowing assistance.
    Normal,
    /// The current VMCS is mirrored into the auxiliary shadow region.
    Shadowing,
    /// The guest's VMCS is itself marked as a shadow VMCS; it is linked
    /// directly so the guest's guest can VMREAD/VMWRITE it.
    NestedShadowing,
}

/// The one-shot latch for a remapped external-interrupt vector, used when
/// the processor cannot VMWRITE read-only fields.
///
/// Transitions: `Cleared` → `Set` (vector remapped on exit) → `Read`
/// (guest VMREAD substituted) → `Cleared`; any VMPTRLD/VMCLEAR/VM entry
/// clears it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExintHackMode {
    Cleared,
    Set,
    Read,
}

/// Per-vCPU state of the guest's VMX operation.
pub struct ShadowVt {
    /// Host-physical page backing the guest's VMXON region; doubles as
    /// the auxiliary shadow VMCS.
    pub(crate) vmxon_region_phys: u64,
    /// The same region in guest-physical space, kept for restoring its
    /// revision word on VMXOFF.
    pub(crate) vmxon_region_gphys: u64,
    /// The guest-chosen current VMCS in guest-physical space, or
    /// [`VMCS_POINTER_INVALID`].
    pub(crate) current_vmcs_gphys: u64,
    /// The same page translated to host-physical, cached for fast paths.
    pub(crate) current_vmcs_hphys: u64,
    pub(crate) mode: VmcsMode,
    pub(crate) exint_hack_mode: ExintHackMode,
    pub(crate) exint_hack_val: u64,
    pub(crate) shadow_ept: Option<Box<ShadowEptData>>,
}

impl core::fmt::Debug for ShadowVt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShadowVt")
            .field("current_vmcs_gphys", &self.current_vmcs_gphys)
            .field("mode", &self.mode)
            .field("exint_hack_mode", &self.exint_hack_mode)
            .finish_non_exhaustive()
    }
}

impl ShadowVt {
    pub(crate) fn new() -> Self {
        Self {
            vmxon_region_phys: VMCS_POINTER_INVALID,
            vmxon_region_gphys: VMCS_POINTER_INVALID,
            current_vmcs_gphys: VMCS_POINTER_INVALID,
            current_vmcs_hphys: VMCS_POINTER_INVALID,
            mode: VmcsMode::Cleared,
            exint_hack_mode: ExintHackMode::Cleared,
            exint_hack_val: 0,
            shadow_ept: None,
        }
    }

    /// The shadow-EPT caches, created on first use.
    pub(crate) fn shadow_ept_mut(&mut self) -> &mut ShadowEptData {
        self.shadow_ept.get_or_insert_with(|| Box::new(ShadowEptData::new()))
    }

    /// Latches a remapped interruption-information word for the guest's
    /// next VMREAD.
    pub(crate) fn set_exint_hack(&mut self, val: u64) {
        self.exint_hack_val = val;
        self.exint_hack_mode = ExintHackMode::Set;
    }

    /// Substitutes the latched value into a VMREAD result, keeping it
    /// re-readable until the next clearance point.
    pub(crate) fn do_exint_hack(&mut self, val: &mut u64) {
        match self.exint_hack_mode {
            ExintHackMode::Cleared => {}
            ExintHackMode::Set | ExintHackMode::Read => {
                self.exint_hack_mode = ExintHackMode::Read;
                *val = self.exint_hack_val;
            }
        }
    }

    /// Drops the latch at a clearance point. A still-unread value means
    /// the remapped interrupt is lost; that is logged and accepted.
    pub(crate) fn clear_exint_hack(&mut self, reason: &str) {
        match self.exint_hack_mode {
            ExintHackMode::Cleared => {}
            ExintHackMode::Set => {
                log::warn!(
                    "exint hack cleared at {}, intr info {:#x} lost",
                    reason,
                    self.exint_hack_val
                );
                self.exint_hack_mode = ExintHackMode::Cleared;
            }
            ExintHackMode::Read => {
                // The read value is expected to have been handled.
                self.exint_hack_mode = ExintHackMode::Cleared;
            }
        }
    }
}

/// The indicator bit in a VMCS region's first dword marking it as a
/// shadow VMCS.
///
/// See: 25.2 FORMAT OF THE VMCS REGION
pub(crate) const INDICATOR_SHADOWING_BIT: u32 = 0x8000_0000;

/// Host-state fields preserved from L1's configuration when L2 runs under
/// L0's exit controls.
pub(crate) const EXIT_CTL_SHADOW_MASK: u64 =
    bits::EXIT_HOST_ADDRESS_SPACE_SIZE | bits::EXIT_LOAD_PERF_GLOBAL_CTRL | bits::EXIT_LOAD_PAT;

// The field lists driving both the VMREAD/VMWRITE bitmaps and the copies
// between the guest's VMCS page and the auxiliary shadow region. The host
// runs 64-bit only, so the high halves of 64-bit fields are not listed.

pub(crate) const VMCS_FIELDS_HOST_STATE: &[u32] = &[
    host::ES_SELECTOR,
    host::CS_SELECTOR,
    host::SS_SELECTOR,
    host::DS_SELECTOR,
    host::FS_SELECTOR,
    host::GS_SELECTOR,
    host::TR_SELECTOR,
    host::IA32_PAT_FULL,
    host::IA32_SYSENTER_CS,
    host::CR0,
    host::CR3,
    host::CR4,
    host::FS_BASE,
    host::GS_BASE,
    host::TR_BASE,
    host::GDTR_BASE,
    host::IDTR_BASE,
    host::IA32_SYSENTER_ESP,
    host::IA32_SYSENTER_EIP,
    host::RSP,
    host::RIP,
];

pub(crate) const VMCS_FIELDS_SHADOWING: &[u32] = &[
    guest::ES_SELECTOR,
    guest::CS_SELECTOR,
    guest::SS_SELECTOR,
    guest::DS_SELECTOR,
    guest::FS_SELECTOR,
    guest::GS_SELECTOR,
    guest::LDTR_SELECTOR,
    guest::TR_SELECTOR,
    control::TSC_OFFSET_FULL,
    control::PRIMARY_PROCBASED_EXEC_CONTROLS,
    control::VMENTRY_INTERRUPTION_INFO_FIELD,
    control::TPR_THRESHOLD,
    guest::ES_LIMIT,
    guest::CS_LIMIT,
    guest::SS_LIMIT,
    guest::DS_LIMIT,
    guest::FS_LIMIT,
    guest::GS_LIMIT,
    guest::LDTR_LIMIT,
    guest::TR_LIMIT,
    guest::GDTR_LIMIT,
    guest::IDTR_LIMIT,
    guest::ES_ACCESS_RIGHTS,
    guest::CS_ACCESS_RIGHTS,
    guest::SS_ACCESS_RIGHTS,
    guest::DS_ACCESS_RIGHTS,
    guest::FS_ACCESS_RIGHTS,
    guest::GS_ACCESS_RIGHTS,
    guest::LDTR_ACCESS_RIGHTS,
    guest::TR_ACCESS_RIGHTS,
    guest::INTERRUPTIBILITY_STATE,
    control::CR0_READ_SHADOW,
    control::CR4_READ_SHADOW,
    guest::CR3,
    guest::ES_BASE,
    guest::CS_BASE,
    guest::SS_BASE,
    guest::DS_BASE,
    guest::FS_BASE,
    guest::GS_BASE,
    guest::LDTR_BASE,
    guest::TR_BASE,
    guest::GDTR_BASE,
    guest::IDTR_BASE,
    guest::DR7,
    guest::RSP,
    guest::RIP,
    guest::RFLAGS,
];

pub(crate) const VMCS_FIELDS_READONLY: &[u32] = &[
    ro::GUEST_PHYSICAL_ADDR_FULL,
    ro::EXIT_REASON,
    ro::VMEXIT_INTERRUPTION_INFO,
    ro::VMEXIT_INTERRUPTION_ERR_CODE,
    ro::IDT_VECTORING_INFO,
    ro::IDT_VECTORING_ERR_CODE,
    ro::VMEXIT_INSTRUCTION_LEN,
    ro::VMEXIT_INSTRUCTION_INFO,
    ro::EXIT_QUALIFICATION,
];

/// The process-wide VMREAD/VMWRITE bitmap pages for VMCS shadowing.
///
/// Three variants: `pass` lets every field through (all zeros), `legacy`
/// masks the read-only fields from VMWRITE, and `new` opens them up for
/// processors that can VMWRITE read-only fields.
pub(crate) struct VmrwBitmaps {
    pass: Box<Page>,
    legacy: Box<Page>,
    new: Box<Page>,
}

impl VmrwBitmaps {
    fn build() -> Self {
        let pass = Box::new(Page::zeroed());
        let mut legacy = Box::new(Page::filled(0xFF));
        clear_bitmap_fields(&mut legacy, VMCS_FIELDS_HOST_STATE);
        clear_bitmap_fields(&mut legacy, VMCS_FIELDS_SHADOWING);
        let mut new = Box::new(Page::filled(0xFF));
        clear_bitmap_fields(&mut new, VMCS_FIELDS_HOST_STATE);
        clear_bitmap_fields(&mut new, VMCS_FIELDS_SHADOWING);
        clear_bitmap_fields(&mut new, VMCS_FIELDS_READONLY);
        Self { pass, legacy, new }
    }

    pub(crate) fn pass_phys(&self) -> u64 {
        core::ptr::from_ref(self.pass.as_ref()) as u64
    }

    fn legacy_phys(&self) -> u64 {
        core::ptr::from_ref(self.legacy.as_ref()) as u64
    }

    fn new_phys(&self) -> u64 {
        core::ptr::from_ref(self.new.as_ref()) as u64
    }
}

fn set_bitmap_field(page: &mut Page, field: u32, trap: bool) {
    let index = (field & 0x7FFF) as usize;
    let byte = &mut page.as_bytes_mut()[index >> 3];
    if trap {
        *byte |= 1 << (index & 7);
    } else {
        *byte &= !(1 << (index & 7));
    }
}

fn clear_bitmap_fields(page: &mut Page, fields: &[u32]) {
    for &field in fields {
        set_bitmap_field(page, field, false);
    }
}

static VMRW_BITMAPS: Once<VmrwBitmaps> = Once::new();

/// The bitmap singleton; built once, immutable after publication.
pub(crate) fn get_vmrw_bitmaps() -> &'static VmrwBitmaps {
    VMRW_BITMAPS.call_once(VmrwBitmaps::build)
}

/// Decides how a freshly loaded guest VMCS is handled: without VMCS
/// shadowing everything is emulated; with it, the region's indicator bit
/// tells whether the guest itself is shadowing a grandchild VMCS.
pub(crate) fn choose_vmcs_mode(
    platform: &mut dyn Platform,
    vmcs_gphys: u64,
    pcpu: &PCpu,
) -> VmcsMode {
    if !pcpu.vmcs_shadowing_available {
        return VmcsMode::Normal;
    }
    let indicator = platform.read_gphys_u32(vmcs_gphys);
    if (indicator & INDICATOR_SHADOWING_BIT) != 0 {
        VmcsMode::NestedShadowing
    } else {
        VmcsMode::Shadowing
    }
}

/// Points the link pointer and the VMREAD/VMWRITE bitmaps at whatever the
/// current mode requires. Runs with the L0 VMCS current.
pub(crate) fn set_link_pointer(shadow: &ShadowVt, pcpu: &PCpu) {
    if !pcpu.vmcs_shadowing_available {
        return;
    }
    match shadow.mode {
        VmcsMode::Normal | VmcsMode::Cleared => {
            vmcs::vmwrite(guest::LINK_PTR_FULL, VMCS_POINTER_INVALID);
        }
        VmcsMode::Shadowing => {
            vmcs::vmwrite(guest::LINK_PTR_FULL, shadow.vmxon_region_phys);
            let bitmaps = get_vmrw_bitmaps();
            let phys = if pcpu.vmcs_writable_readonly {
                bitmaps.new_phys()
            } else {
                bitmaps.legacy_phys()
            };
            vmcs::vmwrite(control::VMREAD_BITMAP_ADDR_FULL, phys);
            vmcs::vmwrite(control::VMWRITE_BITMAP_ADDR_FULL, phys);
        }
        VmcsMode::NestedShadowing => {
            vmcs::vmwrite(guest::LINK_PTR_FULL, shadow.current_vmcs_hphys);
            let bitmaps = get_vmrw_bitmaps();
            vmcs::vmwrite(control::VMREAD_BITMAP_ADDR_FULL, bitmaps.pass_phys());
            vmcs::vmwrite(control::VMWRITE_BITMAP_ADDR_FULL, bitmaps.pass_phys());
        }
    }
}

fn save_vmcs(values: &mut [u64], fields: &[u32]) {
    for (value, &field) in values.iter_mut().zip(fields) {
        *value = vmcs::vmread(field);
    }
}

fn restore_vmcs(values: &[u64], fields: &[u32]) {
    for (value, &field) in values.iter().zip(fields) {
        vmcs::vmwrite(field, *value);
    }
}

/// Copies the shadowed field set from the VMCS at `src` to the VMCS at
/// `dst`, optionally including the host-state fields. Leaves `dst`
/// current.
pub(crate) fn vmcs_shadowing_copy(dst: u64, src: u64, include_hs: bool, pcpu: &PCpu) {
    let mut hs = [0u64; VMCS_FIELDS_HOST_STATE.len()];
    let mut shadowing = [0u64; VMCS_FIELDS_SHADOWING.len()];
    let mut readonly = [0u64; VMCS_FIELDS_READONLY.len()];

    let _ = vmcs::vmptrld_at(src);
    if include_hs {
        save_vmcs(&mut hs, VMCS_FIELDS_HOST_STATE);
    }
    save_vmcs(&mut shadowing, VMCS_FIELDS_SHADOWING);
    if pcpu.vmcs_writable_readonly {
        save_vmcs(&mut readonly, VMCS_FIELDS_READONLY);
    }
    let _ = vmcs::vmptrld_at(dst);
    if include_hs {
        restore_vmcs(&hs, VMCS_FIELDS_HOST_STATE);
    }
    restore_vmcs(&shadowing, VMCS_FIELDS_SHADOWING);
    if pcpu.vmcs_writable_readonly {
        restore_vmcs(&readonly, VMCS_FIELDS_READONLY);
    }
}

/// The host-state area of a VMCS, as moved between L0 and L1 around L2
/// entry.
///
/// See: 25.5 HOST-STATE AREA
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct VmcsHostStates {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub rsp: u64,
    pub rip: u64,
    pub es_sel: u64,
    pub cs_sel: u64,
    pub ss_sel: u64,
    pub ds_sel: u64,
    pub fs_sel: u64,
    pub gs_sel: u64,
    pub tr_sel: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub ia32_sysenter_cs: u64,
    pub ia32_sysenter_esp: u64,
    pub ia32_sysenter_eip: u64,
    pub ia32_pat: u64,
    pub ia32_perf_global_ctrl: u64,
}

/// Reads the host-state area of the current VMCS.
pub(crate) fn get_vmcs_host_states() -> VmcsHostStates {
    VmcsHostStates {
        cr0: vmcs::vmread(host::CR0),
        cr3: vmcs::vmread(host::CR3),
        cr4: vmcs::vmread(host::CR4),
        rsp: vmcs::vmread(host::RSP),
        rip: vmcs::vmread(host::RIP),
        es_sel: vmcs::vmread(host::ES_SELECTOR),
        cs_sel: vmcs::vmread(host::CS_SELECTOR),
        ss_sel: vmcs::vmread(host::SS_SELECTOR),
        ds_sel: vmcs::vmread(host::DS_SELECTOR),
        fs_sel: vmcs::vmread(host::FS_SELECTOR),
        gs_sel: vmcs::vmread(host::GS_SELECTOR),
        tr_sel: vmcs::vmread(host::TR_SELECTOR),
        fs_base: vmcs::vmread(host::FS_BASE),
        gs_base: vmcs::vmread(host::GS_BASE),
        tr_base: vmcs::vmread(host::TR_BASE),
        gdtr_base: vmcs::vmread(host::GDTR_BASE),
        idtr_base: vmcs::vmread(host::IDTR_BASE),
        ia32_sysenter_cs: vmcs::vmread(host::IA32_SYSENTER_CS),
        ia32_sysenter_esp: vmcs::vmread(host::IA32_SYSENTER_ESP),
        ia32_sysenter_eip: vmcs::vmread(host::IA32_SYSENTER_EIP),
        ia32_pat: vmcs::vmread(host::IA32_PAT_FULL),
        ia32_perf_global_ctrl: 0,
    }
}

/// Writes the host-state area of the current VMCS.
pub(crate) fn set_vmcs_host_states(hs: &VmcsHostStates) {
    vmcs::vmwrite(host::CR0, hs.cr0);
    vmcs::vmwrite(host::CR3, hs.cr3);
    vmcs::vmwrite(host::CR4, hs.cr4);
    vmcs::vmwrite(host::RSP, hs.rsp);
    vmcs::vmwrite(host::RIP, hs.rip);
    vmcs::vmwrite(host::ES_SELECTOR, hs.es_sel);
    vmcs::vmwrite(host::CS_SELECTOR, hs.cs_sel);
    vmcs::vmwrite(host::SS_SELECTOR, hs.ss_sel);
    vmcs::vmwrite(host::DS_SELECTOR, hs.ds_sel);
    vmcs::vmwrite(host::FS_SELECTOR, hs.fs_sel);
    vmcs::vmwrite(host::GS_SELECTOR, hs.gs_sel);
    vmcs::vmwrite(host::TR_SELECTOR, hs.tr_sel);
    vmcs::vmwrite(host::FS_BASE, hs.fs_base);
    vmcs::vmwrite(host::GS_BASE, hs.gs_base);
    vmcs::vmwrite(host::TR_BASE, hs.tr_base);
    vmcs::vmwrite(host::GDTR_BASE, hs.gdtr_base);
    vmcs::vmwrite(host::IDTR_BASE, hs.idtr_base);
    vmcs::vmwrite(host::IA32_SYSENTER_CS, hs.ia32_sysenter_cs);
    vmcs::vmwrite(host::IA32_SYSENTER_ESP, hs.ia32_sysenter_esp);
    vmcs::vmwrite(host::IA32_SYSENTER_EIP, hs.ia32_sysenter_eip);
    vmcs::vmwrite(host::IA32_PAT_FULL, hs.ia32_pat);
}

/// Maps a VMX instruction outcome onto the guest's arithmetic flags:
/// all six cleared on success, CF for VMfailInvalid, ZF for VMfailValid.
///
/// See: 31.2 CONVENTIONS
pub(crate) fn set_guest_vmx_result(result: Result<(), VmFail>) {
    const FLAG_MASK: u64 = (1 << 0) | (1 << 2) | (1 << 4) | (1 << 6) | (1 << 7) | (1 << 11);
    const FLAG_CF: u64 = 1 << 0;
    const FLAG_ZF: u64 = 1 << 6;

    let mut rflags = vmcs::vmread(guest::RFLAGS) & !FLAG_MASK;
    match result {
        Ok(()) => {}
        Err(VmFail::VmFailInvalid) => rflags |= FLAG_CF,
        Err(VmFail::VmFailValid) => rflags |= FLAG_ZF,
    }
    vmcs::vmwrite(guest::RFLAGS, rflags);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_traps(page: &Page, field: u32) -> bool {
        let index = (field & 0x7FFF) as usize;
        (page.as_bytes()[index >> 3] & (1 << (index & 7))) != 0
    }

    #[test]
    fn pass_bitmap_traps_nothing() {
        let bitmaps = VmrwBitmaps::build();
        assert!(bitmaps.pass.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn legacy_bitmap_masks_readonly_fields() {
        let bitmaps = VmrwBitmaps::build();
        for &field in VMCS_FIELDS_HOST_STATE {
            assert!(!bitmap_traps(&bitmaps.legacy, field), "field {field:#x}");
        }
        for &field in VMCS_FIELDS_SHADOWING {
            assert!(!bitmap_traps(&bitmaps.legacy, field), "field {field:#x}");
        }
        for &field in VMCS_FIELDS_READONLY {
            assert!(bitmap_traps(&bitmaps.legacy, field), "field {field:#x}");
        }
    }

    #[test]
    fn new_bitmap_opens_readonly_fields() {
        let bitmaps = VmrwBitmaps::build();
        for &field in VMCS_FIELDS_READONLY {
            assert!(!bitmap_traps(&bitmaps.new, field), "field {field:#x}");
        }
        // Fields outside every list still trap.
        assert!(bitmap_traps(&bitmaps.new, control::EPTP_FULL));
    }

    #[test]
    fn exint_hack_set_read_clear_cycle() {
        let mut shadow = ShadowVt::new();
        shadow.set_exint_hack(0x8000_002E);
        let mut val = 0;
        shadow.do_exint_hack(&mut val);
        assert_eq!(val, 0x8000_002E);
        assert_eq!(shadow.exint_hack_mode, ExintHackMode::Read);
        // Re-reads keep substituting until a clearance point.
        let mut val2 = 0;
        shadow.do_exint_hack(&mut val2);
        assert_eq!(val2, 0x8000_002E);
        shadow.clear_exint_hack("vmptrld");
        assert_eq!(shadow.exint_hack_mode, ExintHackMode::Cleared);
        let mut val3 = 7;
        shadow.do_exint_hack(&mut val3);
        assert_eq!(val3, 7);
    }

    #[test]
    fn exint_hack_unread_value_is_dropped_on_clear() {
        let mut shadow = ShadowVt::new();
        shadow.set_exint_hack(0x8000_0020);
        shadow.clear_exint_hack("vmclear");
        assert_eq!(shadow.exint_hack_mode, ExintHackMode::Cleared);
    }
}
