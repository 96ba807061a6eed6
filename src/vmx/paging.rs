//! The module containing the paging-mode switch: which second-level
//! translation serves the guest, EPT or the external shadow-paging MMU,
//! and the VMCS surgery needed when the guest toggles CR0.PG or CR4.PAE.

use crate::{
    config,
    platform::Platform,
    vmx::{
        ept::Ept,
        vmcs::{self, bits, InveptType, InvvpidType},
        vcpu::VCpu,
    },
    x86_instructions::rdmsr,
};
use x86::vmx::vmcs::{control, guest, host};

/// EPT serves the guest iff paging is on (or unrestricted guest lifts the
/// requirement) and the tree exists.
fn ept_enabled(vcpu: &VCpu) -> bool {
    (vcpu.vr.pg || vcpu.unrestricted_guest) && vcpu.ept.is_some()
}

/// Chooses the translation mechanism for a fresh vCPU and builds the EPT
/// if the processor has it. Runs after [`VCpu::vmcs_init`].
pub fn init(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    if vcpu.ept_available && vcpu.unrestricted_guest_available {
        vcpu.unrestricted_guest = true;
    } else {
        platform.spt_init();
    }
    if vcpu.ept_available {
        let ept = Ept::new(config::EPT_TABLE_COUNT);
        vmcs::vmwrite(control::EPTP_FULL, ept.eptp());
        vcpu.ept = Some(ept);
    }
    pg_change(vcpu, platform);
}

/// Invalidates every guest translation this CPU may have cached: the
/// vCPU's VPID context and, when EPT is active, all EPT-derived mappings.
pub fn flush_guest_tlb(vcpu: &mut VCpu) {
    if vcpu.vpid != 0 {
        vmcs::invvpid(InvvpidType::SingleContext, vcpu.vpid);
    }
    if ept_enabled(vcpu) && vcpu.invept_available {
        vmcs::invept(InveptType::AllContexts, 0);
    }
}

/// Performs the TLB flush owed after an EPT wipe, if one is pending.
fn drain_ept_flush(vcpu: &mut VCpu) {
    let pending = vcpu.ept.as_mut().is_some_and(Ept::take_flush_pending);
    if pending {
        flush_guest_tlb(vcpu);
    }
}

/// Maps guest-physical `[0, 0x100000)` for real-mode firmware access.
pub fn map_1mb(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    if ept_enabled(vcpu) {
        vcpu.ept.as_mut().unwrap().map_1mb(platform);
        drain_ept_flush(vcpu);
    } else {
        platform.spt_map_1mb();
    }
}

/// Routes a guest #PF to the shadow-paging MMU. A #PF cannot reach the
/// hypervisor while EPT is on.
pub fn pagefault(vcpu: &mut VCpu, platform: &mut dyn Platform, err: u64, cr2: u64) {
    assert!(!ept_enabled(vcpu), "pagefault while ept enabled");
    platform.spt_pagefault(err, cr2);
}

/// Handles a guest-initiated full TLB flush (e.g. CR0/CR4 writes that
/// flush). EPT needs nothing; translations are keyed by EPTP.
pub fn tlbflush(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    if !ept_enabled(vcpu) {
        platform.spt_tlbflush();
    }
}

/// Handles guest INVLPG. INVLPG exiting is off under EPT, so reaching
/// this with EPT enabled is a dispatcher bug.
pub fn invalidate(vcpu: &mut VCpu, platform: &mut dyn Platform, addr: u64) {
    assert!(!ept_enabled(vcpu), "invlpg while ept enabled");
    platform.spt_invalidate(addr);
}

/// Services a nested page fault (EPT violation).
pub fn npf(vcpu: &mut VCpu, platform: &mut dyn Platform, write: bool, gphys: u64) {
    assert!(ept_enabled(vcpu), "EPT violation while ept disabled");
    vcpu.ept.as_mut().unwrap().violation(platform, write, gphys);
    drain_ept_flush(vcpu);
}

fn update_vmcs_guest_cr3(vcpu: &VCpu) {
    if !vcpu.cr3exit_off {
        vmcs::vmwrite(guest::CR3, vcpu.vr.cr3);
    }
}

/// The guest CR3 value: live in the VMCS while CR3 exits are off, cached
/// in the register view otherwise.
pub fn read_cr3(vcpu: &VCpu) -> u64 {
    if vcpu.cr3exit_off {
        vmcs::vmread(guest::CR3)
    } else {
        vcpu.vr.cr3
    }
}

/// Updates the guest CR3, honoring the current CR3-exit arrangement.
pub fn write_cr3(vcpu: &mut VCpu, cr3: u64) {
    vcpu.vr.cr3 = cr3;
    vmcs::vmwrite(guest::CR3, cr3);
}

/// Reacts to a guest CR3 write: flushes, republishes CR3, and reloads the
/// PDPTE registers for a legacy PAE guest running under EPT.
pub fn updatecr3(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    if ept_enabled(vcpu) {
        update_vmcs_guest_cr3(vcpu);
        flush_guest_tlb(vcpu);
        if !vcpu.vr.lma && vcpu.vr.pg {
            const CR4_PAE_FLAG: u64 = 1 << 5;
            let cr4_shadow = vmcs::vmread(control::CR4_READ_SHADOW);
            if (cr4_shadow & CR4_PAE_FLAG) != 0 {
                // PAE without long mode: the four PDPTEs are registers
                // loaded from guest memory at CR3-write time.
                // See: 4.4.1 PDPTE Registers
                let cr3 = vmcs::vmread(guest::CR3) & 0xFFFF_FFE0;
                vmcs::vmwrite(guest::PDPTE0_FULL, platform.read_gphys_u64(cr3));
                vmcs::vmwrite(guest::PDPTE1_FULL, platform.read_gphys_u64(cr3 + 0x8));
                vmcs::vmwrite(guest::PDPTE2_FULL, platform.read_gphys_u64(cr3 + 0x10));
                vmcs::vmwrite(guest::PDPTE3_FULL, platform.read_gphys_u64(cr3 + 0x18));
            }
        }
    } else {
        platform.spt_updatecr3();
    }
}

/// Installs the CR3 chosen by the shadow-paging MMU.
pub fn spt_setcr3(vcpu: &mut VCpu, cr3: u64) {
    vcpu.spt_cr3 = cr3;
    if !ept_enabled(vcpu) {
        vmcs::vmwrite(guest::CR3, cr3);
    }
}

/// Drops every second-level mapping of this vCPU.
pub fn clear_all(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    if let Some(ept) = vcpu.ept.as_mut() {
        ept.clear_all();
        drain_ept_flush(vcpu);
    }
    if !vcpu.unrestricted_guest {
        platform.spt_clear_all();
    }
}

/// Reads the guest PAT from the cache model.
pub fn get_gpat(platform: &mut dyn Platform) -> (bool, u64) {
    platform.get_gpat()
}

/// Updates the guest PAT model and propagates it to the VMCS when EPT
/// carries the guest PAT directly.
pub fn set_gpat(vcpu: &mut VCpu, platform: &mut dyn Platform, pat: u64) -> bool {
    let handled = platform.set_gpat(pat);
    if !vcpu.unrestricted_guest {
        platform.spt_clear_all();
    }
    if !handled && ept_enabled(vcpu) {
        vmcs::vmwrite(guest::IA32_PAT_FULL, pat);
    }
    handled
}

/// Applies the CR0 FIXED bits to a guest-chosen value. Unrestricted guest
/// frees PG and PE; shadow paging forces WP so that the MMU's read-only
/// mappings hold against supervisor writes.
pub fn apply_fixed_cr0(vcpu: &VCpu, val: u64) -> u64 {
    const CR0_PE_FLAG: u64 = 1 << 0;
    const CR0_WP_FLAG: u64 = 1 << 16;
    const CR0_PG_FLAG: u64 = 1 << 31;

    let mut fixed0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0);
    let mut fixed1 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);
    if vcpu.unrestricted_guest {
        fixed1 |= CR0_PG_FLAG | CR0_PE_FLAG;
        fixed0 &= !(CR0_PG_FLAG | CR0_PE_FLAG);
    }
    let mut val = (val & fixed1) | fixed0;
    if !ept_enabled(vcpu) {
        val |= CR0_WP_FLAG;
    }
    val
}

/// Applies the CR4 FIXED bits to a guest-chosen value. The shadow MMU
/// works in PAE format, so CR4.PAE is forced on while it is active.
pub fn apply_fixed_cr4(vcpu: &VCpu, val: u64) -> u64 {
    const CR4_PAE_FLAG: u64 = 1 << 5;

    let fixed0 = rdmsr(x86::msr::IA32_VMX_CR4_FIXED0);
    let fixed1 = rdmsr(x86::msr::IA32_VMX_CR4_FIXED1);
    let mut val = (val & fixed1) | fixed0;
    if !ept_enabled(vcpu) {
        val |= CR4_PAE_FLAG;
    }
    val
}

/// Re-arranges the VMCS when the guest's paging mode changes: flips
/// between EPT and shadow paging, toggles PAT/EFER save-load, INVLPG and
/// CR3 exiting, and republishes CR0/CR3/CR4.
pub fn pg_change(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    let ept_enable = ept_enabled(vcpu);
    let use_spt = !ept_enable;

    if vcpu.ept.is_some() {
        let mut ctl2 = vmcs::vmread(control::SECONDARY_PROCBASED_EXEC_CONTROLS);
        ctl2 &= !(bits::PROC2_ENABLE_EPT | bits::PROC2_UNRESTRICTED_GUEST);
        if ept_enable {
            ctl2 |= bits::PROC2_ENABLE_EPT;
            if vcpu.unrestricted_guest {
                ctl2 |= bits::PROC2_UNRESTRICTED_GUEST;
            }
        }
        vmcs::vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, ctl2);

        let mut exit_ctl = vmcs::vmread(control::VMEXIT_CONTROLS);
        if ept_enable {
            exit_ctl |= bits::EXIT_SAVE_PAT | bits::EXIT_LOAD_PAT;
        } else {
            exit_ctl &= !(bits::EXIT_SAVE_PAT | bits::EXIT_LOAD_PAT);
        }
        vmcs::vmwrite(control::VMEXIT_CONTROLS, exit_ctl);

        let mut entry_ctl = vmcs::vmread(control::VMENTRY_CONTROLS);
        if ept_enable {
            entry_ctl |= bits::ENTRY_LOAD_PAT;
        } else {
            entry_ctl &= !bits::ENTRY_LOAD_PAT;
        }
        vmcs::vmwrite(control::VMENTRY_CONTROLS, entry_ctl);

        if ept_enable {
            vmcs::vmwrite(host::IA32_PAT_FULL, rdmsr(x86::msr::IA32_PAT));
            let (_, gpat) = platform.get_gpat();
            vmcs::vmwrite(guest::IA32_PAT_FULL, gpat);
        }
    }

    let mut proc_ctl = vmcs::vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    if use_spt {
        proc_ctl |= bits::PROC_INVLPG_EXITING;
    } else {
        proc_ctl &= !bits::PROC_INVLPG_EXITING;
    }
    if vcpu.cr3exit_controllable {
        // The cached CR3 changes representation across the toggle; carry
        // it over explicitly.
        if use_spt && vcpu.cr3exit_off {
            let cr3 = read_cr3(vcpu);
            proc_ctl |= bits::PROC_CR3_LOAD_EXITING | bits::PROC_CR3_STORE_EXITING;
            vcpu.cr3exit_off = false;
            write_cr3(vcpu, cr3);
        } else if !use_spt && !vcpu.cr3exit_off {
            let cr3 = read_cr3(vcpu);
            proc_ctl &= !(bits::PROC_CR3_LOAD_EXITING | bits::PROC_CR3_STORE_EXITING);
            vcpu.cr3exit_off = true;
            write_cr3(vcpu, cr3);
        }
    }
    vmcs::vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, proc_ctl);

    vmcs::vmwrite(guest::CR0, apply_fixed_cr0(vcpu, vcpu.vr.cr0));
    if use_spt {
        vmcs::vmwrite(guest::CR3, vcpu.spt_cr3);
    } else {
        update_vmcs_guest_cr3(vcpu);
    }
    vmcs::vmwrite(guest::CR4, apply_fixed_cr4(vcpu, vcpu.vr.cr4));

    vcpu.handle_pagefault = use_spt;
    vcpu.update_exception_bitmap();

    if ept_enable {
        vcpu.ept.as_mut().unwrap().clear_all();
        drain_ept_flush(vcpu);
    }
}

/// Cross-vCPU invalidation: reports (or clears, on the active vCPU)
/// second-level mappings of host-physical `[start, end]`.
pub fn extern_flush_tlb_entry(
    vcpu: &mut VCpu,
    platform: &mut dyn Platform,
    active: bool,
    start: u64,
    end: u64,
) -> bool {
    let amask = platform.pte_addr_mask();
    if let Some(ept) = vcpu.ept.as_mut() {
        if ept.extern_mapsearch(active, amask, start, end) {
            return true;
        }
        if vcpu.unrestricted_guest {
            return false;
        }
    }
    platform.spt_extern_mapsearch(start, end)
}
