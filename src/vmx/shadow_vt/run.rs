//! The module containing the L2 run engine: entering the guest
//! hypervisor's guest on its behalf and marshalling the results back.
//!
//! VMLAUNCH/VMRESUME by the guest switches the processor onto the guest's
//! VMCS with L0's host state swapped in, runs L2, services shadow-EPT
//! faults without surfacing them, and finally reshapes the L0 VMCS so the
//! guest hypervisor observes a VM exit from its own guest.

use crate::{
    config::{self, NestedVt},
    platform::Platform,
    vmx::{
        ept::read_guest_epte,
        exit::{
            IntrInfo, EXIT_REASON_BASIC_MASK, EXIT_REASON_EPT_MISCONFIG,
            EXIT_REASON_EPT_VIOLATION, EXIT_REASON_EXTERNAL_INTERRUPT,
            EXIT_REASON_VMENTRY_FAILURE_FLAG, INTR_TYPE_EXTERNAL, INTR_TYPE_NMI,
            QUAL_EPT_ENTRY_EXEC, QUAL_EPT_ENTRY_READ, QUAL_EPT_ENTRY_WRITE, QUAL_EPT_WRITE,
            QUAL_EPT_NMI_UNBLOCKING_DUE_TO_IRET,
        },
        paging,
        shadow_vt::{
            get_vmcs_host_states, set_guest_vmx_result, set_vmcs_host_states, ShadowVt, VmcsMode,
            VmcsHostStates, EXIT_CTL_SHADOW_MASK,
        },
        vcpu::VCpu,
        vmcs::{self, bits, VmFail, VMCS_POINTER_INVALID},
        run_vm, PCpu,
    },
    x86_instructions::{rdmsr, wrmsr},
};
use x86::vmx::vmcs::{control, guest, host, ro};

const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// Secondary controls a guest must not carry while its EPT is concealed
/// and L0's own EPT pointer is forced onto L2.
const PROC2_NESTED_OFF_BITS: u64 = bits::PROC2_UNRESTRICTED_GUEST | bits::PROC2_VMCS_SHADOWING;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryErr {
    None,
    /// Entry canceled because the host observed an NMI; retry the same
    /// instruction after it is serviced.
    Nmi,
    FailValid,
    FailInvalid,
}

/// Emulates VMLAUNCH (`vmlaunched` = false) or VMRESUME (true) executed
/// by the guest.
pub(crate) fn run_l2vm(vcpu: &mut VCpu, pcpu: &PCpu, platform: &mut dyn Platform, vmlaunched: bool) {
    let mut shadow = vcpu.shadow_vt.take().unwrap();
    if shadow.current_vmcs_gphys == VMCS_POINTER_INVALID {
        set_guest_vmx_result(Err(VmFail::VmFailInvalid));
        vcpu.shadow_vt = Some(shadow);
        vcpu.add_ip();
        return;
    }

    let mut efer_l1 = read_guest_efer(vcpu);
    let interruptibility = vmcs::vmread(guest::INTERRUPTIBILITY_STATE);
    let exit_ctl01 = vmcs::vmread(control::VMEXIT_CONTROLS);
    let mut host_eptp = 0;
    if config::NESTED_VT == NestedVt::ShadowEpt {
        // Unrestricted guest guarantees EPT is in use, keeping the VPID
        // bit untouched below.
        assert!(vcpu.unrestricted_guest, "Unrestricted guest not supported");
        host_eptp = vmcs::vmread(control::EPTP_FULL);
    }
    let orig_vmcs_phys = vmcs::vmptrst();

    if (interruptibility & bits::INTERRUPTIBILITY_MOV_SS_BLOCKING) != 0 {
        // VM entry with MOV-SS blocking must fail with the right error
        // number; let the hardware produce it in the guest's VMCS.
        let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
        movss_and_vmlaunch();
        let _ = vmcs::vmptrld_at(orig_vmcs_phys);
        set_guest_vmx_result(Err(VmFail::VmFailValid));
        vcpu.shadow_vt = Some(shadow);
        vcpu.add_ip();
        return;
    }

    // Swap host states: L2 must exit into L0's handlers, not L1's.
    let mut hsl02;
    if shadow.mode == VmcsMode::Shadowing {
        vmcs_copy_to_guest_vmcs(&shadow, pcpu);
        let _ = vmcs::vmptrld_at(shadow.vmxon_region_phys);
        hsl02 = get_vmcs_host_states();
        let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
    } else {
        let hsl01 = get_vmcs_host_states();
        let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
        hsl02 = get_vmcs_host_states();
        set_vmcs_host_states(&hsl01);
    }

    // Exit controls: preserve L1's host-state-shaping bits, force the
    // rest to L0's configuration.
    let exit_ctl02 = vmcs::vmread(control::VMEXIT_CONTROLS);
    vmcs::vmwrite(
        control::VMEXIT_CONTROLS,
        (exit_ctl02 & !EXIT_CTL_SHADOW_MASK) | (exit_ctl01 & EXIT_CTL_SHADOW_MASK),
    );

    // Without unrestricted guest, shadow paging is in use and VPID 0
    // translations must be invalidated on entry and exit; clearing the
    // enable-VPID bit does exactly that.
    let orig_proc = vmcs::vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    let mut proc2 = if (orig_proc & bits::PROC_ACTIVATE_SECONDARY_CONTROLS) != 0 {
        vmcs::vmread(control::SECONDARY_PROCBASED_EXEC_CONTROLS)
    } else {
        0
    };
    let mut proc = orig_proc;
    let orig_proc2 = proc2;
    if (proc2 & bits::PROC2_ENABLE_VPID) != 0 && !vcpu.unrestricted_guest {
        proc2 &= !bits::PROC2_ENABLE_VPID;
    }

    // Second-level translation for L2: a shadow of L1's EPT when it uses
    // EPT, or L0's own EPT forced on when it does not.
    let mut guest_eptp = 0;
    let mut guest_vpid = 0;
    let mut ept_slot = None;
    let mut real_vpid = None;
    if (proc2 & bits::PROC2_ENABLE_EPT) != 0 && host_eptp != 0 {
        guest_eptp = vmcs::vmread(control::EPTP_FULL);
        if (guest_eptp & bits::EPTP_MEMORY_TYPE_WB) != bits::EPTP_MEMORY_TYPE_WB
            || (guest_eptp & bits::EPTP_PAGE_WALK_LENGTH_4) != bits::EPTP_PAGE_WALK_LENGTH_4
        {
            panic!("Nested invalid EPT pointer {guest_eptp:#x}");
        }
        let data = shadow.shadow_ept_mut();
        let (slot, evicted) = data.get_ept_info(guest_eptp);
        for vpid in evicted.iter() {
            vmcs::invvpid(vmcs::InvvpidType::SingleContext, vpid);
        }
        guest_vpid = if (proc2 & bits::PROC2_ENABLE_VPID) != 0 {
            vmcs::vmread(control::VPID)
        } else {
            0
        };
        if guest_vpid != 0 {
            let (real, evicted) = data.get_vpid_info(guest_eptp, guest_vpid as u16);
            if let Some(stale) = evicted {
                vmcs::invvpid(vmcs::InvvpidType::SingleContext, stale);
            }
            vmcs::vmwrite(control::VPID, real);
            real_vpid = Some(real);
        }
        let shadow_eptp = data.activate(slot);
        vmcs::vmwrite(control::EPTP_FULL, shadow_eptp);
        ept_slot = Some(slot);
    } else if host_eptp != 0 {
        // The guest runs without EPT of its own; conceal ours under it.
        if (proc2 & PROC2_NESTED_OFF_BITS) != 0 {
            panic!("Nested invalid secondary controls {proc2:#x}");
        }
        proc2 &= !bits::PROC2_ENABLE_VPID;
        proc2 |= bits::PROC2_ENABLE_EPT;
        vmcs::vmwrite(control::EPTP_FULL, host_eptp);
        let entry_ctl = vmcs::vmread(control::VMENTRY_CONTROLS);
        if (entry_ctl & bits::ENTRY_IA32E_MODE_GUEST) == 0 {
            const CR4_PAE_FLAG: u64 = 1 << 5;
            let cr4 = vmcs::vmread(guest::CR4);
            if (cr4 & CR4_PAE_FLAG) != 0 {
                // A legacy PAE L2 under freshly-enabled EPT needs its
                // PDPTE registers populated here.
                let cr3 = vmcs::vmread(guest::CR3) & 0xFFFF_FFE0;
                vmcs::vmwrite(guest::PDPTE0_FULL, platform.read_gphys_u64(cr3));
                vmcs::vmwrite(guest::PDPTE1_FULL, platform.read_gphys_u64(cr3 + 0x8));
                vmcs::vmwrite(guest::PDPTE2_FULL, platform.read_gphys_u64(cr3 + 0x10));
                vmcs::vmwrite(guest::PDPTE3_FULL, platform.read_gphys_u64(cr3 + 0x18));
            }
        }
    }
    if proc2 != 0 {
        proc |= bits::PROC_ACTIVATE_SECONDARY_CONTROLS;
    }
    if orig_proc != proc {
        vmcs::vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, proc);
    }
    if orig_proc2 != proc2 {
        vmcs::vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, proc2);
    }

    // Run. The processor's EFER must look like L1's host EFER for a
    // 64-bit L0 while L2 executes under L1's VMCS.
    efer_l1 |= EFER_LMA | EFER_LME;
    let saved_host_efer = rdmsr(x86::msr::IA32_EFER);
    let mut efer_l2 = efer_l1;
    let mut entry_err = enter_l2(vcpu, vmlaunched, efer_l1, saved_host_efer, &mut efer_l2);

    // Shadow-EPT faults are serviced and L2 resumed without L1 ever
    // noticing; everything else falls through and reflects to L1.
    if host_eptp != 0
        && entry_err == EntryErr::None
        && handle_ept(vcpu, pcpu, platform, &mut shadow, ept_slot, guest_eptp)
    {
        loop {
            handle_ept_violation_event_delivery();
            efer_l1 = efer_l2;
            entry_err = enter_l2(vcpu, true, efer_l1, saved_host_efer, &mut efer_l2);
            if entry_err != EntryErr::None
                || !handle_ept(vcpu, pcpu, platform, &mut shadow, ept_slot, guest_eptp)
            {
                break;
            }
        }
        // An NMI arriving after the EPT-violation exit should become a VM
        // exit for L1; handling it like an NMI before entry is simpler
        // but leaves the VM state advanced, which L1 might notice.
        match entry_err {
            EntryErr::Nmi => {
                if !vmlaunched {
                    // VMLAUNCH will run again; the VMCS must be clear.
                    let _ = vmcs::vmclear_at(shadow.current_vmcs_hphys);
                    let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
                }
            }
            EntryErr::None => {}
            _ => panic!("Nested VM entry failure {entry_err:?}"),
        }
    }

    // Restore what was borrowed for the entry.
    if ept_slot.is_some() {
        vmcs::vmwrite(control::EPTP_FULL, guest_eptp);
    }
    if real_vpid.is_some() {
        vmcs::vmwrite(control::VPID, guest_vpid);
    }
    if orig_proc2 != proc2 {
        vmcs::vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, orig_proc2);
    }
    if orig_proc != proc {
        vmcs::vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, orig_proc);
    }
    vmcs::vmwrite(control::VMEXIT_CONTROLS, exit_ctl02);

    if shadow.mode == VmcsMode::Shadowing {
        vmcs_copy_to_shadow_region(&shadow, pcpu);
        let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
    } else {
        set_vmcs_host_states(&hsl02);
    }

    if entry_err != EntryErr::None {
        let _ = vmcs::vmptrld_at(orig_vmcs_phys);
        match entry_err {
            EntryErr::Nmi => {
                // Restart from the same instruction once the NMI has been
                // serviced.
            }
            EntryErr::FailValid => {
                set_guest_vmx_result(Err(VmFail::VmFailValid));
                vcpu.add_ip();
            }
            _ => {
                set_guest_vmx_result(Err(VmFail::VmFailInvalid));
                vcpu.add_ip();
            }
        }
        vcpu.shadow_vt = Some(shadow);
        return;
    }

    // L2 exited for a reason L1 must handle. If the exit acknowledged an
    // external interrupt, the vector may need remapping first.
    shadow.clear_exint_hack("VM exit");
    if (exit_ctl02 & bits::EXIT_ACK_INTERRUPT_ON_EXIT) != 0 {
        handle_acked_exint_pass(pcpu, platform, &mut shadow);
    }
    hsl02.ia32_perf_global_ctrl = vmcs::vmread(host::IA32_PERF_GLOBAL_CTRL_FULL);
    switch_vmcs_and_load_l1_host_state(
        vcpu,
        platform,
        orig_vmcs_phys,
        efer_l2,
        exit_ctl02,
        &hsl02,
    );
    vcpu.shadow_vt = Some(shadow);
}

/// Copies the shadowed fields from the auxiliary region out to the
/// guest's VMCS page (host state excluded; L0's host state never leaks).
fn vmcs_copy_to_guest_vmcs(shadow: &ShadowVt, pcpu: &PCpu) {
    super::vmcs_shadowing_copy(
        shadow.current_vmcs_hphys,
        shadow.vmxon_region_phys,
        false,
        pcpu,
    );
}

/// Copies the shadowed fields from the guest's VMCS page back into the
/// auxiliary region after the L2 episode.
fn vmcs_copy_to_shadow_region(shadow: &ShadowVt, pcpu: &PCpu) {
    super::vmcs_shadowing_copy(
        shadow.vmxon_region_phys,
        shadow.current_vmcs_hphys,
        false,
        pcpu,
    );
}

/// One hardware VM entry with the EFER choreography around it. The NMI
/// latch takes priority; a latched NMI cancels the entry.
fn enter_l2(
    vcpu: &mut VCpu,
    resume: bool,
    efer_for_entry: u64,
    saved_host_efer: u64,
    efer_after_exit: &mut u64,
) -> EntryErr {
    if vcpu.take_nmi() {
        return EntryErr::Nmi;
    }
    wrmsr(x86::msr::IA32_EFER, efer_for_entry);
    // Safety: the guest's VMCS is current and fully configured.
    let err = unsafe { run_vm(&mut vcpu.regs, u64::from(resume)) };
    *efer_after_exit = rdmsr(x86::msr::IA32_EFER);
    wrmsr(x86::msr::IA32_EFER, saved_host_efer);
    match err {
        0 => EntryErr::None,
        -1 => EntryErr::FailValid,
        _ => EntryErr::FailInvalid,
    }
}

/// Executes MOV SS immediately followed by VMLAUNCH so the hardware
/// rejects the entry exactly as it would for the guest.
fn movss_and_vmlaunch() {
    // Safety: the VM entry is guaranteed to fail; execution falls
    // through with only flags changed.
    unsafe {
        core::arch::asm!("mov ax, ss", "mov ss, ax", "vmlaunch", out("ax") _);
    }
}

/// Routes an L2 exit taken on the second-level translation: to the shadow
/// tree when L1 uses EPT, or to L0's own EPT when it is concealed.
/// Returns true when the exit was fully absorbed and L2 should resume.
fn handle_ept(
    vcpu: &mut VCpu,
    pcpu: &PCpu,
    platform: &mut dyn Platform,
    shadow: &mut ShadowVt,
    ept_slot: Option<usize>,
    guest_eptp: u64,
) -> bool {
    match ept_slot {
        None => handle_ept_host(vcpu, platform),
        Some(slot) => handle_ept_shadow(pcpu, platform, shadow, slot, guest_eptp),
    }
}

/// Services an L2 fault on the shadow EPT by walking L1's EPT and
/// installing the corresponding shadow leaf.
fn handle_ept_shadow(
    pcpu: &PCpu,
    platform: &mut dyn Platform,
    shadow: &mut ShadowVt,
    slot: usize,
    guest_eptp: u64,
) -> bool {
    let exit_reason = vmcs::vmread(ro::EXIT_REASON);
    if (exit_reason & EXIT_REASON_VMENTRY_FAILURE_FLAG) != 0 {
        return false;
    }
    match (exit_reason & EXIT_REASON_BASIC_MASK) as u16 {
        EXIT_REASON_EPT_MISCONFIG => {
            // Misconfigured entries must not stay cached.
            let gphys = vmcs::vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
            shadow.shadow_ept_mut().ept_mut(slot).shadow_invalidate(gphys);
            return false;
        }
        EXIT_REASON_EPT_VIOLATION => {}
        _ => return false,
    }

    let qualification = vmcs::vmread(ro::EXIT_QUALIFICATION);
    let gphys = vmcs::vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
    let sept = shadow.shadow_ept_mut().ept_mut(slot);

    // A violation on an already-present shadow entry: drop it, and treat
    // anything but a write as a fault for L1. A write may instead have
    // hit the hypervisor's own write protection, checked below.
    let mut write_check = false;
    if (qualification & (QUAL_EPT_ENTRY_READ | QUAL_EPT_ENTRY_WRITE | QUAL_EPT_ENTRY_EXEC)) != 0 {
        sept.shadow_invalidate(gphys);
        if (qualification & QUAL_EPT_WRITE) == 0 {
            return false;
        }
        write_check = true;
    }

    let amask = platform.pte_addr_mask();
    let (guest_level, guest_entry) = read_guest_epte(platform, amask, guest_eptp, gphys);

    if write_check {
        // If the guest's permissions match what the hardware reported,
        // the violation is genuine and belongs to L1.
        if ((guest_entry & 1) != 0) == ((qualification & QUAL_EPT_ENTRY_READ) != 0)
            && ((guest_entry & 2) != 0) == ((qualification & QUAL_EPT_ENTRY_WRITE) != 0)
            && ((guest_entry & 4) != 0) == ((qualification & QUAL_EPT_ENTRY_EXEC) != 0)
        {
            return false;
        }
        // A non-present entry whose copy was just dropped needs no new
        // shadow; the next exit will carry a consistent qualification.
        if (guest_entry & 0x7) != 0 {
            let shadow_entry = sept.shadow_write(platform, amask, gphys, guest_level, guest_entry);
            if (shadow_entry & 2) == 0 && (guest_entry & 2) != 0 {
                panic!("Shadow EPT: Writing to VMM memory.");
            }
        }
    } else {
        if (guest_entry & 0x7) == 0 {
            // Nothing mapped and nothing cached; a clean fault for L1.
            return false;
        }
        // A write-only entry is an EPT misconfiguration. On a processor
        // that can rewrite the exit reason, surface it as one directly.
        if (guest_entry & 0x3) == 2 && pcpu.vmcs_writable_readonly {
            vmcs::vmwrite(ro::EXIT_REASON, u64::from(EXIT_REASON_EPT_MISCONFIG));
            return false;
        }
        let _ = sept.shadow_write(platform, amask, gphys, guest_level, guest_entry);
    }

    // A pool wipe inside the shadow tree invalidates mappings the
    // hardware may have cached under the shadow EPTP.
    if sept.take_flush_pending() && pcpu.ept_vpid.invept && pcpu.ept_vpid.invept_all_contexts {
        vmcs::invept(vmcs::InveptType::AllContexts, 0);
    }

    if (qualification & QUAL_EPT_NMI_UNBLOCKING_DUE_TO_IRET) != 0 {
        let interruptibility = vmcs::vmread(guest::INTERRUPTIBILITY_STATE);
        vmcs::vmwrite(
            guest::INTERRUPTIBILITY_STATE,
            interruptibility | bits::INTERRUPTIBILITY_NMI_BLOCKING,
        );
    }
    true
}

/// Services an L2 fault while L1 runs without EPT: the fault belongs to
/// L0's concealed EPT and must never surface to L1 as a VM exit.
fn handle_ept_host(vcpu: &mut VCpu, platform: &mut dyn Platform) -> bool {
    let exit_reason = vmcs::vmread(ro::EXIT_REASON);
    if (exit_reason & EXIT_REASON_VMENTRY_FAILURE_FLAG) != 0 {
        return false;
    }
    match (exit_reason & EXIT_REASON_BASIC_MASK) as u16 {
        EXIT_REASON_EPT_MISCONFIG => {
            panic!("Unexpected EPT misconfig during nested virtualization");
        }
        EXIT_REASON_EPT_VIOLATION => {}
        _ => return false,
    }
    let qualification = vmcs::vmread(ro::EXIT_QUALIFICATION);
    let gphys = vmcs::vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
    if (qualification & QUAL_EPT_NMI_UNBLOCKING_DUE_TO_IRET) != 0 {
        let interruptibility = vmcs::vmread(guest::INTERRUPTIBILITY_STATE);
        vmcs::vmwrite(
            guest::INTERRUPTIBILITY_STATE,
            interruptibility | bits::INTERRUPTIBILITY_NMI_BLOCKING,
        );
    }
    paging::npf(vcpu, platform, (qualification & QUAL_EPT_WRITE) != 0, gphys);
    true
}

/// Re-injects an event whose delivery was interrupted by the absorbed
/// EPT violation. L1 is not told; it may miss the event if it inspects
/// its VMCS at exactly the wrong moment.
fn handle_ept_violation_event_delivery() {
    const INTR_ERR_VALID: u64 = 1 << 11;

    let vectoring = IntrInfo(vmcs::vmread(ro::IDT_VECTORING_INFO));
    // The valid bit of the entry field is always cleared on VM exit; if
    // the vectoring field is not valid either, nothing was in flight.
    if !vectoring.valid() {
        return;
    }
    vmcs::vmwrite(control::VMENTRY_INTERRUPTION_INFO_FIELD, vectoring.0);
    if (vectoring.0 & INTR_ERR_VALID) != 0 {
        vmcs::vmwrite(
            control::VMENTRY_EXCEPTION_ERR_CODE,
            vmcs::vmread(ro::IDT_VECTORING_ERR_CODE),
        );
    }
    vmcs::vmwrite(
        control::VMENTRY_INSTRUCTION_LEN,
        vmcs::vmread(ro::VMEXIT_INSTRUCTION_LEN),
    );
    if vectoring.itype() == INTR_TYPE_NMI {
        let interruptibility = vmcs::vmread(guest::INTERRUPTIBILITY_STATE);
        vmcs::vmwrite(
            guest::INTERRUPTIBILITY_STATE,
            interruptibility & !bits::INTERRUPTIBILITY_NMI_BLOCKING,
        );
    }
}

/// Remaps an external-interrupt vector the processor acknowledged on the
/// L2 exit. When the interruption-information field cannot be rewritten,
/// the value is latched for the guest's next VMREAD of it.
fn handle_acked_exint_pass(pcpu: &PCpu, platform: &mut dyn Platform, shadow: &mut ShadowVt) {
    let exit_reason = vmcs::vmread(ro::EXIT_REASON);
    if (exit_reason & EXIT_REASON_BASIC_MASK) as u16 != EXIT_REASON_EXTERNAL_INTERRUPT {
        return;
    }
    if (exit_reason & EXIT_REASON_VMENTRY_FAILURE_FLAG) != 0 {
        return;
    }
    let mut info = IntrInfo(vmcs::vmread(ro::VMEXIT_INTERRUPTION_INFO));
    if !info.valid() || info.itype() != INTR_TYPE_EXTERNAL {
        return;
    }
    let vector = info.vector() as u8;
    match platform.exint_pass_intr_call(vector) {
        Some(new_vector) if new_vector == vector => return,
        Some(new_vector) => info.set_vector(u64::from(new_vector)),
        // Consumed by the host. Marking the information invalid is the
        // best that can be done; the guest may be confused.
        None => info.set_valid(false),
    }
    if pcpu.vmcs_writable_readonly {
        vmcs::vmwrite(ro::VMEXIT_INTERRUPTION_INFO, info.0);
    } else {
        // The interrupt is already acknowledged, so the guest is expected
        // to read the field soon; keep the value until the next
        // vmptrld/vmclear/vmlaunch/vmresume.
        shadow.set_exint_hack(info.0);
    }
}

fn read_guest_efer(vcpu: &VCpu) -> u64 {
    if vcpu.save_load_efer_enable {
        vmcs::vmread(guest::IA32_EFER_FULL)
    } else {
        rdmsr(x86::msr::IA32_EFER)
    }
}

fn write_guest_efer(vcpu: &mut VCpu, efer: u64) {
    if vcpu.save_load_efer_enable {
        vmcs::vmwrite(guest::IA32_EFER_FULL, efer);
    }
    let entry_ctl = vmcs::vmread(control::VMENTRY_CONTROLS);
    let lma = (efer & EFER_LMA) != 0;
    vmcs::vmwrite(
        control::VMENTRY_CONTROLS,
        if lma {
            entry_ctl | bits::ENTRY_IA32E_MODE_GUEST
        } else {
            entry_ctl & !bits::ENTRY_IA32E_MODE_GUEST
        },
    );
    vcpu.vr.lma = lma;
}

const ACCESS_RIGHTS_S: u64 = 1 << 4;
const ACCESS_RIGHTS_P: u64 = 1 << 7;
const ACCESS_RIGHTS_L: u64 = 1 << 13;
const ACCESS_RIGHTS_D_B: u64 = 1 << 14;
const ACCESS_RIGHTS_G: u64 = 1 << 15;
const ACCESS_RIGHTS_UNUSABLE: u64 = 1 << 16;
const SEGDESC_TYPE_RDWR_DATA_A: u64 = 0x3;
const SEGDESC_TYPE_EXECREAD_CODE_A: u64 = 0xB;
const SEGDESC_TYPE_32BIT_TSS_BUSY: u64 = 0xB;

fn code_acr(to_64bit_mode: bool) -> u64 {
    let l_or_db = if to_64bit_mode {
        ACCESS_RIGHTS_L
    } else {
        ACCESS_RIGHTS_D_B
    };
    SEGDESC_TYPE_EXECREAD_CODE_A | ACCESS_RIGHTS_S | ACCESS_RIGHTS_P | l_or_db | ACCESS_RIGHTS_G
}

fn data_acr(sel: u64) -> u64 {
    if sel == 0 {
        return ACCESS_RIGHTS_UNUSABLE;
    }
    SEGDESC_TYPE_RDWR_DATA_A | ACCESS_RIGHTS_S | ACCESS_RIGHTS_P | ACCESS_RIGHTS_D_B
        | ACCESS_RIGHTS_G
}

/// Switches back to the L0 VMCS and loads L1's host state into the guest
/// state, making the guest hypervisor observe a VM exit of its own.
///
/// See: 28.5 LOADING HOST STATE
fn switch_vmcs_and_load_l1_host_state(
    vcpu: &mut VCpu,
    platform: &mut dyn Platform,
    orig_vmcs_phys: u64,
    efer_l2: u64,
    exit_ctl: u64,
    hs: &VmcsHostStates,
) {
    const CR0_PE: u64 = 1 << 0;
    const CR0_MP: u64 = 1 << 1;
    const CR0_EM: u64 = 1 << 2;
    const CR0_TS: u64 = 1 << 3;
    const CR0_ET: u64 = 1 << 4;
    const CR0_NE: u64 = 1 << 5;
    const CR0_WP: u64 = 1 << 16;
    const CR0_AM: u64 = 1 << 18;
    const CR0_NW: u64 = 1 << 29;
    const CR0_CD: u64 = 1 << 30;
    const CR0_PG: u64 = 1 << 31;
    const CR0_NOT_RESERVED: u64 = CR0_PE
        | CR0_MP
        | CR0_EM
        | CR0_TS
        | CR0_ET
        | CR0_NE
        | CR0_WP
        | CR0_AM
        | CR0_NW
        | CR0_CD
        | CR0_PG;
    const CR4_VMXE: u64 = 1 << 13;
    const CR4_PAE: u64 = 1 << 5;
    const CR4_PCIDE: u64 = 1 << 17;

    let exec_ctl2 = vmcs::vmread(control::SECONDARY_PROCBASED_EXEC_CONTROLS);

    let _ = vmcs::vmptrld_at(orig_vmcs_phys);

    let mut guest_efer = efer_l2;
    let mut cr0_mask = CR0_ET | CR0_CD | CR0_NW | CR0_NE | !CR0_NOT_RESERVED;
    if (exec_ctl2 & bits::PROC2_UNRESTRICTED_GUEST) == 0 {
        // A restricted L2 cannot have given up protection or paging.
        cr0_mask |= CR0_PE | CR0_PG;
    }
    let cr3_mask = !(platform.pte_addr_mask() | 0xFFF);
    let cr4_mask = CR4_VMXE;

    let ccr0 = vcpu.vr.cr0;
    let ccr3 = vcpu.vr.cr3;
    let ccr4 = vcpu.vr.cr4;
    let cr0 = (ccr0 & cr0_mask) | (hs.cr0 & !cr0_mask);
    let cr3 = (ccr3 & cr3_mask) | (hs.cr3 & !cr3_mask);
    let mut cr4 = (ccr4 & cr4_mask) | (hs.cr4 & !cr4_mask);

    let to_64bit_mode = (exit_ctl & bits::EXIT_HOST_ADDRESS_SPACE_SIZE) != 0;
    if to_64bit_mode {
        cr4 = hs.cr4 | CR4_PAE;
        guest_efer |= EFER_LMA | EFER_LME;
    } else {
        cr4 = hs.cr4 & !CR4_PCIDE;
        guest_efer &= !(EFER_LMA | EFER_LME);
    }

    if ccr0 != cr0 {
        vcpu.vr.cr0 = cr0;
        vcpu.vr.pg = (cr0 & CR0_PG) != 0;
        vcpu.vr.pe = (cr0 & CR0_PE) != 0;
        vmcs::vmwrite(guest::CR0, paging::apply_fixed_cr0(vcpu, cr0));
        vmcs::vmwrite(control::CR0_READ_SHADOW, cr0);
    }
    if ccr4 != cr4 {
        vcpu.vr.cr4 = cr4;
        vmcs::vmwrite(guest::CR4, paging::apply_fixed_cr4(vcpu, cr4));
        vmcs::vmwrite(control::CR4_READ_SHADOW, cr4);
    }
    vmcs::vmwrite(guest::DR7, 0x400u64);
    vmcs::vmwrite(guest::IA32_DEBUGCTL_FULL, 0u64);
    vmcs::vmwrite(guest::IA32_SYSENTER_CS, hs.ia32_sysenter_cs);
    vmcs::vmwrite(guest::IA32_SYSENTER_ESP, hs.ia32_sysenter_esp);
    vmcs::vmwrite(guest::IA32_SYSENTER_EIP, hs.ia32_sysenter_eip);
    if (exit_ctl & bits::EXIT_LOAD_PERF_GLOBAL_CTRL) != 0 {
        vmcs::vmwrite(guest::IA32_PERF_GLOBAL_CTRL_FULL, hs.ia32_perf_global_ctrl);
    }
    if (exit_ctl & bits::EXIT_LOAD_PAT) != 0 {
        let current_pat = vmcs::vmread(guest::IA32_PAT_FULL);
        if current_pat != hs.ia32_pat {
            let _ = paging::set_gpat(vcpu, platform, hs.ia32_pat);
        }
    }
    if read_guest_efer(vcpu) != guest_efer {
        write_guest_efer(vcpu, guest_efer);
    }

    // CR3 depends on CR0, CR4 and EFER, so it is loaded after them. An
    // unchanged CR3 is skipped to keep VPID-tagged translations alive.
    if ccr3 != cr3 {
        vcpu.vr.cr3 = cr3;
        vmcs::vmwrite(guest::CR3, cr3);
        paging::updatecr3(vcpu, platform);
    }

    // Selectors.
    vmcs::vmwrite(guest::ES_SELECTOR, hs.es_sel);
    vmcs::vmwrite(guest::CS_SELECTOR, hs.cs_sel);
    vmcs::vmwrite(guest::SS_SELECTOR, hs.ss_sel);
    vmcs::vmwrite(guest::DS_SELECTOR, hs.ds_sel);
    vmcs::vmwrite(guest::FS_SELECTOR, hs.fs_sel);
    vmcs::vmwrite(guest::GS_SELECTOR, hs.gs_sel);
    vmcs::vmwrite(guest::TR_SELECTOR, hs.tr_sel);

    // Base addresses.
    vmcs::vmwrite(guest::ES_BASE, 0u64);
    vmcs::vmwrite(guest::CS_BASE, 0u64);
    vmcs::vmwrite(guest::SS_BASE, 0u64);
    vmcs::vmwrite(guest::DS_BASE, 0u64);
    vmcs::vmwrite(guest::FS_BASE, hs.fs_base);
    vmcs::vmwrite(guest::GS_BASE, hs.gs_base);
    vmcs::vmwrite(guest::TR_BASE, hs.tr_base);

    // Segment limits.
    vmcs::vmwrite(guest::ES_LIMIT, 0xFFFF_FFFFu64);
    vmcs::vmwrite(guest::CS_LIMIT, 0xFFFF_FFFFu64);
    vmcs::vmwrite(guest::SS_LIMIT, 0xFFFF_FFFFu64);
    vmcs::vmwrite(guest::DS_LIMIT, 0xFFFF_FFFFu64);
    vmcs::vmwrite(guest::FS_LIMIT, 0xFFFF_FFFFu64);
    vmcs::vmwrite(guest::GS_LIMIT, 0xFFFF_FFFFu64);
    vmcs::vmwrite(guest::TR_LIMIT, 0x67u64);

    // Access rights.
    vmcs::vmwrite(guest::ES_ACCESS_RIGHTS, data_acr(hs.es_sel));
    vmcs::vmwrite(guest::CS_ACCESS_RIGHTS, code_acr(to_64bit_mode));
    vmcs::vmwrite(guest::SS_ACCESS_RIGHTS, data_acr(hs.ss_sel));
    vmcs::vmwrite(guest::DS_ACCESS_RIGHTS, data_acr(hs.ds_sel));
    vmcs::vmwrite(guest::FS_ACCESS_RIGHTS, data_acr(hs.fs_sel));
    vmcs::vmwrite(guest::GS_ACCESS_RIGHTS, data_acr(hs.gs_sel));
    vmcs::vmwrite(
        guest::TR_ACCESS_RIGHTS,
        SEGDESC_TYPE_32BIT_TSS_BUSY | ACCESS_RIGHTS_P,
    );

    // LDTR is unusable after a VM exit.
    vmcs::vmwrite(guest::LDTR_SELECTOR, 0u64);
    vmcs::vmwrite(guest::LDTR_ACCESS_RIGHTS, ACCESS_RIGHTS_UNUSABLE);

    // Descriptor tables.
    vmcs::vmwrite(guest::GDTR_BASE, hs.gdtr_base);
    vmcs::vmwrite(guest::GDTR_LIMIT, 0xFFFFu64);
    vmcs::vmwrite(guest::IDTR_BASE, hs.idtr_base);
    vmcs::vmwrite(guest::IDTR_LIMIT, 0xFFFFu64);

    vmcs::vmwrite(guest::RIP, hs.rip);
    vmcs::vmwrite(guest::RSP, hs.rsp);
    vmcs::vmwrite(guest::RFLAGS, 0x2u64);
}
