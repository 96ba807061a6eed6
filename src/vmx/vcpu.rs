//! The module containing the per-vCPU state and the initial VMCS
//! construction.
//!
//! Every field of the VMCS is written before the first VMLAUNCH; nothing is
//! left to reset defaults. Host state is captured from the running
//! processor, and guest state starts as a copy of it; a real-mode bringup
//! overwrites the guest side later.

use crate::{
    vmx::{
        ept::Ept,
        shadow_vt::ShadowVt,
        vmcs::{self, bits, VmcsRegion},
        GuestRegisters, PCpu, VmxControl,
    },
    x86_instructions::{cr0, cr3, cr4, rdmsr, sgdt, sidt},
    Page,
};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;
use x86::{
    dtables::DescriptorTablePointer,
    segmentation::SegmentSelector,
    vmx::vmcs::{control, guest, host},
};

/// Pages shared by every vCPU of one VM: the I/O bitmaps and the MSR
/// bitmap, all-ones so that every port access and every RDMSR/WRMSR traps.
///
/// vCPU0 allocates them and publishes through `spin::Once`; the other
/// vCPUs busy-wait on the publication.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct VmShared {
    #[derivative(Debug = "ignore")]
    io_bitmap_a: Box<Page>,
    #[derivative(Debug = "ignore")]
    io_bitmap_b: Box<Page>,
    #[derivative(Debug = "ignore")]
    msr_bitmap: Box<Page>,
}

impl VmShared {
    fn new() -> Self {
        Self {
            io_bitmap_a: Box::new(Page::filled(0xFF)),
            io_bitmap_b: Box::new(Page::filled(0xFF)),
            msr_bitmap: Box::new(Page::filled(0xFF)),
        }
    }

    /// The I/O bitmap byte covering `port`, for selective passthrough by
    /// the embedder.
    pub fn io_bitmap_byte_mut(&mut self, port: u16) -> &mut u8 {
        let (page, bit) = if port < 0x8000 {
            (&mut self.io_bitmap_a, usize::from(port))
        } else {
            (&mut self.io_bitmap_b, usize::from(port) - 0x8000)
        };
        &mut page.as_bytes_mut()[bit / 8]
    }

    fn io_bitmap_a_phys(&self) -> u64 {
        core::ptr::from_ref(self.io_bitmap_a.as_ref()) as u64
    }

    fn io_bitmap_b_phys(&self) -> u64 {
        core::ptr::from_ref(self.io_bitmap_b.as_ref()) as u64
    }

    fn msr_bitmap_phys(&self) -> u64 {
        core::ptr::from_ref(self.msr_bitmap.as_ref()) as u64
    }
}

/// The cached view of guest registers the core consults between VM exits.
/// Updated by the embedder's CR/MSR handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestView {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// Guest CR0.PG as last written by the guest.
    pub pg: bool,
    /// Guest CR0.PE.
    pub pe: bool,
    /// Guest long mode is active (EFER.LMA).
    pub lma: bool,
}

/// Synthetic descriptor-table values used while emulating real mode.
#[derive(Debug, Clone, Copy)]
pub struct RealmodeState {
    pub idtr_base: u64,
    pub idtr_limit: u32,
    pub tr_base: u64,
    pub tr_limit: u32,
    pub tr_acr: u32,
}

impl Default for RealmodeState {
    fn default() -> Self {
        Self {
            idtr_base: 0,
            idtr_limit: 0x3FF,
            tr_base: 0,
            tr_limit: 0,
            tr_acr: 0x8B, // 32bit busy TSS
        }
    }
}

/// A virtual CPU: the VMCS it owns, its EPT, and the nested-VT state once
/// the guest has executed VMXON.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct VCpu {
    #[derivative(Debug = "ignore")]
    vmcs_region: Box<VmcsRegion>,
    #[derivative(Debug = "ignore")]
    saved_vmcs: Option<Box<VmcsRegion>>,
    #[derivative(Debug = "ignore")]
    shared: Arc<Once<VmShared>>,
    /// Guest general-purpose registers, saved/loaded around VM entries.
    pub regs: GuestRegisters,
    /// The active EPT, present when the processor supports it.
    pub(crate) ept: Option<Ept>,
    /// VPID of this vCPU; 0 means VPID is not used.
    pub vpid: u16,
    pub ept_available: bool,
    pub invept_available: bool,
    pub unrestricted_guest_available: bool,
    pub unrestricted_guest: bool,
    pub save_load_efer_enable: bool,
    pub cr3exit_controllable: bool,
    pub cr3exit_off: bool,
    /// The guest is in VMX operation (has executed VMXON).
    pub vmxon: bool,
    /// External interrupts are passed through to the guest.
    pub exint_pass: bool,
    /// An external interrupt is pending injection.
    pub exint_pending: bool,
    /// Shadow paging handles guest #PF in the current paging arrangement.
    pub(crate) handle_pagefault: bool,
    pub(crate) shadow_vt: Option<Box<ShadowVt>>,
    /// Cached guest register view.
    pub vr: GuestView,
    /// CR3 chosen by the shadow-paging MMU.
    pub(crate) spt_cr3: u64,
    pub realmode: RealmodeState,
    /// Whether the VMCS is in the launched state (VMRESUME vs VMLAUNCH).
    pub(crate) launched: bool,
    nmi_received: AtomicBool,
}

impl VCpu {
    /// Creates the vCPU and attaches the VM-wide shared bitmap pages.
    ///
    /// `vcpu0` must be true for exactly one vCPU of the VM; that call
    /// allocates and publishes the bitmaps, and the others spin until the
    /// publication is observed.
    #[must_use]
    pub fn new(pcpu: &PCpu, shared: Arc<Once<VmShared>>, vcpu0: bool) -> Self {
        if vcpu0 {
            let _ = shared.call_once(VmShared::new);
        } else {
            let _ = shared.wait();
        }
        Self {
            vmcs_region: Box::new(VmcsRegion::new(pcpu.vmcs_revision)),
            saved_vmcs: None,
            shared,
            regs: GuestRegisters::default(),
            ept: None,
            vpid: 0,
            ept_available: false,
            invept_available: false,
            unrestricted_guest_available: false,
            unrestricted_guest: false,
            save_load_efer_enable: false,
            cr3exit_controllable: pcpu.cr3exit_controllable,
            cr3exit_off: false,
            vmxon: false,
            exint_pass: true,
            exint_pending: false,
            handle_pagefault: false,
            shadow_vt: None,
            vr: GuestView::default(),
            spt_cr3: 0,
            realmode: RealmodeState::default(),
            launched: false,
            nmi_received: AtomicBool::new(false),
        }
    }

    /// Enters the guest and returns on the next VM exit. The first entry
    /// launches; later ones resume.
    ///
    /// # Panics
    ///
    /// Panics when the VM entry itself fails; a failed entry into the
    /// guest this core itself configured is a hypervisor bug.
    pub fn run(&mut self) {
        use x86::vmx::vmcs::ro;

        // Safety: the vCPU's VMCS is current and fully initialized.
        let result = unsafe { crate::vmx::run_vm(&mut self.regs, u64::from(self.launched)) };
        match result {
            0 => self.launched = true,
            -1 => panic!(
                "VMfailValid with {}",
                vmcs::vmread(ro::VM_INSTRUCTION_ERROR)
            ),
            _ => panic!("VMfailInvalid"),
        }
    }

    /// Builds the initial VMCS: negotiates every control against the
    /// capability MSRs, wires the shared bitmaps, and copies the current
    /// processor state into both the host-state and guest-state areas.
    pub fn vmcs_init(&mut self, pcpu: &PCpu) {
        vmcs::vmclear(&mut self.vmcs_region);
        vmcs::vmptrld(&mut self.vmcs_region);

        // Negotiate the primary processor-based controls first; whether
        // secondary controls exist decides everything EPT/VPID below.
        let procbased = crate::vmx::adjust_vmx_control(
            VmxControl::ProcessorBased,
            bits::PROC_INVLPG_EXITING
                | bits::PROC_UNCONDITIONAL_IO_EXITING
                | bits::PROC_USE_TSC_OFFSETTING
                | bits::PROC_USE_IO_BITMAPS
                | bits::PROC_USE_MSR_BITMAPS
                | bits::PROC_CR3_LOAD_EXITING
                | bits::PROC_CR3_STORE_EXITING
                | bits::PROC_ACTIVATE_SECONDARY_CONTROLS,
        );
        let secondary_available = (procbased & bits::PROC_ACTIVATE_SECONDARY_CONTROLS) != 0;

        let mut procbased2 = 0;
        if secondary_available {
            let procbased2_allowed1 = rdmsr(x86::msr::IA32_VMX_PROCBASED_CTLS2) >> 32;
            let exit_allowed1 = rdmsr(x86::msr::IA32_VMX_EXIT_CTLS) >> 32;
            let entry_allowed1 = rdmsr(x86::msr::IA32_VMX_ENTRY_CTLS) >> 32;

            if (procbased2_allowed1 & bits::PROC2_ENABLE_VPID) != 0
                && pcpu.ept_vpid.invvpid
                && pcpu.ept_vpid.invvpid_single_context
            {
                // A single VPID per vCPU; the nested engine claims 0x10
                // and up for shadow contexts.
                self.vpid = 1;
                procbased2 |= bits::PROC2_ENABLE_VPID;
            }
            if (procbased2_allowed1 & bits::PROC2_ENABLE_EPT) != 0
                && pcpu.ept_vpid.pagewalk_length_4
                && pcpu.ept_vpid.ept_structure_wb
                && (exit_allowed1 & bits::EXIT_SAVE_PAT) != 0
                && (exit_allowed1 & bits::EXIT_LOAD_PAT) != 0
                && (entry_allowed1 & bits::ENTRY_LOAD_PAT) != 0
            {
                self.ept_available = true;
                self.invept_available =
                    pcpu.ept_vpid.invept && pcpu.ept_vpid.invept_all_contexts;
            }
            if (procbased2_allowed1 & bits::PROC2_UNRESTRICTED_GUEST) != 0 {
                self.unrestricted_guest_available = true;
            }
            if (procbased2_allowed1 & bits::PROC2_ENABLE_RDTSCP) != 0 {
                procbased2 |= bits::PROC2_ENABLE_RDTSCP;
            }
            if (procbased2_allowed1 & bits::PROC2_ENABLE_XSAVES) != 0 {
                procbased2 |= bits::PROC2_ENABLE_XSAVES;
            }
        }

        let mut exitctl_extra = bits::EXIT_HOST_ADDRESS_SPACE_SIZE;
        let mut entryctl_extra = 0;
        {
            let exit_allowed1 = rdmsr(x86::msr::IA32_VMX_EXIT_CTLS) >> 32;
            let entry_allowed1 = rdmsr(x86::msr::IA32_VMX_ENTRY_CTLS) >> 32;
            if (exit_allowed1 & bits::EXIT_SAVE_EFER) != 0
                && (exit_allowed1 & bits::EXIT_LOAD_EFER) != 0
                && (entry_allowed1 & bits::ENTRY_LOAD_EFER) != 0
            {
                self.save_load_efer_enable = true;
                exitctl_extra |= bits::EXIT_SAVE_EFER | bits::EXIT_LOAD_EFER;
                entryctl_extra |= bits::ENTRY_LOAD_EFER;
            }
        }

        let state = capture_current_state();
        let shared = self.shared.get().unwrap();
        let sysenter_cs = rdmsr(x86::msr::IA32_SYSENTER_CS);
        let sysenter_esp = rdmsr(x86::msr::IA32_SYSENTER_ESP);
        let sysenter_eip = rdmsr(x86::msr::IA32_SYSENTER_EIP);

        // 16-Bit Control Field
        if self.vpid != 0 {
            vmcs::vmwrite(control::VPID, self.vpid);
        }
        // 16-Bit Guest-State Fields
        vmcs::vmwrite(guest::ES_SELECTOR, state.es.sel);
        vmcs::vmwrite(guest::CS_SELECTOR, state.cs.sel);
        vmcs::vmwrite(guest::SS_SELECTOR, state.ss.sel);
        vmcs::vmwrite(guest::DS_SELECTOR, state.ds.sel);
        vmcs::vmwrite(guest::FS_SELECTOR, state.fs.sel);
        vmcs::vmwrite(guest::GS_SELECTOR, state.gs.sel);
        vmcs::vmwrite(guest::LDTR_SELECTOR, state.ldtr.sel);
        vmcs::vmwrite(guest::TR_SELECTOR, state.tr.sel);
        // 16-Bit Host-State Fields
        vmcs::vmwrite(host::ES_SELECTOR, state.es.sel);
        vmcs::vmwrite(host::CS_SELECTOR, state.cs.sel);
        vmcs::vmwrite(host::SS_SELECTOR, state.ss.sel);
        vmcs::vmwrite(host::DS_SELECTOR, state.ds.sel);
        vmcs::vmwrite(host::FS_SELECTOR, state.fs.sel);
        vmcs::vmwrite(host::GS_SELECTOR, state.gs.sel);
        vmcs::vmwrite(host::TR_SELECTOR, state.tr.sel);
        // 64-Bit Control Fields
        vmcs::vmwrite(control::IO_BITMAP_A_ADDR_FULL, shared.io_bitmap_a_phys());
        vmcs::vmwrite(control::IO_BITMAP_B_ADDR_FULL, shared.io_bitmap_b_phys());
        vmcs::vmwrite(control::MSR_BITMAPS_ADDR_FULL, shared.msr_bitmap_phys());
        vmcs::vmwrite(control::VMEXIT_MSR_STORE_ADDR_FULL, 0u64);
        vmcs::vmwrite(control::VMEXIT_MSR_LOAD_ADDR_FULL, 0u64);
        vmcs::vmwrite(control::VMENTRY_MSR_LOAD_ADDR_FULL, 0u64);
        vmcs::vmwrite(control::EXECUTIVE_VMCS_PTR_FULL, 0u64);
        vmcs::vmwrite(control::TSC_OFFSET_FULL, 0u64);
        // 64-Bit Guest-State Fields
        vmcs::vmwrite(guest::LINK_PTR_FULL, vmcs::VMCS_POINTER_INVALID);
        vmcs::vmwrite(guest::IA32_DEBUGCTL_FULL, 0u64);
        if self.save_load_efer_enable {
            vmcs::vmwrite(guest::IA32_EFER_FULL, 0u64);
        }
        // 32-Bit Control Fields
        vmcs::vmwrite(
            control::PINBASED_EXEC_CONTROLS,
            crate::vmx::adjust_vmx_control(
                VmxControl::PinBased,
                bits::PIN_NMI_EXITING | bits::PIN_VIRTUAL_NMIS,
            ),
        );
        vmcs::vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, procbased);
        vmcs::vmwrite(control::EXCEPTION_BITMAP, 0xFFFF_FFFFu64);
        vmcs::vmwrite(control::PAGE_FAULT_ERR_CODE_MASK, 0u64);
        vmcs::vmwrite(control::PAGE_FAULT_ERR_CODE_MATCH, 0u64);
        vmcs::vmwrite(control::CR3_TARGET_COUNT, 0u64);
        vmcs::vmwrite(
            control::VMEXIT_CONTROLS,
            crate::vmx::adjust_vmx_control(VmxControl::VmExit, exitctl_extra),
        );
        vmcs::vmwrite(control::VMEXIT_MSR_STORE_COUNT, 0u64);
        vmcs::vmwrite(control::VMEXIT_MSR_LOAD_COUNT, 0u64);
        vmcs::vmwrite(
            control::VMENTRY_CONTROLS,
            crate::vmx::adjust_vmx_control(VmxControl::VmEntry, entryctl_extra),
        );
        vmcs::vmwrite(control::VMENTRY_MSR_LOAD_COUNT, 0u64);
        vmcs::vmwrite(control::VMENTRY_INTERRUPTION_INFO_FIELD, 0u64);
        vmcs::vmwrite(control::VMENTRY_EXCEPTION_ERR_CODE, 0u64);
        vmcs::vmwrite(control::VMENTRY_INSTRUCTION_LEN, 0u64);
        vmcs::vmwrite(control::TPR_THRESHOLD, 0u64);
        if secondary_available {
            vmcs::vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, procbased2);
        }
        // 32-Bit Guest-State Fields
        vmcs::vmwrite(guest::ES_LIMIT, state.es.limit);
        vmcs::vmwrite(guest::CS_LIMIT, state.cs.limit);
        vmcs::vmwrite(guest::SS_LIMIT, state.ss.limit);
        vmcs::vmwrite(guest::DS_LIMIT, state.ds.limit);
        vmcs::vmwrite(guest::FS_LIMIT, state.fs.limit);
        vmcs::vmwrite(guest::GS_LIMIT, state.gs.limit);
        vmcs::vmwrite(guest::LDTR_LIMIT, state.ldtr.limit);
        vmcs::vmwrite(guest::TR_LIMIT, state.tr.limit);
        vmcs::vmwrite(guest::GDTR_LIMIT, u64::from(state.gdtr_limit));
        vmcs::vmwrite(guest::IDTR_LIMIT, u64::from(state.idtr_limit));
        vmcs::vmwrite(guest::ES_ACCESS_RIGHTS, state.es.acr);
        vmcs::vmwrite(guest::CS_ACCESS_RIGHTS, state.cs.acr);
        vmcs::vmwrite(guest::SS_ACCESS_RIGHTS, state.ss.acr);
        vmcs::vmwrite(guest::DS_ACCESS_RIGHTS, state.ds.acr);
        vmcs::vmwrite(guest::FS_ACCESS_RIGHTS, state.fs.acr);
        vmcs::vmwrite(guest::GS_ACCESS_RIGHTS, state.gs.acr);
        vmcs::vmwrite(guest::LDTR_ACCESS_RIGHTS, state.ldtr.acr);
        vmcs::vmwrite(guest::TR_ACCESS_RIGHTS, state.tr.acr);
        vmcs::vmwrite(guest::INTERRUPTIBILITY_STATE, 0u64);
        vmcs::vmwrite(guest::ACTIVITY_STATE, 0u64);
        vmcs::vmwrite(guest::IA32_SYSENTER_CS, sysenter_cs);
        // 32-Bit Host-State Field
        vmcs::vmwrite(host::IA32_SYSENTER_CS, sysenter_cs);
        // Natural-Width Control Fields
        vmcs::vmwrite(control::CR0_GUEST_HOST_MASK, CR0_GUEST_HOST_MASK);
        vmcs::vmwrite(control::CR4_GUEST_HOST_MASK, CR4_GUEST_HOST_MASK);
        vmcs::vmwrite(control::CR0_READ_SHADOW, state.cr0);
        vmcs::vmwrite(control::CR4_READ_SHADOW, state.cr4);
        vmcs::vmwrite(control::CR3_TARGET_VALUE0, 0u64);
        vmcs::vmwrite(control::CR3_TARGET_VALUE1, 0u64);
        vmcs::vmwrite(control::CR3_TARGET_VALUE2, 0u64);
        vmcs::vmwrite(control::CR3_TARGET_VALUE3, 0u64);
        // Natural-Width Guest-State Fields
        vmcs::vmwrite(guest::CR0, state.cr0);
        vmcs::vmwrite(guest::CR3, state.cr3);
        vmcs::vmwrite(guest::CR4, state.cr4);
        vmcs::vmwrite(guest::ES_BASE, state.es.base);
        vmcs::vmwrite(guest::CS_BASE, state.cs.base);
        vmcs::vmwrite(guest::SS_BASE, state.ss.base);
        vmcs::vmwrite(guest::DS_BASE, state.ds.base);
        vmcs::vmwrite(guest::FS_BASE, state.fs.base);
        vmcs::vmwrite(guest::GS_BASE, state.gs.base);
        vmcs::vmwrite(guest::LDTR_BASE, state.ldtr.base);
        vmcs::vmwrite(guest::TR_BASE, state.tr.base);
        vmcs::vmwrite(guest::GDTR_BASE, state.gdtr_base);
        vmcs::vmwrite(guest::IDTR_BASE, state.idtr_base);
        vmcs::vmwrite(guest::DR7, state.dr7);
        vmcs::vmwrite(guest::RSP, 0xDEAD_BEEFu64);
        vmcs::vmwrite(guest::RIP, 0xDEAD_BEEFu64);
        vmcs::vmwrite(guest::RFLAGS, state.rflags);
        vmcs::vmwrite(guest::PENDING_DBG_EXCEPTIONS, 0u64);
        vmcs::vmwrite(guest::IA32_SYSENTER_ESP, sysenter_esp);
        vmcs::vmwrite(guest::IA32_SYSENTER_EIP, sysenter_eip);
        // Natural-Width Host-State Fields
        vmcs::vmwrite(host::CR0, state.cr0);
        vmcs::vmwrite(host::CR3, state.cr3);
        vmcs::vmwrite(host::CR4, state.cr4);
        vmcs::vmwrite(host::FS_BASE, state.fs.base);
        vmcs::vmwrite(host::GS_BASE, state.gs.base);
        vmcs::vmwrite(host::TR_BASE, state.tr.base);
        vmcs::vmwrite(host::GDTR_BASE, state.gdtr_base);
        vmcs::vmwrite(host::IDTR_BASE, state.idtr_base);
        vmcs::vmwrite(host::IA32_SYSENTER_ESP, sysenter_esp);
        vmcs::vmwrite(host::IA32_SYSENTER_EIP, sysenter_eip);
        // Real values are written by run_vm.S on every entry.
        vmcs::vmwrite(host::RSP, 0xDEAD_BEEFu64);
        vmcs::vmwrite(host::RIP, 0xDEAD_BEEFu64);
        if self.save_load_efer_enable {
            vmcs::vmwrite(host::IA32_EFER_FULL, rdmsr(x86::msr::IA32_EFER));
        }

        self.vr.cr0 = state.cr0;
        self.vr.cr3 = state.cr3;
        self.vr.cr4 = state.cr4;
        self.launched = false;
    }

    /// Refreshes the exception bitmap for the current paging arrangement.
    /// Shadow paging owns guest #PF; EPT does not intercept it.
    pub(crate) fn update_exception_bitmap(&self) {
        const PAGE_FAULT_FLAG: u64 = 1 << 14;

        let bitmap = if self.handle_pagefault {
            0xFFFF_FFFF
        } else {
            0xFFFF_FFFF & !PAGE_FAULT_FLAG
        };
        vmcs::vmwrite(control::EXCEPTION_BITMAP, bitmap);
    }

    /// Skips the instruction that caused the current VM exit and drops
    /// STI/MOV-SS interruptibility blocking, which cannot survive an
    /// emulated instruction.
    pub fn add_ip(&mut self) {
        use x86::vmx::vmcs::ro;

        let len = vmcs::vmread(ro::VMEXIT_INSTRUCTION_LEN);
        vmcs::vmwrite(guest::RIP, vmcs::vmread(guest::RIP).wrapping_add(len));
        let interruptibility = vmcs::vmread(guest::INTERRUPTIBILITY_STATE);
        vmcs::vmwrite(
            guest::INTERRUPTIBILITY_STATE,
            interruptibility
                & !(bits::INTERRUPTIBILITY_STI_BLOCKING | bits::INTERRUPTIBILITY_MOV_SS_BLOCKING),
        );
    }

    /// Queues a #UD for injection on the next VM entry.
    pub fn inject_ud(&mut self) {
        const INTR_INFO_VALID: u64 = 1 << 31;
        const INTR_TYPE_HW_EXCEPTION: u64 = 3 << 8;
        const UD_VECTOR: u64 = 6;

        vmcs::vmwrite(
            control::VMENTRY_INTERRUPTION_INFO_FIELD,
            INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | UD_VECTOR,
        );
        vmcs::vmwrite(control::VMENTRY_INSTRUCTION_LEN, 0u64);
    }

    /// Reads a guest GPR by its Intel register encoding. Index 4 (RSP)
    /// lives in the VMCS.
    pub(crate) fn read_general_reg(&self, index: u64) -> u64 {
        match index & 0xF {
            0 => self.regs.rax,
            1 => self.regs.rcx,
            2 => self.regs.rdx,
            3 => self.regs.rbx,
            4 => vmcs::vmread(guest::RSP),
            5 => self.regs.rbp,
            6 => self.regs.rsi,
            7 => self.regs.rdi,
            8 => self.regs.r8,
            9 => self.regs.r9,
            10 => self.regs.r10,
            11 => self.regs.r11,
            12 => self.regs.r12,
            13 => self.regs.r13,
            14 => self.regs.r14,
            _ => self.regs.r15,
        }
    }

    /// Writes a guest GPR by its Intel register encoding.
    pub(crate) fn write_general_reg(&mut self, index: u64, value: u64) {
        match index & 0xF {
            0 => self.regs.rax = value,
            1 => self.regs.rcx = value,
            2 => self.regs.rdx = value,
            3 => self.regs.rbx = value,
            4 => vmcs::vmwrite(guest::RSP, value),
            5 => self.regs.rbp = value,
            6 => self.regs.rsi = value,
            7 => self.regs.rdi = value,
            8 => self.regs.r8 = value,
            9 => self.regs.r9 = value,
            10 => self.regs.r10 = value,
            11 => self.regs.r11 = value,
            12 => self.regs.r12 = value,
            13 => self.regs.r13 = value,
            14 => self.regs.r14 = value,
            _ => self.regs.r15 = value,
        }
    }

    /// Detaches the VMCS from the processor ahead of a suspend: VMCLEAR,
    /// copy the page aside, and make it current again. The caller holds
    /// the per-CPU suspend lock.
    pub fn enable_resume(&mut self) {
        assert!(self.saved_vmcs.is_none());
        vmcs::vmclear(&mut self.vmcs_region);
        self.saved_vmcs = Some(Box::new(*self.vmcs_region));
        vmcs::vmptrld(&mut self.vmcs_region);
        self.launched = false;
    }

    /// Restores the VMCS saved by [`VCpu::enable_resume`] after VMX
    /// operation was re-entered (e.g. across an ACPI sleep).
    pub fn resume(&mut self, pcpu: &mut PCpu) {
        let saved = self.saved_vmcs.take().expect("resume without enable_resume");
        pcpu.vmxon();
        *self.vmcs_region = *saved;
        vmcs::vmclear(&mut self.vmcs_region);
        vmcs::vmptrld(&mut self.vmcs_region);
        self.launched = false;
    }

    /// Latches an NMI observed by the host. The L2 entry path converts the
    /// latch into a canceled entry that is retried once the NMI has been
    /// serviced.
    pub fn notify_nmi(&self) {
        self.nmi_received.store(true, Ordering::Release);
    }

    pub(crate) fn take_nmi(&self) -> bool {
        self.nmi_received.swap(false, Ordering::AcqRel)
    }
}

/// Bits of CR0 the hypervisor owns; guest writes to them exit.
const CR0_GUEST_HOST_MASK: u64 = (1 << 0) | (1 << 31); // PE | PG
/// Bits of CR4 the hypervisor owns.
const CR4_GUEST_HOST_MASK: u64 = (1 << 5) | (1 << 13); // PAE | VMXE

#[derive(Debug, Default, Clone, Copy)]
struct SegState {
    sel: u16,
    base: u64,
    limit: u32,
    acr: u32,
}

#[derive(Debug, Default)]
struct CpuState {
    es: SegState,
    cs: SegState,
    ss: SegState,
    ds: SegState,
    fs: SegState,
    gs: SegState,
    ldtr: SegState,
    tr: SegState,
    gdtr_base: u64,
    gdtr_limit: u16,
    idtr_base: u64,
    idtr_limit: u16,
    cr0: u64,
    cr3: u64,
    cr4: u64,
    dr7: u64,
    rflags: u64,
}

/// Captures the running processor's segmentation and control state, the
/// source for both the host-state area and the cold-boot guest state.
fn capture_current_state() -> CpuState {
    let mut gdtr = DescriptorTablePointer::<u64>::default();
    let mut idtr = DescriptorTablePointer::<u64>::default();
    sgdt(&mut gdtr);
    sidt(&mut idtr);
    let gdt_base = gdtr.base as u64;

    let selectors = read_segment_selectors();
    let seg = |sel: u16| SegState {
        sel,
        base: 0, // flat in long mode
        limit: get_segment_limit(gdt_base, sel),
        acr: get_segment_access_right(gdt_base, sel),
    };
    let mut fs = seg(selectors.fs);
    let mut gs = seg(selectors.gs);
    fs.base = rdmsr(x86::msr::IA32_FS_BASE);
    gs.base = rdmsr(x86::msr::IA32_GS_BASE);
    let tr = SegState {
        sel: selectors.tr,
        base: get_system_segment_base(gdt_base, selectors.tr),
        limit: get_segment_limit(gdt_base, selectors.tr),
        acr: get_segment_access_right(gdt_base, selectors.tr),
    };
    let ldtr = SegState {
        sel: selectors.ldtr,
        base: get_system_segment_base(gdt_base, selectors.ldtr),
        limit: get_segment_limit(gdt_base, selectors.ldtr),
        acr: get_segment_access_right(gdt_base, selectors.ldtr),
    };

    CpuState {
        es: seg(selectors.es),
        cs: seg(selectors.cs),
        ss: seg(selectors.ss),
        ds: seg(selectors.ds),
        fs,
        gs,
        ldtr,
        tr,
        gdtr_base: gdt_base,
        gdtr_limit: gdtr.limit,
        idtr_base: idtr.base as u64,
        idtr_limit: idtr.limit,
        cr0: cr0().bits() as u64,
        cr3: cr3(),
        cr4: cr4().bits() as u64,
        // Safety: this crate runs at CPL0.
        dr7: unsafe { x86::debugregs::dr7() }.0 as u64,
        rflags: x86::bits64::rflags::read().bits(),
    }
}

struct Selectors {
    es: u16,
    cs: u16,
    ss: u16,
    ds: u16,
    fs: u16,
    gs: u16,
    tr: u16,
    ldtr: u16,
}

fn read_segment_selectors() -> Selectors {
    let (es, ss, ds, fs, gs, tr, ldtr): (u16, u16, u16, u16, u16, u16, u16);
    // Safety: selector reads have no side effects at CPL0.
    unsafe {
        core::arch::asm!("mov {0:x}, es", out(reg) es, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov {0:x}, ss", out(reg) ss, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov {0:x}, ds", out(reg) ds, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov {0:x}, fs", out(reg) fs, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov {0:x}, gs", out(reg) gs, options(nomem, nostack, preserves_flags));
        core::arch::asm!("str {0:x}", out(reg) tr, options(nomem, nostack, preserves_flags));
        core::arch::asm!("sldt {0:x}", out(reg) ldtr, options(nomem, nostack, preserves_flags));
    }
    Selectors {
        es,
        cs: x86::segmentation::cs().bits(),
        ss,
        ds,
        fs,
        gs,
        tr,
        ldtr,
    }
}

/// Returns the segment descriptor casted as a 64bit integer for the given
/// selector.
fn get_segment_descriptor_value(table_base: u64, selector: u16) -> u64 {
    let sel = SegmentSelector::from_raw(selector);
    let descriptor_addr = table_base + u64::from(sel.index() * 8);
    let ptr = descriptor_addr as *const u64;
    unsafe { *ptr }
}

/// Returns the limit of the given segment.
fn get_segment_limit(table_base: u64, selector: u16) -> u32 {
    let sel = SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return 0; // unusable
    }
    let descriptor_value = get_segment_descriptor_value(table_base, selector);
    let limit_low = descriptor_value & 0xffff;
    let limit_high = (descriptor_value >> (32 + 16)) & 0xF;
    let mut limit = limit_low | (limit_high << 16);
    if ((descriptor_value >> (32 + 23)) & 0x01) != 0 {
        limit = ((limit + 1) << 12) - 1;
    }
    limit as u32
}

/// Returns the access rights of the given segment for VMX.
fn get_segment_access_right(table_base: u64, selector: u16) -> u32 {
    const VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE_FLAG: u32 = 1 << 16;

    let sel = SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE_FLAG;
    }
    let descriptor_value = get_segment_descriptor_value(table_base, selector);

    // Get the Type, S, DPL, P, AVL, L, D/B and G bits from the segment
    // descriptor.
    // See: Figure 3-8. Segment Descriptor
    let ar = (descriptor_value >> 40) as u32;
    ar & 0b1111_0000_1111_1111
}

/// Returns the base of a system segment (TSS or LDT), whose descriptor is
/// 16 bytes in long mode with base bits 63:32 in the second quadword.
///
/// See: Figure 8-4. Format of TSS and LDT Descriptors in 64-bit Mode
fn get_system_segment_base(table_base: u64, selector: u16) -> u64 {
    let sel = SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return 0;
    }
    let low = get_segment_descriptor_value(table_base, selector);
    let base_low = ((low >> 16) & 0xFF_FFFF) | (((low >> 56) & 0xFF) << 24);
    let high = get_segment_descriptor_value(table_base, selector + 8);
    ((high & 0xFFFF_FFFF) << 32) | base_low
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_limit_honors_granularity() {
        // A flat 4 GiB data descriptor: limit 0xFFFFF with G=1.
        let gdt: [u64; 2] = [0, 0x00CF_9300_0000_FFFF];
        let base = gdt.as_ptr() as u64;
        assert_eq!(get_segment_limit(base, 0x08), 0xFFFF_FFFF);
        // Selector 0 is unusable.
        assert_eq!(get_segment_limit(base, 0x00), 0);
    }

    #[test]
    fn access_rights_strip_limit_bits() {
        let gdt: [u64; 2] = [0, 0x00CF_9300_0000_FFFF];
        let base = gdt.as_ptr() as u64;
        // Type=3 (rw data, accessed), S=1, DPL=0, P=1, G and D/B set.
        assert_eq!(get_segment_access_right(base, 0x08), 0xC093);
        assert_eq!(get_segment_access_right(base, 0x00), 1 << 16);
    }

    #[test]
    fn system_segment_base_spans_two_entries() {
        // TSS descriptor with base 0x1234_5678_9ABC_DEF0: base[23:0] at
        // descriptor bits 16..39, base[31:24] at bits 56..63, base[63:32]
        // in the following quadword.
        let low = 0x67u64 | (0xBC_DEF0u64 << 16) | (0x8Bu64 << 40) | (0x9Au64 << 56);
        let high = 0x1234_5678u64;
        let gdt: [u64; 4] = [0, 0, low, high];
        let base = gdt.as_ptr() as u64;
        assert_eq!(get_system_segment_base(base, 0x10), 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn realmode_state_matches_bios_conventions() {
        let rm = RealmodeState::default();
        assert_eq!(rm.idtr_base, 0);
        assert_eq!(rm.idtr_limit, 0x3FF);
        assert_eq!(rm.tr_acr, 0x8B);
    }
}
