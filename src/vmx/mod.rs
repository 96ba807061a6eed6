//! The module containing VMX capability discovery and the per-physical-CPU
//! bootstrap into VMX root operation.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! at <https://www.intel.com/sdm/> unless otherwise stated.

pub mod ept;
pub mod exit;
pub mod paging;
pub mod shadow_vt;
pub mod vcpu;
pub mod vmcs;

use crate::x86_instructions::{cr0, cr0_write, cr4, cr4_write, rdmsr, wrmsr};
use alloc::boxed::Box;
use core::arch::global_asm;
use vmcs::VmxonRegion;
use x86::controlregs::{Cr0, Cr4};

/// Returns whether the current processor supports VMX operation.
///
/// If the `IA32_FEATURE_CONTROL` MSR is not yet locked, this locks it with
/// the VMXON-outside-SMX bit set and re-reads it, the way firmware that
/// leaves the MSR open expects.
///
/// See: 23.6 DISCOVERING SUPPORT FOR VMX
/// See: 23.7 ENABLING AND ENTERING VMX OPERATION
pub fn vt_available() -> bool {
    const CPUID_1_ECX_VMX_FLAG: u32 = 1 << 5;
    const IA32_FEATURE_CONTROL_LOCK_FLAG: u64 = 1 << 0;
    const IA32_FEATURE_CONTROL_ENABLE_VMX_OUTSIDE_SMX_FLAG: u64 = 1 << 2;

    if (x86::cpuid::cpuid!(0x1).ecx & CPUID_1_ECX_VMX_FLAG) == 0 {
        return false;
    }

    loop {
        let feature_control = rdmsr(x86::msr::IA32_FEATURE_CONTROL);
        if (feature_control & IA32_FEATURE_CONTROL_LOCK_FLAG) != 0 {
            // Locked. VMXON is usable only if firmware also left the
            // outside-SMX bit on.
            return (feature_control & IA32_FEATURE_CONTROL_ENABLE_VMX_OUTSIDE_SMX_FLAG) != 0;
        }
        log::info!("IA32_FEATURE_CONTROL unlocked; enabling VMXON");
        wrmsr(
            x86::msr::IA32_FEATURE_CONTROL,
            feature_control
                | IA32_FEATURE_CONTROL_ENABLE_VMX_OUTSIDE_SMX_FLAG
                | IA32_FEATURE_CONTROL_LOCK_FLAG,
        );
    }
}

/// The types of the VMX control field.
#[derive(Debug, Clone, Copy)]
pub(crate) enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Clamps `requested_value` into what the capability MSR for `control`
/// allows: bits the processor fixes to 1 are set, bits fixed to 0 are
/// cleared.
///
/// The VMX capability MSR is composed of two 32bit values; the lower
/// 32bits indicate bits allowed to be 0, and the higher 32bits bits
/// allowed to be 1.
///
/// See: A.3.1 Pin-Based VM-Execution Controls
pub(crate) fn adjust_vmx_control(control: VmxControl, requested_value: u64) -> u64 {
    const IA32_VMX_BASIC_TRUE_CONTROLS_FLAG: u64 = 1 << 55;

    // Consult the TRUE capability MSRs when the processor has them; they
    // relax default-to-1 bits that the legacy MSRs report as fixed.
    let vmx_basic = rdmsr(x86::msr::IA32_VMX_BASIC);
    let true_cap_msr_supported = (vmx_basic & IA32_VMX_BASIC_TRUE_CONTROLS_FLAG) != 0;

    let cap_msr = match (control, true_cap_msr_supported) {
        (VmxControl::PinBased, true) => x86::msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => x86::msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => x86::msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => x86::msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => x86::msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => x86::msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => x86::msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => x86::msr::IA32_VMX_ENTRY_CTLS,
        // There is no TRUE MSR for IA32_VMX_PROCBASED_CTLS2.
        (VmxControl::ProcessorBased2, _) => x86::msr::IA32_VMX_PROCBASED_CTLS2,
    };
    apply_allowed_settings(requested_value, rdmsr(cap_msr))
}

/// The arithmetic of control negotiation, separated from the MSR reads:
/// `capabilities` low half must-be-1 bits are ORed in, and bits absent
/// from the high half are masked out.
fn apply_allowed_settings(requested_value: u64, capabilities: u64) -> u64 {
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = requested_value as u32;
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

/// EPT and VPID capabilities relevant to this core, decoded from
/// `IA32_VMX_EPT_VPID_CAP`.
///
/// See: A.10 VPID AND EPT CAPABILITIES
#[derive(Debug, Clone, Copy, Default)]
pub struct EptVpidCap {
    /// 4-level page walks are supported (bit 6).
    pub pagewalk_length_4: bool,
    /// EPT paging structures may be write-back (bit 14).
    pub ept_structure_wb: bool,
    /// 2 MiB EPT pages are supported (bit 16).
    pub page_2m: bool,
    /// INVEPT is implemented (bit 20).
    pub invept: bool,
    /// Single-context INVEPT (bit 25).
    pub invept_single_context: bool,
    /// All-contexts INVEPT (bit 26).
    pub invept_all_contexts: bool,
    /// INVVPID is implemented (bit 32).
    pub invvpid: bool,
    /// Single-context INVVPID (bit 41).
    pub invvpid_single_context: bool,
}

impl EptVpidCap {
    fn decode(cap: u64) -> Self {
        Self {
            pagewalk_length_4: (cap & (1 << 6)) != 0,
            ept_structure_wb: (cap & (1 << 14)) != 0,
            page_2m: (cap & (1 << 16)) != 0,
            invept: (cap & (1 << 20)) != 0,
            invept_single_context: (cap & (1 << 25)) != 0,
            invept_all_contexts: (cap & (1 << 26)) != 0,
            invvpid: (cap & (1 << 32)) != 0,
            invvpid_single_context: (cap & (1 << 41)) != 0,
        }
    }
}

/// The per-physical-CPU VMX state: the VMXON region and a snapshot of the
/// capability MSRs. One instance exists per hardware thread for the
/// lifetime of the hypervisor.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct PCpu {
    #[derivative(Debug = "ignore")]
    vmxon_region: Box<VmxonRegion>,
    /// VMCS revision identifier from `IA32_VMX_BASIC`.
    pub vmcs_revision: u32,
    /// EPT/VPID feature bits.
    pub ept_vpid: EptVpidCap,
    /// The secondary control "VMCS shadowing" may be enabled.
    pub vmcs_shadowing_available: bool,
    /// VMWRITE may target read-only VMCS fields (`IA32_VMX_MISC` bit 29).
    pub vmcs_writable_readonly: bool,
    /// CR3-load/store exiting bits are allowed-0 in the TRUE procbased MSR.
    pub cr3exit_controllable: bool,
}

impl PCpu {
    /// Allocates the VMXON region and snapshots the capability MSRs.
    ///
    /// The caller must have verified [`vt_available`]; the capability MSRs
    /// fault on processors without VMX.
    #[must_use]
    pub fn new() -> Self {
        const IA32_VMX_MISC_VMWRITE_ALL_FLAG: u64 = 1 << 29;
        const PROC_ACTIVATE_SECONDARY_CONTROLS_FLAG: u64 = 1 << 31;
        const PROC2_ENABLE_EPT_FLAG: u64 = 1 << 1;
        const PROC2_ENABLE_VPID_FLAG: u64 = 1 << 5;
        const PROC2_VMCS_SHADOWING_FLAG: u64 = 1 << 14;

        let vmcs_revision = rdmsr(x86::msr::IA32_VMX_BASIC) as u32;
        // The secondary-control and EPT/VPID capability MSRs exist only
        // when the corresponding allowed-1 bits say so; reading them
        // blindly faults on older processors.
        let procbased_allowed1 = rdmsr(x86::msr::IA32_VMX_PROCBASED_CTLS) >> 32;
        let procbased_ctls2_allowed1 =
            if (procbased_allowed1 & PROC_ACTIVATE_SECONDARY_CONTROLS_FLAG) != 0 {
                rdmsr(x86::msr::IA32_VMX_PROCBASED_CTLS2) >> 32
            } else {
                0
            };
        let ept_vpid = if (procbased_ctls2_allowed1
            & (PROC2_ENABLE_EPT_FLAG | PROC2_ENABLE_VPID_FLAG))
            != 0
        {
            EptVpidCap::decode(rdmsr(x86::msr::IA32_VMX_EPT_VPID_CAP))
        } else {
            EptVpidCap::default()
        };
        Self {
            vmxon_region: Box::new(VmxonRegion::new(vmcs_revision)),
            vmcs_revision,
            ept_vpid,
            vmcs_shadowing_available: (procbased_ctls2_allowed1 & PROC2_VMCS_SHADOWING_FLAG) != 0,
            vmcs_writable_readonly: (rdmsr(x86::msr::IA32_VMX_MISC)
                & IA32_VMX_MISC_VMWRITE_ALL_FLAG)
                != 0,
            cr3exit_controllable: cr3exit_controllable(),
        }
    }

    /// Enters VMX root operation on the current processor.
    ///
    /// Clamps CR0/CR4 into the FIXED0/FIXED1 sets, sets CR4.VMXE and
    /// executes VMXON on this CPU's region.
    ///
    /// See: 23.8 RESTRICTIONS ON VMX OPERATION
    /// See: A.7 VMX-FIXED BITS IN CR0
    /// See: A.8 VMX-FIXED BITS IN CR4
    pub fn vmxon(&mut self) {
        let fixed0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0);
        let fixed1 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);
        let new_cr0 = (cr0().bits() as u64 & fixed1) | fixed0;
        cr0_write(Cr0::from_bits_truncate(new_cr0 as usize));

        let fixed0 = rdmsr(x86::msr::IA32_VMX_CR4_FIXED0);
        let fixed1 = rdmsr(x86::msr::IA32_VMX_CR4_FIXED1);
        let new_cr4 = (cr4().bits() as u64 & fixed1) | fixed0;
        cr4_write(Cr4::from_bits_truncate(new_cr4 as usize) | Cr4::CR4_ENABLE_VMX);

        vmcs::vmxon(&mut self.vmxon_region);
    }
}

impl Default for PCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns whether CR3-load/store exiting may be turned off.
///
/// The legacy procbased MSR reports both bits as fixed-1; only a processor
/// with TRUE control MSRs can run without CR3 exits.
fn cr3exit_controllable() -> bool {
    const IA32_VMX_BASIC_TRUE_CONTROLS_FLAG: u64 = 1 << 55;
    const CR3_LOAD_EXITING_FLAG: u64 = 1 << 15;
    const CR3_STORE_EXITING_FLAG: u64 = 1 << 16;

    if (rdmsr(x86::msr::IA32_VMX_BASIC) & IA32_VMX_BASIC_TRUE_CONTROLS_FLAG) == 0 {
        return false;
    }
    let allowed0 = rdmsr(x86::msr::IA32_VMX_TRUE_PROCBASED_CTLS) as u32 as u64;
    (allowed0 & (CR3_LOAD_EXITING_FLAG | CR3_STORE_EXITING_FLAG)) == 0
}

/// The collection of the guest general purpose register values.
///
/// RIP, RSP and RFLAGS live in the VMCS and are not part of this structure.
/// The layout is fixed; `run_vm.S` addresses the fields by offset.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

extern "C" {
    /// Swaps in the guest GPRs and executes VMLAUNCH (`resume` = 0) or
    /// VMRESUME (`resume` != 0). Returns 0 once a VM exit brings control
    /// back, -1 for VMfailValid and -2 for VMfailInvalid.
    pub(crate) fn run_vm(registers: &mut GuestRegisters, resume: u64) -> i64;
}
global_asm!(include_str!("run_vm.S"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_settings_fix_bits_both_ways() {
        // allowed0 = 0x16 (bits 1, 2, 4 must be 1),
        // allowed1 = 0xff1e (bit 0 must be 0).
        let capabilities = 0xff1e_0000_0016_u64;
        assert_eq!(apply_allowed_settings(0, capabilities), 0x16);
        assert_eq!(apply_allowed_settings(0x1, capabilities), 0x16);
        assert_eq!(apply_allowed_settings(0x100, capabilities), 0x116);
        // A requested bit outside allowed1 is dropped.
        assert_eq!(apply_allowed_settings(0x1_0000, capabilities), 0x16);
    }

    #[test]
    fn allowed_settings_flexible_bits_pass_through() {
        let capabilities = 0xffff_ffff_0000_0000_u64;
        assert_eq!(apply_allowed_settings(0xdead, capabilities), 0xdead);
        assert_eq!(apply_allowed_settings(0, capabilities), 0);
    }

    #[test]
    fn ept_vpid_capability_decoding() {
        let cap = (1u64 << 6) | (1 << 14) | (1 << 20) | (1 << 26) | (1 << 32) | (1 << 41);
        let decoded = EptVpidCap::decode(cap);
        assert!(decoded.pagewalk_length_4);
        assert!(decoded.ept_structure_wb);
        assert!(!decoded.page_2m);
        assert!(decoded.invept);
        assert!(!decoded.invept_single_context);
        assert!(decoded.invept_all_contexts);
        assert!(decoded.invvpid);
        assert!(decoded.invvpid_single_context);
    }

    #[test]
    fn guest_registers_layout_matches_run_vm() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(GuestRegisters, rax), 0x00);
        assert_eq!(offset_of!(GuestRegisters, rdi), 0x20);
        assert_eq!(offset_of!(GuestRegisters, rsi), 0x28);
        assert_eq!(offset_of!(GuestRegisters, rbp), 0x30);
        assert_eq!(offset_of!(GuestRegisters, r8), 0x38);
        assert_eq!(offset_of!(GuestRegisters, r15), 0x70);
    }
}
