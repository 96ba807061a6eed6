//! The module containing the VM-exit dispatcher for the reasons this core
//! owns: EPT violations/misconfigurations and the VMX instruction set
//! executed by the guest. Everything else is returned to the embedder.
//!
//! See: Table C-1. Basic Exit Reasons

use crate::{
    config::{self, NestedVt},
    platform::Platform,
    vmx::{paging, shadow_vt, vcpu::VCpu, vmcs, PCpu},
};
use bitfield::bitfield;
use x86::vmx::vmcs::{guest, ro};

pub(crate) const EXIT_REASON_BASIC_MASK: u64 = 0xFFFF;
pub(crate) const EXIT_REASON_VMENTRY_FAILURE_FLAG: u64 = 1 << 31;

pub(crate) const EXIT_REASON_EXTERNAL_INTERRUPT: u16 = 1;
pub(crate) const EXIT_REASON_VMCLEAR: u16 = 19;
pub(crate) const EXIT_REASON_VMLAUNCH: u16 = 20;
pub(crate) const EXIT_REASON_VMPTRLD: u16 = 21;
pub(crate) const EXIT_REASON_VMPTRST: u16 = 22;
pub(crate) const EXIT_REASON_VMREAD: u16 = 23;
pub(crate) const EXIT_REASON_VMRESUME: u16 = 24;
pub(crate) const EXIT_REASON_VMWRITE: u16 = 25;
pub(crate) const EXIT_REASON_VMXOFF: u16 = 26;
pub(crate) const EXIT_REASON_VMXON: u16 = 27;
pub(crate) const EXIT_REASON_EPT_VIOLATION: u16 = 48;
pub(crate) const EXIT_REASON_EPT_MISCONFIG: u16 = 49;
pub(crate) const EXIT_REASON_INVEPT: u16 = 50;
pub(crate) const EXIT_REASON_INVVPID: u16 = 53;

// Exit qualification for EPT violations.
// See: Table 28-7. Exit Qualification for EPT Violations
pub(crate) const QUAL_EPT_WRITE: u64 = 1 << 1;
pub(crate) const QUAL_EPT_ENTRY_READ: u64 = 1 << 3;
pub(crate) const QUAL_EPT_ENTRY_WRITE: u64 = 1 << 4;
pub(crate) const QUAL_EPT_ENTRY_EXEC: u64 = 1 << 5;
pub(crate) const QUAL_EPT_NMI_UNBLOCKING_DUE_TO_IRET: u64 = 1 << 12;

bitfield! {
    /// VM-entry/VM-exit interruption information.
    ///
    /// See: Table 25-17. Format of the VM-Entry Interruption-Information
    /// Field
    #[derive(Clone, Copy)]
    pub struct IntrInfo(u64);
    impl Debug;
    pub vector, set_vector: 7, 0;
    pub itype, set_itype: 10, 8;
    pub err_valid, _: 11;
    pub valid, set_valid: 31;
}

pub(crate) const INTR_TYPE_EXTERNAL: u64 = 0;
pub(crate) const INTR_TYPE_NMI: u64 = 2;

/// The outcome of dispatching one VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// The core consumed the exit; resume the guest.
    Handled,
    /// The exit belongs to the embedder (I/O, CPUID, MSR, CR access,
    /// interrupts). The raw exit reason is included.
    Unhandled(u64),
}

/// Routes the current VM exit. Must run on the CPU that took the exit,
/// with the vCPU's own VMCS current.
pub fn handle_vmexit(vcpu: &mut VCpu, pcpu: &PCpu, platform: &mut dyn Platform) -> VmExit {
    let reason = vmcs::vmread(ro::EXIT_REASON);
    match (reason & EXIT_REASON_BASIC_MASK) as u16 {
        EXIT_REASON_EPT_VIOLATION => {
            handle_ept_violation(vcpu, platform);
            VmExit::Handled
        }
        EXIT_REASON_EPT_MISCONFIG => {
            panic!(
                "EPT misconfiguration at {:#x}",
                vmcs::vmread(ro::GUEST_PHYSICAL_ADDR_FULL)
            );
        }
        EXIT_REASON_VMXON => {
            if config::NESTED_VT == NestedVt::Off {
                vcpu.inject_ud();
            } else if vcpu.vmxon {
                shadow_vt::emulator::emul_vmxon_in_vmx_root(vcpu, platform);
            } else {
                shadow_vt::emulator::emul_vmxon(vcpu, pcpu, platform);
            }
            VmExit::Handled
        }
        vmx_instruction @ (EXIT_REASON_VMCLEAR
        | EXIT_REASON_VMLAUNCH
        | EXIT_REASON_VMPTRLD
        | EXIT_REASON_VMPTRST
        | EXIT_REASON_VMREAD
        | EXIT_REASON_VMRESUME
        | EXIT_REASON_VMWRITE
        | EXIT_REASON_VMXOFF
        | EXIT_REASON_INVEPT
        | EXIT_REASON_INVVPID) => {
            if !vcpu.vmxon {
                // VMX instructions outside VMX operation raise #UD.
                vcpu.inject_ud();
                return VmExit::Handled;
            }
            match vmx_instruction {
                EXIT_REASON_VMCLEAR => shadow_vt::emulator::emul_vmclear(vcpu, pcpu, platform),
                EXIT_REASON_VMLAUNCH => shadow_vt::run::run_l2vm(vcpu, pcpu, platform, false),
                EXIT_REASON_VMPTRLD => shadow_vt::emulator::emul_vmptrld(vcpu, pcpu, platform),
                EXIT_REASON_VMPTRST => shadow_vt::emulator::emul_vmptrst(vcpu, platform),
                EXIT_REASON_VMREAD => shadow_vt::emulator::emul_vmread(vcpu, platform),
                EXIT_REASON_VMRESUME => shadow_vt::run::run_l2vm(vcpu, pcpu, platform, true),
                EXIT_REASON_VMWRITE => shadow_vt::emulator::emul_vmwrite(vcpu, platform),
                EXIT_REASON_VMXOFF => shadow_vt::emulator::emul_vmxoff(vcpu, pcpu, platform),
                EXIT_REASON_INVEPT => shadow_vt::emulator::emul_invept(vcpu, platform),
                _ => shadow_vt::emulator::emul_invvpid(vcpu, platform),
            }
            VmExit::Handled
        }
        _ => VmExit::Unhandled(reason),
    }
}

/// Services an EPT violation on the vCPU's own EPT, propagating the
/// NMI-unblocking side effect of a faulted IRET first.
fn handle_ept_violation(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    let qualification = vmcs::vmread(ro::EXIT_QUALIFICATION);
    let gphys = vmcs::vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
    if (qualification & QUAL_EPT_NMI_UNBLOCKING_DUE_TO_IRET) != 0 {
        let interruptibility = vmcs::vmread(guest::INTERRUPTIBILITY_STATE);
        vmcs::vmwrite(
            guest::INTERRUPTIBILITY_STATE,
            interruptibility | vmcs::bits::INTERRUPTIBILITY_NMI_BLOCKING,
        );
    }
    paging::npf(vcpu, platform, (qualification & QUAL_EPT_WRITE) != 0, gphys);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intr_info_fields() {
        let mut info = IntrInfo(0);
        info.set_vector(0x2E);
        info.set_itype(INTR_TYPE_EXTERNAL);
        info.set_valid(true);
        assert_eq!(info.0, 0x8000_002E);
        assert!(!info.err_valid());
        let nmi = IntrInfo(0x8000_0202);
        assert_eq!(nmi.itype(), INTR_TYPE_NMI);
        assert_eq!(nmi.vector(), 2);
        assert!(nmi.valid());
    }
}
