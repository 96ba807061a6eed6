//! The module containing the emulation of the VMX instruction set for the
//! guest hypervisor.
//!
//! Every emulator follows the same flag discipline: the six arithmetic
//! flags are cleared, CF reports VMfailInvalid, ZF reports VMfailValid
//! (with the error number left in the target VMCS by the replayed
//! hardware instruction). Operands are decoded from the VM-exit
//! instruction-information field; the exit qualification carries the
//! displacement.
//!
//! See: 27.2.5 Information for VM Exits Due to Instruction Execution

use crate::{
    platform::{Platform, SegReg},
    vmx::{
        shadow_vt::{
            choose_vmcs_mode, get_vmrw_bitmaps, set_guest_vmx_result, set_link_pointer,
            vmcs_shadowing_copy, ShadowVt, VmcsMode,
        },
        vcpu::VCpu,
        vmcs::{self, bits, InveptDescriptor, InvvpidDescriptor, VmFail, VMCS_POINTER_INVALID},
        PCpu,
    },
};
use alloc::boxed::Box;
use bitfield::bitfield;
use x86::vmx::vmcs::{control, guest, ro};

bitfield! {
    /// The VM-exit instruction-information field for VMX instructions.
    ///
    /// See: Table 27-14. Format of the VM-Exit Instruction-Information
    /// Field as Used for VMREAD and VMWRITE
    #[derive(Clone, Copy)]
    pub struct InstructionInfo(u64);
    impl Debug;
    pub scaling, _: 1, 0;
    pub reg1, _: 6, 3;
    pub addr_size, _: 9, 7;
    pub mem_or_reg, _: 10;
    pub segment_reg, _: 17, 15;
    pub indexreg, _: 21, 18;
    pub indexreg_invalid, _: 22;
    pub basereg, _: 26, 23;
    pub basereg_invalid, _: 27;
    pub reg2, _: 31, 28;
}

/// The effective-address mask for the instruction's address size
/// (0 = 16-bit, 1 = 32-bit, 2 = 64-bit).
pub(crate) fn address_mask(addr_size: u64) -> u64 {
    (2u64.wrapping_shl((16u32 << addr_size) - 1)).wrapping_sub(1)
}

fn instruction_info() -> InstructionInfo {
    InstructionInfo(vmcs::vmread(ro::VMEXIT_INSTRUCTION_INFO))
}

/// Computes the memory operand's effective address:
/// base + index * scale + displacement, truncated to the address size.
fn op1_address(vcpu: &VCpu, info: InstructionInfo) -> u64 {
    let displacement = vmcs::vmread(ro::EXIT_QUALIFICATION);
    let base = if info.basereg_invalid() {
        0
    } else {
        vcpu.read_general_reg(info.basereg())
    };
    let index = if info.indexreg_invalid() {
        0
    } else {
        vcpu.read_general_reg(info.indexreg())
    };
    base.wrapping_add(index.wrapping_shl(info.scaling() as u32))
        .wrapping_add(displacement)
        & address_mask(info.addr_size())
}

fn memread(platform: &mut dyn Platform, sreg: SegReg, offset: u64, buf: &mut [u8]) {
    assert!(
        platform.seg_read(sreg, offset, buf),
        "guest memory read for a VMX operand failed"
    );
}

fn memwrite(platform: &mut dyn Platform, sreg: SegReg, offset: u64, buf: &[u8]) {
    assert!(
        platform.seg_write(sreg, offset, buf),
        "guest memory write for a VMX operand failed"
    );
}

/// Reads the first operand as a 64-bit value, from a register when the
/// instruction encoding allows one.
fn read_operand1(vcpu: &VCpu, platform: &mut dyn Platform, allow_reg: bool) -> u64 {
    let info = instruction_info();
    if info.mem_or_reg() {
        assert!(
            allow_reg,
            "The instruction does not allow a register operand. Instruction information {:#x}",
            info.0
        );
        return vcpu.read_general_reg(info.reg1());
    }
    let mut buf = [0u8; 8];
    memread(
        platform,
        SegReg::from_encoding(info.segment_reg()),
        op1_address(vcpu, info),
        &mut buf,
    );
    u64::from_le_bytes(buf)
}

/// Reads the first operand as a 16-byte descriptor (INVEPT/INVVPID).
fn read_operand1_m128(vcpu: &VCpu, platform: &mut dyn Platform) -> (u64, u64) {
    let info = instruction_info();
    assert!(
        !info.mem_or_reg(),
        "The instruction does not allow a register operand. Instruction information {:#x}",
        info.0
    );
    let mut buf = [0u8; 16];
    memread(
        platform,
        SegReg::from_encoding(info.segment_reg()),
        op1_address(vcpu, info),
        &mut buf,
    );
    (
        u64::from_le_bytes(buf[..8].try_into().unwrap()),
        u64::from_le_bytes(buf[8..].try_into().unwrap()),
    )
}

/// Writes a 64-bit value to the first operand, which must be in memory.
fn write_operand1_m64(vcpu: &VCpu, platform: &mut dyn Platform, val: u64) {
    let info = instruction_info();
    assert!(
        !info.mem_or_reg(),
        "The instruction does not allow a register operand. Instruction information {:#x}",
        info.0
    );
    memwrite(
        platform,
        SegReg::from_encoding(info.segment_reg()),
        op1_address(vcpu, info),
        &val.to_le_bytes(),
    );
}

/// Writes a value to the first operand, register or memory.
fn write_operand1(vcpu: &mut VCpu, platform: &mut dyn Platform, val: u64) {
    let info = instruction_info();
    if info.mem_or_reg() {
        vcpu.write_general_reg(info.reg1(), val);
    } else {
        memwrite(
            platform,
            SegReg::from_encoding(info.segment_reg()),
            op1_address(vcpu, info),
            &val.to_le_bytes(),
        );
    }
}

/// Reads the second (register) operand.
fn read_operand2(vcpu: &VCpu) -> u64 {
    vcpu.read_general_reg(instruction_info().reg2())
}

/// Emulates the guest's first VMXON: validates the region's revision
/// word, arms VMCS shadowing when the processor has it, and puts the
/// vCPU into VMX operation.
pub(crate) fn emul_vmxon(vcpu: &mut VCpu, pcpu: &PCpu, platform: &mut dyn Platform) {
    if vcpu.shadow_vt.is_none() {
        log::info!("Initializing shadow VT");
        if pcpu.vmcs_shadowing_available {
            // Start with the everything-passes bitmaps; they matter only
            // once a link pointer is installed.
            log::info!("Initializing shadow VMCS bitmaps");
            let bitmaps = get_vmrw_bitmaps();
            vmcs::vmwrite(control::VMREAD_BITMAP_ADDR_FULL, bitmaps.pass_phys());
            vmcs::vmwrite(control::VMWRITE_BITMAP_ADDR_FULL, bitmaps.pass_phys());
        }
        vcpu.shadow_vt = Some(Box::new(ShadowVt::new()));
    }
    let mut shadow = vcpu.shadow_vt.take().unwrap();
    shadow.current_vmcs_gphys = VMCS_POINTER_INVALID;
    shadow.current_vmcs_hphys = VMCS_POINTER_INVALID;
    shadow.exint_hack_mode = super::ExintHackMode::Cleared;
    shadow.mode = VmcsMode::Cleared;

    let op1 = read_operand1(vcpu, platform, false);
    let mut result = Err(VmFail::VmFailInvalid);
    if (op1 & !platform.pte_addr_mask()) == 0 {
        let revision = platform.read_gphys_u32(op1);
        if (revision & !super::INDICATOR_SHADOWING_BIT) == pcpu.vmcs_revision {
            if pcpu.vmcs_shadowing_available {
                // The region doubles as the shadow VMCS; mark it so.
                platform.write_gphys_u32(op1, pcpu.vmcs_revision | super::INDICATOR_SHADOWING_BIT);
                let ctl2 = vmcs::vmread(control::SECONDARY_PROCBASED_EXEC_CONTROLS);
                vmcs::vmwrite(
                    control::SECONDARY_PROCBASED_EXEC_CONTROLS,
                    ctl2 | bits::PROC2_VMCS_SHADOWING,
                );
                vmcs::vmwrite(guest::LINK_PTR_FULL, VMCS_POINTER_INVALID);
            }
            let phys = platform.gp2hp(op1).hphys;
            let _ = vmcs::vmclear_at(phys);
            shadow.vmxon_region_phys = phys;
            shadow.vmxon_region_gphys = op1;
            vcpu.vmxon = true;
            result = Ok(());
        }
    }
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

/// Emulates VMXON executed while the guest is already in VMX operation.
/// The instruction is replayed against the guest's current VMCS so the
/// "VMXON executed in VMX root operation" error number lands there.
pub(crate) fn emul_vmxon_in_vmx_root(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    let shadow = vcpu.shadow_vt.take().unwrap();
    let op1 = read_operand1(vcpu, platform, false);
    let result = if shadow.current_vmcs_hphys == VMCS_POINTER_INVALID {
        Err(VmFail::VmFailInvalid)
    } else {
        let orig = vmcs::vmptrst();
        let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
        let phys = platform.gp2hp(op1).hphys;
        let result = vmcs::vmxon_at(phys);
        let _ = vmcs::vmptrld_at(orig);
        result
    };
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

/// Takes the vCPU out of VMX operation: forgets the current VMCS, clears
/// the shadowing arrangement and restores the guest's revision word.
/// Called for VMXOFF and for a guest-initiated VMX reset.
pub fn shadow_vt_reset(vcpu: &mut VCpu, pcpu: &PCpu, platform: &mut dyn Platform) {
    if !vcpu.vmxon {
        return;
    }
    let mut shadow = vcpu.shadow_vt.take().unwrap();
    shadow.current_vmcs_gphys = VMCS_POINTER_INVALID;
    shadow.current_vmcs_hphys = VMCS_POINTER_INVALID;
    let _ = vmcs::vmclear_at(shadow.vmxon_region_phys);
    if pcpu.vmcs_shadowing_available {
        vmcs::vmwrite(guest::LINK_PTR_FULL, VMCS_POINTER_INVALID);
        let ctl2 = vmcs::vmread(control::SECONDARY_PROCBASED_EXEC_CONTROLS);
        vmcs::vmwrite(
            control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            ctl2 & !bits::PROC2_VMCS_SHADOWING,
        );
        platform.write_gphys_u32(shadow.vmxon_region_gphys, pcpu.vmcs_revision);
    }
    vcpu.vmxon = false;
    vcpu.shadow_vt = Some(shadow);
}

/// Emulates VMXOFF.
pub(crate) fn emul_vmxoff(vcpu: &mut VCpu, pcpu: &PCpu, platform: &mut dyn Platform) {
    shadow_vt_reset(vcpu, pcpu, platform);
    set_guest_vmx_result(Ok(()));
    vcpu.add_ip();
}

/// Emulates VMCLEAR. Clearing the current VMCS first copies the shadowed
/// fields back out so the guest's memory image is current, then drops to
/// the cleared mode.
pub(crate) fn emul_vmclear(vcpu: &mut VCpu, pcpu: &PCpu, platform: &mut dyn Platform) {
    let op1 = read_operand1(vcpu, platform, false);
    let mut shadow = vcpu.shadow_vt.take().unwrap();
    let result = if shadow.current_vmcs_gphys == op1 {
        shadow.clear_exint_hack("vmclear");
        if shadow.mode == VmcsMode::Shadowing {
            let orig = vmcs::vmptrst();
            vmcs_shadowing_copy(
                shadow.current_vmcs_hphys,
                shadow.vmxon_region_phys,
                true,
                pcpu,
            );
            let _ = vmcs::vmptrld_at(orig);
        }
        shadow.current_vmcs_gphys = VMCS_POINTER_INVALID;
        shadow.current_vmcs_hphys = VMCS_POINTER_INVALID;
        shadow.mode = VmcsMode::Cleared;
        set_link_pointer(&shadow, pcpu);
        let result = vmcs::vmclear_at(platform.gp2hp(op1).hphys);
        assert!(result.is_ok(), "vmclear of the current VMCS failed");
        result
    } else {
        vmcs::vmclear_at(platform.gp2hp(op1).hphys)
    };
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

/// Emulates VMPTRLD: verifies the region with a hardware VMPTRLD, copies
/// shadowed state in, carries the host-state area over, and selects the
/// handling mode from the region's indicator bit.
pub(crate) fn emul_vmptrld(vcpu: &mut VCpu, pcpu: &PCpu, platform: &mut dyn Platform) {
    let op1 = read_operand1(vcpu, platform, false);
    let mut shadow = vcpu.shadow_vt.take().unwrap();
    let shadow_vmcs_hphys = platform.gp2hp(op1).hphys;
    let cvg = shadow.current_vmcs_gphys;

    let mut result = Ok(());
    if cvg != op1 {
        let orig = vmcs::vmptrst();
        if cvg != VMCS_POINTER_INVALID {
            // Failures of the trial VMPTRLD must record their error
            // number in the guest's current VMCS.
            let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
        }
        match vmcs::vmptrld_at(shadow_vmcs_hphys) {
            Err(err) => {
                let _ = vmcs::vmptrld_at(orig);
                result = if cvg == VMCS_POINTER_INVALID {
                    Err(VmFail::VmFailInvalid)
                } else {
                    Err(err)
                };
            }
            Ok(()) => {
                shadow.clear_exint_hack("vmptrld");
                if cvg != VMCS_POINTER_INVALID && shadow.mode == VmcsMode::Shadowing {
                    vmcs_shadowing_copy(
                        shadow.current_vmcs_hphys,
                        shadow.vmxon_region_phys,
                        true,
                        pcpu,
                    );
                }
                let mode = choose_vmcs_mode(platform, op1, pcpu);
                if mode == VmcsMode::Shadowing {
                    vmcs_shadowing_copy(shadow.vmxon_region_phys, shadow_vmcs_hphys, true, pcpu);
                    let _ = vmcs::vmptrld_at(orig);
                    let hs = super::get_vmcs_host_states();
                    let _ = vmcs::vmptrld_at(shadow_vmcs_hphys);
                    super::set_vmcs_host_states(&hs);
                }
                let _ = vmcs::vmptrld_at(orig);
                shadow.current_vmcs_gphys = op1;
                shadow.current_vmcs_hphys = shadow_vmcs_hphys;
                shadow.mode = mode;
                set_link_pointer(&shadow, pcpu);
            }
        }
    }
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

/// Emulates VMPTRST.
pub(crate) fn emul_vmptrst(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    let current = vcpu.shadow_vt.as_ref().unwrap().current_vmcs_gphys;
    write_operand1_m64(vcpu, platform, current);
    set_guest_vmx_result(Ok(()));
    vcpu.add_ip();
}

/// Emulates VMREAD against the guest's current VMCS, substituting the
/// latched interruption information when the exint hack is armed.
pub(crate) fn emul_vmread(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    let mut shadow = vcpu.shadow_vt.take().unwrap();
    let result = if shadow.current_vmcs_gphys == VMCS_POINTER_INVALID {
        Err(VmFail::VmFailInvalid)
    } else {
        let index = read_operand2(vcpu);
        let orig = vmcs::vmptrst();
        let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
        let read = vmcs::vmread_fallible(index as u32);
        let _ = vmcs::vmptrld_at(orig);
        match read {
            Ok(mut val) => {
                if index == u64::from(ro::VMEXIT_INTERRUPTION_INFO) {
                    shadow.do_exint_hack(&mut val);
                }
                write_operand1(vcpu, platform, val);
                Ok(())
            }
            Err(err) => Err(err),
        }
    };
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

/// Emulates VMWRITE against the guest's current VMCS.
pub(crate) fn emul_vmwrite(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    let shadow = vcpu.shadow_vt.take().unwrap();
    let result = if shadow.current_vmcs_gphys == VMCS_POINTER_INVALID {
        Err(VmFail::VmFailInvalid)
    } else {
        let val = read_operand1(vcpu, platform, true);
        let index = read_operand2(vcpu);
        let orig = vmcs::vmptrst();
        let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
        let result = vmcs::vmwrite_fallible(index as u32, val);
        let _ = vmcs::vmptrld_at(orig);
        result
    };
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

/// Emulates INVEPT: invalidates the matching shadow EPT trees, then
/// replays the instruction against the guest's current VMCS for the real
/// structures and the flag outcome.
pub(crate) fn emul_invept(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    const INVEPT_TYPE_SINGLE_CONTEXT: u64 = 1;

    let (eptp, reserved) = read_operand1_m128(vcpu, platform);
    let invalidation = read_operand2(vcpu);
    let mut shadow = vcpu.shadow_vt.take().unwrap();
    if let Some(data) = shadow.shadow_ept.as_mut() {
        if invalidation == INVEPT_TYPE_SINGLE_CONTEXT {
            data.clear_ept(eptp);
        } else {
            data.clear_ept(0);
        }
    }
    let orig = vmcs::vmptrst();
    let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
    let descriptor = InveptDescriptor { eptp, reserved };
    let result = vmcs::invept_raw(invalidation, &descriptor);
    let _ = vmcs::vmptrld_at(orig);
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

/// Emulates INVVPID. The guest's VPID may stand for several real VPIDs
/// (one per cached EPT pointer); all of them are invalidated, the last
/// through the replayed instruction itself.
pub(crate) fn emul_invvpid(vcpu: &mut VCpu, platform: &mut dyn Platform) {
    const INVVPID_TYPE_ALL_CONTEXTS: u64 = 2;

    let (low, linear_address) = read_operand1_m128(vcpu, platform);
    let invalidation = read_operand2(vcpu);
    let shadow = vcpu.shadow_vt.take().unwrap();
    let mut descriptor = InvvpidDescriptor {
        vpid: low as u16,
        reserved: [0; 3],
        linear_address,
    };
    if invalidation != INVVPID_TYPE_ALL_CONTEXTS {
        if let Some(data) = shadow.shadow_ept.as_ref() {
            let mut last = None;
            for real in data.real_vpids_of(descriptor.vpid).iter() {
                if let Some(prev) = last.replace(real) {
                    let _ = vmcs::invvpid_raw(
                        invalidation,
                        &InvvpidDescriptor {
                            vpid: prev,
                            reserved: [0; 3],
                            linear_address,
                        },
                    );
                }
            }
            if let Some(real) = last {
                descriptor.vpid = real;
            }
        }
    }
    let orig = vmcs::vmptrst();
    let _ = vmcs::vmptrld_at(shadow.current_vmcs_hphys);
    let result = vmcs::invvpid_raw(invalidation, &descriptor);
    let _ = vmcs::vmptrld_at(orig);
    set_guest_vmx_result(result);
    vcpu.shadow_vt = Some(shadow);
    vcpu.add_ip();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_mask_tracks_address_size() {
        assert_eq!(address_mask(0), 0xFFFF);
        assert_eq!(address_mask(1), 0xFFFF_FFFF);
        assert_eq!(address_mask(2), u64::MAX);
    }

    #[test]
    fn instruction_info_field_extraction() {
        // scaling = 2 (x4), reg1 = 3, addr_size = 2 (64-bit), register
        // operand, segment = DS (3), index = 5 valid, base = 7 valid,
        // reg2 = 9.
        let raw: u64 = 0b10
            | (3 << 3)
            | (0b010 << 7)
            | (1 << 10)
            | (3 << 15)
            | (5 << 18)
            | (7 << 23)
            | (9 << 28);
        let info = InstructionInfo(raw);
        assert_eq!(info.scaling(), 2);
        assert_eq!(info.reg1(), 3);
        assert_eq!(info.addr_size(), 2);
        assert!(info.mem_or_reg());
        assert_eq!(info.segment_reg(), 3);
        assert_eq!(info.indexreg(), 5);
        assert!(!info.indexreg_invalid());
        assert_eq!(info.basereg(), 7);
        assert!(!info.basereg_invalid());
        assert_eq!(info.reg2(), 9);
    }

    #[test]
    fn invalid_base_and_index_are_flagged() {
        let raw = (1u64 << 22) | (1 << 27);
        let info = InstructionInfo(raw);
        assert!(info.indexreg_invalid());
        assert!(info.basereg_invalid());
    }
}
