//! The module containing the VMXON/VMCS region types and the wrappers
//! around the VMX instruction set.
//!
//! The VMCS is accessible only through VMREAD/VMWRITE and friends; none of
//! its contents are modeled by the compiler. This module is the single
//! `unsafe` boundary for those instructions; everything above it uses the
//! typed wrappers.

use x86::current::rflags::RFlags;
pub(crate) use x86::vmx::VmFail;

/// The sentinel for "no current VMCS".
///
/// See: 24.4 GUEST-STATE AREA (VMCS link pointer)
pub(crate) const VMCS_POINTER_INVALID: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// The region of memory that the logical processor uses to support VMX
/// operation.
///
/// See: 25.11.5 VMXON Region
#[derive(derivative::Derivative)]
#[derivative(Default)]
#[repr(C, align(4096))]
pub struct VmxonRegion {
    revision_id: u32,
    #[derivative(Default(value = "[0; 4092]"))]
    data: [u8; 4092],
}
const _: () = assert!(core::mem::size_of::<VmxonRegion>() == 0x1000);

impl VmxonRegion {
    pub(crate) fn new(revision_id: u32) -> Self {
        Self {
            revision_id,
            ..Self::default()
        }
    }

    /// The host-physical address of the region. The hypervisor runs
    /// identity mapped.
    pub(crate) fn phys(&self) -> u64 {
        core::ptr::from_ref(self) as u64
    }
}

/// The region of memory that the logical processor uses to represent a
/// virtual CPU. Called virtual-machine control data structure (VMCS).
///
/// See: 25.2 FORMAT OF THE VMCS REGION
#[derive(Clone, Copy, derivative::Derivative)]
#[derivative(Default)]
#[repr(C, align(4096))]
pub struct VmcsRegion {
    revision_id: u32,
    abort_indicator: u32,
    #[derivative(Default(value = "[0; 4088]"))]
    data: [u8; 4088],
}
const _: () = assert!(core::mem::size_of::<VmcsRegion>() == 0x1000);

impl VmcsRegion {
    pub(crate) fn new(revision_id: u32) -> Self {
        Self {
            revision_id,
            ..Self::default()
        }
    }

    pub(crate) fn phys(&self) -> u64 {
        core::ptr::from_ref(self) as u64
    }
}

/// The wrapper of the VMXON instruction.
pub(crate) fn vmxon(vmxon_region: &mut VmxonRegion) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmxon(vmxon_region.phys()).unwrap() };
}

/// Executes VMXON for an arbitrary host-physical region, capturing the
/// failure instead of panicking. Used to replay a guest VMXON against
/// hardware so the error number lands in the guest-visible VMCS.
pub(crate) fn vmxon_at(hphys: u64) -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmxon(hphys) }
}

/// The wrapper of the VMCLEAR instruction.
pub(crate) fn vmclear(vmcs_region: &mut VmcsRegion) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmclear(vmcs_region.phys()).unwrap() };
}

/// VMCLEAR for an arbitrary host-physical VMCS page.
pub(crate) fn vmclear_at(hphys: u64) -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmclear(hphys) }
}

/// The wrapper of the VMPTRLD instruction.
pub(crate) fn vmptrld(vmcs_region: &mut VmcsRegion) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmptrld(vmcs_region.phys()).unwrap() }
}

/// VMPTRLD for an arbitrary host-physical VMCS page. The current-VMCS
/// pointer is a hidden processor register; callers save it with
/// [`vmptrst`] and restore it around uses of this.
pub(crate) fn vmptrld_at(hphys: u64) -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmptrld(hphys) }
}

/// The wrapper of the VMPTRST instruction.
pub(crate) fn vmptrst() -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmptrst().unwrap() }
}

/// The wrapper of the VMREAD instruction. Returns zero on error.
pub(crate) fn vmread(field: u32) -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// VMREAD with the failure surfaced, for emulating the guest's VMREAD.
pub(crate) fn vmread_fallible(field: u32) -> Result<u64, VmFail> {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmread(field) }
}

/// The wrapper of the VMWRITE instruction.
pub(crate) fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) }.unwrap();
}

/// VMWRITE with the failure surfaced, for emulating the guest's VMWRITE.
pub(crate) fn vmwrite_fallible(field: u32, val: u64) -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmwrite(field, val) }
}

/// The type of invalidation the INVEPT instruction performs.
///
/// See: 29.4.3.1 Operations that Invalidate Cached Mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum InveptType {
    SingleContext = 1,
    AllContexts = 2,
}

/// The structure to specify the effect of the INVEPT instruction.
///
/// See: Figure 31-1. INVEPT Descriptor
#[repr(C)]
pub(crate) struct InveptDescriptor {
    pub(crate) eptp: u64,
    pub(crate) reserved: u64,
}
const _: () = assert!(core::mem::size_of::<InveptDescriptor>() == 16);

/// The type of invalidation the INVVPID instruction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainingGlobals = 3,
}

/// The structure to specify the effect of the INVVPID instruction.
///
/// See: Figure 31-2. INVVPID Descriptor
#[repr(C)]
pub(crate) struct InvvpidDescriptor {
    pub(crate) vpid: u16,
    pub(crate) reserved: [u16; 3],
    pub(crate) linear_address: u64,
}
const _: () = assert!(core::mem::size_of::<InvvpidDescriptor>() == 16);

/// INVEPT with the raw type value, capturing VMfail. Emulation passes the
/// guest's operand through unchanged so invalid types fail exactly as on
/// hardware.
pub(crate) fn invept_raw(invalidation: u64, descriptor: &InveptDescriptor) -> Result<(), VmFail> {
    let flags = unsafe {
        let flags: u64;
        core::arch::asm!(
            "invept {}, [{}]",
            "pushfq",
            "pop {}",
            in(reg) invalidation,
            in(reg) descriptor,
            lateout(reg) flags
        );
        flags
    };
    vm_result(RFlags::from_raw(flags))
}

/// The wrapper of the INVEPT instruction.
///
/// See: INVEPT - Invalidate Translations Derived from EPT
pub(crate) fn invept(invalidation: InveptType, eptp: u64) {
    let descriptor = InveptDescriptor { eptp, reserved: 0 };
    if let Err(err) = invept_raw(invalidation as u64, &descriptor) {
        panic!("INVEPT failed: {err:?}");
    }
}

/// INVVPID with the raw type value, capturing VMfail.
pub(crate) fn invvpid_raw(invalidation: u64, descriptor: &InvvpidDescriptor) -> Result<(), VmFail> {
    let flags = unsafe {
        let flags: u64;
        core::arch::asm!(
            "invvpid {}, [{}]",
            "pushfq",
            "pop {}",
            in(reg) invalidation,
            in(reg) descriptor,
            lateout(reg) flags
        );
        flags
    };
    vm_result(RFlags::from_raw(flags))
}

/// The wrapper of the INVVPID instruction.
pub(crate) fn invvpid(invalidation: InvvpidType, vpid: u16) {
    let descriptor = InvvpidDescriptor {
        vpid,
        reserved: [0; 3],
        linear_address: 0,
    };
    if let Err(err) = invvpid_raw(invalidation as u64, &descriptor) {
        panic!("INVVPID failed: {err:?}");
    }
}

/// Derives the VMX instruction outcome from captured RFLAGS.
///
/// See: 31.2 CONVENTIONS
pub(crate) fn vm_result(flags: RFlags) -> Result<(), VmFail> {
    if flags.contains(RFlags::FLAGS_ZF) {
        // See: 31.4 VM INSTRUCTION ERROR NUMBERS
        Err(VmFail::VmFailValid)
    } else if flags.contains(RFlags::FLAGS_CF) {
        Err(VmFail::VmFailInvalid)
    } else {
        Ok(())
    }
}

// Control field bits used across the core. Values are the SDM encodings.
//
// See: 25.6 VM-EXECUTION CONTROL FIELDS
// See: 25.7 VM-EXIT CONTROL FIELDS
// See: 25.8 VM-ENTRY CONTROL FIELDS
pub(crate) mod bits {
    pub(crate) const PIN_NMI_EXITING: u64 = 1 << 3;
    pub(crate) const PIN_VIRTUAL_NMIS: u64 = 1 << 5;

    pub(crate) const PROC_USE_TSC_OFFSETTING: u64 = 1 << 3;
    pub(crate) const PROC_INVLPG_EXITING: u64 = 1 << 9;
    pub(crate) const PROC_CR3_LOAD_EXITING: u64 = 1 << 15;
    pub(crate) const PROC_CR3_STORE_EXITING: u64 = 1 << 16;
    pub(crate) const PROC_UNCONDITIONAL_IO_EXITING: u64 = 1 << 24;
    pub(crate) const PROC_USE_IO_BITMAPS: u64 = 1 << 25;
    pub(crate) const PROC_USE_MSR_BITMAPS: u64 = 1 << 28;
    pub(crate) const PROC_ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;

    pub(crate) const PROC2_ENABLE_EPT: u64 = 1 << 1;
    pub(crate) const PROC2_ENABLE_RDTSCP: u64 = 1 << 3;
    pub(crate) const PROC2_ENABLE_VPID: u64 = 1 << 5;
    pub(crate) const PROC2_UNRESTRICTED_GUEST: u64 = 1 << 7;
    pub(crate) const PROC2_VMCS_SHADOWING: u64 = 1 << 14;
    pub(crate) const PROC2_ENABLE_XSAVES: u64 = 1 << 20;

    pub(crate) const EXIT_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
    pub(crate) const EXIT_LOAD_PERF_GLOBAL_CTRL: u64 = 1 << 12;
    pub(crate) const EXIT_ACK_INTERRUPT_ON_EXIT: u64 = 1 << 15;
    pub(crate) const EXIT_SAVE_PAT: u64 = 1 << 18;
    pub(crate) const EXIT_LOAD_PAT: u64 = 1 << 19;
    pub(crate) const EXIT_SAVE_EFER: u64 = 1 << 20;
    pub(crate) const EXIT_LOAD_EFER: u64 = 1 << 21;

    pub(crate) const ENTRY_IA32E_MODE_GUEST: u64 = 1 << 9;
    pub(crate) const ENTRY_LOAD_PAT: u64 = 1 << 14;
    pub(crate) const ENTRY_LOAD_EFER: u64 = 1 << 15;

    // Guest interruptibility state.
    // See: 25.4.2 Guest Non-Register State
    pub(crate) const INTERRUPTIBILITY_STI_BLOCKING: u64 = 1 << 0;
    pub(crate) const INTERRUPTIBILITY_MOV_SS_BLOCKING: u64 = 1 << 1;
    pub(crate) const INTERRUPTIBILITY_NMI_BLOCKING: u64 = 1 << 3;

    // The EPT pointer low bits: write-back paging-structure memory type
    // and a page-walk length of 4.
    // See: 25.6.11 Extended-Page-Table Pointer (EPTP)
    pub(crate) const EPTP_MEMORY_TYPE_WB: u64 = 6;
    pub(crate) const EPTP_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
}
