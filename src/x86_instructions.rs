//! The module containing wrapper functions for x86 instructions.
//!
//! Those instructions provided by the `x86` crate as `unsafe` functions, due
//! to the fact that those require certain preconditions. The wrappers
//! provided by this module encapsulate those `unsafe`-ness since this crate
//! always runs at CPL0 and satisfies the preconditions.

use x86::{
    controlregs::{Cr0, Cr4},
    dtables::DescriptorTablePointer,
};

/// Reads an MSR.
pub(crate) fn rdmsr(msr: u32) -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a value to an MSR.
pub(crate) fn wrmsr(msr: u32, value: u64) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Reads the CR0 register.
pub(crate) fn cr0() -> Cr0 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr0() }
}

/// Writes a value to the CR0 register.
pub(crate) fn cr0_write(val: Cr0) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr0_write(val) };
}

/// Reads the CR3 register.
pub(crate) fn cr3() -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr3() }
}

/// Reads the CR4 register.
pub(crate) fn cr4() -> Cr4 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr4() }
}

/// Writes a value to the CR4 register.
pub(crate) fn cr4_write(val: Cr4) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr4_write(val) };
}

/// Reads 8-bits from an IO port.
pub(crate) fn inb(port: u16) -> u8 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::inb(port) }
}

/// Writes 8-bits to an IO port.
pub(crate) fn outb(port: u16, val: u8) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::outb(port, val) };
}

/// Reads the IDTR register.
pub(crate) fn sidt<T>(idtr: &mut DescriptorTablePointer<T>) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::dtables::sidt(idtr) };
}

/// Reads the GDTR.
pub(crate) fn sgdt<T>(gdtr: &mut DescriptorTablePointer<T>) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::dtables::sgdt(gdtr) };
}
