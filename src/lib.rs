#![doc = include_str!("../README.md")]
#![no_std]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("This crate targets VMX root operation on x86-64 processors.");

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod logger;
pub mod platform;
pub mod vmx;
mod x86_instructions;

pub use platform::Platform;

use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// The structure representing a single memory page (4KB).
//
// This does not _always_ have to be allocated at the page aligned address, but
// very often it is, so let us specify the alignment.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; BASE_PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<Page>() == 0x1000);

impl Page {
    /// Returns a page filled with zeroes.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; BASE_PAGE_SIZE])
    }

    /// Returns a page with every byte set to `value`.
    #[must_use]
    pub const fn filled(value: u8) -> Self {
        Self([value; BASE_PAGE_SIZE])
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Computes how many pages are needed for the given bytes.
#[must_use]
pub fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_to_pages_rounds_up() {
        assert_eq!(size_to_pages(0), 0);
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(0x1000), 1);
        assert_eq!(size_to_pages(0x1001), 2);
        assert_eq!(size_to_pages(0x20_0000), 512);
    }
}
