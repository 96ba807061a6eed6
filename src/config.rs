//! The module containing various constants that may be modified by developers.

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// The number of preallocated table pages backing the primary EPT of each
/// vCPU. The more memory the guest touches, the more tables are consumed;
/// when the pool runs out, the whole tree is wiped and rebuilt on demand.
pub const EPT_TABLE_COUNT: usize = 1024;

/// The number of preallocated table pages backing each shadow EPT used for
/// nested virtualization. Shadow trees are rebuilt from the guest
/// hypervisor's EPT on demand, so a small pool suffices.
pub const SHADOW_EPT_TABLE_COUNT: usize = 16;

/// How far nested virtualization is taken for a guest that executes VMXON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedVt {
    /// Guest VMX instructions fail as if VMX were unsupported.
    Off,
    /// The VMX instruction set is emulated; L2 runs on the host paging
    /// arrangement of L1.
    On,
    /// Additionally virtualize EPT for L1 through shadow EPT trees. This
    /// mode requires the unrestricted-guest feature; L2 entry panics
    /// otherwise.
    ShadowEpt,
}

/// The nested virtualization mode applied to every vCPU.
pub const NESTED_VT: NestedVt = NestedVt::ShadowEpt;
