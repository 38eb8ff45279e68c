//! Value types shared between the runtime core and driver implementations
//!
//! Every object the vendor runtime hands out is wrapped in its own handle type so that
//! a context can never be passed where a resource is expected. Handles are opaque:
//! they can be compared, hashed and printed, but carry no arithmetic.

use std::fmt;
use std::ptr::NonNull;

macro_rules! driver_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw runtime value
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw runtime value, for handing back to the driver
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

driver_handle!(
    /// Opened compute device
    DeviceId,
    "dev"
);
driver_handle!(
    /// Execution context bound to one device
    ContextId,
    "ctx"
);
driver_handle!(
    /// Kernel image loaded into a context
    ModuleId,
    "mod"
);
driver_handle!(
    /// Device-local or host-remote memory allocation
    ResourceId,
    "res"
);
driver_handle!(
    /// Context-scoped memory object created from a resource
    MemId,
    "mem"
);
driver_handle!(
    /// Resolved kernel register inside a loaded module
    NameId,
    "name"
);
driver_handle!(
    /// Resolved entry point inside a loaded module
    FuncId,
    "func"
);
driver_handle!(
    /// Completion token of an asynchronous copy or program run
    EventId,
    "evt"
);
driver_handle!(
    /// Compiled and linked kernel image
    ImageId,
    "img"
);

// ================================================================================================
// Formats and allocation flags
// ================================================================================================

/// Element layout of a memory resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Float32x1,
    Float32x2,
    Float32x4,
    SignedInt32x1,
    SignedInt32x2,
    SignedInt32x4,
    UnsignedInt32x1,
    UnsignedInt32x2,
    UnsignedInt32x4,
}

impl Format {
    /// All supported formats, in code order
    pub const ALL: [Format; 9] = [
        Format::Float32x1,
        Format::Float32x2,
        Format::Float32x4,
        Format::SignedInt32x1,
        Format::SignedInt32x2,
        Format::SignedInt32x4,
        Format::UnsignedInt32x1,
        Format::UnsignedInt32x2,
        Format::UnsignedInt32x4,
    ];

    /// Stable integer code used across the host-language boundary
    pub const fn code(self) -> u32 {
        match self {
            Format::Float32x1 => 0,
            Format::Float32x2 => 1,
            Format::Float32x4 => 2,
            Format::SignedInt32x1 => 3,
            Format::SignedInt32x2 => 4,
            Format::SignedInt32x4 => 5,
            Format::UnsignedInt32x1 => 6,
            Format::UnsignedInt32x2 => 7,
            Format::UnsignedInt32x4 => 8,
        }
    }

    /// Inverse of [`Format::code`]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Number of 32-bit components per element
    pub const fn components(self) -> u32 {
        match self {
            Format::Float32x1 | Format::SignedInt32x1 | Format::UnsignedInt32x1 => 1,
            Format::Float32x2 | Format::SignedInt32x2 | Format::UnsignedInt32x2 => 2,
            Format::Float32x4 | Format::SignedInt32x4 | Format::UnsignedInt32x4 => 4,
        }
    }

    /// Size of one element in bytes
    pub const fn element_size(self) -> usize {
        self.components() as usize * 4
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Float32x1 => "FLOAT32_1",
            Format::Float32x2 => "FLOAT32_2",
            Format::Float32x4 => "FLOAT32_4",
            Format::SignedInt32x1 => "SIGNED_INT32_1",
            Format::SignedInt32x2 => "SIGNED_INT32_2",
            Format::SignedInt32x4 => "SIGNED_INT32_4",
            Format::UnsignedInt32x1 => "UNSIGNED_INT32_1",
            Format::UnsignedInt32x2 => "UNSIGNED_INT32_2",
            Format::UnsignedInt32x4 => "UNSIGNED_INT32_4",
        };
        f.write_str(name)
    }
}

/// Resource allocation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// No special allocation behavior
    pub const NONE: AllocFlags = AllocFlags(0);

    /// Resource backs the kernel's global buffer register (`g[]`)
    pub const GLOBAL_BUFFER: AllocFlags = AllocFlags(1);

    /// Build flags from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        AllocFlags(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set
    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

// ================================================================================================
// Devices, domains and events
// ================================================================================================

/// Compiler target descriptor of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target(pub u32);

/// Capability info reported for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub target: Target,
    pub max_resource_1d_width: u32,
    pub max_resource_2d_width: u32,
    pub max_resource_2d_height: u32,
}

/// 2-D iteration rectangle a kernel program runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Domain {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Domain {
    /// Create a domain with explicit origin
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Domain anchored at the origin
    pub const fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Number of work items in the domain
    pub const fn work_items(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) {}x{}", self.x, self.y, self.width, self.height)
    }
}

/// Status of a completion token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Done,
    Error(String),
}

/// Host view of a mapped remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMapping {
    /// First byte of the mapped allocation
    pub ptr: NonNull<u8>,
    /// Row stride in elements (may exceed the requested width)
    pub pitch: u32,
}

// Safety: a mapping is plain address data; dereferencing is guarded by `RemoteResource`
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_codes_round_trip_and_sizes() {
        for format in Format::ALL {
            assert_eq!(Format::from_code(format.code()), Some(format));
        }
        assert_eq!(Format::from_code(9), None);
        assert_eq!(Format::Float32x4.element_size(), 16);
        assert_eq!(Format::SignedInt32x2.components(), 2);
    }

    #[test]
    fn alloc_flags_combine() {
        let flags = AllocFlags::NONE | AllocFlags::GLOBAL_BUFFER;
        assert!(flags.contains(AllocFlags::GLOBAL_BUFFER));
        assert!(!AllocFlags::NONE.contains(AllocFlags::GLOBAL_BUFFER));
    }

    #[test]
    fn handles_display_with_prefix() {
        assert_eq!(ContextId::new(3).to_string(), "ctx3");
        assert_eq!(Domain::sized(64, 64).work_items(), 4096);
    }
}
