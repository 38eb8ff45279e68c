//! # cal-ffi
//!
//! Flat host-language surface over `cal-runtime`.
//!
//! Objects never cross the boundary. Every compiled image, remote resource, local
//! resource and in-flight execution stays in a process-wide registry and is referred
//! to by an opaque `u64` handle. Every call returns either a value or an [`FfiError`]
//! naming the failing operation and the runtime's diagnostic text.
//!
//! ```text
//! install_driver / init ─► compile ─► alloc_remote ─► run_stream_async ─► join_stream
//!                                                         │
//!                                                   poll_stream (optional)
//! ```
//!
//! An execution handle is consumed by its join; joining it again, or joining a handle
//! that was never issued, fails with a misuse error instead of releasing anything twice.

mod error;
mod handles;
mod memory;
mod runtime;
mod stream;

pub use error::{FfiError, FfiErrorKind, FfiResult};
pub use handles::registry_counts;
pub use memory::{alloc_local, alloc_remote, free_local, free_remote, remote_info, remote_read, remote_write, RemoteInfo};
pub use runtime::{compile, free_image, get_num_gpus, init, init_tracing, install_driver, shutdown};
pub use stream::{
    join_stream, join_stream_timeout, poll_stream, run_stream, run_stream_async, LocalSpec, StreamRequest, StreamStats,
};

use cal_runtime::{AllocFlags, Format};

pub const FMT_FLOAT32_1: u32 = Format::Float32x1.code();
pub const FMT_FLOAT32_2: u32 = Format::Float32x2.code();
pub const FMT_FLOAT32_4: u32 = Format::Float32x4.code();
pub const FMT_SIGNED_INT32_1: u32 = Format::SignedInt32x1.code();
pub const FMT_SIGNED_INT32_2: u32 = Format::SignedInt32x2.code();
pub const FMT_SIGNED_INT32_4: u32 = Format::SignedInt32x4.code();
pub const FMT_UNSIGNED_INT32_1: u32 = Format::UnsignedInt32x1.code();
pub const FMT_UNSIGNED_INT32_2: u32 = Format::UnsignedInt32x2.code();
pub const FMT_UNSIGNED_INT32_4: u32 = Format::UnsignedInt32x4.code();

/// Allocation flag for the resource backing the `g[]` register
pub const GLOBAL_BUFFER: u32 = AllocFlags::GLOBAL_BUFFER.bits();

/// Version of the cal-ffi library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
