//! # cal-runtime - GPU compute binding, execution and join
//!
//! Resource lifecycle and kernel launch engine over the AMD CAL compute runtime.
//!
//! ## Architecture
//!
//! - **Devices**: discovered lazily on first use and cached in a process-wide registry
//!   owned by [`Runtime`]. [`Runtime::shutdown`] closes them and invalidates every
//!   [`Device`] value handed out so far.
//! - **Resources**: [`LocalResource`] lives in device memory; [`RemoteResource`] lives
//!   in host memory the device can reach and stays mapped for host access except while
//!   a launch has it bound.
//! - **Bindings**: a [`BindingTable`] maps kernel register names to a transient local
//!   resource, a remote resource bound directly, or a copy-through pair that stages a
//!   remote resource into device memory around the run.
//! - **Execution**: [`Runtime::launch`] returns an [`ExecutionHandle`] as soon as the
//!   program is submitted. [`ExecutionHandle::join`] waits, copies results back,
//!   releases everything the launch acquired and re-maps remote resources.
//!
//! All runtime calls go through the [`driver::Driver`] trait. The `cal` feature
//! provides the vendor implementation; [`driver::fake::FakeDriver`] runs everything
//! in-process for tests.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use cal_runtime::driver::fake::FakeDriver;
//! use cal_runtime::{AllocFlags, BindingTable, Domain, Format, LaunchRequest, Runtime, RuntimeConfig, Shape};
//!
//! # fn main() -> cal_runtime::Result<()> {
//! let runtime = Runtime::new(Arc::new(FakeDriver::new()), RuntimeConfig::default());
//! let device = runtime.device(0)?;
//! let image = runtime.compile("il_ps_2_0\ndcl_output o0\nend\n")?;
//!
//! let out = runtime.allocate_remote(&device, Shape::new(16, 16), Format::Float32x1, AllocFlags::NONE)?;
//! let mut bindings = BindingTable::new();
//! bindings.bind_copy_conventional("o0", &out)?;
//!
//! let request = LaunchRequest::new(device, Domain::sized(16, 16)).with_bindings(bindings);
//! let completion = runtime.launch(&image, request)?.join()?;
//! assert_eq!(completion.copied_out, vec!["o0".to_string()]);
//!
//! runtime.free_remote(&out)?;
//! runtime.free_image(image)?;
//! runtime.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod config;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
pub mod image;
pub mod join;
pub mod memory;
pub mod wait;

// Re-export primary types
pub use binding::{Binding, BindingTable, CopyDirection, GLOBAL_BUFFER_REGISTER};
pub use config::{PollStrategy, RuntimeConfig};
pub use device::{Device, Runtime};
pub use driver::{AllocFlags, DeviceInfo, Domain, Driver, DriverError, Format, Target};
pub use engine::LaunchRequest;
pub use error::{CalError, Result};
pub use image::KernelImage;
pub use join::{Completion, ExecutionHandle, ExecutionId, JoinOutcome};
pub use memory::{LocalResource, RemoteResource, Shape};
