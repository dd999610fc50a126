pub mod chain;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod host;
pub mod kernel;
pub mod memo;
pub mod operator;
pub mod owned;
pub mod params;
pub mod pass;
pub mod render;

pub use dispatch_slicing;

pub use chain::{DispatchChain, RecordCommands};
pub use config::{Overrides, ResolvedSizes, DEFAULT_BLOCK_LENGTH, MAX_BLOCK_LENGTH, MIN_WORKGROUP_LENGTH};
pub use context::GpuContext;
pub use device::{
	BindingAccess, BufferDesc, BufferId, BufferRole, ComputeDevice, ComputePass, DeviceBuffer,
	DeviceLimits, PassBinding, PassDispatch,
};
pub use error::{ComputeError, DeviceError};
pub use host::{HostDevice, HostLinker};
pub use kernel::{KernelKind, KernelLinker, KernelSpec, PipelineCache};
pub use memo::Memo;
pub use operator::{Combine, Load, Operator, ScalarFormat};
pub use owned::OwnedBuffers;
pub use params::{params_image, PassParams, PASS_PARAMS_SIZE};
pub use pass::{plan_dispatches, plan_params_image, record_planned_pass};
pub use render::{WgpuDevice, WgslLinker};

// Typical setup:
// - GpuContext::new(HostDevice::default(), HostLinker::default()) for host execution and tests
// - GpuContext::new(WgpuDevice::new(render_device, render_queue), WgslLinker) inside a bevy app
