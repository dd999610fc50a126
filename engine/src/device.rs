// =================================================================================================
// COMPUTE DEVICE INTERFACE
// =================================================================================================
// Buffer allocation, command recording and submission. Implemented by the host reference
// device and by the bevy render device.

use crate::error::DeviceError;
use serde::{Deserialize, Serialize};

/// Hardware limits the orchestrators size their passes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
	pub max_workgroup_invocations: u32,
	pub max_workgroup_size_x: u32,
	pub max_dispatches_per_dimension: u32,
	pub min_uniform_buffer_offset_alignment: u64,
	pub max_workgroup_storage_size: u32,
}

impl Default for DeviceLimits {
	/// The WebGPU baseline limits.
	fn default() -> Self {
		Self {
			max_workgroup_invocations: 256,
			max_workgroup_size_x: 256,
			max_dispatches_per_dimension: 65535,
			min_uniform_buffer_offset_alignment: 256,
			max_workgroup_storage_size: 16384,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Handle to a device allocation. Clones refer to the same allocation.
pub trait DeviceBuffer: Clone + Send + Sync {
	fn id(&self) -> BufferId;
	fn size(&self) -> u64;
	fn label(&self) -> &str;

	/// How many whole elements of `elem_size` bytes fit in the buffer.
	fn elements(&self, elem_size: u64) -> u64 {
		self.size() / elem_size.max(1)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
	/// Read/write storage, copyable in both directions.
	Storage,
	/// Per-slice parameter blocks.
	Params,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
	pub label: &'a str,
	pub size: u64,
	pub role: BufferRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingAccess {
	/// Uniform parameter block bound with a dynamic offset.
	Params,
	Read,
	ReadWrite,
}

pub struct PassBinding<'a, B> {
	pub binding: u32,
	pub buffer: &'a B,
	pub access: BindingAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassDispatch {
	/// Dynamic byte offset of this dispatch's parameter block.
	pub param_offset: u64,
	pub workgroups: u32,
}

/// One pipeline, one bind group pattern, one or more dispatches.
pub struct ComputePass<'a, D: ComputeDevice> {
	pub label: &'a str,
	pub pipeline: &'a D::Pipeline,
	pub bindings: Vec<PassBinding<'a, D::Buffer>>,
	pub dispatches: Vec<PassDispatch>,
}

pub trait ComputeDevice: Clone + Send + Sync + 'static {
	type Buffer: DeviceBuffer;
	type Pipeline: Clone + Send + Sync;
	type Stream: Send;

	fn limits(&self) -> DeviceLimits;

	fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer, DeviceError>;

	/// Release an allocation. Work already submitted is not retracted.
	fn destroy_buffer(&self, buffer: &Self::Buffer);

	fn write_buffer(
		&self,
		buffer: &Self::Buffer,
		offset: u64,
		data: &[u8],
	) -> Result<(), DeviceError>;

	fn create_stream(&self, label: &str) -> Self::Stream;

	fn record_copy(
		&self,
		stream: &mut Self::Stream,
		source: &Self::Buffer,
		source_offset: u64,
		destination: &Self::Buffer,
		destination_offset: u64,
		size: u64,
	) -> Result<(), DeviceError>;

	fn record_pass(
		&self,
		stream: &mut Self::Stream,
		pass: &ComputePass<'_, Self>,
	) -> Result<(), DeviceError>;

	/// Submit a stream. Commands execute in recording order.
	fn submit(&self, stream: Self::Stream) -> Result<(), DeviceError>;

	/// Wait for submitted work and copy `size` bytes at `offset` back to the host.
	fn read_buffer(
		&self,
		buffer: &Self::Buffer,
		offset: u64,
		size: u64,
	) -> Result<Vec<u8>, DeviceError>;
}
