use crate::device::{BufferDesc, BufferRole, ComputeDevice, DeviceLimits};
use crate::error::{ComputeError, DeviceError};
use crate::kernel::{KernelLinker, KernelSpec, PipelineCache};
use crate::operator::Operator;
use bytemuck::Pod;
use std::sync::Arc;

/// A device plus the pipeline cache every orchestrator on that device shares.
pub struct GpuContext<D: ComputeDevice> {
	device: D,
	pipelines: Arc<PipelineCache<D>>,
}

impl<D: ComputeDevice> Clone for GpuContext<D> {
	fn clone(&self) -> Self {
		Self { device: self.device.clone(), pipelines: self.pipelines.clone() }
	}
}

impl<D: ComputeDevice> GpuContext<D> {
	pub fn new(device: D, linker: impl KernelLinker<D> + 'static) -> Self {
		Self { device, pipelines: Arc::new(PipelineCache::new(linker)) }
	}

	pub fn device(&self) -> &D {
		&self.device
	}

	pub fn limits(&self) -> DeviceLimits {
		self.device.limits()
	}

	pub fn pipelines(&self) -> &PipelineCache<D> {
		&self.pipelines
	}

	pub fn pipeline(&self, spec: &KernelSpec) -> Result<D::Pipeline, DeviceError> {
		self.pipelines.get(&self.device, spec)
	}

	/// Create a storage buffer holding `data`. The caller owns it; see [`Self::release`].
	pub fn upload<T: Pod>(&self, label: &str, data: &[T]) -> Result<D::Buffer, ComputeError> {
		let bytes: &[u8] = bytemuck::cast_slice(data);
		let size = (bytes.len() as u64).max(4).div_ceil(4) * 4;
		let buffer = self.device.create_buffer(&BufferDesc { label, size, role: BufferRole::Storage })?;
		if !bytes.is_empty() {
			self.device.write_buffer(&buffer, 0, bytes)?;
		}
		Ok(buffer)
	}

	/// Create a zeroed storage buffer of `size` bytes owned by the caller.
	pub fn create_storage(&self, label: &str, size: u64) -> Result<D::Buffer, ComputeError> {
		let size = size.max(4).div_ceil(4) * 4;
		Ok(self.device.create_buffer(&BufferDesc { label, size, role: BufferRole::Storage })?)
	}

	pub fn release(&self, buffer: &D::Buffer) {
		self.device.destroy_buffer(buffer);
	}

	/// Read `count` 32-bit words starting at word `offset`.
	pub fn read_bits(&self, buffer: &D::Buffer, offset: u64, count: u64) -> Result<Vec<u32>, ComputeError> {
		if count == 0 {
			return Ok(Vec::new());
		}
		let bytes = self.device.read_buffer(buffer, offset * 4, count * 4)?;
		Ok(bytes.chunks_exact(4).map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])).collect())
	}

	/// Read `count` operator elements starting at element `offset`, decoded lane by lane.
	pub fn read_values(
		&self,
		buffer: &D::Buffer,
		operator: &Operator,
		offset: u64,
		count: u64,
	) -> Result<Vec<f64>, ComputeError> {
		let lanes = operator.lanes as u64;
		let bits = self.read_bits(buffer, offset * lanes, count * lanes)?;
		Ok(operator.decode(&bits))
	}
}
