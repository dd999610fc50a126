// =================================================================================================
// RENDER DEVICE BACKEND
// =================================================================================================
// The compute-device interface over bevy's RenderDevice and RenderQueue.

pub mod bind_groups;
pub mod buffers;
pub mod errors;
pub mod pipelines;
pub mod wgsl;

pub use pipelines::{WgslLinker, WgslPipeline};

use crate::device::{
	BufferDesc, BufferId, ComputeDevice, ComputePass, DeviceBuffer, DeviceLimits,
};
use crate::error::DeviceError;
use bevy::render::{
	render_resource::{Buffer, CommandEncoder, CommandEncoderDescriptor, ComputePassDescriptor},
	renderer::{RenderDevice, RenderQueue},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct WgpuBuffer {
	id: BufferId,
	label: Arc<str>,
	pub buffer: Buffer,
}

impl WgpuBuffer {
	/// Wrap a buffer created elsewhere, e.g. by a render graph node.
	pub fn wrap(label: &str, buffer: Buffer) -> Self {
		Self {
			id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
			label: Arc::from(label),
			buffer,
		}
	}
}

impl DeviceBuffer for WgpuBuffer {
	fn id(&self) -> BufferId {
		self.id
	}

	fn size(&self) -> u64 {
		self.buffer.size()
	}

	fn label(&self) -> &str {
		&self.label
	}
}

pub struct WgpuStream {
	label: String,
	encoder: CommandEncoder,
}

#[derive(Clone)]
pub struct WgpuDevice {
	device: RenderDevice,
	queue: RenderQueue,
}

impl WgpuDevice {
	pub fn new(device: RenderDevice, queue: RenderQueue) -> Self {
		Self { device, queue }
	}

	pub fn render_device(&self) -> &RenderDevice {
		&self.device
	}

	pub fn render_queue(&self) -> &RenderQueue {
		&self.queue
	}
}

impl ComputeDevice for WgpuDevice {
	type Buffer = WgpuBuffer;
	type Pipeline = WgslPipeline;
	type Stream = WgpuStream;

	fn limits(&self) -> DeviceLimits {
		let limits = self.device.limits();
		DeviceLimits {
			max_workgroup_invocations: limits.max_compute_invocations_per_workgroup,
			max_workgroup_size_x: limits.max_compute_workgroup_size_x,
			max_dispatches_per_dimension: limits.max_compute_workgroups_per_dimension,
			min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment as u64,
			max_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
		}
	}

	fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<WgpuBuffer, DeviceError> {
		let buffer = buffers::new_buffer(&self.device, desc)?;
		Ok(WgpuBuffer::wrap(desc.label, buffer))
	}

	fn destroy_buffer(&self, buffer: &WgpuBuffer) {
		buffer.buffer.destroy();
	}

	fn write_buffer(&self, buffer: &WgpuBuffer, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
		if offset + data.len() as u64 > buffer.size() {
			return Err(DeviceError::OutOfBounds {
				label: buffer.label().to_string(),
				offset,
				size: data.len() as u64,
				buffer_size: buffer.size(),
			});
		}
		self.queue.write_buffer(&buffer.buffer, offset, data);
		Ok(())
	}

	fn create_stream(&self, label: &str) -> WgpuStream {
		let encoder = self
			.device
			.create_command_encoder(&CommandEncoderDescriptor { label: Some(label) });
		WgpuStream { label: label.to_string(), encoder }
	}

	fn record_copy(
		&self,
		stream: &mut WgpuStream,
		source: &WgpuBuffer,
		source_offset: u64,
		destination: &WgpuBuffer,
		destination_offset: u64,
		size: u64,
	) -> Result<(), DeviceError> {
		for offset in [source_offset, destination_offset, size] {
			if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
				return Err(DeviceError::MisalignedOffset {
					offset,
					alignment: wgpu::COPY_BUFFER_ALIGNMENT,
				});
			}
		}
		stream.encoder.copy_buffer_to_buffer(
			&source.buffer,
			source_offset,
			&destination.buffer,
			destination_offset,
			size,
		);
		Ok(())
	}

	fn record_pass(&self, stream: &mut WgpuStream, pass: &ComputePass<'_, Self>) -> Result<(), DeviceError> {
		let limits = self.limits();
		for dispatch in &pass.dispatches {
			if dispatch.workgroups > limits.max_dispatches_per_dimension {
				return Err(DeviceError::DispatchLimit {
					requested: dispatch.workgroups,
					limit: limits.max_dispatches_per_dimension,
				});
			}
			if dispatch.param_offset % limits.min_uniform_buffer_offset_alignment != 0 {
				return Err(DeviceError::MisalignedOffset {
					offset: dispatch.param_offset,
					alignment: limits.min_uniform_buffer_offset_alignment,
				});
			}
		}
		let expected = pass.pipeline.spec.kind.bindings().len();
		if pass.bindings.len() != expected {
			return Err(DeviceError::BindingMismatch {
				pass: pass.label.to_string(),
				reason: format!("{} bindings for a layout of {}", pass.bindings.len(), expected),
			});
		}

		let bind = bind_groups::create_bind_group(
			&self.device,
			pass.label,
			&pass.pipeline.layout,
			&pass.bindings,
		);

		log::trace!("{}: recording {} ({} dispatches)", stream.label, pass.label, pass.dispatches.len());
		let mut compute = stream.encoder.begin_compute_pass(&ComputePassDescriptor {
			label: Some(pass.label),
			timestamp_writes: None,
		});
		compute.set_pipeline(&pass.pipeline.pipeline);
		for dispatch in &pass.dispatches {
			compute.set_bind_group(0, &*bind, &[dispatch.param_offset as u32]);
			compute.dispatch_workgroups(dispatch.workgroups, 1, 1);
		}
		Ok(())
	}

	fn submit(&self, stream: WgpuStream) -> Result<(), DeviceError> {
		log::debug!("submitting {}", stream.label);
		errors::watch(&self.device, wgpu::ErrorFilter::Validation);
		self.queue.submit(Some(stream.encoder.finish()));
		match errors::fetch(&self.device) {
			Some(error) => Err(errors::submission_error(&stream.label, error)),
			None => Ok(()),
		}
	}

	fn read_buffer(&self, buffer: &WgpuBuffer, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
		if offset + size > buffer.size() {
			return Err(DeviceError::OutOfBounds {
				label: buffer.label().to_string(),
				offset,
				size,
				buffer_size: buffer.size(),
			});
		}
		buffers::read_range(&self.device, &self.queue, &buffer.buffer, offset, size)
	}
}
