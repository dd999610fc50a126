// =================================================================================================
// BUFFER HELPERS
// =================================================================================================
// Creating render-device buffers and reading their contents back to the host.

use super::errors;
use crate::device::{BufferDesc, BufferRole};
use crate::error::DeviceError;
use bevy::render::{
	render_resource::*,
	renderer::{RenderDevice, RenderQueue},
};

pub fn usage(role: BufferRole) -> BufferUsages {
	match role {
		BufferRole::Storage => BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
		BufferRole::Params => BufferUsages::UNIFORM | BufferUsages::COPY_DST,
	}
}

/// Create a zeroed buffer for `desc`.
pub fn new_buffer(device: &RenderDevice, desc: &BufferDesc<'_>) -> Result<Buffer, DeviceError> {
	let max = device.limits().max_buffer_size;
	if desc.size > max {
		return Err(DeviceError::OutOfMemory { requested: desc.size, available: max });
	}
	errors::watch(device, wgpu::ErrorFilter::OutOfMemory);
	errors::watch(device, wgpu::ErrorFilter::Validation);
	let buffer = device.create_buffer(&BufferDescriptor {
		label: Some(desc.label),
		size: desc.size,
		usage: usage(desc.role),
		mapped_at_creation: false,
	});
	let validation = errors::fetch(device);
	let memory = errors::fetch(device);
	match memory.or(validation) {
		Some(error) => {
			buffer.destroy();
			Err(errors::allocation_error(desc.label, desc.size, error))
		}
		None => Ok(buffer),
	}
}

/// Copy `size` bytes at `offset` into a staging buffer and wait for the mapping.
pub fn read_range(
	device: &RenderDevice,
	queue: &RenderQueue,
	src: &Buffer,
	offset: u64,
	size: u64,
) -> Result<Vec<u8>, DeviceError> {
	let staging = device.create_buffer(&BufferDescriptor {
		label: Some("readback_staging"),
		size,
		usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
		mapped_at_creation: false,
	});

	let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor::default());
	encoder.copy_buffer_to_buffer(src, offset, &staging, 0, size);
	queue.submit(Some(encoder.finish()));

	let (tx, rx) = std::sync::mpsc::channel();
	let slice = staging.slice(..);
	slice.map_async(MapMode::Read, move |result| {
		let _ = tx.send(result);
	});
	device
		.wgpu_device()
		.poll(wgpu::PollType::Wait)
		.map_err(|e| DeviceError::Lost(e.to_string()))?;

	rx.recv()
		.map_err(|e| DeviceError::Readback(e.to_string()))?
		.map_err(|e| DeviceError::Readback(e.to_string()))?;

	let range = slice.get_mapped_range();
	let bytes = range.to_vec();
	drop(range);
	staging.unmap();
	staging.destroy();

	Ok(bytes)
}
