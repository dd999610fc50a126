// =================================================================================================
// BIND GROUP HELPERS
// =================================================================================================
// Layouts derived from a kernel's binding list, and per-pass bind groups.

use super::WgpuBuffer;
use crate::device::{BindingAccess, PassBinding};
use crate::params::PASS_PARAMS_SIZE;
use bevy::render::{render_resource::*, renderer::RenderDevice};
use std::num::NonZeroU64;

/// The parameter block, bound with a dynamic offset per dispatch.
pub fn create_params_layout_entry(binding: u32) -> BindGroupLayoutEntry {
	BindGroupLayoutEntry {
		binding,
		visibility: ShaderStages::COMPUTE,
		ty: BindingType::Buffer {
			ty: BufferBindingType::Uniform,
			has_dynamic_offset: true,
			min_binding_size: NonZeroU64::new(PASS_PARAMS_SIZE),
		},
		count: None,
	}
}

pub fn create_storage_layout_entry(binding: u32, read_only: bool) -> BindGroupLayoutEntry {
	BindGroupLayoutEntry {
		binding,
		visibility: ShaderStages::COMPUTE,
		ty: BindingType::Buffer {
			ty: BufferBindingType::Storage { read_only },
			has_dynamic_offset: false,
			min_binding_size: None,
		},
		count: None,
	}
}

pub fn create_layout(device: &RenderDevice, label: &str, bindings: &[BindingAccess]) -> BindGroupLayout {
	let entries: Vec<BindGroupLayoutEntry> = bindings
		.iter()
		.enumerate()
		.map(|(i, access)| match access {
			BindingAccess::Params => create_params_layout_entry(i as u32),
			BindingAccess::Read => create_storage_layout_entry(i as u32, true),
			BindingAccess::ReadWrite => create_storage_layout_entry(i as u32, false),
		})
		.collect();
	device.create_bind_group_layout(Some(label), &entries)
}

fn create_buffer_entry<'a>(binding: &PassBinding<'a, WgpuBuffer>) -> BindGroupEntry<'a> {
	// the parameter binding is one block wide; the dynamic offset picks the block
	let size = match binding.access {
		BindingAccess::Params => NonZeroU64::new(PASS_PARAMS_SIZE),
		BindingAccess::Read | BindingAccess::ReadWrite => None,
	};
	BindGroupEntry {
		binding: binding.binding,
		resource: BindingResource::Buffer(BufferBinding {
			buffer: &binding.buffer.buffer,
			offset: 0,
			size,
		}),
	}
}

pub fn create_bind_group(
	device: &RenderDevice,
	label: &str,
	layout: &BindGroupLayout,
	bindings: &[PassBinding<'_, WgpuBuffer>],
) -> BindGroup {
	let entries: Vec<BindGroupEntry> = bindings.iter().map(create_buffer_entry).collect();
	device.create_bind_group(Some(label), layout, &entries)
}
