// =================================================================================================
// PIPELINE CREATION
// =================================================================================================
// Compiling generated WGSL into compute pipelines on the render device.

use super::{bind_groups::create_layout, errors, wgsl::kernel_source, WgpuDevice};
use crate::error::DeviceError;
use crate::kernel::{KernelLinker, KernelSpec};
use bevy::render::render_resource::{BindGroupLayout, ComputePipeline};
use std::borrow::Cow;
use std::sync::Arc;

#[derive(Clone)]
pub struct WgslPipeline {
	pub spec: Arc<KernelSpec>,
	pub layout: BindGroupLayout,
	pub pipeline: ComputePipeline,
}

/// Generates WGSL for each kernel description and compiles it on first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct WgslLinker;

impl KernelLinker<WgpuDevice> for WgslLinker {
	fn link(&self, device: &WgpuDevice, spec: &KernelSpec) -> Result<WgslPipeline, DeviceError> {
		let label = spec.label();
		spec.operator
			.validate()
			.map_err(|e| DeviceError::Link { kernel: label.clone(), reason: e.to_string() })?;

		let limits = device.render_device().limits();
		if spec.workgroup_length > limits.max_compute_invocations_per_workgroup {
			return Err(DeviceError::Link {
				kernel: label,
				reason: format!(
					"workgroup size {} exceeds {}",
					spec.workgroup_length, limits.max_compute_invocations_per_workgroup
				),
			});
		}

		let render_device = device.render_device();
		let source = kernel_source(spec);
		log::debug!("compiling {} ({} bytes of WGSL)", label, source.len());

		errors::watch(render_device, wgpu::ErrorFilter::Validation);
		let module = render_device.create_and_validate_shader_module(wgpu::ShaderModuleDescriptor {
			label: Some(&label),
			source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
		});

		let layout = create_layout(render_device, &format!("{}_layout", label), &spec.kind.bindings());
		let raw_layout: &wgpu::BindGroupLayout = &layout;
		let pipeline_layout = render_device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
			label: Some(&label),
			bind_group_layouts: &[raw_layout],
			push_constant_ranges: &[],
		});

		let pipeline = render_device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
			label: Some(&label),
			layout: Some(&pipeline_layout),
			module: &module,
			entry_point: Some("main"),
			compilation_options: Default::default(),
			cache: None,
		});

		if let Some(error) = errors::fetch(render_device) {
			log::warn!("{} failed to compile: {}", label, error);
			return Err(errors::link_error(&label, error));
		}

		Ok(WgslPipeline { spec: Arc::new(spec.clone()), layout, pipeline })
	}
}
