// =================================================================================================
// PLANNED PASSES
// =================================================================================================
// Glue between a dispatch plan and one recorded compute pass.

use crate::device::{BindingAccess, ComputeDevice, ComputePass, PassBinding, PassDispatch};
use crate::error::DeviceError;
use crate::params::{params_image, PassParams};
use dispatch_slicing::{DispatchPlan, DispatchSlice};

pub fn plan_dispatches(plan: &DispatchPlan) -> Vec<PassDispatch> {
	plan.slices
		.iter()
		.map(|slice| PassDispatch { param_offset: slice.param_offset, workgroups: slice.dispatch_count })
		.collect()
}

/// Parameter buffer contents with one block per slice at the plan's offsets.
pub fn plan_params_image(plan: &DispatchPlan, block: impl Fn(&DispatchSlice) -> PassParams) -> Vec<u8> {
	let blocks: Vec<(u64, PassParams)> =
		plan.slices.iter().map(|slice| (slice.param_offset, block(slice))).collect();
	params_image(plan.uniforms.buffer_size, &blocks)
}

/// Record every slice of `plan` as a dispatch of one pass. `buffers` are bound in slot order.
pub fn record_planned_pass<D: ComputeDevice>(
	device: &D,
	stream: &mut D::Stream,
	label: &str,
	pipeline: &D::Pipeline,
	buffers: &[(&D::Buffer, BindingAccess)],
	plan: &DispatchPlan,
) -> Result<(), DeviceError> {
	if plan.is_empty() {
		return Ok(());
	}
	let bindings = buffers
		.iter()
		.enumerate()
		.map(|(slot, (buffer, access))| PassBinding { binding: slot as u32, buffer: *buffer, access: *access })
		.collect();
	let pass = ComputePass { label, pipeline, bindings, dispatches: plan_dispatches(plan) };
	device.record_pass(stream, &pass)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::params::PASS_PARAMS_SIZE;

	#[test]
	fn test_every_slice_gets_a_block() {
		let plan = DispatchPlan::new(100, 8, 4, PASS_PARAMS_SIZE, 256);
		assert_eq!(plan.slices.len(), 4);

		let image = plan_params_image(&plan, |slice| PassParams {
			workgroup_offset: slice.dispatch_offset,
			element_count: 100,
			..Default::default()
		});
		assert_eq!(image.len() as u64, plan.uniforms.buffer_size);

		let dispatches = plan_dispatches(&plan);
		for (slice, dispatch) in plan.slices.iter().zip(&dispatches) {
			let block = PassParams::read(&image, dispatch.param_offset).unwrap();
			assert_eq!(block.workgroup_offset, slice.dispatch_offset);
			assert_eq!(dispatch.workgroups, slice.dispatch_count);
		}
		assert_eq!(dispatches.iter().map(|d| d.workgroups).sum::<u32>(), 13);
	}
}
