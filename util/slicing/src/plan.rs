use crate::partition::{partition, DispatchSlice};
use crate::uniform::{uniform_layout, UniformLayout};
use serde::{Deserialize, Serialize};

/// Dispatch slices together with the parameter buffer layout they index into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPlan {
	pub slices: Vec<DispatchSlice>,
	pub uniforms: UniformLayout,
}

impl DispatchPlan {
	pub fn new(
		element_count: u32,
		elements_per_dispatch: u32,
		max_dispatches: u32,
		base_param_size: u64,
		alignment: u64,
	) -> Self {
		let mut slices = partition(element_count, elements_per_dispatch, max_dispatches);
		let uniforms = uniform_layout(slices.len(), base_param_size, alignment);
		for (i, slice) in slices.iter_mut().enumerate() {
			slice.param_offset = uniforms.offset(i);
		}

		log::trace!(
			"dispatch plan: {} elements, {} per dispatch, {} slice(s), stride {}",
			element_count,
			elements_per_dispatch,
			slices.len(),
			uniforms.slice_stride
		);

		Self { slices, uniforms }
	}

	/// Like [`DispatchPlan::new`] but always emits at least one workgroup, for passes that
	/// must write a result even when the input is empty.
	pub fn at_least_one(
		element_count: u32,
		elements_per_dispatch: u32,
		max_dispatches: u32,
		base_param_size: u64,
		alignment: u64,
	) -> Self {
		if element_count > 0 {
			return Self::new(
				element_count,
				elements_per_dispatch,
				max_dispatches,
				base_param_size,
				alignment,
			);
		}
		Self {
			slices: vec![DispatchSlice {
				dispatch_count: 1,
				dispatch_offset: 0,
				source_offset: 0,
				param_offset: 0,
			}],
			uniforms: uniform_layout(1, base_param_size, alignment),
		}
	}

	pub fn total_dispatches(&self) -> u32 {
		self.slices.iter().map(|s| s.dispatch_count).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.slices.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_param_offsets_follow_layout() {
		let plan = DispatchPlan::new(100, 4, 10, 32, 256);
		assert_eq!(plan.total_dispatches(), 25);
		assert_eq!(plan.slices.len(), 3);
		let offsets: Vec<u64> = plan.slices.iter().map(|s| s.param_offset).collect();
		assert_eq!(offsets, vec![0, 256, 512]);
		assert_eq!(plan.uniforms.buffer_size, 768);
	}

	#[test]
	fn test_single_slice_plan() {
		let plan = DispatchPlan::new(8, 4, 10, 32, 256);
		assert_eq!(plan.slices.len(), 1);
		assert_eq!(plan.uniforms.buffer_size, 32);
	}

	#[test]
	fn test_at_least_one_for_empty_input() {
		assert!(DispatchPlan::new(0, 4, 10, 32, 256).is_empty());
		let plan = DispatchPlan::at_least_one(0, 4, 10, 32, 256);
		assert_eq!(plan.total_dispatches(), 1);
		assert_eq!(plan, DispatchPlan::at_least_one(0, 4, 10, 32, 256));
	}
}
