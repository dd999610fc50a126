// =================================================================================================
// DISPATCH PARTITIONER
// =================================================================================================
// Splits a 1D workload into dispatch slices that respect the hardware cap on
// workgroups per dispatch.

use serde::{Deserialize, Serialize};

/// One dispatch call worth of workgroups.
///
/// `dispatch_offset` is the global index of the slice's first workgroup, `source_offset` the
/// index of the first element that workgroup reads. `param_offset` is the byte offset of the
/// slice's parameter block and is filled in by [`crate::DispatchPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchSlice {
	pub dispatch_count: u32,
	pub dispatch_offset: u32,
	pub source_offset: u64,
	pub param_offset: u64,
}

/// Number of workgroups needed to cover `element_count` elements.
pub fn total_dispatches(element_count: u32, elements_per_dispatch: u32) -> u32 {
	element_count.div_ceil(elements_per_dispatch.max(1))
}

/// Partition `element_count` elements into slices of at most `max_dispatches` workgroups.
///
/// An empty input produces no slices. The last slice may cover a partial workgroup; the
/// kernel bounds-checks against the element count.
pub fn partition(
	element_count: u32,
	elements_per_dispatch: u32,
	max_dispatches: u32,
) -> Vec<DispatchSlice> {
	let elements_per_dispatch = elements_per_dispatch.max(1);
	let max_dispatches = max_dispatches.max(1);

	let total = total_dispatches(element_count, elements_per_dispatch);
	let mut slices = Vec::with_capacity(total.div_ceil(max_dispatches) as usize);

	let mut remaining = total;
	let mut dispatch_offset = 0u32;
	while remaining > 0 {
		let dispatch_count = remaining.min(max_dispatches);
		slices.push(DispatchSlice {
			dispatch_count,
			dispatch_offset,
			source_offset: dispatch_offset as u64 * elements_per_dispatch as u64,
			param_offset: 0,
		});
		dispatch_offset += dispatch_count;
		remaining -= dispatch_count;
	}

	slices
}
