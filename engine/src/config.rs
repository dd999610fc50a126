// =================================================================================================
// SIZE CONFIGURATION
// =================================================================================================
// Caller overrides resolved against device limits. Overruns are clamped, never rejected.

use crate::device::DeviceLimits;
use serde::{Deserialize, Serialize};

/// Elements each reduce thread folds before the workgroup tree.
pub const DEFAULT_BLOCK_LENGTH: u32 = 4;
pub const MAX_BLOCK_LENGTH: u32 = 256;
/// Below two threads a level chain never shrinks.
pub const MIN_WORKGROUP_LENGTH: u32 = 2;

/// Optional size overrides, mostly useful to force multi-level or multi-slice plans in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Overrides {
	pub workgroup_length: Option<u32>,
	pub max_dispatches: Option<u32>,
	pub block_length: Option<u32>,
}

impl Overrides {
	pub fn workgroup_length(length: u32) -> Self {
		Self { workgroup_length: Some(length), ..Default::default() }
	}

	pub fn with_max_dispatches(mut self, max: u32) -> Self {
		self.max_dispatches = Some(max);
		self
	}

	pub fn with_block_length(mut self, length: u32) -> Self {
		self.block_length = Some(length);
		self
	}

	/// Clamp every override to what `limits` supports for elements of `elem_size` bytes.
	pub fn resolve(&self, limits: &DeviceLimits, elem_size: u64) -> ResolvedSizes {
		let storage_elements =
			(limits.max_workgroup_storage_size as u64 / elem_size.max(1)).min(u32::MAX as u64) as u32;
		let hardware = limits
			.max_workgroup_invocations
			.min(limits.max_workgroup_size_x)
			.min(storage_elements);

		let requested = self.workgroup_length.unwrap_or(limits.max_workgroup_invocations);
		let workgroup_length = requested.min(hardware).max(MIN_WORKGROUP_LENGTH);
		if workgroup_length != requested {
			log::debug!("workgroup length {} clamped to {}", requested, workgroup_length);
		}

		let device_max = limits.max_dispatches_per_dimension;
		let max_dispatches = self.max_dispatches.unwrap_or(device_max).min(device_max).max(1);

		let block_length = self
			.block_length
			.unwrap_or(DEFAULT_BLOCK_LENGTH)
			.clamp(1, MAX_BLOCK_LENGTH);

		ResolvedSizes {
			workgroup_length,
			max_dispatches,
			block_length,
			param_alignment: limits.min_uniform_buffer_offset_alignment.max(1),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedSizes {
	pub workgroup_length: u32,
	pub max_dispatches: u32,
	pub block_length: u32,
	pub param_alignment: u64,
}
