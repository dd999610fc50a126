// =================================================================================================
// UNIFORM SLICING
// =================================================================================================
// Layout of a parameter buffer holding one block per dispatch slice, bound with a
// dynamic offset.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniformLayout {
	pub buffer_size: u64,
	pub slice_stride: u64,
}

impl UniformLayout {
	/// Byte offset of the parameter block for slice `index`.
	pub fn offset(&self, index: usize) -> u64 {
		index as u64 * self.slice_stride
	}
}

/// Compute the parameter buffer layout for `slice_count` slices.
///
/// A single slice needs no padding since the only dynamic offset used is zero.
pub fn uniform_layout(slice_count: usize, base_param_size: u64, alignment: u64) -> UniformLayout {
	if slice_count < 2 {
		return UniformLayout { buffer_size: base_param_size, slice_stride: base_param_size };
	}

	let alignment = alignment.max(1);
	let slice_stride = base_param_size.max(alignment).div_ceil(alignment) * alignment;
	UniformLayout { buffer_size: slice_count as u64 * slice_stride, slice_stride }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_single_slice_is_unpadded() {
		assert_eq!(
			uniform_layout(1, 32, 256),
			UniformLayout { buffer_size: 32, slice_stride: 32 }
		);
		assert_eq!(
			uniform_layout(0, 32, 256),
			UniformLayout { buffer_size: 32, slice_stride: 32 }
		);
	}

	#[test]
	fn test_slices_are_aligned() {
		let layout = uniform_layout(3, 32, 256);
		assert_eq!(layout, UniformLayout { buffer_size: 768, slice_stride: 256 });
		assert_eq!(layout.offset(2), 512);
	}

	#[test]
	fn test_param_block_larger_than_alignment() {
		let layout = uniform_layout(2, 300, 256);
		assert_eq!(layout.slice_stride, 512);
		assert_eq!(layout.buffer_size, 1024);
	}

	#[test]
	fn test_every_offset_is_aligned() {
		for alignment in [4u64, 16, 64, 256] {
			for base in [4u64, 16, 32, 100, 257] {
				let layout = uniform_layout(5, base, alignment);
				for i in 0..5 {
					assert_eq!(layout.offset(i) % alignment, 0);
				}
				assert!(layout.slice_stride >= base);
			}
		}
	}
}
