// =================================================================================================
// GPU-REPRESENTABLE PARAMETER BLOCK
// =================================================================================================
// One block per dispatch slice, read by every kernel at binding 0 through a dynamic offset.

use crate::error::DeviceError;
use bytemuck::{Pod, Zeroable};

/// Offsets and counts are in elements, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct PassParams {
	pub source_offset: u32,
	pub destination_offset: u32,
	pub block_sums_offset: u32,
	pub element_count: u32,
	/// Global index of the first workgroup of the dispatch.
	pub workgroup_offset: u32,
	pub exclusive: u32,
	/// Initial value lane bits, copied into every lane.
	pub initial_value: u32,
	pub padding: u32,
}

pub const PASS_PARAMS_SIZE: u64 = std::mem::size_of::<PassParams>() as u64;

impl PassParams {
	pub fn as_bytes(&self) -> &[u8] {
		bytemuck::bytes_of(self)
	}

	/// Read the block at `offset` out of a parameter buffer.
	pub fn read(bytes: &[u8], offset: u64) -> Result<Self, DeviceError> {
		let start = offset as usize;
		let end = start + PASS_PARAMS_SIZE as usize;
		match bytes.get(start..end) {
			Some(block) => Ok(bytemuck::pod_read_unaligned(block)),
			None => Err(DeviceError::OutOfBounds {
				label: "params".to_string(),
				offset,
				size: PASS_PARAMS_SIZE,
				buffer_size: bytes.len() as u64,
			}),
		}
	}
}

/// Serialize one block per slice at the given byte offsets into a buffer image.
pub fn params_image(buffer_size: u64, blocks: &[(u64, PassParams)]) -> Vec<u8> {
	let mut image = vec![0u8; buffer_size as usize];
	for (offset, params) in blocks {
		let start = *offset as usize;
		image[start..start + PASS_PARAMS_SIZE as usize].copy_from_slice(params.as_bytes());
	}
	image
}
