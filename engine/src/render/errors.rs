// =================================================================================================
// ERROR SCOPES
// =================================================================================================
// wgpu reports shader, pipeline, allocation and submission failures lazily. Each fallible call
// is bracketed by `watch` and `fetch`, and whatever the scope caught becomes a `DeviceError`.

use crate::error::DeviceError;
use bevy::render::renderer::RenderDevice;

/// Opens an error scope. Every call must be paired with [`fetch`] on the same thread.
pub fn watch(device: &RenderDevice, filter: wgpu::ErrorFilter) {
	device.wgpu_device().push_error_scope(filter);
}

/// Closes the innermost scope and blocks until the device reports what it caught.
pub fn fetch(device: &RenderDevice) -> Option<wgpu::Error> {
	futures::executor::block_on(device.wgpu_device().pop_error_scope())
}

pub fn link_error(kernel: &str, error: wgpu::Error) -> DeviceError {
	DeviceError::Link { kernel: kernel.to_string(), reason: error.to_string() }
}

pub fn allocation_error(label: &str, requested: u64, error: wgpu::Error) -> DeviceError {
	match error {
		wgpu::Error::OutOfMemory { .. } => DeviceError::OutOfMemory { requested, available: 0 },
		other => DeviceError::Validation { scope: label.to_string(), reason: other.to_string() },
	}
}

pub fn submission_error(label: &str, error: wgpu::Error) -> DeviceError {
	DeviceError::Validation { scope: label.to_string(), reason: error.to_string() }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn validation(description: &str) -> wgpu::Error {
		wgpu::Error::Validation {
			source: Box::new(std::io::Error::other(description.to_string())),
			description: description.to_string(),
		}
	}

	fn out_of_memory() -> wgpu::Error {
		wgpu::Error::OutOfMemory { source: Box::new(std::io::Error::other("heap exhausted")) }
	}

	#[test]
	fn test_link_errors_name_the_kernel() {
		let err = link_error("reduce_sum_wg64_bl4", validation("unknown identifier `scratc`"));
		match err {
			DeviceError::Link { kernel, reason } => {
				assert_eq!(kernel, "reduce_sum_wg64_bl4");
				assert!(reason.contains("unknown identifier"), "{}", reason);
			}
			other => panic!("unexpected error: {}", other),
		}
	}

	#[test]
	fn test_allocation_errors_distinguish_memory() {
		assert_eq!(
			allocation_error("block_sums", 1 << 30, out_of_memory()),
			DeviceError::OutOfMemory { requested: 1 << 30, available: 0 }
		);
		assert!(matches!(
			allocation_error("block_sums", 64, validation("usage conflict")),
			DeviceError::Validation { ref scope, .. } if scope == "block_sums"
		));
	}

	#[test]
	fn test_submission_errors_keep_the_description() {
		let err = submission_error("scan_then_reduce", validation("buffer destroyed"));
		assert!(err.to_string().contains("scan_then_reduce"));
		assert!(err.to_string().contains("buffer destroyed"));
	}
}
