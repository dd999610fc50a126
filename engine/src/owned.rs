use crate::device::{BufferDesc, BufferRole, ComputeDevice, DeviceBuffer};
use crate::error::DeviceError;

/// Buffers allocated on behalf of one owner, released together exactly once.
///
/// Buffers the owner merely references (a caller's source, a shared result) never go
/// through here.
pub struct OwnedBuffers<D: ComputeDevice> {
	device: D,
	buffers: Vec<D::Buffer>,
}

impl<D: ComputeDevice> OwnedBuffers<D> {
	pub fn new(device: D) -> Self {
		Self { device, buffers: Vec::new() }
	}

	/// Allocate a buffer of at least `size` bytes, rounded up to whole 32-bit words.
	pub fn allocate(
		&mut self,
		label: &str,
		size: u64,
		role: BufferRole,
	) -> Result<D::Buffer, DeviceError> {
		let size = size.max(4).div_ceil(4) * 4;
		let buffer = self.device.create_buffer(&BufferDesc { label, size, role })?;
		self.buffers.push(buffer.clone());
		Ok(buffer)
	}

	/// Allocate a parameter buffer and fill it.
	pub fn allocate_params(&mut self, label: &str, image: &[u8]) -> Result<D::Buffer, DeviceError> {
		let buffer = self.allocate(label, image.len() as u64, BufferRole::Params)?;
		self.device.write_buffer(&buffer, 0, image)?;
		Ok(buffer)
	}

	pub fn len(&self) -> usize {
		self.buffers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buffers.is_empty()
	}

	pub fn release_all(&mut self) {
		if !self.buffers.is_empty() {
			log::trace!("releasing {} owned buffers", self.buffers.len());
		}
		for buffer in self.buffers.drain(..) {
			log::trace!("destroy buffer {}", buffer.label());
			self.device.destroy_buffer(&buffer);
		}
	}
}

impl<D: ComputeDevice> Drop for OwnedBuffers<D> {
	fn drop(&mut self) {
		self.release_all();
	}
}
