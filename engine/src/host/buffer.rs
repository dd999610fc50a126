use crate::device::{BufferId, BufferRole, DeviceBuffer};
use crate::error::DeviceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Host memory standing in for a device allocation. Clones share storage.
#[derive(Debug, Clone)]
pub struct HostBuffer {
	id: BufferId,
	label: Arc<str>,
	size: u64,
	role: BufferRole,
	data: Arc<RwLock<Vec<u8>>>,
	destroyed: Arc<AtomicBool>,
}

impl HostBuffer {
	pub(crate) fn new(id: BufferId, label: &str, size: u64, role: BufferRole) -> Self {
		Self {
			id,
			label: Arc::from(label),
			size,
			role,
			data: Arc::new(RwLock::new(vec![0; size as usize])),
			destroyed: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn role(&self) -> BufferRole {
		self.role
	}

	pub fn is_destroyed(&self) -> bool {
		self.destroyed.load(Ordering::Acquire)
	}

	/// Marks the buffer destroyed. Returns false if it already was.
	pub(crate) fn destroy(&self) -> bool {
		let first = !self.destroyed.swap(true, Ordering::AcqRel);
		if first {
			let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
			data.clear();
			data.shrink_to_fit();
		}
		first
	}

	pub(crate) fn check_live(&self) -> Result<(), DeviceError> {
		if self.is_destroyed() {
			return Err(DeviceError::DestroyedBuffer(self.label.to_string()));
		}
		Ok(())
	}

	pub(crate) fn check_range(&self, offset: u64, size: u64) -> Result<(), DeviceError> {
		match offset.checked_add(size) {
			Some(end) if end <= self.size => Ok(()),
			_ => Err(DeviceError::OutOfBounds {
				label: self.label.to_string(),
				offset,
				size,
				buffer_size: self.size,
			}),
		}
	}

	pub(crate) fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
		self.check_live()?;
		self.check_range(offset, size)?;
		let data = self.data.read().unwrap_or_else(|e| e.into_inner());
		Ok(data[offset as usize..(offset + size) as usize].to_vec())
	}

	pub(crate) fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), DeviceError> {
		self.check_live()?;
		self.check_range(offset, bytes.len() as u64)?;
		let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
		data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
		Ok(())
	}

	/// The whole buffer as 32-bit words.
	pub(crate) fn words(&self) -> Result<Vec<u32>, DeviceError> {
		self.check_live()?;
		let data = self.data.read().unwrap_or_else(|e| e.into_inner());
		Ok(data
			.chunks_exact(4)
			.map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
			.collect())
	}

	pub(crate) fn write_words(&self, word_offset: u64, words: &[u32]) -> Result<(), DeviceError> {
		let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
		self.write(word_offset * 4, &bytes)
	}
}

impl DeviceBuffer for HostBuffer {
	fn id(&self) -> BufferId {
		self.id
	}

	fn size(&self) -> u64 {
		self.size
	}

	fn label(&self) -> &str {
		&self.label
	}
}
