use thiserror::Error;

/// Failures surfaced by a compute device or kernel linker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
	#[error("out of device memory: requested {requested} bytes with {available} available")]
	OutOfMemory { requested: u64, available: u64 },

	#[error("device lost: {0}")]
	Lost(String),

	#[error("buffer `{0}` used after it was destroyed")]
	DestroyedBuffer(String),

	#[error("dispatch of {requested} workgroups exceeds the device limit of {limit}")]
	DispatchLimit { requested: u32, limit: u32 },

	#[error("dynamic offset {offset} is not a multiple of {alignment}")]
	MisalignedOffset { offset: u64, alignment: u64 },

	#[error(
		"access of {size} bytes at offset {offset} is outside buffer `{label}` of {buffer_size} bytes"
	)]
	OutOfBounds { label: String, offset: u64, size: u64, buffer_size: u64 },

	#[error("pass `{pass}` does not match its pipeline layout: {reason}")]
	BindingMismatch { pass: String, reason: String },

	#[error("failed to link kernel `{kernel}`: {reason}")]
	Link { kernel: String, reason: String },

	#[error("failed to read back buffer: {0}")]
	Readback(String),

	/// An error the device reported asynchronously for `scope`.
	#[error("`{scope}` was rejected by the device: {reason}")]
	Validation { scope: String, reason: String },
}

/// Errors returned by every fallible operation of the scan and reduce orchestrators.
#[derive(Debug, Error)]
pub enum ComputeError {
	/// A required or invalid configuration field. Fatal to the instance.
	#[error("invalid configuration for `{field}`: {reason}")]
	Config { field: &'static str, reason: String },

	#[error(transparent)]
	Device(#[from] DeviceError),
}

impl ComputeError {
	pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
		Self::Config { field, reason: reason.into() }
	}

	pub fn is_config(&self) -> bool {
		matches!(self, Self::Config { .. })
	}
}
