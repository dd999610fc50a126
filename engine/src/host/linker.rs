use super::HostDevice;
use crate::device::ComputeDevice;
use crate::error::DeviceError;
use crate::kernel::{KernelLinker, KernelSpec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A linked host kernel is just its description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPipeline {
	pub spec: Arc<KernelSpec>,
}

/// Shared count of successful links.
#[derive(Debug, Clone, Default)]
pub struct LinkCounter(Arc<AtomicUsize>);

impl LinkCounter {
	pub fn get(&self) -> usize {
		self.0.load(Ordering::SeqCst)
	}
}

#[derive(Debug, Clone, Default)]
pub struct HostLinker {
	links: LinkCounter,
	/// When set, every link fails with this reason.
	failure: Option<String>,
}

impl HostLinker {
	pub fn failing(reason: impl Into<String>) -> Self {
		Self { failure: Some(reason.into()), ..Default::default() }
	}

	pub fn links(&self) -> LinkCounter {
		self.links.clone()
	}
}

impl KernelLinker<HostDevice> for HostLinker {
	fn link(&self, device: &HostDevice, spec: &KernelSpec) -> Result<HostPipeline, DeviceError> {
		let link_error = |reason: String| DeviceError::Link { kernel: spec.label(), reason };

		if let Some(reason) = &self.failure {
			return Err(link_error(reason.clone()));
		}
		if device.is_lost() {
			return Err(DeviceError::Lost("link on a lost device".to_string()));
		}
		spec.operator.validate().map_err(|e| link_error(e.to_string()))?;

		let limits = device.limits();
		if spec.workgroup_length == 0
			|| spec.workgroup_length > limits.max_workgroup_invocations.min(limits.max_workgroup_size_x)
		{
			return Err(link_error(format!(
				"workgroup size {} is outside the device limits",
				spec.workgroup_length
			)));
		}
		let shared = spec.workgroup_length as u64 * spec.operator.elem_size();
		if shared > limits.max_workgroup_storage_size as u64 {
			return Err(link_error(format!(
				"{} bytes of workgroup storage exceeds {}",
				shared, limits.max_workgroup_storage_size
			)));
		}
		if spec.block_length == 0 {
			return Err(link_error("block length must be positive".to_string()));
		}

		self.links.0.fetch_add(1, Ordering::SeqCst);
		Ok(HostPipeline { spec: Arc::new(spec.clone()) })
	}
}
