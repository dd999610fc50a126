// =================================================================================================
// HOST REFERENCE DEVICE
// =================================================================================================
// Executes recorded passes on host memory, one rayon task per workgroup. Validates passes the
// way a GPU backend would, so plans that would be rejected on hardware fail here too.

mod buffer;
mod kernels;
mod linker;

pub use buffer::HostBuffer;
pub use linker::{HostLinker, HostPipeline, LinkCounter};

use crate::device::{
	BindingAccess, BufferDesc, BufferId, BufferRole, ComputeDevice, ComputePass, DeviceBuffer,
	DeviceLimits, PassDispatch,
};
use crate::error::DeviceError;
use crate::params::{PassParams, PASS_PARAMS_SIZE};
use kernels::{Bindings, ElementWrite};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct HostState {
	limits: DeviceLimits,
	memory_budget: Option<u64>,
	allocated: AtomicU64,
	live: AtomicUsize,
	next_id: AtomicU64,
	submissions: AtomicUsize,
	lost: AtomicBool,
}

#[derive(Clone)]
pub struct HostDevice {
	state: Arc<HostState>,
}

impl Default for HostDevice {
	fn default() -> Self {
		Self::new(DeviceLimits::default())
	}
}

impl HostDevice {
	pub fn new(limits: DeviceLimits) -> Self {
		Self::with_budget(limits, None)
	}

	/// A device that fails allocations once `budget` bytes are live.
	pub fn with_budget(limits: DeviceLimits, budget: Option<u64>) -> Self {
		Self {
			state: Arc::new(HostState {
				limits,
				memory_budget: budget,
				allocated: AtomicU64::new(0),
				live: AtomicUsize::new(0),
				next_id: AtomicU64::new(1),
				submissions: AtomicUsize::new(0),
				lost: AtomicBool::new(false),
			}),
		}
	}

	/// Every later operation on this device (and its clones) fails with a lost-device error.
	pub fn lose(&self) {
		log::warn!("host device marked lost");
		self.state.lost.store(true, Ordering::SeqCst);
	}

	pub fn is_lost(&self) -> bool {
		self.state.lost.load(Ordering::SeqCst)
	}

	pub fn live_buffers(&self) -> usize {
		self.state.live.load(Ordering::SeqCst)
	}

	pub fn allocated_bytes(&self) -> u64 {
		self.state.allocated.load(Ordering::SeqCst)
	}

	pub fn submissions(&self) -> usize {
		self.state.submissions.load(Ordering::SeqCst)
	}

	fn check_alive(&self, operation: &str) -> Result<(), DeviceError> {
		if self.is_lost() {
			return Err(DeviceError::Lost(format!("{} on a lost device", operation)));
		}
		Ok(())
	}
}

// =================================================================================================
// RECORDED COMMANDS
// =================================================================================================

struct RecordedPass {
	label: String,
	pipeline: HostPipeline,
	bindings: Vec<HostBuffer>,
	dispatches: Vec<PassDispatch>,
}

enum Command {
	Copy {
		source: HostBuffer,
		source_offset: u64,
		destination: HostBuffer,
		destination_offset: u64,
		size: u64,
	},
	Pass(RecordedPass),
}

pub struct HostStream {
	label: String,
	commands: Vec<Command>,
}

impl HostStream {
	pub fn len(&self) -> usize {
		self.commands.len()
	}

	pub fn is_empty(&self) -> bool {
		self.commands.is_empty()
	}

	/// Number of recorded compute passes.
	pub fn passes(&self) -> usize {
		self.commands.iter().filter(|c| matches!(c, Command::Pass(_))).count()
	}

	/// Total dispatches across every recorded pass.
	pub fn dispatches(&self) -> usize {
		self.commands
			.iter()
			.map(|c| match c {
				Command::Pass(pass) => pass.dispatches.len(),
				Command::Copy { .. } => 0,
			})
			.sum()
	}
}

fn mismatch(pass: &str, reason: impl Into<String>) -> DeviceError {
	DeviceError::BindingMismatch { pass: pass.to_string(), reason: reason.into() }
}

impl HostDevice {
	fn validate_pass(&self, pass: &ComputePass<'_, Self>) -> Result<(), DeviceError> {
		let limits = self.state.limits;
		let expected = pass.pipeline.spec.kind.bindings();

		// ---------- layout -------------------------------------------------------
		if pass.bindings.len() != expected.len() {
			return Err(mismatch(
				pass.label,
				format!("{} bindings for a layout of {}", pass.bindings.len(), expected.len()),
			));
		}
		for (slot, (binding, access)) in pass.bindings.iter().zip(&expected).enumerate() {
			binding.buffer.check_live()?;
			if binding.binding != slot as u32 || binding.access != *access {
				return Err(mismatch(
					pass.label,
					format!(
						"binding {} is {:?}, layout wants {:?} at {}",
						binding.binding, binding.access, access, slot
					),
				));
			}
			let role = if *access == BindingAccess::Params { BufferRole::Params } else { BufferRole::Storage };
			if binding.buffer.role() != role {
				return Err(mismatch(
					pass.label,
					format!(
						"buffer `{}` bound at {} lacks {:?} usage",
						binding.buffer.label(),
						slot,
						role
					),
				));
			}
		}

		// read-only and writable views of one buffer in one pass conflict
		for writable in pass.bindings.iter().filter(|b| b.access == BindingAccess::ReadWrite) {
			let conflict = pass.bindings.iter().any(|other| {
				other.access != BindingAccess::ReadWrite && other.buffer.id() == writable.buffer.id()
			});
			if conflict {
				return Err(mismatch(
					pass.label,
					format!("buffer `{}` bound both read-only and writable", writable.buffer.label()),
				));
			}
		}

		// ---------- dispatches ---------------------------------------------------
		let params = pass.bindings[0].buffer;
		for dispatch in &pass.dispatches {
			if dispatch.workgroups > limits.max_dispatches_per_dimension {
				return Err(DeviceError::DispatchLimit {
					requested: dispatch.workgroups,
					limit: limits.max_dispatches_per_dimension,
				});
			}
			if dispatch.param_offset % limits.min_uniform_buffer_offset_alignment != 0 {
				return Err(DeviceError::MisalignedOffset {
					offset: dispatch.param_offset,
					alignment: limits.min_uniform_buffer_offset_alignment,
				});
			}
			params.check_range(dispatch.param_offset, PASS_PARAMS_SIZE)?;
		}
		Ok(())
	}

	fn execute_pass(&self, pass: &RecordedPass) -> Result<(), DeviceError> {
		let spec = &pass.pipeline.spec;
		for dispatch in &pass.dispatches {
			let params_buffer = &pass.bindings[0];
			let block = params_buffer.read(dispatch.param_offset, PASS_PARAMS_SIZE)?;
			let params = PassParams::read(&block, 0)?;

			// ---------- snapshot --------------------------------------------------
			let labels: Vec<String> = pass.bindings.iter().map(|b| b.label().to_string()).collect();
			let mut words = vec![Vec::new()];
			for buffer in &pass.bindings[1..] {
				words.push(buffer.words()?);
			}
			let bindings = Bindings { labels: &labels, words: &words };

			// ---------- workgroups -----------------------------------------------
			let writes: Vec<Vec<ElementWrite>> = (0..dispatch.workgroups)
				.into_par_iter()
				.map(|local| {
					kernels::run_workgroup(spec, &params, params.workgroup_offset + local, &bindings)
				})
				.collect::<Result<_, _>>()?;

			// ---------- apply writes ---------------------------------------------
			let lanes = spec.operator.lanes as u64;
			for write in writes.into_iter().flatten() {
				pass.bindings[write.binding].write_words(write.element * lanes, &write.bits)?;
			}
			log::trace!(
				"{}: executed {} workgroups of {}",
				pass.label,
				dispatch.workgroups,
				spec.label()
			);
		}
		Ok(())
	}
}

// =================================================================================================
// DEVICE INTERFACE
// =================================================================================================

impl ComputeDevice for HostDevice {
	type Buffer = HostBuffer;
	type Pipeline = HostPipeline;
	type Stream = HostStream;

	fn limits(&self) -> DeviceLimits {
		self.state.limits
	}

	fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<HostBuffer, DeviceError> {
		self.check_alive("allocation")?;
		if let Some(budget) = self.state.memory_budget {
			let allocated = self.state.allocated.load(Ordering::SeqCst);
			if allocated + desc.size > budget {
				return Err(DeviceError::OutOfMemory {
					requested: desc.size,
					available: budget.saturating_sub(allocated),
				});
			}
		}
		let id = BufferId(self.state.next_id.fetch_add(1, Ordering::SeqCst));
		self.state.allocated.fetch_add(desc.size, Ordering::SeqCst);
		self.state.live.fetch_add(1, Ordering::SeqCst);
		log::trace!("create buffer {} ({} bytes)", desc.label, desc.size);
		Ok(HostBuffer::new(id, desc.label, desc.size, desc.role))
	}

	fn destroy_buffer(&self, buffer: &HostBuffer) {
		if buffer.destroy() {
			self.state.allocated.fetch_sub(buffer.size(), Ordering::SeqCst);
			self.state.live.fetch_sub(1, Ordering::SeqCst);
		}
	}

	fn write_buffer(&self, buffer: &HostBuffer, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
		self.check_alive("buffer write")?;
		buffer.write(offset, data)
	}

	fn create_stream(&self, label: &str) -> HostStream {
		HostStream { label: label.to_string(), commands: Vec::new() }
	}

	fn record_copy(
		&self,
		stream: &mut HostStream,
		source: &HostBuffer,
		source_offset: u64,
		destination: &HostBuffer,
		destination_offset: u64,
		size: u64,
	) -> Result<(), DeviceError> {
		source.check_live()?;
		destination.check_live()?;
		for offset in [source_offset, destination_offset, size] {
			if offset % 4 != 0 {
				return Err(DeviceError::MisalignedOffset { offset, alignment: 4 });
			}
		}
		source.check_range(source_offset, size)?;
		destination.check_range(destination_offset, size)?;
		stream.commands.push(Command::Copy {
			source: source.clone(),
			source_offset,
			destination: destination.clone(),
			destination_offset,
			size,
		});
		Ok(())
	}

	fn record_pass(&self, stream: &mut HostStream, pass: &ComputePass<'_, Self>) -> Result<(), DeviceError> {
		self.validate_pass(pass)?;
		log::trace!(
			"{}: recorded {} ({} dispatches)",
			stream.label,
			pass.label,
			pass.dispatches.len()
		);
		stream.commands.push(Command::Pass(RecordedPass {
			label: pass.label.to_string(),
			pipeline: pass.pipeline.clone(),
			bindings: pass.bindings.iter().map(|b| b.buffer.clone()).collect(),
			dispatches: pass.dispatches.clone(),
		}));
		Ok(())
	}

	fn submit(&self, stream: HostStream) -> Result<(), DeviceError> {
		self.check_alive("submission")?;
		self.state.submissions.fetch_add(1, Ordering::SeqCst);
		log::debug!("{}: executing {} commands", stream.label, stream.commands.len());
		for command in &stream.commands {
			match command {
				Command::Copy { source, source_offset, destination, destination_offset, size } => {
					let bytes = source.read(*source_offset, *size)?;
					destination.write(*destination_offset, &bytes)?;
				}
				Command::Pass(pass) => self.execute_pass(pass)?,
			}
		}
		Ok(())
	}

	fn read_buffer(&self, buffer: &HostBuffer, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
		self.check_alive("readback")?;
		buffer.read(offset, size)
	}
}
