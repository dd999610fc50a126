// =================================================================================================
// HOST KERNELS
// =================================================================================================
// One workgroup of each kernel kind, evaluated on the host with the same access pattern and
// combine order as the generated WGSL: Hillis-Steele for scans, a stride-doubling tree for
// reductions. Reads come from per-pass snapshots; writes are returned and applied afterwards.

use crate::error::DeviceError;
use crate::kernel::{KernelKind, KernelSpec};
use crate::operator::Operator;
use crate::params::PassParams;

/// One element written by a workgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementWrite {
	pub binding: usize,
	/// Element index, in operator elements.
	pub element: u64,
	pub bits: Vec<u32>,
}

/// Snapshot of the storage bindings of one pass, indexed by binding slot.
pub struct Bindings<'a> {
	pub labels: &'a [String],
	pub words: &'a [Vec<u32>],
}

impl Bindings<'_> {
	fn element(&self, binding: usize, index: u64, lanes: u32) -> Result<Vec<u32>, DeviceError> {
		let lanes = lanes as u64;
		let words = &self.words[binding];
		let start = index * lanes;
		match words.get(start as usize..(start + lanes) as usize) {
			Some(element) => Ok(element.to_vec()),
			None => Err(DeviceError::OutOfBounds {
				label: self.labels[binding].clone(),
				offset: start * 4,
				size: lanes * 4,
				buffer_size: words.len() as u64 * 4,
			}),
		}
	}
}

fn load(
	operator: &Operator,
	bindings: &Bindings<'_>,
	binding: usize,
	index: u64,
	load_source: bool,
) -> Result<Vec<u32>, DeviceError> {
	if load_source {
		let input = bindings.element(binding, index, operator.input_lanes)?;
		Ok(operator.load_bits(&input))
	} else {
		bindings.element(binding, index, operator.lanes)
	}
}

pub fn run_workgroup(
	spec: &KernelSpec,
	params: &PassParams,
	group: u32,
	bindings: &Bindings<'_>,
) -> Result<Vec<ElementWrite>, DeviceError> {
	match spec.kind {
		KernelKind::WorkgroupScan { emit_block_sums, load_source } => {
			scan_workgroup(spec, params, group, bindings, emit_block_sums, load_source)
		}
		KernelKind::ApplyBlockSums => apply_workgroup(spec, params, group, bindings),
		KernelKind::Reduce { load_source } => {
			reduce_workgroup(spec, params, group, bindings, load_source)
		}
	}
}

fn scan_workgroup(
	spec: &KernelSpec,
	params: &PassParams,
	group: u32,
	bindings: &Bindings<'_>,
	emit_block_sums: bool,
	load_source: bool,
) -> Result<Vec<ElementWrite>, DeviceError> {
	let op = &spec.operator;
	let wl = spec.workgroup_length as u64;
	let count = params.element_count as u64;
	let base = group as u64 * wl;

	// ---------- load ---------------------------------------------------------
	let mut work = Vec::with_capacity(wl as usize);
	for lid in 0..wl {
		let gi = base + lid;
		if gi < count {
			work.push(load(op, bindings, 1, params.source_offset as u64 + gi, load_source)?);
		} else {
			work.push(op.identity.clone());
		}
	}

	// ---------- inclusive in-block scan --------------------------------------
	let mut offset = 1;
	while offset < wl as usize {
		let previous = work.clone();
		for lid in offset..work.len() {
			work[lid] = op.combine_bits(&previous[lid - offset], &previous[lid]);
		}
		offset *= 2;
	}

	// ---------- write --------------------------------------------------------
	let initial = vec![params.initial_value; op.lanes as usize];
	let mut writes = Vec::new();
	for lid in 0..wl {
		let gi = base + lid;
		if gi >= count {
			break;
		}
		let bits = if params.exclusive != 0 {
			if lid == 0 {
				initial.clone()
			} else {
				op.combine_bits(&initial, &work[lid as usize - 1])
			}
		} else {
			work[lid as usize].clone()
		};
		writes.push(ElementWrite { binding: 2, element: params.destination_offset as u64 + gi, bits });
	}
	if emit_block_sums {
		writes.push(ElementWrite {
			binding: 3,
			element: params.block_sums_offset as u64 + group as u64,
			bits: work[wl as usize - 1].clone(),
		});
	}
	Ok(writes)
}

fn apply_workgroup(
	spec: &KernelSpec,
	params: &PassParams,
	group: u32,
	bindings: &Bindings<'_>,
) -> Result<Vec<ElementWrite>, DeviceError> {
	let op = &spec.operator;
	let wl = spec.workgroup_length as u64;
	let count = params.element_count as u64;

	let inclusive_at = |j: u64| -> Result<Vec<u32>, DeviceError> {
		let partial = bindings.element(1, params.source_offset as u64 + j, op.lanes)?;
		let block = j / wl;
		if block == 0 {
			return Ok(partial);
		}
		let prefix = bindings.element(2, params.block_sums_offset as u64 + block - 1, op.lanes)?;
		Ok(op.combine_bits(&prefix, &partial))
	};

	let initial = vec![params.initial_value; op.lanes as usize];
	let mut writes = Vec::new();
	for lid in 0..wl {
		let i = group as u64 * wl + lid;
		if i >= count {
			break;
		}
		let bits = if params.exclusive != 0 {
			if i == 0 {
				initial.clone()
			} else {
				op.combine_bits(&initial, &inclusive_at(i - 1)?)
			}
		} else {
			inclusive_at(i)?
		};
		writes.push(ElementWrite { binding: 3, element: params.destination_offset as u64 + i, bits });
	}
	Ok(writes)
}

fn reduce_workgroup(
	spec: &KernelSpec,
	params: &PassParams,
	group: u32,
	bindings: &Bindings<'_>,
	load_source: bool,
) -> Result<Vec<ElementWrite>, DeviceError> {
	let op = &spec.operator;
	let wl = spec.workgroup_length as u64;
	let bl = spec.block_length as u64;
	let count = params.element_count as u64;
	let base = group as u64 * wl * bl;

	// ---------- per-thread block -----------------------------------------------
	let mut work = Vec::with_capacity(wl as usize);
	for lid in 0..wl {
		let mut acc = op.identity.clone();
		for k in 0..bl {
			let i = base + lid * bl + k;
			if i < count {
				let element = load(op, bindings, 1, params.source_offset as u64 + i, load_source)?;
				acc = op.combine_bits(&acc, &element);
			}
		}
		work.push(acc);
	}

	// ---------- workgroup tree -------------------------------------------------
	let mut stride = 1;
	while stride < work.len() {
		for lid in (0..work.len()).step_by(2 * stride) {
			if lid + stride < work.len() {
				work[lid] = op.combine_bits(&work[lid], &work[lid + stride]);
			}
		}
		stride *= 2;
	}

	Ok(vec![ElementWrite {
		binding: 2,
		element: params.destination_offset as u64 + group as u64,
		bits: work.swap_remove(0),
	}])
}
